use std::collections::VecDeque;
use std::fmt;

use super::error::SessionError;
use super::measurement::MeasurementValue;

/// A labeled, committed measurement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReadingEntry {
    pub label: String,
    pub value: MeasurementValue,
}

impl ReadingEntry {
    pub fn new(label: impl Into<String>, value: MeasurementValue) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

impl fmt::Display for ReadingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.value.with_unit())
    }
}

/// Newest-first list of readings. Index 0 is the latest commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadingLog {
    entries: VecDeque<ReadingEntry>,
}

impl ReadingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_front(&mut self, entry: ReadingEntry) {
        self.entries.push_front(entry);
    }

    pub fn remove_at(&mut self, index: usize) -> Result<ReadingEntry, SessionError> {
        let len = self.entries.len();
        self.entries
            .remove(index)
            .ok_or(SessionError::IndexOutOfRange { index, len })
    }

    /// Takes the entry out so it can be corrected and committed again.
    pub fn edit_at(&mut self, index: usize) -> Result<ReadingEntry, SessionError> {
        self.remove_at(index)
    }

    pub fn get(&self, index: usize) -> Option<&ReadingEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ReadingEntry> {
        self.entries.iter().cloned().collect()
    }
}
