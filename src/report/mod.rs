//! Shareable text summary of a finished site visit.

use color_eyre::{eyre::eyre, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::session::{FinalizedSession, SessionContext};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryReport {
    title: String,
    file_stem: String,
    text: String,
}

impl SummaryReport {
    /// Renders the readings in the order they were taken, numbered from 1.
    pub fn from_session(session: &FinalizedSession) -> Self {
        let context = &session.context;
        let mut text = String::new();
        // writing into a String cannot fail
        let _ = writeln!(text, "MEASUREMENT REPORT");
        let _ = writeln!(text);
        let _ = writeln!(text, "Client: {}", context.client_name());
        let _ = writeln!(text, "Address: {}", context.address());
        let _ = writeln!(text, "Date: {}", context.visit_date());
        let _ = writeln!(text);
        let _ = writeln!(text, "MEASUREMENTS:");
        for (number, entry) in session.oldest_first().enumerate() {
            let _ = writeln!(text, "{}. {}", number + 1, entry);
        }

        Self {
            title: format!("Measurements - {}", context.client_name()),
            file_stem: file_stem(context),
            text,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Writes the report into `dir`, creating it if needed.
    pub async fn share(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| eyre!("Failed to create report directory {}: {}", dir.display(), e))?;

        let mut path = dir.to_path_buf();
        path.push(format!("{}.txt", self.file_stem));
        tokio::fs::write(&path, &self.text)
            .await
            .map_err(|e| eyre!("Failed to write report {}: {}", path.display(), e))?;

        info!("Report '{}' written to {}", self.title, path.display());
        Ok(path)
    }
}

fn file_stem(context: &SessionContext) -> String {
    let raw = format!("{}-{}", context.client_name(), context.visit_date());
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
