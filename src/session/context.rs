use chrono::{Local, NaiveDate};

use super::error::SessionError;

pub const VISIT_DATE_FORMAT: &str = "%d/%m/%Y";

/// Who and where the readings are for. Fixed once the session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    client_name: String,
    address: String,
    visit_date: String,
}

impl SessionContext {
    /// Validates the entry form. A missing date means today.
    pub fn from_form(
        client_name: &str,
        address: &str,
        visit_date: Option<&str>,
    ) -> Result<Self, SessionError> {
        let client_name = client_name.trim();
        let address = address.trim();
        if client_name.is_empty() {
            return Err(SessionError::InvalidContext("client name"));
        }
        if address.is_empty() {
            return Err(SessionError::InvalidContext("address"));
        }
        let visit_date = match visit_date.map(str::trim).filter(|d| !d.is_empty()) {
            Some(date) => {
                let parsed = NaiveDate::parse_from_str(date, VISIT_DATE_FORMAT)
                    .map_err(|_| SessionError::InvalidContext("visit date"))?;
                format_visit_date(parsed)
            }
            None => format_visit_date(Local::now().date_naive()),
        };
        Ok(Self {
            client_name: client_name.to_string(),
            address: address.to_string(),
            visit_date,
        })
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn visit_date(&self) -> &str {
        &self.visit_date
    }
}

pub fn format_visit_date(date: NaiveDate) -> String {
    date.format(VISIT_DATE_FORMAT).to_string()
}
