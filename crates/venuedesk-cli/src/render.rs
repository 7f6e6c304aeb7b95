//! Plain-text table output for entity rows.

use serde::{de::DeserializeOwned, Serialize};

use venuedesk_core::models::{format_amount, Contract, Expense, Goal, Owner, Permission, Venue};
use venuedesk_core::ErrorRecord;

/// Columns wider than this are cut with an ellipsis.
const MAX_COLUMN_WIDTH: usize = 32;

const COLUMN_GAP: &str = "  ";

/// An entity that can be shown as one table row.
pub trait TableRow: Serialize + DeserializeOwned + Send + 'static {
    const HEADERS: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

impl TableRow for Venue {
    const HEADERS: &'static [&'static str] = &["ID", "NAME", "LOCATION", "CAPACITY"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.location(),
            self.capacity.map(|c| c.to_string()).unwrap_or_default(),
        ]
    }
}

impl TableRow for Contract {
    const HEADERS: &'static [&'static str] = &["ID", "TITLE", "PERIOD", "AMOUNT", "STATUS"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.title.clone(),
            self.period_display(),
            self.amount.map(format_amount).unwrap_or_default(),
            self.status.clone().unwrap_or_default(),
        ]
    }
}

impl TableRow for Goal {
    const HEADERS: &'static [&'static str] = &["ID", "DESCRIPTION", "TARGET", "YEAR"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.description.clone(),
            self.target_display(),
            self.year.map(|y| y.to_string()).unwrap_or_default(),
        ]
    }
}

impl TableRow for Expense {
    const HEADERS: &'static [&'static str] = &["ID", "DESCRIPTION", "AMOUNT", "DATE", "CATEGORY"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.description.clone(),
            self.amount_display(),
            self.incurred_on.clone().unwrap_or_default(),
            self.category.clone().unwrap_or_default(),
        ]
    }
}

impl TableRow for Owner {
    const HEADERS: &'static [&'static str] = &["ID", "NAME", "EMAIL"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.full_name(),
            self.email.clone().unwrap_or_default(),
        ]
    }
}

impl TableRow for Permission {
    const HEADERS: &'static [&'static str] = &["ID", "OWNER", "VENUE", "ROLE"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.owner_id.clone(),
            self.venue_id
                .clone()
                .unwrap_or_else(|| "(all venues)".to_string()),
            self.role.clone(),
        ]
    }
}

/// Truncate a string to a maximum number of characters, adding an ellipsis
/// if needed.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

pub fn table<T: TableRow>(rows: &[T]) -> String {
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.cells()
                .iter()
                .map(|cell| truncate(cell, MAX_COLUMN_WIDTH))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = T::HEADERS.iter().map(|h| h.len()).collect();
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = T::HEADERS.iter().map(|h| h.to_string()).collect();
    std::iter::once(&header)
        .chain(&body)
        .map(|row| format_line(row, &widths))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_line(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join(COLUMN_GAP)
        .trim_end()
        .to_string()
}

pub fn error(record: &ErrorRecord) -> String {
    let mut out = format!("{}: {}", record.title, record.message);
    if let Some(status) = record.http_status {
        out.push_str(&format!(" (HTTP {})", status));
    }
    if record.requires_reauth() {
        out.push_str("\nYour session has expired. Set VENUEDESK_TOKEN to a fresh token and retry.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use venuedesk_core::ErrorKind;

    fn venue(id: &str, name: &str) -> Venue {
        Venue {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            name: name.to_string(),
            address: None,
            city: Some("Springfield".to_string()),
            capacity: Some(120),
            owner_id: None,
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Hello", 10), "Hello");
        assert_eq!(truncate("Hello World", 8), "Hello...");
        assert_eq!(truncate("Hi", 2), "Hi");
        assert_eq!(truncate("Grüße aus Köln", 8), "Grüße...");
    }

    #[test]
    fn test_table_aligns_columns() {
        let out = table(&[venue("v1", "Main Hall"), venue("v22", "Annex")]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "ID   NAME       LOCATION     CAPACITY");
        assert_eq!(lines[1], "v1   Main Hall  Springfield  120");
        assert_eq!(lines[2], "v22  Annex      Springfield  120");
    }

    #[test]
    fn test_empty_table_has_header_only() {
        assert_eq!(table::<Owner>(&[]), "ID  NAME  EMAIL");
    }

    #[test]
    fn test_error_with_reauth_hint() {
        let mut record = ErrorRecord::new(ErrorKind::TokenError, "jwt expired");
        record.http_status = Some(401);
        let out = error(&record);
        assert!(out.starts_with("Session expired: jwt expired (HTTP 401)"));
        assert!(out.contains("VENUEDESK_TOKEN"));

        let plain = error(&ErrorRecord::new(ErrorKind::NotFoundError, "no such venue"));
        assert_eq!(plain, "Not found: no such venue");
    }
}
