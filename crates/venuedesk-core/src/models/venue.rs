//! Venue and contract models.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Venue {
    pub id: String,
    #[serde(rename = "organizationId")]
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(rename = "ownerId", default)]
    pub owner_id: Option<String>,
}

impl Venue {
    /// Single-line location, e.g. "12 Main St, Springfield".
    pub fn location(&self) -> String {
        let parts: Vec<&str> = [self.address.as_deref(), self.city.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            "No address".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Contract {
    pub id: String,
    #[serde(rename = "venueId")]
    pub venue_id: String,
    pub title: String,
    #[serde(rename = "startDate", default)]
    pub start_date: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Contract {
    pub fn period_display(&self) -> String {
        match (&self.start_date, &self.end_date) {
            (Some(start), Some(end)) => format!("{} - {}", start, end),
            (Some(start), None) => format!("from {}", start),
            (None, Some(end)) => format!("until {}", end),
            (None, None) => "Open-ended".to_string(),
        }
    }
}
