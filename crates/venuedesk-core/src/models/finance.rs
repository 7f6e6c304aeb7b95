//! Goal and expense models.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Goal {
    pub id: String,
    #[serde(rename = "venueId")]
    pub venue_id: String,
    pub description: String,
    #[serde(rename = "targetAmount", default)]
    pub target_amount: Option<f64>,
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Expense {
    pub id: String,
    #[serde(rename = "venueId")]
    pub venue_id: String,
    pub description: String,
    pub amount: f64,
    #[serde(rename = "incurredOn", default)]
    pub incurred_on: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Format an amount with two decimals and thousands separators.
pub fn format_amount(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}.{:02}", sign, grouped, cents % 100)
}

impl Goal {
    pub fn target_display(&self) -> String {
        self.target_amount
            .map(format_amount)
            .unwrap_or_else(|| "No target".to_string())
    }
}

impl Expense {
    pub fn amount_display(&self) -> String {
        format_amount(self.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(0.0), "0.00");
        assert_eq!(format_amount(12.5), "12.50");
        assert_eq!(format_amount(1234567.891), "1,234,567.89");
        assert_eq!(format_amount(-1000.0), "-1,000.00");
        assert_eq!(format_amount(f64::NEG_INFINITY), "-92,233,720,368,547,758.08");
        assert_eq!(format_amount(-1e300), "-92,233,720,368,547,758.08");
    }

    #[test]
    fn test_goal_target_display() {
        let goal = Goal {
            id: "g1".to_string(),
            venue_id: "v1".to_string(),
            description: "Bookings".to_string(),
            target_amount: None,
            year: Some(2026),
        };
        assert_eq!(goal.target_display(), "No target");
    }
}
