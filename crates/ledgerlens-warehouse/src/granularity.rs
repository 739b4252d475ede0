use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WarehouseError;

/// Time bucket used to roll daily activity up into periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Self; 3] = [Self::Day, Self::Week, Self::Month];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// SQL expression for the start of the period containing `date_expr`.
    /// Weeks start on Monday.
    pub(crate) fn period_start(self, date_expr: &str) -> String {
        match self {
            Self::Day => format!("CAST({date_expr} AS DATE)"),
            Self::Week => format!("CAST(date_trunc('week', {date_expr}) AS DATE)"),
            Self::Month => format!("CAST(date_trunc('month', {date_expr}) AS DATE)"),
        }
    }

    /// SQL expression for the start of the period following `period_expr`.
    pub(crate) fn next_period(self, period_expr: &str) -> String {
        match self {
            Self::Day => format!("CAST({period_expr} + 1 AS DATE)"),
            Self::Week => format!("CAST({period_expr} + 7 AS DATE)"),
            Self::Month => format!("CAST({period_expr} + INTERVAL 1 MONTH AS DATE)"),
        }
    }

    /// SQL expression counting whole periods from `from_expr` to `to_expr`.
    /// Both arguments must already be period starts.
    pub(crate) fn periods_between(self, from_expr: &str, to_expr: &str) -> String {
        match self {
            Self::Day => format!("date_diff('day', {from_expr}, {to_expr})"),
            Self::Week => format!("CAST(date_diff('day', {from_expr}, {to_expr}) / 7 AS BIGINT)"),
            Self::Month => format!("date_diff('month', {from_expr}, {to_expr})"),
        }
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" | "d" => Ok(Self::Day),
            "week" | "weekly" | "w" => Ok(Self::Week),
            "month" | "monthly" | "m" => Ok(Self::Month),
            other => Err(WarehouseError::InvalidGranularity(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_granularity_aliases() {
        assert_eq!(Granularity::from_str("Monthly").expect("parse"), Granularity::Month);
        assert_eq!(Granularity::from_str("w").expect("parse"), Granularity::Week);
    }

    #[test]
    fn rejects_unknown_granularity() {
        let err = Granularity::from_str("quarter").expect_err("must fail");
        assert!(matches!(err, WarehouseError::InvalidGranularity(_)));
    }
}
