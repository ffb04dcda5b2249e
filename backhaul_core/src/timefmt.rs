//! The wire time format: ISO-8601 UTC at second precision.
//!
//! Completed-job records store their start time in this form so that a
//! lexical range query over the record store is also a chronological one.

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::store::Result;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a time as `YYYY-MM-DDTHH:MM:SSZ`, discarding sub-second
/// precision. Non-UTC inputs are converted first.
pub fn format_utc(t: DateTime<Utc>) -> String {
    t.format(FORMAT).to_string()
}

/// Parse a wire timestamp. Exactly the shape produced by [`format_utc`]
/// is accepted.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, FORMAT)
        .with_context(|| format!("invalid timestamp {s:?}"))?;
    Ok(naive.and_utc())
}
