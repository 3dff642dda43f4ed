#![forbid(unsafe_code)]

use super::error::{LifecycleError, Result};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

const SAVEPOINT_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]");

/// Issues savepoint timestamps that never repeat or go backwards on one handle.
#[derive(Debug, Default)]
pub(crate) struct SavepointClock {
    last: Option<OffsetDateTime>,
}

impl SavepointClock {
    /// Next timestamp, strictly after everything this clock issued and after `floor` when it
    /// parses as a savepoint timestamp.
    pub(crate) fn next_after(&mut self, floor: Option<&str>) -> String {
        let mut next = OffsetDateTime::now_utc();
        if let Some(last) = self.last {
            next = next.max(last + Duration::nanoseconds(1));
        }
        if let Some(floor) = floor.and_then(parse_savepoint_timestamp) {
            next = next.max(floor + Duration::nanoseconds(1));
        }
        self.last = Some(next);
        format_savepoint_timestamp(next)
    }

    pub(crate) fn next(&mut self) -> String {
        self.next_after(None)
    }

    /// Keeps a supplied timestamp if it parses; a blank or absent one gets a fresh stamp.
    pub(crate) fn supplied_or_next(&mut self, supplied: Option<&str>) -> Result<String> {
        match supplied.map(str::trim) {
            None | Some("") => Ok(self.next()),
            Some(raw) => {
                check_supplied_timestamp(raw)?;
                Ok(raw.to_string())
            }
        }
    }
}

/// Blank means "stamp it for me"; anything else must parse.
pub(crate) fn check_supplied_timestamp(raw: &str) -> Result<()> {
    let raw = raw.trim();
    if raw.is_empty() || parse_savepoint_timestamp(raw).is_some() {
        return Ok(());
    }
    Err(LifecycleError::InvalidInput(format!(
        "savepoint timestamp `{raw}` is not of the form YYYY-MM-DDTHH:MM:SS.nnnnnnnnn"
    )))
}

pub(crate) fn parse_savepoint_timestamp(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(raw, SAVEPOINT_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn format_savepoint_timestamp(value: OffsetDateTime) -> String {
    match value.format(SAVEPOINT_FORMAT) {
        Ok(formatted) => formatted,
        // Years outside 0..=9999 cannot occur for wall-clock time.
        Err(_) => value.unix_timestamp_nanos().to_string(),
    }
}
