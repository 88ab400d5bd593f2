use chrono::{DateTime, SecondsFormat, Utc};

/// Source of store-assigned timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant. Used to produce timestamp ties.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text (microsecond precision,
/// `Z` suffix) so that lexical order in SQLite equals chronological order.
pub fn to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn stored_form_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::days(400);
        let mut raw = vec![to_sql(c), to_sql(b), to_sql(a)];
        raw.sort();
        assert_eq!(raw, vec![to_sql(a), to_sql(b), to_sql(c)]);
        assert_eq!(from_sql(&to_sql(b)).unwrap(), b);
    }
}
