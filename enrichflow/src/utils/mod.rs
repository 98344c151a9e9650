//! Id and clock helpers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generates a time-ordered id for runs and stage runs.
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns the current UTC time.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_v7_and_ordered() {
        let first = generate_id();
        let second = generate_id();

        let parsed = Uuid::parse_str(&first).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
        assert_ne!(first, second);
    }
}
