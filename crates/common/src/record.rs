use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Environment;

/// Tag and description timestamp format (UTC, second precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Render a timestamp the way it appears in tags and descriptions
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Append-only audit entry written after a successful rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub timestamp: DateTime<Utc>,
    pub environment: Environment,
    pub reason: String,
    pub from_image_id: String,
    pub to_image_id: String,
    pub initiated_by: String,
}

/// Authoritative pointer to the live image of an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionPointer {
    pub environment: Environment,

    pub image_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_image_id: Option<String>,

    pub updated_at: DateTime<Utc>,

    pub updated_by: String,
}

/// Longest promotion lease either backend grants, one day
pub const MAX_LEASE_TTL_SECS: u64 = 86_400;

/// Result of a lease acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LeaseGrant {
    Acquired,
    Held { holder: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_timestamp(ts), "2024-03-09T07:05:01Z");
    }

    #[test]
    fn test_lease_grant_wire_format() {
        let held = LeaseGrant::Held {
            holder: "abc".to_string(),
        };
        let json = serde_json::to_value(&held).unwrap();
        assert_eq!(json["result"], "held");
        assert_eq!(json["holder"], "abc");

        let acquired: LeaseGrant = serde_json::from_str(r#"{"result":"acquired"}"#).unwrap();
        assert_eq!(acquired, LeaseGrant::Acquired);
    }
}
