//! Rollback audit records, one JSON file per rollback in a flat directory.

use chrono::{DateTime, Utc};
use promotion_common::{Environment, Error, Result, RollbackRecord};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FILE_PREFIX: &str = "rollback-";

/// Append-only store of rollback records
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `rollback-<environment>-<YYYYmmdd-HHMMSS>.json`
    pub fn file_name(environment: Environment, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}{}-{}.json",
            FILE_PREFIX,
            environment,
            timestamp.format("%Y%m%d-%H%M%S")
        )
    }

    /// Write a record. Records are never overwritten: two rollbacks of the
    /// same environment within one second collide.
    pub fn append(&self, record: &RollbackRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self
            .dir
            .join(Self::file_name(record.environment, record.timestamp));
        let json = serde_json::to_string_pretty(record)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AuditCollision(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;

        info!("Rollback record saved to {}", path.display());
        Ok(path)
    }

    /// Records for an environment, oldest first. A missing directory holds
    /// no records.
    pub fn list(&self, environment: Environment) -> Result<Vec<RollbackRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}{}-", FILE_PREFIX, environment);
        let mut records = Vec::new();

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }

            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<RollbackRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable rollback record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(environment: Environment, secs: u32) -> RollbackRecord {
        RollbackRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap(),
            environment,
            reason: "error rate spike".to_string(),
            from_image_id: "ami-new".to_string(),
            to_image_id: "ami-old".to_string(),
            initiated_by: "ops".to_string(),
        }
    }

    #[test]
    fn test_file_name() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 9, 3, 7).unwrap();
        assert_eq!(
            AuditLog::file_name(Environment::Production, ts),
            "rollback-production-20240501-090307.json"
        );
    }

    #[test]
    fn test_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("records"));

        log.append(&record(Environment::Staging, 5)).unwrap();
        log.append(&record(Environment::Staging, 1)).unwrap();
        log.append(&record(Environment::Dev, 2)).unwrap();

        let staging = log.list(Environment::Staging).unwrap();
        assert_eq!(staging.len(), 2);
        assert!(staging[0].timestamp < staging[1].timestamp);
        assert_eq!(log.list(Environment::Dev).unwrap().len(), 1);
        assert!(log.list(Environment::Production).unwrap().is_empty());
    }

    #[test]
    fn test_same_second_collides() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        let first = log.append(&record(Environment::Staging, 9)).unwrap();
        let err = log.append(&record(Environment::Staging, 9)).unwrap_err();
        assert!(matches!(err, Error::AuditCollision(_)));

        // The first record is untouched
        let stored: RollbackRecord =
            serde_json::from_str(&fs::read_to_string(first).unwrap()).unwrap();
        assert_eq!(stored, record(Environment::Staging, 9));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("never-created"));
        assert!(log.list(Environment::Dev).unwrap().is_empty());
    }
}
