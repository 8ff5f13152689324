use chrono::{DateTime, TimeZone, Utc};

use crate::{Database, Row, StorageError};

/// Which append-only log a [`LogPartition`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Raw push payloads as received
    Messages,
    /// Classified errors
    Diagnostics,
}

impl LogKind {
    fn table(self) -> &'static str {
        match self {
            Self::Messages => "message_log",
            Self::Diagnostics => "diagnostic_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

impl LogEntry {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let millis = row.integer(1)?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| StorageError::QueryFailed(format!("invalid log timestamp {millis}")))?;
        let payload = row
            .optional_text(4)?
            .map(|text| serde_json::from_str(&text))
            .transpose()?;

        Ok(Self {
            id: row.integer(0)?,
            timestamp,
            kind: row.text(2)?,
            message: row.text(3)?,
            payload,
        })
    }
}

const COLUMNS: &str = "id, timestamp, kind, message, payload";

pub struct LogPartition<'a, D: Database> {
    db: &'a D,
    kind: LogKind,
}

impl<'a, D: Database> LogPartition<'a, D> {
    pub(crate) fn new(db: &'a D, kind: LogKind) -> Self {
        Self { db, kind }
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Append an entry stamped with the current time and return its id.
    pub async fn append(
        &self,
        kind: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64, StorageError> {
        self.append_at(Utc::now(), kind, message, payload).await
    }

    pub async fn append_at(
        &self,
        timestamp: DateTime<Utc>,
        kind: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64, StorageError> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        let millis = timestamp.timestamp_millis();
        let table = self.kind.table();

        self.db
            .insert(
                &format!(
                    "INSERT INTO {table} (timestamp, kind, message, payload) VALUES (?1, ?2, ?3, ?4)"
                ),
                &[&millis, &kind, &message, &payload],
            )
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<LogEntry>, StorageError> {
        let rows: Vec<Row> = self
            .db
            .query(
                &format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", self.kind.table()),
                &[&id],
            )
            .await?;
        rows.first().map(LogEntry::from_row).transpose()
    }

    /// Entries at or after `since`, oldest first.
    pub async fn get_all(&self, since: Option<DateTime<Utc>>) -> Result<Vec<LogEntry>, StorageError> {
        let since = since.map_or(i64::MIN, |since| since.timestamp_millis());
        let rows: Vec<Row> = self
            .db
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM {} WHERE timestamp >= ?1 ORDER BY timestamp, id",
                    self.kind.table()
                ),
                &[&since],
            )
            .await?;
        rows.iter().map(LogEntry::from_row).collect()
    }

    pub async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        let affected = self
            .db
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.kind.table()),
                &[&id],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Drop entries older than `cutoff`. Returns how many went.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        self.db
            .execute(
                &format!("DELETE FROM {} WHERE timestamp < ?1", self.kind.table()),
                &[&cutoff.timestamp_millis()],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_store;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn entries_come_back_in_timestamp_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("log.db")).await.unwrap();
        let log = store.message_log();
        let now = Utc::now();

        log.append_at(now, "push", "second", None).await.unwrap();
        log.append_at(now - Duration::minutes(5), "push", "first", Some(&json!({"p": 1})))
            .await
            .unwrap();

        let entries = log.get_all(None).await.unwrap();
        let messages: Vec<_> = entries.iter().map(|entry| entry.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
        assert_eq!(entries[0].payload, Some(json!({"p": 1})));
    }

    #[tokio::test]
    async fn partitions_are_separate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("log.db")).await.unwrap();

        let id = store
            .diagnostic_log()
            .append("push", "driver failed", None)
            .await
            .unwrap();

        assert!(store.message_log().get_all(None).await.unwrap().is_empty());
        let entry = store.diagnostic_log().get(id).await.unwrap().unwrap();
        assert_eq!(entry.kind, "push");
        assert_eq!(entry.message, "driver failed");
    }

    #[tokio::test]
    async fn prune_removes_only_old_entries() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("log.db")).await.unwrap();
        let log = store.diagnostic_log();
        let now = Utc::now();

        log.append_at(now - Duration::days(10), "inbox", "old", None)
            .await
            .unwrap();
        let recent = log.append_at(now, "inbox", "recent", None).await.unwrap();

        let pruned = log.prune_older_than(now - Duration::days(7)).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = log.get_all(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent);

        assert!(log.delete(recent).await.unwrap());
        assert!(log.get(recent).await.unwrap().is_none());
    }
}
