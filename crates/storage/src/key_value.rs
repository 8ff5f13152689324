use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Database, Row, StorageError};

/// Dotted-path keys (`params.hwid`) to JSON values. Last write wins.
pub struct KeyValuePartition<'a, D: Database> {
    db: &'a D,
}

impl<'a, D: Database> KeyValuePartition<'a, D> {
    pub(crate) fn new(db: &'a D) -> Self {
        Self { db }
    }

    /// Absent keys read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let rows: Vec<Row> = self
            .db
            .query("SELECT value FROM key_value WHERE key = ?1", &[&key])
            .await?;

        match rows.first() {
            Some(row) => Ok(Some(serde_json::from_str(&row.text(0)?)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_string(value)?;
        let now = Utc::now().timestamp_millis();

        self.db
            .execute(
                "INSERT INTO key_value (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                                                 updated_at = excluded.updated_at",
                &[&key, &value, &now],
            )
            .await?;
        Ok(())
    }

    /// Every entry whose key starts with `prefix`, ordered by key.
    pub async fn get_all(
        &self,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
        let rows: Vec<Row> = match prefix {
            Some(prefix) => {
                self.db
                    .query(
                        "SELECT key, value FROM key_value
                         WHERE substr(key, 1, length(?1)) = ?1
                         ORDER BY key",
                        &[&prefix],
                    )
                    .await?
            }
            None => {
                self.db
                    .query("SELECT key, value FROM key_value ORDER BY key", &[])
                    .await?
            }
        };

        rows.iter()
            .map(|row| Ok((row.text(0)?, serde_json::from_str(&row.text(1)?)?)))
            .collect()
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let affected = self
            .db
            .execute("DELETE FROM key_value WHERE key = ?1", &[&key])
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::{NativeDatabase, Store, open_store};
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, Store<NativeDatabase>) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("kv.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_key_reads_none() {
        let (_dir, store) = store().await;
        let value: Option<String> = store.key_value().get("params.hwid").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn set_overwrites_previous_value() {
        let (_dir, store) = store().await;
        let kv = store.key_value();

        kv.set("params.pushToken", "first").await.unwrap();
        kv.set("params.pushToken", "second").await.unwrap();

        assert_eq!(
            kv.get::<String>("params.pushToken").await.unwrap().as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn concurrent_sets_resolve_in_call_order() {
        let (_dir, store) = store().await;
        let kv = store.key_value();

        let (a, b) = tokio::join!(kv.set("counter", &1), kv.set("counter", &2));
        a.unwrap();
        b.unwrap();

        assert_eq!(kv.get::<i64>("counter").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn structured_values_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, Deserialize)]
        struct Cursor {
            code: String,
            time: i64,
        }

        let (_dir, store) = store().await;
        let cursor = Cursor {
            code: "c2".to_string(),
            time: 1_700_000_000,
        };
        store.key_value().set("inbox.cursor", &cursor).await.unwrap();

        assert_eq!(
            store.key_value().get::<Cursor>("inbox.cursor").await.unwrap(),
            Some(cursor)
        );
    }

    #[tokio::test]
    async fn get_all_filters_by_prefix() {
        let (_dir, store) = store().await;
        let kv = store.key_value();
        kv.set("params.hwid", "hw").await.unwrap();
        kv.set("params.pushToken", "tok").await.unwrap();
        kv.set("inbox.lastRequestCode", "c2").await.unwrap();

        let params = kv.get_all(Some("params.")).await.unwrap();
        assert_eq!(
            params,
            vec![
                ("params.hwid".to_string(), json!("hw")),
                ("params.pushToken".to_string(), json!("tok")),
            ]
        );
        assert_eq!(kv.get_all(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (_dir, store) = store().await;
        let kv = store.key_value();
        kv.set("params.authToken", "a").await.unwrap();

        assert!(kv.delete("params.authToken").await.unwrap());
        assert!(!kv.delete("params.authToken").await.unwrap());
        assert!(kv.get::<String>("params.authToken").await.unwrap().is_none());
    }
}
