use beacon_core::inbox::{InboxMessage, InboxStatus};
use chrono::{DateTime, Utc};

use crate::{Database, Row, SqlValue, StorageError, ToSql};

/// Secondary-index filter for [`InboxPartition::get_all`]. Unset fields match
/// everything; set fields are combined with `AND`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboxFilter {
    pub status: Option<InboxStatus>,
    /// Status strictly below this one
    pub status_below: Option<InboxStatus>,
    /// Neither deleted nor past its removal time at this instant
    pub visible_at: Option<DateTime<Utc>>,
    pub removal_before: Option<DateTime<Utc>>,
    pub deleted_before: Option<DateTime<Utc>>,
}

impl InboxFilter {
    pub fn visible(now: DateTime<Utc>) -> Self {
        Self {
            visible_at: Some(now),
            ..Self::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(status) = self.status {
            clauses.push(bind("status = ?", SqlValue::Integer(status.code().into()), &mut params));
        }
        if let Some(status) = self.status_below {
            clauses.push(bind("status < ?", SqlValue::Integer(status.code().into()), &mut params));
        }
        if let Some(now) = self.visible_at {
            clauses.push(format!("status < {}", InboxStatus::Deleted.code()));
            clauses.push(bind(
                "(removal_at IS NULL OR removal_at > ?)",
                SqlValue::Integer(now.timestamp_millis()),
                &mut params,
            ));
        }
        if let Some(before) = self.removal_before {
            clauses.push(bind(
                "(removal_at IS NOT NULL AND removal_at <= ?)",
                SqlValue::Integer(before.timestamp_millis()),
                &mut params,
            ));
        }
        if let Some(before) = self.deleted_before {
            clauses.push(bind(
                "(deleted_at IS NOT NULL AND deleted_at <= ?)",
                SqlValue::Integer(before.timestamp_millis()),
                &mut params,
            ));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params)
        }
    }
}

/// What [`InboxPartition::merge`] did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Stored status moved forward
    Advanced { from: InboxStatus, to: InboxStatus },
    /// Stored status already at or past the incoming one
    Unchanged(InboxStatus),
}

impl MergeOutcome {
    pub fn status_after(&self, incoming: InboxStatus) -> InboxStatus {
        match *self {
            Self::Inserted => incoming,
            Self::Advanced { to, .. } => to,
            Self::Unchanged(status) => status,
        }
    }
}

fn bind(clause: &str, value: SqlValue, params: &mut Vec<SqlValue>) -> String {
    params.push(value);
    clause.replace('?', &format!("?{}", params.len()))
}

const COLUMNS: &str = "status, payload";

fn message_from_row(row: &Row) -> Result<InboxMessage, StorageError> {
    let code = row.integer(0)?;
    let status = u8::try_from(code)
        .ok()
        .and_then(InboxStatus::from_code)
        .ok_or_else(|| StorageError::QueryFailed(format!("invalid inbox status {code}")))?;
    let mut message: InboxMessage = serde_json::from_str(&row.text(1)?)?;
    // The column is authoritative; the payload copy can lag behind it.
    message.status = status;
    Ok(message)
}

/// Inbox messages keyed by id, indexed by status and removal time.
///
/// Status writes are joins on the lattice: the stored status never moves back.
pub struct InboxPartition<'a, D: Database> {
    db: &'a D,
}

impl<'a, D: Database> InboxPartition<'a, D> {
    pub(crate) fn new(db: &'a D) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<InboxMessage>, StorageError> {
        let rows: Vec<Row> = self
            .db
            .query(
                &format!("SELECT {COLUMNS} FROM inbox_messages WHERE id = ?1"),
                &[&id],
            )
            .await?;
        rows.first().map(message_from_row).transpose()
    }

    /// Matching messages, newest order key first.
    pub async fn get_all(&self, filter: &InboxFilter) -> Result<Vec<InboxMessage>, StorageError> {
        let (clause, params) = filter.where_clause();
        let params: Vec<&dyn ToSql> = params.iter().map(|value| value as &dyn ToSql).collect();
        let rows: Vec<Row> = self
            .db
            .query(
                &format!("SELECT {COLUMNS} FROM inbox_messages{clause} ORDER BY order_key DESC, id"),
                &params,
            )
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn count(&self, filter: &InboxFilter) -> Result<u64, StorageError> {
        let (clause, params) = filter.where_clause();
        let params: Vec<&dyn ToSql> = params.iter().map(|value| value as &dyn ToSql).collect();
        let row: Row = self
            .db
            .query_one(&format!("SELECT COUNT(*) FROM inbox_messages{clause}"), &params)
            .await?;
        Ok(u64::try_from(row.integer(0)?).unwrap_or_default())
    }

    /// Insert or update a message, joining its status with the stored one.
    ///
    /// Content fields take the incoming values.
    pub async fn merge(
        &self,
        message: &InboxMessage,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StorageError> {
        let previous = self.get(&message.id).await?.map(|stored| stored.status);
        let payload = serde_json::to_string(message)?;

        self.db
            .execute(
                "INSERT INTO inbox_messages (id, order_key, created_at, removal_at, status, payload, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, CASE WHEN ?5 = 4 THEN ?7 END)
                 ON CONFLICT (id) DO UPDATE SET
                     order_key = excluded.order_key,
                     created_at = excluded.created_at,
                     removal_at = excluded.removal_at,
                     payload = excluded.payload,
                     status = MAX(inbox_messages.status, excluded.status),
                     deleted_at = COALESCE(inbox_messages.deleted_at, excluded.deleted_at)",
                &[
                    &message.id,
                    &message.order,
                    &message.created_at.timestamp_millis(),
                    &message.removal_at.map(|at| at.timestamp_millis()),
                    &message.status.code(),
                    &payload,
                    &now.timestamp_millis(),
                ],
            )
            .await?;

        Ok(match previous {
            None => MergeOutcome::Inserted,
            Some(from) => {
                let to = from.merge(message.status);
                if to > from {
                    MergeOutcome::Advanced { from, to }
                } else {
                    MergeOutcome::Unchanged(from)
                }
            }
        })
    }

    /// Move a stored message forward to `status`. Returns `false` when the id is unknown.
    pub async fn set_status(
        &self,
        id: &str,
        status: InboxStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let affected = self
            .db
            .execute(
                "UPDATE inbox_messages SET
                     status = MAX(status, ?2),
                     deleted_at = CASE WHEN ?2 = 4 AND deleted_at IS NULL THEN ?3 ELSE deleted_at END
                 WHERE id = ?1",
                &[&id, &status.code(), &now.timestamp_millis()],
            )
            .await?;
        Ok(affected > 0)
    }

    /// Physically remove one message.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let affected = self
            .db
            .execute("DELETE FROM inbox_messages WHERE id = ?1", &[&id])
            .await?;
        Ok(affected > 0)
    }

    /// Physically remove every message the filter matches.
    pub async fn purge(&self, filter: &InboxFilter) -> Result<u64, StorageError> {
        let (clause, params) = filter.where_clause();
        if clause.is_empty() {
            return Err(StorageError::QueryFailed(
                "refusing to purge the inbox without a filter".to_string(),
            ));
        }
        let params: Vec<&dyn ToSql> = params.iter().map(|value| value as &dyn ToSql).collect();
        self.db
            .execute(&format!("DELETE FROM inbox_messages{clause}"), &params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NativeDatabase, Store, open_store};
    use assert_matches::assert_matches;
    use beacon_core::inbox::InboxAction;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn message(id: &str, order: i64, status: InboxStatus) -> InboxMessage {
        InboxMessage {
            id: id.to_string(),
            order,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            removal_at: None,
            title: Some(format!("title {id}")),
            body: format!("body {id}"),
            image: None,
            action: InboxAction::None,
            status,
        }
    }

    async fn store() -> (TempDir, Store<NativeDatabase>) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("inbox.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn merge_never_downgrades_status() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        let now = Utc::now();

        let outcome = inbox.merge(&message("m1", 1, InboxStatus::Read), now).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted);

        let outcome = inbox
            .merge(&message("m1", 1, InboxStatus::Delivered), now)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged(InboxStatus::Read));
        assert_eq!(inbox.get("m1").await.unwrap().unwrap().status, InboxStatus::Read);

        let outcome = inbox.merge(&message("m1", 1, InboxStatus::Open), now).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Advanced {
                from: InboxStatus::Read,
                to: InboxStatus::Open
            }
        );
    }

    #[tokio::test]
    async fn merge_refreshes_content() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        let now = Utc::now();

        inbox.merge(&message("m1", 1, InboxStatus::Delivered), now).await.unwrap();
        let mut updated = message("m1", 1, InboxStatus::Delivered);
        updated.body = "edited".to_string();
        inbox.merge(&updated, now).await.unwrap();

        assert_eq!(inbox.get("m1").await.unwrap().unwrap().body, "edited");
    }

    #[tokio::test]
    async fn deleted_is_absorbing() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        let now = Utc::now();

        inbox.merge(&message("m1", 1, InboxStatus::Delivered), now).await.unwrap();
        assert!(inbox.set_status("m1", InboxStatus::Deleted, now).await.unwrap());
        assert!(inbox.set_status("m1", InboxStatus::Read, now).await.unwrap());
        inbox.merge(&message("m1", 1, InboxStatus::Open), now).await.unwrap();

        assert_eq!(inbox.get("m1").await.unwrap().unwrap().status, InboxStatus::Deleted);
    }

    #[tokio::test]
    async fn set_status_on_unknown_id_reports_false() {
        let (_dir, store) = store().await;
        assert!(!store.inbox().set_status("ghost", InboxStatus::Read, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn filters_use_status_and_removal_indexes() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        let now = Utc::now();

        inbox.merge(&message("a", 1, InboxStatus::Delivered), now).await.unwrap();
        inbox.merge(&message("b", 2, InboxStatus::Read), now).await.unwrap();
        inbox.merge(&message("c", 3, InboxStatus::Open), now).await.unwrap();
        inbox.merge(&message("d", 4, InboxStatus::Deleted), now).await.unwrap();
        let mut expired = message("e", 5, InboxStatus::Delivered);
        expired.removal_at = Some(now - Duration::hours(1));
        inbox.merge(&expired, now).await.unwrap();

        let visible: Vec<_> = inbox
            .get_all(&InboxFilter::visible(now))
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(visible, ["c", "b", "a"]);

        let unread = InboxFilter {
            status: Some(InboxStatus::Delivered),
            ..InboxFilter::visible(now)
        };
        assert_eq!(inbox.count(&unread).await.unwrap(), 1);

        let no_action = InboxFilter {
            status_below: Some(InboxStatus::Open),
            ..InboxFilter::visible(now)
        };
        assert_eq!(inbox.count(&no_action).await.unwrap(), 2);

        let past_removal = InboxFilter {
            removal_before: Some(now),
            ..InboxFilter::default()
        };
        assert_eq!(inbox.count(&past_removal).await.unwrap(), 1);
        assert_eq!(inbox.count(&InboxFilter::default()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn purge_removes_deleted_past_retention() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        let now = Utc::now();

        inbox.merge(&message("old", 1, InboxStatus::Delivered), now).await.unwrap();
        inbox
            .set_status("old", InboxStatus::Deleted, now - Duration::days(8))
            .await
            .unwrap();
        inbox.merge(&message("fresh", 2, InboxStatus::Delivered), now).await.unwrap();
        inbox.set_status("fresh", InboxStatus::Deleted, now).await.unwrap();

        let purged = inbox
            .purge(&InboxFilter {
                deleted_before: Some(now - Duration::days(7)),
                ..InboxFilter::default()
            })
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(inbox.get("old").await.unwrap().is_none());
        assert!(inbox.get("fresh").await.unwrap().is_some());
        assert_matches!(
            inbox.purge(&InboxFilter::default()).await,
            Err(StorageError::QueryFailed(_))
        );
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (_dir, store) = store().await;
        let inbox = store.inbox();
        inbox.merge(&message("m1", 1, InboxStatus::Delivered), Utc::now()).await.unwrap();

        assert!(inbox.delete("m1").await.unwrap());
        assert!(!inbox.delete("m1").await.unwrap());
    }
}
