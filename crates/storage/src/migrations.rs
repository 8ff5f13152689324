use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::StorageError;

/// Identifies a migration step. `Initial` sorts before every dated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationKey {
    Initial,
    Dated(NaiveDate),
}

impl MigrationKey {
    pub fn parse(key: &str) -> Option<Self> {
        if key == "initial" {
            return Some(Self::Initial);
        }
        NaiveDate::parse_from_str(key, "%Y-%m-%d")
            .ok()
            .map(Self::Dated)
    }
}

impl std::fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::Dated(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

pub(crate) struct MigrationStep {
    pub key: &'static str,
    pub sql: &'static str,
}

pub(crate) const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        key: "initial",
        sql: include_str!("../migrations/initial.sql"),
    },
    MigrationStep {
        key: "2019-06-03",
        sql: include_str!("../migrations/2019-06-03_inbox_messages.sql"),
    },
    MigrationStep {
        key: "2020-03-17",
        sql: include_str!("../migrations/2020-03-17_inbox_removal.sql"),
    },
    MigrationStep {
        key: "2021-09-08",
        sql: include_str!("../migrations/2021-09-08_diagnostic_log.sql"),
    },
];

/// Key of the newest step this build knows about.
pub fn latest_migration() -> Option<MigrationKey> {
    MIGRATIONS
        .last()
        .and_then(|step| MigrationKey::parse(step.key))
}

pub(crate) fn run_migrations(connection: &Connection) -> Result<Vec<MigrationKey>, StorageError> {
    run_steps(connection, MIGRATIONS)
}

/// Read the "last migration applied" marker.
pub(crate) fn current_marker(connection: &Connection) -> Result<Option<MigrationKey>, StorageError> {
    let stored: Option<String> = connection
        .query_row(
            "SELECT last_applied FROM schema_marker WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|error| StorageError::MigrationFailed {
            key: "marker".to_string(),
            reason: format!("failed to read schema marker: {error}"),
        })?;

    stored
        .map(|key| {
            MigrationKey::parse(&key).ok_or_else(|| StorageError::MigrationFailed {
                key: key.clone(),
                reason: "unrecognized schema marker".to_string(),
            })
        })
        .transpose()
}

/// Apply every step newer than the stored marker, in ascending order.
///
/// Each step and its marker update commit together; a failing step rolls back
/// alone and leaves the marker on the previous step.
pub(crate) fn run_steps(
    connection: &Connection,
    steps: &[MigrationStep],
) -> Result<Vec<MigrationKey>, StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_marker (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_applied TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            key: "marker".to_string(),
            reason: format!("failed to create schema_marker table: {error}"),
        })?;

    let mut previous: Option<MigrationKey> = None;
    let mut parsed = Vec::with_capacity(steps.len());
    for step in steps {
        let key = MigrationKey::parse(step.key).ok_or_else(|| StorageError::MigrationFailed {
            key: step.key.to_string(),
            reason: "migration key must be `initial` or YYYY-MM-DD".to_string(),
        })?;
        if previous.is_some_and(|previous| previous >= key) {
            return Err(StorageError::MigrationFailed {
                key: step.key.to_string(),
                reason: "migration steps are not in ascending order".to_string(),
            });
        }
        previous = Some(key);
        parsed.push((key, step));
    }

    let marker = current_marker(connection)?;
    let mut applied = Vec::new();

    for (key, step) in parsed {
        if marker.is_some_and(|marker| key <= marker) {
            continue;
        }

        let fail = |reason: String| StorageError::MigrationFailed {
            key: key.to_string(),
            reason,
        };

        let tx = connection
            .unchecked_transaction()
            .map_err(|error| fail(format!("failed to begin transaction: {error}")))?;

        tx.execute_batch(step.sql)
            .map_err(|error| fail(error.to_string()))?;

        tx.execute(
            "INSERT INTO schema_marker (id, last_applied, applied_at) VALUES (1, ?1, datetime('now'))
             ON CONFLICT (id) DO UPDATE SET last_applied = excluded.last_applied,
                                            applied_at = excluded.applied_at",
            params![key.to_string()],
        )
        .map_err(|error| fail(format!("failed to record migration: {error}")))?;

        tx.commit()
            .map_err(|error| fail(format!("failed to commit migration: {error}")))?;

        info!(migration = %key, "applied migration");
        applied.push(key);
    }

    if applied.is_empty() {
        debug!(marker = ?marker, "schema up to date");
    }

    Ok(applied)
}
