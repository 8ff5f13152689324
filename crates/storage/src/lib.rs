use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::{
    Connection, params_from_iter,
    types::{Value, ValueRef},
};
use tokio::{sync::oneshot, task};
use tracing::{debug, info, warn};

pub mod inbox;
pub mod key_value;
pub mod log;
pub mod migrations;

pub use inbox::{InboxFilter, InboxPartition, MergeOutcome};
pub use key_value::KeyValuePartition;
pub use log::{LogEntry, LogKind, LogPartition};
pub use migrations::{MigrationKey, latest_migration};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("migration {key} failed: {reason}")]
    MigrationFailed { key: String, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("expected one row but found none")]
    NotFound,

    #[error("transaction rolled back: {0}")]
    TransactionFailed(String),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

pub trait ToSql: Send + Sync {
    fn to_sql_value(&self) -> SqlValue;
}

impl ToSql for SqlValue {
    fn to_sql_value(&self) -> SqlValue {
        self.clone()
    }
}

impl ToSql for bool {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Boolean(*self)
    }
}

impl ToSql for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(*self)
    }
}

impl ToSql for i32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for u32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for u8 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Integer(i64::from(*self))
    }
}

impl ToSql for f64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Real(*self)
    }
}

impl ToSql for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSql for str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.to_string())
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_sql_value(&self) -> SqlValue {
        (**self).to_sql_value()
    }
}

impl<T> ToSql for Option<T>
where
    T: ToSql,
{
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(value) => value.to_sql_value(),
            None => SqlValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn integer(&self, index: usize) -> Result<i64, StorageError> {
        match self.get(index) {
            Some(SqlValue::Integer(value)) => Ok(*value),
            Some(SqlValue::Boolean(value)) => Ok(i64::from(*value)),
            other => Err(column_type_error(index, "integer", other)),
        }
    }

    pub fn optional_integer(&self, index: usize) -> Result<Option<i64>, StorageError> {
        match self.get(index) {
            Some(SqlValue::Null) => Ok(None),
            _ => self.integer(index).map(Some),
        }
    }

    pub fn text(&self, index: usize) -> Result<String, StorageError> {
        match self.get(index) {
            Some(SqlValue::Text(value)) => Ok(value.clone()),
            other => Err(column_type_error(index, "text", other)),
        }
    }

    pub fn optional_text(&self, index: usize) -> Result<Option<String>, StorageError> {
        match self.get(index) {
            Some(SqlValue::Null) => Ok(None),
            _ => self.text(index).map(Some),
        }
    }
}

fn column_type_error(index: usize, expected: &str, found: Option<&SqlValue>) -> StorageError {
    StorageError::QueryFailed(format!(
        "column {index}: expected {expected}, found {found:?}"
    ))
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, StorageError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(row.clone())
    }
}

/// One statement of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: &[&dyn ToSql]) -> Self {
        Self {
            sql: sql.into(),
            params: collect_params(params),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Database: Send + Sync + 'static {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError>;

    /// Execute an `INSERT` and return the new row id.
    async fn insert(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64, StorageError>;

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError>;

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError>;

    /// Run every statement or none of them. Returns rows affected per statement.
    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StorageError>;
}

/// SQLite backend.
///
/// Writes go through a single writer thread so they apply in call order; reads
/// open their own connection on the blocking pool.
#[derive(Debug)]
pub struct NativeDatabase {
    path: PathBuf,
    writer: Sender<WriteCommand>,
}

enum WriteCommand {
    Execute {
        sql: String,
        params: Vec<SqlValue>,
        response: oneshot::Sender<Result<u64, StorageError>>,
    },
    Insert {
        sql: String,
        params: Vec<SqlValue>,
        response: oneshot::Sender<Result<i64, StorageError>>,
    },
    Transaction {
        statements: Vec<Statement>,
        response: oneshot::Sender<Result<Vec<u64>, StorageError>>,
    },
}

enum WriterState {
    Ready(Connection),
    Failed(String),
}

fn collect_params(params: &[&dyn ToSql]) -> Vec<SqlValue> {
    params.iter().map(|param| param.to_sql_value()).collect()
}

fn sql_value_to_rusqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(integer) => Value::Integer(*integer),
        SqlValue::Real(real) => Value::Real(*real),
        SqlValue::Text(text) => Value::Text(text.clone()),
        SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
        SqlValue::Boolean(boolean) => Value::Integer(i64::from(*boolean)),
    }
}

fn sql_values_to_rusqlite_values(values: &[SqlValue]) -> Vec<Value> {
    values.iter().map(sql_value_to_rusqlite_value).collect()
}

fn value_ref_to_sql_value(value_ref: ValueRef<'_>) -> SqlValue {
    match value_ref {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(integer) => SqlValue::Integer(integer),
        ValueRef::Real(real) => SqlValue::Real(real),
        ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn unavailable(path: &Path, reason: impl ToString) -> StorageError {
    StorageError::Unavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| unavailable(path, error))?;
    }

    let connection = Connection::open(path).map_err(|error| unavailable(path, error))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| unavailable(path, error))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| unavailable(path, error))?;
    Ok(connection)
}

fn execute_statement(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StorageError> {
    let values = sql_values_to_rusqlite_values(params);

    connection
        .execute(sql, params_from_iter(values.iter()))
        .map(|rows_affected| rows_affected as u64)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))
}

fn execute_transaction(
    connection: &mut Connection,
    statements: &[Statement],
) -> Result<Vec<u64>, StorageError> {
    let tx = connection
        .transaction()
        .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;

    let mut affected = Vec::with_capacity(statements.len());
    for statement in statements {
        let count = execute_statement(&tx, &statement.sql, &statement.params)
            .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;
        affected.push(count);
    }

    tx.commit()
        .map_err(|error| StorageError::TransactionFailed(error.to_string()))?;
    Ok(affected)
}

fn query_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let values = sql_values_to_rusqlite_values(params);
    let column_count = statement.column_count();
    let mut rows = statement
        .query(params_from_iter(values.iter()))
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
    let mut output = Vec::new();

    while let Some(row) = rows
        .next()
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?
    {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row
                .get_ref(index)
                .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
            values.push(value_ref_to_sql_value(value));
        }
        output.push(Row::new(values));
    }

    Ok(output)
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteCommand>) {
    let mut state = match open_connection(&path) {
        Ok(connection) => WriterState::Ready(connection),
        Err(error) => WriterState::Failed(error.to_string()),
    };

    while let Ok(command) = receiver.recv() {
        match command {
            WriteCommand::Execute {
                sql,
                params,
                response,
            } => {
                let result = match &mut state {
                    WriterState::Ready(connection) => execute_statement(connection, &sql, &params),
                    WriterState::Failed(reason) => Err(unavailable(&path, reason.as_str())),
                };

                let _ = response.send(result);
            }
            WriteCommand::Insert {
                sql,
                params,
                response,
            } => {
                let result = match &mut state {
                    WriterState::Ready(connection) => execute_statement(connection, &sql, &params)
                        .map(|_| connection.last_insert_rowid()),
                    WriterState::Failed(reason) => Err(unavailable(&path, reason.as_str())),
                };

                let _ = response.send(result);
            }
            WriteCommand::Transaction {
                statements,
                response,
            } => {
                let result = match &mut state {
                    WriterState::Ready(connection) => execute_transaction(connection, &statements),
                    WriterState::Failed(reason) => Err(unavailable(&path, reason.as_str())),
                };

                let _ = response.send(result);
            }
        }
    }

    debug!(path = %path.display(), "storage writer stopped");
}

impl NativeDatabase {
    async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let setup_path = path.clone();

        let applied = task::spawn_blocking(move || {
            let connection = open_connection(&setup_path)?;
            migrations::run_migrations(&connection)
        })
        .await
        .map_err(|error| unavailable(&path, format!("failed to join storage setup task: {error}")))??;

        let (writer, receiver) = mpsc::channel();
        let writer_path = path.clone();

        thread::Builder::new()
            .name("storage_writer".to_string())
            .spawn(move || run_writer(writer_path, receiver))
            .map_err(|error| unavailable(&path, format!("failed to spawn storage_writer: {error}")))?;

        info!(path = %path.display(), migrations_applied = applied.len(), "store opened");
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, command: WriteCommand) -> Result<(), StorageError> {
        self.writer.send(command).map_err(|_| {
            warn!("storage writer is gone");
            StorageError::QueryFailed("storage writer task is unavailable".to_string())
        })
    }
}

impl Database for NativeDatabase {
    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteCommand::Execute {
            sql: sql.to_string(),
            params: collect_params(params),
            response: response_tx,
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer task terminated before responding".to_string(),
            )
        })?
    }

    async fn insert(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteCommand::Insert {
            sql: sql.to_string(),
            params: collect_params(params),
            response: response_tx,
        })?;

        response_rx.await.map_err(|_| {
            StorageError::QueryFailed(
                "storage writer task terminated before responding".to_string(),
            )
        })?
    }

    async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let sql = sql.to_string();
        let params = collect_params(params);
        let path = self.path.clone();
        let rows = task::spawn_blocking(move || {
            let connection = open_connection(&path)?;
            query_rows(&connection, &sql, &params)
        })
        .await
        .map_err(|error| {
            StorageError::QueryFailed(format!("failed to join query task: {error}"))
        })??;

        rows.iter().map(T::from_row).collect()
    }

    async fn query_one<T: FromRow>(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<T, StorageError> {
        let mut rows = self.query(sql, params).await?;
        if rows.is_empty() {
            return Err(StorageError::NotFound);
        }

        Ok(rows.remove(0))
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<u64>, StorageError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WriteCommand::Transaction {
            statements,
            response: response_tx,
        })?;

        response_rx.await.map_err(|_| {
            StorageError::TransactionFailed(
                "storage writer task terminated before responding".to_string(),
            )
        })?
    }
}

/// Open the SQLite file at `path`, applying pending migrations first.
///
/// Fails with [`StorageError::Unavailable`] when the file cannot be opened and with
/// [`StorageError::MigrationFailed`] when a step fails; the file is then left at the
/// last step that committed.
pub async fn open_database(path: &Path) -> Result<NativeDatabase, StorageError> {
    NativeDatabase::open(path).await
}

/// Handle over the four partitions of one database.
#[derive(Debug)]
pub struct Store<D: Database> {
    db: D,
}

impl<D: Database> Store<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn key_value(&self) -> KeyValuePartition<'_, D> {
        KeyValuePartition::new(&self.db)
    }

    pub fn message_log(&self) -> LogPartition<'_, D> {
        LogPartition::new(&self.db, LogKind::Messages)
    }

    pub fn diagnostic_log(&self) -> LogPartition<'_, D> {
        LogPartition::new(&self.db, LogKind::Diagnostics)
    }

    pub fn inbox(&self) -> InboxPartition<'_, D> {
        InboxPartition::new(&self.db)
    }

    /// The last migration recorded in the schema marker.
    pub async fn schema_marker(&self) -> Result<Option<MigrationKey>, StorageError> {
        let rows: Vec<Row> = self
            .db
            .query("SELECT last_applied FROM schema_marker WHERE id = 1", &[])
            .await?;
        rows.first()
            .map(|row| {
                let key = row.text(0)?;
                MigrationKey::parse(&key).ok_or(StorageError::MigrationFailed {
                    key,
                    reason: "unrecognized schema marker".to_string(),
                })
            })
            .transpose()
    }
}

pub async fn open_store(path: &Path) -> Result<Store<NativeDatabase>, StorageError> {
    Ok(Store::new(open_database(path).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    async fn open_test_store() -> (TempDir, Store<NativeDatabase>) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir.path().join("beacon.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn open_migrates_to_latest() {
        let (_dir, store) = open_test_store().await;
        assert_eq!(store.schema_marker().await.unwrap(), latest_migration());
    }

    #[tokio::test]
    async fn reopen_keeps_marker_and_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("beacon.db");

        let store = open_store(&path).await.unwrap();
        store.key_value().set("params.hwid", &"abc").await.unwrap();
        drop(store);

        let store = open_store(&path).await.unwrap();
        assert_eq!(store.schema_marker().await.unwrap(), latest_migration());
        assert_eq!(
            store.key_value().get::<String>("params.hwid").await.unwrap(),
            Some("abc".to_string())
        );
    }

    #[tokio::test]
    async fn unopenable_path_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = open_database(&blocker.join("beacon.db")).await;
        assert_matches!(result, Err(StorageError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn corrupt_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("beacon.db");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        assert!(open_database(&path).await.is_err());
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let (_dir, store) = open_test_store().await;
        let db = store.database();

        let result = db
            .transaction(vec![
                Statement::new(
                    "INSERT INTO key_value (key, value, updated_at) VALUES (?1, ?2, 0)",
                    &[&"a", &"1"],
                ),
                Statement::new("INSERT INTO missing_table VALUES (1)", &[]),
            ])
            .await;
        assert_matches!(result, Err(StorageError::TransactionFailed(_)));

        let rows: Vec<Row> = db.query("SELECT key FROM key_value", &[]).await.unwrap();
        assert!(rows.is_empty());

        let affected = db
            .transaction(vec![
                Statement::new(
                    "INSERT INTO key_value (key, value, updated_at) VALUES (?1, ?2, 0)",
                    &[&"a", &"1"],
                ),
                Statement::new(
                    "INSERT INTO key_value (key, value, updated_at) VALUES (?1, ?2, 0)",
                    &[&"b", &"2"],
                ),
            ])
            .await
            .unwrap();
        assert_eq!(affected, vec![1, 1]);
    }

    #[tokio::test]
    async fn query_one_reports_not_found() {
        let (_dir, store) = open_test_store().await;
        let result: Result<Row, _> = store
            .database()
            .query_one("SELECT value FROM key_value WHERE key = ?1", &[&"nope"])
            .await;
        assert_matches!(result, Err(StorageError::NotFound));
    }

    #[test]
    fn row_accessors_check_types() {
        let row = Row::new(vec![
            SqlValue::Integer(7),
            SqlValue::Null,
            SqlValue::Text("x".to_string()),
        ]);
        assert_eq!(row.integer(0).unwrap(), 7);
        assert_eq!(row.optional_integer(1).unwrap(), None);
        assert_eq!(row.text(2).unwrap(), "x");
        assert!(row.text(0).is_err());
        assert!(row.integer(5).is_err());
    }
}
