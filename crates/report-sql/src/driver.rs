use futures::TryStreamExt;
use sqlx::{Column as _, Connection as _, Either, Executor, Row as _, TypeInfo as _};

/// Column is the name and type of a result field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    /// Type modifier, such as the length of a `character varying(n)`,
    /// where the column's type has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_modifier: Option<i32>,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_modifier: None,
        }
    }

    pub fn with_type_modifier(mut self, type_modifier: i32) -> Self {
        self.type_modifier = Some(type_modifier);
        self
    }
}

/// CommandTag is the driver-reported operation kind and affected-row count
/// of an executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    pub kind: String,
    pub rows: u64,
}

/// Outcome is everything the driver reports about one executed statement.
/// Row values are the textual wire representation, or None for SQL NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub fields: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command: Option<CommandTag>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DriverErrorKind {
    /// The database rejected the statement. The connection remains usable.
    Database,
    /// Transport or protocol failure. The connection must not be reused.
    Connection,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn database(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Database,
            message: message.into(),
        }
    }
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connection,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::database(db.message()),
            other => Self::connection(other.to_string()),
        }
    }
}

/// Escape is the driver's quoting of untrusted text into SQL.
pub trait Escape {
    /// Quote `s` as a string literal, including the surrounding quotes.
    fn escape_string(&self, s: &str) -> String;
    /// Quote `s` as an identifier, including the surrounding double quotes.
    fn escape_identifier(&self, s: &str) -> String;
}

/// Driver executes SQL text over one database session.
#[async_trait::async_trait]
pub trait Driver: Escape + Send {
    async fn execute(&mut self, sql: &str) -> Result<Outcome, DriverError>;

    async fn close(self) -> Result<(), DriverError>
    where
        Self: Sized;
}

/// PgDriver is a Driver over a single Postgres session.
///
/// Statements are sent using the simple query protocol, so that every column
/// arrives in its textual wire format regardless of type.
pub struct PgDriver {
    conn: sqlx::PgConnection,
}

impl PgDriver {
    pub async fn connect(options: &sqlx::postgres::PgConnectOptions) -> Result<Self, DriverError> {
        let conn = sqlx::PgConnection::connect_with(options).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: sqlx::PgConnection) -> Self {
        Self { conn }
    }

    async fn describe(&mut self, sql: &str) -> Result<Vec<Column>, DriverError> {
        let describe = (&mut self.conn).describe(sql).await?;

        Ok(describe
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_info().name()))
            .collect())
    }
}

impl Escape for PgDriver {
    fn escape_string(&self, s: &str) -> String {
        pg_escape_string(s)
    }
    fn escape_identifier(&self, s: &str) -> String {
        pg_escape_identifier(s)
    }
}

/// Quote `s` as a Postgres string literal. Text having a backslash is written
/// as an escape string (`E'...'`), which reads identically whether or not the
/// session enables `standard_conforming_strings`.
pub fn pg_escape_string(s: &str) -> String {
    let quoted = s.replace('\'', "''");
    if s.contains('\\') {
        format!("E'{}'", quoted.replace('\\', "\\\\"))
    } else {
        format!("'{quoted}'")
    }
}

pub fn pg_escape_identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[async_trait::async_trait]
impl Driver for PgDriver {
    #[tracing::instrument(level = "trace", err, skip(self))]
    async fn execute(&mut self, sql: &str) -> Result<Outcome, DriverError> {
        let mut outcome = Outcome::default();
        let mut rows_affected = None;

        let mut stream = (&mut self.conn).fetch_many(sql);
        while let Some(step) = stream.try_next().await? {
            match step {
                Either::Left(done) => rows_affected = Some(done.rows_affected()),
                Either::Right(row) => {
                    if outcome.fields.is_empty() {
                        outcome.fields = row
                            .columns()
                            .iter()
                            .map(|c| Column::new(c.name(), c.type_info().name()))
                            .collect();
                    }
                    let values = (0..row.len())
                        .map(|i| row.try_get_unchecked::<Option<String>, _>(i))
                        .collect::<Result<Vec<_>, _>>()?;
                    outcome.rows.push(values);
                }
            }
        }
        std::mem::drop(stream);

        let kind = command_kind(sql);

        // Rows carry their own field metadata. A row-returning statement
        // which produced no rows must be described to learn its fields.
        if outcome.rows.is_empty() && returns_rows(&kind) {
            outcome.fields = self.describe(sql).await?;
        }
        outcome.command = rows_affected.map(|rows| CommandTag { kind, rows });

        Ok(outcome)
    }

    async fn close(self) -> Result<(), DriverError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Leading keyword of the (last) statement in `sql`, upper-cased, ignoring
/// whitespace and `--` line comments.
pub fn command_kind(sql: &str) -> String {
    let last = sql
        .trim_end()
        .trim_end_matches(';')
        .rsplit(';')
        .find(|stmt| !strip_comments(stmt).is_empty())
        .unwrap_or(sql);

    strip_comments(last)
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn strip_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        match sql.strip_prefix("--") {
            Some(rest) => sql = rest.split_once('\n').map(|(_, r)| r).unwrap_or(""),
            None => return sql,
        }
    }
}

fn returns_rows(kind: &str) -> bool {
    matches!(kind, "SELECT" | "WITH" | "VALUES" | "TABLE")
}
