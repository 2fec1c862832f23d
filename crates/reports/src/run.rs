use chrono::{DateTime, Utc};
use report_sql::{Arguments, Column, Value};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// AdditionalColumn is a column of a report table which isn't produced by
/// the report query, and is instead populated with a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalColumn {
    pub name: String,
    /// SQL type of the column, such as `TEXT` or `INTEGER`.
    pub type_name: String,
    #[serde(default = "null")]
    pub default: Value,
}

fn null() -> Value {
    Value::Null
}

impl AdditionalColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default: Value::Null,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }
}

/// RunError is the structured error recorded on a failed ReportRun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
}

impl From<&report_sql::Error> for RunError {
    fn from(err: &report_sql::Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// ReportRun describes one execution of a report query, and is persisted
/// as a row of the `qr_report_runs` registry.
///
/// A run's `report_table` is named for the report and a signature of its
/// columns, so that runs of a report which produce the same columns share
/// one table.
#[derive(Debug, Clone, Default)]
pub struct ReportRun {
    /// Assigned when the run is first persisted.
    pub id: Option<i64>,
    /// Logical name of the report.
    pub name: String,
    pub variant: Option<String>,
    pub description: String,
    /// Query template of the report.
    pub sql: String,
    pub arguments: Arguments,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nrows: Option<i64>,
    pub error: Option<RunError>,
    /// Fully substituted statement which populated this run's rows.
    pub raw_sql: Option<String>,

    base_columns: Vec<Column>,
    additional_columns: Vec<AdditionalColumn>,
    identity: OnceLock<Identity>,
}

#[derive(Debug, Clone)]
struct Identity {
    column_signature: String,
    report_table: String,
}

// Identifiers are kept short enough that index names derived from the
// report table (`<table>_i1`) remain within Postgres's 63-byte limit.
const MAX_TABLE_LEN: usize = 60;

impl ReportRun {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }
    pub fn with_additional_columns(mut self, columns: Vec<AdditionalColumn>) -> Self {
        self.set_additional_columns(columns);
        self
    }

    /// Columns produced by the report query, as inferred by the Materializer.
    pub fn base_columns(&self) -> &[Column] {
        &self.base_columns
    }
    pub fn set_base_columns(&mut self, columns: Vec<Column>) {
        self.base_columns = columns;
        self.identity = OnceLock::new();
    }

    pub fn additional_columns(&self) -> &[AdditionalColumn] {
        &self.additional_columns
    }
    pub fn set_additional_columns(&mut self, columns: Vec<AdditionalColumn>) {
        self.additional_columns = columns;
        self.identity = OnceLock::new();
    }

    /// Textual description of all columns of the report table: base columns
    /// as `[name, type]` followed by additional columns as
    /// `[name, type, default]`.
    pub fn columns(&self) -> Vec<Vec<String>> {
        let base = self
            .base_columns
            .iter()
            .map(|c| vec![c.name.clone(), c.type_name.clone()]);
        let additional = self.additional_columns.iter().map(|c| {
            vec![
                c.name.clone(),
                c.type_name.clone(),
                c.default.to_plain_text(),
            ]
        });
        base.chain(additional).collect()
    }

    /// Content hash of `columns()`, or "error" if base columns are unknown.
    pub fn column_signature(&self) -> &str {
        &self.identity().column_signature
    }

    /// Name of the table holding this run's rows.
    pub fn report_table(&self) -> &str {
        &self.identity().report_table
    }

    fn identity(&self) -> &Identity {
        self.identity.get_or_init(|| {
            let column_signature = column_signature(&self.columns(), self.base_columns.is_empty());
            let report_table = report_table(&self.name, &column_signature);
            Identity {
                column_signature,
                report_table,
            }
        })
    }

    // Restore the report table of a run loaded from the registry, which is
    // authoritative over a re-derived name.
    pub(crate) fn restore_report_table(&mut self, report_table: String) {
        let column_signature = column_signature(&self.columns(), self.base_columns.is_empty());
        self.identity = OnceLock::from(Identity {
            column_signature,
            report_table,
        });
    }
}

fn column_signature(columns: &[Vec<String>], unknown: bool) -> String {
    if unknown {
        return "error".to_string();
    }
    // Serializing a list of strings cannot fail.
    let doc = serde_json::to_string(columns).unwrap_or_default();
    let digest = md5::compute(doc.as_bytes());

    base64::encode(digest.0)
        .trim_end_matches('=')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn report_table(name: &str, column_signature: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    let suffix = format!("_{}", sanitize(column_signature));
    let mut table = sanitize(name);

    // Sanitized text is ASCII, so any length is a char boundary.
    table.truncate(MAX_TABLE_LEN.saturating_sub(suffix.len()));
    table.push_str(&suffix);
    table
}

#[cfg(test)]
mod test {
    use super::*;

    fn users_run() -> ReportRun {
        let mut run = ReportRun::new("users/by-name", "SELECT * FROM users");
        run.set_base_columns(vec![
            Column::new("qr_run_id", "INT4"),
            Column::new("qr_run_row", "INT8"),
            Column::new("id", "INT4"),
            Column::new("name", "VARCHAR"),
        ]);
        run
    }

    #[test]
    fn identity_is_derived_from_name_and_columns() {
        let run = users_run();

        insta::assert_snapshot!(run.column_signature(), @"bkhu2wtj5ua_nbxnrrxkag");
        assert_eq!(
            run.report_table(),
            format!("users_by_name_{}", run.column_signature())
        );

        // Same name and columns, same identity.
        let other = users_run().arg("ignored", 1);
        assert_eq!(other.report_table(), run.report_table());

        // Different columns, different identity.
        let mut other = users_run();
        other.set_additional_columns(vec![AdditionalColumn::new("note", "TEXT")]);
        assert_ne!(other.column_signature(), run.column_signature());

        // Defaults are part of the signature.
        let with_default = users_run().with_additional_columns(vec![
            AdditionalColumn::new("note", "TEXT").with_default("hello"),
        ]);
        assert_ne!(with_default.column_signature(), other.column_signature());
    }

    #[test]
    fn type_modifiers_distinguish_tables() {
        let with_code = |type_name: &str, modifier: i32| {
            let mut run = ReportRun::new("codes", "SELECT code FROM t");
            run.set_base_columns(vec![
                Column::new("qr_run_id", "integer"),
                Column::new("code", type_name).with_type_modifier(modifier),
            ]);
            run
        };
        let short = with_code("character varying(3)", 7);
        let long = with_code("character varying(20)", 24);

        assert_ne!(short.report_table(), long.report_table());
        assert_eq!(short.columns()[1], vec!["code", "character varying(3)"]);
    }

    #[test]
    fn columns_listing() {
        let run = users_run().with_additional_columns(vec![
            AdditionalColumn::new("a", "TEXT"),
            AdditionalColumn::new("b", "INTEGER").with_default(42),
        ]);
        insta::assert_snapshot!(
            serde_json::to_string(&run.columns()).unwrap(),
            @r###"[["qr_run_id","INT4"],["qr_run_row","INT8"],["id","INT4"],["name","VARCHAR"],["a","TEXT",""],["b","INTEGER","42"]]"###
        );
    }

    #[test]
    fn unknown_columns_have_an_error_signature() {
        let run = ReportRun::new("Broken Report", "SELECT nope");
        assert_eq!(run.column_signature(), "error");
        assert_eq!(run.report_table(), "broken_report_error");
    }

    #[test]
    fn reassigning_columns_invalidates_identity() {
        let mut run = ReportRun::new("r", "SELECT 1");
        assert_eq!(run.report_table(), "r_error");

        run.set_base_columns(vec![Column::new("x", "INT4")]);
        assert_ne!(run.report_table(), "r_error");
    }

    #[test]
    fn long_names_are_truncated() {
        let mut run = ReportRun::new("a".repeat(100), "SELECT 1");
        run.set_base_columns(vec![Column::new("x", "INT4")]);

        let table = run.report_table();
        assert_eq!(table.len(), MAX_TABLE_LEN);
        assert!(table.ends_with(&format!("_{}", run.column_signature())));
    }

    #[test]
    fn errors_are_structured() {
        let err = report_sql::Error::Integrity("cannot determine nrows".to_string());
        let run_err = RunError::from(&err);

        insta::assert_snapshot!(
            serde_json::to_string(&run_err).unwrap(),
            @r###"{"kind":"IntegrityError","message":"cannot determine nrows"}"###
        );
    }
}
