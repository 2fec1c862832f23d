use super::data::{select, SelectOptions};
use super::{store, ReportRun, RunError};
use futures::FutureExt;
use report_sql::{Column, Connection, Driver, Error, PgDriver, Result, RunOptions, Sql, Value};

/// Stage of the materialization protocol reached by a Materializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    /// The per-run row sequence was created.
    SequenceReady,
    /// Result columns of the report query were inferred, or inferring them
    /// failed.
    ColumnsKnown,
    /// The run was inserted into (or updated within) the registry.
    RunPersisted,
    /// Rows were written to the report table, or writing them failed.
    TableResolved,
    /// The registry holds the final outcome of the run.
    Finalized,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::SequenceReady => "sequence-ready",
            Stage::ColumnsKnown => "columns-known",
            Stage::RunPersisted => "run-persisted",
            Stage::TableResolved => "table-resolved",
            Stage::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

lazy_static::lazy_static! {
    // Whitespace and comments, followed by the query's leading keyword.
    static ref LEADING_KEYWORD_RE: regex::Regex =
        regex::Regex::new(r"(?is)^(?:\s+|--[^\n]*(?:\n|\z)|/\*.*?\*/)*(SELECT|WITH)\b").unwrap();
}

/// Materializer runs report queries into report tables, recording each
/// run in the `qr_report_runs` registry.
///
/// A failure of the report query itself is recorded as the run's error,
/// and the run is still persisted. Errors of the registry or connection
/// are returned.
pub struct Materializer<'c, D: Driver = PgDriver> {
    conn: &'c mut Connection<D>,
    verbose: bool,
    stage: Stage,
}

impl<'c, D: Driver> Materializer<'c, D> {
    pub fn new(conn: &'c mut Connection<D>) -> Self {
        Self {
            conn,
            verbose: false,
            stage: Stage::Init,
        }
    }

    /// Log prepared statements of the run at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Stage reached by the most recent run.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Materialize `run`, leaving it updated with its id, columns, row
    /// count, and error.
    #[tracing::instrument(skip_all, fields(report = %run.name))]
    pub async fn run(&mut self, run: &mut ReportRun) -> Result<()> {
        self.stage = Stage::Init;

        let now = chrono::Utc::now();
        run.created_at.get_or_insert(now);
        run.started_at = Some(now);
        run.finished_at = None;
        run.nrows = None;
        run.error = None;
        run.raw_sql = None;

        // Rows of an earlier materialization of this run are replaced.
        let previous = run.id.map(|id| (id, run.report_table().to_string()));
        run.set_base_columns(Vec::new());

        let sequence = format!("qr_row_seq_{}", uuid::Uuid::new_v4().simple());
        self.create_sequence(&sequence).await?;
        self.advance(Stage::SequenceReady, run);

        let rewritten = match rewrite(&run.sql, &sequence) {
            Ok(rewritten) => {
                self.infer_columns(run, &rewritten).await?;
                rewritten
            }
            Err(err) => {
                self.record(run, &err);
                String::new()
            }
        };
        self.advance(Stage::ColumnsKnown, run);

        if let Err(err) = self.persist(run, previous).await {
            self.drop_sequence(&sequence).await;
            return Err(err);
        }
        self.advance(Stage::RunPersisted, run);

        if run.error.is_none() {
            if let Err(err) = self.resolve_table(run, &rewritten).await {
                self.record(run, &err);
            }
        }
        self.advance(Stage::TableResolved, run);

        if run.nrows.is_none() && run.error.is_none() {
            if let Err(err) = self.count_rows(run).await {
                self.record(run, &err);
            }
        }
        self.drop_sequence(&sequence).await;

        run.finished_at = Some(chrono::Utc::now());
        self.finalize(run).await?;
        self.advance(Stage::Finalized, run);

        Ok(())
    }

    fn advance(&mut self, stage: Stage, run: &ReportRun) {
        self.stage = stage;
        tracing::debug!(%stage, id = ?run.id, error = ?run.error, "report run advanced");
    }

    fn record(&self, run: &mut ReportRun, err: &Error) {
        tracing::warn!(stage = %self.stage, id = ?run.id, error = %err, "report run failed");
        run.error = Some(RunError::from(err));
    }

    fn options(&self) -> RunOptions {
        RunOptions::new().verbose(self.verbose)
    }

    async fn create_sequence(&mut self, sequence: &str) -> Result<()> {
        let sequence = self.conn.identifier(sequence)?;
        self.conn
            .run(&format!("CREATE TEMPORARY SEQUENCE {sequence}"), &self.options())
            .await?;
        Ok(())
    }

    async fn drop_sequence(&mut self, sequence: &str) {
        let dropped = match self.conn.identifier(sequence) {
            Ok(sequence) => self
                .conn
                .run(
                    &format!("DROP SEQUENCE IF EXISTS {sequence}"),
                    &self.options().capture_error(),
                )
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = dropped {
            tracing::warn!(%sequence, error = %err, "failed to drop row sequence");
        }
    }

    // Infer the result columns of the report query from an empty temporary
    // table created by it, so that types carry their modifiers.
    async fn infer_columns(&mut self, run: &mut ReportRun, rewritten: &str) -> Result<()> {
        let shape = format!("qr_shape_{}", uuid::Uuid::new_v4().simple());
        let shape_table = self.conn.identifier(&shape)?;

        let options = self
            .options()
            .args(&run.arguments)
            .arg("qr_run_id", Value::Null)
            .limit(0)
            .capture_error();

        let created = match self
            .conn
            .run(&format!("CREATE TEMPORARY TABLE {shape_table} AS {rewritten}"), &options)
            .await
        {
            Ok(created) => created,
            Err(err @ (Error::Driver(_) | Error::Template(_) | Error::Escape { .. })) => {
                self.record(run, &err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = created.into_result() {
            self.record(run, &err);
            return Ok(());
        }

        let columns = self
            .conn
            .run(
                COLUMN_TYPES,
                &self.options().arg("relation", shape.as_str()).capture_error(),
            )
            .await
            .and_then(|result| result.into_result())
            .and_then(|result| parse_column_types(&result));

        let dropped = self
            .conn
            .run(
                &format!("DROP TABLE IF EXISTS {shape_table}"),
                &self.options().capture_error(),
            )
            .await
            .and_then(|result| result.into_result());
        if let Err(err) = dropped {
            tracing::warn!(%shape, error = %err, "failed to drop column shape table");
        }

        match columns {
            Ok(columns) if columns.is_empty() => self.record(
                run,
                &Error::Integrity(format!("report query of {:?} has no columns", run.name)),
            ),
            Ok(columns) => run.set_base_columns(columns),
            Err(err) => self.record(run, &err),
        }
        Ok(())
    }

    async fn persist(&mut self, run: &mut ReportRun, previous: Option<(i64, String)>) -> Result<()> {
        self.conn
            .transaction_with(run, move |conn, run| {
                async move {
                    if run.id.is_none() {
                        store::insert(conn, run).await?;
                    } else {
                        store::update(conn, run, RESTATED_COLUMNS).await?;
                    }
                    if let Some((id, table)) = previous {
                        store::release_table(conn, &table, id).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn resolve_table(&mut self, run: &mut ReportRun, rewritten: &str) -> Result<()> {
        let rewritten = rewritten.to_string();
        let verbose = self.verbose;

        self.conn
            .transaction_with(run, move |conn, run| {
                async move {
                    let table_name = run.report_table().to_string();
                    let table = conn.identifier(&table_name)?;

                    let options = RunOptions::new()
                        .verbose(verbose)
                        .args(&run.arguments)
                        .arg("qr_run_id", store::persisted_id(run)?)
                        .capture_error();

                    if !conn.table_exists(&table_name).await? {
                        let result = conn
                            .run(&format!("CREATE TABLE {table} AS {rewritten}"), &options)
                            .await?;
                        run.raw_sql = Some(result.prepared_sql.clone());
                        result.into_result()?;

                        create_indexes(conn, &table_name).await?;
                        add_columns(conn, run, &table).await?;
                    } else {
                        let names = column_names(conn, run.base_columns())?;
                        let result = conn
                            .run(
                                &format!("INSERT INTO {table} ( {names} ) {rewritten}"),
                                &options,
                            )
                            .await?;
                        run.raw_sql = Some(result.prepared_sql.clone());
                        let result = result.into_result()?;

                        run.nrows = match &result.command {
                            Some(tag) if tag.kind == "INSERT" => Some(tag.rows as i64),
                            other => {
                                return Err(Error::Integrity(format!(
                                    "insert into {table_name} returned unexpected command tag {other:?}"
                                )))
                            }
                        };
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn count_rows(&mut self, run: &mut ReportRun) -> Result<()> {
        let verbose = self.verbose;

        let nrows = self
            .conn
            .transaction_with(run, move |conn, run| {
                async move {
                    let mut options = SelectOptions::default()
                        .columns(r#"COUNT(*) AS "nrows""#)
                        .unordered();
                    options.verbose = verbose;

                    select(conn, run, &options).await?.scalar()
                }
                .boxed()
            })
            .await?;

        run.nrows = Some(nrows.and_then(|n| n.as_i64()).ok_or_else(|| {
            Error::Integrity(format!(
                "cannot determine the number of rows of report run {:?}",
                run.id
            ))
        })?);
        Ok(())
    }

    async fn finalize(&mut self, run: &mut ReportRun) -> Result<()> {
        self.conn
            .transaction_with(run, |conn, run| {
                async move { store::update(conn, run, FINALIZED_COLUMNS).await }.boxed()
            })
            .await
    }
}

// Formatted types of the columns of table `:relation`, in table order.
const COLUMN_TYPES: &str = r#"SELECT attname AS "name", format_type(atttypid, atttypmod) AS "type_name", atttypmod AS "type_modifier" FROM pg_catalog.pg_attribute WHERE attrelid = CAST(:relation AS regclass) AND attnum > 0 AND NOT attisdropped ORDER BY attnum"#;

fn parse_column_types(result: &report_sql::QueryResult) -> Result<Vec<Column>> {
    result
        .rows()?
        .iter()
        .map(|row| {
            let text = |column: &str| {
                row.get(column)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Integrity(format!("column type is missing {column}")))
            };
            let mut column = Column::new(text("name")?, text("type_name")?);

            // Postgres reports -1 for types without a modifier.
            match row.get("type_modifier").and_then(Value::as_i64) {
                Some(modifier) if modifier >= 0 => {
                    column = column.with_type_modifier(modifier as i32);
                }
                _ => (),
            }
            Ok(column)
        })
        .collect()
}

// Registry columns written when re-running an already persisted run.
const RESTATED_COLUMNS: &[&str] = &[
    "sql",
    "arguments",
    "base_columns",
    "additional_columns",
    "report_table",
    "error",
    "raw_sql",
    "started_at",
    "finished_at",
    "nrows",
];
const FINALIZED_COLUMNS: &[&str] = &["nrows", "finished_at", "error", "raw_sql"];

/// Rewrite report query `sql` to lead with the run id and row sequence
/// columns of every report table. `sequence` must be a plain identifier.
///
/// Leading comments are dropped. A query beginning with `WITH` is wrapped
/// as a sub-query, while one beginning with `SELECT` is extended in place.
pub fn rewrite(sql: &str, sequence: &str) -> Result<String> {
    let Some(captures) = LEADING_KEYWORD_RE.captures(sql) else {
        return Err(Error::Template(format!(
            "report queries must begin with SELECT or WITH: {:?}",
            sql.trim_start().chars().take(32).collect::<String>()
        )));
    };
    let leading = format!(
        r#"SELECT CAST(:qr_run_id AS integer) AS "qr_run_id", nextval('{sequence}') AS "qr_run_row""#
    );

    let (all, keyword) = (&captures[0], &captures[1]);
    if keyword.eq_ignore_ascii_case("SELECT") {
        Ok(format!("{leading}, {}", sql[all.len()..].trim_start()))
    } else {
        let query = sql[all.len() - keyword.len()..].trim_end().trim_end_matches(';');
        Ok(format!("{leading}, \"qr_report\".* FROM (\n{query}\n) AS \"qr_report\""))
    }
}

async fn create_indexes<D: Driver>(conn: &mut Connection<D>, table_name: &str) -> Result<()> {
    let table = conn.identifier(table_name)?;

    for (suffix, unique, columns) in [
        ("i1", "", "qr_run_id"),
        ("i2", "", "qr_run_row"),
        ("i3", "UNIQUE ", "qr_run_id, qr_run_row"),
    ] {
        let index = conn.identifier(&format!("{table_name}_{suffix}"))?;
        conn.run(
            &format!("CREATE {unique}INDEX {index} ON {table} ({columns})"),
            &RunOptions::default(),
        )
        .await?;
    }
    Ok(())
}

async fn add_columns<D: Driver>(conn: &mut Connection<D>, run: &ReportRun, table: &Sql) -> Result<()> {
    for column in run.additional_columns() {
        let name = conn.identifier(&column.name)?;
        conn.run(
            &format!(
                "ALTER TABLE {table} ADD COLUMN {name} {} DEFAULT :default",
                column.type_name
            ),
            &RunOptions::new().arg("default", column.default.clone()),
        )
        .await?;
    }
    Ok(())
}

fn column_names<D: Driver>(conn: &Connection<D>, columns: &[Column]) -> Result<String> {
    let names = columns
        .iter()
        .map(|c| conn.identifier(&c.name).map(|n| n.to_string()))
        .collect::<Result<Vec<_>>>()?;
    Ok(names.join(", "))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::AdditionalColumn;
    use report_sql::testing::{rows, tag, ScriptedDriver};
    use report_sql::DriverError;

    const TYPE_FIELDS: &[(&str, &str)] = &[
        ("name", "NAME"),
        ("type_name", "TEXT"),
        ("type_modifier", "INT4"),
    ];

    fn column_types(types: &[(&str, &str, &str)]) -> report_sql::Outcome {
        rows(
            TYPE_FIELDS,
            types
                .iter()
                .map(|(name, type_name, modifier)| {
                    vec![Some(*name), Some(*type_name), Some(*modifier)]
                })
                .collect(),
        )
    }

    // Script the column types and registry insert. Rules scripted before
    // this take precedence.
    fn script(driver: &ScriptedDriver) -> Connection<ScriptedDriver> {
        driver.on(
            "pg_attribute",
            column_types(&[
                ("qr_run_id", "integer", "-1"),
                ("qr_run_row", "bigint", "-1"),
                ("id", "integer", "-1"),
                ("name", "text", "-1"),
            ]),
        );
        driver.on(
            "^INSERT INTO qr_report_runs",
            rows(&[("id", "INT4")], vec![vec![Some("5")]]),
        );
        Connection::new(driver.clone())
    }

    #[test]
    fn queries_are_rewritten() {
        insta::assert_snapshot!(
            rewrite("\n  select id, name FROM users", "qr_row_seq_abc").unwrap(),
            @r###"SELECT CAST(:qr_run_id AS integer) AS "qr_run_id", nextval('qr_row_seq_abc') AS "qr_run_row", id, name FROM users"###
        );
        // Leading comments are skipped.
        insta::assert_snapshot!(
            rewrite("-- users by id\n/* all of them,\n   really */ SELECT id FROM users", "s").unwrap(),
            @r###"SELECT CAST(:qr_run_id AS integer) AS "qr_run_id", nextval('s') AS "qr_run_row", id FROM users"###
        );
        // Common table expressions are wrapped.
        insta::assert_snapshot!(
            rewrite("/* adults */\nWITH a AS (SELECT id FROM users) SELECT id FROM a;\n", "s").unwrap(),
            @r###"
        SELECT CAST(:qr_run_id AS integer) AS "qr_run_id", nextval('s') AS "qr_run_row", "qr_report".* FROM (
        WITH a AS (SELECT id FROM users) SELECT id FROM a
        ) AS "qr_report"
        "###
        );
        assert_eq!(
            rewrite("DELETE FROM users", "seq").unwrap_err().kind(),
            "TemplateError"
        );
        assert!(rewrite("SELECTED", "seq").is_err());
        assert!(rewrite("-- SELECT\nDELETE FROM users", "seq").is_err());
    }

    #[tokio::test]
    async fn runs_create_missing_tables() {
        let driver = ScriptedDriver::new();
        let mut conn = script(&driver);
        driver.on("COUNT", rows(&[("nrows", "INT8")], vec![vec![Some("3")]]));

        let mut run = ReportRun::new("users", "SELECT id, name FROM users WHERE id >= :min")
            .arg("min", 2)
            .with_additional_columns(vec![
                AdditionalColumn::new("note", "TEXT").with_default("hi")
            ]);

        let mut materializer = Materializer::new(&mut conn);
        materializer.run(&mut run).await.unwrap();
        assert_eq!(materializer.stage(), Stage::Finalized);

        assert_eq!(run.id, Some(5));
        assert_eq!(run.nrows, Some(3));
        assert_eq!(run.error, None);
        assert_eq!(run.base_columns().len(), 4);
        assert!(run.finished_at.is_some());

        let table = run.report_table().to_string();
        let log = driver.log();
        let log: Vec<&str> = log.iter().map(String::as_str).collect();

        assert!(log[0].starts_with(r#"CREATE TEMPORARY SEQUENCE "qr_row_seq_"#));
        assert!(log[1].starts_with(r#"CREATE TEMPORARY TABLE "qr_shape_"#));
        assert!(log[1].contains(" AS SELECT CAST(NULL AS integer)"));
        assert!(log[1].ends_with("FROM users WHERE id >= 2\nLIMIT 0"));
        assert!(log[2].contains("FROM pg_catalog.pg_attribute WHERE attrelid = CAST('qr_shape_"));
        assert!(log[3].starts_with(r#"DROP TABLE IF EXISTS "qr_shape_"#));
        assert_eq!(log[4], "BEGIN");
        assert!(log[5].starts_with("INSERT INTO qr_report_runs"));
        assert_eq!(log[6], "COMMIT");
        assert_eq!(log[7], "BEGIN");
        assert!(log[8].contains("pg_tables"));
        assert!(log[9].starts_with(&format!(
            "CREATE TABLE \"{table}\" AS SELECT CAST(5 AS integer)"
        )));
        assert_eq!(
            log[10..13].to_vec(),
            vec![
                format!(r#"CREATE INDEX "{table}_i1" ON "{table}" (qr_run_id)"#),
                format!(r#"CREATE INDEX "{table}_i2" ON "{table}" (qr_run_row)"#),
                format!(r#"CREATE UNIQUE INDEX "{table}_i3" ON "{table}" (qr_run_id, qr_run_row)"#),
            ]
        );
        assert_eq!(
            log[13],
            format!(r#"ALTER TABLE "{table}" ADD COLUMN "note" TEXT DEFAULT 'hi'"#)
        );
        assert_eq!(&log[14..16], &["COMMIT", "BEGIN"]);
        assert_eq!(
            log[16],
            format!(r#"SELECT COUNT(*) AS "nrows" FROM "{table}" WHERE qr_run_id = 5"#)
        );
        assert_eq!(log[17], "COMMIT");
        assert!(log[18].starts_with(r#"DROP SEQUENCE IF EXISTS "qr_row_seq_"#));
        assert_eq!(log[19], "BEGIN");
        assert!(log[20].starts_with(r#"UPDATE qr_report_runs SET "nrows" = 3, "finished_at" = '"#));
        assert_eq!(log[21], "COMMIT");
        assert_eq!(log.len(), 22);

        assert_eq!(run.raw_sql.as_deref(), Some(log[9]));
    }

    #[tokio::test]
    async fn runs_append_to_existing_tables() {
        let driver = ScriptedDriver::new();
        let mut conn = script(&driver);
        driver.on("pg_tables", rows(&[("exists", "BOOL")], vec![vec![Some("t")]]));
        driver.on(r#"^INSERT INTO "users_"#, tag("INSERT", 7));

        let mut run = ReportRun::new("users", "SELECT id, name FROM users");
        Materializer::new(&mut conn).run(&mut run).await.unwrap();

        assert_eq!(run.nrows, Some(7));
        assert_eq!(run.error, None);

        let log = driver.log();
        let insert = log
            .iter()
            .find(|stmt| stmt.starts_with(r#"INSERT INTO "users_"#))
            .unwrap();
        assert!(insert.contains(r#"( "qr_run_id", "qr_run_row", "id", "name" ) SELECT CAST(5 AS integer)"#));
        assert_eq!(run.raw_sql.as_ref(), Some(insert));
        assert!(!log.iter().any(|stmt| stmt.contains("COUNT(*)")), "{log:#?}");
    }

    #[tokio::test]
    async fn query_errors_are_recorded() {
        let driver = ScriptedDriver::new();
        driver.fail(
            "^CREATE TEMPORARY TABLE .* nope ",
            DriverError::database(r#"column "nope" does not exist"#),
        );
        let mut conn = script(&driver);

        let mut run = ReportRun::new("broken", "SELECT nope FROM users");
        Materializer::new(&mut conn).run(&mut run).await.unwrap();

        let error = run.error.clone().unwrap();
        assert_eq!(error.kind, "DriverError");
        assert!(error.message.contains("nope"));
        assert_eq!(run.id, Some(5));
        assert_eq!(run.report_table(), "broken_error");
        assert_eq!(run.nrows, None);

        let log = driver.log();
        assert!(!log.iter().any(|stmt| stmt.starts_with("CREATE TABLE")), "{log:#?}");
        assert!(log[log.len() - 2].starts_with("UPDATE qr_report_runs"));
        assert!(log[log.len() - 2].contains(r#""error" = '{"kind":"DriverError""#));
    }

    #[tokio::test]
    async fn unexpected_command_tags_are_integrity_errors() {
        let driver = ScriptedDriver::new();
        let mut conn = script(&driver);
        driver.on("pg_tables", rows(&[("exists", "BOOL")], vec![vec![Some("t")]]));
        driver.on(r#"^INSERT INTO "users_"#, tag("SELECT", 7));

        let mut run = ReportRun::new("users", "SELECT id, name FROM users");
        Materializer::new(&mut conn).run(&mut run).await.unwrap();

        assert_eq!(run.error.as_ref().map(|e| e.kind.as_str()), Some("IntegrityError"));
        assert_eq!(run.nrows, None);

        // The table stage was aborted, but the run was still finalized.
        let log = driver.log();
        assert!(log.iter().any(|stmt| stmt == "ABORT"), "{log:#?}");
        assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn registry_failures_are_returned() {
        let driver = ScriptedDriver::new();
        driver.fail(
            "^INSERT INTO qr_report_runs",
            DriverError::database(r#"relation "qr_report_runs" does not exist"#),
        );
        let mut conn = script(&driver);

        let mut run = ReportRun::new("users", "SELECT id, name FROM users");
        let mut materializer = Materializer::new(&mut conn);
        let err = materializer.run(&mut run).await.unwrap_err();

        assert_eq!(err.kind(), "DriverError");
        assert_eq!(materializer.stage(), Stage::ColumnsKnown);

        let log = driver.log();
        assert_eq!(log[log.len() - 2], "ABORT");
        assert!(log[log.len() - 1].starts_with("DROP SEQUENCE IF EXISTS"));
    }

    #[tokio::test]
    async fn column_types_carry_modifiers() {
        let materialize = |length: &'static str, modifier: &'static str| async move {
            let driver = ScriptedDriver::new();
            driver.on(
                "pg_attribute",
                column_types(&[
                    ("qr_run_id", "integer", "-1"),
                    ("qr_run_row", "bigint", "-1"),
                    ("code", length, modifier),
                ]),
            );
            driver.on("COUNT", rows(&[("nrows", "INT8")], vec![vec![Some("1")]]));
            let mut conn = script(&driver);

            let mut run = ReportRun::new("codes", "SELECT code FROM t");
            Materializer::new(&mut conn).run(&mut run).await.unwrap();
            run
        };

        let short = materialize("character varying(3)", "7").await;
        let long = materialize("character varying(20)", "24").await;

        assert_eq!(short.error, None);
        assert_eq!(
            short.base_columns()[2],
            Column::new("code", "character varying(3)").with_type_modifier(7)
        );
        assert_eq!(short.base_columns()[0], Column::new("qr_run_id", "integer"));
        assert_ne!(short.report_table(), long.report_table());
    }

    #[tokio::test]
    async fn queries_without_columns_are_integrity_errors() {
        let driver = ScriptedDriver::new();
        driver.on("pg_attribute", column_types(&[]));
        let mut conn = script(&driver);

        let mut run = ReportRun::new("users", "SELECT id FROM users");
        Materializer::new(&mut conn).run(&mut run).await.unwrap();

        assert_eq!(run.error.as_ref().map(|e| e.kind.as_str()), Some("IntegrityError"));
        assert_eq!(run.report_table(), "users_error");
    }

    #[tokio::test]
    async fn unsupported_queries_are_recorded() {
        let driver = ScriptedDriver::new();
        let mut conn = script(&driver);

        let mut run = ReportRun::new("purge", "DELETE FROM users");
        let mut materializer = Materializer::new(&mut conn);
        materializer.run(&mut run).await.unwrap();
        assert_eq!(materializer.stage(), Stage::Finalized);

        let error = run.error.clone().unwrap();
        assert_eq!(error.kind, "TemplateError");
        assert_eq!(run.id, Some(5));
        assert_eq!(run.nrows, None);
        assert!(run.finished_at.is_some());

        let log = driver.log();
        assert!(
            !log.iter().any(|stmt| stmt.contains("TABLE") && !stmt.starts_with("INSERT")),
            "{log:#?}"
        );
        assert!(log.iter().any(|stmt| stmt.starts_with("INSERT INTO qr_report_runs")
            && stmt.contains(r#"'{"kind":"TemplateError""#)));
        assert!(log[log.len() - 2].starts_with("UPDATE qr_report_runs"));
    }

    #[tokio::test]
    async fn reruns_replace_earlier_rows() {
        let driver = ScriptedDriver::new();
        driver.on("pg_tables", rows(&[("exists", "BOOL")], vec![vec![Some("t")]]));
        driver.on(r#"^DELETE FROM "users_"#, tag("DELETE", 7));
        driver.on("COUNT", rows(&[("count", "INT8")], vec![vec![Some("1")]]));
        driver.on(r#"^INSERT INTO "users_"#, tag("INSERT", 7));
        let mut conn = script(&driver);

        let mut run = ReportRun::new("users", "SELECT id, name FROM users");
        Materializer::new(&mut conn).run(&mut run).await.unwrap();
        let table = run.report_table().to_string();
        let first = driver.log().len();

        // Running the persisted run again restates it, replacing its rows.
        Materializer::new(&mut conn).run(&mut run).await.unwrap();
        assert_eq!(run.error, None);
        assert_eq!(run.id, Some(5));
        assert_eq!(run.nrows, Some(7));
        assert_eq!(run.report_table(), table);

        let log = driver.log();
        let log: Vec<&str> = log[first..].iter().map(String::as_str).collect();
        let position = |prefix: &str| {
            log.iter()
                .position(|stmt| stmt.starts_with(prefix))
                .unwrap_or_else(|| panic!("no {prefix:?} in {log:#?}"))
        };

        let restated = position("UPDATE qr_report_runs SET \"sql\"");
        let released = position(&format!("DELETE FROM \"{table}\" WHERE qr_run_id = 5"));
        let inserted = position(&format!("INSERT INTO \"{table}\""));

        assert!(restated < released && released < inserted, "{log:#?}");
        assert!(!log.iter().any(|stmt| stmt.starts_with("INSERT INTO qr_report_runs")));
        assert!(!log.iter().any(|stmt| stmt.starts_with("DROP TABLE IF EXISTS \"users_")));
    }

    #[tokio::test]
    async fn connection_failures_are_returned() {
        let driver = ScriptedDriver::new();
        driver.fail(
            "SEQUENCE",
            DriverError::connection("server closed the connection unexpectedly"),
        );
        let mut conn = Connection::new(driver.clone());

        let mut run = ReportRun::new("users", "SELECT 1");
        let err = Materializer::new(&mut conn).run(&mut run).await.unwrap_err();

        assert_eq!(err.kind(), "DriverError");
        assert!(conn.is_invalid());
        assert_eq!(run.id, None);
    }
}
