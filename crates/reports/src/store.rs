use super::{AdditionalColumn, ReportRun, RunError};
use futures::FutureExt;
use report_sql::{Arguments, Column, Connection, Driver, Error, Result, Row, RunOptions, Value};

/// DDL of the `qr_report_runs` registry of report runs.
pub const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS qr_report_runs_pkey;
CREATE TABLE IF NOT EXISTS qr_report_runs (
    id                 INTEGER PRIMARY KEY DEFAULT nextval('qr_report_runs_pkey')
  , name               VARCHAR(255) NOT NULL
  , variant            VARCHAR(255)
  , sql                TEXT NOT NULL
  , description        TEXT NOT NULL
  , arguments          TEXT NOT NULL
  , base_columns       TEXT NOT NULL
  , additional_columns TEXT NOT NULL
  , report_table       VARCHAR(255) NOT NULL
  , error              TEXT
  , raw_sql            TEXT
  , created_at         TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
  , started_at         TIMESTAMP WITH TIME ZONE
  , finished_at        TIMESTAMP WITH TIME ZONE
  , nrows              INTEGER
);
CREATE INDEX IF NOT EXISTS qr_report_runs__name ON qr_report_runs (name);
CREATE INDEX IF NOT EXISTS qr_report_runs__report_table ON qr_report_runs (report_table);
CREATE INDEX IF NOT EXISTS qr_report_runs__created_at ON qr_report_runs (created_at);
"#;

/// Create the report run registry, if it doesn't already exist.
pub async fn install_schema<D: Driver>(conn: &mut Connection<D>) -> Result<()> {
    conn.run(SCHEMA, &RunOptions::default()).await?;
    Ok(())
}

/// Persisted columns of `run`, and their values.
pub fn values(run: &ReportRun) -> Result<Arguments> {
    let error = match &run.error {
        Some(error) => Value::Text(serde_json::to_string(error)?),
        None => Value::Null,
    };
    let created_at = match run.created_at {
        Some(ts) => ts.into(),
        None => Value::sql("now()"),
    };

    let columns: [(&str, Value); 14] = [
        ("name", run.name.clone().into()),
        ("variant", run.variant.clone().into()),
        ("sql", run.sql.clone().into()),
        ("description", run.description.clone().into()),
        ("arguments", serde_json::to_string(&run.arguments)?.into()),
        ("base_columns", serde_json::to_string(run.base_columns())?.into()),
        (
            "additional_columns",
            serde_json::to_string(run.additional_columns())?.into(),
        ),
        ("report_table", run.report_table().into()),
        ("error", error),
        ("raw_sql", run.raw_sql.clone().into()),
        ("created_at", created_at),
        ("started_at", run.started_at.into()),
        ("finished_at", run.finished_at.into()),
        ("nrows", run.nrows.into()),
    ];

    Ok(columns
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect())
}

/// Insert `run` into the registry, assigning its id.
pub async fn insert<D: Driver>(conn: &mut Connection<D>, run: &mut ReportRun) -> Result<i64> {
    if let Some(id) = run.id {
        return Err(Error::State(format!("report run {id} is already persisted")));
    }
    let result = conn
        .run(
            "INSERT INTO qr_report_runs ( :NAMES ) VALUES ( :VALUES ) RETURNING id",
            &RunOptions::new().names_and_values(values(run)?),
        )
        .await?;

    let id = result
        .scalar()?
        .and_then(|id| id.as_i64())
        .ok_or_else(|| Error::Integrity("insert of report run returned no id".to_string()))?;

    run.id = Some(id);
    Ok(id)
}

/// Update persisted `columns` of `run` to its current values.
pub async fn update<D: Driver>(
    conn: &mut Connection<D>,
    run: &ReportRun,
    columns: &[&str],
) -> Result<()> {
    let id = persisted_id(run)?;
    let mut all = values(run)?;

    let mut selected = Arguments::new();
    for column in columns {
        let value = all.swap_remove(*column).ok_or_else(|| {
            Error::State(format!("{column:?} is not a column of qr_report_runs"))
        })?;
        selected.insert(column.to_string(), value);
    }

    conn.run(
        "UPDATE qr_report_runs SET :SET_VALUES WHERE id = :qr_run_id",
        &RunOptions::new()
            .arg("qr_run_id", id)
            .names_and_values(selected),
    )
    .await?;

    Ok(())
}

/// Load the report run having `id`, if there is one.
pub async fn find<D: Driver>(conn: &mut Connection<D>, id: i64) -> Result<Option<ReportRun>> {
    let result = conn
        .run(
            "SELECT * FROM qr_report_runs WHERE id = :id",
            &RunOptions::new().arg("id", id),
        )
        .await?;

    match result.rows()?.first() {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// Delete the data rows of `run`, returning the number deleted.
pub async fn truncate<D: Driver>(conn: &mut Connection<D>, run: &ReportRun) -> Result<u64> {
    let id = persisted_id(run)?;
    let table = conn.identifier(run.report_table())?;

    let result = conn
        .run(
            &format!("DELETE FROM {table} WHERE qr_run_id = :qr_run_id"),
            &RunOptions::new().arg("qr_run_id", id),
        )
        .await?;

    Ok(result.affected_rows().unwrap_or_default())
}

/// Delete `run` and its data rows. Its report table is dropped if no other
/// run still uses it.
pub async fn delete<D: Driver>(conn: &mut Connection<D>, run: &ReportRun) -> Result<()> {
    let id = persisted_id(run)?;
    let table = run.report_table().to_string();

    conn.transaction(move |conn| {
        async move {
            conn.run(
                "DELETE FROM qr_report_runs WHERE id = :qr_run_id",
                &RunOptions::new().arg("qr_run_id", id),
            )
            .await?;

            release_table(conn, &table, id).await
        }
        .boxed()
    })
    .await
}

/// Delete the rows of run `id` from `table`, and drop `table` if no run of
/// the registry still references it. A missing table is ignored.
pub async fn release_table<D: Driver>(
    conn: &mut Connection<D>,
    table: &str,
    id: i64,
) -> Result<()> {
    if !conn.table_exists(table).await? {
        return Ok(());
    }
    let ident = conn.identifier(table)?;

    conn.run(
        &format!("DELETE FROM {ident} WHERE qr_run_id = :qr_run_id"),
        &RunOptions::new().arg("qr_run_id", id),
    )
    .await?;

    let remaining = conn
        .run(
            r#"SELECT COUNT(*) AS "count" FROM qr_report_runs WHERE report_table = :report_table"#,
            &RunOptions::new().arg("report_table", table),
        )
        .await?
        .scalar()?
        .and_then(|count| count.as_i64())
        .unwrap_or_default();

    tracing::debug!(id, remaining, table, "released report table");

    if remaining == 0 {
        conn.run(&format!("DROP TABLE IF EXISTS {ident}"), &RunOptions::default())
            .await?;
    }
    Ok(())
}

/// Drop the report table of `run`, along with the rows of any other runs
/// which share it.
pub async fn drop_table<D: Driver>(conn: &mut Connection<D>, run: &ReportRun) -> Result<()> {
    let table = conn.identifier(run.report_table())?;
    conn.run(&format!("DROP TABLE IF EXISTS {table}"), &RunOptions::default())
        .await?;
    Ok(())
}

pub(crate) fn persisted_id(run: &ReportRun) -> Result<i64> {
    run.id
        .ok_or_else(|| Error::State(format!("report run {:?} has not been persisted", run.name)))
}

fn from_row(row: &Row) -> Result<ReportRun> {
    let text = |column: &str| row.get(column).and_then(Value::as_str).map(str::to_string);
    let ts = |column: &str| row.get(column).and_then(Value::as_timestamp);

    let arguments: Arguments = match text("arguments") {
        Some(doc) => serde_json::from_str(&doc)?,
        None => Arguments::new(),
    };
    let base_columns: Vec<Column> = match text("base_columns") {
        Some(doc) => serde_json::from_str(&doc)?,
        None => Vec::new(),
    };
    let additional_columns: Vec<AdditionalColumn> = match text("additional_columns") {
        Some(doc) => serde_json::from_str(&doc)?,
        None => Vec::new(),
    };
    let error: Option<RunError> = match text("error") {
        Some(doc) => Some(serde_json::from_str(&doc)?),
        None => None,
    };

    let mut run = ReportRun::new(
        text("name").unwrap_or_default(),
        text("sql").unwrap_or_default(),
    );
    run.id = row.get("id").and_then(Value::as_i64);
    run.variant = text("variant");
    run.description = text("description").unwrap_or_default();
    run.arguments = arguments;
    run.created_at = ts("created_at");
    run.started_at = ts("started_at");
    run.finished_at = ts("finished_at");
    run.nrows = row.get("nrows").and_then(Value::as_i64);
    run.error = error;
    run.raw_sql = text("raw_sql");
    run.set_base_columns(base_columns);
    run.set_additional_columns(additional_columns);

    if let Some(report_table) = text("report_table") {
        run.restore_report_table(report_table);
    }
    Ok(run)
}
