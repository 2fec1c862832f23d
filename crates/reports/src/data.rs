use super::store::persisted_id;
use super::ReportRun;
use report_sql::{
    Arguments, Connection, Driver, DriverError, Error, Limit, QueryResult, Result, Row, RunOptions,
};

/// Options of a select over the rows of a report run.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Projected columns, as SQL. Defaults to `*`.
    pub columns: Option<String>,
    /// Ordering, as SQL. Defaults to `qr_run_row`, and an empty string
    /// selects rows in no particular order.
    pub order_by: Option<String>,
    pub limit: Option<Limit>,
    /// Additional predicate, as SQL, which selected rows must satisfy.
    pub filter: Option<String>,
    /// Arguments of placeholders within `columns`, `order_by`, and `filter`.
    pub arguments: Arguments,
    pub capture_error: bool,
    pub verbose: bool,
}

impl SelectOptions {
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }
    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }
    pub fn unordered(self) -> Self {
        self.order_by("")
    }
    pub fn limit(mut self, count: u64) -> Self {
        self.limit = Some(Limit::Count(count));
        self
    }
    pub fn page(mut self, count: u64, offset: u64) -> Self {
        self.limit = Some(Limit::Page { count, offset });
        self
    }
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<report_sql::Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
}

/// Select rows of `run` from its report table.
pub async fn select<D: Driver>(
    conn: &mut Connection<D>,
    run: &ReportRun,
    options: &SelectOptions,
) -> Result<QueryResult> {
    let id = persisted_id(run)?;
    let table = conn.identifier(run.report_table())?;
    let columns = options.columns.as_deref().unwrap_or("*");

    let mut sql = format!("SELECT {columns} FROM {table} WHERE qr_run_id = :qr_run_id");
    if let Some(filter) = &options.filter {
        sql.push_str(&format!(" AND ({filter})"));
    }
    match options.order_by.as_deref() {
        None => sql.push_str(" ORDER BY qr_run_row"),
        Some("") => (),
        Some(order_by) => sql.push_str(&format!(" ORDER BY {order_by}")),
    }

    let mut arguments = options.arguments.clone();
    arguments.insert("qr_run_id".to_string(), id.into());

    conn.run(
        &sql,
        &RunOptions {
            arguments,
            limit: options.limit,
            capture_error: options.capture_error,
            verbose: options.verbose,
            ..Default::default()
        },
    )
    .await
}

/// Data is lazy access to the materialized rows of a report run.
///
/// Columns and their types are learned from a select of no rows,
/// unless all rows were already fetched. Rows are fetched once and cached.
pub struct Data<'r> {
    run: &'r ReportRun,
    header: Option<QueryResult>,
    full: Option<QueryResult>,
}

impl<'r> Data<'r> {
    pub fn new(run: &'r ReportRun) -> Self {
        Self {
            run,
            header: None,
            full: None,
        }
    }

    pub fn report_run(&self) -> &ReportRun {
        self.run
    }

    /// Column names of the report table.
    pub async fn columns<D: Driver>(&mut self, conn: &mut Connection<D>) -> Result<Vec<String>> {
        let result = self.described(conn).await?;
        Ok(result.columns().into_iter().map(str::to_string).collect())
    }

    /// Column type names of the report table.
    pub async fn type_names<D: Driver>(&mut self, conn: &mut Connection<D>) -> Result<Vec<String>> {
        let result = self.described(conn).await?;
        Ok(result.type_names().into_iter().map(str::to_string).collect())
    }

    /// All rows of the run, in order.
    pub async fn rows<D: Driver>(&mut self, conn: &mut Connection<D>) -> Result<&[Row]> {
        let result = self.fetched(conn).await?;

        if let Some(err) = &result.error {
            return Err(Error::Driver(err.clone()));
        }
        result.rows()
    }

    /// Error of fetching the run's rows, if there was one.
    pub async fn error<D: Driver>(
        &mut self,
        conn: &mut Connection<D>,
    ) -> Result<Option<&DriverError>> {
        Ok(self.fetched(conn).await?.error.as_ref())
    }

    async fn described<D: Driver>(&mut self, conn: &mut Connection<D>) -> Result<&QueryResult> {
        if self.full.is_none() && self.header.is_none() {
            let header = select(conn, self.run, &SelectOptions::default().limit(0)).await?;
            self.header = Some(header);
        }
        self.full
            .as_ref()
            .or(self.header.as_ref())
            .ok_or_else(|| Error::State("report data was not fetched".to_string()))
    }

    async fn fetched<D: Driver>(&mut self, conn: &mut Connection<D>) -> Result<&QueryResult> {
        if self.full.is_none() {
            let options = SelectOptions {
                capture_error: true,
                ..Default::default()
            };
            self.full = Some(select(conn, self.run, &options).await?);
        }
        self.full
            .as_ref()
            .ok_or_else(|| Error::State("report data was not fetched".to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use report_sql::testing::{rows, ScriptedDriver};
    use report_sql::{Column, Value};

    fn run() -> ReportRun {
        let mut run = ReportRun::new("users", "SELECT * FROM users");
        run.set_base_columns(vec![
            Column::new("qr_run_id", "INT4"),
            Column::new("qr_run_row", "INT8"),
            Column::new("name", "TEXT"),
        ]);
        run.id = Some(3);
        run
    }

    #[tokio::test]
    async fn select_is_scoped_to_the_run() {
        let driver = ScriptedDriver::new();
        let mut conn = Connection::new(driver.clone());
        let run = run();
        let table = run.report_table().to_string();

        select(&mut conn, &run, &SelectOptions::default()).await.unwrap();
        select(
            &mut conn,
            &run,
            &SelectOptions::default()
                .columns("name")
                .filter("name <> :skip")
                .arg("skip", "bob")
                .order_by("name DESC")
                .page(2, 4),
        )
        .await
        .unwrap();
        select(
            &mut conn,
            &run,
            &SelectOptions::default()
                .columns(r#"COUNT(*) AS "nrows""#)
                .unordered(),
        )
        .await
        .unwrap();

        assert_eq!(
            driver.log(),
            vec![
                format!(r#"SELECT * FROM "{table}" WHERE qr_run_id = 3 ORDER BY qr_run_row"#),
                format!(
                    "SELECT name FROM \"{table}\" WHERE qr_run_id = 3 AND (name <> 'bob') ORDER BY name DESC\nOFFSET 4\nLIMIT 2"
                ),
                format!(r#"SELECT COUNT(*) AS "nrows" FROM "{table}" WHERE qr_run_id = 3"#),
            ]
        );
    }

    #[tokio::test]
    async fn select_requires_a_persisted_run() {
        let mut conn = Connection::new(ScriptedDriver::new());
        let mut run = run();
        run.id = None;

        let err = select(&mut conn, &run, &SelectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StateError");
    }

    #[tokio::test]
    async fn data_is_fetched_lazily() {
        let driver = ScriptedDriver::new();
        let mut conn = Connection::new(driver.clone());
        let run = run();

        let fields = [("qr_run_id", "INT4"), ("qr_run_row", "INT8"), ("name", "TEXT")];
        driver.on("LIMIT 0$", rows(&fields, vec![]));
        driver.on(
            "ORDER BY qr_run_row$",
            rows(
                &fields,
                vec![
                    vec![Some("3"), Some("1"), Some("alice")],
                    vec![Some("3"), Some("2"), None],
                ],
            ),
        );

        let mut data = Data::new(&run);
        assert_eq!(
            data.columns(&mut conn).await.unwrap(),
            vec!["qr_run_id", "qr_run_row", "name"]
        );
        assert_eq!(
            data.type_names(&mut conn).await.unwrap(),
            vec!["INT4", "INT8", "TEXT"]
        );
        assert_eq!(driver.log().len(), 1);

        let rows = data.rows(&mut conn).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], Value::from("alice"));
        assert_eq!(rows[1]["name"], Value::Null);
        assert_eq!(rows[1]["qr_run_row"], Value::Int(2));

        assert!(data.error(&mut conn).await.unwrap().is_none());
        data.columns(&mut conn).await.unwrap();
        assert_eq!(driver.log().len(), 2);
    }

    #[tokio::test]
    async fn data_errors_are_captured() {
        let driver = ScriptedDriver::new();
        let mut conn = Connection::new(driver.clone());
        let run = run();
        driver.fail("ORDER BY", DriverError::database("relation does not exist"));

        let mut data = Data::new(&run);
        assert_eq!(
            data.error(&mut conn).await.unwrap(),
            Some(&DriverError::database("relation does not exist"))
        );
        assert_eq!(data.rows(&mut conn).await.unwrap_err().kind(), "DriverError");
    }
}
