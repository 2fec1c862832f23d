use super::{
    template, Codec, Driver, DriverErrorKind, Error, PgDriver, QueryResult, Result, RunOptions,
    Sql, Value,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// ConnectParams are the parameters of a new database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            dbname: "postgres".to_string(),
        }
    }
}

impl ConnectParams {
    /// Parameters from the PGHOST, PGPORT, PGUSER, PGPASSWORD, and
    /// PGDATABASE environment variables, with defaults for any unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = match lookup("PGPORT") {
            Some(port) => port.parse().unwrap_or_else(|_| {
                tracing::warn!(%port, "ignoring invalid PGPORT");
                defaults.port
            }),
            None => defaults.port,
        };

        Self {
            host: lookup("PGHOST").unwrap_or(defaults.host),
            port,
            user: lookup("PGUSER").unwrap_or(defaults.user),
            password: lookup("PGPASSWORD").unwrap_or(defaults.password),
            dbname: lookup("PGDATABASE").unwrap_or(defaults.dbname),
        }
    }

    pub fn pg_options(&self) -> sqlx::postgres::PgConnectOptions {
        sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
    }
}

/// Connection runs prepared queries over a Driver, and scopes them into
/// transactions which may nest.
///
/// Nested scopes collapse into one outermost BEGIN and a single COMMIT, or
/// ABORT if any scope at any depth aborted. A connection which observed a
/// transport failure is marked invalid, and its driver is closed when the
/// outermost scope ends.
pub struct Connection<D: Driver = PgDriver> {
    driver: Option<D>,
    codec: Arc<Codec>,
    schema: String,

    depth: usize,
    abort: bool,
    invalid: bool,
    abort_cause: Option<String>,
}

impl Connection<PgDriver> {
    /// Open a new Postgres session using `params`.
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        tracing::debug!(host = %params.host, port = params.port, dbname = %params.dbname, "connecting");
        let driver = PgDriver::connect(&params.pg_options()).await?;
        Ok(Self::new(driver))
    }
}

impl<D: Driver> Connection<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Some(driver),
            codec: Arc::default(),
            schema: "public".to_string(),
            depth: 0,
            abort: false,
            invalid: false,
            abort_cause: None,
        }
    }

    /// Decode results using `codec`.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Resolve unqualified table names within `schema`.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }
    pub fn schema(&self) -> &str {
        &self.schema
    }
    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }
    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }
    pub fn in_transaction(&self) -> bool {
        self.depth != 0
    }
    /// Error message which caused the most recent transaction to abort.
    pub fn abort_cause(&self) -> Option<&str> {
        self.abort_cause.as_deref()
    }

    /// Quote `name` as an identifier fragment.
    pub fn identifier(&self, name: &str) -> Result<Sql> {
        Ok(Sql::new(self.open()?.escape_identifier(name)))
    }

    /// Prepare `sql` with `options`, without running it.
    pub fn prepare(&self, sql: &str, options: &RunOptions) -> Result<String> {
        template::prepare(sql, options, self.open()?)
    }

    /// Prepare and run `sql`.
    ///
    /// A database error is returned, unless `options.capture_error` is set
    /// in which case it's attached to the returned QueryResult. Either way,
    /// an error within a transaction marks the transaction for abort.
    pub async fn run(&mut self, sql: &str, options: &RunOptions) -> Result<QueryResult> {
        let prepared = self.prepare(sql, options)?;

        if options.verbose {
            tracing::info!(sql = %prepared, "running query");
        } else {
            tracing::debug!(sql = %prepared, "running query");
        }
        let result = QueryResult::new(sql, prepared, self.codec.clone());

        if options.dry_run {
            return Ok(result);
        }
        let driver = self.open_mut()?;

        match driver.execute(&result.prepared_sql).await {
            Ok(outcome) => {
                let result = result.with_outcome(outcome);

                if options.verbose_result {
                    tracing::info!(
                        command = ?result.command,
                        columns = ?result.columns(),
                        rows = ?result.rows(),
                        "query result"
                    );
                }
                Ok(result)
            }
            Err(err) => {
                if err.kind == DriverErrorKind::Connection {
                    self.invalid = true;
                }
                if self.depth != 0 {
                    self.abort = true;
                    self.abort_cause = Some(err.message.clone());
                }

                if options.capture_error {
                    tracing::warn!(error = %err, sql = %result.prepared_sql, "captured query error");
                    Ok(result.with_error(err))
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Does table `name` exist? The name may be qualified as `schema.table`,
    /// and is otherwise resolved within the connection's schema.
    pub async fn table_exists(&mut self, name: &str) -> Result<bool> {
        let (schema, table) = match name.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table),
            None => (self.schema.clone(), name),
        };
        let result = self
            .run(
                r#"SELECT EXISTS(SELECT * FROM pg_catalog.pg_tables WHERE tablename = :tablename AND schemaname = :schemaname) AS "exists""#,
                &RunOptions::new()
                    .arg("tablename", table)
                    .arg("schemaname", schema),
            )
            .await?;

        Ok(matches!(result.scalar()?, Some(Value::Bool(true))))
    }

    /// Begin a transaction scope. Only the outermost scope issues BEGIN.
    pub async fn begin(&mut self) -> Result<()> {
        if self.depth == 0 {
            self.abort = false;
            self.abort_cause = None;
            self.run("BEGIN", &RunOptions::default()).await?;
        }
        self.depth += 1;
        Ok(())
    }

    /// End a transaction scope, marking it for abort if `abort` is set.
    /// When the outermost scope ends, COMMIT or ABORT is issued and an
    /// invalid connection is closed.
    pub async fn end(&mut self, abort: bool) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::State(
                "transaction end without a matching begin".to_string(),
            ));
        }
        self.abort |= abort;
        self.depth -= 1;

        if self.depth != 0 {
            return Ok(());
        }

        let result = if self.invalid {
            Ok(())
        } else if self.abort {
            self.run("ABORT", &RunOptions::default()).await.map(|_| ())
        } else {
            self.run("COMMIT", &RunOptions::default()).await.map(|_| ())
        };

        if self.invalid {
            tracing::warn!("closing invalidated connection");
            self.close().await?;
        }
        result
    }

    /// Run `f` within a transaction scope, which is aborted if `f` fails
    /// or panics. The scope is always ended before `f`'s result is returned
    /// or its panic resumed.
    pub async fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Self) -> BoxFuture<'c, Result<T>>,
    {
        self.transaction_with(&mut (), |conn, _| f(conn)).await
    }

    /// Like `transaction`, but additionally lends `ctx` to `f`.
    pub async fn transaction_with<C, T, F>(&mut self, ctx: &mut C, f: F) -> Result<T>
    where
        C: Send,
        T: Send,
        F: for<'c> FnOnce(&'c mut Self, &'c mut C) -> BoxFuture<'c, Result<T>>,
    {
        self.begin().await?;

        let outcome = AssertUnwindSafe(f(&mut *self, &mut *ctx)).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => {
                self.end(false).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.abort_cause = Some(err.to_string());
                if let Err(end_err) = self.end(true).await {
                    tracing::warn!(error = %end_err, "failed to end aborted transaction");
                }
                Err(err)
            }
            Err(panic) => {
                self.abort_cause = Some("panic".to_string());
                if let Err(end_err) = self.end(true).await {
                    tracing::warn!(error = %end_err, "failed to end transaction after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Close the connection. Closing within a transaction is an error,
    /// and closing an already-closed connection does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.depth != 0 {
            return Err(Error::State(
                "cannot close a connection during a transaction".to_string(),
            ));
        }
        self.invalid = false;

        if let Some(driver) = self.driver.take() {
            driver.close().await?;
        }
        Ok(())
    }

    fn open(&self) -> Result<&D> {
        self.driver
            .as_ref()
            .ok_or_else(|| Error::State("connection is closed".to_string()))
    }

    fn open_mut(&mut self) -> Result<&mut D> {
        self.driver
            .as_mut()
            .ok_or_else(|| Error::State("connection is closed".to_string()))
    }
}
