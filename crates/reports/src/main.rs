use anyhow::Context;
use clap::Parser;
use report_sql::{Arguments, ConnectParams, Connection, Value};
use reports::{store, AdditionalColumn, Data, Materializer, ReportRun, SelectOptions};
use std::io::Read;

/// reportctl materializes report queries into report tables, and inspects
/// and deletes the report runs which produced them.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Host of the postgres database.
    #[clap(long, env = "PGHOST", default_value = "localhost")]
    host: String,
    /// Port of the postgres database.
    #[clap(long, env = "PGPORT", default_value = "5432")]
    port: u16,
    #[clap(long, env = "PGUSER", default_value = "postgres")]
    user: String,
    #[clap(long, env = "PGPASSWORD", default_value = "postgres", hide_env_values = true)]
    password: String,
    #[clap(long, env = "PGDATABASE", default_value = "postgres")]
    dbname: String,
    /// Schema within which report tables are resolved.
    #[clap(long, default_value = "public")]
    schema: String,
    /// Log as JSON lines rather than human-readable text.
    #[clap(long)]
    log_json: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create the registry of report runs, if it doesn't exist.
    Schema,
    /// Materialize a report query.
    Run(RunArgs),
    /// Print a report run and its rows as JSON lines.
    Show(ShowArgs),
    /// Delete a report run and its rows.
    Delete {
        /// Id of the report run.
        id: i64,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Name of the report.
    #[clap(long)]
    name: String,
    #[clap(long, default_value = "")]
    description: String,
    #[clap(long)]
    variant: Option<String>,
    /// Path of the report query, or "-" to read it from stdin.
    sql: String,
    /// Query argument, as NAME=JSON. May be repeated.
    #[clap(long = "arg", value_parser = parse_arg)]
    arguments: Vec<(String, Value)>,
    /// Additional column of the report table, as NAME:TYPE[:DEFAULT-JSON].
    /// May be repeated.
    #[clap(long = "additional-column", value_parser = parse_additional_column)]
    additional_columns: Vec<AdditionalColumn>,
    /// Log each prepared statement of the run.
    #[clap(long)]
    verbose: bool,
}

#[derive(Debug, clap::Args)]
struct ShowArgs {
    /// Id of the report run.
    id: i64,
    /// Maximum number of rows to print.
    #[clap(long)]
    limit: Option<u64>,
    /// Number of leading rows to skip. Requires --limit.
    #[clap(long, requires = "limit")]
    offset: Option<u64>,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("setting tracing default failed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    let params = ConnectParams {
        host: args.host,
        port: args.port,
        user: args.user,
        password: args.password,
        dbname: args.dbname,
    };
    let mut conn = Connection::connect(&params)
        .await
        .context("connecting to database")?
        .with_schema(args.schema);

    let result = match args.command {
        Command::Schema => store::install_schema(&mut conn)
            .await
            .context("installing report run registry"),
        Command::Run(run_args) => do_run(&mut conn, run_args).await,
        Command::Show(show_args) => do_show(&mut conn, show_args).await,
        Command::Delete { id } => do_delete(&mut conn, id).await,
    };

    conn.close().await.context("closing connection")?;
    result
}

async fn do_run(conn: &mut Connection, args: RunArgs) -> anyhow::Result<()> {
    let RunArgs {
        name,
        description,
        variant,
        sql,
        arguments,
        additional_columns,
        verbose,
    } = args;

    let sql = if sql == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading report query from stdin")?;
        buf
    } else {
        std::fs::read_to_string(&sql).with_context(|| format!("reading report query {sql}"))?
    };

    let mut run = ReportRun::new(name, sql)
        .with_description(description)
        .with_arguments(arguments.into_iter().collect::<Arguments>())
        .with_additional_columns(additional_columns);
    if let Some(variant) = variant {
        run = run.with_variant(variant);
    }

    Materializer::new(conn)
        .verbose(verbose)
        .run(&mut run)
        .await
        .context("materializing report")?;

    tracing::info!(
        id = ?run.id,
        table = run.report_table(),
        nrows = ?run.nrows,
        error = ?run.error,
        "report run finished"
    );
    println!("{}", serde_json::to_string(&summary(&run))?);

    if let Some(error) = run.error {
        anyhow::bail!("report run failed: {error}");
    }
    Ok(())
}

async fn do_show(conn: &mut Connection, args: ShowArgs) -> anyhow::Result<()> {
    let run = store::find(conn, args.id)
        .await
        .context("fetching report run")?
        .with_context(|| format!("report run {} doesn't exist", args.id))?;

    println!("{}", serde_json::to_string(&summary(&run))?);

    if run.error.is_some() {
        return Ok(());
    }

    let rows = if let Some(limit) = args.limit {
        let options = match args.offset {
            Some(offset) => SelectOptions::default().page(limit, offset),
            None => SelectOptions::default().limit(limit),
        };
        reports::select(conn, &run, &options)
            .await
            .context("selecting report rows")?
            .into_result()?
            .rows()?
            .to_vec()
    } else {
        Data::new(&run)
            .rows(conn)
            .await
            .context("selecting report rows")?
            .to_vec()
    };

    for row in rows {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

async fn do_delete(conn: &mut Connection, id: i64) -> anyhow::Result<()> {
    let run = store::find(conn, id)
        .await
        .context("fetching report run")?
        .with_context(|| format!("report run {id} doesn't exist"))?;

    store::delete(conn, &run)
        .await
        .context("deleting report run")?;

    tracing::info!(id, table = run.report_table(), "deleted report run");
    Ok(())
}

fn summary(run: &ReportRun) -> serde_json::Value {
    serde_json::json!({
        "id": run.id,
        "name": run.name,
        "variant": run.variant,
        "description": run.description,
        "report_table": run.report_table(),
        "columns": run.columns(),
        "nrows": run.nrows,
        "error": run.error,
        "created_at": run.created_at,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
    })
}

fn parse_arg(s: &str) -> Result<(String, Value), String> {
    let (name, doc) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, not {s:?}"))?;
    let value: Value = serde_json::from_str(doc).map_err(|err| format!("argument {name}: {err}"))?;
    Ok((name.to_string(), value))
}

fn parse_additional_column(s: &str) -> Result<AdditionalColumn, String> {
    let mut parts = s.splitn(3, ':');

    let (Some(name), Some(type_name)) = (parts.next(), parts.next()) else {
        return Err(format!("expected NAME:TYPE[:DEFAULT-JSON], not {s:?}"));
    };
    let mut column = AdditionalColumn::new(name, type_name);

    if let Some(doc) = parts.next() {
        let default: Value =
            serde_json::from_str(doc).map_err(|err| format!("default of {name}: {err}"))?;
        column = column.with_default(default);
    }
    Ok(column)
}
