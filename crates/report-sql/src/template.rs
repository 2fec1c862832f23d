use super::{encode, Arguments, Error, Escape, Result, Sql, Value};
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

/// Limit of rows returned by a query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Limit {
    Count(u64),
    Page { count: u64, offset: u64 },
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Count(count) => write!(f, "LIMIT {count}"),
            Limit::Page { count, offset } => write!(f, "OFFSET {offset}\nLIMIT {count}"),
        }
    }
}

/// RunOptions are the options of a single query execution.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Values of `:name` placeholders.
    pub arguments: Arguments,
    /// Column names and values from which the NAMES, VALUES,
    /// NAMES_AND_VALUES, and SET_VALUES macros are built.
    /// Values are also available as placeholders of their own name.
    pub names_and_values: Option<Arguments>,
    /// Limit to inject into, or replace within, the query.
    pub limit: Option<Limit>,
    /// Record a database error on the result instead of returning it.
    pub capture_error: bool,
    /// Prepare the query, but don't execute it.
    pub dry_run: bool,
    /// Log the prepared query at info level.
    pub verbose: bool,
    /// Log each substituted placeholder at info level.
    pub verbose_arguments: bool,
    /// Log the result at info level.
    pub verbose_result: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }
    pub fn args(mut self, arguments: &Arguments) -> Self {
        self.arguments
            .extend(arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
    pub fn names_and_values(mut self, values: Arguments) -> Self {
        self.names_and_values = Some(values);
        self
    }
    pub fn limit(mut self, count: u64) -> Self {
        self.limit = Some(Limit::Count(count));
        self
    }
    pub fn page(mut self, count: u64, offset: u64) -> Self {
        self.limit = Some(Limit::Page { count, offset });
        self
    }
    pub fn capture_error(mut self) -> Self {
        self.capture_error = true;
        self
    }
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r":([A-Za-z0-9_]+)(\??)").unwrap();
    static ref CONDITIONAL_RE: Regex =
        Regex::new(r":~\s*\{\{([^}]+?)\}\}\s*\{\{([^}]+?)\}\}").unwrap();
    static ref MALFORMED_CONDITIONAL_RE: Regex = Regex::new(r":~\s*\{\{").unwrap();
    static ref BETWEEN_RE: Regex = Regex::new(r"^\s*BETWEEN\b").unwrap();
    static ref LIMIT_MARKER_RE: Regex = Regex::new(r":LIMIT\b").unwrap();
    static ref TRAILING_LIMIT_RE: Regex = Regex::new(
        r"(?is)\s*(?:\bOFFSET\s+\S+\s+)?\bLIMIT\s+\S+(?:\s+OFFSET\s+\S+)?\s*\z"
    )
    .unwrap();
    static ref IDENTIFIER_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Prepare the final text of `sql` by applying `options`:
///
///  1. A single trailing `;` and the whitespace around it are removed.
///  2. An optional limit replaces a `:LIMIT` marker or a trailing
///     LIMIT / OFFSET clause, or is otherwise appended.
///  3. `names_and_values` are expanded into their macros.
///  4. `:name` and `:name?` placeholders are substituted with encoded
///     arguments. An optional placeholder which is unknown or null becomes
///     empty. A required placeholder which is unknown is left as-is, so that
///     a later stage may resolve it.
///  5. Conditional predicates `:~ {{EXPR}} {{VALUE}}` are rewritten to
///     `(VALUE BETWEEN ..)`, `(VALUE IS NULL)`, or `(VALUE = EXPR)`
///     depending on what EXPR became. A conditional having unresolved
///     placeholders is left for a later stage.
///
/// Substituted values are never themselves scanned for placeholders
/// or conditionals.
pub fn prepare<E: Escape + ?Sized>(sql: &str, options: &RunOptions, esc: &E) -> Result<String> {
    let mut sql = strip_terminator(sql).to_string();

    if let Some(limit) = &options.limit {
        sql = with_limit(&sql, limit);
    }

    let mut arguments = Cow::Borrowed(&options.arguments);

    if let Some(values) = &options.names_and_values {
        let macros = names_and_values_macros(values, esc)?;
        (sql, _) = substitute(&sql, &macros, Pass::Macros, options.verbose_arguments, esc)?;

        let merged = arguments.to_mut();
        merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    expand(&sql, &arguments, options.verbose_arguments, esc)
}

fn strip_terminator(sql: &str) -> &str {
    let trimmed = sql.trim_end();
    match trimmed.strip_suffix(';') {
        Some(stripped) => stripped.trim_end(),
        None => trimmed,
    }
}

/// Inject `limit` into `sql`, replacing a `:LIMIT` marker or an existing
/// trailing LIMIT clause if there is one.
pub fn with_limit(sql: &str, limit: &Limit) -> String {
    let clause = format!("\n{limit}");

    if LIMIT_MARKER_RE.is_match(sql) {
        LIMIT_MARKER_RE
            .replace(sql, regex::NoExpand(&clause))
            .into_owned()
    } else if TRAILING_LIMIT_RE.is_match(sql) {
        TRAILING_LIMIT_RE
            .replace(sql, regex::NoExpand(&clause))
            .into_owned()
    } else {
        format!("{sql}{clause}")
    }
}

fn names_and_values_macros<E: Escape + ?Sized>(values: &Arguments, esc: &E) -> Result<Arguments> {
    if let Some(bad) = values.keys().find(|k| !IDENTIFIER_RE.is_match(k)) {
        return Err(Error::Template(format!(
            "{bad:?} cannot be used as a column name and placeholder"
        )));
    }

    let names = values
        .keys()
        .map(|k| esc.escape_identifier(k))
        .collect::<Vec<_>>();
    let placeholders = values.keys().map(|k| format!(":{k}")).collect::<Vec<_>>();
    let assignments = names
        .iter()
        .zip(placeholders.iter())
        .map(|(n, p)| format!("{n} = {p}"))
        .collect::<Vec<_>>();

    let (names, placeholders) = (names.join(", "), placeholders.join(", "));

    let mut macros = Arguments::new();
    macros.insert(
        "NAMES_AND_VALUES".to_string(),
        Sql::new(format!("( {names} ) VALUES ( {placeholders} )")).into(),
    );
    macros.insert("SET_VALUES".to_string(), Sql::new(assignments.join(", ")).into());
    macros.insert("NAMES".to_string(), Sql::new(names).into());
    macros.insert("VALUES".to_string(), Sql::new(placeholders).into());

    Ok(macros)
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Pass {
    // Only known macros are replaced. Everything else is left as-is.
    Macros,
    Final,
}

// Substitute the placeholders of `sql`, returning the substituted text and
// whether a required placeholder was left unresolved.
fn substitute<E: Escape + ?Sized>(
    sql: &str,
    arguments: &Arguments,
    pass: Pass,
    verbose: bool,
    esc: &E,
) -> Result<(String, bool)> {
    let mut out = String::with_capacity(sql.len());
    let (mut last, mut pending) = (0, false);

    for cap in PLACEHOLDER_RE.captures_iter(sql) {
        let Some(token) = cap.get(0) else { continue };
        let (name, optional) = (&cap[1], !cap[2].is_empty());

        // The second colon of a `::type` cast is not a placeholder.
        if sql[..token.start()].ends_with(':') {
            continue;
        }
        let replacement = match arguments.get(name) {
            Some(value) if optional && value.is_null() => String::new(),
            Some(value) => encode(value, esc)?,
            None if optional && pass == Pass::Final => String::new(),
            None => {
                pending |= !optional;
                continue;
            }
        };
        if verbose {
            tracing::info!(%name, value = %replacement, "substituted argument");
        }
        out.push_str(&sql[last..token.start()]);
        out.push_str(&replacement);
        last = token.end();
    }
    out.push_str(&sql[last..]);

    Ok((out, pending))
}

// Substitute placeholders and rewrite conditionals of template `sql`.
fn expand<E: Escape + ?Sized>(
    sql: &str,
    arguments: &Arguments,
    verbose: bool,
    esc: &E,
) -> Result<String> {
    let sub = |text: &str| substitute(text, arguments, Pass::Final, verbose, esc);
    let plain = |text: &str| -> Result<String> {
        if let Some(bad) = MALFORMED_CONDITIONAL_RE.find(text) {
            let near: String = text[bad.start()..].chars().take(32).collect();
            return Err(Error::Template(format!(
                "conditional {near:?} must have the form :~ {{{{EXPR}}}} {{{{VALUE}}}}"
            )));
        }
        Ok(sub(text)?.0)
    };

    let mut out = String::with_capacity(sql.len());
    let mut last = 0;

    for cap in CONDITIONAL_RE.captures_iter(sql) {
        let Some(whole) = cap.get(0) else { continue };
        out.push_str(&plain(&sql[last..whole.start()])?);

        let (expr, expr_pending) = sub(&cap[1])?;
        let (value, value_pending) = sub(&cap[2])?;

        if expr_pending || value_pending {
            out.push_str(&format!(":~ {{{{{expr}}}}} {{{{{value}}}}}"));
        } else if BETWEEN_RE.is_match(&expr) {
            out.push_str(&format!("({value} {expr})"));
        } else if expr.trim() == "NULL" {
            out.push_str(&format!("({value} IS NULL)"));
        } else {
            out.push_str(&format!("({value} = {expr})"));
        }
        last = whole.end();
    }
    out.push_str(&plain(&sql[last..])?);

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::{pg_escape_identifier, pg_escape_string};
    use pretty_assertions::assert_eq;

    struct Pg;

    impl Escape for Pg {
        fn escape_string(&self, s: &str) -> String {
            pg_escape_string(s)
        }
        fn escape_identifier(&self, s: &str) -> String {
            pg_escape_identifier(s)
        }
    }

    fn prep(sql: &str, options: RunOptions) -> String {
        prepare(sql, &options, &Pg).unwrap()
    }

    #[test]
    fn terminator_is_stripped() {
        assert_eq!(prep("SELECT 1 ;  \n", RunOptions::new()), "SELECT 1");
        assert_eq!(prep("  SELECT 1", RunOptions::new()), "  SELECT 1");
        // Only one terminator is removed.
        assert_eq!(prep("SELECT 1;;", RunOptions::new()), "SELECT 1;");
    }

    #[test]
    fn limits() {
        let sql = "SELECT * FROM t";
        assert_eq!(prep(sql, RunOptions::new().limit(0)), "SELECT * FROM t\nLIMIT 0");
        assert_eq!(
            prep(sql, RunOptions::new().page(4, 2)),
            "SELECT * FROM t\nOFFSET 2\nLIMIT 4"
        );
        assert_eq!(
            prep("SELECT * FROM t LIMIT 10;", RunOptions::new().limit(2)),
            "SELECT * FROM t\nLIMIT 2"
        );
        assert_eq!(
            prep("SELECT * FROM t\nlimit 10 offset 3", RunOptions::new().page(2, 1)),
            "SELECT * FROM t\nOFFSET 1\nLIMIT 2"
        );
        assert_eq!(
            prep(
                "SELECT * FROM (SELECT * FROM t :LIMIT) x ORDER BY 1",
                RunOptions::new().limit(5)
            ),
            "SELECT * FROM (SELECT * FROM t \nLIMIT 5) x ORDER BY 1"
        );
        // A LIMIT within a sub-query isn't trailing, and is left alone.
        assert_eq!(
            prep("SELECT * FROM (SELECT 1 LIMIT 1) x", RunOptions::new().limit(3)),
            "SELECT * FROM (SELECT 1 LIMIT 1) x\nLIMIT 3"
        );
    }

    #[test]
    fn placeholders() {
        let options = RunOptions::new()
            .arg("threshold", 5)
            .arg("name", "o'hare")
            .arg("missing", Value::Null)
            .arg("text", "never a cast");

        assert_eq!(
            prep(
                "SELECT id FROM t WHERE x >= :threshold AND n = :name AND y = :missing",
                options.clone()
            ),
            "SELECT id FROM t WHERE x >= 5 AND n = 'o''hare' AND y = NULL"
        );
        // Optional placeholders which are null or unknown become empty.
        assert_eq!(
            prep("SELECT 1 :missing? :WHERE? :threshold?", options.clone()),
            "SELECT 1   5"
        );
        // Unknown required placeholders are left for a later stage.
        assert_eq!(
            prep("SELECT :later, :threshold", options.clone()),
            "SELECT :later, 5"
        );
        // Casts are not placeholders.
        assert_eq!(
            prep("SELECT 'x'::text, :name::text", options),
            "SELECT 'x'::text, 'o''hare'::text"
        );
    }

    #[test]
    fn staged_resolution() {
        let first = prep(
            "SELECT * FROM t WHERE a = :a AND b = :b",
            RunOptions::new().arg("a", 1),
        );
        let second = prep(&first, RunOptions::new().arg("b", 2));
        assert_eq!(second, "SELECT * FROM t WHERE a = 1 AND b = 2");
    }

    #[test]
    fn names_and_values_macros() {
        let mut values = Arguments::new();
        values.insert("id".to_string(), 7.into());
        values.insert("name".to_string(), "user7".into());

        insta::assert_snapshot!(
            prep("INSERT INTO users :NAMES_AND_VALUES", RunOptions::new().names_and_values(values.clone())),
            @r###"INSERT INTO users ( "id", "name" ) VALUES ( 7, 'user7' )"###
        );
        insta::assert_snapshot!(
            prep("INSERT INTO users ( :NAMES ) VALUES ( :VALUES ) RETURNING id", RunOptions::new().names_and_values(values.clone())),
            @r###"INSERT INTO users ( "id", "name" ) VALUES ( 7, 'user7' ) RETURNING id"###
        );
        insta::assert_snapshot!(
            prep(
                "UPDATE users SET :SET_VALUES WHERE id = :user_id :WHERE?",
                RunOptions::new()
                    .arg("user_id", 3)
                    .arg("WHERE", Value::sql("AND NOT deleted"))
                    .names_and_values(values)
            ),
            @r###"UPDATE users SET "id" = 7, "name" = 'user7' WHERE id = 3 AND NOT deleted"###
        );
    }

    #[test]
    fn conditional_predicates() {
        let sql = "SELECT * FROM a WHERE :~ {{:window}} {{a.created_on}}";

        assert_eq!(
            prep(sql, RunOptions::new().arg("window", Value::between(1, 5))),
            "SELECT * FROM a WHERE (a.created_on BETWEEN 1 AND 5)"
        );
        assert_eq!(
            prep(sql, RunOptions::new().arg("window", Value::Null)),
            "SELECT * FROM a WHERE (a.created_on IS NULL)"
        );
        assert_eq!(
            prep(sql, RunOptions::new().arg("window", "x")),
            "SELECT * FROM a WHERE (a.created_on = 'x')"
        );
    }

    #[test]
    fn staged_conditionals() {
        let sql = "SELECT * FROM a WHERE :~ {{:window}} {{a.created_on}} AND a.kind = :kind";

        let first = prep(sql, RunOptions::new().arg("kind", "x"));
        assert_eq!(
            first,
            "SELECT * FROM a WHERE :~ {{:window}} {{a.created_on}} AND a.kind = 'x'"
        );
        let second = prep(&first, RunOptions::new().arg("window", Value::between(1, 2)));
        assert_eq!(
            second,
            "SELECT * FROM a WHERE (a.created_on BETWEEN 1 AND 2) AND a.kind = 'x'"
        );
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let stored = "SELECT * FROM a WHERE :~ {{:window}} {{a.created_on}} AND b = :b";

        assert_eq!(
            prep("INSERT INTO runs (sql) VALUES (:sql)", RunOptions::new().arg("sql", stored).arg("b", 1)),
            "INSERT INTO runs (sql) VALUES ('SELECT * FROM a WHERE :~ {{:window}} {{a.created_on}} AND b = :b')"
        );
    }

    #[test]
    fn template_errors() {
        let mut values = Arguments::new();
        values.insert("not a column".to_string(), 1.into());
        let err = prepare("INSERT INTO t :NAMES_AND_VALUES", &RunOptions::new().names_and_values(values), &Pg)
            .unwrap_err();
        assert_eq!(err.kind(), "TemplateError");

        let err = prepare("SELECT * FROM t WHERE :~ {{:x}}", &RunOptions::new().arg("x", 1), &Pg)
            .unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
    }

    #[test]
    fn escape_errors_propagate() {
        let err = prepare("SELECT :x", &RunOptions::new().arg("x", f64::NAN), &Pg).unwrap_err();
        assert_eq!(err.kind(), "EscapeError");
    }
}
