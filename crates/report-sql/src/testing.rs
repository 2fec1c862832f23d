//! In-memory Driver for tests which don't have a database.
use crate::driver::{command_kind, pg_escape_identifier, pg_escape_string};
use crate::{Column, CommandTag, Driver, DriverError, Escape, Outcome};
use regex::Regex;
use std::sync::{Arc, Mutex};

/// ScriptedDriver records every executed statement and answers each from the
/// first matching scripted rule. Statements which match no rule succeed with
/// an empty outcome tagged by their leading keyword.
///
/// Clones share state, so a test may keep a handle to inspect the log after
/// moving the driver into a Connection.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    log: Vec<String>,
    rules: Vec<Rule>,
    closed: bool,
}

struct Rule {
    pattern: Regex,
    response: Result<Outcome, DriverError>,
    remaining: Option<usize>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements matching regex `pattern` with `outcome`.
    pub fn on(&self, pattern: &str, outcome: Outcome) -> &Self {
        self.push(pattern, Ok(outcome), None)
    }
    /// Answer only the next statement matching `pattern` with `outcome`.
    pub fn once(&self, pattern: &str, outcome: Outcome) -> &Self {
        self.push(pattern, Ok(outcome), Some(1))
    }
    /// Fail statements matching `pattern` with `error`.
    pub fn fail(&self, pattern: &str, error: DriverError) -> &Self {
        self.push(pattern, Err(error), None)
    }

    /// Statements executed so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn push(&self, pattern: &str, response: Result<Outcome, DriverError>, remaining: Option<usize>) -> &Self {
        let pattern = Regex::new(pattern).unwrap();
        self.state.lock().unwrap().rules.push(Rule {
            pattern,
            response,
            remaining,
        });
        self
    }
}

/// Build an outcome of `rows` having `fields` of (name, type) pairs.
pub fn rows(fields: &[(&str, &str)], rows: Vec<Vec<Option<&str>>>) -> Outcome {
    let count = rows.len() as u64;
    Outcome {
        fields: fields.iter().map(|(n, t)| Column::new(*n, *t)).collect(),
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
        command: Some(CommandTag {
            kind: "SELECT".to_string(),
            rows: count,
        }),
    }
}

/// Build an outcome having only a command tag.
pub fn tag(kind: &str, rows: u64) -> Outcome {
    Outcome {
        command: Some(CommandTag {
            kind: kind.to_string(),
            rows,
        }),
        ..Default::default()
    }
}

impl Escape for ScriptedDriver {
    fn escape_string(&self, s: &str) -> String {
        pg_escape_string(s)
    }
    fn escape_identifier(&self, s: &str) -> String {
        pg_escape_identifier(s)
    }
}

#[async_trait::async_trait]
impl Driver for ScriptedDriver {
    async fn execute(&mut self, sql: &str) -> Result<Outcome, DriverError> {
        let mut state = self.state.lock().unwrap();

        if state.closed {
            return Err(DriverError::connection("connection is closed"));
        }
        state.log.push(sql.to_string());

        let rule = state.rules.iter_mut().find(|rule| {
            rule.remaining != Some(0) && rule.pattern.is_match(sql)
        });

        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.response.clone()
            }
            None => Ok(tag(&command_kind(sql), 0)),
        }
    }

    async fn close(self) -> Result<(), DriverError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
