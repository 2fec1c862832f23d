use super::{Codec, Column, CommandTag, DriverError, Error, Outcome, Result, Value};
use indexmap::IndexMap;
use std::sync::{Arc, OnceLock};

/// Row of decoded values, keyed and ordered by result column.
pub type Row = IndexMap<String, Value>;

/// QueryResult is the outcome of running one prepared query.
///
/// Raw wire text is retained as returned by the driver, and is decoded into
/// typed `Row`s the first time they're asked for.
#[derive(Debug)]
pub struct QueryResult {
    /// Query text as provided by the caller.
    pub sql: String,
    /// Query text after template preparation, as it was (or would be) sent.
    pub prepared_sql: String,
    /// Database error which was captured rather than returned.
    pub error: Option<DriverError>,
    /// Command tag reported by the driver, if the query was executed.
    pub command: Option<CommandTag>,
    pub fields: Vec<Column>,

    raw: Vec<Vec<Option<String>>>,
    codec: Arc<Codec>,
    rows: OnceLock<Vec<Row>>,
}

impl QueryResult {
    pub(crate) fn new(sql: &str, prepared_sql: String, codec: Arc<Codec>) -> Self {
        Self {
            sql: sql.to_string(),
            prepared_sql,
            error: None,
            command: None,
            fields: Vec::new(),
            raw: Vec::new(),
            codec,
            rows: OnceLock::new(),
        }
    }

    pub(crate) fn with_outcome(mut self, outcome: Outcome) -> Self {
        let Outcome {
            fields,
            rows,
            command,
        } = outcome;

        self.fields = fields;
        self.raw = rows;
        self.command = command;
        self
    }

    pub(crate) fn with_error(mut self, error: DriverError) -> Self {
        self.error = Some(error);
        self
    }

    /// Names of the result's columns, in order.
    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Type names of the result's columns, in order.
    pub fn type_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.type_name.as_str()).collect()
    }

    /// Number of rows returned.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Number of rows affected, as reported by the command tag.
    pub fn affected_rows(&self) -> Option<u64> {
        self.command.as_ref().map(|c| c.rows)
    }

    /// Decoded rows of the result. Decoding happens once and is cached.
    pub fn rows(&self) -> Result<&[Row]> {
        if self.rows.get().is_none() {
            let decoded = self.decode_rows()?;
            let _ = self.rows.set(decoded);
        }
        Ok(self.rows.get().map(Vec::as_slice).unwrap_or_default())
    }

    /// Decoded value of the first column of the first row, if there is one.
    pub fn scalar(&self) -> Result<Option<Value>> {
        let (Some(field), Some(row)) = (self.fields.first(), self.raw.first()) else {
            return Ok(None);
        };
        let text = row.first().and_then(Option::as_deref);
        self.codec.decode(text, &field.type_name).map(Some)
    }

    /// Map a captured error back into an Err.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(Error::Driver(err)),
            None => Ok(self),
        }
    }

    fn decode_rows(&self) -> Result<Vec<Row>> {
        self.raw
            .iter()
            .map(|raw| {
                self.fields
                    .iter()
                    .zip(raw.iter())
                    .map(|(field, text)| {
                        let value = self.codec.decode(text.as_deref(), &field.type_name)?;
                        Ok((field.name.clone(), value))
                    })
                    .collect::<Result<Row>>()
            })
            .collect()
    }
}
