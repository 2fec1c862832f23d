//! Materialized reports.
//!
//! A report query is run by a [`Materializer`] into a report table, which is
//! shared by all runs of the report that produce the same columns. Each run
//! is recorded as a [`ReportRun`] in the `qr_report_runs` registry (see
//! [`store`]), and its rows are read back through [`Data`] or [`select`].
mod data;
mod materializer;
mod run;
pub mod store;

pub use data::{select, Data, SelectOptions};
pub use materializer::{rewrite, Materializer, Stage};
pub use run::{AdditionalColumn, ReportRun, RunError};

pub use report_sql;
