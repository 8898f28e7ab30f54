//! Batch input and output records, and the end-of-run summary.
//!
//! Every input record carries an `id`, which we copy to the matching output
//! record so callers can join results back to their own data.

use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{
        BoxedStream,
        io::{read_jsonl_or_csv, write_output},
    },
    cmd::StreamOpts,
    prelude::*,
    ui::Ui,
};

/// An input record: an `id` plus type-specific fields.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkInput<T>
where
    T: 'static,
{
    /// A unique ID for this record. Any JSON value.
    pub id: Value,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkInput<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Deserialize an input record.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("cannot parse input record")
    }

    /// Read input records from a JSONL or CSV file, or from stdin.
    pub async fn read_stream(ui: &Ui, path: Option<&Path>) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(ui, path)
            .await?
            .map(|value| Self::from_json(value?))
            .boxed())
    }
}

/// How an output record should be counted in the summary.
pub trait WorkResult {
    /// Did this record fail?
    fn is_failed(&self) -> bool;

    /// Did this record need the fallback engine?
    fn used_fallback(&self) -> bool {
        false
    }

    /// How many warnings does this record carry?
    fn warning_count(&self) -> usize {
        0
    }
}

/// An output record: the input's `id` plus type-specific fields.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct WorkOutput<T>
where
    T: 'static,
{
    /// The ID of the input record.
    pub id: Value,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Serialize + WorkResult + Send + 'static,
{
    /// Write output records as JSONL, then summarize them. Fails if more
    /// records failed than `stream_opts` allows.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        stream_opts: &StreamOpts,
    ) -> Result<()> {
        let counters = Arc::new(Mutex::new(WorkCounters::default()));
        let output = {
            let counters = counters.clone();
            stream
                .map(move |output| {
                    let output = output?;
                    counters.update(&output.data);
                    serde_json::to_value(&output).context("cannot serialize output record")
                })
                .boxed()
        };
        write_output(path, output).await?;
        counters.finish(ui, stream_opts.allowed_failure_rate)
    }
}

/// Running totals for a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkCounters {
    pub total: usize,
    pub failed: usize,
    pub used_fallback: usize,
    pub warnings: usize,
}

/// Methods on the shared counters. Lives on `Mutex<WorkCounters>` because
/// that's what the output stream holds.
pub trait WorkCountersExt {
    /// Count one output record.
    fn update(&self, result: &dyn WorkResult);

    /// Report totals, and check the failure rate.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()>;
}

impl WorkCountersExt for Mutex<WorkCounters> {
    fn update(&self, result: &dyn WorkResult) {
        let mut counters = self.lock().expect("lock poisoned");
        counters.total += 1;
        if result.is_failed() {
            counters.failed += 1;
        }
        if result.used_fallback() {
            counters.used_fallback += 1;
        }
        counters.warnings += result.warning_count();
    }

    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").clone();
        info!(?counters, "batch finished");
        if counters.used_fallback > 0 {
            ui.display_message(
                "🔁",
                &format!("{} documents needed the fallback engine", counters.used_fallback),
            );
        }
        if counters.warnings > 0 {
            ui.display_message("⚠️", &format!("{} warnings in output", counters.warnings));
        }
        if counters.failed > 0 {
            ui.display_message(
                "❌",
                &format!("{} documents could not be read", counters.failed),
            );
        }

        let failure_rate = if counters.total == 0 {
            0.0
        } else {
            counters.failed as f32 / counters.total as f32
        };
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                counters.failed,
                counters.total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}
