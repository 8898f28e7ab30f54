//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{async_utils::BoxedStream, prelude::*};

pub mod ocr;
pub mod schema;

/// Options shared by subcommands that process a stream of records.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Only process the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// How many documents to OCR at once.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of documents may fail before we exit with an error?
    /// Specified as a number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply `--take-first` to an input stream.
    pub fn apply_stream_input_opts<T>(&self, input: BoxedStream<Result<T>>) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        match self.take_first {
            Some(take_first) => input.take(take_first).boxed(),
            None => input,
        }
    }
}
