//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    prelude::*,
    work::{WorkInput, WorkOutput},
};

use super::ocr::{OcrInput, OcrOutput};

/// The record types we can describe.
///
/// Parsed as PascalCase, because these are type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One line of `ocr` input.
    OcrInput,
    /// One line of `ocr` output.
    OcrOutput,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The record type to describe.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// Where to write the schema. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.schema_type {
        SchemaType::OcrInput => schema_for!(WorkInput<OcrInput>),
        SchemaType::OcrOutput => schema_for!(WorkOutput<OcrOutput>),
    };
    let json = serde_json::to_string_pretty(&schema).context("cannot serialize schema")?;

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    wtr.write_all(json.as_bytes())
        .await
        .context("cannot write schema")?;
    wtr.write_all(b"\n").await.context("cannot write schema")?;
    wtr.flush().await.context("cannot flush schema")?;
    Ok(())
}
