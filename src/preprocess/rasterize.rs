//! Rasterizing PDF pages with Poppler.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

/// Something that can turn PDF pages into PNG images.
#[async_trait]
pub trait PdfRasterizer: Send + Sync + 'static {
    /// How many pages does this PDF have?
    async fn page_count(&self, pdf: &Path) -> Result<usize>;

    /// Render a single zero-based page to PNG.
    async fn rasterize_page(&self, pdf: &Path, page_idx: usize, dpi: u32) -> Result<Vec<u8>>;
}

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports some recoverable damage as errors. These are really
/// warnings, and the page usually renders fine.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output indicate a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Rasterizes PDFs using Poppler's `pdfinfo` and `pdftocairo` CLI tools.
#[derive(Clone, Debug, Default)]
pub struct PopplerRasterizer;

#[async_trait]
impl PdfRasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(path = %pdf.display()))]
    async fn page_count(&self, pdf: &Path) -> Result<usize> {
        let output = Command::new("pdfinfo")
            .arg(pdf)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run pdfinfo on {:?}", pdf.display()))?;
        check_for_command_failure("pdfinfo", &output, None)?;
        let stdout =
            String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
        parse_pdfinfo_page_count(&stdout)
    }

    #[instrument(level = "debug", skip_all, fields(path = %pdf.display(), page = page_idx + 1, dpi))]
    async fn rasterize_page(&self, pdf: &Path, page_idx: usize, dpi: u32) -> Result<Vec<u8>> {
        let tmpdir = tempfile::TempDir::with_prefix("page")?;
        // With `-singlefile`, pdftocairo appends `.png` itself.
        let out_base = tmpdir.path().join("page");
        let page_number = (page_idx + 1).to_string();

        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-r")
            .arg(dpi.to_string())
            .arg(pdf)
            .arg(&out_base)
            .kill_on_drop(true);

        // pdftocairo will use _at least_ 100% of a CPU, so we don't want to
        // run one per page of every document at once.
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", pdf.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let png_path = out_base.with_extension("png");
        tokio::fs::read(&png_path)
            .await
            .with_context(|| format!("pdftocairo did not write {:?}", png_path.display()))
    }
}

/// Extract the page count from `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {:?}", page_count_str))
}
