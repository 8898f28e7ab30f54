//! Tesseract OCR engine.

use std::time::Duration;

use serde_json::json;
use tokio::{process::Command, time};

use crate::{
    async_utils::check_for_command_failure,
    config::TesseractSettings,
    cpu_limit::with_cpu_semaphore,
    preprocess::PreparedImage,
    prelude::*,
};

use super::{EngineError, EngineErrorKind, EngineResult, OcrEngine};

/// Tesseract's confidence is never reported as high as the primary engine's.
pub const MAX_FALLBACK_CONFIDENCE: f64 = 0.9;

/// DPI we assume for images that don't tell us.
const DEFAULT_DPI: u32 = 300;

/// The TSV "level" of a single word.
const WORD_LEVEL: u32 = 5;

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractEngine {
    settings: TesseractSettings,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new(settings: TesseractSettings) -> Self {
        Self { settings }
    }

    /// Run tesseract and return its TSV output.
    async fn run(&self, image: &PreparedImage) -> Result<String, EngineError> {
        let unknown = |err: anyhow::Error| EngineError::new(EngineErrorKind::Unknown, format!("{err:?}"));

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")
            .map_err(|err| unknown(err.into()))?;
        let input_path = tmpdir.path().join("page.png");
        tokio::fs::write(&input_path, &image.png)
            .await
            .context("cannot write tesseract input file")
            .map_err(unknown)?;

        let dpi = image.dpi.unwrap_or(DEFAULT_DPI).to_string();
        let mut cmd = Command::new(&self.settings.command);
        cmd.arg(&input_path)
            .arg("stdout")
            .args(["--dpi", dpi.as_str()])
            .args(["-l", self.settings.languages.as_str()])
            .args(["--oem", "3", "--psm", "6"])
            .arg("tsv")
            .kill_on_drop(true);

        // Tesseract is CPU-bound, so count it against our CPU budget.
        let output = with_cpu_semaphore(|| async {
            cmd.output()
                .await
                .with_context(|| format!("cannot run {:?}", self.settings.command))
        })
        .await
        .map_err(unknown)?;
        check_for_command_failure("tesseract", &output, None).map_err(unknown)?;

        String::from_utf8(output.stdout).map_err(|err| {
            EngineError::new(
                EngineErrorKind::MalformedResponse,
                format!("tesseract output was not valid UTF-8: {err}"),
            )
        })
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(page = image.page_idx + 1))]
    async fn analyze(
        &self,
        image: &PreparedImage,
        timeout: Duration,
    ) -> Result<EngineResult, EngineError> {
        let tsv = time::timeout(timeout, self.run(image))
            .await
            .map_err(|_| {
                EngineError::new(
                    EngineErrorKind::Timeout,
                    format!("tesseract did not finish within {:?}", timeout),
                )
            })??;
        let page = parse_tsv(&tsv)
            .map_err(|msg| EngineError::new(EngineErrorKind::MalformedResponse, msg))?;
        let confidence = page.confidence();
        Ok(EngineResult {
            raw_metadata: json!({
                "engine": self.name(),
                "languages": self.settings.languages,
                "words": page.word_count,
                "mean_word_confidence": page.mean_word_confidence,
            }),
            text: page.text,
            confidence,
        })
    }
}

/// Text and statistics recovered from tesseract's TSV output.
#[derive(Debug, PartialEq)]
struct TsvPage {
    text: String,
    word_count: usize,
    /// Mean word confidence, from 0.0 to 1.0.
    mean_word_confidence: f64,
}

impl TsvPage {
    /// Combine word confidence with how much of the text looks like real
    /// characters, since tesseract is often confident about garbage.
    fn confidence(&self) -> f64 {
        if self.word_count == 0 {
            return 0.0;
        }
        let (recognized, total) = self
            .text
            .chars()
            .filter(|c| !c.is_whitespace())
            .fold((0usize, 0usize), |(recognized, total), c| {
                let is_recognized = c.is_alphanumeric() || ".,:;$%/-()'\"#&@!?".contains(c);
                (recognized + usize::from(is_recognized), total + 1)
            });
        let char_ratio = if total == 0 {
            0.0
        } else {
            recognized as f64 / total as f64
        };
        (0.5 * self.mean_word_confidence + 0.5 * char_ratio).clamp(0.0, MAX_FALLBACK_CONFIDENCE)
    }
}

/// Parse `tesseract ... tsv` output, rebuilding text from words grouped by
/// block, paragraph and line.
fn parse_tsv(tsv: &str) -> Result<TsvPage, String> {
    let mut lines = tsv.lines();
    match lines.next() {
        Some(header) if header.starts_with("level") => {}
        Some(other) => return Err(format!("unexpected tesseract TSV header: {:?}", other)),
        // No output at all means an empty page.
        None => {
            return Ok(TsvPage {
                text: String::new(),
                word_count: 0,
                mean_word_confidence: 0.0,
            });
        }
    }

    let mut text = String::new();
    let mut confidences = vec![];
    let mut word_count = 0;
    let mut previous: Option<(u32, u32, u32, u32)> = None;
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() < 11 {
            return Err(format!(
                "tesseract TSV row {} has {} fields",
                line_no + 2,
                fields.len()
            ));
        }
        let number = |idx: usize| -> Result<u32, String> {
            fields[idx].trim().parse::<u32>().map_err(|err| {
                format!("bad number {:?} in tesseract TSV row {}: {}", fields[idx], line_no + 2, err)
            })
        };
        if number(0)? != WORD_LEVEL {
            continue;
        }
        let word = fields.get(11).map_or("", |w| w.trim());
        if word.is_empty() {
            continue;
        }
        let conf = fields[10].trim().parse::<f64>().map_err(|err| {
            format!("bad confidence {:?} in tesseract TSV row {}: {}", fields[10], line_no + 2, err)
        })?;

        let key = (number(1)?, number(2)?, number(3)?, number(4)?);
        if let Some(prev) = previous {
            let separator = if (prev.0, prev.1, prev.2) != (key.0, key.1, key.2) {
                "\n\n"
            } else if prev.3 != key.3 {
                "\n"
            } else {
                " "
            };
            text.push_str(separator);
        }
        text.push_str(word);
        previous = Some(key);
        word_count += 1;
        if conf >= 0.0 {
            confidences.push((conf / 100.0).clamp(0.0, 1.0));
        }
    }

    let mean_word_confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    Ok(TsvPage {
        text,
        word_count,
        mean_word_confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scripted::test_image;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn row(level: u32, block: u32, par: u32, line: u32, conf: f64, text: &str) -> String {
        format!("{level}\t1\t{block}\t{par}\t{line}\t1\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn rebuilds_lines_and_paragraphs() {
        let tsv = [
            HEADER.to_owned(),
            row(1, 0, 0, 0, -1.0, ""),
            row(5, 1, 1, 1, 96.0, "Cuenta"),
            row(5, 1, 1, 1, 90.0, "No."),
            row(5, 1, 1, 2, 88.0, "12345"),
            row(4, 2, 1, 1, -1.0, ""),
            row(5, 2, 1, 1, 80.0, "Total"),
            row(5, 2, 1, 1, 94.0, " "),
        ]
        .join("\n");
        let page = parse_tsv(&tsv).unwrap();
        assert_eq!(page.text, "Cuenta No.\n12345\n\nTotal");
        assert_eq!(page.word_count, 4);
        assert!((page.mean_word_confidence - 0.885).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_capped() {
        let tsv = [HEADER.to_owned(), row(5, 1, 1, 1, 100.0, "perfect")].join("\n");
        let page = parse_tsv(&tsv).unwrap();
        assert_eq!(page.confidence(), MAX_FALLBACK_CONFIDENCE);
    }

    #[test]
    fn garbage_lowers_confidence() {
        let tsv = [HEADER.to_owned(), row(5, 1, 1, 1, 80.0, "~~|~")].join("\n");
        let page = parse_tsv(&tsv).unwrap();
        assert!((page.confidence() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn empty_output_means_no_words() {
        let page = parse_tsv("").unwrap();
        assert_eq!(page.word_count, 0);
        assert_eq!(page.confidence(), 0.0);
        let page = parse_tsv(HEADER).unwrap();
        assert_eq!(page.text, "");
        assert_eq!(page.confidence(), 0.0);
    }

    #[test]
    fn malformed_output_is_rejected() {
        assert!(parse_tsv("Error opening data file").is_err());
        assert!(parse_tsv(&format!("{HEADER}\n5\t1\t1")).is_err());
        assert!(parse_tsv(&format!("{HEADER}\n{}", row(5, 1, 1, 1, 90.0, "x").replace("90", "high"))).is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_an_unknown_error() {
        let engine = TesseractEngine::new(TesseractSettings {
            command: "/nonexistent/tesseract".to_owned(),
            ..TesseractSettings::default()
        });
        let err = engine
            .analyze(&test_image(0), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unknown);
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn reads_a_blank_page() {
        let engine = TesseractEngine::new(TesseractSettings::default());
        let result = engine
            .analyze(&test_image(0), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(result.confidence <= MAX_FALLBACK_CONFIDENCE);
    }
}
