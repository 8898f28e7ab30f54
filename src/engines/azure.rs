//! Azure Document Intelligence "Read" engine.
//!
//! Analysis is asynchronous on Azure's side: we POST the image, get back an
//! `Operation-Location` URL, and poll it until the operation finishes.

use std::time::Duration;

use leaky_bucket::RateLimiter;
use reqwest::{Client, Response, header};
use serde_json::json;
use tokio::time;

use crate::{
    config::AzureSettings,
    preprocess::PreparedImage,
    prelude::*,
};

use super::{EngineError, EngineErrorKind, EngineResult, OcrEngine};

/// API versions before this one only exist under the `formrecognizer` path.
const FIRST_DOCUMENT_INTELLIGENCE_API_VERSION: &str = "2023-10-31";

/// OCR engine backed by Azure Document Intelligence.
pub struct AzureReadEngine {
    client: Client,
    settings: AzureSettings,
    rate_limiter: Option<RateLimiter>,
}

impl AzureReadEngine {
    /// Create a new engine. Missing credentials are not an error here; they
    /// are reported as [`EngineErrorKind::Auth`] on each call, so that every
    /// document still gets a structured outcome.
    pub fn new(settings: AzureSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .context("cannot build HTTP client")?;
        if settings.endpoint.is_none() || settings.api_key.is_none() {
            warn!("Azure Document Intelligence is not configured; every document will use the fallback engine");
        }
        let rate_limiter = settings.rate_limit.as_ref().map(|rl| rl.to_rate_limiter());
        Ok(Self {
            client,
            settings,
            rate_limiter,
        })
    }

    /// Get our endpoint and key, or fail with an auth error.
    fn credentials(&self) -> Result<(&str, &str), EngineError> {
        let endpoint = self.settings.endpoint.as_deref();
        let api_key = self.settings.api_key.as_deref();
        match (endpoint, api_key) {
            (Some(endpoint), Some(api_key)) => Ok((endpoint, api_key)),
            _ => {
                let mut missing = vec![];
                if endpoint.is_none() {
                    missing.push("AZURE_DI_ENDPOINT");
                }
                if api_key.is_none() {
                    missing.push("AZURE_DI_API_KEY");
                }
                Err(EngineError::new(
                    EngineErrorKind::Auth,
                    format!(
                        "missing Azure Document Intelligence configuration: {}",
                        missing.join(", ")
                    ),
                ))
            }
        }
    }

    /// The URL to POST documents to.
    fn analyze_url(&self, endpoint: &str) -> String {
        let service = if self.settings.api_version.as_str()
            < FIRST_DOCUMENT_INTELLIGENCE_API_VERSION
        {
            "formrecognizer"
        } else {
            "documentintelligence"
        };
        format!(
            "{}/{}/documentModels/{}:analyze?api-version={}",
            endpoint.trim_end_matches('/'),
            service,
            self.settings.model,
            self.settings.api_version,
        )
    }

    /// Submit an image and return the operation URL.
    async fn submit(
        &self,
        endpoint: &str,
        api_key: &str,
        image: &PreparedImage,
    ) -> Result<String, EngineError> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let response = self
            .client
            .post(self.analyze_url(endpoint))
            .header("Ocp-Apim-Subscription-Key", api_key)
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::ACCEPT, "application/json")
            .body(image.png.to_vec())
            .send()
            .await
            .map_err(|err| EngineError::from_reqwest(&err))?;
        let response = check_status(response).await?;

        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                EngineError::new(
                    EngineErrorKind::MalformedResponse,
                    "Azure response missing Operation-Location header",
                )
            })
    }

    /// Poll until the operation finishes, or we run out of polls.
    async fn poll(
        &self,
        api_key: &str,
        operation_url: &str,
    ) -> Result<(AnalyzeResult, u32), EngineError> {
        let mut delay = self.settings.initial_poll_wait;
        for poll in 1..=self.settings.poll_attempts {
            time::sleep(delay).await;

            let response = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", api_key)
                .header(header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|err| EngineError::from_reqwest(&err))?;
            let body = check_status(response)
                .await?
                .text()
                .await
                .map_err(|err| EngineError::from_reqwest(&err))?;
            let operation = serde_json::from_str::<AnalyzeOperation>(&body).map_err(|err| {
                EngineError::new(
                    EngineErrorKind::MalformedResponse,
                    format!("cannot parse Azure poll response: {err}"),
                )
            })?;

            match operation.status.to_ascii_lowercase().as_str() {
                "succeeded" => {
                    let result = operation.analyze_result.ok_or_else(|| {
                        EngineError::new(
                            EngineErrorKind::MalformedResponse,
                            "Azure operation succeeded without an analyzeResult",
                        )
                    })?;
                    return Ok((result, poll));
                }
                status @ ("failed" | "canceled") => {
                    return Err(EngineError::new(
                        EngineErrorKind::Unknown,
                        format!("Azure OCR {}: {}", status, operation.error_message()),
                    ));
                }
                "notstarted" | "running" => {
                    trace!(poll, status = %operation.status, "Azure operation still running");
                }
                other => {
                    return Err(EngineError::new(
                        EngineErrorKind::Unknown,
                        format!("unexpected Azure operation status {:?}", other),
                    ));
                }
            }

            delay = next_poll_wait(
                delay,
                self.settings.poll_backoff,
                self.settings.max_poll_wait,
            );
        }

        Err(EngineError::new(
            EngineErrorKind::Timeout,
            format!(
                "Azure OCR still running after {} polls",
                self.settings.poll_attempts
            ),
        ))
    }

    /// Submit, poll and convert.
    async fn analyze_inner(&self, image: &PreparedImage) -> Result<EngineResult, EngineError> {
        let (endpoint, api_key) = self.credentials()?;
        let operation_url = self.submit(endpoint, api_key, image).await?;
        let (result, polls) = self.poll(api_key, &operation_url).await?;

        let text = result.text();
        let confidence = result.mean_word_confidence();
        let raw_metadata = json!({
            "engine": self.name(),
            "model": result.model_id.as_deref().unwrap_or(&self.settings.model),
            "api_version": result.api_version.as_deref().unwrap_or(&self.settings.api_version),
            "polls": polls,
            "pages": result.pages.len(),
            "words": result.word_count(),
        });
        Ok(EngineResult {
            text,
            confidence,
            raw_metadata,
        })
    }
}

#[async_trait]
impl OcrEngine for AzureReadEngine {
    fn name(&self) -> &'static str {
        "azure_read"
    }

    #[instrument(level = "debug", skip_all, fields(page = image.page_idx + 1))]
    async fn analyze(
        &self,
        image: &PreparedImage,
        timeout: Duration,
    ) -> Result<EngineResult, EngineError> {
        time::timeout(timeout, self.analyze_inner(image))
            .await
            .map_err(|_| {
                EngineError::new(
                    EngineErrorKind::Timeout,
                    format!("Azure OCR did not finish within {:?}", timeout),
                )
            })?
    }
}

/// Grow the wait between polls by `backoff`, up to `max`. Factors too big
/// to represent give `max`.
fn next_poll_wait(delay: Duration, backoff: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * backoff).map_or(max, |next| next.min(max))
}

/// Turn an HTTP error status into an [`EngineError`], keeping the body for
/// diagnostics.
async fn check_status(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::from_status(status, &body))
    }
}

/// The body returned when polling an analyze operation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    #[serde(default)]
    status: String,
    analyze_result: Option<AnalyzeResult>,
    error: Option<AzureError>,
}

impl AnalyzeOperation {
    /// Find the most useful error message Azure gave us.
    fn error_message(&self) -> String {
        if let Some(error) = &self.error {
            let message = error.message.as_deref().or(error.code.as_deref());
            let inner = error
                .innererror
                .as_ref()
                .and_then(|inner| inner.message.as_deref());
            match (message, inner) {
                (Some(message), Some(inner)) => return format!("{message}: {inner}"),
                (None, Some(inner)) => return inner.to_owned(),
                (Some(message), None) => return message.to_owned(),
                (None, None) => {}
            }
        }
        if let Some(result) = &self.analyze_result {
            let messages = result
                .errors
                .iter()
                .filter_map(|e| e.message.as_deref())
                .collect::<Vec<_>>();
            if !messages.is_empty() {
                return messages.join("; ");
            }
        }
        "Unknown error".to_owned()
    }
}

/// An error reported by Azure.
#[derive(Debug, Deserialize)]
struct AzureError {
    code: Option<String>,
    message: Option<String>,
    innererror: Option<Box<AzureError>>,
}

/// The result of a finished analysis.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    api_version: Option<String>,
    model_id: Option<String>,
    content: Option<String>,
    #[serde(default)]
    pages: Vec<AnalyzedPage>,
    #[serde(default)]
    errors: Vec<AzureError>,
}

impl AnalyzeResult {
    /// The full text, falling back to lines if Azure didn't give us `content`.
    fn text(&self) -> String {
        match &self.content {
            Some(content) if !content.trim().is_empty() => content.clone(),
            _ => self
                .pages
                .iter()
                .flat_map(|page| page.lines.iter().map(|line| line.content.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Mean confidence over every word, or 0.0 if there are none.
    fn mean_word_confidence(&self) -> f64 {
        let confidences = self
            .pages
            .iter()
            .flat_map(|page| page.words.iter().filter_map(|w| w.confidence))
            .collect::<Vec<_>>();
        if confidences.is_empty() {
            0.0
        } else {
            let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
            mean.clamp(0.0, 1.0)
        }
    }

    fn word_count(&self) -> usize {
        self.pages.iter().map(|page| page.words.len()).sum()
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzedPage {
    #[serde(default)]
    lines: Vec<AnalyzedLine>,
    #[serde(default)]
    words: Vec<AnalyzedWord>,
}

#[derive(Debug, Deserialize)]
struct AnalyzedLine {
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnalyzedWord {
    confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header as header_matcher, method, path},
    };

    use super::*;
    use crate::engines::scripted::test_image;

    const ANALYZE_PATH: &str = "/documentintelligence/documentModels/prebuilt-read:analyze";

    fn settings(server: &MockServer) -> AzureSettings {
        AzureSettings {
            endpoint: Some(format!("{}/", server.uri())),
            api_key: Some("test-key".to_owned()),
            poll_attempts: 3,
            initial_poll_wait: Duration::from_millis(1),
            max_poll_wait: Duration::from_millis(5),
            http_timeout: Duration::from_secs(5),
            ..AzureSettings::default()
        }
    }

    async fn mount_submit(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .and(header_matcher("Ocp-Apim-Subscription-Key", "test-key"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Operation-Location", format!("{}/operations/1", server.uri())),
            )
            .mount(server)
            .await;
    }

    async fn mount_poll(server: &MockServer, body: Value) {
        Mock::given(method("GET"))
            .and(path("/operations/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn analyze(server: &MockServer) -> Result<EngineResult, EngineError> {
        let engine = AzureReadEngine::new(settings(server)).unwrap();
        engine.analyze(&test_image(0), Duration::from_secs(10)).await
    }

    #[tokio::test]
    async fn succeeds_with_mean_word_confidence() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        Mock::given(method("GET"))
            .and(path("/operations/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_poll(
            &server,
            json!({
                "status": "succeeded",
                "analyzeResult": {
                    "modelId": "prebuilt-read",
                    "content": "Factura de luz\nTotal: $42.00",
                    "pages": [{
                        "lines": [{"content": "Factura de luz"}, {"content": "Total: $42.00"}],
                        "words": [
                            {"content": "Factura", "confidence": 0.9},
                            {"content": "de", "confidence": 0.8},
                            {"content": "luz", "confidence": 1.0}
                        ]
                    }]
                }
            }),
        )
        .await;

        let result = analyze(&server).await.unwrap();
        assert_eq!(result.text, "Factura de luz\nTotal: $42.00");
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.raw_metadata["polls"], 2);
        assert_eq!(result.raw_metadata["words"], 3);
    }

    #[tokio::test]
    async fn falls_back_to_lines_when_content_is_missing() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(
            &server,
            json!({
                "status": "succeeded",
                "analyzeResult": {
                    "pages": [{"lines": [{"content": "one"}, {"content": "two"}]}]
                }
            }),
        )
        .await;

        let result = analyze(&server).await.unwrap();
        assert_eq!(result.text, "one\ntwo");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        for (status, kind) in [
            (401, EngineErrorKind::Auth),
            (403, EngineErrorKind::Auth),
            (429, EngineErrorKind::RateLimit),
            (503, EngineErrorKind::RateLimit),
            (504, EngineErrorKind::Timeout),
            (500, EngineErrorKind::Unknown),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(ANALYZE_PATH))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;
            let err = analyze(&server).await.unwrap_err();
            assert_eq!(err.kind, kind, "HTTP {status}");
            assert!(err.message.contains("nope"));
        }
    }

    #[tokio::test]
    async fn failed_operations_are_unknown_errors() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(
            &server,
            json!({
                "status": "failed",
                "error": {
                    "code": "InvalidRequest",
                    "message": "Invalid request.",
                    "innererror": {"code": "InvalidContent", "message": "The file is corrupted."}
                }
            }),
        )
        .await;

        let err = analyze(&server).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Unknown);
        assert!(err.message.contains("Invalid request.: The file is corrupted."));
    }

    #[tokio::test]
    async fn missing_operation_location_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ANALYZE_PATH))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let err = analyze(&server).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn unparseable_poll_responses_are_malformed() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        Mock::given(method("GET"))
            .and(path("/operations/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let err = analyze(&server).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn succeeded_without_result_is_malformed() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(&server, json!({"status": "succeeded"})).await;
        let err = analyze(&server).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn running_forever_times_out() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(&server, json!({"status": "running"})).await;
        let err = analyze(&server).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Timeout);
    }

    #[tokio::test]
    async fn missing_configuration_is_an_auth_error() {
        let engine = AzureReadEngine::new(AzureSettings::default()).unwrap();
        let err = engine
            .analyze(&test_image(0), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Auth);
        assert!(err.message.contains("AZURE_DI_ENDPOINT"));
        assert!(err.message.contains("AZURE_DI_API_KEY"));
    }

    #[test]
    fn old_api_versions_use_formrecognizer() {
        let engine = AzureReadEngine::new(AzureSettings {
            api_version: "2023-07-31".to_owned(),
            ..AzureSettings::default()
        })
        .unwrap();
        assert_eq!(
            engine.analyze_url("https://example.test/"),
            "https://example.test/formrecognizer/documentModels/prebuilt-read:analyze?api-version=2023-07-31"
        );

        let engine = AzureReadEngine::new(AzureSettings::default()).unwrap();
        assert!(engine
            .analyze_url("https://example.test")
            .starts_with("https://example.test/documentintelligence/"));
    }

    #[test]
    fn poll_wait_grows_up_to_the_cap() {
        let max = Duration::from_secs(2);
        let wait = next_poll_wait(Duration::from_secs(1), 1.5, max);
        assert_eq!(wait, Duration::from_millis(1500));
        assert_eq!(next_poll_wait(wait, 1.5, max), max);
        for backoff in [f64::NAN, f64::INFINITY, 1e30] {
            assert_eq!(next_poll_wait(Duration::from_secs(1), backoff, max), max);
        }
    }
}
