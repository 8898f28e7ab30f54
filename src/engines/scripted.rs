//! A fake engine for tests, which replays a script of responses.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    preprocess::{ImageSource, PageTimings, PreparedImage, tests::test_png},
    prelude::*,
};

use super::{EngineError, EngineErrorKind, EngineResult, OcrEngine};

/// A small prepared image.
pub fn test_image(page_idx: usize) -> PreparedImage {
    PreparedImage {
        page_idx,
        source: ImageSource::Photo,
        width: 32,
        height: 32,
        dpi: None,
        enhancements: vec![],
        skipped_enhancements: vec![],
        png: test_png(32, 32).into(),
        timings: PageTimings::default(),
    }
}

/// One scripted response.
#[derive(Clone, Debug)]
pub enum Step {
    /// Return this text with this confidence.
    Text(&'static str, f64),
    /// Fail with this kind of error.
    Fail(EngineErrorKind),
    /// Never answer.
    Hang,
}

/// An engine which returns scripted responses, in order. Once the script runs
/// out, the last step repeats.
pub struct ScriptedEngine {
    name: &'static str,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedEngine {
    pub fn new(name: &'static str, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            name,
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// The page index of every call we received.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut last = self.last.lock().unwrap();
        match self.script.lock().unwrap().pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or(Step::Fail(EngineErrorKind::Unknown)),
        }
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn analyze(
        &self,
        image: &PreparedImage,
        _timeout: Duration,
    ) -> Result<EngineResult, EngineError> {
        self.calls.lock().unwrap().push(image.page_idx);
        match self.next_step() {
            Step::Text(text, confidence) => Ok(EngineResult {
                text: text.to_owned(),
                confidence,
                raw_metadata: serde_json::json!({ "engine": self.name }),
            }),
            Step::Fail(kind) => Err(EngineError::new(kind, format!("scripted {kind} failure"))),
            Step::Hang => {
                futures::future::pending::<()>().await;
                unreachable!("pending futures never resolve")
            }
        }
    }
}
