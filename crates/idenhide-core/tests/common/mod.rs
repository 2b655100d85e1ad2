//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use idenhide_core::{
    DetectionResult, DispatcherConfig, ItemPayload, ItemProcessor, ProcessOptions, ProcessingError,
    RenderHandle, RetryPolicy, Strategy,
};
use idenhide_abstraction::{BoundingBox, Detection, DetectionLabel};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Processor whose behaviour is scripted per item name.
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    /// Items whose detection is rejected.
    pub fail: HashSet<String>,
    /// Strategies whose `prepare` fails.
    pub prepare_fails: HashSet<Strategy>,
    /// Panic inside `process` while running under the parallel strategy.
    pub panic_in_parallel: bool,
    /// How many times `fetch_rendered` answers NotReady before succeeding.
    pub not_ready_times: u32,
    /// Per-item delay inside `process`.
    pub delays: HashMap<String, Duration>,
    /// Delay for every item without an explicit one.
    pub default_delay: Option<Duration>,

    pub current: Mutex<Option<Strategy>>,
    pub prepared: Mutex<Vec<Strategy>>,
    pub processed: Mutex<Vec<String>>,
    pub fetches: Mutex<HashMap<String, u32>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(names: &[&str]) -> Self {
        Self { fail: names.iter().map(|n| (*n).to_string()).collect(), ..Self::default() }
    }

    pub fn fetch_attempts(&self, name: &str) -> u32 {
        self.fetches.lock().get(name).copied().unwrap_or_default()
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn prepare(&self, strategy: Strategy, _concurrency: usize) -> Result<(), ProcessingError> {
        self.prepared.lock().push(strategy);
        if self.prepare_fails.contains(&strategy) {
            return Err(ProcessingError::RequestError(format!("{strategy} executor unavailable")));
        }
        *self.current.lock() = Some(strategy);
        Ok(())
    }

    async fn process(
        &self,
        item: &ItemPayload,
        _options: &ProcessOptions,
    ) -> Result<DetectionResult, ProcessingError> {
        if self.panic_in_parallel && *self.current.lock() == Some(Strategy::Parallel) {
            panic!("worker pool exploded on {}", item.name);
        }
        let delay = self.delays.get(&item.name).copied().or(self.default_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.processed.lock().push(item.name.clone());
        if self.fail.contains(&item.name) {
            return Err(ProcessingError::Rejected(format!("cannot decode {}", item.name)));
        }
        Ok(DetectionResult::from_detections(vec![Detection {
            label: DetectionLabel::Face,
            confidence: 0.9,
            bbox: BoundingBox { x1: 1, y1: 1, x2: 5, y2: 5 },
        }]))
    }

    async fn render_blur(
        &self,
        item: &ItemPayload,
        detection: &DetectionResult,
        _options: &ProcessOptions,
    ) -> Result<RenderHandle, ProcessingError> {
        Ok(RenderHandle { locator: item.name.clone(), regions_blurred: detection.total() as u32 })
    }

    async fn fetch_rendered(&self, handle: &RenderHandle) -> Result<Bytes, ProcessingError> {
        let attempt = {
            let mut fetches = self.fetches.lock();
            let count = fetches.entry(handle.locator.clone()).or_default();
            *count += 1;
            *count
        };
        if attempt <= self.not_ready_times {
            return Err(ProcessingError::NotReady(format!("{} not on disk yet", handle.locator)));
        }
        Ok(Bytes::from(format!("blurred:{}", handle.locator)))
    }
}

/// Dispatcher settings with millisecond backoff.
pub fn fast_config(concurrency: usize) -> DispatcherConfig {
    DispatcherConfig {
        concurrency,
        retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(50), 2.0),
        ..DispatcherConfig::default()
    }
}

/// Writes `names` as small image files into `dir`.
pub fn write_images(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), format!("original:{name}")).unwrap();
    }
}
