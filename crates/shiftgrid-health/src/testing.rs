//! Probes with scripted answers, for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::checker::{BoxFuture, Probe, ProbeResult};

/// A probe that replays a script, then repeats a fallback answer.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeResult>>,
    fallback: Mutex<ProbeResult>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    /// Answer each result in `script` once, then `fallback` forever.
    pub fn new(script: impl IntoIterator<Item = ProbeResult>, fallback: ProbeResult) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Mutex::new(fallback),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(result: ProbeResult) -> Self {
        Self::new([], result)
    }

    /// Sleep before answering each check.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Change the answer given once the script runs out.
    pub fn set_fallback(&self, result: ProbeResult) {
        *self.fallback.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    /// Number of checks run so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn next(&self) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| *self.fallback.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Probe for ScriptedProbe {
    fn check(&self) -> BoxFuture<'_, ProbeResult> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next()
        })
    }

    fn target(&self) -> String {
        "scripted".to_string()
    }
}
