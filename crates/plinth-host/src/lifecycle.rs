//! Plugin load states and retirement of native generations.
//!
//! Retiring a generation marks its artifact draining, which refuses new
//! leases. The library is closed on a later [`RetiredGenerations::collect`]
//! once no lease is outstanding.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::events::UnloadReport;
use crate::native::NativeArtifact;

/// Poll interval while waiting for in-flight calls to finish.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Discovered,
    Loading,
    Loaded,
    Failed { reason: String },
    /// Routes are gone; waiting for calls into the old generation to finish.
    Unloading { inflight: usize },
    Unloaded,
}

impl LoadState {
    pub fn name(&self) -> &'static str {
        match self {
            LoadState::Discovered => "discovered",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
            LoadState::Failed { .. } => "failed",
            LoadState::Unloading { .. } => "unloading",
            LoadState::Unloaded => "unloaded",
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadState::Loaded)
    }
}

/// A generation that finished retiring, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retirement {
    pub plugin: String,
    pub generation: u64,
    /// `Unloaded` or `Blocked`; pending generations are not reported.
    pub outcome: UnloadReport,
}

/// Native generations that left the route table but may still be in use.
#[derive(Debug, Default)]
pub struct RetiredGenerations {
    retired: Vec<Arc<NativeArtifact>>,
}

impl RetiredGenerations {
    /// Stop new calls into `artifact` and queue it for closing.
    pub fn retire(&mut self, artifact: Arc<NativeArtifact>) {
        artifact.begin_drain();
        tracing::debug!(
            plugin = %artifact.id(),
            generation = artifact.generation(),
            inflight = artifact.inflight(),
            "generation retired"
        );
        self.retired.push(artifact);
    }

    pub fn len(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retired.is_empty()
    }

    /// Calls still running in retired generations of `plugin`.
    pub fn inflight_for(&self, plugin: &str) -> usize {
        self.retired
            .iter()
            .filter(|a| a.id() == plugin)
            .map(|a| a.inflight())
            .sum()
    }

    pub fn is_pending(&self, plugin: &str, generation: u64) -> bool {
        self.retired
            .iter()
            .any(|a| a.id() == plugin && a.generation() == generation)
    }

    /// Close every idle retired generation.
    ///
    /// A generation whose close fails is dropped from the queue and reported
    /// as blocked: its handle has been consumed and cannot be retried.
    pub fn collect(&mut self) -> Vec<Retirement> {
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.retired.len() {
            let outcome = match self.retired[i].try_close() {
                Ok(false) => {
                    i += 1;
                    continue;
                }
                Ok(true) => UnloadReport::Unloaded,
                Err(e) => UnloadReport::Blocked {
                    reason: e.to_string(),
                },
            };
            let artifact = self.retired.swap_remove(i);
            match &outcome {
                UnloadReport::Blocked { reason } => tracing::error!(
                    plugin = %artifact.id(),
                    generation = artifact.generation(),
                    "library could not be unloaded: {reason}"
                ),
                _ => tracing::info!(
                    plugin = %artifact.id(),
                    generation = artifact.generation(),
                    "library unloaded"
                ),
            }
            finished.push(Retirement {
                plugin: artifact.id().to_string(),
                generation: artifact.generation(),
                outcome,
            });
        }
        finished
    }
}

/// Wait until `artifact` has no calls in flight, or `timeout` elapses.
///
/// Returns whether the artifact became idle.
pub async fn wait_idle(artifact: &NativeArtifact, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if artifact.inflight() == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, FakeOpener};

    fn load(opener: &FakeOpener, id: &str, generation: u64) -> Arc<NativeArtifact> {
        let path =
            std::path::PathBuf::from(format!("/plugins/{id}.{}", std::env::consts::DLL_EXTENSION));
        crate::loader::load_native(opener, id, &path, generation, 2)
            .unwrap()
            .artifact
    }

    #[test]
    fn test_load_state_serialization() {
        let json = serde_json::to_value(LoadState::Unloading { inflight: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "unloading", "inflight": 2}));
        let json = serde_json::to_value(LoadState::Failed {
            reason: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "boom");
        assert_eq!(LoadState::Loaded.name(), "loaded");
        assert!(LoadState::Loaded.is_loaded());
        assert!(!LoadState::Unloaded.is_loaded());
    }

    #[test]
    fn test_idle_generation_closes_on_collect() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather());
        let artifact = load(&opener, "weather", 1);

        let mut retired = RetiredGenerations::default();
        retired.retire(Arc::clone(&artifact));
        assert!(artifact.is_draining());
        assert!(retired.is_pending("weather", 1));

        let finished = retired.collect();
        assert_eq!(
            finished,
            vec![Retirement {
                plugin: "weather".into(),
                generation: 1,
                outcome: UnloadReport::Unloaded
            }]
        );
        assert!(retired.is_empty());
        assert!(artifact.is_closed());
        assert_eq!(opener.stats("weather").closed(), 1);
        assert_eq!(opener.stats("weather").open_count(), 0);
    }

    #[test]
    fn test_leased_generation_stays_pending() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather());
        let artifact = load(&opener, "weather", 3);
        let lease = artifact.lease().unwrap();

        let mut retired = RetiredGenerations::default();
        retired.retire(Arc::clone(&artifact));
        assert!(artifact.lease().is_none());
        assert!(retired.collect().is_empty());
        assert_eq!(retired.inflight_for("weather"), 1);
        assert!(!artifact.is_closed());

        drop(lease);
        let finished = retired.collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome, UnloadReport::Unloaded);
        assert_eq!(retired.inflight_for("weather"), 0);
    }

    #[test]
    fn test_failed_close_is_blocked() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather().failing_close());
        let artifact = load(&opener, "weather", 1);

        let mut retired = RetiredGenerations::default();
        retired.retire(artifact);
        let finished = retired.collect();
        assert_eq!(finished.len(), 1);
        match &finished[0].outcome {
            UnloadReport::Blocked { reason } => assert!(reason.contains("refused")),
            other => panic!("expected Blocked, got {other:?}"),
        }
        assert!(retired.is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_while_leased() {
        let opener = FakeOpener::new();
        opener.register("weather", fixtures::weather());
        let artifact = load(&opener, "weather", 1);
        let lease = artifact.lease().unwrap();

        assert!(!wait_idle(&artifact, Duration::from_millis(30)).await);
        drop(lease);
        assert!(wait_idle(&artifact, Duration::from_millis(30)).await);
    }
}
