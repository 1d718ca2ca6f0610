//! Request dispatcher: routes one request into one plugin handler.
//!
//! A dispatch matches against the current route table snapshot, takes a
//! lease on the owning artifact, and runs the handler on the blocking pool
//! under `catch_unwind`. The caller waits at most the configured timeout;
//! a handler that outlives it keeps its lease and permit until it returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use plinth_abi::{panic_message, RequestEnvelope, ResponseEnvelope};

use crate::error::DispatchError;
use crate::native::Lease;
use crate::routes::{RouteEntry, RouteMatch, RouteTable};

/// Responses larger than this are treated as a handler fault.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

pub struct Dispatcher {
    routes: Arc<ArcSwap<RouteTable>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(routes: Arc<ArcSwap<RouteTable>>, timeout: Duration) -> Self {
        Self { routes, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Route `request` to its handler and return the plugin's response.
    pub async fn dispatch(
        &self,
        mut request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let matched = self.routes.load().matches(&request.method, &request.path);
        let Some(RouteMatch { entry, params }) = matched else {
            return Err(DispatchError::NotFound {
                method: request.method,
                path: request.path,
            });
        };
        // A draining artifact has already left the table; a stale snapshot
        // can still point at it.
        let Some(lease) = entry.handler.artifact().lease() else {
            return Err(DispatchError::NotFound {
                method: request.method,
                path: request.path,
            });
        };
        request.method.clone_from(&entry.method);
        request.params = params;

        let plugin = entry.plugin.clone();
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, invoke(entry, lease, request)).await {
            Ok(result) => {
                tracing::debug!(
                    plugin = %plugin,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "request dispatched"
                );
                result
            }
            Err(_) => {
                tracing::warn!(
                    plugin = %plugin,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "handler timed out, call left running"
                );
                Err(DispatchError::Timeout {
                    plugin,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

async fn invoke(
    entry: Arc<RouteEntry>,
    lease: Lease,
    request: RequestEnvelope,
) -> Result<ResponseEnvelope, DispatchError> {
    let fault = |reason: String| DispatchError::HandlerFault {
        plugin: entry.plugin.clone(),
        reason,
    };

    let permit = lease
        .artifact()
        .call_permits()
        .acquire_owned()
        .await
        .map_err(|_| fault("plugin no longer accepts calls".into()))?;
    let payload = request
        .encode()
        .map_err(|e| fault(format!("cannot encode request: {e}")))?;
    let handler = entry.handler.func();

    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        // SAFETY: the lease keeps the library mapped for the whole call and
        // for the release of its response buffer.
        let returned = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            handler(payload.as_ptr(), payload.len())
        }));
        match returned {
            Ok(buf) => lease.take_buffer(buf, MAX_RESPONSE_BYTES),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic))),
        }
    })
    .await;

    let bytes = match outcome {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(reason)) => return Err(fault(reason)),
        Err(e) => return Err(fault(format!("handler task failed: {e}"))),
    };
    ResponseEnvelope::decode(&bytes).map_err(|e| fault(format!("malformed response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_native, LoadedNative};
    use crate::testing::{fixtures, FakeLibrary, FakeOpener};

    fn load_all(plugins: Vec<(&str, FakeLibrary)>) -> (Arc<ArcSwap<RouteTable>>, Vec<LoadedNative>) {
        let opener = FakeOpener::new();
        let mut loaded = Vec::new();
        for (generation, (id, library)) in plugins.into_iter().enumerate() {
            opener.register(id, library);
            let path = std::path::PathBuf::from(format!(
                "/plugins/{id}.{}",
                std::env::consts::DLL_EXTENSION
            ));
            loaded.push(load_native(&opener, id, &path, generation as u64 + 1, 4).unwrap());
        }
        let table = RouteTable::build(loaded.iter().flat_map(|l| l.routes.iter()));
        (Arc::new(ArcSwap::from_pointee(table)), loaded)
    }

    fn dispatcher(routes: Arc<ArcSwap<RouteTable>>) -> Dispatcher {
        Dispatcher::new(routes, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_unmatched_is_not_found() {
        let (routes, _loaded) = load_all(vec![("weather", fixtures::weather())]);
        let err = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/clock/now"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::NotFound {
                method: "GET".into(),
                path: "/clock/now".into()
            }
        );
    }

    #[tokio::test]
    async fn test_weather_now() {
        let (routes, _loaded) = load_all(vec![("weather", fixtures::weather())]);
        let response = dispatcher(routes)
            .dispatch(RequestEnvelope::new("get", "/weather/now/"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["conditions"], "sunny");
    }

    #[tokio::test]
    async fn test_echo_round_trip_is_byte_identical() {
        let (routes, _loaded) = load_all(vec![("echo", fixtures::echo())]);
        let payload: Vec<u8> = (0..=255u8).chain(b"{\"not\": \"json\"".iter().copied()).collect();
        let response = dispatcher(routes)
            .dispatch(
                RequestEnvelope::new("POST", "/echo")
                    .with_header("content-type", "application/octet-stream")
                    .with_body(payload.clone()),
            )
            .await
            .unwrap();
        assert_eq!(response.body, payload);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "application/octet-stream"));
    }

    #[tokio::test]
    async fn test_params_query_and_headers_forwarded() {
        let (routes, _loaded) = load_all(vec![("echo", fixtures::echo())]);
        let response = dispatcher(routes)
            .dispatch(
                RequestEnvelope::new("GET", "/echo/hello")
                    .with_query("repeat", "3")
                    .with_header("User-Agent", "plinth-test"),
            )
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["word"], "hello");
        assert_eq!(body["repeat"], "3");
        assert_eq!(body["agent"], "plinth-test");
    }

    #[tokio::test]
    async fn test_routes_dispatch_only_to_owner() {
        let (routes, _loaded) = load_all(vec![
            ("weather", fixtures::weather()),
            ("echo", fixtures::echo()),
        ]);
        let dispatcher = dispatcher(routes);
        let weather = dispatcher
            .dispatch(RequestEnvelope::new("POST", "/weather/refresh").with_body("now"))
            .await
            .unwrap();
        assert_eq!(weather.status, 202);
        assert_eq!(weather.body, b"now");

        let echo = dispatcher
            .dispatch(RequestEnvelope::new("POST", "/echo").with_body("ping"))
            .await
            .unwrap();
        assert_eq!(echo.status, 200);
        assert_eq!(echo.body, b"ping");
    }

    #[tokio::test]
    async fn test_static_release_mode_handler() {
        let (routes, _loaded) = load_all(vec![("alpha", fixtures::alpha())]);
        let response = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/alpha/only"))
            .await
            .unwrap();
        assert_eq!(response.body, b"alpha");
    }

    #[tokio::test]
    async fn test_first_loaded_wins_collision() {
        let (routes, _loaded) = load_all(vec![
            ("alpha", fixtures::alpha()),
            ("beta", fixtures::beta()),
        ]);
        assert_eq!(routes.load().collisions().len(), 1);
        let dispatcher = dispatcher(routes);
        let shared = dispatcher
            .dispatch(RequestEnvelope::new("GET", "/shared/42"))
            .await
            .unwrap();
        assert_eq!(shared.body, b"alpha");
        let beta = dispatcher
            .dispatch(RequestEnvelope::new("GET", "/beta/only"))
            .await
            .unwrap();
        assert_eq!(beta.body, b"beta");
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_fault() {
        let (routes, loaded) = load_all(vec![("faulty", fixtures::faulty())]);
        let err = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/faulty/panic"))
            .await
            .unwrap_err();
        match err {
            DispatchError::HandlerFault { plugin, reason } => {
                assert_eq!(plugin, "faulty");
                assert!(reason.contains("sensor array on fire"), "{reason}");
            }
            other => panic!("expected HandlerFault, got {other:?}"),
        }
        // The lease was returned despite the unwind.
        assert_eq!(loaded[0].artifact.inflight(), 0);
    }

    #[tokio::test]
    async fn test_garbled_response_is_handler_fault() {
        let (routes, _loaded) = load_all(vec![("faulty", fixtures::faulty())]);
        let err = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/faulty/garbled"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::HandlerFault { .. }));
        assert!(err.to_string().contains("malformed response"));
    }

    #[tokio::test]
    async fn test_null_response_is_handler_fault() {
        let (routes, _loaded) = load_all(vec![("faulty", fixtures::faulty())]);
        let err = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/faulty/null"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("null buffer"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_other_plugins_responsive() {
        let (routes, loaded) = load_all(vec![
            ("slow", fixtures::slow()),
            ("echo", fixtures::echo()),
        ]);
        let dispatcher = Dispatcher::new(routes, Duration::from_millis(50));

        let err = dispatcher
            .dispatch(RequestEnvelope::new("GET", "/slow/wait"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Timeout {
                plugin: "slow".into(),
                timeout_ms: 50
            }
        );
        // The abandoned call still holds its lease.
        assert_eq!(loaded[0].artifact.inflight(), 1);

        let echo = dispatcher
            .dispatch(RequestEnvelope::new("POST", "/echo").with_body("still here"))
            .await
            .unwrap();
        assert_eq!(echo.body, b"still here");

        tokio::time::sleep(fixtures::SLOW_HANDLER_DELAY + Duration::from_millis(200)).await;
        assert_eq!(loaded[0].artifact.inflight(), 0);
    }

    #[tokio::test]
    async fn test_draining_artifact_is_not_found() {
        let (routes, loaded) = load_all(vec![("weather", fixtures::weather())]);
        loaded[0].artifact.begin_drain();
        let err = dispatcher(routes)
            .dispatch(RequestEnvelope::new("GET", "/weather/now"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_every_plugin_buffer_released_once() {
        let (routes, _loaded) = load_all(vec![("counted", fixtures::counted())]);
        let dispatcher = dispatcher(routes);
        for _ in 0..5 {
            let response = dispatcher
                .dispatch(RequestEnvelope::new("GET", "/counted/ping"))
                .await
                .unwrap();
            assert_eq!(response.body, b"pong");
        }
        let (exported, released) = fixtures::counted_buffers();
        // Manifest, bundle, five responses.
        assert_eq!(exported, 7);
        assert_eq!(released, exported);
    }
}
