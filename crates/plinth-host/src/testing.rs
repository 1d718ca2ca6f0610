//! Test support: an in-process [`LibraryOpener`] and canned plugins.
//!
//! [`FakeOpener`] serves [`FakeLibrary`] symbol tables instead of mapping
//! files. The symbols are real `extern "C"` functions compiled into the test
//! binary, so the host goes through exactly the same calls, casts and buffer
//! releases as with a real shared object. Libraries are looked up by the
//! identity of the opened path, so tests still write (dummy) artifact files
//! for the scanner to find.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use plinth_abi::{
    BufferFreeFn, BundleFn, HandlerFn, HasBundleFn, ManifestFn, ReleaseMode, BUFFER_FREE_SYMBOL,
    BUNDLE_SYMBOL, HAS_BUNDLE_SYMBOL, MANIFEST_SYMBOL,
};

use crate::config::HostConfig;
use crate::native::{LibraryOpener, NativeArtifact, NativeLibrary};
use crate::scanner::classify;

// ─── Fake libraries ─────────────────────────────────────────────────────

/// Open/close counters for one fake library identity.
#[derive(Debug, Default)]
pub struct FakeStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
}

impl FakeStats {
    /// Times the library was opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Times `close` was called.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles currently alive (opened and not yet closed or dropped).
    pub fn open_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// A symbol table standing in for a shared object.
#[derive(Debug, Clone, Default)]
pub struct FakeLibrary {
    symbols: HashMap<String, usize>,
    fail_close: bool,
    stats: Option<Arc<FakeStats>>,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: &str, address: usize) -> Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    pub fn with_manifest(self, f: ManifestFn) -> Self {
        self.with_symbol(MANIFEST_SYMBOL, f as usize)
    }

    pub fn with_free(self, f: BufferFreeFn) -> Self {
        self.with_symbol(BUFFER_FREE_SYMBOL, f as usize)
    }

    pub fn with_has_bundle(self, f: HasBundleFn) -> Self {
        self.with_symbol(HAS_BUNDLE_SYMBOL, f as usize)
    }

    pub fn with_bundle(self, f: BundleFn) -> Self {
        self.with_symbol(BUNDLE_SYMBOL, f as usize)
    }

    pub fn with_handler(self, name: &str, f: HandlerFn) -> Self {
        self.with_symbol(name, f as usize)
    }

    /// Make `close` fail, as a refused `dlclose` would.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl NativeLibrary for FakeLibrary {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).map(|address| *address as *const c_void)
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        if let Some(stats) = &self.stats {
            stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_close {
            Err("library refused to unload".into())
        } else {
            Ok(())
        }
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Serves registered [`FakeLibrary`] templates by artifact identity.
#[derive(Debug, Default)]
pub struct FakeOpener {
    libraries: Mutex<HashMap<String, FakeLibrary>>,
    stats: Mutex<HashMap<String, Arc<FakeStats>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `library` for artifacts identified as `id`, replacing any
    /// previous registration.
    pub fn register(&self, id: &str, library: FakeLibrary) {
        self.libraries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), library);
    }

    pub fn stats(&self, id: &str) -> Arc<FakeStats> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stats.entry(id.to_string()).or_default())
    }
}

impl LibraryOpener for FakeOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, String> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(classify)
            .map(|(id, _)| id)
            .ok_or_else(|| format!("{} is not a native artifact", path.display()))?;
        let template = self
            .libraries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| format!("{}: cannot open shared object file", path.display()))?;

        let stats = self.stats(&id);
        stats.opened.fetch_add(1, Ordering::SeqCst);
        stats.live.fetch_add(1, Ordering::SeqCst);
        let mut library = template;
        library.stats = Some(stats);
        Ok(Box::new(library))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// An artifact with no symbols, for tests that only need a handle.
pub fn stub_artifact(id: &str) -> Arc<NativeArtifact> {
    Arc::new(NativeArtifact::new(
        id.to_string(),
        0,
        Box::new(FakeLibrary::new()),
        ReleaseMode::Static,
        None,
        1,
    ))
}

/// Write a placeholder native artifact named after `id`.
pub fn write_native(dir: &Path, id: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("{id}.{}", std::env::consts::DLL_EXTENSION));
    std::fs::write(&path, contents)?;
    Ok(path)
}

/// Host configuration suited to tests: no watcher, short timeouts.
pub fn test_config(plugin_dir: &Path) -> HostConfig {
    HostConfig {
        plugin_dir: plugin_dir.to_path_buf(),
        handler_timeout_ms: 2_000,
        max_concurrent_calls: 4,
        drain_timeout_ms: 200,
        watch: false,
        watch_debounce_ms: 20,
        retire_interval_ms: 20,
    }
}

// ─── Canned plugins ─────────────────────────────────────────────────────

pub mod fixtures {
    //! Ready-made plugins. Each fixture has its own functions, so counters
    //! kept by one fixture are not disturbed by tests using another.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
    use std::time::Duration;

    use plinth_abi::{
        encode_manifest_with_version, ManifestDocument, PlinthBuffer, ReleaseMode,
        RequestEnvelope, ResponseEnvelope, RouteDeclaration, ABI_VERSION,
    };
    use plinth_sdk::buffer::{export_vec, release_buffer};
    use plinth_sdk::guard::handle_request;
    use serde_json::json;

    use super::FakeLibrary;

    pub const WEATHER_BUNDLE: &[u8] = b"export function mount(el) { el.textContent = 'weather'; }";
    pub const WEATHER_UPDATED_BUNDLE: &[u8] =
        b"export function mount(el) { el.textContent = 'weather v1.1'; }";

    /// How long the `slow` plugin's handler blocks.
    pub const SLOW_HANDLER_DELAY: Duration = Duration::from_millis(500);

    /// How long the `sluggish` plugin's manifest accessor blocks.
    pub const SLOW_MANIFEST_DELAY: Duration = Duration::from_millis(400);

    fn document(id: &str, routes: &[(&str, &str, &str)], bundle: bool) -> ManifestDocument {
        ManifestDocument {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            author: Some("plinth tests".to_string()),
            bundle,
            bundle_content_type: None,
            routes: routes
                .iter()
                .map(|(method, path, symbol)| RouteDeclaration::new(method, path, symbol))
                .collect(),
        }
    }

    fn exported_manifest(document: &ManifestDocument, version: u32) -> PlinthBuffer {
        match encode_manifest_with_version(document, ReleaseMode::Exported, version) {
            Ok(bytes) => export_vec(bytes),
            Err(_) => PlinthBuffer::empty(),
        }
    }

    fn json_response(value: serde_json::Value) -> ResponseEnvelope {
        ResponseEnvelope::json(200, &value)
            .unwrap_or_else(|e| ResponseEnvelope::text(500, e.to_string()))
    }

    extern "C" fn free(buf: PlinthBuffer) {
        unsafe { release_buffer(buf) };
    }

    extern "C" fn yes() -> bool {
        true
    }

    macro_rules! handler {
        ($name:ident => $body:expr) => {
            unsafe extern "C-unwind" fn $name(ptr: *const u8, len: usize) -> PlinthBuffer {
                unsafe { handle_request(ptr, len, $body) }
            }
        };
    }

    // ── weather ──────────────────────────────────────────────────────

    const WEATHER_ROUTES: &[(&str, &str, &str)] = &[
        ("GET", "/weather/now", "weather_now"),
        ("POST", "/weather/refresh", "weather_refresh"),
    ];

    extern "C" fn weather_manifest() -> PlinthBuffer {
        exported_manifest(&document("weather", WEATHER_ROUTES, true), ABI_VERSION)
    }

    extern "C" fn weather_v2_manifest() -> PlinthBuffer {
        exported_manifest(&document("weather", WEATHER_ROUTES, true), ABI_VERSION + 1)
    }

    extern "C" fn weather_bundle() -> PlinthBuffer {
        export_vec(WEATHER_BUNDLE.to_vec())
    }

    extern "C" fn weather_updated_bundle() -> PlinthBuffer {
        export_vec(WEATHER_UPDATED_BUNDLE.to_vec())
    }

    handler!(weather_now => |_req: RequestEnvelope| {
        json_response(json!({"conditions": "sunny", "temperature_c": 21}))
    });

    handler!(weather_now_updated => |_req: RequestEnvelope| {
        json_response(json!({"conditions": "cloudy", "temperature_c": 17}))
    });

    handler!(weather_refresh => |req: RequestEnvelope| {
        ResponseEnvelope::new(202).with_body(req.body)
    });

    /// `GET /weather/now`, `POST /weather/refresh`, embedded bundle.
    pub fn weather() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(weather_manifest)
            .with_free(free)
            .with_has_bundle(yes)
            .with_bundle(weather_bundle)
            .with_handler("weather_now", weather_now)
            .with_handler("weather_refresh", weather_refresh)
    }

    /// Same identity and routes as [`weather`], different answers and bundle.
    pub fn weather_updated() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(weather_manifest)
            .with_free(free)
            .with_has_bundle(yes)
            .with_bundle(weather_updated_bundle)
            .with_handler("weather_now", weather_now_updated)
            .with_handler("weather_refresh", weather_refresh)
    }

    /// [`weather`] built against the next ABI revision.
    pub fn weather_v2() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(weather_v2_manifest)
            .with_free(free)
            .with_has_bundle(yes)
            .with_bundle(weather_bundle)
            .with_handler("weather_now", weather_now)
            .with_handler("weather_refresh", weather_refresh)
    }

    // ── echo ─────────────────────────────────────────────────────────

    extern "C" fn echo_manifest() -> PlinthBuffer {
        exported_manifest(
            &document(
                "echo",
                &[
                    ("POST", "/echo", "echo_body"),
                    ("GET", "/echo/:word", "echo_word"),
                ],
                false,
            ),
            ABI_VERSION,
        )
    }

    handler!(echo_body => |req: RequestEnvelope| {
        let mut response = ResponseEnvelope::ok().with_body(req.body.clone());
        if let Some(content_type) = req.header("content-type") {
            response = response.with_header("content-type", content_type);
        }
        response
    });

    handler!(echo_word => |req: RequestEnvelope| {
        json_response(json!({
            "word": req.param("word"),
            "repeat": req.query_param("repeat"),
            "agent": req.header("user-agent"),
        }))
    });

    /// `POST /echo` returns the body verbatim; `GET /echo/:word` reports the
    /// captured parameter and the `repeat` query value.
    pub fn echo() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(echo_manifest)
            .with_free(free)
            .with_handler("echo_body", echo_body)
            .with_handler("echo_word", echo_word)
    }

    // ── alpha / beta (static release mode, colliding routes) ─────────

    fn static_manifest(cell: &'static OnceLock<Vec<u8>>, document: ManifestDocument) -> PlinthBuffer {
        let bytes = cell.get_or_init(|| {
            plinth_abi::encode_manifest(&document, ReleaseMode::Static).unwrap_or_default()
        });
        PlinthBuffer::from_static(bytes)
    }

    fn static_response(cell: &'static OnceLock<Vec<u8>>, body: &str) -> PlinthBuffer {
        let bytes = cell.get_or_init(|| {
            ResponseEnvelope::text(200, body)
                .encode()
                .unwrap_or_default()
        });
        PlinthBuffer::from_static(bytes)
    }

    const SHARED_ROUTE: (&str, &str, &str) = ("GET", "/shared/:id", "shared");

    extern "C" fn alpha_manifest() -> PlinthBuffer {
        static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
        static_manifest(
            &BYTES,
            document("alpha", &[SHARED_ROUTE, ("GET", "/alpha/only", "shared")], false),
        )
    }

    extern "C" fn beta_manifest() -> PlinthBuffer {
        static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
        static_manifest(
            &BYTES,
            document("beta", &[("GET", "/shared/:key", "shared"), ("GET", "/beta/only", "shared")], false),
        )
    }

    unsafe extern "C-unwind" fn alpha_shared(_ptr: *const u8, _len: usize) -> PlinthBuffer {
        static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
        static_response(&BYTES, "alpha")
    }

    unsafe extern "C-unwind" fn beta_shared(_ptr: *const u8, _len: usize) -> PlinthBuffer {
        static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
        static_response(&BYTES, "beta")
    }

    /// Static release mode; `GET /shared/:id` and `GET /alpha/only` answer "alpha".
    pub fn alpha() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(alpha_manifest)
            .with_handler("shared", alpha_shared)
    }

    /// Static release mode; `GET /shared/:key` and `GET /beta/only` answer "beta".
    pub fn beta() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(beta_manifest)
            .with_handler("shared", beta_shared)
    }

    // ── slow ─────────────────────────────────────────────────────────

    extern "C" fn slow_manifest() -> PlinthBuffer {
        exported_manifest(&document("slow", &[("GET", "/slow/wait", "slow_wait")], false), ABI_VERSION)
    }

    handler!(slow_wait => |_req: RequestEnvelope| {
        std::thread::sleep(SLOW_HANDLER_DELAY);
        ResponseEnvelope::text(200, "finally")
    });

    /// `GET /slow/wait` blocks for [`SLOW_HANDLER_DELAY`].
    pub fn slow() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(slow_manifest)
            .with_free(free)
            .with_handler("slow_wait", slow_wait)
    }

    // ── sluggish ─────────────────────────────────────────────────────

    extern "C" fn sluggish_manifest() -> PlinthBuffer {
        std::thread::sleep(SLOW_MANIFEST_DELAY);
        exported_manifest(
            &document("sluggish", &[("GET", "/sluggish/ping", "sluggish_ping")], false),
            ABI_VERSION,
        )
    }

    handler!(sluggish_ping => |_req: RequestEnvelope| ResponseEnvelope::text(200, "pong"));

    /// Manifest accessor blocks for [`SLOW_MANIFEST_DELAY`]; `GET /sluggish/ping`.
    pub fn sluggish() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(sluggish_manifest)
            .with_free(free)
            .with_handler("sluggish_ping", sluggish_ping)
    }

    // ── gated ────────────────────────────────────────────────────────

    static GATE: Mutex<bool> = Mutex::new(false);
    static GATE_OPENED: Condvar = Condvar::new();

    /// Block `gated` handlers until [`open_gate`] is called.
    pub fn close_gate() {
        *GATE.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn open_gate() {
        *GATE.lock().unwrap_or_else(PoisonError::into_inner) = true;
        GATE_OPENED.notify_all();
    }

    fn wait_for_gate() {
        let mut open = GATE.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = GATE_OPENED
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    extern "C" fn gated_manifest() -> PlinthBuffer {
        exported_manifest(&document("gated", &[("GET", "/gated/wait", "gated_wait")], false), ABI_VERSION)
    }

    handler!(gated_wait => |_req: RequestEnvelope| {
        wait_for_gate();
        ResponseEnvelope::text(200, "released")
    });

    /// `GET /gated/wait` blocks until [`open_gate`].
    pub fn gated() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(gated_manifest)
            .with_free(free)
            .with_handler("gated_wait", gated_wait)
    }

    // ── faulty handlers ──────────────────────────────────────────────

    extern "C" fn faulty_manifest() -> PlinthBuffer {
        exported_manifest(
            &document(
                "faulty",
                &[
                    ("GET", "/faulty/panic", "faulty_panic"),
                    ("GET", "/faulty/garbled", "faulty_garbled"),
                    ("GET", "/faulty/null", "faulty_null"),
                ],
                false,
            ),
            ABI_VERSION,
        )
    }

    /// Panics straight through the boundary, without the SDK guard.
    unsafe extern "C-unwind" fn faulty_panic(_ptr: *const u8, _len: usize) -> PlinthBuffer {
        panic!("sensor array on fire")
    }

    unsafe extern "C-unwind" fn faulty_garbled(_ptr: *const u8, _len: usize) -> PlinthBuffer {
        export_vec(b"\x00\x01 definitely not an envelope".to_vec())
    }

    unsafe extern "C-unwind" fn faulty_null(_ptr: *const u8, _len: usize) -> PlinthBuffer {
        PlinthBuffer {
            ptr: std::ptr::null(),
            len: 16,
            cap: 0,
        }
    }

    /// Handlers that panic, return garbage, or return an invalid buffer.
    pub fn faulty() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(faulty_manifest)
            .with_free(free)
            .with_handler("faulty_panic", faulty_panic)
            .with_handler("faulty_garbled", faulty_garbled)
            .with_handler("faulty_null", faulty_null)
    }

    // ── sloppy manifest ──────────────────────────────────────────────

    extern "C" fn sloppy_manifest() -> PlinthBuffer {
        exported_manifest(
            &document(
                "sloppy",
                &[
                    ("GET", "/sloppy/ok", "sloppy_echo"),
                    ("GET", "/sloppy/missing", "not_exported"),
                    ("GET", "sloppy/no-slash", "sloppy_echo"),
                    ("G E T", "/sloppy/method", "sloppy_echo"),
                    ("get", "/sloppy/ok/", "sloppy_echo"),
                ],
                false,
            ),
            ABI_VERSION,
        )
    }

    handler!(sloppy_echo => |req: RequestEnvelope| ResponseEnvelope::ok().with_body(req.body));

    /// One good route and four that must be dropped: unresolved symbol,
    /// invalid pattern, invalid method, duplicate.
    pub fn sloppy() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(sloppy_manifest)
            .with_free(free)
            .with_handler("sloppy_echo", sloppy_echo)
    }

    // ── counted ──────────────────────────────────────────────────────

    static COUNTED_FREES: AtomicUsize = AtomicUsize::new(0);
    static COUNTED_EXPORTS: AtomicUsize = AtomicUsize::new(0);

    fn counted_export(bytes: Vec<u8>) -> PlinthBuffer {
        COUNTED_EXPORTS.fetch_add(1, Ordering::SeqCst);
        export_vec(bytes)
    }

    extern "C" fn counted_free(buf: PlinthBuffer) {
        COUNTED_FREES.fetch_add(1, Ordering::SeqCst);
        unsafe { release_buffer(buf) };
    }

    extern "C" fn counted_manifest() -> PlinthBuffer {
        let document = document("counted", &[("GET", "/counted/ping", "counted_ping")], true);
        match plinth_abi::encode_manifest(&document, ReleaseMode::Exported) {
            Ok(bytes) => counted_export(bytes),
            Err(_) => PlinthBuffer::empty(),
        }
    }

    extern "C" fn counted_bundle() -> PlinthBuffer {
        counted_export(b"counted ui".to_vec())
    }

    unsafe extern "C-unwind" fn counted_ping(ptr: *const u8, len: usize) -> PlinthBuffer {
        let buf = unsafe { handle_request(ptr, len, |_req| ResponseEnvelope::text(200, "pong")) };
        COUNTED_EXPORTS.fetch_add(1, Ordering::SeqCst);
        buf
    }

    /// Counts every buffer it hands out and every buffer released back.
    pub fn counted() -> FakeLibrary {
        FakeLibrary::new()
            .with_manifest(counted_manifest)
            .with_free(counted_free)
            .with_has_bundle(yes)
            .with_bundle(counted_bundle)
            .with_handler("counted_ping", counted_ping)
    }

    /// (buffers exported, buffers released) by the `counted` plugin.
    pub fn counted_buffers() -> (usize, usize) {
        (
            COUNTED_EXPORTS.load(Ordering::SeqCst),
            COUNTED_FREES.load(Ordering::SeqCst),
        )
    }
}
