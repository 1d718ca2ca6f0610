//! Plugin registry: owns every loaded plugin and the published route table.
//!
//! The `PluginHost` is the central orchestrator of the plugin system. It
//! turns scans of the plugin directory into loads, swaps and retirements,
//! publishes the merged route table, and answers dispatch, bundle and status
//! queries.
//!
//! Writers (`rescan`, `disable`, `enable`, `collect_retired`, `shutdown`) are
//! serialized by one async mutex. Dispatch never takes a lock: it reads the
//! current route table snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use plinth_abi::{RequestEnvelope, ResponseEnvelope};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use crate::assets::{read_script_bundle, AssetCache, UiBundle};
use crate::config::HostConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DiscoveryError, DispatchError, HostError};
use crate::events::{EventBus, HostEvent, UnloadReport};
use crate::lifecycle::{wait_idle, LoadState, RetiredGenerations, Retirement};
use crate::loader::{load_native, RouteDiagnostic};
use crate::manifest::PluginManifest;
use crate::native::{DylibOpener, LibraryOpener, NativeArtifact};
use crate::routes::{RouteCollision, RouteEntry, RouteInfo, RouteTable};
use crate::scanner::{self, ArtifactKind, DiscoveredArtifact, SkippedEntry};

// ─── Public views ───────────────────────────────────────────────────────

/// Administrative snapshot of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub state: LoadState,
    /// Load failure or blocked-unload reason.
    pub reason: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub routes: Vec<RouteInfo>,
    pub dropped_routes: Vec<RouteDiagnostic>,
    pub has_bundle: bool,
    pub generation: u64,
    pub inflight: usize,
    pub loaded_at: Option<DateTime<Utc>>,
    pub disabled: bool,
}

/// What one rescan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    pub loaded: Vec<String>,
    /// Script bundles replaced in place.
    pub swapped: Vec<String>,
    pub failed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

impl RescanReport {
    /// Whether the rescan loaded, swapped, failed or removed anything.
    pub fn has_changes(&self) -> bool {
        !(self.loaded.is_empty()
            && self.swapped.is_empty()
            && self.failed.is_empty()
            && self.removed.is_empty())
    }
}

/// The published route table, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutesSnapshot {
    pub routes: Vec<RouteInfo>,
    pub collisions: Vec<RouteCollision>,
}

// ─── Records ────────────────────────────────────────────────────────────

struct PluginRecord {
    id: String,
    kind: ArtifactKind,
    path: PathBuf,
    fingerprint: Result<String, DiscoveryError>,
    state: LoadState,
    /// Why the last unload could not close the library.
    blocked: Option<String>,
    manifest: Option<PluginManifest>,
    /// Active generation while loaded, draining generation while unloading.
    native: Option<Arc<NativeArtifact>>,
    routes: Vec<Arc<RouteEntry>>,
    diagnostics: Vec<RouteDiagnostic>,
    has_bundle: bool,
    generation: u64,
    /// Position in the global load sequence; earlier loads win collisions.
    load_order: u64,
    loaded_at: Option<DateTime<Utc>>,
    /// The artifact file is still in the plugin directory.
    present: bool,
    disabled: bool,
}

impl PluginRecord {
    fn discovered(artifact: &DiscoveredArtifact) -> Self {
        Self {
            id: artifact.id.clone(),
            kind: artifact.kind,
            path: artifact.path.clone(),
            fingerprint: artifact.fingerprint.clone(),
            state: LoadState::Discovered,
            blocked: None,
            manifest: None,
            native: None,
            routes: Vec::new(),
            diagnostics: Vec::new(),
            has_bundle: false,
            generation: 0,
            load_order: 0,
            loaded_at: None,
            present: true,
            disabled: false,
        }
    }

    /// Same file, same bytes, and the last load attempt finished.
    fn is_current(&self, artifact: &DiscoveredArtifact) -> bool {
        self.kind == artifact.kind
            && self.path == artifact.path
            && self.fingerprint == artifact.fingerprint
            && matches!(self.state, LoadState::Loaded | LoadState::Failed { .. })
    }

    fn status(&self) -> PluginStatus {
        let inflight = self.native.as_ref().map_or(0, |n| n.inflight());
        let state = match &self.state {
            LoadState::Unloading { .. } => LoadState::Unloading { inflight },
            other => other.clone(),
        };
        let reason = match &self.state {
            LoadState::Failed { reason } => Some(reason.clone()),
            _ => self.blocked.clone(),
        };
        let manifest = self.manifest.as_ref();
        PluginStatus {
            id: self.id.clone(),
            kind: self.kind,
            path: self.path.clone(),
            state,
            reason,
            name: manifest.map(|m| m.name.clone()),
            version: manifest.map(|m| m.version.clone()),
            description: manifest.and_then(|m| m.description.clone()),
            author: manifest.and_then(|m| m.author.clone()),
            routes: self.routes.iter().map(|r| r.info()).collect(),
            dropped_routes: self.diagnostics.clone(),
            has_bundle: self.has_bundle,
            generation: self.generation,
            inflight,
            loaded_at: self.loaded_at,
            disabled: self.disabled,
        }
    }
}

/// A scanned artifact awaiting a load decision.
enum Pending<'a> {
    Disabled(&'a DiscoveredArtifact),
    Changed {
        artifact: &'a DiscoveredArtifact,
        /// The record being replaced is a loaded script bundle.
        swaps_script: bool,
    },
}

/// Outcome of a load, committed under the records guard.
enum Staged<'a> {
    Disabled(&'a DiscoveredArtifact),
    Loaded(PluginRecord),
}

/// State only writers touch.
#[derive(Default)]
struct WriterState {
    retired: RetiredGenerations,
    disabled: BTreeSet<String>,
    generations: HashMap<String, u64>,
    load_seq: u64,
    /// Collisions in the published table, so each is reported once.
    collisions: Vec<RouteCollision>,
    shut_down: bool,
}

impl WriterState {
    fn next_generation(&mut self, id: &str) -> u64 {
        let generation = self.generations.entry(id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn next_load_order(&mut self) -> u64 {
        self.load_seq += 1;
        self.load_seq
    }
}

// ─── Host ───────────────────────────────────────────────────────────────

pub struct PluginHost {
    config: HostConfig,
    opener: Arc<dyn LibraryOpener>,
    routes: Arc<ArcSwap<RouteTable>>,
    dispatcher: Dispatcher,
    assets: AssetCache,
    events: EventBus,
    records: RwLock<BTreeMap<String, PluginRecord>>,
    writer: Mutex<WriterState>,
}

impl PluginHost {
    /// Create a host. Nothing is scanned until [`start`](Self::start).
    pub fn new(config: HostConfig, opener: Arc<dyn LibraryOpener>) -> Self {
        let routes = Arc::new(ArcSwap::from_pointee(RouteTable::empty()));
        let dispatcher = Dispatcher::new(Arc::clone(&routes), config.handler_timeout());
        Self {
            config,
            opener,
            routes,
            dispatcher,
            assets: AssetCache::default(),
            events: EventBus::default(),
            records: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(WriterState::default()),
        }
    }

    /// Create a host that maps real shared objects.
    pub fn with_dylib_loader(config: HostConfig) -> Self {
        Self::new(config, Arc::new(DylibOpener))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Initial scan. An unreadable plugin directory is fatal.
    pub async fn start(&self) -> Result<RescanReport, HostError> {
        let report = self.rescan().await?;
        tracing::info!(
            dir = %self.config.plugin_dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            routes = self.routes.load().len(),
            "plugin host started"
        );
        Ok(report)
    }

    /// Reconcile loaded plugins with the plugin directory.
    ///
    /// Unchanged artifacts are left alone: rescanning an unchanged directory
    /// emits no events and does not republish the route table.
    pub async fn rescan(&self) -> Result<RescanReport, HostError> {
        let mut writer = self.writer.lock().await;
        let report = self.rescan_locked(&mut writer).await?;
        if report.has_changes() {
            tracing::info!(
                loaded = ?report.loaded,
                swapped = ?report.swapped,
                failed = ?report.failed,
                removed = ?report.removed,
                "plugin directory rescanned"
            );
        }
        Ok(report)
    }

    pub async fn dispatch(
        &self,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, DispatchError> {
        self.dispatcher.dispatch(request).await
    }

    pub fn bundle(&self, id: &str) -> Option<UiBundle> {
        self.assets.get(id)
    }

    /// Ids of plugins with a cached UI bundle, sorted.
    pub fn bundle_ids(&self) -> Vec<String> {
        self.assets.ids()
    }

    /// Status of every known plugin, sorted by id.
    pub async fn statuses(&self) -> Vec<PluginStatus> {
        self.records
            .read()
            .await
            .values()
            .map(PluginRecord::status)
            .collect()
    }

    pub async fn status(&self, id: &str) -> Result<PluginStatus, HostError> {
        self.records
            .read()
            .await
            .get(id)
            .map(PluginRecord::status)
            .ok_or_else(|| HostError::NotFound(id.to_string()))
    }

    pub fn routes(&self) -> RoutesSnapshot {
        let table = self.routes.load();
        RoutesSnapshot {
            routes: table.routes(),
            collisions: table.collisions().to_vec(),
        }
    }

    /// The currently published route table.
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Unload a plugin and keep it unloaded across rescans.
    ///
    /// Routes are withdrawn first, then the native library is drained for up
    /// to the configured drain timeout. A drain that does not finish in time
    /// is reported as pending and completes on a later
    /// [`collect_retired`](Self::collect_retired).
    pub async fn disable(&self, id: &str) -> Result<UnloadReport, HostError> {
        let mut writer = self.writer.lock().await;
        if writer.shut_down {
            return Err(HostError::ShutDown);
        }

        let (native, generation) = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| HostError::NotFound(id.to_string()))?;
            writer.disabled.insert(id.to_string());
            record.disabled = true;
            self.assets.remove(id);
            tracing::info!(plugin = %id, "plugin disabled");

            let generation = record.generation;
            match (record.state.clone(), record.native.clone()) {
                (LoadState::Loaded, Some(native)) => {
                    record.routes.clear();
                    record.state = LoadState::Unloading {
                        inflight: native.inflight(),
                    };
                    self.publish_routes(&records, &mut writer);
                    writer.retired.retire(Arc::clone(&native));
                    (native, generation)
                }
                (LoadState::Unloading { .. }, Some(native)) => (native, generation),
                (LoadState::Unloading { .. }, None) => {
                    return Ok(UnloadReport::Blocked {
                        reason: record.blocked.clone().unwrap_or_default(),
                    });
                }
                (state, _) => {
                    record.state = LoadState::Unloaded;
                    if state.is_loaded() {
                        self.events.emit(HostEvent::Unloaded {
                            plugin: id.to_string(),
                            generation,
                        });
                    }
                    return Ok(UnloadReport::Unloaded);
                }
            }
        };

        if !wait_idle(&native, self.config.drain_timeout()).await {
            tracing::warn!(
                plugin = %id,
                inflight = native.inflight(),
                "drain timed out, unload left pending"
            );
        }

        let mut records = self.records.write().await;
        let finished = writer.retired.collect();
        let outcome = finished
            .iter()
            .find(|r| r.plugin == id && r.generation == generation)
            .map(|r| r.outcome.clone());
        self.apply_retirements(&mut records, finished);

        Ok(outcome.unwrap_or_else(|| {
            let inflight = native.inflight();
            self.events.emit(HostEvent::UnloadPending {
                plugin: id.to_string(),
                generation,
                inflight,
            });
            UnloadReport::Pending { inflight }
        }))
    }

    /// Allow a disabled plugin to load again, then rescan.
    pub async fn enable(&self, id: &str) -> Result<RescanReport, HostError> {
        let mut writer = self.writer.lock().await;
        if writer.shut_down {
            return Err(HostError::ShutDown);
        }
        let was_disabled = writer.disabled.remove(id);
        {
            let mut records = self.records.write().await;
            let forget = match records.get_mut(id) {
                Some(record) => {
                    record.disabled = false;
                    matches!(
                        record.state,
                        LoadState::Unloaded | LoadState::Unloading { .. }
                    )
                }
                None if was_disabled => false,
                None => return Err(HostError::NotFound(id.to_string())),
            };
            // A forgotten record is rediscovered and loaded as a new generation.
            if forget {
                records.remove(id);
            }
        }
        tracing::info!(plugin = %id, "plugin enabled");
        self.rescan_locked(&mut writer).await
    }

    /// Close retired generations whose calls have all finished.
    pub async fn collect_retired(&self) -> Vec<Retirement> {
        let mut writer = self.writer.lock().await;
        if writer.retired.is_empty() {
            return Vec::new();
        }
        let mut records = self.records.write().await;
        let finished = writer.retired.collect();
        self.apply_retirements(&mut records, finished.clone());
        finished
    }

    /// Withdraw every route, drain every native plugin, and refuse further
    /// writes. Returns the unload outcome per native plugin.
    pub async fn shutdown(&self) -> BTreeMap<String, UnloadReport> {
        let mut writer = self.writer.lock().await;
        if writer.shut_down {
            return BTreeMap::new();
        }
        writer.shut_down = true;

        let mut draining = Vec::new();
        {
            let mut records = self.records.write().await;
            for record in records.values_mut() {
                if !record.state.is_loaded() {
                    continue;
                }
                record.routes.clear();
                match record.native.clone() {
                    Some(native) => {
                        record.state = LoadState::Unloading {
                            inflight: native.inflight(),
                        };
                        draining.push(native);
                    }
                    None => record.state = LoadState::Unloaded,
                }
            }
            self.routes.store(Arc::new(RouteTable::empty()));
            self.assets.clear();
            for native in &draining {
                writer.retired.retire(Arc::clone(native));
            }
        }

        let deadline = Instant::now() + self.config.drain_timeout();
        for native in &draining {
            wait_idle(native, deadline.saturating_duration_since(Instant::now())).await;
        }

        let mut records = self.records.write().await;
        let finished = writer.retired.collect();
        let mut outcomes: BTreeMap<String, UnloadReport> = finished
            .iter()
            .map(|r| (r.plugin.clone(), r.outcome.clone()))
            .collect();
        self.apply_retirements(&mut records, finished);
        for native in &draining {
            outcomes
                .entry(native.id().to_string())
                .or_insert_with(|| UnloadReport::Pending {
                    inflight: native.inflight(),
                });
        }
        tracing::info!(plugins = outcomes.len(), "plugin host shut down");
        outcomes
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Reconcile records with the plugin directory.
    ///
    /// Records are only read while classifying and only written while
    /// committing. Changed artifacts are loaded in between with no records
    /// guard held, so status queries are answered while plugin code runs.
    async fn rescan_locked(&self, writer: &mut WriterState) -> Result<RescanReport, HostError> {
        if writer.shut_down {
            return Err(HostError::ShutDown);
        }
        let scan = scanner::scan(&self.config.plugin_dir)?;
        let mut report = RescanReport {
            skipped: scan.skipped,
            ..RescanReport::default()
        };

        let (gone, pending) = {
            let records = self.records.read().await;
            let on_disk: BTreeSet<&str> = scan.artifacts.iter().map(|a| a.id.as_str()).collect();
            let gone: Vec<String> = records
                .iter()
                .filter(|(id, record)| record.present && !on_disk.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();

            let mut pending = Vec::new();
            for artifact in &scan.artifacts {
                let id = artifact.id.as_str();
                if writer.disabled.contains(id) {
                    pending.push(Pending::Disabled(artifact));
                } else if records.get(id).is_some_and(|r| r.is_current(artifact)) {
                    report.unchanged.push(id.to_string());
                } else {
                    let swaps_script = records.get(id).is_some_and(|p| {
                        p.kind == ArtifactKind::ScriptBundle && p.state.is_loaded()
                    });
                    pending.push(Pending::Changed {
                        artifact,
                        swaps_script,
                    });
                }
            }
            (gone, pending)
        };

        let mut staged = Vec::with_capacity(pending.len());
        for item in pending {
            match item {
                Pending::Disabled(artifact) => staged.push(Staged::Disabled(artifact)),
                Pending::Changed {
                    artifact,
                    swaps_script,
                } => {
                    let record = self
                        .load_artifact(writer, artifact, swaps_script, &mut report)
                        .await;
                    staged.push(Staged::Loaded(record));
                }
            }
        }

        let mut records = self.records.write().await;
        let mut table_dirty = false;
        let mut retiring: Vec<Arc<NativeArtifact>> = Vec::new();

        for id in gone {
            let Some(record) = records.get_mut(&id) else {
                continue;
            };
            record.present = false;
            report.removed.push(id.clone());
            tracing::info!(plugin = %id, "plugin artifact removed");

            if matches!(record.state, LoadState::Unloading { .. }) && record.native.is_some() {
                // Already draining; the record goes once the drain finishes.
                continue;
            }
            if let (LoadState::Loaded, Some(native)) = (record.state.clone(), record.native.clone())
            {
                record.routes.clear();
                record.state = LoadState::Unloading {
                    inflight: native.inflight(),
                };
                retiring.push(native);
                table_dirty = true;
                self.assets.remove(&id);
                continue;
            }

            let was_loaded = record.state.is_loaded();
            let generation = record.generation;
            records.remove(&id);
            self.assets.remove(&id);
            if was_loaded {
                self.events.emit(HostEvent::Unloaded {
                    plugin: id,
                    generation,
                });
            }
        }

        for item in staged {
            match item {
                Staged::Disabled(artifact) => {
                    let record = records.entry(artifact.id.clone()).or_insert_with(|| {
                        let mut record = PluginRecord::discovered(artifact);
                        record.state = LoadState::Unloaded;
                        record.disabled = true;
                        record
                    });
                    record.present = true;
                    record.path.clone_from(&artifact.path);
                    record.fingerprint = artifact.fingerprint.clone();
                }
                Staged::Loaded(record) => {
                    if let Some(previous) = records.remove(&record.id) {
                        if let (LoadState::Loaded, Some(native)) = (&previous.state, &previous.native)
                        {
                            retiring.push(Arc::clone(native));
                            table_dirty = true;
                        }
                    }
                    if record.state.is_loaded() && record.kind == ArtifactKind::NativeBinary {
                        table_dirty = true;
                    }
                    records.insert(record.id.clone(), record);
                }
            }
        }

        if table_dirty {
            self.publish_routes(&records, writer);
        }

        let retiring: Vec<(String, u64)> = retiring
            .into_iter()
            .map(|native| {
                let key = (native.id().to_string(), native.generation());
                writer.retired.retire(native);
                key
            })
            .collect();
        let finished = writer.retired.collect();
        self.apply_retirements(&mut records, finished);
        for (plugin, generation) in retiring {
            if writer.retired.is_pending(&plugin, generation) {
                let inflight = writer.retired.inflight_for(&plugin);
                self.events.emit(HostEvent::UnloadPending {
                    plugin,
                    generation,
                    inflight,
                });
            }
        }

        Ok(report)
    }

    /// Load one changed artifact into a fresh record.
    ///
    /// Native loads run plugin code (manifest and bundle accessors), so they
    /// go to the blocking pool.
    async fn load_artifact(
        &self,
        writer: &mut WriterState,
        artifact: &DiscoveredArtifact,
        swaps_script: bool,
        report: &mut RescanReport,
    ) -> PluginRecord {
        let id = artifact.id.as_str();
        let mut record = PluginRecord::discovered(artifact);
        record.generation = writer.next_generation(id);
        record.state = LoadState::Loading;
        tracing::debug!(plugin = %id, generation = record.generation, kind = ?artifact.kind, "loading plugin");

        if let Err(e) = &artifact.fingerprint {
            return self.fail(record, e.to_string(), report);
        }

        match artifact.kind {
            ArtifactKind::ScriptBundle => {
                let bundle = match read_script_bundle(&artifact.path) {
                    Ok(bundle) => bundle,
                    Err(e) => return self.fail(record, e.to_string(), report),
                };
                self.assets.insert(id, bundle);
                record.has_bundle = true;
                record.state = LoadState::Loaded;
                record.loaded_at = Some(Utc::now());
                record.load_order = writer.next_load_order();

                if swaps_script {
                    tracing::info!(plugin = %id, generation = record.generation, "script bundle swapped");
                    report.swapped.push(id.to_string());
                    self.events.emit(HostEvent::Swapped {
                        plugin: id.to_string(),
                        generation: record.generation,
                    });
                } else {
                    tracing::info!(plugin = %id, generation = record.generation, "script plugin loaded");
                    report.loaded.push(id.to_string());
                    self.events.emit(HostEvent::Loaded {
                        plugin: id.to_string(),
                        generation: record.generation,
                        kind: ArtifactKind::ScriptBundle,
                        routes: 0,
                    });
                }
                record
            }
            ArtifactKind::NativeBinary => {
                let opener = Arc::clone(&self.opener);
                let plugin = id.to_string();
                let path = artifact.path.clone();
                let generation = record.generation;
                let permits = self.config.call_permits();
                let outcome = tokio::task::spawn_blocking(move || {
                    load_native(opener.as_ref(), &plugin, &path, generation, permits)
                })
                .await;
                let loaded = match outcome {
                    Ok(Ok(loaded)) => loaded,
                    Ok(Err(e)) => return self.fail(record, e.to_string(), report),
                    Err(e) => {
                        return self.fail(record, format!("load task failed: {e}"), report)
                    }
                };

                for diagnostic in &loaded.diagnostics {
                    self.events.emit(HostEvent::RouteDropped(diagnostic.clone()));
                }
                match loaded.bundle {
                    Some(bundle) => {
                        self.assets.insert(id, bundle);
                        record.has_bundle = true;
                    }
                    None => {
                        self.assets.remove(id);
                    }
                }
                record.manifest = Some(loaded.manifest);
                record.native = Some(loaded.artifact);
                record.routes = loaded.routes;
                record.diagnostics = loaded.diagnostics;
                record.state = LoadState::Loaded;
                record.loaded_at = Some(Utc::now());
                record.load_order = writer.next_load_order();

                tracing::info!(
                    plugin = %id,
                    generation = record.generation,
                    routes = record.routes.len(),
                    dropped = record.diagnostics.len(),
                    bundle = record.has_bundle,
                    "native plugin loaded"
                );
                report.loaded.push(id.to_string());
                self.events.emit(HostEvent::Loaded {
                    plugin: id.to_string(),
                    generation: record.generation,
                    kind: ArtifactKind::NativeBinary,
                    routes: record.routes.len(),
                });
                record
            }
        }
    }

    fn fail(&self, mut record: PluginRecord, reason: String, report: &mut RescanReport) -> PluginRecord {
        tracing::error!(plugin = %record.id, "failed to load plugin: {reason}");
        self.assets.remove(&record.id);
        report.failed.push(record.id.clone());
        self.events.emit(HostEvent::Failed {
            plugin: record.id.clone(),
            reason: reason.clone(),
        });
        record.state = LoadState::Failed { reason };
        record
    }

    /// Build a table from every loaded plugin, in load order, and publish it.
    fn publish_routes(&self, records: &BTreeMap<String, PluginRecord>, writer: &mut WriterState) {
        let mut loaded: Vec<&PluginRecord> =
            records.values().filter(|r| r.state.is_loaded()).collect();
        loaded.sort_by_key(|r| r.load_order);
        let table = RouteTable::build(loaded.iter().flat_map(|r| r.routes.iter()));

        for collision in table.collisions() {
            if !writer.collisions.contains(collision) {
                self.events.emit(HostEvent::RouteCollision(collision.clone()));
            }
        }
        writer.collisions = table.collisions().to_vec();
        tracing::debug!(routes = table.len(), collisions = table.collisions().len(), "route table published");
        self.routes.store(Arc::new(table));
    }

    fn apply_retirements(
        &self,
        records: &mut BTreeMap<String, PluginRecord>,
        finished: Vec<Retirement>,
    ) {
        for retirement in finished {
            match &retirement.outcome {
                UnloadReport::Blocked { reason } => self.events.emit(HostEvent::UnloadBlocked {
                    plugin: retirement.plugin.clone(),
                    generation: retirement.generation,
                    reason: reason.clone(),
                }),
                _ => self.events.emit(HostEvent::Unloaded {
                    plugin: retirement.plugin.clone(),
                    generation: retirement.generation,
                }),
            }

            let Some(record) = records.get_mut(&retirement.plugin) else {
                continue;
            };
            if record.generation != retirement.generation
                || !matches!(record.state, LoadState::Unloading { .. })
            {
                // An older generation of a plugin that has since been reloaded.
                continue;
            }
            record.native = None;
            let forget = match retirement.outcome {
                UnloadReport::Blocked { reason } => {
                    record.blocked = Some(reason);
                    record.state = LoadState::Unloading { inflight: 0 };
                    false
                }
                _ => {
                    record.state = LoadState::Unloaded;
                    !record.present
                }
            };
            if forget {
                records.remove(&retirement.plugin);
            }
        }
    }
}
