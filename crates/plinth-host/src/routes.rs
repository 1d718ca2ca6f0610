//! Route table: the merged, immutable view of every loaded plugin's routes.
//!
//! Tables are built whole and published by swapping an `Arc`; a table is
//! never mutated after [`RouteTable::build`] returns.
//!
//! Matching is deterministic: among the patterns that match a concrete path,
//! the one with the most literal segments wins, and ties go to the route that
//! was registered first (load order).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use plinth_abi::HandlerFn;
use serde::Serialize;
use thiserror::Error;

use crate::native::NativeArtifact;

// ─── Patterns ───────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern must start with '/'")]
    MissingLeadingSlash,

    #[error("pattern contains an empty segment")]
    EmptySegment,

    #[error("parameter segment without a name")]
    UnnamedParam,

    #[error("parameter `{0}` appears twice")]
    DuplicateParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path pattern such as `/weather/:city/now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Split a request path into segments.
///
/// A single trailing slash is ignored; empty segments make the path invalid.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Some(Vec::new());
    }
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// Upper-case an HTTP method token, rejecting anything that is not one.
pub fn normalize_method(method: &str) -> Option<String> {
    let method = method.trim();
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    Some(method.to_ascii_uppercase())
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash);
        }
        let parts = split_path(pattern).ok_or(PatternError::EmptySegment)?;

        let mut segments = Vec::with_capacity(parts.len());
        let mut seen = Vec::new();
        for part in parts {
            match part.strip_prefix(':') {
                Some("") => return Err(PatternError::UnnamedParam),
                Some(name) => {
                    if seen.contains(&name) {
                        return Err(PatternError::DuplicateParam(name.to_string()));
                    }
                    seen.push(name);
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(part.to_string())),
            }
        }

        let raw = if segments.is_empty() {
            "/".to_string()
        } else {
            let mut raw = String::new();
            for segment in &segments {
                raw.push('/');
                match segment {
                    Segment::Literal(s) => raw.push_str(s),
                    Segment::Param(name) => {
                        raw.push(':');
                        raw.push_str(name);
                    }
                }
            }
            raw
        };
        Ok(Self { raw, segments })
    }

    /// Normalized pattern text (no trailing slash).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// The pattern with parameter names erased. Two patterns with the same
    /// shape match exactly the same paths.
    pub fn shape(&self) -> String {
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(s) => shape.push_str(s),
                Segment::Param(_) => shape.push(':'),
            }
        }
        if shape.is_empty() {
            shape.push('/');
        }
        shape
    }

    /// Match pre-split path segments, returning the captured parameters.
    pub fn match_segments(&self, path: &[&str]) -> Option<BTreeMap<String, String>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

// ─── Entries ────────────────────────────────────────────────────────────

/// A resolved handler plus the artifact that must stay mapped to call it.
#[derive(Clone)]
pub struct HandlerReference {
    func: HandlerFn,
    artifact: Arc<NativeArtifact>,
}

impl std::fmt::Debug for HandlerReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerReference")
            .field("func", &(self.func as *const ()))
            .field("artifact", &self.artifact)
            .finish()
    }
}

impl HandlerReference {
    pub(crate) fn new(func: HandlerFn, artifact: Arc<NativeArtifact>) -> Self {
        Self { func, artifact }
    }

    pub fn artifact(&self) -> &Arc<NativeArtifact> {
        &self.artifact
    }

    pub(crate) fn func(&self) -> HandlerFn {
        self.func
    }
}

#[derive(Debug)]
pub struct RouteEntry {
    pub plugin: String,
    /// Upper-case HTTP method.
    pub method: String,
    pub pattern: RoutePattern,
    pub symbol: String,
    pub handler: HandlerReference,
}

impl RouteEntry {
    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            plugin: self.plugin.clone(),
            method: self.method.clone(),
            pattern: self.pattern.as_str().to_string(),
            symbol: self.symbol.clone(),
        }
    }
}

/// Serializable view of a route for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub plugin: String,
    pub method: String,
    pub pattern: String,
    pub symbol: String,
}

/// Two plugins declared routes that match the same requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCollision {
    pub method: String,
    /// The winning pattern.
    pub pattern: String,
    /// Plugin that keeps the route (loaded first).
    pub winner: String,
    /// Plugin whose route was not registered.
    pub loser: String,
    pub loser_pattern: String,
}

/// A successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub entry: Arc<RouteEntry>,
    pub params: BTreeMap<String, String>,
}

// ─── Table ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<Arc<RouteEntry>>,
    collisions: Vec<RouteCollision>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge routes in registration order.
    ///
    /// A route whose (method, shape) is already taken by another plugin is
    /// left out and recorded as a [`RouteCollision`].
    pub fn build<'a>(routes: impl IntoIterator<Item = &'a Arc<RouteEntry>>) -> Self {
        let mut owners: HashMap<(String, String), Arc<RouteEntry>> = HashMap::new();
        let mut entries = Vec::new();
        let mut collisions = Vec::new();

        for entry in routes {
            let key = (entry.method.clone(), entry.pattern.shape());
            match owners.get(&key) {
                Some(winner) => {
                    tracing::warn!(
                        method = %entry.method,
                        pattern = %entry.pattern.as_str(),
                        winner = %winner.plugin,
                        loser = %entry.plugin,
                        "route collision, keeping the first registered route"
                    );
                    collisions.push(RouteCollision {
                        method: entry.method.clone(),
                        pattern: winner.pattern.as_str().to_string(),
                        winner: winner.plugin.clone(),
                        loser: entry.plugin.clone(),
                        loser_pattern: entry.pattern.as_str().to_string(),
                    });
                }
                None => {
                    owners.insert(key, Arc::clone(entry));
                    entries.push(Arc::clone(entry));
                }
            }
        }

        Self {
            entries,
            collisions,
        }
    }

    /// Find the route for `method` and `path`.
    pub fn matches(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method = normalize_method(method)?;
        let segments = split_path(path)?;

        let mut best: Option<(usize, &Arc<RouteEntry>, BTreeMap<String, String>)> = None;
        for entry in &self.entries {
            if entry.method != method {
                continue;
            }
            let Some(params) = entry.pattern.match_segments(&segments) else {
                continue;
            };
            let score = entry.pattern.literal_count();
            // Strictly greater: earlier registrations win ties.
            let better = match &best {
                Some((top, _, _)) => score > *top,
                None => true,
            };
            if better {
                best = Some((score, entry, params));
            }
        }

        best.map(|(_, entry, params)| RouteMatch {
            entry: Arc::clone(entry),
            params,
        })
    }

    pub fn entries(&self) -> &[Arc<RouteEntry>] {
        &self.entries
    }

    pub fn collisions(&self) -> &[RouteCollision] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.entries.iter().map(|e| e.info()).collect()
    }
}
