//! # Live Pattern Engine
//! Immutable per-version lookup index behind one swappable handle.
//!
//! Domains live in a hash map and are matched by walking host suffixes, so a
//! lookup costs O(labels). Regex patterns are compiled into `RegexSet`
//! groups keyed by a 3-byte literal every match must contain; an input only
//! evaluates the groups whose key occurs in it, plus a catch-all group for
//! patterns without a usable literal.
//!
//! Readers clone the active `EngineHandle` (an `Arc`) and run against it with
//! no lock held. `activate` swaps the handle under a write lock; in-flight
//! readers finish on the old snapshot, which is freed with its last clone.

use metrics::gauge;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::IndexBuildError;
use crate::model::{PatternKind, Version, VersionId};
use crate::parse::normalize_domain;
use crate::validate::{compile_regex, REGEX_SIZE_LIMIT};

/// Max patterns compiled into one `RegexSet`.
const MAX_SET_PATTERNS: usize = 256;

type LiteralKey = [u8; 3];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub kind: PatternKind,
    pub pattern: String,
    /// Host or text the pattern matched.
    pub matched: String,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub version: VersionId,
}

#[derive(Debug)]
struct PatternMeta {
    kind: PatternKind,
    pattern: String,
    sources: Vec<String>,
    confidence: f32,
}

#[derive(Debug)]
struct RegexChunk {
    set: RegexSet,
    metas: Vec<Arc<PatternMeta>>,
}

#[derive(Debug, Default)]
struct RegexIndex {
    keyed: HashMap<LiteralKey, Vec<RegexChunk>>,
    catch_all: Vec<RegexChunk>,
    len: usize,
}

impl RegexIndex {
    fn build(metas: Vec<Arc<PatternMeta>>) -> Result<Self, IndexBuildError> {
        let mut keyed: HashMap<LiteralKey, Vec<Arc<PatternMeta>>> = HashMap::new();
        let mut loose = Vec::new();
        let len = metas.len();
        for m in metas {
            match literal_key(&m.pattern) {
                Some(k) => keyed.entry(k).or_default().push(m),
                None => loose.push(m),
            }
        }
        let mut out = RegexIndex {
            len,
            ..Default::default()
        };
        for (k, group) in keyed {
            out.keyed.insert(k, compile_chunks(&String::from_utf8_lossy(&k), group)?);
        }
        out.catch_all = compile_chunks("*", loose)?;
        Ok(out)
    }

    fn matches(&self, text: &str, version: VersionId, out: &mut Vec<MatchResult>) {
        if self.len == 0 {
            return;
        }
        let lower = text.to_ascii_lowercase();
        let mut seen: HashSet<LiteralKey> = HashSet::new();
        let mut chunks: Vec<&RegexChunk> = self.catch_all.iter().collect();
        for w in lower.as_bytes().windows(3) {
            let k: LiteralKey = [w[0], w[1], w[2]];
            if !seen.insert(k) {
                continue;
            }
            if let Some(group) = self.keyed.get(&k) {
                chunks.extend(group.iter());
            }
        }
        for chunk in chunks {
            for idx in chunk.set.matches(text).iter() {
                let m = &chunk.metas[idx];
                out.push(to_result(m, text, version));
            }
        }
    }
}

fn compile_chunks(
    group: &str,
    metas: Vec<Arc<PatternMeta>>,
) -> Result<Vec<RegexChunk>, IndexBuildError> {
    let mut out = Vec::with_capacity(metas.len() / MAX_SET_PATTERNS + 1);
    for part in metas.chunks(MAX_SET_PATTERNS) {
        let set = RegexSetBuilder::new(part.iter().map(|m| m.pattern.as_str()))
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT.saturating_mul(part.len()))
            .build()
            .map_err(|e| {
                // blame a single pattern when one fails on its own
                match part.iter().find_map(|m| compile_regex(&m.pattern).err().map(|err| (m, err))) {
                    Some((m, err)) => IndexBuildError::Compile {
                        pattern: m.pattern.clone(),
                        message: err,
                    },
                    None => IndexBuildError::GroupTooLarge {
                        group: group.to_string(),
                        message: e.to_string(),
                    },
                }
            })?;
        out.push(RegexChunk {
            set,
            metas: part.to_vec(),
        });
    }
    Ok(out)
}

fn to_result(m: &PatternMeta, matched: &str, version: VersionId) -> MatchResult {
    MatchResult {
        kind: m.kind,
        pattern: m.pattern.clone(),
        matched: matched.to_string(),
        sources: m.sources.clone(),
        confidence: m.confidence,
        version,
    }
}

/// Compiled index of one version's pattern records.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    domains: HashMap<String, Arc<PatternMeta>>,
    url: RegexIndex,
    css: RegexIndex,
}

impl SnapshotIndex {
    pub fn build(version: &Version) -> Result<Self, IndexBuildError> {
        let mut domains = HashMap::new();
        let mut url = Vec::new();
        let mut css = Vec::new();
        for rec in version.patterns.values() {
            let meta = Arc::new(PatternMeta {
                kind: rec.kind,
                pattern: rec.pattern.clone(),
                sources: rec.sources.iter().cloned().collect(),
                confidence: rec.confidence,
            });
            match rec.kind {
                PatternKind::Domain => {
                    domains.insert(rec.pattern.clone(), meta);
                }
                PatternKind::UrlRegex => url.push(meta),
                PatternKind::CssRegex => css.push(meta),
            }
        }
        Ok(Self {
            domains,
            url: RegexIndex::build(url)?,
            css: RegexIndex::build(css)?,
        })
    }

    pub fn pattern_count(&self) -> usize {
        self.domains.len() + self.url.len + self.css.len
    }

    pub fn regex_count(&self) -> usize {
        self.url.len + self.css.len
    }

    /// Most specific domain record covering `host`.
    fn lookup_host(&self, host: &str, version: VersionId) -> Option<MatchResult> {
        if self.domains.is_empty() {
            return None;
        }
        let host = normalize_domain(host)?;
        let mut rest = host.as_str();
        loop {
            if let Some(m) = self.domains.get(rest) {
                return Some(to_result(m, &host, version));
            }
            match rest.find('.') {
                Some(dot) => rest = &rest[dot + 1..],
                None => return None,
            }
        }
    }
}

/// Cheap-to-clone reference to one compiled version.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    version: VersionId,
    index: Arc<SnapshotIndex>,
}

static CSS_URL_REF: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)"#).ok());

impl EngineHandle {
    pub fn empty() -> Self {
        Self {
            version: VersionId::ROOT,
            index: Arc::new(SnapshotIndex::default()),
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn pattern_count(&self) -> usize {
        self.index.pattern_count()
    }

    pub fn regex_count(&self) -> usize {
        self.index.regex_count()
    }

    /// Same compiled index under another version id (content-equal versions).
    pub fn relabel(&self, version: VersionId) -> Self {
        Self {
            version,
            index: Arc::clone(&self.index),
        }
    }

    pub fn lookup(&self, domain: &str) -> Option<MatchResult> {
        self.index.lookup_host(domain, self.version)
    }

    pub fn match_url(&self, url: &str) -> Vec<MatchResult> {
        let mut out = Vec::new();
        if let Some(host) = url_host(url) {
            out.extend(self.lookup(host));
        }
        self.index.url.matches(url, self.version, &mut out);
        out
    }

    pub fn match_css(&self, fragment: &str) -> Vec<MatchResult> {
        let mut out = Vec::new();
        self.index.css.matches(fragment, self.version, &mut out);
        if let Some(re) = CSS_URL_REF.as_ref() {
            let mut hosts = HashSet::new();
            for cap in re.captures_iter(fragment) {
                if let Some(host) = cap.get(1).and_then(|m| url_host(m.as_str())) {
                    if hosts.insert(host.to_ascii_lowercase()) {
                        out.extend(self.lookup(host));
                    }
                }
            }
        }
        out
    }
}

/// Host part of an absolute or protocol-relative URL.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = match url.find("://") {
        Some(i) => &url[i + 3..],
        None => url.strip_prefix("//")?,
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = host_port.split(':').next().unwrap_or(host_port);
    (!host.is_empty()).then_some(host)
}

/// The live engine: exactly one active handle, plus the previous one kept for
/// fast rollback until released.
pub struct PatternEngine {
    active: RwLock<EngineHandle>,
    previous: Mutex<Option<EngineHandle>>,
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new(EngineHandle::empty())
    }
}

impl PatternEngine {
    pub fn new(initial: EngineHandle) -> Self {
        gauge!("autoupdate_active_version").set(initial.version.0 as f64);
        gauge!("autoupdate_pattern_count").set(initial.pattern_count() as f64);
        Self {
            active: RwLock::new(initial),
            previous: Mutex::new(None),
        }
    }

    /// Build an index off the hot path.
    pub fn load_snapshot(version: &Version) -> Result<EngineHandle, IndexBuildError> {
        let t0 = std::time::Instant::now();
        let index = SnapshotIndex::build(version)?;
        tracing::info!(
            target: "engine",
            version = version.id.0,
            patterns = index.pattern_count(),
            build_ms = t0.elapsed().as_millis() as u64,
            "snapshot built"
        );
        Ok(EngineHandle {
            version: version.id,
            index: Arc::new(index),
        })
    }

    /// Swap in `handle`; returns the version it replaced.
    pub fn activate(&self, handle: EngineHandle) -> VersionId {
        let version = handle.version;
        let count = handle.pattern_count();
        let old = {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *active, handle)
        };
        let old_version = old.version;
        *self.previous.lock().unwrap_or_else(|e| e.into_inner()) = Some(old);
        gauge!("autoupdate_active_version").set(version.0 as f64);
        gauge!("autoupdate_pattern_count").set(count as f64);
        tracing::info!(target: "engine", version = version.0, replaced = old_version.0, patterns = count, "snapshot activated");
        old_version
    }

    pub fn current(&self) -> EngineHandle {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn active_version(&self) -> VersionId {
        self.active.read().unwrap_or_else(|e| e.into_inner()).version
    }

    pub fn previous(&self) -> Option<EngineHandle> {
        self.previous.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn release_previous(&self) {
        if let Some(old) = self.previous.lock().unwrap_or_else(|e| e.into_inner()).take() {
            tracing::debug!(target: "engine", version = old.version.0, "previous snapshot released");
        }
    }

    pub fn lookup(&self, domain: &str) -> Option<MatchResult> {
        self.current().lookup(domain)
    }

    pub fn match_url(&self, url: &str) -> Vec<MatchResult> {
        self.current().match_url(url)
    }

    pub fn match_css(&self, fragment: &str) -> Vec<MatchResult> {
        self.current().match_css(fragment)
    }
}

/// First 3 bytes (lowercased) of the longest literal run every match must
/// contain, scanning top-level pattern text only. `None` puts the pattern in
/// the catch-all group.
fn literal_key(pattern: &str) -> Option<LiteralKey> {
    let b = pattern.as_bytes();
    let mut best: Vec<u8> = Vec::new();
    let mut cur: Vec<u8> = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    fn flush(cur: &mut Vec<u8>, best: &mut Vec<u8>) {
        if cur.len() > best.len() {
            *best = std::mem::take(cur);
        } else {
            cur.clear();
        }
    }

    while i < b.len() {
        let c = b[i];
        match c {
            b'\\' => {
                let Some(&next) = b.get(i + 1) else { break };
                if next.is_ascii_punctuation() || next == b' ' {
                    if depth == 0 {
                        cur.push(next.to_ascii_lowercase());
                    }
                    i += 2;
                    continue;
                }
                flush(&mut cur, &mut best);
                i += 2;
                let fixed = match next {
                    b'x' => 2,
                    b'u' => 4,
                    b'U' => 8,
                    b'p' | b'P' => 1,
                    _ => 0,
                };
                if fixed > 0 {
                    if b.get(i) == Some(&b'{') {
                        while i < b.len() && b[i] != b'}' {
                            i += 1;
                        }
                        i += 1;
                    } else {
                        i += fixed;
                    }
                }
                continue;
            }
            b'(' => {
                depth += 1;
                flush(&mut cur, &mut best);
            }
            b')' => {
                depth = depth.saturating_sub(1);
                flush(&mut cur, &mut best);
            }
            b'[' => {
                flush(&mut cur, &mut best);
                i += 1;
                if b.get(i) == Some(&b'^') {
                    i += 1;
                }
                if b.get(i) == Some(&b']') {
                    i += 1;
                }
                while i < b.len() && b[i] != b']' {
                    if b[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'|' if depth == 0 => return None,
            b'?' | b'*' | b'{' => {
                // previous atom is optional
                if depth == 0 {
                    cur.pop();
                }
                flush(&mut cur, &mut best);
                if c == b'{' {
                    while i < b.len() && b[i] != b'}' {
                        i += 1;
                    }
                }
            }
            b'.' | b'^' | b'$' | b'+' => flush(&mut cur, &mut best),
            _ if depth == 0 && c.is_ascii() => cur.push(c.to_ascii_lowercase()),
            _ => flush(&mut cur, &mut best),
        }
        i += 1;
    }
    flush(&mut cur, &mut best);
    (best.len() >= 3).then(|| [best[0], best[1], best[2]])
}
