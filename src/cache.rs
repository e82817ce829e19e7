//! Resource content cache.
//!
//! Maps request paths to cached file content with a freshness check on every
//! lookup: an entry is only served while the backing file's length and
//! last-modified time still match what was recorded at cache time. Admission
//! and eviction are bounded three ways (total bytes, per-file bytes, entry
//! count); eviction is least-recently-looked-up first.
//!
//! All cache state mutates under one mutex. Lookup, admission, eviction and
//! flush serialize against each other so the aggregate size and count are
//! always consistent.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::metrics;

/// Resolves a request path to a backing resource.
pub trait ResourceFactory: Send + Sync {
    /// `None` when the path cannot map to a resource at all.
    fn get_resource(&self, path: &str) -> Option<Resource>;
}

/// File-backed resource handle.
#[derive(Debug, Clone)]
pub struct Resource {
    path: PathBuf,
}

impl Resource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn length(&self) -> u64 {
        fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok()?.modified().ok()
    }

    pub fn read(&self) -> std::io::Result<Bytes> {
        fs::read(&self.path).map(Bytes::from)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolves request paths against a root directory, rejecting any path that
/// could escape it.
pub struct DirectoryResourceFactory {
    root: PathBuf,
}

impl DirectoryResourceFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceFactory for DirectoryResourceFactory {
    fn get_resource(&self, path: &str) -> Option<Resource> {
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return None,
            }
        }
        Some(Resource::new(self.root.join(relative)))
    }
}

/// One cached resource: the payload plus the metadata recorded at cache
/// time, used for the freshness check.
#[derive(Debug)]
pub struct CachedContent {
    path: String,
    data: Bytes,
    content_length: u64,
    last_modified: Option<SystemTime>,
    mime_type: Option<&'static str>,
}

impl CachedContent {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        self.mime_type
    }
}

struct CacheState {
    /// Recency order is lookup order: `get` refreshes, `pop_lru` evicts the
    /// least recently looked up (ties fall to insertion order).
    entries: LruCache<String, Arc<CachedContent>>,
    cached_size: u64,
}

/// Size- and count-bounded cache of file content.
pub struct ResourceCache {
    factory: Arc<dyn ResourceFactory>,
    max_cache_size: u64,
    max_cached_file_size: u64,
    max_cached_files: usize,
    state: Mutex<CacheState>,
}

impl ResourceCache {
    pub fn new(factory: Arc<dyn ResourceFactory>, config: CacheConfig) -> Self {
        Self {
            factory,
            max_cache_size: config.max_cache_size,
            max_cached_file_size: config.max_cached_file_size,
            max_cached_files: config.max_cached_files,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                cached_size: 0,
            }),
        }
    }

    /// Looks a path up, refreshing its recency.
    ///
    /// Returns `None` for paths that are absent, unreadable or not cacheable
    /// (zero-length or over the per-file budget); the caller falls back to a
    /// direct read. A stale entry is evicted and reloaded on this same call.
    pub fn lookup(&self, path: &str) -> Option<Arc<CachedContent>> {
        let mut state = self.lock();

        if let Some(content) = state.entries.get(path) {
            let content = Arc::clone(content);
            if self.is_fresh(&content) {
                trace!(path, "cache hit");
                metrics::CACHE_HITS.inc();
                return Some(content);
            }

            debug!(path, "cached entry stale; invalidating");
            state.entries.pop(path);
            state.cached_size -= content.content_length;
            metrics::CACHE_EVICTIONS.with_label_values(&["stale"]).inc();
        }

        metrics::CACHE_MISSES.inc();
        self.load(&mut state, path)
    }

    /// Evicts everything. Safe to call concurrently with lookups.
    pub fn flush_cache(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.cached_size = 0;
        debug!("resource cache flushed");
    }

    /// Sum of cached entries' lengths, in bytes.
    pub fn cached_size(&self) -> u64 {
        self.lock().cached_size
    }

    /// Number of cached entries.
    pub fn cached_files(&self) -> usize {
        self.lock().entries.len()
    }

    fn is_fresh(&self, content: &CachedContent) -> bool {
        let Some(resource) = self.factory.get_resource(&content.path) else {
            return false;
        };
        resource.exists()
            && resource.length() == content.content_length
            && resource.last_modified() == content.last_modified
    }

    fn load(&self, state: &mut CacheState, path: &str) -> Option<Arc<CachedContent>> {
        let resource = self.factory.get_resource(path)?;
        if !resource.exists() {
            return None;
        }

        let length = resource.length();
        if length == 0 || length > self.max_cached_file_size || length > self.max_cache_size {
            trace!(path, length, "resource not cacheable");
            return None;
        }

        let data = match resource.read() {
            Ok(data) => data,
            Err(e) => {
                debug!(path, error = %e, "resource unreadable");
                return None;
            }
        };

        let content = Arc::new(CachedContent {
            path: path.to_string(),
            content_length: length,
            last_modified: resource.last_modified(),
            mime_type: mime_type(resource.path()),
            data,
        });

        self.shrink_for(state, length);
        if state.cached_size + length > self.max_cache_size
            || state.entries.len() + 1 > self.max_cached_files
        {
            // Budgets cannot fit this entry even with an empty cache.
            return Some(content);
        }

        state.cached_size += length;
        state.entries.put(path.to_string(), Arc::clone(&content));
        debug!(
            path,
            length,
            total = state.cached_size,
            files = state.entries.len(),
            "cached resource"
        );
        Some(content)
    }

    /// Evicts least-recently-looked-up entries until `incoming` bytes fit
    /// both budgets.
    fn shrink_for(&self, state: &mut CacheState, incoming: u64) {
        while (state.cached_size + incoming > self.max_cache_size
            || state.entries.len() + 1 > self.max_cached_files)
            && !state.entries.is_empty()
        {
            if let Some((path, evicted)) = state.entries.pop_lru() {
                state.cached_size -= evicted.content_length;
                debug!(path = %path, length = evicted.content_length, "evicted least-recently-used entry");
                metrics::CACHE_EVICTIONS.with_label_values(&["budget"]).inc();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// MIME type for cached content, by file extension.
fn mime_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?;
    let mime = match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime)
}
