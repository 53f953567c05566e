// cmh-core/src/cache/manager.rs
//! Content-addressed store of materialized modules.
//!
//! The manager owns an in-memory index (fingerprint -> entry) guarded by a
//! `std::sync::Mutex` that is never held across an `.await`. Each
//! fingerprint has at most one materialization in flight: the first caller
//! inserts a `Pending` entry and spawns the work as a detached task, every
//! caller (the first included) waits on the same `watch` channel and gets
//! the same outcome.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cmh_common::config::Config;
use cmh_common::error::{CmhError, Result};
use cmh_common::{ParameterValue, ResolvedModule};
use futures::FutureExt;
use semver::Version;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use super::entry::{
    CacheEntrySnapshot, CacheFilter, CacheState, CacheStats, EntryManifest, MANIFEST_FILENAME,
};
use super::fingerprint::fingerprint_module;
use super::materializer::Materializer;

type Outcome = Option<Result<PathBuf>>;

#[derive(Debug)]
struct Entry {
    name: String,
    version: Version,
    parameters: BTreeMap<String, ParameterValue>,
    path: PathBuf,
    state: CacheState,
    size_bytes: u64,
    digest: Option<String>,
    /// LRU tick; higher is more recent.
    last_access: u64,
    last_used: SystemTime,
    /// Present while `Pending`.
    outcome: Option<watch::Receiver<Outcome>>,
}

impl Entry {
    fn snapshot(&self, fingerprint: &str) -> CacheEntrySnapshot {
        CacheEntrySnapshot {
            fingerprint: fingerprint.to_string(),
            name: self.name.clone(),
            version: self.version.clone(),
            parameters: self.parameters.clone(),
            path: self.path.clone(),
            state: self.state,
            size_bytes: self.size_bytes,
            last_used: self.last_used,
        }
    }

    fn artifact_present(&self) -> bool {
        self.path.is_dir() && self.path.join(MANIFEST_FILENAME).is_file()
    }
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, Entry>,
    tick: u64,
}

impl Index {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[derive(Debug, Clone)]
struct Limits {
    max_entries: Option<usize>,
    max_bytes: Option<u64>,
    timeout: Duration,
    verify: bool,
}

struct Inner {
    config: Config,
    limits: Limits,
    /// Private subdirectory of the shared staging area.
    staging: PathBuf,
    materializer: Arc<dyn Materializer>,
    index: Mutex<Index>,
}

/// What `materialize` does once it has looked at the index.
enum Lookup {
    Hit(PathBuf),
    Verify { path: PathBuf, digest: String },
    Wait(watch::Receiver<Outcome>),
}

/// Handle to the module cache. Cheap to clone; clones share one index.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_dir", &self.inner.config.cache_dir())
            .field("limits", &self.inner.limits)
            .finish()
    }
}

impl CacheManager {
    /// Opens the cache below `config.cache_dir`, rebuilding the index from the
    /// manifests found on disk.
    ///
    /// Every manager stages into its own subdirectory of the staging area.
    /// Staging directories older than the materialization timeout can no
    /// longer belong to live work and are removed; younger ones may belong to
    /// another manager on the same cache and are left alone.
    pub fn open(config: &Config, materializer: Arc<dyn Materializer>) -> Result<Self> {
        let cache_dir = config.cache_dir();
        cmh_aio::fs::create_dir_all(cache_dir)?;
        let staging_root = config.staging_dir();
        cmh_aio::fs::create_dir_all(&staging_root)?;
        sweep_stale_staging(&staging_root, config.materialize_timeout);
        let staging = staging_root.join(instance_name());
        cmh_aio::fs::create_dir_all(&staging)?;

        let mut manifests = scan_manifests(config);
        manifests.sort_by(|a, b| a.0.created_at.cmp(&b.0.created_at));

        let mut index = Index::default();
        for (manifest, path) in manifests {
            let last_access = index.next_tick();
            index.entries.insert(
                manifest.fingerprint.clone(),
                Entry {
                    name: manifest.name,
                    version: manifest.version,
                    parameters: manifest.parameters,
                    path,
                    state: CacheState::Ready,
                    size_bytes: manifest.size_bytes,
                    digest: Some(manifest.digest),
                    last_access,
                    last_used: UNIX_EPOCH + Duration::from_secs(manifest.created_at),
                    outcome: None,
                },
            );
        }
        info!(
            "Opened module cache at {} with {} entries",
            cache_dir.display(),
            index.entries.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                limits: Limits {
                    max_entries: config.cache_max_entries,
                    max_bytes: config.cache_max_bytes,
                    timeout: config.materialize_timeout,
                    verify: config.verify_artifacts,
                },
                staging,
                materializer,
                index: Mutex::new(index),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn fingerprint(&self, module: &ResolvedModule) -> String {
        fingerprint_module(module)
    }

    /// Returns the directory holding the artifact of `module`, producing it
    /// first if needed.
    ///
    /// Concurrent calls for the same fingerprint share one materialization
    /// and all see the same path or the same error. Dropping the returned
    /// future does not cancel the work.
    #[instrument(skip_all, fields(module = %module))]
    pub async fn materialize(&self, module: &ResolvedModule) -> Result<PathBuf> {
        let fingerprint = fingerprint_module(module);
        loop {
            let lookup = self.lookup_or_start(module, &fingerprint);
            match lookup {
                Lookup::Hit(path) => return Ok(path),
                Lookup::Wait(rx) => return wait_for_outcome(rx).await,
                Lookup::Verify { path, digest } => {
                    let check_path = path.clone();
                    let actual = tokio::task::spawn_blocking(move || {
                        cmh_aio::checksum::tree_digest(&check_path, &[MANIFEST_FILENAME])
                    })
                    .await
                    .map_err(|e| CmhError::Cache(format!("verification task failed: {e}")))?;

                    match actual {
                        Ok(actual) if actual == digest => {
                            debug!("Verified cached artifact {}", path.display());
                            return Ok(path);
                        }
                        Ok(actual) => warn!(
                            "Cached artifact {} is corrupt (digest {} != {}); re-materializing",
                            path.display(),
                            actual,
                            digest
                        ),
                        Err(e) => warn!(
                            "Cannot verify cached artifact {}: {}; re-materializing",
                            path.display(),
                            e
                        ),
                    }
                    self.discard_if_unchanged(&fingerprint, &digest);
                }
            }
        }
    }

    fn lookup_or_start(&self, module: &ResolvedModule, fingerprint: &str) -> Lookup {
        let mut index = self.lock();
        let tick = index.next_tick();

        if let Some(entry) = index.entries.get_mut(fingerprint) {
            entry.last_access = tick;
            entry.last_used = SystemTime::now();
            match entry.state {
                CacheState::Pending => {
                    if let Some(rx) = &entry.outcome {
                        debug!("Joining in-flight materialization of {}", fingerprint);
                        return Lookup::Wait(rx.clone());
                    }
                }
                CacheState::Ready if entry.artifact_present() => {
                    if self.inner.limits.verify {
                        if let Some(digest) = &entry.digest {
                            return Lookup::Verify {
                                path: entry.path.clone(),
                                digest: digest.clone(),
                            };
                        }
                    }
                    debug!("Cache hit for {} at {}", module, entry.path.display());
                    return Lookup::Hit(entry.path.clone());
                }
                CacheState::Ready => {
                    warn!(
                        "Cached artifact for {} is missing at {}; re-materializing",
                        module,
                        entry.path.display()
                    );
                    entry.state = CacheState::Failed;
                }
                CacheState::Failed => {}
            }
            index.entries.remove(fingerprint);
        }

        let (tx, rx) = watch::channel(None);
        let path = self
            .inner
            .config
            .artifact_dir(&module.name, &module.version, fingerprint);
        index.entries.insert(
            fingerprint.to_string(),
            Entry {
                name: module.name.clone(),
                version: module.version.clone(),
                parameters: module.parameters.clone(),
                path: path.clone(),
                state: CacheState::Pending,
                size_bytes: 0,
                digest: None,
                last_access: tick,
                last_used: SystemTime::now(),
                outcome: Some(rx.clone()),
            },
        );
        drop(index);

        debug!("Starting materialization of {} ({})", module, fingerprint);
        let staging = self.inner.staging.join(format!("{fingerprint}-{tick}"));
        tokio::spawn(run_materialization(
            Arc::clone(&self.inner),
            module.clone(),
            fingerprint.to_string(),
            staging,
            path,
            tx,
        ));
        Lookup::Wait(rx)
    }

    /// Drops a `Ready` entry that failed verification, unless another caller
    /// already replaced it.
    fn discard_if_unchanged(&self, fingerprint: &str, digest: &str) {
        let mut index = self.lock();
        let stale = index.entries.get(fingerprint).is_some_and(|e| {
            e.state == CacheState::Ready && e.digest.as_deref() == Some(digest)
        });
        if stale {
            index.entries.remove(fingerprint);
        }
    }

    /// Removes matching entries from the index and from disk. `None` clears
    /// everything. Entries with a materialization in flight are left alone.
    /// Returns the number of entries removed.
    pub fn clear(&self, filter: Option<&CacheFilter>) -> Result<usize> {
        let trash = {
            let mut index = self.lock();
            let doomed: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.state != CacheState::Pending)
                .filter(|(_, e)| filter.is_none_or(|f| f.matches(&e.name, &e.version)))
                .map(|(fp, _)| fp.clone())
                .collect();
            let mut trash = Vec::with_capacity(doomed.len());
            for fingerprint in doomed {
                if let Some(entry) = index.entries.remove(&fingerprint) {
                    debug!("Clearing cache entry {} ({}@{})", fingerprint, entry.name, entry.version);
                    match self.inner.move_to_trash(&entry.path, &fingerprint) {
                        Ok(t) => trash.push(t),
                        Err(e) => warn!("Failed to move {} aside: {}", entry.path.display(), e),
                    }
                }
            }
            trash
        };

        let removed = trash.len();
        self.inner.empty_trash(trash)?;
        info!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Snapshots of all entries, sorted by name, version and fingerprint.
    pub fn info(&self) -> Vec<CacheEntrySnapshot> {
        let index = self.lock();
        let mut snapshots: Vec<CacheEntrySnapshot> = index
            .entries
            .iter()
            .map(|(fp, entry)| entry.snapshot(fp))
            .collect();
        drop(index);
        snapshots.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.version.cmp(&b.version))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        snapshots
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock();
        index.entries.values().fold(CacheStats::default(), |mut stats, entry| {
            stats.entries += 1;
            match entry.state {
                CacheState::Ready => {
                    stats.ready += 1;
                    stats.total_bytes += entry.size_bytes;
                }
                CacheState::Pending => stats.pending += 1,
                CacheState::Failed => {}
            }
            stats
        })
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.inner.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Renames an artifact directory into staging, freeing its final location
    /// while the index lock is held. The recursive delete happens later.
    fn move_to_trash(&self, path: &Path, fingerprint: &str) -> Result<(PathBuf, PathBuf)> {
        let trash = self
            .staging
            .join(format!("trash-{fingerprint}-{}", unique_suffix()));
        if path.exists() {
            cmh_aio::fs::create_dir_all(&self.staging)?;
            std::fs::rename(path, &trash)?;
        }
        Ok((trash, path.to_path_buf()))
    }

    fn empty_trash(&self, trash: Vec<(PathBuf, PathBuf)>) -> Result<()> {
        let cache_dir = self.config.cache_dir();
        for (trash_dir, original) in trash {
            cmh_aio::fs::remove_directory_recursive(&trash_dir)?;
            cmh_aio::fs::prune_empty_parents(&original, cache_dir);
        }
        Ok(())
    }

    /// Records the outcome of a materialization and tells every waiter.
    fn finish(&self, fingerprint: &str, result: Result<(PathBuf, EntryManifest)>, tx: watch::Sender<Outcome>) {
        match result {
            Ok((path, manifest)) => {
                let evicted = {
                    let mut index = self.lock();
                    if let Some(entry) = index.entries.get_mut(fingerprint) {
                        entry.state = CacheState::Ready;
                        entry.size_bytes = manifest.size_bytes;
                        entry.digest = Some(manifest.digest);
                        entry.outcome = None;
                    }
                    self.evict(&mut index, fingerprint)
                };
                info!("Materialized {} into {}", fingerprint, path.display());
                tx.send_replace(Some(Ok(path)));
                if let Err(e) = self.empty_trash(evicted) {
                    warn!("Failed to delete evicted cache entries: {}", e);
                }
            }
            Err(err) => {
                error!("Materialization of {} failed: {}", fingerprint, err);
                let mut index = self.lock();
                if let Some(entry) = index.entries.get_mut(fingerprint) {
                    entry.state = CacheState::Failed;
                }
                tx.send_replace(Some(Err(err)));
                index.entries.remove(fingerprint);
            }
        }
    }

    /// Drops least recently used `Ready` entries until the configured bounds
    /// hold. `keep` is never evicted.
    fn evict(&self, index: &mut Index, keep: &str) -> Vec<(PathBuf, PathBuf)> {
        let mut trash = Vec::new();
        loop {
            let (count, bytes) = index
                .entries
                .values()
                .filter(|e| e.state == CacheState::Ready)
                .fold((0usize, 0u64), |(c, b), e| (c + 1, b + e.size_bytes));
            let over_count = self.limits.max_entries.is_some_and(|max| count > max);
            let over_bytes = self.limits.max_bytes.is_some_and(|max| bytes > max);
            if !over_count && !over_bytes {
                break;
            }

            let victim = index
                .entries
                .iter()
                .filter(|(fp, e)| e.state == CacheState::Ready && fp.as_str() != keep)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(fp, _)| fp.clone());
            let Some(victim) = victim else {
                break;
            };
            let Some(entry) = index.entries.remove(&victim) else {
                break;
            };
            debug!(
                "Evicting {}@{} ({}, {} bytes)",
                entry.name, entry.version, victim, entry.size_bytes
            );
            match self.move_to_trash(&entry.path, &victim) {
                Ok(t) => trash.push(t),
                Err(e) => warn!("Failed to move evicted entry {} aside: {}", victim, e),
            }
        }
        trash
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_materialization(
    inner: Arc<Inner>,
    module: ResolvedModule,
    fingerprint: String,
    staging: PathBuf,
    destination: PathBuf,
    tx: watch::Sender<Outcome>,
) {
    let timeout = inner.limits.timeout;
    let work = produce(&inner, &module, &fingerprint, &staging, &destination);
    let result = match tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CmhError::Materialization {
            module: module.name.clone(),
            fingerprint: fingerprint.clone(),
            cause: Arc::new(CmhError::Generic("materializer panicked".to_string())),
        }),
        Err(_) => {
            warn!("Materialization of {} timed out after {:?}", module, timeout);
            Err(CmhError::MaterializationTimeout {
                module: module.name.clone(),
                fingerprint: fingerprint.clone(),
                timeout,
            })
        }
    };

    if result.is_err() {
        if let Err(e) = cmh_aio::fs::remove_directory_recursive(&staging) {
            warn!("Failed to remove staging directory {}: {}", staging.display(), e);
        }
    }
    inner.finish(&fingerprint, result, tx);
}

/// Runs the materializer into `staging`, writes the manifest and moves the
/// finished tree to `destination`.
async fn produce(
    inner: &Inner,
    module: &ResolvedModule,
    fingerprint: &str,
    staging: &Path,
    destination: &Path,
) -> Result<(PathBuf, EntryManifest)> {
    let wrap = |cause: CmhError| CmhError::Materialization {
        module: module.name.clone(),
        fingerprint: fingerprint.to_string(),
        cause: Arc::new(cause),
    };

    cmh_aio::fs::remove_directory_recursive(staging).map_err(wrap)?;
    cmh_aio::fs::create_dir_all(staging).map_err(wrap)?;

    inner
        .materializer
        .materialize(module, staging)
        .await
        .map_err(wrap)?;

    let staging_owned = staging.to_path_buf();
    let destination_owned = destination.to_path_buf();
    let mut manifest = EntryManifest {
        fingerprint: fingerprint.to_string(),
        name: module.name.clone(),
        version: module.version.clone(),
        parameters: module.parameters.clone(),
        size_bytes: 0,
        digest: String::new(),
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };

    let manifest = tokio::task::spawn_blocking(move || -> Result<EntryManifest> {
        manifest.digest = cmh_aio::checksum::tree_digest(&staging_owned, &[MANIFEST_FILENAME])?;
        manifest.size_bytes = cmh_aio::fs::dir_size(&staging_owned);
        cmh_aio::json_io::write_json_sync(&staging_owned.join(MANIFEST_FILENAME), &manifest)?;
        cmh_aio::fs::replace_directory(&staging_owned, &destination_owned)?;
        Ok(manifest)
    })
    .await
    .map_err(|e| wrap(CmhError::Generic(format!("finalize task failed: {e}"))))?
    .map_err(wrap)?;

    Ok((destination.to_path_buf(), manifest))
}

async fn wait_for_outcome(mut rx: watch::Receiver<Outcome>) -> Result<PathBuf> {
    let outcome = rx.wait_for(Option::is_some).await.map_err(|_| {
        CmhError::Cache("materialization ended without publishing a result".to_string())
    })?;
    match &*outcome {
        Some(result) => result.clone(),
        None => Err(CmhError::Cache(
            "materialization ended without publishing a result".to_string(),
        )),
    }
}

fn scan_manifests(config: &Config) -> Vec<(EntryManifest, PathBuf)> {
    let cache_dir = config.cache_dir();
    // <cache>/<name>/<version>/<fingerprint>/cmh-entry.json
    let walker = WalkDir::new(cache_dir)
        .max_depth(4)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !e.file_name().to_string_lossy().starts_with('.'));

    let mut found = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if entry.depth() != 4
            || !entry.file_type().is_file()
            || entry.file_name() != MANIFEST_FILENAME
        {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let manifest: EntryManifest = match cmh_aio::json_io::read_json_sync(entry.path()) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable cache manifest {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let expected = config.artifact_dir(&manifest.name, &manifest.version, &manifest.fingerprint);
        if expected != dir {
            warn!(
                "Ignoring cache manifest {} that does not match its location",
                entry.path().display()
            );
            continue;
        }
        found.push((manifest, dir.to_path_buf()));
    }
    found
}

/// Removes entries of the shared staging area last modified more than
/// `stale_after` ago.
fn sweep_stale_staging(root: &Path, stale_after: Duration) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list staging area {}: {}", root.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        if age.is_some_and(|age| age <= stale_after) {
            continue;
        }
        debug!("Removing stale staging entry {}", path.display());
        let removed = if path.is_dir() {
            cmh_aio::fs::remove_directory_recursive(&path)
        } else {
            std::fs::remove_file(&path).map_err(CmhError::from)
        };
        if let Err(e) = removed {
            warn!("Failed to remove stale staging entry {}: {}", path.display(), e);
        }
    }
}

fn instance_name() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        unique_suffix(),
        NEXT.fetch_add(1, AtomicOrdering::Relaxed)
    )
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
