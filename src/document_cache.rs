//! Bounded cache of parsed document buffers.
//!
//! At most `capacity` buffers stay resident. When a load pushes the cache over capacity, the
//! least recently used document that is not protected (registered open, or reported open by the
//! [`DocumentNavigator`]) is evicted. Dirty victims are spilled to a scratch file first, never
//! to the original, and the next load reads the scratch copy back.
//!
//! One cache-wide mutex guards membership and recency. File I/O always happens with the lock
//! released; concurrent loads of the same document share a single read through a load slot.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use ropey::Rope;
use thiserror::Error;

use crate::event_log::{self, DebugRecord};

const EDIT_RETRY_LIMIT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(PathBuf);

impl DocumentId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for DocumentId {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for DocumentId {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache io error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("document {0} kept being evicted while it was edited")]
    Contended(DocumentId),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

/// Answers whether the navigation layer currently shows a document. Called with the cache lock
/// held, so implementations must not call back into the cache.
pub trait DocumentNavigator: Send + Sync {
    fn is_open(&self, id: &DocumentId) -> bool;
}

pub trait BackingStore: Send + Sync {
    fn read(&self, id: &DocumentId) -> io::Result<Rope>;
    fn write(&self, id: &DocumentId, text: &Rope) -> io::Result<()>;
    fn read_scratch(&self, path: &Path) -> io::Result<Rope>;
    /// Writes a scratch copy. `Ok(None)` means no scratch location is configured.
    fn write_scratch(&self, id: &DocumentId, text: &Rope) -> io::Result<Option<PathBuf>>;
    fn discard_scratch(&self, path: &Path);
}

#[derive(Debug, Clone, Default)]
pub struct FsBackingStore {
    scratch_dir: Option<PathBuf>,
}

impl FsBackingStore {
    pub fn new(scratch_dir: Option<PathBuf>) -> Self {
        Self { scratch_dir }
    }

    fn scratch_path(dir: &Path, id: &DocumentId) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stem = id
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        dir.join(format!("{:016x}-{stem}.scratch", hasher.finish()))
    }
}

fn read_rope(path: &Path) -> io::Result<Rope> {
    Rope::from_reader(BufReader::new(File::open(path)?))
}

fn write_rope_atomic(path: &Path, text: &Rope) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        text.write_to(&mut writer)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)
}

impl BackingStore for FsBackingStore {
    fn read(&self, id: &DocumentId) -> io::Result<Rope> {
        read_rope(id.path())
    }

    fn write(&self, id: &DocumentId, text: &Rope) -> io::Result<()> {
        write_rope_atomic(id.path(), text)
    }

    fn read_scratch(&self, path: &Path) -> io::Result<Rope> {
        read_rope(path)
    }

    fn write_scratch(&self, id: &DocumentId, text: &Rope) -> io::Result<Option<PathBuf>> {
        let Some(dir) = self.scratch_dir.as_ref() else {
            return Ok(None);
        };
        fs::create_dir_all(dir)?;
        let path = Self::scratch_path(dir, id);
        write_rope_atomic(&path, text)?;
        Ok(Some(path))
    }

    fn discard_scratch(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!("failed to remove scratch file {}: {err}", path.display());
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeclineReason {
    /// The victim is dirty and no scratch directory is configured.
    NoScratchTarget,
    FlushFailed(CacheError),
    /// The buffer changed while its scratch copy was being written.
    EditedDuringFlush,
}

#[derive(Debug, Clone)]
pub struct Declined {
    pub id: DocumentId,
    pub reason: DeclineReason,
}

/// What one eviction pass did.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub evicted: Vec<DocumentId>,
    pub spilled: Vec<DocumentId>,
    pub declined: Vec<Declined>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.spilled.is_empty() && self.declined.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &CacheError> {
        self.declined.iter().filter_map(|declined| match &declined.reason {
            DeclineReason::FlushFailed(err) => Some(err),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub dirty: bool,
    pub generation: u64,
    pub last_access: DateTime<Utc>,
    pub scratch: Option<PathBuf>,
}

struct Entry {
    rope: Rope,
    dirty: bool,
    generation: u64,
    last_access: DateTime<Utc>,
    tick: u64,
    scratch: Option<PathBuf>,
}

#[derive(Default)]
struct LoadSlot {
    result: Mutex<Option<Result<Rope, CacheError>>>,
    ready: Condvar,
}

impl LoadSlot {
    fn wait(&self) -> Result<Rope, CacheError> {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn fill(&self, result: Result<Rope, CacheError>) {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(result);
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct CacheInner {
    resident: HashMap<DocumentId, Entry>,
    loading: HashMap<DocumentId, Arc<LoadSlot>>,
    /// Scratch copies of evicted dirty documents; authoritative until reloaded.
    spilled: HashMap<DocumentId, PathBuf>,
    open: HashSet<DocumentId>,
    flushing: HashSet<DocumentId>,
    tick: u64,
    /// Source of buffer generations. Never reused, so a replaced or reloaded buffer cannot
    /// match a generation captured before it existed.
    generations: u64,
}

impl CacheInner {
    fn touch(&mut self, id: &DocumentId) -> Option<&mut Entry> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.resident.get_mut(id)?;
        entry.tick = tick;
        entry.last_access = Utc::now();
        Some(entry)
    }

    fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    fn insert(&mut self, id: DocumentId, rope: Rope, scratch: Option<PathBuf>, dirty: bool) {
        self.tick += 1;
        let generation = self.next_generation();
        self.resident.insert(
            id,
            Entry {
                rope,
                dirty,
                generation,
                last_access: Utc::now(),
                tick: self.tick,
                scratch,
            },
        );
    }
}

pub struct DocumentCache {
    capacity: usize,
    store: Arc<dyn BackingStore>,
    inner: Mutex<CacheInner>,
    navigator: RwLock<Option<Arc<dyn DocumentNavigator>>>,
}

enum LoadRole {
    Resident(Rope),
    Waiter(Arc<LoadSlot>),
    Loader(Arc<LoadSlot>, Option<PathBuf>),
}

impl DocumentCache {
    pub fn new(capacity: usize, store: Arc<dyn BackingStore>) -> Self {
        Self {
            capacity: capacity.max(1),
            store,
            inner: Mutex::new(CacheInner::default()),
            navigator: RwLock::new(None),
        }
    }

    pub fn with_fs(capacity: usize, scratch_dir: Option<PathBuf>) -> Self {
        Self::new(capacity, Arc::new(FsBackingStore::new(scratch_dir)))
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn navigator(&self) -> Option<Arc<dyn DocumentNavigator>> {
        self.navigator
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_navigator(&self, navigator: Option<Arc<dyn DocumentNavigator>>) {
        *self.navigator.write().unwrap_or_else(PoisonError::into_inner) = navigator;
    }

    pub fn get(&self, id: &DocumentId) -> Result<Rope, CacheError> {
        self.get_with_report(id).map(|(rope, _)| rope)
    }

    /// Returns the buffer plus the report of the eviction pass this call triggered, if any.
    pub fn get_with_report(&self, id: &DocumentId) -> Result<(Rope, EvictionReport), CacheError> {
        let role = {
            let mut inner = self.lock();
            if let Some(entry) = inner.touch(id) {
                LoadRole::Resident(entry.rope.clone())
            } else if let Some(slot) = inner.loading.get(id) {
                LoadRole::Waiter(slot.clone())
            } else {
                let slot = Arc::new(LoadSlot::default());
                inner.loading.insert(id.clone(), slot.clone());
                LoadRole::Loader(slot, inner.spilled.get(id).cloned())
            }
        };

        match role {
            LoadRole::Resident(rope) => Ok((rope, EvictionReport::default())),
            LoadRole::Waiter(slot) => slot.wait().map(|rope| (rope, EvictionReport::default())),
            LoadRole::Loader(slot, scratch) => {
                let loaded = match scratch.as_deref() {
                    Some(path) => self
                        .store
                        .read_scratch(path)
                        .map_err(|err| CacheError::io(path, err)),
                    None => self
                        .store
                        .read(id)
                        .map_err(|err| CacheError::io(id.path(), err)),
                };
                {
                    let mut inner = self.lock();
                    inner.loading.remove(id);
                    if let Ok(rope) = loaded.as_ref() {
                        // A scratch copy differs from the original file, so the buffer is dirty.
                        let scratch = inner.spilled.remove(id);
                        let dirty = scratch.is_some();
                        inner.insert(id.clone(), rope.clone(), scratch, dirty);
                    }
                }
                slot.fill(loaded.clone());
                let rope = loaded?;
                let report = self.evict_excess(id);
                Ok((rope, report))
            }
        }
    }

    /// Adds a buffer that has no file yet (or replaces a resident one) and marks it dirty.
    pub fn insert_new(&self, id: &DocumentId, rope: Rope) -> EvictionReport {
        {
            let mut inner = self.lock();
            let scratch = inner.resident.remove(id).and_then(|entry| entry.scratch);
            inner.insert(id.clone(), rope, scratch, true);
        }
        self.evict_excess(id)
    }

    /// Loads the document if needed, then applies `edit` under the cache lock. Marks the entry
    /// dirty and bumps its generation. Returns the post-edit buffer.
    pub fn edit<F>(&self, id: &DocumentId, mut edit: F) -> Result<(Rope, EvictionReport), CacheError>
    where
        F: FnMut(&mut Rope),
    {
        let mut report = EvictionReport::default();
        for _ in 0..EDIT_RETRY_LIMIT {
            let (_, pass) = self.get_with_report(id)?;
            merge_report(&mut report, pass);
            let mut inner = self.lock();
            let generation = inner.next_generation();
            if let Some(entry) = inner.touch(id) {
                edit(&mut entry.rope);
                entry.dirty = true;
                entry.generation = generation;
                return Ok((entry.rope.clone(), report));
            }
        }
        Err(CacheError::Contended(id.clone()))
    }

    /// Writes the buffer to its original file. Returns `false` when there was nothing to save.
    pub fn save(&self, id: &DocumentId) -> Result<bool, CacheError> {
        let needs_load = {
            let inner = self.lock();
            !inner.resident.contains_key(id) && inner.spilled.contains_key(id)
        };
        if needs_load {
            self.get(id)?;
        }
        let (rope, generation) = {
            let inner = self.lock();
            match inner.resident.get(id) {
                Some(entry) if entry.dirty => (entry.rope.clone(), entry.generation),
                _ => return Ok(false),
            }
        };
        self.store
            .write(id, &rope)
            .map_err(|err| CacheError::io(id.path(), err))?;
        let scratch = {
            let mut inner = self.lock();
            match inner.resident.get_mut(id) {
                Some(entry) if entry.generation == generation => {
                    entry.dirty = false;
                    entry.scratch.take()
                }
                _ => None,
            }
        };
        if let Some(path) = scratch {
            self.store.discard_scratch(&path);
        }
        Ok(true)
    }

    /// Drops the document without saving and discards any scratch copy.
    pub fn remove(&self, id: &DocumentId) -> bool {
        let (was_known, scratch) = {
            let mut inner = self.lock();
            let entry = inner.resident.remove(id);
            let spilled = inner.spilled.remove(id);
            let was_open = inner.open.remove(id);
            let was_known = entry.is_some() || spilled.is_some() || was_open;
            let scratch: Vec<PathBuf> = entry
                .and_then(|entry| entry.scratch)
                .into_iter()
                .chain(spilled)
                .collect();
            (was_known, scratch)
        };
        for path in scratch {
            self.store.discard_scratch(&path);
        }
        was_known
    }

    pub fn mark_open(&self, id: &DocumentId) {
        self.lock().open.insert(id.clone());
    }

    pub fn mark_closed(&self, id: &DocumentId) {
        self.lock().open.remove(id);
    }

    /// Answers from cache bookkeeping only; never touches the filesystem.
    pub fn is_already_open(&self, id: &DocumentId) -> bool {
        let known = {
            let inner = self.lock();
            inner.resident.contains_key(id) || inner.open.contains(id)
        };
        known || self.navigator().is_some_and(|nav| nav.is_open(id))
    }

    pub fn is_resident(&self, id: &DocumentId) -> bool {
        self.lock().resident.contains_key(id)
    }

    pub fn is_dirty(&self, id: &DocumentId) -> bool {
        let inner = self.lock();
        inner
            .resident
            .get(id)
            .map(|entry| entry.dirty)
            .unwrap_or_else(|| inner.spilled.contains_key(id))
    }

    pub fn is_spilled(&self, id: &DocumentId) -> bool {
        self.lock().spilled.contains_key(id)
    }

    pub fn resident_len(&self) -> usize {
        self.lock().resident.len()
    }

    /// Resident documents, least recently used first.
    pub fn resident_ids(&self) -> Vec<DocumentId> {
        let inner = self.lock();
        let mut ids: Vec<(u64, DocumentId)> = inner
            .resident
            .iter()
            .map(|(id, entry)| (entry.tick, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn document_info(&self, id: &DocumentId) -> Option<DocumentInfo> {
        let inner = self.lock();
        inner.resident.get(id).map(|entry| DocumentInfo {
            dirty: entry.dirty,
            generation: entry.generation,
            last_access: entry.last_access,
            scratch: entry.scratch.clone(),
        })
    }

    fn is_protected(
        inner: &CacheInner,
        navigator: Option<&Arc<dyn DocumentNavigator>>,
        id: &DocumentId,
    ) -> bool {
        inner.open.contains(id) || navigator.is_some_and(|nav| nav.is_open(id))
    }

    /// Evicts until the cache is within capacity or no further victim can be taken. `keep` is
    /// the document whose access triggered the pass.
    fn evict_excess(&self, keep: &DocumentId) -> EvictionReport {
        let navigator = self.navigator();
        let mut report = EvictionReport::default();
        let mut passed_over: HashSet<DocumentId> = HashSet::new();

        loop {
            let mut inner = self.lock();
            if inner.resident.len() <= self.capacity {
                break;
            }
            let victim = inner
                .resident
                .iter()
                .filter(|(id, _)| {
                    *id != keep
                        && !passed_over.contains(*id)
                        && !inner.flushing.contains(*id)
                        && !Self::is_protected(&inner, navigator.as_ref(), id)
                })
                .min_by_key(|(_, entry)| entry.tick)
                .map(|(id, entry)| (id.clone(), entry.dirty, entry.generation, entry.rope.clone()));
            let Some((victim, dirty, generation, rope)) = victim else {
                tracing::debug!(
                    resident = inner.resident.len(),
                    capacity = self.capacity,
                    "no evictable document; cache stays over capacity"
                );
                break;
            };

            if !dirty {
                if let Some(entry) = inner.resident.remove(&victim)
                    && let Some(scratch) = entry.scratch
                {
                    inner.spilled.insert(victim.clone(), scratch);
                }
                report.evicted.push(victim);
                continue;
            }

            inner.flushing.insert(victim.clone());
            drop(inner);
            let flushed = self.store.write_scratch(&victim, &rope);
            let mut inner = self.lock();
            inner.flushing.remove(&victim);
            let mut orphan = None;

            let reason = match flushed {
                Ok(Some(path)) => match inner.resident.get(&victim) {
                    Some(entry) if entry.generation == generation => {
                        let previous = inner
                            .resident
                            .remove(&victim)
                            .and_then(|entry| entry.scratch);
                        inner.spilled.insert(victim.clone(), path.clone());
                        drop(inner);
                        if let Some(previous) = previous
                            && previous != path
                        {
                            self.store.discard_scratch(&previous);
                        }
                        report.spilled.push(victim.clone());
                        report.evicted.push(victim);
                        continue;
                    }
                    Some(entry) => {
                        // The resident buffer is newer than the copy just written.
                        if entry.scratch.as_ref() != Some(&path) {
                            orphan = Some(path);
                        }
                        DeclineReason::EditedDuringFlush
                    }
                    None => {
                        // Removed while flushing: the scratch copy has no owner.
                        drop(inner);
                        self.store.discard_scratch(&path);
                        continue;
                    }
                },
                Ok(None) => DeclineReason::NoScratchTarget,
                Err(err) => {
                    DeclineReason::FlushFailed(CacheError::io(victim.path(), err))
                }
            };
            drop(inner);
            if let Some(path) = orphan {
                self.store.discard_scratch(&path);
            }
            tracing::warn!(document = %victim, ?reason, "eviction declined");
            passed_over.insert(victim.clone());
            report.declined.push(Declined { id: victim, reason });
        }
        if let Some(record) = DebugRecord::cache_eviction(keep, &report) {
            event_log::record(record);
        }
        report
    }
}

fn merge_report(into: &mut EvictionReport, from: EvictionReport) {
    into.evicted.extend(from.evicted);
    into.spilled.extend(from.spilled);
    into.declined.extend(from.declined);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn fixture(names: &[&str]) -> (tempfile::TempDir, Vec<DocumentId>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ids = names
            .iter()
            .map(|name| {
                let path = temp.path().join(name);
                fs::write(&path, format!("contents of {name}\n")).expect("write fixture");
                DocumentId::new(path)
            })
            .collect();
        (temp, ids)
    }

    #[test]
    fn lru_victim_skips_open_documents() {
        let (_temp, ids) = fixture(&["a.txt", "b.txt", "c.txt"]);
        let (a, b, c) = (&ids[0], &ids[1], &ids[2]);
        let cache = DocumentCache::with_fs(2, None);
        cache.get(a).expect("load a");
        cache.get(b).expect("load b");
        cache.mark_open(a);
        let (_, report) = cache.get_with_report(c).expect("load c");
        assert_eq!(report.evicted, vec![b.clone()]);
        assert!(cache.is_resident(a));
        assert!(cache.is_resident(c));
        assert!(!cache.is_resident(b));
        assert_eq!(cache.resident_len(), 2);
    }

    #[test]
    fn access_refreshes_recency() {
        let (_temp, ids) = fixture(&["a.txt", "b.txt", "c.txt"]);
        let cache = DocumentCache::with_fs(2, None);
        cache.get(&ids[0]).expect("a");
        cache.get(&ids[1]).expect("b");
        cache.get(&ids[0]).expect("a again");
        let (_, report) = cache.get_with_report(&ids[2]).expect("c");
        assert_eq!(report.evicted, vec![ids[1].clone()]);
        assert_eq!(cache.resident_ids(), vec![ids[0].clone(), ids[2].clone()]);
    }

    #[test]
    fn dirty_victim_spills_to_scratch_and_reloads_from_it() {
        let (temp, ids) = fixture(&["a.txt", "b.txt"]);
        let scratch = temp.path().join("scratch");
        let cache = DocumentCache::with_fs(1, Some(scratch.clone()));
        cache
            .edit(&ids[0], |rope| rope.insert(0, "edited "))
            .expect("edit a");
        let (_, report) = cache.get_with_report(&ids[1]).expect("load b");
        assert_eq!(report.spilled, vec![ids[0].clone()]);
        assert!(cache.is_spilled(&ids[0]));
        assert!(cache.is_dirty(&ids[0]));

        let original = fs::read_to_string(ids[0].path()).expect("read original");
        assert_eq!(original, "contents of a.txt\n");

        let reloaded = cache.get(&ids[0]).expect("reload a");
        assert_eq!(reloaded.to_string(), "edited contents of a.txt\n");
        assert!(cache.is_dirty(&ids[0]));
    }

    #[test]
    fn dirty_victim_without_scratch_is_declined() {
        let (_temp, ids) = fixture(&["a.txt", "b.txt"]);
        let cache = DocumentCache::with_fs(1, None);
        cache
            .edit(&ids[0], |rope| rope.insert(0, "x"))
            .expect("edit a");
        let (_, report) = cache.get_with_report(&ids[1]).expect("load b");
        assert!(report.evicted.is_empty());
        assert_eq!(report.declined.len(), 1);
        assert!(matches!(
            report.declined[0].reason,
            DeclineReason::NoScratchTarget
        ));
        assert_eq!(cache.resident_len(), 2);
    }

    #[test]
    fn save_clears_dirty_and_writes_original() {
        let (_temp, ids) = fixture(&["a.txt"]);
        let cache = DocumentCache::with_fs(4, None);
        cache
            .edit(&ids[0], |rope| {
                let end = rope.len_chars();
                rope.insert(end, "more\n");
            })
            .expect("edit");
        assert!(cache.is_dirty(&ids[0]));
        assert!(cache.save(&ids[0]).expect("save"));
        assert!(!cache.is_dirty(&ids[0]));
        let text = fs::read_to_string(ids[0].path()).expect("read");
        assert_eq!(text, "contents of a.txt\nmore\n");
        assert!(!cache.save(&ids[0]).expect("second save"));
    }

    #[test]
    fn failed_load_is_not_resident() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = DocumentId::new(temp.path().join("missing.txt"));
        let cache = DocumentCache::with_fs(2, None);
        let err = cache.get(&missing).expect_err("missing file");
        assert!(matches!(err, CacheError::Io { .. }));
        assert!(!cache.is_resident(&missing));
    }

    #[test]
    fn is_already_open_does_not_touch_filesystem() {
        let missing = DocumentId::new("/definitely/not/here.txt");
        let cache = DocumentCache::with_fs(2, None);
        assert!(!cache.is_already_open(&missing));
        cache.mark_open(&missing);
        assert!(cache.is_already_open(&missing));
        cache.mark_closed(&missing);
        assert!(!cache.is_already_open(&missing));
    }

    struct Navigator(DocumentId);

    impl DocumentNavigator for Navigator {
        fn is_open(&self, id: &DocumentId) -> bool {
            *id == self.0
        }
    }

    #[test]
    fn navigator_documents_are_protected() {
        let (_temp, ids) = fixture(&["a.txt", "b.txt"]);
        let cache = DocumentCache::with_fs(1, None);
        cache.set_navigator(Some(Arc::new(Navigator(ids[0].clone()))));
        cache.get(&ids[0]).expect("a");
        let (_, report) = cache.get_with_report(&ids[1]).expect("b");
        assert!(report.evicted.is_empty());
        assert!(cache.is_resident(&ids[0]));
        assert!(cache.is_already_open(&ids[0]));
    }

    struct CountingStore {
        reads: AtomicUsize,
    }

    impl BackingStore for CountingStore {
        fn read(&self, _id: &DocumentId) -> io::Result<Rope> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Rope::from_str("shared"))
        }

        fn write(&self, _id: &DocumentId, _text: &Rope) -> io::Result<()> {
            Ok(())
        }

        fn read_scratch(&self, _path: &Path) -> io::Result<Rope> {
            Err(io::Error::other("no scratch"))
        }

        fn write_scratch(&self, _id: &DocumentId, _text: &Rope) -> io::Result<Option<PathBuf>> {
            Err(io::Error::other("scratch unavailable"))
        }

        fn discard_scratch(&self, _path: &Path) {}
    }

    #[test]
    fn concurrent_gets_share_one_load() {
        let store = Arc::new(CountingStore {
            reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(DocumentCache::new(4, store.clone()));
        let id = DocumentId::new("/virtual/shared.txt");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let id = id.clone();
                thread::spawn(move || cache.get(&id).expect("get").to_string())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("join"), "shared");
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_failure_reported_to_triggering_call_only() {
        let store = Arc::new(CountingStore {
            reads: AtomicUsize::new(0),
        });
        let cache = DocumentCache::new(1, store);
        let first = DocumentId::new("/virtual/one.txt");
        let second = DocumentId::new("/virtual/two.txt");
        cache
            .edit(&first, |rope| rope.insert(0, "x"))
            .expect("edit");
        let (_, report) = cache.get_with_report(&second).expect("second");
        assert_eq!(report.errors().count(), 1);
        let (_, later) = cache.get_with_report(&second).expect("resident hit");
        assert!(later.is_empty());
    }

    /// Holds every scratch write until the test releases it.
    struct GatedStore {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        scratch: Mutex<HashMap<PathBuf, Rope>>,
    }

    impl GatedStore {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let store = Arc::new(Self {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
                scratch: Mutex::new(HashMap::new()),
            });
            (store, entered_rx, release_tx)
        }

        fn scratch_files(&self) -> usize {
            self.scratch.lock().unwrap().len()
        }
    }

    impl BackingStore for GatedStore {
        fn read(&self, id: &DocumentId) -> io::Result<Rope> {
            Ok(Rope::from_str(&format!("original {id}\n")))
        }

        fn write(&self, _id: &DocumentId, _text: &Rope) -> io::Result<()> {
            Ok(())
        }

        fn read_scratch(&self, path: &Path) -> io::Result<Rope> {
            self.scratch
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn write_scratch(&self, id: &DocumentId, text: &Rope) -> io::Result<Option<PathBuf>> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10))
                .unwrap();
            let path = PathBuf::from(format!("/scratch{}", id.path().display()));
            self.scratch.lock().unwrap().insert(path.clone(), text.clone());
            Ok(Some(path))
        }

        fn discard_scratch(&self, path: &Path) {
            self.scratch.lock().unwrap().remove(path);
        }
    }

    #[test]
    fn buffer_replaced_during_spill_keeps_newer_text() {
        let (store, entered, release) = GatedStore::new();
        let cache = Arc::new(DocumentCache::new(1, store.clone()));
        let a = DocumentId::new("/virtual/a.txt");
        let b = DocumentId::new("/virtual/b.txt");
        assert!(cache.insert_new(&a, Rope::from_str("old edits\n")).is_empty());

        let evicting = {
            let cache = cache.clone();
            let b = b.clone();
            thread::spawn(move || cache.get_with_report(&b).expect("load b").1)
        };
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("spill of a started");
        let replaced = cache.insert_new(&a, Rope::from_str("NEW edits\n"));
        assert_eq!(replaced.evicted, vec![b.clone()]);
        release.send(()).expect("release spill");

        let report = evicting.join().expect("join");
        assert!(report.spilled.is_empty());
        assert_eq!(report.declined.len(), 1);
        assert!(matches!(
            report.declined[0].reason,
            DeclineReason::EditedDuringFlush
        ));
        assert!(!cache.is_spilled(&a));
        assert!(cache.is_dirty(&a));
        assert_eq!(cache.get(&a).expect("read a").to_string(), "NEW edits\n");
        assert_eq!(store.scratch_files(), 0);
    }

    #[test]
    fn reload_during_spill_is_not_overwritten_by_stale_copy() {
        let (store, entered, release) = GatedStore::new();
        let cache = Arc::new(DocumentCache::new(1, store.clone()));
        let a = DocumentId::new("/virtual/a.txt");
        let b = DocumentId::new("/virtual/b.txt");
        cache.insert_new(&a, Rope::from_str("unsaved\n"));

        let evicting = {
            let cache = cache.clone();
            let b = b.clone();
            thread::spawn(move || cache.get_with_report(&b).expect("load b").1)
        };
        entered
            .recv_timeout(Duration::from_secs(5))
            .expect("spill of a started");
        assert!(cache.remove(&a));
        let reloaded = cache.get(&a).expect("reload a");
        assert_eq!(reloaded.to_string(), "original /virtual/a.txt\n");
        release.send(()).expect("release spill");

        let report = evicting.join().expect("join");
        assert!(report.spilled.is_empty());
        assert!(!cache.is_spilled(&a));
        assert!(!cache.is_dirty(&a));
        assert_eq!(
            cache.get(&a).expect("read a").to_string(),
            "original /virtual/a.txt\n"
        );
        assert_eq!(store.scratch_files(), 0);
    }

    #[test]
    fn remove_discards_spilled_copy() {
        let (temp, ids) = fixture(&["a.txt", "b.txt"]);
        let cache = DocumentCache::with_fs(1, Some(temp.path().join("scratch")));
        cache
            .edit(&ids[0], |rope| rope.insert(0, "x"))
            .expect("edit");
        cache.get(&ids[1]).expect("b");
        assert!(cache.is_spilled(&ids[0]));
        assert!(cache.remove(&ids[0]));
        assert!(!cache.is_spilled(&ids[0]));
        let leftovers = fs::read_dir(temp.path().join("scratch"))
            .expect("scratch dir")
            .count();
        assert_eq!(leftovers, 0);
    }
}
