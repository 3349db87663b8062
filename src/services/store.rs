use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;
use crate::models::Snapshot;

/// Closure handed to [`DedupeStore::update`]: current snapshot in, replacement
/// out (`None` leaves the key untouched).
pub type Apply<'a> = dyn FnMut(Option<&Snapshot>) -> Option<Snapshot> + 'a;

/// Keyed last-known state for every tracked entity.
///
/// Exactly one snapshot per key; `put` overwrites. Implementations are shared
/// between pollers, so every method takes `&self`.
pub trait DedupeStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Snapshot>;

    /// Atomic read-modify-write of one key. No other call on the store
    /// interleaves between reading the current snapshot and storing what
    /// `apply` returns. `apply` runs exactly once, under the store lock.
    ///
    /// On `Err` the in-memory state is still updated; only durability was lost.
    fn update(&self, key: &str, apply: &mut Apply<'_>) -> Result<(), PersistenceError>;

    /// Store `snapshot` under `snapshot.key`, whatever was there.
    fn put(&self, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let key = snapshot.key.clone();
        let mut next = Some(snapshot);
        self.update(&key, &mut |_| next.take())
    }

    /// Make every change so far durable. No-op for memory-only stores.
    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn all_keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded map shared by both store flavours. `max_entries == 0` means unbounded.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Snapshot>,
    max_entries: usize,
    /// Changed since the last successful flush.
    dirty: bool,
}

impl Entries {
    fn new(max_entries: usize) -> Self {
        Self { map: HashMap::new(), max_entries, dirty: false }
    }

    /// Returns whether anything was written.
    fn apply(&mut self, key: &str, f: &mut Apply<'_>) -> bool {
        let Some(mut snapshot) = f(self.map.get(key)) else {
            return false;
        };
        snapshot.key = key.to_string();
        self.map.insert(key.to_string(), snapshot);
        self.evict_over_bound(Some(key));
        self.dirty = true;
        true
    }

    /// Drop least-recently-seen entries until within bound, never `keep`.
    fn evict_over_bound(&mut self, keep: Option<&str>) {
        if self.max_entries == 0 {
            return;
        }
        while self.map.len() > self.max_entries {
            let oldest = self
                .map
                .values()
                .filter(|s| Some(s.key.as_str()) != keep)
                .min_by_key(|s| s.last_seen_at)
                .map(|s| s.key.clone());
            match oldest {
                Some(key) => {
                    self.map.remove(&key);
                    tracing::debug!(key = %key, "evicted from dedupe store");
                }
                None => break,
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.map.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Process-lifetime store. State is lost on restart.
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: Mutex::new(Entries::new(max_entries)) }
    }
}

impl DedupeStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Snapshot> {
        self.entries.lock().map.get(key).cloned()
    }

    fn update(&self, key: &str, apply: &mut Apply<'_>) -> Result<(), PersistenceError> {
        self.entries.lock().apply(key, apply);
        Ok(())
    }

    fn all_keys(&self) -> Vec<String> {
        self.entries.lock().keys()
    }

    fn len(&self) -> usize {
        self.entries.lock().map.len()
    }
}

/// Store backed by a JSON file rewritten on `flush`.
///
/// `update` only touches memory; `flush` (and `put`) write the whole map to
/// `<path>.tmp` and rename it into place, so a crash leaves either the
/// previous or the new contents.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    /// Serialises file writes so an older map never lands after a newer one.
    writer: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut entries = Entries::new(max_entries);
        entries.map = Self::load(&path);
        let loaded = entries.map.len();
        entries.evict_over_bound(None);

        tracing::info!("💾 Dedupe store {} loaded ({} entries)", path.display(), loaded);
        Ok(Self { path, entries: Mutex::new(entries), writer: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> HashMap<String, Snapshot> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                tracing::warn!("Cannot read dedupe store {}: {}", path.display(), e);
                return HashMap::new();
            }
        };

        match serde_json::from_reader::<_, HashMap<String, Snapshot>>(BufReader::new(file)) {
            Ok(map) => map
                .into_iter()
                .map(|(key, mut snap)| {
                    snap.key = key.clone();
                    (key, snap)
                })
                .collect(),
            Err(e) => {
                let aside = Self::sibling(path, "corrupt");
                tracing::warn!(
                    "Corrupt dedupe store {} ({}), moving to {}",
                    path.display(), e, aside.display()
                );
                if let Err(e) = fs::rename(path, &aside) {
                    tracing::warn!("Cannot move corrupt store aside: {}", e);
                }
                HashMap::new()
            }
        }
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    fn write_file(&self, body: &[u8]) -> Result<(), PersistenceError> {
        let tmp = Self::sibling(&self.path, "tmp");

        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(body)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DedupeStore for FileStore {
    fn get(&self, key: &str) -> Option<Snapshot> {
        self.entries.lock().map.get(key).cloned()
    }

    fn update(&self, key: &str, apply: &mut Apply<'_>) -> Result<(), PersistenceError> {
        self.entries.lock().apply(key, apply);
        Ok(())
    }

    fn put(&self, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let key = snapshot.key.clone();
        let mut next = Some(snapshot);
        self.update(&key, &mut |_| next.take())?;
        self.flush()
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        let _writing = self.writer.lock();
        let body = {
            let mut entries = self.entries.lock();
            if !entries.dirty {
                return Ok(());
            }
            let ordered: BTreeMap<&String, &Snapshot> = entries.map.iter().collect();
            let body = serde_json::to_vec(&ordered)?;
            entries.dirty = false;
            body
        };

        let written = self.write_file(&body);
        if written.is_err() {
            self.entries.lock().dirty = true;
        }
        written
    }

    fn all_keys(&self) -> Vec<String> {
        self.entries.lock().keys()
    }

    fn len(&self) -> usize {
        self.entries.lock().map.len()
    }
}
