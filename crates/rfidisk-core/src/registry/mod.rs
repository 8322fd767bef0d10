//! Durable tag store: tag id -> [`TagEntry`].
//!
//! The store is a JSON object keyed by tag id:
//!
//! ```json
//! {
//!   "1d0dc0070d1080": {
//!     "command": "/usr/bin/gzdoom -iwad DOOM.WAD",
//!     "line1": "DOOM", "line2": "GZDoom Engine",
//!     "line3": "1993", "line4": "id Software",
//!     "terminate": ""
//!   }
//! }
//! ```
//!
//! The older combined config layout (`{"settings": {...}, "rfid_tags": {...}}`)
//! is also accepted. Such a file keeps its layout: writes replace only the
//! `rfid_tags` object and carry every other key through unchanged.
//!
//! Reads are served from an in-memory snapshot. Writes are serialized through
//! a writer lock inside the process and an advisory lock on `<store>.lock`
//! across processes. Under both locks the file is re-read if it changed, the
//! edit is applied, and the file is replaced atomically (temp file + rename).
//! The file may also be edited by an external tool; a changed modification
//! time triggers a reload before the next lookup.

mod entry;

pub use entry::{DISPLAY_LINE_LIMITS, STUB_LINE1, STUB_LINE2, STUB_LINE3, TagEntry, fit_display_lines};

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use fs2::FileExt;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::tag::TagId;
use entry::TagRecord;

/// Errors from reading or persisting the tag store.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read tag store {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed tag store {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write tag store {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [`TagRegistry::lookup`]. A lookup never fails to produce an
/// entry; it only reports how the entry came to be.
#[derive(Debug)]
pub enum Lookup {
    /// The tag was already known.
    Found(TagEntry),
    /// The tag was unknown; a stub entry was created and persisted.
    Created(TagEntry),
    /// The tag was unknown; a stub entry was created but could not be
    /// written. It stays in memory and is written with the next change.
    Unpersisted { entry: TagEntry, error: RegistryError },
}

impl Lookup {
    pub fn entry(&self) -> &TagEntry {
        match self {
            Self::Found(entry) | Self::Created(entry) | Self::Unpersisted { entry, .. } => entry,
        }
    }

    pub fn into_entry(self) -> TagEntry {
        match self {
            Self::Found(entry) | Self::Created(entry) | Self::Unpersisted { entry, .. } => entry,
        }
    }

    /// Whether this lookup synthesized a new stub entry.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Found(_))
    }
}

/// Key holding the entries in the combined config layout.
const LEGACY_TAGS_KEY: &str = "rfid_tags";

/// Shape of the file on disk.
#[derive(Debug, Clone, Default, PartialEq)]
enum StoreLayout {
    /// The file is the entry map itself.
    #[default]
    Flat,
    /// Entries live under `rfid_tags`; the other top-level keys are kept
    /// here and written back as they were read.
    Legacy(Map<String, Value>),
}

/// Immutable view of the store at one point in time.
#[derive(Debug, Default)]
struct Snapshot {
    tags: BTreeMap<TagId, TagEntry>,
    layout: StoreLayout,
    /// Modification time of the file this snapshot was loaded from or
    /// written to.
    modified: Option<SystemTime>,
    /// In-memory changes that have not reached the file yet.
    dirty: bool,
}

/// The tag store.
#[derive(Debug)]
pub struct TagRegistry {
    path: PathBuf,
    cache: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl TagRegistry {
    /// Load the store at `path`. A missing file is an empty store; the file
    /// is created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let snapshot = match read_store(&path)? {
            Some(snapshot) => snapshot,
            None => {
                debug!(path = %path.display(), "tag store does not exist yet");
                Snapshot::default()
            }
        };
        info!(path = %path.display(), tags = snapshot.tags.len(), "loaded tag store");

        Ok(Self {
            path,
            cache: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a tag id, creating and persisting a stub entry for unknown
    /// tags. Repeated lookups of the same id return the same entry.
    pub fn lookup(&self, id: &TagId) -> Lookup {
        self.refresh_if_changed();

        if let Some(entry) = self.get(id) {
            return Lookup::Found(entry);
        }

        let (created, persisted) = self.modify(|tags| {
            if let Some(existing) = tags.get(id) {
                // Another writer added it between the snapshot read and the lock.
                return (Err(existing.clone()), false);
            }
            let stub = TagEntry::stub(id.clone());
            tags.insert(id.clone(), stub.clone());
            (Ok(stub), true)
        });

        match (created, persisted) {
            (Err(existing), _) => Lookup::Found(existing),
            (Ok(entry), Ok(())) => {
                info!(tag = %id, "created stub entry for unknown tag");
                Lookup::Created(entry)
            }
            (Ok(entry), Err(error)) => {
                warn!(tag = %id, error = %error, "stub entry for unknown tag kept in memory only");
                Lookup::Unpersisted { entry, error }
            }
        }
    }

    /// Insert or replace an entry and persist the store.
    ///
    /// On a write failure the change is kept in memory and retried with the
    /// next write.
    pub fn save(&self, entry: TagEntry) -> Result<(), RegistryError> {
        let id = entry.id.clone();
        let ((), result) = self.modify(|tags| {
            tags.insert(entry.id.clone(), entry);
            ((), true)
        });
        if result.is_ok() {
            debug!(tag = %id, "saved tag entry");
        }
        result
    }

    /// Delete an entry. Returns whether it existed.
    pub fn remove(&self, id: &TagId) -> Result<bool, RegistryError> {
        let (removed, result) = self.modify(|tags| {
            let removed = tags.remove(id).is_some();
            (removed, removed)
        });
        result.map(|()| removed)
    }

    /// Current entry for `id`, without creating a stub.
    pub fn get(&self, id: &TagId) -> Option<TagEntry> {
        self.snapshot().tags.get(id).cloned()
    }

    /// All entries, ordered by tag id.
    pub fn list(&self) -> Vec<TagEntry> {
        self.snapshot().tags.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether some change is held in memory because it could not be written.
    pub fn has_unpersisted_changes(&self) -> bool {
        self.snapshot().dirty
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.cache.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        snapshot
    }

    /// Whether the file was changed by someone else since `snapshot` was
    /// taken. Unpersisted local changes win over the file.
    fn changed_on_disk(&self, snapshot: &Snapshot) -> bool {
        !snapshot.dirty && file_modified(&self.path) != snapshot.modified
    }

    /// Reload the file if it changed since we last saw it.
    fn refresh_if_changed(&self) {
        if !self.changed_on_disk(&self.snapshot()) {
            return;
        }
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.reload();
    }

    /// Re-read the file into the cache. The caller holds the writer lock.
    fn reload(&self) -> Arc<Snapshot> {
        match read_store(&self.path) {
            Ok(Some(snapshot)) => {
                info!(path = %self.path.display(), tags = snapshot.tags.len(), "tag store changed on disk, reloaded");
                self.publish(snapshot)
            }
            Ok(None) => {
                warn!(path = %self.path.display(), "tag store was deleted, starting empty");
                self.publish(Snapshot::default())
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable tag store, keeping cached entries");
                self.snapshot()
            }
        }
    }

    /// Apply `change` to the latest entries under the writer lock and the
    /// store file lock, and persist the result when `change` reports a
    /// modification.
    fn modify<R>(
        &self,
        change: impl FnOnce(&mut BTreeMap<TagId, TagEntry>) -> (R, bool),
    ) -> (R, Result<(), RegistryError>) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = match StoreLock::acquire(&self.path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "tag store lock unavailable, writing without it");
                None
            }
        };

        let mut current = self.snapshot();
        if self.changed_on_disk(&current) {
            current = self.reload();
        }

        let mut tags = current.tags.clone();
        let (value, changed) = change(&mut tags);
        if !changed && !current.dirty {
            return (value, Ok(()));
        }

        match write_store_with_retry(&self.path, &tags, &current.layout) {
            Ok(modified) => {
                self.publish(Snapshot {
                    tags,
                    layout: current.layout.clone(),
                    modified,
                    dirty: false,
                });
                (value, Ok(()))
            }
            Err(e) => {
                self.publish(Snapshot {
                    tags,
                    layout: current.layout.clone(),
                    modified: current.modified,
                    dirty: true,
                });
                (value, Err(e))
            }
        }
    }
}

/// Exclusive advisory lock on the sidecar `<store>.lock`, held for the
/// duration of one read-modify-write. Released on drop.
struct StoreLock {
    file: fs::File,
}

impl StoreLock {
    fn acquire(store: &Path) -> io::Result<Self> {
        fs::create_dir_all(store_dir(store))?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(store))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(store: &Path) -> PathBuf {
    let mut name = OsString::from(store.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn store_dir(store: &Path) -> &Path {
    match store.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

fn file_modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Read and parse the store. `Ok(None)` when the file does not exist.
fn read_store(path: &Path) -> Result<Option<Snapshot>, RegistryError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let modified = file_modified(path);
    let (tags, layout) = parse_store(&contents).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let StoreLayout::Legacy(_) = layout {
        debug!(path = %path.display(), "tag store uses the combined config layout");
    }
    Ok(Some(Snapshot {
        tags,
        layout,
        modified,
        dirty: false,
    }))
}

fn parse_store(
    contents: &str,
) -> Result<(BTreeMap<TagId, TagEntry>, StoreLayout), serde_json::Error> {
    if contents.trim().is_empty() {
        return Ok((BTreeMap::new(), StoreLayout::Flat));
    }

    let (records, layout) = match serde_json::from_str::<Value>(contents)? {
        Value::Object(mut envelope) if envelope.get(LEGACY_TAGS_KEY).is_some_and(Value::is_object) => {
            let records = envelope.remove(LEGACY_TAGS_KEY).unwrap_or_default();
            (records, StoreLayout::Legacy(envelope))
        }
        other => (other, StoreLayout::Flat),
    };
    let records: BTreeMap<String, TagRecord> = serde_json::from_value(records)?;

    let mut tags = BTreeMap::new();
    for (key, record) in records {
        match TagId::parse(&key) {
            Ok(id) => {
                tags.insert(id.clone(), TagEntry::from_record(id, record));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "skipping tag store entry with invalid id");
            }
        }
    }
    Ok((tags, layout))
}

fn write_store_with_retry(
    path: &Path,
    tags: &BTreeMap<TagId, TagEntry>,
    layout: &StoreLayout,
) -> Result<Option<SystemTime>, RegistryError> {
    match write_store(path, tags, layout) {
        Ok(modified) => Ok(modified),
        Err(first) => {
            warn!(error = %first, "tag store write failed, retrying once");
            write_store(path, tags, layout)
        }
    }
}

/// Write the whole store to a temp file next to `path`, then rename it over
/// `path`. Returns the new modification time.
fn write_store(
    path: &Path,
    tags: &BTreeMap<TagId, TagEntry>,
    layout: &StoreLayout,
) -> Result<Option<SystemTime>, RegistryError> {
    let write_err = |source: io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = store_dir(path);
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut json = render_store(tags, layout).map_err(|e| write_err(io::Error::other(e)))?;
    json.push('\n');

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(json.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(file_modified(path))
}

fn render_store(
    tags: &BTreeMap<TagId, TagEntry>,
    layout: &StoreLayout,
) -> Result<String, serde_json::Error> {
    let records: BTreeMap<&str, TagRecord> = tags
        .iter()
        .map(|(id, entry)| (id.as_str(), entry.to_record()))
        .collect();
    match layout {
        StoreLayout::Flat => serde_json::to_string_pretty(&records),
        StoreLayout::Legacy(envelope) => {
            let mut envelope = envelope.clone();
            envelope.insert(LEGACY_TAGS_KEY.to_string(), serde_json::to_value(&records)?);
            serde_json::to_string_pretty(&envelope)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flat_layout() {
        let (tags, layout) = parse_store(
            r#"{"a1b2c3d4": {"command": "xterm", "line1": "Term", "terminate": ""}}"#,
        )
        .unwrap();
        assert_eq!(layout, StoreLayout::Flat);
        let id = TagId::parse("a1b2c3d4").unwrap();
        assert_eq!(tags[&id].command, "xterm");
        assert_eq!(tags[&id].line1, "Term");
        assert_eq!(tags[&id].line2, "");
    }

    #[test]
    fn parse_legacy_layout_keeps_settings() {
        let (tags, layout) = parse_store(
            r#"{
                "settings": {"serial_port": "/dev/rfidisk", "removal_delay": 0.0},
                "rfid_tags": {"04AABBCC": {"command": "steam", "line1": "Steam"}}
            }"#,
        )
        .unwrap();
        assert_eq!(tags.len(), 1);
        let id = TagId::parse("04aabbcc").unwrap();
        assert_eq!(tags[&id].line1, "Steam");

        let StoreLayout::Legacy(envelope) = layout else {
            panic!("expected the combined layout");
        };
        assert_eq!(envelope.len(), 1);
        assert_eq!(envelope["settings"]["serial_port"], "/dev/rfidisk");
    }

    #[test]
    fn legacy_render_replaces_only_the_tags() {
        let (mut tags, layout) = parse_store(
            r#"{"settings": {"removal_delay": 2.5}, "rfid_tags": {"abcd": {"command": "xterm"}}}"#,
        )
        .unwrap();
        let id = TagId::parse("cafe").unwrap();
        tags.insert(id.clone(), TagEntry::stub(id));

        let rendered: Value = serde_json::from_str(&render_store(&tags, &layout).unwrap()).unwrap();
        assert_eq!(rendered["settings"]["removal_delay"], 2.5);
        assert_eq!(rendered["rfid_tags"]["abcd"]["command"], "xterm");
        assert!(rendered["rfid_tags"]["cafe"].is_object());
        assert!(rendered.get("cafe").is_none());
    }

    #[test]
    fn parse_skips_invalid_ids() {
        let (tags, _) = parse_store(r#"{"nothex!": {}, "abcd": {}}"#).unwrap();
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn parse_empty_file_is_empty_store() {
        assert!(parse_store("  \n").unwrap().0.is_empty());
    }

    #[test]
    fn lock_file_sits_next_to_the_store() {
        assert_eq!(
            lock_path(Path::new("/home/u/.config/rfidisk/tags.json")),
            PathBuf::from("/home/u/.config/rfidisk/tags.json.lock")
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_store("[1, 2, 3]").is_err());
    }
}
