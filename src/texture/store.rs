//! The texture store: three bucketed tables mapping identifiers to file paths, loaded textures and
//! loaded volume textures.
//!
//! Every bucket has its own lock. Entries are always inserted at the head of their bucket's chain
//! and never deduplicated, so a lookup returns the most recent registration while older entries
//! stay reachable by walking the chain.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::hash::TextureId;
use crate::device::TextureHandle;

const BUCKET_COUNT: usize = 1024;

/// A registered replacement file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathEntry {
    pub id: TextureId,
    pub path: PathBuf,

    /// Content hash of the texture once it has been loaded from this path.
    pub content_hash: Option<TextureId>,
}

#[derive(Clone, Debug)]
struct TextureEntry {
    id: TextureId,
    texture: TextureHandle,
}

trait Keyed {
    fn id(&self) -> TextureId;
}

impl Keyed for PathEntry {
    fn id(&self) -> TextureId {
        self.id
    }
}

impl Keyed for TextureEntry {
    fn id(&self) -> TextureId {
        self.id
    }
}

/// One bucketed table. Each bucket's `Vec` is a chain whose head is the last element.
struct Table<T> {
    buckets: Box<[Mutex<Vec<T>>]>,
}

impl<T: Keyed> Table<T> {
    fn new() -> Table<T> {
        Table {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, id: TextureId) -> &Mutex<Vec<T>> {
        &self.buckets[id as usize % BUCKET_COUNT]
    }

    fn push_head(&self, entry: T) {
        self.bucket(entry.id()).lock().push(entry);
    }

    /// Runs `f` on the first entry in the chain with the given identifier.
    fn with_first<R>(&self, id: TextureId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut bucket = self.bucket(id).lock();
        bucket.iter_mut().rev().find(|entry| entry.id() == id).map(f)
    }

    /// Returns every entry with the given identifier, head first.
    fn chain(&self, id: TextureId) -> Vec<T>
    where
        T: Clone,
    {
        self.bucket(id)
            .lock()
            .iter()
            .rev()
            .filter(|entry| entry.id() == id)
            .cloned()
            .collect()
    }

    /// Visits every entry, locking one bucket at a time. Entries added to a bucket that has
    /// already been visited are missed.
    fn for_each(&self, mut f: impl FnMut(&T)) {
        for bucket in self.buckets.iter() {
            for entry in bucket.lock().iter().rev() {
                f(entry);
            }
        }
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    fn drain(&self) -> Vec<T> {
        self.buckets
            .iter()
            .flat_map(|bucket| std::mem::take(&mut *bucket.lock()))
            .collect()
    }
}

/// Paths and loaded textures, keyed by identifier.
///
/// The store holds one reference to every texture added to it. Those references are only given
/// back by `release_textures`, which is called when the plugin is disabled.
pub struct TextureStore {
    paths: Table<PathEntry>,
    textures: Table<TextureEntry>,
    volumes: Table<TextureEntry>,
}

impl TextureStore {
    pub fn new() -> TextureStore {
        TextureStore {
            paths: Table::new(),
            textures: Table::new(),
            volumes: Table::new(),
        }
    }

    /// Registers a replacement file for `id`.
    ///
    /// Existing registrations are deliberately left in place: removing them invalidated textures
    /// that were still in use, so the chain just grows and the newest entry shadows the others.
    pub fn add_path(&self, id: TextureId, path: impl Into<PathBuf>) {
        self.paths.push_head(PathEntry {
            id,
            path: path.into(),
            content_hash: None,
        });
    }

    pub fn path(&self, id: TextureId) -> Option<PathBuf> {
        self.paths.with_first(id, |entry| entry.path.clone())
    }

    pub fn path_entry(&self, id: TextureId) -> Option<PathEntry> {
        self.paths.with_first(id, |entry| entry.clone())
    }

    /// Records the content hash of the texture loaded for `id` on its current path entry. Returns
    /// `false` if there is no path entry for `id`.
    pub fn set_content_hash(&self, id: TextureId, content_hash: TextureId) -> bool {
        self.paths
            .with_first(id, |entry| entry.content_hash = Some(content_hash))
            .is_some()
    }

    /// Finds the path entry whose loaded texture had the given content hash. This walks the whole
    /// table.
    pub fn path_by_content_hash(&self, content_hash: TextureId) -> Option<PathEntry> {
        let mut found = None;

        self.paths.for_each(|entry| {
            if found.is_none() && entry.content_hash == Some(content_hash) {
                found = Some(entry.clone());
            }
        });

        found
    }

    /// Counts every path entry, including shadowed ones.
    pub fn count_paths(&self) -> usize {
        self.paths.len()
    }

    /// Adds a loaded texture under `id`, taking a reference to it. Existing entries for `id` are
    /// kept.
    pub fn add_texture(&self, id: TextureId, texture: &TextureHandle) {
        texture.add_ref();

        self.textures.push_head(TextureEntry {
            id,
            texture: texture.clone(),
        });
    }

    pub fn texture(&self, id: TextureId) -> Option<TextureHandle> {
        self.textures.with_first(id, |entry| entry.texture.clone())
    }

    /// Every texture stored under `id`, most recent first.
    pub fn textures_for(&self, id: TextureId) -> Vec<TextureHandle> {
        self.textures
            .chain(id)
            .into_iter()
            .map(|entry| entry.texture)
            .collect()
    }

    pub fn add_volume_texture(&self, id: TextureId, texture: &TextureHandle) {
        texture.add_ref();

        self.volumes.push_head(TextureEntry {
            id,
            texture: texture.clone(),
        });
    }

    pub fn volume_texture(&self, id: TextureId) -> Option<TextureHandle> {
        self.volumes.with_first(id, |entry| entry.texture.clone())
    }

    pub fn count_textures(&self) -> usize {
        self.textures.len()
    }

    /// Gives back the store's reference to every loaded texture and empties both texture tables.
    /// Paths are kept.
    pub fn release_textures(&self) -> usize {
        let entries: Vec<_> = self
            .textures
            .drain()
            .into_iter()
            .chain(self.volumes.drain())
            .collect();

        for entry in &entries {
            entry.texture.release();
        }

        entries.len()
    }

    /// Forgets every registered path.
    pub fn clear_paths(&self) {
        self.paths.drain();
    }

    /// Returns `true` if `path` is registered under `id`.
    pub fn has_path(&self, id: TextureId, path: &Path) -> bool {
        self.paths
            .chain(id)
            .iter()
            .any(|entry| entry.path == path)
    }
}

impl Default for TextureStore {
    fn default() -> Self {
        TextureStore::new()
    }
}
