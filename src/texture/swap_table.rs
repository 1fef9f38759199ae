//! The swap table: a flat map from game texture name hashes to replacement textures, read by the
//! per-frame hook.
//!
//! A table is never modified once it's installed. Rebuilding creates a whole new table and swaps
//! it in, after which the old table's texture references are released. A rebuild that finds
//! nothing is thrown away rather than replacing a table that works.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{bridge::IdentifierBridge, hash::TextureId, sources::KnownTextures, store::TextureStore};
use crate::device::TextureHandle;

type Table = HashMap<TextureId, TextureHandle>;

/// Counts from one rebuild.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Known identifiers with a loaded texture.
    pub found: usize,

    /// Known identifiers with nothing loaded.
    pub missing: usize,

    /// Textures that had already been destroyed.
    pub stale: usize,

    /// Bridge names resolved by their own name hash.
    pub bridged_by_name: usize,

    /// Bridge names resolved through their content hash.
    pub bridged_by_content: usize,

    /// Entries in the new table.
    pub entries: usize,

    /// Whether the new table replaced the old one.
    pub installed: bool,
}

#[derive(Default)]
pub struct SwapTable {
    /// `None` until the first table is installed.
    current: Mutex<Option<Table>>,
}

impl SwapTable {
    pub fn new() -> SwapTable {
        SwapTable::default()
    }

    /// Looks up the replacement for a game texture.
    pub fn lookup(&self, name_hash: TextureId) -> Option<TextureHandle> {
        self.current.lock().as_ref()?.get(&name_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.current.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once any table has been installed.
    pub fn is_built(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Builds a new table and installs it if it isn't empty, or if there was no table before.
    ///
    /// Callers must not rebuild concurrently.
    pub fn rebuild(
        &self,
        store: &TextureStore,
        bridge: &IdentifierBridge,
        known: &KnownTextures,
    ) -> BuildStats {
        let (table, mut stats) = build(store, bridge, known);

        stats.installed = self.install(table);

        if stats.installed {
            log::info!("Installed swap table: {:?}", stats);
        } else {
            log::warn!("Rebuilt swap table was empty; keeping the previous one");
        }

        stats
    }

    /// Puts `table` in place of the current one and releases the old table's references. An empty
    /// table is released and dropped instead if a table already exists.
    fn install(&self, table: Table) -> bool {
        let mut current = self.current.lock();

        if table.is_empty() && current.is_some() {
            drop(current);
            release_table(table);
            return false;
        }

        if let Some(old) = current.replace(table) {
            release_table(old);
        }

        true
    }

    /// Releases the current table's references and forgets it. Returns the number released.
    pub fn release_all(&self) -> usize {
        match self.current.lock().take() {
            Some(table) => release_table(table),
            None => 0,
        }
    }
}

fn release_table(table: Table) -> usize {
    let count = table.len();

    for texture in table.into_values() {
        texture.release();
    }

    count
}

/// Takes the table's own reference to `texture` if it is still alive.
fn retain_if_alive(texture: TextureHandle, stats: &mut BuildStats) -> Option<TextureHandle> {
    if texture.is_alive() {
        texture.add_ref();
        Some(texture)
    } else {
        stats.stale += 1;
        None
    }
}

/// Collects replacements for every known identifier, then for every bridge association not
/// already covered. Each texture in the returned table has had a reference taken for it.
fn build(store: &TextureStore, bridge: &IdentifierBridge, known: &KnownTextures) -> (Table, BuildStats) {
    let mut table = Table::new();
    let mut stats = BuildStats::default();

    for id in known.iter() {
        let Some(texture) = store.texture(id) else {
            stats.missing += 1;
            continue;
        };

        if let Some(texture) = retain_if_alive(texture, &mut stats) {
            table.insert(id, texture);
            stats.found += 1;
        }
    }

    for (name_hash, content_hash) in bridge.name_pairs() {
        if table.contains_key(&name_hash) {
            continue;
        }

        let (texture, by_name) = match store.texture(name_hash) {
            Some(texture) => (texture, true),

            None => match store.texture(content_hash) {
                Some(texture) => (texture, false),
                None => continue,
            },
        };

        if let Some(texture) = retain_if_alive(texture, &mut stats) {
            table.insert(name_hash, texture);

            if by_name {
                stats.bridged_by_name += 1;
            } else {
                stats.bridged_by_content += 1;
            }
        }
    }

    stats.entries = table.len();
    (table, stats)
}
