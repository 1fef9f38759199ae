//! Maps between content hashes and the name hashes of the game textures they replace.
//!
//! One content hash can serve several game textures, so the content side maps to a list. The name
//! side maps to a single content hash. Pairs found at runtime never move a name that is already
//! mapped, but an explicit name entry in the cache file always wins.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::BufReader,
    path::Path,
};

use eyre::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;

use super::hash::{parse_hex_id, TextureId};

/// Pairs of `(name hash, content hash)` compiled into the plugin. When this is non-empty it is
/// used instead of the cache file.
pub const BUILTIN_PAIRS: &[(TextureId, TextureId)] = &[];

#[derive(Default)]
struct Maps {
    content_to_names: HashMap<TextureId, Vec<TextureId>>,
    name_to_content: HashMap<TextureId, TextureId>,
}

impl Maps {
    fn add_name_to_content(&mut self, content_hash: TextureId, name_hash: TextureId) -> bool {
        let names = self.content_to_names.entry(content_hash).or_default();
        let is_new_pair = !names.contains(&name_hash);

        if is_new_pair {
            names.push(name_hash);
        }

        is_new_pair
    }

    fn add(&mut self, content_hash: TextureId, name_hash: TextureId) -> bool {
        let is_new_pair = self.add_name_to_content(content_hash, name_hash);
        self.name_to_content.entry(name_hash).or_insert(content_hash);
        is_new_pair
    }

    /// Like `add`, but replaces whatever content hash the name had before.
    fn assign(&mut self, content_hash: TextureId, name_hash: TextureId) -> bool {
        let is_new_pair = self.add_name_to_content(content_hash, name_hash);
        self.name_to_content.insert(name_hash, content_hash);
        is_new_pair
    }

    fn merge(&mut self, entries: CacheEntries) -> usize {
        let added = entries
            .pairs
            .into_iter()
            .filter(|&(content_hash, name_hash)| self.add(content_hash, name_hash))
            .count();

        let assigned = entries
            .names
            .into_iter()
            .filter(|&(name_hash, content_hash)| self.assign(content_hash, name_hash))
            .count();

        added + assigned
    }
}

/// The process-wide bridge between the two identifier spaces.
#[derive(Default)]
pub struct IdentifierBridge {
    maps: RwLock<Maps>,
}

impl IdentifierBridge {
    pub fn new() -> IdentifierBridge {
        IdentifierBridge::default()
    }

    /// Returns the content hash associated with a game texture's name hash.
    pub fn content_hash(&self, name_hash: TextureId) -> Option<TextureId> {
        self.maps.read().name_to_content.get(&name_hash).copied()
    }

    /// Returns every name hash that the content hash serves, in the order they were added.
    pub fn name_hashes(&self, content_hash: TextureId) -> Vec<TextureId> {
        self.maps
            .read()
            .content_to_names
            .get(&content_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Associates a content hash with a name hash. Returns `true` if the pair was new.
    pub fn add_mapping(&self, content_hash: TextureId, name_hash: TextureId) -> bool {
        self.maps.write().add(content_hash, name_hash)
    }

    /// Adds many `(content hash, name hash)` pairs under one lock acquisition.
    pub fn extend(&self, pairs: impl IntoIterator<Item = (TextureId, TextureId)>) -> usize {
        let mut maps = self.maps.write();

        pairs
            .into_iter()
            .filter(|&(content_hash, name_hash)| maps.add(content_hash, name_hash))
            .count()
    }

    /// Returns every `(name hash, content hash)` association.
    pub fn name_pairs(&self) -> Vec<(TextureId, TextureId)> {
        self.maps
            .read()
            .name_to_content
            .iter()
            .map(|(&name, &content)| (name, content))
            .collect()
    }

    pub fn name_count(&self) -> usize {
        self.maps.read().name_to_content.len()
    }

    pub fn content_count(&self) -> usize {
        self.maps.read().content_to_names.len()
    }

    /// Fills the bridge from the compiled-in table if there is one, or from the cache file at
    /// `cache_path` if not. A missing cache file just leaves the bridge empty.
    pub fn load(&self, cache_path: Option<&Path>) {
        if !BUILTIN_PAIRS.is_empty() {
            let added = self.extend(BUILTIN_PAIRS.iter().map(|&(name, content)| (content, name)));
            log::info!("Loaded {} built-in hash mappings", added);
            return;
        }

        let Some(cache_path) = cache_path else {
            log::info!("No hash mapping cache configured");
            return;
        };

        if !cache_path.exists() {
            log::info!("No hash mapping cache at {:?}", cache_path);
            return;
        }

        match self.load_cache(cache_path) {
            Ok(added) => log::info!(
                "Loaded {} hash mappings from cache ({} content hashes, {} names)",
                added,
                self.content_count(),
                self.name_count()
            ),

            Err(err) => log::error!("Failed to load hash mapping cache: {:?}", err),
        }
    }

    /// Parses a cache file and merges it in. Returns the number of new pairs.
    pub fn load_cache(&self, path: &Path) -> Result<usize> {
        let file = File::open(path).wrap_err_with(|| format!("unable to open {:?}", path))?;
        let cache: CacheFile = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("unable to parse {:?}", path))?;

        Ok(self.maps.write().merge(cache.into_entries()))
    }

    /// Parses cache JSON from a string and merges it in.
    pub fn load_cache_str(&self, json: &str) -> Result<usize> {
        let cache: CacheFile = serde_json::from_str(json)?;
        Ok(self.maps.write().merge(cache.into_entries()))
    }
}

/// A hash stored in a cache file, which may be a JSON number or a string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum HashValue {
    Number(u64),
    Text(String),
}

impl HashValue {
    /// Strings are parsed as hex if `hex` is set, decimal otherwise. Numbers are taken as they are.
    fn to_id(&self, hex: bool) -> Option<TextureId> {
        match self {
            HashValue::Number(value) => u32::try_from(*value).ok(),
            HashValue::Text(text) if hex => parse_hex_id(text),
            HashValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NestedCache {
    /// Hex content hash to decimal name hashes.
    crc32_to_game: BTreeMap<String, Vec<HashValue>>,

    /// Decimal name hash to hex content hash.
    #[serde(default)]
    game_to_crc32: HashMap<String, HashValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CacheFile {
    Nested(NestedCache),

    /// The old format: hex content hash to decimal name hash.
    Flat(BTreeMap<String, HashValue>),
}

/// What a cache file contributes to the bridge.
#[derive(Default)]
struct CacheEntries {
    /// `(content hash, name hash)` pairs, merged the same way as pairs found at runtime.
    pairs: Vec<(TextureId, TextureId)>,

    /// `(name hash, content hash)` entries that decide a name's content hash outright.
    names: Vec<(TextureId, TextureId)>,
}

impl CacheFile {
    /// Sorts the cache into bridge entries. Entries that don't parse are skipped with a warning.
    ///
    /// Keys are visited in sorted order, so a name listed under several content hashes and given
    /// no explicit entry always ends up with the lowest one.
    fn into_entries(self) -> CacheEntries {
        let mut entries = CacheEntries::default();
        let mut skipped = 0;

        match self {
            CacheFile::Nested(cache) => {
                for (content, names) in &cache.crc32_to_game {
                    let Some(content) = parse_hex_id(content) else {
                        skipped += names.len();
                        continue;
                    };

                    for name in names {
                        match name.to_id(false) {
                            Some(name) => entries.pairs.push((content, name)),
                            None => skipped += 1,
                        }
                    }
                }

                for (name, content) in &cache.game_to_crc32 {
                    match (name.trim().parse().ok(), content.to_id(true)) {
                        (Some(name), Some(content)) => entries.names.push((name, content)),
                        _ => skipped += 1,
                    }
                }
            }

            CacheFile::Flat(map) => {
                for (key, value) in &map {
                    match (parse_hex_id(key), value.to_id(false)) {
                        (Some(content), Some(name)) => entries.pairs.push((content, name)),
                        _ => skipped += 1,
                    }
                }
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {} unparseable hash mapping entries", skipped);
        }

        entries
    }
}
