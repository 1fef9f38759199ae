//! Parsing for `texmod.def`, the manifest that ties an archive's files to game textures.
//!
//! Each useful line looks like `<name hash in hex>|<file name>`. The file name is turned into a
//! content hash the same way the archive's image entries are, so that the manifest can be merged
//! into the identifier bridge before any image is loaded.

use crate::texture::hash::{file_name_hash, parse_hex_id, strip_file_name_prefixes, TextureId};

/// The entry name that holds the manifest.
pub const MANIFEST_NAME: &str = "texmod.def";

/// One parsed manifest line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name_hash: TextureId,
    pub file_name: String,
    pub content_hash: TextureId,
}

/// Parses manifest text. Blank lines, `#` and `//` comments, lines without a `|` and lines whose
/// hash doesn't parse are skipped.
pub fn parse(text: &str) -> Vec<ManifestEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ManifestEntry> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }

    let (hash, file_name) = line.split_once('|')?;
    let name_hash = parse_hex_id(hash)?;
    let file_name = strip_file_name_prefixes(file_name.trim()).trim();

    if file_name.is_empty() {
        return None;
    }

    Some(ManifestEntry {
        name_hash,
        file_name: file_name.to_string(),
        content_hash: file_name_hash(file_name),
    })
}
