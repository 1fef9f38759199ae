//! Finds replacement textures on disk: texture pack folders, loose image folders and archives, plus
//! the list of texture identifiers that the game actually uses.

use std::{
    collections::HashSet,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt};
use eyre::{format_err, Context, Result};
use itertools::Itertools;
use serde::Deserialize;
use walkdir::WalkDir;

use super::hash::{file_name_hash, name_hash, parse_hex_id, TextureId};

/// Whether a file decodes to a 2D texture or a volume texture.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextureKind {
    Planar,
    Volume,
}

/// A replacement file found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRegistration {
    pub id: TextureId,
    pub path: PathBuf,
    pub kind: TextureKind,
}

impl PathRegistration {
    fn new(id: TextureId, path: PathBuf) -> PathRegistration {
        let kind = sniff_kind(&path);
        PathRegistration { id, path, kind }
    }
}

const DDS_MAGIC: &[u8; 4] = b"DDS ";

/// Offset of `dwCaps2` in a DDS file, counting the magic.
const DDS_CAPS2_OFFSET: usize = 112;

const DDSCAPS2_VOLUME: u32 = 0x20_0000;

/// Reads the DDS header to find out if the file holds a volume texture. Anything that can't be
/// read or isn't a DDS file is treated as a plain 2D texture.
pub fn sniff_kind(path: &Path) -> TextureKind {
    let mut header = [0u8; DDS_CAPS2_OFFSET + 4];

    let read = File::open(path).and_then(|mut file| file.read_exact(&mut header));

    if read.is_err() || &header[..4] != DDS_MAGIC {
        return TextureKind::Planar;
    }

    let caps2 = (&header[DDS_CAPS2_OFFSET..])
        .read_u32::<LittleEndian>()
        .unwrap_or(0);

    if caps2 & DDSCAPS2_VOLUME != 0 {
        TextureKind::Volume
    } else {
        TextureKind::Planar
    }
}

/// The `TexturePackInfo.json` file at the root of every texture pack.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TexturePackInfo {
    /// Directory, relative to the pack folder, that texture paths are relative to.
    root_directory: String,

    #[serde(default)]
    texture_mappings: Vec<TextureMapping>,

    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextureMapping {
    /// The game's name for the texture. Its name hash is the identifier.
    game_id: String,
    texture_path: String,
}

pub const PACK_INFO_NAME: &str = "TexturePackInfo.json";

/// Reads a single texture pack folder. Mappings whose files don't exist are dropped.
fn load_pack(pack_dir: &Path) -> Result<Vec<PathRegistration>> {
    let info_path = pack_dir.join(PACK_INFO_NAME);

    let info: TexturePackInfo = serde_json::from_reader(
        File::open(&info_path).wrap_err_with(|| format!("unable to open {:?}", info_path))?,
    )
    .wrap_err_with(|| format!("unable to parse {:?}", info_path))?;

    if let Some(description) = &info.description {
        log::info!("Texture pack {:?}: {}", pack_dir, description);
    }

    let textures_dir = pack_dir.join(&info.root_directory);
    let mut missing = 0;

    let registrations = info
        .texture_mappings
        .iter()
        .filter_map(|mapping| {
            let path = textures_dir.join(&mapping.texture_path);

            if path.is_file() {
                Some(PathRegistration::new(name_hash(&mapping.game_id), path))
            } else {
                missing += 1;
                None
            }
        })
        .collect_vec();

    if missing > 0 {
        log::warn!(
            "{} textures listed by {:?} don't exist and were skipped",
            missing,
            info_path
        );
    }

    Ok(registrations)
}

/// Scans every texture pack folder under `packs_dir`.
///
/// Errors in one pack don't affect the others, so instead of returning early they are collected
/// and returned next to whatever could be loaded.
pub fn scan_texture_packs(packs_dir: &Path) -> (Vec<PathRegistration>, Vec<eyre::Report>) {
    let read_dir = match std::fs::read_dir(packs_dir) {
        Ok(read_dir) => read_dir,
        Err(err) => {
            let err = eyre::Report::new(err)
                .wrap_err(format!("unable to read texture pack directory {:?}", packs_dir));
            return (vec![], vec![err]);
        }
    };

    let (packs, errors): (Vec<_>, Vec<_>) = read_dir
        .filter_map(|entry| match entry {
            Ok(entry) => {
                let path = entry.path();

                // Folders without an info file are not packs.
                (path.is_dir() && path.join(PACK_INFO_NAME).is_file()).then(|| load_pack(&path))
            }

            Err(err) => Some(Err(format_err!("unable to read directory entry: {}", err))),
        })
        .partition_result();

    (packs.into_iter().flatten().collect(), errors)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case(extension))
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("Error while scanning {:?}: {}", dir, err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_extension(entry.path(), extension))
        .map(|entry| entry.into_path())
        .sorted()
        .collect()
}

/// Finds every `.dds` file under `dir`, identifying each by its file name.
pub fn scan_loose_textures(dir: &Path) -> Vec<PathRegistration> {
    files_with_extension(dir, "dds")
        .into_iter()
        .filter_map(|path| {
            let id = file_name_hash(path.file_name()?.to_str()?);
            Some(PathRegistration::new(id, path))
        })
        .collect()
}

/// Finds every texture package archive under `dir`.
pub fn find_archives(dir: &Path) -> Vec<PathBuf> {
    files_with_extension(dir, "tpf")
}

/// The set of texture identifiers the game knows about. Only these make it into the swap table.
#[derive(Clone, Debug, Default)]
pub struct KnownTextures {
    ids: HashSet<TextureId>,
}

impl KnownTextures {
    pub fn from_ids(ids: impl IntoIterator<Item = TextureId>) -> KnownTextures {
        KnownTextures {
            ids: ids.into_iter().collect(),
        }
    }

    /// Parses a list with one entry per line. `0x` tokens are identifiers; anything else is a
    /// texture name and is hashed in upper case with any `.dds` extension removed. Lines may be
    /// tree-listing rows, in which case only the part after the last `|` is used.
    pub fn parse(text: &str) -> KnownTextures {
        let ids = text.lines().filter_map(|line| {
            let token = line.rsplit('|').next().unwrap_or(line).trim();

            if token.is_empty() || token.starts_with('#') {
                return None;
            }

            if token.starts_with("0x") || token.starts_with("0X") {
                return parse_hex_id(token);
            }

            let name = match token.len().checked_sub(4) {
                Some(dot) if token.is_char_boundary(dot) && token[dot..].eq_ignore_ascii_case(".dds") => {
                    &token[..dot]
                }
                _ => token,
            };

            Some(name_hash(&name.to_uppercase()))
        });

        KnownTextures::from_ids(ids)
    }

    /// Loads the list from a file. A missing file gives an empty set.
    pub fn load(path: &Path) -> Result<KnownTextures> {
        if !path.exists() {
            log::warn!(
                "No known texture list at {:?}; nothing will be swapped until one exists",
                path
            );

            return Ok(KnownTextures::default());
        }

        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("unable to read known texture list {:?}", path))?;

        let known = KnownTextures::parse(&text);
        log::info!("Loaded {} known texture identifiers", known.len());

        Ok(known)
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = TextureId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dds(path: &Path, caps2: u32) {
        let mut bytes = vec![0u8; 128];
        bytes[..4].copy_from_slice(DDS_MAGIC);
        bytes[DDS_CAPS2_OFFSET..DDS_CAPS2_OFFSET + 4].copy_from_slice(&caps2.to_le_bytes());
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn volume_textures_are_detected_from_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("flat.dds");
        let volume = dir.path().join("volume.dds");
        let junk = dir.path().join("junk.dds");

        write_dds(&flat, 0);
        write_dds(&volume, DDSCAPS2_VOLUME);
        std::fs::write(&junk, b"short").unwrap();

        assert_eq!(sniff_kind(&flat), TextureKind::Planar);
        assert_eq!(sniff_kind(&volume), TextureKind::Volume);
        assert_eq!(sniff_kind(&junk), TextureKind::Planar);
        assert_eq!(sniff_kind(&dir.path().join("absent.dds")), TextureKind::Planar);
    }

    #[test]
    fn texture_packs_register_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("CoolPack");
        std::fs::create_dir_all(pack.join("textures/cars")).unwrap();
        write_dds(&pack.join("textures/cars/skin.dds"), 0);

        std::fs::write(
            pack.join(PACK_INFO_NAME),
            r#"{
                "rootDirectory": "textures",
                "description": "test pack",
                "textureMappings": [
                    { "gameId": "CAR_SKIN", "texturePath": "cars/skin.dds" },
                    { "gameId": "MISSING", "texturePath": "cars/missing.dds" }
                ]
            }"#,
        )
        .unwrap();

        // Not a pack, so ignored.
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();

        // A broken pack produces an error without affecting the good one.
        let broken = dir.path().join("Broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(PACK_INFO_NAME), "{ not json").unwrap();

        let (found, errors) = scan_texture_packs(dir.path());

        assert_eq!(errors.len(), 1);
        assert_eq!(
            found,
            vec![PathRegistration {
                id: name_hash("CAR_SKIN"),
                path: pack.join("textures").join("cars/skin.dds"),
                kind: TextureKind::Planar,
            }]
        );
    }

    #[test]
    fn missing_pack_directory_is_an_error_not_a_panic() {
        let (found, errors) = scan_texture_packs(Path::new("/no/such/packs"));
        assert!(found.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn loose_textures_use_file_name_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        write_dds(&dir.path().join("0x0000BEEF.dds"), 0);
        write_dds(&dir.path().join("nested/ROAD.DDS"), DDSCAPS2_VOLUME);
        std::fs::write(dir.path().join("readme.txt"), "hi").unwrap();

        let found = scan_loose_textures(dir.path());

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, 0xBEEF);
        assert_eq!(found[1].id, name_hash("ROAD"));
        assert_eq!(found[1].kind, TextureKind::Volume);
    }

    #[test]
    fn archives_are_found_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/pack.TPF"), b"").unwrap();
        std::fs::write(dir.path().join("other.zip"), b"").unwrap();

        assert_eq!(find_archives(dir.path()), vec![dir.path().join("a/pack.TPF")]);
    }

    #[test]
    fn known_textures_accept_hashes_and_names() {
        let known = KnownTextures::parse(
            "# comment\n\
             0x00001111\n\
             road.dds\n\
             TRACKS | sky\n\
             \n",
        );

        assert_eq!(known.len(), 3);
        assert!(known.contains(0x1111));
        assert!(known.contains(name_hash("ROAD")));
        assert!(known.contains(name_hash("SKY")));
        assert!(!known.contains(name_hash("road")));
    }
}
