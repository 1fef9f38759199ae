//! Extracts textures from legacy texture package archives.
//!
//! A package is a ZIP file with every byte XORed against a fixed key. Inside, entries may also be
//! protected with the traditional ZIP stream cipher, always with the same password. The package's
//! `texmod.def` manifest names the game textures that each image replaces; it is read before any
//! image so the identifier bridge knows about those names by the time the images are loaded.

mod crypto;
pub mod manifest;

use std::{
    fs::File,
    io::{Cursor, Read},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;
use memmap2::Mmap;
use thiserror::Error;
use zip::{CompressionMethod, ZipArchive};

pub use crypto::{xor_file_in_place, ZipCrypto, FILE_XOR_KEY};

use self::{
    crypto::ENCRYPTION_HEADER_LEN,
    manifest::{ManifestEntry, MANIFEST_NAME},
};
use super::{
    bridge::IdentifierBridge,
    hash::{content_hash, file_name_hash, strip_file_name_prefixes, TextureId},
};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const LOCAL_HEADER_LEN: usize = 30;
const FLAG_ENCRYPTED: u16 = 0x1;

/// The most that deflate can expand its input by.
const MAX_DEFLATE_RATIO: usize = 1032;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("not a zip file after removing the xor layer")]
    NotAZip,

    #[error("local header for '{0}' is outside the archive")]
    HeaderOutOfBounds(String),

    #[error("local header for '{0}' has a bad signature")]
    BadLocalHeader(String),

    #[error("data for '{0}' runs past the end of the archive")]
    Truncated(String),

    #[error("'{name}' has checksum {actual:08x} but should be {expected:08x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("password check failed for '{0}'")]
    VerificationFailed(String),

    #[error("unable to inflate '{name}': {source}")]
    Inflate {
        name: String,
        source: std::io::Error,
    },

    #[error("'{name}' unpacked to {actual} bytes but should be {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("'{name}' uses unsupported compression {method}")]
    UnsupportedCompression { name: String, method: String },
}

/// An image pulled out of a package.
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Derived from the file name.
    pub content_hash: TextureId,

    /// The entry's name with ripper prefixes removed.
    pub file_name: String,

    pub bytes: Vec<u8>,
}

/// What happened during one extraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Image entries in the archive, not counting the manifest or directories.
    pub images: usize,

    /// Images successfully passed to the callback.
    pub delivered: usize,

    /// Images that couldn't be decrypted or unpacked.
    pub failed: usize,

    /// Lines parsed from the manifest, or `None` if there was no usable manifest.
    pub manifest_lines: Option<usize>,
}

/// Central directory details for one entry.
struct EntryInfo {
    name: String,
    header_start: u64,
    compressed_size: u64,
    size: u64,
    crc32: u32,
    compression: CompressionMethod,
}

/// Reads a package from disk and extracts it. See `extract_bytes`.
pub fn extract(
    path: &Path,
    bridge: &IdentifierBridge,
    on_entry: impl FnMut(ArchiveEntry),
) -> Result<ExtractSummary, ArchiveError> {
    let file = File::open(path)?;

    // The map is read-only, and we need to modify the bytes, so copy them out straight away.
    let mut data = {
        let map = unsafe { Mmap::map(&file)? };
        map.to_vec()
    };

    log::info!("Read {} bytes from {:?}", data.len(), path);

    xor_file_in_place(&mut data);
    extract_bytes(&data, bridge, on_entry)
}

/// Extracts a package that has already had its XOR layer removed.
///
/// The manifest (if any) is merged into `bridge` first. Then every other entry is decrypted and
/// unpacked and passed to `on_entry`. Failures on individual entries are logged and skipped.
pub fn extract_bytes(
    data: &[u8],
    bridge: &IdentifierBridge,
    mut on_entry: impl FnMut(ArchiveEntry),
) -> Result<ExtractSummary, ArchiveError> {
    if !data.starts_with(b"PK") {
        return Err(ArchiveError::NotAZip);
    }

    let entries = read_directory(data)?;
    let mut summary = ExtractSummary::default();

    log::info!("Archive has {} entries", entries.len());

    match entries.iter().find(|entry| entry.name == MANIFEST_NAME) {
        Some(entry) => match read_manifest(data, entry) {
            Ok(lines) => {
                let added = bridge.extend(
                    lines
                        .iter()
                        .map(|line| (line.content_hash, line.name_hash)),
                );

                log::info!(
                    "Manifest has {} mappings ({} new to the bridge)",
                    lines.len(),
                    added
                );

                summary.manifest_lines = Some(lines.len());
            }

            Err(err) => log::warn!("Unable to read manifest: {}", err),
        },

        None => log::warn!("Archive has no {}; images will only be known by content hash", MANIFEST_NAME),
    }

    for entry in &entries {
        if entry.name == MANIFEST_NAME || entry.name.ends_with('/') {
            continue;
        }

        summary.images += 1;

        let bytes = match unpack_entry(data, entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("Skipping archive entry: {}", err);
                summary.failed += 1;
                continue;
            }
        };

        let file_name = strip_file_name_prefixes(entry.name.trim()).to_string();

        on_entry(ArchiveEntry {
            content_hash: file_name_hash(&file_name),
            file_name,
            bytes,
        });

        summary.delivered += 1;
    }

    Ok(summary)
}

fn read_directory(data: &[u8]) -> Result<Vec<EntryInfo>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        // Raw access, because the reader would refuse encrypted entries.
        let file = match archive.by_index_raw(index) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("Unable to read directory entry {}: {}", index, err);
                continue;
            }
        };

        entries.push(EntryInfo {
            name: file.name().to_string(),
            header_start: file.header_start(),
            compressed_size: file.compressed_size(),
            size: file.size(),
            crc32: file.crc32(),
            compression: file.compression(),
        });
    }

    Ok(entries)
}

fn read_manifest(data: &[u8], entry: &EntryInfo) -> Result<Vec<ManifestEntry>, ArchiveError> {
    let bytes = unpack_entry(data, entry)?;
    Ok(manifest::parse(&String::from_utf8_lossy(&bytes)))
}

/// Decrypts (if needed) and decompresses a single entry.
fn unpack_entry(data: &[u8], entry: &EntryInfo) -> Result<Vec<u8>, ArchiveError> {
    let name = || entry.name.clone();

    // Offsets and sizes come straight from the archive, so none of them are trusted.
    let header_start = usize::try_from(entry.header_start)
        .map_err(|_| ArchiveError::HeaderOutOfBounds(name()))?;
    let header_end = header_start
        .checked_add(LOCAL_HEADER_LEN)
        .ok_or_else(|| ArchiveError::HeaderOutOfBounds(name()))?;

    let header = data
        .get(header_start..header_end)
        .ok_or_else(|| ArchiveError::HeaderOutOfBounds(name()))?;

    let mut reader = header;

    if reader.read_u32::<LittleEndian>()? != LOCAL_HEADER_SIGNATURE {
        return Err(ArchiveError::BadLocalHeader(name()));
    }

    // Skip the version needed to extract.
    reader.read_u16::<LittleEndian>()?;
    let flags = reader.read_u16::<LittleEndian>()?;

    // Name and extra field lengths are the last two fields.
    let mut lengths = &header[26..];
    let name_len = lengths.read_u16::<LittleEndian>()? as usize;
    let extra_len = lengths.read_u16::<LittleEndian>()? as usize;

    let data_start = header_end
        .checked_add(name_len + extra_len)
        .ok_or_else(|| ArchiveError::Truncated(name()))?;
    let data_end = usize::try_from(entry.compressed_size)
        .ok()
        .and_then(|compressed_size| data_start.checked_add(compressed_size))
        .ok_or_else(|| ArchiveError::Truncated(name()))?;

    let stored = data
        .get(data_start..data_end)
        .ok_or_else(|| ArchiveError::Truncated(name()))?;

    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let mut decrypted;

    let body = if encrypted {
        decrypted = stored.to_vec();

        if !ZipCrypto::decrypt_entry(&mut decrypted, entry.crc32, flags) {
            return Err(ArchiveError::VerificationFailed(name()));
        }

        &decrypted[ENCRYPTION_HEADER_LEN..]
    } else {
        stored
    };

    let unpacked = match entry.compression {
        CompressionMethod::Stored => body.to_vec(),

        CompressionMethod::Deflated => {
            let capacity = usize::try_from(entry.size)
                .unwrap_or(usize::MAX)
                .min(body.len().saturating_mul(MAX_DEFLATE_RATIO));
            let mut out = Vec::with_capacity(capacity);

            DeflateDecoder::new(body)
                .take(entry.size)
                .read_to_end(&mut out)
                .map_err(|source| ArchiveError::Inflate {
                    name: name(),
                    source,
                })?;

            out
        }

        other => {
            return Err(ArchiveError::UnsupportedCompression {
                name: name(),
                method: format!("{:?}", other),
            })
        }
    };

    if unpacked.len() as u64 != entry.size {
        return Err(ArchiveError::SizeMismatch {
            name: name(),
            expected: entry.size,
            actual: unpacked.len() as u64,
        });
    }

    // Encrypted entries were already checked against the password header.
    if !encrypted {
        let actual = !content_hash(&unpacked);

        if actual != entry.crc32 {
            return Err(ArchiveError::ChecksumMismatch {
                name: name(),
                expected: entry.crc32,
                actual,
            });
        }
    }

    Ok(unpacked)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::DeflateEncoder, Compression};
    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::texture::hash::{content_hash, name_hash};

    fn deflated() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));

        for (name, bytes) in entries {
            writer.start_file(*name, deflated()).unwrap();
            writer.write_all(bytes).unwrap();
        }

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn manifest_is_merged_before_images_are_delivered() {
        let image = b"DDS fake image payload".repeat(20);
        let data = build_zip(&[
            ("SPEED.EXE_0xCAFEBABE.dds", &image),
            ("texmod.def", b"DEADBEEF|SPEED.EXE_0xCAFEBABE.dds\n"),
        ]);

        let bridge = IdentifierBridge::new();
        let mut seen = Vec::new();

        let summary = extract_bytes(&data, &bridge, |entry| {
            // The manifest comes after the image in the directory but must already be merged.
            assert_eq!(bridge.name_hashes(entry.content_hash), vec![0xDEAD_BEEF]);
            seen.push(entry);
        })
        .unwrap();

        assert_eq!(summary.images, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.manifest_lines, Some(1));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].file_name, "0xCAFEBABE.dds");
        assert_eq!(seen[0].content_hash, 0xCAFE_BABE);
        assert_eq!(seen[0].bytes, image);
    }

    #[test]
    fn missing_manifest_still_extracts_images() {
        let data = build_zip(&[("road.dds", b"road pixels")]);
        let bridge = IdentifierBridge::new();
        let mut seen = Vec::new();

        let summary = extract_bytes(&data, &bridge, |entry| seen.push(entry)).unwrap();

        assert_eq!(summary.manifest_lines, None);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].content_hash, name_hash("road"));
        assert_eq!(bridge.name_count(), 0);
    }

    #[test]
    fn non_zip_data_is_rejected() {
        let bridge = IdentifierBridge::new();
        let result = extract_bytes(b"not a zip at all", &bridge, |_| panic!("no entries"));
        assert!(matches!(result, Err(ArchiveError::NotAZip)));
    }

    /// Builds a local header and data for an encrypted, deflated entry by hand, since the zip
    /// writer can't produce the package cipher.
    fn encrypted_entry(payload: &[u8], tamper: bool) -> (Vec<u8>, EntryInfo) {
        let crc32 = !content_hash(payload);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut body = vec![0x11u8; ENCRYPTION_HEADER_LEN - 1];
        body.push((crc32 >> 24) as u8);
        body.extend_from_slice(&compressed);
        ZipCrypto::new().encrypt_in_place(&mut body);

        if tamper {
            body[ENCRYPTION_HEADER_LEN - 1] ^= 0xFF;
        }

        let name = b"secret.dds";
        let mut data = Vec::new();
        data.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&FLAG_ENCRYPTED.to_le_bytes());
        data.extend_from_slice(&[0u8; 18]);
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(&body);

        let info = EntryInfo {
            name: "secret.dds".to_string(),
            header_start: 0,
            compressed_size: body.len() as u64,
            size: payload.len() as u64,
            crc32,
            compression: CompressionMethod::Deflated,
        };

        (data, info)
    }

    #[test]
    fn encrypted_entries_are_decrypted_and_inflated() {
        let payload = b"encrypted texture contents ".repeat(10);
        let (data, info) = encrypted_entry(&payload, false);

        assert_eq!(unpack_entry(&data, &info).unwrap(), payload);
    }

    #[test]
    fn tampered_encryption_header_is_skipped() {
        let (data, info) = encrypted_entry(b"payload", true);

        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::VerificationFailed(_))
        ));
    }

    /// A stored, unencrypted entry with a local header written by hand.
    fn plain_entry(payload: &[u8], crc32: u32) -> (Vec<u8>, EntryInfo) {
        let name = b"plain.dds";
        let mut data = Vec::new();
        data.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
        data.extend_from_slice(&[0u8; 22]);
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(payload);

        let info = EntryInfo {
            name: "plain.dds".to_string(),
            header_start: 0,
            compressed_size: payload.len() as u64,
            size: payload.len() as u64,
            crc32,
            compression: CompressionMethod::Stored,
        };

        (data, info)
    }

    #[test]
    fn unencrypted_entries_are_checksummed() {
        let payload = b"plain texture contents";

        let (data, info) = plain_entry(payload, !content_hash(payload));
        assert_eq!(unpack_entry(&data, &info).unwrap(), payload);

        let (data, info) = plain_entry(payload, 0x1234_5678);
        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::ChecksumMismatch { expected: 0x1234_5678, .. })
        ));
    }

    #[test]
    fn corrupt_package_entry_is_skipped() {
        let good = b"good texture".repeat(8);
        let bad = b"bad texture!".repeat(8);

        let mut data = {
            let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
            let stored =
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

            writer.start_file("0x11111111.dds", stored).unwrap();
            writer.write_all(&good).unwrap();
            writer.start_file("0x22222222.dds", stored).unwrap();
            writer.write_all(&bad).unwrap();

            writer.finish().unwrap().into_inner()
        };

        let position = data
            .windows(bad.len())
            .position(|window| window == bad.as_slice())
            .unwrap();
        data[position] ^= 0xFF;

        let bridge = IdentifierBridge::new();
        let mut seen = Vec::new();
        let summary = extract_bytes(&data, &bridge, |entry| seen.push(entry)).unwrap();

        assert_eq!(summary.images, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(seen[0].content_hash, 0x1111_1111);
    }

    #[test]
    fn absurd_directory_sizes_fail_the_entry() {
        let payload = b"encrypted texture contents ".repeat(10);

        let (data, mut info) = encrypted_entry(&payload, false);
        info.size = 1 << 40;
        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::SizeMismatch { .. })
        ));

        let (data, mut info) = encrypted_entry(&payload, false);
        info.compressed_size = u64::MAX;
        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::Truncated(_))
        ));

        let (data, mut info) = encrypted_entry(&payload, false);
        info.header_start = u64::MAX;
        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::HeaderOutOfBounds(_))
        ));
    }

    #[test]
    fn truncated_entry_is_reported() {
        let (mut data, info) = encrypted_entry(b"payload", false);
        data.truncate(data.len() - 4);

        assert!(matches!(
            unpack_entry(&data, &info),
            Err(ArchiveError::Truncated(_))
        ));
    }
}
