//! The two identifier spaces: name hashes, which the game computes from texture names, and content
//! hashes, which legacy texture packs compute from pixel data.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::TextureHandle;

/// A 32-bit texture identifier. Name hashes and content hashes share this type and the same store
/// keyspace.
pub type TextureId = u32;

/// The game's string hash. Case sensitive.
pub fn name_hash(name: &str) -> TextureId {
    name_hash_bytes(name.as_bytes())
}

pub fn name_hash_bytes(bytes: &[u8]) -> TextureId {
    bytes.iter().fold(u32::MAX, |hash, &byte| {
        hash.wrapping_mul(33).wrapping_add(byte as u32)
    })
}

const CRC32_POLY: u32 = 0xEDB8_8320;

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;

        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY
            } else {
                crc >> 1
            };

            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
};

/// Advances a reflected CRC-32 register by one byte.
pub fn crc32_update(crc: u32, byte: u8) -> u32 {
    CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8)
}

/// CRC-32 as the legacy texture tools compute it: initial value `0xFFFFFFFF` and no final
/// inversion, so an empty input hashes to `0xFFFFFFFF`.
pub fn content_hash(bytes: &[u8]) -> TextureId {
    bytes.iter().fold(u32::MAX, |crc, &byte| crc32_update(crc, byte))
}

/// Computes the content hash of a loaded texture from its top mip level.
///
/// The length hashed is `bits_per_pixel * width * height / 8`, ignoring pitch and using the
/// compressed rate for block formats. Packs in the wild were hashed this way, so it must not be
/// corrected. Returns `None` if the level can't be read or the hash comes out as zero.
pub fn texture_content_hash(texture: &TextureHandle) -> Option<TextureId> {
    let mut hash = None;

    let locked = texture.with_top_level(&mut |desc, bits| {
        let size = desc.format.bits_per_pixel() as u64 * desc.width as u64 * desc.height as u64 / 8;
        let size = (size as usize).min(bits.len());

        hash = Some(content_hash(&bits[..size]));
    });

    if let Err(err) = locked {
        log::debug!("Unable to hash texture {:?}: {}", texture, err);
        return None;
    }

    hash.filter(|&hash| hash != 0)
}

/// Prefixes that texture ripping tools put in front of file names.
const FILE_NAME_PREFIXES: [&str; 2] = ["SPEED.EXE_", "speed_t_"];

/// Removes any of the ripper prefixes from the front of `name`, ignoring case. Repeated prefixes
/// are all removed.
pub fn strip_file_name_prefixes(name: &str) -> &str {
    let mut name = name;

    'strip: loop {
        for prefix in FILE_NAME_PREFIXES {
            if name.len() >= prefix.len()
                && name.is_char_boundary(prefix.len())
                && name[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                name = &name[prefix.len()..];
                continue 'strip;
            }
        }

        return name;
    }
}

/// Derives an identifier from a texture's file name.
///
/// In order of preference: the first non-zero embedded `0x########` token, the last non-zero run of
/// eight hex digits, or the name hash of the file stem.
pub fn file_name_hash(file_name: &str) -> TextureId {
    static PREFIXED_HEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"0[xX]([0-9A-Fa-f]{8})").expect("valid regex"));

    let file_name = file_name.trim();

    // Only the final component counts if the name includes directories.
    let file_name = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name);

    // Prefixes go first since `SPEED.EXE_` contains a dot of its own.
    let file_name = strip_file_name_prefixes(file_name);

    let stem = match file_name.rfind('.') {
        Some(dot) if dot > 0 => &file_name[..dot],
        _ => file_name,
    };

    let stem = strip_file_name_prefixes(stem);

    let prefixed = PREFIXED_HEX
        .captures_iter(stem)
        .filter_map(|captures| u32::from_str_radix(&captures[1], 16).ok())
        .find(|&hash| hash != 0);

    if let Some(hash) = prefixed {
        return hash;
    }

    if let Some(hash) = last_hex_run(stem) {
        return hash;
    }

    name_hash(stem)
}

/// Finds the right-most run of exactly eight hex digits (part of a longer run counts, taking its
/// last eight digits) that isn't zero.
fn last_hex_run(stem: &str) -> Option<TextureId> {
    let bytes = stem.as_bytes();
    let mut end = bytes.len();

    while end >= 8 {
        let window = &bytes[end - 8..end];

        if window.iter().all(u8::is_ascii_hexdigit) {
            // The window is all ASCII, so this can't split a character.
            let value = u32::from_str_radix(&stem[end - 8..end], 16).ok();

            if let Some(value) = value.filter(|&v| v != 0) {
                return Some(value);
            }
        }

        end -= 1;
    }

    None
}

/// Parses a hexadecimal identifier with or without a `0x` prefix.
pub fn parse_hex_id(text: &str) -> Option<TextureId> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);

    if digits.is_empty() {
        return None;
    }

    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_input_keeps_initial_crc() {
        assert_eq!(content_hash(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn content_hash_is_uninverted_crc32() {
        // The standard CRC-32 check value for "123456789" is 0xCBF43926; without the final
        // inversion it's the complement.
        assert_eq!(content_hash(b"123456789"), 0x340B_C6D9);
        assert_eq!(
            content_hash(b"The quick brown fox jumps over the lazy dog"),
            !0x414F_A339u32
        );
    }

    #[test]
    fn name_hash_fixtures() {
        assert_eq!(name_hash(""), 0xFFFF_FFFF);

        // Material parameter names the game looks up.
        assert_eq!(name_hash("DiffuseMap"), 0x3BB0_81C3);
        assert_eq!(name_hash("NormalMapTexture"), 0xDC47_78D7);
        assert_eq!(name_hash("SPECULARMAPTEXTURE"), 0x5545_A4ED);

        // Texture and car names.
        assert_eq!(name_hash("SPECROAD"), 0xD8ED_3D30);
        assert_eq!(name_hash("BMWM3GTRE46"), 0x0FCF_0041);
        assert_eq!(name_hash("BMWM3GTRE46_SKIN1"), 0xDE3A_D3C6);
    }

    /// Straightforward loop version used to cross-check the fold.
    fn reference_name_hash(name: &str) -> u32 {
        let mut hash: u64 = 0xFFFF_FFFF;

        for byte in name.bytes() {
            hash = (hash * 33 + byte as u64) & 0xFFFF_FFFF;
        }

        hash as u32
    }

    #[test]
    fn name_hash_is_order_and_case_sensitive() {
        assert_ne!(name_hash("ab"), name_hash("ba"));
        assert_ne!(name_hash("road"), name_hash("ROAD"));
    }

    #[test]
    fn file_name_prefers_prefixed_token() {
        assert_eq!(file_name_hash("SPEED.EXE_0x1A2B3C4D.dds"), 0x1A2B_3C4D);
        assert_eq!(file_name_hash("foo_0XDEADBEEF_bar.dds"), 0xDEAD_BEEF);
        assert_eq!(file_name_hash("dir/sub\\0x00000010.dds"), 0x10);
    }

    #[test]
    fn file_name_falls_back_to_last_hex_run() {
        assert_eq!(file_name_hash("texture_12345678_ABCDEF01.dds"), 0xABCD_EF01);
        assert_eq!(file_name_hash("speed_t_CAFEBABE.dds"), 0xCAFE_BABE);

        // Zero tokens are skipped in favour of the next rule.
        assert_eq!(file_name_hash("0x00000000_11223344.dds"), 0x1122_3344);
    }

    #[test]
    fn file_name_takes_first_non_zero_prefixed_token() {
        assert_eq!(
            file_name_hash("0x00000000_0xABCDEF01_99999999.dds"),
            0xABCD_EF01
        );
        assert_eq!(file_name_hash("0x0xCAFEBABE_0x11111111.dds"), 0xCAFE_BABE);
    }

    #[test]
    fn file_name_falls_back_to_name_hash() {
        assert_eq!(file_name_hash("tex1.dds"), name_hash("tex1"));
        assert_eq!(file_name_hash("SPEED.EXE_speed_t_road.dds"), name_hash("road"));
        assert_eq!(file_name_hash("  SKY.dds  "), name_hash("SKY"));
        assert_eq!(file_name_hash("SPEED.EXE_road"), name_hash("road"));
    }

    #[test]
    fn prefixes_strip_case_insensitively() {
        assert_eq!(strip_file_name_prefixes("speed.exe_SPEED_T_x"), "x");
        assert_eq!(strip_file_name_prefixes("SPEED.EX"), "SPEED.EX");
    }

    #[test]
    fn hex_ids_parse_with_or_without_prefix() {
        assert_eq!(parse_hex_id("0xDEADBEEF"), Some(0xDEAD_BEEF));
        assert_eq!(parse_hex_id(" deadbeef "), Some(0xDEAD_BEEF));
        assert_eq!(parse_hex_id("0x"), None);
        assert_eq!(parse_hex_id("xyz"), None);
    }

    proptest! {
        #[test]
        fn name_hash_matches_reference(name in "[ -~]{0,40}") {
            prop_assert_eq!(name_hash(&name), reference_name_hash(&name));
        }

        #[test]
        fn content_hash_matches_bitwise_crc(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut crc = u32::MAX;

            for &byte in &bytes {
                let mut byte = byte as u32;

                for _ in 0..8 {
                    crc = (crc >> 1) ^ if (crc ^ byte) & 1 != 0 { CRC32_POLY } else { 0 };
                    byte >>= 1;
                }
            }

            prop_assert_eq!(content_hash(&bytes), crc);
        }
    }
}
