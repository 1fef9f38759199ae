//! The two ciphers used by texture package archives: a 4-byte XOR over the whole file, and the
//! traditional PKWARE stream cipher on individual entries.

use crate::texture::hash::crc32_update;

/// Key XORed over every byte of the archive file, repeating every four bytes.
pub const FILE_XOR_KEY: u32 = 0x3FA4_3FA4;

/// Undoes (or applies) the whole-file XOR in place.
pub fn xor_file_in_place(data: &mut [u8]) {
    let key_bytes = FILE_XOR_KEY.to_le_bytes();
    let wide_key = u128::from_ne_bytes([
        key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3], //
        key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3], //
        key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3], //
        key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3],
    ]);

    let mut chunks = data.chunks_exact_mut(16);

    for chunk in &mut chunks {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);

        let block = u128::from_ne_bytes(block) ^ wide_key;
        chunk.copy_from_slice(&block.to_ne_bytes());
    }

    // Every chunk started on a multiple of 16, so the tail's key phase starts at zero.
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key_bytes[i % 4];
    }
}

/// The password that every encrypted entry in a texture package uses.
const ENTRY_PASSWORD: [u8; 42] = [
    0x73, 0x2A, 0x63, 0x7D, 0x5F, 0x0A, 0xA6, 0xBD, 0x7D, 0x65, 0x7E, 0x67, 0x61, 0x2A, 0x7F, 0x7F,
    0x74, 0x61, 0x67, 0x5B, 0x60, 0x70, 0x45, 0x74, 0x5C, 0x22, 0x74, 0x5D, 0x6E, 0x6A, 0x73, 0x41,
    0x77, 0x6E, 0x46, 0x47, 0x77, 0x49, 0x0C, 0x4B, 0x46, 0x6F,
];

/// Size of the encryption header at the start of every encrypted entry.
pub const ENCRYPTION_HEADER_LEN: usize = 12;

/// General purpose flag bit saying that the CRC lives in a trailing data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x8;

/// The PKWARE traditional encryption cipher, keyed with the package password.
#[derive(Clone)]
pub struct ZipCrypto {
    keys: [u32; 3],
}

impl ZipCrypto {
    pub fn new() -> ZipCrypto {
        let mut cipher = ZipCrypto {
            keys: [305_419_896, 591_751_049, 878_082_192],
        };

        for byte in ENTRY_PASSWORD {
            cipher.update_keys(byte);
        }

        cipher
    }

    fn update_keys(&mut self, byte: u8) {
        self.keys[0] = crc32_update(self.keys[0], byte);
        self.keys[1] = self.keys[1]
            .wrapping_add(self.keys[0] & 0xff)
            .wrapping_mul(0x0808_8405)
            .wrapping_add(1);
        self.keys[2] = crc32_update(self.keys[2], (self.keys[1] >> 24) as u8);
    }

    fn key_byte(&self) -> u8 {
        let temp = (self.keys[2] & 0xffff) | 2;
        ((temp.wrapping_mul(temp ^ 1)) >> 8) as u8
    }

    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data {
            let plain = *byte ^ self.key_byte();
            self.update_keys(plain);
            *byte = plain;
        }
    }

    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        for byte in data {
            let plain = *byte;
            *byte = plain ^ self.key_byte();
            self.update_keys(plain);
        }
    }

    /// Decrypts an encrypted entry's data in place, header included.
    ///
    /// Unless the entry uses a data descriptor, the last header byte must equal the top byte of
    /// the entry's CRC. Returns `false` if the data is too short for a header or the check fails,
    /// in which case the data is left partially decrypted.
    pub fn decrypt_entry(data: &mut [u8], crc32: u32, flags: u16) -> bool {
        if data.len() < ENCRYPTION_HEADER_LEN {
            return false;
        }

        let mut cipher = ZipCrypto::new();
        let (header, body) = data.split_at_mut(ENCRYPTION_HEADER_LEN);

        cipher.decrypt_in_place(header);

        let check_byte = header[ENCRYPTION_HEADER_LEN - 1];

        if flags & FLAG_DATA_DESCRIPTOR == 0 && check_byte != (crc32 >> 24) as u8 {
            return false;
        }

        cipher.decrypt_in_place(body);
        true
    }
}

impl Default for ZipCrypto {
    fn default() -> Self {
        ZipCrypto::new()
    }
}
