#![forbid(unsafe_code)]
//! Directory-entry filename hashing.
//!
//! A hashed directory key stores `hash << 10 | len` in one `u32`: the low
//! 22 bits of a CRC-32C over the name's normalized code points, and the raw
//! UTF-8 byte length of the name including its NUL terminator.
//!
//! The CRC is the bare Castagnoli register update: seeded with all ones and
//! never inverted on output. The `crc32c` crate inverts on both sides of
//! `crc32c_append`, so the register is carried inverted across calls and
//! flipped once at the end.

use caseless::Caseless;
use unicode_normalization::UnicodeNormalization;

pub const NAME_HASH_MASK: u32 = 0x003F_FFFF;
pub const NAME_HASH_SHIFT: u32 = 10;
pub const NAME_LEN_MASK: u32 = 0x03FF;

/// Lazily yield the code points that feed the hash: canonical
/// decomposition, after full case folding when `case_fold` is set.
pub fn normalized_code_points(name: &str, case_fold: bool) -> Box<dyn Iterator<Item = char> + '_> {
    if case_fold {
        Box::new(name.chars().default_case_fold().nfd())
    } else {
        Box::new(name.chars().nfd())
    }
}

/// Hash `name` (without its terminator) into the packed hash/length form
/// stored in directory-record keys.
#[must_use]
pub fn hash_name(name: &str, case_fold: bool) -> u32 {
    // crc32c_append(0, ..) is the inverted form of a register seeded with !0.
    let mut inverted = 0_u32;
    for cp in normalized_code_points(name, case_fold) {
        inverted = crc32c::crc32c_append(inverted, &u32::from(cp).to_le_bytes());
    }
    let hash = !inverted;

    ((hash & NAME_HASH_MASK) << NAME_HASH_SHIFT) | (name_len_with_nul(name) & NAME_LEN_MASK)
}

/// Split a packed field into `(hash, len)`.
#[must_use]
pub fn name_hash_len(packed: u32) -> (u32, u32) {
    (packed >> NAME_HASH_SHIFT, packed & NAME_LEN_MASK)
}

#[allow(clippy::cast_possible_truncation)]
fn name_len_with_nul(name: &str) -> u32 {
    // Only the low 10 bits are kept, so wrapping is harmless.
    name.len().wrapping_add(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bitwise CRC-32C register update (reflected polynomial 0x82F63B78),
    /// no pre/post inversion.
    fn reference_crc32c_update(mut crc: u32, data: &[u8]) -> u32 {
        for &byte in data {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0x82F6_3B78
                } else {
                    crc >> 1
                };
            }
        }
        crc
    }

    fn reference_hash(code_points: &[u32], raw_len: u32) -> u32 {
        let mut crc = 0xFFFF_FFFF;
        for cp in code_points {
            crc = reference_crc32c_update(crc, &cp.to_le_bytes());
        }
        ((crc & 0x3F_FFFF) << 10) | (raw_len & 0x3FF)
    }

    #[test]
    fn ascii_name_matches_reference_register() {
        let name = "hello.txt";
        let cps: Vec<u32> = name.chars().map(u32::from).collect();
        assert_eq!(hash_name(name, false), reference_hash(&cps, 10));
    }

    #[test]
    fn length_counts_terminator_and_raw_bytes() {
        let (_, len) = name_hash_len(hash_name("a", false));
        assert_eq!(len, 2);

        // "é" precomposed is 2 UTF-8 bytes; decomposition must not change the length.
        let (_, len) = name_hash_len(hash_name("\u{e9}", false));
        assert_eq!(len, 3);
    }

    #[test]
    fn precomposed_and_decomposed_forms_hash_alike() {
        let precomposed = "caf\u{e9}";
        let decomposed = "cafe\u{301}";
        let (h1, l1) = name_hash_len(hash_name(precomposed, false));
        let (h2, l2) = name_hash_len(hash_name(decomposed, false));
        assert_eq!(h1, h2);
        // Raw lengths differ: 5 vs 6 bytes, plus the terminator.
        assert_eq!(l1, 6);
        assert_eq!(l2, 7);
    }

    #[test]
    fn decomposition_feeds_each_code_point() {
        let cps = [u32::from('e'), 0x301];
        assert_eq!(hash_name("\u{e9}", false), reference_hash(&cps, 3));
    }

    #[test]
    fn case_folding_only_when_requested() {
        let upper = hash_name("README", true);
        let lower = hash_name("readme", true);
        assert_eq!(upper, lower);
        assert_ne!(hash_name("README", false), hash_name("readme", false));
    }

    #[test]
    fn full_case_folding_expands_sharp_s() {
        // U+00DF folds to "ss" under full folding.
        let (h1, _) = name_hash_len(hash_name("stra\u{df}e", true));
        let (h2, _) = name_hash_len(hash_name("strasse", true));
        assert_eq!(h1, h2);
    }

    #[test]
    fn long_names_keep_low_length_bits() {
        let name = "x".repeat(1100);
        let (_, len) = name_hash_len(hash_name(&name, false));
        assert_eq!(len, 1101 & 0x3FF);
    }
}
