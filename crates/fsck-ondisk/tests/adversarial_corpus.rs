#![forbid(unsafe_code)]

use fsck_ondisk::{
    CryptoStateVal, DstreamIdVal, DstreamStats, FileExtentVal, KeyError, KeyFormat, OmapVal,
    PhysExtVal, RecordType, decode_key, hash_name, validate_object, verify_checksum,
};
use fsck_types::{BlockSize, OBJ_TYPE_SHIFT, ObjectId, VolumeConfig, Xid};
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use proptest::test_runner::TestRunner;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    wrong_size: u32,
    missing_terminator: u32,
    name_length: u32,
    size_mismatch: u32,
    hash_mismatch: u32,
    invalid_utf8: u32,
    zero_xid: u32,
    unknown_type: u32,
    parse: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &KeyError) {
        match err {
            KeyError::WrongSize { .. } => self.wrong_size += 1,
            KeyError::MissingTerminator { .. } => self.missing_terminator += 1,
            KeyError::NameLengthMismatch { .. } => self.name_length += 1,
            KeyError::SizeMismatch { .. } => self.size_mismatch += 1,
            KeyError::HashMismatch { .. } => self.hash_mismatch += 1,
            KeyError::InvalidUtf8 => self.invalid_utf8 += 1,
            KeyError::ZeroXid => self.zero_xid += 1,
            KeyError::UnknownRecordType(_) => self.unknown_type += 1,
            KeyError::Parse(_) => self.parse += 1,
        }
    }
}

/// Draw one value from `strategy` on the deterministic runner, so the
/// corpus is identical on every run.
fn sample<S: Strategy>(runner: &mut TestRunner, strategy: S) -> S::Value {
    strategy
        .new_tree(runner)
        .expect("strategy produces a value")
        .current()
}

fn header(id: u64, record_type: u8) -> Vec<u8> {
    (id | (u64::from(record_type) << OBJ_TYPE_SHIFT))
        .to_le_bytes()
        .to_vec()
}

fn valid_drec(name: &str) -> Vec<u8> {
    let mut raw = header(0x400, RecordType::DirRec.raw());
    raw.extend_from_slice(&hash_name(name, false).to_le_bytes());
    raw.extend_from_slice(name.as_bytes());
    raw.push(0);
    raw
}

fn valid_xattr(name: &str) -> Vec<u8> {
    let mut raw = header(0x400, RecordType::Xattr.raw());
    let len = u16::try_from(name.len() + 1).expect("name length");
    raw.extend_from_slice(&len.to_le_bytes());
    raw.extend_from_slice(name.as_bytes());
    raw.push(0);
    raw
}

/// Seed keys plus mutations: truncations, extensions, byte flips and
/// random record types.
fn key_corpus() -> Vec<(String, Vec<u8>)> {
    let seeds = [
        ("drec", valid_drec("document.txt")),
        ("drec_unicode", valid_drec("r\u{e9}sum\u{e9}.pdf")),
        ("xattr", valid_xattr("com.apple.quarantine")),
        ("inode", header(0x400, RecordType::Inode.raw())),
        ("file_extent", {
            let mut raw = header(0x400, RecordType::FileExtent.raw());
            raw.extend_from_slice(&4096_u64.to_le_bytes());
            raw
        }),
    ];

    let mut runner = TestRunner::deterministic();
    let mut out = Vec::new();
    for (name, seed) in &seeds {
        out.push(((*name).to_owned(), seed.clone()));
        for cut in 0..seed.len() {
            out.push((format!("{name}_trunc_{cut}"), seed[..cut].to_vec()));
        }
        for extra in 1..4_u8 {
            let mut grown = seed.clone();
            grown.extend(std::iter::repeat_n(extra, usize::from(extra)));
            out.push((format!("{name}_grow_{extra}"), grown));
        }
        let flips = sample(
            &mut runner,
            prop::collection::vec((0..seed.len(), 1..=u8::MAX), 64),
        );
        for (round, (idx, mask)) in flips.into_iter().enumerate() {
            let mut mutated = seed.clone();
            mutated[idx] ^= mask;
            out.push((format!("{name}_flip_{round}"), mutated));
        }
    }
    let randoms = sample(
        &mut runner,
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 64),
    );
    for (round, raw) in randoms.into_iter().enumerate() {
        out.push((format!("random_{round}"), raw));
    }
    out
}

#[test]
fn malformed_keys_never_panic() {
    let mut coverage = ErrorCoverage::default();
    let mut accepted = 0_u32;

    for (name, raw) in key_corpus() {
        for format in [KeyFormat::Catalog, KeyFormat::ObjectMap] {
            for fold in [false, true] {
                let result = catch_unwind(AssertUnwindSafe(|| decode_key(format, &raw, fold)));
                match result {
                    Ok(Ok(_)) => accepted += 1,
                    Ok(Err(err)) => coverage.observe(&err),
                    Err(_) => panic!("decode_key panicked on sample {name} ({format:?})"),
                }
            }
        }
    }

    assert!(accepted > 0, "no sample decoded: {coverage:?}");
    assert!(coverage.wrong_size > 0, "{coverage:?}");
    assert!(coverage.missing_terminator > 0, "{coverage:?}");
    assert!(coverage.hash_mismatch > 0, "{coverage:?}");
    assert!(coverage.unknown_type > 0, "{coverage:?}");
    assert!(coverage.name_length + coverage.size_mismatch > 0, "{coverage:?}");
}

#[test]
fn flipped_name_bytes_never_decode_silently() {
    let seed = valid_drec("notes.md");
    for idx in 12..seed.len() - 1 {
        for bit in 0..8 {
            let mut raw = seed.clone();
            raw[idx] ^= 1 << bit;
            let decoded = decode_key(KeyFormat::Catalog, &raw, false);
            if let Ok(key) = decoded {
                // A flip can only succeed by producing a different, self-consistent
                // name whose hash happens to collide.
                assert_ne!(key.name, Some(&b"notes.md"[..]), "byte {idx} bit {bit}");
            }
        }
    }
}

#[test]
fn every_value_parser_rejects_short_input() {
    let bs = BlockSize::new(4096).expect("block size");
    for raw in [&[][..], &[0_u8; 3][..]] {
        assert!(FileExtentVal::parse(raw, bs).is_err());
        assert!(DstreamIdVal::parse(raw).is_err());
        assert!(PhysExtVal::parse(raw).is_err());
        assert!(CryptoStateVal::parse(raw).is_err());
        assert!(DstreamStats::parse(raw).is_err());
        assert!(OmapVal::parse(raw).is_err());
    }
}

#[test]
fn short_blocks_fail_validation() {
    let config = VolumeConfig::new(BlockSize::new(4096).expect("bs"), Xid(100), false);
    for len in [0_usize, 8, 31, 32, 4095] {
        let block = vec![0_u8; len];
        assert!(validate_object(&block, ObjectId(0x400), None, &config).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn malformed_values_never_panic(raw in prop::collection::vec(any::<u8>(), 0..64)) {
        let bs = BlockSize::new(4096).expect("block size");
        let _ = FileExtentVal::parse(&raw, bs);
        let _ = DstreamIdVal::parse(&raw);
        let _ = PhysExtVal::parse(&raw);
        let _ = CryptoStateVal::parse(&raw);
        let _ = DstreamStats::parse(&raw);
        let _ = OmapVal::parse(&raw);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn garbage_blocks_fail_validation(block in prop::collection::vec(any::<u8>(), 4096)) {
        let config = VolumeConfig::new(BlockSize::new(4096).expect("bs"), Xid(100), false);
        let oid = ObjectId(u64::from_le_bytes(block[8..16].try_into().expect("oid")));

        prop_assert!(!verify_checksum(&block), "random block passed its checksum");
        prop_assert!(validate_object(&block, oid, None, &config).is_err());
    }
}
