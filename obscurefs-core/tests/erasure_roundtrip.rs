//! Property tests for the erasure codec

use bytes::Bytes;
use obscurefs_core::{ContentId, ErasureCodec, ErasureConfig, ErrorKind, Metadata};
use proptest::prelude::*;
use tempfile::TempDir;

fn positional(
    meta: &Metadata,
    shards: &std::collections::HashMap<ContentId, Bytes>,
) -> Vec<Option<Bytes>> {
    meta.parts.iter().map(|id| shards.get(id).cloned()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn decode_restores_checksum(
        data in proptest::collection::vec(any::<u8>(), 0..20_000),
        k in 1usize..8,
        m in 1usize..5,
    ) {
        let dir = TempDir::new().unwrap();
        let codec = ErasureCodec::new(ErasureConfig::new(k, m).unwrap())
            .unwrap()
            .with_output_dir(dir.path());

        let mut meta = Metadata::for_data("prop.bin", &data);
        let shards = codec.encode(&mut meta, &data).unwrap();
        prop_assert_eq!(meta.parts.len(), k + m);

        let path = codec.decode(&meta, positional(&meta, &shards)).unwrap();
        let decoded = std::fs::read(path).unwrap();
        prop_assert_eq!(ContentId::from_data(&decoded), meta.checksum);
    }

    #[test]
    fn tolerates_up_to_parity_losses(
        data in proptest::collection::vec(any::<u8>(), 1..8_000),
        m in 1usize..4,
        seed in any::<u64>(),
    ) {
        let k = 4;
        let codec = ErasureCodec::new(ErasureConfig::new(k, m).unwrap()).unwrap();
        let mut meta = Metadata::for_data("prop.bin", &data);
        let shards = codec.encode(&mut meta, &data).unwrap();
        let mut slots = positional(&meta, &shards);

        // drop m distinct positions chosen from the seed
        let total = k + m;
        let mut dropped = 0;
        let mut cursor = (seed % total as u64) as usize;
        while dropped < m {
            if slots[cursor].is_some() {
                slots[cursor] = None;
                dropped += 1;
            }
            cursor = (cursor + 1) % total;
        }

        let out = codec.reconstruct(&meta, slots.clone()).unwrap();
        prop_assert_eq!(out.as_ref(), data.as_slice());

        // one more loss is beyond repair
        let next = slots.iter().position(|s| s.is_some()).unwrap();
        slots[next] = None;
        let err = codec.reconstruct(&meta, slots).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
