// Property tests for artifact integrity checking

use proptest::prelude::*;
use proptest::test_runner::TestRunner;
use serde_json::json;
use std::sync::Arc;
use tablevault::artifact::{ArtifactStore, MemoryArtifactStore};
use tablevault::codec::{EncryptionKey, IntegrityCodec, StandardCodec};
use tablevault::config::{EngineConfig, StaticKeyProvider};
use tablevault::engine::BackupEngine;
use tablevault::ledger::{BackupRun, RunStatus};
use tablevault::policy::{BackupKind, BackupPolicy};
use tablevault::table::{MemoryTableStore, Row};
use tablevault::ErrorKind;

async fn backed_up(compress: bool, encrypt: bool) -> (BackupEngine, MemoryArtifactStore, BackupRun) {
    let tables = Arc::new(MemoryTableStore::new("id"));
    let rows = (0..40).map(|id| {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("payload".into(), json!("x".repeat(id as usize)));
        row
    });
    tables.upsert_rows("events", rows).unwrap();

    let artifacts = MemoryArtifactStore::new();
    let engine = BackupEngine::builder(EngineConfig::default())
        .table_store(tables)
        .artifact_store(Arc::new(artifacts.clone()))
        .key_provider(Arc::new(StaticKeyProvider::new(EncryptionKey::generate())))
        .build()
        .await
        .unwrap();
    engine
        .upsert_policy(
            BackupPolicy::new("p", "Events", BackupKind::Full, ["events"])
                .with_compression(compress)
                .with_encryption(encrypt),
        )
        .unwrap();
    let run = engine.trigger_backup("p").await.unwrap();
    (engine, artifacts, run)
}

fn check_single_byte_flips(compress: bool, encrypt: bool) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, artifacts, run) = rt.block_on(backed_up(compress, encrypt));
    let artifact = run.artifact_ref.clone().unwrap();
    let original = rt.block_on(artifacts.get(&artifact)).unwrap();

    let mut runner = TestRunner::new(ProptestConfig::with_cases(48));
    runner
        .run(&(0..original.len(), 1u8..=255), |(index, mask)| {
            rt.block_on(artifacts.put(&artifact, original.clone())).unwrap();
            artifacts.tamper(&artifact, |data| data[index] ^= mask);

            let valid = rt.block_on(engine.verify_integrity(&run.id)).unwrap();
            prop_assert!(!valid);

            let restore = rt.block_on(engine.trigger_restore(&run.id, None)).unwrap();
            prop_assert_eq!(restore.status, RunStatus::Failed);
            prop_assert_eq!(restore.error_kind, Some(ErrorKind::IntegrityCheckFailed));
            Ok(())
        })
        .unwrap();

    rt.block_on(artifacts.put(&artifact, original)).unwrap();
    assert!(rt.block_on(engine.verify_integrity(&run.id)).unwrap());
}

#[test]
fn test_flipped_byte_in_plain_artifact_is_detected() {
    check_single_byte_flips(false, false);
}

#[test]
fn test_flipped_byte_in_compressed_encrypted_artifact_is_detected() {
    check_single_byte_flips(true, true);
}

proptest! {
    #[test]
    fn test_checksum_changes_with_any_single_byte(
        data in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let codec = StandardCodec::new();
        let mut tampered = data.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= mask;

        prop_assert_ne!(codec.checksum(&data), codec.checksum(&tampered));
        prop_assert_eq!(codec.checksum(&data), codec.checksum(&data.clone()));
    }

    #[test]
    fn test_compression_round_trips(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let codec = StandardCodec::new();
        let compressed = codec.compress(&data).unwrap();
        prop_assert_eq!(codec.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_encryption_round_trips_and_hides_plaintext(
        data in prop::collection::vec(any::<u8>(), 16..1024),
    ) {
        let codec = StandardCodec::new();
        let key = EncryptionKey::generate();
        let sealed = codec.encrypt(&data, &key).unwrap();
        prop_assert_ne!(&sealed, &data);
        prop_assert_eq!(codec.decrypt(&sealed, &key).unwrap(), data);
    }
}
