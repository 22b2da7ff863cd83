use std::{sync::Arc, time::Duration};

use kithara_drm::{
    DecryptorConfig, DrmEvent, JsonFileStorage, KeySystemOption, PersistentStorage,
    SessionOutcome, SessionType, mock::FakeCdm, mock::SessionCall,
};
use rstest::*;
use tempfile::TempDir;

use crate::common::fixtures::{Harness, ScriptedLicense, WIDEVINE_SYSTEM_ID, cenc, temp_dir};

fn persistent_option(license: &ScriptedLicense, storage: Arc<dyn PersistentStorage>) -> KeySystemOption {
    license
        .option("widevine")
        .with_persistent_license(true)
        .with_persistent_storage(storage)
}

/// First run: license a persistent session and record it in `dir`.
async fn first_run(cdm: &FakeCdm, dir: &TempDir) -> String {
    let license = ScriptedLicense::default();
    let storage: Arc<dyn PersistentStorage> =
        Arc::new(JsonFileStorage::new(dir.path().join("sessions.json")));
    let mut harness = Harness::with_cdm(
        cdm.clone(),
        DecryptorConfig::default().with_key_system(persistent_option(&license, Arc::clone(&storage))),
    );
    harness.attach().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"movie")]))
        .unwrap();
    let DrmEvent::SessionReady { session_id, outcome } = harness.next_ready().await else {
        unreachable!();
    };
    assert_eq!(outcome, SessionOutcome::Created);
    assert_eq!(license.calls(), 1);
    assert_eq!(harness.cdm.sessions()[0].session_type(), SessionType::PersistentLicense);

    let persisted = storage.load().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].session_id, session_id);
    assert_eq!(persisted[0].key_ids, vec![hex::encode(b"movie")]);

    harness.decryptor.dispose().await;
    session_id
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn persisted_session_is_loaded_on_next_run(temp_dir: TempDir) {
    let cdm = FakeCdm::new();
    let session_id = first_run(&cdm, &temp_dir).await;

    let license = ScriptedLicense::default();
    let storage = Arc::new(JsonFileStorage::new(temp_dir.path().join("sessions.json")));
    let mut harness = Harness::with_cdm(
        cdm.clone(),
        DecryptorConfig::default().with_key_system(persistent_option(&license, storage)),
    );
    harness.attach().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"movie")]))
        .unwrap();
    let DrmEvent::SessionReady {
        session_id: loaded_id,
        outcome,
    } = harness.next_ready().await
    else {
        unreachable!();
    };

    assert_eq!(outcome, SessionOutcome::LoadedPersistentSession);
    assert_eq!(loaded_id, session_id);
    assert_eq!(license.calls(), 0);
    assert_eq!(cdm.sessions()[1].calls(), vec![SessionCall::Load(session_id)]);
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn session_unknown_to_cdm_is_replaced_without_close(temp_dir: TempDir) {
    let cdm = FakeCdm::new();
    let stale_id = first_run(&cdm, &temp_dir).await;
    cdm.forget_session(&stale_id);

    let license = ScriptedLicense::default();
    let storage: Arc<dyn PersistentStorage> =
        Arc::new(JsonFileStorage::new(temp_dir.path().join("sessions.json")));
    let mut harness = Harness::with_cdm(
        cdm.clone(),
        DecryptorConfig::default().with_key_system(persistent_option(&license, Arc::clone(&storage))),
    );
    harness.attach().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"movie")]))
        .unwrap();
    let DrmEvent::SessionReady { session_id, outcome } = harness.next_ready().await else {
        unreachable!();
    };

    assert_eq!(outcome, SessionOutcome::Created);
    assert_ne!(session_id, stale_id);
    assert_eq!(license.calls(), 1);
    let orphan = &cdm.sessions()[1];
    assert_eq!(orphan.calls(), vec![SessionCall::Load(stale_id)]);
    assert_eq!(orphan.close_count(), 0);
    let persisted = storage.load().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].session_id, session_id);
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn persistent_license_without_storage_still_plays() {
    let license = ScriptedLicense::default();
    let mut harness = Harness::new(
        DecryptorConfig::default()
            .with_key_system(license.option("widevine").with_persistent_license(true)),
    );
    harness.attach().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"movie")]))
        .unwrap();
    harness.next_ready().await;

    assert!(harness.decryptor.persistent_sessions().is_none());
    assert_eq!(license.calls(), 1);
}
