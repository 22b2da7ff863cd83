use std::time::Duration;

use bytes::Bytes;
use kithara_drm::{
    DecryptorConfig, DrmErrorCode, DrmEvent, KeyId, KeyStatus, KeySystemOption, LicenseResponse,
    SessionOutcome, mock::SessionCall,
};
use rstest::*;

use crate::common::fixtures::{
    Harness, PLAYREADY_SYSTEM_ID, ScriptedLicense, WIDEVINE_SYSTEM_ID, cenc, wait_until,
};

fn harness(license: &ScriptedLicense) -> Harness {
    Harness::new(DecryptorConfig::default().with_key_system(license.option("widevine")))
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn reordered_multi_value_init_data_shares_one_session() {
    let license = ScriptedLicense::default();
    let mut harness = harness(&license);
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"wv"), (PLAYREADY_SYSTEM_ID, b"pr")]))
        .unwrap();
    harness
        .decryptor
        .on_initialization_data(cenc(&[(PLAYREADY_SYSTEM_ID, b"pr"), (WIDEVINE_SYSTEM_ID, b"wv")]))
        .unwrap();
    harness.next_ready().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(PLAYREADY_SYSTEM_ID, b"pr"), (WIDEVINE_SYSTEM_ID, b"wv")]))
        .unwrap();
    let again = harness.next_ready().await;

    assert!(matches!(
        again,
        DrmEvent::SessionReady {
            outcome: SessionOutcome::LoadedOpenSession,
            ..
        }
    ));
    assert_eq!(harness.cdm.sessions().len(), 1);
    assert_eq!(license.calls(), 1);
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn same_bytes_under_different_system_ids_are_distinct() {
    let license = ScriptedLicense::default();
    let mut harness = harness(&license);
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"same")]))
        .unwrap();
    harness
        .decryptor
        .on_initialization_data(cenc(&[(PLAYREADY_SYSTEM_ID, b"same")]))
        .unwrap();
    harness.next_ready().await;
    harness.next_ready().await;

    assert_eq!(harness.cdm.sessions().len(), 2);
    assert_eq!(license.calls(), 2);
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(9)]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn one_session_per_incompatible_record(#[case] count: u8) {
    let license = ScriptedLicense::default();
    let mut harness = harness(&license);
    harness.attach().await;

    for n in 0..count {
        harness
            .decryptor
            .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, &[n; 4])]))
            .unwrap();
    }
    for _ in 0..count {
        harness.next_ready().await;
    }

    assert_eq!(harness.cdm.sessions().len(), usize::from(count));
    assert_eq!(harness.decryptor.sessions().len(), usize::from(count));
}

#[tokio::test]
async fn least_recently_used_session_is_evicted() {
    let license = ScriptedLicense::default();
    let mut harness = Harness::new(
        DecryptorConfig::default()
            .with_key_system(license.option("widevine"))
            .with_max_simultaneous_sessions(2usize),
    );
    harness.attach().await;

    for payload in [b"a", b"b"] {
        harness
            .decryptor
            .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, payload)]))
            .unwrap();
        harness.next_ready().await;
    }
    // Touch "a" so that "b" becomes the oldest.
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"a")]))
        .unwrap();
    harness.next_ready().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"c")]))
        .unwrap();
    harness.next_ready().await;

    let sessions = harness.cdm.sessions();
    assert_eq!(sessions.len(), 3);
    assert!(!sessions[0].is_closed());
    assert!(sessions[1].is_closed());
    assert_eq!(harness.decryptor.sessions().len(), 2);
}

#[tokio::test]
async fn sessions_mid_negotiation_are_never_evicted() {
    let option = KeySystemOption::new("widevine", |challenge: Bytes, _| {
        if challenge.as_ref() == b"slow" {
            LicenseResponse::pending(std::future::pending())
        } else {
            LicenseResponse::license(challenge)
        }
    });
    let mut harness = Harness::new(
        DecryptorConfig::default()
            .with_key_system(option)
            .with_max_simultaneous_sessions(1usize),
    );
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"slow")]))
        .unwrap();
    let cdm = harness.cdm.clone();
    wait_until(|| {
        cdm.sessions()
            .first()
            .is_some_and(|s| !s.calls().is_empty())
    })
    .await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"fast")]))
        .unwrap();
    let DrmEvent::Warning(issue) = harness
        .next_event(|e| matches!(e, DrmEvent::Warning(_)))
        .await
    else {
        unreachable!();
    };

    assert_eq!(issue.code, DrmErrorCode::NoSessionCapacity);
    assert_eq!(harness.cdm.sessions().len(), 1);
    assert!(!harness.cdm.sessions()[0].is_closed());
    harness.decryptor.dispose().await;
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn license_payload_is_applied_exactly_once() {
    let license = ScriptedLicense::default();
    let mut harness = harness(&license);
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"payload")]))
        .unwrap();
    harness.next_ready().await;

    let session = &harness.cdm.sessions()[0];
    assert_eq!(
        session
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SessionCall::Update(_)))
            .collect::<Vec<_>>(),
        vec![SessionCall::Update(Bytes::from_static(b"payload"))]
    );
    assert_eq!(license.calls(), 1);
}

#[tokio::test]
async fn output_restricted_keys_are_blacklisted_not_fatal() {
    let license = ScriptedLicense::default();
    let mut harness = harness(&license);
    harness
        .cdm
        .configure(|b| b.update_statuses = Some(vec![KeyStatus::OutputRestricted]));
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"hdcp")]))
        .unwrap();
    let DrmEvent::KeysBlacklisted { key_ids } = harness
        .next_event(|e| matches!(e, DrmEvent::KeysBlacklisted { .. }))
        .await
    else {
        unreachable!();
    };

    assert_eq!(key_ids, vec![KeyId::new(Bytes::from_static(b"hdcp"))]);
    assert!(!harness.cdm.sessions()[0].is_closed());
    assert!(
        harness
            .drain()
            .iter()
            .all(|e| !matches!(e, DrmEvent::Error(_)))
    );
}
