use std::{sync::Arc, time::Duration};

use kithara_drm::{
    ContentDecryptor, DecryptorConfig, DecryptorState, DrmError, DrmErrorCode, DrmEvent,
    mock::{FakeCdm, FakeMediaSink, FakePlatform},
};
use rstest::*;

use crate::common::fixtures::{
    Harness, ScriptedLicense, WIDEVINE_SYSTEM_ID, cenc, tracing_setup, within,
};

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn first_negotiable_candidate_wins(_tracing_setup: ()) {
    let license = ScriptedLicense::default();
    let harness = Harness::new(
        DecryptorConfig::default()
            .with_key_system(license.option("playready"))
            .with_key_system(license.option("clearkey"))
            .with_key_system(license.option("widevine")),
    );

    harness.attach().await;

    assert_eq!(harness.decryptor.key_system().as_deref(), Some("org.w3.clearkey"));
    assert!(!harness.platform.requested().contains(&"com.widevine.alpha".to_string()));
}

#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
async fn no_negotiable_candidate_is_fatal() {
    let license = ScriptedLicense::default();
    let mut harness = Harness::new(
        DecryptorConfig::default()
            .with_key_system(license.option("playready"))
            .with_key_system(license.option("fairplay")),
    );

    let DrmEvent::Error(issue) = harness
        .next_event(|e| matches!(e, DrmEvent::Error(_)))
        .await
    else {
        unreachable!();
    };

    assert_eq!(issue.code, DrmErrorCode::IncompatibleKeySystems);
    assert!(issue.fatal);
    assert_eq!(harness.decryptor.state(), DecryptorState::Error);
    assert!(harness.decryptor.on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"a")])).is_err());
}

#[tokio::test(start_paused = true)]
async fn attach_waits_for_negotiation() {
    let cdm = FakeCdm::new();
    let platform = Arc::new(
        FakePlatform::new(cdm.clone(), ["com.widevine.alpha"])
            .with_negotiation_delay(Duration::from_secs(2)),
    );
    let decryptor = ContentDecryptor::new(
        DecryptorConfig::default().with_key_system(ScriptedLicense::default().option("widevine")),
        platform,
    );
    assert_eq!(decryptor.state(), DecryptorState::Uninitialized);

    within(decryptor.attach(Arc::new(FakeMediaSink::new()))).await.unwrap();

    assert_eq!(decryptor.state(), DecryptorState::ReadyForContent);
}

#[tokio::test]
async fn state_changes_are_published_in_order() {
    let mut harness = Harness::new(
        DecryptorConfig::default().with_key_system(ScriptedLicense::default().option("widevine")),
    );
    harness.attach().await;
    harness.decryptor.dispose().await;

    let states: Vec<DecryptorState> = harness
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            DrmEvent::StateChange(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            DecryptorState::WaitingForAttachment,
            DecryptorState::Attaching,
            DecryptorState::ReadyForContent,
            DecryptorState::Disposed,
        ]
    );
}

#[tokio::test]
async fn init_data_queued_before_attach_is_processed_in_order() {
    let license = ScriptedLicense::default();
    let mut harness =
        Harness::new(DecryptorConfig::default().with_key_system(license.option("widevine")));

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"first")]))
        .unwrap();
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"second")]))
        .unwrap();
    assert!(harness.cdm.sessions().is_empty());

    harness.attach().await;
    harness.next_ready().await;
    harness.next_ready().await;

    assert_eq!(harness.cdm.sessions().len(), 2);
    assert_eq!(license.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn dispose_mid_negotiation_does_not_hang() {
    let platform = Arc::new(
        FakePlatform::new(FakeCdm::new(), ["com.widevine.alpha"])
            .with_negotiation_delay(Duration::from_secs(60)),
    );
    let decryptor = ContentDecryptor::new(
        DecryptorConfig::default().with_key_system(ScriptedLicense::default().option("widevine")),
        platform,
    );

    within(decryptor.dispose()).await;

    assert_eq!(decryptor.state(), DecryptorState::Disposed);
    assert!(matches!(
        decryptor.attach(Arc::new(FakeMediaSink::new())).await,
        Err(DrmError::Disposed)
    ));
}

#[tokio::test(start_paused = true)]
async fn dispose_with_stuck_cdm_is_bounded() {
    let license = ScriptedLicense::default();
    let mut harness =
        Harness::new(DecryptorConfig::default().with_key_system(license.option("widevine")));
    harness.attach().await;
    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"a")]))
        .unwrap();
    harness.next_ready().await;
    harness
        .cdm
        .configure(|b| b.close = kithara_drm::mock::CloseBehavior::HangWithoutClosing);

    let started = tokio::time::Instant::now();
    within(harness.decryptor.dispose()).await;

    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(harness.decryptor.state(), DecryptorState::Disposed);
}
