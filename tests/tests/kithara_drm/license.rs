use std::time::Duration;

use kithara_drm::{
    DecryptorConfig, DecryptorState, DrmErrorCode, DrmEvent, LicensePolicy, RetryLimit,
    SessionOutcome,
};
use rstest::*;

use crate::common::fixtures::{Harness, ScriptedLicense, WIDEVINE_SYSTEM_ID, cenc, wait_until};

/// `max_attempts` callback invocations at most, failing the first `failures`.
fn harness(failures: usize, max_attempts: u32) -> (ScriptedLicense, Harness) {
    let license = ScriptedLicense::failing_first(failures);
    let policy = LicensePolicy::default()
        .with_retry(RetryLimit::Count(max_attempts - 1))
        .with_base_delay(Duration::from_millis(50));
    let harness = Harness::new(
        DecryptorConfig::default().with_key_system(license.option("widevine").with_license(policy)),
    );
    (license, harness)
}

#[rstest]
#[case::first_try(0, 1)]
#[case::one_retry(1, 2)]
#[case::last_attempt(2, 3)]
#[case::spare_attempts(1, 5)]
#[tokio::test(start_paused = true)]
async fn fewer_failures_than_attempts_succeed(#[case] failures: usize, #[case] max_attempts: u32) {
    let (license, mut harness) = harness(failures, max_attempts);
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"kid")]))
        .unwrap();
    harness.next_ready().await;

    assert_eq!(license.calls(), failures + 1);
    assert_eq!(harness.cdm.sessions()[0].update_count(), 1);
    let warnings = harness
        .drain()
        .into_iter()
        .filter(|e| matches!(e, DrmEvent::Warning(i) if i.code == DrmErrorCode::KeyLoadError))
        .count();
    assert_eq!(warnings, failures);
}

#[rstest]
#[case::no_retry_allowed(1, 1)]
#[case::exactly_exhausted(3, 3)]
#[case::more_failures_than_attempts(6, 3)]
#[tokio::test(start_paused = true)]
async fn exhausted_attempts_report_last_failure(#[case] failures: usize, #[case] max_attempts: u32) {
    let (license, mut harness) = harness(failures, max_attempts);
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"kid")]))
        .unwrap();
    let DrmEvent::Error(issue) = harness
        .next_event(|e| matches!(e, DrmEvent::Error(_)))
        .await
    else {
        unreachable!();
    };

    assert_eq!(license.calls(), max_attempts as usize);
    assert_eq!(issue.code, DrmErrorCode::KeyLoadError);
    assert_eq!(issue.message, format!("failure #{max_attempts}"));
    assert!(!issue.fatal);
    assert_eq!(harness.cdm.sessions()[0].update_count(), 0);
    assert_eq!(harness.decryptor.state(), DecryptorState::ReadyForContent);
}

#[tokio::test]
async fn ignored_license_raises_nothing() {
    let license = ScriptedLicense::ignoring();
    let mut harness =
        Harness::new(DecryptorConfig::default().with_key_system(license.option("widevine")));
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"kid")]))
        .unwrap();
    wait_until(|| license.calls() == 1).await;
    harness.decryptor.dispose().await;

    assert_eq!(harness.cdm.sessions()[0].update_count(), 0);
    assert!(harness.drain().iter().all(|e| !matches!(
        e,
        DrmEvent::Error(_) | DrmEvent::Warning(_) | DrmEvent::SessionReady { .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn ignored_license_then_same_init_data_keeps_one_session() {
    let license = ScriptedLicense::ignoring();
    let mut harness =
        Harness::new(DecryptorConfig::default().with_key_system(license.option("widevine")));
    harness.attach().await;
    let init_data = cenc(&[(WIDEVINE_SYSTEM_ID, b"kid")]);

    harness
        .decryptor
        .on_initialization_data(init_data.clone())
        .unwrap();
    wait_until(|| license.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.decryptor.on_initialization_data(init_data).unwrap();
    let DrmEvent::SessionReady { outcome, .. } = harness.next_ready().await else {
        unreachable!();
    };

    assert_eq!(outcome, SessionOutcome::LoadedOpenSession);
    assert_eq!(license.calls(), 1);
    let sessions = harness.cdm.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].close_count(), 0);
    assert_eq!(sessions[0].update_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn license_timeout_is_reported_as_timeout() {
    let policy = LicensePolicy::default()
        .with_retry(RetryLimit::Count(0))
        .with_timeout(Duration::from_secs(1));
    let option = kithara_drm::KeySystemOption::new("widevine", |_, _| {
        kithara_drm::LicenseResponse::pending(std::future::pending())
    })
    .with_license(policy);
    let mut harness = Harness::new(DecryptorConfig::default().with_key_system(option));
    harness.attach().await;

    harness
        .decryptor
        .on_initialization_data(cenc(&[(WIDEVINE_SYSTEM_ID, b"kid")]))
        .unwrap();
    let DrmEvent::Error(issue) = harness
        .next_event(|e| matches!(e, DrmEvent::Error(_)))
        .await
    else {
        unreachable!();
    };

    assert_eq!(issue.code, DrmErrorCode::KeyLoadTimeout);
}
