use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use kithara_drm::{
    ContentDecryptor, DecryptorConfig, DrmEvent, InitData, InitDataValue, KeySystemOption,
    LicenseError, LicenseResponse, MessageType,
    mock::{FakeCdm, FakeMediaSink, FakePlatform},
};
use rstest::*;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const WIDEVINE_SYSTEM_ID: &str = "edef8ba979d64acea3c827dcd51d21ed";
pub const PLAYREADY_SYSTEM_ID: &str = "9a04f07998404286ab92e65be0885f95";

/// Common fixture for temporary directory
#[fixture]
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

#[fixture]
pub fn tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default()
                .add_directive("kithara_drm=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// `cenc` initialization data with one value per `(system id, payload)`.
pub fn cenc<D: AsRef<[u8]>>(values: &[(&str, D)]) -> InitData {
    InitData::new(
        "cenc",
        values
            .iter()
            .map(|(system_id, data)| {
                InitDataValue::with_system_id(*system_id, data.as_ref().to_vec())
            })
            .collect(),
    )
}

/// License callback answering from a script, then with the challenge
/// itself once the script is exhausted.
#[derive(Clone, Default)]
pub struct ScriptedLicense {
    calls: Arc<AtomicUsize>,
    failures_first: usize,
    ignore: bool,
}

impl ScriptedLicense {
    /// Fail the first `count` calls with a numbered message.
    pub fn failing_first(count: usize) -> Self {
        Self {
            failures_first: count,
            ..Self::default()
        }
    }

    pub fn ignoring() -> Self {
        Self {
            ignore: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn option(&self, key_system: &str) -> KeySystemOption {
        let script = self.clone();
        KeySystemOption::new(key_system, move |challenge: Bytes, _: MessageType| {
            let n = script.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= script.failures_first {
                return LicenseResponse::failed(LicenseError::new(format!("failure #{n}")));
            }
            if script.ignore {
                return LicenseResponse::ignore();
            }
            LicenseResponse::pending(async move { Ok(Some(challenge)) })
        })
    }
}

pub struct Harness {
    pub cdm: FakeCdm,
    pub platform: Arc<FakePlatform>,
    pub decryptor: ContentDecryptor,
    pub sink: Arc<FakeMediaSink>,
    pub events: broadcast::Receiver<DrmEvent>,
    skipped: Vec<DrmEvent>,
}

impl Harness {
    pub fn new(config: DecryptorConfig) -> Self {
        Self::with_cdm(FakeCdm::new(), config)
    }

    pub fn with_cdm(cdm: FakeCdm, config: DecryptorConfig) -> Self {
        let platform = Arc::new(FakePlatform::new(
            cdm.clone(),
            ["com.widevine.alpha", "org.w3.clearkey"],
        ));
        let decryptor = ContentDecryptor::new(
            config.with_event_channel_capacity(256usize),
            Arc::clone(&platform) as _,
        );
        let events = decryptor.subscribe();
        Self {
            cdm,
            platform,
            decryptor,
            sink: Arc::new(FakeMediaSink::new()),
            events,
            skipped: Vec::new(),
        }
    }

    pub async fn attach(&self) {
        self.decryptor
            .attach(Arc::clone(&self.sink) as _)
            .await
            .unwrap();
    }

    /// Next event matching `predicate`. The others are kept for [`Self::drain`].
    pub async fn next_event<F>(&mut self, predicate: F) -> DrmEvent
    where
        F: Fn(&DrmEvent) -> bool,
    {
        let events = &mut self.events;
        let skipped = &mut self.skipped;
        within(async {
            loop {
                let event = events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
                skipped.push(event);
            }
        })
        .await
    }

    pub async fn next_ready(&mut self) -> DrmEvent {
        self.next_event(|e| matches!(e, DrmEvent::SessionReady { .. }))
            .await
    }

    /// Events skipped by [`Self::next_event`] plus those pending, without waiting.
    pub fn drain(&mut self) -> Vec<DrmEvent> {
        let mut events = std::mem::take(&mut self.skipped);
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Bound every wait so a regression fails instead of hanging.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
}
