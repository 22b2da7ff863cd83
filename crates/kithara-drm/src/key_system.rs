#![forbid(unsafe_code)]

//! Key system candidates and their negotiation with the platform.

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cdm::{
        KeySystemAccess, KeySystemConfiguration, KeySystemPlatform, MediaCapability, Requirement,
        SessionType,
    },
    config::KeySystemOption,
    error::{DrmError, DrmResult},
};

const WIDEVINE: &[&str] = &["com.widevine.alpha"];
const PLAYREADY: &[&str] = &[
    "com.microsoft.playready.recommendation",
    "com.microsoft.playready",
    "com.chromecast.playready",
    "com.youtube.playready",
];
const CLEARKEY: &[&str] = &["webkit-org.w3.clearkey", "org.w3.clearkey"];
const FAIRPLAY: &[&str] = &["com.apple.fps.1_0", "com.apple.fps"];

const WIDEVINE_VIDEO_ROBUSTNESSES: &[&str] = &[
    "HW_SECURE_ALL",
    "HW_SECURE_DECODE",
    "HW_SECURE_CRYPTO",
    "SW_SECURE_DECODE",
    "SW_SECURE_CRYPTO",
];
const WIDEVINE_AUDIO_ROBUSTNESSES: &[&str] =
    &["HW_SECURE_CRYPTO", "SW_SECURE_DECODE", "SW_SECURE_CRYPTO"];
const PLAYREADY_ROBUSTNESSES: &[&str] = &["3000", "2000"];

const VIDEO_CONTENT_TYPES: &[&str] = &[
    r#"video/mp4;codecs="avc1.4d401e""#,
    r#"video/mp4;codecs="avc1.42e01e""#,
    r#"video/webm;codecs="vp8""#,
];
const AUDIO_CONTENT_TYPES: &[&str] = &[
    r#"audio/mp4;codecs="mp4a.40.2""#,
    "audio/webm;codecs=opus",
];

/// Concrete key system identifiers to try, in order, for `name`.
///
/// Unknown names are taken as concrete identifiers.
#[must_use]
pub fn concrete_key_systems(name: &str) -> Vec<String> {
    let known: &[&str] = match name {
        "widevine" => WIDEVINE,
        "playready" => PLAYREADY,
        "clearkey" => CLEARKEY,
        "fairplay" => FAIRPLAY,
        other => return vec![other.to_string()],
    };
    known.iter().map(|s| (*s).to_string()).collect()
}

fn default_robustnesses(key_system: &str, video: bool) -> Vec<String> {
    let ladder: &[&str] = if key_system == "com.widevine.alpha" {
        if video {
            WIDEVINE_VIDEO_ROBUSTNESSES
        } else {
            WIDEVINE_AUDIO_ROBUSTNESSES
        }
    } else if key_system == "com.microsoft.playready.recommendation" {
        PLAYREADY_ROBUSTNESSES
    } else {
        &[]
    };
    ladder.iter().map(|s| (*s).to_string()).collect()
}

fn capabilities(content_types: &[&str], robustnesses: &[String]) -> Vec<MediaCapability> {
    if robustnesses.is_empty() {
        return content_types
            .iter()
            .map(|c| MediaCapability::new(*c, ""))
            .collect();
    }
    robustnesses
        .iter()
        .flat_map(|r| content_types.iter().map(move |c| MediaCapability::new(*c, r.as_str())))
        .collect()
}

/// Configurations offered for `key_system`, preferred first.
///
/// The first asks for the robustness ladder; the second drops robustness
/// requirements for platforms that reject them.
#[must_use]
pub fn build_configurations(key_system: &str, option: &KeySystemOption) -> Vec<KeySystemConfiguration> {
    let mut session_types = vec![SessionType::Temporary];
    if option.persistent_license {
        session_types.push(SessionType::PersistentLicense);
    }
    let persistent_state = if option.persistent_license {
        Requirement::Required
    } else {
        Requirement::Optional
    };
    let distinctive_identifier = if option.distinctive_identifier_required {
        Requirement::Required
    } else {
        Requirement::Optional
    };

    let video_robustnesses = option
        .video_robustnesses
        .clone()
        .unwrap_or_else(|| default_robustnesses(key_system, true));
    let audio_robustnesses = option
        .audio_robustnesses
        .clone()
        .unwrap_or_else(|| default_robustnesses(key_system, false));

    let base = KeySystemConfiguration {
        init_data_types: vec!["cenc".to_string()],
        session_types,
        persistent_state,
        distinctive_identifier,
        video_capabilities: capabilities(VIDEO_CONTENT_TYPES, &[]),
        audio_capabilities: capabilities(AUDIO_CONTENT_TYPES, &[]),
    };
    if video_robustnesses.is_empty() && audio_robustnesses.is_empty() {
        return vec![base];
    }

    let with_robustness = KeySystemConfiguration {
        video_capabilities: capabilities(VIDEO_CONTENT_TYPES, &video_robustnesses),
        audio_capabilities: capabilities(AUDIO_CONTENT_TYPES, &audio_robustnesses),
        ..base.clone()
    };
    vec![with_robustness, base]
}

/// Winner of the negotiation.
#[derive(Clone)]
pub struct NegotiatedKeySystem {
    /// Index of the winning candidate in the configured list.
    pub option_index: usize,
    /// Concrete identifier that was accepted.
    pub key_system: String,
    pub access: Arc<dyn KeySystemAccess>,
}

impl fmt::Debug for NegotiatedKeySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedKeySystem")
            .field("option_index", &self.option_index)
            .field("key_system", &self.key_system)
            .finish_non_exhaustive()
    }
}

/// Try every candidate in order until the platform grants access.
///
/// # Errors
///
/// [`DrmError::IncompatibleKeySystems`] listing every concrete identifier
/// tried, or [`DrmError::Cancelled`].
pub async fn negotiate(
    platform: &dyn KeySystemPlatform,
    options: &[KeySystemOption],
    cancel: &CancellationToken,
) -> DrmResult<NegotiatedKeySystem> {
    let mut tried = Vec::new();
    for (option_index, option) in options.iter().enumerate() {
        for key_system in concrete_key_systems(&option.key_system) {
            let configurations = build_configurations(&key_system, option);
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DrmError::Cancelled),
                result = platform.request_key_system_access(&key_system, &configurations) => result,
            };
            match result {
                Ok(access) => {
                    info!(%key_system, option_index, "key system negotiated");
                    return Ok(NegotiatedKeySystem {
                        option_index,
                        key_system,
                        access,
                    });
                }
                Err(e) => {
                    debug!(%key_system, %e, "key system not available");
                    tried.push(key_system);
                }
            }
        }
    }
    Err(DrmError::IncompatibleKeySystems { tried })
}
