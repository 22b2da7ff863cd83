//! All integration tests for kithara-drm
#![expect(
    clippy::unwrap_used,
    reason = "integration test crate: unwraps are acceptable in test code"
)]

mod common;
mod kithara_drm;
