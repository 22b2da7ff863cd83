//! Integration test crate for `kithara-drm`; the tests live under `tests/`.
