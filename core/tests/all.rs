// Single integration test binary that aggregates all test modules.
// The submodules live in `tests/suite/`; they drive a `/bin/sh` fake verifier.
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;
mod suite;
