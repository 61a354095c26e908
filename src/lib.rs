//! Purpose: Shared library crate behind the `crossbar` daemon/CLI binary.
//! Exports: `api` (client facades), `core` (codecs, errors), `daemon`.
//! Role: Internal library backing the binary; not yet a stable public SDK.
//! Invariants: Client code goes through `api`; only the binary and tests
//! Invariants: reach into `daemon` directly.
pub mod api;
pub mod core;
pub mod daemon;
