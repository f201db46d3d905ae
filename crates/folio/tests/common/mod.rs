//! Shared test utilities for folio integration tests.
//!
//! - `TestHarness`: a `Folio` over an in-memory database and a temp object store
//! - builders for synthetic scans and a scripted inference double

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
