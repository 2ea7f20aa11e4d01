//! Shared test utilities for gradtune-core.
//!
//! Provides a mock measurer with scripted latencies and a small mock
//! catalog, so search-controller behavior can be tested deterministically
//! without touching a device.

mod mock;

pub use mock::{mock_catalog, FixedLatencyMeasurer};
