//! Test support shared by the workspace crates.

pub mod log;
pub mod mocks;

pub use log::{TestLogEntry, TestLogger, TestPhase, init_test_logging};
pub use mocks::{MockNetworkDiagnostics, MockOracle, MockServiceManager};
