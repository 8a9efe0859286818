//! Telemetry initialization
//!
//! Installs the `tracing` subscriber used by the binaries.

mod init_basic;

pub use init_basic::{init_telemetry, shutdown_telemetry};
