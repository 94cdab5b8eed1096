//! Telemetry for the reference application: structured JSON logs, plus OTLP
//! span export when an endpoint is configured.
//!
//! Log fields carry key ids and timestamps only. Payloads and key material are
//! never logged.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
