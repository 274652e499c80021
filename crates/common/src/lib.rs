//! Common utilities for usb-socket
//!
//! This crate provides functionality shared by the device crate and its
//! tests: the error type, logging setup, transfer metrics and a mock peer
//! for exercising the socket protocol end to end.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{MetricsSnapshot, TransferMetrics, TransferOutcome};
