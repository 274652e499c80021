//! Device error types

use crate::usb::UsbResponse;
use common::TransferOutcome;
use protocol::ProtocolError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Transport and round-trip failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket path unusable: live listener, permissions, or too long
    #[error("Failed to bind {}: {source}", path.display())]
    BindFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// Datagram sockets send whole frames; anything less is a protocol violation
    #[error("Partial send: {sent} of {expected} bytes")]
    PartialSend { sent: usize, expected: usize },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Peer gone: {0}")]
    PeerGone(#[source] io::Error),

    #[error("Invalid reply: {0}")]
    InvalidReply(#[source] ProtocolError),

    /// Request could not be encoded (payload over the frame cap)
    #[error(transparent)]
    Codec(#[from] ProtocolError),

    #[error("No peer attached")]
    NoPeer,

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Host-visible response for a transfer that failed with this error
    pub fn response(&self) -> UsbResponse {
        match self {
            Self::SendFailed(_) | Self::PartialSend { .. } | Self::Codec(_) => UsbResponse::IoError,
            Self::BindFailed { .. }
            | Self::Timeout(_)
            | Self::PeerGone(_)
            | Self::InvalidReply(_)
            | Self::NoPeer
            | Self::Closed => UsbResponse::NoDevice,
        }
    }

    /// Metrics bucket for this error
    pub fn outcome(&self) -> TransferOutcome {
        match self {
            Self::Timeout(_) => TransferOutcome::Timeout,
            Self::PeerGone(_) | Self::InvalidReply(_) | Self::NoPeer | Self::Closed => {
                TransferOutcome::PeerGone
            }
            Self::BindFailed { .. }
            | Self::SendFailed(_)
            | Self::PartialSend { .. }
            | Self::Codec(_) => TransferOutcome::LocalFailure,
        }
    }
}

/// Failures driving a control transfer through a device task
#[derive(Debug, Error)]
pub enum HostError {
    /// The device task has stopped and its event channel is closed
    #[error("Device task is gone")]
    DeviceGone,

    #[error("{stage} stage failed: {response:?}")]
    StageFailed {
        stage: &'static str,
        response: UsbResponse,
    },
}
