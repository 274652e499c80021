//! Host-facing USB packet types
//!
//! These mirror what a host controller model hands to a device: a token PID,
//! the bus address it targets, an endpoint and (for SETUP/OUT) the payload.

use protocol::TransferReply;

/// USB token PIDs
pub const USB_TOKEN_SETUP: u8 = 0x2D;
pub const USB_TOKEN_IN: u8 = 0x69;
pub const USB_TOKEN_OUT: u8 = 0xE1;

/// Token kinds the socket transport can forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbToken {
    Setup,
    In,
    Out,
}

impl UsbToken {
    pub fn from_pid(pid: u8) -> Option<Self> {
        match pid {
            USB_TOKEN_SETUP => Some(Self::Setup),
            USB_TOKEN_IN => Some(Self::In),
            USB_TOKEN_OUT => Some(Self::Out),
            _ => None,
        }
    }
}

/// A token delivered by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPacket {
    /// Token PID
    pub pid: u8,
    /// Bus address the host is talking to
    pub device_address: u8,
    /// Endpoint number (ignored for SETUP, which always targets endpoint 0)
    pub endpoint: u8,
    /// SETUP request bytes or OUT data; empty for IN
    pub data: Vec<u8>,
    /// Largest IN response the host will accept
    pub max_len: usize,
}

impl UsbPacket {
    pub fn setup(device_address: u8, request: Vec<u8>) -> Self {
        Self {
            pid: USB_TOKEN_SETUP,
            device_address,
            endpoint: 0,
            data: request,
            max_len: 0,
        }
    }

    pub fn data_in(device_address: u8, endpoint: u8, max_len: usize) -> Self {
        Self {
            pid: USB_TOKEN_IN,
            device_address,
            endpoint,
            data: Vec::new(),
            max_len,
        }
    }

    pub fn data_out(device_address: u8, endpoint: u8, data: Vec<u8>) -> Self {
        Self {
            pid: USB_TOKEN_OUT,
            device_address,
            endpoint,
            data,
            max_len: 0,
        }
    }
}

/// Outcome of a token as reported back to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbResponse {
    /// Transfer completed; IN data (empty otherwise)
    Complete(Vec<u8>),
    Nak,
    Stall,
    /// Device absent, not addressed, or the peer did not answer
    NoDevice,
    /// Transfer could not be sent; the device stays usable
    IoError,
}

impl UsbResponse {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

impl From<TransferReply> for UsbResponse {
    fn from(reply: TransferReply) -> Self {
        match reply {
            TransferReply::Ok(data) => Self::Complete(data),
            TransferReply::Nak => Self::Nak,
            TransferReply::Stall => Self::Stall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_pid() {
        assert_eq!(UsbToken::from_pid(0x2D), Some(UsbToken::Setup));
        assert_eq!(UsbToken::from_pid(0x69), Some(UsbToken::In));
        assert_eq!(UsbToken::from_pid(0xE1), Some(UsbToken::Out));
        // SOF is not a transfer token
        assert_eq!(UsbToken::from_pid(0xA5), None);
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            UsbResponse::from(TransferReply::Ok(vec![1])),
            UsbResponse::Complete(vec![1])
        );
        assert_eq!(UsbResponse::from(TransferReply::Nak), UsbResponse::Nak);
        assert_eq!(UsbResponse::from(TransferReply::Stall), UsbResponse::Stall);
    }
}
