//! Frame encoding and decoding for the socket wire protocol
//!
//! Every datagram carries exactly one frame. There is no length prefix: the
//! datagram boundary delimits the frame.
//!
//! # Frame Format
//!
//! ```text
//! Request:  [kind: u8][endpoint: u8 (IN/OUT only)][payload...]
//! Reply:    [status: u8][data...]
//! Signal:   [tag: u8]
//! ```
//!
//! Payloads are capped at [`MAX_PAYLOAD`] bytes. Oversized payloads are
//! rejected at encode time and never truncated.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum payload carried by a single request frame
pub const MAX_PAYLOAD: usize = 255;

/// Request kind tags
pub const KIND_SETUP: u8 = 0;
pub const KIND_IN: u8 = 1;
pub const KIND_OUT: u8 = 2;

/// Reply status tags
pub const STATUS_OK: u8 = 0;
pub const STATUS_NAK: u8 = 1;
pub const STATUS_STALL: u8 = 2;

/// Out-of-band signal tags
pub const SIGNAL_ATTACH: u8 = 0xFF;
pub const SIGNAL_DETACH: u8 = 0xFE;

/// A single USB token forwarded to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    /// SETUP stage; `request` is the raw control request (normally 8 bytes)
    Setup { request: Vec<u8> },
    /// IN token; the peer answers with the data in its reply
    In { endpoint: u8 },
    /// OUT token with host-to-device data
    Out { endpoint: u8, data: Vec<u8> },
}

impl TransferRequest {
    /// Wire tag for this request kind
    pub fn kind(&self) -> u8 {
        match self {
            Self::Setup { .. } => KIND_SETUP,
            Self::In { .. } => KIND_IN,
            Self::Out { .. } => KIND_OUT,
        }
    }

    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "SETUP",
            Self::In { .. } => "IN",
            Self::Out { .. } => "OUT",
        }
    }

    /// Payload bytes carried after the header
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Setup { request } => request,
            Self::In { .. } => &[],
            Self::Out { data, .. } => data,
        }
    }

    /// Encode the request into a single frame
    ///
    /// # Example
    /// ```
    /// use protocol::TransferRequest;
    ///
    /// let frame = TransferRequest::Out { endpoint: 2, data: vec![0xAA] }.encode().unwrap();
    /// assert_eq!(&frame[..], &[2, 2, 0xAA]);
    /// ```
    pub fn encode(&self) -> Result<Bytes> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut frame = BytesMut::with_capacity(2 + payload.len());
        frame.put_u8(self.kind());
        match self {
            Self::Setup { request } => frame.put_slice(request),
            Self::In { endpoint } => frame.put_u8(*endpoint),
            Self::Out { endpoint, data } => {
                frame.put_u8(*endpoint);
                frame.put_slice(data);
            }
        }

        Ok(frame.freeze())
    }

    /// Decode a request frame (peer side)
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&kind, rest) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;

        let request = match kind {
            KIND_SETUP => Self::Setup {
                request: rest.to_vec(),
            },
            KIND_IN | KIND_OUT => {
                let (&endpoint, payload) = rest.split_first().ok_or(ProtocolError::Truncated {
                    expected: 2,
                    actual: frame.len(),
                })?;
                if kind == KIND_IN {
                    // IN carries no payload; anything after the endpoint is ignored
                    Self::In { endpoint }
                } else {
                    Self::Out {
                        endpoint,
                        data: payload.to_vec(),
                    }
                }
            }
            other => return Err(ProtocolError::UnknownKind(other)),
        };

        if request.payload().len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: request.payload().len(),
                max: MAX_PAYLOAD,
            });
        }

        Ok(request)
    }
}

/// The peer's answer to a [`TransferRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReply {
    /// Accepted; carries IN data (empty for OUT and status stages)
    Ok(Vec<u8>),
    /// Not ready, try again later
    Nak,
    /// Request cannot be processed
    Stall,
}

impl TransferReply {
    /// Wire tag for this reply status
    pub fn status(&self) -> u8 {
        match self {
            Self::Ok(_) => STATUS_OK,
            Self::Nak => STATUS_NAK,
            Self::Stall => STATUS_STALL,
        }
    }

    /// Encode the reply into a single frame (peer side)
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(1 + self.data().len());
        frame.put_u8(self.status());
        frame.put_slice(self.data());
        frame.freeze()
    }

    /// Decode a reply frame
    ///
    /// Bytes following a NAK or STALL status are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&status, data) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match status {
            STATUS_OK => Ok(Self::Ok(data.to_vec())),
            STATUS_NAK => Ok(Self::Nak),
            STATUS_STALL => Ok(Self::Stall),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }

    /// Reply data (empty unless `Ok`)
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Ok(data) => data,
            Self::Nak | Self::Stall => &[],
        }
    }
}

/// Unsolicited attach/detach notification from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSignal {
    /// Sender becomes the connected peer
    Attach,
    /// Peer is going away
    Detach,
}

impl PeerSignal {
    /// Interpret a datagram as a signal frame
    ///
    /// Returns `None` for anything other than a single recognised tag byte.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [SIGNAL_ATTACH] => Some(Self::Attach),
            [SIGNAL_DETACH] => Some(Self::Detach),
            _ => None,
        }
    }

    /// Wire tag for this signal
    pub fn tag(self) -> u8 {
        match self {
            Self::Attach => SIGNAL_ATTACH,
            Self::Detach => SIGNAL_DETACH,
        }
    }
}
