//! Wire protocol for the socket-backed virtual USB device
//!
//! This crate defines the frames exchanged between the virtual device and the
//! remote peer that answers its USB transfers. It is pure encode/decode with
//! no I/O: one request frame goes out per USB token, one reply frame comes
//! back, and the peer may announce itself or leave with single-byte signal
//! frames.
//!
//! # Example
//!
//! ```
//! use protocol::{TransferReply, TransferRequest};
//!
//! // SET_ADDRESS(7) as a SETUP frame
//! let request = TransferRequest::Setup {
//!     request: vec![0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00],
//! };
//! let frame = request.encode().unwrap();
//! assert_eq!(frame[0], 0);
//!
//! // The peer acknowledges with an empty OK
//! let reply = TransferReply::decode(&[0x00]).unwrap();
//! assert_eq!(reply, TransferReply::Ok(Vec::new()));
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    KIND_IN, KIND_OUT, KIND_SETUP, MAX_PAYLOAD, PeerSignal, SIGNAL_ATTACH, SIGNAL_DETACH,
    STATUS_NAK, STATUS_OK, STATUS_STALL, TransferReply, TransferRequest,
};
pub use error::{ProtocolError, Result};
pub use types::{
    DESCRIPTOR_TYPE_DEVICE, FEATURE_DEVICE_REMOTE_WAKEUP, MAX_DEVICE_ADDRESS,
    REQUEST_CLEAR_FEATURE, REQUEST_GET_DESCRIPTOR, REQUEST_SET_ADDRESS, REQUEST_SET_FEATURE,
    REQUEST_TYPE_STANDARD_IN, REQUEST_TYPE_STANDARD_OUT, SetupPacket,
};
