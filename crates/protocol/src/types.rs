//! USB control request types
//!
//! The 8-byte SETUP packet layout and the handful of standard requests the
//! device needs to recognise while forwarding control transfers.

use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// bmRequestType: standard request, host-to-device, recipient device
pub const REQUEST_TYPE_STANDARD_OUT: u8 = 0x00;
/// bmRequestType: standard request, device-to-host, recipient device
pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;

/// Standard request codes (bRequest)
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Feature selector for DEVICE_REMOTE_WAKEUP
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x0001;

/// Descriptor type for GET_DESCRIPTOR(Device)
pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;

/// Highest assignable USB device address
pub const MAX_DEVICE_ADDRESS: u8 = 127;

/// USB control request (SETUP packet)
///
/// Multi-byte fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet in bytes
    pub const SIZE: usize = 8;

    /// Parse a SETUP packet from raw request bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            request_type: cursor.read_u8()?,
            request: cursor.read_u8()?,
            value: cursor.read_u16::<LittleEndian>()?,
            index: cursor.read_u16::<LittleEndian>()?,
            length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Serialize to the 8-byte wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        // Writes into a Vec cannot fail
        let _ = buf.write_u8(self.request_type);
        let _ = buf.write_u8(self.request);
        let _ = buf.write_u16::<LittleEndian>(self.value);
        let _ = buf.write_u16::<LittleEndian>(self.index);
        let _ = buf.write_u16::<LittleEndian>(self.length);
        buf
    }

    /// Standard SET_ADDRESS request
    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: REQUEST_TYPE_STANDARD_OUT,
            request: REQUEST_SET_ADDRESS,
            value: u16::from(address),
            index: 0,
            length: 0,
        }
    }

    /// Standard GET_DESCRIPTOR request
    pub fn get_descriptor(descriptor_type: u8, descriptor_index: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_STANDARD_IN,
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(descriptor_type) << 8) | u16::from(descriptor_index),
            index: 0,
            length,
        }
    }

    /// Whether the data stage (if any) flows device-to-host
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Target address if this is a standard SET_ADDRESS request
    pub fn set_address_target(&self) -> Option<u8> {
        if self.request_type == REQUEST_TYPE_STANDARD_OUT && self.request == REQUEST_SET_ADDRESS {
            Some((self.value & 0x7F) as u8)
        } else {
            None
        }
    }

    /// New remote-wakeup state if this is a SET/CLEAR_FEATURE(DEVICE_REMOTE_WAKEUP)
    pub fn remote_wakeup_change(&self) -> Option<bool> {
        if self.request_type != REQUEST_TYPE_STANDARD_OUT
            || self.value != FEATURE_DEVICE_REMOTE_WAKEUP
        {
            return None;
        }
        match self.request {
            REQUEST_SET_FEATURE => Some(true),
            REQUEST_CLEAR_FEATURE => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_address() {
        let setup = SetupPacket::parse(&[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(setup.request, REQUEST_SET_ADDRESS);
        assert_eq!(setup.value, 7);
        assert_eq!(setup.set_address_target(), Some(7));
        assert!(!setup.is_device_to_host());
    }

    #[test]
    fn test_parse_short_packet() {
        assert!(matches!(
            SetupPacket::parse(&[0x80, 0x06]),
            Err(ProtocolError::Truncated {
                expected: 8,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_to_bytes_little_endian() {
        let setup = SetupPacket::get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0x0012);
        assert_eq!(
            setup.to_bytes(),
            vec![0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
        assert!(setup.is_device_to_host());
        assert_eq!(setup.set_address_target(), None);
    }

    #[test]
    fn test_set_address_only_for_standard_device_request() {
        // Same bRequest, but class-specific request type
        let class_request = SetupPacket {
            request_type: 0x21,
            request: REQUEST_SET_ADDRESS,
            value: 9,
            index: 0,
            length: 0,
        };
        assert_eq!(class_request.set_address_target(), None);
    }

    #[test]
    fn test_remote_wakeup_change() {
        let set = SetupPacket {
            request_type: REQUEST_TYPE_STANDARD_OUT,
            request: REQUEST_SET_FEATURE,
            value: FEATURE_DEVICE_REMOTE_WAKEUP,
            index: 0,
            length: 0,
        };
        assert_eq!(set.remote_wakeup_change(), Some(true));

        let clear = SetupPacket {
            request: REQUEST_CLEAR_FEATURE,
            ..set
        };
        assert_eq!(clear.remote_wakeup_change(), Some(false));

        let test_mode = SetupPacket { value: 2, ..set };
        assert_eq!(test_mode.remote_wakeup_change(), None);
    }
}
