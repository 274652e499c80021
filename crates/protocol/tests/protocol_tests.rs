//! Integration tests for the socket wire protocol
//!
//! Covers request/reply framing, the payload cap, signal frames and the
//! SETUP packet helpers used while forwarding control transfers.
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use proptest::prelude::*;
use protocol::{
    MAX_PAYLOAD, PeerSignal, ProtocolError, SetupPacket, TransferReply, TransferRequest,
};

mod request_framing {
    use super::*;

    #[test]
    fn test_set_address_frame_layout() {
        let setup = SetupPacket::set_address(7);
        let frame = TransferRequest::Setup {
            request: setup.to_bytes(),
        }
        .encode()
        .expect("Failed to encode");

        assert_eq!(
            &frame[..],
            &[0x00, 0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_out_frame_layout() {
        let frame = TransferRequest::Out {
            endpoint: 0,
            data: vec![0xDE, 0xAD],
        }
        .encode()
        .expect("Failed to encode");

        assert_eq!(&frame[..], &[0x02, 0x00, 0xDE, 0xAD]);
    }

    #[test]
    fn test_zero_length_out_still_carries_endpoint() {
        let frame = TransferRequest::Out {
            endpoint: 3,
            data: Vec::new(),
        }
        .encode()
        .expect("Failed to encode");

        assert_eq!(&frame[..], &[0x02, 0x03]);
    }

    #[test]
    fn test_in_decode_ignores_trailing_bytes() {
        let request = TransferRequest::decode(&[0x01, 0x81, 0x40]).expect("Failed to decode");
        assert_eq!(request, TransferRequest::In { endpoint: 0x81 });
    }

    #[test]
    fn test_256_byte_payload_rejected() {
        let result = TransferRequest::Out {
            endpoint: 1,
            data: vec![0x55; 256],
        }
        .encode();

        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 256, max: 255 })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut frame = vec![0x02, 0x01];
        frame.extend(std::iter::repeat_n(0u8, MAX_PAYLOAD + 1));
        assert!(matches!(
            TransferRequest::decode(&frame),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}

mod reply_framing {
    use super::*;

    #[test]
    fn test_reply_encode_decode() {
        let replies = vec![
            TransferReply::Ok(Vec::new()),
            TransferReply::Ok(vec![0x12, 0x01, 0x00, 0x02]),
            TransferReply::Nak,
            TransferReply::Stall,
        ];

        for reply in replies {
            let frame = reply.encode();
            assert_eq!(frame[0], reply.status());
            let decoded = TransferReply::decode(&frame).expect("Failed to decode");
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn test_signal_byte_is_not_a_reply() {
        assert!(matches!(
            TransferReply::decode(&[0xFF]),
            Err(ProtocolError::UnknownStatus(0xFF))
        ));
    }
}

mod signals {
    use super::*;

    #[test]
    fn test_signal_tags() {
        for signal in [PeerSignal::Attach, PeerSignal::Detach] {
            assert_eq!(PeerSignal::from_frame(&[signal.tag()]), Some(signal));
        }
    }

    #[test]
    fn test_garbled_signals_ignored() {
        for tag in 0u8..=0xFD {
            assert_eq!(PeerSignal::from_frame(&[tag]), None);
        }
    }
}

proptest! {
    #[test]
    fn prop_setup_roundtrip(request in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD)) {
        let original = TransferRequest::Setup { request };
        let frame = original.encode().unwrap();
        let decoded = TransferRequest::decode(&frame).unwrap();
        prop_assert_eq!(&decoded, &original);
        prop_assert_eq!(decoded.encode().unwrap(), frame);
    }

    #[test]
    fn prop_out_roundtrip(endpoint in any::<u8>(), data in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD)) {
        let original = TransferRequest::Out { endpoint, data };
        let frame = original.encode().unwrap();
        prop_assert_eq!(TransferRequest::decode(&frame).unwrap(), original);
    }

    #[test]
    fn prop_setup_packet_roundtrip(request_type in any::<u8>(), request in any::<u8>(), value in any::<u16>(), index in any::<u16>(), length in any::<u16>()) {
        let setup = SetupPacket { request_type, request, value, index, length };
        prop_assert_eq!(SetupPacket::parse(&setup.to_bytes()).unwrap(), setup);
    }
}
