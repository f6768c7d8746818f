//! Integration tests for the wire protocol
//!
//! Exercises frame encoding/decoding, payload grammars and the bulk
//! stream layer against concrete on-wire byte sequences.

use protocol::{
    bulk, encode_frame, encode_frame_with, read_frame, Algorithm, CodecConfig, DeviceRecord,
    Direction, Envelope, Message, MessageKind, ProtocolError, TransferKind, UrbHeader, HEADER_SIZE,
};
use std::io::Cursor;

fn decode(frame: &[u8]) -> protocol::Result<Envelope> {
    read_frame(&mut Cursor::new(frame), &CodecConfig::default())
}

fn make_record(device_id: u32, bus: u8, port: u8) -> DeviceRecord {
    DeviceRecord {
        bus_id: bus as u32,
        device_id,
        vendor_id: 0x1234,
        product_id: 0x5678,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        num_interfaces: 1,
        device_speed: 3,
        bus_num: bus,
        device_num: 4,
        port_number: port,
        manufacturer: "Example Corp".to_string(),
        product: "Widget".to_string(),
        serial: "WX-0001".to_string(),
        busid: DeviceRecord::format_busid(bus, port),
    }
}

mod envelope_roundtrip {
    use super::*;

    fn all_messages() -> Vec<Message> {
        let urb = UrbHeader::submission(17, 1, TransferKind::Bulk, Direction::Out, 0x02, 512);
        let bulk_header = protocol::BulkDataHeader {
            stream_id: 3,
            total_size: 8,
            chunk_size: 8,
            chunk_offset: 0,
            compression: 0,
        };
        vec![
            Message::DeviceListRequest,
            Message::DeviceListResponse {
                devices: vec![make_record(1, 2, 2), make_record(2, 3, 1)],
            },
            Message::DeviceAttachRequest { device_id: 1 },
            Message::DeviceAttachResponse { success: true },
            Message::DeviceDetachRequest { device_id: 1 },
            Message::DeviceDetachResponse { success: false },
            Message::SubmitUrb {
                header: urb,
                data: vec![0xAA; 512],
            },
            Message::CompleteUrb {
                header: urb,
                data: Vec::new(),
            },
            Message::UnlinkUrb { header: urb },
            Message::BulkDataStart {
                header: bulk_header,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
            Message::BulkDataChunk {
                header: bulk_header,
                data: Vec::new(),
            },
            Message::BulkDataEnd {
                header: bulk_header,
                data: Vec::new(),
            },
            Message::Error {
                message: "Device not attached".to_string(),
            },
        ]
    }

    #[test]
    fn every_message_kind_roundtrips_through_a_frame() {
        for (i, message) in all_messages().into_iter().enumerate() {
            let envelope = Envelope::new(i as u32 + 100, message);
            let frame = encode_frame(&envelope).unwrap();
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded, envelope, "kind {:?}", envelope.message.kind());
        }
    }

    #[test]
    fn compressed_frames_roundtrip_for_every_kind() {
        for (i, message) in all_messages().into_iter().enumerate() {
            let envelope = Envelope::new(i as u32, message);
            let frame = encode_frame_with(&envelope, Some(Algorithm::Lz4)).unwrap();
            assert_eq!(decode(&frame).unwrap(), envelope);
        }
    }
}

mod wire_scenarios {
    use super::*;

    #[test]
    fn empty_inventory_list_exchange() {
        // Client frame: type 0x01, no payload, sequence 7.
        let request = encode_frame(&Envelope::new(7, Message::DeviceListRequest)).unwrap();
        assert_eq!(request.len(), HEADER_SIZE);
        assert_eq!(request[6], 0x01);

        let decoded = decode(&request).unwrap();
        assert_eq!(decoded.sequence, 7);

        // Server reply: type 0x02, sequence echoed, zero-length payload.
        let response = encode_frame(&Envelope::new(
            decoded.sequence,
            Message::DeviceListResponse { devices: Vec::new() },
        ))
        .unwrap();
        assert_eq!(response.len(), HEADER_SIZE);
        assert_eq!(response[6], 0x02);
        assert_eq!(&response[8..12], &0u32.to_le_bytes()); // length
        assert_eq!(&response[12..16], &7u32.to_le_bytes()); // sequence
    }

    #[test]
    fn single_device_list_payload_is_one_record() {
        let record = make_record(1, 2, 2);
        assert_eq!(record.busid, "2-2");

        let response = encode_frame(&Envelope::new(
            1,
            Message::DeviceListResponse {
                devices: vec![record.clone()],
            },
        ))
        .unwrap();
        assert_eq!(response.len(), HEADER_SIZE + DeviceRecord::SIZE);

        let decoded = decode(&response).unwrap();
        let Message::DeviceListResponse { devices } = decoded.message else {
            panic!("expected DeviceListResponse");
        };
        assert_eq!(devices, vec![record]);
    }

    #[test]
    fn attach_success_payload() {
        let request = encode_frame(&Envelope::new(
            42,
            Message::DeviceAttachRequest { device_id: 1 },
        ))
        .unwrap();
        let decoded = decode(&request).unwrap();
        assert_eq!(decoded.sequence, 42);

        let response = encode_frame(&Envelope::new(
            42,
            Message::DeviceAttachResponse { success: true },
        ))
        .unwrap();
        assert_eq!(response[6], 0x04);
        assert_eq!(&response[HEADER_SIZE..], &1u32.to_le_bytes());
    }

    #[test]
    fn attach_unknown_device_payload() {
        let response = encode_frame(&Envelope::new(
            5,
            Message::DeviceAttachResponse { success: false },
        ))
        .unwrap();
        assert_eq!(&response[HEADER_SIZE..], &0u32.to_le_bytes());
    }

    #[test]
    fn bulk_out_submission_and_completion() {
        let submission = Message::SubmitUrb {
            header: UrbHeader::submission(17, 1, TransferKind::Bulk, Direction::Out, 0x02, 512),
            data: vec![0xAA; 512],
        };
        let frame = encode_frame(&Envelope::new(3, submission)).unwrap();
        let decoded = decode(&frame).unwrap();
        let Message::SubmitUrb { header, data } = decoded.message else {
            panic!("expected SubmitUrb");
        };
        assert_eq!(header.urb_id, 17);
        assert_eq!(header.transfer_length, 512);
        assert_eq!(data.len(), 512);

        // Completion: status 0, actual length, empty payload for OUT.
        let mut completion_header = header;
        completion_header.status = 0;
        completion_header.transfer_length = 512;
        let completion = encode_frame(&Envelope::new(
            3,
            Message::CompleteUrb {
                header: completion_header,
                data: Vec::new(),
            },
        ))
        .unwrap();
        let decoded = decode(&completion).unwrap();
        let Message::CompleteUrb { header, data } = decoded.message else {
            panic!("expected CompleteUrb");
        };
        assert_eq!(header.urb_id, 17);
        assert_eq!(header.device_id, 1);
        assert_eq!(header.status, 0);
        assert!(data.is_empty());
    }

    #[test]
    fn bulk_in_completion_carries_data() {
        let header = UrbHeader::submission(18, 1, TransferKind::Bulk, Direction::In, 0x81, 64);
        let submission = encode_frame(&Envelope::new(
            4,
            Message::SubmitUrb {
                header,
                data: Vec::new(),
            },
        ))
        .unwrap();
        assert_eq!(submission.len(), HEADER_SIZE + UrbHeader::SIZE);

        let mut completion_header = header;
        completion_header.transfer_length = 64;
        let completion = encode_frame(&Envelope::new(
            4,
            Message::CompleteUrb {
                header: completion_header,
                data: vec![0x11; 64],
            },
        ))
        .unwrap();
        let decoded = decode(&completion).unwrap();
        let Message::CompleteUrb { header, data } = decoded.message else {
            panic!("expected CompleteUrb");
        };
        assert_eq!(header.status, 0);
        assert_eq!(header.transfer_length, 64);
        assert_eq!(data.len(), 64);
    }
}

mod frame_validation {
    use super::*;

    #[test]
    fn corrupting_each_covered_byte_is_detected() {
        let envelope = Envelope::new(
            1,
            Message::Error {
                message: "integrity probe".to_string(),
            },
        );
        let frame = encode_frame(&envelope).unwrap();

        for offset in 8..frame.len() {
            let mut corrupt = frame.clone();
            corrupt[offset] ^= 0x40;
            assert!(
                decode(&corrupt).is_err(),
                "single-byte corruption at offset {} passed",
                offset
            );
        }
    }

    #[test]
    fn frame_with_foreign_magic_is_rejected() {
        // A USB/IP OP_REQ_DEVLIST-looking prefix must not decode.
        let mut frame = vec![0x01, 0x11, 0x80, 0x05];
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decode(&frame), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn short_read_surfaces_as_transport_error() {
        let frame = encode_frame(&Envelope::new(1, Message::DeviceListRequest)).unwrap();
        let result = decode(&frame[..10]);
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[test]
    fn kind_constants_match_contract() {
        assert_eq!(MessageKind::DeviceListRequest as u8, 0x01);
        assert_eq!(MessageKind::DeviceListResponse as u8, 0x02);
        assert_eq!(MessageKind::DeviceAttachRequest as u8, 0x03);
        assert_eq!(MessageKind::DeviceAttachResponse as u8, 0x04);
        assert_eq!(MessageKind::DeviceDetachRequest as u8, 0x05);
        assert_eq!(MessageKind::DeviceDetachResponse as u8, 0x06);
        assert_eq!(MessageKind::UsbSubmitUrb as u8, 0x10);
        assert_eq!(MessageKind::UsbCompleteUrb as u8, 0x11);
        assert_eq!(MessageKind::UsbUnlinkUrb as u8, 0x12);
        assert_eq!(MessageKind::BulkDataStart as u8, 0x20);
        assert_eq!(MessageKind::BulkDataChunk as u8, 0x21);
        assert_eq!(MessageKind::BulkDataEnd as u8, 0x22);
        assert_eq!(MessageKind::Error as u8, 0xFF);

        assert_eq!(TransferKind::Iso as u8, 0);
        assert_eq!(TransferKind::Interrupt as u8, 1);
        assert_eq!(TransferKind::Control as u8, 2);
        assert_eq!(TransferKind::Bulk as u8, 3);
        assert_eq!(Direction::Out as u8, 0);
        assert_eq!(Direction::In as u8, 1);
    }
}

mod bulk_streaming {
    use super::*;

    #[test]
    fn stream_survives_frame_transport() {
        // Chunk, carry each message through a real frame, reassemble.
        let payload: Vec<u8> = (0..200_000usize).map(|i| (i / 7) as u8).collect();
        let messages = bulk::chunk_stream(42, &payload, Algorithm::Zstd).unwrap();

        let mut transported = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            let frame = encode_frame(&Envelope::new(i as u32, message.clone())).unwrap();
            transported.push(decode(&frame).unwrap().message);
        }

        assert_eq!(bulk::assemble_stream(&transported).unwrap(), payload);
    }
}
