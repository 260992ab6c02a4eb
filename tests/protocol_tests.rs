use hvacd::payload::*;
use hvacd::protocol::*;

fn telemetry_frame(correlation: u32) -> Message {
    let payload = TelemetryPayload {
        timestamp_ms: 1_700_000_000_000,
        readings: vec![Reading::new("space_temp", 6_150.0), Reading::new("heater", 1.0)],
    };
    Message::json(MessageType::BoardTelemetry, correlation, &payload).unwrap()
}

#[test]
fn test_every_message_type_survives_encoding() {
    for (i, message_type) in MessageType::ALL.iter().enumerate() {
        let message = Message::new(*message_type, i as u32 * 7, vec![i as u8; i * 3]);
        let bytes = encode(&message);
        assert_eq!(bytes.len(), HEADER_LEN + message.payload.len());
        assert_eq!(decode(&bytes).unwrap(), message);
    }
}

#[test]
fn test_empty_payload_frame() {
    let bytes = encode(&Message::heartbeat(99));
    assert_eq!(bytes.len(), HEADER_LEN);

    let mut decoder = FrameDecoder::default();
    decoder.feed(&bytes);
    let message = decoder.next_message().unwrap().unwrap();
    assert_eq!(message.message_type, MessageType::Heartbeat);
    assert_eq!(message.correlation, 99);
    assert!(message.payload.is_empty());
}

#[test]
fn test_byte_at_a_time_matches_single_write() {
    let messages = vec![
        telemetry_frame(NO_CORRELATION),
        Message::heartbeat(5),
        Message::json(MessageType::ClientQuery, 6, &Query::ReadAll).unwrap(),
        telemetry_frame(NO_CORRELATION),
    ];
    let stream: Vec<u8> = messages.iter().flat_map(encode).collect();

    // Whole stream at once
    let mut bulk = FrameDecoder::default();
    bulk.feed(&stream);
    let at_once: Vec<Message> = bulk.frames().map(Result::unwrap).collect();

    // One byte per feed, draining after every byte
    let mut trickle = FrameDecoder::default();
    let mut one_by_one = Vec::new();
    for byte in &stream {
        trickle.feed(std::slice::from_ref(byte));
        while let Some(message) = trickle.next_message().unwrap() {
            one_by_one.push(message);
        }
    }

    assert_eq!(at_once, messages);
    assert_eq!(one_by_one, messages);
    assert_eq!(trickle.buffered(), 0);
    assert!(trickle.finish().is_ok());
}

#[test]
fn test_oversized_length_is_malformed_before_payload_arrives() {
    let mut decoder = FrameDecoder::new(1_024);
    let header = FrameHeader {
        message_type: MessageType::ClientQuery,
        correlation: 1,
        length: 1_025,
    }
    .encode();

    // Only the header is fed: the length alone must be rejected
    decoder.feed(&header);
    match decoder.next_message() {
        Err(ProtocolError::Malformed(reason)) => assert!(reason.contains("1025")),
        other => panic!("expected Malformed, got {:?}", other),
    }
    assert!(decoder.is_poisoned());
    assert!(decoder.next_message().is_err());
}

#[test]
fn test_length_at_limit_is_accepted() {
    let mut decoder = FrameDecoder::new(16);
    let message = Message::new(MessageType::BoardCommand, 2, vec![b'x'; 16]);
    decoder.feed(&encode(&message));
    assert_eq!(decoder.next_message().unwrap(), Some(message));
}

#[test]
fn test_unknown_type_tag() {
    let mut bytes = encode(&Message::heartbeat(1));
    bytes[0] = 0;
    assert_eq!(decode(&bytes), Err(ProtocolError::UnknownType(0)));

    bytes[0] = 8;
    let mut decoder = FrameDecoder::default();
    decoder.feed(&bytes);
    assert_eq!(decoder.next_message(), Err(ProtocolError::UnknownType(8)));
}

#[test]
fn test_eof_mid_frame_is_truncated() {
    let bytes = encode(&telemetry_frame(NO_CORRELATION));
    let mut decoder = FrameDecoder::default();
    decoder.feed(&bytes[..bytes.len() - 3]);

    assert_eq!(decoder.next_message(), Ok(None));
    let err = decoder.finish().unwrap_err();
    assert_eq!(
        err,
        ProtocolError::Truncated {
            buffered: bytes.len() - 3
        }
    );
    assert!(!err.is_fatal());
}

#[test]
fn test_eof_mid_header_is_truncated() {
    let mut decoder = FrameDecoder::default();
    decoder.feed(&[MessageType::Heartbeat.tag(), 0, 0]);
    assert_eq!(decoder.next_message(), Ok(None));
    assert_eq!(decoder.finish(), Err(ProtocolError::Truncated { buffered: 3 }));
}

#[test]
fn test_reset_recovers_poisoned_decoder() {
    let mut decoder = FrameDecoder::new(8);
    decoder.feed(&encode(&Message::new(MessageType::Error, 0, vec![0; 9])));
    assert!(decoder.next_message().is_err());

    decoder.reset();
    decoder.feed(&encode(&Message::heartbeat(4)));
    assert_eq!(decoder.next_message().unwrap(), Some(Message::heartbeat(4)));
}

#[test]
fn test_json_payload_helpers() {
    let message = telemetry_frame(NO_CORRELATION);
    assert!(message.is_unsolicited());

    let parsed: TelemetryPayload = message.parse_json().unwrap();
    assert_eq!(parsed.readings.len(), 2);
    assert_eq!(parsed.readings[0].point_id, "space_temp");

    let garbage = Message::new(MessageType::ClientQuery, 3, b"{not json".to_vec());
    assert!(matches!(
        garbage.parse_json::<Query>(),
        Err(ProtocolError::BadPayload(_))
    ));
}
