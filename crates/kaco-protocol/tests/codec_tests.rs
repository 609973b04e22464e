use kaco_protocol::{
    crc16_x25, decode, decode_query, encode, legacy_checksum, resolve_model_name, CodecError,
    Command, LegacyLayout, QueryFrame, ResponseBody, MAX_PAYLOAD_LEN,
};
use types::{CosPhiKind, DeviceAddress};

const STANDARD_FRAME: &[u8] =
    b"\n*030   4 486.8  1.29   627 236.0  2.43   558  24   3401 \x92 3600xi\r";
const XP_FRAME: &[u8] =
    b"\n*030   4 486.8 111.29 123627 236.1 123.45   1558 42   13401 \xb3 100kTR 123456789\r";
const UNIT_FRAME: &[u8] =
    b"\n*021   4 186.8 11.29 123621 136.1 13.45   1558 12  13401 \x23  8k1\r";
const GENERIC_FRAME: &[u8] = b"\n*03n 20 3X24 4  214.7  1.97   421    0.0  0.04     0  231.1  0.80  234.1  0.79  234.4  0.81   421   413 0.735i  36.7   1640 FEB7\r";

fn address(value: u8) -> DeviceAddress {
    DeviceAddress::new(value).expect("address")
}

/// Appends the sum checksum, the given tail fields and `\r`.
fn legacy_frame(body: &str, tail: &str) -> Vec<u8> {
    let mut frame = format!("\n*{body}").into_bytes();
    let checksum = legacy_checksum(&frame[1..]);
    frame.push(checksum);
    frame.extend_from_slice(tail.as_bytes());
    frame.push(b'\r');
    frame
}

/// Appends ` XXXX\r` with the CRC of everything after the leading `\n`.
fn generic_frame(body: &str) -> Vec<u8> {
    let mut frame = format!("\n*{body} ").into_bytes();
    let crc = crc16_x25(&frame[1..]);
    frame.extend_from_slice(format!("{crc:04X}\r").as_bytes());
    frame
}

#[test]
fn decode_standard_readings() {
    let frame = decode(STANDARD_FRAME).expect("decode");
    assert_eq!(frame.address, address(3));
    assert_eq!(frame.command, Command::Readings);
    assert!(frame.checksum_verified);

    let ResponseBody::Readings { layout, telemetry } = frame.body else {
        panic!("expected readings body");
    };
    assert_eq!(layout, LegacyLayout::Standard);
    assert_eq!(telemetry.status, 4);
    assert_eq!(telemetry.inverter_type, "3600xi");
    assert_eq!(telemetry.dc_inputs.len(), 1);
    assert_eq!(telemetry.dc_inputs[0].voltage_v, 486.8);
    assert_eq!(telemetry.dc_inputs[0].current_a, 1.29);
    assert_eq!(telemetry.dc_power_w, 627.0);
    assert_eq!(telemetry.ac_phases[0].voltage_v, 236.0);
    assert_eq!(telemetry.ac_phases[0].current_a, 2.43);
    assert_eq!(telemetry.power_w(), 558.0);
    assert_eq!(telemetry.temperature_c, 24.0);
    assert_eq!(telemetry.energy_today_wh(), 3401.0);
    assert_eq!(telemetry.total_yield_kwh, None);
    assert_eq!(telemetry.cos_phi, None);
}

#[test]
fn decode_xp_readings_with_total_yield() {
    let frame = decode(XP_FRAME).expect("decode");
    let ResponseBody::Readings { layout, telemetry } = frame.body else {
        panic!("expected readings body");
    };
    assert_eq!(layout, LegacyLayout::Xp);
    assert_eq!(telemetry.inverter_type, "100kTR");
    assert_eq!(telemetry.dc_inputs[0].current_a, 111.29);
    assert_eq!(telemetry.dc_power_w, 123_627.0);
    assert_eq!(telemetry.ac_phases[0].current_a, 123.45);
    assert_eq!(telemetry.ac_power_w, 1558.0);
    assert_eq!(telemetry.temperature_c, 42.0);
    assert_eq!(telemetry.daily_yield_wh, 13_401.0);
    assert_eq!(telemetry.total_yield_kwh, Some(123_456_789.0));
    assert_eq!(XP_FRAME.len(), LegacyLayout::Xp.frame_len());
}

#[test]
fn decode_unit_readings() {
    let frame = decode(UNIT_FRAME).expect("decode");
    assert_eq!(frame.address, address(2));
    assert_eq!(frame.command, Command::Unit(1));
    let ResponseBody::Readings { layout, telemetry } = frame.body else {
        panic!("expected readings body");
    };
    assert_eq!(layout, LegacyLayout::Unit);
    assert_eq!(telemetry.inverter_type, "8k1");
    assert_eq!(telemetry.dc_power_w, 123_621.0);
    assert_eq!(telemetry.temperature_c, 12.0);
}

#[test]
fn decode_units_follow_marker() {
    let frame = decode(b"\n*024\r").expect("decode");
    assert_eq!(frame.command, Command::UnitsFollow);
    assert!(!frame.checksum_verified);
    assert_eq!(frame.body, ResponseBody::UnitsFollow);
}

#[test]
fn decode_generic_readings() {
    let frame = decode(GENERIC_FRAME).expect("decode");
    assert_eq!(frame.address, address(3));
    assert_eq!(frame.command, Command::Generic);
    let ResponseBody::Generic(telemetry) = frame.body else {
        panic!("expected generic body");
    };
    assert_eq!(telemetry.inverter_type, "3X24");
    assert_eq!(telemetry.status, 4);
    assert_eq!(telemetry.dc_inputs.len(), 2);
    assert_eq!(telemetry.dc_inputs[0].voltage_v, 214.7);
    assert_eq!(telemetry.dc_inputs[0].current_a, 1.97);
    assert_eq!(telemetry.dc_inputs[0].power_w, 421.0);
    assert_eq!(telemetry.dc_inputs[1].voltage_v, 0.0);
    assert_eq!(telemetry.dc_inputs[1].current_a, 0.04);
    assert_eq!(telemetry.ac_phases.len(), 3);
    assert_eq!(telemetry.ac_phases[0].voltage_v, 231.1);
    assert_eq!(telemetry.ac_phases[0].current_a, 0.8);
    assert_eq!(telemetry.ac_phases[2].voltage_v, 234.4);
    assert_eq!(telemetry.dc_power_w, 421.0);
    assert_eq!(telemetry.ac_power_w, 413.0);
    let cos_phi = telemetry.cos_phi.expect("cos phi");
    assert_eq!(cos_phi.value, 0.735);
    assert_eq!(cos_phi.kind, CosPhiKind::Inductive);
    assert_eq!(telemetry.temperature_c, 36.7);
    assert_eq!(telemetry.daily_yield_wh, 1640.0);
}

#[test]
fn decode_serial_number() {
    let frame = decode(&generic_frame("07s 123456789012")).expect("decode");
    assert_eq!(frame.address, address(7));
    assert_eq!(
        frame.body,
        ResponseBody::SerialNumber("123456789012".to_string())
    );
}

#[test]
fn legacy_checksum_mismatch_is_reported() {
    let frame =
        b"\n*010   4 486.8  1.29   627 236.0  2.43   558  24   3401 \x42 3600xi\r";
    assert_eq!(
        decode(frame),
        Err(CodecError::ChecksumMismatch {
            expected: 0x42,
            actual: 0x90,
        })
    );
}

#[test]
fn crc_mismatch_is_reported() {
    let mut frame = GENERIC_FRAME.to_vec();
    frame[3] = b'1';
    assert_eq!(
        decode(&frame),
        Err(CodecError::ChecksumMismatch {
            expected: 0xFEB7,
            actual: 0x7054,
        })
    );
}

#[test]
fn single_corrupted_byte_never_decodes() {
    let checksum_at = STANDARD_FRAME.len() - 9;
    for index in (2..4).chain(5..=checksum_at) {
        let mut corrupted = STANDARD_FRAME.to_vec();
        corrupted[index] ^= 0x01;
        assert!(
            matches!(decode(&corrupted), Err(CodecError::ChecksumMismatch { .. })),
            "legacy byte {index} not detected"
        );
    }

    let crc_space = GENERIC_FRAME.len() - 6;
    for index in (2..4).chain(5..crc_space) {
        let mut corrupted = GENERIC_FRAME.to_vec();
        corrupted[index] ^= 0x01;
        assert!(
            matches!(decode(&corrupted), Err(CodecError::ChecksumMismatch { .. })),
            "generic byte {index} not detected"
        );
    }
}

#[test]
fn truncated_frames_are_too_short() {
    assert_eq!(decode(b"\n*0"), Err(CodecError::FrameTooShort));
    assert_eq!(decode(&STANDARD_FRAME[..40]), Err(CodecError::FrameTooShort));
    assert_eq!(decode(&GENERIC_FRAME[..60]), Err(CodecError::FrameTooShort));
    assert_eq!(decode(b"\n*024"), Err(CodecError::FrameTooShort));
}

#[test]
fn frame_cut_at_carriage_return_checksum_is_too_short() {
    let head = b"\n*420   4 699.9 999.99 999999 999.1 123.45   1558 42   13401 \r";
    assert_eq!(decode(head), Err(CodecError::FrameTooShort));

    let mut full = head.to_vec();
    full.extend_from_slice(b" 100kTR 123456789\r");
    let frame = decode(&full).expect("decode");
    assert_eq!(frame.address, address(42));
    let ResponseBody::Readings { telemetry, .. } = frame.body else {
        panic!("expected readings body");
    };
    assert_eq!(telemetry.dc_inputs[0].voltage_v, 699.9);
    assert_eq!(telemetry.dc_inputs[0].current_a, 999.99);
    assert_eq!(telemetry.total_yield_kwh, Some(123_456_789.0));
}

#[test]
fn unknown_command_is_rejected() {
    assert_eq!(
        decode(b"\n*016  ...\r"),
        Err(CodecError::UnknownCommand(b'6'))
    );
}

#[test]
fn malformed_frames_are_rejected() {
    let mut trailing = STANDARD_FRAME.to_vec();
    trailing.push(b'a');
    assert!(matches!(decode(&trailing), Err(CodecError::Malformed(_))));

    let bad_marker = b"#030   4 486.8  1.29   627 236.0  2.43   558  24   3401 \x92 3600xi\r";
    assert!(matches!(decode(bad_marker), Err(CodecError::Malformed(_))));

    let wrong_precision = legacy_frame(
        "010   4 486.8   1.2   627 236.0  2.43   558  24   3401 ",
        " 3600xi",
    );
    match decode(&wrong_precision) {
        Err(CodecError::Malformed(message)) => {
            assert!(message.contains("2 decimal places in field dc_current"), "{message}")
        }
        other => panic!("unexpected result {other:?}"),
    }

    let not_a_number = legacy_frame(
        "010   4 486.8  1.29   6x7 236.0  2.43   558  24   3401 ",
        " 3600xi",
    );
    assert!(matches!(decode(&not_a_number), Err(CodecError::Malformed(_))));
}

#[test]
fn generic_element_count_must_match() {
    let frame = generic_frame("01n 21 3X24 4  214.7  1.97   421    0.0  0.04     0  231.1  0.80  234.1  0.79  234.4  0.81   421   413 0.735i  36.7   1640");
    match decode(&frame) {
        Err(CodecError::Malformed(message)) => {
            assert!(message.contains("expected 20 elements for type '3X24', got 21"), "{message}")
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn generic_cos_phi_suffix_is_checked() {
    let frame = generic_frame("01n 20 3X24 4  214.7  1.97   421    0.0  0.04     0  231.1  0.80  234.1  0.79  234.4  0.81   421   413 0.735y  36.7   1640");
    match decode(&frame) {
        Err(CodecError::Malformed(message)) => {
            assert!(message.contains("expected c, i or o"), "{message}")
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn generic_frame_with_missing_fields_is_malformed() {
    let frame = generic_frame("01n 20 3X24 4  214.7  1.97   421");
    assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
}

#[test]
fn generic_frame_with_bad_crc_digits_is_malformed() {
    let mut frame = GENERIC_FRAME.to_vec();
    let len = frame.len();
    frame[len - 5..len - 1].copy_from_slice(b"ZZZZ");
    assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
}

#[test]
fn encode_readings_query() {
    let frame = encode(address(1), Command::Readings, &[]).expect("encode");
    assert_eq!(frame, b"#010\r");

    let frame = QueryFrame::new(address(42), Command::Unit(3))
        .encode()
        .expect("encode");
    assert_eq!(frame, b"#423\r");

    let frame = encode(address(9), Command::SerialNumber, &[]).expect("encode");
    assert_eq!(frame, b"#09s\r");
}

#[test]
fn query_round_trip_preserves_fields() {
    let cases: [(u8, Command, &[u8]); 4] = [
        (1, Command::Readings, b""),
        (17, Command::Unit(2), b""),
        (99, Command::SerialNumber, b"ABC 123"),
        (50, Command::Generic, &[b'x'; MAX_PAYLOAD_LEN]),
    ];
    for (value, command, payload) in cases {
        let bytes = encode(address(value), command, payload).expect("encode");
        let query = decode_query(&bytes).expect("decode query");
        assert_eq!(query.address, address(value));
        assert_eq!(query.command, command);
        assert_eq!(query.payload, payload);
    }
}

#[test]
fn encode_rejects_invalid_payload() {
    let long = vec![b'x'; MAX_PAYLOAD_LEN + 1];
    assert!(matches!(
        encode(address(1), Command::Readings, &long),
        Err(CodecError::Encoding(_))
    ));
    assert!(matches!(
        encode(address(1), Command::Readings, b"a\rb"),
        Err(CodecError::Encoding(_))
    ));
    assert!(matches!(
        encode(address(1), Command::Unit(4), b""),
        Err(CodecError::Encoding(_))
    ));
}

#[test]
fn decode_query_is_all_or_nothing() {
    assert_eq!(decode_query(b"#01"), Err(CodecError::FrameTooShort));
    assert!(matches!(decode_query(b"#000\r"), Err(CodecError::Malformed(_))));
    assert!(matches!(decode_query(b"#01x\r"), Err(CodecError::UnknownCommand(b'x'))));
    assert!(matches!(decode_query(b"*010\r"), Err(CodecError::Malformed(_))));
}

#[test]
fn model_names_resolve() {
    assert_eq!(resolve_model_name("3X24"), Some("blueplanet 3.0NX3 M2"));
    assert_eq!(resolve_model_name("03X24"), Some("blueplanet 3.0NX3 M2"));
    assert_eq!(resolve_model_name("3600xi"), Some("Powador 3600xi"));
    assert_eq!(resolve_model_name("3x8k"), Some("Powador 25000xi"));
    assert_eq!(resolve_model_name("0000"), None);
    assert_eq!(resolve_model_name(""), None);
}
