use types::{AcPhase, DcInput, DeviceAddress, Telemetry};

use crate::fields::{parse_cos_phi, parse_decimal, parse_int, parse_status, parse_text, Cursor};
use crate::query::parse_address;
use crate::{crc16_x25, legacy_checksum, CodecError, Command};

/// `\n*` + two address digits + command byte.
const HEADER_LEN: usize = 5;
const FRAME_END: u8 = b'\r';

/// Number of elements a generic-protocol reply announces, header fields
/// included.
pub const GENERIC_ELEMENT_COUNT: i64 = 20;

/// Field layouts of legacy readings replies. All fields are fixed width, so
/// each layout has exactly one frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyLayout {
    /// 00 and 02 series.
    Standard,
    /// XP series: wider fields and a trailing total yield.
    Xp,
    /// One unit of a 000xi three-unit inverter.
    Unit,
}

struct Widths {
    status: usize,
    dc_voltage: usize,
    dc_current: usize,
    dc_power: usize,
    ac_voltage: usize,
    ac_current: usize,
    ac_power: usize,
    temperature: usize,
    daily_yield: usize,
    inverter_type: usize,
    total_yield: Option<usize>,
}

impl Widths {
    fn before_checksum(&self) -> [usize; 9] {
        [
            self.status,
            self.dc_voltage,
            self.dc_current,
            self.dc_power,
            self.ac_voltage,
            self.ac_current,
            self.ac_power,
            self.temperature,
            self.daily_yield,
        ]
    }
}

impl LegacyLayout {
    fn widths(self) -> Widths {
        match self {
            LegacyLayout::Standard => Widths {
                status: 3,
                dc_voltage: 5,
                dc_current: 5,
                dc_power: 5,
                ac_voltage: 5,
                ac_current: 5,
                ac_power: 5,
                temperature: 3,
                daily_yield: 6,
                inverter_type: 6,
                total_yield: None,
            },
            LegacyLayout::Xp => Widths {
                status: 3,
                dc_voltage: 5,
                dc_current: 6,
                dc_power: 6,
                ac_voltage: 5,
                ac_current: 6,
                ac_power: 6,
                temperature: 2,
                daily_yield: 7,
                inverter_type: 6,
                total_yield: Some(9),
            },
            LegacyLayout::Unit => Widths {
                status: 3,
                dc_voltage: 5,
                dc_current: 5,
                dc_power: 6,
                ac_voltage: 5,
                ac_current: 5,
                ac_power: 6,
                temperature: 2,
                daily_yield: 6,
                inverter_type: 4,
                total_yield: None,
            },
        }
    }

    /// Offset of the space in front of the checksum byte. The checksum sums
    /// every byte after the leading `\n` up to and including this space.
    fn checksum_space(self) -> usize {
        HEADER_LEN
            + self
                .widths()
                .before_checksum()
                .iter()
                .map(|width| width + 1)
                .sum::<usize>()
    }

    /// Length of a frame cut off right after its checksum byte. Serial reads
    /// stop there when the checksum happens to be `\r`.
    fn partial_len(self) -> usize {
        self.checksum_space() + 2
    }

    pub fn frame_len(self) -> usize {
        let widths = self.widths();
        self.partial_len()
            + widths.inverter_type
            + 1
            + widths.total_yield.map(|width| width + 1).unwrap_or(0)
            + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Legacy readings; also used for the per-unit replies of 000xi inverters.
    Readings {
        layout: LegacyLayout,
        telemetry: Telemetry,
    },
    UnitsFollow,
    Generic(Telemetry),
    SerialNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub address: DeviceAddress,
    pub command: Command,
    /// False only for replies that carry no checksum at all.
    pub checksum_verified: bool,
    pub body: ResponseBody,
}

/// Decodes one complete reply. Checksums are verified before any field is
/// interpreted, and nothing is returned unless the whole frame is valid.
pub fn decode(frame: &[u8]) -> Result<ResponseFrame, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::FrameTooShort);
    }
    if frame[0] != b'\n' || frame[1] != b'*' {
        return Err(CodecError::Malformed("expected '\\n*' start marker".to_string()));
    }
    let command = Command::from_byte(frame[4])?;

    let (checksum_verified, body) = match command {
        Command::Readings => (
            true,
            decode_legacy(frame, &[LegacyLayout::Standard, LegacyLayout::Xp])?,
        ),
        Command::Unit(_) => (true, decode_legacy(frame, &[LegacyLayout::Unit])?),
        Command::UnitsFollow => (false, decode_units_follow(frame)?),
        Command::Generic => (true, decode_generic(frame)?),
        Command::SerialNumber => (true, decode_serial_number(frame)?),
    };
    let address = parse_address(&frame[2..4])?;

    Ok(ResponseFrame {
        address,
        command,
        checksum_verified,
        body,
    })
}

fn decode_legacy(frame: &[u8], layouts: &[LegacyLayout]) -> Result<ResponseBody, CodecError> {
    let matching = layouts
        .iter()
        .copied()
        .find(|layout| frame.len() == layout.partial_len() || frame.len() == layout.frame_len());
    let Some(layout) = matching else {
        let longest = layouts.iter().map(|layout| layout.frame_len()).max().unwrap_or(0);
        if frame.len() < longest && !frame.contains(&FRAME_END) {
            return Err(CodecError::FrameTooShort);
        }
        return Err(CodecError::Malformed(format!(
            "unexpected frame length {}",
            frame.len()
        )));
    };

    let space = layout.checksum_space();
    let expected = frame[space + 1];
    let actual = legacy_checksum(&frame[1..=space]);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch {
            expected: expected.into(),
            actual: actual.into(),
        });
    }

    let widths = layout.widths();
    let mut cursor = Cursor::new(frame, HEADER_LEN);
    let status = parse_status(cursor.fixed(widths.status)?)?;
    let dc_voltage = parse_decimal(cursor.fixed(widths.dc_voltage)?, Some(1), "dc_voltage")?;
    let dc_current = parse_decimal(cursor.fixed(widths.dc_current)?, Some(2), "dc_current")?;
    let dc_power = parse_int(cursor.fixed(widths.dc_power)?)? as f64;
    let ac_voltage = parse_decimal(cursor.fixed(widths.ac_voltage)?, Some(1), "ac_voltage")?;
    let ac_current = parse_decimal(cursor.fixed(widths.ac_current)?, Some(2), "ac_current")?;
    let ac_power = parse_int(cursor.fixed(widths.ac_power)?)? as f64;
    let temperature = parse_int(cursor.fixed(widths.temperature)?)? as f64;
    let daily_yield = parse_int(cursor.fixed(widths.daily_yield)?)? as f64;
    // checksum byte, already verified
    cursor.fixed(1)?;
    let inverter_type = parse_text(cursor.fixed(widths.inverter_type)?)?;
    let total_yield = match widths.total_yield {
        Some(width) => Some(parse_int(cursor.fixed(width)?)? as f64),
        None => None,
    };
    expect_end(frame, cursor.position())?;

    Ok(ResponseBody::Readings {
        layout,
        telemetry: Telemetry {
            status,
            inverter_type,
            dc_inputs: vec![DcInput {
                voltage_v: dc_voltage,
                current_a: dc_current,
                power_w: dc_power,
            }],
            ac_phases: vec![AcPhase {
                voltage_v: ac_voltage,
                current_a: ac_current,
            }],
            dc_power_w: dc_power,
            ac_power_w: ac_power,
            temperature_c: temperature,
            daily_yield_wh: daily_yield,
            total_yield_kwh: total_yield,
            cos_phi: None,
        },
    })
}

fn decode_units_follow(frame: &[u8]) -> Result<ResponseBody, CodecError> {
    expect_end(frame, HEADER_LEN)?;
    Ok(ResponseBody::UnitsFollow)
}

fn decode_generic(frame: &[u8]) -> Result<ResponseBody, CodecError> {
    let space = verify_crc(frame)?;
    let mut cursor = Cursor::new(&frame[..=space], HEADER_LEN);
    let telemetry = generic_fields(&mut cursor).map_err(missing_fields)?;
    expect_fields_consumed(&cursor, space)?;
    Ok(ResponseBody::Generic(telemetry))
}

fn generic_fields(cursor: &mut Cursor<'_>) -> Result<Telemetry, CodecError> {
    let element_count = parse_int(cursor.token()?)?;
    let inverter_type = parse_text(cursor.token()?)?;
    let status = parse_status(cursor.token()?)?;
    if element_count != GENERIC_ELEMENT_COUNT {
        return Err(CodecError::Malformed(format!(
            "expected {GENERIC_ELEMENT_COUNT} elements for type '{inverter_type}', got {element_count}"
        )));
    }

    let mut dc_inputs = Vec::with_capacity(2);
    for _ in 0..2 {
        dc_inputs.push(DcInput {
            voltage_v: parse_decimal(cursor.token()?, None, "dc_voltage")?,
            current_a: parse_decimal(cursor.token()?, None, "dc_current")?,
            power_w: parse_int(cursor.token()?)? as f64,
        });
    }
    let mut ac_phases = Vec::with_capacity(3);
    for _ in 0..3 {
        ac_phases.push(AcPhase {
            voltage_v: parse_decimal(cursor.token()?, None, "ac_voltage")?,
            current_a: parse_decimal(cursor.token()?, None, "ac_current")?,
        });
    }
    let dc_power = parse_int(cursor.token()?)? as f64;
    let ac_power = parse_int(cursor.token()?)? as f64;
    let cos_phi = parse_cos_phi(cursor.token()?)?;
    let temperature = parse_decimal(cursor.token()?, None, "device_temperature")?;
    let daily_yield = parse_int(cursor.token()?)? as f64;

    Ok(Telemetry {
        status,
        inverter_type,
        dc_inputs,
        ac_phases,
        dc_power_w: dc_power,
        ac_power_w: ac_power,
        temperature_c: temperature,
        daily_yield_wh: daily_yield,
        total_yield_kwh: None,
        cos_phi: Some(cos_phi),
    })
}

fn decode_serial_number(frame: &[u8]) -> Result<ResponseBody, CodecError> {
    let space = verify_crc(frame)?;
    let mut cursor = Cursor::new(&frame[..=space], HEADER_LEN);
    let serial_number = cursor
        .token()
        .and_then(parse_text)
        .map_err(missing_fields)?;
    expect_fields_consumed(&cursor, space)?;
    Ok(ResponseBody::SerialNumber(serial_number))
}

/// Checks the ` XXXX\r` trailer of a generic-protocol frame and returns the
/// offset of its leading space.
fn verify_crc(frame: &[u8]) -> Result<usize, CodecError> {
    if frame.last() != Some(&FRAME_END) {
        if frame.contains(&FRAME_END) {
            return Err(CodecError::Malformed("expected end-of-frame".to_string()));
        }
        return Err(CodecError::FrameTooShort);
    }
    if frame.len() < HEADER_LEN + 6 {
        return Err(CodecError::FrameTooShort);
    }

    let space = frame.len() - 6;
    if frame[space] != b' ' {
        return Err(CodecError::Malformed("expected ' ' before CRC".to_string()));
    }
    let hex = &frame[space + 1..space + 5];
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(CodecError::Malformed(format!("expected hex, got {hex:?}")));
    }
    let expected = hex
        .iter()
        .fold(0u16, |acc, digit| (acc << 4) | hex_value(*digit));
    let actual = crc16_x25(&frame[1..=space]);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }
    Ok(space)
}

fn hex_value(digit: u8) -> u16 {
    match digit {
        b'0'..=b'9' => u16::from(digit - b'0'),
        b'a'..=b'f' => u16::from(digit - b'a' + 10),
        _ => u16::from(digit - b'A' + 10),
    }
}

/// Inside a CRC-verified frame running out of bytes means fields are missing,
/// not that more data is on its way.
fn missing_fields(err: CodecError) -> CodecError {
    match err {
        CodecError::FrameTooShort => CodecError::Malformed("missing fields before CRC".to_string()),
        other => other,
    }
}

fn expect_fields_consumed(cursor: &Cursor<'_>, space: usize) -> Result<(), CodecError> {
    if cursor.position() != space {
        return Err(CodecError::Malformed("unexpected trailing fields".to_string()));
    }
    Ok(())
}

fn expect_end(frame: &[u8], position: usize) -> Result<(), CodecError> {
    match frame.get(position) {
        None => Err(CodecError::FrameTooShort),
        Some(&FRAME_END) if frame.len() == position + 1 => Ok(()),
        Some(&FRAME_END) => Err(CodecError::Malformed("expected end-of-frame".to_string())),
        Some(other) => Err(CodecError::Malformed(format!(
            "expected '\\r' at offset {position}, got {:?}",
            char::from(*other)
        ))),
    }
}
