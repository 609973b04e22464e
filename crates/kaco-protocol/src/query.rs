use types::DeviceAddress;

use crate::{CodecError, Command};

/// Longest payload accepted after the command byte.
pub const MAX_PAYLOAD_LEN: usize = 32;

const QUERY_START: u8 = b'#';
const FRAME_END: u8 = b'\r';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFrame {
    pub address: DeviceAddress,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl QueryFrame {
    pub fn new(address: DeviceAddress, command: Command) -> Self {
        Self {
            address,
            command,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self.address, self.command, &self.payload)
    }
}

/// Builds `#<AA><C><payload>\r`.
pub fn encode(
    address: DeviceAddress,
    command: Command,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if !command.is_valid() {
        return Err(CodecError::Encoding(format!("invalid command {command:?}")));
    }
    validate_payload(payload).map_err(CodecError::Encoding)?;

    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(QUERY_START);
    frame.extend_from_slice(address.to_string().as_bytes());
    frame.push(command.as_byte());
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    Ok(frame)
}

/// Parses a query frame as seen by an inverter on the bus.
pub fn decode_query(bytes: &[u8]) -> Result<QueryFrame, CodecError> {
    if bytes.len() < 5 {
        return Err(CodecError::FrameTooShort);
    }
    if bytes[0] != QUERY_START {
        return Err(CodecError::Malformed("expected '#' start marker".to_string()));
    }
    if bytes[bytes.len() - 1] != FRAME_END {
        return Err(CodecError::Malformed("expected '\\r' end marker".to_string()));
    }

    let address = parse_address(&bytes[1..3])?;
    let command = Command::from_byte(bytes[3])?;
    let payload = &bytes[4..bytes.len() - 1];
    validate_payload(payload).map_err(CodecError::Malformed)?;

    Ok(QueryFrame {
        address,
        command,
        payload: payload.to_vec(),
    })
}

fn validate_payload(payload: &[u8]) -> Result<(), String> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            payload.len()
        ));
    }
    if let Some(byte) = payload.iter().find(|byte| !(0x20..=0x7e).contains(*byte)) {
        return Err(format!("payload byte {byte:#04x} is not printable ASCII"));
    }
    Ok(())
}

/// Two ASCII digits, `01`..`99`.
pub(crate) fn parse_address(digits: &[u8]) -> Result<DeviceAddress, CodecError> {
    if digits.len() != 2 || !digits.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::Malformed(format!(
            "expected two address digits, got {digits:?}"
        )));
    }
    let value = (digits[0] - b'0') * 10 + (digits[1] - b'0');
    DeviceAddress::new(value).map_err(|err| CodecError::Malformed(err.to_string()))
}
