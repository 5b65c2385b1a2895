pub mod bus;
pub mod client;
pub mod cluster;
pub mod registry;

use tracing::warn;

use crate::error::DecodeError;
use crate::zcl::AttributeValue;

/// Datapoint type codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    Bool = 0x01,
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    Bitmap = 0x05,
}

impl DpType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(DpType::Raw),
            0x01 => Some(DpType::Bool),
            0x02 => Some(DpType::Value),
            0x03 => Some(DpType::String),
            0x04 => Some(DpType::Enum),
            0x05 => Some(DpType::Bitmap),
            _ => None,
        }
    }
}

/// Decoded datapoint payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpPayload {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl DpPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            DpPayload::Bool(_) => "boolean",
            DpPayload::Int(_) => "integer",
            DpPayload::Text(_) => "string",
            DpPayload::Bytes(_) => "raw",
        }
    }
}

impl From<&DpPayload> for AttributeValue {
    fn from(payload: &DpPayload) -> Self {
        match payload {
            DpPayload::Bool(b) => AttributeValue::Bool(*b),
            DpPayload::Int(n) => AttributeValue::Int(*n),
            DpPayload::Text(s) => AttributeValue::Text(s.clone()),
            DpPayload::Bytes(b) => AttributeValue::Bytes(b.clone()),
        }
    }
}

/// One datapoint as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointReport {
    pub dp: u8,
    pub dp_type: DpType,
    pub payload: DpPayload,
}

impl DatapointReport {
    pub fn new(dp: u8, dp_type: DpType, payload: DpPayload) -> Self {
        Self { dp, dp_type, payload }
    }

    /// The payload as a number, for handlers that need one.
    pub fn numeric(&self) -> Result<i64, DecodeError> {
        match &self.payload {
            DpPayload::Int(n) => Ok(*n),
            other => Err(DecodeError::UnexpectedPayload {
                dp: self.dp,
                expected: "integer",
                found: other.kind(),
            }),
        }
    }
}

/// Vendor cluster command carrying datapoints (data report, data response,
/// active status report all share this layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointFrame {
    pub status: u8,
    pub tsn: u8,
    pub reports: Vec<DatapointReport>,
}

/// Decode `status, tsn` followed by datapoints until the end of the buffer.
/// Each datapoint is `dp, type, len (u16 BE), data`. A datapoint whose type or
/// payload is malformed is skipped; only truncation fails the frame.
pub fn parse_frame(bytes: &[u8]) -> Result<DatapointFrame, DecodeError> {
    let mut reader = Reader { bytes, pos: 0 };
    let status = reader.u8()?;
    let tsn = reader.u8()?;

    let mut reports = Vec::new();
    while !reader.is_empty() {
        let dp = reader.u8()?;
        let code = reader.u8()?;
        let len = reader.u16_be()? as usize;
        let data = reader.take(len)?;

        let decoded = DpType::from_code(code)
            .ok_or(DecodeError::UnknownType(code))
            .and_then(|dp_type| Ok((dp_type, decode_payload(dp, dp_type, data)?)));
        match decoded {
            Ok((dp_type, payload)) => reports.push(DatapointReport::new(dp, dp_type, payload)),
            Err(e) => warn!("Skipping datapoint {} in frame tsn={}: {}", dp, tsn, e),
        }
    }

    Ok(DatapointFrame {
        status,
        tsn,
        reports,
    })
}

fn decode_payload(dp: u8, dp_type: DpType, data: &[u8]) -> Result<DpPayload, DecodeError> {
    let invalid = |kind| DecodeError::InvalidLength {
        dp,
        kind,
        len: data.len(),
    };

    match dp_type {
        DpType::Raw => Ok(DpPayload::Bytes(data.to_vec())),
        DpType::Bool => match data {
            [b] => Ok(DpPayload::Bool(*b != 0)),
            _ => Err(invalid("bool")),
        },
        DpType::Value => {
            let raw: [u8; 4] = data.try_into().map_err(|_| invalid("value"))?;
            Ok(DpPayload::Int(i32::from_be_bytes(raw) as i64))
        }
        DpType::String => String::from_utf8(data.to_vec())
            .map(DpPayload::Text)
            .map_err(|_| DecodeError::InvalidUtf8(dp)),
        DpType::Enum => match data {
            [b] => Ok(DpPayload::Int(*b as i64)),
            _ => Err(invalid("enum")),
        },
        DpType::Bitmap => match data.len() {
            1 | 2 | 4 => Ok(DpPayload::Int(
                data.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64),
            )),
            _ => Err(invalid("bitmap")),
        },
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.bytes.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated {
                needed: n,
                available,
            });
        }
        let bytes = self.bytes;
        let slice = &bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
