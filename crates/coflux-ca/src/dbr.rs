//! Typed values and the raw-buffer codec.
//!
//! A PV value travels as an opaque byte buffer tagged with a [`DbrCode`]:
//! a basic type plus a format selecting how much auxiliary information
//! rides along. This module decodes such buffers into [`CaValue`]s and
//! encodes outgoing put payloads. The buffer layout (all little-endian) is
//! part of the provider contract:
//!
//! - `Raw`: the value array only.
//! - `Time`: `[secs u64][nanos u32][status i16][severity i16]`, then the
//!   value array.
//! - `Ctrl` (numeric): `[status i16][severity i16][precision i16]`,
//!   `[units: 8 bytes, NUL-padded]`, eight `f64` limits (display upper/
//!   lower, alarm upper, warning upper/lower, alarm lower, control
//!   upper/lower), then the value array.
//! - `Ctrl` (enum): `[status i16][severity i16][n u16]`, `n` enumeration
//!   strings of 26 bytes each, then the value array.
//!
//! Strings are fixed 40-byte NUL-padded fields, matching the native
//! maximum string size.

use std::fmt;

use crate::error::CaError;
use crate::provider::DataUpdate;

/// Maximum length of a native string value.
pub const MAX_STRING_SIZE: usize = 40;

/// Maximum length of an enumeration state string.
pub const MAX_ENUM_STRING_SIZE: usize = 26;

/// Basic native value type of a PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    /// 40-byte string.
    String,
    /// 16-bit signed integer.
    Short,
    /// 32-bit float.
    Float,
    /// Enumeration index.
    Enum,
    /// 8-bit unsigned integer.
    Char,
    /// 32-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
}

impl BasicType {
    fn index(self) -> u16 {
        match self {
            Self::String => 0,
            Self::Short => 1,
            Self::Float => 2,
            Self::Enum => 3,
            Self::Char => 4,
            Self::Long => 5,
            Self::Double => 6,
        }
    }

    fn from_index(index: u16) -> Option<Self> {
        Some(match index {
            0 => Self::String,
            1 => Self::Short,
            2 => Self::Float,
            3 => Self::Enum,
            4 => Self::Char,
            5 => Self::Long,
            6 => Self::Double,
            _ => return None,
        })
    }

    /// Size in bytes of one encoded element.
    fn element_size(self) -> usize {
        match self {
            Self::String => MAX_STRING_SIZE,
            Self::Short | Self::Enum => 2,
            Self::Float => 4,
            Self::Char => 1,
            Self::Long => 4,
            Self::Double => 8,
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Short => write!(f, "short"),
            Self::Float => write!(f, "float"),
            Self::Enum => write!(f, "enum"),
            Self::Char => write!(f, "char"),
            Self::Long => write!(f, "long"),
            Self::Double => write!(f, "double"),
        }
    }
}

/// How much auxiliary information accompanies the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Value only.
    #[default]
    Raw,
    /// Value with timestamp and alarm state.
    Time,
    /// Value with alarm state and channel properties.
    Ctrl,
}

/// A basic type paired with a format: the wire representation requested
/// from, or reported by, the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbrCode {
    /// Basic value type.
    pub basic: BasicType,
    /// Auxiliary-information format.
    pub format: Format,
}

impl DbrCode {
    /// The numeric wire code.
    pub fn code(self) -> u16 {
        let offset = match self.format {
            Format::Raw => 0,
            Format::Time => 14,
            Format::Ctrl => 28,
        };
        self.basic.index() + offset
    }

    /// Reconstruct from a numeric wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        let (format, index) = match code {
            0..=6 => (Format::Raw, code),
            14..=20 => (Format::Time, code - 14),
            28..=34 => (Format::Ctrl, code - 28),
            _ => return None,
        };
        Some(Self {
            basic: BasicType::from_index(index)?,
            format,
        })
    }
}

/// Select the wire code for a request: the requested datatype (or the
/// channel's native type) combined with the requested format. Control
/// format is not defined for strings; such requests fall back to the time
/// format.
pub(crate) fn request_code(
    native: BasicType,
    datatype: Option<BasicType>,
    format: Format,
) -> DbrCode {
    let basic = datatype.unwrap_or(native);
    let format = if basic == BasicType::String && format == Format::Ctrl {
        Format::Time
    } else {
        format
    };
    DbrCode { basic, format }
}

/// Typed array payload of a PV value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    /// String values.
    String(Vec<String>),
    /// 16-bit integers.
    Short(Vec<i16>),
    /// 32-bit floats.
    Float(Vec<f32>),
    /// Enumeration indices.
    Enum(Vec<u16>),
    /// Bytes.
    Char(Vec<u8>),
    /// 32-bit integers.
    Long(Vec<i32>),
    /// 64-bit floats.
    Double(Vec<f64>),
}

impl ArrayData {
    /// The basic type of this payload.
    pub fn basic_type(&self) -> BasicType {
        match self {
            Self::String(_) => BasicType::String,
            Self::Short(_) => BasicType::Short,
            Self::Float(_) => BasicType::Float,
            Self::Enum(_) => BasicType::Enum,
            Self::Char(_) => BasicType::Char,
            Self::Long(_) => BasicType::Long,
            Self::Double(_) => BasicType::Double,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Enum(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Double(v) => v.len(),
        }
    }

    /// Whether the payload holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First element as a float, when the payload is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::String(_) => None,
            Self::Short(v) => v.first().map(|&x| f64::from(x)),
            Self::Float(v) => v.first().map(|&x| f64::from(x)),
            Self::Enum(v) => v.first().map(|&x| f64::from(x)),
            Self::Char(v) => v.first().map(|&x| f64::from(x)),
            Self::Long(v) => v.first().map(|&x| f64::from(x)),
            Self::Double(v) => v.first().copied(),
        }
    }

    /// First element as an integer, when the payload is numeric.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::String(_) => None,
            Self::Short(v) => v.first().map(|&x| i64::from(x)),
            Self::Float(v) => v.first().map(|&x| x as i64),
            Self::Enum(v) => v.first().map(|&x| i64::from(x)),
            Self::Char(v) => v.first().map(|&x| i64::from(x)),
            Self::Long(v) => v.first().map(|&x| i64::from(x)),
            Self::Double(v) => v.first().map(|&x| x as i64),
        }
    }

    /// First element rendered as a string.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(v) => v.first().cloned(),
            Self::Short(v) => v.first().map(i16::to_string),
            Self::Float(v) => v.first().map(f32::to_string),
            Self::Enum(v) => v.first().map(u16::to_string),
            Self::Char(v) => v.first().map(u8::to_string),
            Self::Long(v) => v.first().map(i32::to_string),
            Self::Double(v) => v.first().map(f64::to_string),
        }
    }

    /// Coerce the payload to another basic type.
    ///
    /// Numeric conversions truncate the way `as` casts do; strings parse
    /// into numbers and numbers render into strings.
    pub fn convert_to(&self, target: BasicType) -> Result<ArrayData, String> {
        if self.basic_type() == target {
            return Ok(self.clone());
        }
        if target == BasicType::String {
            let rendered = match self {
                Self::String(v) => v.clone(),
                Self::Short(v) => v.iter().map(i16::to_string).collect(),
                Self::Float(v) => v.iter().map(f32::to_string).collect(),
                Self::Enum(v) => v.iter().map(u16::to_string).collect(),
                Self::Char(v) => v.iter().map(u8::to_string).collect(),
                Self::Long(v) => v.iter().map(i32::to_string).collect(),
                Self::Double(v) => v.iter().map(f64::to_string).collect(),
            };
            return Ok(Self::String(rendered));
        }

        let floats: Vec<f64> = match self {
            Self::String(v) => {
                let mut parsed = Vec::with_capacity(v.len());
                for s in v {
                    parsed.push(
                        s.trim()
                            .parse::<f64>()
                            .map_err(|_| format!("cannot convert {s:?} to {target}"))?,
                    );
                }
                parsed
            }
            Self::Short(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Self::Float(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Self::Enum(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Self::Char(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Self::Long(v) => v.iter().map(|&x| f64::from(x)).collect(),
            Self::Double(v) => v.clone(),
        };

        Ok(match target {
            BasicType::Short => Self::Short(floats.iter().map(|&x| x as i16).collect()),
            BasicType::Float => Self::Float(floats.iter().map(|&x| x as f32).collect()),
            BasicType::Enum => Self::Enum(floats.iter().map(|&x| x as u16).collect()),
            BasicType::Char => Self::Char(floats.iter().map(|&x| x as u8).collect()),
            BasicType::Long => Self::Long(floats.iter().map(|&x| x as i32).collect()),
            BasicType::Double => Self::Double(floats),
            BasicType::String => unreachable!("handled above"),
        })
    }
}

/// Value payload for a put, converted from the usual scalar and vector
/// types.
#[derive(Debug, Clone)]
pub struct PutValue {
    data: ArrayData,
}

impl PutValue {
    /// The typed payload.
    pub fn into_data(self) -> ArrayData {
        self.data
    }
}

impl From<ArrayData> for PutValue {
    fn from(data: ArrayData) -> Self {
        Self { data }
    }
}

macro_rules! put_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PutValue {
                fn from(value: $ty) -> Self {
                    Self { data: ArrayData::$variant(vec![value]) }
                }
            }

            impl From<Vec<$ty>> for PutValue {
                fn from(values: Vec<$ty>) -> Self {
                    Self { data: ArrayData::$variant(values) }
                }
            }
        )*
    };
}

put_value_from! {
    i16 => Short,
    f32 => Float,
    u16 => Enum,
    u8 => Char,
    i32 => Long,
    f64 => Double,
    String => String,
}

impl From<&str> for PutValue {
    fn from(value: &str) -> Self {
        Self {
            data: ArrayData::String(vec![value.to_string()]),
        }
    }
}

/// Native timestamp of a value: seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Whole seconds.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

/// Alarm state accompanying a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    /// Alarm status code.
    pub status: i16,
    /// Alarm severity code.
    pub severity: i16,
}

/// Channel properties reported with control-format values.
#[derive(Debug, Clone, PartialEq)]
pub struct CtrlInfo {
    /// Engineering units of the value.
    pub units: String,
    /// Display precision, for float and double channels.
    pub precision: Option<i16>,
    /// Upper display limit.
    pub upper_disp_limit: f64,
    /// Lower display limit.
    pub lower_disp_limit: f64,
    /// Upper alarm limit.
    pub upper_alarm_limit: f64,
    /// Upper warning limit.
    pub upper_warning_limit: f64,
    /// Lower warning limit.
    pub lower_warning_limit: f64,
    /// Lower alarm limit.
    pub lower_alarm_limit: f64,
    /// Upper control limit.
    pub upper_ctrl_limit: f64,
    /// Lower control limit.
    pub lower_ctrl_limit: f64,
    /// Enumeration state strings, for enum channels.
    pub enum_strings: Vec<String>,
}

/// A decoded PV value with whatever auxiliary information its format
/// carried.
#[derive(Debug, Clone, PartialEq)]
pub struct CaValue {
    /// Name of the PV this value belongs to.
    pub name: String,
    /// The typed array payload.
    pub data: ArrayData,
    /// Native timestamp, present for time-format values.
    pub timestamp: Option<Timestamp>,
    /// Alarm state, present for time- and ctrl-format values.
    pub alarm: Option<Alarm>,
    /// Channel properties, present for ctrl-format values.
    pub ctrl: Option<CtrlInfo>,
    /// How many native updates this delivery stands for. Always 1 except
    /// for coalesced monitor deliveries.
    pub update_count: u32,
}

impl CaValue {
    /// First element as a float, when numeric.
    pub fn as_f64(&self) -> Option<f64> {
        self.data.as_f64()
    }

    /// First element as an integer, when numeric.
    pub fn as_i64(&self) -> Option<i64> {
        self.data.as_i64()
    }

    /// First element rendered as a string.
    pub fn as_string(&self) -> Option<String> {
        self.data.as_string()
    }

    /// Number of elements in the payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self.offset + len;
        if end > self.bytes.len() {
            return Err(format!(
                "buffer truncated: wanted {} bytes at offset {}, have {}",
                len,
                self.offset,
                self.bytes.len()
            ));
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn i16(&mut self) -> Result<i16, String> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn fixed_string(&mut self, len: usize) -> Result<String, String> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        std::str::from_utf8(&raw[..end])
            .map(str::to_string)
            .map_err(|err| format!("invalid UTF-8 in string field: {err}"))
    }
}

/// Decode a raw update buffer into a typed value for `pv`.
pub(crate) fn decode(pv: &str, update: &DataUpdate) -> Result<CaValue, CaError> {
    decode_parts(update).map_err(|reason| CaError::Decode {
        pv: pv.to_string(),
        reason,
    }).map(|(data, timestamp, alarm, ctrl)| CaValue {
        name: pv.to_string(),
        data,
        timestamp,
        alarm,
        ctrl,
        update_count: 1,
    })
}

type DecodedParts = (
    ArrayData,
    Option<Timestamp>,
    Option<Alarm>,
    Option<CtrlInfo>,
);

fn decode_parts(update: &DataUpdate) -> Result<DecodedParts, String> {
    let mut cursor = Cursor::new(&update.bytes);
    let basic = update.code.basic;

    let (timestamp, alarm, ctrl) = match update.code.format {
        Format::Raw => (None, None, None),
        Format::Time => {
            let secs = cursor.u64()?;
            let nanos = cursor.u32()?;
            let status = cursor.i16()?;
            let severity = cursor.i16()?;
            (
                Some(Timestamp { secs, nanos }),
                Some(Alarm { status, severity }),
                None,
            )
        }
        Format::Ctrl => {
            let status = cursor.i16()?;
            let severity = cursor.i16()?;
            let ctrl = if basic == BasicType::Enum {
                let count = cursor.u16()? as usize;
                let mut enum_strings = Vec::with_capacity(count);
                for _ in 0..count {
                    enum_strings.push(cursor.fixed_string(MAX_ENUM_STRING_SIZE)?);
                }
                CtrlInfo {
                    units: String::new(),
                    precision: None,
                    upper_disp_limit: 0.0,
                    lower_disp_limit: 0.0,
                    upper_alarm_limit: 0.0,
                    upper_warning_limit: 0.0,
                    lower_warning_limit: 0.0,
                    lower_alarm_limit: 0.0,
                    upper_ctrl_limit: 0.0,
                    lower_ctrl_limit: 0.0,
                    enum_strings,
                }
            } else {
                let precision = cursor.i16()?;
                let units = cursor.fixed_string(8)?;
                CtrlInfo {
                    units,
                    precision: matches!(basic, BasicType::Float | BasicType::Double)
                        .then_some(precision),
                    upper_disp_limit: cursor.f64()?,
                    lower_disp_limit: cursor.f64()?,
                    upper_alarm_limit: cursor.f64()?,
                    upper_warning_limit: cursor.f64()?,
                    lower_warning_limit: cursor.f64()?,
                    lower_alarm_limit: cursor.f64()?,
                    upper_ctrl_limit: cursor.f64()?,
                    lower_ctrl_limit: cursor.f64()?,
                    enum_strings: Vec::new(),
                }
            };
            (None, Some(Alarm { status, severity }), Some(ctrl))
        }
    };

    let data = decode_values(basic, update.count, &mut cursor)?;
    Ok((data, timestamp, alarm, ctrl))
}

fn decode_values(
    basic: BasicType,
    count: usize,
    cursor: &mut Cursor<'_>,
) -> Result<ArrayData, String> {
    Ok(match basic {
        BasicType::String => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.fixed_string(MAX_STRING_SIZE)?);
            }
            ArrayData::String(values)
        }
        BasicType::Short => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.i16()?);
            }
            ArrayData::Short(values)
        }
        BasicType::Float => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(f32::from_le_bytes(cursor.take(4)?.try_into().unwrap()));
            }
            ArrayData::Float(values)
        }
        BasicType::Enum => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.u16()?);
            }
            ArrayData::Enum(values)
        }
        BasicType::Char => ArrayData::Char(cursor.take(count)?.to_vec()),
        BasicType::Long => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(i32::from_le_bytes(cursor.take(4)?.try_into().unwrap()));
            }
            ArrayData::Long(values)
        }
        BasicType::Double => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(cursor.f64()?);
            }
            ArrayData::Double(values)
        }
    })
}

/// Encode a raw (format-free) value array, the representation used for
/// puts.
pub(crate) fn encode_values(data: &ArrayData) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * data.basic_type().element_size());
    match data {
        ArrayData::String(values) => {
            for value in values {
                bytes.extend_from_slice(&fixed_string_bytes(value, MAX_STRING_SIZE));
            }
        }
        ArrayData::Short(values) => {
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ArrayData::Float(values) => {
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ArrayData::Enum(values) => {
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ArrayData::Char(values) => bytes.extend_from_slice(values),
        ArrayData::Long(values) => {
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        ArrayData::Double(values) => {
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    bytes
}

fn fixed_string_bytes(value: &str, len: usize) -> Vec<u8> {
    let mut field = vec![0u8; len];
    let raw = value.as_bytes();
    // Leave room for the terminating NUL.
    let copy = raw.len().min(len - 1);
    field[..copy].copy_from_slice(&raw[..copy]);
    field
}

/// Encode a full update buffer for the given code, with neutral metadata.
/// Test plumbing for provider mocks.
#[cfg(test)]
pub(crate) fn encode_update(
    code: DbrCode,
    data: &ArrayData,
    timestamp: Option<Timestamp>,
    alarm: Option<Alarm>,
    enum_strings: &[String],
) -> Vec<u8> {
    let mut bytes = Vec::new();
    match code.format {
        Format::Raw => {}
        Format::Time => {
            let timestamp = timestamp.unwrap_or(Timestamp { secs: 0, nanos: 0 });
            let alarm = alarm.unwrap_or(Alarm {
                status: 0,
                severity: 0,
            });
            bytes.extend_from_slice(&timestamp.secs.to_le_bytes());
            bytes.extend_from_slice(&timestamp.nanos.to_le_bytes());
            bytes.extend_from_slice(&alarm.status.to_le_bytes());
            bytes.extend_from_slice(&alarm.severity.to_le_bytes());
        }
        Format::Ctrl => {
            let alarm = alarm.unwrap_or(Alarm {
                status: 0,
                severity: 0,
            });
            bytes.extend_from_slice(&alarm.status.to_le_bytes());
            bytes.extend_from_slice(&alarm.severity.to_le_bytes());
            if code.basic == BasicType::Enum {
                bytes.extend_from_slice(&(enum_strings.len() as u16).to_le_bytes());
                for label in enum_strings {
                    bytes.extend_from_slice(&fixed_string_bytes(label, MAX_ENUM_STRING_SIZE));
                }
            } else {
                bytes.extend_from_slice(&0i16.to_le_bytes());
                bytes.extend_from_slice(&fixed_string_bytes("", 8));
                for _ in 0..8 {
                    bytes.extend_from_slice(&0f64.to_le_bytes());
                }
            }
        }
    }
    bytes.extend_from_slice(&encode_values(data));
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CaStatus;

    fn update(code: DbrCode, count: usize, bytes: Vec<u8>) -> DataUpdate {
        DataUpdate {
            code,
            count,
            bytes,
            status: CaStatus::Normal,
        }
    }

    #[test]
    fn test_code_round_trip() {
        for basic in [
            BasicType::String,
            BasicType::Short,
            BasicType::Float,
            BasicType::Enum,
            BasicType::Char,
            BasicType::Long,
            BasicType::Double,
        ] {
            for format in [Format::Raw, Format::Time, Format::Ctrl] {
                let code = DbrCode { basic, format };
                assert_eq!(DbrCode::from_code(code.code()), Some(code));
            }
        }
        assert_eq!(DbrCode::from_code(7), None);
        assert_eq!(DbrCode::from_code(99), None);
    }

    #[test]
    fn test_ctrl_string_request_falls_back_to_time() {
        let code = request_code(BasicType::String, None, Format::Ctrl);
        assert_eq!(code.format, Format::Time);
        let code = request_code(BasicType::Double, Some(BasicType::String), Format::Ctrl);
        assert_eq!(code.format, Format::Time);
    }

    #[test]
    fn test_decode_raw_doubles() {
        let code = DbrCode {
            basic: BasicType::Double,
            format: Format::Raw,
        };
        let data = ArrayData::Double(vec![1.5, -2.25, 1e10]);
        let value = decode("pv", &update(code, 3, encode_values(&data))).unwrap();
        assert_eq!(value.data, data);
        assert_eq!(value.timestamp, None);
        assert_eq!(value.alarm, None);
        assert_eq!(value.as_f64(), Some(1.5));
    }

    #[test]
    fn test_decode_time_long_carries_metadata() {
        let code = DbrCode {
            basic: BasicType::Long,
            format: Format::Time,
        };
        let data = ArrayData::Long(vec![42]);
        let timestamp = Timestamp {
            secs: 1_700_000_000,
            nanos: 125_000_000,
        };
        let alarm = Alarm {
            status: 3,
            severity: 1,
        };
        let bytes = encode_update(code, &data, Some(timestamp), Some(alarm), &[]);
        let value = decode("pv", &update(code, 1, bytes)).unwrap();
        assert_eq!(value.data, data);
        assert_eq!(value.timestamp, Some(timestamp));
        assert_eq!(value.alarm, Some(alarm));
    }

    #[test]
    fn test_decode_ctrl_enum_strings() {
        let code = DbrCode {
            basic: BasicType::Enum,
            format: Format::Ctrl,
        };
        let labels = vec!["closed".to_string(), "open".to_string()];
        let data = ArrayData::Enum(vec![1]);
        let bytes = encode_update(code, &data, None, None, &labels);
        let value = decode("valve", &update(code, 1, bytes)).unwrap();
        assert_eq!(value.as_i64(), Some(1));
        assert_eq!(value.ctrl.unwrap().enum_strings, labels);
    }

    #[test]
    fn test_decode_truncated_buffer_is_an_error() {
        let code = DbrCode {
            basic: BasicType::Double,
            format: Format::Raw,
        };
        let result = decode("pv", &update(code, 2, vec![0u8; 8]));
        assert!(matches!(result, Err(CaError::Decode { .. })));
    }

    #[test]
    fn test_decode_invalid_utf8_is_an_error() {
        let code = DbrCode {
            basic: BasicType::String,
            format: Format::Raw,
        };
        let mut bytes = vec![0xffu8; MAX_STRING_SIZE];
        bytes[MAX_STRING_SIZE - 1] = 0;
        let result = decode("pv", &update(code, 1, bytes));
        assert!(matches!(result, Err(CaError::Decode { .. })));
    }

    #[test]
    fn test_string_encoding_truncates_and_terminates() {
        let long = "x".repeat(60);
        let bytes = encode_values(&ArrayData::String(vec![long]));
        assert_eq!(bytes.len(), MAX_STRING_SIZE);
        assert_eq!(bytes[MAX_STRING_SIZE - 1], 0);
    }

    #[test]
    fn test_convert_numeric_and_string() {
        let data = ArrayData::Double(vec![3.7, -1.2]);
        assert_eq!(
            data.convert_to(BasicType::Long).unwrap(),
            ArrayData::Long(vec![3, -1])
        );
        let text = ArrayData::String(vec!["12.5".to_string()]);
        assert_eq!(
            text.convert_to(BasicType::Double).unwrap(),
            ArrayData::Double(vec![12.5])
        );
        assert!(text.convert_to(BasicType::Long).is_ok());
        let bad = ArrayData::String(vec!["not a number".to_string()]);
        assert!(bad.convert_to(BasicType::Double).is_err());
    }
}
