//! The LwM2M TLV resource encoding (OMA LwM2M 1.0 §6.4.3) and the
//! conversions between wire values and their human string form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::model::ResourceType;

/// Type-of-identifier bits of a TLV record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    ObjectInstance = 0,
    ResourceInstance = 1,
    MultipleResource = 2,
    Resource = 3,
}

impl TlvType {
    fn from_bits(bits: u8) -> TlvType {
        match bits & 0x03 {
            0 => TlvType::ObjectInstance,
            1 => TlvType::ResourceInstance,
            2 => TlvType::MultipleResource,
            _ => TlvType::Resource,
        }
    }
}

/// One TLV record.
///
/// `length` mirrors the wire length field as parsed; [`Tlv::marshal`]
/// derives it from the payload, so the two stay consistent for records
/// built through [`Tlv::new`] and [`Tlv::container`]. Container records
/// carry their children in `children` and marshal them in place of
/// `value`; the wire length field then equals the sum of the children's
/// marshalled lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub type_of_id: TlvType,
    pub id: u16,
    pub length: u32,
    pub value: Vec<u8>,
    pub children: Vec<Tlv>,
}

impl Tlv {
    /// A leaf record carrying raw value bytes.
    pub fn new(type_of_id: TlvType, id: u16, value: Vec<u8>) -> Tlv {
        Tlv {
            type_of_id,
            id,
            length: value.len() as u32,
            value,
            children: Vec::new(),
        }
    }

    /// A container record (object instance or multiple resource).
    pub fn container(type_of_id: TlvType, id: u16, children: Vec<Tlv>) -> Tlv {
        let length: usize = children.iter().map(Tlv::total_length).sum();
        Tlv {
            type_of_id,
            id,
            length: length as u32,
            value: Vec::new(),
            children,
        }
    }

    /// Serializes the record.
    pub fn marshal(&self) -> Vec<u8> {
        let body = if self.children.is_empty() {
            self.value.clone()
        } else {
            self.children.iter().flat_map(Tlv::marshal).collect()
        };
        let length = body.len() as u32;

        let mut out = Vec::with_capacity(6 + body.len());
        let mut head = (self.type_of_id as u8) << 6;

        if self.id > 0xFF {
            head |= 1 << 5;
        }
        match length {
            0..=0x07 => head |= length as u8,
            0x08..=0xFF => head |= 1 << 3,
            0x100..=0xFFFF => head |= 2 << 3,
            _ => head |= 3 << 3,
        }
        out.push(head);

        if self.id <= 0xFF {
            out.push(self.id as u8);
        } else {
            out.extend_from_slice(&self.id.to_be_bytes());
        }
        match length {
            0..=0x07 => {}
            0x08..=0xFF => out.push(length as u8),
            0x100..=0xFFFF => out.extend_from_slice(&(length as u16).to_be_bytes()),
            _ => out.extend_from_slice(&length.to_be_bytes()[1..4]),
        }
        out.extend_from_slice(&body);
        out
    }

    /// Parses one record from the front of `raw`, returning it together
    /// with the number of bytes consumed. `None` on any truncation before
    /// the value bytes are complete.
    pub fn unmarshal(raw: &[u8]) -> Option<(Tlv, usize)> {
        let head = *raw.first()?;
        let type_of_id = TlvType::from_bits(head >> 6);
        let mut index = 1;

        let id = if head & 0x20 == 0 {
            let id = *raw.get(index)? as u16;
            index += 1;
            id
        } else {
            let id = u16::from_be_bytes([*raw.get(index)?, *raw.get(index + 1)?]);
            index += 2;
            id
        };

        let length = match (head >> 3) & 0x03 {
            0 => (head & 0x07) as u32,
            1 => {
                let length = *raw.get(index)? as u32;
                index += 1;
                length
            }
            2 => {
                let length =
                    u16::from_be_bytes([*raw.get(index)?, *raw.get(index + 1)?])
                        as u32;
                index += 2;
                length
            }
            _ => {
                let length = u32::from_be_bytes([
                    0,
                    *raw.get(index)?,
                    *raw.get(index + 1)?,
                    *raw.get(index + 2)?,
                ]);
                index += 3;
                length
            }
        };

        let value = raw.get(index..index + length as usize)?.to_vec();
        index += length as usize;

        Some((
            Tlv {
                type_of_id,
                id,
                length,
                value,
                children: Vec::new(),
            },
            index,
        ))
    }

    /// The marshalled length of the record.
    pub fn total_length(&self) -> usize {
        let body_length = if self.children.is_empty() {
            self.value.len()
        } else {
            self.children.iter().map(Tlv::total_length).sum()
        };
        let id_width = if self.id <= 0xFF { 1 } else { 2 };
        let length_width = match body_length {
            0..=0x07 => 0,
            0x08..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        };
        1 + id_width + length_width + body_length
    }
}

/// Renders wire value bytes as the human string for the declared type.
pub fn value_to_string(buf: &[u8], kind: ResourceType) -> String {
    match kind {
        ResourceType::Integer | ResourceType::Time => match buf.len() {
            1 => (buf[0] as i8).to_string(),
            2 => i16::from_be_bytes([buf[0], buf[1]]).to_string(),
            4 => {
                i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).to_string()
            }
            8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(buf);
                i64::from_be_bytes(bytes).to_string()
            }
            _ => String::new(),
        },
        ResourceType::Float => match buf.len() {
            4 => {
                let bits = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                format_g(f32::from_bits(bits) as f64)
            }
            8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(buf);
                format_g(f64::from_bits(u64::from_be_bytes(bytes)))
            }
            _ => String::new(),
        },
        ResourceType::Boolean => {
            if buf.first() == Some(&1) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        ResourceType::Opaque => BASE64.encode(buf),
        ResourceType::Objlnk => {
            if buf.len() < 4 {
                return String::new();
            }
            let object = i16::from_be_bytes([buf[0], buf[1]]);
            let instance = i16::from_be_bytes([buf[2], buf[3]]);
            format!("{}:{}", object, instance)
        }
        ResourceType::String | ResourceType::None => {
            String::from_utf8_lossy(buf).into_owned()
        }
    }
}

/// Encodes a human string as wire value bytes for the declared type.
///
/// Integers take the narrowest of 1/2/4/8 bytes whose signed range
/// `[-2^(8k-1), 2^(8k-1))` contains the value; floats always take 8 bytes.
/// Unparsable numbers encode as zero.
pub fn string_to_value(value: &str, kind: ResourceType) -> Vec<u8> {
    match kind {
        ResourceType::Integer | ResourceType::Time => {
            let num: i64 = value.parse().unwrap_or_default();
            if i8::try_from(num).is_ok() {
                vec![num as u8]
            } else if i16::try_from(num).is_ok() {
                (num as i16).to_be_bytes().to_vec()
            } else if i32::try_from(num).is_ok() {
                (num as i32).to_be_bytes().to_vec()
            } else {
                num.to_be_bytes().to_vec()
            }
        }
        ResourceType::Float => {
            let num: f64 = value.parse().unwrap_or_default();
            num.to_bits().to_be_bytes().to_vec()
        }
        ResourceType::Boolean => {
            if value == "true" {
                vec![1]
            } else {
                vec![0]
            }
        }
        ResourceType::Opaque => BASE64.decode(value).unwrap_or_default(),
        ResourceType::Objlnk => {
            let mut parts = value.splitn(2, ':');
            let object: i16 =
                parts.next().and_then(|p| p.parse().ok()).unwrap_or_default();
            let instance: i16 =
                parts.next().and_then(|p| p.parse().ok()).unwrap_or_default();
            let mut out = Vec::with_capacity(4);
            out.extend_from_slice(&object.to_be_bytes());
            out.extend_from_slice(&instance.to_be_bytes());
            out
        }
        ResourceType::String | ResourceType::None => value.as_bytes().to_vec(),
    }
}

/// `%g`-style float formatting with six significant digits: fixed notation
/// while the decimal exponent is in `[-4, 6)`, scientific otherwise,
/// trailing zeros trimmed either way.
fn format_g(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let scientific = format!("{:.5e}", value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if !(-4..6).contains(&exponent) {
        let mantissa = trim_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_zeros(formatted: &str) -> &str {
    if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.')
    } else {
        formatted
    }
}
