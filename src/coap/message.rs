//! CoAP message codec (RFC 7252 §3).

use core::fmt;

use crate::{Error, Result};

/// Message types (RFC 7252 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// The method and response codes the agent deals in
/// (RFC 7252 §12.1.1, §12.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Empty,
    Get,
    Post,
    Put,
    Delete,
    Created,
    Deleted,
    Changed,
    Content,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Other(u8),
}

impl Code {
    pub fn from_u8(raw: u8) -> Code {
        match raw {
            0 => Code::Empty,
            1 => Code::Get,
            2 => Code::Post,
            3 => Code::Put,
            4 => Code::Delete,
            65 => Code::Created,
            66 => Code::Deleted,
            68 => Code::Changed,
            69 => Code::Content,
            128 => Code::BadRequest,
            132 => Code::NotFound,
            133 => Code::MethodNotAllowed,
            other => Code::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Code::Empty => 0,
            Code::Get => 1,
            Code::Post => 2,
            Code::Put => 3,
            Code::Delete => 4,
            Code::Created => 65,
            Code::Deleted => 66,
            Code::Changed => 68,
            Code::Content => 69,
            Code::BadRequest => 128,
            Code::NotFound => 132,
            Code::MethodNotAllowed => 133,
            Code::Other(other) => other,
        }
    }
}

impl fmt::Display for Code {
    /// The dotted `class.detail` form, e.g. `2.05`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let raw = self.as_u8();
        write!(f, "{}.{:02}", raw >> 5, raw & 0x1F)
    }
}

// Option numbers (RFC 7252 §5.10).
pub const OPTION_OBSERVE: u16 = 6;
pub const OPTION_LOCATION_PATH: u16 = 8;
pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;
pub const OPTION_URI_QUERY: u16 = 15;

// Content formats (RFC 7252 §12.3 and the OMA registry).
pub const CONTENT_FORMAT_LINK: u16 = 40;
pub const CONTENT_FORMAT_LWM2M_TLV: u16 = 11542;
pub const CONTENT_FORMAT_LWM2M_JSON: u16 = 11543;

/// Observe option register value (RFC 7641 §2).
pub const OBSERVE_REGISTER: u8 = 0;

// Option delta/length nibble encoding (RFC 7252 §3.1).
const OPT_EXT_BYTE: u8 = 13;
const OPT_EXT_WORD: u8 = 14;
const OPT_RESERVED: u8 = 15;
const OPT_BYTE_BASE: u16 = 13;
const OPT_WORD_BASE: u16 = 269;

const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LENGTH: usize = 8;

/// One option: a number and its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    pub number: u16,
    pub value: Vec<u8>,
}

impl Opt {
    pub fn new(number: u16, value: impl Into<Vec<u8>>) -> Opt {
        Opt {
            number,
            value: value.into(),
        }
    }
}

/// One CoAP message. The version field is fixed at 1 and not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<Opt>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Parses one datagram.
    pub fn parse(raw: &[u8]) -> Result<Message> {
        if raw.len() < 4 {
            return Err(Error::Protocol("short CoAP header".to_string()));
        }
        let mtype = MessageType::from_bits(raw[0] >> 4);
        let token_length = (raw[0] & 0x0F) as usize;
        if token_length > MAX_TOKEN_LENGTH {
            return Err(Error::Protocol("token too long".to_string()));
        }
        let code = Code::from_u8(raw[1]);
        let message_id = u16::from_be_bytes([raw[2], raw[3]]);
        let token = raw
            .get(4..4 + token_length)
            .ok_or_else(|| Error::Protocol("truncated token".to_string()))?
            .to_vec();

        let rest = &raw[4 + token_length..];
        let (options, consumed) = parse_options(rest)?;
        let payload = rest[consumed..].to_vec();

        Ok(Message {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Serializes the message, options sorted by number.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.token.len() + 16);
        out.push((1 << 6) | ((self.mtype as u8) << 4) | self.token.len() as u8);
        out.push(self.code.as_u8());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);
        out.extend_from_slice(&build_options(&self.options));
        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// The first option with this number, if any.
    pub fn option(&self, number: u16) -> Option<&Opt> {
        self.options.iter().find(|o| o.number == number)
    }

    /// Whether the message carries the observe option.
    pub fn is_observe(&self) -> bool {
        self.option(OPTION_OBSERVE).is_some()
    }
}

fn parse_options(raw: &[u8]) -> Result<(Vec<Opt>, usize)> {
    let mut options = Vec::new();
    let mut index = 0;
    let mut base = 0u16;
    while index < raw.len() && raw[index] != PAYLOAD_MARKER {
        let head = raw[index];
        index += 1;
        let (delta, after_delta) = decode_extended(head >> 4, raw, index)?;
        let (length, after_length) =
            decode_extended(head & 0x0F, raw, after_delta)?;
        index = after_length;

        let number = base.checked_add(delta).ok_or_else(|| {
            Error::Protocol("option number overflow".to_string())
        })?;
        let value = raw
            .get(index..index + length as usize)
            .ok_or_else(|| {
                Error::Protocol("truncated option value".to_string())
            })?
            .to_vec();
        index += length as usize;

        options.push(Opt { number, value });
        base = number;
    }
    // Consume the payload marker when present.
    if index < raw.len() {
        index += 1;
    }
    Ok((options, index))
}

/// Decodes one delta/length nibble plus its extension bytes
/// (13 ⇒ one byte + 13, 14 ⇒ two bytes + 269).
fn decode_extended(nibble: u8, raw: &[u8], index: usize) -> Result<(u16, usize)> {
    match nibble {
        OPT_EXT_BYTE => {
            let ext = *raw.get(index).ok_or_else(|| {
                Error::Protocol("truncated option header".to_string())
            })?;
            Ok((ext as u16 + OPT_BYTE_BASE, index + 1))
        }
        OPT_EXT_WORD => {
            let high = *raw.get(index).ok_or_else(|| {
                Error::Protocol("truncated option header".to_string())
            })?;
            let low = *raw.get(index + 1).ok_or_else(|| {
                Error::Protocol("truncated option header".to_string())
            })?;
            let value = u16::from_be_bytes([high, low])
                .checked_add(OPT_WORD_BASE)
                .ok_or_else(|| {
                    Error::Protocol("option number overflow".to_string())
                })?;
            Ok((value, index + 2))
        }
        OPT_RESERVED => {
            Err(Error::Protocol("reserved option nibble".to_string()))
        }
        inline => Ok((inline as u16, index)),
    }
}

/// Encodes one delta/length value into its nibble, pushing any extension
/// bytes onto `extensions`.
fn encode_extended(value: u16, extensions: &mut Vec<u8>) -> u8 {
    if value < OPT_BYTE_BASE {
        value as u8
    } else if value < OPT_WORD_BASE {
        extensions.push((value - OPT_BYTE_BASE) as u8);
        OPT_EXT_BYTE
    } else {
        extensions.extend_from_slice(&(value - OPT_WORD_BASE).to_be_bytes());
        OPT_EXT_WORD
    }
}

fn build_options(options: &[Opt]) -> Vec<u8> {
    let mut sorted: Vec<&Opt> = options.iter().collect();
    sorted.sort_by_key(|o| o.number);

    let mut out = Vec::new();
    let mut base = 0u16;
    for option in sorted {
        let mut extensions = Vec::new();
        let delta_nibble = encode_extended(option.number - base, &mut extensions);
        let length_nibble =
            encode_extended(option.value.len() as u16, &mut extensions);
        out.push((delta_nibble << 4) | length_nibble);
        out.extend_from_slice(&extensions);
        out.extend_from_slice(&option.value);
        base = option.number;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut options: Vec<Opt>) -> Vec<Opt> {
        options.sort_by_key(|o| o.number);
        options
    }

    #[test]
    fn header_roundtrip() {
        let message = Message {
            mtype: MessageType::Confirmable,
            code: Code::Post,
            message_id: 0x1234,
            token: vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11],
            options: vec![Opt::new(OPTION_URI_PATH, "rd")],
            payload: b"</3/0>".to_vec(),
        };
        let wire = message.to_bytes();
        assert_eq!(0x48, wire[0]);
        assert_eq!(0x02, wire[1]);
        assert_eq!([0x12, 0x34], [wire[2], wire[3]]);
        assert_eq!(message, Message::parse(&wire).unwrap());
    }

    #[test]
    fn option_encoding_is_idempotent() {
        // Unsorted on input, sorted by number after a roundtrip.
        let options = vec![
            Opt::new(OPTION_URI_QUERY, "ep=device"),
            Opt::new(OPTION_URI_PATH, "rd"),
            Opt::new(OPTION_OBSERVE, vec![0x00]),
            Opt::new(OPTION_URI_QUERY, "lt=60"),
            Opt::new(OPTION_CONTENT_FORMAT, vec![40]),
        ];
        let message = Message {
            mtype: MessageType::Confirmable,
            code: Code::Get,
            message_id: 1,
            token: Vec::new(),
            options: options.clone(),
            payload: Vec::new(),
        };
        let parsed = Message::parse(&message.to_bytes()).unwrap();
        assert_eq!(sorted(options), parsed.options);

        // Repeatable options keep their relative order.
        let queries: Vec<&[u8]> = parsed
            .options
            .iter()
            .filter(|o| o.number == OPTION_URI_QUERY)
            .map(|o| o.value.as_slice())
            .collect();
        assert_eq!(vec![&b"ep=device"[..], &b"lt=60"[..]], queries);
    }

    #[test]
    fn extended_deltas_and_lengths() {
        // Number 11542 needs a word delta; a 300-byte value needs a word
        // length; 20 needs a byte length.
        let options = vec![
            Opt::new(3, vec![0x55; 20]),
            Opt::new(11542, vec![0xAA; 300]),
        ];
        let message = Message {
            mtype: MessageType::NonConfirmable,
            code: Code::Content,
            message_id: 7,
            token: vec![0x01],
            options: options.clone(),
            payload: Vec::new(),
        };
        let parsed = Message::parse(&message.to_bytes()).unwrap();
        assert_eq!(options, parsed.options);
    }

    #[test]
    fn payload_marker() {
        let with_payload = Message {
            mtype: MessageType::Acknowledgement,
            code: Code::Content,
            message_id: 9,
            token: Vec::new(),
            options: vec![Opt::new(OPTION_CONTENT_FORMAT, vec![40])],
            payload: vec![0xC1, 0x03, 0x2A],
        };
        let wire = with_payload.to_bytes();
        assert!(wire.contains(&0xFF));
        assert_eq!(with_payload, Message::parse(&wire).unwrap());

        let empty = Message {
            payload: Vec::new(),
            ..with_payload
        };
        let wire = empty.to_bytes();
        assert_eq!(empty, Message::parse(&wire).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Message::parse(&[]).is_err());
        assert!(Message::parse(&[0x40, 0x01]).is_err());
        // Token length 9 is reserved.
        assert!(Message::parse(&[0x49, 0x01, 0x00, 0x01]).is_err());
        // Option value runs past the end.
        assert!(Message::parse(&[0x40, 0x01, 0x00, 0x01, 0xB5, 0x01]).is_err());
        // Reserved nibble 15 outside the payload marker.
        assert!(Message::parse(&[0x40, 0x01, 0x00, 0x01, 0xF0]).is_err());
    }

    #[test]
    fn code_display() {
        assert_eq!("2.05", Code::Content.to_string());
        assert_eq!("4.04", Code::NotFound.to_string());
        assert_eq!("0.02", Code::Post.to_string());
    }
}
