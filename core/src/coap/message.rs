//! CoAP message model and wire codec (RFC 7252 framing).
//!
//! Message format (3):
//!
//! - 01 Version (2 bits) | Type (2 bits) | Token Length (4 bits)
//! - 01 Code (class 3 bits, detail 5 bits)
//! - 02 Message ID (big-endian)
//! - 0..8 Token
//! - vr Options (delta-encoded, ascending option number)
//! - 01 `0xFF` payload marker [opt]
//! - vr Payload [opt]
//!
//! Reliability (retransmission, congestion control) is deliberately not
//! handled here; this layer only frames and unframes datagrams.

use core::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num::FromPrimitive;
use num_derive::FromPrimitive;

use crate::error::{Error, Result};

/// Only protocol version in existence.
pub const COAP_VERSION: u8 = 1;

/// Default CoAP UDP port.
pub const DEFAULT_PORT: u16 = 5683;

/// Practical datagram ceiling for decode buffers.
pub const UDP_MESSAGE_LIMIT: usize = 1152;

/// CoAP tokens are 0..=8 bytes (4.2).
pub type Token = heapless::Vec<u8, 8>;

pub type MessageId = u16;

#[repr(u8)]
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

#[repr(u8)]
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get = 0x01,
    Post = 0x02,
    Put = 0x03,
    Delete = 0x04,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        write!(f, "{name}")
    }
}

/// Response codes used by the registration, device-management and reporting
/// interfaces. Encoded `class << 5 | detail`, bit-exact on the wire.
#[repr(u8)]
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Created = 0x41,
    Deleted = 0x42,
    Valid = 0x43,
    Changed = 0x44,
    Content = 0x45,
    BadRequest = 0x80,
    Unauthorized = 0x81,
    BadOption = 0x82,
    Forbidden = 0x83,
    NotFound = 0x84,
    MethodNotAllowed = 0x85,
    NotAcceptable = 0x86,
    PreconditionFailed = 0x8C,
    UnsupportedContentFormat = 0x8F,
    InternalServerError = 0xA0,
    NotImplemented = 0xA1,
}

impl ResponseCode {
    pub const fn class(self) -> u8 {
        (self as u8) >> 5
    }

    pub const fn detail(self) -> u8 {
        (self as u8) & 0x1F
    }

    /// `2.0x` success class.
    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// The 8-bit code field covers requests, responses and the empty ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Empty,
    Request(Method),
    Response(ResponseCode),
}

impl Code {
    pub fn from_u8(raw: u8) -> Result<Self> {
        if raw == 0 {
            return Ok(Code::Empty);
        }
        match raw >> 5 {
            0 => Method::from_u8(raw)
                .map(Code::Request)
                .ok_or_else(|| Error::Format(format!("unknown method code {raw:#04x}"))),
            2 | 4 | 5 => ResponseCode::from_u8(raw)
                .map(Code::Response)
                .ok_or_else(|| Error::Format(format!("unknown response code {raw:#04x}"))),
            class => Err(Error::Format(format!("reserved code class {class}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Code::Empty => 0,
            Code::Request(m) => m as u8,
            Code::Response(c) => c as u8,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Empty => write!(f, "0.00"),
            Code::Request(m) => write!(f, "{m}"),
            Code::Response(c) => write!(f, "{c}"),
        }
    }
}

/// Option numbers this core reads or writes (5.10).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionNumber {
    Observe = 6,
    LocationPath = 8,
    UriPath = 11,
    ContentFormat = 12,
    MaxAge = 14,
    UriQuery = 15,
    Accept = 17,
    LocationQuery = 20,
    ProxyUri = 35,
}

/// Content formats negotiated by the protocol. The 154x block are the
/// OMA-registered media types.
#[repr(u16)]
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain = 0,
    LinkFormat = 40,
    Json = 50,
    Lwm2mText = 1541,
    Lwm2mTlv = 1542,
    Lwm2mJson = 1543,
    Lwm2mOpaque = 1544,
}

/// A single option instance: raw number plus raw value bytes. Repeatable
/// options (Uri-Path, Uri-Query, Location-Path) appear once per segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: OptionNumber, value: Vec<u8>) -> Self {
        Self {
            number: number as u16,
            value,
        }
    }

    pub fn string(number: OptionNumber, value: &str) -> Self {
        Self::new(number, value.as_bytes().to_vec())
    }

    /// Unsigned option value in minimal big-endian length; zero is empty.
    pub fn uint(number: OptionNumber, value: u32) -> Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        Self::new(number, bytes[skip..].to_vec())
    }

    pub fn as_uint(&self) -> u32 {
        self.value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
    }

    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// A decoded CoAP message. Construction helpers cover the shapes the
/// registration, management and reporting interfaces exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: MessageId,
    pub token: Token,
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl Message {
    pub fn request(method: Method, message_id: MessageId, token: Token) -> Self {
        Self {
            mtype: MessageType::Confirmable,
            code: Code::Request(method),
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn response(code: ResponseCode, message_id: MessageId, token: Token) -> Self {
        Self {
            mtype: MessageType::Acknowledgement,
            code: Code::Response(code),
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Protocol-level reset, the answer to a CoAP ping.
    pub fn reset(message_id: MessageId) -> Self {
        Self {
            mtype: MessageType::Reset,
            code: Code::Empty,
            message_id,
            token: Token::new(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// An empty confirmable message with no token: the CoAP ping.
    pub fn is_ping(&self) -> bool {
        self.mtype == MessageType::Confirmable && self.code == Code::Empty
    }

    pub fn is_request(&self) -> bool {
        matches!(self.code, Code::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.code, Code::Response(_))
    }

    /// First option with the given number.
    pub fn option(&self, number: OptionNumber) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number as u16)
    }

    /// All options with the given number, in wire order.
    pub fn options_of(&self, number: OptionNumber) -> impl Iterator<Item = &CoapOption> {
        let num = number as u16;
        self.options.iter().filter(move |o| o.number == num)
    }

    pub fn push_option(&mut self, option: CoapOption) {
        self.options.push(option);
    }

    /// Replace every instance of `number` with the single given value.
    pub fn set_option(&mut self, option: CoapOption) {
        self.options.retain(|o| o.number != option.number);
        self.options.push(option);
    }

    pub fn observe(&self) -> Option<u32> {
        self.option(OptionNumber::Observe).map(CoapOption::as_uint)
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option(OptionNumber::ContentFormat)
            .and_then(|o| ContentFormat::from_u32(o.as_uint()))
    }

    pub fn accept(&self) -> Option<ContentFormat> {
        self.option(OptionNumber::Accept)
            .and_then(|o| ContentFormat::from_u32(o.as_uint()))
    }

    /// Uri-Path segments joined to `/a/b/c`.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.options_of(OptionNumber::UriPath) {
            path.push('/');
            path.push_str(&segment.as_str());
        }
        path
    }

    /// Uri-Query options split at the first `=`.
    pub fn uri_queries(&self) -> Vec<(String, String)> {
        self.options_of(OptionNumber::UriQuery)
            .map(|o| {
                let raw = o.as_str();
                match raw.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (raw, String::new()),
                }
            })
            .collect()
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8((COAP_VERSION << 6) | ((self.mtype as u8) << 4) | self.token.len() as u8);
        out.put_u8(self.code.as_u8());
        out.put_u16(self.message_id);
        out.put_slice(&self.token);

        let mut sorted: Vec<&CoapOption> = self.options.iter().collect();
        sorted.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for option in sorted {
            let delta = option.number - previous;
            let length = option.value.len();
            let (delta_nibble, delta_ext) = Self::split_varint(delta as u32);
            let (length_nibble, length_ext) = Self::split_varint(length as u32);
            out.put_u8((delta_nibble << 4) | length_nibble);
            out.put_slice(&delta_ext);
            out.put_slice(&length_ext);
            out.put_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            out.put_u8(0xFF);
            out.put_slice(&self.payload);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64 + self.payload.len());
        self.encode(&mut out);
        out.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Format("datagram shorter than CoAP header".into()));
        }
        let first = buf.get_u8();
        let version = first >> 6;
        if version != COAP_VERSION {
            return Err(Error::Format(format!("unsupported CoAP version {version}")));
        }
        let mtype = MessageType::from_u8((first >> 4) & 0b11)
            .ok_or_else(|| Error::Format("invalid message type".into()))?;
        let token_length = (first & 0x0F) as usize;
        if token_length > 8 {
            return Err(Error::Format(format!("token length {token_length} > 8")));
        }
        let code = Code::from_u8(buf.get_u8())?;
        let message_id = buf.get_u16();
        if buf.remaining() < token_length {
            return Err(Error::Format("datagram truncated inside token".into()));
        }
        let mut token = Token::new();
        for _ in 0..token_length {
            // Capacity is 8 and token_length is checked above.
            let _ = token.push(buf.get_u8());
        }

        let mut options = Vec::new();
        let mut number = 0u16;
        let payload = loop {
            if !buf.has_remaining() {
                break Bytes::new();
            }
            let byte = buf.get_u8();
            if byte == 0xFF {
                if !buf.has_remaining() {
                    return Err(Error::Format("payload marker with empty payload".into()));
                }
                break Bytes::copy_from_slice(buf);
            }
            let delta = Self::read_varint(byte >> 4, &mut buf)?;
            let length = Self::read_varint(byte & 0x0F, &mut buf)? as usize;
            // Deltas reach 65804, so the sum must be checked before it
            // narrows back to an option number.
            number = u16::try_from(number as u32 + delta)
                .map_err(|_| Error::Format("option number overflow".into()))?;
            if buf.remaining() < length {
                return Err(Error::Format("datagram truncated inside option".into()));
            }
            let mut value = vec![0u8; length];
            buf.copy_to_slice(&mut value);
            options.push(CoapOption { number, value });
        };

        Ok(Self {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Option delta/length encoding (3.1): values below 13 fit the nibble,
    /// 13 adds one extension byte, 14 adds two. 15 is reserved.
    fn split_varint(value: u32) -> (u8, Vec<u8>) {
        if value < 13 {
            (value as u8, Vec::new())
        } else if value < 269 {
            (13, vec![(value - 13) as u8])
        } else {
            (14, ((value - 269) as u16).to_be_bytes().to_vec())
        }
    }

    fn read_varint(nibble: u8, buf: &mut &[u8]) -> Result<u32> {
        match nibble {
            n @ 0..=12 => Ok(n as u32),
            13 => {
                if !buf.has_remaining() {
                    return Err(Error::Format("truncated option extension".into()));
                }
                Ok(buf.get_u8() as u32 + 13)
            }
            14 => {
                if buf.remaining() < 2 {
                    return Err(Error::Format("truncated option extension".into()));
                }
                Ok(buf.get_u16() as u32 + 269)
            }
            _ => Err(Error::Format("reserved option nibble 15".into())),
        }
    }
}

pub fn token_from_slice(bytes: &[u8]) -> Token {
    let mut token = Token::new();
    for b in bytes.iter().take(8) {
        let _ = token.push(*b);
    }
    token
}
