//! Request/response views over raw messages.
//!
//! Handlers never touch message IDs or tokens; the router lifts an incoming
//! [`Message`] into a [`CoapRequest`], and folds the handler's
//! [`CoapResponse`] back down onto the originating exchange.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::coap::message::{
    Code, CoapOption, ContentFormat, Message, MessageType, Method, OptionNumber, ResponseCode,
};
use crate::error::{Error, Result};

/// An inbound request with its routing facts pre-extracted.
#[derive(Debug, Clone)]
pub struct CoapRequest {
    pub method: Method,
    /// Uri-Path segments, one per option instance.
    pub path: Vec<String>,
    /// Uri-Query pairs split at the first `=`.
    pub queries: Vec<(String, String)>,
    /// Named segments captured by the matched route pattern.
    pub params: HashMap<String, String>,
    pub source: SocketAddr,
    pub message: Message,
}

impl CoapRequest {
    pub fn from_message(message: Message, source: SocketAddr) -> Result<Self> {
        let method = match message.code {
            Code::Request(m) => m,
            other => return Err(Error::Format(format!("not a request: code {other}"))),
        };
        let path = message
            .options_of(OptionNumber::UriPath)
            .map(CoapOption::as_str)
            .collect();
        let queries = message.uri_queries();
        Ok(Self {
            method,
            path,
            queries,
            params: HashMap::new(),
            source,
            message,
        })
    }

    pub fn path_string(&self) -> String {
        let mut joined = String::new();
        for segment in &self.path {
            joined.push('/');
            joined.push_str(segment);
        }
        joined
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.queries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn observe(&self) -> Option<u32> {
        self.message.observe()
    }

    pub fn accept(&self) -> Option<ContentFormat> {
        self.message.accept()
    }

    pub fn content_format(&self) -> Option<ContentFormat> {
        self.message.content_format()
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }
}

/// What a handler produces. Turned into a piggybacked ACK for confirmable
/// requests and a NON response otherwise.
#[derive(Debug, Clone)]
pub struct CoapResponse {
    pub code: ResponseCode,
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl CoapResponse {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(code: ResponseCode, format: ContentFormat, payload: Bytes) -> Self {
        Self::new(code)
            .content_format(format)
            .payload(payload)
    }

    pub fn content_format(mut self, format: ContentFormat) -> Self {
        self.options
            .push(CoapOption::uint(OptionNumber::ContentFormat, format as u32));
        self
    }

    /// Split `path` on `/` into one Location-Path option per segment.
    pub fn location_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options
                .push(CoapOption::string(OptionNumber::LocationPath, segment));
        }
        self
    }

    pub fn observe(mut self, sequence: u32) -> Self {
        self.options
            .push(CoapOption::uint(OptionNumber::Observe, sequence));
        self
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn into_message(self, request: &CoapRequest) -> Message {
        let mtype = match request.message.mtype {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        Message {
            mtype,
            code: Code::Response(self.code),
            message_id: request.message.message_id,
            token: request.message.token.clone(),
            options: self.options,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::message::token_from_slice;

    fn localhost() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn incoming(method: Method) -> CoapRequest {
        let mut msg = Message::request(method, 42, token_from_slice(&[0x01]));
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "rd"));
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "5"));
        msg.push_option(CoapOption::string(OptionNumber::UriQuery, "lt=600"));
        msg.push_option(CoapOption::string(OptionNumber::UriQuery, "b"));
        CoapRequest::from_message(msg, localhost()).unwrap()
    }

    #[test]
    fn extracts_path_and_queries() {
        let req = incoming(Method::Post);
        assert_eq!(req.path, vec!["rd", "5"]);
        assert_eq!(req.path_string(), "/rd/5");
        assert_eq!(req.query("lt"), Some("600"));
        assert_eq!(req.query("b"), Some(""));
        assert_eq!(req.query("ep"), None);
    }

    #[test]
    fn refuses_non_requests() {
        let msg = Message::response(ResponseCode::Content, 1, token_from_slice(&[]));
        assert!(CoapRequest::from_message(msg, localhost()).is_err());
    }

    #[test]
    fn response_echoes_exchange_identity() {
        let req = incoming(Method::Post);
        let msg = CoapResponse::new(ResponseCode::Created)
            .location_path("rd/5")
            .into_message(&req);
        assert_eq!(msg.mtype, MessageType::Acknowledgement);
        assert_eq!(msg.message_id, 42);
        assert_eq!(msg.token.as_slice(), &[0x01]);
        let segments: Vec<String> = msg
            .options_of(OptionNumber::LocationPath)
            .map(CoapOption::as_str)
            .collect();
        assert_eq!(segments, vec!["rd", "5"]);
    }
}
