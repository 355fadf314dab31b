//! Constrained Application Protocol plumbing shared by client and server.

pub mod message;
pub mod request;
pub mod router;
pub mod window;

pub use message::{
    Code, CoapOption, ContentFormat, Message, MessageId, MessageType, Method, OptionNumber,
    ResponseCode, Token, DEFAULT_PORT,
};
pub use request::{CoapRequest, CoapResponse};
pub use router::{FnHandler, PathPattern, RequestHandler, Router};
pub use window::SlidingWindow;
