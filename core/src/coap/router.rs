//! Request routing.
//!
//! Both sides of the protocol run a router over one UDP socket: the server
//! exposes `/rd` and `/rd/:id`, the client exposes the object tree
//! (`/:object`, `/:object/:instance`, ...). Patterns are literal segments
//! plus `:name` captures; handlers are async trait objects.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::coap::message::{Message, Method, ResponseCode};
use crate::coap::request::{CoapRequest, CoapResponse};
use crate::coap::window::SlidingWindow;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed route pattern such as `/rd/:id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Segment-for-segment match; captures go into the returned map.
    pub fn matches(&self, path: &[String]) -> Option<HashMap<String, String>> {
        if self.segments.len() != path.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(expected) if expected == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), actual.clone());
                }
            }
        }
        Some(params)
    }
}

/// Async request handler. Implementations live behind `Box<dyn ..>` so the
/// router can hold heterogeneous handlers per method.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>>;
}

/// Adapter so free functions and closures can be mounted directly.
pub struct FnHandler<F>(pub F);

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(CoapRequest) -> BoxFuture<'static, Result<CoapResponse>> + Send + Sync,
{
    fn handle(&self, request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
        (self.0)(request)
    }
}

struct Route {
    pattern: PathPattern,
    handlers: HashMap<Method, Box<dyn RequestHandler>>,
}

/// Dispatches inbound requests to mounted handlers, answering the protocol
/// chores (ping, duplicates, unknown paths) itself.
pub struct Router {
    routes: Vec<Route>,
    windows: Mutex<HashMap<SocketAddr, SlidingWindow>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Mount `handler` for `method` under `pattern`, replacing any previous
    /// handler for the same pattern and method.
    pub fn set_handler(
        &mut self,
        pattern: &str,
        method: Method,
        handler: Box<dyn RequestHandler>,
    ) {
        let pattern = PathPattern::parse(pattern);
        if let Some(route) = self.routes.iter_mut().find(|r| r.pattern == pattern) {
            route.handlers.insert(method, handler);
            return;
        }
        let mut handlers = HashMap::new();
        handlers.insert(method, handler);
        self.routes.push(Route { pattern, handlers });
    }

    /// Answer one inbound message. `None` means nothing goes back on the
    /// wire: duplicates, and frames that are not requests.
    pub async fn dispatch(&self, message: Message, source: SocketAddr) -> Option<Message> {
        if message.is_ping() {
            debug!("ping from {source}, answering reset");
            return Some(Message::reset(message.message_id));
        }
        if !message.is_request() {
            return None;
        }
        {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(source).or_default();
            if !window.accept(message.message_id) {
                debug!("duplicate mid {:#06x} from {source}", message.message_id);
                return None;
            }
        }

        let mut request = match CoapRequest::from_message(message, source) {
            Ok(request) => request,
            Err(err) => {
                warn!("unroutable frame from {source}: {err}");
                return None;
            }
        };

        let mut path_matched = false;
        for route in &self.routes {
            let Some(params) = route.pattern.matches(&request.path) else {
                continue;
            };
            path_matched = true;
            let Some(handler) = route.handlers.get(&request.method) else {
                continue;
            };
            request.params = params;
            let response = match handler.handle(request.clone()).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        "{} {} from {source} failed: {err}",
                        request.method,
                        request.path_string()
                    );
                    CoapResponse::new(err.response_code())
                }
            };
            return Some(response.into_message(&request));
        }

        let code = if path_matched {
            ResponseCode::MethodNotAllowed
        } else {
            ResponseCode::NotFound
        };
        debug!(
            "{} {} from {source}: no handler, answering {code}",
            request.method,
            request.path_string()
        );
        Some(CoapResponse::new(code).into_message(&request))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
