//! UDP endpoint: one socket, one receive loop, one router.
//!
//! Inbound datagrams are decoded once. Requests go through the
//! [`Router`]; responses are matched to a pending exchange by token and
//! forwarded over its channel. Outbound requests register an exchange
//! first, then write the datagram, then await the channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::coap::message::{Message, MessageId, Token, UDP_MESSAGE_LIMIT};
use crate::coap::router::Router;
use crate::error::{Error, Result};

/// Tuning knobs for an endpoint. Defaults follow the base protocol
/// parameters; tests shrink the timeout.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// How long to wait for the response to a confirmable request.
    pub ack_timeout: Duration,
    /// Channel depth for streaming exchanges (observations).
    pub exchange_depth: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            exchange_depth: 8,
        }
    }
}

type Exchanges = Arc<RwLock<HashMap<Vec<u8>, mpsc::Sender<Message>>>>;

/// A bound UDP socket plus the book-keeping both protocol roles need.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    exchanges: Exchanges,
    next_mid: AtomicU16,
    config: UdpConfig,
}

impl UdpEndpoint {
    pub async fn bind(addr: impl ToSocketAddrs, router: Router) -> Result<Self> {
        Self::bind_with(addr, router, UdpConfig::default()).await
    }

    pub async fn bind_with(
        addr: impl ToSocketAddrs,
        router: Router,
        config: UdpConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("endpoint bound on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            router: Arc::new(router),
            exchanges: Arc::new(RwLock::new(HashMap::new())),
            next_mid: AtomicU16::new(rand::random()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop. Dropping the handle detaches the loop; the
    /// owner must call `abort` on it to shut the endpoint down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_MESSAGE_LIMIT];
            loop {
                let (len, peer) = match endpoint.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        error!("socket receive failed: {err}");
                        continue;
                    }
                };
                trace!("rx {len} bytes from {peer}: {}", hex::encode(&buf[..len]));
                let message = match Message::decode(&buf[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("dropping undecodable datagram from {peer}: {err}");
                        continue;
                    }
                };
                if message.is_response() {
                    endpoint.deliver_response(message).await;
                    continue;
                }
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    if let Some(reply) = endpoint.router.dispatch(message, peer).await {
                        if let Err(err) = endpoint.send(&reply, peer).await {
                            warn!("failed to answer {peer}: {err}");
                        }
                    }
                });
            }
        })
    }

    pub async fn send(&self, message: &Message, peer: SocketAddr) -> Result<()> {
        let bytes = message.to_bytes();
        trace!("tx {} bytes to {peer}: {}", bytes.len(), hex::encode(&bytes));
        self.socket.send_to(&bytes, peer).await?;
        Ok(())
    }

    /// One-shot exchange: send a confirmable request, await its response.
    pub async fn request(&self, message: Message, peer: SocketAddr) -> Result<Message> {
        let key = message.token.to_vec();
        let mut rx = self.register_exchange(&key, 1).await;
        self.send(&message, peer).await?;
        let outcome = timeout(self.config.ack_timeout, rx.recv()).await;
        self.exchanges.write().await.remove(&key);
        match outcome {
            Ok(Some(reply)) => Ok(reply),
            _ => Err(Error::ClientConnection(format!(
                "no response from {peer} within {:?}",
                self.config.ack_timeout
            ))),
        }
    }

    /// Long-lived exchange: send the request, await the first response, and
    /// keep the channel open for follow-up messages bearing the same token.
    /// The caller owns the receiver and must [`Self::cancel_exchange`] when
    /// finished listening.
    pub async fn request_streaming(
        &self,
        message: Message,
        peer: SocketAddr,
    ) -> Result<(Message, mpsc::Receiver<Message>)> {
        let key = message.token.to_vec();
        let mut rx = self
            .register_exchange(&key, self.config.exchange_depth)
            .await;
        self.send(&message, peer).await?;
        match timeout(self.config.ack_timeout, rx.recv()).await {
            Ok(Some(first)) => Ok((first, rx)),
            _ => {
                self.exchanges.write().await.remove(&key);
                Err(Error::ClientConnection(format!(
                    "no response from {peer} within {:?}",
                    self.config.ack_timeout
                )))
            }
        }
    }

    pub async fn cancel_exchange(&self, token: &Token) {
        self.exchanges.write().await.remove(&token.to_vec());
    }

    pub fn new_message_id(&self) -> MessageId {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_token(&self) -> Token {
        let raw: [u8; 8] = rand::random();
        crate::coap::message::token_from_slice(&raw)
    }

    async fn register_exchange(&self, key: &[u8], depth: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        self.exchanges.write().await.insert(key.to_vec(), tx);
        rx
    }

    async fn deliver_response(&self, message: Message) {
        let key = message.token.to_vec();
        let tx = { self.exchanges.read().await.get(&key).cloned() };
        match tx {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    // Receiver went away; drop the stale exchange.
                    self.exchanges.write().await.remove(&key);
                }
            }
            None => trace!("response with unknown token {}", hex::encode(&key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::message::{
        Code, CoapOption, MessageType, Method, OptionNumber, ResponseCode,
    };
    use crate::coap::request::{CoapRequest, CoapResponse};
    use crate::coap::router::RequestHandler;
    use bytes::Bytes;
    use futures_util::future::BoxFuture;

    struct Hello;

    impl RequestHandler for Hello {
        fn handle(&self, _request: CoapRequest) -> BoxFuture<'_, Result<CoapResponse>> {
            Box::pin(async {
                Ok(CoapResponse::new(ResponseCode::Content).payload(Bytes::from_static(b"hi")))
            })
        }
    }

    fn quick() -> UdpConfig {
        UdpConfig {
            ack_timeout: Duration::from_millis(250),
            ..UdpConfig::default()
        }
    }

    async fn endpoint_with_hello() -> Arc<UdpEndpoint> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut router = Router::new();
        router.set_handler("/hello", Method::Get, Box::new(Hello));
        let endpoint = Arc::new(
            UdpEndpoint::bind_with("127.0.0.1:0", router, quick())
                .await
                .unwrap(),
        );
        endpoint.start();
        endpoint
    }

    #[tokio::test]
    async fn request_reaches_handler_and_returns() {
        let server = endpoint_with_hello().await;
        let client = Arc::new(
            UdpEndpoint::bind_with("127.0.0.1:0", Router::new(), quick())
                .await
                .unwrap(),
        );
        client.start();

        let mut msg = Message::request(Method::Get, client.new_message_id(), client.new_token());
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "hello"));
        let reply = client
            .request(msg, server.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(reply.code, Code::Response(ResponseCode::Content));
        assert_eq!(&reply.payload[..], b"hi");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Bound but never started, so nothing answers.
        let mute = UdpEndpoint::bind_with("127.0.0.1:0", Router::new(), quick())
            .await
            .unwrap();
        let client = Arc::new(
            UdpEndpoint::bind_with("127.0.0.1:0", Router::new(), quick())
                .await
                .unwrap(),
        );
        client.start();

        let msg = Message::request(Method::Get, client.new_message_id(), client.new_token());
        let err = client
            .request(msg, mute.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientConnection(_)));
    }

    #[tokio::test]
    async fn streaming_exchange_sees_follow_ups() {
        let server = endpoint_with_hello().await;
        let client = Arc::new(
            UdpEndpoint::bind_with("127.0.0.1:0", Router::new(), quick())
                .await
                .unwrap(),
        );
        client.start();
        let client_addr = client.local_addr().unwrap();

        let mut msg = Message::request(Method::Get, client.new_message_id(), client.new_token());
        msg.push_option(CoapOption::string(OptionNumber::UriPath, "hello"));
        let token = msg.token.clone();
        let (first, mut rx) = client
            .request_streaming(msg, server.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(first.code, Code::Response(ResponseCode::Content));

        // A later unsolicited message with the same token flows down the
        // same channel, which is how notifications arrive.
        let mut notify = Message {
            mtype: MessageType::NonConfirmable,
            code: Code::Response(ResponseCode::Content),
            message_id: server.new_message_id(),
            token,
            options: Vec::new(),
            payload: Bytes::from_static(b"22.5"),
        };
        notify.push_option(CoapOption::uint(OptionNumber::Observe, 1));
        server.send(&notify, client_addr).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(&received.payload[..], b"22.5");
        client.cancel_exchange(&received.token).await;
    }
}
