//! Information reporting: server-side observations.
//!
//! An observation is a streaming exchange. The initial GET carries
//! Observe 0; the device answers with the current value and then pushes
//! non-confirmable notifications bearing the same token. Each active
//! observation owns a forwarding task that lifts those messages into
//! [`Notification`]s on a channel the caller consumes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use lwm2m_core::coap::message::{
    CoapOption, ContentFormat, Message, Method, OptionNumber, ResponseCode, Token,
};
use lwm2m_core::error::{Error, Result};
use lwm2m_core::transport::UdpEndpoint;
use lwm2m_core::ObjectUri;

use crate::device_registry::DeviceRegistry;
use crate::management::{device_request, remote};

/// Channel depth per observation before back-pressure drops the stream.
const NOTIFICATION_DEPTH: usize = 16;

/// One value report pushed by a device under an active observation.
#[derive(Debug, Clone)]
pub struct Notification {
    pub device_id: u64,
    pub uri: ObjectUri,
    /// Device-side sequence number from the Observe option.
    pub sequence: u32,
    pub format: Option<ContentFormat>,
    pub payload: Bytes,
}

struct ActiveObservation {
    device_id: u64,
    uri: ObjectUri,
    peer: SocketAddr,
    token: Token,
    task: JoinHandle<()>,
}

fn key(device_id: u64, uri: &ObjectUri) -> String {
    format!("{device_id}:{uri}")
}

/// All observations this server currently holds, across all devices.
pub struct Observations {
    endpoint: OnceCell<Arc<UdpEndpoint>>,
    registry: Arc<DeviceRegistry>,
    active: Mutex<HashMap<String, ActiveObservation>>,
}

impl Observations {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            endpoint: OnceCell::new(),
            registry,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Hand over the transport once it exists. Must happen before the
    /// first [`Self::observe`].
    pub fn attach(&self, endpoint: Arc<UdpEndpoint>) {
        let _ = self.endpoint.set(endpoint);
    }

    fn endpoint(&self) -> Result<&Arc<UdpEndpoint>> {
        self.endpoint
            .get()
            .ok_or_else(|| Error::ClientConnection("transport not started".into()))
    }

    /// Start observing `uri` on a device. Returns the initial value and
    /// the notification stream. Observing a target twice replaces the
    /// first observation; its receiver goes quiet.
    pub async fn observe(
        &self,
        device_id: u64,
        uri: ObjectUri,
    ) -> Result<(Bytes, mpsc::Receiver<Notification>)> {
        let endpoint = self.endpoint()?;
        let device = self.registry.get(device_id).await?;
        let mut message = device_request(endpoint, Method::Get, &uri);
        message.push_option(CoapOption::uint(OptionNumber::Observe, 0));
        let token = message.token.clone();

        let (first, stream) = endpoint.request_streaming(message, device.address).await?;
        let first = match remote(&uri, first, ResponseCode::Content) {
            Ok(first) => first,
            Err(err) => {
                endpoint.cancel_exchange(&token).await;
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(NOTIFICATION_DEPTH);
        let task = tokio::spawn(forward(device_id, uri, stream, tx));
        let observation = ActiveObservation {
            device_id,
            uri,
            peer: device.address,
            token,
            task,
        };
        if let Some(old) = self
            .active
            .lock()
            .await
            .insert(key(device_id, &uri), observation)
        {
            old.task.abort();
            endpoint.cancel_exchange(&old.token).await;
            debug!("replaced observation on {uri} for rd/{device_id}");
        }
        info!("observing {uri} on rd/{device_id} ({})", device.endpoint);
        Ok((first.payload, rx))
    }

    /// Stop one observation. Cleans up locally first, then tells the
    /// device with an Observe 1 read; a device that never answers still
    /// stops reaching anyone.
    pub async fn cancel(&self, device_id: u64, uri: &ObjectUri) -> bool {
        let observation = self.active.lock().await.remove(&key(device_id, uri));
        let Some(observation) = observation else {
            return false;
        };
        observation.task.abort();
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.cancel_exchange(&observation.token).await;
            let mut message = device_request(endpoint, Method::Get, uri);
            message.push_option(CoapOption::uint(OptionNumber::Observe, 1));
            match endpoint.request(message, observation.peer).await {
                Ok(_) => debug!("rd/{device_id} confirmed cancel of {uri}"),
                Err(err) => warn!("rd/{device_id} did not confirm cancel of {uri}: {err}"),
            }
        }
        info!("observation on {uri} for rd/{device_id} canceled");
        true
    }

    /// Drop every observation a device holds, without touching the
    /// network. Used when the device deregisters or its lifetime lapses.
    pub async fn cancel_device(&self, device_id: u64) -> usize {
        let mut active = self.active.lock().await;
        let keys: Vec<String> = active
            .iter()
            .filter(|(_, observation)| observation.device_id == device_id)
            .map(|(key, _)| key.clone())
            .collect();
        let mut dropped = 0;
        for key in keys {
            if let Some(observation) = active.remove(&key) {
                observation.task.abort();
                if let Some(endpoint) = self.endpoint.get() {
                    endpoint.cancel_exchange(&observation.token).await;
                }
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} observations for rd/{device_id}");
        }
        dropped
    }

    /// Drop everything. Shutdown path.
    pub async fn cancel_all(&self) {
        let mut active = self.active.lock().await;
        for (_, observation) in active.drain() {
            observation.task.abort();
            if let Some(endpoint) = self.endpoint.get() {
                endpoint.cancel_exchange(&observation.token).await;
            }
        }
    }

    pub async fn list(&self) -> Vec<(u64, ObjectUri)> {
        let mut entries: Vec<(u64, ObjectUri)> = self
            .active
            .lock()
            .await
            .values()
            .map(|observation| (observation.device_id, observation.uri))
            .collect();
        entries.sort_by_key(|(id, uri)| (*id, uri.object_id, uri.instance_id, uri.resource_id));
        entries
    }
}

/// Lift raw follow-up messages into [`Notification`]s until the stream
/// or the consumer goes away.
async fn forward(
    device_id: u64,
    uri: ObjectUri,
    mut stream: mpsc::Receiver<Message>,
    tx: mpsc::Sender<Notification>,
) {
    while let Some(message) = stream.recv().await {
        let Some(sequence) = message.observe() else {
            debug!("rd/{device_id} {uri}: response without an observe option ends the stream");
            break;
        };
        let notification = Notification {
            device_id,
            uri,
            sequence,
            format: message.content_format(),
            payload: message.payload,
        };
        if tx.send(notification).await.is_err() {
            debug!("rd/{device_id} {uri}: notification consumer went away");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_core::coap::message::{Code, MessageType};
    use lwm2m_core::coap::request::{CoapRequest, CoapResponse};
    use lwm2m_core::coap::router::Router;
    use lwm2m_core::registration::RegistrationParams;
    use lwm2m_core::transport::UdpConfig;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn quick() -> UdpConfig {
        UdpConfig {
            ack_timeout: Duration::from_millis(500),
            ..UdpConfig::default()
        }
    }

    async fn observations_with_device(
        device: &UdpSocket,
    ) -> (Arc<Observations>, Arc<UdpEndpoint>, u64) {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let (registered, _) = registry
            .register(
                RegistrationParams::new("sensor"),
                device.local_addr().unwrap(),
                "Device".into(),
                vec!["/3/6".into()],
            )
            .await;
        let observations = Arc::new(Observations::new(Arc::clone(&registry)));
        let endpoint = Arc::new(
            UdpEndpoint::bind_with("127.0.0.1:0", Router::new(), quick())
                .await
                .unwrap(),
        );
        endpoint.start();
        observations.attach(Arc::clone(&endpoint));
        (observations, endpoint, registered.id)
    }

    /// Device side of one observe exchange, hand-rolled on a bare socket:
    /// answer the initial GET, then push `pushes` notifications.
    async fn fake_device(socket: UdpSocket, pushes: Vec<(u32, &'static str)>) {
        let mut buf = vec![0u8; 1152];
        let (len, server) = socket.recv_from(&mut buf).await.unwrap();
        let message = Message::decode(&buf[..len]).unwrap();
        assert_eq!(message.observe(), Some(0));
        let token = message.token.clone();
        let request = CoapRequest::from_message(message, server).unwrap();
        let reply = CoapResponse::new(ResponseCode::Content)
            .observe(0)
            .content_format(ContentFormat::Lwm2mText)
            .payload(Bytes::from_static(b"21.5"))
            .into_message(&request);
        socket.send_to(&reply.to_bytes(), server).await.unwrap();

        for (sequence, value) in pushes {
            let mut notify = Message {
                mtype: MessageType::NonConfirmable,
                code: Code::Response(ResponseCode::Content),
                message_id: sequence as u16,
                token: token.clone(),
                options: Vec::new(),
                payload: Bytes::from_static(value.as_bytes()),
            };
            notify.push_option(CoapOption::uint(OptionNumber::Observe, sequence));
            notify.push_option(CoapOption::uint(
                OptionNumber::ContentFormat,
                ContentFormat::Lwm2mText as u32,
            ));
            socket.send_to(&notify.to_bytes(), server).await.unwrap();
        }

        // Answer a cancel read if one arrives.
        if let Ok((len, server)) = socket.recv_from(&mut buf).await {
            let message = Message::decode(&buf[..len]).unwrap();
            assert_eq!(message.observe(), Some(1));
            let request = CoapRequest::from_message(message, server).unwrap();
            let reply = CoapResponse::new(ResponseCode::Content)
                .content_format(ContentFormat::Lwm2mText)
                .payload(Bytes::from_static(b"22.0"))
                .into_message(&request);
            socket.send_to(&reply.to_bytes(), server).await.unwrap();
        }
    }

    #[tokio::test]
    async fn observe_streams_notifications_until_canceled() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (observations, _endpoint, id) = observations_with_device(&socket).await;
        let device = tokio::spawn(fake_device(socket, vec![(1, "22.0"), (2, "22.5")]));

        let uri = ObjectUri::resource(3, 6, 2);
        let (initial, mut rx) = observations.observe(id, uri).await.unwrap();
        assert_eq!(&initial[..], b"21.5");
        assert_eq!(observations.list().await, vec![(id, uri)]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(&first.payload[..], b"22.0");
        assert_eq!(first.format, Some(ContentFormat::Lwm2mText));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(&second.payload[..], b"22.5");

        assert!(observations.cancel(id, &uri).await);
        assert!(observations.list().await.is_empty());
        // The forwarding task is gone, so the stream ends.
        assert!(rx.recv().await.is_none());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_without_an_observation_is_a_no_op() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (observations, _endpoint, id) = observations_with_device(&socket).await;
        assert!(!observations.cancel(id, &ObjectUri::resource(3, 6, 2)).await);
    }

    #[tokio::test]
    async fn deregistration_cleanup_needs_no_network() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (observations, _endpoint, id) = observations_with_device(&socket).await;
        let _device = tokio::spawn(fake_device(socket, vec![]));

        let uri = ObjectUri::resource(3, 6, 2);
        let (_, mut rx) = observations.observe(id, uri).await.unwrap();
        assert_eq!(observations.cancel_device(id).await, 1);
        assert!(observations.list().await.is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn observing_an_unknown_device_fails() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (observations, _endpoint, _) = observations_with_device(&socket).await;
        let err = observations
            .observe(999, ObjectUri::resource(3, 6, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
