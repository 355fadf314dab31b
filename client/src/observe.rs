//! Information reporting: the client half of observe.
//!
//! Each active observation is one spawned task listening on the registry
//! change bus. The task applies the notification attributes in force at
//! each step: `gt`/`lt`/`st` filter value changes, `pmin` spaces
//! notifications out, `pmax` forces one when the value stays quiet.
//! Cancelling aborts the task and detaches its watch before returning,
//! so no notification can be sent after cancel resolves. A task that
//! ends on its own, whether the target vanished or a send failed,
//! clears its own entry and watch on the way out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use lwm2m_core::attributes::NotifyAttributes;
use lwm2m_core::coap::message::{
    Code, CoapOption, ContentFormat, Message, MessageType, OptionNumber, ResponseCode, Token,
};
use lwm2m_core::codec::{self, text};
use lwm2m_core::error::{Error, Result};
use lwm2m_core::schema::{ObjectValue, ResourceValue};
use lwm2m_core::transport::UdpEndpoint;
use lwm2m_core::uri::ObjectUri;

use crate::object_registry::{ObjectRegistry, ResourceEvent};

struct ActiveObservation {
    peer: SocketAddr,
    task: JoinHandle<()>,
    watch: crate::object_registry::WatchHandle,
}

/// Owns every active observation on this client.
pub struct Notifier {
    endpoint: OnceCell<Arc<UdpEndpoint>>,
    registry: Arc<ObjectRegistry>,
    active: Arc<Mutex<HashMap<ObjectUri, ActiveObservation>>>,
}

impl Notifier {
    pub fn new(registry: Arc<ObjectRegistry>) -> Self {
        Self {
            endpoint: OnceCell::new(),
            registry,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire up the transport once it exists. Called before the receive
    /// loop starts, so observations can always send.
    pub fn attach(&self, endpoint: Arc<UdpEndpoint>) {
        let _ = self.endpoint.set(endpoint);
    }

    /// Begin observing `uri` for `peer`, replacing any observation already
    /// keyed there. Returns the initial representation for the response.
    pub async fn start(
        &self,
        uri: ObjectUri,
        peer: SocketAddr,
        token: Token,
    ) -> Result<(ContentFormat, Bytes)> {
        let endpoint = self
            .endpoint
            .get()
            .cloned()
            .ok_or_else(|| Error::ClientConnection("transport not started".into()))?;
        let initial = representation(&self.registry, &uri, None).await?;

        let (watch, rx) = self.registry.subscribe(uri).await;
        let registry = Arc::clone(&self.registry);
        let entries = Arc::clone(&self.active);
        let mut active = self.active.lock().await;
        if let Some(old) = active.remove(&uri) {
            old.task.abort();
            self.registry.unsubscribe(old.watch).await;
        }
        let task = tokio::spawn(async move {
            notify_loop(endpoint, Arc::clone(&registry), uri, peer, token, rx).await;
            // The loop ended on its own: clear the entry and the watch,
            // unless a replacement already holds the key.
            let mut entries = entries.lock().await;
            if entries.get(&uri).map(|observation| observation.watch) == Some(watch) {
                entries.remove(&uri);
            }
            drop(entries);
            registry.unsubscribe(watch).await;
        });
        debug!("observation started on {uri} for {peer}");
        active.insert(uri, ActiveObservation { peer, task, watch });
        Ok(initial)
    }

    /// Stop observing `uri`. Returns whether an observation was active.
    pub async fn cancel(&self, uri: &ObjectUri) -> bool {
        let stopped = self.stop(uri).await;
        if stopped {
            debug!("observation on {uri} cancelled");
        }
        stopped
    }

    /// Drop every observation, used at deregistration.
    pub async fn cancel_all(&self) {
        let mut active = self.active.lock().await;
        for (uri, observation) in active.drain() {
            observation.task.abort();
            self.registry.unsubscribe(observation.watch).await;
            debug!("observation on {uri} for {} dropped", observation.peer);
        }
    }

    /// Drop the observations on an instance and everything under it,
    /// used when the instance is deleted.
    pub async fn cancel_under(&self, uri: &ObjectUri) {
        let instance = uri.instance_uri();
        let mut active = self.active.lock().await;
        let doomed: Vec<ObjectUri> = active
            .keys()
            .filter(|key| key.instance_uri() == instance)
            .copied()
            .collect();
        for key in doomed {
            if let Some(observation) = active.remove(&key) {
                observation.task.abort();
                self.registry.unsubscribe(observation.watch).await;
                debug!("observation on {key} dropped with its instance");
            }
        }
    }

    /// Drop every observation under an object type.
    pub async fn cancel_object(&self, object_id: u16) {
        let mut active = self.active.lock().await;
        let doomed: Vec<ObjectUri> = active
            .keys()
            .filter(|key| key.object_id == object_id)
            .copied()
            .collect();
        for key in doomed {
            if let Some(observation) = active.remove(&key) {
                observation.task.abort();
                self.registry.unsubscribe(observation.watch).await;
                debug!("observation on {key} dropped with its object");
            }
        }
    }

    pub async fn list(&self) -> Vec<ObjectUri> {
        self.active.lock().await.keys().copied().collect()
    }

    async fn stop(&self, uri: &ObjectUri) -> bool {
        let Some(observation) = self.active.lock().await.remove(uri) else {
            return false;
        };
        observation.task.abort();
        self.registry.unsubscribe(observation.watch).await;
        true
    }
}

/// Current representation of the observed target: text for a resource,
/// TLV for an instance. `fresh` carries a value the store has not caught
/// up with yet.
async fn representation(
    registry: &ObjectRegistry,
    uri: &ObjectUri,
    fresh: Option<&ResourceEvent>,
) -> Result<(ContentFormat, Bytes)> {
    match uri.resource_id {
        Some(_) => {
            let value = match fresh {
                Some(ResourceEvent::Written { value, .. }) => value.clone(),
                _ => registry.resource(uri).await?,
            };
            Ok((
                ContentFormat::Lwm2mText,
                Bytes::from(text::encode(&value)),
            ))
        }
        None => {
            let mut instance: ObjectValue = registry.instance(uri).await?;
            if let Some(ResourceEvent::Written { uri: written, value }) = fresh {
                if let Some(resource_id) = written.resource_id {
                    instance.insert(resource_id, value.clone());
                }
            }
            let schema = registry.schema(uri.object_id).await?;
            let bytes = codec::tlv::encode(&schema, &instance)?;
            Ok((ContentFormat::Lwm2mTlv, bytes))
        }
    }
}

async fn notify_loop(
    endpoint: Arc<UdpEndpoint>,
    registry: Arc<ObjectRegistry>,
    uri: ObjectUri,
    peer: SocketAddr,
    token: Token,
    mut rx: mpsc::Receiver<ResourceEvent>,
) {
    let mut sequence: u32 = 1;
    let mut last_notify = Instant::now();
    let mut last_value: Option<f64> = None;

    loop {
        let attributes = registry.attributes(&uri).await;
        let deadline = attributes
            .pmax
            .map(|ms| last_notify + Duration::from_millis(ms));

        let event = tokio::select! {
            received = rx.recv() => match received {
                Some(event) => Some(event),
                None => break,
            },
            () = sleep_until_deadline(deadline) => None,
        };

        let fresh = match &event {
            Some(ResourceEvent::Executed { .. }) => continue,
            Some(written @ ResourceEvent::Written { value, .. }) => {
                if !passes(&attributes, value, last_value) {
                    continue;
                }
                Some(written)
            }
            // pmax expired with no change; re-send the current value.
            None => None,
        };
        let (format, payload) = match representation(&registry, &uri, fresh).await {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!("observation on {uri} lost its target: {err}");
                break;
            }
        };

        if let Some(pmin) = attributes.pmin {
            let min = Duration::from_millis(pmin);
            let since = last_notify.elapsed();
            if since < min {
                tokio::time::sleep(min - since).await;
            }
        }

        let mut notification = Message {
            mtype: MessageType::NonConfirmable,
            code: Code::Response(ResponseCode::Content),
            message_id: endpoint.new_message_id(),
            token: token.clone(),
            options: Vec::new(),
            payload,
        };
        notification.push_option(CoapOption::uint(OptionNumber::Observe, sequence));
        notification.push_option(CoapOption::uint(
            OptionNumber::ContentFormat,
            format as u32,
        ));
        if let Err(err) = endpoint.send(&notification, peer).await {
            warn!("notification for {uri} to {peer} failed: {err}");
            break;
        }
        sequence = sequence.wrapping_add(1);
        last_notify = Instant::now();
        if let Some(ResourceEvent::Written { value, .. }) = &event {
            last_value = value.as_num().or(last_value);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Change filter. A non-numeric value always notifies; a numeric one must
/// satisfy at least one configured threshold, or there must be none.
fn passes(attributes: &NotifyAttributes, value: &ResourceValue, last: Option<f64>) -> bool {
    let Some(current) = value.as_num() else {
        return true;
    };
    let mut constrained = false;
    if let Some(gt) = attributes.gt {
        constrained = true;
        if current > gt {
            return true;
        }
    }
    if let Some(lt) = attributes.lt {
        constrained = true;
        if current < lt {
            return true;
        }
    }
    if let Some(st) = attributes.st {
        constrained = true;
        match last {
            Some(previous) => {
                if (current - previous).abs() >= st {
                    return true;
                }
            }
            None => return true,
        }
    }
    !constrained
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_core::coap::message::token_from_slice;
    use lwm2m_core::coap::router::Router;
    use lwm2m_core::schema::{ObjectSchema, ResourceSpec, ResourceType};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[test]
    fn filter_table() {
        let none = NotifyAttributes::default();
        assert!(passes(&none, &ResourceValue::Num(1.0), None));
        assert!(passes(&none, &"text".into(), None));

        let gt30 = NotifyAttributes {
            gt: Some(30.0),
            ..Default::default()
        };
        assert!(passes(&gt30, &ResourceValue::Num(31.0), None));
        assert!(!passes(&gt30, &ResourceValue::Num(29.0), None));

        let step = NotifyAttributes {
            st: Some(2.0),
            ..Default::default()
        };
        assert!(passes(&step, &ResourceValue::Num(10.0), None));
        assert!(passes(&step, &ResourceValue::Num(12.0), Some(10.0)));
        assert!(!passes(&step, &ResourceValue::Num(11.0), Some(10.0)));

        // Either threshold may fire.
        let band = NotifyAttributes {
            gt: Some(30.0),
            lt: Some(-5.0),
            ..Default::default()
        };
        assert!(passes(&band, &ResourceValue::Num(-6.0), None));
        assert!(!passes(&band, &ResourceValue::Num(10.0), None));
    }

    async fn thermometer() -> Arc<ObjectRegistry> {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = Arc::new(ObjectRegistry::new());
        registry
            .register_schema(
                ObjectSchema::new(
                    3303,
                    "Temperature",
                    vec![ResourceSpec::scalar(0, "sensorValue", ResourceType::Num)],
                )
                .unwrap(),
            )
            .await;
        let uri = registry.create(3303, 0).await.unwrap();
        registry
            .set_resource(&uri, 0, ResourceValue::Num(20.0))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn notifications_flow_until_cancelled() {
        let registry = thermometer().await;
        let notifier = Notifier::new(Arc::clone(&registry));
        let endpoint = Arc::new(
            UdpEndpoint::bind("127.0.0.1:0", Router::new()).await.unwrap(),
        );
        notifier.attach(Arc::clone(&endpoint));

        // A plain socket plays the observing server.
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = ObjectUri::resource(3303, 0, 0);
        let token = token_from_slice(&[0x07]);
        let (format, initial) = notifier
            .start(uri, observer.local_addr().unwrap(), token)
            .await
            .unwrap();
        assert_eq!(format, ContentFormat::Lwm2mText);
        assert_eq!(&initial[..], b"20");

        registry
            .set_resource(&ObjectUri::instance(3303, 0), 0, ResourceValue::Num(21.5))
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = timeout(Duration::from_secs(1), observer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let notification = Message::decode(&buf[..len]).unwrap();
        assert_eq!(notification.observe(), Some(1));
        assert_eq!(&notification.payload[..], b"21.5");
        assert_eq!(notification.token.as_slice(), &[0x07]);

        assert!(notifier.cancel(&uri).await);
        registry
            .set_resource(&ObjectUri::instance(3303, 0), 0, ResourceValue::Num(25.0))
            .await
            .unwrap();
        let silent = timeout(Duration::from_millis(300), observer.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "no notification after cancel");
        assert!(!notifier.cancel(&uri).await);
    }

    #[tokio::test]
    async fn replacing_an_observation_keeps_one_task() {
        let registry = thermometer().await;
        let notifier = Notifier::new(Arc::clone(&registry));
        let endpoint = Arc::new(
            UdpEndpoint::bind("127.0.0.1:0", Router::new()).await.unwrap(),
        );
        notifier.attach(endpoint);
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let uri = ObjectUri::resource(3303, 0, 0);

        for t in [0x01u8, 0x02] {
            notifier
                .start(uri, observer.local_addr().unwrap(), token_from_slice(&[t]))
                .await
                .unwrap();
        }
        assert_eq!(notifier.list().await, vec![uri]);

        // Only the replacement token notifies.
        registry
            .set_resource(&ObjectUri::instance(3303, 0), 0, ResourceValue::Num(22.0))
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let (len, _) = timeout(Duration::from_secs(1), observer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let notification = Message::decode(&buf[..len]).unwrap();
        assert_eq!(notification.token.as_slice(), &[0x02]);
    }

    #[tokio::test]
    async fn a_lost_target_winds_the_observation_down() {
        let registry = thermometer().await;
        let uri = ObjectUri::resource(3303, 0, 0);
        // Object-level attributes survive instance removal, so the task
        // keeps its pmax deadline armed to the end.
        registry
            .set_object_attributes(
                3303,
                NotifyAttributes {
                    pmax: Some(50),
                    ..Default::default()
                },
            )
            .await;
        let notifier = Notifier::new(Arc::clone(&registry));
        let endpoint = Arc::new(
            UdpEndpoint::bind("127.0.0.1:0", Router::new()).await.unwrap(),
        );
        notifier.attach(endpoint);
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        notifier
            .start(uri, observer.local_addr().unwrap(), token_from_slice(&[0x0a]))
            .await
            .unwrap();

        registry.remove(&uri).await.unwrap();
        // The next pmax tick finds the instance gone and the task
        // cleans up after itself.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(notifier.list().await.is_empty());
        assert!(!notifier.cancel(&uri).await);

        // Recreating the target does not revive the dead observation.
        registry.create(3303, 0).await.unwrap();
        registry
            .set_resource(&ObjectUri::instance(3303, 0), 0, ResourceValue::Num(30.0))
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let silent = timeout(Duration::from_millis(300), observer.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "no notification after the target vanished");
    }

    #[tokio::test]
    async fn pmax_forces_a_notification_without_changes() {
        let registry = thermometer().await;
        let uri = ObjectUri::resource(3303, 0, 0);
        registry
            .set_attributes(
                uri,
                NotifyAttributes {
                    pmax: Some(100),
                    ..Default::default()
                },
            )
            .await;
        let notifier = Notifier::new(Arc::clone(&registry));
        let endpoint = Arc::new(
            UdpEndpoint::bind("127.0.0.1:0", Router::new()).await.unwrap(),
        );
        notifier.attach(endpoint);
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        notifier
            .start(uri, observer.local_addr().unwrap(), token_from_slice(&[0x09]))
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = timeout(Duration::from_secs(1), observer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let notification = Message::decode(&buf[..len]).unwrap();
        assert_eq!(&notification.payload[..], b"20");
        notifier.cancel_all().await;
    }
}
