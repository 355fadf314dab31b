//! The server's view of registered devices.
//!
//! Storage sits behind [`RegistryStore`] so deployments can persist
//! registrations; the bundled [`InMemoryStore`] is a map. Device ids are
//! allocated by the registry and are monotonic for the life of the
//! process, so a stale id can never alias a newer registration.
//! Lifecycle changes go out on a watch channel, so callers can react to
//! arrivals and departures without polling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use log::info;
use tokio::sync::{mpsc, RwLock};

use lwm2m_core::error::{Error, Result};
use lwm2m_core::registration::{BindingMode, RegistrationParams};

/// Seconds since the epoch, the clock the registry runs on.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// One registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: u64,
    pub endpoint: String,
    /// Kind label assigned by the registration interface the device
    /// arrived through, `"Device"` unless configured otherwise.
    pub device_type: String,
    pub address: SocketAddr,
    pub lifetime: u64,
    pub binding: BindingMode,
    pub version: String,
    /// Link targets announced at registration, e.g. `/3/0`.
    pub objects: Vec<String>,
    /// Unix seconds of the last register or update.
    pub updated_at: u64,
}

impl Device {
    pub fn expired(&self, now: u64) -> bool {
        now > self.updated_at.saturating_add(self.lifetime)
    }
}

/// Storage backend for registrations.
pub trait RegistryStore: Send + Sync {
    fn upsert(&self, device: Device) -> BoxFuture<'_, ()>;
    fn remove(&self, id: u64) -> BoxFuture<'_, Option<Device>>;
    fn get(&self, id: u64) -> BoxFuture<'_, Option<Device>>;
    fn find_by_endpoint<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Option<Device>>;
    fn list(&self) -> BoxFuture<'_, Vec<Device>>;
}

#[derive(Default)]
pub struct InMemoryStore {
    devices: RwLock<HashMap<u64, Device>>,
}

impl RegistryStore for InMemoryStore {
    fn upsert(&self, device: Device) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.devices.write().await.insert(device.id, device);
        })
    }

    fn remove(&self, id: u64) -> BoxFuture<'_, Option<Device>> {
        Box::pin(async move { self.devices.write().await.remove(&id) })
    }

    fn get(&self, id: u64) -> BoxFuture<'_, Option<Device>> {
        Box::pin(async move { self.devices.read().await.get(&id).cloned() })
    }

    fn find_by_endpoint<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Option<Device>> {
        Box::pin(async move {
            self.devices
                .read()
                .await
                .values()
                .find(|device| device.endpoint == endpoint)
                .cloned()
        })
    }

    fn list(&self) -> BoxFuture<'_, Vec<Device>> {
        Box::pin(async move { self.devices.read().await.values().cloned().collect() })
    }
}

/// What changed, delivered to [`DeviceRegistry::watch`] subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(Device),
    Updated(Device),
    Deregistered(Device),
    Expired(Device),
}

const EVENT_DEPTH: usize = 16;

/// Registration book-keeping over a store.
pub struct DeviceRegistry {
    store: Box<dyn RegistryStore>,
    next_id: AtomicU64,
    watchers: RwLock<Vec<mpsc::Sender<RegistryEvent>>>,
}

impl DeviceRegistry {
    pub fn in_memory() -> Self {
        Self::with_store(Box::new(InMemoryStore::default()))
    }

    pub fn with_store(store: Box<dyn RegistryStore>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
            watchers: RwLock::new(Vec::new()),
        }
    }

    /// Lifecycle events from now on. Dropping the receiver detaches the
    /// watch on the next event.
    pub async fn watch(&self) -> mpsc::Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_DEPTH);
        self.watchers.write().await.push(tx);
        rx
    }

    async fn publish(&self, event: RegistryEvent) {
        let mut watchers = self.watchers.write().await;
        watchers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            // A slow watcher loses the event, not the subscription.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Admit a device. A registration with an endpoint name already on
    /// file supersedes the older one, which is returned alongside.
    pub async fn register(
        &self,
        params: RegistrationParams,
        address: SocketAddr,
        device_type: String,
        objects: Vec<String>,
    ) -> (Device, Option<Device>) {
        let superseded = match self.store.find_by_endpoint(&params.endpoint).await {
            Some(old) => self.store.remove(old.id).await,
            None => None,
        };
        if let Some(old) = &superseded {
            info!(
                "registration of {} supersedes device {}",
                params.endpoint, old.id
            );
            self.publish(RegistryEvent::Deregistered(old.clone())).await;
        }
        let device = Device {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            endpoint: params.endpoint,
            device_type,
            address,
            lifetime: params.lifetime,
            binding: params.binding,
            version: params.version,
            objects,
            updated_at: now_secs(),
        };
        self.store.upsert(device.clone()).await;
        self.publish(RegistryEvent::Registered(device.clone())).await;
        (device, superseded)
    }

    /// Refresh a registration: bump the clock, optionally replace the
    /// lifetime and the object list, and track the source address.
    pub async fn update(
        &self,
        id: u64,
        address: SocketAddr,
        lifetime: Option<u64>,
        objects: Option<Vec<String>>,
    ) -> Result<Device> {
        let mut device = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(format!("device {id}")))?;
        if let Some(lifetime) = lifetime {
            device.lifetime = lifetime;
        }
        if let Some(objects) = objects {
            device.objects = objects;
        }
        device.address = address;
        device.updated_at = now_secs();
        self.store.upsert(device.clone()).await;
        self.publish(RegistryEvent::Updated(device.clone())).await;
        Ok(device)
    }

    pub async fn remove(&self, id: u64) -> Result<Device> {
        let device = self
            .store
            .remove(id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(format!("device {id}")))?;
        self.publish(RegistryEvent::Deregistered(device.clone()))
            .await;
        Ok(device)
    }

    pub async fn get(&self, id: u64) -> Result<Device> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(format!("device {id}")))
    }

    pub async fn find_by_endpoint(&self, endpoint: &str) -> Result<Device> {
        self.store
            .find_by_endpoint(endpoint)
            .await
            .ok_or_else(|| Error::DeviceNotFound(endpoint.to_string()))
    }

    pub async fn list(&self) -> Vec<Device> {
        self.store.list().await
    }

    /// Remove and return every device whose lifetime has lapsed.
    pub async fn sweep(&self, now: u64) -> Vec<Device> {
        let mut lapsed = Vec::new();
        for device in self.store.list().await {
            if device.expired(now) {
                if let Some(device) = self.store.remove(device.id).await {
                    self.publish(RegistryEvent::Expired(device.clone())).await;
                    lapsed.push(device);
                }
            }
        }
        lapsed
    }

    /// Drop every registration at once.
    pub async fn clear(&self) {
        for device in self.store.list().await {
            if let Some(device) = self.store.remove(device.id).await {
                self.publish(RegistryEvent::Deregistered(device)).await;
            }
        }
    }
}
