//! Server-side protocol role.
//!
//! A server owns the device registry, serves the `/rd` registration
//! interface from its UDP socket, and initiates device management and
//! observation exchanges against registered devices.
//!
//! ```no_run
//! use lwm2m_server::{Lwm2mServer, ServerConfig};
//! use lwm2m_core::uri::ObjectUri;
//!
//! # async fn demo() -> lwm2m_core::Result<()> {
//! let server = Lwm2mServer::start(ServerConfig::default()).await?;
//! let mut lapsed = server.start_lifetime_check();
//!
//! // Once a device has registered:
//! let device = &server.registry().list().await[0];
//! let value = server
//!     .management()
//!     .read_text(device.id, &ObjectUri::resource(3, 0, 0))
//!     .await?;
//! println!("manufacturer: {value}");
//! # Ok(())
//! # }
//! ```

pub mod device_registry;
pub mod management;
pub mod registration;
pub mod reporting;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lwm2m_core::coap::message::DEFAULT_PORT;
use lwm2m_core::coap::router::Router;
use lwm2m_core::error::Result;
use lwm2m_core::transport::{UdpConfig, UdpEndpoint};

use device_registry::now_secs;
pub use device_registry::{
    Device, DeviceRegistry, InMemoryStore, RegistryEvent, RegistryStore,
};
pub use management::Management;
pub use registration::DeviceTypeRule;
use registration::RegistrationInterface;
pub use reporting::{Notification, Observations};

/// Everything a server needs to know before it starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How often the sweeper looks for lapsed registrations.
    pub lifetime_check_interval: Duration,
    /// Typed registration roots beyond plain `/rd`.
    pub device_types: Vec<DeviceTypeRule>,
    /// Type recorded for devices registering through plain `/rd`.
    pub default_type: String,
    pub udp: UdpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            lifetime_check_interval: Duration::from_secs(5),
            device_types: Vec::new(),
            default_type: "Device".into(),
            udp: UdpConfig::default(),
        }
    }
}

/// A running server endpoint.
pub struct Lwm2mServer {
    config: ServerConfig,
    registry: Arc<DeviceRegistry>,
    observations: Arc<Observations>,
    management: Management,
    endpoint: Arc<UdpEndpoint>,
    receive_loop: JoinHandle<()>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Lwm2mServer {
    /// Start with an in-memory registry.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(DeviceRegistry::in_memory())).await
    }

    /// Bind the socket, mount the registration interface and start the
    /// receive loop. The registry may be backed by any store.
    pub async fn start_with(config: ServerConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        let observations = Arc::new(Observations::new(Arc::clone(&registry)));
        let mut router = Router::new();
        Arc::new(RegistrationInterface {
            registry: Arc::clone(&registry),
            observations: Arc::clone(&observations),
            types: config.device_types.clone(),
            default_type: config.default_type.clone(),
        })
        .mount(&mut router);

        let endpoint = Arc::new(
            UdpEndpoint::bind_with(config.bind_addr.as_str(), router, config.udp.clone()).await?,
        );
        observations.attach(Arc::clone(&endpoint));
        let receive_loop = endpoint.start();
        let management = Management::new(Arc::clone(&endpoint), Arc::clone(&registry));
        info!("server listening on {}", endpoint.local_addr()?);
        Ok(Self {
            config,
            registry,
            observations,
            management,
            endpoint,
            receive_loop,
            sweeper: StdMutex::new(None),
        })
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn observations(&self) -> Arc<Observations> {
        Arc::clone(&self.observations)
    }

    pub fn management(&self) -> &Management {
        &self.management
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Spawn the lifetime sweeper. Devices whose registration lapses are
    /// removed, their observations dropped, and handed out on the
    /// returned channel. Calling this again restarts the sweeper.
    pub fn start_lifetime_check(&self) -> mpsc::Receiver<Device> {
        let (tx, rx) = mpsc::channel(16);
        let registry = Arc::clone(&self.registry);
        let observations = Arc::clone(&self.observations);
        let interval = self.config.lifetime_check_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for device in registry.sweep(now_secs()).await {
                    warn!(
                        "device {} (rd/{}) lifetime lapsed after {}s",
                        device.endpoint, device.id, device.lifetime
                    );
                    observations.cancel_device(device.id).await;
                    if tx.send(device).await.is_err() {
                        debug!("lifetime listener went away");
                    }
                }
            }
        });
        let mut sweeper = match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = sweeper.replace(task) {
            old.abort();
        }
        rx
    }

    /// Stop the sweeper. Takes effect immediately; no further devices
    /// come out of the channel.
    pub fn stop_lifetime_check(&self) {
        let mut sweeper = match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(task) = sweeper.take() {
            task.abort();
        }
    }

    /// Tear the endpoint down. Registered devices stay in the store but
    /// nothing answers them any more.
    pub async fn stop(&self) {
        self.stop_lifetime_check();
        self.observations.cancel_all().await;
        self.receive_loop.abort();
    }
}
