//! Device-side protocol role.
//!
//! A client owns an [`ObjectRegistry`], serves the device-management
//! interface from its UDP socket, keeps observations flowing, and
//! manages its registration with one server.
//!
//! ```no_run
//! use lwm2m_client::{ClientConfig, Lwm2mClient, ObjectRegistry};
//! use lwm2m_core::schema::ResourceValue;
//! use lwm2m_core::uri::ObjectUri;
//!
//! # async fn demo() -> lwm2m_core::Result<()> {
//! let registry = ObjectRegistry::new();
//! registry.create(3, 0).await?;
//!
//! let config = ClientConfig::new("ROOM001", "203.0.113.9:5683".parse().unwrap());
//! let client = Lwm2mClient::start(config, registry).await?;
//! client.register().await?;
//! client
//!     .registry()
//!     .set_resource(&ObjectUri::instance(3, 0), 0, ResourceValue::Str("ACME".into()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod handlers;
pub mod object_registry;
pub mod observe;
pub mod registration;

use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use lwm2m_core::coap::router::Router;
use lwm2m_core::error::{Error, Result};
use lwm2m_core::registration::{BindingMode, RegistrationParams, DEFAULT_LIFETIME_SECS};
use lwm2m_core::transport::{UdpConfig, UdpEndpoint};

use handlers::DeviceManagement;
pub use object_registry::{ObjectRegistry, ResourceEvent, WatchHandle};
pub use observe::Notifier;

/// Everything a client needs to know before it starts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint_name: String,
    pub server: SocketAddr,
    pub local_addr: String,
    pub lifetime: u64,
    pub binding: BindingMode,
    /// Registration root on the server, `"rd"` unless the deployment
    /// types its devices by URL prefix (e.g. `"gw/rd"`).
    pub registration_root: String,
    pub udp: UdpConfig,
}

impl ClientConfig {
    pub fn new(endpoint_name: impl Into<String>, server: SocketAddr) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            server,
            local_addr: "0.0.0.0:0".to_string(),
            lifetime: DEFAULT_LIFETIME_SECS,
            binding: BindingMode::default(),
            registration_root: "rd".to_string(),
            udp: UdpConfig::default(),
        }
    }
}

/// A running client endpoint.
pub struct Lwm2mClient {
    config: ClientConfig,
    registry: Arc<ObjectRegistry>,
    notifier: Arc<Notifier>,
    endpoint: Arc<UdpEndpoint>,
    location: RwLock<Option<String>>,
    receive_loop: JoinHandle<()>,
}

impl Lwm2mClient {
    /// Bind the socket, mount the device-management handlers and start
    /// the receive loop. The client is reachable but not yet registered.
    pub async fn start(config: ClientConfig, registry: ObjectRegistry) -> Result<Self> {
        let registry = Arc::new(registry);
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry)));
        let mut router = Router::new();
        Arc::new(DeviceManagement {
            registry: Arc::clone(&registry),
            notifier: Arc::clone(&notifier),
        })
        .mount(&mut router);

        let endpoint = Arc::new(
            UdpEndpoint::bind_with(config.local_addr.as_str(), router, config.udp.clone()).await?,
        );
        notifier.attach(Arc::clone(&endpoint));
        let receive_loop = endpoint.start();
        info!(
            "client {} listening on {}",
            config.endpoint_name,
            endpoint.local_addr()?
        );
        Ok(Self {
            config,
            registry,
            notifier,
            endpoint,
            location: RwLock::new(None),
            receive_loop,
        })
    }

    pub fn registry(&self) -> Arc<ObjectRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// The location assigned by the server, once registered.
    pub async fn location(&self) -> Option<String> {
        self.location.read().await.clone()
    }

    fn params(&self) -> RegistrationParams {
        let mut params = RegistrationParams::new(self.config.endpoint_name.clone());
        params.lifetime = self.config.lifetime;
        params.binding = self.config.binding;
        params
    }

    /// Register with the configured server, announcing the current
    /// object tree.
    pub async fn register(&self) -> Result<String> {
        let objects = self.registry.list().await;
        let location = registration::register(
            &self.endpoint,
            self.config.server,
            &self.config.registration_root,
            &self.params(),
            &objects,
        )
        .await?;
        info!(
            "registered {} at {} as {location}",
            self.config.endpoint_name, self.config.server
        );
        *self.location.write().await = Some(location.clone());
        Ok(location)
    }

    /// Refresh the registration before its lifetime runs out.
    pub async fn update(&self) -> Result<()> {
        let location = self
            .location()
            .await
            .ok_or_else(|| Error::Registration("not registered".into()))?;
        let objects = self.registry.list().await;
        registration::update(
            &self.endpoint,
            self.config.server,
            &location,
            &self.params(),
            &objects,
        )
        .await
    }

    /// Withdraw the registration and stop every observation.
    pub async fn deregister(&self) -> Result<()> {
        let location = self
            .location
            .write()
            .await
            .take()
            .ok_or_else(|| Error::Registration("not registered".into()))?;
        self.notifier.cancel_all().await;
        registration::deregister(&self.endpoint, self.config.server, &location).await?;
        info!("deregistered {}", self.config.endpoint_name);
        Ok(())
    }

    /// Tear the endpoint down without speaking to the server. Notify
    /// tasks stop before the socket goes quiet.
    pub async fn stop(&self) {
        self.notifier.cancel_all().await;
        self.receive_loop.abort();
    }
}
