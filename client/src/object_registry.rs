//! The client's object tree: schemas, instance values, notification
//! attributes, and a change bus.
//!
//! Every mutation is validated against the object's schema before it
//! lands. Watchers subscribe to an instance or a single resource and get
//! events over a channel; the event is published before the store is
//! updated, so a watcher that reads back sees the previous value and can
//! compute deltas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use tokio::sync::{mpsc, RwLock};

use lwm2m_core::attributes::NotifyAttributes;
use lwm2m_core::error::{Error, Result};
use lwm2m_core::schema::{oma, ObjectSchema, ObjectValue, ResourceValue};
use lwm2m_core::uri::ObjectUri;

/// What happened to a resource. `Written` fires for local sets and for
/// writes arriving from the server; `Executed` fires for execute requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Written {
        uri: ObjectUri,
        value: ResourceValue,
    },
    Executed {
        uri: ObjectUri,
        arguments: String,
    },
}

impl ResourceEvent {
    pub fn uri(&self) -> &ObjectUri {
        match self {
            ResourceEvent::Written { uri, .. } | ResourceEvent::Executed { uri, .. } => uri,
        }
    }
}

/// Returned by [`ObjectRegistry::subscribe`]; pass it back to
/// [`ObjectRegistry::unsubscribe`] to stop the flow of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

struct Watcher {
    uri: ObjectUri,
    tx: mpsc::Sender<ResourceEvent>,
}

const WATCH_DEPTH: usize = 16;

pub struct ObjectRegistry {
    schemas: RwLock<HashMap<u16, ObjectSchema>>,
    instances: RwLock<HashMap<ObjectUri, ObjectValue>>,
    attributes: RwLock<HashMap<ObjectUri, NotifyAttributes>>,
    object_attributes: RwLock<HashMap<u16, NotifyAttributes>>,
    watchers: RwLock<HashMap<WatchHandle, Watcher>>,
    next_watch: AtomicU64,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            attributes: RwLock::new(HashMap::new()),
            object_attributes: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }

    /// Make an object type usable. Standard object ids resolve to the
    /// built-in schemas without registration.
    pub async fn register_schema(&self, schema: ObjectSchema) {
        self.schemas.write().await.insert(schema.object_id, schema);
    }

    pub async fn schema(&self, object_id: u16) -> Result<ObjectSchema> {
        if let Some(schema) = self.schemas.read().await.get(&object_id) {
            return Ok(schema.clone());
        }
        oma::builtin(object_id)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(format!("no schema for object {object_id}")))
    }

    /// Create an empty instance. Fails if the type has no schema or the
    /// instance already exists.
    pub async fn create(&self, object_id: u16, instance_id: u16) -> Result<ObjectUri> {
        self.create_with(object_id, instance_id, ObjectValue::new())
            .await
    }

    /// Create an instance populated with `value`.
    pub async fn create_with(
        &self,
        object_id: u16,
        instance_id: u16,
        value: ObjectValue,
    ) -> Result<ObjectUri> {
        let schema = self.schema(object_id).await?;
        schema.validate(&value)?;
        let uri = ObjectUri::instance(object_id, instance_id);
        let mut instances = self.instances.write().await;
        if instances.contains_key(&uri) {
            return Err(Error::Registry(format!("instance {uri} already exists")));
        }
        debug!("created instance {uri}");
        instances.insert(uri, value);
        Ok(uri)
    }

    /// Instance state by URI string, the `"/3/6"` form.
    pub async fn get(&self, uri: &str) -> Result<ObjectValue> {
        let uri: ObjectUri = uri.parse()?;
        self.instance(&uri).await
    }

    pub async fn instance(&self, uri: &ObjectUri) -> Result<ObjectValue> {
        self.instances
            .read()
            .await
            .get(&uri.instance_uri())
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(uri.instance_uri().to_string()))
    }

    pub async fn resource(&self, uri: &ObjectUri) -> Result<ResourceValue> {
        let resource_id = uri
            .resource_id
            .ok_or_else(|| Error::MalformedUri(format!("{uri} does not name a resource")))?;
        let instance = self.instance(uri).await?;
        instance.get(&resource_id).cloned().ok_or_else(|| {
            Error::ResourceNotFound {
                uri: uri.instance_uri().to_string(),
                resource: resource_id.to_string(),
            }
        })
    }

    /// Validate and store one resource, publishing the change first.
    pub async fn set_resource(
        &self,
        uri: &ObjectUri,
        resource_id: u16,
        value: ResourceValue,
    ) -> Result<()> {
        let schema = self.schema(uri.object_id).await?;
        schema.validate_resource(&resource_id.to_string(), &value)?;
        let target = ObjectUri::resource(uri.object_id, uri.instance_id, resource_id);
        {
            // Hold the write lock across publish and store so watchers
            // never see events out of order.
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(&uri.instance_uri())
                .ok_or_else(|| Error::ObjectNotFound(uri.instance_uri().to_string()))?;
            self.publish(ResourceEvent::Written {
                uri: target,
                value: value.clone(),
            })
            .await;
            instance.insert(resource_id, value);
        }
        Ok(())
    }

    /// Validate and merge a whole-instance write, one event per resource.
    /// The payload may carry any subset of the declared resources; required
    /// presence is enforced at creation, not here.
    pub async fn set_instance(&self, uri: &ObjectUri, value: ObjectValue) -> Result<()> {
        let schema = self.schema(uri.object_id).await?;
        schema.validate_partial(&value)?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&uri.instance_uri())
            .ok_or_else(|| Error::ObjectNotFound(uri.instance_uri().to_string()))?;
        for (resource_id, resource_value) in value {
            self.publish(ResourceEvent::Written {
                uri: ObjectUri::resource(uri.object_id, uri.instance_id, resource_id),
                value: resource_value.clone(),
            })
            .await;
            instance.insert(resource_id, resource_value);
        }
        Ok(())
    }

    /// Deliver an execute to whoever is watching the resource.
    pub async fn execute(&self, uri: &ObjectUri, arguments: String) -> Result<()> {
        // The resource must exist in the schema, not necessarily hold a value.
        let resource_id = uri
            .resource_id
            .ok_or_else(|| Error::MalformedUri(format!("{uri} does not name a resource")))?;
        let schema = self.schema(uri.object_id).await?;
        if schema.resource(resource_id).is_none() {
            return Err(Error::ResourceNotFound {
                uri: uri.instance_uri().to_string(),
                resource: resource_id.to_string(),
            });
        }
        if !self.instances.read().await.contains_key(&uri.instance_uri()) {
            return Err(Error::ObjectNotFound(uri.instance_uri().to_string()));
        }
        self.publish(ResourceEvent::Executed {
            uri: *uri,
            arguments,
        })
        .await;
        Ok(())
    }

    /// Drop a stored resource value. No event is published; unsetting is
    /// local housekeeping, not a write.
    pub async fn unset_resource(&self, uri: &ObjectUri, resource_id: u16) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&uri.instance_uri())
            .ok_or_else(|| Error::ObjectNotFound(uri.instance_uri().to_string()))?;
        instance
            .remove(&resource_id)
            .ok_or_else(|| Error::ResourceNotFound {
                uri: uri.instance_uri().to_string(),
                resource: resource_id.to_string(),
            })?;
        Ok(())
    }

    pub async fn remove(&self, uri: &ObjectUri) -> Result<()> {
        let mut instances = self.instances.write().await;
        instances
            .remove(&uri.instance_uri())
            .ok_or_else(|| Error::ObjectNotFound(uri.instance_uri().to_string()))?;
        self.attributes
            .write()
            .await
            .retain(|stored, _| stored.instance_uri() != uri.instance_uri());
        Ok(())
    }

    /// Drop every instance and every stored attribute. Registered schemas
    /// and watcher subscriptions survive.
    pub async fn reset(&self) {
        self.instances.write().await.clear();
        self.attributes.write().await.clear();
        self.object_attributes.write().await.clear();
    }

    /// Every instance URI, sorted, for the registration payload.
    pub async fn list(&self) -> Vec<ObjectUri> {
        let mut uris: Vec<ObjectUri> = self.instances.read().await.keys().copied().collect();
        uris.sort_by_key(|uri| (uri.object_id, uri.instance_id));
        uris
    }

    /// Replace the notification attributes stored at `uri`.
    pub async fn set_attributes(&self, uri: ObjectUri, attributes: NotifyAttributes) {
        self.attributes.write().await.insert(uri, attributes);
    }

    /// Replace the attributes stored at the object (type) level.
    pub async fn set_object_attributes(&self, object_id: u16, attributes: NotifyAttributes) {
        self.object_attributes
            .write()
            .await
            .insert(object_id, attributes);
    }

    pub async fn object_attributes(&self, object_id: u16) -> NotifyAttributes {
        self.object_attributes
            .read()
            .await
            .get(&object_id)
            .copied()
            .unwrap_or_default()
    }

    /// Attributes for `uri`. The first level with a stored entry wins:
    /// resource, then instance, then object.
    pub async fn attributes(&self, uri: &ObjectUri) -> NotifyAttributes {
        {
            let attributes = self.attributes.read().await;
            if let Some(found) = attributes.get(uri) {
                return *found;
            }
            if let Some(found) = attributes.get(&uri.instance_uri()) {
                return *found;
            }
        }
        self.object_attributes(uri.object_id).await
    }

    /// Watch an instance or a single resource. Events arrive on the
    /// returned channel until [`Self::unsubscribe`] is called with the
    /// handle or the receiver is dropped.
    pub async fn subscribe(&self, uri: ObjectUri) -> (WatchHandle, mpsc::Receiver<ResourceEvent>) {
        let (tx, rx) = mpsc::channel(WATCH_DEPTH);
        let handle = WatchHandle(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.watchers.write().await.insert(handle, Watcher { uri, tx });
        (handle, rx)
    }

    pub async fn unsubscribe(&self, handle: WatchHandle) {
        self.watchers.write().await.remove(&handle);
    }

    async fn publish(&self, event: ResourceEvent) {
        let mut watchers = self.watchers.write().await;
        watchers.retain(|_, watcher| {
            if !watches(&watcher.uri, event.uri()) {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => true,
                // A full channel drops the event rather than stalling
                // the writer; pmax catches observers up.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An instance-level watch sees every resource under it; a resource-level
/// watch sees only its own.
fn watches(watched: &ObjectUri, event_uri: &ObjectUri) -> bool {
    match watched.resource_id {
        Some(_) => watched == event_uri,
        None => watched.instance_uri() == event_uri.instance_uri(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_core::schema::{ResourceSpec, ResourceType};

    async fn registry_with_thermometer() -> ObjectRegistry {
        let registry = ObjectRegistry::new();
        registry
            .register_schema(
                ObjectSchema::new(
                    3303,
                    "Temperature",
                    vec![
                        ResourceSpec::scalar(0, "sensorValue", ResourceType::Num),
                        ResourceSpec::scalar(1, "units", ResourceType::Str),
                        ResourceSpec::scalar(5, "reset", ResourceType::Str),
                    ],
                )
                .unwrap(),
            )
            .await;
        registry.create(3303, 0).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn create_get_set_round_trip() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        registry
            .set_resource(&uri, 0, ResourceValue::Num(21.5))
            .await
            .unwrap();
        let value = registry.get("/3303/0").await.unwrap();
        assert_eq!(value.get(&0), Some(&ResourceValue::Num(21.5)));
    }

    #[tokio::test]
    async fn malformed_uris_are_refused() {
        let registry = registry_with_thermometer().await;
        assert!(matches!(
            registry.get("/3303").await,
            Err(Error::MalformedUri(_))
        ));
        assert!(matches!(
            registry.get("3303/0").await,
            Err(Error::MalformedUri(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_instances_are_refused() {
        let registry = registry_with_thermometer().await;
        assert!(matches!(
            registry.create(3303, 0).await,
            Err(Error::Registry(_))
        ));
    }

    #[tokio::test]
    async fn unknown_types_are_refused() {
        let registry = ObjectRegistry::new();
        assert!(matches!(
            registry.create(4242, 0).await,
            Err(Error::TypeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn standard_objects_need_no_registration() {
        let registry = ObjectRegistry::new();
        let uri = registry.create(3, 0).await.unwrap();
        registry
            .set_resource(&uri, 0, "ACME".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_values_never_land() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        let err = registry
            .set_resource(&uri, 0, "warm".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert!(registry.get("/3303/0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_instance_writes_skip_absent_resources() {
        let registry = ObjectRegistry::new();
        registry
            .register_schema(
                ObjectSchema::new(
                    7,
                    "Lock",
                    vec![
                        ResourceSpec::scalar(0, "state", ResourceType::Bool).required(),
                        ResourceSpec::scalar(1, "label", ResourceType::Str),
                    ],
                )
                .unwrap(),
            )
            .await;

        // Creation still demands the required resource.
        assert!(matches!(
            registry.create(7, 0).await,
            Err(Error::MissingResource(_))
        ));
        let mut full = ObjectValue::new();
        full.insert(0, ResourceValue::Bool(false));
        let uri = registry.create_with(7, 0, full).await.unwrap();

        // A later write may carry any subset; untouched resources stay.
        let mut partial = ObjectValue::new();
        partial.insert(1, ResourceValue::Str("front door".into()));
        registry.set_instance(&uri, partial).await.unwrap();
        let value = registry.get("/7/0").await.unwrap();
        assert_eq!(value.get(&0), Some(&ResourceValue::Bool(false)));
        assert_eq!(value.get(&1), Some(&ResourceValue::Str("front door".into())));
    }

    #[tokio::test]
    async fn watchers_hear_writes_and_executes() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        let (handle, mut rx) = registry.subscribe(uri).await;

        registry
            .set_resource(&uri, 0, ResourceValue::Num(20.0))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ResourceEvent::Written {
                uri: ObjectUri::resource(3303, 0, 0),
                value: ResourceValue::Num(20.0)
            }
        );

        registry
            .execute(&ObjectUri::resource(3303, 0, 5), "now".into())
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ResourceEvent::Executed { .. }));

        registry.unsubscribe(handle).await;
        registry
            .set_resource(&uri, 0, ResourceValue::Num(21.0))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        let (_handle, rx) = registry.subscribe(uri).await;
        drop(rx);

        registry
            .set_resource(&uri, 0, ResourceValue::Num(20.0))
            .await
            .unwrap();
        assert!(registry.watchers.read().await.is_empty());

        // The write that hit the closed channel still landed.
        let value = registry.get("/3303/0").await.unwrap();
        assert_eq!(value.get(&0), Some(&ResourceValue::Num(20.0)));
    }

    #[tokio::test]
    async fn closed_watchers_on_other_uris_are_swept_too() {
        let registry = registry_with_thermometer().await;
        registry.create(3303, 1).await.unwrap();
        let (_handle, rx) = registry.subscribe(ObjectUri::instance(3303, 1)).await;
        drop(rx);

        // Traffic on a different instance still clears the dead watch.
        registry
            .set_resource(&ObjectUri::instance(3303, 0), 1, "Cel".into())
            .await
            .unwrap();
        assert!(registry.watchers.read().await.is_empty());
    }

    #[tokio::test]
    async fn resource_watch_ignores_sibling_resources() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        let (_handle, mut rx) = registry.subscribe(ObjectUri::resource(3303, 0, 0)).await;
        registry.set_resource(&uri, 1, "Cel".into()).await.unwrap();
        assert!(rx.try_recv().is_err());
        registry
            .set_resource(&uri, 0, ResourceValue::Num(19.0))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unset_resource_is_strict_and_silent() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        registry.set_resource(&uri, 1, "Cel".into()).await.unwrap();

        let (_handle, mut rx) = registry.subscribe(uri).await;
        rx.try_recv().ok();
        registry.unset_resource(&uri, 1).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(registry.get("/3303/0").await.unwrap().is_empty());

        assert!(matches!(
            registry.unset_resource(&uri, 1).await,
            Err(Error::ResourceNotFound { .. })
        ));
        assert!(matches!(
            registry
                .unset_resource(&ObjectUri::instance(3303, 9), 1)
                .await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reset_keeps_schemas_and_watchers() {
        let registry = registry_with_thermometer().await;
        let uri = ObjectUri::instance(3303, 0);
        registry
            .set_attributes(
                uri,
                NotifyAttributes {
                    pmin: Some(1000),
                    ..Default::default()
                },
            )
            .await;
        let (_handle, mut rx) = registry.subscribe(uri).await;

        registry.reset().await;
        assert!(registry.list().await.is_empty());
        assert_eq!(registry.attributes(&uri).await, NotifyAttributes::default());

        // The schema survived, as did the watch.
        let uri = registry.create(3303, 0).await.unwrap();
        registry
            .set_resource(&uri, 0, ResourceValue::Num(18.0))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn attributes_fall_back_to_the_instance() {
        let registry = registry_with_thermometer().await;
        let instance = ObjectUri::instance(3303, 0);
        let resource = ObjectUri::resource(3303, 0, 0);
        registry
            .set_attributes(
                instance,
                NotifyAttributes {
                    pmax: Some(20000),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.attributes(&resource).await.pmax, Some(20000));

        registry
            .set_attributes(
                resource,
                NotifyAttributes {
                    pmax: Some(5000),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.attributes(&resource).await.pmax, Some(5000));
    }

    #[tokio::test]
    async fn attributes_fall_back_to_the_object() {
        let registry = registry_with_thermometer().await;
        registry
            .set_object_attributes(
                3303,
                NotifyAttributes {
                    pmin: Some(60000),
                    ..Default::default()
                },
            )
            .await;
        let resource = ObjectUri::resource(3303, 0, 0);
        assert_eq!(registry.attributes(&resource).await.pmin, Some(60000));

        registry
            .set_attributes(
                resource.instance_uri(),
                NotifyAttributes {
                    pmin: Some(5000),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.attributes(&resource).await.pmin, Some(5000));
    }
}
