//! List+watch monitors that turn changes to Applications and their children into messages for
//! the operator loop. Nothing is cached here, since every reconcile pass reads fresh state from
//! the api server. Child events are attributed to the Application named by the child's
//! controller owner reference.
use crate::k8s_types::{K8sType, APPLICATION};
use crate::resource::{InvalidResourceError, K8sResource, ObjectId};
use crate::runner::client::{ApiError, Client, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::metrics::WatcherMetrics;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{error::SendError, Sender};
use tokio::task::JoinHandle;

use std::fmt::{self, Display};
use std::time::Duration;

const ERROR_PAUSE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
    /// The resource has a deletion timestamp, but still exists
    Deleting,
    Deleted,
}

impl EventType {
    fn for_modified(resource: &K8sResource) -> EventType {
        if resource.is_deletion_timestamp_set() {
            EventType::Deleting
        } else {
            EventType::Updated
        }
    }
}

/// A change to an Application, or to one of its children
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMessage {
    pub event_type: EventType,
    /// The type of the resource that changed
    pub resource_type: &'static K8sType,
    /// The id of the Application that needs to be reconciled
    pub application_id: ObjectId,
    /// The generation of the Application, for events on the Application itself
    pub application_generation: Option<i64>,
}

impl ResourceMessage {
    pub fn is_application_event(&self) -> bool {
        self.application_generation.is_some()
    }
}

/// Converts an event for a resource of the given type into a message, or returns `None` if the
/// resource can't be attributed to an Application
pub fn to_message(
    resource_type: &'static K8sType,
    event_type: EventType,
    resource: &K8sResource,
) -> Option<ResourceMessage> {
    if resource_type == APPLICATION {
        return Some(ResourceMessage {
            event_type,
            resource_type,
            application_id: resource.get_object_id().to_owned(),
            application_generation: Some(resource.generation()),
        });
    }
    let owner = resource
        .controller_owner()
        .filter(|owner| APPLICATION.matches(owner.api_version.as_str(), owner.kind.as_str()))?;
    Some(ResourceMessage {
        event_type,
        resource_type,
        application_id: ObjectId::new(resource.namespace().unwrap_or(""), owner.name),
        application_generation: None,
    })
}

#[derive(Debug)]
enum MonitorErr {
    SendErr,
    ClientErr(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl Display for MonitorErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MonitorErr::SendErr => f.write_str("Sender channel closed"),
            MonitorErr::ClientErr(err) => write!(f, "Client Error: {}", err),
            MonitorErr::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            MonitorErr::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            MonitorErr::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl From<ApiError> for MonitorErr {
    fn from(err: ApiError) -> MonitorErr {
        if err.code == 410 {
            MonitorErr::ResourceVersionExpired
        } else {
            MonitorErr::Api(err)
        }
    }
}

impl From<InvalidResourceError> for MonitorErr {
    fn from(err: InvalidResourceError) -> MonitorErr {
        MonitorErr::InvalidResource(err)
    }
}

impl From<ClientError> for MonitorErr {
    fn from(err: ClientError) -> MonitorErr {
        if err.is_http_410() {
            MonitorErr::ResourceVersionExpired
        } else {
            MonitorErr::ClientErr(err)
        }
    }
}

impl<T> From<SendError<T>> for MonitorErr {
    fn from(_: SendError<T>) -> MonitorErr {
        MonitorErr::SendErr
    }
}

pub fn start_application_monitor(
    executor: &Handle,
    namespace: Option<String>,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) -> JoinHandle<()> {
    start_monitor(executor, APPLICATION, namespace, None, client, sender, metrics)
}

/// Children are only watched if they carry the ownership label, which limits the watch to
/// resources that this operator created. A child whose ownership label was removed produces no
/// events even while the Application is still its controller. It's corrected, and relabeled, by
/// the next pass that the Application or one of its other children triggers.
pub fn start_child_monitor(
    executor: &Handle,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    label_selector: String,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) -> JoinHandle<()> {
    start_monitor(
        executor,
        k8s_type,
        namespace,
        Some(label_selector),
        client,
        sender,
        metrics,
    )
}

fn start_monitor(
    executor: &Handle,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    label_selector: Option<String>,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) -> JoinHandle<()> {
    let monitor = Monitor {
        metrics,
        client,
        k8s_type,
        sender,
        label_selector,
        namespace,
    };
    executor.spawn(monitor.run())
}

struct Monitor {
    metrics: WatcherMetrics,
    client: Client,
    k8s_type: &'static K8sType,
    sender: Sender<ResourceMessage>,
    label_selector: Option<String>,
    namespace: Option<String>,
}

impl Monitor {
    async fn run(mut self) {
        log::debug!(
            "Starting monitor for: {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );
        loop {
            let result = match self.list().await {
                Ok(resource_version) => self.watch_from(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !self.handle_error(err).await {
                    break;
                }
            }
        }
        log::info!("Ending monitor for: {}", self.k8s_type);
    }

    /// Returns false if the monitor should stop
    async fn handle_error(&mut self, error: MonitorErr) -> bool {
        match error {
            MonitorErr::SendErr => {
                log::debug!("Operator is shutting down, stopping monitor for: {}", self.k8s_type);
                false
            }
            MonitorErr::ResourceVersionExpired => {
                log::warn!("ResourceVersion is too old for: {}, re-listing", self.k8s_type);
                true
            }
            other => {
                log::error!("Error in monitor for: {}, err: {}", self.k8s_type, other);
                self.metrics.error();
                tokio::time::sleep(ERROR_PAUSE).await;
                !self.sender.is_closed()
            }
        }
    }

    async fn watch_from(&mut self, mut resource_version: String) -> Result<(), MonitorErr> {
        loop {
            self.metrics.request_started();
            if let Some(version) = self.watch_once(&resource_version).await? {
                resource_version = version;
            }
        }
    }

    /// Runs a single watch request until the server ends it, returning the last resourceVersion
    async fn watch_once(&mut self, resource_version: &str) -> Result<Option<String>, MonitorErr> {
        log::debug!(
            "Starting watch of: {} with resourceVersion: {}",
            self.k8s_type,
            resource_version
        );
        let mut events = self
            .client
            .watch(
                self.k8s_type,
                self.namespace.as_deref(),
                Some(resource_version),
                self.label_selector.as_deref(),
            )
            .await?;

        let mut new_version = None;
        while let Some(result) = events.next().await {
            self.metrics.event_received();
            new_version = Some(self.handle_event(result?).await?);
        }
        Ok(new_version)
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<String, MonitorErr> {
        let (event_type, object) = match event {
            WatchEvent::Added(obj) => (None, obj),
            WatchEvent::Modified(obj) => (None, obj),
            WatchEvent::Deleted(obj) => (Some(EventType::Deleted), obj),
            WatchEvent::Error(err) => {
                log::warn!("Got api error for watch on: {}, err: {}", self.k8s_type, err);
                return Err(err.into());
            }
        };
        let resource = K8sResource::from_value(object)?;
        let event_type = event_type.unwrap_or_else(|| EventType::for_modified(&resource));
        self.send(event_type, &resource).await?;
        Ok(resource.resource_version().to_owned())
    }

    async fn send(
        &mut self,
        event_type: EventType,
        resource: &K8sResource,
    ) -> Result<(), MonitorErr> {
        match to_message(self.k8s_type, event_type, resource) {
            Some(message) => {
                log::trace!("Sending message: {:?}", message);
                self.sender.send(message).await?;
            }
            None => log::debug!(
                "Ignoring {:?} event for {} {} without an Application controller",
                event_type,
                self.k8s_type.kind,
                resource.get_object_id()
            ),
        }
        Ok(())
    }

    /// Lists every resource and sends a message for each one, so that anything that changed
    /// while there was no watch gets reconciled. Returns the resourceVersion of the list.
    async fn list(&mut self) -> Result<String, MonitorErr> {
        log::info!(
            "Listing resources of type: {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );
        self.metrics.request_started();
        let ObjectList { metadata, items } = self
            .client
            .list_all(
                self.k8s_type,
                self.namespace.as_deref(),
                self.label_selector.as_deref(),
            )
            .await?;
        let resource_version = metadata.resource_version.ok_or_else(|| {
            InvalidResourceError::new(
                "list result from api server is missing metadata.resourceVersion",
                Value::Null,
            )
        })?;

        for mut object in items {
            self.add_type_to_list_item(&mut object)?;
            let resource = K8sResource::from_value(object)?;
            let event_type = EventType::for_modified(&resource);
            self.send(event_type, &resource).await?;
        }
        Ok(resource_version)
    }

    /// Items in a list response are missing their apiVersion and kind
    fn add_type_to_list_item(&self, item: &mut Value) -> Result<(), InvalidResourceError> {
        match item.as_object_mut() {
            Some(obj) => {
                obj.insert("apiVersion".to_owned(), self.k8s_type.api_version.into());
                obj.insert("kind".to_owned(), self.k8s_type.kind.into());
                Ok(())
            }
            None => Err(InvalidResourceError::new(
                "list item must be an object",
                item.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;
    use serde_json::json;

    fn resource(kind: &str, owner_refs: Value) -> K8sResource {
        K8sResource::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {
                "namespace": "prod",
                "name": "child",
                "uid": "u1",
                "resourceVersion": "3",
                "generation": 4,
                "ownerReferences": owner_refs,
            }
        }))
        .unwrap()
    }

    #[test]
    fn application_events_carry_the_generation() {
        let app = resource("Application", json!([]));
        let message = to_message(APPLICATION, EventType::Updated, &app).unwrap();
        assert_eq!(ObjectId::new("prod", "child"), message.application_id);
        assert_eq!(Some(4), message.application_generation);
        assert!(message.is_application_event());
    }

    #[test]
    fn child_events_are_attributed_to_the_controlling_application() {
        let child = resource(
            "Service",
            json!([{
                "apiVersion": "configuration.github.com/v1",
                "kind": "Application",
                "name": "shop",
                "uid": "app-uid",
                "controller": true,
            }]),
        );
        let message = to_message(k8s_types::core::v1::Service, EventType::Deleted, &child).unwrap();
        assert_eq!(ObjectId::new("prod", "shop"), message.application_id);
        assert_eq!(EventType::Deleted, message.event_type);
        assert!(!message.is_application_event());
    }

    #[test]
    fn child_events_without_an_application_controller_are_ignored() {
        let child = resource(
            "Service",
            json!([{
                "apiVersion": "apps/v1",
                "kind": "ReplicaSet",
                "name": "shop",
                "uid": "rs-uid",
                "controller": true,
            }]),
        );
        assert!(to_message(k8s_types::core::v1::Service, EventType::Updated, &child).is_none());
    }
}
