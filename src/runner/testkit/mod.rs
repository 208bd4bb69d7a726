//! Tools for testing the reconciler without a cluster. `FakeStore` is an in-memory
//! `ClusterStore` that records every call and mimics the api server closely enough for the
//! reconciler: it assigns uids and resourceVersions, fills in the defaults and status that a
//! real cluster adds to written children, rejects stale replaces with a 409, and returns 404s
//! for missing resources. `TestKit` wires it up to a `Reconciler` and a
//! current-thread runtime so that tests can run passes synchronously.
use crate::application::ApplicationSpec;
use crate::config::OperatorConfig;
use crate::k8s_types::{K8sType, APPLICATION};
use crate::manifest::ManifestFactory;
use crate::resource::{ObjectId, ObjectIdRef, ResourceJson};
use crate::runner::client::Error;
use crate::runner::reconcile::{ReconcileError, ReconcileOutcome, ReconcileSettings, Reconciler};
use crate::runner::store::ClusterStore;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use http::StatusCode;
use serde_json::{json, Map, Value};
use tokio::runtime::{self, Runtime};

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Replace,
    Delete,
}

impl StoreOp {
    pub fn is_mutation(&self) -> bool {
        *self != StoreOp::Get
    }
}

/// A single call to the store, as it was made by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub kind: &'static str,
    pub id: ObjectId,
    /// The resource that was sent, for creates and replaces
    pub body: Option<Value>,
}

impl Display for StoreCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} {} {}", self.op, self.kind, self.id)
    }
}

type Key = (&'static str, &'static str, ObjectId);

fn key(k8s_type: &'static K8sType, id: ObjectIdRef<'_>) -> Key {
    (k8s_type.api_version, k8s_type.kind, id.to_owned())
}

#[derive(Debug)]
struct Failure {
    op: StoreOp,
    kind: &'static str,
    status: StatusCode,
}

#[derive(Debug, Default)]
pub struct FakeStore {
    resources: Mutex<HashMap<Key, Value>>,
    calls: Mutex<Vec<StoreCall>>,
    failures: Mutex<Vec<Failure>>,
    counter: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a test that panicked while holding the lock has already failed
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeStore {
    pub fn new() -> FakeStore {
        FakeStore::default()
    }

    /// Stores the resource directly, without recording a call. Any missing uid, resourceVersion
    /// or generation is filled in. Returns the stored resource.
    pub fn put(&self, k8s_type: &'static K8sType, mut resource: Value) -> Value {
        let id = resource
            .get_id_ref()
            .map(|id| id.to_owned())
            .expect("resource must have a name");
        let next = self.next_version();
        if let Some(meta) = resource.pointer_mut("/metadata").and_then(Value::as_object_mut) {
            meta.entry("uid").or_insert_with(|| format!("uid-{}", next).into());
            meta.entry("generation").or_insert_with(|| 1.into());
            meta.insert("resourceVersion".to_owned(), next.to_string().into());
        }
        let key = (k8s_type.api_version, k8s_type.kind, id);
        lock(&self.resources).insert(key, resource.clone());
        resource
    }

    /// Returns the stored resource, without recording a call
    pub fn stored(&self, k8s_type: &'static K8sType, namespace: &str, name: &str) -> Option<Value> {
        let key = key(k8s_type, ObjectIdRef::new(namespace, name));
        lock(&self.resources).get(&key).cloned()
    }

    /// Changes a stored resource the way that some other client would, bumping its
    /// resourceVersion. Returns false if the resource does not exist.
    pub fn modify<F: FnOnce(&mut Value)>(
        &self,
        k8s_type: &'static K8sType,
        namespace: &str,
        name: &str,
        modify: F,
    ) -> bool {
        let next = self.next_version();
        let key = key(k8s_type, ObjectIdRef::new(namespace, name));
        let mut resources = lock(&self.resources);
        match resources.get_mut(&key) {
            Some(resource) => {
                modify(resource);
                resource["metadata"]["resourceVersion"] = next.to_string().into();
                true
            }
            None => false,
        }
    }

    /// Removes a stored resource, without recording a call
    pub fn remove(&self, k8s_type: &'static K8sType, namespace: &str, name: &str) -> Option<Value> {
        let key = key(k8s_type, ObjectIdRef::new(namespace, name));
        lock(&self.resources).remove(&key)
    }

    /// The next call with the given operation and type fails with the status
    pub fn fail_next(&self, op: StoreOp, k8s_type: &'static K8sType, status: StatusCode) {
        lock(&self.failures).push(Failure {
            op,
            kind: k8s_type.kind,
            status,
        });
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    /// All the creates, replaces and deletes, in order
    pub fn mutations(&self) -> Vec<StoreCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn next_version(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(
        &self,
        op: StoreOp,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
        body: Option<&Value>,
    ) -> Result<(), Error> {
        lock(&self.calls).push(StoreCall {
            op,
            kind: k8s_type.kind,
            id: id.to_owned(),
            body: body.cloned(),
        });
        let mut failures = lock(&self.failures);
        let injected = failures
            .iter()
            .position(|f| f.op == op && f.kind == k8s_type.kind);
        match injected {
            Some(idx) => Err(Error::http(failures.remove(idx).status)),
            None => Ok(()),
        }
    }

    fn do_get(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
    ) -> Result<Option<Value>, Error> {
        self.record(StoreOp::Get, k8s_type, id, None)?;
        Ok(lock(&self.resources).get(&key(k8s_type, id)).cloned())
    }

    fn do_create(&self, k8s_type: &'static K8sType, resource: &Value) -> Result<Value, Error> {
        let id = resource
            .get_id_ref()
            .ok_or_else(|| Error::http(StatusCode::UNPROCESSABLE_ENTITY))?;
        self.record(StoreOp::Create, k8s_type, id, Some(resource))?;
        if lock(&self.resources).contains_key(&key(k8s_type, id)) {
            return Err(Error::http(StatusCode::CONFLICT));
        }
        let mut created = resource.clone();
        if let Some(meta) = created.pointer_mut("/metadata").and_then(Value::as_object_mut) {
            meta.remove("uid");
        }
        apply_server_defaults(k8s_type, &mut created);
        Ok(self.put(k8s_type, created))
    }

    fn do_replace(
        &self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<Value, Error> {
        self.record(StoreOp::Replace, k8s_type, id, Some(resource))?;
        let next = self.next_version();
        let mut resources = lock(&self.resources);
        let existing = resources
            .get_mut(&key(k8s_type, id))
            .ok_or_else(|| Error::http(StatusCode::NOT_FOUND))?;
        let sent_version = resource.pointer("/metadata/resourceVersion");
        if sent_version != existing.pointer("/metadata/resourceVersion") {
            return Err(Error::http(StatusCode::CONFLICT));
        }

        let mut replaced = resource.clone();
        apply_server_defaults(k8s_type, &mut replaced);
        let generation = existing
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if replaced.get("spec") != existing.get("spec") {
            generation + 1
        } else {
            generation
        };
        let uid = existing.pointer("/metadata/uid").cloned().unwrap_or(Value::Null);
        if let Some(meta) = replaced.pointer_mut("/metadata").and_then(Value::as_object_mut) {
            meta.insert("uid".to_owned(), uid);
            meta.insert("generation".to_owned(), generation.into());
            meta.insert("resourceVersion".to_owned(), next.to_string().into());
        }
        *existing = replaced.clone();
        Ok(replaced)
    }

    fn do_delete(&self, k8s_type: &'static K8sType, id: ObjectIdRef<'_>) -> Result<(), Error> {
        self.record(StoreOp::Delete, k8s_type, id, None)?;
        lock(&self.resources).remove(&key(k8s_type, id));
        Ok(())
    }
}

/// The address that every fake Service gets
pub const CLUSTER_IP: &str = "10.96.0.10";

fn object_mut<'a>(resource: &'a mut Value, pointer: &str) -> Option<&'a mut Map<String, Value>> {
    resource.pointer_mut(pointer).and_then(Value::as_object_mut)
}

fn objects_mut<'a>(
    resource: &'a mut Value,
    pointer: &str,
) -> impl Iterator<Item = &'a mut Map<String, Value>> {
    resource
        .pointer_mut(pointer)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|items| items.iter_mut().filter_map(Value::as_object_mut))
}

fn default_field(object: &mut Map<String, Value>, field: &str, value: Value) {
    object.entry(field).or_insert(value);
}

/// Adds what the api server's defaulting and the cluster's controllers add to a written
/// resource, so that children look the way they do when they're read back from a real cluster
fn apply_server_defaults(k8s_type: &K8sType, resource: &mut Value) {
    if let Some(meta) = object_mut(resource, "/metadata") {
        default_field(meta, "creationTimestamp", json!("2021-01-01T00:00:00Z"));
    }
    match k8s_type.kind {
        "Deployment" => {
            if let Some(spec) = object_mut(resource, "/spec") {
                default_field(spec, "revisionHistoryLimit", json!(10));
                default_field(spec, "progressDeadlineSeconds", json!(600));
                default_field(
                    spec,
                    "strategy",
                    json!({
                        "type": "RollingUpdate",
                        "rollingUpdate": {"maxSurge": "25%", "maxUnavailable": "25%"},
                    }),
                );
            }
            if let Some(pod) = object_mut(resource, "/spec/template/spec") {
                default_field(pod, "restartPolicy", json!("Always"));
                default_field(pod, "dnsPolicy", json!("ClusterFirst"));
                default_field(pod, "terminationGracePeriodSeconds", json!(30));
            }
            for container in objects_mut(resource, "/spec/template/spec/containers") {
                default_field(container, "imagePullPolicy", json!("IfNotPresent"));
                default_field(container, "terminationMessagePath", json!("/dev/termination-log"));
                default_field(container, "terminationMessagePolicy", json!("File"));
                default_field(container, "resources", json!({}));
                if let Some(ports) = container.get_mut("ports").and_then(Value::as_array_mut) {
                    for port in ports.iter_mut().filter_map(Value::as_object_mut) {
                        default_field(port, "protocol", json!("TCP"));
                    }
                }
            }
            let replicas = resource.pointer("/spec/replicas").cloned().unwrap_or_else(|| json!(1));
            resource["status"] = json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "availableReplicas": replicas,
            });
        }
        "Service" => {
            if let Some(spec) = object_mut(resource, "/spec") {
                default_field(spec, "clusterIP", json!(CLUSTER_IP));
                default_field(spec, "clusterIPs", json!([CLUSTER_IP]));
                default_field(spec, "sessionAffinity", json!("None"));
            }
            for port in objects_mut(resource, "/spec/ports") {
                default_field(port, "protocol", json!("TCP"));
                if let Some(number) = port.get("port").cloned() {
                    default_field(port, "targetPort", number);
                }
            }
            resource["status"] = json!({"loadBalancer": {}});
        }
        "Ingress" => {
            resource["status"] = json!({"loadBalancer": {"ingress": [{"ip": "192.0.2.10"}]}});
        }
        _ => {}
    }
}

impl ClusterStore for FakeStore {
    fn get<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<Option<Value>, Error>> {
        future::ready(self.do_get(k8s_type, id)).boxed()
    }

    fn create<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>> {
        future::ready(self.do_create(k8s_type, resource)).boxed()
    }

    fn replace<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>> {
        future::ready(self.do_replace(k8s_type, id, resource)).boxed()
    }

    fn delete<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        future::ready(self.do_delete(k8s_type, id)).boxed()
    }
}

/// Returns the json of an Application with the given spec
pub fn application_json(namespace: &str, name: &str, spec: &ApplicationSpec) -> Value {
    json!({
        "apiVersion": APPLICATION.api_version,
        "kind": APPLICATION.kind,
        "metadata": {
            "namespace": namespace,
            "name": name,
        },
        "spec": spec,
    })
}

/// Runs reconcile passes against a `FakeStore`
pub struct TestKit {
    runtime: Runtime,
    pub store: Arc<FakeStore>,
    pub reconciler: Reconciler,
}

impl TestKit {
    pub fn new(factory: impl ManifestFactory) -> TestKit {
        TestKit::with_config(&OperatorConfig::new("app-operator"), factory)
    }

    pub fn with_config(config: &OperatorConfig, factory: impl ManifestFactory) -> TestKit {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create runtime");
        let store = Arc::new(FakeStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(factory),
            ReconcileSettings::from_config(config),
        );
        TestKit {
            runtime,
            store,
            reconciler,
        }
    }

    /// Creates the Application, or replaces the spec of an existing one
    pub fn apply_application(&self, namespace: &str, name: &str, spec: &ApplicationSpec) -> Value {
        let spec_json = serde_json::to_value(spec).expect("failed to serialize spec");
        let updated = self.store.modify(APPLICATION, namespace, name, |app| {
            app["spec"] = spec_json;
            let generation = app["metadata"]["generation"].as_i64().unwrap_or(1);
            app["metadata"]["generation"] = (generation + 1).into();
        });
        if !updated {
            self.store
                .put(APPLICATION, application_json(namespace, name, spec));
        }
        self.store
            .stored(APPLICATION, namespace, name)
            .expect("application was not stored")
    }

    pub fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let id = ObjectIdRef::new(namespace, name);
        self.runtime.block_on(self.reconciler.reconcile(id))
    }

    /// Reconciles and returns only the calls that the pass made
    pub fn reconcile_calls(
        &self,
        namespace: &str,
        name: &str,
    ) -> (Result<ReconcileOutcome, ReconcileError>, Vec<StoreCall>) {
        self.store.clear_calls();
        let result = self.reconcile(namespace, name);
        (result, self.store.calls())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;

    #[test]
    fn created_children_get_server_defaults_and_status() {
        let store = FakeStore::new();
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"namespace": "shop", "name": "storefront"},
            "spec": {"ports": [{"name": "http", "port": 8080}]},
        });
        let created = store.do_create(k8s_types::core::v1::Service, &service).unwrap();

        assert_eq!(json!(CLUSTER_IP), created["spec"]["clusterIP"]);
        assert_eq!(json!("TCP"), created["spec"]["ports"][0]["protocol"]);
        assert_eq!(json!(8080), created["spec"]["ports"][0]["targetPort"]);
        assert_eq!(json!({"loadBalancer": {}}), created["status"]);
        assert!(created.pointer("/metadata/uid").is_some());
    }

    #[test]
    fn defaults_never_override_written_fields() {
        let mut deployment = json!({
            "metadata": {"namespace": "shop", "name": "storefront"},
            "spec": {
                "replicas": 2,
                "template": {"spec": {"containers": [
                    {"name": "app", "image": "app:1.0", "imagePullPolicy": "Always"},
                ]}},
            },
        });
        apply_server_defaults(k8s_types::apps::v1::Deployment, &mut deployment);

        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(json!("Always"), container["imagePullPolicy"]);
        assert_eq!(json!("/dev/termination-log"), container["terminationMessagePath"]);
        assert_eq!(json!(2), deployment["status"]["replicas"]);
    }
}
