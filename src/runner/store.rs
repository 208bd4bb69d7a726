use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::{Client, Error};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

/// The operations that the reconciler needs from the cluster. Every call goes to the api server,
/// so each reconcile pass sees fresh state. The `Client` is the real implementation, and the
/// `testkit` feature provides an in-memory one.
pub trait ClusterStore: Send + Sync + 'static {
    /// Returns `Ok(None)` if the resource does not exist
    fn get<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<Option<Value>, Error>>;

    /// Creates the resource, returning it as it was persisted
    fn create<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>>;

    /// Replaces the whole resource. The `metadata.resourceVersion` of the `resource` must match
    /// the current version, or else this fails with a 409 conflict.
    fn replace<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>>;

    /// Deleting something that's already gone or already being deleted is not an error
    fn delete<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

impl ClusterStore for Client {
    fn get<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<Option<Value>, Error>> {
        async move { self.get_resource(k8s_type, &id).await }.boxed()
    }

    fn create<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>> {
        self.create_resource(k8s_type, resource).boxed()
    }

    fn replace<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
        resource: &'a Value,
    ) -> BoxFuture<'a, Result<Value, Error>> {
        async move { self.replace_resource(k8s_type, &id, resource).await }.boxed()
    }

    fn delete<'a>(
        &'a self,
        k8s_type: &'static K8sType,
        id: ObjectIdRef<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move { self.delete_resource(k8s_type, &id).await }.boxed()
    }
}
