use crate::application::Application;
use crate::config::OperatorConfig;
use crate::k8s_types::APPLICATION;
use crate::resource::{InvalidResourceError, JsonObject, ObjectId, ObjectIdRef, ResourceJson};

use serde_json::{json, Value};

use std::fmt::{self, Display};

#[derive(Debug)]
pub enum BindError {
    /// The Application has no uid, which happens if it was deleted in the middle of a pass
    MissingOwnerUid(ObjectId),
    InvalidManifest(InvalidResourceError),
    /// The rendered manifest names a different namespace or name than the Application
    IdentityMismatch { expected: ObjectId, actual: ObjectId },
}

impl BindError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BindError::MissingOwnerUid(_))
    }
}

impl Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BindError::MissingOwnerUid(id) => write!(f, "Application {} has no uid", id),
            BindError::InvalidManifest(err) => Display::fmt(err, f),
            BindError::IdentityMismatch { expected, actual } => write!(
                f,
                "rendered manifest has id {} but must have the id of the Application: {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::InvalidManifest(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InvalidResourceError> for BindError {
    fn from(err: InvalidResourceError) -> BindError {
        BindError::InvalidManifest(err)
    }
}

/// Stamps rendered manifests with everything that ties a child to its Application: the
/// Application's namespace and name, the tracking and ownership labels, and a controller
/// owner reference. The owner reference is what lets the garbage collector delete children
/// along with the Application, and it's also how watch events for children get attributed
/// back to the Application.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipBinder {
    pub operator_name: String,
    pub tracking_label: String,
    pub ownership_label: String,
}

impl OwnershipBinder {
    pub fn from_config(config: &OperatorConfig) -> OwnershipBinder {
        OwnershipBinder {
            operator_name: config.operator_name.clone(),
            tracking_label: config.tracking_label_name.clone(),
            ownership_label: config.ownership_label_name.clone(),
        }
    }

    /// Binds the manifest to the Application. Binding an already bound manifest returns it
    /// unchanged.
    pub fn bind(&self, app: &Application, mut manifest: Value) -> Result<Value, BindError> {
        if app.uid.is_empty() {
            return Err(BindError::MissingOwnerUid(app.id.clone()));
        }
        check_identity(app, &manifest)?;

        let obj = manifest.as_object_mut().ok_or_else(|| {
            InvalidResourceError::new("rendered manifest is not an object", Value::Null)
        })?;
        let meta = child_object(obj, "metadata", "rendered manifest has a non-object 'metadata'")?;
        meta.insert("namespace".to_owned(), app.namespace().into());
        meta.insert("name".to_owned(), app.name().into());

        let labels = child_object(meta, "labels", "rendered manifest has non-object 'labels'")?;
        labels.insert(self.tracking_label.clone(), app.uid.as_str().into());
        labels.insert(self.ownership_label.clone(), self.operator_name.as_str().into());

        let owner_refs = meta
            .entry("ownerReferences")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| {
                InvalidResourceError::new(
                    "rendered manifest has non-array 'ownerReferences'",
                    Value::Null,
                )
            })?;
        let owner_ref = make_owner_ref(app);
        // a resource can only have one controller
        owner_refs.retain(|r| !is_controller_ref(r) || *r == owner_ref);
        if !owner_refs.contains(&owner_ref) {
            owner_refs.push(owner_ref);
        }
        Ok(manifest)
    }
}

fn check_identity(app: &Application, manifest: &Value) -> Result<(), BindError> {
    let namespace = manifest.get_namespace().unwrap_or(app.namespace());
    let name = manifest.get_name().unwrap_or(app.name());
    if app.id == ObjectIdRef::new(namespace, name) {
        Ok(())
    } else {
        Err(BindError::IdentityMismatch {
            expected: app.id.clone(),
            actual: ObjectId::new(namespace, name),
        })
    }
}

fn child_object<'a>(
    parent: &'a mut JsonObject,
    key: &str,
    err_msg: &'static str,
) -> Result<&'a mut JsonObject, InvalidResourceError> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Object(JsonObject::new()))
        .as_object_mut()
        .ok_or_else(|| InvalidResourceError::new(err_msg, Value::Null))
}

fn is_controller_ref(owner_ref: &Value) -> bool {
    owner_ref
        .get("controller")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn make_owner_ref(app: &Application) -> Value {
    json!({
        "apiVersion": APPLICATION.api_version,
        "kind": APPLICATION.kind,
        "name": app.name(),
        "uid": app.uid.as_str(),
        "controller": true,
        "blockOwnerDeletion": true,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::ApplicationSpec;
    use crate::resource::OwnerReference;

    fn binder() -> OwnershipBinder {
        OwnershipBinder::from_config(&OperatorConfig::new("app-operator"))
    }

    fn app(uid: &str) -> Application {
        Application {
            id: ObjectId::new("default", "shop"),
            uid: uid.to_owned(),
            generation: 1,
            resource_version: "1".to_owned(),
            deleting: false,
            spec: ApplicationSpec {
                replicas: 1,
                image: "app:1.0".to_owned(),
                enable_service: false,
                enable_ingress: false,
            },
        }
    }

    fn controller_refs(manifest: &Value) -> Vec<OwnerReference> {
        let refs = manifest["metadata"]["ownerReferences"].clone();
        serde_json::from_value::<Vec<OwnerReference>>(refs)
            .unwrap()
            .into_iter()
            .filter(OwnerReference::is_controller)
            .collect()
    }

    #[test]
    fn fills_in_identity_labels_and_owner_reference() {
        let bound = binder()
            .bind(&app("app-uid"), json!({"apiVersion": "v1", "kind": "Service"}))
            .unwrap();

        assert_eq!(Some(ObjectIdRef::new("default", "shop")), bound.get_id_ref());
        let labels = &bound["metadata"]["labels"];
        assert_eq!("app-uid", labels["app.kubernetes.io/instance"]);
        assert_eq!("app-operator", labels["app.kubernetes.io/managed-by"]);

        let owners = controller_refs(&bound);
        assert_eq!(1, owners.len());
        assert_eq!("Application", owners[0].kind);
        assert_eq!("configuration.github.com/v1", owners[0].api_version);
        assert_eq!("shop", owners[0].name);
        assert_eq!("app-uid", owners[0].uid);
        assert_eq!(Some(true), owners[0].block_owner_deletion);
    }

    #[test]
    fn binding_is_idempotent() {
        let binder = binder();
        let app = app("app-uid");
        let once = binder.bind(&app, json!({"kind": "Service"})).unwrap();
        let twice = binder.bind(&app, once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn replaces_a_foreign_controller_reference() {
        let manifest = json!({
            "metadata": {
                "ownerReferences": [
                    {
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "name": "x",
                        "uid": "other",
                        "controller": true,
                    },
                    {"apiVersion": "v1", "kind": "ConfigMap", "name": "y", "uid": "plain"},
                ]
            }
        });
        let bound = binder().bind(&app("app-uid"), manifest).unwrap();
        let owners = controller_refs(&bound);
        assert_eq!(1, owners.len());
        assert_eq!("app-uid", owners[0].uid);
        assert_eq!(2, bound["metadata"]["ownerReferences"].as_array().unwrap().len());
    }

    #[test]
    fn missing_owner_uid_is_a_transient_failure() {
        let err = binder().bind(&app(""), json!({})).unwrap_err();
        assert!(matches!(err, BindError::MissingOwnerUid(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn mismatched_identity_is_rejected() {
        let manifest = json!({"metadata": {"namespace": "default", "name": "other"}});
        let err = binder().bind(&app("app-uid"), manifest).unwrap_err();
        match err {
            BindError::IdentityMismatch { expected, actual } => {
                assert_eq!(ObjectId::new("default", "shop"), expected);
                assert_eq!(ObjectId::new("default", "other"), actual);
            }
            other => panic!("expected IdentityMismatch, got: {:?}", other),
        }
    }
}
