mod json_ext;
mod object_id;

pub use self::json_ext::ResourceJson;
pub use self::object_id::{ObjectId, ObjectIdRef};

use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A back-reference from a child resource to the resource that owns it. Kubernetes only allows
/// owners in the same namespace as the child, so the owner's identity is always the child's
/// namespace combined with the `name` here.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

/// A resource as returned from the api server. Construction validates that all of the metadata
/// that the server always sets is present, so the accessors for those fields never fail.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(msg) = K8sResource::validate(&value) {
            Err(InvalidResourceError {
                message: msg,
                value,
            })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_version(&self) -> &str {
        self.required_str("/metadata/resourceVersion")
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    pub fn uid(&self) -> &str {
        self.required_str("/metadata/uid")
    }

    pub fn name(&self) -> &str {
        self.required_str("/metadata/name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
    }

    pub fn api_version(&self) -> &str {
        self.required_str("/apiVersion")
    }

    pub fn kind(&self) -> &str {
        self.required_str("/kind")
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        let ns = self.namespace().unwrap_or("");
        ObjectIdRef::new(ns, self.name())
    }

    pub fn generation(&self) -> i64 {
        self.0
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    pub fn is_deletion_timestamp_set(&self) -> bool {
        self.0.pointer("/metadata/deletionTimestamp").is_some()
    }

    /// Returns all of the owner references that can be parsed. Malformed entries are skipped.
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.0
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the owner reference that is marked as the controller, if there is one. Kubernetes
    /// guarantees that there's at most one.
    pub fn controller_owner(&self) -> Option<OwnerReference> {
        self.owner_references()
            .into_iter()
            .find(OwnerReference::is_controller)
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }

    fn required_str(&self, pointer: &str) -> &str {
        // validated on construction, so this can only be empty for fields that aren't validated
        self.str_value(pointer).unwrap_or("")
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        str_value(value, "/metadata/resourceVersion").ok_or("missing metadata.resourceVersion")?;
        str_value(value, "/metadata/name").ok_or("missing metadata.name")?;
        str_value(value, "/metadata/uid").ok_or("missing metadata.uid")?;
        str_value(value, "/apiVersion").ok_or("missing apiVersion")?;
        str_value(value, "/kind").ok_or("missing kind")?;
        Ok(())
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl std::borrow::Borrow<Value> for K8sResource {
    fn borrow(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn str_value<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer).and_then(Value::as_str)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "namespace": "ns",
                "name": "web",
                "uid": "child-uid",
                "resourceVersion": "12",
                "generation": 3,
                "ownerReferences": [
                    {
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "name": "other",
                        "uid": "other-uid"
                    },
                    {
                        "apiVersion": "configuration.github.com/v1",
                        "kind": "Application",
                        "name": "web",
                        "uid": "app-uid",
                        "controller": true,
                        "blockOwnerDeletion": true
                    },
                    "not-an-owner-reference"
                ]
            }
        })
    }

    #[test]
    fn from_value_rejects_resources_missing_server_metadata() {
        let mut value = deployment();
        value
            .pointer_mut("/metadata")
            .and_then(Value::as_object_mut)
            .unwrap()
            .remove("uid");
        let err = K8sResource::from_value(value).unwrap_err();
        assert_eq!("missing metadata.uid", err.message);
    }

    #[test]
    fn accessors_read_metadata() {
        let resource = K8sResource::from_value(deployment()).unwrap();
        assert_eq!("web", resource.name());
        assert_eq!(Some("ns"), resource.namespace());
        assert_eq!("12", resource.resource_version());
        assert_eq!(3, resource.generation());
        assert_eq!(ObjectIdRef::new("ns", "web"), resource.get_object_id());
        assert!(!resource.is_deletion_timestamp_set());
    }

    #[test]
    fn controller_owner_skips_non_controller_and_malformed_references() {
        let resource = K8sResource::from_value(deployment()).unwrap();
        assert_eq!(2, resource.owner_references().len());
        let owner = resource.controller_owner().expect("no controller owner");
        assert_eq!("Application", owner.kind);
        assert_eq!("app-uid", owner.uid);
        assert_eq!(Some(true), owner.block_owner_deletion);
    }
}
