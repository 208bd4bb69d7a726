//! The `Application` custom resource, which is the desired-state descriptor that the operator
//! reconciles. Only the parts that the reconciler needs are modeled here. The `status` is never
//! read or written.
use crate::resource::{InvalidResourceError, K8sResource, ObjectId, ObjectIdRef};

use serde_json::Value;

/// The `spec` of an Application, as authored by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub replicas: i32,
    pub image: String,
    #[serde(default)]
    pub enable_service: bool,
    #[serde(default)]
    pub enable_ingress: bool,
}

/// A snapshot of an Application, taken at the start of a reconcile pass. It's never modified
/// during the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub id: ObjectId,
    pub uid: String,
    pub generation: i64,
    pub resource_version: String,
    /// true if the Application has a deletion timestamp
    pub deleting: bool,
    pub spec: ApplicationSpec,
}

impl Application {
    pub fn from_resource(resource: &K8sResource) -> Result<Application, InvalidResourceError> {
        let spec_json = resource.as_ref().pointer("/spec").cloned().ok_or_else(|| {
            InvalidResourceError::new("Application is missing spec", resource.as_ref().clone())
        })?;
        let spec = serde_json::from_value::<ApplicationSpec>(spec_json).map_err(|err| {
            log::warn!(
                "Application {} has an invalid spec: {}",
                resource.get_object_id(),
                err
            );
            InvalidResourceError::new("Application spec is invalid", resource.as_ref().clone())
        })?;

        Ok(Application {
            id: resource.get_object_id().to_owned(),
            uid: resource.uid().to_owned(),
            generation: resource.generation(),
            resource_version: resource.resource_version().to_owned(),
            deleting: resource.is_deletion_timestamp_set(),
            spec,
        })
    }

    pub fn from_value(value: Value) -> Result<Application, InvalidResourceError> {
        let resource = K8sResource::from_value(value)?;
        Application::from_resource(&resource)
    }

    pub fn id_ref(&self) -> ObjectIdRef {
        self.id.as_id_ref()
    }

    pub fn namespace(&self) -> &str {
        self.id.namespace.as_str()
    }

    pub fn name(&self) -> &str {
        self.id.name.as_str()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn application_json(spec: Value) -> Value {
        json!({
            "apiVersion": "configuration.github.com/v1",
            "kind": "Application",
            "metadata": {
                "namespace": "default",
                "name": "shop",
                "uid": "app-uid",
                "resourceVersion": "7",
                "generation": 2,
            },
            "spec": spec,
        })
    }

    #[test]
    fn flags_default_to_disabled() {
        let app = Application::from_value(application_json(json!({
            "replicas": 3,
            "image": "app:1.0",
        })))
        .expect("failed to parse application");

        assert_eq!(ObjectIdRef::new("default", "shop"), app.id_ref());
        assert_eq!("app-uid", app.uid);
        assert_eq!(2, app.generation);
        assert!(!app.deleting);
        assert_eq!(
            ApplicationSpec {
                replicas: 3,
                image: "app:1.0".to_owned(),
                enable_service: false,
                enable_ingress: false,
            },
            app.spec
        );
    }

    #[test]
    fn spec_fields_use_camel_case() {
        let app = Application::from_value(application_json(json!({
            "replicas": 1,
            "image": "app:2.0",
            "enableService": true,
            "enableIngress": true,
        })))
        .unwrap();
        assert!(app.spec.enable_service);
        assert!(app.spec.enable_ingress);
    }

    #[test]
    fn invalid_spec_is_an_invalid_resource() {
        let err = Application::from_value(application_json(json!({
            "replicas": "three",
        })))
        .unwrap_err();
        assert_eq!("Application spec is invalid", err.message);
    }

    #[test]
    fn deletion_timestamp_marks_application_as_deleting() {
        let mut json = application_json(json!({"replicas": 1, "image": "app:1.0"}));
        json["metadata"]["deletionTimestamp"] = json!("2020-01-01T00:00:00Z");
        let app = Application::from_value(json).unwrap();
        assert!(app.deleting);
    }
}
