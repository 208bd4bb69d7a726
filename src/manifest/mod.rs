//! Rendering of the desired child resources for an Application. The reconciler treats the
//! `ManifestFactory` as a pure function of the Application, and calls it once for each enabled
//! child kind on every pass.
mod template;

pub use self::template::TemplateManifests;

use crate::application::{Application, ApplicationSpec};
use crate::k8s_types::{self, K8sType};

use serde_json::{json, Value};

use std::fmt::{self, Display};

/// The kinds of children that are managed for each Application. Each Application has at most
/// one child of each kind, with the same namespace and name as the Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Deployment,
    Service,
    Ingress,
}

impl ChildKind {
    /// All child kinds, in the order that they are reconciled
    pub const ALL: [ChildKind; 3] = [ChildKind::Deployment, ChildKind::Service, ChildKind::Ingress];

    pub fn k8s_type(&self) -> &'static K8sType {
        match self {
            ChildKind::Deployment => k8s_types::apps::v1::Deployment,
            ChildKind::Service => k8s_types::core::v1::Service,
            ChildKind::Ingress => k8s_types::networking_k8s_io::v1::Ingress,
        }
    }

    /// Returns whether a child of this kind should exist for the given spec. The Deployment has
    /// no flag, so it's always required.
    pub fn is_enabled(&self, spec: &ApplicationSpec) -> bool {
        match self {
            ChildKind::Deployment => true,
            ChildKind::Service => spec.enable_service,
            ChildKind::Ingress => spec.enable_ingress,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Deployment => "deployment",
            ChildKind::Service => "service",
            ChildKind::Ingress => "ingress",
        }
    }

    /// Returns the kind that corresponds to the given apiVersion and kind, if any
    pub fn from_type(api_version: &str, kind: &str) -> Option<ChildKind> {
        ChildKind::ALL
            .iter()
            .copied()
            .find(|child_kind| child_kind.k8s_type().matches(api_version, kind))
    }
}

impl Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum RenderError {
    UnknownPlaceholder {
        kind: ChildKind,
        placeholder: String,
    },
    InvalidYaml {
        kind: ChildKind,
        error: serde_yaml::Error,
    },
    NotAnObject {
        kind: ChildKind,
    },
    Other {
        kind: ChildKind,
        message: String,
    },
}

impl RenderError {
    pub fn other(kind: ChildKind, message: impl Into<String>) -> RenderError {
        RenderError::Other {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ChildKind {
        match self {
            RenderError::UnknownPlaceholder { kind, .. } => *kind,
            RenderError::InvalidYaml { kind, .. } => *kind,
            RenderError::NotAnObject { kind } => *kind,
            RenderError::Other { kind, .. } => *kind,
        }
    }
}

impl Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RenderError::UnknownPlaceholder { kind, placeholder } => write!(
                f,
                "{} template references unknown placeholder '{}'",
                kind, placeholder
            ),
            RenderError::InvalidYaml { kind, error } => {
                write!(f, "{} template did not render valid yaml: {}", kind, error)
            }
            RenderError::NotAnObject { kind } => {
                write!(f, "{} template did not render an object", kind)
            }
            RenderError::Other { kind, message } => {
                write!(f, "failed to render {}: {}", kind, message)
            }
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::InvalidYaml { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Produces the desired manifest of a child from an Application. Implementations must be
/// deterministic, since the output is compared against what exists in the cluster. The
/// rendered manifest may omit the namespace and name, which are always the Application's.
pub trait ManifestFactory: Send + Sync + 'static {
    fn render(&self, kind: ChildKind, application: &Application) -> Result<Value, RenderError>;
}

impl<F> ManifestFactory for F
where
    F: Fn(ChildKind, &Application) -> Result<Value, RenderError> + Send + Sync + 'static,
{
    fn render(&self, kind: ChildKind, application: &Application) -> Result<Value, RenderError> {
        self(kind, application)
    }
}

pub const CONTAINER_PORT: u16 = 80;
pub const SERVICE_PORT: u16 = 8080;
pub const INGRESS_CLASS: &str = "nginx";

/// The default `ManifestFactory`. Manifests only use the canonical forms of each field, so that
/// the api server's defaulting never makes them appear diverged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BuiltinManifests;

impl BuiltinManifests {
    fn deployment(&self, app: &Application) -> Value {
        json!({
            "apiVersion": k8s_types::apps::v1::Deployment.api_version,
            "kind": k8s_types::apps::v1::Deployment.kind,
            "metadata": {
                "namespace": app.namespace(),
                "name": app.name(),
                "labels": { "app": app.name() },
            },
            "spec": {
                "replicas": app.spec.replicas,
                "selector": {
                    "matchLabels": { "app": app.name() },
                },
                "template": {
                    "metadata": {
                        "labels": { "app": app.name() },
                    },
                    "spec": {
                        "containers": [
                            {
                                "name": app.name(),
                                "image": app.spec.image.as_str(),
                                "ports": [
                                    { "containerPort": CONTAINER_PORT }
                                ],
                            }
                        ],
                    },
                },
            },
        })
    }

    fn service(&self, app: &Application) -> Value {
        json!({
            "apiVersion": k8s_types::core::v1::Service.api_version,
            "kind": k8s_types::core::v1::Service.kind,
            "metadata": {
                "namespace": app.namespace(),
                "name": app.name(),
                "labels": { "app": app.name() },
            },
            "spec": {
                "type": "ClusterIP",
                "selector": { "app": app.name() },
                "ports": [
                    {
                        "name": "http",
                        "protocol": "TCP",
                        "port": SERVICE_PORT,
                        "targetPort": CONTAINER_PORT,
                    }
                ],
            },
        })
    }

    fn ingress(&self, app: &Application) -> Value {
        json!({
            "apiVersion": k8s_types::networking_k8s_io::v1::Ingress.api_version,
            "kind": k8s_types::networking_k8s_io::v1::Ingress.kind,
            "metadata": {
                "namespace": app.namespace(),
                "name": app.name(),
                "labels": { "app": app.name() },
            },
            "spec": {
                "ingressClassName": INGRESS_CLASS,
                "rules": [
                    {
                        "http": {
                            "paths": [
                                {
                                    "path": "/",
                                    "pathType": "Prefix",
                                    "backend": {
                                        "service": {
                                            "name": app.name(),
                                            "port": { "number": SERVICE_PORT },
                                        }
                                    },
                                }
                            ]
                        }
                    }
                ],
            },
        })
    }
}

impl ManifestFactory for BuiltinManifests {
    fn render(&self, kind: ChildKind, application: &Application) -> Result<Value, RenderError> {
        let manifest = match kind {
            ChildKind::Deployment => self.deployment(application),
            ChildKind::Service => self.service(application),
            ChildKind::Ingress => self.ingress(application),
        };
        Ok(manifest)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{ObjectId, ResourceJson};

    fn app(replicas: i32, image: &str) -> Application {
        Application {
            id: ObjectId::new("default", "shop"),
            uid: "app-uid".to_owned(),
            generation: 1,
            resource_version: "1".to_owned(),
            deleting: false,
            spec: ApplicationSpec {
                replicas,
                image: image.to_owned(),
                enable_service: true,
                enable_ingress: true,
            },
        }
    }

    #[test]
    fn builtin_manifests_have_the_type_and_identity_of_each_kind() {
        let app = app(3, "app:1.0");
        for kind in ChildKind::ALL.iter().copied() {
            let manifest = BuiltinManifests.render(kind, &app).unwrap();
            let k8s_type = kind.k8s_type();
            assert_eq!(Some(k8s_type.api_version), manifest.get_api_version());
            assert_eq!(Some(k8s_type.kind), manifest.get_kind());
            assert_eq!(Some(app.id_ref()), manifest.get_id_ref());
            assert_eq!(Some(kind), ChildKind::from_type(k8s_type.api_version, k8s_type.kind));
        }
    }

    #[test]
    fn deployment_carries_replicas_and_image() {
        let manifest = BuiltinManifests
            .render(ChildKind::Deployment, &app(5, "app:2.0"))
            .unwrap();
        assert_eq!(Some(5), manifest.pointer("/spec/replicas").and_then(Value::as_i64));
        assert_eq!(
            Some("app:2.0"),
            manifest
                .pointer("/spec/template/spec/containers/0/image")
                .and_then(Value::as_str)
        );
    }

    #[test]
    fn ingress_routes_to_the_service_port() {
        let manifest = BuiltinManifests
            .render(ChildKind::Ingress, &app(1, "app:1.0"))
            .unwrap();
        let backend = manifest
            .pointer("/spec/rules/0/http/paths/0/backend/service")
            .unwrap();
        assert_eq!(json!({"name": "shop", "port": {"number": 8080}}), *backend);
    }

    #[test]
    fn only_the_deployment_is_enabled_without_flags() {
        let mut spec = app(1, "app:1.0").spec;
        spec.enable_service = false;
        spec.enable_ingress = false;
        let enabled = ChildKind::ALL
            .iter()
            .filter(|k| k.is_enabled(&spec))
            .collect::<Vec<_>>();
        assert_eq!(vec![&ChildKind::Deployment], enabled);
    }

    #[test]
    fn closures_can_be_used_as_factories() {
        let factory = |kind: ChildKind, _: &Application| -> Result<Value, RenderError> {
            Err(RenderError::other(kind, "boom"))
        };
        let err = factory
            .render(ChildKind::Ingress, &app(1, "app:1.0"))
            .unwrap_err();
        assert_eq!(ChildKind::Ingress, err.kind());
        assert_eq!("failed to render ingress: boom", err.to_string());
    }
}
