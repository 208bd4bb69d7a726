use super::{ChildKind, ManifestFactory, RenderError};
use crate::application::Application;

use anyhow::Context;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

use std::path::Path;

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex = Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").unwrap();
}

/// A `ManifestFactory` that renders yaml templates. Templates use `{{ placeholder }}` syntax,
/// where the placeholder is one of `name`, `namespace`, `replicas`, `image`, `enableService` or
/// `enableIngress`. Values are substituted as-is, so string values that may contain yaml
/// syntax should be quoted in the template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateManifests {
    deployment: String,
    service: String,
    ingress: String,
}

impl TemplateManifests {
    pub fn new(
        deployment: impl Into<String>,
        service: impl Into<String>,
        ingress: impl Into<String>,
    ) -> TemplateManifests {
        TemplateManifests {
            deployment: deployment.into(),
            service: service.into(),
            ingress: ingress.into(),
        }
    }

    /// Loads `deployment.yaml`, `service.yaml` and `ingress.yaml` from the given directory
    pub fn load(dir: impl AsRef<Path>) -> anyhow::Result<TemplateManifests> {
        let dir = dir.as_ref();
        let read = |kind: ChildKind| -> anyhow::Result<String> {
            let path = dir.join(format!("{}.yaml", kind.as_str()));
            let contents = std::fs::read_to_string(&path).with_context(|| {
                format!("failed to read {} template at '{}'", kind, path.display())
            })?;
            log::debug!("Loaded {} template from '{}'", kind, path.display());
            Ok(contents)
        };
        Ok(TemplateManifests {
            deployment: read(ChildKind::Deployment)?,
            service: read(ChildKind::Service)?,
            ingress: read(ChildKind::Ingress)?,
        })
    }

    fn template(&self, kind: ChildKind) -> &str {
        match kind {
            ChildKind::Deployment => self.deployment.as_str(),
            ChildKind::Service => self.service.as_str(),
            ChildKind::Ingress => self.ingress.as_str(),
        }
    }
}

fn placeholder_value(placeholder: &str, app: &Application) -> Option<String> {
    let value = match placeholder {
        "name" => app.name().to_owned(),
        "namespace" => app.namespace().to_owned(),
        "replicas" => app.spec.replicas.to_string(),
        "image" => app.spec.image.clone(),
        "enableService" => app.spec.enable_service.to_string(),
        "enableIngress" => app.spec.enable_ingress.to_string(),
        _ => return None,
    };
    Some(value)
}

fn substitute(kind: ChildKind, template: &str, app: &Application) -> Result<String, RenderError> {
    let mut unknown = None;
    let rendered = PLACEHOLDER_REGEX.replace_all(template, |caps: &Captures| {
        let placeholder = &caps[1];
        placeholder_value(placeholder, app).unwrap_or_else(|| {
            unknown.get_or_insert_with(|| placeholder.to_owned());
            String::new()
        })
    });
    match unknown {
        Some(placeholder) => Err(RenderError::UnknownPlaceholder { kind, placeholder }),
        None => Ok(rendered.into_owned()),
    }
}

impl ManifestFactory for TemplateManifests {
    fn render(&self, kind: ChildKind, application: &Application) -> Result<Value, RenderError> {
        let rendered = substitute(kind, self.template(kind), application)?;
        log::trace!("Rendered {} template for {}: {}", kind, application.id, rendered);
        let value: Value = serde_yaml::from_str(rendered.as_str())
            .map_err(|error| RenderError::InvalidYaml { kind, error })?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(RenderError::NotAnObject { kind })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::ApplicationSpec;
    use crate::resource::ObjectId;
    use serde_json::json;

    const SERVICE_TEMPLATE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  namespace: {{ namespace }}
  name: {{name}}
spec:
  selector:
    app: {{ name }}
  ports:
  - port: 8080
    targetPort: 80
"#;

    fn app() -> Application {
        Application {
            id: ObjectId::new("prod", "shop"),
            uid: "app-uid".to_owned(),
            generation: 1,
            resource_version: "1".to_owned(),
            deleting: false,
            spec: ApplicationSpec {
                replicas: 2,
                image: "registry.example.com/shop:1.0".to_owned(),
                enable_service: true,
                enable_ingress: false,
            },
        }
    }

    fn templates(deployment: &str) -> TemplateManifests {
        TemplateManifests::new(deployment, SERVICE_TEMPLATE, "not: [valid")
    }

    #[test]
    fn placeholders_are_substituted() {
        let deployment = concat!(
            "apiVersion: apps/v1\n",
            "kind: Deployment\n",
            "spec:\n",
            "  replicas: {{ replicas }}\n",
            "  image: \"{{ image }}\"\n",
        );
        let manifest = templates(deployment)
            .render(ChildKind::Deployment, &app())
            .unwrap();
        assert_eq!(
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "spec": {
                    "replicas": 2,
                    "image": "registry.example.com/shop:1.0",
                }
            }),
            manifest
        );

        let service = templates(deployment).render(ChildKind::Service, &app()).unwrap();
        assert_eq!(Some("prod"), service.pointer("/metadata/namespace").and_then(Value::as_str));
        assert_eq!(Some("shop"), service.pointer("/spec/selector/app").and_then(Value::as_str));
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = templates("kind: Deployment\nfoo: {{ bogus }}\n")
            .render(ChildKind::Deployment, &app())
            .unwrap_err();
        match err {
            RenderError::UnknownPlaceholder { kind, placeholder } => {
                assert_eq!(ChildKind::Deployment, kind);
                assert_eq!("bogus", placeholder);
            }
            other => panic!("expected UnknownPlaceholder, got: {:?}", other),
        }
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let err = templates("kind: Deployment")
            .render(ChildKind::Ingress, &app())
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidYaml { kind: ChildKind::Ingress, .. }));
    }

    #[test]
    fn non_object_document_is_an_error() {
        let err = templates("- just\n- a list\n")
            .render(ChildKind::Deployment, &app())
            .unwrap_err();
        assert!(matches!(err, RenderError::NotAnObject { kind: ChildKind::Deployment }));
    }

    #[test]
    fn load_reports_the_missing_path() {
        let err = TemplateManifests::load("/does/not/exist").unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("/does/not/exist/deployment.yaml"), "message was: {}", message);
    }
}
