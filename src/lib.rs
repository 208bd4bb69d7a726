//! An operator that keeps a Deployment, and optionally a Service and an Ingress, in line with each
//! `Application` custom resource.
//!
//! An Application looks like this:
//!
//! ```yaml
//! apiVersion: configuration.github.com/v1
//! kind: Application
//! metadata:
//!   namespace: shop
//!   name: storefront
//! spec:
//!   replicas: 2
//!   image: nginx:1.21
//!   enableService: true
//!   enableIngress: false
//! ```
//!
//! Every time an Application or one of its children changes, the operator runs a reconcile pass
//! for that Application. A pass fetches the current state of each child kind, renders the desired
//! manifest for each enabled kind, and then creates, replaces, or deletes children until the two
//! match. Every child gets a controller owner reference back to its Application, so the cluster's
//! garbage collector removes them when the Application is deleted.
//!
//! The manifests come from a `ManifestFactory`. `BuiltinManifests` renders sensible defaults, and
//! `TemplateManifests` renders yaml templates with `{{ placeholder }}` substitution:
//!
//! ```no_run
//! use app_operator::prelude::*;
//!
//! let config = OperatorConfig::new("app-operator").within_namespace("shop");
//!
//! // blocks the current thread for as long as the operator runs
//! let err = run_operator(config, BuiltinManifests);
//! eprintln!("operator stopped: {}", err);
//! ```
//!
//! Any function with the signature `Fn(ChildKind, &Application) -> Result<Value, RenderError>`
//! also works as a `ManifestFactory`.

#[macro_use]
extern crate serde_derive;

pub mod application;
pub mod config;
pub mod error;
pub mod k8s_types;
pub mod manifest;
pub mod resource;
pub mod runner;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::application::{Application, ApplicationSpec};
    pub use crate::config::{ClientConfig, OperatorConfig};
    pub use crate::error::Error;
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::manifest::{
        BuiltinManifests, ChildKind, ManifestFactory, RenderError, TemplateManifests,
    };
    pub use crate::resource::{K8sResource, ObjectId};
    pub use crate::runner::reconcile::ComparisonPolicy;
    pub use crate::runner::{run_operator, run_operator_with_client_config};
    pub use serde::{Deserialize, Serialize};
}
