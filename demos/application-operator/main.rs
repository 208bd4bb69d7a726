//! Runs the Application operator. By default the built-in manifests are used for the children.
//! Set `TEMPLATE_DIR` to a directory containing `deployment.yaml`, `service.yaml` and
//! `ingress.yaml` to render the children from templates instead, and `WATCH_NAMESPACE` to
//! restrict the operator to a single namespace.
//!
//! Run it against the cluster from your current kubeconfig context with:
//!
//! ```sh
//! RUST_LOG=app_operator=info TEMPLATE_DIR=demos/application-operator/templates \
//!     cargo run --example application-operator
//! ```
use app_operator::prelude::*;

use anyhow::Context;

/// Used as the value of the ownership label on every child, and as the user agent
const OPERATOR_NAME: &str = "application-operator";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut operator_config = OperatorConfig::new(OPERATOR_NAME);
    if let Ok(namespace) = std::env::var("WATCH_NAMESPACE") {
        log::info!("Only watching Applications in namespace: {}", namespace);
        operator_config = operator_config.within_namespace(namespace);
    }

    // run_operator only returns if something has gone wrong
    let err = match std::env::var_os("TEMPLATE_DIR") {
        Some(dir) => {
            let templates = TemplateManifests::load(&dir)
                .with_context(|| format!("failed to load templates from {:?}", dir))?;
            run_operator(operator_config, templates)
        }
        None => run_operator(operator_config, BuiltinManifests),
    };
    Err(anyhow::anyhow!("operator stopped: {}", err))
}
