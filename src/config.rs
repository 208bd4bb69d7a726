mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use crate::runner::reconcile::ComparisonPolicy;

use std::io;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TRACKING_LABEL_NAME: &str = "app.kubernetes.io/instance";
pub const DEFAULT_OWNERSHIP_LABEL_NAME: &str = "app.kubernetes.io/managed-by";

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Configuration of the operator itself, independent of how it connects to the api server.
/// Construct it with `OperatorConfig::new` and then customize it with the builder functions.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Used as the value of the ownership label on every child, and as the user agent
    pub operator_name: String,
    /// When set, only Applications (and children) in this namespace are watched
    pub namespace: Option<String>,
    /// Label whose value is set to the uid of the owning Application
    pub tracking_label_name: String,
    /// Label whose value is set to the `operator_name`. Child watches select on it.
    pub ownership_label_name: String,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
    /// Upper bound on the number of distinct Applications reconciled concurrently
    pub max_concurrent_reconciles: usize,
    /// Upper bound on the backoff between retries of a failing Application
    pub max_retry_interval: Duration,
    pub comparison_policy: ComparisonPolicy,
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> OperatorConfig {
        OperatorConfig {
            operator_name: operator_name.into(),
            namespace: None,
            tracking_label_name: DEFAULT_TRACKING_LABEL_NAME.to_owned(),
            ownership_label_name: DEFAULT_OWNERSHIP_LABEL_NAME.to_owned(),
            server_port: 8080,
            expose_metrics: true,
            expose_health: true,
            max_concurrent_reconciles: 4,
            max_retry_interval: Duration::from_secs(300),
            comparison_policy: ComparisonPolicy::default(),
        }
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose_metrics: bool) -> Self {
        self.expose_metrics = expose_metrics;
        self
    }

    pub fn expose_health(mut self, expose_health: bool) -> Self {
        self.expose_health = expose_health;
        self
    }

    pub fn max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max.max(1);
        self
    }

    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn comparison_policy(mut self, policy: ComparisonPolicy) -> Self {
        self.comparison_policy = policy;
        self
    }

    pub fn tracking_label_name(mut self, label: impl Into<String>) -> Self {
        self.tracking_label_name = label.into();
        self
    }

    pub fn ownership_label_name(mut self, label: impl Into<String>) -> Self {
        self.ownership_label_name = label.into();
        self
    }

    /// The label selector used when watching children, which limits the watch to children
    /// created by this operator
    pub fn child_label_selector(&self) -> String {
        format!("{}={}", self.ownership_label_name, self.operator_name)
    }
}

/// Certificate authority data used to verify the api server
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    /// Path to a PEM file
    File(String),
    /// Base64 encoded PEM contents, as they appear in a kubeconfig file
    Contents(String),
}

/// How the client authenticates with the api server
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// The full value of the `Authorization` header
    Header(String),
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
}

impl Credentials {
    pub fn base64_bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    pub(crate) fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // never log secrets
        match self {
            Credentials::Header(_) => f.write_str("Credentials::Header(<redacted>)"),
            Credentials::PemPath {
                certificate_path, ..
            } => write!(f, "Credentials::PemPath({})", certificate_path),
            Credentials::Pem { .. } => f.write_str("Credentials::Pem(<redacted>)"),
        }
    }
}

/// Everything needed to connect to the api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub ca_data: Option<CAData>,
    pub credentials: Credentials,
    pub user_agent: String,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub verify_ssl_certs: bool,
}

impl ClientConfig {
    /// Creates a configuration from the service account that's mounted into every pod. This is
    /// what's used when the operator runs inside the cluster.
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, io::Error> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;

        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };

        let api_server_endpoint = match (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
            _ => format!("https://{}", API_SERVER_HOSTNAME),
        };
        Ok(ClientConfig {
            api_server_endpoint,
            ca_data,
            credentials: Credentials::base64_bearer_token(token.trim()),
            user_agent: user_agent.into(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        })
    }

    /// Creates a configuration from the current context of the kubeconfig file, which is found
    /// using the `KUBECONFIG` environment variable, falling back to `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, KubeConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn child_label_selector_uses_ownership_label() {
        let config = OperatorConfig::new("app-operator").ownership_label_name("example.com/owner");
        assert_eq!("example.com/owner=app-operator", config.child_label_selector());
    }

    #[test]
    fn max_concurrent_reconciles_is_at_least_one() {
        let config = OperatorConfig::new("app-operator").max_concurrent_reconciles(0);
        assert_eq!(1, config.max_concurrent_reconciles);
    }

    #[test]
    fn basic_credentials_are_base64_encoded() {
        let creds = Credentials::basic("admin", "secret");
        assert_eq!(Some("Basic YWRtaW46c2VjcmV0"), creds.header_value());
        assert_eq!("Credentials::Header(<redacted>)", format!("{:?}", creds));
    }
}
