use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Error representing a problem with loading a kubeconfig file, or creating a `ClientConfig`
/// from it.
#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    /// The current context's user has no credentials in a form that's supported
    MissingCredentials,
    NoHomeDir,
    InvalidKubeconfig(String),
    ExecErr(String),
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeConfigError::Io(e) => write!(f, "could not read kubeconfig: {}", e),
            KubeConfigError::Format(e) => write!(f, "kubeconfig is not valid yaml: {}", e),
            KubeConfigError::MissingCredentials => {
                f.write_str("the current kubeconfig user has no supported credentials")
            }
            KubeConfigError::NoHomeDir => {
                f.write_str("KUBECONFIG is unset and there's no home directory to look in")
            }
            KubeConfigError::InvalidKubeconfig(msg) => write!(f, "invalid kubeconfig: {}", msg),
            KubeConfigError::ExecErr(msg) => write!(f, "exec credential plugin failed: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

fn invalid(message: String) -> KubeConfigError {
    KubeConfigError::InvalidKubeconfig(message)
}

fn kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    std::env::var("KUBECONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            home_dir().map(|mut home| {
                home.push(".kube/config");
                home
            })
        })
        .ok_or(KubeConfigError::NoHomeDir)
}

pub(crate) fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let (kubeconfig, path) = KubeConfig::load()?;
    let dir = parent_dir(&path)?;
    kubeconfig.create_client_config(user_agent, dir)
}

fn parent_dir(path: &Path) -> Result<&Path, KubeConfigError> {
    path.parent()
        .ok_or_else(|| invalid(format!("'{}' has no parent directory", path.display())))
}

/// Represents a kubeconfig file that's been loaded into memory. Only the subset of the format
/// that's needed to connect to a cluster is modeled here.
#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<Named<ClusterInfo>>,
    users: Vec<Named<UserInfo>>,
    contexts: Vec<Named<ContextInfo>>,
}

impl KubeConfig {
    /// Loads the kubeconfig file from the path in the `KUBECONFIG` environment variable, or else
    /// from `~/.kube/config`. The path that it was loaded from is returned along with it.
    pub fn load() -> Result<(KubeConfig, PathBuf), KubeConfigError> {
        let path = kubeconfig_path()?;
        let conf = KubeConfig::load_file(&path)?;
        Ok((conf, path))
    }

    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        let reader = File::open(path)?;
        let conf = serde_yaml::from_reader(reader)?;
        Ok(conf)
    }

    /// Creates a `ClientConfig` from the current context. The `kubeconfig_dir` is used to
    /// resolve relative paths to certificate files.
    pub fn create_client_config(
        &self,
        user_agent: String,
        kubeconfig_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        self.resolve(user_agent, kubeconfig_dir, None)
    }

    /// Same as `create_client_config`, except that the given credentials are used instead of
    /// the ones in the file. Useful for auth mechanisms that aren't supported here.
    pub fn create_client_config_with_credentials(
        &self,
        user_agent: String,
        kubeconfig_dir: &Path,
        credentials: Credentials,
    ) -> Result<ClientConfig, KubeConfigError> {
        self.resolve(user_agent, kubeconfig_dir, Some(credentials))
    }

    fn resolve(
        &self,
        user_agent: String,
        kubeconfig_dir: &Path,
        override_credentials: Option<Credentials>,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = find_named(&self.contexts, &self.current_context).ok_or_else(|| {
            invalid(format!(
                "No context found for current context: '{}'",
                self.current_context
            ))
        })?;
        let cluster = find_named(&self.clusters, &context.cluster)
            .ok_or_else(|| invalid(format!("No cluster found for name: '{}'", context.cluster)))?;
        let user = find_named(&self.users, &context.user)
            .ok_or_else(|| invalid(format!("No user found for name: '{}'", context.user)))?;

        let credentials = match override_credentials {
            Some(creds) => creds,
            None => user.credentials()?,
        };

        let ca_data = cluster
            .certificate_authority_data
            .clone()
            .map(CAData::Contents)
            .or_else(|| {
                cluster.certificate_authority.as_ref().map(|ca_path| {
                    let resolved = kubeconfig_dir.join(ca_path).to_string_lossy().to_string();
                    log::debug!(
                        "Resolved cluster certificate-authority path '{}' to '{}'",
                        ca_path.display(),
                        resolved
                    );
                    CAData::File(resolved)
                })
            });

        Ok(ClientConfig {
            user_agent,
            credentials,
            impersonate: user.as_user.clone(),
            impersonate_groups: user.as_groups.clone(),
            api_server_endpoint: cluster.server.clone(),
            ca_data,
            verify_ssl_certs: !cluster.insecure_skip_tls_verify,
        })
    }
}

fn find_named<'a, T>(items: &'a [Named<T>], name: &str) -> Option<&'a T> {
    items.iter().find(|item| item.name == name).map(Named::inner)
}

// The structs below are only used for deserializing the kubeconfig. They are NOT complete
// definitions of the format.

/// Every list in a kubeconfig has the same shape: a name plus an object under a key that
/// matches the list
#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: T,
}

impl<T> Named<T> {
    fn inner(&self) -> &T {
        &self.value
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<String>,
    client_key: Option<String>,
    #[serde(rename = "as")]
    as_user: Option<String>,
    #[serde(default)]
    as_groups: Vec<String>,
    exec: Option<Exec>,
}

impl UserInfo {
    fn credentials(&self) -> Result<Credentials, KubeConfigError> {
        if let Some(token) = self.token.as_ref() {
            log::debug!("Using auth token from kubeconfig");
            return Ok(Credentials::base64_bearer_token(token));
        }
        if let Some(username) = self.username.as_ref() {
            let pass = self.password.as_ref().ok_or_else(|| {
                invalid("Username is specified but not password".to_owned())
            })?;
            log::debug!("Using username/password from kubeconfig");
            return Ok(Credentials::basic(username, pass));
        }
        if let Some(exec) = self.exec.as_ref() {
            return exec.run().map(Credentials::Header);
        }
        if let Some(certificate_path) = self.client_certificate.as_ref() {
            let private_key_path = self.client_key.as_ref().ok_or_else(|| {
                invalid("'client-certificate' is specified, but 'client-key' is missing".to_owned())
            })?;
            return Ok(Credentials::PemPath {
                certificate_path: certificate_path.clone(),
                private_key_path: private_key_path.clone(),
            });
        }
        if let Some(certificate) = self.client_certificate_data.as_ref() {
            let private_key = self.client_key_data.as_ref().ok_or_else(|| {
                invalid(
                    "'client-certificate-data' is specified, but 'client-key-data' is missing"
                        .to_owned(),
                )
            })?;
            return Ok(Credentials::Pem {
                certificate_base64: certificate.clone(),
                private_key_base64: private_key.clone(),
            });
        }
        Err(KubeConfigError::MissingCredentials)
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecEnv {
    name: String,
    value: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Exec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnv>,
}

impl Exec {
    /// Runs the credential plugin and returns the value of the `Authorization` header
    fn run(&self) -> Result<String, KubeConfigError> {
        log::debug!("Running exec credential plugin: {} {:?}", self.command, self.args);
        let output = std::process::Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|var| (&var.name, &var.value)))
            .output()?;
        if !output.status.success() {
            return Err(KubeConfigError::ExecErr(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let credential: ExecCredential = serde_yaml::from_slice(&output.stdout).map_err(|err| {
            KubeConfigError::ExecErr(format!(
                "'{}' printed an unreadable credential: {}",
                self.command, err
            ))
        })?;
        log::info!(
            "Got a token from '{}', expires at: {:?}",
            self.command,
            credential.status.expiration_timestamp
        );
        Ok(format!("Bearer {}", credential.status.token))
    }
}

#[derive(Deserialize, Clone, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<String>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}
