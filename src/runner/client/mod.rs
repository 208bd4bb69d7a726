mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::metrics::ClientMetrics;

use bytes::{Buf, Bytes, BytesMut};
use http::{Request, Response, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::StreamExt;

use std::io;
use std::sync::Arc;
use std::time::Instant;

/// Everything that can go wrong when talking to the api server
#[derive(Debug)]
pub enum Error {
    /// The connection failed or the body couldn't be read
    Transport(hyper::Error),
    Decode(serde_json::Error),
    /// The api server answered with a non-success status
    Status(StatusCode),
    Request(http::Error),
    InvalidEndpoint(String),
}

impl Error {
    pub fn http(status: StatusCode) -> Error {
        Error::Status(status)
    }

    fn status(&self) -> Option<u16> {
        if let Error::Status(status) = self {
            Some(status.as_u16())
        } else {
            None
        }
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        self.status() == Some(code)
    }

    /// The resourceVersion a watch started from has been compacted away
    pub fn is_http_410(&self) -> bool {
        self.is_http_status(410)
    }

    pub fn is_not_found(&self) -> bool {
        self.is_http_status(404)
    }

    /// An optimistic concurrency conflict, or a create of something that already exists
    pub fn is_conflict(&self) -> bool {
        self.is_http_status(409)
    }

    /// Returns false for errors that will happen again if the same request is retried
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status(status) if status.is_server_error() => true,
            Error::Status(_) => matches!(self.status(), Some(404) | Some(409) | Some(429)),
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "api server connection failed: {}", e),
            Error::Decode(e) => write!(f, "malformed api server payload: {}", e),
            Error::Status(status) => write!(f, "api server responded with {}", status),
            Error::Request(e) => write!(f, "could not build api request: {}", e),
            Error::InvalidEndpoint(msg) => write!(f, "invalid api server endpoint {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Transport(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Decode(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

fn decode_base64(value: &str, field: &str) -> Result<Vec<u8>, io::Error> {
    base64::decode(value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not valid base64: {}", field, err),
        )
    })
}

/// Reads the client certificate and key, if the credentials use one, as pem bytes
fn client_identity(credentials: &Credentials) -> Result<Option<(Vec<u8>, Vec<u8>)>, io::Error> {
    let identity = match credentials {
        Credentials::PemPath {
            certificate_path,
            private_key_path,
        } => Some((
            std::fs::read(certificate_path)?,
            std::fs::read(private_key_path)?,
        )),
        Credentials::Pem {
            certificate_base64,
            private_key_base64,
        } => Some((
            decode_base64(certificate_base64, "client-certificate-data")?,
            decode_base64(private_key_base64, "client-key-data")?,
        )),
        Credentials::Header(_) => None,
    };
    Ok(identity)
}

fn trust_ca(ssl: &mut SslConnectorBuilder, ca: CAData) -> Result<(), io::Error> {
    match ca {
        CAData::File(path) => ssl.set_ca_file(path.as_str())?,
        CAData::Contents(base64_pem) => {
            let pem = decode_base64(&base64_pem, "certificate-authority-data")?;
            for cert in X509::stack_from_pem(&pem)? {
                ssl.cert_store_mut().add_cert(cert)?;
            }
        }
    }
    Ok(())
}

fn tls_connector(config: &mut ClientConfig) -> Result<SslConnectorBuilder, io::Error> {
    let mut ssl = SslConnector::builder(SslMethod::tls())?;
    // prefer h2, fall back to http/1.1
    ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;

    if let Some(ca) = config.ca_data.take() {
        trust_ca(&mut ssl, ca)?;
    }

    if let Some((cert_pem, key_pem)) = client_identity(&config.credentials)? {
        let cert = X509::from_pem(&cert_pem)?;
        let key = PKey::private_key_from_pem(&key_pem)?;
        ssl.set_certificate(&cert)?;
        ssl.set_private_key(&key)?;
        ssl.check_private_key()?;
    }

    let mode = if config.verify_ssl_certs {
        SslVerifyMode::PEER
    } else {
        log::warn!(
            "Certificate verification is off, connections to {} are not secure",
            config.api_server_endpoint
        );
        SslVerifyMode::NONE
    };
    ssl.set_verify(mode);
    Ok(ssl)
}

type HttpsClient = HyperClient<HttpsConnector<HttpConnector>>;

#[derive(Debug)]
struct ClientInner {
    http_client: HttpsClient,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// A thin client for the Kubernetes api. Clones are cheap and share the same connection pool.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let ssl = tls_connector(&mut config)?;
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let http_client = HyperClient::builder().build(HttpsConnector::with_connector(http, ssl)?);

        Ok(Client(Arc::new(ClientInner {
            http_client,
            config,
            metrics,
        })))
    }

    fn config(&self) -> &ClientConfig {
        &self.0.config
    }

    pub async fn list_all(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(self.config(), k8s_type, label_selector, namespace)?;
        self.json_response(req).await
    }

    /// Starts a watch. The returned events stream until the api server closes the connection.
    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent>, Error> {
        let req = request::watch_request(
            self.config(),
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        let resp = self.send(req).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::http(status));
        }
        Ok(LineDeserializer::new(Lines::from_body(resp.into_body())))
    }

    /// Fetches a single resource, with `None` meaning that it doesn't exist
    pub async fn get_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Option<Value>, Error> {
        let req = request::get_request(self.config(), k8s_type, id)?;
        self.json_response::<Value>(req)
            .await
            .map(Some)
            .or_else(|err| if err.is_not_found() { Ok(None) } else { Err(err) })
    }

    /// creates the resource and returns it as it was persisted
    pub async fn create_resource(
        &self,
        k8s_type: &K8sType,
        resource: &Value,
    ) -> Result<Value, Error> {
        let req = request::create_request(self.config(), k8s_type, resource)?;
        self.json_response(req).await
    }

    /// Replaces the entire resource. The `resource` must include the `metadata.resourceVersion`
    /// of the existing resource, or else the api server will reject it with a 409.
    pub async fn replace_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<Value, Error> {
        let req = request::replace_request(self.config(), k8s_type, id, resource)?;
        self.json_response(req).await
    }

    /// Deletes the resource. One that's already gone or already terminating counts as deleted.
    pub async fn delete_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), Error> {
        let req = request::delete_request(self.config(), k8s_type, id)?;
        let status = self.send(req).await?.status();
        if status.is_success() || matches!(status.as_u16(), 404 | 409) {
            return Ok(());
        }
        log::error!("Deleting {} {} failed with status {}", k8s_type.kind, id, status);
        Err(Error::http(status))
    }

    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let summary = format!("{} {}", req.method(), req.uri());
        log::debug!("Sending request: {}", summary);

        let started = Instant::now();
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();

        match result {
            Ok(resp) => {
                log::debug!(
                    "{} answered {} after {}ms",
                    summary,
                    resp.status(),
                    started.elapsed().as_millis()
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!("{} failed: {}", summary, err);
                Err(Error::from(err))
            }
        }
    }

    async fn json_response<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let response = self.send(req).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() {
            log::trace!("Response body: {}", String::from_utf8_lossy(&body));
            return serde_json::from_slice(&body).map_err(Error::from);
        }
        // not found and conflicts are expected outcomes that callers handle themselves
        if !matches!(status.as_u16(), 404 | 409) {
            log::error!("Api server returned {}: {}", status, String::from_utf8_lossy(&body));
        }
        Err(Error::http(status))
    }
}

fn is_line_end(b: &u8) -> bool {
    matches!(*b, b'\n' | b'\r')
}

/// Splits a streaming response body into lines. Both `\n` and `\r` end a line, and empty lines
/// are skipped.
pub struct Lines {
    body: Body,
    pending: BytesMut,
    body_finished: bool,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            pending: BytesMut::with_capacity(4096),
            body_finished: false,
        }
    }

    /// Removes the first complete, non-empty line from the buffer
    fn take_line(&mut self) -> Option<Bytes> {
        while let Some(end) = self.pending.iter().position(is_line_end) {
            let line = self.pending.split_to(end);
            let skip = self.pending.iter().take_while(|b| is_line_end(b)).count();
            self.pending.advance(skip);
            if !line.is_empty() {
                return Some(line.freeze());
            }
        }
        None
    }

    pub async fn next(&mut self) -> Option<Result<Bytes, Error>> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            if self.body_finished {
                // whatever is left is a final line without a terminator
                return Some(self.pending.split())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| Ok(rest.freeze()));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    log::error!("Watch stream broke: {}", err);
                    return Some(Err(Error::from(err)));
                }
                None => self.body_finished = true,
            }
        }
    }
}

/// Parses each line of a `Lines` stream as json
pub struct LineDeserializer<T: DeserializeOwned> {
    lines: Lines,
    _item: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        LineDeserializer {
            lines,
            _item: std::marker::PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        match self.lines.next().await? {
            Ok(line) => Some(serde_json::from_slice(&line).map_err(Error::from)),
            Err(err) => Some(Err(err)),
        }
    }
}

/// One line of a watch response
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(ApiError),
}

/// The `Status` object the api server sends in place of a resource when a watch fails
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "api error {} ({})", self.code, self.reason)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::runtime;

    fn body(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks)
            .map(|b| Ok::<_, std::io::Error>(Bytes::from_static(b)));
        Body::wrap_stream(stream)
    }

    #[test]
    fn lines_iterates_lines_across_chunks() {
        let mut lines = Lines::from_body(body(vec![
            &b"line1\nline2\r\nline3\r\n\r\n\r\n\rlong"[..],
            &b"line4\r\r"[..],
            &b"\r\nline5"[..],
        ]));
        let runtime = runtime::Builder::new_current_thread().build().unwrap();

        runtime.block_on(async move {
            for expected in ["line1", "line2", "line3", "longline4", "line5"].iter() {
                let line = lines
                    .next()
                    .await
                    .expect("line returned none")
                    .expect("line returned error");
                assert_eq!(expected.as_bytes(), line.as_ref());
            }
            assert!(lines.next().await.is_none());
        });
    }

    #[test]
    fn watch_events_are_deserialized_per_line() {
        let mut events = LineDeserializer::<WatchEvent>::new(Lines::from_body(body(vec![
            &br#"{"type":"ADDED","object":{"kind":"Application"}}"#[..],
            &b"\n"[..],
            &br#"{"type":"ERROR","object":{"status":"Failure","code":410,"reason":"Expired"}}"#[..],
        ])));
        let runtime = runtime::Builder::new_current_thread().build().unwrap();

        runtime.block_on(async move {
            match events.next().await {
                Some(Ok(WatchEvent::Added(obj))) => assert_eq!("Application", obj["kind"]),
                other => panic!("expected added event, got: {:?}", other),
            }
            match events.next().await {
                Some(Ok(WatchEvent::Error(err))) => assert_eq!(410, err.code),
                other => panic!("expected error event, got: {:?}", other),
            }
        });
    }

    fn client_config(credentials: Credentials) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: "https://kube.example.com:6443".to_owned(),
            ca_data: None,
            credentials,
            user_agent: "app-operator".to_owned(),
            impersonate: None,
            impersonate_groups: Vec::new(),
            verify_ssl_certs: true,
        }
    }

    #[test]
    fn tls_connector_without_client_certificate() {
        let mut config = client_config(Credentials::base64_bearer_token("abc"));
        assert!(tls_connector(&mut config).is_ok());
    }

    #[test]
    fn invalid_inline_client_certificate_is_rejected() {
        let mut config = client_config(Credentials::Pem {
            certificate_base64: "not base64!".to_owned(),
            private_key_base64: "not base64!".to_owned(),
        });
        let err = match tls_connector(&mut config) {
            Ok(_) => panic!("expected an error for invalid base64"),
            Err(err) => err,
        };
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
        assert!(err.to_string().contains("client-certificate-data"));
    }

    #[test]
    fn client_certificate_must_be_pem() {
        let mut config = client_config(Credentials::Pem {
            certificate_base64: base64::encode("not a certificate"),
            private_key_base64: base64::encode("not a key"),
        });
        assert!(tls_connector(&mut config).is_err());
    }

    #[test]
    fn not_found_and_conflict_are_transient() {
        assert!(Error::http(StatusCode::NOT_FOUND).is_not_found());
        assert!(Error::http(StatusCode::CONFLICT).is_conflict());
        assert!(Error::http(StatusCode::CONFLICT).is_transient());
        assert!(Error::http(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!Error::http(StatusCode::UNPROCESSABLE_ENTITY).is_transient());
    }
}
