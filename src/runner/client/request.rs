use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::{ObjectIdRef, ResourceJson};
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    make_req(url, Method::GET, client_config).body(Body::empty())
        .map_err(Into::into)
}

pub fn create_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, resource.get_namespace(), None)?;
    let as_vec = serde_json::to_vec(resource)?;
    make_req(url, Method::POST, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))
        .map_err(Into::into)
}

pub fn replace_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    let as_vec = serde_json::to_vec(resource)?;
    make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))
        .map_err(Into::into)
}

pub fn delete_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    // children are deleted in the background, the same way the garbage collector does it
    let body = serde_json::to_vec(&serde_json::json!({
        "apiVersion": "v1",
        "kind": "DeleteOptions",
        "propagationPolicy": "Background",
    }))?;
    make_req(url, Method::DELETE, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(Into::into)
}

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    label_selector: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(selector) = label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(timeout) = timeout_seconds {
            query.append_pair("timeoutSeconds", timeout.to_string().as_str());
        }
    }
    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    label_selector: Option<&str>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    if let Some(selector) = label_selector {
        url.query_pairs_mut().append_pair("labelSelector", selector);
    }
    make_req(url, Method::GET, client_config)
        .body(Body::empty())
        .map_err(Into::into)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    let mut builder = Request::builder()
        .method(method)
        .uri(String::from(url))
        .header(header::USER_AGENT, client_config.user_agent.as_str())
        .header(header::ACCEPT, "application/json");
    if let Some(auth) = client_config.credentials.header_value() {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    if let Some(user) = client_config.impersonate.as_ref() {
        builder = builder.header(IMPERSONATE_USER, user.as_str());
        for group in client_config.impersonate_groups.iter() {
            builder = builder.header(IMPERSONATE_GROUP, group.as_str());
        }
    }
    builder
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, Error> {
    let endpoint = client_config.api_server_endpoint.as_str();
    let mut url = Url::parse(endpoint)
        .map_err(|err| Error::InvalidEndpoint(format!("'{}': {}", endpoint, err)))?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::InvalidEndpoint(format!("'{}' cannot be used as a base url", endpoint))
        })?;
        segments.pop_if_empty();

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Credentials;
    use crate::k8s_types;

    fn client_config() -> ClientConfig {
        ClientConfig {
            api_server_endpoint: "https://kube.example.com:6443".to_owned(),
            ca_data: None,
            credentials: Credentials::base64_bearer_token("abc"),
            user_agent: "app-operator".to_owned(),
            impersonate: Some("jane".to_owned()),
            impersonate_groups: vec!["devs".to_owned(), "ops".to_owned()],
            verify_ssl_certs: true,
        }
    }

    #[test]
    fn urls_for_grouped_and_core_types() {
        let conf = client_config();
        let id = ObjectIdRef::new("prod", "shop");

        let req = get_request(&conf, k8s_types::apps::v1::Deployment, &id).unwrap();
        assert_eq!(
            "https://kube.example.com:6443/apis/apps/v1/namespaces/prod/deployments/shop",
            req.uri().to_string()
        );

        let req = list_request(&conf, k8s_types::core::v1::Service, Some("a=b"), None).unwrap();
        assert_eq!(
            "https://kube.example.com:6443/api/v1/services?labelSelector=a%3Db",
            req.uri().to_string()
        );
    }

    #[test]
    fn requests_carry_auth_user_agent_and_impersonation() {
        let conf = client_config();
        let id = ObjectIdRef::new("prod", "shop");
        let req = delete_request(&conf, k8s_types::networking_k8s_io::v1::Ingress, &id).unwrap();

        assert_eq!(Method::DELETE, *req.method());
        let headers = req.headers();
        assert_eq!("Bearer abc", headers[header::AUTHORIZATION]);
        assert_eq!("app-operator", headers[header::USER_AGENT]);
        assert_eq!("jane", headers[IMPERSONATE_USER]);
        let groups = headers
            .get_all(IMPERSONATE_GROUP)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(vec!["devs", "ops"], groups);
    }

    #[test]
    fn invalid_endpoint_is_an_error() {
        let mut conf = client_config();
        conf.api_server_endpoint = "not a url".to_owned();
        let result = list_request(&conf, k8s_types::core::v1::Service, None, None);
        assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
    }
}
