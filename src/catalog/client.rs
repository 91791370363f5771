use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use headers::{Authorization, HeaderMapExt};
use http::header::{HeaderValue, USER_AGENT};
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;

use super::{Catalog, NodeEntry, QueryMeta, QueryOptions, Services};
use crate::config::{Config, Credentials};
use crate::tls::{TlsConfig, TlsError};

/// The HTTP client gives up a little later than the longest blocking query,
/// so the backend always gets the chance to answer first.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Characters escaped in a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("build request failed, {0}")]
    BuildRequest(#[from] http::Error),
    #[error("failed to make HTTP(S) request: {0}")]
    CallRequest(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read response: {0}")]
    ReadIncoming(#[from] hyper::Error),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(StatusCode),
    #[error("deserialize response failed, {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("invalid X-Consul-Index header {0:?}")]
    InvalidIndex(String),
    #[error("missing X-Consul-Index header")]
    MissingIndex,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Deserialize)]
struct AgentSelf {
    #[serde(rename = "Config")]
    config: AgentConfig,
}

#[derive(Deserialize)]
struct AgentConfig {
    #[serde(rename = "Datacenter")]
    datacenter: String,
}

/// Consul HTTP API client.
#[derive(Clone)]
pub struct Client {
    http_client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,

    endpoint: String,
    credentials: Vec<Credentials>,
    datacenter: Option<String>,
    user_agent: HeaderValue,
    timeout: Duration,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, TlsError> {
        let tls = match &config.tls {
            Some(tls) => tls.client_config()?,
            None => TlsConfig::default().client_config()?,
        };

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();
        let http_client = HyperClient::builder(TokioExecutor::new()).build(https);

        Ok(Client {
            http_client,
            endpoint: format!("{}://{}", config.scheme, config.server.trim()),
            credentials: config.credentials(),
            datacenter: config.datacenter().map(String::from),
            user_agent: HeaderValue::from_static(concat!(
                "consul-sd/",
                env!("CARGO_PKG_VERSION")
            )),
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_query(&self, opts: &QueryOptions, extra: &[(&str, &str)]) -> String {
        let mut builder = url::form_urlencoded::Serializer::new(String::new());

        if let Some(datacenter) = &self.datacenter {
            builder.append_pair("dc", datacenter);
        }
        for (key, value) in extra {
            builder.append_pair(key, value);
        }
        if opts.wait_index != 0 {
            builder.append_pair("index", &opts.wait_index.to_string());
        }
        if !opts.wait_time.is_zero() {
            builder.append_pair("wait", &format!("{}ms", opts.wait_time.as_millis()));
        }
        if opts.allow_stale {
            builder.append_pair("stale", "");
        }

        builder.finish()
    }

    fn authorize(&self, headers: &mut HeaderMap) {
        for credential in &self.credentials {
            match credential {
                Credentials::Token(token) => match HeaderValue::from_str(token) {
                    Ok(value) => {
                        headers.insert(TOKEN_HEADER, value);
                    }
                    Err(err) => warn!(message = "invalid consul token", %err),
                },
                Credentials::Basic { username, password } => {
                    headers.typed_insert(Authorization::basic(username, password));
                }
            }
        }
    }

    /// Returns the decoded body and the `X-Consul-Index` header, if present.
    async fn fetch<T>(&self, path: &str, query: String) -> Result<(T, Option<u64>), CatalogError>
    where
        T: serde::de::DeserializeOwned,
    {
        let uri = if query.is_empty() {
            format!("{}{}", self.endpoint, path)
        } else {
            format!("{}{}?{}", self.endpoint, path, query)
        };

        let mut req = Request::get(uri)
            .header(USER_AGENT, self.user_agent.clone())
            .body(Full::default())?;
        self.authorize(req.headers_mut());

        let (body, index) = tokio::time::timeout(self.timeout, self.send(req))
            .await
            .map_err(|_| CatalogError::Timeout(self.timeout))??;

        let value = serde_json::from_slice::<T>(&body)?;

        Ok((value, index))
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<(Bytes, Option<u64>), CatalogError> {
        let resp = self.http_client.request(req).await?;
        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            return Err(CatalogError::UnexpectedStatus(parts.status));
        }

        let index = last_index(&parts.headers)?;
        let body = incoming.collect().await?.to_bytes();

        Ok((body, index))
    }
}

/// `None` if the endpoint does not support blocking queries.
fn last_index(headers: &HeaderMap) -> Result<Option<u64>, CatalogError> {
    let Some(value) = headers.get(INDEX_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| CatalogError::InvalidIndex(String::from_utf8_lossy(value.as_bytes()).into()))
}

/// Catalog endpoints always answer with an index, without one the next query
/// could not block.
fn query_meta(index: Option<u64>) -> Result<QueryMeta, CatalogError> {
    index
        .map(|last_index| QueryMeta { last_index })
        .ok_or(CatalogError::MissingIndex)
}

#[async_trait::async_trait]
impl Catalog for Client {
    async fn services(&self, opts: QueryOptions) -> Result<(Services, QueryMeta), CatalogError> {
        let query = self.build_query(&opts, &[]);
        let (services, index) = self
            .fetch::<BTreeMap<String, Option<Vec<String>>>>("/v1/catalog/services", query)
            .await?;
        let meta = query_meta(index)?;

        let services = services
            .into_iter()
            .map(|(name, tags)| (name, tags.unwrap_or_default()))
            .collect();

        Ok((services, meta))
    }

    async fn service(
        &self,
        name: &str,
        tag: Option<&str>,
        opts: QueryOptions,
    ) -> Result<(Vec<NodeEntry>, QueryMeta), CatalogError> {
        let path = format!(
            "/v1/catalog/service/{}",
            utf8_percent_encode(name, PATH_SEGMENT)
        );
        let query = match tag {
            Some(tag) => self.build_query(&opts, &[("tag", tag)]),
            None => self.build_query(&opts, &[]),
        };

        let (nodes, index) = self.fetch(&path, query).await?;

        Ok((nodes, query_meta(index)?))
    }

    async fn datacenter(&self) -> Result<String, CatalogError> {
        let (info, _index) = self
            .fetch::<AgentSelf>("/v1/agent/self", String::new())
            .await?;

        Ok(info.config.datacenter)
    }
}
