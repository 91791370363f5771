//! The slice of the Consul API the discovery engine consumes.

mod client;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub use client::{CatalogError, Client};

/// Service names mapped to every tag registered for them.
pub type Services = BTreeMap<String, Vec<String>>;

/// Options of a blocking query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// The index the query blocks on, zero means return immediately.
    pub wait_index: u64,

    /// Upper bound of how long the backend holds the request.
    pub wait_time: Duration,

    /// Allow any server, not only the leader, to answer.
    pub allow_stale: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// The index of the returned state, equal to the requested index if the
    /// query timed out without any change.
    pub last_index: u64,
}

/// One instance of a service, as listed by `/v1/catalog/service/<name>`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct NodeEntry {
    pub node: String,
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub node_meta: BTreeMap<String, String>,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(default)]
    pub service_address: String,
    pub service_port: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub service_tags: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[async_trait::async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// List all services with their tags.
    async fn services(&self, opts: QueryOptions) -> Result<(Services, QueryMeta), CatalogError>;

    /// List the instances of one service, optionally only those carrying `tag`.
    async fn service(
        &self,
        name: &str,
        tag: Option<&str>,
        opts: QueryOptions,
    ) -> Result<(Vec<NodeEntry>, QueryMeta), CatalogError>;

    /// The datacenter of the agent we are talking to.
    async fn datacenter(&self) -> Result<String, CatalogError>;
}

#[async_trait::async_trait]
impl<T: Catalog> Catalog for std::sync::Arc<T> {
    async fn services(&self, opts: QueryOptions) -> Result<(Services, QueryMeta), CatalogError> {
        (**self).services(opts).await
    }

    async fn service(
        &self,
        name: &str,
        tag: Option<&str>,
        opts: QueryOptions,
    ) -> Result<(Vec<NodeEntry>, QueryMeta), CatalogError> {
        (**self).service(name, tag, opts).await
    }

    async fn datacenter(&self) -> Result<String, CatalogError> {
        (**self).datacenter().await
    }
}
