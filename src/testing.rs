//! Test helpers, a scripted in-memory catalog and a counting metrics sink.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use http::StatusCode;
use tokio::sync::Notify;

use crate::catalog::{Catalog, CatalogError, NodeEntry, QueryMeta, QueryOptions, Services};
use crate::stats::Metrics;

/// A call received by [`FakeCatalog`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Datacenter,
    Services(QueryOptions),
    Service {
        name: String,
        tag: Option<String>,
        opts: QueryOptions,
    },
}

type Scripted<T> = VecDeque<Result<T, CatalogError>>;

#[derive(Default)]
struct State {
    datacenters: Scripted<String>,
    services: Scripted<(Services, u64)>,
    nodes: HashMap<String, Scripted<(Vec<NodeEntry>, u64)>>,

    calls: Vec<Call>,
    blocked: HashMap<String, usize>,
}

/// A catalog answering from scripted responses, in push order.
///
/// Once the script of a call is exhausted, the call blocks until a new
/// response is pushed, the way a long poll waits for a change.
#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<State>,
    changed: Notify,
}

/// Blocking key used for `datacenter` calls.
const DATACENTER_KEY: &str = "<datacenter>";
/// Blocking key used for `services` calls.
const SERVICES_KEY: &str = "<services>";

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut State)) {
        {
            let mut state = self.state.lock().unwrap();
            f(&mut *state);
        }
        self.changed.notify_waiters();
    }

    pub fn push_datacenter(&self, datacenter: impl Into<String>) {
        let datacenter = datacenter.into();
        self.update(|state| state.datacenters.push_back(Ok(datacenter)));
    }

    pub fn push_services(&self, index: u64, services: &[(&str, Vec<&str>)]) {
        let services = services
            .iter()
            .map(|(name, tags)| {
                (
                    name.to_string(),
                    tags.iter().map(|tag| tag.to_string()).collect(),
                )
            })
            .collect::<BTreeMap<_, _>>();

        self.update(|state| state.services.push_back(Ok((services, index))));
    }

    pub fn push_nodes(&self, service: &str, index: u64, nodes: Vec<NodeEntry>) {
        self.update(|state| {
            state
                .nodes
                .entry(service.to_string())
                .or_default()
                .push_back(Ok((nodes, index)))
        });
    }

    pub fn fail_datacenter(&self) {
        self.update(|state| state.datacenters.push_back(Err(unavailable())));
    }

    pub fn fail_services(&self) {
        self.update(|state| state.services.push_back(Err(unavailable())));
    }

    pub fn fail_nodes(&self, service: &str) {
        self.update(|state| {
            state
                .nodes
                .entry(service.to_string())
                .or_default()
                .push_back(Err(unavailable()))
        });
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn services_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Services(_)))
            .count()
    }

    pub fn service_calls(&self, service: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Service { name, .. } if name == service))
            .collect()
    }

    /// The number of calls for `service` currently waiting for a response.
    pub fn blocked(&self, service: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .blocked
            .get(service)
            .copied()
            .unwrap_or_default()
    }

    pub fn blocked_services(&self) -> usize {
        self.blocked(SERVICES_KEY)
    }

    /// Resolves once `blocked(service)` equals `count`.
    pub async fn wait_blocked(&self, service: &str, count: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.blocked(service) == count {
                return;
            }

            notified.await;
        }
    }

    pub async fn wait_blocked_services(&self, count: usize) {
        self.wait_blocked(SERVICES_KEY, count).await
    }

    pub async fn wait_blocked_datacenter(&self, count: usize) {
        self.wait_blocked(DATACENTER_KEY, count).await
    }

    async fn next<T>(
        &self,
        key: &str,
        call: Call,
        pop: impl Fn(&mut State) -> Option<Result<T, CatalogError>>,
    ) -> Result<T, CatalogError> {
        self.update(|state| state.calls.push(call));

        let mut guard = None;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock().unwrap();
                pop(&mut *state)
            };
            if let Some(result) = next {
                return result;
            }

            if guard.is_none() {
                guard = Some(Blocked::new(self, key));
            }

            notified.await;
        }
    }
}

fn unavailable() -> CatalogError {
    CatalogError::UnexpectedStatus(StatusCode::SERVICE_UNAVAILABLE)
}

/// Counts a call as blocked while alive, a cancelled call drops it.
struct Blocked<'a> {
    catalog: &'a FakeCatalog,
    key: String,
}

impl<'a> Blocked<'a> {
    fn new(catalog: &'a FakeCatalog, key: &str) -> Self {
        catalog.update(|state| *state.blocked.entry(key.to_string()).or_default() += 1);

        Blocked {
            catalog,
            key: key.to_string(),
        }
    }
}

impl Drop for Blocked<'_> {
    fn drop(&mut self) {
        self.catalog.update(|state| {
            if let Some(count) = state.blocked.get_mut(&self.key) {
                *count -= 1;
            }
        });
    }
}

#[async_trait::async_trait]
impl Catalog for FakeCatalog {
    async fn services(&self, opts: QueryOptions) -> Result<(Services, QueryMeta), CatalogError> {
        let (services, index) = self
            .next(SERVICES_KEY, Call::Services(opts), |state| {
                state.services.pop_front()
            })
            .await?;

        Ok((services, QueryMeta { last_index: index }))
    }

    async fn service(
        &self,
        name: &str,
        tag: Option<&str>,
        opts: QueryOptions,
    ) -> Result<(Vec<NodeEntry>, QueryMeta), CatalogError> {
        let call = Call::Service {
            name: name.to_string(),
            tag: tag.map(String::from),
            opts,
        };
        let (nodes, index) = self
            .next(name, call, |state| {
                state.nodes.get_mut(name).and_then(VecDeque::pop_front)
            })
            .await?;

        Ok((nodes, QueryMeta { last_index: index }))
    }

    async fn datacenter(&self) -> Result<String, CatalogError> {
        self.next(DATACENTER_KEY, Call::Datacenter, |state| {
            state.datacenters.pop_front()
        })
        .await
    }
}

/// A service instance at `address:port` on `node`.
pub fn node_entry(node: &str, address: &str, port: u16) -> NodeEntry {
    NodeEntry {
        node: node.to_string(),
        address: address.to_string(),
        datacenter: "dc1".to_string(),
        node_meta: BTreeMap::new(),
        service_id: format!("{node}-{port}"),
        service_address: String::new(),
        service_port: port,
        service_tags: vec![],
    }
}

/// A [`Metrics`] sink keeping plain counts.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    failures: AtomicU64,
    calls: Mutex<Vec<(&'static str, &'static str)>>,
}

impl CountingMetrics {
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// The `(endpoint, call)` pairs observed, in order.
    pub fn durations(&self) -> Vec<(&'static str, &'static str)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Metrics for CountingMetrics {
    fn rpc_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn rpc_duration(&self, endpoint: &'static str, call: &'static str, _elapsed: Duration) {
        self.calls.lock().unwrap().push((endpoint, call));
    }
}
