//! The watch engine, keeping consumers in sync with the Consul catalog.
//!
//! `Discovery` resolves the datacenter, then either long-polls the service
//! list (when every service, or every service with some tag, is wanted), or
//! watches the configured services directly. Each watched service gets its own
//! task and its own child cancellation scope.

mod catalog_watcher;
mod service_watcher;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tripwire::Tripwire;

use crate::catalog::{Catalog, CatalogError};
use crate::config::Config;
use crate::stats::{Metrics, NoopMetrics};
use crate::target_group::TargetGroup;
use catalog_watcher::CatalogWatcher;

/// How long the backend holds a blocking query.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before a failed call is retried.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The scope was cancelled, or the consumer is gone.
    #[error("watch cancelled")]
    Cancelled,
}

/// The immutable part of the configuration the watchers consult.
#[derive(Clone, Debug)]
struct Settings {
    tag_separator: String,
    allow_stale: bool,
    refresh_interval: Duration,
    services: Vec<String>,
    tag: Option<String>,
}

impl Settings {
    fn new(config: &Config) -> Self {
        Settings {
            tag_separator: config.tag_separator.clone(),
            allow_stale: config.allow_stale,
            refresh_interval: config.refresh_interval,
            services: config.services.clone(),
            tag: config.watched_tag().map(String::from),
        }
    }

    /// Direct watching only works for fully named services, a tag filter
    /// needs the service list to learn which services carry it.
    fn watch_catalog(&self) -> bool {
        self.services.is_empty() || self.tag.is_some()
    }

    fn should_watch(&self, name: &str, tags: &[String]) -> bool {
        self.should_watch_name(name) && self.should_watch_tags(tags)
    }

    fn should_watch_name(&self, name: &str) -> bool {
        self.services.is_empty() || self.services.iter().any(|service| service == name)
    }

    fn should_watch_tags(&self, tags: &[String]) -> bool {
        match &self.tag {
            Some(wanted) => tags.iter().any(|tag| tag == wanted),
            None => true,
        }
    }
}

/// Everything a watcher needs, shared by all watchers of one `Discovery`.
struct Context<C> {
    catalog: C,
    settings: Settings,
    datacenter: String,
    metrics: Arc<dyn Metrics>,
}

pub struct Discovery<C> {
    catalog: C,
    settings: Settings,
    datacenter: Option<String>,
    metrics: Arc<dyn Metrics>,
}

impl<C: Catalog> Discovery<C> {
    pub fn new(config: &Config, catalog: C) -> Self {
        Discovery {
            catalog,
            settings: Settings::new(config),
            datacenter: config.datacenter().map(String::from),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Watch until `shutdown` resolves, sending every update to `output`.
    ///
    /// Every watcher task started here has finished when this returns.
    pub async fn run(self, mut shutdown: Tripwire, output: Sender<Vec<TargetGroup>>) {
        let datacenter = match self.resolve_datacenter(&mut shutdown).await {
            Ok(datacenter) => datacenter,
            Err(_) => return,
        };

        let Discovery {
            catalog,
            settings,
            metrics,
            ..
        } = self;
        let cx = Arc::new(Context {
            catalog,
            settings,
            datacenter,
            metrics,
        });

        if cx.settings.watch_catalog() {
            let mut watcher = CatalogWatcher::new(Arc::clone(&cx));

            loop {
                let result = tokio::select! {
                    biased;

                    _ = output.closed() => break,
                    result = watcher.watch(&mut shutdown, &output) => result,
                };

                match result {
                    Ok(()) => {}
                    // logged and delayed already
                    Err(WatchError::Catalog(_)) => {}
                    Err(WatchError::Cancelled) => break,
                }
            }

            watcher.stop().await;
        } else {
            let watches = cx
                .settings
                .services
                .iter()
                .map(|name| service_watcher::spawn(&cx, name, &shutdown, &output))
                .collect::<Vec<_>>();

            tokio::select! {
                _ = &mut shutdown => {},
                _ = output.closed() => {},
            }

            for watch in watches {
                watch.stop().await;
            }
        }

        debug!(message = "consul discovery stopped");
    }

    async fn resolve_datacenter(&self, shutdown: &mut Tripwire) -> Result<String, WatchError> {
        if let Some(datacenter) = &self.datacenter {
            return Ok(datacenter.clone());
        }

        loop {
            let result = tokio::select! {
                biased;

                _ = &mut *shutdown => return Err(WatchError::Cancelled),
                result = self.catalog.datacenter() => result,
            };

            match result {
                Ok(datacenter) => {
                    debug!(message = "resolved local datacenter", %datacenter);
                    return Ok(datacenter);
                }
                Err(err) => {
                    error!(message = "retrieving datacenter name failed", ?err);
                    sleep(RETRY_INTERVAL, shutdown).await?;
                }
            }
        }
    }
}

/// The index the next long poll blocks on. Consul indexes start at 1, and an
/// index of 0 would make the next query return at once.
fn next_index(index: u64) -> u64 {
    index.max(1)
}

/// Sleep for `duration` unless cancelled first.
async fn sleep(duration: Duration, shutdown: &mut Tripwire) -> Result<(), WatchError> {
    if duration.is_zero() {
        return if shutdown.is_cancelled() {
            Err(WatchError::Cancelled)
        } else {
            Ok(())
        };
    }

    tokio::select! {
        biased;

        _ = &mut *shutdown => Err(WatchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Send one group as its own batch, giving up if cancelled first or if the
/// consumer is gone.
async fn send(
    output: &Sender<Vec<TargetGroup>>,
    group: TargetGroup,
    shutdown: &mut Tripwire,
) -> Result<(), WatchError> {
    tokio::select! {
        biased;

        _ = &mut *shutdown => Err(WatchError::Cancelled),
        result = output.send(vec![group]) => result.map_err(|_| WatchError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::{Instant, timeout};

    use super::*;
    use crate::labels::{DATACENTER_LABEL, SERVICE_LABEL};
    use crate::testing::{Call, CountingMetrics, FakeCatalog, node_entry};

    fn settings(services: &[&str], tag: Option<&str>) -> Settings {
        let mut config = Config::new("localhost:8500");
        config.services = services.iter().map(|s| s.to_string()).collect();
        config.tag = tag.map(String::from);

        Settings::new(&config)
    }

    fn tags(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|tag| tag.to_string()).collect()
    }

    #[test]
    fn filters() {
        let all = settings(&[], None);
        assert!(all.watch_catalog());
        assert!(all.should_watch("api", &[]));
        assert!(all.should_watch("db", &tags(&["staging"])));

        let named = settings(&["api"], None);
        assert!(!named.watch_catalog());
        assert!(named.should_watch("api", &[]));
        assert!(!named.should_watch("db", &[]));

        let tagged = settings(&[], Some("prod"));
        assert!(tagged.watch_catalog());
        assert!(tagged.should_watch("api", &tags(&["prod", "v2"])));
        assert!(!tagged.should_watch("db", &tags(&["staging"])));
        assert!(!tagged.should_watch("cache", &[]));

        let both = settings(&["api", "db"], Some("prod"));
        assert!(both.watch_catalog());
        assert!(both.should_watch("api", &tags(&["prod"])));
        assert!(!both.should_watch("db", &tags(&["staging"])));
        assert!(!both.should_watch("web", &tags(&["prod"])));
    }

    #[test]
    fn empty_tag_is_no_filter() {
        let settings = settings(&["api"], Some(""));
        assert_eq!(settings.tag, None);
        assert!(!settings.watch_catalog());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_zero() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        sleep(Duration::ZERO, &mut tripwire).await.unwrap();

        trigger.cancel();
        assert!(matches!(
            sleep(Duration::ZERO, &mut tripwire).await,
            Err(WatchError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_cancelled() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        let start = Instant::now();

        let (result, _) = tokio::join!(sleep(RETRY_INTERVAL, &mut tripwire), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert!(matches!(result, Err(WatchError::Cancelled)));
        assert!(start.elapsed() < RETRY_INTERVAL);
    }

    #[tokio::test]
    async fn send_to_closed_channel() {
        let (_trigger, mut tripwire) = Tripwire::new("test");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        assert!(matches!(
            send(&tx, TargetGroup::tombstone("api"), &mut tripwire).await,
            Err(WatchError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_cancelled_while_full() {
        let (trigger, mut tripwire) = Tripwire::new("test");
        let (tx, mut rx) = mpsc::channel(1);
        send(&tx, TargetGroup::tombstone("a"), &mut tripwire)
            .await
            .unwrap();

        let (result, _) = tokio::join!(
            send(&tx, TargetGroup::tombstone("b"), &mut tripwire),
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                trigger.cancel();
            }
        );
        assert!(matches!(result, Err(WatchError::Cancelled)));

        assert_eq!(rx.recv().await.unwrap(), vec![TargetGroup::tombstone("a")]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_watch_never_lists_services() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_nodes("api", 7, vec![node_entry("node-1", "10.0.0.5", 9100)]);

        let mut config = Config::new("localhost:8500");
        config.services = vec!["api".into()];
        config.datacenter = Some("dc1".into());

        let (trigger, tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(Discovery::new(&config, Arc::clone(&catalog)).run(tripwire, tx));

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source, "api");
        assert_eq!(batch[0].targets[0]["__address__"], "10.0.0.5:9100");

        trigger.cancel();
        handle.await.unwrap();

        assert_eq!(catalog.services_calls(), 0);
        assert!(!catalog.calls().contains(&Call::Datacenter));
        assert_eq!(catalog.blocked("api"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn datacenter_resolution_retries() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.fail_datacenter();
        catalog.push_datacenter("dc9");
        catalog.push_nodes("api", 1, vec![node_entry("node-1", "10.0.0.5", 9100)]);

        let mut config = Config::new("localhost:8500");
        config.services = vec!["api".into()];

        let (_trigger, tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);
        let start = Instant::now();
        tokio::spawn(Discovery::new(&config, Arc::clone(&catalog)).run(tripwire, tx));

        let batch = timeout(Duration::from_secs(60), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= RETRY_INTERVAL);
        assert_eq!(batch[0].labels[DATACENTER_LABEL], "dc9");
        assert_eq!(batch[0].labels[SERVICE_LABEL], "api");

        let datacenter_calls = catalog
            .calls()
            .into_iter()
            .filter(|call| *call == Call::Datacenter)
            .count();
        assert_eq!(datacenter_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_resolving_datacenter() {
        let catalog = Arc::new(FakeCatalog::new());
        let (trigger, tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);

        let handle = tokio::spawn(
            Discovery::new(&Config::new("localhost:8500"), Arc::clone(&catalog))
                .run(tripwire, tx),
        );

        catalog.wait_blocked_datacenter(1).await;
        trigger.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(catalog.services_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tag_filter_lifecycle() {
        let catalog = Arc::new(FakeCatalog::new());
        let metrics = Arc::new(CountingMetrics::default());
        catalog.push_services(1, &[("api", vec!["prod", "v2"]), ("db", vec!["staging"])]);
        catalog.push_nodes("api", 10, vec![node_entry("node-1", "10.0.0.5", 9100)]);

        let mut config = Config::new("localhost:8500");
        config.tag = Some("prod".into());
        config.datacenter = Some("dc1".into());

        let (trigger, tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(
            Discovery::new(&config, Arc::clone(&catalog))
                .with_metrics(metrics.clone())
                .run(tripwire, tx),
        );

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].source, "api");
        assert!(catalog.service_calls("db").is_empty());
        assert!(matches!(
            &catalog.service_calls("api")[0],
            Call::Service { tag: Some(tag), .. } if tag == "prod"
        ));

        catalog.wait_blocked("api", 1).await;
        catalog.push_services(2, &[("db", vec!["staging"])]);

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![TargetGroup::tombstone("api")]);
        assert_eq!(catalog.blocked("api"), 0);

        trigger.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(catalog.blocked_services(), 0);
        assert_eq!(metrics.failures(), 0);
        assert!(metrics.durations().contains(&("catalog", "services")));
        assert!(metrics.durations().contains(&("catalog", "service")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_watcher() {
        let catalog = Arc::new(FakeCatalog::new());
        catalog.push_services(3, &[("a", vec![]), ("b", vec![]), ("c", vec![])]);

        let mut config = Config::new("localhost:8500");
        config.datacenter = Some("dc1".into());

        let (trigger, tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);
        let handle = tokio::spawn(Discovery::new(&config, Arc::clone(&catalog)).run(tripwire, tx));

        for name in ["a", "b", "c"] {
            catalog.wait_blocked(name, 1).await;
        }
        catalog.wait_blocked_services(1).await;

        trigger.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        for name in ["a", "b", "c"] {
            assert_eq!(catalog.blocked(name), 0, "watcher {name} still running");
        }
        assert_eq!(catalog.blocked_services(), 0);
    }
}
