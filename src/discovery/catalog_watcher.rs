use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tripwire::Tripwire;

use super::service_watcher::{self, Watch};
use super::{Context, RETRY_INTERVAL, WATCH_TIMEOUT, WatchError, next_index, send, sleep};
use crate::catalog::{Catalog, QueryOptions};
use crate::target_group::TargetGroup;

/// Long-polls the service list and keeps one service watcher per wanted
/// service.
pub(super) struct CatalogWatcher<C> {
    cx: Arc<Context<C>>,

    // only ever touched through `&mut self`
    watched: BTreeMap<String, Watch>,
    last_index: u64,
}

impl<C: Catalog> CatalogWatcher<C> {
    pub(super) fn new(cx: Arc<Context<C>>) -> Self {
        CatalogWatcher {
            cx,
            watched: BTreeMap::new(),
            last_index: 0,
        }
    }

    /// One long poll of the service list.
    ///
    /// New services passing the filters get a watcher, watched services the
    /// catalog no longer lists are stopped and tombstoned.
    pub(super) async fn watch(
        &mut self,
        shutdown: &mut Tripwire,
        output: &Sender<Vec<TargetGroup>>,
    ) -> Result<(), WatchError> {
        debug!(message = "watching services", tag = ?self.cx.settings.tag);

        let opts = QueryOptions {
            wait_index: self.last_index,
            wait_time: WATCH_TIMEOUT,
            allow_stale: self.cx.settings.allow_stale,
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;

            _ = &mut *shutdown => return Err(WatchError::Cancelled),
            result = self.cx.catalog.services(opts) => result,
        };
        self.cx
            .metrics
            .rpc_duration("catalog", "services", start.elapsed());

        let (services, meta) = match result {
            Ok(value) => value,
            Err(err) => {
                self.cx.metrics.rpc_failure();
                error!(message = "list services failed", ?err);

                sleep(RETRY_INTERVAL, shutdown).await?;
                return Err(err.into());
            }
        };

        let index = next_index(meta.last_index);
        if index == self.last_index {
            return Ok(());
        }
        self.last_index = index;

        for (name, tags) in &services {
            if !self.cx.settings.should_watch(name, tags) || self.watched.contains_key(name) {
                continue;
            }

            let watch = service_watcher::spawn(&self.cx, name, shutdown, output);
            self.watched.insert(name.clone(), watch);
        }

        // A service still listed but no longer carrying the tag keeps its
        // watcher, only services gone from the catalog are removed.
        let removed = self
            .watched
            .keys()
            .filter(|name| !services.contains_key(*name))
            .cloned()
            .collect::<Vec<_>>();
        for name in removed {
            if let Some(watch) = self.watched.remove(&name) {
                debug!(message = "service removed from catalog", service = %name);
                watch.stop().await;
            }

            send(output, TargetGroup::tombstone(name), shutdown).await?;
        }

        sleep(self.cx.settings.refresh_interval, shutdown).await
    }

    /// Names of the watched services, in order.
    pub(super) fn watched(&self) -> impl Iterator<Item = &str> {
        self.watched.keys().map(String::as_str)
    }

    /// Stop every service watcher and wait for them to finish.
    pub(super) async fn stop(self) {
        for watch in self.watched.into_values() {
            watch.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::config::Config;
    use crate::discovery::Settings;
    use crate::stats::Metrics;
    use crate::testing::{Call, CountingMetrics, FakeCatalog, node_entry};

    struct Harness {
        catalog: Arc<FakeCatalog>,
        metrics: Arc<CountingMetrics>,
        watcher: CatalogWatcher<Arc<FakeCatalog>>,
    }

    fn harness(config: Config) -> Harness {
        let catalog = Arc::new(FakeCatalog::new());
        let metrics = Arc::new(CountingMetrics::default());
        let cx = Arc::new(Context {
            catalog: Arc::clone(&catalog),
            settings: Settings::new(&config),
            datacenter: "dc1".into(),
            metrics: Arc::clone(&metrics) as Arc<dyn Metrics>,
        });

        Harness {
            catalog,
            metrics,
            watcher: CatalogWatcher::new(cx),
        }
    }

    fn watched<C: Catalog>(watcher: &CatalogWatcher<C>) -> Vec<&str> {
        watcher.watched().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tag_filter() {
        let mut config = Config::new("localhost:8500");
        config.tag = Some("prod".into());
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(config);

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);

        catalog.push_services(1, &[("api", vec!["prod", "v2"]), ("db", vec!["staging"])]);
        catalog.push_nodes("api", 10, vec![node_entry("node-1", "10.0.0.5", 9100)]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert_eq!(watched(&watcher), vec!["api"]);

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].source, "api");
        catalog.wait_blocked("api", 1).await;

        catalog.push_services(2, &[("db", vec!["staging"])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert!(watched(&watcher).is_empty());

        assert_eq!(rx.recv().await.unwrap(), vec![TargetGroup::tombstone("api")]);
        assert_eq!(catalog.blocked("api"), 0);
        assert!(catalog.service_calls("db").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn diff_watched_set() {
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(Config::new("localhost:8500"));

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);

        catalog.push_services(1, &[("a", vec![]), ("b", vec![]), ("c", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert_eq!(watched(&watcher), vec!["a", "b", "c"]);
        for name in ["a", "b", "c"] {
            catalog.wait_blocked(name, 1).await;
        }

        catalog.push_services(2, &[("b", vec![]), ("c", vec![]), ("d", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert_eq!(watched(&watcher), vec!["b", "c", "d"]);

        // only the removed service is tombstoned
        assert_eq!(rx.recv().await.unwrap(), vec![TargetGroup::tombstone("a")]);
        assert!(rx.try_recv().is_err());
        assert_eq!(catalog.blocked("a"), 0);

        // the intersection is untouched
        catalog.wait_blocked("d", 1).await;
        for name in ["b", "c"] {
            assert_eq!(catalog.service_calls(name).len(), 1);
            assert_eq!(catalog.blocked(name), 1);
        }

        watcher.stop().await;
        for name in ["b", "c", "d"] {
            assert_eq!(catalog.blocked(name), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn name_filter() {
        let mut config = Config::new("localhost:8500");
        config.services = vec!["api".into(), "web".into()];
        config.tag = Some("prod".into());
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(config);

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);

        catalog.push_services(
            1,
            &[
                ("api", vec!["prod"]),
                ("db", vec!["prod"]),
                ("web", vec!["canary"]),
            ],
        );
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert_eq!(watched(&watcher), vec!["api"]);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_index_is_noop() {
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(Config::new("localhost:8500"));

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, mut rx) = mpsc::channel(8);

        catalog.push_services(3, &[("a", vec![])]);
        catalog.push_services(3, &[("b", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        watcher.watch(&mut tripwire, &tx).await.unwrap();

        assert_eq!(watched(&watcher), vec!["a"]);
        assert!(rx.try_recv().is_err());

        let indexes = catalog
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Services(opts) => Some(opts.wait_index),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![0, 3]);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_state() {
        let Harness {
            catalog,
            metrics,
            mut watcher,
        } = harness(Config::new("localhost:8500"));

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);

        catalog.push_services(1, &[("a", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();

        catalog.fail_services();
        let start = Instant::now();
        let result = watcher.watch(&mut tripwire, &tx).await;
        assert!(matches!(result, Err(WatchError::Catalog(_))));
        assert!(start.elapsed() >= RETRY_INTERVAL);
        assert_eq!(metrics.failures(), 1);
        assert_eq!(watched(&watcher), vec!["a"]);

        // the next poll still waits on the last good index
        catalog.push_services(1, &[("a", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert!(matches!(
            catalog.calls().iter().rev().find(|call| matches!(call, Call::Services(_))),
            Some(Call::Services(opts)) if opts.wait_index == 1
        ));

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_polling() {
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(Config::new("localhost:8500"));

        let (trigger, mut tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);

        let (result, _) = tokio::join!(watcher.watch(&mut tripwire, &tx), async {
            catalog.wait_blocked_services(1).await;
            trigger.cancel();
        });

        assert!(matches!(result, Err(WatchError::Cancelled)));
        assert_eq!(catalog.blocked_services(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_sending_tombstone() {
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(Config::new("localhost:8500"));

        let (trigger, mut tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(1);

        catalog.push_services(1, &[("a", vec![]), ("b", vec![])]);
        watcher.watch(&mut tripwire, &tx).await.unwrap();

        // the first tombstone fills the channel, the second one blocks
        catalog.push_services(2, &[]);
        let (result, _) = tokio::join!(watcher.watch(&mut tripwire, &tx), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });

        assert!(matches!(result, Err(WatchError::Cancelled)));
        assert!(watched(&watcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_interval_after_change() {
        let mut config = Config::new("localhost:8500");
        config.refresh_interval = Duration::from_secs(20);
        let Harness {
            catalog,
            mut watcher,
            ..
        } = harness(config);

        let (_trigger, mut tripwire) = Tripwire::new("root");
        let (tx, _rx) = mpsc::channel(8);

        catalog.push_services(1, &[]);
        catalog.push_services(1, &[]);

        let start = Instant::now();
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));

        // no change, no delay
        let start = Instant::now();
        watcher.watch(&mut tripwire, &tx).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
