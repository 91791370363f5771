use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tripwire::{Trigger, Tripwire};

use super::{Context, RETRY_INTERVAL, WATCH_TIMEOUT, WatchError, next_index, send, sleep};
use crate::catalog::{Catalog, NodeEntry, QueryOptions};
use crate::labels::{common_labels, target_labels};
use crate::target_group::TargetGroup;

/// A running service watcher.
pub(super) struct Watch {
    trigger: Trigger,
    handle: JoinHandle<()>,
}

impl Watch {
    /// Cancel the watcher and wait for its task to finish.
    pub(super) async fn stop(self) {
        let Watch { trigger, handle } = self;
        let service = trigger.name().to_string();
        trigger.cancel();

        if let Err(err) = handle.await {
            error!(message = "service watcher task failed", %service, ?err);
        }
    }
}

/// Start watching `name` in a child scope of `parent`.
pub(super) fn spawn<C: Catalog>(
    cx: &Arc<Context<C>>,
    name: &str,
    parent: &Tripwire,
    output: &Sender<Vec<TargetGroup>>,
) -> Watch {
    let (trigger, tripwire) = parent.child(name);
    let watcher = ServiceWatcher::new(Arc::clone(cx), name.to_string());
    let handle = tokio::spawn(watcher.run(tripwire, output.clone()));

    Watch { trigger, handle }
}

/// Long-polls the instances of one service.
pub(super) struct ServiceWatcher<C> {
    cx: Arc<Context<C>>,
    name: String,
    last_index: u64,
}

impl<C: Catalog> ServiceWatcher<C> {
    pub(super) fn new(cx: Arc<Context<C>>, name: String) -> Self {
        ServiceWatcher {
            cx,
            name,
            last_index: 0,
        }
    }

    pub(super) async fn run(mut self, mut shutdown: Tripwire, output: Sender<Vec<TargetGroup>>) {
        debug!(
            message = "start watching service",
            service = %self.name,
            tag = ?self.cx.settings.tag
        );

        loop {
            match self.watch(&mut shutdown, &output).await {
                Ok(()) => {}
                // logged and delayed already, the index stays where it was
                Err(WatchError::Catalog(_)) => {}
                Err(WatchError::Cancelled) => break,
            }
        }

        debug!(message = "service watch routine finished", service = %self.name);
    }

    /// One long poll. Emits a group only if the index moved.
    async fn watch(
        &mut self,
        shutdown: &mut Tripwire,
        output: &Sender<Vec<TargetGroup>>,
    ) -> Result<(), WatchError> {
        let opts = QueryOptions {
            wait_index: self.last_index,
            wait_time: WATCH_TIMEOUT,
            allow_stale: self.cx.settings.allow_stale,
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;

            _ = &mut *shutdown => return Err(WatchError::Cancelled),
            result = self.cx.catalog.service(&self.name, self.cx.settings.tag.as_deref(), opts) => result,
        };
        self.cx
            .metrics
            .rpc_duration("catalog", "service", start.elapsed());

        let (nodes, meta) = match result {
            Ok(value) => value,
            Err(err) => {
                self.cx.metrics.rpc_failure();
                error!(
                    message = "list service entries failed",
                    service = %self.name,
                    tag = ?self.cx.settings.tag,
                    ?err
                );

                sleep(RETRY_INTERVAL, shutdown).await?;
                return Err(err.into());
            }
        };

        // the long poll timed out without any change
        let index = next_index(meta.last_index);
        if index == self.last_index {
            return Ok(());
        }
        self.last_index = index;

        let group = self.target_group(&nodes);
        send(output, group, shutdown).await?;

        sleep(self.cx.settings.refresh_interval, shutdown).await
    }

    fn target_group(&self, nodes: &[NodeEntry]) -> TargetGroup {
        let separator = &self.cx.settings.tag_separator;

        TargetGroup {
            source: self.name.clone(),
            labels: common_labels(&self.name, &self.cx.datacenter),
            targets: nodes
                .iter()
                .map(|node| target_labels(node, separator))
                .collect(),
        }
    }
}
