//! The watcher registry: merged watches, their controller tasks and the sync gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kindex_kubehub::{ClusterClient, Controller, DEFAULT_RELIST_PAUSE};
use kindex_store::{ChangeEvaluator, ModifiedClock};
use metrics::histogram;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AnyLister, ApiError, ApiResult, ApiWatcher, WatchContext};

const SYNC_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// How long [`start`] waits for the sync gate before carrying on anyway.
    pub sync_timeout: Duration,
    pub relist_pause: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self { sync_timeout: Duration::from_secs(5), relist_pause: DEFAULT_RELIST_PAUSE }
    }
}

struct Watch {
    name: String,
    owner: String,
    controller: Arc<dyn Controller>,
    lister: AnyLister,
}

/// Owns the merged watch set and the process lifecycle around it.
pub struct ApiControl {
    consumers: Vec<(Arc<dyn ApiWatcher>, Vec<String>)>,
    watches: Vec<Watch>,
    clock: ModifiedClock,
    stop: CancellationToken,
    started: AtomicBool,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApiControl {
    /// Merges the consumers' watch requests in order; the first consumer to
    /// declare a watch name builds it and later declarations share it.
    pub fn build(client: Arc<dyn ClusterClient>, consumers: Vec<Arc<dyn ApiWatcher>>, opts: &ControlOptions) -> Self {
        let clock = ModifiedClock::new();
        let ctx = WatchContext {
            client,
            evaluator: ChangeEvaluator::new(clock.clone()),
            relist_pause: opts.relist_pause,
        };
        let mut watches: Vec<Watch> = Vec::new();
        let mut declared = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let mut names = Vec::new();
            for (name, factory) in consumer.informers() {
                if let Some(existing) = watches.iter().find(|w| w.name == name) {
                    debug!(watch = %name, consumer = consumer.name(), owner = %existing.owner, "sharing existing watch");
                } else {
                    let informer = factory(&ctx);
                    debug!(watch = %name, consumer = consumer.name(), kind = %informer.controller.kind(), "watch registered");
                    watches.push(Watch {
                        name: name.clone(),
                        owner: consumer.name().to_string(),
                        controller: informer.controller,
                        lister: informer.lister,
                    });
                }
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            declared.push((consumer, names));
        }
        Self {
            consumers: declared,
            watches,
            clock,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts every controller, then hands each consumer the shared listers,
    /// its sync gate and the modified clock. Must be called inside a runtime;
    /// a second call reports [`ApiError::AlreadyRunning`] and spawns nothing.
    pub fn run(&self) -> ApiResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ApiError::AlreadyRunning);
        }
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            for w in &self.watches {
                let controller = Arc::clone(&w.controller);
                let stop = self.stop.child_token();
                tasks.push(tokio::spawn(async move { controller.run(stop).await }));
            }
        }
        info!(watches = self.watches.len(), consumers = self.consumers.len(), "watch controllers started");

        for (consumer, names) in &self.consumers {
            for w in &self.watches {
                if let Err(e) = consumer.set_lister(&w.name, w.lister.clone()) {
                    warn!(consumer = consumer.name(), error = %e, "consumer rejected lister");
                    self.stop.cancel();
                    return Err(e);
                }
            }
            let gates: Vec<Arc<dyn Controller>> = names
                .iter()
                .filter_map(|n| self.watches.iter().find(|w| &w.name == n))
                .map(|w| Arc::clone(&w.controller))
                .collect();
            consumer.set_has_synced(Arc::new(move || gates.iter().all(|c| c.has_synced())));
            consumer.set_modified(self.clock.clone());
        }
        Ok(())
    }

    /// True once every controller has applied its first list.
    pub fn has_synced(&self) -> bool {
        self.watches.iter().all(|w| w.controller.has_synced())
    }

    /// Polls the aggregate gate until it opens or `timeout` passes.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.has_synced() {
                histogram!("registry_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
                info!(took_ms = %started.elapsed().as_millis(), "all watches synced");
                return true;
            }
            if started.elapsed() >= timeout || self.stop.is_cancelled() {
                let pending: Vec<&str> = self
                    .watches
                    .iter()
                    .filter(|w| !w.controller.has_synced())
                    .map(|w| w.name.as_str())
                    .collect();
                warn!(timeout_ms = %timeout.as_millis(), pending = ?pending, "starting before all watches synced");
                return false;
            }
            tokio::time::sleep(SYNC_POLL).await;
        }
    }

    /// Signals every controller to stop. A second call reports
    /// [`ApiError::ShutdownInProgress`] and changes nothing.
    pub fn stop(&self) -> ApiResult<()> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Err(ApiError::ShutdownInProgress);
        }
        info!("stopping watch controllers");
        self.stop.cancel();
        Ok(())
    }

    /// Waits for every controller task to exit.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "watch controller task failed");
            }
        }
        debug!("watch controllers exited");
    }

    /// Unix seconds of the last significant change across all watches.
    pub fn modified(&self) -> i64 {
        self.clock.modified()
    }

    pub fn watch_names(&self) -> Vec<&str> {
        self.watches.iter().map(|w| w.name.as_str()).collect()
    }

    pub fn lister(&self, watch: &str) -> Option<AnyLister> {
        self.watches.iter().find(|w| w.name == watch).map(|w| w.lister.clone())
    }
}

/// Builds the registry, starts it and waits (best effort) for the sync gate.
pub async fn start(
    client: Arc<dyn ClusterClient>,
    consumers: Vec<Arc<dyn ApiWatcher>>,
    opts: ControlOptions,
) -> ApiResult<ApiControl> {
    let control = ApiControl::build(client, consumers, &opts);
    control.run()?;
    control.wait_for_sync(opts.sync_timeout).await;
    Ok(control)
}
