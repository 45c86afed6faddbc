//! Change propagation over the shared record store.
//!
//! Every policy-relevant mutation appends an entry to the store's change log.
//! Each service instance polls that log and hands new entries, in id order,
//! to the in-process listeners registered for the entry's table.

use crate::error::{Result, WafError};
use crate::metrics::MetricsCollector;
use crate::store::{ChangeTable, RecordStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Poll interval of the change log.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receives the key of every change log entry of the tables it subscribed to.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, key: &str);
}

pub struct ChangeNotifier {
    store: Arc<dyn RecordStore>,
    subscribers: RwLock<HashMap<ChangeTable, Vec<Arc<dyn ChangeListener>>>>,
    /// Id of the last entry handed to subscribers.
    last_delivered: Mutex<u64>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl ChangeNotifier {
    /// Starts from the current head of the change log: history written before
    /// this instance started is not replayed.
    pub fn new(store: Arc<dyn RecordStore>) -> Result<Self> {
        let last = match store.latest_change_log_id() {
            Ok(id) => id,
            Err(WafError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        debug!("Change notifier starting after change log id {}", last);

        Ok(Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
            last_delivered: Mutex::new(last),
            interval: POLL_INTERVAL,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn last_delivered(&self) -> u64 {
        *self.last_delivered.lock()
    }

    /// Registers `listener` for `table`. Subscribing the same listener twice
    /// to one table is a no-op.
    pub fn subscribe(&self, table: ChangeTable, listener: Arc<dyn ChangeListener>) {
        let mut subscribers = self.subscribers.write();
        let listeners = subscribers.entry(table).or_default();

        let id = Arc::as_ptr(&listener) as *const ();
        if listeners.iter().any(|l| Arc::as_ptr(l) as *const () == id) {
            return;
        }
        listeners.push(listener);
    }

    /// Appends a change log entry so that every instance, this one included,
    /// picks the change up on its next poll.
    pub fn notify_change(&self, table: ChangeTable, key: &str) -> Result<u64> {
        let id = self.store.append_change_log(table, key)?;
        debug!("Appended change log entry {} ({}:{})", id, table, key);
        Ok(id)
    }

    /// Delivers every entry between the last delivered id and the current head.
    ///
    /// The pointer advances after each delivered entry, so a failing fetch
    /// stops the catch-up at that id and the next call resumes from it.
    pub fn poll_once(&self) -> Result<usize> {
        let mut last = self.last_delivered.lock();

        let head = match self.store.latest_change_log_id() {
            Ok(id) => id,
            Err(WafError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut delivered = 0;
        while *last < head {
            let next = *last + 1;
            let entry = self.store.change_log_entry(next)?;
            self.dispatch(entry.table, &entry.key);
            *last = next;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn dispatch(&self, table: ChangeTable, key: &str) {
        let listeners = self
            .subscribers
            .read()
            .get(&table)
            .cloned()
            .unwrap_or_default();

        for listener in &listeners {
            listener.on_change(key);
        }
        self.metrics.inc_changelog_delivered(table.as_str());
    }

    /// Poll loop. Runs until `stop` fires or its sender is dropped.
    ///
    /// Store errors are logged and retried on the next tick, without backoff.
    pub async fn watch(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Change log watcher started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {
                    let notifier = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || notifier.poll_once()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => debug!("Delivered {} change log entries", n),
                        Ok(Err(e)) => {
                            self.metrics.inc_changelog_poll_errors();
                            error!("Error reading change log: {}", e);
                        }
                        Err(e) => error!("Change log poll task failed: {}", e),
                    }
                }
            }
        }

        info!("Change log watcher stopped");
    }
}
