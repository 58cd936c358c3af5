use std::sync::Arc;

use crate::config::StoreConfig;
use crate::core::{Clock, Error, MetricsSink, NoopMetrics, Result, SingleFlight, SystemClock};
use crate::persistence::PersistenceManager;
use crate::store::QueueStore;

/// Opens each store at most once, however many threads ask for it.
pub struct StoreRegistry {
    config: StoreConfig,
    persistence: Arc<dyn PersistenceManager>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    stores: SingleFlight<String, Arc<QueueStore>>,
}

impl StoreRegistry {
    pub fn new(config: StoreConfig, persistence: Arc<dyn PersistenceManager>) -> Self {
        Self::with_clock(config, persistence, Arc::new(SystemClock), Arc::new(NoopMetrics))
    }

    pub fn with_clock(
        config: StoreConfig,
        persistence: Arc<dyn PersistenceManager>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            persistence,
            clock,
            metrics,
            stores: SingleFlight::new(),
        }
    }

    /// The open store for `store_id`, opening it on first use.
    pub fn get_or_open(&self, store_id: &str) -> Result<Arc<QueueStore>> {
        self.stores.get_or_try_init(&store_id.to_string(), || {
            QueueStore::open_with(
                store_id,
                self.config.clone(),
                Arc::clone(&self.persistence),
                Arc::clone(&self.clock),
                Arc::clone(&self.metrics),
            )
            .map(Arc::new)
        })
    }

    /// The store for `store_id` if it is open.
    pub fn get(&self, store_id: &str) -> Result<Arc<QueueStore>> {
        self.stores
            .get(&store_id.to_string())
            .ok_or_else(|| Error::UnknownStore(store_id.to_string()))
    }

    /// Ids of every store with persisted state, open or not.
    pub fn known_store_ids(&self) -> Result<Vec<String>> {
        self.persistence.store_ids()
    }

    pub fn open_count(&self) -> usize {
        self.stores.len()
    }

    /// Closes and forgets one store. Returns false if it was not open.
    pub fn close_store(&self, store_id: &str) -> Result<bool> {
        let Some(store) = self.stores.remove(&store_id.to_string()) else {
            return Ok(false);
        };
        store.close()?;
        Ok(true)
    }

    /// Closes every open store, reporting the first failure after trying all.
    pub fn close_all(&self) -> Result<()> {
        let mut first_err = None;
        for store in self.stores.drain() {
            if let Err(err) = store.close() {
                log::warn!("closing store {} failed: {err}", store.store_id());
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for StoreRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.close_all() {
            log::warn!("closing stores on drop failed: {err}");
        }
    }
}
