//! Memory ceiling for the cache tier
//!
//! Eviction starts once the memory ratio rises above the upper bound and
//! continues, least recently used first, until the ratio falls below the lower
//! bound. The gap between the two bounds keeps the loop from thrashing.

use crate::config::EvictionConfig;
use crate::coordinator::CacheCoordinator;
use crate::error::Result;
use crate::io::KeyValueStore;
use crate::utils::format_bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one [`EvictionManager::empty_memory`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub written_back: usize,
    pub ratio_before: f64,
    pub ratio_after: f64,
}

pub struct EvictionManager {
    store: Arc<dyn KeyValueStore>,
    coordinator: Arc<CacheCoordinator>,
    config: EvictionConfig,
}

impl EvictionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        coordinator: Arc<CacheCoordinator>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Cache-tier memory in use, as a percentage of the total
    pub async fn memory_ratio(&self) -> Result<f64> {
        Ok(self.store.memory_stats().await?.ratio_percent())
    }

    /// Evict LRU cuboids if the ratio is above the upper bound.
    ///
    /// Holds the writer lock while evicting; it is released on every path.
    pub async fn empty_memory(&self) -> Result<EvictionReport> {
        let ratio_before = self.memory_ratio().await?;
        if ratio_before <= self.config.upper_bound_percent {
            debug!(ratio = ratio_before, "memory below ceiling");
            return Ok(EvictionReport {
                ratio_before,
                ratio_after: ratio_before,
                ..EvictionReport::default()
            });
        }

        let guard = self.coordinator.lock().acquire_write().await?;
        let result = self.evict(ratio_before).await;
        guard.release().await?;
        let report = result?;

        let used = self.store.memory_stats().await?.used_bytes;
        info!(
            evicted = report.evicted,
            used = %format_bytes(used as usize),
            written_back = report.written_back,
            ratio_before = report.ratio_before,
            ratio_after = report.ratio_after,
            "evicted cuboids"
        );
        Ok(report)
    }

    async fn evict(&self, ratio_before: f64) -> Result<EvictionReport> {
        let index = self.coordinator.cache_index();
        let mut report = EvictionReport {
            ratio_before,
            ratio_after: ratio_before,
            ..EvictionReport::default()
        };

        while report.ratio_after >= self.config.lower_bound_percent {
            let batch = index.least_recent(self.config.batch_size).await?;
            if batch.is_empty() {
                warn!(ratio = report.ratio_after, "nothing left to evict");
                break;
            }
            if self.config.write_back {
                report.written_back += self.coordinator.write_back(&batch).await?;
            }
            self.coordinator.invalidate(&batch).await?;
            report.evicted += batch.len();
            report.ratio_after = self.memory_ratio().await?;
        }
        Ok(report)
    }

    /// Run [`Self::empty_memory`] every `interval_ms` until `shutdown` turns true
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.config.interval_ms, "eviction loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.empty_memory().await {
                            warn!(error = %e, "eviction pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("eviction loop stopped");
        })
    }
}
