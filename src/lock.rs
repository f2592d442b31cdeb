//! Named readers-writer lock over a [`CoordinationStore`]
//!
//! The lock state lives in the coordination store so every process sharing
//! the cache tier observes it:
//!
//! - `{name}_mutex`: short critical section guarding the counters
//! - `{name}_readers`: number of registered readers
//! - `{name}_writer`: nonzero while a writer is pending or active
//! - `{name}_channel`: wake-up broadcasts
//!
//! A writer announces itself first, then waits for the reader count to drain.
//! Readers arriving while a writer is announced wait for its release broadcast.

use crate::error::{Result, SpatialDbError};
use crate::io::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};
use uuid::Uuid;

const DEFAULT_POLL: Duration = Duration::from_millis(1);

const READERS_DRAINED: &str = "readers_drained";
const WRITER_RELEASED: &str = "writer_released";

#[derive(Clone)]
pub struct ReaderWriterLock {
    store: Arc<dyn CoordinationStore>,
    name: String,
    poll: Duration,
}

impl ReaderWriterLock {
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            poll: DEFAULT_POLL,
        }
    }

    /// Interval between attempts on the guarding mutex
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.name, suffix)
    }

    async fn lock_mutex(&self) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let key = self.key("mutex");
        while !self.store.try_lock(&key, &token).await? {
            tokio::time::sleep(self.poll).await;
        }
        Ok(token)
    }

    async fn unlock_mutex(&self, token: &str) -> Result<()> {
        if !self.store.unlock(&self.key("mutex"), token).await? {
            return Err(SpatialDbError::Lock(format!(
                "{} mutex was not held by this holder",
                self.name
            )));
        }
        Ok(())
    }

    /// Subscribe, release the mutex, wait for a broadcast.
    ///
    /// `held` is cleared once the mutex is released; on an earlier error it
    /// still holds the token.
    async fn wait(&self, held: &mut Option<String>) -> Result<()> {
        let mut rx = self.store.subscribe(&self.key("channel")).await?;
        if let Some(token) = held.as_deref() {
            self.unlock_mutex(token).await?;
        }
        *held = None;
        wait_for_message(&mut rx, &self.name).await
    }

    /// Register as a reader, waiting while a writer is announced
    pub async fn acquire_read(&self) -> Result<ReadGuard> {
        loop {
            let token = self.lock_mutex().await?;
            let writer = match self.store.counter(&self.key("writer")).await {
                Ok(w) => w,
                Err(e) => {
                    self.unlock_mutex(&token).await?;
                    return Err(e);
                }
            };

            if writer == 0 {
                let added = self.store.add_to_counter(&self.key("readers"), 1).await;
                self.unlock_mutex(&token).await?;
                let readers = added?;
                trace!(lock = %self.name, readers, "read lock acquired");
                return Ok(ReadGuard {
                    lock: self.clone(),
                    released: false,
                });
            }

            trace!(lock = %self.name, "reader waiting on writer");
            let mut held = Some(token);
            if let Err(e) = self.wait(&mut held).await {
                self.abandon(held, false).await;
                return Err(e);
            }
        }
    }

    async fn release_read(&self) -> Result<()> {
        let token = self.lock_mutex().await?;
        let result = async {
            let readers = self.store.add_to_counter(&self.key("readers"), -1).await?;
            if readers <= 0 {
                self.store.set_counter(&self.key("readers"), 0).await?;
                self.store
                    .publish(&self.key("channel"), READERS_DRAINED)
                    .await?;
            }
            trace!(lock = %self.name, readers, "read lock released");
            Ok::<(), SpatialDbError>(())
        }
        .await;
        self.unlock_mutex(&token).await?;
        result
    }

    /// Announce a writer, then wait until every reader has left.
    ///
    /// On error the announcement is withdrawn and the mutex released.
    pub async fn acquire_write(&self) -> Result<WriteGuard> {
        let mut held = Some(self.lock_mutex().await?);
        let mut announced = false;
        if let Err(e) = self.announce_write(&mut held, &mut announced).await {
            warn!(lock = %self.name, error = %e, announced, "write lock acquisition failed");
            self.abandon(held, announced).await;
            return Err(e);
        }
        trace!(lock = %self.name, "write lock acquired");

        Ok(WriteGuard {
            lock: self.clone(),
            released: false,
        })
    }

    async fn announce_write(&self, held: &mut Option<String>, announced: &mut bool) -> Result<()> {
        while self.store.counter(&self.key("writer")).await? > 0 {
            trace!(lock = %self.name, "writer waiting on writer");
            self.wait(held).await?;
            *held = Some(self.lock_mutex().await?);
        }
        self.store.set_counter(&self.key("writer"), 1).await?;
        *announced = true;
        trace!(lock = %self.name, "writer announced");

        loop {
            let readers = self.store.counter(&self.key("readers")).await?;
            if readers <= 0 {
                break;
            }
            trace!(lock = %self.name, readers, "writer waiting for readers");
            self.wait(held).await?;
            *held = Some(self.lock_mutex().await?);
        }
        if let Some(token) = held.as_deref() {
            self.unlock_mutex(token).await?;
        }
        *held = None;
        Ok(())
    }

    /// Undo a failed acquisition: withdraw a writer announcement, then free the mutex
    async fn abandon(&self, held: Option<String>, announced: bool) {
        let token = match held {
            Some(token) => Some(token),
            None if announced => self.lock_mutex().await.ok(),
            None => None,
        };
        if announced {
            let withdrawn = async {
                self.store.set_counter(&self.key("writer"), 0).await?;
                self.store
                    .publish(&self.key("channel"), WRITER_RELEASED)
                    .await?;
                Ok::<(), SpatialDbError>(())
            }
            .await;
            if let Err(e) = withdrawn {
                warn!(lock = %self.name, error = %e, "failed to withdraw writer");
            }
        }
        if let Some(token) = token {
            if let Err(e) = self.unlock_mutex(&token).await {
                warn!(lock = %self.name, error = %e, "failed to release lock mutex");
            }
        }
    }

    async fn release_write(&self) -> Result<()> {
        let token = self.lock_mutex().await?;
        let result = async {
            self.store.set_counter(&self.key("writer"), 0).await?;
            self.store
                .publish(&self.key("channel"), WRITER_RELEASED)
                .await?;
            trace!(lock = %self.name, "write lock released");
            Ok::<(), SpatialDbError>(())
        }
        .await;
        self.unlock_mutex(&token).await?;
        result
    }

    /// Registered reader count
    pub async fn readers(&self) -> Result<i64> {
        self.store.counter(&self.key("readers")).await
    }

    /// Whether a writer is announced or active
    pub async fn writer_pending(&self) -> Result<bool> {
        Ok(self.store.counter(&self.key("writer")).await? > 0)
    }
}

async fn wait_for_message(rx: &mut broadcast::Receiver<String>, name: &str) -> Result<()> {
    match rx.recv().await {
        // Missed messages still mean something changed
        Ok(_) | Err(RecvError::Lagged(_)) => Ok(()),
        Err(RecvError::Closed) => Err(SpatialDbError::Lock(format!(
            "{} notification channel closed",
            name
        ))),
    }
}

/// Registration as a reader; release with [`ReadGuard::release`]
pub struct ReadGuard {
    lock: ReaderWriterLock,
    released: bool,
}

impl ReadGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release_read().await
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release_read().await {
                        warn!(lock = %lock.name, error = %e, "deferred read release failed");
                    }
                });
            }
            Err(_) => warn!(lock = %lock.name, "read guard dropped outside a runtime"),
        }
    }
}

/// Exclusive access; release with [`WriteGuard::release`]
pub struct WriteGuard {
    lock: ReaderWriterLock,
    released: bool,
}

impl WriteGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release_write().await
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release_write().await {
                        warn!(lock = %lock.name, error = %e, "deferred write release failed");
                    }
                });
            }
            Err(_) => warn!(lock = %lock.name, "write guard dropped outside a runtime"),
        }
    }
}
