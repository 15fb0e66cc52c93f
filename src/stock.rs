//! A named, keyed pool of reusable items with a concurrency limit, an idle
//! high-water mark, and FIFO waiters — the generic connection-pool
//! primitive a pooled-connect dispatch path would build on.
//!
//! Bookkeeping (the idle/busy/creating/waiting lists) is owned by a single
//! `tokio::sync::Mutex` per `Stock`; critical sections only ever touch list
//! pointers, never perform I/O, giving "one mutation in flight at a time"
//! without a dedicated event-loop thread.

use crate::error::BalancerError;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Capability set an item must provide to live in a `Stock`.
pub trait Poolable: Send + Sync + 'static {
    /// Validate an idle item before handing it back out. `false` means the
    /// item should be destroyed instead of reused (e.g. the peer closed it).
    fn borrow(&self) -> bool {
        true
    }

    /// Called when a caller puts an item back with `reuse = true`. `false`
    /// means the item must still be destroyed (e.g. it observed a
    /// connection-level error while busy).
    fn release(&self) -> bool {
        true
    }

    fn is_fading(&self) -> bool;
    fn set_fade(&self);
}

type Factory<T> = Arc<dyn Fn() -> BoxFuture<Result<T, BalancerError>> + Send + Sync>;

struct Inner<T> {
    idle: VecDeque<Arc<T>>,
    busy: Vec<Arc<T>>,
    creating: usize,
    waiting: VecDeque<oneshot::Sender<Result<Arc<T>, BalancerError>>>,
    may_clear: bool,
}

/// One named pool. Cheaply cloneable — all state lives behind `Arc`s, so a
/// clone can be handed to a background task (the cleanup/clear tick, or a
/// waiter-serving task) without the caller needing to manage lifetimes.
#[derive(Clone)]
pub struct Stock<T: Poolable> {
    name: Arc<str>,
    limit: usize,
    max_idle: usize,
    factory: Factory<T>,
    inner: Arc<Mutex<Inner<T>>>,
}

/// An item checked out of a `Stock`. Dropping it without calling
/// [`StockHandle::put`] is treated as `put(reuse = false)` — a dropped
/// guard destroys the item rather than leaking it as permanently busy.
pub struct StockHandle<T: Poolable> {
    item: Option<Arc<T>>,
    stock: Stock<T>,
}

impl<T: Poolable> StockHandle<T> {
    pub fn get(&self) -> &Arc<T> {
        self.item.as_ref().expect("item taken")
    }

    pub async fn put(mut self, reuse: bool) {
        let item = self.item.take().expect("item taken");
        self.stock.put(item, reuse).await;
    }
}

impl<T: Poolable> Drop for StockHandle<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            let stock = self.stock.clone();
            tokio::spawn(async move {
                stock.put(item, false).await;
            });
        }
    }
}

impl<T: Poolable> Stock<T> {
    pub fn new(
        name: impl Into<Arc<str>>,
        limit: usize,
        max_idle: usize,
        factory: impl Fn() -> BoxFuture<Result<T, BalancerError>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            limit,
            max_idle,
            factory: Arc::new(factory),
            inner: Arc::new(Mutex::new(Inner {
                idle: VecDeque::new(),
                busy: Vec::new(),
                creating: 0,
                waiting: VecDeque::new(),
                may_clear: true,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Get(info, handler, cancel)`. Cancellation is modeled by dropping
    /// the returned future before it resolves: the waiter (if parked) is
    /// removed from the queue without affecting other waiters, because the
    /// oneshot `Receiver` being dropped is exactly what signals that.
    pub async fn get(&self) -> Result<StockHandle<T>, BalancerError> {
        enum Action<T> {
            Got(Arc<T>),
            Create,
            Wait(oneshot::Receiver<Result<Arc<T>, BalancerError>>),
        }

        let action = {
            let mut inner = self.inner.lock().await;
            inner.may_clear = false;
            let mut got = None;
            while let Some(item) = inner.idle.pop_front() {
                if item.borrow() {
                    got = Some(item);
                    break;
                }
                debug!(stock = %self.name, "stock: idle item failed borrow check, destroying");
            }
            if let Some(item) = got {
                inner.busy.push(item.clone());
                Action::Got(item)
            } else if self.limit == 0 || inner.busy.len() + inner.creating < self.limit {
                inner.creating += 1;
                Action::Create
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiting.push_back(tx);
                Action::Wait(rx)
            }
        };

        let item = match action {
            Action::Got(item) => item,
            Action::Create => self.create_and_install().await?,
            Action::Wait(rx) => rx
                .await
                .map_err(|_| BalancerError::Cancelled)
                .and_then(|res| res)?,
        };

        Ok(StockHandle { item: Some(item), stock: self.clone() })
    }

    async fn create_and_install(&self) -> Result<Arc<T>, BalancerError> {
        let result = (self.factory)().await;
        let mut inner = self.inner.lock().await;
        inner.creating -= 1;
        match result {
            Ok(item) => {
                debug!(stock = %self.name, "stock: item created");
                let item = Arc::new(item);
                inner.busy.push(item.clone());
                Ok(item)
            }
            Err(e) => {
                drop(inner);
                debug!(stock = %self.name, error = %e, "stock: item creation failed");
                self.serve_next_waiter().await;
                Err(e)
            }
        }
    }

    /// `Put(item, reuse)`.
    pub async fn put(&self, item: Arc<T>, reuse: bool) {
        let destroy = !reuse || item.is_fading() || !item.release();
        if destroy {
            debug!(stock = %self.name, "stock: item destroyed on put");
        }
        {
            let mut inner = self.inner.lock().await;
            inner.may_clear = false;
            inner.busy.retain(|b| !Arc::ptr_eq(b, &item));
            if !destroy {
                inner.idle.push_back(item);
                let excess = inner.idle.len().saturating_sub(self.max_idle);
                if excess > 0 {
                    self.schedule_cleanup();
                }
            }
        }
        self.serve_next_waiter().await;
    }

    /// Wake the oldest parked waiter, if any, by either handing it a
    /// freshly-idle item or starting a new creation on its behalf.
    async fn serve_next_waiter(&self) {
        let tx = {
            let mut inner = self.inner.lock().await;
            if inner.waiting.is_empty() {
                return;
            }
            let mut served_idle = None;
            while let Some(item) = inner.idle.pop_front() {
                if item.borrow() {
                    served_idle = Some(item);
                    break;
                }
            }
            if let Some(item) = served_idle {
                inner.busy.push(item.clone());
                let tx = inner.waiting.pop_front().unwrap();
                let _ = tx.send(Ok(item));
                return;
            }
            if self.limit != 0 && inner.busy.len() + inner.creating >= self.limit {
                return;
            }
            inner.creating += 1;
            inner.waiting.pop_front()
        };
        let Some(tx) = tx else { return };
        let result = self.create_and_install().await;
        let _ = tx.send(result);
    }

    /// Mark every busy item fading and drop all idle ones. New creations
    /// are not blocked; future items come back fresh.
    pub async fn fade_all(&self) {
        let mut inner = self.inner.lock().await;
        for item in &inner.busy {
            item.set_fade();
        }
        inner.idle.clear();
    }

    /// Cleanup tick: destroy ≈1/3 of the excess over `max_idle`, from the
    /// front of the idle list. Rescheduled by the caller until idle drains
    /// to `max_idle` (see `spawn_maintenance`).
    pub async fn run_cleanup_tick(&self) {
        let mut inner = self.inner.lock().await;
        let excess = inner.idle.len().saturating_sub(self.max_idle);
        if excess == 0 {
            return;
        }
        let to_destroy = excess.div_ceil(3).max(1).min(inner.idle.len());
        for _ in 0..to_destroy {
            inner.idle.pop_front();
        }
        debug!(stock = %self.name, destroyed = to_destroy, remaining_excess = excess - to_destroy, "stock: cleanup tick swept idle items");
    }

    /// Clear tick: if no `Get`/`Put` activity occurred since the previous
    /// tick, destroy all idle items. Always re-arms `may_clear` for the
    /// next window.
    pub async fn run_clear_tick(&self) {
        let mut inner = self.inner.lock().await;
        if inner.may_clear && !inner.idle.is_empty() {
            debug!(stock = %self.name, cleared = inner.idle.len(), "stock: clear tick dropped idle items, no activity since last tick");
            inner.idle.clear();
        }
        inner.may_clear = true;
    }

    fn schedule_cleanup(&self) {
        let stock = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            stock.run_cleanup_tick().await;
        });
    }

    /// Spawn the periodic cleanup/clear maintenance loops for this stock.
    /// Intended to be called once per `Stock` when it is created by its
    /// owning `StockMap`.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let stock = self.clone();
        tokio::spawn(async move {
            let mut clear_tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                clear_tick.tick().await;
                stock.run_clear_tick().await;
            }
        })
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn busy_count(&self) -> usize {
        self.inner.lock().await.busy.len()
    }

    pub async fn waiting_count(&self) -> usize {
        self.inner.lock().await.waiting.len()
    }
}

/// A mapping from name to `Stock`, providing hash-indexed access and
/// lifetime ownership — mirrors `ClusterStore`'s `DashMap<String, Cluster>`
/// shape.
pub struct StockMap<T: Poolable> {
    stocks: dashmap::DashMap<String, Stock<T>>,
    limit: usize,
    max_idle: usize,
}

impl<T: Poolable> StockMap<T> {
    pub fn new(limit: usize, max_idle: usize) -> Self {
        Self { stocks: dashmap::DashMap::new(), limit, max_idle }
    }

    /// Get or create the named stock, installing `factory` only if a new
    /// stock is created (existing stocks keep the factory they were built
    /// with).
    pub fn get_or_create(
        &self,
        name: &str,
        factory: impl Fn() -> BoxFuture<Result<T, BalancerError>> + Send + Sync + 'static,
    ) -> Stock<T> {
        if let Some(s) = self.stocks.get(name) {
            return s.clone();
        }
        self.stocks
            .entry(name.to_string())
            .or_insert_with(|| {
                let stock = Stock::new(name.to_string(), self.limit, self.max_idle, factory);
                stock.spawn_maintenance();
                stock
            })
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.stocks.remove(name);
    }

    pub fn len(&self) -> usize {
        self.stocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty()
    }
}
