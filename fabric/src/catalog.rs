//! Single-activation routing of invocations by string key.
//!
//! A [`Catalog`] owns every activation of one grain kind. For any key there is
//! at most one live activation at any instant, and invocations against one key
//! execute one at a time in FIFO arrival order, the two invariants an
//! agent-hosting layer builds on. Across keys, execution is parallel.
//!
//! # Lifecycle
//!
//! ```text
//! invoke("u1:bot", f)
//!   ├─ no activation yet: factory("u1:bot") → grain.on_activate() → run f
//!   ├─ activation live:   queue behind the per-key lock → run f
//!   └─ activation idle-collected mid-flight: cell is marked defunct,
//!      the caller transparently re-activates and runs f on the fresh one
//! ```
//!
//! An idle sweeper deactivates activations that have not been invoked for the
//! catalog's `idle_after` window. Deactivation completes (`on_deactivate`
//! returns, state flushed) before any new activation of the same key can
//! start; racing invokers wait on the old cell, observe it defunct, and retry
//! against a fresh one.
//!
//! Grains must not invoke their own catalog from `on_activate`/`on_deactivate`
//! since the cell lock is held across both hooks.

use crate::FabricError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Hosted entity lifecycle hooks.
///
/// `on_activate` runs before the first invocation after (re-)activation and
/// typically rehydrates persisted state. `on_deactivate` runs when the
/// activation is collected and typically flushes state. It cannot fail: a
/// grain that cannot flush logs and carries on with its last-written state.
#[async_trait]
pub trait Grain: Send + 'static {
    async fn on_activate(&mut self) -> Result<(), FabricError>;

    async fn on_deactivate(&mut self);
}

struct Activation<G> {
    grain: Option<G>,
    /// Set when this cell has been collected; holders must retry via the map.
    defunct: bool,
    last_used: Instant,
}

type Cell<G> = Arc<Mutex<Activation<G>>>;

struct CatalogInner<G: Grain> {
    kind: &'static str,
    idle_after: Duration,
    factory: Box<dyn Fn(&str) -> G + Send + Sync>,
    cells: StdMutex<HashMap<String, Cell<G>>>,
}

/// Single-activation directory for one grain kind. Cheap to clone; all clones
/// share the same activation map.
pub struct Catalog<G: Grain> {
    inner: Arc<CatalogInner<G>>,
}

impl<G: Grain> Clone for Catalog<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Grain> Catalog<G> {
    /// Create a catalog for `kind`, collecting activations idle for longer
    /// than `idle_after`. The `factory` builds a fresh in-memory grain for a
    /// key; persisted state is the grain's own business in `on_activate`.
    ///
    /// Must be called from within a tokio runtime (the idle sweeper is
    /// spawned here).
    pub fn new(
        kind: &'static str,
        idle_after: Duration,
        factory: impl Fn(&str) -> G + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(CatalogInner {
            kind,
            idle_after,
            factory: Box::new(factory),
            cells: StdMutex::new(HashMap::new()),
        });
        spawn_idle_sweeper(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Run `f` against the single activation of `key`, activating it first if
    /// needed. Invocations for the same key run one at a time, FIFO.
    pub async fn invoke<R, F>(&self, key: &str, f: F) -> Result<R, FabricError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut G) -> BoxFuture<'a, R> + Send,
    {
        let mut f = Some(f);
        loop {
            let cell = self.cell_for(key);
            let mut activation = cell.lock().await;
            if activation.defunct {
                // Collected between our map lookup and lock acquisition.
                continue;
            }

            if activation.grain.is_none() {
                let mut grain = (self.inner.factory)(key);
                if let Err(err) = grain.on_activate().await {
                    activation.defunct = true;
                    self.remove_cell(key, &cell);
                    log::error!(
                        "{} activation of '{}' failed: {}",
                        self.inner.kind,
                        key,
                        err
                    );
                    return Err(FabricError::ActivationFailed(format!("{}: {}", key, err)));
                }
                log::debug!("{} '{}' activated", self.inner.kind, key);
                activation.grain = Some(grain);
            }

            activation.last_used = Instant::now();
            match (activation.grain.as_mut(), f.take()) {
                (Some(grain), Some(call)) => {
                    let out = call(grain).await;
                    activation.last_used = Instant::now();
                    return Ok(out);
                }
                _ => return Err(FabricError::ActivationLost(key.to_string())),
            }
        }
    }

    /// Run `f` only if `key` currently has a live activation; never
    /// activates. Returns `None` when the key is inactive. Per-activation
    /// timers use this so a tick racing a deactivation dies with it.
    pub async fn invoke_if_active<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut G) -> BoxFuture<'a, R> + Send,
    {
        let cell = {
            let cells = self.cells_lock();
            Arc::clone(cells.get(key)?)
        };
        let mut activation = cell.lock().await;
        if activation.defunct {
            return None;
        }
        let grain = activation.grain.as_mut()?;
        let out = f(grain).await;
        activation.last_used = Instant::now();
        Some(out)
    }

    /// Deactivate `key` now, running `on_deactivate` before returning.
    /// Returns `true` if a live activation was collected.
    pub async fn deactivate(&self, key: &str) -> bool {
        let cell = {
            let cells = self.cells_lock();
            match cells.get(key) {
                Some(cell) => Arc::clone(cell),
                None => return false,
            }
        };

        let mut activation = cell.lock().await;
        if activation.defunct {
            return false;
        }
        activation.defunct = true;
        let collected = match activation.grain.take() {
            Some(mut grain) => {
                grain.on_deactivate().await;
                log::debug!("{} '{}' deactivated", self.inner.kind, key);
                true
            }
            None => false,
        };
        self.remove_cell(key, &cell);
        collected
    }

    /// Deactivate every live activation. Used for graceful shutdown.
    pub async fn shutdown(&self) {
        for key in self.active_keys() {
            self.deactivate(&key).await;
        }
    }

    /// Keys with a cell in the directory (live or mid-activation).
    pub fn active_keys(&self) -> Vec<String> {
        let cells = self.cells_lock();
        cells.keys().cloned().collect()
    }

    fn cell_for(&self, key: &str) -> Cell<G> {
        let mut cells = self.cells_lock();
        Arc::clone(cells.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Activation {
                grain: None,
                defunct: false,
                last_used: Instant::now(),
            }))
        }))
    }

    fn remove_cell(&self, key: &str, cell: &Cell<G>) {
        let mut cells = self.cells_lock();
        if let Some(current) = cells.get(key) {
            if Arc::ptr_eq(current, cell) {
                cells.remove(key);
            }
        }
    }

    fn cells_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Cell<G>>> {
        match self.inner.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Periodically collects idle activations. Holds only a weak reference so the
/// sweeper dies with the catalog.
fn spawn_idle_sweeper<G: Grain>(inner: Weak<CatalogInner<G>>) {
    tokio::spawn(async move {
        loop {
            let interval = match inner.upgrade() {
                Some(catalog) => catalog.idle_after.min(Duration::from_secs(30)).max(Duration::from_millis(50)),
                None => return,
            };
            tokio::time::sleep(interval).await;

            let Some(catalog) = inner.upgrade() else {
                return;
            };
            let snapshot: Vec<(String, Cell<G>)> = {
                let cells = match catalog.cells.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                cells
                    .iter()
                    .map(|(key, cell)| (key.clone(), Arc::clone(cell)))
                    .collect()
            };

            for (key, cell) in snapshot {
                // try_lock: never stall behind a busy activation; it is not
                // idle if someone holds its lock.
                let Ok(mut activation) = cell.try_lock() else {
                    continue;
                };
                if activation.defunct
                    || activation.grain.is_none()
                    || activation.last_used.elapsed() < catalog.idle_after
                {
                    continue;
                }
                activation.defunct = true;
                if let Some(mut grain) = activation.grain.take() {
                    grain.on_deactivate().await;
                    log::debug!("{} '{}' idle-deactivated", catalog.kind, key);
                }
                let mut cells = match catalog.cells.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(current) = cells.get(&key) {
                    if Arc::ptr_eq(current, &cell) {
                        cells.remove(&key);
                    }
                }
            }
        }
    });
}
