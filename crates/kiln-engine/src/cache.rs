//! The build cache: fingerprint → live build, with refcounts, idle-window
//! destruction and at-most-one concurrent build per fingerprint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::build::{Build, BuildKey};
use crate::error::{ExecError, ExecResult};

type SharedBuild = Shared<BoxFuture<'static, Result<Arc<Build>, ExecError>>>;

enum Slot {
    Ready(Arc<Build>),
    Building(SharedBuild),
}

struct Entry {
    slot: Slot,
    refs: u32,
    idle: Option<tokio::task::JoinHandle<()>>,
    generation: u64,
}

/// All state transitions are serialized on one lock; the idle timers run on
/// the host scheduler and re-check under the lock before destroying.
pub struct BuildCache {
    entries: Mutex<HashMap<BuildKey, Entry>>,
    idle_release: Duration,
    host: tokio::runtime::Handle,
    generations: Mutex<u64>,
}

impl BuildCache {
    pub(crate) fn new(idle_release: Duration, host: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            idle_release,
            host,
            generations: Mutex::new(0),
        })
    }

    fn next_generation(&self) -> u64 {
        let mut counter = self.generations.lock();
        *counter += 1;
        *counter
    }

    /// Return the build for `key` with its refcount incremented, creating
    /// it with `create` if absent. Concurrent callers for the same key wait
    /// on the same in-flight future; a failed build is discarded so the
    /// next caller retries.
    pub(crate) async fn acquire<F>(
        self: &Arc<Self>,
        key: BuildKey,
        create: F,
    ) -> ExecResult<Arc<Build>>
    where
        F: Future<Output = ExecResult<Arc<Build>>> + Send + 'static,
    {
        let (shared, generation) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => match &entry.slot {
                    Slot::Ready(build) => {
                        entry.refs += 1;
                        if let Some(timer) = entry.idle.take() {
                            timer.abort();
                        }
                        return Ok(build.clone());
                    }
                    Slot::Building(shared) => (shared.clone(), entry.generation),
                },
                None => {
                    let generation = self.next_generation();
                    let shared = create.boxed().shared();
                    // Drive the build to completion even if every waiter is
                    // dropped mid-flight.
                    self.host.spawn(shared.clone().map(|_| ()));
                    entries.insert(
                        key.clone(),
                        Entry {
                            slot: Slot::Building(shared.clone()),
                            refs: 0,
                            idle: None,
                            generation,
                        },
                    );
                    (shared, generation)
                }
            }
        };

        let result = shared.await;
        let mut entries = self.entries.lock();
        match result {
            Ok(build) => {
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    slot: Slot::Ready(build.clone()),
                    refs: 0,
                    idle: None,
                    generation,
                });
                if matches!(entry.slot, Slot::Building(_)) {
                    entry.slot = Slot::Ready(build.clone());
                }
                entry.refs += 1;
                if let Some(timer) = entry.idle.take() {
                    timer.abort();
                }
                Ok(build)
            }
            Err(e) => {
                // Never cache a failed build.
                if let Some(entry) = entries.get(&key) {
                    if entry.generation == generation && matches!(entry.slot, Slot::Building(_)) {
                        entries.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop one reference; at zero the idle timer starts and destroys the
    /// build when it expires without a re-acquire.
    pub(crate) fn release(self: &Arc<Self>, key: &BuildKey) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 || !matches!(entry.slot, Slot::Ready(_)) {
            return;
        }

        if let Some(timer) = entry.idle.take() {
            timer.abort();
        }

        let cache = Arc::downgrade(self);
        let key = key.clone();
        let generation = entry.generation;
        let idle = self.idle_release;
        entry.idle = Some(self.host.spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(cache) = cache.upgrade() {
                cache.expire(&key, generation);
            }
        }));
        debug!(build = %key, "build idle, release timer armed");
    }

    fn expire(&self, key: &BuildKey, generation: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return;
        };
        if entry.generation != generation || entry.refs != 0 {
            return;
        }
        entries.remove(key);
        info!(build = %key, "build released, no usages left");
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current refcount for a key, if cached.
    pub fn ref_count(&self, key: &BuildKey) -> Option<u32> {
        self.entries.lock().get(key).map(|e| e.refs)
    }

    pub fn contains(&self, key: &BuildKey) -> bool {
        self.entries.lock().contains_key(key)
    }
}
