//! Dispatcher: marshals publishes into the delivery context
//!
//! The delivery context is one thread. Work submitted from that thread runs
//! synchronously; work submitted from any other thread is queued per channel
//! and runs when the delivery context calls [`Dispatcher::drain`]. Queued
//! work for the same channel is coalesced: only the latest job survives,
//! in the queue position of the first one.

use crate::error::{EventError, Result};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread::{self, ThreadId};
use tokio::sync::Notify;

/// Queued unit of work, run with the dispatcher's context
pub(crate) type Job<C> = Box<dyn FnOnce(&C) -> Result<()> + Send>;

type Waker = Box<dyn Fn() + Send + Sync>;

struct PendingQueue<K, C> {
    order: VecDeque<K>,
    jobs: HashMap<K, Job<C>>,
    coalesced: u64,
}

pub(crate) struct Dispatcher<K, C> {
    owner: RwLock<ThreadId>,
    queue: Mutex<PendingQueue<K, C>>,
    notify: Notify,
    waker: Option<Waker>,
    broadcasting: AtomicBool,
    deferred: Mutex<VecDeque<K>>,
}

impl<K: Eq + Hash + Clone, C> Dispatcher<K, C> {
    /// Dispatcher whose delivery context is the calling thread
    pub fn new(waker: Option<Waker>) -> Self {
        Self {
            owner: RwLock::new(thread::current().id()),
            queue: Mutex::new(PendingQueue {
                order: VecDeque::new(),
                jobs: HashMap::new(),
                coalesced: 0,
            }),
            notify: Notify::new(),
            waker,
            broadcasting: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the calling thread the delivery context
    pub fn bind_current_thread(&self) -> Result<()> {
        let mut owner = self
            .owner
            .write()
            .map_err(|e| EventError::Lock(format!("dispatcher owner: {}", e)))?;
        *owner = thread::current().id();
        Ok(())
    }

    pub fn is_delivery_context(&self) -> bool {
        match self.owner.read() {
            Ok(owner) => *owner == thread::current().id(),
            Err(_) => false,
        }
    }

    pub fn ensure_delivery_context(&self, operation: &str) -> Result<()> {
        if self.is_delivery_context() {
            Ok(())
        } else {
            Err(EventError::threading(operation))
        }
    }

    /// Queue a job for `key`, replacing any job already queued for it
    ///
    /// Returns true when an earlier job was replaced.
    pub fn enqueue(&self, key: K, job: Job<C>) -> Result<bool> {
        let (coalesced, was_empty) = {
            let mut queue = self.lock_queue()?;
            let was_empty = queue.order.is_empty();
            let coalesced = match queue.jobs.insert(key.clone(), job) {
                Some(_) => {
                    queue.coalesced += 1;
                    true
                }
                None => {
                    queue.order.push_back(key);
                    false
                }
            };
            (coalesced, was_empty)
        };

        if was_empty {
            self.notify.notify_one();
            if let Some(waker) = &self.waker {
                waker();
            }
        }
        Ok(coalesced)
    }

    /// Run every queued job on the delivery context
    ///
    /// All jobs run even if some fail; the first failure is returned.
    pub fn drain(&self, ctx: &C) -> Result<usize> {
        self.ensure_delivery_context("drain")?;
        let mut ran = 0;
        let mut first_err = None;
        loop {
            let job = {
                let mut queue = self.lock_queue()?;
                let Some(key) = queue.order.pop_front() else {
                    break;
                };
                queue.jobs.remove(&key)
            };
            let Some(job) = job else { continue };
            ran += 1;
            if let Err(e) = job(ctx) {
                if first_err.is_some() {
                    tracing::warn!(error = %e, "Queued publish failed");
                } else {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(ran),
        }
    }

    /// Wait until at least one job may be queued
    pub async fn wait(&self) {
        if self.pending() > 0 {
            return;
        }
        self.notify.notified().await;
    }

    /// Drop every queued job
    pub fn discard(&self) -> Result<usize> {
        let mut queue = self.lock_queue()?;
        let dropped = queue.order.len();
        queue.order.clear();
        queue.jobs.clear();
        Ok(dropped)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.order.len()).unwrap_or(0)
    }

    pub fn coalesced(&self) -> u64 {
        self.queue.lock().map(|q| q.coalesced).unwrap_or(0)
    }

    /// Whether a broadcast is running on the delivery context
    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.load(Ordering::Acquire)
    }

    /// Broadcast `key` unless a broadcast is already running
    ///
    /// A broadcast requested from inside a callback is appended to the
    /// running one, so callbacks are never re-entered.
    pub fn broadcast<F>(&self, key: K, mut deliver: F) -> Result<()>
    where
        F: FnMut(&K) -> Result<()>,
    {
        {
            let mut deferred = self.lock_deferred()?;
            if !deferred.contains(&key) {
                deferred.push_back(key);
            }
        }
        if self.broadcasting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = BroadcastGuard(&self.broadcasting);

        let mut first_err = None;
        loop {
            let next = self.lock_deferred()?.pop_front();
            let Some(key) = next else { break };
            if let Err(e) = deliver(&key) {
                if first_err.is_some() {
                    tracing::warn!(error = %e, "Delivery failed");
                } else {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock_queue(&self) -> Result<std::sync::MutexGuard<'_, PendingQueue<K, C>>> {
        self.queue
            .lock()
            .map_err(|e| EventError::Lock(format!("dispatch queue: {}", e)))
    }

    fn lock_deferred(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<K>>> {
        self.deferred
            .lock()
            .map_err(|e| EventError::Lock(format!("broadcast queue: {}", e)))
    }
}

struct BroadcastGuard<'a>(&'a AtomicBool);

impl Drop for BroadcastGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
