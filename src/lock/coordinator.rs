//! Lock table and its state machine
//!
//! All state lives behind one `parking_lot::Mutex`. The mutex is never held
//! across an `.await`: waiters park on a oneshot receiver and are granted
//! the lock by whoever releases it, inside the same critical section.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::protocol::{LockResponse, UnlockResponse};
use super::types::{LockKey, LockStats, RequesterId};

/// Lock coordinator settings
#[derive(Debug, Clone)]
pub struct LockCoordinatorConfig {
    /// Upper bound on a queued acquire; `None` waits forever
    pub acquire_timeout: Option<Duration>,

    /// Lease attached to each grant; `None` disables leases
    pub lease: Option<Duration>,

    /// How often the reaper looks for expired leases
    pub reap_interval: Duration,
}

impl Default for LockCoordinatorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: None,
            lease: Some(Duration::from_secs(30)),
            reap_interval: Duration::from_secs(1),
        }
    }
}

struct Holder {
    requester: RequesterId,
    grant_id: u64,
    lease_deadline: Option<Instant>,
}

struct Waiter {
    requester: RequesterId,
    ticket: u64,
    tx: oneshot::Sender<LockResponse>,
}

#[derive(Default)]
struct KeyState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn lease_expired(&self, now: Instant) -> bool {
        matches!(
            &self.holder,
            Some(Holder { lease_deadline: Some(deadline), .. }) if *deadline <= now
        )
    }
}

/// Grant numbers and waiter tickets share one sequence
struct Table {
    keys: HashMap<LockKey, KeyState>,
    sequence: u64,
    stats: LockStats,
}

impl Table {
    fn next(sequence: &mut u64) -> u64 {
        *sequence += 1;
        *sequence
    }

    /// Give `key` to the first waiter still listening. Returns whether
    /// anyone received it. Caller must have cleared the holder.
    fn hand_off(
        key: &LockKey,
        state: &mut KeyState,
        sequence: &mut u64,
        stats: &mut LockStats,
        lease: Option<Duration>,
    ) -> bool {
        while let Some(waiter) = state.waiters.pop_front() {
            let grant_id = Self::next(sequence);
            let response = LockResponse {
                key: key.to_string(),
                grant_id,
            };
            if waiter.tx.send(response).is_ok() {
                debug!(key = %key, requester = %waiter.requester, grant_id, "Lock handed off");
                state.holder = Some(Holder {
                    requester: waiter.requester,
                    grant_id,
                    lease_deadline: lease.map(|l| Instant::now() + l),
                });
                stats.grants += 1;
                return true;
            }
            trace!(key = %key, requester = %waiter.requester, "Skipping departed waiter");
        }
        false
    }
}

/// Result of asking for a lock
pub(crate) enum Enqueued {
    Granted(LockResponse),
    Queued(QueuedLock),
}

/// A place in a key's wait queue, redeemed with
/// [`LockCoordinator::wait_queued`]
pub(crate) struct QueuedLock {
    ticket: u64,
    rx: oneshot::Receiver<LockResponse>,
}

/// Outcome of taking a waiter out of the queue
enum WaitExit {
    /// Still queued; now removed
    Removed,
    /// Granted before we got to it
    Granted(LockResponse),
    /// Dropped by the coordinator (session released)
    Dropped,
}

/// Single-owner-per-key lock coordinator
pub struct LockCoordinator {
    config: LockCoordinatorConfig,
    table: Mutex<Table>,
}

impl LockCoordinator {
    pub fn new(config: LockCoordinatorConfig) -> Self {
        Self {
            config,
            table: Mutex::new(Table {
                keys: HashMap::new(),
                sequence: 0,
                stats: LockStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &LockCoordinatorConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────
    // Acquire
    // ─────────────────────────────────────────────────────────────

    /// Acquire `key`, waiting in FIFO order up to the configured timeout
    pub async fn acquire(&self, requester: &RequesterId, key: &LockKey) -> Result<LockResponse> {
        self.acquire_with_timeout(requester, key, self.config.acquire_timeout)
            .await
    }

    /// Acquire `key`, waiting at most `wait` (`None` waits forever)
    ///
    /// Dropping the returned future before it resolves gives up the place
    /// in the queue. If the lock was granted in the meantime it is passed to
    /// the next waiter.
    pub async fn acquire_with_timeout(
        &self,
        requester: &RequesterId,
        key: &LockKey,
        wait: Option<Duration>,
    ) -> Result<LockResponse> {
        match self.enqueue(requester, key)? {
            Enqueued::Granted(response) => Ok(response),
            Enqueued::Queued(queued) => self.wait_queued(requester, key, queued, wait).await,
        }
    }

    /// Wait for a grant on a place taken by [`enqueue`](Self::enqueue)
    ///
    /// Same drop and timeout behavior as
    /// [`acquire_with_timeout`](Self::acquire_with_timeout).
    pub(crate) async fn wait_queued(
        &self,
        requester: &RequesterId,
        key: &LockKey,
        queued: QueuedLock,
        wait: Option<Duration>,
    ) -> Result<LockResponse> {
        let QueuedLock { ticket, rx } = queued;
        let mut guard = WaitGuard {
            coordinator: self,
            key,
            ticket,
            rx,
            armed: true,
        };

        let received = match wait {
            Some(limit) => match tokio::time::timeout(limit, &mut guard.rx).await {
                Ok(received) => received,
                Err(_) => {
                    guard.armed = false;
                    return match self.leave_queue(key, ticket, &mut guard.rx) {
                        WaitExit::Granted(response) => Ok(response),
                        WaitExit::Dropped => Err(Error::LockCancelled {
                            key: key.to_string(),
                        }),
                        WaitExit::Removed => {
                            self.table.lock().stats.timeouts += 1;
                            debug!(key = %key, requester = %requester, ?limit, "Lock wait timed out");
                            Err(Error::LockTimeout {
                                key: key.to_string(),
                                waited: limit,
                            })
                        }
                    };
                }
            },
            None => (&mut guard.rx).await,
        };

        guard.armed = false;
        received.map_err(|_| Error::LockCancelled {
            key: key.to_string(),
        })
    }

    /// Acquire `key` only if it is free right now
    pub fn try_acquire(&self, requester: &RequesterId, key: &LockKey) -> Result<Option<LockResponse>> {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;
        let now = Instant::now();

        let state = keys.entry(key.clone()).or_default();
        if state.lease_expired(now) {
            Self::reclaim(key, state, sequence, stats, self.config.lease);
        }

        match state.holder.as_ref().map(|h| h.requester == *requester) {
            Some(true) => Err(Error::AlreadyHolder {
                key: key.to_string(),
                requester: requester.to_string(),
            }),
            Some(false) => Ok(None),
            None => Ok(Some(Self::grant(key, state, requester, sequence, stats, self.config.lease))),
        }
    }

    /// Grant `key` if free, otherwise take a place at the back of its queue
    ///
    /// Never waits, so callers can fix the queue order before awaiting.
    pub(crate) fn enqueue(&self, requester: &RequesterId, key: &LockKey) -> Result<Enqueued> {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;
        let now = Instant::now();

        let state = keys.entry(key.clone()).or_default();
        if state.lease_expired(now) {
            Self::reclaim(key, state, sequence, stats, self.config.lease);
        }

        match state.holder.as_ref().map(|h| h.requester == *requester) {
            None => Ok(Enqueued::Granted(Self::grant(
                key,
                state,
                requester,
                sequence,
                stats,
                self.config.lease,
            ))),
            Some(true) => Err(Error::AlreadyHolder {
                key: key.to_string(),
                requester: requester.to_string(),
            }),
            Some(false) => {
                let ticket = Table::next(sequence);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    requester: requester.clone(),
                    ticket,
                    tx,
                });
                debug!(key = %key, requester = %requester, queued = state.waiters.len(), "Lock busy, queued");
                Ok(Enqueued::Queued(QueuedLock { ticket, rx }))
            }
        }
    }

    fn grant(
        key: &LockKey,
        state: &mut KeyState,
        requester: &RequesterId,
        sequence: &mut u64,
        stats: &mut LockStats,
        lease: Option<Duration>,
    ) -> LockResponse {
        let grant_id = Table::next(sequence);
        state.holder = Some(Holder {
            requester: requester.clone(),
            grant_id,
            lease_deadline: lease.map(|l| Instant::now() + l),
        });
        stats.grants += 1;
        debug!(key = %key, requester = %requester, grant_id, "Lock granted");
        LockResponse {
            key: key.to_string(),
            grant_id,
        }
    }

    fn reclaim(
        key: &LockKey,
        state: &mut KeyState,
        sequence: &mut u64,
        stats: &mut LockStats,
        lease: Option<Duration>,
    ) {
        if let Some(expired) = state.holder.take() {
            stats.reclaims += 1;
            info!(key = %key, requester = %expired.requester, grant_id = expired.grant_id, "Lease expired, lock reclaimed");
            Table::hand_off(key, state, sequence, stats, lease);
        }
    }

    /// Take a waiter out of the queue. Runs under the table lock, so a
    /// grant either happened entirely before this or not at all.
    fn leave_queue(
        &self,
        key: &LockKey,
        ticket: u64,
        rx: &mut oneshot::Receiver<LockResponse>,
    ) -> WaitExit {
        let mut table = self.table.lock();

        if let Some(state) = table.keys.get_mut(key) {
            if let Some(pos) = state.waiters.iter().position(|w| w.ticket == ticket) {
                state.waiters.remove(pos);
                if state.is_idle() {
                    table.keys.remove(key);
                }
                return WaitExit::Removed;
            }
        }

        match rx.try_recv() {
            Ok(response) => WaitExit::Granted(response),
            Err(_) => WaitExit::Dropped,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Release
    // ─────────────────────────────────────────────────────────────

    /// Release `key`; only its current holder may do so
    ///
    /// The next queued waiter, if any, becomes the holder before this
    /// returns.
    pub fn release(&self, requester: &RequesterId, key: &LockKey) -> Result<UnlockResponse> {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;

        let held_by_caller = keys
            .get(key)
            .and_then(|state| state.holder.as_ref())
            .is_some_and(|holder| holder.requester == *requester);

        if !held_by_caller {
            stats.rejected_unlocks += 1;
            debug!(key = %key, requester = %requester, "Unlock rejected, not the holder");
            return Err(Error::NotHolder {
                key: key.to_string(),
                requester: requester.to_string(),
            });
        }

        let handed_off = match keys.get_mut(key) {
            Some(state) => {
                state.holder = None;
                stats.releases += 1;
                debug!(key = %key, requester = %requester, "Lock released");
                let handed_off = Table::hand_off(key, state, sequence, stats, self.config.lease);
                if state.is_idle() {
                    keys.remove(key);
                }
                handed_off
            }
            None => false,
        };

        Ok(UnlockResponse {
            key: key.to_string(),
            handed_off,
        })
    }

    /// Release the grant `grant_id` if it is still current
    fn release_grant(&self, key: &LockKey, grant_id: u64) {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;

        if let Some(state) = keys.get_mut(key) {
            if state.holder.as_ref().is_some_and(|h| h.grant_id == grant_id) {
                state.holder = None;
                stats.releases += 1;
                Table::hand_off(key, state, sequence, stats, self.config.lease);
                if state.is_idle() {
                    keys.remove(key);
                }
            }
        }
    }

    /// Extend the lease held by `requester` on `key`
    pub fn renew(&self, requester: &RequesterId, key: &LockKey) -> Result<()> {
        let mut table = self.table.lock();
        let lease = self.config.lease;

        match table.keys.get_mut(key).and_then(|s| s.holder.as_mut()) {
            Some(holder) if holder.requester == *requester => {
                holder.lease_deadline = lease.map(|l| Instant::now() + l);
                trace!(key = %key, requester = %requester, "Lease renewed");
                Ok(())
            }
            _ => Err(Error::NotHolder {
                key: key.to_string(),
                requester: requester.to_string(),
            }),
        }
    }

    /// Extend every lease `requester` holds. Returns how many.
    ///
    /// Sessions call this while their peer is alive, so only holders that
    /// went away or stopped answering run into lease expiry.
    pub fn renew_all(&self, requester: &RequesterId) -> usize {
        let Some(lease) = self.config.lease else {
            return 0;
        };
        let deadline = Instant::now() + lease;
        let mut table = self.table.lock();

        let mut renewed = 0;
        for holder in table.keys.values_mut().filter_map(|s| s.holder.as_mut()) {
            if holder.requester == *requester {
                holder.lease_deadline = Some(deadline);
                renewed += 1;
            }
        }
        renewed
    }

    /// Drop everything `requester` holds or waits for
    ///
    /// Returns the keys that were held. Pending acquires of the requester
    /// resolve with `LockCancelled`.
    pub fn release_all(&self, requester: &RequesterId) -> Vec<LockKey> {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;
        let lease = self.config.lease;
        let mut released = Vec::new();

        for (key, state) in keys.iter_mut() {
            let before = state.waiters.len();
            state.waiters.retain(|w| w.requester != *requester);
            stats.cancellations += (before - state.waiters.len()) as u64;

            if state.holder.as_ref().is_some_and(|h| h.requester == *requester) {
                state.holder = None;
                stats.releases += 1;
                Table::hand_off(key, state, sequence, stats, lease);
                released.push(key.clone());
            }
        }
        keys.retain(|_, state| !state.is_idle());

        if !released.is_empty() {
            info!(requester = %requester, count = released.len(), "Released locks of departed requester");
        }
        released
    }

    // ─────────────────────────────────────────────────────────────
    // Leases
    // ─────────────────────────────────────────────────────────────

    /// Reclaim every lock whose lease has run out. Returns how many.
    pub fn reap_expired(&self) -> usize {
        let mut table = self.table.lock();
        let Table { keys, sequence, stats } = &mut *table;
        let now = Instant::now();
        let mut reclaimed = 0;

        for (key, state) in keys.iter_mut() {
            if state.lease_expired(now) {
                Self::reclaim(key, state, sequence, stats, self.config.lease);
                reclaimed += 1;
            }
        }
        keys.retain(|_, state| !state.is_idle());
        reclaimed
    }

    /// Run [`reap_expired`](Self::reap_expired) every `interval` until the
    /// coordinator is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                let reclaimed = coordinator.reap_expired();
                if reclaimed > 0 {
                    debug!(reclaimed, "Reaper pass");
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────

    /// Current holder of `key`
    pub fn holder(&self, key: &LockKey) -> Option<RequesterId> {
        self.table
            .lock()
            .keys
            .get(key)
            .and_then(|s| s.holder.as_ref())
            .map(|h| h.requester.clone())
    }

    /// Number of requesters waiting for `key`
    pub fn queue_len(&self, key: &LockKey) -> usize {
        self.table
            .lock()
            .keys
            .get(key)
            .map_or(0, |s| s.waiters.len())
    }

    /// Number of keys currently held
    pub fn held_count(&self) -> usize {
        self.table
            .lock()
            .keys
            .values()
            .filter(|s| s.holder.is_some())
            .count()
    }

    pub fn stats(&self) -> LockStats {
        self.table.lock().stats.clone()
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new(LockCoordinatorConfig::default())
    }
}

/// Removes an abandoned waiter from the queue
struct WaitGuard<'a> {
    coordinator: &'a LockCoordinator,
    key: &'a LockKey,
    ticket: u64,
    rx: oneshot::Receiver<LockResponse>,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.coordinator.leave_queue(self.key, self.ticket, &mut self.rx) {
            WaitExit::Removed => {
                self.coordinator.table.lock().stats.cancellations += 1;
            }
            WaitExit::Granted(response) => {
                debug!(key = %self.key, grant_id = response.grant_id, "Grant raced with cancelled wait, passing on");
                self.coordinator.release_grant(self.key, response.grant_id);
            }
            WaitExit::Dropped => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
