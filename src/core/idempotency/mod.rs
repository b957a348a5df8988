// src/core/idempotency/mod.rs

//! The at-most-once idempotency channel: deduplicates retried client
//! requests by `(channel_id, req_id)` and caches the finished responses so
//! a retry after connection loss observes the original result.
//!
//! The task that creates a channel is its *holder*; tasks that bind with
//! the `(id, key)` pair are *users*. A holder disconnect invalidates the
//! channel but keeps it around for the reserve interval so the client can
//! rebind; a wrong key on rebind is rejected.

use crate::core::SliceStoreError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of independently locked stripes the channel table is split across.
const CHANNEL_STRIPES: usize = 16;

/// The cached result of a finished mutating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedReply {
    pub status: u16,
    pub done_bytes: u32,
    pub inc_alloc: i64,
}

/// What the channel already knows about a request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the caller owns processing it.
    Fresh,
    /// A previous attempt is still being processed.
    InFlight,
    /// Processed before; here is the original reply.
    Finished(FinishedReply),
}

#[derive(Debug)]
struct ChannelRequests {
    in_flight: HashSet<u64>,
    finished: HashMap<u64, (FinishedReply, Instant)>,
    last_used: Instant,
}

/// One client's dedup context.
#[derive(Debug)]
pub struct Channel {
    pub id: u32,
    /// Server-assigned secret; must match on rebind.
    pub key: u32,
    is_valid: AtomicBool,
    requests: Mutex<ChannelRequests>,
}

impl Channel {
    fn new(id: u32, key: u32) -> Self {
        Self {
            id,
            key,
            is_valid: AtomicBool::new(true),
            requests: Mutex::new(ChannelRequests {
                in_flight: HashSet::new(),
                finished: HashMap::new(),
                last_used: Instant::now(),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid.load(Ordering::Acquire)
    }

    /// Atomically admits a request id, reporting any earlier attempt.
    pub fn begin(&self, req_id: u64) -> Admission {
        let mut requests = self.requests.lock();
        requests.last_used = Instant::now();
        if let Some((reply, _)) = requests.finished.get(&req_id) {
            return Admission::Finished(*reply);
        }
        if !requests.in_flight.insert(req_id) {
            return Admission::InFlight;
        }
        Admission::Fresh
    }

    /// Moves a request from in-flight to finished, caching its reply.
    pub fn finish(&self, req_id: u64, reply: FinishedReply) {
        let mut requests = self.requests.lock();
        requests.in_flight.remove(&req_id);
        requests.finished.insert(req_id, (reply, Instant::now()));
    }

    /// Drops an admission that never completed (e.g. the handler bailed
    /// before reaching a worker).
    pub fn abandon(&self, req_id: u64) {
        self.requests.lock().in_flight.remove(&req_id);
    }

    /// Removes a finished entry the client has acknowledged receiving.
    pub fn remove_receipt(&self, req_id: u64) -> bool {
        self.requests.lock().finished.remove(&req_id).is_some()
    }

    fn prune_finished(&self, reserve: Duration, now: Instant) {
        self.requests
            .lock()
            .finished
            .retain(|_, (_, at)| now.duration_since(*at) < reserve);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.requests.lock().last_used)
    }
}

/// The striped table of all live channels.
pub struct ChannelTable {
    stripes: Vec<Mutex<HashMap<u32, Arc<Channel>>>>,
    next_id: AtomicU32,
    count: AtomicUsize,
    max_channels: usize,
    reserve_interval: Duration,
}

impl ChannelTable {
    pub fn new(max_channels: usize, reserve_interval: Duration) -> Self {
        Self {
            stripes: (0..CHANNEL_STRIPES)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_id: AtomicU32::new(1),
            count: AtomicUsize::new(0),
            max_channels,
            reserve_interval,
        }
    }

    fn stripe(&self, channel_id: u32) -> &Mutex<HashMap<u32, Arc<Channel>>> {
        &self.stripes[(channel_id as usize) % CHANNEL_STRIPES]
    }

    /// Creates a channel with a fresh server-assigned key. The caller
    /// becomes its holder. `Busy` when the table is full.
    pub fn setup(&self) -> Result<Arc<Channel>, SliceStoreError> {
        if self.count.load(Ordering::Acquire) >= self.max_channels {
            return Err(SliceStoreError::Busy(
                "idempotency channel table is full".into(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let key: u32 = rand::thread_rng().r#gen();
        let channel = Arc::new(Channel::new(id, key));
        self.stripe(id).lock().insert(id, channel.clone());
        self.count.fetch_add(1, Ordering::AcqRel);
        debug!("idempotency channel {} set up", id);
        Ok(channel)
    }

    /// Looks up a channel for a user task, verifying the secret and
    /// restoring validity after a holder disconnect.
    pub fn rebind(&self, channel_id: u32, key: u32) -> Result<Arc<Channel>, SliceStoreError> {
        let stripe = self.stripe(channel_id).lock();
        let channel = stripe.get(&channel_id).ok_or_else(|| {
            SliceStoreError::ChannelInvalid(format!("channel {channel_id} does not exist"))
        })?;
        if channel.key != key {
            return Err(SliceStoreError::ChannelInvalid(format!(
                "key mismatch for channel {channel_id}"
            )));
        }
        channel.is_valid.store(true, Ordering::Release);
        Ok(channel.clone())
    }

    /// Explicitly closes and removes a channel.
    pub fn close(&self, channel_id: u32) -> Result<(), SliceStoreError> {
        let removed = self.stripe(channel_id).lock().remove(&channel_id);
        match removed {
            Some(_) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                debug!("idempotency channel {} closed", channel_id);
                Ok(())
            }
            None => Err(SliceStoreError::NotFound(format!(
                "channel {channel_id} does not exist"
            ))),
        }
    }

    /// Marks a channel invalid when its holder task disconnects. The
    /// channel survives for the reserve interval so the client can rebind.
    pub fn invalidate(&self, channel_id: u32) {
        if let Some(channel) = self.stripe(channel_id).lock().get(&channel_id) {
            channel.is_valid.store(false, Ordering::Release);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Evicts channels idle past the reserve interval and prunes finished
    /// entries past their retention. Run by the background pruner.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut evicted = 0usize;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            stripe.retain(|_, channel| {
                channel.prune_finished(self.reserve_interval, now);
                let keep = channel.idle_for(now) < self.reserve_interval;
                if !keep {
                    evicted += 1;
                }
                keep
            });
        }
        if evicted > 0 {
            self.count.fetch_sub(evicted, Ordering::AcqRel);
            debug!("pruned {} idle idempotency channels", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ChannelTable {
        ChannelTable::new(16, Duration::from_secs(3600))
    }

    #[test]
    fn duplicate_request_sees_cached_reply() {
        let table = table();
        let channel = table.setup().unwrap();

        assert_eq!(channel.begin(42), Admission::Fresh);
        assert_eq!(channel.begin(42), Admission::InFlight);

        let reply = FinishedReply {
            status: 0,
            done_bytes: 100,
            inc_alloc: 100,
        };
        channel.finish(42, reply);
        assert_eq!(channel.begin(42), Admission::Finished(reply));
    }

    #[test]
    fn rebind_checks_the_key() {
        let table = table();
        let channel = table.setup().unwrap();
        table.invalidate(channel.id);
        assert!(!channel.is_valid());

        assert!(matches!(
            table.rebind(channel.id, channel.key.wrapping_add(1)),
            Err(SliceStoreError::ChannelInvalid(_))
        ));

        let rebound = table.rebind(channel.id, channel.key).unwrap();
        assert!(rebound.is_valid());
    }

    #[test]
    fn full_table_reports_busy() {
        let table = ChannelTable::new(1, Duration::from_secs(3600));
        table.setup().unwrap();
        assert!(matches!(table.setup(), Err(SliceStoreError::Busy(_))));
    }

    #[test]
    fn receipt_removes_finished_entry() {
        let table = table();
        let channel = table.setup().unwrap();
        channel.begin(7);
        channel.finish(
            7,
            FinishedReply {
                status: 0,
                done_bytes: 1,
                inc_alloc: 1,
            },
        );
        assert!(channel.remove_receipt(7));
        assert!(!channel.remove_receipt(7));
        // After the receipt the id is fresh again.
        assert_eq!(channel.begin(7), Admission::Fresh);
    }

    #[test]
    fn close_removes_the_channel() {
        let table = table();
        let channel = table.setup().unwrap();
        assert_eq!(table.channel_count(), 1);
        table.close(channel.id).unwrap();
        assert_eq!(table.channel_count(), 0);
        assert!(table.rebind(channel.id, channel.key).is_err());
    }
}
