//! Request coalescing for tile computations.
//!
//! When several requests need the same tile while it is being computed, only
//! the first one (the leader) runs the computation; the others subscribe to
//! its result.
//!
//! ```text
//! get_tile A ─┐
//!             │                           leader task
//! get_tile B ─┼──► RequestCoalescer ────► gather + kernel
//!             │         │                      │
//! get_tile C ─┘         ▼                      ▼
//!               [B, C receive the        complete(key, result)
//!                leader's result] ◄────────────┘
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalescerStats {
    /// Total requests registered
    pub total_requests: u64,
    /// Requests that waited for an in-flight computation
    pub coalesced_requests: u64,
    /// Requests that started a computation
    pub new_requests: u64,
}

impl CoalescerStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

/// Outcome of registering a request.
#[derive(Debug)]
pub enum Registration<V> {
    /// No computation was in flight: the caller must compute and `complete`.
    Leader,
    /// Another request is computing; wait on the receiver.
    Waiter(broadcast::Receiver<V>),
}

/// Tracks in-flight computations by key.
pub struct RequestCoalescer<K, V> {
    in_flight: Mutex<HashMap<K, broadcast::Sender<V>>>,
    stats: Mutex<CoalescerStats>,
}

impl<K, V> RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CoalescerStats::default()),
        }
    }

    /// Register a request for `key`.
    pub async fn register(&self, key: &K) -> Registration<V> {
        let mut in_flight = self.in_flight.lock().await;
        let mut stats = self.stats.lock().await;

        stats.total_requests += 1;

        if let Some(tx) = in_flight.get(key) {
            stats.coalesced_requests += 1;
            debug!(
                key = ?key,
                coalesced = stats.coalesced_requests,
                "Coalescing request - waiting for in-flight computation"
            );
            Registration::Waiter(tx.subscribe())
        } else {
            // One message is ever sent per channel.
            let (tx, _rx) = broadcast::channel(1);
            in_flight.insert(key.clone(), tx);
            stats.new_requests += 1;
            debug!(
                key = ?key,
                in_flight_count = in_flight.len(),
                "New request - starting computation"
            );
            Registration::Leader
        }
    }

    /// Remove `key` from the in-flight map and broadcast `result` to waiters.
    pub async fn complete(&self, key: &K, result: V) {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(tx) = in_flight.remove(key) {
            let waiters = tx.receiver_count();
            // Receivers may have been dropped.
            let _ = tx.send(result);

            if waiters > 0 {
                debug!(key = ?key, waiters, "Broadcast result to coalesced waiters");
            }
        }
    }

    /// Returns a snapshot of the current statistics.
    pub async fn stats(&self) -> CoalescerStats {
        self.stats.lock().await.clone()
    }

    /// Returns the number of currently in-flight computations.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

impl<K, V> Default for RequestCoalescer<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_leads() {
        let coalescer: RequestCoalescer<u32, u32> = RequestCoalescer::new();
        assert!(matches!(coalescer.register(&1).await, Registration::Leader));
        assert_eq!(coalescer.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_waiters_receive_leader_result() {
        let coalescer: RequestCoalescer<u32, Result<u32, String>> = RequestCoalescer::new();
        assert!(matches!(coalescer.register(&7).await, Registration::Leader));

        let mut receivers = Vec::new();
        for _ in 0..3 {
            match coalescer.register(&7).await {
                Registration::Waiter(rx) => receivers.push(rx),
                Registration::Leader => panic!("second request must not lead"),
            }
        }

        coalescer.complete(&7, Err("boom".to_string())).await;
        for mut rx in receivers {
            assert_eq!(rx.recv().await.unwrap(), Err("boom".to_string()));
        }

        let stats = coalescer.stats().await;
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.coalesced_requests, 3);
        assert_eq!(stats.new_requests, 1);
        assert!((stats.coalescing_ratio() - 0.75).abs() < 1e-9);
        assert_eq!(coalescer.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_key_is_free_after_completion() {
        let coalescer: RequestCoalescer<&str, u8> = RequestCoalescer::new();
        assert!(matches!(coalescer.register(&"k").await, Registration::Leader));
        coalescer.complete(&"k", 1).await;
        assert!(matches!(coalescer.register(&"k").await, Registration::Leader));
    }
}
