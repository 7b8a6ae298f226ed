//! Sliding-window admission control keyed by client identity.
//!
//! Every identity owns the timestamps of its accepted requests inside the
//! trailing window. The read-prune-append sequence for one identity runs
//! under that identity's shard lock, so concurrent requests from the same
//! client never lose updates while unrelated clients proceed in parallel.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { retry_after_seconds: u64 },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug)]
pub struct AdmissionGate {
    max_requests: usize,
    window: chrono::Duration,
    max_tracked_clients: usize,
    clients: DashMap<String, Vec<DateTime<Utc>>>,
}

impl AdmissionGate {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: chrono::Duration::from_std(config.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            max_tracked_clients: config.max_tracked_clients,
            clients: DashMap::new(),
        }
    }

    pub fn admit(&self, client: &str) -> Admission {
        self.admit_at(client, Utc::now())
    }

    pub fn admit_at(&self, client: &str, now: DateTime<Utc>) -> Admission {
        let window_start = now - self.window;

        let admission = {
            let mut history = self.clients.entry(client.to_string()).or_default();
            history.retain(|timestamp| *timestamp > window_start);

            if history.len() >= self.max_requests {
                let reset_at = history
                    .iter()
                    .min()
                    .map(|oldest| *oldest + self.window)
                    .unwrap_or(now + self.window);
                Admission::Rejected {
                    retry_after_seconds: (reset_at - now).num_seconds().max(1) as u64,
                }
            } else {
                history.push(now);
                Admission::Admitted
            }
        };

        if let Admission::Rejected {
            retry_after_seconds,
        } = admission
        {
            info!(client, retry_after_seconds, "admission rejected");
        }

        if self.clients.len() > self.max_tracked_clients {
            self.sweep_at(now);
        }

        admission
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Drops identities whose history is empty once pruned, then evicts the
    /// least recently active identities while the map is over capacity.
    /// Returns the number of identities removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let window_start = now - self.window;
        let before = self.clients.len();

        self.clients.retain(|_, history| {
            history.retain(|timestamp| *timestamp > window_start);
            !history.is_empty()
        });

        let len = self.clients.len();
        if len > self.max_tracked_clients {
            let overflow = len - self.max_tracked_clients;
            let mut by_last_seen = self
                .clients
                .iter()
                .map(|entry| {
                    let last_seen = entry.value().iter().max().copied().unwrap_or(now);
                    (entry.key().clone(), last_seen)
                })
                .collect::<Vec<_>>();
            by_last_seen.sort_by_key(|(_, last_seen)| *last_seen);

            for (client, _) in by_last_seen.into_iter().take(overflow) {
                self.clients.remove(&client);
            }
        }

        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, remaining = self.clients.len(), "swept client histories");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gate.sweep_at(Utc::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn gate(max_requests: usize, window_seconds: u64, max_tracked_clients: usize) -> AdmissionGate {
        AdmissionGate::new(&RateLimitConfig {
            max_requests,
            window: Duration::from_secs(window_seconds),
            max_tracked_clients,
        })
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn rejects_past_limit_and_resumes_after_window() {
        let gate = gate(5, 300, 100);

        for _ in 0..5 {
            assert_eq!(gate.admit_at("a", at(0)), Admission::Admitted);
        }
        assert_eq!(
            gate.admit_at("a", at(1)),
            Admission::Rejected {
                retry_after_seconds: 299
            }
        );
        assert_eq!(gate.admit_at("a", at(301)), Admission::Admitted);
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let gate = gate(2, 10, 100);
        assert!(gate.admit_at("a", at(0)).is_admitted());
        assert!(gate.admit_at("a", at(5)).is_admitted());
        for second in 6..10 {
            assert!(!gate.admit_at("a", at(second)).is_admitted());
        }
        // Only the t=0 entry has left the window.
        assert!(gate.admit_at("a", at(11)).is_admitted());
        assert!(!gate.admit_at("a", at(12)).is_admitted());
    }

    #[test]
    fn clients_are_partitioned() {
        let gate = gate(1, 300, 100);
        assert!(gate.admit_at("a", at(0)).is_admitted());
        assert!(!gate.admit_at("a", at(1)).is_admitted());

        assert!(gate.admit_at("b", at(1)).is_admitted());
        assert!(!gate.admit_at("a", at(2)).is_admitted());
    }

    #[test]
    fn sweep_drops_idle_identities() {
        let gate = gate(3, 60, 100);
        gate.admit_at("idle", at(0));
        gate.admit_at("busy", at(100));

        assert_eq!(gate.sweep_at(at(120)), 1);
        assert_eq!(gate.tracked_clients(), 1);
        assert!(gate.admit_at("busy", at(121)).is_admitted());
    }

    #[test]
    fn capacity_evicts_least_recently_active() {
        let gate = gate(3, 600, 2);
        gate.admit_at("first", at(0));
        gate.admit_at("second", at(10));
        gate.admit_at("third", at(20));

        assert_eq!(gate.tracked_clients(), 2);
        assert!(!gate.clients.contains_key("first"));
        assert!(gate.clients.contains_key("third"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_from_one_client_never_exceed_limit() {
        let gate = Arc::new(gate(5, 300, 100));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.admit("shared").is_admitted() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
