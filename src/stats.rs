//! Shared per-session counters and the send-latency histogram.
//!
//! Write loops update counters lock-free; the Prometheus exporter and the
//! console summary read a snapshot of the whole registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hdrhistogram::Histogram;

/// Cumulative counters for one client session.
#[derive(Default)]
pub struct SessionCounters {
    bytes: AtomicU64,
    sends: AtomicU64,
    echo_mismatches: AtomicU64,
    finished: AtomicBool,
}

impl SessionCounters {
    pub fn on_send(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::SeqCst);
        self.sends.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_echo_mismatch(&self) {
        self.echo_mismatches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// Map of session label (local address) to counters, plus one histogram of
/// per-send write latencies across all sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionCounters>>>,
    latency: Mutex<Histogram<u64>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            latency: Mutex::new(Histogram::new(3).unwrap()),
        }
    }
}

impl SessionRegistry {
    /// Registers a session and hands back its counters. Re-registering the
    /// same label resets that session's counters.
    pub fn register(&self, session: impl Into<String>) -> Arc<SessionCounters> {
        let counters = Arc::new(SessionCounters::default());
        self.sessions
            .lock()
            .unwrap()
            .insert(session.into(), counters.clone());
        counters
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .record(latency.as_micros() as u64)
            .unwrap();
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(session, counters)| SessionSnapshot {
                session: session.clone(),
                bytes: counters.bytes.load(Ordering::SeqCst),
                sends: counters.sends.load(Ordering::SeqCst),
                echo_mismatches: counters.echo_mismatches.load(Ordering::SeqCst),
                finished: counters.finished.load(Ordering::SeqCst),
            })
            .collect();
        sessions.sort_by(|a, b| a.session.cmp(&b.session));

        let latency = {
            let hist = self.latency.lock().unwrap();
            LatencySummary {
                count: hist.len(),
                mean: Duration::from_micros(hist.mean() as u64),
                p50: Duration::from_micros(hist.value_at_quantile(0.50)),
                p90: Duration::from_micros(hist.value_at_quantile(0.90)),
                p99: Duration::from_micros(hist.value_at_quantile(0.99)),
                max: Duration::from_micros(hist.max()),
            }
        };

        Snapshot { sessions, latency }
    }
}

pub struct Snapshot {
    pub sessions: Vec<SessionSnapshot>,
    pub latency: LatencySummary,
}

pub struct SessionSnapshot {
    pub session: String,
    pub bytes: u64,
    pub sends: u64,
    pub echo_mismatches: u64,
    pub finished: bool,
}

pub struct LatencySummary {
    pub count: u64,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Snapshot {
    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.finished).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.sessions.iter().map(|s| s.bytes).sum()
    }

    pub fn total_sends(&self) -> u64 {
        self.sessions.iter().map(|s| s.sends).sum()
    }

    pub fn total_echo_mismatches(&self) -> u64 {
        self.sessions.iter().map(|s| s.echo_mismatches).sum()
    }

    pub fn print(&self) {
        println!(
            "{} sessions ({} active) │ {} sends │ {} bytes │ {} echo mismatches",
            self.sessions.len(),
            self.active_sessions(),
            self.total_sends(),
            self.total_bytes(),
            self.total_echo_mismatches(),
        );
        for s in &self.sessions {
            println!("  {:<24} {:>12} bytes {:>8} sends", s.session, s.bytes, s.sends);
        }
        if self.latency.count > 0 {
            println!(
                "send latency: mean {:.2?} │ p50 {:.2?} │ p90 {:.2?} │ p99 {:.2?} │ max {:.2?}",
                self.latency.mean,
                self.latency.p50,
                self.latency.p90,
                self.latency.p99,
                self.latency.max,
            );
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = SessionRegistry::default();
        let a = registry.register("127.0.0.1:1111");
        let b = registry.register("127.0.0.1:2222");

        a.on_send(10);
        a.on_send(10);
        b.on_send(7);
        b.on_echo_mismatch();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.sessions.len(), 2);
        assert_eq!(snapshot.total_bytes(), 27);
        assert_eq!(snapshot.total_sends(), 3);
        assert_eq!(snapshot.total_echo_mismatches(), 1);
    }

    #[test]
    fn finish_drops_active_count() {
        let registry = SessionRegistry::default();
        let a = registry.register("a");
        let _b = registry.register("b");

        assert_eq!(registry.snapshot().active_sessions(), 2);
        a.finish();
        assert_eq!(registry.snapshot().active_sessions(), 1);
    }

    #[test]
    fn latency_summary_tracks_recordings() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.snapshot().latency.count, 0);

        registry.record_latency(Duration::from_millis(1));
        registry.record_latency(Duration::from_millis(3));

        let latency = registry.snapshot().latency;
        assert_eq!(latency.count, 2);
        assert!(latency.max >= Duration::from_millis(2));
        assert!(latency.p50 >= Duration::from_micros(900));
    }

    #[test]
    fn reregistering_resets_counters() {
        let registry = SessionRegistry::default();
        let first = registry.register("s");
        first.on_send(100);

        registry.register("s");
        assert_eq!(registry.snapshot().total_bytes(), 0);
    }

    #[test]
    fn snapshot_sessions_sorted() {
        let registry = SessionRegistry::default();
        registry.register("b");
        registry.register("a");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.sessions[0].session, "a");
        assert_eq!(snapshot.sessions[1].session, "b");
    }
}
