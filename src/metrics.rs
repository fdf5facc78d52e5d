use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Process-scoped delivery counters. Cloning shares the underlying counters.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    messages_enqueued: AtomicU64,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_dead_lettered: AtomicU64,
    auth_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_enqueued_total: u64,
    pub messages_sent_total: u64,
    pub messages_failed_total: u64,
    pub messages_dead_lettered_total: u64,
    pub auth_failures_total: u64,
}

impl Metrics {
    pub fn inc_enqueued(&self) {
        self.inner.messages_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.inner.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dead_lettered(&self) {
        self.inner
            .messages_dead_lettered
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_failures(&self) {
        self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_enqueued_total: self.inner.messages_enqueued.load(Ordering::Relaxed),
            messages_sent_total: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_failed_total: self.inner.messages_failed.load(Ordering::Relaxed),
            messages_dead_lettered_total: self
                .inner
                .messages_dead_lettered
                .load(Ordering::Relaxed),
            auth_failures_total: self.inner.auth_failures.load(Ordering::Relaxed),
        }
    }
}
