//! Drain and shutdown coordination.
//!
//! A drain signal flips the listeners into "stop accepting", waits the
//! configured grace period, then waits (bounded) for in-flight connections
//! to finish before the process exits.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{broadcast, Notify};

/// Broadcast switch listeners subscribe to.
pub struct DrainSignal {
    tx: broadcast::Sender<()>,
    initiated: AtomicBool,
}

impl DrainSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            tx,
            initiated: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Begin draining. Idempotent.
    pub fn drain(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("drain initiated, no longer accepting connections");
            let _ = self.tx.send(());
        }
    }
}

impl Default for DrainSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts in-flight connections and lets the drain sequence wait for zero.
#[derive(Clone)]
pub struct ConnectionGauge {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ConnectionGauge {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Track one connection for as long as the returned guard lives.
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            gauge: self.clone(),
        }
    }

    /// Wait until every tracked connection is gone, or the timeout passes.
    /// Returns whether the pool went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() > 0 {
            let wait = self.idle.notified();
            if self.active() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return self.active() == 0;
            }
        }
        true
    }
}

impl Default for ConnectionGauge {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    gauge: ConnectionGauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.gauge.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gauge.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_idempotent_and_observable() {
        let signal = DrainSignal::new();
        let mut rx = signal.subscribe();

        assert!(!signal.is_draining());
        signal.drain();
        signal.drain();
        assert!(signal.is_draining());
        assert!(rx.try_recv().is_ok());
        // The second drain call did not broadcast again.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gauge_reaches_idle_when_guards_drop() {
        let gauge = ConnectionGauge::new();
        let g1 = gauge.track();
        let g2 = gauge.track();
        assert_eq!(gauge.active(), 2);

        let waiter = {
            let gauge = gauge.clone();
            tokio::spawn(async move { gauge.wait_idle(Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(g1);
        drop(g2);

        assert!(waiter.await.unwrap());
        assert_eq!(gauge.active(), 0);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_connections_remain() {
        let gauge = ConnectionGauge::new();
        let _guard = gauge.track();
        assert!(!gauge.wait_idle(Duration::from_millis(50)).await);
    }
}
