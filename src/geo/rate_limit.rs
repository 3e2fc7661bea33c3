//! Process-wide FIFO gate for external calls.
//!
//! Callers enqueue a ticket and wait. A single drainer task releases tickets in
//! order, at most one per `interval`, sleeping the remainder since the previous
//! release. When the queue runs dry the drainer exits; the next enqueue starts a
//! fresh one. `running` guarantees there is never more than one drainer, and
//! only the drainer writes `last_dispatch`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Default)]
struct QueueState {
    tickets: VecDeque<oneshot::Sender<()>>,
    running: bool,
    last_dispatch: Option<Instant>,
    dispatched: u64,
}

#[derive(Clone)]
pub struct RateLimitQueue {
    interval: Duration,
    state: Arc<Mutex<QueueState>>,
}

impl RateLimitQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Tickets waiting for release.
    pub fn pending(&self) -> usize {
        self.state.lock().tickets.len()
    }

    /// Tickets released so far (abandoned tickets are not counted).
    pub fn dispatched(&self) -> u64 {
        self.state.lock().dispatched
    }

    /// Wait for this caller's turn. Dropping the future before it resolves gives
    /// the slot to the next ticket.
    pub async fn acquire(&self) {
        let (tx, rx) = oneshot::channel();
        let start_drainer = {
            let mut st = self.state.lock();
            st.tickets.push_back(tx);
            !std::mem::replace(&mut st.running, true)
        };
        if start_drainer {
            let this = self.clone();
            tokio::spawn(async move { this.drain().await });
        }
        // Sender dropped only if the drainer itself went away; proceed rather than hang.
        let _ = rx.await;
    }

    async fn drain(self) {
        loop {
            let wait = {
                let mut st = self.state.lock();
                if st.tickets.is_empty() {
                    st.running = false;
                    return;
                }
                st.last_dispatch
                    .map(|t| self.interval.saturating_sub(t.elapsed()))
                    .unwrap_or_default()
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let mut st = self.state.lock();
            while let Some(ticket) = st.tickets.pop_front() {
                if ticket.send(()).is_ok() {
                    st.last_dispatch = Some(Instant::now());
                    st.dispatched += 1;
                    break;
                }
            }
        }
    }
}
