use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::lease::LeaseStore;

/// Background lease refresher for one held lease.
///
/// Stopping is a channel send, so the thread wakes immediately instead of
/// finishing its sleep. Dropping the handle also stops it.
pub struct HeartbeatHandle {
    stop_tx: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl HeartbeatHandle {
    /// True once a heartbeat was refused, i.e. the lease is no longer ours.
    pub fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Cancel and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread did not finish in time; it is then left to
    /// exit on its own.
    pub fn stop(mut self, timeout: Duration) -> bool {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let Some(handle) = self.join_handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().is_ok()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

pub fn spawn_heartbeat(
    leases: Arc<dyn LeaseStore>,
    resource_id: &str,
    holder_id: &str,
    interval: Duration,
) -> HeartbeatHandle {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let lost = Arc::new(AtomicBool::new(false));
    let lost_flag = Arc::clone(&lost);
    let resource_id = resource_id.to_string();
    let holder_id = holder_id.to_string();

    let join_handle = thread::spawn(move || {
        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if !leases.heartbeat(&resource_id, &holder_id) {
                tracing::warn!(
                    task_id = %resource_id,
                    worker_id = %holder_id,
                    "heartbeat refused, lease lost"
                );
                lost_flag.store(true, Ordering::SeqCst);
                return;
            }
            tracing::trace!(task_id = %resource_id, "lease heartbeat");
        }
    });

    HeartbeatHandle {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
        lost,
    }
}
