use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::layout::Layout;

/// Cooperative stop signal for the master and worker loops.
///
/// Set by SIGINT/SIGTERM or by the `stop` file that `hive down` writes. Loops
/// check it between iterations, so the current iteration always finishes.
///
/// A stop file last modified before this process started belongs to an
/// earlier `down` and is ignored.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    layout: Layout,
    started: SystemTime,
}

impl Shutdown {
    pub fn new(layout: Layout) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            layout,
            started: whole_seconds(SystemTime::now()),
        }
    }

    /// Route SIGINT and SIGTERM into this signal.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            tracing::info!("received interrupt, finishing current iteration");
            flag.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if self.stop_file_is_current() {
            tracing::info!("stop file present, shutting down");
            self.flag.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn stop_file_is_current(&self) -> bool {
        match fs::metadata(self.layout.stop_file()) {
            Ok(meta) => meta.modified().map_or(true, |at| at >= self.started),
            Err(_) => false,
        }
    }
}

/// Truncate to the second, so filesystems with coarse mtimes still see a stop
/// file written right after start as current.
fn whole_seconds(at: SystemTime) -> SystemTime {
    let secs = at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    UNIX_EPOCH + Duration::from_secs(secs)
}
