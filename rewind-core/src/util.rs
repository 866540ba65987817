use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

pub const NET_CONNECT_TIMEOUT: Duration = Duration::from_millis(8 * 1000);

pub const NET_IO_TIMEOUT: Duration = Duration::from_millis(16 * 1000);

pub fn default_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(NET_CONNECT_TIMEOUT)
        .timeout_read(NET_IO_TIMEOUT)
        .timeout_write(NET_IO_TIMEOUT)
        .build()
}

/// Shared flag marking an in-flight operation as superseded.  Long-running
/// work checks it between steps and bails out with `Error::Aborted`.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
