//! Time and cancellation primitives shared by every waiting loop.
//!
//! Protocols never call `tokio::time` directly: they sleep through a [`Clock`] and check a
//! [`Shutdown`] signal at every sleep boundary. Tests run on tokio's paused clock, so
//! multi-second polling loops complete instantly while still observing the exact virtual
//! durations.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::watch::{Receiver, Sender, channel},
    time::Instant,
};

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] on top of the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returned when a wait was interrupted by its shutdown signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Receiving end of a one-way broadcast flag.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: Receiver<bool>,
    // held by `Shutdown::never` so the channel stays open
    _keepalive: Option<Arc<Sender<bool>>>,
}

/// Sending end of a [`Shutdown`] flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Self) {
        let (tx, rx) = channel(false);
        (
            ShutdownTrigger { tx },
            Self {
                rx,
                _keepalive: None,
            },
        )
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised. A dropped trigger counts as raised.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|b| *b).await;
    }

    /// Sleeps for `duration` unless the flag is raised first.
    pub async fn sleep(&mut self, clock: &dyn Clock, duration: Duration) -> Result<(), Cancelled> {
        if self.is_triggered() {
            return Err(Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = clock.sleep(duration) => Ok(()),
            _ = self.triggered() => Err(Cancelled),
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace succeeds even without receivers
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}
