//! Subsystem (component C12, added).
//!
//! A [`Subsystem`] is the process-wide (or, in tests, test-wide) owner of
//! the root [`Domain`]: everything else in the object graph -- buses,
//! endpoints, connections, sub-domains -- is reachable only by first going
//! through this handle or something it (transitively) created. Keeping this
//! as an explicit value rather than a global static is what lets each
//! integration test build its own isolated graph, matching the design note
//! in SPEC_FULL.md §9 that tests instantiate a fresh subsystem to avoid
//! cross-test interference.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::control::ControlHandle;
use crate::domain::Domain;
use crate::router::Router;

/// The default interval between reply-timeout sweeps, started by
/// [`Subsystem::spawn_timeout_sweeper`]. Chosen short enough that a
/// `timeout_ns` in the low hundreds of milliseconds still fires close to on
/// time, without adding meaningful overhead on an idle bus.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Process-/test-wide root handle.
pub struct Subsystem {
    root: Arc<Domain>,
}

impl Subsystem {
    /// Creates a fresh root [`Domain`] (name `"/"`), not shared with any
    /// other `Subsystem`.
    pub fn start() -> Self {
        Self { root: Domain::root() }
    }

    pub fn root(&self) -> &Arc<Domain> {
        &self.root
    }

    /// Opens a one-shot control handle against the root domain, the entry
    /// point for making the first bus or sub-domain.
    pub fn open_control(&self) -> ControlHandle {
        ControlHandle::new(self.root.clone())
    }

    /// Spawns a background task that periodically sweeps every bus
    /// reachable from `router`'s bus for expired pending replies, turning
    /// each into a synthetic timeout notice. The caller keeps the
    /// `JoinHandle` only to abort it at shutdown; this subsystem doesn't
    /// track it itself since a `Router` is scoped per-bus, not per-subsystem.
    pub fn spawn_timeout_sweeper(router: Arc<Router>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                router.sweep_timeouts();
            }
        })
    }

    /// Cascades a disconnect through every domain, bus, endpoint and
    /// connection reachable from the root, waking any blocked receivers
    /// with [`crate::error::BusError::Disconnected`]. Consumes `self`: a
    /// subsystem that has shut down has nothing left to hand out.
    pub fn shutdown(self) {
        self.root.disconnect();
    }
}
