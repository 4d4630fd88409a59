//! Waiting for the host stack to finish reading a device's GATT database.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transport::Transport;

/// Default interval between "services resolved" polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls a connected device until its services are resolved.
///
/// Only the timeout is authoritative: a failed query (the device dropped for
/// a moment) counts as "not yet resolved".
#[derive(Debug, Clone, Copy)]
pub struct ServiceResolutionWaiter {
    poll_interval: Duration,
}

impl Default for ServiceResolutionWaiter {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ServiceResolutionWaiter {
    /// Creates a waiter with a custom poll interval.
    #[must_use]
    pub const fn with_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// The poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits up to `timeout` for resolution.
    ///
    /// Returns `false` no earlier than `timeout` after the call when services
    /// never resolve.
    pub async fn wait(&self, transport: &dyn Transport, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;
        loop {
            polls += 1;
            match transport.is_services_resolved().await {
                Ok(true) => {
                    debug!(address = %transport.address(), polls, "Services resolved");
                    return true;
                }
                Ok(false) => {}
                Err(e) => trace!(address = %transport.address(), error = %e, "Resolution query failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(address = %transport.address(), polls, ?timeout, "Services not resolved before timeout");
                return false;
            }
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }
}
