//! Server discovery: periodic reply-required searches with a bounded
//! backoff, delivering each responding server to registered callbacks.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::client::context::Core;
use crate::error::Error;
use crate::worker::Worker;

/// Server instance identifier carried in search replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 12]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// One discovered server, delivered on the worker.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub guid: Guid,
    pub server: SocketAddr,
}

pub(crate) type DiscoverFn = Box<dyn FnMut(Discovered) + Send>;

impl Core {
    pub(crate) fn start_discover(&mut self, notify: DiscoverFn) -> u64 {
        let id = self.next_op;
        self.next_op += 1;
        let first = self.discoverers.is_empty();
        self.discoverers.insert(id, notify);
        if first {
            debug!("Starting discover");
            self.discover_age = 0;
            self.tick_discover();
        }
        id
    }

    pub(crate) fn cancel_discover(&mut self, id: u64) -> bool {
        self.discoverers.remove(&id).is_some()
    }

    /// Age grows each tick and bounds the interval at 10s. The timer
    /// dies by itself once the last discoverer is removed, so
    /// cancellation never races a tick.
    pub(crate) fn tick_discover(&mut self) {
        if self.discoverers.is_empty() {
            return;
        }
        if self.discover_age < 10 {
            self.discover_age += 1;
        }
        self.worker
            .dispatch_after(Duration::from_secs(self.discover_age), |core| {
                core.tick_discover()
            });
        self.send_search(Vec::new(), true);
    }

    pub(crate) fn notify_discoverers(&mut self, server: SocketAddr, guid: [u8; 12]) {
        if self.discoverers.is_empty() {
            return;
        }
        let event = Discovered {
            guid: Guid(guid),
            server,
        };
        debug!("Discovered server {} {}", event.server, event.guid);
        for notify in self.discoverers.values_mut() {
            notify(event.clone());
        }
    }
}

/// Handle to an active discovery. Dropping it stops delivery.
pub struct Discovery {
    worker: Worker<Core>,
    id: u64,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery").field("id", &self.id).finish()
    }
}

impl Discovery {
    pub(crate) fn new(worker: Worker<Core>, id: u64) -> Discovery {
        Discovery { worker, id }
    }

    /// Stop the discovery. Returns true if it was still registered.
    pub async fn cancel(self) -> Result<bool, Error> {
        let (worker, id) = (self.worker.clone(), self.id);
        worker.call(move |core| core.cancel_discover(id)).await
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        let id = self.id;
        self.worker.dispatch(move |core| {
            core.cancel_discover(id);
        });
    }
}
