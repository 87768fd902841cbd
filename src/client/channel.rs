use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::client::operation::Gpr;

/// Channel lifecycle. Operations may only be issued while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Waiting for a server to claim the name.
    Searching,
    /// Waiting for the connection to become ready.
    Connecting,
    /// Waiting for the CREATE_CHANNEL reply.
    Creating,
    Active,
}

/// One named PV on (at most) one connection.
///
/// The channel is the owning side of the operation tables: `ops` holds
/// every live operation, and removal from it is the only way an
/// operation dies. The connection's IOID registry refers back into this
/// table by operation id.
pub(crate) struct Channel {
    pub cid: u32,
    pub name: String,
    pub state: ChannelState,
    /// Pinned server address, bypassing the search phase.
    pub fixed_server: Option<SocketAddr>,
    pub conn: Option<u64>,
    pub sid: u32,
    /// Searches sent so far, drives the retry backoff.
    pub n_search: u32,
    pub next_search_at: Instant,
    /// Operations awaiting (re)creation, in issue order.
    pub pending: Vec<u64>,
    pub ops: HashMap<u64, Gpr>,
    pub op_by_ioid: HashMap<u32, u64>,
}

impl Channel {
    pub fn new(cid: u32, name: String, fixed_server: Option<SocketAddr>) -> Channel {
        Channel {
            cid,
            name,
            state: ChannelState::Searching,
            fixed_server,
            conn: None,
            sid: 0,
            n_search: 0,
            next_search_at: Instant::now(),
            pending: Vec::new(),
            ops: HashMap::new(),
            op_by_ioid: HashMap::new(),
        }
    }

    /// Seconds until the next search attempt, doubling up to half a
    /// minute.
    pub fn search_backoff(&self) -> u64 {
        2u64.saturating_pow(self.n_search.min(5)).min(30)
    }
}
