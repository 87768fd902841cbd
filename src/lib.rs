//! Rust implementation of the EPICS PV Access (PVA) client protocol.
//!
//! This crate is a pure-rust client for the [PV Access protocol]. It does
//! not depend on the C++ [pvxs] or [epics-base] projects at all.
//!
//! The heart of the crate is the per-operation state machine driving
//! typed GET/PUT/RPC requests over a stateful, IOID-multiplexed TCP
//! connection, together with server discovery over UDP search. All
//! protocol state is owned by one worker task per [`client::Context`];
//! the public API hands work to it and awaits completions, so no locks
//! guard operation state anywhere.
//!
//! [PV Access protocol]:
//!     https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [pvxs]: https://github.com/epics-base/pvxs
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod client;
pub mod config;
mod error;
mod utils;
pub mod value;
pub mod wire;
mod worker;

pub use config::Config;
pub use error::Error;
