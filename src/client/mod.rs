//! PVA client: typed remote operations against named PVs.
//!
//! A [`Context`] owns one worker task holding all protocol state.
//! Operations are prepared with builders and executed asynchronously:
//!
//! ```no_run
//! # async fn demo() -> Result<(), pvars::Error> {
//! use pvars::client::Context;
//! use pvars::Config;
//!
//! let ctx = Context::new(Config::from_env())?;
//! let reply = ctx.get("some:pv").exec().await?.wait().await?;
//! println!("value: {:?}", reply.value.get("value"));
//!
//! ctx.put("some:pv").set("value", 7.0).exec().await?.wait().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod channel;
mod connection;
mod context;
mod discovery;
mod operation;
#[cfg(test)]
mod tests;

pub use builder::{DiscoverBuilder, GetBuilder, PutBuilder, RpcBuilder};
pub use discovery::{Discovered, Discovery, Guid};
pub use operation::{OpResult, Operation, Reply};

use crate::config::Config;
use crate::error::Error;
use crate::worker::Worker;
use context::Core;

/// An independent PVA client instance.
///
/// Dropping the context stops its worker; operations still in flight
/// complete with [`Error::Cancelled`].
pub struct Context {
    worker: Worker<Core>,
}

impl Context {
    /// Create a new client. Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Context, Error> {
        let worker = context::start(config)?;
        Ok(Context { worker })
    }

    /// Request the present value of a PV.
    pub fn get(&self, name: &str) -> GetBuilder {
        GetBuilder::new(self.worker.clone(), name, true)
    }

    /// Request type information for a PV. The result value carries no
    /// data.
    pub fn info(&self, name: &str) -> GetBuilder {
        GetBuilder::new(self.worker.clone(), name, false)
    }

    /// Request a change to a PV.
    pub fn put(&self, name: &str) -> PutBuilder {
        PutBuilder::new(self.worker.clone(), name)
    }

    /// Execute a stateless remote procedure call.
    pub fn rpc(&self, name: &str) -> RpcBuilder {
        RpcBuilder::new(self.worker.clone(), name)
    }

    /// Watch for servers answering discovery searches.
    pub fn discover(&self) -> DiscoverBuilder {
        DiscoverBuilder::new(self.worker.clone())
    }

    /// Request prompt re-search of any disconnected channels, e.g. after
    /// issuing a batch of operations.
    pub fn hurry_up(&self) {
        self.worker.dispatch(|core| core.hurry_up());
    }

    /// Stop the client. Equivalent to dropping it.
    pub fn close(self) {}

    #[cfg(test)]
    pub(crate) fn worker(&self) -> &Worker<Core> {
        &self.worker
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}
