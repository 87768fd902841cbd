//! Builders for GET/INFO, PUT, RPC and DISCOVER operations.
//!
//! A builder collects the PV name, pvRequest entries and callbacks, then
//! `exec()` validates the combination and hands the assembled operation
//! to the worker. The field-map PUT and the RPC argument list are
//! materialized here, so the operation machine only ever sees a builder
//! closure and an argument value.

use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::client::context::Core;
use crate::client::discovery::{Discovered, DiscoverFn, Discovery};
use crate::client::operation::{
    BuilderFn, DoneFn, InitFn, OpKind, OpResult, Operation, StartOp,
};
use crate::error::Error;
use crate::value::{Scalar, ScalarKind, Value};
use crate::worker::Worker;

/// Options shared by every operation builder.
struct CommonOpts {
    worker: Worker<Core>,
    name: String,
    server: Option<SocketAddr>,
    fields: Vec<String>,
    records: Vec<(String, String)>,
    raw_request: Option<Value>,
    defer_err: Option<Error>,
}

impl CommonOpts {
    fn new(worker: Worker<Core>, name: &str) -> CommonOpts {
        CommonOpts {
            worker,
            name: name.to_string(),
            server: None,
            fields: Vec::new(),
            records: Vec::new(),
            raw_request: None,
            defer_err: None,
        }
    }

    fn build_request(&self) -> Value {
        build_pv_request(&self.fields, &self.records, self.raw_request.as_ref())
    }
}

/// Compose the pvRequest structure: a `field` sub-structure naming the
/// requested fields plus `record._options` for any key/value options.
fn build_pv_request(
    fields: &[String],
    records: &[(String, String)],
    raw: Option<&Value>,
) -> Value {
    if let Some(raw) = raw {
        return raw.clone();
    }
    let mut field = Value::empty();
    for path in fields {
        ensure_path(&mut field, path);
    }
    let mut top = vec![("field".to_string(), field)];
    if !records.is_empty() {
        let options = records
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        top.push((
            "record".to_string(),
            Value::structure(
                "",
                vec![("_options".to_string(), Value::structure("", options))],
            ),
        ));
    }
    Value::structure("", top)
}

/// Create nested empty structures along a dotted path.
fn ensure_path(value: &mut Value, path: &str) {
    let mut cur = value;
    for part in path.split('.') {
        let Value::Struct { fields, .. } = cur else {
            return;
        };
        let idx = match fields.iter().position(|(n, _)| n == part) {
            Some(idx) => idx,
            None => {
                fields.push((part.to_string(), Value::empty()));
                fields.len() - 1
            }
        };
        cur = &mut fields[idx].1;
    }
}

/// Insertion-ordered field/value entries for field-map PUT and RPC
/// arguments.
#[derive(Default)]
struct FieldArgs {
    entries: Vec<(String, Scalar, bool)>,
}

impl FieldArgs {
    fn insert(&mut self, opts: &mut CommonOpts, name: &str, value: Scalar, required: bool) {
        if self.entries.iter().any(|(n, _, _)| n == name) {
            if opts.defer_err.is_none() {
                opts.defer_err = Some(Error::logic(format!(
                    "can't assign a second value to field '{name}'"
                )));
            }
            return;
        }
        self.entries.push((name.to_string(), value, required));
    }
}

/// Materialize the field map into a builder closure: walk the server
/// prototype by field path and copy each value in with conversion. A
/// required entry whose path is missing or whose conversion fails aborts
/// the put; others are skipped.
fn materialize(entries: Vec<(String, Scalar, bool)>) -> BuilderFn {
    Box::new(move |prototype: Value| {
        let mut ret = prototype.clone_empty();
        for (name, value, required) in entries {
            match ret.field_mut(&name) {
                Some(fld) => {
                    if let Err(e) = fld.assign_scalar(&value) {
                        if required {
                            return Err(e);
                        }
                    }
                }
                None if required => {
                    return Err(Error::Conversion(format!(
                        "server type missing required field '{name}'"
                    )));
                }
                None => {}
            }
        }
        Ok(ret)
    })
}

/// NTURI structure carrying the named arguments in insertion order. The
/// `path` member is filled in with the PV name at exec time.
fn uri_args(entries: &[(String, Scalar, bool)]) -> Value {
    let query = entries
        .iter()
        .map(|(name, value, _)| (name.clone(), Value::from(value.clone())))
        .collect();
    Value::structure(
        "epics:nt/NTURI:1.0",
        vec![
            ("scheme".to_string(), Value::from("pva")),
            ("path".to_string(), Value::scalar(ScalarKind::String)),
            ("query".to_string(), Value::structure("", query)),
        ],
    )
}

#[allow(clippy::too_many_arguments)]
async fn launch(
    mut opts: CommonOpts,
    kind: OpKind,
    builder: Option<BuilderFn>,
    rpc_arg: Option<Value>,
    on_init: Option<InitFn>,
    result: Option<DoneFn>,
    get_o_put: bool,
) -> Result<Operation, Error> {
    if let Some(err) = opts.defer_err.take() {
        return Err(err);
    }
    let (done, waiter) = match result {
        Some(done) => (done, None),
        None => {
            let (tx, rx) = oneshot::channel();
            let done: DoneFn = Box::new(move |result| {
                let _ = tx.send(result);
            });
            (done, Some(rx))
        }
    };
    let start = StartOp {
        name: opts.name.clone(),
        server: opts.server,
        kind,
        pv_request: opts.build_request(),
        builder,
        rpc_arg,
        on_init,
        done,
        get_o_put,
    };
    let worker = opts.worker;
    let (cid, id) = worker
        .call(move |core| core.start_op(start))
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::logic("context is closed"),
            other => other,
        })?;
    Ok(Operation::new(opts.name, worker, cid, id, waiter))
}

/// Prepare a GET (or INFO) operation. See [`crate::client::Context::get`].
pub struct GetBuilder {
    opts: CommonOpts,
    get: bool,
    result: Option<DoneFn>,
    on_init: Option<InitFn>,
}

impl GetBuilder {
    pub(crate) fn new(worker: Worker<Core>, name: &str, get: bool) -> GetBuilder {
        GetBuilder {
            opts: CommonOpts::new(worker, name),
            get,
            result: None,
            on_init: None,
        }
    }

    /// Add a field to the pvRequest.
    pub fn field(mut self, fld: &str) -> Self {
        self.opts.fields.push(fld.to_string());
        self
    }

    /// Add a key/value option to the pvRequest, e.g. `process`.
    pub fn record(mut self, name: &str, value: impl ToString) -> Self {
        self.opts.records.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the composed pvRequest wholesale.
    pub fn raw_request(mut self, req: Value) -> Self {
        self.opts.raw_request = Some(req);
        self
    }

    /// Pin the channel to a server address, bypassing the search.
    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.opts.server = Some(addr);
        self
    }

    /// Callback through which the result will be delivered, instead of
    /// [`Operation::wait`].
    pub fn result(mut self, cb: impl FnOnce(OpResult) + Send + 'static) -> Self {
        self.result = Some(Box::new(cb));
        self
    }

    /// Callback receiving the prototype delivered at INIT. Returning an
    /// error aborts the operation.
    pub fn on_init(
        mut self,
        cb: impl FnOnce(&Value) -> Result<(), Error> + Send + 'static,
    ) -> Self {
        self.on_init = Some(Box::new(cb));
        self
    }

    /// Execute the network operation. Dropping the returned handle
    /// cancels it.
    pub async fn exec(self) -> Result<Operation, Error> {
        let kind = if self.get { OpKind::Get } else { OpKind::Info };
        launch(self.opts, kind, None, None, self.on_init, self.result, false).await
    }
}

/// Prepare a PUT operation. See [`crate::client::Context::put`].
pub struct PutBuilder {
    opts: CommonOpts,
    do_get: bool,
    builder: Option<BuilderFn>,
    args: FieldArgs,
    result: Option<DoneFn>,
    on_init: Option<InitFn>,
}

impl PutBuilder {
    pub(crate) fn new(worker: Worker<Core>, name: &str) -> PutBuilder {
        PutBuilder {
            opts: CommonOpts::new(worker, name),
            do_get: true,
            builder: None,
            args: FieldArgs::default(),
            result: None,
            on_init: None,
        }
    }

    pub fn field(mut self, fld: &str) -> Self {
        self.opts.fields.push(fld.to_string());
        self
    }

    pub fn record(mut self, name: &str, value: impl ToString) -> Self {
        self.opts.records.push((name.to_string(), value.to_string()));
        self
    }

    pub fn raw_request(mut self, req: Value) -> Self {
        self.opts.raw_request = Some(req);
        self
    }

    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.opts.server = Some(addr);
        self
    }

    /// Whether the value passed to the builder is first initialized from
    /// the current server value (the default). Has no effect with the
    /// field-map form, which never depends on the current value.
    pub fn fetch_present(mut self, fetch: bool) -> Self {
        self.do_get = fetch;
        self
    }

    /// Assign `value` to the named field. Fails the put if the field is
    /// absent or the value inconvertible.
    pub fn set(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        let value = value.into();
        self.args.insert(&mut self.opts, name, value, true);
        self
    }

    /// Like [`PutBuilder::set`], but silently skipped when the field is
    /// absent or inconvertible.
    pub fn set_optional(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        let value = value.into();
        self.args.insert(&mut self.opts, name, value, false);
        self
    }

    /// Provide the builder callback producing the value to send, given
    /// the server prototype.
    pub fn build(
        mut self,
        cb: impl FnOnce(Value) -> Result<Value, Error> + Send + 'static,
    ) -> Self {
        self.builder = Some(Box::new(cb));
        self
    }

    pub fn result(mut self, cb: impl FnOnce(OpResult) + Send + 'static) -> Self {
        self.result = Some(Box::new(cb));
        self
    }

    pub fn on_init(
        mut self,
        cb: impl FnOnce(&Value) -> Result<(), Error> + Send + 'static,
    ) -> Self {
        self.on_init = Some(Box::new(cb));
        self
    }

    pub async fn exec(mut self) -> Result<Operation, Error> {
        if self.builder.is_none() && self.args.entries.is_empty() {
            return Err(Error::logic(
                "put() needs either a .build() or at least one .set()",
            ));
        }
        let builder = match self.builder {
            Some(builder) => builder,
            None => {
                // the field map does not use the current value
                self.do_get = false;
                materialize(self.args.entries)
            }
        };
        launch(
            self.opts,
            OpKind::Put,
            Some(builder),
            None,
            self.on_init,
            self.result,
            self.do_get,
        )
        .await
    }
}

/// Prepare an RPC operation. See [`crate::client::Context::rpc`].
pub struct RpcBuilder {
    opts: CommonOpts,
    argument: Option<Value>,
    args: FieldArgs,
    result: Option<DoneFn>,
    on_init: Option<InitFn>,
}

impl RpcBuilder {
    pub(crate) fn new(worker: Worker<Core>, name: &str) -> RpcBuilder {
        RpcBuilder {
            opts: CommonOpts::new(worker, name),
            argument: None,
            args: FieldArgs::default(),
            result: None,
            on_init: None,
        }
    }

    pub fn field(mut self, fld: &str) -> Self {
        self.opts.fields.push(fld.to_string());
        self
    }

    pub fn record(mut self, name: &str, value: impl ToString) -> Self {
        self.opts.records.push((name.to_string(), value.to_string()));
        self
    }

    pub fn raw_request(mut self, req: Value) -> Self {
        self.opts.raw_request = Some(req);
        self
    }

    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.opts.server = Some(addr);
        self
    }

    /// Add a named argument, collected into an NTURI query structure.
    pub fn arg(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        let value = value.into();
        self.args.insert(&mut self.opts, name, value, true);
        self
    }

    /// Provide the complete argument structure instead of named
    /// arguments. Mutually exclusive with [`RpcBuilder::arg`].
    pub fn argument(mut self, arg: Value) -> Self {
        self.argument = Some(arg);
        self
    }

    pub fn result(mut self, cb: impl FnOnce(OpResult) + Send + 'static) -> Self {
        self.result = Some(Box::new(cb));
        self
    }

    /// Callback invoked once the operation is initialized. RPC replies
    /// carry no prototype, so the value passed is empty.
    pub fn on_init(
        mut self,
        cb: impl FnOnce(&Value) -> Result<(), Error> + Send + 'static,
    ) -> Self {
        self.on_init = Some(Box::new(cb));
        self
    }

    pub async fn exec(self) -> Result<Operation, Error> {
        if self.argument.is_some() && !self.args.entries.is_empty() {
            return Err(Error::logic(
                "rpc() with an argument and builder .arg() are mutually exclusive",
            ));
        }
        let rpc_arg = match self.argument {
            Some(arg) => Some(arg),
            None if !self.args.entries.is_empty() => {
                let mut uri = uri_args(&self.args.entries);
                uri.set("path", self.opts.name.as_str())?;
                Some(uri)
            }
            None => None,
        };
        launch(
            self.opts,
            OpKind::Rpc,
            None,
            rpc_arg,
            self.on_init,
            self.result,
            false,
        )
        .await
    }
}

/// Prepare a server discovery. See [`crate::client::Context::discover`].
pub struct DiscoverBuilder {
    worker: Worker<Core>,
    notify: Option<DiscoverFn>,
}

impl DiscoverBuilder {
    pub(crate) fn new(worker: Worker<Core>) -> DiscoverBuilder {
        DiscoverBuilder {
            worker,
            notify: None,
        }
    }

    /// Callback receiving each discovered server, on the worker. Must
    /// not block.
    pub fn notify(mut self, cb: impl FnMut(Discovered) + Send + 'static) -> Self {
        self.notify = Some(Box::new(cb));
        self
    }

    pub async fn exec(self) -> Result<Discovery, Error> {
        let notify = self
            .notify
            .ok_or_else(|| Error::logic("discover() requires a notify callback"))?;
        let worker = self.worker;
        let id = worker
            .call(move |core| core.start_discover(notify))
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::logic("context is closed"),
                other => other,
            })?;
        Ok(Discovery::new(worker, id))
    }
}
