//! Per-operation state machine for GET, PUT, RPC and INFO, and the
//! shared reply handler that drives it.

use std::net::SocketAddr;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::client::channel::ChannelState;
use crate::client::connection::RequestInfo;
use crate::client::context::Core;
use crate::error::Error;
use crate::value::Value;
use crate::wire::{
    CMD_DESTROY_REQUEST, CMD_GET, CMD_GET_FIELD, CMD_PUT, CMD_RPC, Frame, RxBuf, SUBCMD_EXEC,
    SUBCMD_GET, SUBCMD_INIT, from_wire_full, from_wire_type, from_wire_valid, read_status,
    to_wire_full, to_wire_type, to_wire_valid,
};
use crate::worker::Worker;

/// Operation kinds, by protocol command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Get,
    Put,
    Rpc,
    Info,
}

impl OpKind {
    pub fn cmd(self) -> u8 {
        match self {
            OpKind::Get => CMD_GET,
            OpKind::Put => CMD_PUT,
            OpKind::Rpc => CMD_RPC,
            OpKind::Info => CMD_GET_FIELD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Queued on the channel's pending list, no IOID issued yet.
    Connecting,
    /// INIT sent, awaiting the reply carrying the prototype.
    Creating,
    /// GET subcommand sent to fetch the current value (PUT only).
    GetOPut,
    /// Transient: running the user builder to produce the PUT value.
    BuildPut,
    /// Execution subcommand sent, awaiting the final reply.
    Exec,
    /// GET_FIELD sent, awaiting the reply (INFO only).
    Waiting,
    Done,
}

pub(crate) type BuilderFn = Box<dyn FnOnce(Value) -> Result<Value, Error> + Send>;
pub(crate) type InitFn = Box<dyn FnOnce(&Value) -> Result<(), Error> + Send>;
pub(crate) type DoneFn = Box<dyn FnOnce(OpResult) + Send>;

/// A successful operation result.
#[derive(Debug)]
pub struct Reply {
    pub value: Value,
    /// Peer address string of the server that answered.
    pub peer: String,
}

pub type OpResult = Result<Reply, Error>;

/// One in-flight operation, owned by its channel's operation table.
pub(crate) struct Gpr {
    pub kind: OpKind,
    pub state: OpState,
    pub ioid: Option<u32>,
    pub pv_request: Value,
    pub builder: Option<BuilderFn>,
    pub rpc_arg: Option<Value>,
    pub on_init: Option<InitFn>,
    pub done: Option<DoneFn>,
    pub get_o_put: bool,
    pub result: Option<OpResult>,
}

/// Invoke the completion callback exactly once.
pub(crate) fn notify(op: &mut Gpr) {
    if let Some(done) = op.done.take() {
        let result = op.result.take().unwrap_or(Err(Error::Cancelled));
        done(result);
    }
}

/// Everything needed to start an operation on the worker.
pub(crate) struct StartOp {
    pub name: String,
    pub server: Option<SocketAddr>,
    pub kind: OpKind,
    pub pv_request: Value,
    pub builder: Option<BuilderFn>,
    pub rpc_arg: Option<Value>,
    pub on_init: Option<InitFn>,
    pub done: DoneFn,
    pub get_o_put: bool,
}

/// What the reply handler asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GprOutcome {
    Continue,
    /// The peer violated the protocol; tear the connection down.
    Poison,
}

impl Core {
    pub(crate) fn start_op(&mut self, start: StartOp) -> (u32, u64) {
        let cid = self.resolve_channel(&start.name, start.server);
        let op_id = self.next_op;
        self.next_op += 1;
        let chan = self.channels.get_mut(&cid).expect("channel just resolved");
        chan.ops.insert(
            op_id,
            Gpr {
                kind: start.kind,
                state: OpState::Connecting,
                ioid: None,
                pv_request: start.pv_request,
                builder: start.builder,
                rpc_arg: start.rpc_arg,
                on_init: start.on_init,
                done: Some(start.done),
                get_o_put: start.get_o_put,
                result: None,
            },
        );
        chan.pending.push(op_id);
        if chan.state == ChannelState::Active {
            self.create_operations(cid);
        } else {
            self.kick_channel(cid);
        }
        (cid, op_id)
    }

    /// Issue IOIDs and INIT frames for every operation pending on an
    /// active channel.
    pub(crate) fn create_operations(&mut self, cid: u32) {
        let Some(chan) = self.channels.get_mut(&cid) else {
            return;
        };
        if chan.state != ChannelState::Active {
            return;
        }
        let Some(conn) = chan.conn.and_then(|id| self.conns.get_mut(&id)) else {
            return;
        };
        let todo = std::mem::take(&mut chan.pending);
        for op_id in todo {
            // cancelled while pending
            let Some(op) = chan.ops.get_mut(&op_id) else {
                continue;
            };
            if op.state != OpState::Connecting {
                continue;
            }
            let ioid = conn.alloc_ioid();
            conn.op_by_ioid.insert(
                ioid,
                RequestInfo {
                    op: op_id,
                    cid,
                    kind: op.kind,
                    prototype: None,
                },
            );
            chan.op_by_ioid.insert(ioid, op_id);
            op.ioid = Some(ioid);

            conn.tx_body.clear();
            conn.tx_body.put_u32(chan.sid);
            conn.tx_body.put_u32(ioid);
            match op.kind {
                OpKind::Info => {
                    // sub-field selector, which no one knows how to use
                    conn.tx_body.put_string("");
                    conn.enqueue_tx_body(CMD_GET_FIELD);
                    op.state = OpState::Waiting;
                }
                kind => {
                    conn.tx_body.put_u8(SUBCMD_INIT);
                    to_wire_type(&mut conn.tx_body, Some(&op.pv_request), &mut conn.next_type_id);
                    to_wire_full(&mut conn.tx_body, &op.pv_request);
                    conn.enqueue_tx_body(kind.cmd());
                    op.state = OpState::Creating;
                }
            }
            debug!(
                "Server {} channel '{}' op{:02x} INIT",
                conn.peer_name,
                chan.name,
                op.kind.cmd()
            );
        }
    }

    /// Shared reply handler for GET, PUT and RPC.
    pub(crate) fn handle_gpr(&mut self, conn_id: u64, frame: &Frame) -> GprOutcome {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return GprOutcome::Continue;
        };
        let cmd = frame.cmd;
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let ioid = rx.read_u32();
        let subcmd = rx.read_u8();
        let sts = read_status(&mut rx);
        let init = subcmd & SUBCMD_INIT != 0;
        let get = subcmd & SUBCMD_GET != 0;

        // immediately deserialize in unambiguous cases
        let mut data: Option<Value> = None;
        if rx.good() && cmd != CMD_RPC && init && sts.is_success() {
            // INIT of PUT or GET, decode the type description
            data = from_wire_type(&mut rx, &mut conn.registry);
        } else if rx.good() && cmd == CMD_RPC && !init && sts.is_success() {
            // RPC reply
            data = from_wire_type(&mut rx, &mut conn.registry);
            if let Some(v) = data.as_mut() {
                from_wire_full(&mut rx, v);
            }
        }

        // decoding GET/PUT data needs the prototype from the INIT reply
        let mut registered = None;
        if rx.good() {
            match conn.op_by_ioid.get_mut(&ioid) {
                Some(info) => {
                    if cmd != CMD_RPC && init && sts.is_success() {
                        info.prototype = data.clone();
                    } else if !init
                        && (cmd == CMD_GET || (cmd == CMD_PUT && get))
                        && sts.is_success()
                    {
                        match &info.prototype {
                            Some(proto) => {
                                let mut value = proto.clone_empty();
                                from_wire_valid(&mut rx, &mut value);
                                data = Some(value);
                            }
                            None => rx.set_fault(),
                        }
                    }
                    registered = Some((info.op, info.cid, info.kind));
                }
                None => {
                    if cmd != CMD_RPC && !init {
                        // Without the prototype the payload cannot be
                        // decoded, which may leave the type registry out
                        // of sync with the peer for future replies.
                        error!(
                            "Server {} uses non-existent IOID {ioid}",
                            conn.peer_name
                        );
                        if self.config.strict_ioid {
                            return GprOutcome::Poison;
                        }
                    } else {
                        debug!(
                            "Server {} uses non-existent IOID {ioid}, ignoring",
                            conn.peer_name
                        );
                    }
                    return GprOutcome::Continue;
                }
            }
        }
        let Some((op_id, cid, reg_kind)) = registered else {
            // parse fault before the operation could even be identified
            error!(
                "Server {} sends invalid op{cmd:02x} ({:?}), disconnecting",
                conn.peer_name,
                rx.fault_at()
            );
            return GprOutcome::Poison;
        };

        let Some(chan) = self.channels.get_mut(&cid) else {
            debug!("Server {} ignoring stale cmd{cmd:02x} ioid {ioid}", conn.peer_name);
            return GprOutcome::Continue;
        };
        let Some(op) = chan.ops.get_mut(&op_id) else {
            // the operation already sent CMD_DESTROY_REQUEST
            debug!("Server {} ignoring stale cmd{cmd:02x} ioid {ioid}", conn.peer_name);
            return GprOutcome::Continue;
        };

        // cross-check the message against the operation state
        let consistent = reg_kind.cmd() == cmd
            && match op.state {
                OpState::Creating => init,
                OpState::GetOPut => !init && get,
                OpState::Exec => !init && !get,
                _ => false,
            };
        if !rx.good() || !consistent {
            error!(
                "Server {} sends invalid op{cmd:02x} ({:?}), disconnecting",
                conn.peer_name,
                rx.fault_at()
            );
            return GprOutcome::Poison;
        }

        // advance the operation state
        let prev = op.state;
        if !sts.is_success() {
            op.result = Some(Err(Error::Remote(sts.msg.clone())));
            op.state = OpState::Done;
        } else {
            match op.state {
                OpState::Creating => {
                    if let Some(cb) = op.on_init.take() {
                        let proto = data.clone().unwrap_or_else(Value::empty);
                        if let Err(e) = cb(&proto) {
                            op.result = Some(Err(e));
                            op.state = OpState::Done;
                        }
                    }
                    if op.state != OpState::Done {
                        op.state = if cmd == CMD_PUT && op.get_o_put {
                            OpState::GetOPut
                        } else if cmd == CMD_PUT {
                            OpState::BuildPut
                        } else {
                            OpState::Exec
                        };
                    }
                }
                OpState::GetOPut => {
                    op.state = OpState::BuildPut;
                    // the builder must see current server state
                    if let Some(info) = conn.op_by_ioid.get_mut(&ioid) {
                        info.prototype = data.clone();
                    }
                }
                OpState::Exec => {
                    op.state = OpState::Done;
                    // data is always empty for PUT
                    let value = data.take().unwrap_or_else(Value::empty);
                    op.result = Some(Ok(Reply {
                        value,
                        peer: conn.peer_name.clone(),
                    }));
                }
                _ => unreachable!("validated against the state table"),
            }
        }

        // transient state, the builder callback is synchronous
        if op.state == OpState::BuildPut {
            let proto = conn
                .op_by_ioid
                .get(&ioid)
                .and_then(|info| info.prototype.clone())
                .unwrap_or_else(Value::empty);
            let built = match op.builder.take() {
                Some(builder) => builder(proto),
                None => Err(Error::logic("put operation without a builder")),
            };
            match built {
                Ok(value) => {
                    if let Some(info) = conn.op_by_ioid.get_mut(&ioid) {
                        info.prototype = Some(value);
                    }
                    op.state = OpState::Exec;
                }
                Err(e) => {
                    op.result = Some(Err(e));
                    op.state = OpState::Done;
                }
            }
        }

        debug!(
            "Server {} channel {} op{cmd:02x} state {prev:?} -> {:?}",
            conn.peer_name, chan.name, op.state
        );

        // act on the new state
        conn.tx_body.clear();
        conn.tx_body.put_u32(chan.sid);
        conn.tx_body.put_u32(ioid);
        match op.state {
            OpState::GetOPut => conn.tx_body.put_u8(SUBCMD_GET),
            OpState::Exec => {
                conn.tx_body.put_u8(SUBCMD_EXEC);
                if cmd == CMD_PUT {
                    if let Some(value) =
                        conn.op_by_ioid.get(&ioid).and_then(|i| i.prototype.as_ref())
                    {
                        to_wire_valid(&mut conn.tx_body, value);
                    }
                } else if cmd == CMD_RPC {
                    to_wire_type(&mut conn.tx_body, op.rpc_arg.as_ref(), &mut conn.next_type_id);
                    if let Some(arg) = &op.rpc_arg {
                        to_wire_full(&mut conn.tx_body, arg);
                    }
                }
            }
            // the body built so far is exactly a CMD_DESTROY_REQUEST
            OpState::Done => {}
            _ => {}
        }
        let done = op.state == OpState::Done;
        conn.enqueue_tx_body(if done { CMD_DESTROY_REQUEST } else { cmd });

        if done {
            // DESTROY_REQUEST is not acknowledged, but the server will
            // not reuse this IOID, so both tables can forget it now.
            conn.op_by_ioid.remove(&ioid);
            chan.op_by_ioid.remove(&ioid);
            if let Some(mut op) = chan.ops.remove(&op_id) {
                notify(&mut op);
            }
        }
        GprOutcome::Continue
    }

    /// Reply handler for INFO (GET_FIELD). Single-shot: the reply both
    /// completes and releases the operation, no DESTROY is exchanged.
    pub(crate) fn handle_get_field(&mut self, conn_id: u64, frame: &Frame) -> GprOutcome {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return GprOutcome::Continue;
        };
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let ioid = rx.read_u32();
        let sts = read_status(&mut rx);
        let mut proto = None;
        if sts.is_success() {
            proto = from_wire_type(&mut rx, &mut conn.registry);
        }
        if !rx.good() {
            error!(
                "Server {} sends invalid GET_FIELD ({:?}), disconnecting",
                conn.peer_name,
                rx.fault_at()
            );
            return GprOutcome::Poison;
        }

        let Some(info) = conn.op_by_ioid.get(&ioid) else {
            warn!("Server {} sends stale GET_FIELD", conn.peer_name);
            return GprOutcome::Continue;
        };
        if info.kind != OpKind::Info {
            warn!("Server {} sends stale GET_FIELD", conn.peer_name);
            return GprOutcome::Continue;
        }
        let (op_id, cid) = (info.op, info.cid);
        conn.op_by_ioid.remove(&ioid);
        let Some(chan) = self.channels.get_mut(&cid) else {
            return GprOutcome::Continue;
        };
        chan.op_by_ioid.remove(&ioid);
        let Some(mut op) = chan.ops.remove(&op_id) else {
            debug!("Server {} ignoring stale GET_FIELD ioid {ioid}", conn.peer_name);
            return GprOutcome::Continue;
        };
        if op.state != OpState::Waiting {
            warn!("Server {} ignoring second reply to GET_FIELD", conn.peer_name);
            return GprOutcome::Continue;
        }
        op.state = OpState::Done;
        op.result = Some(if sts.is_success() {
            Ok(Reply {
                value: proto.unwrap_or_else(Value::empty),
                peer: conn.peer_name.clone(),
            })
        } else {
            Err(Error::Remote(sts.msg))
        });
        notify(&mut op);
        GprOutcome::Continue
    }

    /// Worker-side cancellation. Returns whether the cancel changed
    /// anything, i.e. the operation had not already completed.
    pub(crate) fn cancel_op(&mut self, cid: u32, op_id: u64, implicit: bool) -> bool {
        let Some(chan) = self.channels.get_mut(&cid) else {
            return false;
        };
        let Some(mut op) = chan.ops.remove(&op_id) else {
            return false;
        };
        if implicit && op.state != OpState::Done {
            warn!(
                "implied cancel of {:?} on channel '{}'",
                op.kind, chan.name
            );
        }
        // an armed operation has a request outstanding on the server
        let armed = matches!(
            op.state,
            OpState::GetOPut | OpState::Exec | OpState::Waiting
        );
        if let Some(ioid) = op.ioid {
            if armed || op.state == OpState::Creating {
                // Opens a race with an in-flight reply: it will miss the
                // registry and be dropped.
                chan.op_by_ioid.remove(&ioid);
                if let Some(conn) = chan.conn.and_then(|id| self.conns.get_mut(&id)) {
                    if armed {
                        conn.send_destroy_request(chan.sid, ioid);
                    }
                    conn.op_by_ioid.remove(&ioid);
                }
            }
        }
        let changed = op.state != OpState::Done;
        op.state = OpState::Done;
        // op, its callbacks and any waiter drop here, after the tables
        // are consistent again
        changed
    }
}

/// Handle to an in-flight operation.
///
/// Dropping the handle cancels the operation; a completion already
/// delivered is unaffected.
pub struct Operation {
    name: String,
    worker: Worker<Core>,
    cid: u32,
    id: u64,
    waiter: Option<oneshot::Receiver<OpResult>>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .field("id", &self.id)
            .finish()
    }
}

impl Operation {
    pub(crate) fn new(
        name: String,
        worker: Worker<Core>,
        cid: u32,
        id: u64,
        waiter: Option<oneshot::Receiver<OpResult>>,
    ) -> Operation {
        Operation {
            name,
            worker,
            cid,
            id,
            waiter,
        }
    }

    /// The PV name this operation addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the operation to complete.
    ///
    /// Only available when no custom result callback was installed.
    /// There is no built-in deadline; wrap in [`tokio::time::timeout`]
    /// as needed.
    pub async fn wait(mut self) -> OpResult {
        let rx = self
            .waiter
            .take()
            .ok_or_else(|| Error::logic("operation has a custom result callback"))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Cancel the operation. After this resolves no further callback
    /// will fire. Returns true if the operation was still in progress.
    pub async fn cancel(self) -> Result<bool, Error> {
        let (worker, cid, id) = (self.worker.clone(), self.cid, self.id);
        worker.call(move |core| core.cancel_op(cid, id, false)).await
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        let (cid, id) = (self.cid, self.id);
        self.worker.dispatch(move |core| {
            core.cancel_op(cid, id, true);
        });
    }
}
