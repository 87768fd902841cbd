//! One TCP connection to a PVA server: framed I/O tasks, the IOID
//! registry, validation handshake, and disconnect cascade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::channel::ChannelState;
use crate::client::context::Core;
use crate::client::operation::{GprOutcome, OpKind, OpState, notify};
use crate::error::Error;
use crate::utils::wrapping_inplace_add;
use crate::value::Value;
use crate::wire::{
    CMD_CONNECTION_VALIDATED, CMD_CONNECTION_VALIDATION, CMD_CREATE_CHANNEL, CMD_DESTROY_REQUEST,
    CMD_GET, CMD_GET_FIELD, CMD_MESSAGE, CMD_PUT, CMD_RPC, Frame, FrameCodec, RxBuf, TxBuf,
    TxFrame, TypeRegistry, read_status, to_wire_type,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// TCP connect in flight.
    Connecting,
    /// Awaiting the server's validation exchange.
    Validating,
    Ready,
}

/// Registry entry for one issued IOID.
///
/// This is the non-owning side: `op` refers into the channel's operation
/// table, and a reply that resolves here but no longer there is stale.
pub(crate) struct RequestInfo {
    pub op: u64,
    pub cid: u32,
    pub kind: OpKind,
    /// Type delivered at INIT, used to decode subsequent data replies.
    pub prototype: Option<Value>,
}

pub(crate) struct Connection {
    pub peer: SocketAddr,
    pub peer_name: String,
    pub state: ConnState,
    tx: Option<mpsc::UnboundedSender<TxFrame>>,
    /// Scratch for the next outbound body, reused across operations.
    pub tx_body: TxBuf,
    /// Types received from this peer.
    pub registry: TypeRegistry,
    /// Counter for types sent to this peer.
    pub next_type_id: u16,
    pub op_by_ioid: HashMap<u32, RequestInfo>,
    next_ioid: u32,
    /// Channels waiting for the connection to become ready.
    pub pending_cids: Vec<u32>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(peer: SocketAddr, cancel: CancellationToken) -> Connection {
        Connection {
            peer,
            peer_name: peer.to_string(),
            state: ConnState::Connecting,
            tx: None,
            tx_body: TxBuf::new(),
            registry: TypeRegistry::new(),
            next_type_id: 0,
            op_by_ioid: HashMap::new(),
            next_ioid: 0x1000_2000,
            pending_cids: Vec::new(),
            cancel,
        }
    }

    /// An IOID unused for the lifetime of this connection.
    pub fn alloc_ioid(&mut self) -> u32 {
        loop {
            let ioid = wrapping_inplace_add(&mut self.next_ioid);
            if !self.op_by_ioid.contains_key(&ioid) {
                return ioid;
            }
        }
    }

    /// Commit the assembled body as one frame with the given command.
    pub fn enqueue_tx_body(&mut self, cmd: u8) {
        let body = self.tx_body.take();
        match &self.tx {
            Some(tx) => {
                let _ = tx.send(TxFrame {
                    cmd,
                    from_server: false,
                    body,
                });
            }
            None => debug!(
                "Server {} dropping cmd{cmd:02x}: not established",
                self.peer_name
            ),
        }
    }

    pub fn send_destroy_request(&mut self, sid: u32, ioid: u32) {
        self.tx_body.clear();
        self.tx_body.put_u32(sid);
        self.tx_body.put_u32(ioid);
        self.enqueue_tx_body(CMD_DESTROY_REQUEST);
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tx = None;
    }
}

impl Core {
    /// Connection to a server address, reusing an existing one.
    pub(crate) fn connect_to(&mut self, addr: SocketAddr) -> u64 {
        if let Some(&id) = self.conn_by_addr.get(&addr) {
            return id;
        }
        let id = self.next_conn;
        self.next_conn += 1;
        let cancel = self.worker.cancel_token().child_token();
        self.conns.insert(id, Connection::new(addr, cancel.clone()));
        self.conn_by_addr.insert(addr, id);
        debug!("Connecting to {addr}");

        let worker = self.worker.clone();
        let conn_tmo = self.config.conn_tmo;
        tokio::spawn(async move {
            select! {
                _ = cancel.cancelled() => (),
                result = tokio::time::timeout(conn_tmo, TcpStream::connect(addr)) => match result {
                    Ok(Ok(stream)) => {
                        worker.dispatch(move |core| core.connection_established(id, stream));
                    }
                    Ok(Err(e)) => {
                        worker.dispatch(move |core| {
                            core.teardown_connection(id, format!("connect failed: {e}"));
                        });
                    }
                    Err(_) => {
                        worker.dispatch(move |core| {
                            core.teardown_connection(id, format!("connect timed out after {conn_tmo:?}"));
                        });
                    }
                },
            }
        });
        id
    }

    pub(crate) fn connection_established(&mut self, conn_id: u64, stream: TcpStream) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            // torn down while the connect was in flight
            return;
        };
        conn.state = ConnState::Validating;
        if let Ok(peer) = stream.peer_addr() {
            conn.peer_name = peer.to_string();
        }
        debug!("Connected to {}", conn.peer_name);
        let (mut rd, mut wr) = stream.into_split();

        let (tx, mut tx_rx) = mpsc::unbounded_channel::<TxFrame>();
        conn.tx = Some(tx);
        let cancel = conn.cancel.clone();
        tokio::spawn(async move {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::new();
            loop {
                let frame = select! {
                    _ = cancel.cancelled() => break,
                    frame = tx_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                buf.clear();
                if codec.encode(frame, &mut buf).is_err() {
                    break;
                }
                if let Err(e) = wr.write_all(&buf).await {
                    debug!("write error: {e}");
                    break;
                }
            }
        });

        let worker = self.worker.clone();
        let cancel = conn.cancel.clone();
        tokio::spawn(async move {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::with_capacity(0x4000);
            'io: loop {
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            worker.dispatch(move |core| core.handle_frame(conn_id, frame));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            worker.dispatch(move |core| {
                                core.teardown_connection(conn_id, format!("bad frame: {e}"));
                            });
                            break 'io;
                        }
                    }
                }
                select! {
                    _ = cancel.cancelled() => break 'io,
                    read = rd.read_buf(&mut buf) => match read {
                        Ok(0) => {
                            worker.dispatch(move |core| {
                                core.teardown_connection(conn_id, "peer closed connection".into());
                            });
                            break 'io;
                        }
                        Ok(_) => (),
                        Err(e) => {
                            worker.dispatch(move |core| {
                                core.teardown_connection(conn_id, format!("read error: {e}"));
                            });
                            break 'io;
                        }
                    },
                }
            }
        });
    }

    pub(crate) fn handle_frame(&mut self, conn_id: u64, frame: Frame) {
        let outcome = match frame.cmd {
            CMD_CONNECTION_VALIDATION => self.handle_validation(conn_id, &frame),
            CMD_CONNECTION_VALIDATED => self.handle_validated(conn_id, &frame),
            CMD_CREATE_CHANNEL => self.handle_create_channel_reply(conn_id, &frame),
            CMD_GET | CMD_PUT | CMD_RPC => self.handle_gpr(conn_id, &frame),
            CMD_GET_FIELD => self.handle_get_field(conn_id, &frame),
            // informational, safe to ignore
            CMD_MESSAGE => GprOutcome::Continue,
            cmd => {
                debug!("ignoring unexpected cmd{cmd:02x}");
                GprOutcome::Continue
            }
        };
        if outcome == GprOutcome::Poison {
            self.teardown_connection(conn_id, "protocol violation".into());
        }
    }

    fn handle_validation(&mut self, conn_id: u64, frame: &Frame) -> GprOutcome {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return GprOutcome::Continue;
        };
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let _server_buffer = rx.read_u32();
        let _server_registry = rx.read_u16();
        let nmethods = rx.read_size();
        for _ in 0..nmethods {
            if !rx.good() {
                break;
            }
            let _method = rx.read_string();
        }
        if !rx.good() {
            error!("Server {} sends invalid validation request", conn.peer_name);
            return GprOutcome::Poison;
        }
        conn.tx_body.clear();
        conn.tx_body.put_u32(0x0001_0000);
        conn.tx_body.put_u16(0x7FFF);
        conn.tx_body.put_u16(0); // QoS
        conn.tx_body.put_string("anonymous");
        to_wire_type(&mut conn.tx_body, None, &mut conn.next_type_id);
        conn.enqueue_tx_body(CMD_CONNECTION_VALIDATION);
        GprOutcome::Continue
    }

    fn handle_validated(&mut self, conn_id: u64, frame: &Frame) -> GprOutcome {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return GprOutcome::Continue;
        };
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let sts = read_status(&mut rx);
        if !rx.good() {
            error!("Server {} sends invalid validated reply", conn.peer_name);
            return GprOutcome::Poison;
        }
        if !sts.is_success() {
            warn!("Server {} rejected validation: {}", conn.peer_name, sts.msg);
            return GprOutcome::Poison;
        }
        conn.state = ConnState::Ready;
        debug!("Server {} ready", conn.peer_name);
        self.create_channels(conn_id);
        GprOutcome::Continue
    }

    /// Send CREATE_CHANNEL for every channel queued on a ready
    /// connection.
    pub(crate) fn create_channels(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if conn.state != ConnState::Ready {
            return;
        }
        for cid in std::mem::take(&mut conn.pending_cids) {
            let Some(chan) = self.channels.get_mut(&cid) else {
                continue;
            };
            if chan.state != ChannelState::Connecting || chan.conn != Some(conn_id) {
                continue;
            }
            conn.tx_body.clear();
            conn.tx_body.put_u16(1);
            conn.tx_body.put_u32(cid);
            conn.tx_body.put_string(&chan.name);
            conn.enqueue_tx_body(CMD_CREATE_CHANNEL);
            chan.state = ChannelState::Creating;
            debug!("Server {} creating channel '{}'", conn.peer_name, chan.name);
        }
    }

    fn handle_create_channel_reply(&mut self, conn_id: u64, frame: &Frame) -> GprOutcome {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return GprOutcome::Continue;
        };
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let cid = rx.read_u32();
        let sid = rx.read_u32();
        let sts = read_status(&mut rx);
        if !rx.good() {
            error!("Server {} sends invalid create channel reply", conn.peer_name);
            return GprOutcome::Poison;
        }
        let Some(chan) = self.channels.get_mut(&cid) else {
            debug!("Server {} replies for unknown channel {cid}", conn.peer_name);
            return GprOutcome::Continue;
        };
        if chan.conn != Some(conn_id) || chan.state != ChannelState::Creating {
            debug!(
                "Server {} unexpected create reply for '{}'",
                conn.peer_name, chan.name
            );
            return GprOutcome::Continue;
        }
        if !sts.is_success() {
            warn!(
                "Server {} refuses channel '{}': {}",
                conn.peer_name, chan.name, sts.msg
            );
            chan.state = ChannelState::Searching;
            chan.conn = None;
            self.ensure_search_tick();
            return GprOutcome::Continue;
        }
        chan.sid = sid;
        chan.state = ChannelState::Active;
        debug!(
            "Server {} channel '{}' active, sid {sid}",
            conn.peer_name, chan.name
        );
        self.create_operations(cid);
        GprOutcome::Continue
    }

    /// Drop a connection and cascade every attached channel and
    /// operation through the disconnect policy: reads restart, executed
    /// writes fail. Writes are never silently retried.
    pub(crate) fn teardown_connection(&mut self, conn_id: u64, reason: String) {
        let Some(mut conn) = self.conns.remove(&conn_id) else {
            return;
        };
        self.conn_by_addr.remove(&conn.peer);
        conn.shutdown();
        debug!("Server {} disconnected: {reason}", conn.peer_name);

        let cids: Vec<u32> = self
            .channels
            .values()
            .filter(|c| c.conn == Some(conn_id))
            .map(|c| c.cid)
            .collect();
        let mut terminal = Vec::new();
        for cid in cids {
            let chan = self.channels.get_mut(&cid).expect("cid just collected");
            chan.state = ChannelState::Searching;
            chan.conn = None;
            chan.sid = 0xdead_beef; // spoil
            chan.op_by_ioid.clear();
            chan.n_search = 0;
            chan.next_search_at = Instant::now();
            debug!("Detach channel '{}' to re-search", chan.name);

            let op_ids: Vec<u64> = chan.ops.keys().copied().collect();
            for op_id in op_ids {
                let (state, kind) = {
                    let op = &chan.ops[&op_id];
                    (op.state, op.kind)
                };
                let retry = match state {
                    OpState::Connecting | OpState::Done => continue,
                    OpState::Creating | OpState::GetOPut | OpState::Waiting => true,
                    OpState::Exec => kind == OpKind::Get,
                    OpState::BuildPut => false,
                };
                if retry {
                    let op = chan.ops.get_mut(&op_id).expect("op id just collected");
                    op.state = OpState::Connecting;
                    op.ioid = None;
                    chan.pending.push(op_id);
                } else {
                    let mut op = chan.ops.remove(&op_id).expect("op id just collected");
                    op.result = Some(match op.state {
                        // server side-effects may already have occurred
                        OpState::Exec => Err(Error::Disconnect),
                        _ => Err(Error::logic("disconnect in unexpected state")),
                    });
                    op.state = OpState::Done;
                    terminal.push(op);
                }
            }
        }
        self.ensure_search_tick();
        for mut op in terminal {
            notify(&mut op);
        }
    }
}
