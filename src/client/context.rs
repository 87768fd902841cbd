//! Worker-owned client state: channel cache, connection table, search
//! and discovery scheduling.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, warn};

use crate::client::channel::{Channel, ChannelState};
use crate::client::connection::{ConnState, Connection};
use crate::client::discovery::DiscoverFn;
use crate::config::Config;
use crate::error::Error;
use crate::utils::wrapping_inplace_add;
use crate::wire::{SearchRequest, parse_search_reply, search_frame};
use crate::worker::Worker;

const SEARCH_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// All protocol state of one client context. Owned by the worker task;
/// every method below runs as a worker job.
pub(crate) struct Core {
    pub worker: Worker<Core>,
    pub config: Config,
    search_sock: Arc<UdpSocket>,
    /// Local port search replies come back to.
    search_port: u16,
    search_seq: u32,
    next_cid: u32,
    pub chan_by_name: HashMap<String, u32>,
    pub channels: HashMap<u32, Channel>,
    pub next_conn: u64,
    pub conns: HashMap<u64, Connection>,
    pub conn_by_addr: HashMap<SocketAddr, u64>,
    pub next_op: u64,
    pub discoverers: HashMap<u64, DiscoverFn>,
    pub discover_age: u64,
    /// Last known GUID per server address, for discovery reporting.
    servers_seen: HashMap<SocketAddr, [u8; 12]>,
    search_tick_running: bool,
}

impl Core {
    pub fn new(
        worker: Worker<Core>,
        config: Config,
        search_sock: Arc<UdpSocket>,
        search_port: u16,
    ) -> Core {
        Core {
            worker,
            config,
            search_sock,
            search_port,
            search_seq: 0,
            next_cid: 0x1234_5678,
            chan_by_name: HashMap::new(),
            channels: HashMap::new(),
            next_conn: 1,
            conns: HashMap::new(),
            conn_by_addr: HashMap::new(),
            next_op: 1,
            discoverers: HashMap::new(),
            discover_age: 0,
            servers_seen: HashMap::new(),
            search_tick_running: false,
        }
    }

    /// The channel for a PV name, creating it when first used.
    pub(crate) fn resolve_channel(&mut self, name: &str, server: Option<SocketAddr>) -> u32 {
        if let Some(&cid) = self.chan_by_name.get(name) {
            return cid;
        }
        let cid = loop {
            let cid = wrapping_inplace_add(&mut self.next_cid);
            if !self.channels.contains_key(&cid) {
                break cid;
            }
        };
        self.channels
            .insert(cid, Channel::new(cid, name.to_string(), server));
        self.chan_by_name.insert(name.to_string(), cid);
        cid
    }

    /// Start resolution of a searching channel: direct connect when
    /// pinned to a server, otherwise join the search schedule.
    pub(crate) fn kick_channel(&mut self, cid: u32) {
        let Some(chan) = self.channels.get_mut(&cid) else {
            return;
        };
        if chan.state != ChannelState::Searching {
            return;
        }
        match chan.fixed_server {
            Some(addr) => self.attach_channel(cid, addr),
            None => {
                chan.next_search_at = Instant::now();
                self.ensure_search_tick();
            }
        }
    }

    /// Bind a searching channel to a server and create it there once
    /// the connection is ready.
    fn attach_channel(&mut self, cid: u32, addr: SocketAddr) {
        let conn_id = self.connect_to(addr);
        let Some(chan) = self.channels.get_mut(&cid) else {
            return;
        };
        chan.state = ChannelState::Connecting;
        chan.conn = Some(conn_id);
        let conn = self.conns.get_mut(&conn_id).expect("connection just made");
        conn.pending_cids.push(cid);
        if conn.state == ConnState::Ready {
            self.create_channels(conn_id);
        }
    }

    pub(crate) fn ensure_search_tick(&mut self) {
        if self.search_tick_running {
            return;
        }
        self.search_tick_running = true;
        self.worker.dispatch(|core| core.tick_search());
    }

    fn tick_search(&mut self) {
        self.search_tick_running = false;
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut reconnect = Vec::new();
        let mut any_searching = false;
        for chan in self.channels.values_mut() {
            if chan.state != ChannelState::Searching {
                continue;
            }
            any_searching = true;
            if chan.next_search_at > now {
                continue;
            }
            chan.next_search_at = now + Duration::from_secs(chan.search_backoff());
            chan.n_search += 1;
            match chan.fixed_server {
                Some(addr) => reconnect.push((chan.cid, addr)),
                None => batch.push((chan.cid, chan.name.clone())),
            }
        }
        for (cid, addr) in reconnect {
            self.attach_channel(cid, addr);
        }
        if !batch.is_empty() {
            self.send_search(batch, false);
        }
        if any_searching {
            self.search_tick_running = true;
            self.worker
                .dispatch_after(SEARCH_TICK_INTERVAL, |core| core.tick_search());
        }
    }

    /// Request prompt re-search of any disconnected channels, e.g. after
    /// issuing a batch of operations.
    pub(crate) fn hurry_up(&mut self) {
        let now = Instant::now();
        for chan in self.channels.values_mut() {
            if chan.state == ChannelState::Searching {
                chan.next_search_at = now;
            }
        }
        self.ensure_search_tick();
    }

    /// Send one search datagram to every configured destination.
    pub(crate) fn send_search(&mut self, channels: Vec<(u32, String)>, reply_required: bool) {
        let seq = wrapping_inplace_add(&mut self.search_seq);
        for (addr, unicast) in self.config.search_addresses() {
            let frame = search_frame(&SearchRequest {
                seq,
                reply_required,
                unicast,
                reply_port: self.search_port,
                channels: channels.clone(),
            });
            // best effort, the tick will try again
            match self.search_sock.try_send_to(&frame, addr) {
                Ok(_) => debug!(
                    "Search to {addr} ({} pvs){}",
                    channels.len(),
                    if unicast { " ucast" } else { " bcast" }
                ),
                Err(e) => debug!("Search tx error to {addr}: {e}"),
            }
        }
    }

    pub(crate) fn on_search_datagram(&mut self, data: &[u8], src: SocketAddr) {
        match parse_search_reply(data) {
            Ok((_, reply)) => {
                let ip = reply.server.map(IpAddr::V4).unwrap_or(src.ip());
                let server = SocketAddr::new(ip, reply.port);
                self.handle_search_reply(server, reply.guid, reply.found, reply.cids);
            }
            Err(_) => debug!("Ignoring unparseable datagram from {src}"),
        }
    }

    fn handle_search_reply(
        &mut self,
        server: SocketAddr,
        guid: [u8; 12],
        found: bool,
        cids: Vec<u32>,
    ) {
        // any reply identifies a live server, channel claim or not
        if self.servers_seen.get(&server) != Some(&guid) {
            self.servers_seen.insert(server, guid);
            self.notify_discoverers(server, guid);
        }
        if !found {
            return;
        }
        for cid in cids {
            let searching = self
                .channels
                .get(&cid)
                .is_some_and(|c| c.state == ChannelState::Searching);
            if searching {
                debug!("Search reply for channel {cid} from {server}");
                self.attach_channel(cid, server);
            }
        }
    }
}

fn bind_search_socket() -> Result<UdpSocket, Error> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(std::net::UdpSocket::from(socket))?)
}

/// Bind the search socket and spawn the worker plus the datagram
/// receive task.
pub(crate) fn start(config: Config) -> Result<Worker<Core>, Error> {
    let sock = Arc::new(bind_search_socket()?);
    let search_port = sock.local_addr()?.port();
    let worker = {
        let sock = sock.clone();
        Worker::spawn("pva-client", move |w| {
            Core::new(w.clone(), config, sock, search_port)
        })
    };

    let cancel = worker.cancel_token();
    let rx_worker = worker.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 0xFFFF];
        loop {
            select! {
                _ = cancel.cancelled() => break,
                r = sock.recv_from(&mut buf) => match r {
                    Ok((size, src)) => {
                        let data = buf[..size].to_vec();
                        rx_worker.dispatch(move |core| core.on_search_datagram(&data, src));
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Search receive error: {e}");
                        break;
                    }
                },
            }
        }
    });
    Ok(worker)
}
