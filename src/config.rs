//! Client configuration, loadable from `EPICS_PVA*` environment
//! variables.

use std::env;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use pnet::datalink;
use tracing::{debug, warn};

/// Get the UDP search/broadcast port, either from environment or default
/// 5076.
pub fn get_default_udp_port() -> u16 {
    env::var("EPICS_PVA_BROADCAST_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5076u16)
        .max(1024u16)
}

/// Get the connection timeout, either from environment or default 30s
pub fn get_default_conn_tmo() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_PVA_CONN_TMO")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30.0f32)
            .max(0.1f32),
    )
}

fn get_default_auto_addr_list() -> bool {
    env::var("EPICS_PVA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true)
}

/// Addresses from `EPICS_PVA_ADDR_LIST`, resolving hostnames and
/// defaulting the port.
fn get_env_addr_list(default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    if let Ok(addr_list) = env::var("EPICS_PVA_ADDR_LIST") {
        for add in addr_list.split_ascii_whitespace() {
            let resolved = if add.contains(':') {
                add.to_socket_addrs()
            } else {
                (add, default_port).to_socket_addrs()
            };
            match resolved {
                Ok(addr) => {
                    debug!("Adding search IP: {add} => {addr:?}");
                    ips.extend(addr);
                }
                Err(e) => {
                    warn!("Failed to convert '{add}' to address: {e}");
                }
            }
        }
    }
    ips
}

/// Local interface broadcast addresses, for the automatic address list.
fn get_broadcast_ips(port: u16) -> Vec<SocketAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .flat_map(|i| i.ips.into_iter())
        .filter(|i| i.is_ipv4())
        .map(|i| SocketAddr::new(i.broadcast(), port))
        .collect()
}

/// Client context configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unicast/broadcast addresses to search.
    pub address_list: Vec<SocketAddr>,
    /// Extend the address list with local interface broadcast addresses.
    pub auto_addr_list: bool,
    /// Port used when an address list entry has none, and for automatic
    /// broadcast addresses.
    pub udp_port: u16,
    /// Give up on a TCP connection attempt after this long.
    pub conn_tmo: Duration,
    /// Tear down a connection when the server replies on an IOID we do
    /// not know for a data reply. The lenient default matches servers
    /// that keep sending briefly after a destroy.
    pub strict_ioid: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address_list: Vec::new(),
            auto_addr_list: true,
            udp_port: get_default_udp_port(),
            conn_tmo: get_default_conn_tmo(),
            strict_ioid: false,
        }
    }
}

impl Config {
    /// Configuration from `EPICS_PVA*` environment variables.
    pub fn from_env() -> Config {
        let udp_port = get_default_udp_port();
        Config {
            address_list: get_env_addr_list(udp_port),
            auto_addr_list: get_default_auto_addr_list(),
            udp_port,
            conn_tmo: get_default_conn_tmo(),
            strict_ioid: false,
        }
    }

    /// The effective list of search destinations. An address is flagged
    /// as unicast when it is not one of the local broadcast addresses.
    pub fn search_addresses(&self) -> Vec<(SocketAddr, bool)> {
        let bcast = get_broadcast_ips(self.udp_port);
        let mut out = Vec::new();
        if self.auto_addr_list {
            out.extend(bcast.iter().map(|a| (*a, false)));
        }
        for addr in &self.address_list {
            let is_bcast = bcast.iter().any(|b| b.ip() == addr.ip());
            let is_mcast = matches!(addr.ip(), IpAddr::V4(v4) if v4.is_multicast());
            out.push((*addr, !is_bcast && !is_mcast));
        }
        out
    }
}
