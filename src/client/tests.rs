//! End-to-end exercises of the operation core against a scripted peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::client::Context;
use crate::client::discovery::Guid;
use crate::config::Config;
use crate::error::Error;
use crate::utils::test::PeerServer;
use crate::value::{ScalarKind, Value};
use crate::wire::{
    CMD_GET, CMD_PUT, CMD_RPC, SUBCMD_EXEC, SUBCMD_GET, SUBCMD_INIT, SearchReply, parse_search,
    search_reply_frame,
};

fn test_config() -> Config {
    Config {
        address_list: Vec::new(),
        auto_addr_list: false,
        ..Config::default()
    }
}

fn nt_double() -> Value {
    Value::structure(
        "epics:nt/NTScalar:1.0",
        vec![("value".to_string(), Value::scalar(ScalarKind::Float64))],
    )
}

/// Entries across the connection registry and both channel-side tables.
async fn table_sizes(ctx: &Context) -> (usize, usize, usize) {
    ctx.worker()
        .call(|core| {
            let registry: usize = core.conns.values().map(|c| c.op_by_ioid.len()).sum();
            let by_ioid: usize = core.channels.values().map(|c| c.op_by_ioid.len()).sum();
            let ops: usize = core.channels.values().map(|c| c.ops.len()).sum();
            (registry, by_ioid, ops)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_get() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx.get("pv:one").server(addr).exec().await.unwrap();
    assert_eq!(op.name(), "pv:one");

    let mut conn = server.accept().await;
    let (_cid, name) = conn.open_channel(77).await;
    assert_eq!(name, "pv:one");

    let init = conn.expect_gpr(CMD_GET).await;
    assert_eq!(init.sid, 77);
    assert_eq!(init.subcmd, SUBCMD_INIT);
    let pv_req = conn.decode_init_request(&init);
    assert!(pv_req.field("field").is_some());

    let proto = nt_double();
    conn.send_init_reply(CMD_GET, init.ioid, &proto).await;

    let exec = conn.expect_gpr(CMD_GET).await;
    assert_eq!(exec.ioid, init.ioid);
    assert_eq!(exec.subcmd, SUBCMD_EXEC);
    let mut value = proto.clone_empty();
    value.set("value", 1.5).unwrap();
    conn.send_exec_value(CMD_GET, exec.ioid, Some(&value)).await;

    let (sid, ioid) = conn.expect_destroy().await;
    assert_eq!((sid, ioid), (77, exec.ioid));

    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value.get("value").unwrap().as_f64(), Some(1.5));
    assert!(!reply.peer.is_empty());

    // both IOID tables released the operation
    assert_eq!(table_sizes(&ctx).await, (0, 0, 0));
}

#[tokio::test]
async fn put_with_get_phase() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let saw_init = Arc::new(AtomicBool::new(false));
    let saw = saw_init.clone();
    let op = ctx
        .put("pv:two")
        .server(addr)
        .on_init(move |proto| {
            saw.store(proto.field("value").is_some(), Ordering::SeqCst);
            Ok(())
        })
        .build(|current| {
            // builder runs against the fetched server value
            let present = current
                .get("value")
                .and_then(|s| s.as_f64())
                .ok_or_else(|| Error::Builder("no current value".into()))?;
            let mut out = current.clone_empty();
            out.set("value", present + 4.0)?;
            Ok(out)
        })
        .exec()
        .await
        .unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(5).await;
    let proto = nt_double();

    let init = conn.expect_gpr(CMD_PUT).await;
    assert_eq!(init.subcmd, SUBCMD_INIT);
    conn.send_init_reply(CMD_PUT, init.ioid, &proto).await;

    // fetch-present phase first
    let getp = conn.expect_gpr(CMD_PUT).await;
    assert_eq!(getp.subcmd, SUBCMD_GET);
    let mut current = proto.clone_empty();
    current.set("value", 3.0).unwrap();
    conn.send_getphase_value(getp.ioid, &current).await;

    let exec = conn.expect_gpr(CMD_PUT).await;
    assert_eq!(exec.subcmd, SUBCMD_EXEC);
    let sent = conn.decode_put_value(&exec, &proto);
    assert_eq!(sent.get("value").unwrap().as_f64(), Some(7.0));
    conn.send_exec_value(CMD_PUT, exec.ioid, None).await;
    conn.expect_destroy().await;

    let reply = op.wait().await.unwrap();
    // a successful put returns an empty value
    assert!(reply.value.get("value").is_none());
    assert!(saw_init.load(Ordering::SeqCst));
}

#[tokio::test]
async fn field_map_put_skips_get_phase() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx
        .put("pv:three")
        .server(addr)
        .set("value", 7.0)
        .exec()
        .await
        .unwrap();

    // the field map never depends on the current value
    let flags: Vec<bool> = ctx
        .worker()
        .call(|core| {
            core.channels
                .values()
                .flat_map(|c| c.ops.values())
                .map(|op| op.get_o_put)
                .collect()
        })
        .await
        .unwrap();
    assert_eq!(flags, vec![false]);

    let mut conn = server.accept().await;
    conn.open_channel(5).await;
    let proto = nt_double();
    let init = conn.expect_gpr(CMD_PUT).await;
    conn.send_init_reply(CMD_PUT, init.ioid, &proto).await;

    // straight to exec, no 0x40 phase
    let exec = conn.expect_gpr(CMD_PUT).await;
    assert_eq!(exec.subcmd, SUBCMD_EXEC);
    let sent = conn.decode_put_value(&exec, &proto);
    assert_eq!(sent.get("value").unwrap().as_f64(), Some(7.0));
    conn.send_exec_value(CMD_PUT, exec.ioid, None).await;
    conn.expect_destroy().await;
    op.wait().await.unwrap();
}

#[tokio::test]
async fn cancel_during_creating() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let op = ctx
        .get("pv:cancel")
        .server(addr)
        .result(move |_| flag.store(true, Ordering::SeqCst))
        .exec()
        .await
        .unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(8).await;
    let init = conn.expect_gpr(CMD_GET).await;

    // cancel before the INIT reply arrives
    assert!(op.cancel().await.unwrap());
    assert_eq!(table_sizes(&ctx).await, (0, 0, 0));

    // the late INIT reply must be dropped, with no DESTROY in response
    let proto = nt_double();
    conn.send_init_reply(CMD_GET, init.ioid, &proto).await;
    conn.expect_nothing(Duration::from_millis(300)).await;
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn disconnect_during_put_exec() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx
        .put("pv:four")
        .server(addr)
        .fetch_present(false)
        .build(|proto| {
            let mut out = proto.clone_empty();
            out.set("value", 9.0)?;
            Ok(out)
        })
        .exec()
        .await
        .unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(5).await;
    let proto = nt_double();
    let init = conn.expect_gpr(CMD_PUT).await;
    conn.send_init_reply(CMD_PUT, init.ioid, &proto).await;
    let _exec = conn.expect_gpr(CMD_PUT).await;

    // connection lost while the write is executing: the put must fail,
    // not silently retry
    drop(conn);
    let err = op.wait().await.unwrap_err();
    assert!(matches!(err, Error::Disconnect), "got {err:?}");

    // a later get on the same channel succeeds after reconnect
    let op = ctx.get("pv:four").server(addr).exec().await.unwrap();
    let mut conn = server.accept().await;
    conn.open_channel(6).await;
    let init = conn.expect_gpr(CMD_GET).await;
    conn.send_init_reply(CMD_GET, init.ioid, &proto).await;
    let exec = conn.expect_gpr(CMD_GET).await;
    let mut value = proto.clone_empty();
    value.set("value", 2.5).unwrap();
    conn.send_exec_value(CMD_GET, exec.ioid, Some(&value)).await;
    conn.expect_destroy().await;
    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value.get("value").unwrap().as_f64(), Some(2.5));
}

#[tokio::test]
async fn kind_mismatch_poisons_connection() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let proto = nt_double();

    // a GET parked in Exec
    let get_op = ctx.get("pv:five").server(addr).exec().await.unwrap();
    let mut conn = server.accept().await;
    conn.open_channel(5).await;
    let get_init = conn.expect_gpr(CMD_GET).await;
    conn.send_init_reply(CMD_GET, get_init.ioid, &proto).await;
    let _get_exec = conn.expect_gpr(CMD_GET).await;

    // and a PUT parked in Exec on the same channel
    let put_op = ctx.put("pv:five").set("value", 1.0).exec().await.unwrap();
    let put_init = conn.expect_gpr(CMD_PUT).await;
    conn.send_init_reply(CMD_PUT, put_init.ioid, &proto).await;
    let put_exec = conn.expect_gpr(CMD_PUT).await;

    // a GET reply on the IOID registered as PUT poisons the connection
    let mut value = proto.clone_empty();
    value.set("value", 0.0).unwrap();
    conn.send_exec_value(CMD_GET, put_exec.ioid, Some(&value))
        .await;

    // the executed write fails, it may have taken effect server-side
    let err = put_op.wait().await.unwrap_err();
    assert!(matches!(err, Error::Disconnect), "got {err:?}");

    // the read restarts against the reconnected channel
    let mut conn = server.accept().await;
    conn.open_channel(6).await;
    let init = conn.expect_gpr(CMD_GET).await;
    conn.send_init_reply(CMD_GET, init.ioid, &proto).await;
    let exec = conn.expect_gpr(CMD_GET).await;
    let mut value = proto.clone_empty();
    value.set("value", 4.5).unwrap();
    conn.send_exec_value(CMD_GET, exec.ioid, Some(&value)).await;
    conn.expect_destroy().await;
    let reply = get_op.wait().await.unwrap();
    assert_eq!(reply.value.get("value").unwrap().as_f64(), Some(4.5));
}

#[tokio::test]
async fn rpc_round_trip() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx
        .rpc("svc:sum")
        .server(addr)
        .arg("lhs", 1.0)
        .arg("rhs", 2.0)
        .exec()
        .await
        .unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(11).await;
    let init = conn.expect_gpr(CMD_RPC).await;
    assert_eq!(init.subcmd, SUBCMD_INIT);
    conn.send_init_reply(CMD_RPC, init.ioid, &Value::empty())
        .await;

    let exec = conn.expect_gpr(CMD_RPC).await;
    assert_eq!(exec.subcmd, SUBCMD_EXEC);
    let arg = conn.decode_rpc_arg(&exec);
    assert_eq!(arg.type_id(), "epics:nt/NTURI:1.0");
    assert_eq!(arg.get("scheme").unwrap().as_str(), Some("pva"));
    assert_eq!(arg.get("path").unwrap().as_str(), Some("svc:sum"));
    assert_eq!(arg.get("query.lhs").unwrap().as_f64(), Some(1.0));
    assert_eq!(arg.get("query.rhs").unwrap().as_f64(), Some(2.0));

    let mut result = Value::structure(
        "",
        vec![("sum".to_string(), Value::scalar(ScalarKind::Float64))],
    );
    result.set("sum", 3.0).unwrap();
    conn.send_exec_value(CMD_RPC, exec.ioid, Some(&result)).await;
    conn.expect_destroy().await;

    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value.get("sum").unwrap().as_f64(), Some(3.0));
}

#[tokio::test]
async fn info_returns_prototype() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx.info("pv:info").server(addr).exec().await.unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(9).await;
    let (sid, ioid, subfield) = conn.expect_get_field().await;
    assert_eq!(sid, 9);
    assert_eq!(subfield, "");
    let proto = nt_double();
    conn.send_get_field_reply(ioid, &proto).await;

    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value, proto);
    // GET_FIELD is single-shot, no destroy is exchanged
    conn.expect_nothing(Duration::from_millis(200)).await;
    assert_eq!(table_sizes(&ctx).await, (0, 0, 0));
}

#[tokio::test]
async fn remote_error_completes_operation() {
    let (server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx.get("pv:err").server(addr).exec().await.unwrap();

    let mut conn = server.accept().await;
    conn.open_channel(4).await;
    let init = conn.expect_gpr(CMD_GET).await;
    conn.send_error_reply(CMD_GET, init.ioid, SUBCMD_INIT, "no such pv")
        .await;
    conn.expect_destroy().await;

    match op.wait().await.unwrap_err() {
        Error::Remote(msg) => assert_eq!(msg, "no such pv"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn builder_validation_errors() {
    let ctx = Context::new(test_config()).unwrap();

    let err = ctx.put("pv").exec().await.unwrap_err();
    assert!(matches!(err, Error::Logic(_)), "got {err:?}");

    let err = ctx
        .put("pv")
        .set("value", 1.0)
        .set("value", 2.0)
        .exec()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Logic(_)), "got {err:?}");

    let err = ctx
        .rpc("pv")
        .arg("a", 1i32)
        .argument(Value::empty())
        .exec()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Logic(_)), "got {err:?}");

    let err = ctx.discover().exec().await.unwrap_err();
    assert!(matches!(err, Error::Logic(_)), "got {err:?}");
}

#[tokio::test]
async fn context_drop_cancels_waiters() {
    let (_server, addr) = PeerServer::bind().await;
    let ctx = Context::new(test_config()).unwrap();
    let op = ctx.get("pv:orphan").server(addr).exec().await.unwrap();
    drop(ctx);
    let err = op.wait().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err:?}");
}

#[tokio::test]
async fn search_resolves_channel() {
    let (server, tcp_addr) = PeerServer::bind().await;
    let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ctx = Context::new(Config {
        address_list: vec![responder.local_addr().unwrap()],
        ..test_config()
    })
    .unwrap();
    let op = ctx.get("searched:pv").exec().await.unwrap();

    // the search names the channel and asks for a reply port
    let mut buf = [0u8; 4096];
    let (n, from) = responder.recv_from(&mut buf).await.unwrap();
    let (_, req) = parse_search(&buf[..n]).unwrap();
    assert_eq!(req.channels.len(), 1);
    assert_eq!(req.channels[0].1, "searched:pv");
    assert_ne!(req.reply_port, 0);

    responder
        .send_to(
            &search_reply_frame(&SearchReply {
                guid: *b"search-guid1",
                seq: req.seq,
                server: None,
                port: tcp_addr.port(),
                found: true,
                cids: vec![req.channels[0].0],
            }),
            from,
        )
        .await
        .unwrap();

    let mut conn = server.accept().await;
    let (_, name) = conn.open_channel(3).await;
    assert_eq!(name, "searched:pv");
    let proto = nt_double();
    let init = conn.expect_gpr(CMD_GET).await;
    conn.send_init_reply(CMD_GET, init.ioid, &proto).await;
    let exec = conn.expect_gpr(CMD_GET).await;
    let mut value = proto.clone_empty();
    value.set("value", 6.25).unwrap();
    conn.send_exec_value(CMD_GET, exec.ioid, Some(&value)).await;
    conn.expect_destroy().await;
    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value.get("value").unwrap().as_f64(), Some(6.25));
}

#[tokio::test]
async fn discovery_reports_servers_and_stops_on_cancel() {
    let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ctx = Context::new(Config {
        address_list: vec![responder.local_addr().unwrap()],
        ..test_config()
    })
    .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let discovery = ctx
        .discover()
        .notify(move |d| {
            let _ = tx.send(d);
        })
        .exec()
        .await
        .unwrap();

    // the first search goes out promptly, with no channels and the
    // reply-required flag
    let mut buf = [0u8; 4096];
    let (n, from) = responder.recv_from(&mut buf).await.unwrap();
    let (_, req) = parse_search(&buf[..n]).unwrap();
    assert!(req.reply_required);
    assert!(req.channels.is_empty());

    // backoff is running and bounded
    let age = ctx.worker().call(|core| core.discover_age).await.unwrap();
    assert!((1..=10).contains(&age), "age {age}");

    responder
        .send_to(
            &search_reply_frame(&SearchReply {
                guid: *b"disco-guid-1",
                seq: req.seq,
                server: None,
                port: 5075,
                found: false,
                cids: Vec::new(),
            }),
            from,
        )
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert_eq!(event.guid, Guid(*b"disco-guid-1"));
    assert_eq!(event.server, "127.0.0.1:5075".parse().unwrap());

    // removal stops the reschedule on its own
    assert!(discovery.cancel().await.unwrap());
    let silence = tokio::time::timeout(Duration::from_secs(2), responder.recv_from(&mut buf)).await;
    assert!(silence.is_err(), "search sent after cancel");
}
