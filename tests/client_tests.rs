//! Full-stack exercise of the public client API against a minimal
//! scripted PVA peer.

use bytes::BytesMut;
use pvars::client::Context;
use pvars::value::{ScalarKind, Value};
use pvars::wire::{
    CMD_CONNECTION_VALIDATED, CMD_CONNECTION_VALIDATION, CMD_CREATE_CHANNEL, CMD_DESTROY_REQUEST,
    CMD_GET, CMD_PUT, Frame, FrameCodec, PvStatus, RxBuf, SUBCMD_GET, SUBCMD_INIT, TxBuf, TxFrame,
    from_wire_valid, to_wire_type, to_wire_valid, write_status,
};
use pvars::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{info, level_filters::LevelFilter};

struct Peer {
    stream: TcpStream,
    codec: FrameCodec,
    buf: BytesMut,
    next_type: u16,
}

impl Peer {
    async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                return frame;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client hung up");
        }
    }

    async fn send(&mut self, cmd: u8, build: impl FnOnce(&mut TxBuf, &mut u16)) {
        let mut tx = TxBuf::new();
        build(&mut tx, &mut self.next_type);
        let mut out = BytesMut::new();
        self.codec
            .encode(
                TxFrame {
                    cmd,
                    from_server: true,
                    body: tx.take(),
                },
                &mut out,
            )
            .unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Validation exchange and channel grant for the next CREATE_CHANNEL.
    async fn handshake(&mut self, sid: u32) -> String {
        self.send(CMD_CONNECTION_VALIDATION, |tx, _| {
            tx.put_u32(0x0001_0000);
            tx.put_u16(0x7FFF);
            tx.put_size(1);
            tx.put_string("anonymous");
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.cmd, CMD_CONNECTION_VALIDATION);
        self.send(CMD_CONNECTION_VALIDATED, |tx, _| {
            write_status(tx, &PvStatus::ok());
        })
        .await;

        let create = self.recv().await;
        assert_eq!(create.cmd, CMD_CREATE_CHANNEL);
        let mut rx = RxBuf::new(&create.body, create.big_endian);
        assert_eq!(rx.read_u16(), 1);
        let cid = rx.read_u32();
        let name = rx.read_string();
        assert!(rx.good());
        self.send(CMD_CREATE_CHANNEL, |tx, _| {
            tx.put_u32(cid);
            tx.put_u32(sid);
            write_status(tx, &PvStatus::ok());
        })
        .await;
        name
    }

    /// Read a GET/PUT request and return (ioid, subcmd, frame).
    async fn request(&mut self, cmd: u8) -> (u32, u8, Frame) {
        let frame = self.recv().await;
        assert_eq!(frame.cmd, cmd);
        let mut rx = RxBuf::new(&frame.body, frame.big_endian);
        let _sid = rx.read_u32();
        let ioid = rx.read_u32();
        let subcmd = rx.read_u8();
        assert!(rx.good());
        (ioid, subcmd, frame)
    }
}

fn nt_double() -> Value {
    Value::structure(
        "epics:nt/NTScalar:1.0",
        vec![("value".to_string(), Value::scalar(ScalarKind::Float64))],
    )
}

#[tokio::test]
async fn get_then_put_round_trip() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .try_init()
        .ok();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = Context::new(Config {
        address_list: Vec::new(),
        auto_addr_list: false,
        ..Config::default()
    })
    .unwrap();
    let proto = nt_double();

    // ---- GET ----
    let op = ctx.get("demo:value").server(addr).exec().await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let mut peer = Peer {
        stream,
        codec: FrameCodec,
        buf: BytesMut::new(),
        next_type: 0,
    };
    let name = peer.handshake(17).await;
    assert_eq!(name, "demo:value");
    info!("channel '{name}' open");

    let (ioid, subcmd, _) = peer.request(CMD_GET).await;
    assert_eq!(subcmd, SUBCMD_INIT);
    let p = proto.clone();
    peer.send(CMD_GET, |tx, next| {
        tx.put_u32(ioid);
        tx.put_u8(SUBCMD_INIT);
        write_status(tx, &PvStatus::ok());
        to_wire_type(tx, Some(&p), next);
    })
    .await;

    let (ioid, subcmd, _) = peer.request(CMD_GET).await;
    assert_eq!(subcmd, 0);
    let mut value = proto.clone_empty();
    value.set("value", 42.0).unwrap();
    peer.send(CMD_GET, |tx, _| {
        tx.put_u32(ioid);
        tx.put_u8(0);
        write_status(tx, &PvStatus::ok());
        to_wire_valid(tx, &value);
    })
    .await;
    let destroy = peer.recv().await;
    assert_eq!(destroy.cmd, CMD_DESTROY_REQUEST);

    let reply = op.wait().await.unwrap();
    assert_eq!(reply.value.get("value").unwrap().as_f64(), Some(42.0));

    // ---- PUT on the same channel and connection ----
    let op = ctx
        .put("demo:value")
        .set("value", 41.5)
        .exec()
        .await
        .unwrap();
    let (ioid, subcmd, _) = peer.request(CMD_PUT).await;
    assert_eq!(subcmd & SUBCMD_INIT, SUBCMD_INIT);
    let p = proto.clone();
    peer.send(CMD_PUT, |tx, next| {
        tx.put_u32(ioid);
        tx.put_u8(SUBCMD_INIT);
        write_status(tx, &PvStatus::ok());
        to_wire_type(tx, Some(&p), next);
    })
    .await;

    // the field-map put goes straight to exec, no 0x40 phase
    let (ioid, subcmd, frame) = peer.request(CMD_PUT).await;
    assert_eq!(subcmd & SUBCMD_GET, 0);
    let mut rx = RxBuf::new(&frame.body, frame.big_endian);
    let _sid = rx.read_u32();
    let _ioid = rx.read_u32();
    let _subcmd = rx.read_u8();
    let mut written = proto.clone_empty();
    from_wire_valid(&mut rx, &mut written);
    assert!(rx.good());
    assert_eq!(written.get("value").unwrap().as_f64(), Some(41.5));

    peer.send(CMD_PUT, |tx, _| {
        tx.put_u32(ioid);
        tx.put_u8(0);
        write_status(tx, &PvStatus::ok());
    })
    .await;
    let destroy = peer.recv().await;
    assert_eq!(destroy.cmd, CMD_DESTROY_REQUEST);
    op.wait().await.unwrap();

    ctx.close();
}
