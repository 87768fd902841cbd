//! PVA wire framing and body (de)serialization.
//!
//! Every PVA message is an 8-byte header (magic, version, flags, command
//! byte) followed by a length-prefixed body in the byte order declared by
//! the header flags. TCP framing is handled by [`FrameCodec`], a
//! [`tokio_util::codec`] decoder/encoder; bodies are read through
//! [`RxBuf`], a typed cursor with a sticky fault flag, and assembled in a
//! [`TxBuf`] scratch buffer which is committed atomically with its command
//! byte.
//!
//! Type descriptors are cached per connection in a [`TypeRegistry`]:
//! `0xFD id desc` stores a descriptor under an id, `0xFE id` refers back
//! to it, `0xFF` is the null type. Values are encoded either *full*
//! (every leaf) or *valid* (a leaf bitset plus only the set leaves,
//! decoded against a previously communicated prototype).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::Location;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    bytes::complete::{tag, take},
    number::complete::{be_u16, be_u32, le_u16, le_u32, u8 as nom_u8},
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::value::{Scalar, ScalarKind, Value};

pub const MAGIC: u8 = 0xCA;
pub const VERSION: u8 = 2;

/// Header flag bits.
pub mod flags {
    /// Body is big-endian.
    pub const MSB: u8 = 0x80;
    /// Message sent by a server.
    pub const FROM_SERVER: u8 = 0x40;
    /// Segmentation bits; segmented messages are not supported.
    pub const SEG_MASK: u8 = 0x30;
    /// Control message, no body.
    pub const CONTROL: u8 = 0x01;
}

/// Application command bytes used by the client core.
pub const CMD_SEARCH: u8 = 0x03;
pub const CMD_SEARCH_RESPONSE: u8 = 0x04;
pub const CMD_CONNECTION_VALIDATION: u8 = 0x01;
pub const CMD_CREATE_CHANNEL: u8 = 0x07;
pub const CMD_DESTROY_CHANNEL: u8 = 0x08;
pub const CMD_CONNECTION_VALIDATED: u8 = 0x09;
pub const CMD_GET: u8 = 0x0A;
pub const CMD_PUT: u8 = 0x0B;
pub const CMD_DESTROY_REQUEST: u8 = 0x0F;
pub const CMD_GET_FIELD: u8 = 0x11;
pub const CMD_MESSAGE: u8 = 0x12;
pub const CMD_RPC: u8 = 0x14;

/// Operation subcommand bits.
pub const SUBCMD_INIT: u8 = 0x08;
pub const SUBCMD_GET: u8 = 0x40;
pub const SUBCMD_EXEC: u8 = 0x00;

/// One decoded application message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: u8,
    pub big_endian: bool,
    pub from_server: bool,
    pub body: Bytes,
}

/// An outbound message. Bodies are always transmitted big-endian.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub cmd: u8,
    pub from_server: bool,
    pub body: Bytes,
}

/// Frame-level codec for a PVA TCP stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            if src.len() < 8 {
                return Ok(None);
            }
            if src[0] != MAGIC || src[1] == 0 {
                return Err(Error::protocol(format!(
                    "bad header {:02x}{:02x}{:02x}{:02x}",
                    src[0], src[1], src[2], src[3]
                )));
            }
            let hflags = src[2];
            if hflags & flags::SEG_MASK != 0 {
                return Err(Error::protocol("segmented message"));
            }
            let big_endian = hflags & flags::MSB != 0;
            let len = {
                let raw = [src[4], src[5], src[6], src[7]];
                if big_endian {
                    u32::from_be_bytes(raw)
                } else {
                    u32::from_le_bytes(raw)
                }
            } as usize;
            if hflags & flags::CONTROL != 0 {
                // control messages carry their payload in the length field
                src.advance(8);
                continue;
            }
            if src.len() < 8 + len {
                src.reserve(8 + len - src.len());
                return Ok(None);
            }
            let cmd = src[3];
            let from_server = hflags & flags::FROM_SERVER != 0;
            src.advance(8);
            let body = src.split_to(len).freeze();
            return Ok(Some(Frame {
                cmd,
                big_endian,
                from_server,
                body,
            }));
        }
    }
}

impl Encoder<TxFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: TxFrame, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(8 + frame.body.len());
        dst.put_u8(MAGIC);
        dst.put_u8(VERSION);
        let mut hflags = flags::MSB;
        if frame.from_server {
            hflags |= flags::FROM_SERVER;
        }
        dst.put_u8(hflags);
        dst.put_u8(frame.cmd);
        dst.put_u32(frame.body.len() as u32);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

/// Typed read cursor over a message body.
///
/// Any malformed read sets a sticky fault recording the first faulting
/// caller location; subsequent reads return defaults. A consumer
/// observing `!good()` after parsing must abort processing of the
/// message and close the connection.
pub struct RxBuf<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    fault: Option<&'static Location<'static>>,
}

impl<'a> RxBuf<'a> {
    pub fn new(data: &'a [u8], big_endian: bool) -> RxBuf<'a> {
        RxBuf {
            data,
            pos: 0,
            big_endian,
            fault: None,
        }
    }

    pub fn good(&self) -> bool {
        self.fault.is_none()
    }

    /// Location of the first fault, for diagnostics.
    pub fn fault_at(&self) -> Option<&'static Location<'static>> {
        self.fault
    }

    #[track_caller]
    pub fn set_fault(&mut self) {
        if self.fault.is_none() {
            self.fault = Some(Location::caller());
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[track_caller]
    fn take(&mut self, n: usize) -> &'a [u8] {
        if self.fault.is_some() || self.remaining() < n {
            self.set_fault();
            return &[];
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    #[track_caller]
    pub fn read_u8(&mut self) -> u8 {
        self.take(1).first().copied().unwrap_or(0)
    }

    #[track_caller]
    pub fn read_u16(&mut self) -> u16 {
        match self.take(2).try_into() {
            Ok(raw) => {
                if self.big_endian {
                    u16::from_be_bytes(raw)
                } else {
                    u16::from_le_bytes(raw)
                }
            }
            Err(_) => 0,
        }
    }

    #[track_caller]
    pub fn read_u32(&mut self) -> u32 {
        match self.take(4).try_into() {
            Ok(raw) => {
                if self.big_endian {
                    u32::from_be_bytes(raw)
                } else {
                    u32::from_le_bytes(raw)
                }
            }
            Err(_) => 0,
        }
    }

    #[track_caller]
    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    #[track_caller]
    pub fn read_f64(&mut self) -> f64 {
        match self.take(8).try_into() {
            Ok(raw) => {
                if self.big_endian {
                    f64::from_be_bytes(raw)
                } else {
                    f64::from_le_bytes(raw)
                }
            }
            Err(_) => 0.0,
        }
    }

    /// PVA size encoding: `u8 < 0xFE` inline, `0xFE` + u32 extended.
    /// `0xFF` (null) faults where a concrete size is required.
    #[track_caller]
    pub fn read_size(&mut self) -> usize {
        match self.read_u8() {
            0xFF => {
                self.set_fault();
                0
            }
            0xFE => self.read_u32() as usize,
            n => n as usize,
        }
    }

    #[track_caller]
    pub fn read_string(&mut self) -> String {
        let len = self.read_size();
        match std::str::from_utf8(self.take(len)) {
            Ok(s) => s.to_string(),
            Err(_) => {
                self.set_fault();
                String::new()
            }
        }
    }
}

/// Scratch buffer for one outbound message body. Always big-endian.
#[derive(Debug, Default)]
pub struct TxBuf {
    data: BytesMut,
}

impl TxBuf {
    pub fn new() -> TxBuf {
        TxBuf::default()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the assembled body, leaving the buffer empty for reuse.
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.put_u32(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.put_i32(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.data.put_f64(v);
    }

    pub fn put_size(&mut self, n: usize) {
        if n < 0xFE {
            self.data.put_u8(n as u8);
        } else {
            self.data.put_u8(0xFE);
            self.data.put_u32(n as u32);
        }
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_size(s.len());
        self.data.extend_from_slice(s.as_bytes());
    }

    pub fn put_bytes(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }
}

/// Reply status: 0xFF shorthand for success, otherwise code plus message
/// and call-tree strings. Code 0 is also success.
#[derive(Debug, Clone, PartialEq)]
pub struct PvStatus {
    pub code: u8,
    pub msg: String,
    pub trace: String,
}

impl PvStatus {
    pub fn ok() -> PvStatus {
        PvStatus {
            code: 0,
            msg: String::new(),
            trace: String::new(),
        }
    }

    pub fn error(msg: impl Into<String>) -> PvStatus {
        PvStatus {
            code: 2,
            msg: msg.into(),
            trace: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

pub fn read_status(rx: &mut RxBuf) -> PvStatus {
    match rx.read_u8() {
        0xFF => PvStatus::ok(),
        code => {
            let msg = rx.read_string();
            let trace = rx.read_string();
            PvStatus { code, msg, trace }
        }
    }
}

pub fn write_status(tx: &mut TxBuf, sts: &PvStatus) {
    if sts.is_success() && sts.msg.is_empty() && sts.trace.is_empty() {
        tx.put_u8(0xFF);
    } else {
        tx.put_u8(sts.code);
        tx.put_string(&sts.msg);
        tx.put_string(&sts.trace);
    }
}

// Type descriptor lead bytes
const TYPE_NULL: u8 = 0xFF;
const TYPE_FULL_WITH_ID: u8 = 0xFD;
const TYPE_ID_ONLY: u8 = 0xFE;

// Concrete type codes
const TC_BOOL: u8 = 0x00;
const TC_INT32: u8 = 0x22;
const TC_UINT32: u8 = 0x26;
const TC_FLOAT64: u8 = 0x43;
const TC_STRING: u8 = 0x60;
const TC_STRUCT: u8 = 0x80;

/// Per-connection cache of received type descriptors.
///
/// This registry is stateful across messages: a descriptor skipped or
/// mis-parsed leaves it out of sync with the peer, which is why codec
/// faults force connection teardown.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_id: HashMap<u16, Value>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn write_desc(tx: &mut TxBuf, proto: &Value) {
    match proto {
        Value::Scalar { kind, .. } => tx.put_u8(match kind {
            ScalarKind::Bool => TC_BOOL,
            ScalarKind::Int32 => TC_INT32,
            ScalarKind::UInt32 => TC_UINT32,
            ScalarKind::Float64 => TC_FLOAT64,
            ScalarKind::String => TC_STRING,
        }),
        Value::Struct { id, fields } => {
            tx.put_u8(TC_STRUCT);
            tx.put_string(id);
            tx.put_size(fields.len());
            for (name, fld) in fields {
                tx.put_string(name);
                write_desc(tx, fld);
            }
        }
    }
}

fn read_desc(rx: &mut RxBuf) -> Value {
    match rx.read_u8() {
        TC_BOOL => Value::scalar(ScalarKind::Bool),
        TC_INT32 => Value::scalar(ScalarKind::Int32),
        TC_UINT32 => Value::scalar(ScalarKind::UInt32),
        TC_FLOAT64 => Value::scalar(ScalarKind::Float64),
        TC_STRING => Value::scalar(ScalarKind::String),
        TC_STRUCT => {
            let id = rx.read_string();
            let n = rx.read_size();
            let mut fields = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                if !rx.good() {
                    break;
                }
                let name = rx.read_string();
                let fld = read_desc(rx);
                fields.push((name, fld));
            }
            Value::Struct { id, fields }
        }
        _ => {
            rx.set_fault();
            Value::scalar(ScalarKind::Bool)
        }
    }
}

/// Serialize a type descriptor, assigning it a fresh registry id from the
/// connection's counter. `None` writes the null type.
pub fn to_wire_type(tx: &mut TxBuf, proto: Option<&Value>, next_id: &mut u16) {
    match proto {
        None => tx.put_u8(TYPE_NULL),
        Some(proto) => {
            let id = *next_id;
            *next_id = next_id.wrapping_add(1);
            tx.put_u8(TYPE_FULL_WITH_ID);
            tx.put_u16(id);
            write_desc(tx, proto);
        }
    }
}

/// Deserialize a type descriptor, updating the registry. Returns `None`
/// for the null type. An id reference to an unknown descriptor faults.
pub fn from_wire_type(rx: &mut RxBuf, reg: &mut TypeRegistry) -> Option<Value> {
    match rx.read_u8() {
        TYPE_NULL => None,
        TYPE_FULL_WITH_ID => {
            let id = rx.read_u16();
            let proto = read_desc(rx);
            if rx.good() {
                reg.by_id.insert(id, proto.clone());
            }
            Some(proto)
        }
        TYPE_ID_ONLY => {
            let id = rx.read_u16();
            match reg.by_id.get(&id) {
                Some(proto) => Some(proto.clone_empty()),
                None => {
                    rx.set_fault();
                    None
                }
            }
        }
        _ => {
            rx.set_fault();
            None
        }
    }
}

fn write_leaf(tx: &mut TxBuf, kind: ScalarKind, store: Option<&Scalar>) {
    match (kind, store) {
        (ScalarKind::Bool, s) => tx.put_u8(matches!(s, Some(Scalar::Bool(true))) as u8),
        (ScalarKind::Int32, Some(Scalar::Int32(v))) => tx.put_i32(*v),
        (ScalarKind::Int32, _) => tx.put_i32(0),
        (ScalarKind::UInt32, Some(Scalar::UInt32(v))) => tx.put_u32(*v),
        (ScalarKind::UInt32, _) => tx.put_u32(0),
        (ScalarKind::Float64, Some(Scalar::Float64(v))) => tx.put_f64(*v),
        (ScalarKind::Float64, _) => tx.put_f64(0.0),
        (ScalarKind::String, Some(Scalar::String(v))) => tx.put_string(v),
        (ScalarKind::String, _) => tx.put_string(""),
    }
}

fn read_leaf(rx: &mut RxBuf, kind: ScalarKind) -> Option<Scalar> {
    let s = match kind {
        ScalarKind::Bool => Scalar::Bool(rx.read_u8() != 0),
        ScalarKind::Int32 => Scalar::Int32(rx.read_i32()),
        ScalarKind::UInt32 => Scalar::UInt32(rx.read_u32()),
        ScalarKind::Float64 => Scalar::Float64(rx.read_f64()),
        ScalarKind::String => Scalar::String(rx.read_string()),
    };
    rx.good().then_some(s)
}

/// Serialize every leaf of `value` in depth-first order.
pub fn to_wire_full(tx: &mut TxBuf, value: &Value) {
    for leaf in value.leaves() {
        let Value::Scalar { kind, store } = leaf else {
            unreachable!("leaves() yields scalars");
        };
        write_leaf(tx, *kind, store.as_ref());
    }
}

/// Fill every leaf of `value` in depth-first order.
pub fn from_wire_full(rx: &mut RxBuf, value: &mut Value) {
    for leaf in value.leaves_mut() {
        let Value::Scalar { kind, store } = leaf else {
            unreachable!("leaves_mut() yields scalars");
        };
        *store = read_leaf(rx, *kind);
    }
}

/// Serialize only the set leaves, preceded by a leaf bitset. Bit 0 means
/// "everything"; leaf `i` in depth-first order is bit `i + 1`.
pub fn to_wire_valid(tx: &mut TxBuf, value: &Value) {
    let leaves = value.leaves();
    let all_set = leaves.iter().all(|l| matches!(l, Value::Scalar { store: Some(_), .. }));
    let nbits = leaves.len() + 1;
    let mut bits = vec![0u8; nbits.div_ceil(8)];
    if all_set {
        bits[0] |= 1;
    } else {
        for (i, leaf) in leaves.iter().enumerate() {
            if matches!(leaf, Value::Scalar { store: Some(_), .. }) {
                bits[(i + 1) / 8] |= 1 << ((i + 1) % 8);
            }
        }
    }
    tx.put_size(bits.len());
    tx.put_bytes(&bits);
    for (i, leaf) in leaves.iter().enumerate() {
        let Value::Scalar { kind, store } = leaf else {
            unreachable!("leaves() yields scalars");
        };
        let marked = all_set || bits[(i + 1) / 8] & (1 << ((i + 1) % 8)) != 0;
        if marked {
            write_leaf(tx, *kind, store.as_ref());
        }
    }
}

/// Decode a valid-encoded value into `value` (typically a prototype
/// clone), setting only the leaves marked in the bitset.
pub fn from_wire_valid(rx: &mut RxBuf, value: &mut Value) {
    let nbytes = rx.read_size();
    let mut bits = vec![0u8; nbytes];
    for b in bits.iter_mut() {
        *b = rx.read_u8();
    }
    if !rx.good() {
        return;
    }
    let all = bits.first().is_some_and(|b| b & 1 != 0);
    for (i, leaf) in value.leaves_mut().into_iter().enumerate() {
        let marked = all
            || bits
                .get((i + 1) / 8)
                .is_some_and(|b| b & (1 << ((i + 1) % 8)) != 0);
        if !marked {
            continue;
        }
        let Value::Scalar { kind, store } = leaf else {
            unreachable!("leaves_mut() yields scalars");
        };
        *store = read_leaf(rx, *kind);
    }
}

/// A search datagram: channels being looked for, or none with
/// `reply_required` for server discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub seq: u32,
    pub reply_required: bool,
    pub unicast: bool,
    pub reply_port: u16,
    pub channels: Vec<(u32, String)>,
}

/// A search reply datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchReply {
    pub guid: [u8; 12],
    pub seq: u32,
    pub server: Option<Ipv4Addr>,
    pub port: u16,
    pub found: bool,
    pub cids: Vec<u32>,
}

const SEARCH_UNICAST: u8 = 0x80;
const SEARCH_REPLY_REQUIRED: u8 = 0x01;

fn datagram(cmd: u8, from_server: bool, body: Bytes) -> Vec<u8> {
    let mut codec = FrameCodec;
    let mut out = BytesMut::new();
    codec
        .encode(
            TxFrame {
                cmd,
                from_server,
                body,
            },
            &mut out,
        )
        .expect("infallible encode");
    out.to_vec()
}

/// Build a complete search datagram, header included.
pub fn search_frame(req: &SearchRequest) -> Vec<u8> {
    let mut tx = TxBuf::new();
    tx.put_u32(req.seq);
    let mut sflags = 0u8;
    if req.unicast {
        sflags |= SEARCH_UNICAST;
    }
    if req.reply_required {
        sflags |= SEARCH_REPLY_REQUIRED;
    }
    tx.put_u8(sflags);
    tx.put_bytes(&[0u8; 3]); // reserved
    tx.put_bytes(&[0u8; 16]); // reply address, any
    tx.put_u16(req.reply_port);
    tx.put_size(1);
    tx.put_string("tcp");
    tx.put_u16(req.channels.len() as u16);
    for (cid, name) in &req.channels {
        tx.put_u32(*cid);
        tx.put_string(name);
    }
    datagram(CMD_SEARCH, false, tx.take())
}

/// Build a complete search reply datagram, header included.
pub fn search_reply_frame(rep: &SearchReply) -> Vec<u8> {
    let mut tx = TxBuf::new();
    tx.put_bytes(&rep.guid);
    tx.put_u32(rep.seq);
    let mut addr = [0u8; 16];
    if let Some(v4) = rep.server {
        addr[10] = 0xFF;
        addr[11] = 0xFF;
        addr[12..].copy_from_slice(&v4.octets());
    }
    tx.put_bytes(&addr);
    tx.put_u16(rep.port);
    tx.put_string("tcp");
    tx.put_u8(rep.found as u8);
    tx.put_u16(rep.cids.len() as u16);
    for cid in &rep.cids {
        tx.put_u32(*cid);
    }
    datagram(CMD_SEARCH_RESPONSE, true, tx.take())
}

fn num_u16(be: bool, input: &[u8]) -> IResult<&[u8], u16> {
    if be { be_u16(input) } else { le_u16(input) }
}

fn num_u32(be: bool, input: &[u8]) -> IResult<&[u8], u32> {
    if be { be_u32(input) } else { le_u32(input) }
}

fn short_string(input: &[u8]) -> IResult<&[u8], &str> {
    let (input, len) = nom_u8(input)?;
    if len >= 0xFE {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (input, raw) = take(len as usize)(input)?;
    let s = std::str::from_utf8(raw).map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Char))
    })?;
    Ok((input, s))
}

fn udp_header(expect_cmd: u8, input: &[u8]) -> IResult<&[u8], bool> {
    let (input, _) = tag(&[MAGIC][..])(input)?;
    let (input, version) = nom_u8(input)?;
    let (input, hflags) = nom_u8(input)?;
    let (input, cmd) = nom_u8(input)?;
    if version == 0 || cmd != expect_cmd || hflags & (flags::CONTROL | flags::SEG_MASK) != 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let be = hflags & flags::MSB != 0;
    let (input, _len) = num_u32(be, input)?;
    Ok((input, be))
}

fn addr16(input: &[u8]) -> IResult<&[u8], Option<Ipv4Addr>> {
    let (input, raw) = take(16usize)(input)?;
    let server = if raw.iter().all(|&b| b == 0) {
        None
    } else {
        Some(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
    };
    Ok((input, server))
}

/// Parse a search datagram (header included).
pub fn parse_search(input: &[u8]) -> IResult<&[u8], SearchRequest> {
    let (input, be) = udp_header(CMD_SEARCH, input)?;
    let (input, seq) = num_u32(be, input)?;
    let (input, sflags) = nom_u8(input)?;
    let (input, _) = take(3usize)(input)?;
    let (input, _addr) = addr16(input)?;
    let (input, reply_port) = num_u16(be, input)?;
    let (mut input, nproto) = nom_u8(input)?;
    for _ in 0..nproto {
        let (rest, _proto) = short_string(input)?;
        input = rest;
    }
    let (mut input, count) = num_u16(be, input)?;
    let mut channels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, cid) = num_u32(be, input)?;
        let (rest, name) = short_string(rest)?;
        channels.push((cid, name.to_string()));
        input = rest;
    }
    Ok((
        input,
        SearchRequest {
            seq,
            reply_required: sflags & SEARCH_REPLY_REQUIRED != 0,
            unicast: sflags & SEARCH_UNICAST != 0,
            reply_port,
            channels,
        },
    ))
}

/// Parse a search reply datagram (header included).
pub fn parse_search_reply(input: &[u8]) -> IResult<&[u8], SearchReply> {
    let (input, be) = udp_header(CMD_SEARCH_RESPONSE, input)?;
    let (input, raw_guid) = take(12usize)(input)?;
    let (input, seq) = num_u32(be, input)?;
    let (input, server) = addr16(input)?;
    let (input, port) = num_u16(be, input)?;
    let (input, proto) = short_string(input)?;
    if proto != "tcp" {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (input, found) = nom_u8(input)?;
    let (mut input, count) = num_u16(be, input)?;
    let mut cids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, cid) = num_u32(be, input)?;
        cids.push(cid);
        input = rest;
    }
    let mut guid = [0u8; 12];
    guid.copy_from_slice(raw_guid);
    Ok((
        input,
        SearchReply {
            guid,
            seq,
            server,
            port,
            found: found != 0,
            cids,
        },
    ))
}
