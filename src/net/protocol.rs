// Wire protocol
//
// Every frame is {magic 4B | command 12B NUL-padded ASCII | payload
// length 4B LE | checksum 4B | payload}. The checksum is the first four
// bytes of sha256d(payload). Oversized frames and unknown commands are
// protocol violations; the peer task closes and bans the sender.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::hash::{Hash, sha256d};
use crate::primitives::block::{Block, BlockHeader, MAX_BLOCK_SIZE};
use crate::primitives::codec::{self, DecodeResult, Reader};
use crate::primitives::coin::ChainTag;
use crate::primitives::transaction::{MAX_TX_SIZE, Transaction};

/// 0xD9B4BEF9, written little-endian on the wire.
pub const NETWORK_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];
pub const MAX_FRAME: usize = 4 * 1024 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;

const COMMAND_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 4 + COMMAND_LEN + 4 + 4;

pub const MAX_HEADERS_PER_MSG: usize = 2000;
pub const MAX_INV_PER_MSG: usize = 50_000;
pub const MAX_ADDRS_PER_MSG: usize = 1000;
pub const MAX_LOCATOR_HASHES: usize = 101;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("bad network magic")]
    BadMagic,
    #[error("frame exceeds maximum size")]
    Oversize,
    #[error("payload checksum mismatch")]
    BadChecksum,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    fn as_u8(self) -> u8 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        }
    }

    fn from_u8(v: u8) -> DecodeResult<Self> {
        match v {
            1 => Ok(InvKind::Tx),
            2 => Ok(InvKind::Block),
            _ => Err("unknown inventory kind"),
        }
    }
}

/// One advertised or requested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvKind,
    pub chain: ChainTag,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(chain: ChainTag, hash: Hash) -> Self {
        InvItem {
            kind: InvKind::Block,
            chain,
            hash,
        }
    }

    pub fn tx(chain: ChainTag, hash: Hash) -> Self {
        InvItem {
            kind: InvKind::Tx,
            chain,
            hash,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.as_u8());
        buf.push(self.chain.as_u8());
        codec::write_hash(buf, &self.hash);
    }

    fn decode(r: &mut Reader<'_>) -> DecodeResult<Self> {
        Ok(InvItem {
            kind: InvKind::from_u8(r.read_u8()?)?,
            chain: ChainTag::from_u8(r.read_u8()?)?,
            hash: r.read_hash()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// Random per-connection nonce for self-connect detection.
    pub nonce: u64,
    pub listen_addr: Option<SocketAddr>,
    pub golden_height: u64,
    pub silver_height: u64,
}

/// Chain-locator query for getheaders / getblocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorQuery {
    pub chain: ChainTag,
    /// Geometric-backoff list of ancestor hashes, newest first.
    pub locator: Vec<Hash>,
    /// All-zero means "as many as fit".
    pub stop: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPayload {
    /// The command being rejected.
    pub command: String,
    /// Stable error-kind code.
    pub code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetHeaders(LocatorQuery),
    GetBlocks(LocatorQuery),
    Headers(ChainTag, Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Addr(Vec<SocketAddr>),
    GetAddr,
    Reject(RejectPayload),
}

fn write_socket_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.push(0x04);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            buf.push(0x06);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

fn read_socket_addr(r: &mut Reader<'_>) -> DecodeResult<SocketAddr> {
    match r.read_u8()? {
        0x04 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(r.take(4)?);
            let port = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
            Ok(SocketAddr::new(std::net::IpAddr::V4(ip.into()), port))
        }
        0x06 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(r.take(16)?);
            let port = u16::from_be_bytes(r.take(2)?.try_into().unwrap());
            Ok(SocketAddr::new(std::net::IpAddr::V6(ip.into()), port))
        }
        _ => Err("unknown address family"),
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    codec::write_bytes(buf, s.as_bytes());
}

fn read_string(r: &mut Reader<'_>, max: usize) -> DecodeResult<String> {
    let raw = r.read_bytes(max)?;
    String::from_utf8(raw).map_err(|_| "invalid utf-8 string")
}

fn read_inv_list(r: &mut Reader<'_>) -> DecodeResult<Vec<InvItem>> {
    let count = r.read_varint()? as usize;
    if count > MAX_INV_PER_MSG {
        return Err("inventory list too long");
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InvItem::decode(r)?);
    }
    Ok(items)
}

fn write_inv_list(buf: &mut Vec<u8>, items: &[InvItem]) {
    codec::write_varint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

fn write_locator(buf: &mut Vec<u8>, q: &LocatorQuery) {
    buf.push(q.chain.as_u8());
    codec::write_varint(buf, q.locator.len() as u64);
    for hash in &q.locator {
        codec::write_hash(buf, hash);
    }
    codec::write_hash(buf, &q.stop);
}

fn read_locator(r: &mut Reader<'_>) -> DecodeResult<LocatorQuery> {
    let chain = ChainTag::from_u8(r.read_u8()?)?;
    let count = r.read_varint()? as usize;
    if count > MAX_LOCATOR_HASHES {
        return Err("locator too long");
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(r.read_hash()?);
    }
    let stop = r.read_hash()?;
    Ok(LocatorQuery {
        chain,
        locator,
        stop,
    })
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::Headers(_, _) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Reject(_) => "reject",
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                codec::write_u32(&mut buf, v.protocol_version);
                codec::write_u64(&mut buf, v.services);
                codec::write_i64(&mut buf, v.timestamp);
                codec::write_u64(&mut buf, v.nonce);
                match &v.listen_addr {
                    Some(addr) => {
                        buf.push(1);
                        write_socket_addr(&mut buf, addr);
                    }
                    None => buf.push(0),
                }
                codec::write_u64(&mut buf, v.golden_height);
                codec::write_u64(&mut buf, v.silver_height);
            }
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                codec::write_u64(&mut buf, *nonce);
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write_inv_list(&mut buf, items);
            }
            Message::GetHeaders(q) | Message::GetBlocks(q) => {
                write_locator(&mut buf, q);
            }
            Message::Headers(chain, headers) => {
                buf.push(chain.as_u8());
                codec::write_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    header.encode(&mut buf);
                }
            }
            Message::Block(block) => {
                buf.extend_from_slice(&block.encode());
            }
            Message::Tx(tx) => {
                buf.extend_from_slice(&tx.encode(true));
            }
            Message::Addr(addrs) => {
                codec::write_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    write_socket_addr(&mut buf, addr);
                }
            }
            Message::Reject(r) => {
                write_string(&mut buf, &r.command);
                write_string(&mut buf, &r.code);
                write_string(&mut buf, &r.reason);
            }
        }
        buf
    }

    fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(payload);
        let msg = (|| -> DecodeResult<Message> {
            let msg = match command {
                "version" => {
                    let protocol_version = r.read_u32()?;
                    let services = r.read_u64()?;
                    let timestamp = r.read_i64()?;
                    let nonce = r.read_u64()?;
                    let listen_addr = match r.read_u8()? {
                        0 => None,
                        1 => Some(read_socket_addr(&mut r)?),
                        _ => return Err("bad listen address flag"),
                    };
                    let golden_height = r.read_u64()?;
                    let silver_height = r.read_u64()?;
                    Message::Version(VersionPayload {
                        protocol_version,
                        services,
                        timestamp,
                        nonce,
                        listen_addr,
                        golden_height,
                        silver_height,
                    })
                }
                "verack" => Message::Verack,
                "ping" => Message::Ping(r.read_u64()?),
                "pong" => Message::Pong(r.read_u64()?),
                "inv" => Message::Inv(read_inv_list(&mut r)?),
                "getdata" => Message::GetData(read_inv_list(&mut r)?),
                "notfound" => Message::NotFound(read_inv_list(&mut r)?),
                "getheaders" => Message::GetHeaders(read_locator(&mut r)?),
                "getblocks" => Message::GetBlocks(read_locator(&mut r)?),
                "headers" => {
                    let chain = ChainTag::from_u8(r.read_u8()?)?;
                    let count = r.read_varint()? as usize;
                    if count > MAX_HEADERS_PER_MSG {
                        return Err("too many headers");
                    }
                    let mut headers = Vec::with_capacity(count);
                    for _ in 0..count {
                        headers.push(BlockHeader::decode(&mut r)?);
                    }
                    Message::Headers(chain, headers)
                }
                "block" => {
                    if payload.len() > MAX_BLOCK_SIZE {
                        return Err("block too large");
                    }
                    Message::Block(Block::decode(payload)?)
                }
                "tx" => {
                    if payload.len() > MAX_TX_SIZE {
                        return Err("transaction too large");
                    }
                    Message::Tx(Transaction::decode_all(payload)?)
                }
                "addr" => {
                    let count = r.read_varint()? as usize;
                    if count > MAX_ADDRS_PER_MSG {
                        return Err("address list too long");
                    }
                    let mut addrs = Vec::with_capacity(count);
                    for _ in 0..count {
                        addrs.push(read_socket_addr(&mut r)?);
                    }
                    Message::Addr(addrs)
                }
                "getaddr" => Message::GetAddr,
                "reject" => Message::Reject(RejectPayload {
                    command: read_string(&mut r, 12)?,
                    code: read_string(&mut r, 32)?,
                    reason: read_string(&mut r, 256)?,
                }),
                _ => return Err("unknown command"),
            };
            // block/tx decode their whole payload themselves
            if !matches!(msg, Message::Block(_) | Message::Tx(_)) && !r.is_empty() {
                return Err("trailing bytes in payload");
            }
            Ok(msg)
        })();
        msg.map_err(|e| {
            if e == "unknown command" {
                WireError::UnknownCommand(command.to_string())
            } else {
                WireError::BadPayload(e)
            }
        })
    }

    /// Full frame: magic, NUL-padded command, length, checksum, payload.
    pub fn encode_frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let checksum = &sha256d(&payload).0[..4];

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&NETWORK_MAGIC);
        let mut command = [0u8; COMMAND_LEN];
        command[..self.command().len()].copy_from_slice(self.command().as_bytes());
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(checksum);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode one frame from the front of `data`. Returns the message and
    /// the frame length, or None when more bytes are needed.
    pub fn decode_frame(data: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
        if data.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if data[..4] != NETWORK_MAGIC {
            return Err(WireError::BadMagic);
        }
        let command_raw = &data[4..4 + COMMAND_LEN];
        let payload_len =
            u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;
        if payload_len > MAX_FRAME {
            return Err(WireError::Oversize);
        }
        let total = FRAME_HEADER_LEN + payload_len;
        if data.len() < total {
            return Ok(None);
        }
        let checksum = &data[20..24];
        let payload = &data[FRAME_HEADER_LEN..total];
        if &sha256d(payload).0[..4] != checksum {
            return Err(WireError::BadChecksum);
        }

        let end = command_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LEN);
        let command = std::str::from_utf8(&command_raw[..end])
            .map_err(|_| WireError::UnknownCommand(format!("{command_raw:?}")))?;
        if command_raw[end..].iter().any(|&b| b != 0) {
            return Err(WireError::UnknownCommand(command.to_string()));
        }

        let msg = Message::decode_payload(command, payload)?;
        Ok(Some((msg, total)))
    }
}

/// Buffered frame reader over the read half of a connection.
pub struct FramedReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        FramedReader {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next message, or None on clean EOF.
    pub async fn recv(&mut self) -> Result<Option<Message>, WireError> {
        loop {
            match Message::decode_frame(&self.buf)? {
                Some((msg, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(Some(msg));
                }
                None => {
                    let mut tmp = [0u8; 4096];
                    let n = self.inner.read(&mut tmp).await?;
                    if n == 0 {
                        return Ok(None);
                    }
                    self.buf.extend_from_slice(&tmp[..n]);
                }
            }
        }
    }
}

/// Frame writer over the write half of a connection.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        FramedWriter { inner }
    }

    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.inner.write_all(&msg.encode_frame()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::genesis::genesis_block;

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode_frame();
        let (decoded, consumed) = Message::decode_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        decoded
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = Message::Version(VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            timestamp: 1_800_000_000,
            nonce: 0xDEAD_BEEF_CAFE_F00D,
            listen_addr: Some("127.0.0.1:7500".parse().unwrap()),
            golden_height: 42,
            silver_height: 17,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_version_without_listen_addr() {
        let msg = Message::Version(VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 0,
            timestamp: 0,
            nonce: 1,
            listen_addr: None,
            golden_height: 0,
            silver_height: 0,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        assert_eq!(roundtrip(Message::Ping(99)), Message::Ping(99));
        assert_eq!(roundtrip(Message::Pong(99)), Message::Pong(99));
    }

    #[test]
    fn test_inv_getdata_roundtrip() {
        let items = vec![
            InvItem::block(ChainTag::Golden, sha256d(b"b")),
            InvItem::tx(ChainTag::Silver, sha256d(b"t")),
        ];
        assert_eq!(
            roundtrip(Message::Inv(items.clone())),
            Message::Inv(items.clone())
        );
        assert_eq!(
            roundtrip(Message::GetData(items.clone())),
            Message::GetData(items.clone())
        );
        assert_eq!(
            roundtrip(Message::NotFound(items.clone())),
            Message::NotFound(items)
        );
    }

    #[test]
    fn test_locator_roundtrip() {
        let q = LocatorQuery {
            chain: ChainTag::Silver,
            locator: vec![sha256d(b"a"), sha256d(b"b")],
            stop: Hash::ZERO,
        };
        assert_eq!(
            roundtrip(Message::GetHeaders(q.clone())),
            Message::GetHeaders(q.clone())
        );
        assert_eq!(
            roundtrip(Message::GetBlocks(q.clone())),
            Message::GetBlocks(q)
        );
    }

    #[test]
    fn test_block_headers_tx_roundtrip() {
        let block = genesis_block(ChainTag::Golden);
        let headers = vec![block.header, genesis_block(ChainTag::Silver).header];
        assert_eq!(
            roundtrip(Message::Headers(ChainTag::Golden, headers.clone())),
            Message::Headers(ChainTag::Golden, headers)
        );
        let tx = block.transactions[0].clone();
        assert_eq!(
            roundtrip(Message::Block(block.clone())),
            Message::Block(block)
        );
        assert_eq!(roundtrip(Message::Tx(tx.clone())), Message::Tx(tx));
    }

    #[test]
    fn test_addr_reject_roundtrip() {
        let addrs = vec![
            "10.0.0.1:7500".parse().unwrap(),
            "[::1]:7501".parse().unwrap(),
        ];
        assert_eq!(
            roundtrip(Message::Addr(addrs.clone())),
            Message::Addr(addrs)
        );
        let reject = Message::Reject(RejectPayload {
            command: "block".into(),
            code: "block_invalid".into(),
            reason: "merkle root mismatch".into(),
        });
        assert_eq!(roundtrip(reject.clone()), reject);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = Message::Verack.encode_frame();
        frame[0] = 0xFF;
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(WireError::BadMagic)
        ));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut frame = Message::Ping(7).encode_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(WireError::BadChecksum)
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut frame = Message::Verack.encode_frame();
        frame[4..10].copy_from_slice(b"bogus\0");
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(WireError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut frame = Message::Verack.encode_frame();
        frame[16..20].copy_from_slice(&((MAX_FRAME + 1) as u32).to_le_bytes());
        assert!(matches!(
            Message::decode_frame(&frame),
            Err(WireError::Oversize)
        ));
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let frame = Message::Ping(7).encode_frame();
        assert!(Message::decode_frame(&frame[..10]).unwrap().is_none());
        assert!(
            Message::decode_frame(&frame[..frame.len() - 1])
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_framed_stream_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_, client_w) = tokio::io::split(client);
        let (server_r, _) = tokio::io::split(server);

        let mut writer = FramedWriter::new(client_w);
        let mut reader = FramedReader::new(server_r);

        writer.send(&Message::Ping(1)).await.unwrap();
        writer.send(&Message::GetAddr).await.unwrap();

        assert_eq!(reader.recv().await.unwrap(), Some(Message::Ping(1)));
        assert_eq!(reader.recv().await.unwrap(), Some(Message::GetAddr));
    }
}
