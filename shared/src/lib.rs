//! Wire protocol shared between the subspace server and its clients.
//!
//! A message on the reliable channel is framed as
//! `{ i32 kind, i32 stored-length, stored payload }` in little-endian byte
//! order. The stored payload begins with a one-byte compression marker
//! (zlib or raw passthrough) unless it is empty. The datagram channel uses
//! the same frame prefixed with an `i32` sender index so the server can
//! attribute it to a session without a connection handle.
//!
//! This crate owns the message-kind enums, the frame/compression codec and
//! the typed payload encodings; it carries no server state.

pub mod codec;
pub mod payload;

use thiserror::Error;

/// Protocol version string compared verbatim during handshake. Bumping this
/// is the only way the compression codec or any payload layout may change.
pub const PROTOCOL_VERSION: &str = "0.2.0";

/// Hard ceiling on a declared payload length. Anything larger is a protocol
/// violation and aborts the connection.
pub const MAX_PAYLOAD_LEN: usize = 5 * 1024 * 1024;

/// Reliable-channel frame header size: i32 kind + i32 stored length.
pub const HEADER_LEN: usize = 8;

/// Datagram prefix: i32 sender index in front of the normal header.
pub const DATAGRAM_PREFIX_LEN: usize = 4;

/// Compression markers stored as the first payload byte.
pub const MARKER_RAW: u8 = 0x00;
pub const MARKER_ZLIB: u8 = 0x01;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("declared payload length {0} exceeds {MAX_PAYLOAD_LEN} bytes")]
    OversizedPayload(i64),
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("unknown message kind {0}")]
    UnknownKind(i32),
    #[error("unknown compression marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("truncated payload: needed {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },
    #[error("invalid utf-8 in field `{0}`")]
    InvalidUtf8(&'static str),
    #[error("invalid token string: {0}")]
    InvalidToken(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Message kinds sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ClientMessageKind {
    Handshake = 0,
    PrimaryUpdate = 1,
    SecondaryUpdate = 2,
    TextMessage = 3,
    WatchPlayer = 4,
    ScreenshotShare = 5,
    ConnectionEnd = 6,
    ShareCraftFile = 7,
    ActivityInFlight = 8,
    ActivityInGame = 9,
    Ping = 10,
    TickProbe = 11,
    Warping = 12,
    SubspaceSyncRequest = 13,
}

impl TryFrom<i32> for ClientMessageKind {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, CodecError> {
        use ClientMessageKind::*;
        Ok(match value {
            0 => Handshake,
            1 => PrimaryUpdate,
            2 => SecondaryUpdate,
            3 => TextMessage,
            4 => WatchPlayer,
            5 => ScreenshotShare,
            6 => ConnectionEnd,
            7 => ShareCraftFile,
            8 => ActivityInFlight,
            9 => ActivityInGame,
            10 => Ping,
            11 => TickProbe,
            12 => Warping,
            13 => SubspaceSyncRequest,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// Message kinds sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServerMessageKind {
    Null = 0,
    Handshake = 1,
    HandshakeRefusal = 2,
    ServerMessage = 3,
    TextMessage = 4,
    ObjectUpdate = 5,
    ScreenshotShare = 6,
    ServerSettings = 7,
    Sync = 8,
    SyncComplete = 9,
    DatagramAck = 10,
    PingReply = 11,
    CraftFile = 12,
    ConnectionEnd = 13,
}

impl TryFrom<i32> for ServerMessageKind {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, CodecError> {
        use ServerMessageKind::*;
        Ok(match value {
            0 => Null,
            1 => Handshake,
            2 => HandshakeRefusal,
            3 => ServerMessage,
            4 => TextMessage,
            5 => ObjectUpdate,
            6 => ScreenshotShare,
            7 => ServerSettings,
            8 => Sync,
            9 => SyncComplete,
            10 => DatagramAck,
            11 => PingReply,
            12 => CraftFile,
            13 => ConnectionEnd,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}
