//! Typed payload encodings.
//!
//! All multi-byte scalars are little-endian. Strings are `i32 length +
//! utf-8 bytes` unless a payload documents a trailing "remainder" string,
//! which consumes everything left in the payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CodecError;

/// Cursor over a received payload.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, CodecError> {
        let b = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(b);
        Ok(Uuid::from_bytes(bytes))
    }

    /// Reads an `i32 length + bytes` string.
    pub fn read_string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    /// Consumes the rest of the payload as raw bytes.
    pub fn rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        out
    }

    /// Consumes the rest of the payload as a utf-8 string.
    pub fn rest_string(&mut self, field: &'static str) -> Result<String, CodecError> {
        String::from_utf8(self.rest()).map_err(|_| CodecError::InvalidUtf8(field))
    }
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_i32(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

/// First client message on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub username: String,
    pub token: Uuid,
    pub version: String,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.username);
        put_string(&mut out, &self.token.to_string());
        out.extend_from_slice(self.version.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let username = r.read_string("username")?;
        let token_str = r.read_string("token")?;
        let token = Uuid::parse_str(&token_str)
            .map_err(|_| CodecError::InvalidToken(token_str.clone()))?;
        let version = r.rest_string("version")?;
        Ok(Self {
            username,
            token,
            version,
        })
    }
}

/// Server handshake reply: the assigned numeric player id plus a greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub player_id: i32,
    pub motd: String,
}

impl HandshakeReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_i32(&mut out, self.player_id);
        out.extend_from_slice(self.motd.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let player_id = r.read_i32()?;
        let motd = r.rest_string("motd")?;
        Ok(Self { player_id, motd })
    }
}

/// Per-capita server settings pushed to every client. Exactly 13 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettingsMsg {
    pub update_interval_ms: i32,
    pub screenshot_interval_ms: i32,
    pub screenshot_max_height: i32,
    pub inactive_object_quota: u8,
}

impl ServerSettingsMsg {
    pub const WIRE_LEN: usize = 13;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        put_i32(&mut out, self.update_interval_ms);
        put_i32(&mut out, self.screenshot_interval_ms);
        put_i32(&mut out, self.screenshot_max_height);
        out.push(self.inactive_object_quota);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            update_interval_ms: r.read_i32()?,
            screenshot_interval_ms: r.read_i32()?,
            screenshot_max_height: r.read_i32()?,
            inactive_object_quota: r.read_u8()?,
        })
    }
}

/// A shared craft file, relayed and checkpointed as an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CraftFilePayload {
    pub craft_type: u8,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl CraftFilePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.name.len() + self.bytes.len());
        out.push(self.craft_type);
        put_string(&mut out, &self.name);
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let craft_type = r.read_u8()?;
        let name = r.read_string("craft name")?;
        let bytes = r.rest();
        Ok(Self {
            craft_type,
            name,
            bytes,
        })
    }
}

/// Periodic simulated-clock report from a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickProbe {
    pub tick: f64,
}

impl TickProbe {
    pub fn encode(&self) -> Vec<u8> {
        self.tick.to_le_bytes().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            tick: r.read_f64()?,
        })
    }
}

/// Correction offset sent instead of rewinding the universe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncCorrection {
    pub offset: f64,
}

impl SyncCorrection {
    pub fn encode(&self) -> Vec<u8> {
        self.offset.to_le_bytes().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            offset: r.read_f64()?,
        })
    }
}

/// Client time-warp rate report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpingReport {
    pub rate: f32,
    pub tick: f64,
}

impl WarpingReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.rate.to_le_bytes());
        out.extend_from_slice(&self.tick.to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        Ok(Self {
            rate: r.read_f32()?,
            tick: r.read_f64()?,
        })
    }
}

/// Inbound object state report (primary or secondary, by message kind).
#[derive(Debug, Clone, PartialEq)]
pub struct VesselReport {
    pub object_id: Uuid,
    pub name: String,
    pub tick: f64,
    pub private: bool,
    pub destroyed: bool,
    pub blob: Vec<u8>,
}

impl VesselReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.object_id.as_bytes());
        put_string(&mut out, &self.name);
        out.extend_from_slice(&self.tick.to_le_bytes());
        out.push(self.private as u8);
        out.push(self.destroyed as u8);
        out.extend_from_slice(&self.blob);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let object_id = r.read_uuid()?;
        let name = r.read_string("vessel name")?;
        let tick = r.read_f64()?;
        let private = r.read_u8()? != 0;
        let destroyed = r.read_u8()? != 0;
        let blob = r.rest();
        Ok(Self {
            object_id,
            name,
            tick,
            private,
            destroyed,
            blob,
        })
    }
}

/// How an outbound object update was relabeled for its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateVisibility {
    /// Recipient is the originating player for this object.
    Owned = 0,
    /// Same time-frame, full state, someone else's object.
    Peer = 1,
    /// Recipient is temporally at or after the sender; already happened.
    Past = 2,
    /// Name and status only; never grants authority.
    InfoOnly = 3,
}

impl TryFrom<u8> for UpdateVisibility {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => UpdateVisibility::Owned,
            1 => UpdateVisibility::Peer,
            2 => UpdateVisibility::Past,
            3 => UpdateVisibility::InfoOnly,
            other => return Err(CodecError::UnknownMarker(other)),
        })
    }
}

/// Body of an outbound object update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateBody {
    Full(Vec<u8>),
    Info { player_name: String, status: String },
}

/// Outbound object update, tailored per recipient. The destroyed flag
/// travels outside the opaque state blob so recipients can act on a
/// destruction without decoding it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdateMsg {
    pub visibility: UpdateVisibility,
    pub player_id: i32,
    pub object_id: Uuid,
    pub tick: f64,
    pub destroyed: bool,
    pub body: UpdateBody,
}

impl ObjectUpdateMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.visibility as u8);
        put_i32(&mut out, self.player_id);
        out.extend_from_slice(self.object_id.as_bytes());
        out.extend_from_slice(&self.tick.to_le_bytes());
        out.push(self.destroyed as u8);
        match &self.body {
            UpdateBody::Full(blob) => {
                out.push(1);
                out.extend_from_slice(blob);
            }
            UpdateBody::Info {
                player_name,
                status,
            } => {
                out.push(0);
                put_string(&mut out, player_name);
                put_string(&mut out, status);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let visibility = UpdateVisibility::try_from(r.read_u8()?)?;
        let player_id = r.read_i32()?;
        let object_id = r.read_uuid()?;
        let tick = r.read_f64()?;
        let destroyed = r.read_u8()? != 0;
        let body = if r.read_u8()? != 0 {
            UpdateBody::Full(r.rest())
        } else {
            UpdateBody::Info {
                player_name: r.read_string("player name")?,
                status: r.read_string("status")?,
            }
        };
        Ok(Self {
            visibility,
            player_id,
            object_id,
            tick,
            destroyed,
            body,
        })
    }
}

/// Payload of a `Sync` frame: either a correction offset for a lagging
/// clock or one object snapshot of the catch-up transaction begun when a
/// session leaves warp.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMsg {
    Correction(SyncCorrection),
    Snapshot(ObjectUpdateMsg),
}

impl SyncMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SyncMsg::Correction(correction) => {
                let mut out = Vec::with_capacity(9);
                out.push(0);
                out.extend_from_slice(&correction.encode());
                out
            }
            SyncMsg::Snapshot(update) => {
                let mut out = vec![1];
                out.extend_from_slice(&update.encode());
                out
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        match r.read_u8()? {
            0 => Ok(SyncMsg::Correction(SyncCorrection {
                offset: r.read_f64()?,
            })),
            1 => Ok(SyncMsg::Snapshot(ObjectUpdateMsg::decode(&r.rest())?)),
            other => Err(CodecError::UnknownMarker(other)),
        }
    }
}

/// A screenshot forwarded to sessions watching the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotRelay {
    pub from: String,
    pub bytes: Vec<u8>,
}

impl ScreenshotRelay {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.from.len() + self.bytes.len());
        put_string(&mut out, &self.from);
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let from = r.read_string("from")?;
        let bytes = r.rest();
        Ok(Self { from, bytes })
    }
}

/// A craft file forwarded to other sessions, attributed to its sharer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CraftRelay {
    pub from: String,
    pub craft: CraftFilePayload,
}

impl CraftRelay {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.from);
        out.extend_from_slice(&self.craft.encode());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let from = r.read_string("from")?;
        let craft = CraftFilePayload::decode(&r.rest())?;
        Ok(Self { from, craft })
    }
}

/// Relayed chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRelay {
    pub from: String,
    pub text: String,
}

impl TextRelay {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_string(&mut out, &self.from);
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(payload);
        let from = r.read_string("from")?;
        let text = r.rest_string("text")?;
        Ok(Self { from, text })
    }
}

/// Versioned envelope for craft and screenshot blobs that are both sent
/// over the wire and checkpointed into the store. Serialized with bincode
/// so the stored form never depends on any runtime object model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedBlob {
    pub version: u16,
    pub bytes: Vec<u8>,
}

impl VersionedBlob {
    pub const CURRENT_VERSION: u16 = 1;

    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            bytes,
        }
    }
}
