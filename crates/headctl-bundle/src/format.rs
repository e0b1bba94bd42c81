//! The `HBDL` animation bundle container.
//!
//! All integers are little-endian.
//!
//! ```text
//! magic      "HBDL"
//! version    u16      (1)
//! reserved   u16
//! duration   u32      declared total duration, ms
//! tables     u16      number of tables that follow
//! table*     tag [4] · body_len u32 · body
//!
//! "GAZE"  count u32 · count × (t_ms u32, x u8, y u8)
//! "MOUT"  count u32 · count × (t_ms u32, position u8)
//! "AUDI"  encoding u8 · audio_ms u32 · data_len u32 · data
//! "EYEL"  count u32 · count × (t_ms u32, flags u8)   optional
//! ```
//!
//! `EYEL` flags: bit 0 left eyelid closed, bit 1 right eyelid closed; other
//! bits must be zero.
//!
//! Unknown table tags are skipped so newer writers can add channels. `GAZE`,
//! `MOUT` and `AUDI` must appear exactly once, `EYEL` at most once.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use headctl_types::{EyelidState, GazePosition, HeadError};
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, Keyframe};

pub const MAGIC: &[u8; 4] = b"HBDL";
pub const VERSION: u16 = 1;

/// Allowed gap between the declared duration and the longest channel.
pub const DURATION_TOLERANCE_MS: u32 = 50;

const TAG_GAZE: [u8; 4] = *b"GAZE";
const TAG_MOUTH: [u8; 4] = *b"MOUT";
const TAG_AUDIO: [u8; 4] = *b"AUDI";
const TAG_EYELIDS: [u8; 4] = *b"EYEL";

const LID_LEFT: u8 = 0b01;
const LID_RIGHT: u8 = 0b10;

// ────────────────────────────────────────────────────────────────────────────
// In-memory model
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Silent bundle.
    None,
    /// RIFF/WAVE PCM, decoded by the external audio player.
    PcmWav,
}

impl AudioEncoding {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AudioEncoding::None),
            1 => Some(AudioEncoding::PcmWav),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            AudioEncoding::None => 0,
            AudioEncoding::PcmWav => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub encoding: AudioEncoding,
    pub duration_ms: u32,
    pub data: Bytes,
}

impl AudioSegment {
    pub fn silent() -> Self {
        Self {
            encoding: AudioEncoding::None,
            duration_ms: 0,
            data: Bytes::new(),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.encoding == AudioEncoding::None
    }
}

/// A validated, read-only bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationBundle {
    pub id: String,
    pub duration_ms: u32,
    pub gaze: Channel<GazePosition>,
    pub mouth: Channel<u8>,
    /// Empty when the bundle carries no eyelid track.
    pub eyelids: Channel<EyelidState>,
    pub audio: AudioSegment,
}

impl AnimationBundle {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms as u64)
    }

    /// Latest timestamp carried by any channel.
    pub fn content_end_ms(&self) -> u32 {
        let gaze = self.gaze.end_ms().unwrap_or(0);
        let mouth = self.mouth.end_ms().unwrap_or(0);
        let eyelids = self.eyelids.end_ms().unwrap_or(0);
        gaze.max(mouth).max(eyelids).max(self.audio.duration_ms)
    }

    /// Check the cross-channel invariants that [`decode`] enforces.
    pub fn validate(&self) -> Result<(), HeadError> {
        if self.gaze.is_empty() && self.mouth.is_empty() {
            return Err(corrupt("bundle has no gaze or mouth keyframes"));
        }
        if self.audio.encoding == AudioEncoding::PcmWav && self.audio.data.is_empty() {
            return Err(corrupt("pcm audio segment carries no data"));
        }
        let end = self.content_end_ms();
        if self.duration_ms.abs_diff(end) > DURATION_TOLERANCE_MS {
            return Err(corrupt(format!(
                "declared duration {} ms does not match content end {} ms",
                self.duration_ms, end
            )));
        }
        Ok(())
    }
}

fn corrupt(reason: impl Into<String>) -> HeadError {
    HeadError::CorruptBundle(reason.into())
}

// ────────────────────────────────────────────────────────────────────────────
// Decode
// ────────────────────────────────────────────────────────────────────────────

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), HeadError> {
    if buf.remaining() < n {
        Err(corrupt(format!(
            "truncated {what}: need {n} byte(s), have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

/// Decode and validate a bundle container.
///
/// # Errors
///
/// Returns [`HeadError::CorruptBundle`] on any structural or validation
/// failure.
pub fn decode(id: impl Into<String>, data: &[u8]) -> Result<AnimationBundle, HeadError> {
    let mut buf = data;

    need(buf, 14, "header")?;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = buf.get_u16_le();
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let _reserved = buf.get_u16_le();
    let duration_ms = buf.get_u32_le();
    let table_count = buf.get_u16_le();

    let mut gaze = None;
    let mut mouth = None;
    let mut audio = None;
    let mut eyelids = None;

    for _ in 0..table_count {
        need(buf, 8, "table header")?;
        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        let len = buf.get_u32_le() as usize;
        need(buf, len, "table body")?;
        let (body, rest) = buf.split_at(len);
        buf = rest;

        match tag {
            TAG_GAZE => set_once(&mut gaze, decode_gaze(body)?, "GAZE")?,
            TAG_MOUTH => set_once(&mut mouth, decode_mouth(body)?, "MOUT")?,
            TAG_AUDIO => set_once(&mut audio, decode_audio(body)?, "AUDI")?,
            TAG_EYELIDS => set_once(&mut eyelids, decode_eyelids(body)?, "EYEL")?,
            _ => {}
        }
    }

    if buf.has_remaining() {
        return Err(corrupt(format!("{} trailing byte(s)", buf.remaining())));
    }

    let bundle = AnimationBundle {
        id: id.into(),
        duration_ms,
        gaze: gaze.ok_or_else(|| corrupt("missing GAZE table"))?,
        mouth: mouth.ok_or_else(|| corrupt("missing MOUT table"))?,
        eyelids: eyelids.unwrap_or_default(),
        audio: audio.ok_or_else(|| corrupt("missing AUDI table"))?,
    };
    bundle.validate()?;
    Ok(bundle)
}

fn set_once<T>(slot: &mut Option<T>, value: T, tag: &str) -> Result<(), HeadError> {
    if slot.is_some() {
        return Err(corrupt(format!("duplicate {tag} table")));
    }
    *slot = Some(value);
    Ok(())
}

fn decode_keyframes<T>(
    mut body: &[u8],
    stride: usize,
    what: &str,
    read: impl Fn(&mut &[u8]) -> T,
) -> Result<Vec<Keyframe<T>>, HeadError> {
    need(body, 4, what)?;
    let count = body.get_u32_le() as usize;
    let expected = count
        .checked_mul(4 + stride)
        .ok_or_else(|| corrupt(format!("{what} keyframe count overflows")))?;
    if body.remaining() != expected {
        return Err(corrupt(format!(
            "{what} table declares {count} keyframe(s) but body holds {} byte(s)",
            body.remaining()
        )));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let t_ms = body.get_u32_le();
        out.push(Keyframe::new(t_ms, read(&mut body)));
    }
    Ok(out)
}

fn decode_gaze(body: &[u8]) -> Result<Channel<GazePosition>, HeadError> {
    let frames = decode_keyframes(body, 2, "gaze", |b| {
        let x = b.get_u8();
        let y = b.get_u8();
        GazePosition::new(x, y)
    })?;
    Channel::new(frames).ok_or_else(|| corrupt("gaze keyframes out of order"))
}

fn decode_mouth(body: &[u8]) -> Result<Channel<u8>, HeadError> {
    let frames = decode_keyframes(body, 1, "mouth", |b| b.get_u8())?;
    Channel::new(frames).ok_or_else(|| corrupt("mouth keyframes out of order"))
}

fn decode_eyelids(body: &[u8]) -> Result<Channel<EyelidState>, HeadError> {
    let frames = decode_keyframes(body, 1, "eyelid", |b| b.get_u8())?;
    let mut out = Vec::with_capacity(frames.len());
    for k in frames {
        if k.value & !(LID_LEFT | LID_RIGHT) != 0 {
            return Err(corrupt(format!("eyelid flags 0x{:02x} at {} ms", k.value, k.t_ms)));
        }
        let state = EyelidState::new(k.value & LID_LEFT != 0, k.value & LID_RIGHT != 0);
        out.push(Keyframe::new(k.t_ms, state));
    }
    Channel::new(out).ok_or_else(|| corrupt("eyelid keyframes out of order"))
}

fn decode_audio(mut body: &[u8]) -> Result<AudioSegment, HeadError> {
    need(body, 9, "audio table")?;
    let raw = body.get_u8();
    let encoding = AudioEncoding::from_byte(raw)
        .ok_or_else(|| corrupt(format!("unsupported audio encoding {raw}")))?;
    let duration_ms = body.get_u32_le();
    let len = body.get_u32_le() as usize;
    if body.remaining() != len {
        return Err(corrupt(format!(
            "audio table declares {len} data byte(s) but holds {}",
            body.remaining()
        )));
    }
    Ok(AudioSegment {
        encoding,
        duration_ms,
        data: Bytes::copy_from_slice(body),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Encode
// ────────────────────────────────────────────────────────────────────────────

/// Serialise a bundle into the container format.
pub fn encode(bundle: &AnimationBundle) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(MAGIC);
    out.put_u16_le(VERSION);
    out.put_u16_le(0);
    out.put_u32_le(bundle.duration_ms);
    out.put_u16_le(if bundle.eyelids.is_empty() { 3 } else { 4 });

    let mut gaze = BytesMut::new();
    gaze.put_u32_le(bundle.gaze.len() as u32);
    for k in bundle.gaze.keyframes() {
        gaze.put_u32_le(k.t_ms);
        gaze.put_u8(k.value.x);
        gaze.put_u8(k.value.y);
    }
    put_table(&mut out, TAG_GAZE, &gaze);

    let mut mouth = BytesMut::new();
    mouth.put_u32_le(bundle.mouth.len() as u32);
    for k in bundle.mouth.keyframes() {
        mouth.put_u32_le(k.t_ms);
        mouth.put_u8(k.value);
    }
    put_table(&mut out, TAG_MOUTH, &mouth);

    let mut audio = BytesMut::new();
    audio.put_u8(bundle.audio.encoding.to_byte());
    audio.put_u32_le(bundle.audio.duration_ms);
    audio.put_u32_le(bundle.audio.data.len() as u32);
    audio.put_slice(&bundle.audio.data);
    put_table(&mut out, TAG_AUDIO, &audio);

    if !bundle.eyelids.is_empty() {
        let mut lids = BytesMut::new();
        lids.put_u32_le(bundle.eyelids.len() as u32);
        for k in bundle.eyelids.keyframes() {
            lids.put_u32_le(k.t_ms);
            let mut flags = 0;
            if k.value.left_closed {
                flags |= LID_LEFT;
            }
            if k.value.right_closed {
                flags |= LID_RIGHT;
            }
            lids.put_u8(flags);
        }
        put_table(&mut out, TAG_EYELIDS, &lids);
    }

    out.freeze()
}

fn put_table(out: &mut BytesMut, tag: [u8; 4], body: &[u8]) {
    out.put_slice(&tag);
    out.put_u32_le(body.len() as u32);
    out.put_slice(body);
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
