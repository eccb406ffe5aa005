//! Payload encoding for [`Command`] and [`RenderResult`].
//!
//! Fixed-width fields are written big-endian in a fixed order, followed by
//! length-prefixed strings (`u32` byte count) and key/value lists (`u32`
//! element count). New fields are appended at the end; existing fields are
//! never reordered.
//!
//! Two framings share this payload encoding:
//!
//! - the sealed envelope used by shared-memory slots:
//!   ```text
//!   ┌───────────┬───────────┬──────────────┐
//!   │ body_len  │ checksum  │ body         │
//!   │ u32 BE    │ u32 BE    │ body_len B   │
//!   └───────────┴───────────┴──────────────┘
//!   ```
//! - the reliable-channel frame (see [`MessageHeader`](super::MessageHeader)).
//!
//! The checksum is xxh32 with seed 0, computed over the body only.

use bytes::{BufMut, Bytes, BytesMut};
use xxhash_rust::xxh32::xxh32;

use super::types::{
    BackendKind, Color, Command, CommandKind, ContentParameters, ContentSourceKind, Rect,
    RenderProperties, RenderResult, ResultStatus, SurfaceHandle,
};
use crate::error::{RenderwireError, Result};

/// Size of the sealed-envelope prefix (`body_len` + `checksum`).
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Checksum of a payload body.
#[inline]
pub fn checksum(body: &[u8]) -> u32 {
    xxh32(body, 0)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| RenderwireError::Serialization(format!("string of {} bytes", s.len())))?;
    buf.put_u32(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_pairs(buf: &mut BytesMut, pairs: &[(String, String)]) -> Result<()> {
    let count = u32::try_from(pairs.len())
        .map_err(|_| RenderwireError::Serialization(format!("{} list entries", pairs.len())))?;
    buf.put_u32(count);
    for (k, v) in pairs {
        put_str(buf, k)?;
        put_str(buf, v)?;
    }
    Ok(())
}

#[inline]
fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(v as u8);
}

#[inline]
fn put_color(buf: &mut BytesMut, c: Color) {
    buf.put_slice(&[c.r, c.g, c.b, c.a]);
}

fn put_content(buf: &mut BytesMut, c: &ContentParameters) -> Result<()> {
    buf.put_u32(c.source_kind.code());
    put_str(buf, &c.source_url)?;
    put_str(buf, &c.template_path)?;
    put_str(buf, &c.auth_token)?;
    buf.put_i32(c.refresh_interval_ms);
    put_bool(buf, c.cache_enabled);
    put_pairs(buf, &c.custom_headers)?;
    put_pairs(buf, &c.parameters)
}

fn put_properties(buf: &mut BytesMut, p: &RenderProperties) {
    buf.put_f32(p.opacity);
    put_bool(buf, p.visible);
    put_bool(buf, p.click_through);
    put_bool(buf, p.top_most);
    put_color(buf, p.background_color);
    buf.put_i32(p.z_order);
    put_bool(buf, p.enable_animations);
    buf.put_i32(p.target_fps);
    put_bool(buf, p.enable_vsync);
    buf.put_f32(p.scale_x);
    buf.put_f32(p.scale_y);
    buf.put_f32(p.rotation);
    put_bool(buf, p.enable_blur);
    buf.put_f32(p.blur_radius);
    put_bool(buf, p.enable_shadow);
    put_color(buf, p.shadow_color);
    buf.put_i32(p.shadow_offset_x);
    buf.put_i32(p.shadow_offset_y);
}

/// Encode a command body.
pub fn encode_command(cmd: &Command) -> Result<Bytes> {
    let c = &cmd.content_params;
    let hint = 128
        + c.source_url.len()
        + c.template_path.len()
        + c.auth_token.len()
        + (c.custom_headers.len() + c.parameters.len()) * 16;
    let mut buf = BytesMut::with_capacity(hint);

    buf.put_u64(cmd.id);
    buf.put_u32(cmd.kind.code());
    buf.put_u32(cmd.widget_id);
    buf.put_u64(cmd.target_surface.0);
    buf.put_u32(cmd.backend_hint.code());
    buf.put_i32(cmd.bounds.x);
    buf.put_i32(cmd.bounds.y);
    buf.put_i32(cmd.bounds.width);
    buf.put_i32(cmd.bounds.height);
    buf.put_u64(cmd.timestamp);
    put_content(&mut buf, c)?;
    put_properties(&mut buf, &cmd.render_properties);

    Ok(buf.freeze())
}

/// Encode a result body.
pub fn encode_result(result: &RenderResult) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(56 + result.error_message.len());

    buf.put_u64(result.command_id);
    buf.put_u32(result.widget_id);
    buf.put_u32(result.status.code());
    put_str(&mut buf, &result.error_message)?;
    buf.put_u64(result.render_time_ms);
    buf.put_u32(result.frame_count);
    buf.put_f32(result.avg_fps);
    buf.put_u64(result.memory_mb);
    buf.put_u64(result.timestamp);

    Ok(buf.freeze())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a payload body.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(RenderwireError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn i32(&mut self) -> Result<i32> {
        self.array().map(i32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn f32(&mut self) -> Result<f32> {
        self.array().map(f32::from_be_bytes)
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RenderwireError::Serialization(format!(
                "invalid bool byte {other}"
            ))),
        }
    }

    fn color(&mut self) -> Result<Color> {
        let [r, g, b, a] = self.array()?;
        Ok(Color { r, g, b, a })
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| RenderwireError::Serialization(format!("invalid UTF-8: {e}")))
    }

    fn pairs(&mut self) -> Result<Vec<(String, String)>> {
        let count = self.u32()? as usize;
        // Every pair needs at least two length prefixes.
        if count > self.remaining() / 8 {
            return Err(RenderwireError::Truncated {
                needed: self.pos + count.saturating_mul(8),
                available: self.buf.len(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let k = self.string()?;
            let v = self.string()?;
            out.push((k, v));
        }
        Ok(out)
    }

    fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(RenderwireError::Serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

fn unknown(what: &str, code: u32) -> RenderwireError {
    RenderwireError::Serialization(format!("unknown {what} code {code}"))
}

fn read_content(r: &mut PayloadReader<'_>) -> Result<ContentParameters> {
    let kind = r.u32()?;
    Ok(ContentParameters {
        source_kind: ContentSourceKind::from_code(kind)
            .ok_or_else(|| unknown("content source", kind))?,
        source_url: r.string()?,
        template_path: r.string()?,
        auth_token: r.string()?,
        refresh_interval_ms: r.i32()?,
        cache_enabled: r.bool()?,
        custom_headers: r.pairs()?,
        parameters: r.pairs()?,
    })
}

fn read_properties(r: &mut PayloadReader<'_>) -> Result<RenderProperties> {
    Ok(RenderProperties {
        opacity: r.f32()?,
        visible: r.bool()?,
        click_through: r.bool()?,
        top_most: r.bool()?,
        background_color: r.color()?,
        z_order: r.i32()?,
        enable_animations: r.bool()?,
        target_fps: r.i32()?,
        enable_vsync: r.bool()?,
        scale_x: r.f32()?,
        scale_y: r.f32()?,
        rotation: r.f32()?,
        enable_blur: r.bool()?,
        blur_radius: r.f32()?,
        enable_shadow: r.bool()?,
        shadow_color: r.color()?,
        shadow_offset_x: r.i32()?,
        shadow_offset_y: r.i32()?,
    })
}

/// Decode a command body. The whole buffer must be consumed.
pub fn decode_command(body: &[u8]) -> Result<Command> {
    let mut r = PayloadReader::new(body);

    let id = r.u64()?;
    let kind_code = r.u32()?;
    let kind = CommandKind::from_code(kind_code).ok_or_else(|| unknown("command", kind_code))?;
    let widget_id = r.u32()?;
    let target_surface = SurfaceHandle(r.u64()?);
    let backend_code = r.u32()?;
    let backend_hint =
        BackendKind::from_code(backend_code).ok_or_else(|| unknown("backend", backend_code))?;
    let bounds = Rect {
        x: r.i32()?,
        y: r.i32()?,
        width: r.i32()?,
        height: r.i32()?,
    };
    let timestamp = r.u64()?;
    let content_params = read_content(&mut r)?;
    let render_properties = read_properties(&mut r)?;
    r.finish()?;

    Ok(Command {
        id,
        kind,
        widget_id,
        target_surface,
        backend_hint,
        bounds,
        content_params,
        render_properties,
        timestamp,
    })
}

/// Decode a result body. The whole buffer must be consumed.
pub fn decode_result(body: &[u8]) -> Result<RenderResult> {
    let mut r = PayloadReader::new(body);

    let command_id = r.u64()?;
    let widget_id = r.u32()?;
    let status_code = r.u32()?;
    let status =
        ResultStatus::from_code(status_code).ok_or_else(|| unknown("status", status_code))?;
    let result = RenderResult {
        command_id,
        widget_id,
        status,
        error_message: r.string()?,
        render_time_ms: r.u64()?,
        frame_count: r.u32()?,
        avg_fps: r.f32()?,
        memory_mb: r.u64()?,
        timestamp: r.u64()?,
    };
    r.finish()?;
    Ok(result)
}

// ---------------------------------------------------------------------------
// Sealed envelope
// ---------------------------------------------------------------------------

/// Wrap a body in a `body_len | checksum | body` envelope.
pub fn seal(body: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(body.len())
        .map_err(|_| RenderwireError::Serialization(format!("body of {} bytes", body.len())))?;
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&checksum(body).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Validate an envelope and return its body.
///
/// `buf` may be longer than the envelope (a fixed-size slot); bytes past the
/// declared body length are ignored.
pub fn open_sealed(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < ENVELOPE_HEADER_SIZE {
        return Err(RenderwireError::Truncated {
            needed: ENVELOPE_HEADER_SIZE,
            available: buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let expected = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let end = ENVELOPE_HEADER_SIZE + len;
    if buf.len() < end {
        return Err(RenderwireError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }
    let body = &buf[ENVELOPE_HEADER_SIZE..end];
    let actual = checksum(body);
    if actual != expected {
        return Err(RenderwireError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

/// Encode and seal a command.
pub fn seal_command(cmd: &Command) -> Result<Vec<u8>> {
    seal(&encode_command(cmd)?)
}

/// Open and decode a sealed command.
pub fn open_command(buf: &[u8]) -> Result<Command> {
    decode_command(open_sealed(buf)?)
}

/// Encode and seal a result.
pub fn seal_result(result: &RenderResult) -> Result<Vec<u8>> {
    seal(&encode_result(result)?)
}

/// Open and decode a sealed result.
pub fn open_result(buf: &[u8]) -> Result<RenderResult> {
    decode_result(open_sealed(buf)?)
}
