//! Write side: the unit/subunit engine.
//!
//! A [`Writer`] owns an arena of stream descriptors and a cursor over the
//! bytes it has emitted. Every unit opens with the header sequence Marker,
//! Index, Meta, Platform and closes with a Crc frame; subunits are announced
//! by lowercase `index` frames. User payloads are chunked to the maximum
//! frame payload and split further at alignment boundaries, with the `more`
//! bit chaining the chunks back into one logical frame.

use crate::crc::UnitDigest;
use crate::error::{Error, Result};
use crate::format::{
    builtin_streams, FrameLength, StreamConfig, StreamId, WriteFlags, CRC_FRAME_SIZE,
    DEFAULT_SUBUNIT, DEFAULT_UNIT, MARKER_BLOCK, MARKER_BYTE, MAX_HEADER_SIZE, MAX_PAYLOAD,
    MAX_STREAM_ID, MIN_UNIT_SIZE, PLATFORM_PROBE,
};
use crate::meta;
use crate::sink::FrameSink;
use crate::varint;

/// Container geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Unit size in bytes. Must be a power of two, at least
    /// [`MIN_UNIT_SIZE`].
    pub unit: u64,
    /// Subunit size in bytes. Must be a power of two, at least
    /// [`MIN_UNIT_SIZE`] and no larger than `unit`.
    pub subunit: u64,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            unit: DEFAULT_UNIT,
            subunit: DEFAULT_SUBUNIT,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        if self.unit < MIN_UNIT_SIZE || self.subunit < MIN_UNIT_SIZE {
            return Err(Error::Invalid("unit sizes must be at least 64 bytes"));
        }
        if !self.unit.is_power_of_two() || !self.subunit.is_power_of_two() {
            return Err(Error::Invalid("unit sizes must be powers of two"));
        }
        if self.unit < self.subunit {
            return Err(Error::Invalid("unit must not be smaller than subunit"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StreamSlot {
    config: StreamConfig,
    /// Open handle count.
    open: u32,
    /// Any payload has been written.
    used: bool,
    /// Still part of Meta/Index listings. Ids of delisted streams are never
    /// reused.
    listed: bool,
    /// Offset of the stream's first chunk within the most recent subunit
    /// that contains it.
    occurrence: Option<u64>,
}

impl StreamSlot {
    fn builtin(config: StreamConfig) -> StreamSlot {
        StreamSlot {
            config,
            open: 0,
            used: false,
            listed: true,
            occurrence: None,
        }
    }
}

/// Append-only container writer over a [`FrameSink`].
#[derive(Debug)]
pub struct Writer<S: FrameSink> {
    sink: S,
    params: Params,
    streams: Vec<StreamSlot>,
    free_id: u32,
    cursor: u64,
    unit_ordinal: u64,
    unit_end: u64,
    subunit_end: u64,
    meta_changed: bool,
    digest: UnitDigest,
}

impl<S: FrameSink> Writer<S> {
    /// Validate `params` and emit the first unit's header sequence.
    pub fn start(sink: S, params: Params) -> Result<Writer<S>> {
        params.validate()?;
        let streams = builtin_streams().into_iter().map(StreamSlot::builtin).collect();
        let mut writer = Writer {
            sink,
            params,
            streams,
            free_id: StreamId::FIRST_USER.0,
            cursor: 0,
            unit_ordinal: 0,
            unit_end: 0,
            subunit_end: 0,
            meta_changed: true,
            digest: UnitDigest::new(),
        };
        writer.open_unit()?;
        Ok(writer)
    }

    /// Emit the trailing Crc frame and signal the sink, returning it.
    ///
    /// The final unit is left at its current length; readers do not depend
    /// on trailing alignment.
    pub fn stop(mut self) -> Result<S> {
        self.emit_crc()?;
        self.sink.write(&[], WriteFlags::STOP | WriteFlags::FLUSH)?;
        Ok(self.sink)
    }

    /// Register a new stream, emitting an inline `meta` frame describing it.
    pub fn create(&mut self, config: StreamConfig) -> Result<StreamId> {
        if config.name.is_empty() {
            return Err(Error::Invalid("stream name must not be empty"));
        }
        if let FrameLength::Fixed(n) = config.frame_length {
            if n > MAX_PAYLOAD as u64 {
                return Err(Error::Invalid("fixed frame length exceeds the maximum payload"));
            }
        }
        if self.streams.iter().any(|s| s.listed && s.config.name == config.name) {
            return Err(Error::Exists(config.name));
        }
        if self.free_id > MAX_STREAM_ID {
            return Err(Error::NoMem);
        }

        let id = self.free_id;
        self.free_id += 1;
        self.streams.push(StreamSlot {
            config,
            open: 1,
            used: false,
            listed: true,
            occurrence: None,
        });
        self.meta_changed = true;

        if self.cursor != self.unit_end {
            let doc = meta::render_document(
                [(id, &self.streams[id as usize].config)],
                self.free_id,
            );
            self.write_frames(StreamId::SUBMETA, &doc, false)?;
        }

        Ok(StreamId(id))
    }

    /// Resolve an existing user stream by name, taking another reference.
    pub fn open_stream(&mut self, name: &str) -> Result<StreamId> {
        let user = StreamId::FIRST_USER.0 as usize;
        match self
            .streams
            .iter_mut()
            .enumerate()
            .skip(user)
            .find(|(_, s)| s.listed && s.config.name == name)
        {
            Some((id, slot)) => {
                slot.open += 1;
                Ok(StreamId(id as u32))
            }
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    /// Release one reference. On the last release the stream drops out of
    /// future Meta and Index listings; its id stays bound forever.
    pub fn close_stream(&mut self, id: StreamId) -> Result<()> {
        if id.is_builtin() {
            return Err(Error::Invalid("not a user stream"));
        }
        let slot = self
            .streams
            .get_mut(id.0 as usize)
            .ok_or(Error::Invalid("unknown stream id"))?;
        if slot.open == 0 {
            return Err(Error::Invalid("stream is not open"));
        }
        slot.open -= 1;
        if slot.open == 0 {
            slot.listed = false;
            self.meta_changed = true;
        }
        Ok(())
    }

    /// Write one payload to a stream.
    ///
    /// Payloads longer than the maximum frame payload are split into a
    /// chain of `more` frames; `more = true` keeps the chain open so the
    /// next write extends the same logical frame.
    pub fn write(&mut self, id: StreamId, buf: &[u8], more: bool) -> Result<()> {
        let slot = self
            .streams
            .get(id.0 as usize)
            .ok_or(Error::Invalid("unknown stream id"))?;
        if slot.open == 0 {
            return Err(Error::Invalid("stream is not open"));
        }
        if buf.is_empty() {
            return Ok(());
        }
        if let FrameLength::Fixed(n) = slot.config.frame_length {
            if buf.len() as u64 != n {
                return Err(Error::Invalid("payload must match the stream's fixed frame length"));
            }
        }
        self.write_frames(id, buf, more)
    }

    /// Render the current registry document to `out`.
    ///
    /// With `defaults` the built-in streams are included as well.
    pub fn meta_json<T: FrameSink>(&self, out: &mut T, defaults: bool) -> Result<()> {
        let user = StreamId::FIRST_USER.0 as usize;
        let doc = meta::render_document(
            self.streams
                .iter()
                .enumerate()
                .filter(|(id, s)| s.listed && (defaults || *id >= user))
                .map(|(id, s)| (id as u32, &s.config)),
            self.free_id,
        );
        out.write(&doc, WriteFlags::FLUSH)
    }

    /// Bytes emitted since `start`.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Ordinal of the unit currently being filled.
    pub fn unit_ordinal(&self) -> u64 {
        self.unit_ordinal
    }

    pub fn params(&self) -> Params {
        self.params
    }

    fn data_end(&self) -> u64 {
        // The unit's tail is reserved for the Crc frame.
        self.unit_end - CRC_FRAME_SIZE
    }

    fn emit(&mut self, buf: &[u8], flags: WriteFlags) -> Result<()> {
        self.digest.update(buf);
        self.emit_unhashed(buf, flags)
    }

    fn emit_unhashed(&mut self, buf: &[u8], flags: WriteFlags) -> Result<()> {
        if buf.is_empty() && flags == WriteFlags::NONE {
            return Ok(());
        }
        self.cursor = self
            .cursor
            .checked_add(buf.len() as u64)
            .ok_or(Error::Invalid("container size overflow"))?;
        self.sink.write(buf, flags)
    }

    /// Record `id`'s occurrence at the current cursor unless the stream
    /// already occurred within the current subunit.
    fn note_occurrence(&mut self, id: StreamId) {
        let subunit_start = self.subunit_end.saturating_sub(self.params.subunit);
        let cursor = self.cursor;
        let slot = &mut self.streams[id.0 as usize];
        match slot.occurrence {
            Some(o) if o >= subunit_start => {}
            _ => slot.occurrence = Some(cursor),
        }
    }

    fn write_frames(&mut self, id: StreamId, buf: &[u8], more: bool) -> Result<()> {
        let frame_length = self.streams[id.0 as usize].config.frame_length;
        let mut rest = buf;
        let mut first = true;
        let mut just_rotated = false;

        while !rest.is_empty() {
            let chunklen = match frame_length {
                FrameLength::Variable => rest.len().min(MAX_PAYLOAD),
                FrameLength::Fixed(_) => rest.len(),
            };
            let more_eff = more || chunklen != rest.len();
            let mut hdr = [0u8; MAX_HEADER_SIZE];
            let hdrlen = frame_header(id, frame_length, chunklen as u64, more_eff, &mut hdr);
            let need = (hdrlen + chunklen) as u64;

            let limit = self.data_end().min(self.subunit_end);
            let rem = limit.saturating_sub(self.cursor);
            let splittable = frame_length.is_variable() && rem > hdrlen as u64;

            // A unit too small for its own headers leaves the cursor past
            // the boundary grid; rotating again would never help, so the
            // frame is emitted where it stands. The same applies when a
            // rotation just happened and the frame still cannot fit or
            // split.
            if rem >= need || self.cursor > limit || (just_rotated && !splittable) {
                if first {
                    self.note_occurrence(id);
                    first = false;
                }
                self.emit(&hdr[..hdrlen], WriteFlags::NONE)?;
                self.emit(&rest[..chunklen], WriteFlags::NONE)?;
                self.streams[id.0 as usize].used = true;
                rest = &rest[chunklen..];
                just_rotated = false;
                continue;
            }

            if splittable {
                // Shorten the chunk to what fits before the boundary.
                let short = (rem - hdrlen as u64) as usize;
                let short_hdrlen = frame_header(id, frame_length, short as u64, true, &mut hdr);
                if first {
                    self.note_occurrence(id);
                    first = false;
                }
                self.emit(&hdr[..short_hdrlen], WriteFlags::NONE)?;
                self.emit(&rest[..short], WriteFlags::NONE)?;
                self.streams[id.0 as usize].used = true;
                rest = &rest[short..];
            }

            let limit = self.data_end().min(self.subunit_end);
            let fill = limit.saturating_sub(self.cursor);
            self.pad(fill)?;

            if self.cursor >= self.data_end() {
                self.close_unit()?;
                self.open_unit()?;
            } else {
                self.begin_subunit()?;
            }
            just_rotated = true;
        }
        Ok(())
    }

    /// Fill exactly `len` bytes with nop and padding frames.
    fn pad(&mut self, mut len: u64) -> Result<()> {
        const ZEROS: [u8; MIN_UNIT_SIZE as usize] = [0u8; MIN_UNIT_SIZE as usize];

        while len > 0 {
            if len == 1 {
                // A nop frame is a single zero byte.
                return self.emit(&ZEROS[..1], WriteFlags::NONE);
            }

            // Guess the width of the length field, then size the payload so
            // header plus payload consume the remainder. The final encoding
            // may come out a byte shorter, leaving a residue for the next
            // round.
            let mut width = 1u64;
            let mut rest = len - 2;
            loop {
                rest >>= 7;
                if rest == 0 {
                    break;
                }
                width += 1;
            }
            let payload = (len - 1 - width).min(MAX_PAYLOAD as u64);

            let mut hdr = [0u8; MAX_HEADER_SIZE];
            hdr[0] = (StreamId::PADDING.0 as u8) << 1;
            let n = 1 + varint::encode(payload, &mut hdr[1..]);
            self.emit(&hdr[..n], WriteFlags::NONE)?;

            let mut rem = payload;
            while rem > 0 {
                let chunk = rem.min(ZEROS.len() as u64) as usize;
                self.emit(&ZEROS[..chunk], WriteFlags::NONE)?;
                rem -= chunk as u64;
            }

            len -= n as u64 + payload;
        }
        Ok(())
    }

    fn open_unit(&mut self) -> Result<()> {
        self.unit_end = self.cursor + self.params.unit;
        tracing::debug!(ordinal = self.unit_ordinal, start = self.cursor, "opening unit");

        // Marker
        let mut flags = WriteFlags::NEW_UNIT;
        if self.cursor == 0 {
            flags = flags | WriteFlags::START;
        }
        let mut hdr = [0u8; MAX_HEADER_SIZE];
        let n = frame_header(
            StreamId::MARKER,
            FrameLength::Fixed(MARKER_BLOCK as u64),
            MARKER_BLOCK as u64,
            false,
            &mut hdr,
        );
        self.emit(&hdr[..n], flags)?;
        const MARKER_PAYLOAD: [u8; MARKER_BLOCK] = [MARKER_BYTE; MARKER_BLOCK];
        self.emit(&MARKER_PAYLOAD, WriteFlags::NONE)?;

        // The unit digest covers everything after the Marker frame.
        self.digest.reset();

        self.emit_index()?;
        self.emit_meta()?;
        self.emit_platform()
    }

    fn close_unit(&mut self) -> Result<()> {
        let data_end = self.data_end();
        if self.cursor < data_end {
            let fill = data_end - self.cursor;
            self.pad(fill)?;
        }
        self.emit_crc()?;
        self.unit_ordinal += 1;
        Ok(())
    }

    fn begin_subunit(&mut self) -> Result<()> {
        let here = self.cursor;
        self.subunit_end = here + self.params.subunit;

        let since = self.streams[StreamId::INDEX.0 as usize]
            .occurrence
            .unwrap_or(0);
        let payload = self.render_index(here, None, since);
        let frames = build_frames(StreamId::SUBINDEX, &payload);
        // Skip the subindex when the unit trailer is too close; the unit
        // header sequence follows anyway.
        if here + frames.len() as u64 <= self.data_end() {
            self.emit(&frames, WriteFlags::NONE)?;
            let slot = &mut self.streams[StreamId::SUBINDEX.0 as usize];
            slot.occurrence = Some(here);
            slot.used = true;
        }
        Ok(())
    }

    fn emit_index(&mut self) -> Result<()> {
        let here = self.cursor;
        self.subunit_end = here + self.params.subunit;

        let payload = self.render_index(here, Some(self.unit_ordinal), 0);
        let frames = build_frames(StreamId::INDEX, &payload);
        self.emit(&frames, WriteFlags::NONE)?;

        let slot = &mut self.streams[StreamId::INDEX.0 as usize];
        slot.occurrence = Some(here);
        slot.used = true;
        Ok(())
    }

    fn emit_meta(&mut self) -> Result<()> {
        let here = self.cursor;
        let doc = meta::render_document(
            self.streams
                .iter()
                .enumerate()
                .filter(|(_, s)| s.listed && !s.config.hidden)
                .map(|(id, s)| (id as u32, &s.config)),
            self.free_id,
        );
        let frames = build_frames(StreamId::META, &doc);
        self.emit(&frames, WriteFlags::NONE)?;

        // The Meta occurrence only advances when the document changed, so
        // index entries keep pointing at the last change.
        let meta_changed = self.meta_changed;
        let slot = &mut self.streams[StreamId::META.0 as usize];
        if meta_changed || slot.occurrence.is_none() {
            slot.occurrence = Some(here);
        }
        slot.used = true;
        self.meta_changed = false;
        Ok(())
    }

    fn emit_platform(&mut self) -> Result<()> {
        let here = self.cursor;
        let mut hdr = [0u8; MAX_HEADER_SIZE];
        let n = frame_header(StreamId::PLATFORM, FrameLength::Fixed(4), 4, false, &mut hdr);
        self.emit(&hdr[..n], WriteFlags::NONE)?;
        self.emit(&PLATFORM_PROBE.to_ne_bytes(), WriteFlags::NONE)?;

        let slot = &mut self.streams[StreamId::PLATFORM.0 as usize];
        slot.occurrence = Some(here);
        slot.used = true;
        Ok(())
    }

    fn emit_crc(&mut self) -> Result<()> {
        let here = self.cursor;
        let mut hdr = [0u8; MAX_HEADER_SIZE];
        let n = frame_header(StreamId::CRC, FrameLength::Fixed(4), 4, false, &mut hdr);
        self.emit(&hdr[..n], WriteFlags::NONE)?;
        // The digest covers through the Crc header, not its payload.
        let value = self.digest.value();
        self.emit_unhashed(&value.to_ne_bytes(), WriteFlags::NONE)?;

        let slot = &mut self.streams[StreamId::CRC.0 as usize];
        slot.occurrence = Some(here);
        slot.used = true;
        Ok(())
    }

    /// Render an Index (`ordinal = Some`) or subindex (`ordinal = None`)
    /// payload relative to frame offset `here`.
    ///
    /// In a full Index, the entries for the `Index` and `index` streams
    /// carry the unit and subunit sizes, so a single Index describes the
    /// container geometry; other entries carry the distance to the
    /// stream's last occurrence, or zero when there is none. A subindex
    /// lists only entries whose occurrence moved since the last Index, at
    /// `since`.
    fn render_index(&self, here: u64, ordinal: Option<u64>, since: u64) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(n) = ordinal {
            varint::encode_vec(n, &mut out);
        }
        for (raw_id, slot) in self.streams.iter().enumerate() {
            if slot.config.hidden || !slot.listed {
                continue;
            }
            let id = raw_id as u32;
            let delta = if ordinal.is_some() {
                if id == StreamId::INDEX.0 {
                    self.params.unit << 1
                } else if id == StreamId::SUBINDEX.0 {
                    self.params.subunit << 1
                } else {
                    match slot.occurrence {
                        Some(o) => (here - o) << 1,
                        None => 0,
                    }
                }
            } else {
                match slot.occurrence {
                    Some(o) if o >= since => (here - o) << 1,
                    _ => continue,
                }
            };
            varint::encode_vec(((id as u64) << 1) | 1, &mut out);
            varint::encode_vec(delta, &mut out);
        }
        out
    }
}

/// Encode a frame header into `hdr`, returning its length.
fn frame_header(
    id: StreamId,
    frame_length: FrameLength,
    payload_len: u64,
    more: bool,
    hdr: &mut [u8; MAX_HEADER_SIZE],
) -> usize {
    let tag = ((id.0 as u64) << 1) | more as u64;
    let mut n = varint::encode(tag, hdr);
    if frame_length.is_variable() {
        n += varint::encode(payload_len, &mut hdr[n..]);
    }
    n
}

/// Encode `payload` as a chain of variable-length frames of `id`, chunked
/// to the maximum frame payload with the `more` bit linking the chunks.
fn build_frames(id: StreamId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut off = 0;
    loop {
        let chunk = (payload.len() - off).min(MAX_PAYLOAD);
        let more = off + chunk < payload.len();
        let mut hdr = [0u8; MAX_HEADER_SIZE];
        let n = frame_header(id, FrameLength::Variable, chunk as u64, more, &mut hdr);
        out.extend_from_slice(&hdr[..n]);
        out.extend_from_slice(&payload[off..off + chunk]);
        off += chunk;
        if off >= payload.len() {
            return out;
        }
    }
}
