//! Traversal state over a container: resync, frame parsing, index replay,
//! and meta absorption.
//!
//! A [`Cursor`] can start from any byte offset. Alignment is recovered by
//! scanning for a Marker frame, whose 1024-byte payload of a single
//! repeated byte cannot occur inside any other frame. From an aligned
//! position the cursor walks frames, absorbs Meta documents into its stream
//! registry, replays index tables, and verifies unit checksums. Corrupt
//! regions are skipped by falling forward to the next Marker; every moving
//! operation restores its position if it fails instead.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, FormatError, Result};
use crate::format::{
    builtin_streams, ByteOrder, FrameLength, StreamConfig, StreamId, MARKER_BLOCK, MARKER_BYTE,
    MARKER_FRAME_SIZE, MAX_PAYLOAD,
};
use crate::meta::{self, MetaDocument};
use crate::reader::Reader;
use crate::source::ByteSource;
use crate::varint;

/// A parsed frame: header offset, payload location, and stream identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the first header byte.
    pub header: u64,
    /// Offset of the first payload byte.
    pub payload: u64,
    /// Payload length in bytes.
    pub length: usize,
    pub stream: StreamId,
    /// The frame is a non-terminal chunk of a logical frame.
    pub more: bool,
}

impl Frame {
    /// Offset just past the payload.
    pub fn end(&self) -> u64 {
        self.payload + self.length as u64
    }
}

/// A stream as known to the reader, preloaded for the built-ins and grown
/// from absorbed Meta documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    pub id: StreamId,
    pub config: StreamConfig,
    /// Raw meta object text, for caller queries beyond the known fields.
    pub raw: Option<String>,
}

#[derive(Debug, Clone)]
struct IndexSync {
    /// Marker offset of the unit the table belongs to.
    marker: u64,
    /// Frames up to this offset have been replayed into the table.
    replay_pos: u64,
}

const SCAN_WORD: usize = 8;

enum MarkerCheck {
    Found(Frame),
    Reject,
    Eof,
}

/// Reader-side traversal state.
pub struct Cursor<'r, S: ByteSource> {
    reader: &'r mut Reader<S>,
    pos: u64,
    eof: bool,
    aligned: bool,
    marker: Option<u64>,
    unit: Option<u64>,
    subunit: Option<u64>,
    frame: Option<Frame>,
    streams: BTreeMap<u32, StreamDesc>,
    discovery_attempted: BTreeSet<u32>,
    index_table: BTreeMap<u32, u64>,
    index_synced: Option<IndexSync>,
    /// Ordinal and marker offset of the most recently absorbed Index.
    unit_ordinal: Option<(u64, u64)>,
    byte_order: Option<ByteOrder>,
    unit_suspect: bool,
    /// Meta bytes up to this offset are already absorbed; suppresses
    /// re-absorption of continuation chunks during iteration.
    meta_absorbed_until: u64,
}

impl<'r, S: ByteSource> Cursor<'r, S> {
    pub(crate) fn new(reader: &'r mut Reader<S>) -> Cursor<'r, S> {
        Cursor {
            reader,
            pos: 0,
            eof: false,
            aligned: false,
            marker: None,
            unit: None,
            subunit: None,
            frame: None,
            streams: builtin_descs(),
            discovery_attempted: BTreeSet::new(),
            index_table: BTreeMap::new(),
            index_synced: None,
            unit_ordinal: None,
            byte_order: None,
            unit_suspect: false,
            meta_absorbed_until: 0,
        }
    }

    /// Drop all traversal state and return to offset zero.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.eof = false;
        self.aligned = false;
        self.marker = None;
        self.unit = None;
        self.subunit = None;
        self.frame = None;
        self.streams = builtin_descs();
        self.discovery_attempted.clear();
        self.index_table.clear();
        self.index_synced = None;
        self.unit_ordinal = None;
        self.byte_order = None;
        self.unit_suspect = false;
        self.meta_absorbed_until = 0;
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Unconditional reposition; clears alignment.
    pub fn seek(&mut self, offset: u64) {
        self.pos = offset;
        self.aligned = false;
        self.frame = None;
        self.eof = false;
    }

    pub fn aligned(&self) -> bool {
        self.aligned
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Discovered unit size, once an Index has been parsed.
    pub fn unit_size(&self) -> Option<u64> {
        self.unit
    }

    pub fn subunit_size(&self) -> Option<u64> {
        self.subunit
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Ordinal carried by the most recently absorbed Index.
    pub fn current_unit_ordinal(&self) -> Option<u64> {
        self.unit_ordinal.map(|(ordinal, _)| ordinal)
    }

    /// Writer byte order, once a Platform frame has been seen.
    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.byte_order
    }

    /// Whether multi-byte primitive payloads need swapping on this host.
    pub fn byte_swapped(&self) -> bool {
        matches!(self.byte_order, Some(order) if order != ByteOrder::native())
    }

    /// The current unit failed its Crc check during iteration.
    pub fn unit_suspect(&self) -> bool {
        self.unit_suspect
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamDesc> {
        self.streams.get(&id.0)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamDesc> {
        self.streams.values()
    }

    /// Scan for a Marker from the current position.
    ///
    /// Returns the Marker frame, leaving the cursor aligned at its header;
    /// `None` when the scan runs off the container.
    pub fn find_marker(&mut self, forward: bool) -> Result<Option<Frame>> {
        self.transactional(|c| c.find_marker_inner(forward))
    }

    /// Move to the next Marker: one unit ahead when the geometry is known,
    /// otherwise by scanning.
    pub fn next_marker(&mut self) -> Result<Option<Frame>> {
        self.transactional(Self::next_marker_inner)
    }

    pub fn prev_marker(&mut self) -> Result<Option<Frame>> {
        self.transactional(Self::prev_marker_inner)
    }

    /// Move to the Index of this unit (when the cursor is before it) or of
    /// the next unit, absorbing its table.
    pub fn next_index(&mut self) -> Result<Option<Frame>> {
        self.transactional_iteration(Self::next_index_inner)
    }

    /// Move to the previous unit's Index.
    pub fn prev_index(&mut self) -> Result<Option<Frame>> {
        self.transactional_iteration(|c| {
            if c.prev_marker_inner()?.is_none() {
                return Ok(None);
            }
            c.next_index_inner()
        })
    }

    /// Move to the next Meta: this unit's when the cursor is still before
    /// it, otherwise the next unit's.
    pub fn next_meta(&mut self) -> Result<Option<Frame>> {
        self.transactional_iteration(Self::next_meta_inner)
    }

    /// Move to the Meta at or before the cursor.
    pub fn prev_meta(&mut self) -> Result<Option<Frame>> {
        self.transactional_iteration(Self::prev_meta_inner)
    }

    /// Advance past the current frame and parse the next one, falling
    /// forward to the next Marker over unparseable bytes.
    ///
    /// Returns `None` at the end of the container, leaving the cursor
    /// where it was so lookups keep working.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.transactional_iteration(Self::next_frame_inner)
    }

    /// Iterate until the next frame of `id`.
    pub fn next_frame_of(&mut self, id: StreamId) -> Result<Option<Frame>> {
        self.transactional_iteration(|c| {
            while let Some(frame) = c.next_frame_inner()? {
                if frame.stream == id {
                    return Ok(Some(frame));
                }
            }
            Ok(None)
        })
    }

    /// Payload bytes of one physical frame.
    pub fn read_payload(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        self.reader.read_exact_vec(frame.payload, frame.length)
    }

    /// Reassemble the logical frame starting at the current frame,
    /// following its `more` chain across alignment boundaries. The cursor
    /// is left at the terminal chunk.
    pub fn full_frame(&mut self) -> Result<Vec<u8>> {
        let Some(frame) = self.frame.clone() else {
            return Err(Error::Invalid("cursor is not at a frame"));
        };
        self.transactional(|c| {
            let (bytes, terminal) = c.logical_payload(&frame)?;
            c.pos = terminal.header;
            c.frame = Some(terminal);
            Ok(bytes)
        })
    }

    /// Offset of the latest known occurrence of `id`, after syncing the
    /// index table to the current unit and position.
    pub fn index(&mut self, id: StreamId) -> Result<Option<u64>> {
        self.transactional(Self::sync_index)?;
        Ok(self.index_table.get(&id.0).copied())
    }

    /// CRC-32 over the current unit's body, from just after the Marker
    /// frame up to the cursor.
    pub fn current_unit_crc(&mut self) -> Result<u32> {
        let Some(marker) = self.marker else {
            return Err(Error::Invalid("cursor is not aligned to a marker"));
        };
        self.reader.crc(marker + MARKER_FRAME_SIZE, self.pos)
    }

    fn transactional<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let pos = self.pos;
        let aligned = self.aligned;
        let marker = self.marker;
        let frame = self.frame.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.pos = pos;
                self.aligned = aligned;
                self.marker = marker;
                self.frame = frame;
                Err(err)
            }
        }
    }

    /// Like [`Cursor::transactional`], but also restores the position when
    /// iteration comes back empty, so an exhausted walk leaves the cursor
    /// on its last frame.
    fn transactional_iteration(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Option<Frame>>,
    ) -> Result<Option<Frame>> {
        let pos = self.pos;
        let aligned = self.aligned;
        let marker = self.marker;
        let frame = self.frame.clone();
        let result = f(self);
        if !matches!(result, Ok(Some(_))) {
            self.pos = pos;
            self.aligned = aligned;
            self.marker = marker;
            self.frame = frame;
        }
        result
    }

    fn find_marker_inner(&mut self, forward: bool) -> Result<Option<Frame>> {
        self.aligned = false;
        self.eof = false;
        self.frame = None;

        let magic = [MARKER_BYTE; SCAN_WORD];
        let jump = (MARKER_BLOCK - SCAN_WORD) as u64;

        loop {
            let mut word = [0u8; SCAN_WORD];
            let n = self.reader.read(self.pos, &mut word)?;
            if n != SCAN_WORD {
                self.eof = true;
                return Ok(None);
            }

            let verdict = if word == magic {
                self.check_marker_candidate()?
            } else {
                MarkerCheck::Reject
            };

            match verdict {
                MarkerCheck::Found(frame) => {
                    self.aligned = true;
                    self.marker = Some(frame.header);
                    self.pos = frame.header;
                    self.frame = Some(frame.clone());
                    return Ok(Some(frame));
                }
                MarkerCheck::Eof => {
                    self.eof = true;
                    return Ok(None);
                }
                MarkerCheck::Reject => {
                    if forward {
                        self.pos += jump;
                    } else if self.pos < SCAN_WORD as u64 {
                        return Ok(None);
                    } else {
                        self.pos = self.pos.saturating_sub(jump);
                    }
                }
            }
        }
    }

    /// The word at `pos` is all marker bytes. Accept only if the full run
    /// is exactly one Marker payload preceded by the Marker frame header.
    fn check_marker_candidate(&mut self) -> Result<MarkerCheck> {
        let mut start = self.pos;
        loop {
            if start == 0 {
                // Run reaches the start of the container; no header byte.
                return Ok(MarkerCheck::Reject);
            }
            let mut b = [0u8; 1];
            if self.reader.read(start - 1, &mut b)? != 1 {
                return Ok(MarkerCheck::Reject);
            }
            if b[0] != MARKER_BYTE {
                if b[0] != (StreamId::MARKER.0 as u8) << 1 {
                    return Ok(MarkerCheck::Reject);
                }
                break;
            }
            start -= 1;
        }
        let header = start - 1;

        let mut end = self.pos;
        loop {
            let mut b = [0u8; 1];
            if self.reader.read(end, &mut b)? != 1 {
                // Container ends inside the run.
                return Ok(MarkerCheck::Eof);
            }
            if b[0] != MARKER_BYTE {
                break;
            }
            end += 1;
        }

        if end - header != MARKER_BLOCK as u64 + 1 {
            return Ok(MarkerCheck::Reject);
        }

        Ok(MarkerCheck::Found(Frame {
            header,
            payload: header + 1,
            length: MARKER_BLOCK,
            stream: StreamId::MARKER,
            more: false,
        }))
    }

    fn next_marker_inner(&mut self) -> Result<Option<Frame>> {
        if self.aligned {
            let marker = self.marker.expect("aligned cursor has a marker");
            if let Some(unit) = self.unit.filter(|&u| u > 0) {
                let cycles = self.pos.saturating_sub(marker) / unit;
                let target = marker + (cycles + 1) * unit;
                self.pos = target;
                if let Some(frame) = self.parse_frame()? {
                    if frame.stream == StreamId::MARKER {
                        self.marker = Some(target);
                        return Ok(Some(frame));
                    }
                }
                // No Marker on the unit grid; scan from just past the
                // previous one.
                self.pos = target - unit + MARKER_FRAME_SIZE;
            } else if self.pos == marker {
                self.pos = marker + MARKER_FRAME_SIZE;
            } else {
                self.pos += (MARKER_BLOCK - SCAN_WORD) as u64;
            }
        }
        self.find_marker_inner(true)
    }

    fn prev_marker_inner(&mut self) -> Result<Option<Frame>> {
        if self.aligned {
            let marker = self.marker.expect("aligned cursor has a marker");
            if let Some(unit) = self.unit.filter(|&u| u > 0) {
                if marker < unit || self.pos < unit {
                    // No earlier marker can exist.
                    self.aligned = false;
                    self.eof = false;
                    self.pos = 0;
                    self.frame = None;
                    return Ok(None);
                }
                let cycles = self.pos.saturating_sub(marker) / unit;
                let target = if cycles == 0 {
                    marker - unit
                } else {
                    marker + (cycles - 1) * unit
                };
                self.pos = target;
                if let Some(frame) = self.parse_frame()? {
                    if frame.stream == StreamId::MARKER {
                        self.marker = Some(target);
                        return Ok(Some(frame));
                    }
                }
                self.pos = target + unit;
            }
        }
        self.find_marker_inner(false)
    }

    fn next_index_inner(&mut self) -> Result<Option<Frame>> {
        if !self.aligned && self.next_marker_inner()?.is_none() {
            return Ok(None);
        }
        let marker = self.marker.expect("aligned cursor has a marker");
        let this_index = marker + MARKER_FRAME_SIZE;

        if self.pos < this_index {
            self.pos = this_index;
        } else if let Some(unit) = self.unit {
            self.pos = this_index + unit;
            self.marker = Some(marker + unit);
        } else {
            let Some(frame) = self.next_marker_inner()? else {
                return Ok(None);
            };
            self.pos = frame.header + MARKER_FRAME_SIZE;
        }

        let Some(frame) = self.parse_frame()? else {
            return Ok(None);
        };
        if frame.stream != StreamId::INDEX {
            self.frame = None;
            return Ok(None);
        }
        self.absorb_index(&frame)?;
        Ok(Some(frame))
    }

    /// The Meta strictly after `start`: this unit's when the cursor is
    /// still before it, otherwise the next unit's.
    fn next_meta_inner(&mut self) -> Result<Option<Frame>> {
        if !self.aligned && self.next_marker_inner()?.is_none() {
            return Ok(None);
        }
        let start = self.pos;
        for _ in 0..2 {
            let marker = self.marker.expect("aligned cursor has a marker");
            if let Some(frame) = self.unit_meta_frame(marker)? {
                if frame.header > start {
                    self.pos = frame.header;
                    self.frame = Some(frame.clone());
                    return Ok(Some(frame));
                }
            }
            if self.next_marker_inner()?.is_none() {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// The Meta at or before `start`, reaching into the previous unit when
    /// the cursor is still ahead of this unit's.
    fn prev_meta_inner(&mut self) -> Result<Option<Frame>> {
        if !self.aligned && self.find_marker_inner(false)?.is_none() {
            return Ok(None);
        }
        let start = self.pos;
        for _ in 0..2 {
            let marker = self.marker.expect("aligned cursor has a marker");
            if let Some(frame) = self.unit_meta_frame(marker)? {
                if frame.header <= start {
                    self.pos = frame.header;
                    self.frame = Some(frame.clone());
                    return Ok(Some(frame));
                }
            }
            self.pos = marker;
            if self.prev_marker_inner()?.is_none() {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Locate and absorb the Meta of the unit at `marker`; the cursor is
    /// left unspecified on the way.
    fn unit_meta_frame(&mut self, marker: u64) -> Result<Option<Frame>> {
        self.pos = marker + MARKER_FRAME_SIZE;
        let Some(index) = self.parse_frame()? else {
            return Ok(None);
        };
        if index.stream != StreamId::INDEX {
            return Ok(None);
        }
        self.absorb_index(&index)?;
        let (_, terminal) = self.logical_payload(&index)?;
        self.pos = terminal.end();

        let Some(frame) = self.parse_frame()? else {
            return Ok(None);
        };
        if frame.stream != StreamId::META {
            return Ok(None);
        }
        let (doc, meta_terminal) = self.logical_payload(&frame)?;
        self.absorb_meta_bytes(meta_terminal.end(), &doc);
        Ok(Some(frame))
    }

    fn next_frame_inner(&mut self) -> Result<Option<Frame>> {
        if !self.aligned {
            // The Marker is the first frame.
            return self.find_marker_inner(true);
        }

        let current = match &self.frame {
            Some(frame) if frame.header == self.pos => Some(frame.clone()),
            _ => self.parse_frame()?,
        };
        let Some(current) = current else {
            return self.next_marker_inner();
        };

        self.pos = current.end();
        match self.parse_frame()? {
            Some(frame) => {
                self.post_frame(&frame)?;
                Ok(Some(frame))
            }
            None => self.next_marker_inner(),
        }
    }

    /// Bookkeeping for frames encountered during iteration: track markers,
    /// refresh tables, absorb registry documents, note the byte order, and
    /// verify unit checksums. Malformed or truncated bookkeeping data is
    /// reported and skipped; iteration itself keeps going.
    fn post_frame(&mut self, frame: &Frame) -> Result<()> {
        if let Err(err) = self.post_frame_strict(frame) {
            match err {
                Error::Format(err) => {
                    tracing::warn!(offset = frame.header, "skipping frame bookkeeping: {err}");
                }
                err => return Err(err),
            }
        }
        Ok(())
    }

    fn post_frame_strict(&mut self, frame: &Frame) -> Result<()> {
        match frame.stream {
            StreamId::MARKER => {
                self.marker = Some(frame.header);
            }
            StreamId::INDEX => {
                self.absorb_index(frame)?;
            }
            StreamId::META | StreamId::SUBMETA => {
                if frame.header >= self.meta_absorbed_until {
                    let (doc, terminal) = self.logical_payload(frame)?;
                    self.absorb_meta_bytes(terminal.end(), &doc);
                }
            }
            StreamId::PLATFORM => {
                let bytes = self.reader.read_exact_vec(frame.payload, 4)?;
                let probe = [bytes[0], bytes[1], bytes[2], bytes[3]];
                match ByteOrder::from_probe(probe) {
                    Some(order) => self.byte_order = Some(order),
                    None => tracing::warn!(?probe, "unrecognized platform probe"),
                }
            }
            StreamId::CRC => {
                if let Some(marker) = self.marker {
                    let computed = self.reader.crc(marker + MARKER_FRAME_SIZE, frame.payload)?;
                    let bytes = self.reader.read_exact_vec(frame.payload, 4)?;
                    let stored = self
                        .byte_order
                        .unwrap_or_else(ByteOrder::native)
                        .read_u32([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    if stored != computed {
                        self.unit_suspect = true;
                        tracing::warn!(
                            unit_start = marker,
                            stored,
                            computed,
                            "unit crc mismatch"
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse the frame at the cursor without moving it.
    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.parse_at(self.pos)?;
        self.frame = frame.clone();
        Ok(frame)
    }

    fn parse_at(&mut self, pos: u64) -> Result<Option<Frame>> {
        let (tag, taglen) = match self.reader.read_int(pos) {
            Ok(v) => v,
            Err(Error::Format(FormatError::IntTruncated)) => {
                self.eof = true;
                return Ok(None);
            }
            Err(Error::Format(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let id64 = tag >> 1;
        let more = tag & 1 != 0;
        if id64 > u32::MAX as u64 {
            return Ok(None);
        }
        let id = id64 as u32;

        if !self.streams.contains_key(&id) {
            self.discover_stream(id)?;
        }
        let Some(desc) = self.streams.get(&id) else {
            return Ok(None);
        };

        let (payload, length) = match desc.config.frame_length {
            FrameLength::Variable => {
                let (len, lenlen) = match self.reader.read_int(pos + taglen as u64) {
                    Ok(v) => v,
                    Err(Error::Format(FormatError::IntTruncated)) => {
                        self.eof = true;
                        return Ok(None);
                    }
                    Err(Error::Format(_)) => return Ok(None),
                    Err(err) => return Err(err),
                };
                if len > MAX_PAYLOAD as u64 {
                    return Ok(None);
                }
                (pos + (taglen + lenlen) as u64, len as usize)
            }
            FrameLength::Fixed(n) => (pos + taglen as u64, n as usize),
        };

        Ok(Some(Frame {
            header: pos,
            payload,
            length,
            stream: StreamId(id),
            more,
        }))
    }

    /// One-shot lookup for an unknown stream id: load the next unit's Meta
    /// (a stream created mid-unit is listed there), falling back to the
    /// current unit's, then restore the cursor.
    fn discover_stream(&mut self, id: u32) -> Result<()> {
        if !self.discovery_attempted.insert(id) || !self.aligned {
            return Ok(());
        }

        let saved = (self.pos, self.aligned, self.marker, self.frame.clone());

        if self.next_marker_inner().is_ok_and(|m| m.is_some()) {
            if let Some(marker) = self.marker {
                let _ = self.load_unit_meta(marker);
            }
        }
        (self.pos, self.aligned, self.marker, self.frame) = saved.clone();

        if !self.streams.contains_key(&id) {
            if let Some(marker) = self.marker {
                let _ = self.load_unit_meta(marker);
            }
            (self.pos, self.aligned, self.marker, self.frame) = saved;
        }
        Ok(())
    }

    /// Absorb the Meta of the unit at `marker` into the registry, without
    /// touching index state.
    fn load_unit_meta(&mut self, marker: u64) -> Result<()> {
        self.pos = marker + MARKER_FRAME_SIZE;
        let Some(index) = self.parse_frame()? else {
            return Ok(());
        };
        if index.stream != StreamId::INDEX {
            return Ok(());
        }
        let (_, terminal) = self.logical_payload(&index)?;
        self.pos = terminal.end();

        let Some(frame) = self.parse_frame()? else {
            return Ok(());
        };
        if frame.stream != StreamId::META {
            return Ok(());
        }
        let (doc, meta_terminal) = self.logical_payload(&frame)?;
        self.absorb_meta_bytes(meta_terminal.end(), &doc);
        Ok(())
    }

    /// Read the logical payload starting at `frame`, following the `more`
    /// chain across frames of the same stream and skipping interleaved
    /// frames of other streams. Returns the bytes and the terminal chunk.
    fn logical_payload(&mut self, frame: &Frame) -> Result<(Vec<u8>, Frame)> {
        let mut out = self.reader.read_exact_vec(frame.payload, frame.length)?;
        let mut terminal = frame.clone();
        let mut pos = frame.end();
        let mut more = frame.more;
        while more {
            let Some(next) = self.parse_at(pos)? else {
                return Err(FormatError::UnexpectedEof.into());
            };
            pos = next.end();
            if next.stream == frame.stream {
                out.extend_from_slice(&self.reader.read_exact_vec(next.payload, next.length)?);
                more = next.more;
                terminal = next;
            }
        }
        Ok((out, terminal))
    }

    /// Load the index table from an Index frame: clear, record geometry
    /// from the `Index`/`index` entries, verify ordinal monotonicity, and
    /// remember where replay of subsequent subindex frames must resume.
    fn absorb_index(&mut self, frame: &Frame) -> Result<()> {
        let (payload, terminal) = self.logical_payload(frame)?;

        let mut off = 0;
        let (ordinal, n) =
            varint::decode(&payload[off..]).map_err(|_| FormatError::Index("missing ordinal"))?;
        off += n;

        let marker = self
            .marker
            .unwrap_or_else(|| frame.header.saturating_sub(MARKER_FRAME_SIZE));
        if let Some((prev_ordinal, prev_marker)) = self.unit_ordinal {
            if marker > prev_marker && ordinal <= prev_ordinal {
                return Err(FormatError::NonMonotonicUnit {
                    previous: prev_ordinal,
                    current: ordinal,
                }
                .into());
            }
        }
        self.unit_ordinal = Some((ordinal, marker));

        self.index_table.clear();
        while off < payload.len() {
            let (tag, n) =
                varint::decode(&payload[off..]).map_err(|_| FormatError::Index("truncated entry"))?;
            off += n;
            let (delta, n) =
                varint::decode(&payload[off..]).map_err(|_| FormatError::Index("truncated entry"))?;
            off += n;
            if tag & 1 == 0 {
                return Err(FormatError::Index("entry tag without id bit").into());
            }
            let id = (tag >> 1) as u32;
            let dist = delta >> 1;
            if id == StreamId::INDEX.0 {
                if dist > 0 {
                    self.unit = Some(dist);
                }
            } else if id == StreamId::SUBINDEX.0 && dist > 0 {
                self.subunit = Some(dist);
            }
            if delta == 0 {
                // The stream has no occurrence yet.
                continue;
            }
            if let Some(occurrence) = frame.header.checked_sub(dist) {
                self.index_table.insert(id, occurrence);
            }
        }

        self.index_synced = Some(IndexSync {
            marker,
            replay_pos: terminal.end(),
        });
        self.unit_suspect = false;
        Ok(())
    }

    /// Bring the index table up to the current unit and position by
    /// replaying subindex frames.
    fn sync_index(&mut self) -> Result<()> {
        if !self.aligned {
            return Err(Error::Invalid("cursor is not aligned to a marker"));
        }
        let marker = self.marker.expect("aligned cursor has a marker");

        let reload = match &self.index_synced {
            Some(sync) => sync.marker != marker || sync.replay_pos > self.pos,
            None => true,
        };
        if reload {
            let saved_pos = self.pos;
            let saved_frame = self.frame.clone();
            self.pos = marker + MARKER_FRAME_SIZE;
            let index = self
                .parse_frame()?
                .filter(|f| f.stream == StreamId::INDEX)
                .ok_or(FormatError::Index("unit has no Index frame"))?;
            self.absorb_index(&index)?;
            self.pos = saved_pos;
            self.frame = saved_frame;
        }

        let mut replay = self
            .index_synced
            .as_ref()
            .expect("index was just absorbed")
            .replay_pos;
        while replay < self.pos {
            let Some(frame) = self.parse_at(replay)? else {
                break;
            };
            if frame.stream == StreamId::SUBINDEX {
                let (payload, terminal) = self.logical_payload(&frame)?;
                self.apply_subindex(frame.header, &payload);
                replay = terminal.end();
            } else {
                replay = frame.end();
            }
        }
        if let Some(sync) = self.index_synced.as_mut() {
            sync.replay_pos = replay;
        }
        Ok(())
    }

    fn apply_subindex(&mut self, here: u64, payload: &[u8]) {
        let mut off = 0;
        while off < payload.len() {
            let Ok((tag, n)) = varint::decode(&payload[off..]) else {
                tracing::warn!(offset = here, "truncated subindex entry");
                return;
            };
            off += n;
            let Ok((delta, n)) = varint::decode(&payload[off..]) else {
                tracing::warn!(offset = here, "truncated subindex entry");
                return;
            };
            off += n;
            if tag & 1 == 0 || delta == 0 {
                continue;
            }
            let id = (tag >> 1) as u32;
            if let Some(occurrence) = here.checked_sub(delta >> 1) {
                self.index_table.insert(id, occurrence);
            }
        }
    }

    fn absorb_meta_bytes(&mut self, end: u64, bytes: &[u8]) {
        self.meta_absorbed_until = self.meta_absorbed_until.max(end);
        match meta::parse_document(bytes) {
            Ok(doc) => self.absorb_meta_doc(doc),
            Err(err) => tracing::warn!("ignoring malformed meta document: {err}"),
        }
    }

    fn absorb_meta_doc(&mut self, doc: MetaDocument) {
        for entry in doc.entries {
            match self.streams.get_mut(&entry.id) {
                Some(desc) => {
                    if let Some(name) = &entry.name {
                        if *name != desc.config.name {
                            tracing::warn!(
                                id = entry.id,
                                old = %desc.config.name,
                                new = %name,
                                "rejecting mid-container stream rename"
                            );
                            continue;
                        }
                    }
                    if let Some(len) = entry.length {
                        desc.config.frame_length = FrameLength::Fixed(len);
                    }
                    if let Some(cont) = entry.cont {
                        desc.config.cont = cont;
                    }
                    if entry.content.is_some() {
                        desc.config.content = entry.content;
                    }
                    desc.raw = Some(entry.raw);
                }
                None => {
                    let Some(name) = entry.name else {
                        tracing::warn!(id = entry.id, "ignoring meta entry without a name");
                        continue;
                    };
                    let config = StreamConfig {
                        name,
                        frame_length: match entry.length {
                            Some(n) => FrameLength::Fixed(n),
                            None => FrameLength::Variable,
                        },
                        cont: entry.cont.unwrap_or(false),
                        content: entry.content,
                        hidden: false,
                    };
                    self.streams.insert(
                        entry.id,
                        StreamDesc {
                            id: StreamId(entry.id),
                            config,
                            raw: Some(entry.raw),
                        },
                    );
                }
            }
        }
    }
}

fn builtin_descs() -> BTreeMap<u32, StreamDesc> {
    builtin_streams()
        .into_iter()
        .enumerate()
        .map(|(id, config)| {
            (
                id as u32,
                StreamDesc {
                    id: StreamId(id as u32),
                    config,
                    raw: None,
                },
            )
        })
        .collect()
}
