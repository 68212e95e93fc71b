//! Index replay: occurrence lookup by stream id without scanning the whole
//! container.

use pretty_assertions::assert_eq;
use rtc_container::{
    MemSource, Params, Reader, StreamConfig, StreamId, VecSink, Writer,
};

const PARAMS: Params = Params { unit: 1 << 20, subunit: 512 };

/// One write per stream per subunit, so the replayed occurrence is exactly
/// the frame header.
fn container_with_spread_streams() -> (Vec<u8>, StreamId, StreamId, StreamId) {
    let mut writer = Writer::start(VecSink::new(), PARAMS).unwrap();
    let a = writer.create(StreamConfig::variable("a")).unwrap();
    let b = writer.create(StreamConfig::variable("b")).unwrap();
    let c = writer.create(StreamConfig::variable("filler")).unwrap();

    writer.write(a, &[0xA1; 100], false).unwrap();
    writer.write(b, &[0xB1; 120], false).unwrap();
    // Push well past several subunit boundaries so subindex frames record
    // the occurrences above.
    writer.write(c, &[0xC1; 400], false).unwrap();
    writer.write(c, &[0xC2; 400], false).unwrap();
    writer.write(c, &[0xC3; 400], false).unwrap();
    // A later occurrence of `a` in a fresh subunit.
    writer.write(a, &[0xA2; 100], false).unwrap();
    writer.write(c, &[0xC4; 400], false).unwrap();
    writer.write(c, &[0xC5; 400], false).unwrap();

    (writer.stop().unwrap().into_bytes(), a, b, c)
}

#[test]
fn index_returns_the_latest_recorded_occurrence() {
    let (bytes, a, b, _c) = container_with_spread_streams();
    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();

    // Collect ground truth while iterating to the end.
    let mut a_frames = Vec::new();
    let mut b_frames = Vec::new();
    while let Some(frame) = cursor.next_frame().unwrap() {
        if frame.stream == a {
            a_frames.push(frame.header);
        } else if frame.stream == b {
            b_frames.push(frame.header);
        }
    }
    assert_eq!(a_frames.len(), 2);
    assert_eq!(b_frames.len(), 1);

    // At the end of the container the table reflects the last recorded
    // occurrences.
    assert_eq!(cursor.index(a).unwrap(), Some(a_frames[1]));
    assert_eq!(cursor.index(b).unwrap(), Some(b_frames[0]));

    // A frame of the stream really does live at the reported offset.
    let off = a_frames[1];
    let mut probe = reader.cursor();
    let mut found = None;
    while let Some(f) = probe.next_frame().unwrap() {
        if f.header == off {
            found = Some(f);
            break;
        }
    }
    assert_eq!(found.expect("frame at the indexed offset").stream, a);
}

#[test]
fn index_right_after_the_unit_header_sees_no_user_streams() {
    let (bytes, a, _b, _c) = container_with_spread_streams();
    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();

    // Position just past the Marker: the Index predates every user stream,
    // and no subindex has been replayed yet.
    cursor.next_frame().unwrap().unwrap();
    assert_eq!(cursor.index(a).unwrap(), None);
    // Built-in geometry streams are always present.
    assert!(cursor.index(StreamId::INDEX).unwrap().is_none());
}

#[test]
fn lookup_is_position_sensitive() {
    let (bytes, a, _b, _c) = container_with_spread_streams();
    let mut reader = Reader::new(MemSource::new(bytes));

    // First pass: locate both occurrences of `a`.
    let mut cursor = reader.cursor();
    let mut a_frames = Vec::new();
    while let Some(frame) = cursor.next_frame().unwrap() {
        if frame.stream == a {
            a_frames.push(frame.header);
        }
    }
    let (first, second) = (a_frames[0], a_frames[1]);

    // A cursor parked between the two occurrences sees only the first.
    let mut cursor = reader.cursor();
    loop {
        let frame = cursor.next_frame().unwrap().unwrap();
        if frame.header > first && frame.stream == StreamId::SUBINDEX {
            break;
        }
    }
    // Step past the subindex so it is part of the replayed range.
    cursor.next_frame().unwrap().unwrap();
    let mid = cursor.index(a).unwrap();
    assert_eq!(mid, Some(first));

    // Moved to the end, the same cursor sees the second.
    while cursor.next_frame().unwrap().is_some() {}
    assert_eq!(cursor.index(a).unwrap(), Some(second));
}

#[test]
fn geometry_entries_describe_unit_and_subunit() {
    let (bytes, _a, _b, _c) = container_with_spread_streams();
    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    cursor.next_index().unwrap().unwrap();
    assert_eq!(cursor.unit_size(), Some(PARAMS.unit));
    assert_eq!(cursor.subunit_size(), Some(PARAMS.subunit));
}

#[test]
fn prev_index_steps_back_one_unit() {
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let s = writer.create(StreamConfig::variable("s")).unwrap();
    for _ in 0..25 {
        writer.write(s, &[0x42; 800], false).unwrap();
    }
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    cursor.next_frame().unwrap().unwrap();
    let i0 = cursor.next_index().unwrap().unwrap();
    let i1 = cursor.next_index().unwrap().unwrap();
    let i2 = cursor.next_index().unwrap().unwrap();
    assert_eq!(i1.header, i0.header + params.unit);
    assert_eq!(i2.header, i1.header + params.unit);
    assert_eq!(cursor.current_unit_ordinal(), Some(2));

    let back = cursor.prev_index().unwrap().unwrap();
    assert_eq!(back.header, i1.header);
    assert_eq!(cursor.current_unit_ordinal(), Some(1));
}

#[test]
fn delisted_streams_drop_out_of_later_indexes() {
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let gone = writer.create(StreamConfig::variable("gone")).unwrap();
    let keep = writer.create(StreamConfig::variable("keep")).unwrap();
    writer.write(gone, &[1; 50], false).unwrap();
    writer.close_stream(gone).unwrap();
    // Roll into the next unit.
    for _ in 0..12 {
        writer.write(keep, &[2; 800], false).unwrap();
    }
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    // Move into the second unit and load its Index.
    cursor.next_frame().unwrap().unwrap();
    cursor.next_frame().unwrap().unwrap();
    cursor.next_marker().unwrap().unwrap();
    cursor.next_index().unwrap().unwrap();
    assert_eq!(cursor.index(gone).unwrap(), None);
    assert!(cursor.index(keep).unwrap().is_some());
}
