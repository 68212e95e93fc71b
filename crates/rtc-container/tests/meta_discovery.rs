//! Stream registry discovery: Meta/meta absorption, hidden streams, late
//! creation, and the byte-order probe.

use pretty_assertions::assert_eq;
use rtc_container::{
    parse_document, ByteOrder, FrameLength, MemSource, Params, Reader, StreamConfig, StreamId,
    VecSink, Writer,
};

#[test]
fn meta_lists_only_visible_streams() {
    let mut writer = Writer::start(VecSink::new(), Params::default()).unwrap();
    writer
        .create(StreamConfig::variable("stdin").with_cont().with_content("utf-8"))
        .unwrap();
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    let meta = cursor.next_meta().unwrap().unwrap();
    assert_eq!(meta.stream, StreamId::META);
    let doc = parse_document(&cursor.read_payload(&meta).unwrap()).unwrap();

    let names: Vec<&str> = doc.entries.iter().filter_map(|e| e.name.as_deref()).collect();
    assert_eq!(names, ["Index", "index", "Meta", "Platform", "Crc"]);
    for hidden in ["nop", "padding", "Marker", "meta"] {
        assert!(!names.contains(&hidden), "{hidden} must stay hidden");
    }
    // The trailing integer is the next free id as of this Meta, which was
    // emitted at unit open, before "stdin" was created.
    assert_eq!(doc.next_id, 9);
}

#[test]
fn unknown_ids_trigger_a_one_shot_meta_lookup() {
    // Disguise the inline meta frame announcing a stream as padding; the
    // reader must then resolve the unknown id from the next unit's Meta.
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let a = writer.create(StreamConfig::variable("a")).unwrap();
    writer.write(a, &[0x77; 60], false).unwrap();
    let b = writer.create(StreamConfig::variable("b")).unwrap();
    writer.write(b, b"found me", false).unwrap();
    // Roll into the next unit so its Meta lists "b".
    for _ in 0..12 {
        writer.write(a, &[0x77; 800], false).unwrap();
    }
    let mut bytes = writer.stop().unwrap().into_bytes();

    let announce = b"[{id:10,name:\"b\"},11]";
    let at = bytes
        .windows(announce.len())
        .position(|w| w == announce)
        .expect("inline meta for b");
    // Tag byte sits just before the length byte; rewrite `meta` (id 6) to
    // `padding` (id 1), keeping the frame length intact.
    assert_eq!(bytes[at - 2], 6 << 1);
    bytes[at - 2] = 1 << 1;

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    let frame = cursor.next_frame_of(b).unwrap().expect("b resolved via lookup");
    assert_eq!(cursor.read_payload(&frame).unwrap(), b"found me");
    assert_eq!(cursor.stream(b).unwrap().config.name, "b");
}

#[test]
fn inline_meta_announces_new_streams_mid_unit() {
    let mut writer = Writer::start(VecSink::new(), Params::default()).unwrap();
    let a = writer.create(StreamConfig::variable("early")).unwrap();
    writer.write(a, b"x", false).unwrap();
    let b = writer
        .create(StreamConfig::fixed("late", 8).with_content("u64"))
        .unwrap();
    writer.write(b, &[9u8; 8], false).unwrap();
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();

    // Plain traversal absorbs the inline metas; both streams end up in the
    // registry with their configuration.
    while cursor.next_frame().unwrap().is_some() {}
    let early = cursor.stream(a).expect("early registered");
    assert_eq!(early.config.name, "early");
    assert_eq!(early.config.frame_length, FrameLength::Variable);
    let late = cursor.stream(b).expect("late registered");
    assert_eq!(late.config.name, "late");
    assert_eq!(late.config.frame_length, FrameLength::Fixed(8));
    assert_eq!(late.config.content.as_deref(), Some("u64"));
    assert!(late.raw.as_deref().unwrap().contains("name:\"late\""));
}

/// A stream created in a later unit is discovered by a cursor that starts
/// there, without walking the earlier units.
#[test]
fn late_streams_are_discovered_from_the_units_meta() {
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let a = writer.create(StreamConfig::variable("a")).unwrap();
    // Fill unit 0 and some of unit 1.
    for _ in 0..12 {
        writer.write(a, &[0xAA; 800], false).unwrap();
    }
    let b = writer.create(StreamConfig::variable("b")).unwrap();
    // Roll into the next unit so `b`'s data lives in a unit whose Meta
    // lists it.
    for _ in 0..12 {
        writer.write(a, &[0xAA; 800], false).unwrap();
    }
    writer.write(b, b"late data", false).unwrap();
    let bytes = writer.stop().unwrap().into_bytes();
    let last_unit = (bytes.len() as u64 / params.unit) * params.unit;

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    cursor.seek(last_unit);
    let frame = cursor.next_frame_of(b).unwrap().expect("b has data here");
    assert_eq!(cursor.read_payload(&frame).unwrap(), b"late data");
    assert_eq!(cursor.stream(b).unwrap().config.name, "b");
}

#[test]
fn next_and_prev_meta_walk_units() {
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let a = writer.create(StreamConfig::variable("a")).unwrap();
    for _ in 0..25 {
        writer.write(a, &[0x55; 800], false).unwrap();
    }
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();

    let m0 = cursor.next_meta().unwrap().unwrap();
    assert!(m0.header < params.unit);
    // The cursor sits on the Meta; the next call yields the following
    // unit's.
    let m1 = cursor.next_meta().unwrap().unwrap();
    assert!(m1.header > params.unit && m1.header < 2 * params.unit);

    let back = cursor.prev_meta().unwrap().unwrap();
    assert_eq!(back.header, m1.header);
    cursor.seek(m1.header - 10);
    cursor.find_marker(false).unwrap().unwrap();
    let back = cursor.prev_meta().unwrap().unwrap();
    assert_eq!(back.header, m0.header);
}

#[test]
fn renames_are_rejected_on_absorption() {
    // Forge a second unit whose Meta renames stream 9; the registry keeps
    // the original name.
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let a = writer.create(StreamConfig::variable("original")).unwrap();
    for _ in 0..12 {
        writer.write(a, &[0x11; 800], false).unwrap();
    }
    let mut bytes = writer.stop().unwrap().into_bytes();

    // Patch the second unit's Meta document in place: the name "original"
    // becomes "impostor" (same length, so framing is unaffected).
    let unit1 = 8192usize;
    let window = &mut bytes[unit1..];
    let at = window
        .windows(10)
        .position(|w| w == b"\"original\"")
        .expect("second unit lists the stream");
    window[at..at + 10].copy_from_slice(b"\"impostor\"");

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();
    while cursor.next_frame().unwrap().is_some() {}
    assert_eq!(cursor.stream(a).unwrap().config.name, "original");
}

#[test]
fn platform_probe_reports_writer_byte_order() {
    let bytes = {
        let mut writer = Writer::start(VecSink::new(), Params::default()).unwrap();
        let s = writer.create(StreamConfig::variable("s")).unwrap();
        writer.write(s, b"payload", false).unwrap();
        writer.stop().unwrap().into_bytes()
    };

    let mut reader = Reader::new(MemSource::new(bytes.clone()));
    let mut cursor = reader.cursor();
    assert_eq!(cursor.byte_order(), None);
    while cursor.next_frame().unwrap().is_some() {}
    assert_eq!(cursor.byte_order(), Some(ByteOrder::native()));
    assert!(!cursor.byte_swapped());

    // A foreign-endian container: swap the Platform payload.
    let mut swapped = bytes;
    let mut probe_reader = Reader::new(MemSource::new(swapped.clone()));
    let mut probe = probe_reader.cursor();
    let platform = probe.next_frame_of(StreamId::PLATFORM).unwrap().unwrap();
    let start = platform.payload as usize;
    swapped[start..start + 4].reverse();

    let mut reader = Reader::new(MemSource::new(swapped));
    let mut cursor = reader.cursor();
    while cursor.next_frame().unwrap().is_some() {}
    let foreign = match ByteOrder::native() {
        ByteOrder::Little => ByteOrder::Big,
        ByteOrder::Big => ByteOrder::Little,
    };
    assert_eq!(cursor.byte_order(), Some(foreign));
    assert!(cursor.byte_swapped());
    // The patched byte range makes the unit checksum disagree, which is
    // reported, not fatal.
    assert!(cursor.unit_suspect());
}

#[test]
fn meta_occurrence_only_moves_when_the_registry_changes() {
    // With no registry changes after unit 0, later Indexes keep pointing
    // at the first unit's Meta.
    let params = Params { unit: 8192, subunit: 8192 };
    let mut writer = Writer::start(VecSink::new(), params).unwrap();
    let a = writer.create(StreamConfig::variable("a")).unwrap();
    for _ in 0..25 {
        writer.write(a, &[0x66; 800], false).unwrap();
    }
    let bytes = writer.stop().unwrap().into_bytes();

    let mut reader = Reader::new(MemSource::new(bytes));
    let mut cursor = reader.cursor();

    // Find unit 0's Meta offset.
    let m0 = cursor.next_meta().unwrap().unwrap();

    // Jump to the third unit and look up the Meta stream in its Index.
    cursor.seek(2 * params.unit);
    cursor.next_frame().unwrap().unwrap();
    cursor.next_frame().unwrap().unwrap();
    // "a" was created after unit 0's Meta, so the registry changed once;
    // the Meta occurrence pins to unit 1's Meta and stays there.
    let meta_occurrence = cursor.index(StreamId::META).unwrap().unwrap();
    assert!(meta_occurrence > m0.header, "occurrence moved past unit 0's Meta");
    assert!(meta_occurrence < 2 * params.unit, "and then stopped moving");
}
