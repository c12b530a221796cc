use logbook::{Error, Journal, LogId, Position};
use tempfile::tempdir;

#[test]
fn write_then_read_in_order() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");

    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"a").expect("write a");
    writer.write(b"bc").expect("write bc");
    drop(writer);

    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");

    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");

    let interval = reader.read_interval().expect("interval");
    assert_eq!(interval.count, 2);
    assert_eq!(interval.start, LogId::new(0, 1));
    assert_eq!(interval.finish, LogId::new(0, 2));

    let first = reader.read_message(interval.start).expect("read first");
    assert_eq!(first.payload, b"a");

    let mut finish = interval.finish;
    let next = reader
        .advance_id(interval.start, &mut finish)
        .expect("advance");
    let second = reader.read_message(next).expect("read second");
    assert_eq!(second.payload, b"bc");

    reader.read_checkpoint(next).expect("checkpoint");
    let drained = reader.read_interval().expect("interval after");
    assert_eq!(drained.count, 0);

    // Segment, index, metastore and checkpoint all count.
    let segment_bytes = 2 * 16 + 1 + 2;
    assert!(reader.raw_size() >= segment_bytes + 16 + 8);
}

#[test]
fn empty_payload_round_trips() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"").expect("write empty");
    drop(writer);

    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");
    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");

    let interval = reader.read_interval().expect("interval");
    assert_eq!(interval.count, 1);
    let message = reader.read_message(interval.start).expect("read");
    assert!(message.payload.is_empty());
    assert_eq!(message.header.mlen, 0);
}

#[test]
fn marker_zero_is_not_addressable() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"payload").expect("write");
    drop(writer);

    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");
    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");
    reader.read_interval().expect("interval");

    assert!(matches!(
        reader.read_message(LogId::new(0, 0)),
        Err(Error::IllegalLogId)
    ));
}

#[test]
fn modes_are_enforced() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");

    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    assert!(matches!(writer.read_interval(), Err(Error::IllegalWrite)));
    assert!(matches!(
        writer.read_checkpoint(LogId::new(0, 0)),
        Err(Error::IllegalCheckpoint)
    ));
    writer.write(b"x").expect("write");
    drop(writer);

    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");
    assert!(matches!(reader.write(b"nope"), Err(Error::IllegalWrite)));
}

#[test]
fn timestamps_are_preserved() {
    use std::time::{Duration, UNIX_EPOCH};

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    let when = UNIX_EPOCH + Duration::new(1_234_567, 89_000);
    writer
        .write_message(b"stamped", Some(when))
        .expect("write");
    drop(writer);

    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");
    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");
    let interval = reader.read_interval().expect("interval");
    let message = reader.read_message(interval.start).expect("read");
    assert_eq!(message.header.tv_sec, 1_234_567);
    assert_eq!(message.header.tv_usec, 89_000);
}
