use logbook::{Error, Journal, Position};
use tempfile::tempdir;

#[test]
fn subscriber_at_end_sees_only_new_writes() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    for i in 0..10u8 {
        writer.write(&[i]).expect("write");
    }

    Journal::new(&path)
        .add_subscriber(b"x", Position::End)
        .expect("add subscriber");

    let mut reader = Journal::new(&path);
    reader.open_reader(b"x").expect("open reader");
    assert_eq!(reader.read_interval().expect("interval").count, 0);

    // Later writes become visible.
    writer.write(b"fresh").expect("write fresh");
    let interval = reader.read_interval().expect("interval after write");
    assert_eq!(interval.count, 1);
    let message = reader.read_message(interval.start).expect("read");
    assert_eq!(message.payload, b"fresh");
}

#[test]
fn duplicate_subscriber_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut journal = Journal::new(&path);
    journal
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");
    assert!(matches!(
        journal.add_subscriber(b"sub", Position::Begin),
        Err(Error::SubscriberExists)
    ));
}

#[test]
fn names_are_opaque_bytes_and_listable() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut journal = Journal::new(&path);
    let odd_name = [0u8, b'/', 0xff, b'.'];
    journal
        .add_subscriber(&odd_name, Position::Begin)
        .expect("add odd subscriber");
    journal
        .add_subscriber(b"plain", Position::Begin)
        .expect("add plain subscriber");

    let mut listed = journal.list_subscribers().expect("list");
    listed.sort();
    let mut expected = vec![odd_name.to_vec(), b"plain".to_vec()];
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn removed_subscriber_cannot_reattach() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut journal = Journal::new(&path);
    journal
        .add_subscriber(b"gone", Position::Begin)
        .expect("add subscriber");
    assert!(journal.remove_subscriber(b"gone").expect("remove"));
    assert!(!journal.remove_subscriber(b"gone").expect("remove again"));

    let mut reader = Journal::new(&path);
    assert!(matches!(
        reader.open_reader(b"gone"),
        Err(Error::InvalidSubscriber)
    ));
}

#[test]
fn copied_checkpoint_positions_the_new_subscriber() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"one").expect("write");
    writer.write(b"two").expect("write");
    writer.write(b"three").expect("write");
    drop(writer);

    Journal::new(&path)
        .add_subscriber(b"a", Position::Begin)
        .expect("add a");

    // Consume the first two records as "a".
    let mut reader = Journal::new(&path);
    reader.open_reader(b"a").expect("open a");
    let interval = reader.read_interval().expect("interval");
    assert_eq!(interval.count, 3);
    let mut finish = interval.finish;
    let second = reader
        .advance_id(interval.start, &mut finish)
        .expect("advance");
    reader.read_checkpoint(second).expect("checkpoint a");
    drop(reader);

    let mut journal = Journal::new(&path);
    journal
        .add_subscriber_copy_checkpoint(b"b", b"a")
        .expect("copy checkpoint");

    let mut reader = Journal::new(&path);
    reader.open_reader(b"b").expect("open b");
    let interval = reader.read_interval().expect("interval b");
    assert_eq!(interval.count, 1);
    let message = reader.read_message(interval.start).expect("read");
    assert_eq!(message.payload, b"three");
}

#[test]
fn unknown_subscriber_cannot_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");
    Journal::new(&path).init().expect("init");

    let mut reader = Journal::new(&path);
    assert!(matches!(
        reader.open_reader(b"nobody"),
        Err(Error::InvalidSubscriber)
    ));
}
