use std::fs;

use logbook::{Journal, Position};
use tempfile::tempdir;

/// Cut the last byte off a file.
fn tear(path: &std::path::Path) {
    let len = fs::metadata(path).expect("metadata").len();
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for tear");
    file.set_len(len - 1).expect("truncate");
}

#[test]
fn torn_record_is_withheld_and_repaired_away() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"alpha").expect("write alpha");
    writer.write(b"bravo").expect("write bravo");
    drop(writer);

    let segment = path.join("00000000");
    tear(&segment);

    Journal::new(&path)
        .add_subscriber(b"sub", Position::Begin)
        .expect("add subscriber");
    let mut reader = Journal::new(&path);
    reader.open_reader(b"sub").expect("open reader");

    // Resync stops at the torn record; only the whole one is offered.
    let interval = reader.read_interval().expect("interval");
    assert_eq!(interval.count, 1);
    let message = reader.read_message(interval.start).expect("read");
    assert_eq!(message.payload, b"alpha");
    drop(reader);

    // Repair excises the torn tail, once.
    let mut fixer = Journal::new(&path);
    assert_eq!(fixer.repair_datafile(0).expect("repair"), 1);

    let compacted = fs::read(&segment).expect("read segment");
    assert_eq!(fixer.repair_datafile(0).expect("repair again"), 0);
    assert_eq!(fs::read(&segment).expect("reread segment"), compacted);

    let inspection = fixer.inspect_datafile(0).expect("inspect");
    assert_eq!(inspection.records.len(), 1);
    assert_eq!(inspection.records[0].mlen, 5);
    assert_eq!(inspection.trailing_junk, 0);
}

#[test]
fn inspection_reports_a_torn_tail() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("journal");

    Journal::new(&path).init().expect("init");
    let mut writer = Journal::new(&path);
    writer.open_writer().expect("open writer");
    writer.write(b"whole").expect("write");
    writer.write(b"torn").expect("write");
    drop(writer);

    let segment = path.join("00000000");
    tear(&segment);

    let mut journal = Journal::new(&path);
    let inspection = journal.inspect_datafile(0).expect("inspect");
    assert_eq!(inspection.records.len(), 1);
    // Header plus all but the last payload byte.
    assert_eq!(inspection.trailing_junk, 16 + 3);
}
