use coppice::{EnvBuilder, Error, PutFlags, TxnId, TxnRead};
use tempfile::TempDir;

#[test]
fn empty_open_layout() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();

    let info = env.info().unwrap();
    assert_eq!(info.page_size, 4096);
    // Three freshly written metas carry txnids 1, 2, 3; the head is the
    // highest, sitting in the last slot.
    assert_eq!(info.last_txnid, TxnId(3));
    assert_eq!(info.next_pgno, 3);

    let stat = env.stat().unwrap();
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.entries, 0);

    drop(env);
    let len = std::fs::metadata(dir.path().join("data.cdb")).unwrap().len();
    assert_eq!(len, 3 * 4096, "a new database is exactly the meta triad");
}

#[test]
fn put_commit_get() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"alpha", b"1", PutFlags::empty()).unwrap();
    db.put(&mut wtxn, b"bravo", b"2", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert!(rtxn.id() > TxnId(3));
    assert_eq!(env.info().unwrap().last_txnid, rtxn.id());

    assert_eq!(db.get(&rtxn, b"alpha").unwrap(), Some(&b"1"[..]));
    assert_eq!(db.get(&rtxn, b"bravo").unwrap(), Some(&b"2"[..]));
    assert_eq!(db.get(&rtxn, b"missing").unwrap(), None);

    let mut cursor = db.cursor(&rtxn).unwrap();
    let (k, v) = cursor.first().unwrap().unwrap();
    assert_eq!((k, v), (&b"alpha"[..], &b"1"[..]));
    let (k, _) = cursor.next().unwrap().unwrap();
    assert_eq!(k, b"bravo");
    assert!(cursor.next().unwrap().is_none());
}

#[test]
fn overwrite_and_delete() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"k", b"old", PutFlags::empty()).unwrap();
    db.put(&mut wtxn, b"k", b"new-value", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"k").unwrap(), Some(&b"new-value"[..]));
    drop(rtxn);

    let mut wtxn = env.begin_write().unwrap();
    assert!(db.del(&mut wtxn, b"k", None).unwrap());
    assert!(!db.del(&mut wtxn, b"k", None).unwrap());
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"k").unwrap(), None);
    assert_eq!(db.len(&rtxn).unwrap(), 0);
}

#[test]
fn no_overwrite_reports_key_exist() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"k", b"v", PutFlags::empty()).unwrap();
    let err = db.put(&mut wtxn, b"k", b"w", PutFlags::NO_OVERWRITE).unwrap_err();
    assert!(matches!(err, Error::KeyExist));
    // The original value is untouched.
    assert_eq!(db.get(&wtxn, b"k").unwrap(), Some(&b"v"[..]));
    wtxn.commit().unwrap();
}

#[test]
fn key_size_is_bounded() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let max = coppice::page::max_key_size(4096);
    let mut wtxn = env.begin_write().unwrap();

    let key = vec![0x42u8; max];
    db.put(&mut wtxn, &key, b"fits", PutFlags::empty()).unwrap();
    assert_eq!(db.get(&wtxn, &key).unwrap(), Some(&b"fits"[..]));

    let long = vec![0x42u8; max + 1];
    let err = db.put(&mut wtxn, &long, b"v", PutFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::KeyTooLong { .. }));

    assert!(db.del(&mut wtxn, &key, None).unwrap());
    wtxn.commit().unwrap();
}

#[test]
fn empty_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    let err = db.put(&mut wtxn, b"", b"v", PutFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}

#[test]
fn append_mode_enforces_order() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"aaa", b"1", PutFlags::APPEND).unwrap();
    db.put(&mut wtxn, b"bbb", b"2", PutFlags::APPEND).unwrap();
    let err = db.put(&mut wtxn, b"abc", b"3", PutFlags::APPEND).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), 2);
}
