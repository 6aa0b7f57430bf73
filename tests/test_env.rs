use coppice::{DbFlags, EnvBuilder, Error, PutFlags};
use tempfile::TempDir;

#[test]
fn abort_is_a_perfect_noop() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    for i in 0..100u32 {
        db.put(&mut wtxn, &i.to_be_bytes(), b"committed", PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let meta_before: Vec<u8> = {
        let data = std::fs::read(dir.path().join("data.cdb")).unwrap();
        data[..3 * 4096].to_vec()
    };
    let info_before = env.info().unwrap();

    // A heavily mutating transaction that is then thrown away.
    let mut wtxn = env.begin_write().unwrap();
    for i in 0..100u32 {
        db.put(&mut wtxn, &i.to_be_bytes(), b"aborted", PutFlags::empty()).unwrap();
        db.put(&mut wtxn, &(1000 + i).to_be_bytes(), b"new", PutFlags::empty()).unwrap();
    }
    wtxn.abort();

    // The meta triad is byte-identical and the data is untouched.
    let meta_after: Vec<u8> = {
        let data = std::fs::read(dir.path().join("data.cdb")).unwrap();
        data[..3 * 4096].to_vec()
    };
    assert_eq!(meta_before, meta_after);
    assert_eq!(env.info().unwrap().last_txnid, info_before.last_txnid);

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), 100);
    for i in 0..100u32 {
        assert_eq!(db.get(&rtxn, &i.to_be_bytes()).unwrap(), Some(&b"committed"[..]));
    }
}

#[test]
fn named_databases_round_trip() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let users = env.create_db(&mut wtxn, Some("users"), DbFlags::empty()).unwrap();
    let logs = env.create_db(&mut wtxn, Some("logs"), DbFlags::INTEGER_KEY).unwrap();
    users.put(&mut wtxn, b"ada", b"lovelace", PutFlags::empty()).unwrap();
    logs.put(&mut wtxn, &7u64.to_le_bytes(), b"entry", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    // Reopen by name from a read transaction.
    let rtxn = env.begin_read().unwrap();
    let users2 = env.open_db(&rtxn, Some("users")).unwrap();
    assert_eq!(users2.get(&rtxn, b"ada").unwrap(), Some(&b"lovelace"[..]));
    let err = env.open_db(&rtxn, Some("absent")).unwrap_err();
    assert!(matches!(err, Error::BadDbi));

    // The two trees are independent.
    assert_eq!(users.len(&rtxn).unwrap(), 1);
    assert_eq!(logs.len(&rtxn).unwrap(), 1);
    assert_eq!(users.get(&rtxn, &7u64.to_le_bytes()).unwrap(), None);
}

#[test]
fn named_databases_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
        let mut wtxn = env.begin_write().unwrap();
        let db = env.create_db(&mut wtxn, Some("persistent"), DbFlags::empty()).unwrap();
        db.put(&mut wtxn, b"k", b"v", PutFlags::empty()).unwrap();
        wtxn.commit().unwrap();
    }
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let rtxn = env.begin_read().unwrap();
    let db = env.open_db(&rtxn, Some("persistent")).unwrap();
    assert_eq!(db.get(&rtxn, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn drop_db_removes_tree_and_record() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("doomed"), DbFlags::empty()).unwrap();
    for i in 0..200u32 {
        db.put(&mut wtxn, &i.to_be_bytes(), &[0u8; 300], PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_write().unwrap();
    env.drop_db(&mut wtxn, db).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let err = env.open_db(&rtxn, Some("doomed")).unwrap_err();
    assert!(matches!(err, Error::BadDbi));
    drop(rtxn);

    // The dropped tree's pages are reclaimable.
    let before = env.info().unwrap().next_pgno;
    let main = env.main_db();
    let mut wtxn = env.begin_write().unwrap();
    for i in 0..200u32 {
        main.put(&mut wtxn, &i.to_be_bytes(), &[1u8; 300], PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();
    let after = env.info().unwrap().next_pgno;
    assert!(after <= before + 8, "dropped pages were not reused: {before} -> {after}");
}

#[test]
fn sequence_counts_monotonically() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("seq"), DbFlags::empty()).unwrap();
    assert_eq!(db.sequence(&mut wtxn, 0).unwrap(), 0);
    assert_eq!(db.sequence(&mut wtxn, 1).unwrap(), 0);
    assert_eq!(db.sequence(&mut wtxn, 5).unwrap(), 1);
    assert_eq!(db.sequence(&mut wtxn, 0).unwrap(), 6);
    wtxn.commit().unwrap();

    // The counter is durable.
    let mut wtxn = env.begin_write().unwrap();
    assert_eq!(db.sequence(&mut wtxn, 1).unwrap(), 6);
    wtxn.commit().unwrap();
}

#[test]
fn clear_keeps_the_database() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    for i in 0..300u32 {
        db.put(&mut wtxn, &i.to_be_bytes(), &[9u8; 128], PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_write().unwrap();
    db.clear(&mut wtxn).unwrap();
    assert_eq!(db.len(&wtxn).unwrap(), 0);
    db.put(&mut wtxn, b"fresh", b"start", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), 1);
    assert_eq!(db.get(&rtxn, b"fresh").unwrap(), Some(&b"start"[..]));
}

#[test]
fn canary_travels_with_commits() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    wtxn.set_canary(11, 22, 33);
    db.put(&mut wtxn, b"x", b"y", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let wtxn = env.begin_write().unwrap();
    let canary = wtxn.canary();
    assert_eq!((canary.x, canary.y, canary.z), (11, 22, 33));
    assert_eq!(canary.v, 1);
    drop(wtxn);
}
