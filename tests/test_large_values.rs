use coppice::page::max_inline_value;
use coppice::{EnvBuilder, PutFlags};
use tempfile::TempDir;

#[test]
fn inline_threshold_boundary() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let key = b"boundary";
    let limit = max_inline_value(4096, key.len());

    // Exactly at the limit: stays inline, no large pages appear.
    let mut wtxn = env.begin_write().unwrap();
    let at = vec![0xAAu8; limit];
    db.put(&mut wtxn, key, &at, PutFlags::empty()).unwrap();
    assert_eq!(db.stat(&wtxn).unwrap().large_pages, 0);
    assert_eq!(db.get(&wtxn, key).unwrap(), Some(at.as_slice()));
    wtxn.commit().unwrap();

    // One byte over: the value moves to a large-page run.
    let mut wtxn = env.begin_write().unwrap();
    let over = vec![0xBBu8; limit + 1];
    db.put(&mut wtxn, key, &over, PutFlags::empty()).unwrap();
    assert!(db.stat(&wtxn).unwrap().large_pages >= 1);
    assert_eq!(db.get(&wtxn, key).unwrap(), Some(over.as_slice()));
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, key).unwrap(), Some(over.as_slice()));
}

#[test]
fn multi_page_values_round_trip() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    // Spans several pages; contents patterned to catch misalignment.
    let big: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"big", &big, PutFlags::empty()).unwrap();
    let stat = db.stat(&wtxn).unwrap();
    assert!(stat.large_pages >= 10, "40 KB needs a run of pages");
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"big").unwrap(), Some(big.as_slice()));
}

#[test]
fn overwrite_retires_the_old_run() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let big = vec![0xCCu8; 20_000];
    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"k", &big, PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    // Replacing with a small value drops the run from the accounting.
    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"k", b"small", PutFlags::empty()).unwrap();
    assert_eq!(db.stat(&wtxn).unwrap().large_pages, 0);
    wtxn.commit().unwrap();

    // The freed run is reclaimable: another big value should not push
    // the file far past its previous size.
    let before = env.info().unwrap().next_pgno;
    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"k2", &big, PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();
    let after = env.info().unwrap().next_pgno;
    assert!(after <= before + 3, "large run was not reused: {before} -> {after}");

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"k").unwrap(), Some(&b"small"[..]));
    assert_eq!(db.get(&rtxn, b"k2").unwrap(), Some(big.as_slice()));
}

#[test]
fn delete_retires_the_run() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();

    let big = vec![0xDDu8; 30_000];
    let mut wtxn = env.begin_write().unwrap();
    db.put(&mut wtxn, b"gone", &big, PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = env.begin_write().unwrap();
    assert!(db.del(&mut wtxn, b"gone", None).unwrap());
    assert_eq!(db.stat(&wtxn).unwrap().large_pages, 0);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"gone").unwrap(), None);
}
