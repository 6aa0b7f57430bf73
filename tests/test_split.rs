use coppice::{EnvBuilder, PutFlags};
use tempfile::TempDir;

fn key(i: usize) -> Vec<u8> {
    format!("{i:04}").into_bytes()
}

#[test]
fn ascending_inserts_split_and_stay_ordered() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();
    let value = vec![0x77u8; 100];

    let mut wtxn = env.begin_write().unwrap();
    let mut saw_depth_one = false;
    for i in 0..1000 {
        db.put(&mut wtxn, &key(i), &value, PutFlags::empty()).unwrap();
        let depth = db.stat(&wtxn).unwrap().depth;
        if depth == 1 {
            saw_depth_one = true;
        }
    }
    assert!(saw_depth_one, "the tree must start as a single leaf");
    let stat = db.stat(&wtxn).unwrap();
    assert_eq!(stat.entries, 1000);
    assert_eq!(stat.depth, 2, "1000 short keys fit one branch level");
    assert!(stat.leaf_pages > 1);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0;
    while let Some((k, v)) = c.next().unwrap() {
        if let Some(p) = &prev {
            assert!(p.as_slice() < k, "iteration out of order");
        }
        assert_eq!(v, value.as_slice());
        prev = Some(k.to_vec());
        count += 1;
    }
    assert_eq!(count, 1000);
}

#[test]
fn root_branch_split_grows_depth() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(64 << 20).open(dir.path()).unwrap();
    let db = env.main_db();
    let value = vec![0u8; 100];

    let mut wtxn = env.begin_write().unwrap();
    let mut i = 0usize;
    // Keep inserting until the root branch itself splits.
    while db.stat(&wtxn).unwrap().depth < 3 {
        let k = format!("{i:08}").into_bytes();
        db.put(&mut wtxn, &k, &value, PutFlags::APPEND).unwrap();
        i += 1;
        assert!(i < 500_000, "tree never reached depth 3");
    }
    let total = i;
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), total as u64);
    let stat = db.stat(&rtxn).unwrap();
    assert_eq!(stat.depth, 3);
    assert!(stat.branch_pages >= 3, "a split root implies multiple branches");
}

#[test]
fn delete_collapses_root() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();
    let value = vec![0x11u8; 100];

    let mut wtxn = env.begin_write().unwrap();
    for i in 0..500 {
        db.put(&mut wtxn, &key(i), &value, PutFlags::empty()).unwrap();
    }
    assert_eq!(db.stat(&wtxn).unwrap().depth, 2);

    // Delete down to one entry: the branch root collapses back to a
    // single leaf.
    for i in 0..499 {
        assert!(db.del(&mut wtxn, &key(i), None).unwrap());
    }
    let stat = db.stat(&wtxn).unwrap();
    assert_eq!(stat.entries, 1);
    assert_eq!(stat.depth, 1);
    assert_eq!(stat.branch_pages, 0);
    assert_eq!(stat.leaf_pages, 1);

    // And removing the last entry empties the tree completely.
    assert!(db.del(&mut wtxn, &key(499), None).unwrap());
    let stat = db.stat(&wtxn).unwrap();
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.leaf_pages, 0);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), 0);
    let mut c = db.cursor(&rtxn).unwrap();
    assert!(c.first().unwrap().is_none());
}

#[test]
fn random_deletes_rebalance() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();
    let value = vec![0x22u8; 120];

    let mut wtxn = env.begin_write().unwrap();
    for i in 0..800 {
        db.put(&mut wtxn, &key(i), &value, PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    // Delete every other key, then verify both halves.
    let mut wtxn = env.begin_write().unwrap();
    for i in (0..800).step_by(2) {
        assert!(db.del(&mut wtxn, &key(i), None).unwrap());
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.len(&rtxn).unwrap(), 400);
    for i in 0..800 {
        let got = db.get(&rtxn, &key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None, "key {i} should be gone");
        } else {
            assert_eq!(got, Some(value.as_slice()), "key {i} should survive");
        }
    }
}
