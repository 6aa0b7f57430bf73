use coppice::{DbFlags, EnvBuilder, Error, PutFlags};
use tempfile::TempDir;

#[test]
fn duplicates_iterate_in_order() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("dups"), DbFlags::DUP_SORT).unwrap();
    for v in [&b"cherry"[..], b"apple", b"banana"] {
        db.put(&mut wtxn, b"fruit", v, PutFlags::empty()).unwrap();
    }
    db.put(&mut wtxn, b"grain", b"rye", PutFlags::empty()).unwrap();
    assert_eq!(db.len(&wtxn).unwrap(), 4);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    // The first duplicate in comparator order is what a plain get sees.
    assert_eq!(db.get(&rtxn, b"fruit").unwrap(), Some(&b"apple"[..]));

    let mut c = db.cursor(&rtxn).unwrap();
    let mut pairs = Vec::new();
    while let Some((k, v)) = c.next().unwrap() {
        pairs.push((k.to_vec(), v.to_vec()));
    }
    assert_eq!(
        pairs,
        vec![
            (b"fruit".to_vec(), b"apple".to_vec()),
            (b"fruit".to_vec(), b"banana".to_vec()),
            (b"fruit".to_vec(), b"cherry".to_vec()),
            (b"grain".to_vec(), b"rye".to_vec()),
        ]
    );
}

#[test]
fn no_dup_data_rejects_existing_pair() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("dups"), DbFlags::DUP_SORT).unwrap();
    db.put(&mut wtxn, b"k", b"v1", PutFlags::empty()).unwrap();
    db.put(&mut wtxn, b"k", b"v2", PutFlags::empty()).unwrap();

    let err = db.put(&mut wtxn, b"k", b"v1", PutFlags::NO_DUP_DATA).unwrap_err();
    assert!(matches!(err, Error::KeyExist));
    // A fresh value is still welcome.
    db.put(&mut wtxn, b"k", b"v3", PutFlags::NO_DUP_DATA).unwrap();
    assert_eq!(db.len(&wtxn).unwrap(), 3);
    wtxn.commit().unwrap();
}

#[test]
fn sub_page_promotes_to_subtree_and_stays() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("dups"), DbFlags::DUP_SORT).unwrap();

    // Enough same-key values to overflow the embedded sub-page.
    let dup = |i: usize| format!("value-{i:04}").into_bytes();
    for i in 0..300 {
        db.put(&mut wtxn, b"hot", &dup(i), PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();
    assert!(c.set_key(b"hot").unwrap().is_some());
    assert_eq!(c.count().unwrap(), 300);

    // All duplicates come back, ordered.
    let mut seen = vec![c.current().unwrap().unwrap().1.to_vec()];
    while let Some((_, v)) = c.next_dup().unwrap() {
        seen.push(v.to_vec());
    }
    assert_eq!(seen.len(), 300);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    drop(rtxn);

    // Delete all but one: the nested subtree never demotes, but the
    // remaining duplicate must still be reachable.
    let mut wtxn = env.begin_write().unwrap();
    for i in 1..300 {
        assert!(db.del(&mut wtxn, b"hot", Some(&dup(i))).unwrap());
    }
    assert_eq!(db.len(&wtxn).unwrap(), 1);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"hot").unwrap(), Some(dup(0).as_slice()));
    let mut c = db.cursor(&rtxn).unwrap();
    c.set_key(b"hot").unwrap().unwrap();
    assert_eq!(c.count().unwrap(), 1);
}

#[test]
fn get_both_variants() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("dups"), DbFlags::DUP_SORT).unwrap();
    for v in [&b"bb"[..], b"dd", b"ff"] {
        db.put(&mut wtxn, b"k", v, PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();

    assert_eq!(c.get_both(b"k", b"dd").unwrap().map(|(_, v)| v.to_vec()), Some(b"dd".to_vec()));
    assert!(c.get_both(b"k", b"cc").unwrap().is_none());
    assert_eq!(
        c.get_both_range(b"k", b"cc").unwrap().map(|(_, v)| v.to_vec()),
        Some(b"dd".to_vec())
    );
    assert!(c.get_both_range(b"k", b"zz").unwrap().is_none());
}

#[test]
fn delete_whole_key_drops_every_duplicate() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env.create_db(&mut wtxn, Some("dups"), DbFlags::DUP_SORT).unwrap();
    for i in 0..50u32 {
        db.put(&mut wtxn, b"k", &i.to_be_bytes(), PutFlags::empty()).unwrap();
    }
    db.put(&mut wtxn, b"other", b"stays", PutFlags::empty()).unwrap();
    assert_eq!(db.len(&wtxn).unwrap(), 51);

    assert!(db.del(&mut wtxn, b"k", None).unwrap());
    assert_eq!(db.len(&wtxn).unwrap(), 1);
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"k").unwrap(), None);
    assert_eq!(db.get(&rtxn, b"other").unwrap(), Some(&b"stays"[..]));
}

#[test]
fn dupfixed_fixed_size_values() {
    let dir = TempDir::new().unwrap();
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();

    let mut wtxn = env.begin_write().unwrap();
    let db = env
        .create_db(&mut wtxn, Some("fixed"), DbFlags::DUP_SORT | DbFlags::DUP_FIXED)
        .unwrap();
    for i in (0..400u32).rev() {
        db.put(&mut wtxn, b"series", &i.to_be_bytes(), PutFlags::empty()).unwrap();
    }
    // Mismatched sizes are refused once the set is established.
    let err = db.put(&mut wtxn, b"series", b"short", PutFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();
    c.set_key(b"series").unwrap().unwrap();
    assert_eq!(c.count().unwrap(), 400);
    let mut expect = 0u32;
    let mut cur = c.current().unwrap().map(|(_, v)| v.to_vec());
    while let Some(v) = cur {
        assert_eq!(v, expect.to_be_bytes());
        expect += 1;
        cur = c.next_dup().unwrap().map(|(_, v)| v.to_vec());
    }
    assert_eq!(expect, 400);
}
