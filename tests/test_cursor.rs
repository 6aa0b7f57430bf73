use coppice::{EnvBuilder, PutFlags};
use tempfile::TempDir;

fn seeded_env(dir: &TempDir, n: u32) -> coppice::Environment {
    let env = EnvBuilder::new().map_size(16 << 20).open(dir.path()).unwrap();
    let db = env.main_db();
    let mut wtxn = env.begin_write().unwrap();
    for i in 0..n {
        let k = format!("k{i:03}");
        let v = format!("v{i:03}");
        db.put(&mut wtxn, k.as_bytes(), v.as_bytes(), PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();
    env
}

#[test]
fn navigation_both_directions() {
    let dir = TempDir::new().unwrap();
    let env = seeded_env(&dir, 10);
    let db = env.main_db();
    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();

    assert_eq!(c.first().unwrap().unwrap().0, b"k000");
    assert_eq!(c.next().unwrap().unwrap().0, b"k001");
    assert_eq!(c.prev().unwrap().unwrap().0, b"k000");
    assert!(c.prev().unwrap().is_none());

    assert_eq!(c.last().unwrap().unwrap().0, b"k009");
    assert!(c.next().unwrap().is_none());
}

#[test]
fn set_range_finds_the_ceiling() {
    let dir = TempDir::new().unwrap();
    let env = seeded_env(&dir, 10);
    let db = env.main_db();
    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();

    assert_eq!(c.set_range(b"k0035").unwrap().unwrap().0, b"k004");
    assert_eq!(c.set_range(b"k000").unwrap().unwrap().0, b"k000");
    assert!(c.set_range(b"z").unwrap().is_none());
    assert!(c.set_key(b"k0035").unwrap().is_none());
    assert_eq!(c.set_key(b"k007").unwrap().unwrap().1, b"v007");
}

#[test]
fn get_batch_drains_in_order() {
    let dir = TempDir::new().unwrap();
    let env = seeded_env(&dir, 25);
    let db = env.main_db();
    let rtxn = env.begin_read().unwrap();
    let mut c = db.cursor(&rtxn).unwrap();

    let first = c.get_batch(10).unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(first[0].0, b"k000");
    assert_eq!(first[9].0, b"k009");

    let rest = c.get_batch(100).unwrap();
    assert_eq!(rest.len(), 15);
    assert_eq!(rest.last().unwrap().0, b"k024");
    assert!(c.get_batch(5).unwrap().is_empty());
}

#[test]
fn write_cursor_survives_mutation() {
    let dir = TempDir::new().unwrap();
    let env = seeded_env(&dir, 10);
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    {
        let mut c = db.cursor_mut(&mut wtxn).unwrap();
        assert_eq!(c.set_key(b"k005").unwrap().unwrap().1, b"v005");
        // Mutations between navigations: the cursor re-anchors by key.
        c.put(b"k0055", b"inserted", PutFlags::empty()).unwrap();
        assert_eq!(c.next().unwrap().unwrap().0, b"k006".to_vec());
        assert_eq!(c.prev().unwrap().unwrap().0, b"k0055".to_vec());
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(db.get(&rtxn, b"k0055").unwrap(), Some(&b"inserted"[..]));
}

#[test]
fn write_cursor_delete_advances() {
    let dir = TempDir::new().unwrap();
    let env = seeded_env(&dir, 6);
    let db = env.main_db();

    let mut wtxn = env.begin_write().unwrap();
    {
        let mut c = db.cursor_mut(&mut wtxn).unwrap();
        c.first().unwrap().unwrap();
        // Delete every entry through the cursor.
        loop {
            match c.del() {
                Ok(()) => {}
                Err(coppice::Error::NotFound) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }
    assert_eq!(db.len(&wtxn).unwrap(), 0);
    wtxn.commit().unwrap();
}

#[test]
fn cursor_next_crosses_page_boundaries() {
    let dir = TempDir::new().unwrap();
    // Enough entries for several leaves.
    let env = seeded_env(&dir, 0);
    let db = env.main_db();
    let mut wtxn = env.begin_write().unwrap();
    let value = vec![0x5Au8; 200];
    for i in 0..500u32 {
        db.put(&mut wtxn, format!("{i:06}").as_bytes(), &value, PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert!(db.stat(&rtxn).unwrap().leaf_pages > 3);

    let mut c = db.cursor(&rtxn).unwrap();
    let mut n = 0u32;
    while let Some((k, _)) = c.next().unwrap() {
        assert_eq!(k, format!("{n:06}").as_bytes());
        n += 1;
    }
    assert_eq!(n, 500);

    // And the same backwards.
    let mut c = db.cursor(&rtxn).unwrap();
    let mut n = 500u32;
    while let Some((k, _)) = c.prev().unwrap() {
        n -= 1;
        assert_eq!(k, format!("{n:06}").as_bytes());
    }
    assert_eq!(n, 0);
}
