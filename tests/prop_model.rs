use coppice::{EnvBuilder, PutFlags};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    // A small keyspace makes overwrites and deletes of present keys
    // likely.
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', b'd']), 1..6)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), prop::collection::vec(any::<u8>(), 0..60))
            .prop_map(|(k, v)| Op::Put(k, v)),
        key_strategy().prop_map(Op::Del),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn matches_btreemap_model(ops in prop::collection::vec(op_strategy(), 1..150)) {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(32 << 20).open(dir.path()).unwrap();
        let db = env.main_db();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // Apply in committed batches so commit/reopen paths get
        // exercised, not just in-transaction state.
        for chunk in ops.chunks(30) {
            let mut wtxn = env.begin_write().unwrap();
            for op in chunk {
                match op {
                    Op::Put(k, v) => {
                        db.put(&mut wtxn, k, v, PutFlags::empty()).unwrap();
                        model.insert(k.clone(), v.clone());
                    }
                    Op::Del(k) => {
                        let was = db.del(&mut wtxn, k, None).unwrap();
                        prop_assert_eq!(was, model.remove(k).is_some());
                    }
                }
            }
            wtxn.commit().unwrap();
        }

        // Point lookups agree.
        let rtxn = env.begin_read().unwrap();
        for (k, v) in &model {
            prop_assert_eq!(db.get(&rtxn, k).unwrap(), Some(v.as_slice()));
        }

        // Full iteration agrees, order included.
        let mut c = db.cursor(&rtxn).unwrap();
        let mut iterated = Vec::new();
        while let Some((k, v)) = c.next().unwrap() {
            iterated.push((k.to_vec(), v.to_vec()));
        }
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(iterated, expected);
    }

    #[test]
    fn snapshots_are_frozen_under_churn(
        seed in prop::collection::vec((key_strategy(), prop::collection::vec(any::<u8>(), 1..40)), 5..40),
        churn in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(32 << 20).open(dir.path()).unwrap();
        let db = env.main_db();

        let mut wtxn = env.begin_write().unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (k, v) in &seed {
            db.put(&mut wtxn, k, v, PutFlags::empty()).unwrap();
            model.insert(k.clone(), v.clone());
        }
        wtxn.commit().unwrap();

        // Pin the snapshot, churn behind it, then verify the pinned
        // view never moved.
        let pinned = env.begin_read().unwrap();
        let mut wtxn = env.begin_write().unwrap();
        for op in &churn {
            match op {
                Op::Put(k, v) => {
                    db.put(&mut wtxn, k, v, PutFlags::empty()).unwrap();
                }
                Op::Del(k) => {
                    let _ = db.del(&mut wtxn, k, None).unwrap();
                }
            }
        }
        wtxn.commit().unwrap();

        for (k, v) in &model {
            prop_assert_eq!(db.get(&pinned, k).unwrap(), Some(v.as_slice()));
        }
        let mut c = db.cursor(&pinned).unwrap();
        let mut count = 0;
        while c.next().unwrap().is_some() {
            count += 1;
        }
        prop_assert_eq!(count, model.len());
    }
}
