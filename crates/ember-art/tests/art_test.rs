//! End-to-end tests for the persistent radix tree: durability across
//! reopen, ordering, range semantics against a reference ordered map, and
//! transaction rollback.

use ember_art::{ConcurrentRadixTree, RadixTree, Transaction, TxState};
use ember_common::{EmberError, PoolConfig};
use ember_pool::MemoryPool;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tempfile::TempDir;

fn new_pool(dir: &TempDir, name: &str) -> Arc<MemoryPool> {
    let config = PoolConfig {
        path: dir.path().join(name),
        size: 64 * 1024 * 1024,
        sync_writes: false,
    };
    MemoryPool::create(&config).unwrap()
}

fn random_keys(rng: &mut StdRng, n: usize) -> Vec<Vec<u8>> {
    let mut keys = Vec::with_capacity(n);
    for _ in 0..n {
        let len = rng.gen_range(1..=24);
        let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        keys.push(key);
    }
    keys.sort();
    keys.dedup();
    keys
}

#[test]
fn round_trip_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("roundtrip.pool");
    let mut rng = StdRng::seed_from_u64(7);
    let keys = random_keys(&mut rng, 400);

    let mut expected = BTreeMap::new();
    let size_before;
    let first_before;
    let last_before;
    {
        let pool = new_pool(&dir, "roundtrip.pool");
        let mut tree = RadixTree::new(&pool).unwrap();
        for (i, key) in keys.iter().enumerate() {
            let value = i as u64 + 1;
            tree.put(key, value).unwrap();
            expected.insert(key.clone(), value);
        }
        pool.set_root(tree.handle()).unwrap();
        size_before = tree.size().unwrap();
        first_before = tree.first_key().unwrap();
        last_before = tree.last_key().unwrap();
    }

    let pool = MemoryPool::open(&path).unwrap();
    let tree = RadixTree::from_handle(&pool, pool.root()).unwrap();
    assert_eq!(tree.size().unwrap(), size_before);
    assert_eq!(tree.size().unwrap(), expected.len() as u64);
    assert_eq!(tree.first_key().unwrap(), first_before);
    assert_eq!(tree.last_key().unwrap(), last_before);
    assert_eq!(&first_before, expected.keys().next().unwrap());
    assert_eq!(&last_before, expected.keys().next_back().unwrap());
    for (key, value) in &expected {
        assert_eq!(tree.get(key).unwrap(), *value, "key {key:02x?}");
    }
}

#[test]
fn forward_and_reverse_order_match_reference() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "order.pool");
    let mut tree = RadixTree::new(&pool).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut expected = BTreeMap::new();

    let mut keys = random_keys(&mut rng, 500);
    // shuffle the sorted keys so insertion order is unrelated to key order
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    for (i, key) in keys.iter().enumerate() {
        tree.put(key, i as u64 + 1).unwrap();
        expected.insert(key.clone(), i as u64 + 1);
    }

    let forward: Vec<(Vec<u8>, u64)> = tree
        .iter()
        .unwrap()
        .map(|e| e.map(|e| (e.key, e.value)).unwrap())
        .collect();
    let reference: Vec<(Vec<u8>, u64)> =
        expected.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(forward, reference);

    let mut reverse: Vec<(Vec<u8>, u64)> = tree
        .iter_rev()
        .unwrap()
        .map(|e| e.map(|e| (e.key, e.value)).unwrap())
        .collect();
    reverse.reverse();
    assert_eq!(reverse, reference);
}

#[test]
fn ranges_match_reference_submap() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "range.pool");
    let mut tree = RadixTree::new(&pool).unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    let mut expected = BTreeMap::new();

    for key in random_keys(&mut rng, 300) {
        let value = rng.gen_range(1..u64::MAX);
        tree.put(&key, value).unwrap();
        expected.insert(key, value);
    }

    // bounds both on and between stored keys
    let stored: Vec<Vec<u8>> = expected.keys().cloned().collect();
    let mut bounds: Vec<Vec<u8>> = stored.iter().step_by(37).cloned().collect();
    bounds.push(vec![0x01]);
    bounds.push(vec![0x80, 0x80]);
    bounds.push(vec![0xfe, 0xff, 0xff]);

    for from in &bounds {
        for to in &bounds {
            if from > to {
                assert!(matches!(
                    tree.range(from, true, to, true),
                    Err(EmberError::InvalidRange)
                ));
                continue;
            }
            for (fi, ti) in [(true, true), (true, false), (false, true), (false, false)] {
                let got: Vec<(Vec<u8>, u64)> = tree
                    .range(from, fi, to, ti)
                    .unwrap()
                    .map(|e| e.map(|e| (e.key, e.value)).unwrap())
                    .collect();
                let lo = if fi {
                    Bound::Included(from.clone())
                } else {
                    Bound::Excluded(from.clone())
                };
                let hi = if ti {
                    Bound::Included(to.clone())
                } else {
                    Bound::Excluded(to.clone())
                };
                if from == to && (!fi || !ti) {
                    // a BTreeMap panics on this degenerate bound pair; the
                    // tree simply yields nothing
                    assert!(got.is_empty());
                    continue;
                }
                let reference: Vec<(Vec<u8>, u64)> = expected
                    .range((lo, hi))
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                assert_eq!(got, reference, "bounds {from:02x?}({fi}) .. {to:02x?}({ti})");

                let mut rev: Vec<(Vec<u8>, u64)> = tree
                    .range_rev(from, fi, to, ti)
                    .unwrap()
                    .map(|e| e.map(|e| (e.key, e.value)).unwrap())
                    .collect();
                rev.reverse();
                assert_eq!(rev, reference, "rev bounds {from:02x?} .. {to:02x?}");
            }
        }
    }

    // head and tail against the same reference
    for bound in &bounds {
        for inclusive in [true, false] {
            let got: Vec<Vec<u8>> = tree
                .head(bound, inclusive)
                .unwrap()
                .map(|e| e.unwrap().key)
                .collect();
            let hi = if inclusive {
                Bound::Included(bound.clone())
            } else {
                Bound::Excluded(bound.clone())
            };
            let reference: Vec<Vec<u8>> = expected
                .range((Bound::Unbounded, hi))
                .map(|(k, _)| k.clone())
                .collect();
            assert_eq!(got, reference);

            let got: Vec<Vec<u8>> = tree
                .tail(bound, inclusive)
                .unwrap()
                .map(|e| e.unwrap().key)
                .collect();
            let lo = if inclusive {
                Bound::Included(bound.clone())
            } else {
                Bound::Excluded(bound.clone())
            };
            let reference: Vec<Vec<u8>> = expected
                .range((lo, Bound::Unbounded))
                .map(|(k, _)| k.clone())
                .collect();
            assert_eq!(got, reference);
        }
    }
}

#[test]
fn prefix_family_scenario() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "prefix.pool");
    let mut tree = RadixTree::new(&pool).unwrap();

    let zeros = [0u8; 8];
    let ffs = [0xffu8; 20];
    let prefix = [0xffu8; 12];
    tree.put(&zeros, 100).unwrap();
    tree.put(&ffs, 200).unwrap();
    tree.put(&prefix, 300).unwrap();

    assert_eq!(tree.size().unwrap(), 3);
    assert_eq!(tree.first_key().unwrap(), zeros);
    assert_eq!(tree.last_key().unwrap(), ffs);
    // the prefix key holds its own value, not a descendant's
    assert_eq!(tree.get(&prefix).unwrap(), 300);
    assert_eq!(tree.get(&zeros).unwrap(), 100);
    assert_eq!(tree.get(&ffs).unwrap(), 200);
    assert_eq!(tree.get(&[0xffu8; 13]).unwrap(), 0);

    let keys: Vec<Vec<u8>> = tree.iter().unwrap().map(|e| e.unwrap().key).collect();
    assert_eq!(keys, vec![zeros.to_vec(), prefix.to_vec(), ffs.to_vec()]);
}

#[test]
fn merge_updates_and_failures() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "merge.pool");
    let mut tree = RadixTree::new(&pool).unwrap();

    assert_eq!(tree.put(b"k", 41).unwrap(), 0);
    let prev = tree
        .put_with(b"k", 1, |old, new| Some(old.wrapping_add(new)))
        .unwrap();
    assert_eq!(prev, 41);
    assert_eq!(tree.get(b"k").unwrap(), 42);

    let err = tree.put_with(b"k", 7, |_, _| None).unwrap_err();
    assert!(matches!(err, EmberError::MergeFailed));
    assert_eq!(tree.get(b"k").unwrap(), 42);
    assert_eq!(tree.size().unwrap(), 1);

    // a failing merge on a fresh key leaves the tree untouched too
    let err = tree.put_with(b"fresh", 7, |_, _| None).unwrap_err();
    assert!(matches!(err, EmberError::MergeFailed));
    assert_eq!(tree.get(b"fresh").unwrap(), 0);
    assert_eq!(tree.size().unwrap(), 1);
}

#[test]
fn clear_twice_and_free_twice() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "clearfree.pool");
    let mut tree = RadixTree::new(&pool).unwrap();
    tree.put(b"a", 1).unwrap();
    tree.put(b"ab", 2).unwrap();

    let mut cleaned = Vec::new();
    tree.clear(|v| cleaned.push(v)).unwrap();
    cleaned.sort_unstable();
    assert_eq!(cleaned, vec![1, 2]);
    assert_eq!(tree.size().unwrap(), 0);

    tree.clear(|_| unreachable!("tree is already empty")).unwrap();
    assert_eq!(tree.size().unwrap(), 0);

    tree.free().unwrap();
    assert!(matches!(tree.free(), Err(EmberError::TreeFreed)));
    assert!(matches!(tree.size(), Err(EmberError::TreeFreed)));
    assert!(matches!(tree.first_key(), Err(EmberError::TreeFreed)));
}

#[test]
fn fanout_growth_and_compaction() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "fanout.pool");
    let mut tree = RadixTree::new(&pool).unwrap();

    // every branch byte under one parent, plus the parent key itself,
    // drives the node through all four fan-outs
    tree.put(b"p", 1000).unwrap();
    for r in 0u16..=255 {
        tree.put(&[b'p', r as u8], r as u64 + 1).unwrap();
    }
    assert_eq!(tree.size().unwrap(), 257);
    assert_eq!(tree.get(b"p").unwrap(), 1000);
    for r in 0u16..=255 {
        assert_eq!(tree.get(&[b'p', r as u8]).unwrap(), r as u64 + 1);
    }
    assert_eq!(tree.first_key().unwrap(), b"p");
    assert_eq!(tree.last_key().unwrap(), [b'p', 0xff]);

    // shrink back down; compaction keeps every surviving key reachable
    for r in 0u16..=253 {
        tree.remove(&[b'p', r as u8], |_| {}).unwrap();
    }
    assert_eq!(tree.size().unwrap(), 3);
    assert_eq!(tree.get(b"p").unwrap(), 1000);
    assert_eq!(tree.get(&[b'p', 254]).unwrap(), 255);
    assert_eq!(tree.get(&[b'p', 255]).unwrap(), 256);

    let keys: Vec<Vec<u8>> = tree.iter().unwrap().map(|e| e.unwrap().key).collect();
    assert_eq!(
        keys,
        vec![b"p".to_vec(), vec![b'p', 254], vec![b'p', 255]]
    );
}

#[test]
fn random_churn_matches_reference() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "churn.pool");
    let mut tree = RadixTree::new(&pool).unwrap();
    let mut rng = StdRng::seed_from_u64(23);
    let mut expected: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

    for _ in 0..4000 {
        let len = rng.gen_range(1..=6);
        let key: Vec<u8> = (0..len).map(|_| rng.gen_range(0..8u8)).collect();
        if rng.gen_bool(0.6) {
            let value = rng.gen_range(1..u64::MAX);
            let prev = tree.put(&key, value).unwrap();
            let reference_prev = expected.insert(key, value).unwrap_or(0);
            assert_eq!(prev, reference_prev);
        } else {
            let removed = tree.remove(&key, |_| {}).unwrap();
            let reference_removed = expected.remove(&key).unwrap_or(0);
            assert_eq!(removed, reference_removed);
        }
        assert_eq!(tree.size().unwrap(), expected.len() as u64);
    }

    let entries: Vec<(Vec<u8>, u64)> = tree
        .iter()
        .unwrap()
        .map(|e| e.map(|e| (e.key, e.value)).unwrap())
        .collect();
    let reference: Vec<(Vec<u8>, u64)> =
        expected.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(entries, reference);
}

#[test]
fn aborted_transaction_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "abort.pool");
    let mut tree = RadixTree::new(&pool).unwrap();
    tree.put(b"stable", 5).unwrap();

    let mut tx = Transaction::new(&pool);
    let err = tx
        .run(|| {
            tree.put(b"stable", 50)?;
            tree.put(b"fresh", 60)?;
            // the third operation fails and must take the first two with it
            tree.put(b"", 70)?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidKey));
    assert_eq!(tx.state(), TxState::Aborted);

    assert_eq!(tree.get(b"stable").unwrap(), 5);
    assert_eq!(tree.get(b"fresh").unwrap(), 0);
    assert_eq!(tree.size().unwrap(), 1);
}

#[test]
fn explicit_transaction_groups_mutations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("txgroup.pool");
    {
        let pool = new_pool(&dir, "txgroup.pool");
        let mut tree = RadixTree::new(&pool).unwrap();
        pool.set_root(tree.handle()).unwrap();
        Transaction::run_once(&pool, || {
            tree.put(b"a", 1)?;
            tree.put(b"b", 2)?;
            tree.put(b"c", 3)?;
            Ok(())
        })
        .unwrap();
    }
    let pool = MemoryPool::open(&path).unwrap();
    let tree = RadixTree::from_handle(&pool, pool.root()).unwrap();
    assert_eq!(tree.size().unwrap(), 3);
    assert_eq!(tree.get(b"b").unwrap(), 2);
}

#[test]
fn removals_and_compaction_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shrink.pool");
    let mut expected = BTreeMap::new();
    {
        let pool = new_pool(&dir, "shrink.pool");
        let mut tree = RadixTree::new(&pool).unwrap();
        pool.set_root(tree.handle()).unwrap();
        let mut rng = StdRng::seed_from_u64(31);
        let keys = random_keys(&mut rng, 300);
        for (i, key) in keys.iter().enumerate() {
            tree.put(key, i as u64 + 1).unwrap();
            expected.insert(key.clone(), i as u64 + 1);
        }
        for key in keys.iter().step_by(3) {
            tree.remove(key, |_| {}).unwrap();
            expected.remove(key);
        }
    }
    let pool = MemoryPool::open(&path).unwrap();
    let tree = RadixTree::from_handle(&pool, pool.root()).unwrap();
    assert_eq!(tree.size().unwrap(), expected.len() as u64);
    let entries: Vec<(Vec<u8>, u64)> = tree
        .iter()
        .unwrap()
        .map(|e| e.map(|e| (e.key, e.value)).unwrap())
        .collect();
    let reference: Vec<(Vec<u8>, u64)> =
        expected.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(entries, reference);
}

#[test]
fn long_keys_round_trip() {
    let dir = TempDir::new().unwrap();
    let pool = new_pool(&dir, "long.pool");
    let mut tree = RadixTree::new(&pool).unwrap();

    let base: Vec<u8> = (0u8..=199).collect();
    let mut variant = base.clone();
    variant[150] = 0;
    tree.put(&base, 1).unwrap();
    tree.put(&variant, 2).unwrap();
    tree.put(&base[..100], 3).unwrap();

    assert_eq!(tree.get(&base).unwrap(), 1);
    assert_eq!(tree.get(&variant).unwrap(), 2);
    assert_eq!(tree.get(&base[..100]).unwrap(), 3);
    assert_eq!(tree.get(&base[..150]).unwrap(), 0);
    assert_eq!(tree.size().unwrap(), 3);

    assert_eq!(tree.remove(&base[..100], |_| {}).unwrap(), 3);
    assert_eq!(tree.get(&base).unwrap(), 1);
    assert_eq!(tree.get(&variant).unwrap(), 2);
    assert_eq!(tree.get(&base[..100]).unwrap(), 0);
}

#[test]
fn concurrent_tree_reopens_after_crash_consistent_commits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conc.pool");
    {
        let config = PoolConfig {
            path: path.clone(),
            size: 64 * 1024 * 1024,
            sync_writes: false,
        };
        let pool = MemoryPool::create(&config).unwrap();
        let tree = ConcurrentRadixTree::new(&pool).unwrap();
        pool.set_root(tree.handle()).unwrap();

        std::thread::scope(|scope| {
            for t in 0u8..4 {
                let tree = &tree;
                scope.spawn(move || {
                    for i in 0..100u64 {
                        tree.put(&[t, i as u8], (t as u64 + 1) * 1000 + i).unwrap();
                    }
                });
            }
        });
        assert_eq!(tree.size().unwrap(), 400);
    }
    let pool = MemoryPool::open(&path).unwrap();
    let tree = ConcurrentRadixTree::from_handle(&pool, pool.root()).unwrap();
    assert_eq!(tree.size().unwrap(), 400);
    for t in 0u8..4 {
        for i in 0..100u64 {
            assert_eq!(
                tree.get(&[t, i as u8]).unwrap(),
                (t as u64 + 1) * 1000 + i
            );
        }
    }
}
