//! # Integration Tests for Persistree
//!
//! This module contains end-to-end integration tests that exercise the tree
//! through its public API with realistic workloads.

use persistree::{Error, GenericSet, GenericTree, Result, Set, Tree};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, BTreeSet};

fn collect<T>(iter: impl Iterator<Item = Result<T>>) -> Vec<T> {
	iter.collect::<Result<Vec<T>>>().unwrap()
}

// ===========================================================================
// End-to-End Example
// ===========================================================================

#[test]
fn end_to_end_with_fanout_sixteen() {
	let tree: GenericTree<u32, u32, 16, 16> = GenericTree::new();
	for k in 0..1000 {
		tree.insert(k, k * 2).unwrap();
	}

	assert!(tree.height().unwrap() > 1, "1000 keys must not fit in one index level");
	assert_eq!(tree.min_key(None), Ok(0));
	assert_eq!(tree.max_key(None), Ok(999));
	assert_eq!(tree.get(&500), Ok(1000));
	tree.assert_invariants();

	for k in (0..1000).step_by(2) {
		tree.remove(&k).unwrap();
	}

	let keys = collect(tree.keys(None, None).unwrap());
	assert_eq!(keys.len(), 500);
	assert_eq!(keys, (0..1000).filter(|k| k % 2 == 1).collect::<Vec<_>>());
	tree.assert_invariants();
}

// ===========================================================================
// Large Scale Operation Tests
// ===========================================================================

#[test]
fn large_scale_insert_and_lookup() {
	let tree: Tree<i32, i32> = Tree::new();

	for i in 0..10_000 {
		tree.insert(i, i * 10).unwrap();
	}

	tree.assert_invariants();
	assert_eq!(tree.len().unwrap(), 10_000);

	for i in 0..10_000 {
		assert_eq!(tree.get(&i), Ok(i * 10), "Failed to find key {}", i);
	}
}

#[test]
fn large_scale_insert_and_remove() {
	let tree: Tree<i32, i32> = Tree::new();

	for i in 0..10_000 {
		tree.insert(i, i).unwrap();
	}
	tree.assert_invariants();

	for i in 0..10_000 {
		tree.remove(&i).unwrap_or_else(|e| panic!("Failed to remove key {}: {}", i, e));
	}

	tree.assert_invariants();
	assert!(tree.is_empty().unwrap());
	assert_eq!(tree.height().unwrap(), 1);
}

#[test]
fn reverse_insertion_order() {
	let tree: GenericTree<i32, i32, 4, 4> = GenericTree::new();
	for i in (0..2_000).rev() {
		tree.insert(i, -i).unwrap();
	}
	tree.assert_invariants();
	assert_eq!(collect(tree.keys(None, None).unwrap()), (0..2_000).collect::<Vec<_>>());
	assert_eq!(tree.min_key(None), Ok(0));
	assert_eq!(tree.max_key(None), Ok(1_999));
}

// ===========================================================================
// Randomized Workloads
// ===========================================================================

#[test]
fn random_workload_matches_btreemap() {
	let mut rng = StdRng::seed_from_u64(0x5eed);
	let tree: GenericTree<u32, u64, 8, 8> = GenericTree::new();
	let mut oracle = BTreeMap::new();

	for step in 0..20_000 {
		let key = rng.random_range(0..2_000u32);
		match rng.random_range(0..10) {
			0..=5 => {
				let value = rng.random::<u64>();
				tree.insert(key, value).unwrap();
				oracle.insert(key, value);
			}
			6..=8 => {
				let expected = if oracle.remove(&key).is_some() {
					Ok(())
				} else {
					Err(Error::KeyNotFound)
				};
				assert_eq!(tree.remove(&key), expected, "remove {} at step {}", key, step);
			}
			_ => {
				let expected = oracle.get(&key).copied().ok_or(Error::KeyNotFound);
				assert_eq!(tree.get(&key), expected, "get {} at step {}", key, step);
			}
		}
		if step % 1_000 == 0 {
			tree.assert_invariants();
		}
	}

	tree.assert_invariants();
	assert_eq!(tree.len().unwrap(), oracle.len());
	let items = collect(tree.items(None, None).unwrap());
	assert_eq!(items, oracle.into_iter().collect::<Vec<_>>());
}

#[test]
fn random_ranges_match_btreemap() {
	let mut rng = StdRng::seed_from_u64(7);
	let tree: GenericTree<i32, i32, 4, 8> = GenericTree::new();
	let mut oracle = BTreeMap::new();
	for _ in 0..3_000 {
		let key = rng.random_range(-5_000..5_000);
		tree.insert(key, key / 3).unwrap();
		oracle.insert(key, key / 3);
	}

	for _ in 0..500 {
		let lo = rng.random_range(-6_000..6_000);
		let hi = rng.random_range(-6_000..6_000);
		let expected: Vec<i32> =
			if lo <= hi { oracle.range(lo..=hi).map(|(k, _)| *k).collect() } else { Vec::new() };
		assert_eq!(collect(tree.keys(Some(&lo), Some(&hi)).unwrap()), expected, "keys({}, {})", lo, hi);

		let min = oracle.range(lo..).next().map(|(k, _)| *k).ok_or(Error::EmptyTree);
		let max = oracle.range(..=lo).next_back().map(|(k, _)| *k).ok_or(Error::EmptyTree);
		assert_eq!(tree.min_key(Some(&lo)), min);
		assert_eq!(tree.max_key(Some(&lo)), max);
	}
}

#[test]
fn shuffled_deletes_keep_chain_intact() {
	let mut rng = StdRng::seed_from_u64(99);
	let tree: GenericTree<u32, u32, 4, 4> = GenericTree::new();
	let mut keys: Vec<u32> = (0..3_000).collect();
	keys.shuffle(&mut rng);
	for &k in &keys {
		tree.insert(k, k).unwrap();
	}
	keys.shuffle(&mut rng);

	let mut remaining: BTreeSet<u32> = keys.iter().copied().collect();
	for (i, k) in keys.iter().enumerate() {
		tree.remove(k).unwrap();
		remaining.remove(k);
		if i % 97 == 0 {
			tree.assert_invariants();
			assert_eq!(collect(tree.keys(None, None).unwrap()), remaining.iter().copied().collect::<Vec<_>>());
		}
	}
	assert!(tree.is_empty().unwrap());
}

// ===========================================================================
// Value and Key Types
// ===========================================================================

#[test]
fn string_keys_with_borrowed_lookup() {
	let tree: Tree<String, usize> = Tree::new();
	let words = ["pear", "apple", "fig", "banana", "cherry", "date"];
	for (i, word) in words.iter().enumerate() {
		tree.insert(word.to_string(), i).unwrap();
	}

	assert_eq!(tree.get("fig"), Ok(2));
	assert!(tree.contains_key("date").unwrap());
	tree.remove("apple").unwrap();
	assert_eq!(tree.get("apple"), Err(Error::KeyNotFound));

	let keys = collect(tree.keys(Some(&"c".to_string()), None).unwrap());
	assert_eq!(keys, vec!["cherry", "date", "fig", "pear"]);
}

#[test]
fn by_value_lists_largest_values_first() {
	let tree: Tree<&str, u32> = Tree::new();
	tree.update([("low", 1), ("mid", 50), ("high", 90), ("top", 90), ("edge", 50)]).unwrap();
	assert_eq!(tree.by_value(&50).unwrap(), vec![(90, "top"), (90, "high"), (50, "mid"), (50, "edge")]);
}

// ===========================================================================
// Sets
// ===========================================================================

#[test]
fn set_matches_btreeset() {
	let mut rng = StdRng::seed_from_u64(1234);
	let set: GenericSet<u16, 4, 4> = GenericSet::new();
	let mut oracle = BTreeSet::new();
	for _ in 0..5_000 {
		let key = rng.random_range(0..1_000u16);
		if rng.random_bool(0.7) {
			assert_eq!(set.insert(key).unwrap(), oracle.insert(key));
		} else {
			let expected = if oracle.remove(&key) { Ok(()) } else { Err(Error::KeyNotFound) };
			assert_eq!(set.remove(&key), expected);
		}
	}
	set.assert_invariants();
	assert_eq!(set.len().unwrap(), oracle.len());
	assert_eq!(collect(set.keys(None, None).unwrap()), oracle.into_iter().collect::<Vec<_>>());
}

#[test]
fn default_set_alias() {
	let set: Set<u64> = Set::new();
	assert_eq!(set.update(0..500).unwrap(), 500);
	assert_eq!(set.max_key(None), Ok(499));
	assert_eq!(set.min_key(Some(&250)), Ok(250));
	set.clear().unwrap();
	assert!(set.is_empty().unwrap());
	assert_eq!(set.min_key(None), Err(Error::EmptyTree));
}
