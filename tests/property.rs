//! # Property-Based Tests for Persistree
//!
//! Every property compares the tree against `BTreeMap`/`BTreeSet` from the
//! standard library as an oracle, on small node capacities so that random
//! inputs reach several levels.

use persistree::state::{BucketItems, BucketState, NodeRecord, NodeState};
use persistree::{Error, GenericSet, GenericTree, Result};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

type Small = GenericTree<i32, i32, 4, 4>;

fn collect<T>(iter: impl Iterator<Item = Result<T>>) -> Vec<T> {
	iter.collect::<Result<Vec<T>>>().unwrap()
}

// ===========================================================================
// Strategies
// ===========================================================================

#[derive(Debug, Clone)]
enum Op {
	Insert(i32, i32),
	Remove(i32),
	Lookup(i32),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
	prop::collection::vec(
		prop_oneof![
			3 => (-200..200i32, any::<i32>()).prop_map(|(k, v)| Op::Insert(k, v)),
			2 => (-200..200i32).prop_map(Op::Remove),
			1 => (-200..200i32).prop_map(Op::Lookup),
		],
		0..max_ops,
	)
}

fn build(keys: &BTreeSet<i32>) -> (Small, BTreeMap<i32, i32>) {
	let tree = Small::new();
	let mut oracle = BTreeMap::new();
	for &k in keys {
		tree.insert(k, k.wrapping_mul(7)).unwrap();
		oracle.insert(k, k.wrapping_mul(7));
	}
	(tree, oracle)
}

fn inline(items: &BTreeMap<u32, u8>) -> NodeRecord<u32, u8> {
	NodeState::Inline(BucketState {
		items: BucketItems::Pairs(items.iter().map(|(k, v)| (*k, *v)).collect()),
		next: None,
	})
}

// ===========================================================================
// Map Properties
// ===========================================================================

proptest! {
	#![proptest_config(ProptestConfig::with_cases(128))]

	#[test]
	fn operations_match_btreemap(ops in operations(400)) {
		let tree = Small::new();
		let mut oracle = BTreeMap::new();

		for op in ops {
			match op {
				Op::Insert(k, v) => {
					tree.insert(k, v).unwrap();
					oracle.insert(k, v);
				}
				Op::Remove(k) => {
					let expected = if oracle.remove(&k).is_some() { Ok(()) } else { Err(Error::KeyNotFound) };
					prop_assert_eq!(tree.remove(&k), expected);
				}
				Op::Lookup(k) => {
					prop_assert_eq!(tree.get(&k), oracle.get(&k).copied().ok_or(Error::KeyNotFound));
					prop_assert_eq!(tree.contains_key(&k).unwrap(), oracle.contains_key(&k));
				}
			}
		}

		tree.assert_invariants();
		prop_assert_eq!(tree.len().unwrap(), oracle.len());
		prop_assert_eq!(collect(tree.items(None, None).unwrap()), oracle.into_iter().collect::<Vec<_>>());
	}

	#[test]
	fn ranges_are_inclusive_of_both_bounds(
		keys in prop::collection::btree_set(-300..300i32, 0..200),
		lo in -320..320i32,
		hi in -320..320i32,
	) {
		let (tree, oracle) = build(&keys);
		let expected: Vec<i32> = if lo <= hi { oracle.range(lo..=hi).map(|(k, _)| *k).collect() } else { Vec::new() };
		prop_assert_eq!(collect(tree.keys(Some(&lo), Some(&hi)).unwrap()), expected);

		let from: Vec<i32> = oracle.range(lo..).map(|(_, v)| *v).collect();
		prop_assert_eq!(collect(tree.values(Some(&lo), None).unwrap()), from);
		let upto: Vec<(i32, i32)> = oracle.range(..=hi).map(|(k, v)| (*k, *v)).collect();
		prop_assert_eq!(collect(tree.items(None, Some(&hi)).unwrap()), upto);
	}

	#[test]
	fn bounded_min_and_max(
		keys in prop::collection::btree_set(-300..300i32, 0..200),
		bound in -320..320i32,
	) {
		let (tree, oracle) = build(&keys);
		prop_assert_eq!(tree.min_key(Some(&bound)), oracle.range(bound..).next().map(|(k, _)| *k).ok_or(Error::EmptyTree));
		prop_assert_eq!(tree.max_key(Some(&bound)), oracle.range(..=bound).next_back().map(|(k, _)| *k).ok_or(Error::EmptyTree));
		prop_assert_eq!(tree.min_key(None), oracle.keys().next().copied().ok_or(Error::EmptyTree));
		prop_assert_eq!(tree.max_key(None), oracle.keys().next_back().copied().ok_or(Error::EmptyTree));
	}

	#[test]
	fn state_round_trip(keys in prop::collection::btree_set(any::<i32>(), 0..300)) {
		let (source, oracle) = build(&keys);
		let copy = Small::new();
		copy.set_state(source.get_state().unwrap()).unwrap();
		copy.assert_invariants();
		prop_assert_eq!(copy.height().unwrap(), source.height().unwrap());
		prop_assert_eq!(collect(copy.items(None, None).unwrap()), oracle.into_iter().collect::<Vec<_>>());
	}

	#[test]
	fn set_matches_btreeset(
		added in prop::collection::vec(0..500u32, 0..300),
		removed in prop::collection::vec(0..500u32, 0..150),
	) {
		let set: GenericSet<u32, 4, 4> = GenericSet::new();
		let mut oracle = BTreeSet::new();
		for k in added {
			prop_assert_eq!(set.insert(k).unwrap(), oracle.insert(k));
		}
		for k in removed {
			prop_assert_eq!(set.remove(&k).is_ok(), oracle.remove(&k));
		}
		set.assert_invariants();
		prop_assert_eq!(collect(set.keys(None, None).unwrap()), oracle.into_iter().collect::<Vec<_>>());
	}
}

// ===========================================================================
// Conflict Resolution Properties
// ===========================================================================

proptest! {
	#![proptest_config(ProptestConfig::with_cases(256))]

	#[test]
	fn disjoint_additions_merge_to_union(
		base in prop::collection::btree_map(0..100u32, any::<u8>(), 0..12),
		mine in prop::collection::btree_map(100..200u32, any::<u8>(), 0..12),
		theirs in prop::collection::btree_map(200..300u32, any::<u8>(), 0..12),
	) {
		let mut my_side = base.clone();
		my_side.extend(mine.iter().map(|(k, v)| (*k, *v)));
		let mut their_side = base.clone();
		their_side.extend(theirs.iter().map(|(k, v)| (*k, *v)));
		let mut union = my_side.clone();
		union.extend(theirs.iter().map(|(k, v)| (*k, *v)));

		let merged = GenericTree::<u32, u8, 4, 4>::resolve_conflict(inline(&base), inline(&my_side), inline(&their_side)).unwrap();
		if union.is_empty() {
			prop_assert_eq!(merged, NodeState::Empty);
		} else {
			prop_assert_eq!(merged, inline(&union));
		}
	}

	#[test]
	fn changing_the_same_key_differently_conflicts(
		base in prop::collection::btree_map(0..50u32, 0..100u8, 1..12),
		pick in any::<prop::sample::Index>(),
	) {
		let key = *pick.get(&base.keys().copied().collect::<Vec<_>>());
		let mut my_side = base.clone();
		my_side.insert(key, 200);
		let mut their_side = base.clone();
		their_side.insert(key, 201);

		let merged = GenericTree::<u32, u8, 4, 4>::resolve_conflict(inline(&base), inline(&my_side), inline(&their_side));
		prop_assert!(matches!(merged, Err(Error::Conflict(_))));
	}
}
