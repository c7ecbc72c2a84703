//! # Three-Way Merge
//!
//! Two transactions that modified the same node produce two states derived
//! from a common ancestor. When both are small enough to be a single leaf's
//! content, they can often be merged instead of failing the later commit.
//!
//! The merge walks the three sorted runs in lockstep. For the smallest key
//! still pending, what happened to it on each side decides the result:
//!
//! | ancestor | mine | theirs | result                                   |
//! |----------|------|--------|------------------------------------------|
//! | v        | v    | t      | t                                        |
//! | v        | m    | v      | m                                        |
//! | v        | m    | t      | conflict (both changed)                  |
//! | v        | v    | -      | deleted                                  |
//! | v        | m    | -      | conflict (delete and change)             |
//! | v        | -    | -      | conflict (both deleted)                  |
//! | -        | m    | -      | m                                        |
//! | -        | m    | t      | conflict (both inserted)                 |
//!
//! The missing rows are the mirror images. Both sides making the identical
//! change still counts as a conflict.
//!
//! A stored leaf never merges to nothing. A leaf that lost its last item is
//! spliced out of its parent and the chain, so a merge that starts from an
//! emptied side, or ends with no items, conflicts. Only the state of a tree
//! root, which holds its single leaf inline, may merge to empty.

use crate::error::{ConflictReason, Error, Result};
use crate::state::{BucketItems, BucketState, NodeState, SameRef};

/// Merges three states of one stored leaf.
pub fn merge_buckets<K, V, B>(
	ancestor: BucketState<K, V, B>,
	mine: BucketState<K, V, B>,
	theirs: BucketState<K, V, B>,
) -> Result<BucketState<K, V, B>>
where
	K: Ord,
	V: PartialEq,
	B: SameRef,
{
	if !ancestor.items.is_empty() && (mine.items.is_empty() || theirs.items.is_empty()) {
		return Err(Error::Conflict(ConflictReason::EmptiedLeaf));
	}
	let merged = merge_runs(ancestor, mine, theirs)?;
	if merged.items.is_empty() {
		return Err(Error::Conflict(ConflictReason::EmptyMerge));
	}
	Ok(merged)
}

fn merge_runs<K, V, B>(
	ancestor: BucketState<K, V, B>,
	mine: BucketState<K, V, B>,
	theirs: BucketState<K, V, B>,
) -> Result<BucketState<K, V, B>>
where
	K: Ord,
	V: PartialEq,
	B: SameRef,
{
	let same_next = |a: &Option<B>, b: &Option<B>| match (a, b) {
		(None, None) => true,
		(Some(a), Some(b)) => a.same_ref(b),
		_ => false,
	};
	if !same_next(&ancestor.next, &mine.next) || !same_next(&ancestor.next, &theirs.next) {
		return Err(Error::Conflict(ConflictReason::ChainChanged));
	}

	let keys_only = match (&ancestor.items, &mine.items, &theirs.items) {
		(BucketItems::Keys(_), BucketItems::Keys(_), BucketItems::Keys(_)) => true,
		(BucketItems::Pairs(_), BucketItems::Pairs(_), BucketItems::Pairs(_)) => false,
		_ => return Err(Error::Conflict(ConflictReason::Unmergeable)),
	};

	let mut a = ancestor.items.into_runs().into_iter().peekable();
	let mut m = mine.items.into_runs().into_iter().peekable();
	let mut t = theirs.items.into_runs().into_iter().peekable();
	let mut merged: Vec<(K, Option<V>)> = Vec::new();

	loop {
		let (in_a, in_m, in_t) = {
			let heads =
				[a.peek().map(|(k, _)| k), m.peek().map(|(k, _)| k), t.peek().map(|(k, _)| k)];
			let Some(smallest) = heads.iter().flatten().min().copied() else {
				break;
			};
			let holds = |head: Option<&K>| head == Some(smallest);
			(holds(heads[0]), holds(heads[1]), holds(heads[2]))
		};
		let a_item = if in_a { a.next() } else { None };
		let m_item = if in_m { m.next() } else { None };
		let t_item = if in_t { t.next() } else { None };

		match (a_item, m_item, t_item) {
			(Some((_, av)), Some((mk, mv)), Some((_, tv))) => {
				if av == mv {
					merged.push((mk, tv));
				} else if av == tv {
					merged.push((mk, mv));
				} else {
					return Err(Error::Conflict(ConflictReason::ConflictingChanges));
				}
			}
			(Some((_, av)), Some((_, kept)), None) | (Some((_, av)), None, Some((_, kept))) => {
				if av != kept {
					return Err(Error::Conflict(ConflictReason::DeleteAndChange));
				}
			}
			(Some(_), None, None) => {
				return Err(Error::Conflict(ConflictReason::DuelingDeletes));
			}
			(None, Some(_), Some(_)) => {
				return Err(Error::Conflict(ConflictReason::DuelingInserts));
			}
			(None, Some(item), None) | (None, None, Some(item)) => merged.push(item),
			(None, None, None) => {
				return Err(Error::Conflict(ConflictReason::Failed(
					"merge cursor made no progress".to_string(),
				)));
			}
		}
	}

	let items = if keys_only {
		BucketItems::Keys(merged.into_iter().map(|(k, _)| k).collect())
	} else {
		BucketItems::Pairs(merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect())
	};
	Ok(BucketState {
		items,
		next: ancestor.next,
	})
}

/// Resolves conflicting states of one index node.
///
/// Only states that are a single leaf's content (or absent) can be merged.
/// Every failure is reported as [`Error::Conflict`]; the cause of anything
/// else is kept only as a message.
pub fn resolve_node_conflict<K, V, N, B>(
	ancestor: NodeState<K, V, N, B>,
	mine: NodeState<K, V, N, B>,
	theirs: NodeState<K, V, N, B>,
) -> Result<NodeState<K, V, N, B>>
where
	K: Ord,
	V: PartialEq,
	B: SameRef,
{
	resolve(ancestor, mine, theirs).map_err(|err| match err {
		Error::Conflict(reason) => {
			tracing::warn!(%reason, "unresolvable conflict");
			Error::Conflict(reason)
		}
		other => {
			tracing::warn!(error = %other, "conflict resolution failed");
			Error::Conflict(ConflictReason::Failed(other.to_string()))
		}
	})
}

fn resolve<K, V, N, B>(
	ancestor: NodeState<K, V, N, B>,
	mine: NodeState<K, V, N, B>,
	theirs: NodeState<K, V, N, B>,
) -> Result<NodeState<K, V, N, B>>
where
	K: Ord,
	V: PartialEq,
	B: SameRef,
{
	let states = [ancestor.into_mergeable()?, mine.into_mergeable()?, theirs.into_mergeable()?];
	// Absent states merge as empty leaves of the same flavour as the others.
	let Some(flavour) = states.iter().flatten().map(|s| s.items.empty_like()).next() else {
		return Ok(NodeState::Empty);
	};
	let [ancestor, mine, theirs] = states.map(|state| {
		state.unwrap_or_else(|| BucketState {
			items: flavour.empty_like(),
			next: None,
		})
	});

	let merged = merge_runs(ancestor, mine, theirs)?;
	tracing::debug!(keys = merged.items.len(), "resolved conflicting node states");
	if merged.items.is_empty() {
		Ok(NodeState::Empty)
	} else {
		Ok(NodeState::Inline(merged))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::activation::Oid;
	use crate::state::{ChildState, NodeRecord, Slot};

	fn pairs(items: &[(u32, char)]) -> BucketState<u32, char, Oid> {
		BucketState {
			items: BucketItems::Pairs(items.to_vec()),
			next: None,
		}
	}

	fn keys(items: &[u32]) -> BucketState<u32, (), Oid> {
		BucketState {
			items: BucketItems::Keys(items.to_vec()),
			next: None,
		}
	}

	fn conflict(
		ancestor: &[(u32, char)],
		mine: &[(u32, char)],
		theirs: &[(u32, char)],
	) -> ConflictReason {
		match merge_buckets(pairs(ancestor), pairs(mine), pairs(theirs)) {
			Err(Error::Conflict(reason)) => reason,
			other => panic!("expected a conflict, got {other:?}"),
		}
	}

	#[test]
	fn disjoint_inserts_merge() {
		let merged = merge_buckets(
			pairs(&[(1, 'A'), (2, 'B')]),
			pairs(&[(1, 'A'), (2, 'B'), (3, 'C')]),
			pairs(&[(1, 'A'), (2, 'B'), (4, 'D')]),
		)
		.unwrap();
		assert_eq!(merged, pairs(&[(1, 'A'), (2, 'B'), (3, 'C'), (4, 'D')]));
	}

	#[test]
	fn one_sided_changes_and_deletes_merge() {
		let merged = merge_buckets(
			pairs(&[(1, 'A'), (2, 'B'), (3, 'C'), (4, 'D')]),
			pairs(&[(1, 'X'), (2, 'B'), (4, 'D')]),
			pairs(&[(1, 'A'), (2, 'Y'), (3, 'C'), (5, 'E')]),
		)
		.unwrap();
		assert_eq!(merged, pairs(&[(1, 'X'), (2, 'Y'), (5, 'E')]));
	}

	#[test]
	fn conflicting_cases() {
		let base = [(1, 'A'), (2, 'B')];
		assert_eq!(
			conflict(&base, &[(1, 'A'), (2, 'X')], &[(1, 'A'), (2, 'Y')]),
			ConflictReason::ConflictingChanges
		);
		assert_eq!(
			conflict(&base, &[(1, 'A'), (2, 'X')], &[(1, 'A'), (2, 'X')]),
			ConflictReason::ConflictingChanges
		);
		assert_eq!(conflict(&base, &[(1, 'A')], &[(1, 'A'), (2, 'Y')]), ConflictReason::DeleteAndChange);
		assert_eq!(conflict(&base, &[(1, 'A')], &[(1, 'A')]), ConflictReason::DuelingDeletes);
		assert_eq!(
			conflict(&base, &[(1, 'A'), (2, 'B'), (3, 'C')], &[(1, 'A'), (2, 'B'), (3, 'C')]),
			ConflictReason::DuelingInserts
		);
	}

	#[test]
	fn set_leaves_merge_keys() {
		let merged = merge_buckets(keys(&[1, 5]), keys(&[1, 3, 5]), keys(&[5, 9])).unwrap();
		assert_eq!(merged, keys(&[3, 5, 9]));
	}

	#[test]
	fn changed_chain_link_conflicts() {
		let mut mine = pairs(&[(1, 'A')]);
		mine.next = Some(8);
		assert_eq!(
			merge_buckets(pairs(&[(1, 'A')]), mine, pairs(&[(1, 'A')])),
			Err(Error::Conflict(ConflictReason::ChainChanged))
		);
	}

	#[test]
	fn mixed_flavours_conflict() {
		let keys = BucketState {
			items: BucketItems::Keys(vec![1]),
			next: None,
		};
		assert_eq!(
			merge_buckets(pairs(&[(1, 'A')]), keys, pairs(&[(1, 'A')])),
			Err(Error::Conflict(ConflictReason::Unmergeable))
		);
	}

	#[test]
	fn stored_leaf_never_merges_to_nothing() {
		assert_eq!(
			conflict(&[(1, 'A'), (2, 'B')], &[(2, 'B')], &[(1, 'A')]),
			ConflictReason::EmptyMerge
		);
	}

	#[test]
	fn leaf_emptied_by_either_side_conflicts() {
		let base = [(36, 'A')];
		assert_eq!(conflict(&base, &[(36, 'A'), (37, 'B')], &[]), ConflictReason::EmptiedLeaf);
		assert_eq!(conflict(&base, &[], &[(35, 'Z'), (36, 'A')]), ConflictReason::EmptiedLeaf);
		assert_eq!(conflict(&base, &[], &[(36, 'A')]), ConflictReason::EmptiedLeaf);
	}

	#[test]
	fn node_states_rewrap_inline() {
		let ancestor: NodeRecord<u32, char> = NodeState::Inline(pairs(&[(1, 'A')]));
		let mine: NodeRecord<u32, char> = NodeState::Children {
			items: vec![Slot::Child(ChildState::Embedded(pairs(&[(1, 'A'), (2, 'B')])))],
			first_leaf: None,
		};
		let theirs: NodeRecord<u32, char> = NodeState::Inline(pairs(&[(0, 'Z'), (1, 'A')]));
		let resolved = resolve_node_conflict(ancestor, mine, theirs).unwrap();
		assert_eq!(resolved, NodeState::Inline(pairs(&[(0, 'Z'), (1, 'A'), (2, 'B')])));
	}

	#[test]
	fn absent_ancestor_is_empty() {
		let resolved = resolve_node_conflict::<u32, char, Oid, Oid>(
			NodeState::Empty,
			NodeState::Inline(pairs(&[(1, 'A')])),
			NodeState::Inline(pairs(&[(2, 'B')])),
		)
		.unwrap();
		assert_eq!(resolved, NodeState::Inline(pairs(&[(1, 'A'), (2, 'B')])));
	}

	#[test]
	fn emptied_root_resolves_to_empty() {
		let resolved = resolve_node_conflict::<u32, char, Oid, Oid>(
			NodeState::Inline(pairs(&[(1, 'A'), (2, 'B')])),
			NodeState::Inline(pairs(&[(2, 'B')])),
			NodeState::Inline(pairs(&[(1, 'A')])),
		)
		.unwrap();
		assert_eq!(resolved, NodeState::Empty);
	}

	#[test]
	fn multi_child_states_are_unmergeable() {
		let big: NodeRecord<u32, char> = NodeState::Children {
			items: vec![
				Slot::Child(ChildState::Leaf(1)),
				Slot::Key(10),
				Slot::Child(ChildState::Leaf(2)),
			],
			first_leaf: Some(1),
		};
		assert_eq!(
			resolve_node_conflict(big.clone(), big.clone(), big),
			Err(Error::Conflict(ConflictReason::Unmergeable))
		);
	}
}
