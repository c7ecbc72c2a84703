//! # Logical State Shapes
//!
//! The state of a node is what gets written to, and read back from, the object
//! store. Only the logical shape is fixed here; the byte encoding is left to
//! whatever serde format the store uses.
//!
//! ```text
//! NodeState::Empty                          no entries
//!
//! NodeState::Inline(bucket)                 one entry, a leaf with no storage
//!                                           identity of its own
//!
//! NodeState::Children {                     general case
//!     items: [child₀, key₁, child₁, key₂, child₂, ...],
//!     first_leaf,
//! }
//! ```
//!
//! The leading separator is never stored. A child is either a reference to a
//! stored node (`Node`), a reference to a stored leaf (`Leaf`), or the content
//! of a leaf that has no identity yet (`Embedded`).
//!
//! States are generic over the reference types `N` (node references) and `B`
//! (leaf references). Live states hand out shared handles; stored records use
//! [`Oid`]s. [`NodeState::try_map_refs`] converts one into the other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activation::{Activate, Oid, Persistent};
use crate::error::{ConflictReason, Error, Result};

/// Keys of a leaf, with values for mapping leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketItems<K, V> {
	/// Set leaf content.
	Keys(Vec<K>),
	/// Mapping leaf content.
	Pairs(Vec<(K, V)>),
}

impl<K, V> BucketItems<K, V> {
	/// Number of keys.
	pub fn len(&self) -> usize {
		match self {
			BucketItems::Keys(keys) => keys.len(),
			BucketItems::Pairs(pairs) => pairs.len(),
		}
	}

	/// Returns `true` if there are no keys.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Empty content of the same flavour.
	pub(crate) fn empty_like(&self) -> BucketItems<K, V> {
		match self {
			BucketItems::Keys(_) => BucketItems::Keys(Vec::new()),
			BucketItems::Pairs(_) => BucketItems::Pairs(Vec::new()),
		}
	}

	/// Flattens into `(key, value)` runs; set content has no values.
	pub(crate) fn into_runs(self) -> Vec<(K, Option<V>)> {
		match self {
			BucketItems::Keys(keys) => keys.into_iter().map(|k| (k, None)).collect(),
			BucketItems::Pairs(pairs) => pairs.into_iter().map(|(k, v)| (k, Some(v))).collect(),
		}
	}
}

impl<K: Ord, V> BucketItems<K, V> {
	/// Fails unless keys are strictly increasing.
	pub fn check_sorted(&self) -> Result<()> {
		let sorted = match self {
			BucketItems::Keys(keys) => keys.windows(2).all(|w| w[0] < w[1]),
			BucketItems::Pairs(pairs) => pairs.windows(2).all(|w| w[0].0 < w[1].0),
		};
		if sorted {
			Ok(())
		} else {
			Err(Error::Invariant("leaf state keys are not strictly increasing"))
		}
	}
}

/// State of a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState<K, V, B> {
	/// Sorted content.
	pub items: BucketItems<K, V>,
	/// The following leaf in the chain.
	pub next: Option<B>,
}

impl<K, V, B> BucketState<K, V, B> {
	/// Converts the chain reference.
	pub fn try_map_refs<B2, E>(
		self,
		leaf: &mut impl FnMut(B) -> std::result::Result<B2, E>,
	) -> std::result::Result<BucketState<K, V, B2>, E> {
		Ok(BucketState {
			items: self.items,
			next: self.next.map(leaf).transpose()?,
		})
	}
}

/// One child of a node in its stored form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildState<K, V, N, B> {
	/// An index node with its own identity.
	Node(N),
	/// A leaf with its own identity.
	Leaf(B),
	/// A leaf without identity, stored inside the parent.
	Embedded(BucketState<K, V, B>),
}

/// One element of the alternating child/key sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot<K, V, N, B> {
	Child(ChildState<K, V, N, B>),
	Key(K),
}

/// Logical state of an index node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState<K, V, N, B> {
	/// A node without entries.
	Empty,
	/// A node whose only child is a leaf without identity.
	Inline(BucketState<K, V, B>),
	/// Alternating children and separators, starting and ending with a child.
	Children {
		items: Vec<Slot<K, V, N, B>>,
		/// The leftmost leaf of the subtree. When absent the first child must
		/// itself be a leaf.
		first_leaf: Option<B>,
	},
}

/// Node state as written to the object store.
pub type NodeRecord<K, V> = NodeState<K, V, Oid, Oid>;

/// Leaf state as written to the object store.
pub type BucketRecord<K, V> = BucketState<K, V, Oid>;

impl<K, V, N, B> NodeState<K, V, N, B> {
	/// Converts every node and leaf reference, failing on the first error.
	pub fn try_map_refs<N2, B2, E>(
		self,
		mut node: impl FnMut(N) -> std::result::Result<N2, E>,
		mut leaf: impl FnMut(B) -> std::result::Result<B2, E>,
	) -> std::result::Result<NodeState<K, V, N2, B2>, E> {
		Ok(match self {
			NodeState::Empty => NodeState::Empty,
			NodeState::Inline(bucket) => NodeState::Inline(bucket.try_map_refs(&mut leaf)?),
			NodeState::Children {
				items,
				first_leaf,
			} => {
				let mut mapped = Vec::with_capacity(items.len());
				for slot in items {
					mapped.push(match slot {
						Slot::Key(key) => Slot::Key(key),
						Slot::Child(ChildState::Node(n)) => Slot::Child(ChildState::Node(node(n)?)),
						Slot::Child(ChildState::Leaf(b)) => Slot::Child(ChildState::Leaf(leaf(b)?)),
						Slot::Child(ChildState::Embedded(bucket)) => {
							Slot::Child(ChildState::Embedded(bucket.try_map_refs(&mut leaf)?))
						}
					});
				}
				NodeState::Children {
					items: mapped,
					first_leaf: first_leaf.map(&mut leaf).transpose()?,
				}
			}
		})
	}

	/// Reduces the state to the content of a single leaf for merging.
	///
	/// `Empty` is absent. `Inline` and a lone embedded child without an
	/// explicit first leaf are the same leaf content. A node with real children
	/// cannot be merged as a leaf.
	pub(crate) fn into_mergeable(self) -> Result<Option<BucketState<K, V, B>>> {
		match self {
			NodeState::Empty => Ok(None),
			NodeState::Inline(bucket) => Ok(Some(bucket)),
			NodeState::Children {
				items,
				first_leaf: None,
			} if items.len() == 1 => match items.into_iter().next() {
				Some(Slot::Child(ChildState::Embedded(bucket))) => Ok(Some(bucket)),
				_ => Err(Error::Conflict(ConflictReason::Unmergeable)),
			},
			_ => Err(Error::Conflict(ConflictReason::Unmergeable)),
		}
	}
}

impl<K: Ord, V, N, B> NodeState<K, V, N, B> {
	/// Fails unless every separator and every inline leaf is strictly
	/// increasing.
	pub fn check_order(&self) -> Result<()> {
		match self {
			NodeState::Empty => Ok(()),
			NodeState::Inline(bucket) => bucket.items.check_sorted(),
			NodeState::Children {
				items,
				..
			} => {
				let mut previous: Option<&K> = None;
				for slot in items {
					match slot {
						Slot::Key(key) => {
							if previous.is_some_and(|p| p >= key) {
								return Err(Error::Invariant("separators are not strictly increasing"));
							}
							previous = Some(key);
						}
						Slot::Child(ChildState::Embedded(bucket)) => bucket.items.check_sorted()?,
						Slot::Child(_) => {}
					}
				}
				Ok(())
			}
		}
	}
}

/// Reference identity, used to compare chain links across states.
pub trait SameRef {
	/// Returns `true` if both refer to the same object.
	fn same_ref(&self, other: &Self) -> bool;
}

impl SameRef for Oid {
	fn same_ref(&self, other: &Self) -> bool {
		self == other
	}
}

impl<T: Activate> SameRef for Arc<Persistent<T>> {
	fn same_ref(&self, other: &Self) -> bool {
		Arc::ptr_eq(self, other)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pairs(items: &[(u32, &'static str)]) -> BucketState<u32, &'static str, Oid> {
		BucketState {
			items: BucketItems::Pairs(items.to_vec()),
			next: None,
		}
	}

	#[test]
	fn map_refs_visits_every_reference() {
		let state: NodeRecord<u32, &str> = NodeState::Children {
			items: vec![
				Slot::Child(ChildState::Leaf(10)),
				Slot::Key(5),
				Slot::Child(ChildState::Embedded(BucketState {
					items: BucketItems::Pairs(vec![(5, "e")]),
					next: Some(11),
				})),
			],
			first_leaf: Some(10),
		};

		let mapped: NodeState<u32, &str, String, String> = state
			.try_map_refs(|n: Oid| Ok::<_, ()>(format!("n{n}")), |b| Ok(format!("b{b}")))
			.unwrap();

		match mapped {
			NodeState::Children {
				items,
				first_leaf,
			} => {
				assert_eq!(first_leaf.as_deref(), Some("b10"));
				assert!(matches!(&items[0], Slot::Child(ChildState::Leaf(b)) if b == "b10"));
				assert!(
					matches!(&items[2], Slot::Child(ChildState::Embedded(s)) if s.next.as_deref() == Some("b11"))
				);
			}
			other => panic!("unexpected state {other:?}"),
		}
	}

	#[test]
	fn map_refs_stops_at_first_error() {
		let state: NodeRecord<u32, ()> = NodeState::Children {
			items: vec![
				Slot::Child(ChildState::Node(1)),
				Slot::Key(3),
				Slot::Child(ChildState::Node(2)),
			],
			first_leaf: Some(7),
		};
		let result: std::result::Result<NodeRecord<u32, ()>, Oid> =
			state.try_map_refs(|n| if n == 2 { Err(n) } else { Ok(n) }, Ok);
		assert_eq!(result, Err(2));
	}

	#[test]
	fn inline_and_lone_embedded_child_normalise_alike() {
		let inline: NodeRecord<u32, &str> = NodeState::Inline(pairs(&[(1, "a")]));
		let wrapped: NodeRecord<u32, &str> = NodeState::Children {
			items: vec![Slot::Child(ChildState::Embedded(pairs(&[(1, "a")])))],
			first_leaf: None,
		};
		assert_eq!(inline.into_mergeable().unwrap(), wrapped.into_mergeable().unwrap());
		assert_eq!(NodeRecord::<u32, &str>::Empty.into_mergeable().unwrap(), None);
	}

	#[test]
	fn real_children_are_not_mergeable() {
		let state: NodeRecord<u32, &str> = NodeState::Children {
			items: vec![Slot::Child(ChildState::Leaf(4))],
			first_leaf: Some(4),
		};
		assert_eq!(state.into_mergeable(), Err(Error::Conflict(ConflictReason::Unmergeable)));
	}

	#[test]
	fn order_check_covers_separators_and_embedded_leaves() {
		let good: NodeRecord<u32, &str> = NodeState::Children {
			items: vec![
				Slot::Child(ChildState::Leaf(1)),
				Slot::Key(5),
				Slot::Child(ChildState::Embedded(pairs(&[(5, "a"), (6, "b")]))),
			],
			first_leaf: Some(1),
		};
		assert_eq!(good.check_order(), Ok(()));

		let separators: NodeRecord<u32, &str> = NodeState::Children {
			items: vec![
				Slot::Child(ChildState::Leaf(1)),
				Slot::Key(5),
				Slot::Child(ChildState::Leaf(2)),
				Slot::Key(5),
				Slot::Child(ChildState::Leaf(3)),
			],
			first_leaf: Some(1),
		};
		assert!(matches!(separators.check_order(), Err(Error::Invariant(_))));

		let inline: NodeRecord<u32, &str> = NodeState::Inline(pairs(&[(2, "a"), (1, "b")]));
		assert!(matches!(inline.check_order(), Err(Error::Invariant(_))));
	}

	#[test]
	fn runs_keep_flavour() {
		let keys: BucketItems<u32, ()> = BucketItems::Keys(vec![1, 2]);
		assert_eq!(keys.empty_like(), BucketItems::Keys(vec![]));
		assert_eq!(keys.into_runs(), vec![(1, None), (2, None)]);
		let pairs: BucketItems<u32, u8> = BucketItems::Pairs(vec![(1, 9)]);
		assert_eq!(pairs.into_runs(), vec![(1, Some(9))]);
	}
}
