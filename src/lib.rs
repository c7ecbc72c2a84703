//! # Persistree: A Persistent B+ Tree with a Linked Leaf Chain
//!
//! This crate provides ordered maps and sets whose nodes can live in an object
//! store. Nodes are loaded lazily, written back when modified, and concurrent
//! modifications of small trees are merged instead of failing.
//!
//! ## Design Overview
//!
//! ### Key Concepts
//!
//! **Index nodes and buckets**: Interior nodes ([`node::IndexNode`]) hold
//! separators and children; the keys themselves live in leaf buckets
//! ([`bucket::Bucket`]). All children of one node are of the same tag.
//!
//! **Leaf chain**: Every bucket links to the next one, so iteration walks the
//! chain and never goes back up the tree. Deleting a bucket splices the chain
//! past it.
//!
//! **Ghosts**: Every node is wrapped in a [`activation::Persistent`] object,
//! which may be a ghost whose content is still in the store. Every access pins
//! the object first, loading it if needed.
//!
//! **Bounds, not balance**: A child is split once it holds more than its
//! capacity, and a node whose entry count reaches twice its capacity pushes
//! its content into two new children. Underfull nodes are never merged;
//! empty children are removed.
//!
//! ### Tree Structure
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │     Root IndexNode    │  <- [ _ | c0 ] [ k1 | c1 ] ...
//!                    │     first_leaf ──┐    │
//!                    └────────┬─────────┼───┘
//!                             │         │
//!              ┌──────────────┼─────────┼────┐
//!              ▼              ▼         ▼    ▼
//!        ┌──────────┐  ┌──────────┐  ┌──────────┐
//!        │  Bucket  │─►│  Bucket  │─►│  Bucket  │─► ∅   <- leaf chain
//!        │ keys:[K] │  │ keys:[K] │  │ keys:[K] │
//!        │ vals:[V] │  │ vals:[V] │  │ vals:[V] │
//!        └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use persistree::Tree;
//!
//! let tree: Tree<u32, &str> = Tree::new();
//!
//! tree.insert(1, "one")?;
//! tree.insert(2, "two")?;
//! tree.insert(3, "three")?;
//!
//! assert_eq!(tree.get(&2)?, "two");
//! assert_eq!(tree.get_or(&9, "none")?, "none");
//! assert_eq!(tree.min_key(None)?, 1);
//!
//! let keys = tree.keys(Some(&2), None)?.collect::<persistree::Result<Vec<_>>>()?;
//! assert_eq!(keys, vec![2, 3]);
//!
//! tree.remove(&1)?;
//! assert_eq!(tree.len()?, 2);
//! # Ok::<(), persistree::Error>(())
//! ```
//!
//! ## Persistence
//!
//! ```
//! use std::sync::Arc;
//! use persistree::{Connection, MemoryStorage, Tree, INNER_CAPACITY, LEAF_CAPACITY};
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let conn: Arc<Connection<u32, u32, INNER_CAPACITY, LEAF_CAPACITY>> =
//!     Connection::new(storage.clone());
//!
//! let tree: Tree<u32, u32> = Tree::new();
//! tree.insert(1, 10)?;
//! let oid = conn.add_tree(&tree)?;
//! conn.commit()?;
//!
//! let other: Arc<Connection<u32, u32, INNER_CAPACITY, LEAF_CAPACITY>> = Connection::new(storage);
//! let copy = other.open_tree(oid)?;
//! assert_eq!(copy.get(&1)?, 10);
//! # conn.close();
//! # other.close();
//! # Ok::<(), persistree::Error>(())
//! ```
//!
//! ## Thread Safety
//!
//! Node content is guarded by locks, so trees can be shared across threads,
//! but a tree has no isolation of its own: concurrent writers must be kept
//! apart by the caller, typically by giving each its own [`Connection`].

// Complex types are intentional in this crate for expressing tree traversal results
#![allow(clippy::type_complexity)]

use std::fmt;
use std::sync::Arc;

pub mod activation;
pub mod bucket;
pub mod error;
pub mod iter;
pub mod merge;
pub mod node;
pub mod state;
pub mod store;

pub use activation::{ActivationState, Oid, Serial};
pub use bucket::LeafKind;
pub use error::{ConflictReason, Error, Result};
pub use store::{Connection, MemoryStorage, Record};

use activation::{Activate, Persistent};
use bucket::BucketRef;
use iter::{Items, Keys, Range, Values};
use node::{Growth, IndexNode, LiveState, NodeRef};
use state::NodeRecord;

// ---------------------------------------------------------------------------
// Configuration Constants
// ---------------------------------------------------------------------------

/// Default capacity for index nodes.
/// A child node is split once it holds more than `INNER_CAPACITY` entries, and a
/// node reaching twice that many grows the tree by one level.
pub const INNER_CAPACITY: usize = 64;

/// Default capacity for leaf buckets.
/// A bucket is split once it holds more than `LEAF_CAPACITY` keys.
pub const LEAF_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public Type Aliases
// ---------------------------------------------------------------------------

/// An ordered map with default node capacities.
pub type Tree<K, V> = GenericTree<K, V, INNER_CAPACITY, LEAF_CAPACITY>;

/// An ordered set with default node capacities.
pub type Set<K> = GenericSet<K, INNER_CAPACITY, LEAF_CAPACITY>;

// ---------------------------------------------------------------------------
// Core Tree Structure
// ---------------------------------------------------------------------------

/// A persistent ordered map with configurable node capacities.
///
/// # Type Parameters
///
/// - `K`: The key type. Must implement `Clone + Ord`.
/// - `V`: The value type. Must implement `Clone`.
/// - `IC`: Index node capacity.
/// - `LC`: Leaf bucket capacity.
///
/// Every operation pins the root for its duration. Operations that modify the
/// tree mark every changed node dirty with its connection, if it has one.
pub struct GenericTree<K, V, const IC: usize, const LC: usize> {
	root: NodeRef<K, V, IC, LC>,
}

impl<K: Clone + Ord, V: Clone, const IC: usize, const LC: usize> Default for GenericTree<K, V, IC, LC> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, V, const IC: usize, const LC: usize> fmt::Debug for GenericTree<K, V, IC, LC> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("GenericTree").field("root", &self.root).finish()
	}
}

impl<K, V, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	pub(crate) fn from_root(root: NodeRef<K, V, IC, LC>) -> Self {
		GenericTree {
			root,
		}
	}

	pub(crate) fn root(&self) -> &NodeRef<K, V, IC, LC> {
		&self.root
	}

	fn with_kind(kind: LeafKind) -> Self {
		GenericTree {
			root: Arc::new(Persistent::new(IndexNode::new(kind))),
		}
	}

	/// Storage identity of the root, once the tree was added to a connection.
	pub fn oid(&self) -> Option<Oid> {
		self.root.oid()
	}

	/// Turns the root back into a ghost if it is clean and stored.
	pub fn deactivate(&self) -> bool {
		self.root.deactivate()
	}

	/// Number of index levels between the root and the leaves. An empty tree
	/// and a tree whose root holds leaves both have height 1.
	pub fn height(&self) -> Result<usize> {
		IndexNode::height(&self.root)
	}

	/// Returns `true` if the tree holds no keys.
	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.root.acquire()?.read().is_empty())
	}

	/// Removes every key.
	pub fn clear(&self) -> Result<()> {
		let pin = self.root.acquire()?;
		let emptied = {
			let mut data = pin.write();
			let had_entries = !data.is_empty();
			data.clear();
			had_entries
		};
		if emptied {
			pin.mark_dirty()?;
		}
		Ok(())
	}
}

impl<K: Clone + Ord, V: Clone, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	// -----------------------------------------------------------------------
	// Construction
	// -----------------------------------------------------------------------

	/// Creates a new, empty map.
	///
	/// ```
	/// use persistree::Tree;
	///
	/// let tree: Tree<String, i32> = Tree::new();
	/// assert!(tree.is_empty().unwrap());
	/// assert_eq!(tree.height().unwrap(), 1);
	/// ```
	pub fn new() -> Self {
		Self::with_kind(LeafKind::Mapping)
	}

	// -----------------------------------------------------------------------
	// Lookup
	// -----------------------------------------------------------------------

	/// Returns the value stored under `key`, or [`Error::KeyNotFound`].
	pub fn get<Q>(&self, key: &Q) -> Result<V>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let leaf = IndexNode::leaf_for(&self.root, key)?.ok_or(Error::KeyNotFound)?;
		let pin = leaf.acquire()?;
		let value = pin.read().get(key).cloned();
		value.ok_or(Error::KeyNotFound)
	}

	/// Returns the value stored under `key`, or `default` if there is none.
	pub fn get_or<Q>(&self, key: &Q, default: V) -> Result<V>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		match self.get(key) {
			Err(Error::KeyNotFound) => Ok(default),
			other => other,
		}
	}

	/// Returns `true` if `key` is in the tree.
	pub fn contains_key<Q>(&self, key: &Q) -> Result<bool>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let Some(leaf) = IndexNode::leaf_for(&self.root, key)? else {
			return Ok(false);
		};
		let pin = leaf.acquire()?;
		let found = pin.read().contains(key);
		Ok(found)
	}

	// -----------------------------------------------------------------------
	// Modification
	// -----------------------------------------------------------------------

	/// Inserts `key`, replacing any previous value.
	pub fn insert(&self, key: K, value: V) -> Result<()> {
		IndexNode::set(&self.root, key, Some(value), false).map(|_| ())
	}

	/// Inserts `key` only if it is absent. Returns whether it was inserted.
	pub fn insert_if_absent(&self, key: K, value: V) -> Result<bool> {
		let growth = IndexNode::set(&self.root, key, Some(value), true)?;
		Ok(matches!(growth, Growth::Grew { .. }))
	}

	/// Inserts every pair from `items`, replacing previous values.
	pub fn update<I: IntoIterator<Item = (K, V)>>(&self, items: I) -> Result<()> {
		for (key, value) in items {
			self.insert(key, value)?;
		}
		Ok(())
	}

	/// Removes `key`, or returns [`Error::KeyNotFound`].
	pub fn remove<Q>(&self, key: &Q) -> Result<()>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		IndexNode::delete(&self.root, key).map(|_| ())
	}

	// -----------------------------------------------------------------------
	// Bounds and Ranges
	// -----------------------------------------------------------------------

	/// The smallest key, or with `bound` the smallest key `>= bound`.
	pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
		let position = match bound {
			None => self.first_position()?,
			Some(bound) => IndexNode::find_range_end(&self.root, bound, true)?,
		};
		position.as_ref().map(key_at).transpose()?.ok_or(Error::EmptyTree)
	}

	/// The largest key, or with `bound` the largest key `<= bound`.
	pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
		let position = match bound {
			None => self.last_position()?,
			Some(bound) => IndexNode::find_range_end(&self.root, bound, false)?,
		};
		position.as_ref().map(key_at).transpose()?.ok_or(Error::EmptyTree)
	}

	/// Keys in `[lo, hi]`; an absent bound is open.
	pub fn keys(&self, lo: Option<&K>, hi: Option<&K>) -> Result<Keys<K, V, LC>> {
		self.range(lo, hi).map(Keys)
	}

	/// Values of the keys in `[lo, hi]`, in key order.
	pub fn values(&self, lo: Option<&K>, hi: Option<&K>) -> Result<Values<K, V, LC>> {
		self.range(lo, hi).map(Values)
	}

	/// `(key, value)` pairs for the keys in `[lo, hi]`.
	pub fn items(&self, lo: Option<&K>, hi: Option<&K>) -> Result<Items<K, V, LC>> {
		self.range(lo, hi).map(Items)
	}

	/// Every `(value, key)` pair whose value is at least `min`, largest value
	/// first.
	pub fn by_value(&self, min: &V) -> Result<Vec<(V, K)>>
	where
		V: Ord,
	{
		let mut found = Vec::new();
		for item in self.items(None, None)? {
			let (key, value) = item?;
			if value >= *min {
				found.push((value, key));
			}
		}
		found.sort_by(|a, b| b.cmp(a));
		Ok(found)
	}

	/// Number of keys, counted along the leaf chain.
	pub fn len(&self) -> Result<usize> {
		let mut count = 0;
		let mut leaf = self.first_leaf()?;
		while let Some(current) = leaf {
			let pin = current.acquire()?;
			let data = pin.read();
			count += data.len();
			leaf = data.next_bucket()?;
		}
		Ok(count)
	}

	fn first_leaf(&self) -> Result<Option<BucketRef<K, V, LC>>> {
		let pin = self.root.acquire()?;
		let data = pin.read();
		if data.is_empty() {
			return Ok(None);
		}
		data.first_leaf().map(Some).ok_or(Error::Invariant("non-empty root lost its first leaf"))
	}

	/// Position of the smallest key.
	fn first_position(&self) -> Result<Option<(BucketRef<K, V, LC>, usize)>> {
		let mut leaf = self.first_leaf()?;
		while let Some(current) = leaf {
			let (empty, next) = {
				let pin = current.acquire()?;
				let data = pin.read();
				(data.is_empty(), data.next_bucket()?)
			};
			if !empty {
				return Ok(Some((current, 0)));
			}
			leaf = next;
		}
		Ok(None)
	}

	/// Position of the largest key.
	fn last_position(&self) -> Result<Option<(BucketRef<K, V, LC>, usize)>> {
		let Some(leaf) = IndexNode::last_bucket(&self.root)? else {
			return Ok(None);
		};
		let len = leaf.acquire()?.read().len();
		Ok(len.checked_sub(1).map(|offset| (leaf, offset)))
	}

	fn range(&self, lo: Option<&K>, hi: Option<&K>) -> Result<Range<K, V, LC>> {
		let start = match lo {
			None => self.first_position()?,
			Some(lo) => IndexNode::find_range_end(&self.root, lo, true)?,
		};
		let end = match hi {
			None => self.last_position()?,
			Some(hi) => IndexNode::find_range_end(&self.root, hi, false)?,
		};
		let (Some(start), Some(end)) = (start, end) else {
			return Ok(Range::empty());
		};
		if key_at(&start)? > key_at(&end)? {
			return Ok(Range::empty());
		}
		Ok(Range::new(start, end))
	}

	// -----------------------------------------------------------------------
	// State
	// -----------------------------------------------------------------------

	/// The root's logical state.
	pub fn get_state(&self) -> Result<LiveState<K, V, IC, LC>> {
		let pin = self.root.acquire()?;
		let state = pin.read().get_state();
		state
	}

	/// Replaces the whole tree with `state`.
	pub fn set_state(&self, state: LiveState<K, V, IC, LC>) -> Result<()> {
		state.check_order()?;
		let pin = self.root.acquire()?;
		pin.write().load(state)?;
		pin.mark_dirty()
	}

	/// Merges two stored root states that were both derived from `ancestor`.
	pub fn resolve_conflict(
		ancestor: NodeRecord<K, V>,
		mine: NodeRecord<K, V>,
		theirs: NodeRecord<K, V>,
	) -> Result<NodeRecord<K, V>>
	where
		V: PartialEq,
	{
		merge::resolve_node_conflict(ancestor, mine, theirs)
	}
}

/// The key at a leaf position.
fn key_at<K: Clone, V, const LC: usize>(position: &(BucketRef<K, V, LC>, usize)) -> Result<K> {
	let pin = position.0.acquire()?;
	let key = pin.read().key_at(position.1).cloned();
	key.ok_or(Error::Invariant("leaf position past the end of its leaf"))
}

// ---------------------------------------------------------------------------
// Set
// ---------------------------------------------------------------------------

/// A persistent ordered set. Shares its structure with [`GenericTree`]; its
/// leaves hold keys only.
pub struct GenericSet<K, const IC: usize, const LC: usize> {
	tree: GenericTree<K, (), IC, LC>,
}

impl<K: Clone + Ord, const IC: usize, const LC: usize> Default for GenericSet<K, IC, LC> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, const IC: usize, const LC: usize> fmt::Debug for GenericSet<K, IC, LC> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("GenericSet").field("root", &self.tree.root).finish()
	}
}

impl<K, const IC: usize, const LC: usize> GenericSet<K, IC, LC> {
	pub(crate) fn from_tree(tree: GenericTree<K, (), IC, LC>) -> Self {
		GenericSet {
			tree,
		}
	}

	pub(crate) fn tree(&self) -> &GenericTree<K, (), IC, LC> {
		&self.tree
	}

	/// See [`GenericTree::oid`].
	pub fn oid(&self) -> Option<Oid> {
		self.tree.oid()
	}

	/// See [`GenericTree::deactivate`].
	pub fn deactivate(&self) -> bool {
		self.tree.deactivate()
	}

	/// See [`GenericTree::height`].
	pub fn height(&self) -> Result<usize> {
		self.tree.height()
	}

	/// Returns `true` if the set holds no keys.
	pub fn is_empty(&self) -> Result<bool> {
		self.tree.is_empty()
	}

	/// Removes every key.
	pub fn clear(&self) -> Result<()> {
		self.tree.clear()
	}
}

impl<K: Clone + Ord, const IC: usize, const LC: usize> GenericSet<K, IC, LC> {
	/// Creates a new, empty set.
	pub fn new() -> Self {
		GenericSet {
			tree: GenericTree::with_kind(LeafKind::Set),
		}
	}

	/// Adds `key`. Returns whether it was absent.
	pub fn insert(&self, key: K) -> Result<bool> {
		let growth = IndexNode::set(&self.tree.root, key, None, false)?;
		Ok(matches!(growth, Growth::Grew { .. }))
	}

	/// Adds every key from `keys` and returns how many were absent.
	pub fn update<I: IntoIterator<Item = K>>(&self, keys: I) -> Result<usize> {
		let mut added = 0;
		for key in keys {
			if self.insert(key)? {
				added += 1;
			}
		}
		Ok(added)
	}

	/// Returns `true` if `key` is in the set.
	pub fn contains<Q>(&self, key: &Q) -> Result<bool>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.tree.contains_key(key)
	}

	/// Removes `key`, or returns [`Error::KeyNotFound`].
	pub fn remove<Q>(&self, key: &Q) -> Result<()>
	where
		K: std::borrow::Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.tree.remove(key)
	}

	/// See [`GenericTree::min_key`].
	pub fn min_key(&self, bound: Option<&K>) -> Result<K> {
		self.tree.min_key(bound)
	}

	/// See [`GenericTree::max_key`].
	pub fn max_key(&self, bound: Option<&K>) -> Result<K> {
		self.tree.max_key(bound)
	}

	/// Keys in `[lo, hi]`; an absent bound is open.
	pub fn keys(&self, lo: Option<&K>, hi: Option<&K>) -> Result<Keys<K, (), LC>> {
		self.tree.keys(lo, hi)
	}

	/// Number of keys, counted along the leaf chain.
	pub fn len(&self) -> Result<usize> {
		self.tree.len()
	}

	/// See [`GenericTree::get_state`].
	pub fn get_state(&self) -> Result<LiveState<K, (), IC, LC>> {
		self.tree.get_state()
	}

	/// See [`GenericTree::set_state`].
	pub fn set_state(&self, state: LiveState<K, (), IC, LC>) -> Result<()> {
		self.tree.set_state(state)
	}

	/// See [`GenericTree::resolve_conflict`].
	pub fn resolve_conflict(
		ancestor: NodeRecord<K, ()>,
		mine: NodeRecord<K, ()>,
		theirs: NodeRecord<K, ()>,
	) -> Result<NodeRecord<K, ()>> {
		merge::resolve_node_conflict(ancestor, mine, theirs)
	}
}

// ===========================================================================
// Test-Only Validation Module
// ===========================================================================

#[cfg(any(test, feature = "test-utils"))]
mod validation {
	use super::*;
	use node::Child;

	/// Walks one subtree, checking separators, bounds and leaf depth, and
	/// collecting its leaves in key order.
	pub(super) fn check_node<K: Ord + fmt::Debug, V, const IC: usize, const LC: usize>(
		node: &NodeRef<K, V, IC, LC>,
		lower: Option<&K>,
		upper: Option<&K>,
		level: usize,
		leaf_level: &mut Option<usize>,
		leaves: &mut Vec<BucketRef<K, V, LC>>,
	) {
		let pin = node.acquire().expect("index node loads");
		let data = pin.read();
		if data.is_empty() {
			assert_eq!(level, 1, "empty index node below the root at level {}", level);
			assert!(data.first_leaf.is_none(), "empty index node keeps a first leaf");
			return;
		}
		assert!(
			data.len() < 2 * IC,
			"index node at level {} has {} entries, limit is {}",
			level,
			data.len(),
			2 * IC
		);
		assert!(data.entries[0].key.is_none(), "entry 0 carries a separator at level {}", level);

		let holds_nodes = matches!(data.entries[0].child, Child::Node(_));
		let first_leaf_index = leaves.len();
		for (i, entry) in data.entries.iter().enumerate() {
			let low = if i == 0 {
				lower
			} else {
				let key = entry.key.as_ref().expect("separator past entry 0");
				if let Some(previous) = data.entries[i - 1].key.as_ref() {
					assert!(previous < key, "separators {:?} >= {:?}", previous, key);
				}
				if let Some(lower) = lower {
					assert!(key >= lower, "separator {:?} below parent bound {:?}", key, lower);
				}
				if let Some(upper) = upper {
					assert!(key < upper, "separator {:?} not below parent bound {:?}", key, upper);
				}
				Some(key)
			};
			let high = data.entries.get(i + 1).and_then(|e| e.key.as_ref()).or(upper);

			assert_eq!(
				matches!(entry.child, Child::Node(_)),
				holds_nodes,
				"index node at level {} mixes nodes and leaves",
				level
			);
			match &entry.child {
				Child::Node(child) => check_node(child, low, high, level + 1, leaf_level, leaves),
				Child::Leaf(leaf) => {
					let depth = *leaf_level.get_or_insert(level);
					assert_eq!(depth, level, "leaves at levels {} and {}", depth, level);
					let leaf_pin = leaf.acquire().expect("leaf loads");
					let bucket = leaf_pin.read();
					assert_eq!(bucket.kind, data.kind, "leaf kind differs from its parent");
					assert!(!bucket.is_empty(), "empty leaf under index node at level {}", level);
					assert!(bucket.len() <= LC, "leaf holds {} keys, limit is {}", bucket.len(), LC);
					match bucket.kind {
						LeafKind::Mapping => assert_eq!(bucket.values.len(), bucket.len()),
						LeafKind::Set => assert!(bucket.values.is_empty()),
					}
					for pair in bucket.keys().windows(2) {
						assert!(pair[0] < pair[1], "leaf keys {:?} >= {:?}", pair[0], pair[1]);
					}
					for key in bucket.keys() {
						if let Some(low) = low {
							assert!(key >= low, "key {:?} below bound {:?}", key, low);
						}
						if let Some(high) = high {
							assert!(key < high, "key {:?} not below bound {:?}", key, high);
						}
					}
					leaves.push(leaf.clone());
				}
			}
		}

		let first = data.first_leaf().expect("non-empty index node keeps its first leaf");
		assert!(
			Arc::ptr_eq(&first, &leaves[first_leaf_index]),
			"first leaf of the index node at level {} is stale",
			level
		);
	}

	/// Checks the whole tree and that the leaf chain visits exactly the leaves
	/// of the tree in order.
	pub(super) fn check_tree<K: Ord + fmt::Debug, V, const IC: usize, const LC: usize>(
		root: &NodeRef<K, V, IC, LC>,
	) {
		let mut leaves = Vec::new();
		check_node(root, None, None, 1, &mut None, &mut leaves);

		let mut cursor = root.acquire().expect("root loads").read().first_leaf();
		for (i, leaf) in leaves.iter().enumerate() {
			let current = cursor
				.unwrap_or_else(|| panic!("leaf chain ends after {} of {} leaves", i, leaves.len()));
			assert!(Arc::ptr_eq(&current, leaf), "leaf chain leaves tree order at leaf {}", i);
			let pin = current.acquire().expect("leaf loads");
			cursor = pin.read().next_bucket().expect("leaf chain link is alive");
		}
		assert!(cursor.is_none(), "leaf chain continues past the last leaf");
	}
}

#[cfg(any(test, feature = "test-utils"))]
impl<K: Clone + Ord + fmt::Debug, V, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	/// Validates all tree invariants. Panics with diagnostic info if any invariant is violated.
	///
	/// # Invariants Checked
	///
	/// 1. Separators strictly increase and bound the keys below them
	/// 2. All leaves are at the same depth and no node mixes nodes and leaves
	/// 3. Leaves are non-empty, sorted, and within capacity
	/// 4. Every index node's first leaf is the leftmost leaf of its subtree
	/// 5. The leaf chain visits every leaf exactly once, in key order
	pub fn assert_invariants(&self) {
		validation::check_tree(&self.root);
	}
}

#[cfg(any(test, feature = "test-utils"))]
impl<K: Clone + Ord + fmt::Debug, const IC: usize, const LC: usize> GenericSet<K, IC, LC> {
	/// See [`GenericTree::assert_invariants`].
	pub fn assert_invariants(&self) {
		self.tree.assert_invariants();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	type Small = GenericTree<i32, &'static str, 4, 4>;

	fn collect<T>(iter: impl Iterator<Item = Result<T>>) -> Vec<T> {
		iter.collect::<Result<Vec<T>>>().unwrap()
	}

	// ---- Basic operations ----

	#[test]
	fn empty_tree() {
		let tree: Tree<i32, &str> = Tree::new();
		assert!(tree.is_empty().unwrap());
		assert_eq!(tree.len().unwrap(), 0);
		assert_eq!(tree.get(&1), Err(Error::KeyNotFound));
		assert_eq!(tree.remove(&1), Err(Error::KeyNotFound));
		assert_eq!(tree.min_key(None), Err(Error::EmptyTree));
		assert_eq!(tree.max_key(Some(&3)), Err(Error::EmptyTree));
		assert!(collect(tree.keys(None, None).unwrap()).is_empty());
		tree.assert_invariants();
	}

	#[test]
	fn insert_get_replace() {
		let tree: Tree<i32, &str> = Tree::new();
		tree.insert(1, "one").unwrap();
		tree.insert(2, "two").unwrap();
		tree.insert(1, "uno").unwrap();
		assert_eq!(tree.get(&1), Ok("uno"));
		assert_eq!(tree.get_or(&3, "none"), Ok("none"));
		assert!(tree.contains_key(&2).unwrap());
		assert!(!tree.contains_key(&3).unwrap());
		assert_eq!(tree.len().unwrap(), 2);
		tree.assert_invariants();
	}

	#[test]
	fn insert_if_absent_keeps_existing() {
		let tree: Tree<i32, &str> = Tree::new();
		assert!(tree.insert_if_absent(1, "a").unwrap());
		assert!(!tree.insert_if_absent(1, "b").unwrap());
		assert_eq!(tree.get(&1), Ok("a"));
	}

	#[test]
	fn update_and_clear() {
		let tree = Small::new();
		tree.update((0..50).map(|i| (i, "x"))).unwrap();
		assert_eq!(tree.len().unwrap(), 50);
		assert!(tree.height().unwrap() > 1);
		tree.assert_invariants();
		tree.clear().unwrap();
		assert!(tree.is_empty().unwrap());
		assert_eq!(tree.height().unwrap(), 1);
		tree.insert(3, "y").unwrap();
		assert_eq!(collect(tree.items(None, None).unwrap()), vec![(3, "y")]);
		tree.assert_invariants();
	}

	// ---- Bounds ----

	#[test]
	fn min_and_max_with_bounds() {
		let tree = Small::new();
		for k in (0..100).map(|i| i * 2) {
			tree.insert(k, "v").unwrap();
		}
		assert_eq!(tree.min_key(None), Ok(0));
		assert_eq!(tree.max_key(None), Ok(198));
		assert_eq!(tree.min_key(Some(&7)), Ok(8));
		assert_eq!(tree.max_key(Some(&7)), Ok(6));
		assert_eq!(tree.min_key(Some(&8)), Ok(8));
		assert_eq!(tree.min_key(Some(&199)), Err(Error::EmptyTree));
		assert_eq!(tree.max_key(Some(&-1)), Err(Error::EmptyTree));
	}

	// ---- Ranges ----

	#[test]
	fn ranges_are_inclusive() {
		let tree = Small::new();
		for k in 0..40 {
			tree.insert(k, "v").unwrap();
		}
		assert_eq!(collect(tree.keys(Some(&10), Some(&14)).unwrap()), vec![10, 11, 12, 13, 14]);
		assert_eq!(collect(tree.keys(Some(&38), None).unwrap()), vec![38, 39]);
		assert_eq!(collect(tree.keys(None, Some(&1)).unwrap()), vec![0, 1]);
		assert!(collect(tree.keys(Some(&14), Some(&10)).unwrap()).is_empty());
		assert!(collect(tree.keys(Some(&40), None).unwrap()).is_empty());
		assert_eq!(collect(tree.values(Some(&5), Some(&5)).unwrap()), vec!["v"]);
	}

	#[test]
	fn range_between_keys_is_empty() {
		let tree = Small::new();
		for k in [10, 20, 30] {
			tree.insert(k, "v").unwrap();
		}
		assert!(collect(tree.keys(Some(&11), Some(&19)).unwrap()).is_empty());
		assert_eq!(collect(tree.keys(Some(&11), Some(&20)).unwrap()), vec![20]);
	}

	#[test]
	fn by_value_sorts_descending() {
		let tree: GenericTree<&str, i32, 4, 4> = GenericTree::new();
		tree.update([("a", 3), ("b", 1), ("c", 7), ("d", 3)]).unwrap();
		assert_eq!(tree.by_value(&3).unwrap(), vec![(7, "c"), (3, "d"), (3, "a")]);
		assert!(tree.by_value(&8).unwrap().is_empty());
	}

	// ---- Deletion ----

	#[test]
	fn remove_everything_in_mixed_order() {
		let tree = Small::new();
		for k in 0..200 {
			tree.insert(k, "v").unwrap();
		}
		for k in (0..200).filter(|k| k % 3 == 0).chain((0..200).filter(|k| k % 3 != 0).rev()) {
			tree.remove(&k).unwrap();
			tree.assert_invariants();
		}
		assert!(tree.is_empty().unwrap());
		assert_eq!(tree.len().unwrap(), 0);
	}

	// ---- State ----

	#[test]
	fn state_round_trip_between_trees() {
		let source = Small::new();
		for k in 0..30 {
			source.insert(k, "s").unwrap();
		}
		let copy = Small::new();
		copy.set_state(source.get_state().unwrap()).unwrap();
		assert_eq!(collect(copy.keys(None, None).unwrap()), (0..30).collect::<Vec<_>>());
		copy.assert_invariants();
	}

	#[test]
	fn set_state_rejects_unsorted_inline_leaf() {
		let tree = Small::new();
		let state: LiveState<i32, &str, 4, 4> = state::NodeState::Inline(state::BucketState {
			items: state::BucketItems::Pairs(vec![(2, "b"), (1, "a")]),
			next: None,
		});
		assert!(matches!(tree.set_state(state), Err(Error::Invariant(_))));
	}

	// ---- Sets ----

	#[test]
	fn set_operations() {
		let set: GenericSet<u32, 4, 4> = GenericSet::new();
		assert!(set.insert(5).unwrap());
		assert!(!set.insert(5).unwrap());
		assert_eq!(set.update([1, 9, 5, 3]).unwrap(), 3);
		assert!(set.contains(&9).unwrap());
		assert_eq!(collect(set.keys(None, None).unwrap()), vec![1, 3, 5, 9]);
		set.remove(&3).unwrap();
		assert_eq!(set.remove(&3), Err(Error::KeyNotFound));
		assert_eq!(set.min_key(None), Ok(1));
		assert_eq!(set.max_key(Some(&8)), Ok(5));
		assert_eq!(set.len().unwrap(), 3);
		set.assert_invariants();
	}

	#[test]
	fn set_state_kind_mismatch() {
		let set: GenericSet<u32, 4, 4> = GenericSet::new();
		let state: LiveState<u32, (), 4, 4> = state::NodeState::Inline(state::BucketState {
			items: state::BucketItems::Pairs(vec![(1, ())]),
			next: None,
		});
		assert!(matches!(set.set_state(state), Err(Error::TypeMismatch(_))));
	}
}
