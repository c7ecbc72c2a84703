//! # Index Nodes
//!
//! An index node is a sorted array of `(separator, child)` entries. All
//! children of one node are of the same tag: either every child is another
//! index node, or every child is a leaf bucket.
//!
//! ```text
//!             ┌──────────────────────────────────────┐
//!             │  [ _ | c0 ]  [ 10 | c1 ]  [ 20 | c2 ] │   entries
//!             └────┬─────────────┬────────────┬──────┘
//!                  ▼             ▼            ▼
//!               k < 10      10 <= k < 20    20 <= k
//! ```
//!
//! The separator of entry 0 is never stored and never compared against; the
//! first child covers everything below the second separator.
//!
//! ## Growth
//!
//! Structural changes travel **bottom-up** as return values. A child that
//! grew past its bound ([`Growth::Grew`] with `overflowed`) is split by its
//! parent, which inserts the new half right after the original slot. A node
//! whose own entry count reaches `2 * IC` moves its entries into two fresh
//! children and keeps just those two entries. That is the only way the tree
//! gains height, and it happens wherever the overflow occurred.
//!
//! ## Shrinking
//!
//! Underfull nodes are never merged or redistributed. Deletion only removes
//! entries whose child became empty, and repairs the leaf chain:
//!
//! ```text
//!   before:   [a] ──► [b] ──► [c]        b became empty
//!   after:    [a] ────────► [c]          a.next spliced past b
//! ```
//!
//! The splice is done by the node holding the entry right before the removed
//! leaf. When the removed leaf was the leftmost of a subtree, the node has no
//! such entry and reports [`Shrink::LostFirstLeaf`] to its parent, which
//! splices through the last leaf of its preceding sibling, or escalates again.
//!
//! ## Activation
//!
//! Every child access goes through [`Persistent::acquire`]; the returned pin
//! releases the child on every exit path.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use crate::activation::{Activate, Persistent};
use crate::bucket::{Bucket, BucketRef, LeafKind, WeakBucket};
use crate::error::{Error, Result};
use crate::state::{BucketState, ChildState, NodeState, Slot};

/// Owning handle to an index node.
pub type NodeRef<K, V, const IC: usize, const LC: usize> = Arc<Persistent<IndexNode<K, V, IC, LC>>>;

/// Node state holding live handles.
pub type LiveState<K, V, const IC: usize, const LC: usize> =
	NodeState<K, V, NodeRef<K, V, IC, LC>, BucketRef<K, V, LC>>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What an insertion did to a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
	/// Nothing changed.
	Unchanged,
	/// A value was replaced in place.
	Changed,
	/// A key was added. `overflowed` tells the parent the child is now larger
	/// than its bound and must be split.
	Grew { overflowed: bool },
}

/// What a deletion did to a subtree.
#[derive(Debug)]
pub enum Shrink<K, V, const LC: usize> {
	/// The subtree lost a key and any chain repair was done inside it.
	Shrank,
	/// The leftmost leaf of the subtree was removed and the leaf before it
	/// still links to it. `removed` is kept alive until an ancestor splices
	/// the chain past it.
	LostFirstLeaf { removed: BucketRef<K, V, LC> },
}

// ---------------------------------------------------------------------------
// Children and Entries
// ---------------------------------------------------------------------------

/// An owning reference to a child of an index node.
pub enum Child<K, V, const IC: usize, const LC: usize> {
	Node(NodeRef<K, V, IC, LC>),
	Leaf(BucketRef<K, V, LC>),
}

impl<K, V, const IC: usize, const LC: usize> Clone for Child<K, V, IC, LC> {
	fn clone(&self) -> Self {
		match self {
			Child::Node(node) => Child::Node(node.clone()),
			Child::Leaf(leaf) => Child::Leaf(leaf.clone()),
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> fmt::Debug for Child<K, V, IC, LC> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Child::Node(node) => f.debug_tuple("Node").field(&node.oid()).finish(),
			Child::Leaf(leaf) => f.debug_tuple("Leaf").field(&leaf.oid()).finish(),
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> Child<K, V, IC, LC> {
	/// The leftmost leaf under this child.
	pub(crate) fn first_leaf(&self) -> Result<WeakBucket<K, V, LC>> {
		match self {
			Child::Leaf(leaf) => Ok(Arc::downgrade(leaf)),
			Child::Node(node) => {
				let pin = node.acquire()?;
				let data = pin.read();
				data.first_leaf.clone().ok_or(Error::Invariant("index node without a first leaf"))
			}
		}
	}

	/// The rightmost leaf under this child.
	pub(crate) fn last_bucket(&self) -> Result<BucketRef<K, V, LC>> {
		let mut current = match self {
			Child::Leaf(leaf) => return Ok(leaf.clone()),
			Child::Node(node) => node.clone(),
		};
		loop {
			let child = {
				let pin = current.acquire()?;
				let data = pin.read();
				data.entries
					.last()
					.map(|entry| entry.child.clone())
					.ok_or(Error::Invariant("last leaf of an empty index node"))?
			};
			match child {
				Child::Leaf(leaf) => return Ok(leaf),
				Child::Node(node) => current = node,
			}
		}
	}
}

pub(crate) struct Entry<K, V, const IC: usize, const LC: usize> {
	/// `None` only for entry 0.
	pub(crate) key: Option<K>,
	pub(crate) child: Child<K, V, IC, LC>,
}

// ---------------------------------------------------------------------------
// Index Node
// ---------------------------------------------------------------------------

/// An interior node of the tree.
pub struct IndexNode<K, V, const IC: usize, const LC: usize> {
	pub(crate) kind: LeafKind,
	pub(crate) entries: Vec<Entry<K, V, IC, LC>>,
	/// Leftmost leaf of this subtree. `None` iff `entries` is empty.
	pub(crate) first_leaf: Option<WeakBucket<K, V, LC>>,
}

impl<K: fmt::Debug, V, const IC: usize, const LC: usize> fmt::Debug for IndexNode<K, V, IC, LC> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IndexNode")
			.field("kind", &self.kind)
			.field("separators", &self.entries.iter().skip(1).map(|e| &e.key).collect::<Vec<_>>())
			.field("children", &self.entries.iter().map(|e| &e.child).collect::<Vec<_>>())
			.finish()
	}
}

impl<K, V, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	/// Creates an empty node whose leaves will be of `kind`.
	pub fn new(kind: LeafKind) -> IndexNode<K, V, IC, LC> {
		IndexNode {
			kind,
			entries: Vec::new(),
			first_leaf: None,
		}
	}

	/// Number of entries.
	#[inline]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Returns `true` if the node has no entries.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Kind of the leaves below this node.
	#[inline]
	pub fn kind(&self) -> LeafKind {
		self.kind
	}

	/// The cached leftmost leaf, if it is still alive.
	pub(crate) fn first_leaf(&self) -> Option<BucketRef<K, V, LC>> {
		self.first_leaf.as_ref().and_then(Weak::upgrade)
	}

	/// The rightmost leaf of the subtree rooted at `node`.
	pub(crate) fn last_bucket(node: &NodeRef<K, V, IC, LC>) -> Result<Option<BucketRef<K, V, LC>>> {
		if node.acquire()?.read().is_empty() {
			return Ok(None);
		}
		Child::Node(node.clone()).last_bucket().map(Some)
	}

	/// Whether the node's state embeds its only leaf.
	fn inlines_single_leaf(&self) -> bool {
		matches!(self.entries.as_slice(), [Entry { child: Child::Leaf(leaf), .. }] if leaf.oid().is_none())
	}

	fn refresh_first_leaf(&mut self) -> Result<()> {
		self.first_leaf = match self.entries.first() {
			Some(entry) => Some(entry.child.first_leaf()?),
			None => None,
		};
		Ok(())
	}

	/// Releases every entry.
	///
	/// Descendants are torn down with an explicit worklist so that dropping a
	/// deep tree never recurses once per level.
	pub(crate) fn clear(&mut self) {
		self.first_leaf = None;
		let mut pending: Vec<Child<K, V, IC, LC>> =
			mem::take(&mut self.entries).into_iter().map(|entry| entry.child).collect();
		while let Some(child) = pending.pop() {
			if let Child::Node(node) = child {
				// Shared nodes are still owned elsewhere; only the last owner
				// tears them down.
				if let Some(node) = Arc::into_inner(node) {
					let mut data = node.into_inner();
					pending.extend(mem::take(&mut data.entries).into_iter().map(|e| e.child));
				}
			}
		}
	}

	/// Number of index levels from this node down to the leaves.
	pub(crate) fn height(node: &NodeRef<K, V, IC, LC>) -> Result<usize> {
		let mut height = 1;
		let mut current = node.clone();
		loop {
			let child = {
				let pin = current.acquire()?;
				let data = pin.read();
				match data.entries.first() {
					Some(Entry {
						child: Child::Node(child),
						..
					}) => child.clone(),
					_ => return Ok(height),
				}
			};
			height += 1;
			current = child;
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> Drop for IndexNode<K, V, IC, LC> {
	fn drop(&mut self) {
		self.clear();
	}
}

// ---------------------------------------------------------------------------
// Search, Insert, Split
// ---------------------------------------------------------------------------

impl<K: Clone + Ord, V, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	/// Index of the entry whose subtree should hold `key`: the last separator
	/// `<= key`, stopping early on an exact match.
	pub(crate) fn search<Q>(&self, key: &Q) -> usize
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let (mut min, mut max) = (0, self.entries.len());
		let mut i = max / 2;
		while max - min > 1 {
			// i > min >= 0 here, so entry i always carries a separator.
			let cmp = self.entries[i].key.as_ref().map_or(Ordering::Less, |k| k.borrow().cmp(key));
			match cmp {
				Ordering::Less => min = i,
				Ordering::Equal => {
					min = i;
					break;
				}
				Ordering::Greater => max = i,
			}
			i = (min + max) / 2;
		}
		min
	}

	/// Finds the leaf that should hold `key`, or `None` for an empty tree.
	pub(crate) fn leaf_for<Q>(
		node: &NodeRef<K, V, IC, LC>,
		key: &Q,
	) -> Result<Option<BucketRef<K, V, LC>>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let mut current = node.clone();
		loop {
			let child = {
				let pin = current.acquire()?;
				let data = pin.read();
				if data.entries.is_empty() {
					return Ok(None);
				}
				data.entries[data.search(key)].child.clone()
			};
			match child {
				Child::Node(node) => current = node,
				Child::Leaf(leaf) => return Ok(Some(leaf)),
			}
		}
	}

	/// Inserts `key` into the subtree rooted at `node`.
	///
	/// `value` is `None` for set trees. With `unique`, an existing key keeps
	/// its value.
	pub(crate) fn set(
		node: &NodeRef<K, V, IC, LC>,
		key: K,
		value: Option<V>,
		unique: bool,
	) -> Result<Growth> {
		let pin = node.acquire()?;
		let mut data = pin.write();
		let mut changed = false;
		let mut leaf_changed = false;
		let result = data.set_entry(key, value, unique, &mut changed, &mut leaf_changed);
		let dirty = changed || (leaf_changed && data.inlines_single_leaf());
		drop(data);
		if dirty {
			let marked = pin.mark_dirty();
			return result.and_then(|growth| marked.map(|()| growth));
		}
		result
	}

	fn set_entry(
		&mut self,
		key: K,
		value: Option<V>,
		unique: bool,
		changed: &mut bool,
		leaf_changed: &mut bool,
	) -> Result<Growth> {
		let created = self.entries.is_empty();
		if created {
			self.grow(0)?;
			*changed = true;
		}
		let result = self.set_child(key, value, unique, changed, leaf_changed);
		if created && result.is_err() {
			// Never leave the freshly created empty leaf behind.
			self.clear();
		}
		result
	}

	fn set_child(
		&mut self,
		key: K,
		value: Option<V>,
		unique: bool,
		changed: &mut bool,
		leaf_changed: &mut bool,
	) -> Result<Growth> {
		let index = self.search(&key);
		let outcome = match self.entries[index].child.clone() {
			Child::Node(child) => IndexNode::set(&child, key, value, unique)?,
			Child::Leaf(leaf) => {
				let pin = leaf.acquire()?;
				let outcome = pin.write().set(key, value, unique)?;
				if outcome != Growth::Unchanged {
					pin.mark_dirty()?;
				}
				outcome
			}
		};

		match outcome {
			Growth::Unchanged => Ok(Growth::Unchanged),
			Growth::Changed => {
				*leaf_changed = true;
				Ok(Growth::Changed)
			}
			Growth::Grew {
				overflowed,
			} => {
				*leaf_changed = true;
				if overflowed {
					self.grow(index)?;
					*changed = true;
				}
				Ok(Growth::Grew {
					overflowed: self.entries.len() > IC,
				})
			}
		}
	}

	/// Splits the child at `index` and inserts the new half after it. An empty
	/// node gets its first leaf instead.
	fn grow(&mut self, index: usize) -> Result<()> {
		if self.entries.is_empty() {
			let leaf = Arc::new(Persistent::new(Bucket::new(self.kind)));
			self.first_leaf = Some(Arc::downgrade(&leaf));
			self.entries.push(Entry {
				key: None,
				child: Child::Leaf(leaf),
			});
			return Ok(());
		}

		let (separator, sibling) = match &self.entries[index].child {
			Child::Leaf(leaf) => {
				let pin = leaf.acquire()?;
				let sibling = pin.write().split(None)?;
				pin.mark_dirty()?;
				let separator = sibling
					.peek(|b| b.keys.first().cloned())
					.ok_or(Error::Invariant("leaf split produced an empty sibling"))?;
				(separator, Child::Leaf(sibling))
			}
			Child::Node(node) => {
				let pin = node.acquire()?;
				let (separator, sibling) = pin.write().split(None)?;
				pin.mark_dirty()?;
				(separator, Child::Node(Arc::new(Persistent::new(sibling))))
			}
		};
		self.entries.insert(
			index + 1,
			Entry {
				key: Some(separator),
				child: sibling,
			},
		);
		tracing::trace!(index, entries = self.entries.len(), "split child");

		if self.entries.len() >= 2 * IC {
			self.clone_into_children()?;
		}
		Ok(())
	}

	/// Moves the entries from `index` onward into a new sibling node and
	/// returns it together with its separator.
	///
	/// Without an index, or with one that is out of range, the split happens
	/// at the midpoint.
	pub(crate) fn split(&mut self, index: Option<usize>) -> Result<(K, IndexNode<K, V, IC, LC>)> {
		let len = self.entries.len();
		if len < 2 {
			return Err(Error::Invariant("split of an index node with fewer than two entries"));
		}
		let index = index.filter(|&i| i < len).unwrap_or(len / 2);
		if index == 0 {
			return Err(Error::Invariant("index split would leave an empty half"));
		}
		// Everything fallible happens before any entry moves.
		let first_leaf = self.entries[index].child.first_leaf()?;
		let separator = self.entries[index]
			.key
			.clone()
			.ok_or(Error::Invariant("missing separator past the first entry"))?;

		let mut tail = self.entries.split_off(index);
		tail[0].key = None;
		Ok((
			separator,
			IndexNode {
				kind: self.kind,
				entries: tail,
				first_leaf: Some(first_leaf),
			},
		))
	}

	/// Replaces the entries of an overfull node with two children holding its
	/// two halves. The tree gets one level taller here.
	fn clone_into_children(&mut self) -> Result<()> {
		let (separator, right) = self.split(None)?;
		let left = IndexNode {
			kind: self.kind,
			entries: mem::take(&mut self.entries),
			first_leaf: self.first_leaf.clone(),
		};
		tracing::debug!(left = left.len(), right = right.len(), "cloned index node into two children");
		self.entries = vec![
			Entry {
				key: None,
				child: Child::Node(Arc::new(Persistent::new(left))),
			},
			Entry {
				key: Some(separator),
				child: Child::Node(Arc::new(Persistent::new(right))),
			},
		];
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

impl<K: Clone + Ord, V, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	/// Removes `key` from the subtree rooted at `node`.
	pub(crate) fn delete<Q>(node: &NodeRef<K, V, IC, LC>, key: &Q) -> Result<Shrink<K, V, LC>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let pin = node.acquire()?;
		let mut data = pin.write();
		let mut changed = false;
		let mut leaf_changed = false;
		let result = data.delete_entry(key, &mut changed, &mut leaf_changed);
		let dirty = changed || (leaf_changed && data.inlines_single_leaf());
		drop(data);
		if dirty {
			let marked = pin.mark_dirty();
			return result.and_then(|shrink| marked.map(|()| shrink));
		}
		result
	}

	fn delete_entry<Q>(
		&mut self,
		key: &Q,
		changed: &mut bool,
		leaf_changed: &mut bool,
	) -> Result<Shrink<K, V, LC>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		if self.entries.is_empty() {
			return Err(Error::KeyNotFound);
		}
		let index = self.search(key);
		let (mut shrink, emptied) = match self.entries[index].child.clone() {
			Child::Leaf(leaf) => {
				let pin = leaf.acquire()?;
				let emptied = {
					let mut data = pin.write();
					data.delete(key)?;
					data.is_empty()
				};
				pin.mark_dirty()?;
				(Shrink::Shrank, emptied)
			}
			Child::Node(child) => {
				let shrink = IndexNode::delete(&child, key)?;
				let emptied = child.acquire()?.read().is_empty();
				(shrink, emptied)
			}
		};
		*leaf_changed = true;

		if index > 0 && matches!(shrink, Shrink::LostFirstLeaf { .. }) {
			// The removed leaf is still alive in `shrink`, so the link to it
			// can be followed.
			self.splice_after(index - 1)?;
			tracing::debug!(index, "spliced leaf chain past an escalated removal");
			shrink = Shrink::Shrank;
		}

		if emptied {
			if let Child::Leaf(leaf) = &self.entries[index].child {
				if index > 0 {
					self.splice_after(index - 1)?;
				} else {
					shrink = Shrink::LostFirstLeaf {
						removed: leaf.clone(),
					};
				}
			}
			self.entries.remove(index);
			if index == 0 {
				if let Some(first) = self.entries.first_mut() {
					first.key = None;
				}
				self.refresh_first_leaf()?;
			}
			*changed = true;
		} else if index == 0 && matches!(shrink, Shrink::LostFirstLeaf { .. }) {
			self.refresh_first_leaf()?;
			*changed = true;
		}
		Ok(shrink)
	}

	/// Makes the last leaf under entry `index` skip the leaf after it.
	fn splice_after(&self, index: usize) -> Result<()> {
		let last = self.entries[index].child.last_bucket()?;
		let pin = last.acquire()?;
		pin.write().delete_next_in_chain()?;
		pin.mark_dirty()
	}
}

// ---------------------------------------------------------------------------
// Range Ends
// ---------------------------------------------------------------------------

impl<K: Clone + Ord, V, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	/// Locates one end of a range in the subtree rooted at `node`.
	///
	/// With `low`, finds the smallest key `>= key`; otherwise the largest key
	/// `<= key`. Returns the leaf holding it and the offset inside that leaf.
	pub(crate) fn find_range_end<Q>(
		node: &NodeRef<K, V, IC, LC>,
		key: &Q,
		low: bool,
	) -> Result<Option<(BucketRef<K, V, LC>, usize)>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let pin = node.acquire()?;
		let data = pin.read();
		if data.entries.is_empty() {
			return Ok(None);
		}
		let index = data.search(key);
		let found = match &data.entries[index].child {
			Child::Node(child) => IndexNode::find_range_end(child, key, low)?,
			Child::Leaf(leaf) => leaf_range_end(leaf, key, low)?,
		};
		if found.is_some() || low || index == 0 {
			return Ok(found);
		}
		// Everything in the chosen subtree is above `key`; the answer is the
		// last key before it.
		let previous = data.entries[index - 1].child.last_bucket()?;
		let len = previous.acquire()?.read().len();
		Ok(len.checked_sub(1).map(|offset| (previous, offset)))
	}
}

fn leaf_range_end<K: Ord, V, Q, const LC: usize>(
	leaf: &BucketRef<K, V, LC>,
	key: &Q,
	low: bool,
) -> Result<Option<(BucketRef<K, V, LC>, usize)>>
where
	K: Borrow<Q>,
	Q: ?Sized + Ord,
{
	let next = {
		let pin = leaf.acquire()?;
		let data = pin.read();
		if let Some(offset) = data.find_range_end(key, low) {
			return Ok(Some((leaf.clone(), offset)));
		}
		if !low {
			return Ok(None);
		}
		data.next_bucket()?
	};
	// Every key here is below `key`; the next leaf in the chain starts above it.
	let Some(next) = next else {
		return Ok(None);
	};
	let empty = next.acquire()?.read().is_empty();
	Ok((!empty).then_some((next, 0)))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

impl<K: Clone, V: Clone, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	/// The logical state of this node.
	///
	/// A node whose only entry is a leaf without storage identity embeds that
	/// leaf's state directly.
	pub fn get_state(&self) -> Result<LiveState<K, V, IC, LC>> {
		match self.entries.as_slice() {
			[] => Ok(NodeState::Empty),
			[Entry {
				child: Child::Leaf(leaf),
				..
			}] if leaf.oid().is_none() => {
				let pin = leaf.acquire()?;
				let state = pin.read().get_state()?;
				Ok(NodeState::Inline(state))
			}
			entries => {
				let mut items = Vec::with_capacity(entries.len() * 2 - 1);
				for (i, entry) in entries.iter().enumerate() {
					if i > 0 {
						let key = entry.key.clone().ok_or(Error::Invariant("missing separator"))?;
						items.push(Slot::Key(key));
					}
					items.push(Slot::Child(match &entry.child {
						Child::Node(node) => ChildState::Node(node.clone()),
						Child::Leaf(leaf) => ChildState::Leaf(leaf.clone()),
					}));
				}
				let first_leaf = self
					.first_leaf()
					.ok_or(Error::Invariant("non-empty index node lost its first leaf"))?;
				Ok(NodeState::Children {
					items,
					first_leaf: Some(first_leaf),
				})
			}
		}
	}
}

impl<K, V, const IC: usize, const LC: usize> IndexNode<K, V, IC, LC> {
	fn check_leaf_kind(&self, leaf: &BucketRef<K, V, LC>) -> Result<()> {
		if leaf.peek(|b| b.kind) == self.kind {
			Ok(())
		} else {
			Err(Error::TypeMismatch("leaf kind does not match the tree"))
		}
	}

	fn embedded_leaf(
		&self,
		state: BucketState<K, V, BucketRef<K, V, LC>>,
	) -> Result<BucketRef<K, V, LC>> {
		let mut bucket = Bucket::new(self.kind);
		bucket.load(state)?;
		Ok(Arc::new(Persistent::new(bucket)))
	}

	fn load_children(
		&mut self,
		items: Vec<Slot<K, V, NodeRef<K, V, IC, LC>, BucketRef<K, V, LC>>>,
		first_leaf: Option<BucketRef<K, V, LC>>,
	) -> Result<()> {
		if items.is_empty() {
			return Ok(());
		}
		if items.len() % 2 == 0 {
			return Err(Error::Invariant("node state must start and end with a child"));
		}
		let mut key = None;
		let mut holds_nodes = None;
		for (i, slot) in items.into_iter().enumerate() {
			match (i % 2, slot) {
				(1, Slot::Key(k)) => key = Some(k),
				(0, Slot::Child(child)) => {
					let child = match child {
						ChildState::Node(node) => Child::Node(node),
						ChildState::Leaf(leaf) => {
							self.check_leaf_kind(&leaf)?;
							Child::Leaf(leaf)
						}
						ChildState::Embedded(state) => Child::Leaf(self.embedded_leaf(state)?),
					};
					let is_node = matches!(child, Child::Node(_));
					if *holds_nodes.get_or_insert(is_node) != is_node {
						return Err(Error::Invariant("node state mixes index nodes and leaves"));
					}
					self.entries.push(Entry {
						key: key.take(),
						child,
					});
				}
				_ => return Err(Error::Invariant("node state does not alternate children and keys")),
			}
		}

		let first_leaf = match (first_leaf, &self.entries[0].child) {
			(Some(leaf), _) => leaf,
			(None, Child::Leaf(leaf)) => leaf.clone(),
			(None, Child::Node(_)) => {
				return Err(Error::TypeMismatch("no first leaf in a non-empty index node"));
			}
		};
		self.check_leaf_kind(&first_leaf)?;
		self.first_leaf = Some(Arc::downgrade(&first_leaf));
		Ok(())
	}
}

impl<K, V, const IC: usize, const LC: usize> Activate for IndexNode<K, V, IC, LC> {
	type State = LiveState<K, V, IC, LC>;

	/// Replaces the entries with `state`. On error the node is left empty.
	fn load(&mut self, state: Self::State) -> Result<()> {
		self.clear();
		let result = match state {
			NodeState::Empty => Ok(()),
			NodeState::Inline(bucket) => self.embedded_leaf(bucket).map(|leaf| {
				self.first_leaf = Some(Arc::downgrade(&leaf));
				self.entries.push(Entry {
					key: None,
					child: Child::Leaf(leaf),
				});
			}),
			NodeState::Children {
				items,
				first_leaf,
			} => self.load_children(items, first_leaf),
		};
		if result.is_err() {
			self.clear();
		}
		result
	}

	fn unload(&mut self) {
		self.clear();
	}
}
