//! # Leaf Buckets
//!
//! A bucket is a sorted run of keys (with values for mapping trees) plus a link
//! to the following bucket. The links of all buckets form the **leaf chain**, a
//! singly linked list that visits every key of the tree in order, independent
//! of how the index nodes above are shaped.
//!
//! ```text
//!        first_leaf
//!            │
//!            ▼
//!      ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//!      │ 1  3  5  │ ───► │ 8  9     │ ───► │ 12 15 17 │ ───► ∅
//!      └──────────┘      └──────────┘      └──────────┘
//! ```
//!
//! A bucket is owned by exactly one parent entry. The `next` link is a weak
//! handle: the chain never keeps a bucket alive on its own.

use std::borrow::Borrow;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::activation::{Activate, Persistent};
use crate::error::{Error, Result};
use crate::node::Growth;
use crate::state::{BucketItems, BucketState};

/// Owning handle to a bucket.
pub type BucketRef<K, V, const LC: usize> = Arc<Persistent<Bucket<K, V, LC>>>;

/// Non-owning handle to a bucket, used for chain links and cached first leaves.
pub type WeakBucket<K, V, const LC: usize> = Weak<Persistent<Bucket<K, V, LC>>>;

/// Whether leaves store values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafKind {
	/// Keys with values.
	Mapping,
	/// Keys only.
	Set,
}

/// A leaf of the tree.
pub struct Bucket<K, V, const LC: usize> {
	pub(crate) kind: LeafKind,
	pub(crate) keys: SmallVec<[K; LC]>,
	/// Parallel to `keys` for mapping buckets, always empty for sets.
	pub(crate) values: SmallVec<[V; LC]>,
	pub(crate) next: Option<WeakBucket<K, V, LC>>,
}

impl<K: fmt::Debug, V: fmt::Debug, const LC: usize> fmt::Debug for Bucket<K, V, LC> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Bucket")
			.field("kind", &self.kind)
			.field("keys", &self.keys)
			.field("values", &self.values)
			.field("linked", &self.next.is_some())
			.finish()
	}
}

impl<K, V, const LC: usize> Bucket<K, V, LC> {
	/// Creates an empty, unlinked bucket.
	pub fn new(kind: LeafKind) -> Bucket<K, V, LC> {
		Bucket {
			kind,
			keys: SmallVec::new(),
			values: SmallVec::new(),
			next: None,
		}
	}

	/// Whether this bucket stores values.
	#[inline]
	pub fn kind(&self) -> LeafKind {
		self.kind
	}

	/// Number of keys.
	#[inline]
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	/// Returns `true` if the bucket holds no keys.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Sorted keys.
	#[inline]
	pub fn keys(&self) -> &[K] {
		&self.keys
	}

	#[inline]
	pub(crate) fn key_at(&self, pos: usize) -> Option<&K> {
		self.keys.get(pos)
	}

	#[inline]
	pub(crate) fn value_at(&self, pos: usize) -> Option<&V> {
		self.values.get(pos)
	}

	/// Returns the next bucket in the chain.
	///
	/// A link whose target was dropped means the chain was not spliced when a
	/// bucket was removed, which is a structural error.
	pub(crate) fn next_bucket(&self) -> Result<Option<BucketRef<K, V, LC>>> {
		match &self.next {
			None => Ok(None),
			Some(weak) => {
				weak.upgrade().map(Some).ok_or(Error::Invariant("leaf chain links a dropped leaf"))
			}
		}
	}

	/// Points the chain link at `next`.
	pub(crate) fn link(&mut self, next: Option<&BucketRef<K, V, LC>>) {
		self.next = next.map(Arc::downgrade);
	}

	/// Unlinks the following bucket: the link is moved to the bucket after it.
	///
	/// The following bucket is loaded if it is a ghost.
	pub fn delete_next_in_chain(&mut self) -> Result<()> {
		let Some(next) = self.next_bucket()? else {
			return Ok(());
		};
		let successor = {
			let pin = next.acquire()?;
			let data = pin.read();
			data.next.clone()
		};
		self.next = successor;
		Ok(())
	}

	/// Removes every key.
	pub(crate) fn clear(&mut self) {
		self.keys.clear();
		self.values.clear();
	}
}

impl<K: Ord, V, const LC: usize> Bucket<K, V, LC> {
	#[inline]
	fn search<Q>(&self, key: &Q) -> std::result::Result<usize, usize>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.keys.binary_search_by(|stored| stored.borrow().cmp(key))
	}

	/// Returns `true` if `key` is stored here.
	pub fn contains<Q>(&self, key: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.search(key).is_ok()
	}

	/// Returns the value stored under `key`.
	pub fn get<Q>(&self, key: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.search(key).ok().and_then(|pos| self.values.get(pos))
	}

	/// Inserts or replaces `key`.
	///
	/// Set buckets ignore `value`; mapping buckets require one. With `unique`
	/// an existing key is left untouched. The returned [`Growth`] tells the
	/// parent whether the bucket now holds more than `LC` keys.
	pub fn set(&mut self, key: K, value: Option<V>, unique: bool) -> Result<Growth> {
		match (self.kind, self.search(&key)) {
			(LeafKind::Set, Ok(_)) => Ok(Growth::Unchanged),
			(LeafKind::Set, Err(pos)) => {
				self.keys.insert(pos, key);
				Ok(Growth::Grew {
					overflowed: self.keys.len() > LC,
				})
			}
			(LeafKind::Mapping, found) => {
				let value = value.ok_or(Error::Invariant("mapping leaf insert without a value"))?;
				match found {
					Ok(_) if unique => Ok(Growth::Unchanged),
					Ok(pos) => {
						self.values[pos] = value;
						Ok(Growth::Changed)
					}
					Err(pos) => {
						self.keys.insert(pos, key);
						self.values.insert(pos, value);
						Ok(Growth::Grew {
							overflowed: self.keys.len() > LC,
						})
					}
				}
			}
		}
	}

	/// Removes `key`, returning its value for mapping buckets.
	pub fn delete<Q>(&mut self, key: &Q) -> Result<Option<V>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let pos = self.search(key).map_err(|_| Error::KeyNotFound)?;
		self.keys.remove(pos);
		Ok(match self.kind {
			LeafKind::Mapping => Some(self.values.remove(pos)),
			LeafKind::Set => None,
		})
	}

	/// Moves the keys from `index` onward into a new bucket linked right after
	/// this one.
	///
	/// Without an index, or with one that is out of range, the split happens at
	/// the midpoint.
	pub fn split(&mut self, index: Option<usize>) -> Result<BucketRef<K, V, LC>> {
		let len = self.keys.len();
		if len < 2 {
			return Err(Error::Invariant("split of a leaf with fewer than two keys"));
		}
		let index = index.filter(|&i| i < len).unwrap_or(len / 2);
		if index == 0 {
			return Err(Error::Invariant("leaf split would leave an empty half"));
		}

		let mut sibling = Bucket::new(self.kind);
		sibling.keys.extend(self.keys.drain(index..));
		if self.kind == LeafKind::Mapping {
			sibling.values.extend(self.values.drain(index..));
		}
		sibling.next = self.next.take();

		let sibling = Arc::new(Persistent::new(sibling));
		self.next = Some(Arc::downgrade(&sibling));
		tracing::trace!(left = self.keys.len(), right = len - index, "split leaf");
		Ok(sibling)
	}

	/// Locates one end of a range inside this bucket.
	///
	/// With `low` returns the position of the smallest key `>= key`, otherwise
	/// the position of the largest key `<= key`.
	pub fn find_range_end<Q>(&self, key: &Q, low: bool) -> Option<usize>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		match (self.search(key), low) {
			(Ok(pos), _) => Some(pos),
			(Err(pos), true) => (pos < self.keys.len()).then_some(pos),
			(Err(pos), false) => pos.checked_sub(1),
		}
	}
}

impl<K: Clone, V: Clone, const LC: usize> Bucket<K, V, LC> {
	/// Content of this bucket with a live chain link.
	pub fn get_state(&self) -> Result<BucketState<K, V, BucketRef<K, V, LC>>> {
		let items = match self.kind {
			LeafKind::Set => BucketItems::Keys(self.keys.to_vec()),
			LeafKind::Mapping => BucketItems::Pairs(
				self.keys.iter().cloned().zip(self.values.iter().cloned()).collect(),
			),
		};
		Ok(BucketState {
			items,
			next: self.next_bucket()?,
		})
	}
}

impl<K, V, const LC: usize> Activate for Bucket<K, V, LC> {
	type State = BucketState<K, V, BucketRef<K, V, LC>>;

	/// Key order is checked by whoever decodes the state; see
	/// [`BucketItems::check_sorted`].
	fn load(&mut self, state: Self::State) -> Result<()> {
		self.clear();
		match (self.kind, state.items) {
			(LeafKind::Set, BucketItems::Keys(keys)) => self.keys.extend(keys),
			(LeafKind::Mapping, BucketItems::Pairs(pairs)) => {
				for (key, value) in pairs {
					self.keys.push(key);
					self.values.push(value);
				}
			}
			(LeafKind::Set, BucketItems::Pairs(_)) => {
				return Err(Error::TypeMismatch("set leaf loaded with values"));
			}
			(LeafKind::Mapping, BucketItems::Keys(_)) => {
				return Err(Error::TypeMismatch("mapping leaf loaded without values"));
			}
		}
		self.link(state.next.as_ref());
		Ok(())
	}

	fn unload(&mut self) {
		self.clear();
		self.next = None;
	}
}
