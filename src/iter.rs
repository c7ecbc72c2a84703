//! Range iterators over the leaf chain
use crate::bucket::{Bucket, BucketRef};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A position inside the leaf chain.
#[derive(Debug)]
struct Cursor<K, V, const LC: usize> {
	leaf: BucketRef<K, V, LC>,
	offset: usize,
}

impl<K, V, const LC: usize> Clone for Cursor<K, V, LC> {
	fn clone(&self) -> Self {
		Cursor {
			leaf: self.leaf.clone(),
			offset: self.offset,
		}
	}
}

impl<K, V, const LC: usize> Cursor<K, V, LC> {
	fn is_at(&self, other: &Cursor<K, V, LC>) -> bool {
		Arc::ptr_eq(&self.leaf, &other.leaf) && self.offset == other.offset
	}
}

/// Lazily walks the leaf chain from a start position to an end position, both
/// inclusive.
///
/// Leaves are acquired one entry at a time, so ghosts along the way are
/// loaded on demand and no pin outlives a call to `next`.
#[derive(Debug)]
pub struct Range<K, V, const LC: usize> {
	next: Option<Cursor<K, V, LC>>,
	last: Option<Cursor<K, V, LC>>,
}

impl<K, V, const LC: usize> Range<K, V, LC> {
	/// A range that yields nothing.
	pub(crate) fn empty() -> Range<K, V, LC> {
		Range {
			next: None,
			last: None,
		}
	}

	/// A range from `(start, start_offset)` to `(end, end_offset)`.
	pub(crate) fn new(
		start: (BucketRef<K, V, LC>, usize),
		end: (BucketRef<K, V, LC>, usize),
	) -> Range<K, V, LC> {
		Range {
			next: Some(Cursor {
				leaf: start.0,
				offset: start.1,
			}),
			last: Some(Cursor {
				leaf: end.0,
				offset: end.1,
			}),
		}
	}

	/// Reads the entry under the cursor and moves the cursor forward.
	///
	/// After an error the range is exhausted.
	fn step<R>(&mut self, read: impl FnOnce(&Bucket<K, V, LC>, usize) -> Option<R>) -> Option<Result<R>> {
		let cursor = self.next.take()?;
		Some(self.advance(cursor, read))
	}

	fn advance<R>(
		&mut self,
		cursor: Cursor<K, V, LC>,
		read: impl FnOnce(&Bucket<K, V, LC>, usize) -> Option<R>,
	) -> Result<R> {
		let pin = cursor.leaf.acquire()?;
		let data = pin.read();
		let item = read(&data, cursor.offset).ok_or(Error::Invariant("range cursor points past its leaf"))?;

		if self.last.as_ref().is_some_and(|last| cursor.is_at(last)) {
			return Ok(item);
		}
		if cursor.offset + 1 < data.len() {
			self.next = Some(Cursor {
				leaf: cursor.leaf.clone(),
				offset: cursor.offset + 1,
			});
			return Ok(item);
		}
		let mut following = data.next_bucket()?;
		while let Some(leaf) = following {
			let pin = leaf.acquire()?;
			let data = pin.read();
			if !data.is_empty() {
				drop(data);
				drop(pin);
				self.next = Some(Cursor {
					leaf,
					offset: 0,
				});
				break;
			}
			following = data.next_bucket()?;
		}
		Ok(item)
	}
}

impl<K: Clone, V: Clone, const LC: usize> Range<K, V, LC> {
	pub(crate) fn next_key(&mut self) -> Option<Result<K>> {
		self.step(|leaf, pos| leaf.key_at(pos).cloned())
	}

	pub(crate) fn next_value(&mut self) -> Option<Result<V>> {
		self.step(|leaf, pos| leaf.value_at(pos).cloned())
	}

	pub(crate) fn next_item(&mut self) -> Option<Result<(K, V)>> {
		self.step(|leaf, pos| Some((leaf.key_at(pos)?.clone(), leaf.value_at(pos)?.clone())))
	}
}

/// Iterator over keys in ascending order.
pub struct Keys<K, V, const LC: usize>(pub(crate) Range<K, V, LC>);

impl<K: Clone, V: Clone, const LC: usize> Iterator for Keys<K, V, LC> {
	type Item = Result<K>;

	fn next(&mut self) -> Option<Self::Item> {
		self.0.next_key()
	}
}

/// Iterator over values in ascending key order.
pub struct Values<K, V, const LC: usize>(pub(crate) Range<K, V, LC>);

impl<K: Clone, V: Clone, const LC: usize> Iterator for Values<K, V, LC> {
	type Item = Result<V>;

	fn next(&mut self) -> Option<Self::Item> {
		self.0.next_value()
	}
}

/// Iterator over `(key, value)` pairs in ascending key order.
pub struct Items<K, V, const LC: usize>(pub(crate) Range<K, V, LC>);

impl<K: Clone, V: Clone, const LC: usize> Iterator for Items<K, V, LC> {
	type Item = Result<(K, V)>;

	fn next(&mut self) -> Option<Self::Item> {
		self.0.next_item()
	}
}
