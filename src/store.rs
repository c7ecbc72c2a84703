//! # Object Store
//!
//! [`MemoryStorage`] keeps every revision of every stored object in memory.
//! [`Connection`] is one transaction's view of it: it hands out trees whose
//! nodes are ghosts, loads them on first use, and collects modified nodes for
//! [`Connection::commit`].
//!
//! ```text
//!   tree op ──► acquire(ghost) ──► Connection::load ──► MemoryStorage::load
//!      │
//!      ▼
//!   mark_dirty ──► Connection::register ──► commit ──► MemoryStorage::store
//!                                                  │
//!                                    stale write ──┴──► three-way merge
//! ```
//!
//! ## Records
//!
//! A stored object is a [`Record`]: the state of one index node or one leaf,
//! with every reference replaced by an [`Oid`]. Objects that were created
//! since the last commit get their oid while the records that reference them
//! are encoded. Only a tree's root may keep its single leaf inline; every
//! other leaf is stored on its own.
//!
//! ## Ownership
//!
//! The connection's cache holds a strong handle to every object it has ever
//! materialised, so leaf chain links stay valid while the nodes that own the
//! leaves are unloaded. Objects in turn hold the connection as their jar;
//! [`Connection::close`] breaks that cycle.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::activation::{ActivationState, Jar, Oid, Persistent, Serial};
use crate::bucket::{Bucket, BucketRef, LeafKind};
use crate::error::{ConflictReason, Error, Result};
use crate::merge::{merge_buckets, resolve_node_conflict};
use crate::node::{Child, IndexNode, LiveState, NodeRef};
use crate::state::{BucketRecord, BucketState, NodeRecord};
use crate::{GenericSet, GenericTree};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record<K, V> {
	/// An index node.
	Node { kind: LeafKind, state: NodeRecord<K, V> },
	/// A leaf.
	Bucket { kind: LeafKind, state: BucketRecord<K, V> },
}

impl<K, V> Record<K, V> {
	/// Kind of the leaves the record belongs to.
	pub fn kind(&self) -> LeafKind {
		match self {
			Record::Node {
				kind,
				..
			}
			| Record::Bucket {
				kind,
				..
			} => *kind,
		}
	}
}

// ---------------------------------------------------------------------------
// Memory Storage
// ---------------------------------------------------------------------------

struct Revisions<K, V> {
	next_oid: Oid,
	next_serial: Serial,
	objects: HashMap<Oid, Vec<(Serial, Record<K, V>)>>,
}

/// An object store that keeps the full revision history of every object.
pub struct MemoryStorage<K, V> {
	revisions: Mutex<Revisions<K, V>>,
	read_only: AtomicBool,
}

impl<K, V> Default for MemoryStorage<K, V> {
	fn default() -> Self {
		MemoryStorage {
			revisions: Mutex::new(Revisions {
				next_oid: 1,
				next_serial: 1,
				objects: HashMap::new(),
			}),
			read_only: AtomicBool::new(false),
		}
	}
}

impl<K, V> MemoryStorage<K, V> {
	/// Creates an empty, writable store.
	pub fn new() -> MemoryStorage<K, V> {
		MemoryStorage::default()
	}

	/// Switches the store between read-only and writable. A read-only store
	/// rejects every write and every registration of a modified object.
	pub fn set_read_only(&self, read_only: bool) {
		self.read_only.store(read_only, Ordering::Release);
	}

	/// Returns `true` if the store rejects writes.
	pub fn is_read_only(&self) -> bool {
		self.read_only.load(Ordering::Acquire)
	}

	/// Reserves a fresh oid.
	pub fn new_oid(&self) -> Oid {
		let mut revisions = self.revisions.lock();
		let oid = revisions.next_oid;
		revisions.next_oid += 1;
		oid
	}

	/// Serial of the latest stored revision of `oid`.
	pub fn last_serial(&self, oid: Oid) -> Option<Serial> {
		let revisions = self.revisions.lock();
		revisions.objects.get(&oid).and_then(|history| history.last()).map(|(serial, _)| *serial)
	}

	/// Number of stored revisions of `oid`.
	pub fn revision_count(&self, oid: Oid) -> usize {
		self.revisions.lock().objects.get(&oid).map_or(0, Vec::len)
	}
}

impl<K: Clone, V: Clone> MemoryStorage<K, V> {
	/// Latest revision of `oid` and its serial.
	pub fn load(&self, oid: Oid) -> Result<(Record<K, V>, Serial)> {
		let revisions = self.revisions.lock();
		revisions
			.objects
			.get(&oid)
			.and_then(|history| history.last())
			.map(|(serial, record)| (record.clone(), *serial))
			.ok_or(Error::MissingObject(oid))
	}

	/// The revision of `oid` written at `serial`.
	pub fn load_revision(&self, oid: Oid, serial: Serial) -> Result<Record<K, V>> {
		let revisions = self.revisions.lock();
		revisions
			.objects
			.get(&oid)
			.and_then(|history| history.iter().find(|(s, _)| *s == serial))
			.map(|(_, record)| record.clone())
			.ok_or(Error::MissingObject(oid))
	}

	/// Writes a batch of records, each based on the serial it was loaded at
	/// (`0` for objects that were never stored).
	///
	/// Either every record is written under one new serial, or none is: if any
	/// object was rewritten since its base serial the whole batch fails with
	/// [`ConflictReason::StaleWrite`].
	pub fn store(&self, writes: Vec<(Oid, Serial, Record<K, V>)>) -> Result<Serial> {
		if self.is_read_only() {
			return Err(Error::ReadOnly);
		}
		let mut revisions = self.revisions.lock();
		for (oid, base, _) in &writes {
			let current = revisions
				.objects
				.get(oid)
				.and_then(|history| history.last())
				.map_or(0, |(serial, _)| *serial);
			if current != *base {
				return Err(Error::Conflict(ConflictReason::StaleWrite {
					oid: *oid,
					base: *base,
					current,
				}));
			}
		}
		let serial = revisions.next_serial;
		revisions.next_serial += 1;
		for (oid, _, record) in writes {
			revisions.objects.entry(oid).or_default().push((serial, record));
		}
		Ok(serial)
	}
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One record ready to be written, with the live object it came from.
struct Write<K, V, const IC: usize, const LC: usize> {
	object: Child<K, V, IC, LC>,
	oid: Oid,
	base: Serial,
	record: Record<K, V>,
	merged: bool,
}

/// A transaction's view of a [`MemoryStorage`].
///
/// The connection is the jar of every object it loads or stores: ghosts load
/// through it and modified objects register with it.
pub struct Connection<K, V, const IC: usize, const LC: usize> {
	storage: Arc<MemoryStorage<K, V>>,
	this: Weak<Connection<K, V, IC, LC>>,
	cache: Mutex<HashMap<Oid, Child<K, V, IC, LC>>>,
	registered: Mutex<Vec<Child<K, V, IC, LC>>>,
	roots: Mutex<HashSet<Oid>>,
}

impl<K, V, const IC: usize, const LC: usize> Connection<K, V, IC, LC>
where
	K: Clone + Ord + Send + Sync + 'static,
	V: Clone + PartialEq + Send + Sync + 'static,
{
	/// Opens a connection to `storage`.
	pub fn new(storage: Arc<MemoryStorage<K, V>>) -> Arc<Connection<K, V, IC, LC>> {
		Arc::new_cyclic(|this| Connection {
			storage,
			this: this.clone(),
			cache: Mutex::new(HashMap::new()),
			registered: Mutex::new(Vec::new()),
			roots: Mutex::new(HashSet::new()),
		})
	}

	/// The underlying store.
	pub fn storage(&self) -> &Arc<MemoryStorage<K, V>> {
		&self.storage
	}

	/// Number of objects materialised by this connection.
	pub fn cache_size(&self) -> usize {
		self.cache.lock().len()
	}

	/// Number of objects waiting for the next commit.
	pub fn pending(&self) -> usize {
		self.registered.lock().len()
	}

	fn node_jar(&self) -> Result<Arc<dyn Jar<IndexNode<K, V, IC, LC>>>> {
		let this: Arc<dyn Jar<IndexNode<K, V, IC, LC>>> =
			self.this.upgrade().ok_or(Error::Invariant("connection was dropped"))?;
		Ok(this)
	}

	fn bucket_jar(&self) -> Result<Arc<dyn Jar<Bucket<K, V, LC>>>> {
		let this: Arc<dyn Jar<Bucket<K, V, LC>>> =
			self.this.upgrade().ok_or(Error::Invariant("connection was dropped"))?;
		Ok(this)
	}

	// -----------------------------------------------------------------------
	// Trees
	// -----------------------------------------------------------------------

	/// Stores `tree` through this connection at the next commit and returns
	/// the oid of its root.
	pub fn add_tree(&self, tree: &GenericTree<K, V, IC, LC>) -> Result<Oid> {
		self.add_root(tree.root())
	}

	/// Opens the tree whose root is stored under `oid`.
	pub fn open_tree(&self, oid: Oid) -> Result<GenericTree<K, V, IC, LC>> {
		self.open_root(oid, LeafKind::Mapping).map(GenericTree::from_root)
	}

	fn add_root(&self, root: &NodeRef<K, V, IC, LC>) -> Result<Oid> {
		if let Some(oid) = root.oid() {
			return match self.cache.lock().get(&oid) {
				Some(Child::Node(cached)) if Arc::ptr_eq(cached, root) => Ok(oid),
				_ => Err(Error::Invariant("tree is already stored through another connection")),
			};
		}
		if self.storage.is_read_only() {
			return Err(Error::ReadOnly);
		}
		let oid = self.storage.new_oid();
		root.assign(oid, self.node_jar()?);
		self.cache.lock().insert(oid, Child::Node(root.clone()));
		self.roots.lock().insert(oid);
		root.mark_dirty()?;
		tracing::debug!(oid, "added tree");
		Ok(oid)
	}

	fn open_root(&self, oid: Oid, kind: LeafKind) -> Result<NodeRef<K, V, IC, LC>> {
		match self.storage.load(oid)?.0 {
			Record::Node {
				kind: stored,
				..
			} if stored == kind => {}
			Record::Node {
				..
			} => return Err(Error::TypeMismatch("stored tree has a different leaf kind")),
			Record::Bucket {
				..
			} => return Err(Error::TypeMismatch("stored object is not an index node")),
		}
		let root = self.node_ghost(oid, kind)?;
		drop(root.acquire()?);
		self.roots.lock().insert(oid);
		Ok(root)
	}

	// -----------------------------------------------------------------------
	// Ghosts
	// -----------------------------------------------------------------------

	// A cached object referenced by a freshly decoded state counts as used.
	// The cache lock is dropped before touching the object.

	fn node_ghost(&self, oid: Oid, kind: LeafKind) -> Result<NodeRef<K, V, IC, LC>> {
		let cached = {
			let mut cache = self.cache.lock();
			match cache.get(&oid) {
				Some(Child::Node(node)) => node.clone(),
				Some(Child::Leaf(_)) => return Err(Error::TypeMismatch("a leaf is referenced as an index node")),
				None => {
					let node = Arc::new(Persistent::ghost(IndexNode::new(kind), oid, self.node_jar()?));
					cache.insert(oid, Child::Node(node.clone()));
					return Ok(node);
				}
			}
		};
		cached.mark_accessed();
		Ok(cached)
	}

	fn leaf_ghost(&self, oid: Oid, kind: LeafKind) -> Result<BucketRef<K, V, LC>> {
		let cached = {
			let mut cache = self.cache.lock();
			match cache.get(&oid) {
				Some(Child::Leaf(leaf)) => leaf.clone(),
				Some(Child::Node(_)) => return Err(Error::TypeMismatch("an index node is referenced as a leaf")),
				None => {
					let leaf = Arc::new(Persistent::ghost(Bucket::new(kind), oid, self.bucket_jar()?));
					cache.insert(oid, Child::Leaf(leaf.clone()));
					return Ok(leaf);
				}
			}
		};
		cached.mark_accessed();
		Ok(cached)
	}

	/// Turns a stored node record into a live state whose references are
	/// ghosts.
	fn decode_node(&self, kind: LeafKind, state: NodeRecord<K, V>) -> Result<LiveState<K, V, IC, LC>> {
		state.check_order()?;
		state.try_map_refs(|oid| self.node_ghost(oid, kind), |oid| self.leaf_ghost(oid, kind))
	}

	// -----------------------------------------------------------------------
	// Commit
	// -----------------------------------------------------------------------

	/// Gives `node` an oid if it has none yet and queues it for writing.
	fn adopt_node(&self, node: NodeRef<K, V, IC, LC>) -> Result<Oid> {
		if let Some(oid) = node.oid() {
			return Ok(oid);
		}
		let oid = self.storage.new_oid();
		node.assign(oid, self.node_jar()?);
		self.cache.lock().insert(oid, Child::Node(node.clone()));
		node.mark_dirty()?;
		Ok(oid)
	}

	/// Gives `leaf` an oid if it has none yet and queues it for writing.
	fn adopt_leaf(&self, leaf: BucketRef<K, V, LC>) -> Result<Oid> {
		if let Some(oid) = leaf.oid() {
			return Ok(oid);
		}
		let oid = self.storage.new_oid();
		leaf.assign(oid, self.bucket_jar()?);
		self.cache.lock().insert(oid, Child::Leaf(leaf.clone()));
		leaf.mark_dirty()?;
		Ok(oid)
	}

	fn encode(&self, object: &Child<K, V, IC, LC>) -> Result<(Oid, Serial, Record<K, V>)> {
		match object {
			Child::Node(node) => {
				let oid = node.oid().ok_or(Error::Invariant("registered node has no oid"))?;
				let root = self.roots.lock().contains(&oid);
				let pin = node.acquire()?;
				let (kind, state) = {
					let data = pin.read();
					if !root {
						for entry in &data.entries {
							if let Child::Leaf(leaf) = &entry.child {
								self.adopt_leaf(leaf.clone())?;
							}
						}
					}
					(data.kind(), data.get_state()?)
				};
				drop(pin);
				let state = state.try_map_refs(|n| self.adopt_node(n), |b| self.adopt_leaf(b))?;
				Ok((
					oid,
					node.serial(),
					Record::Node {
						kind,
						state,
					},
				))
			}
			Child::Leaf(leaf) => {
				let oid = leaf.oid().ok_or(Error::Invariant("registered leaf has no oid"))?;
				let pin = leaf.acquire()?;
				let (kind, state) = {
					let data = pin.read();
					(data.kind(), data.get_state()?)
				};
				drop(pin);
				let state = state.try_map_refs(&mut |b| self.adopt_leaf(b))?;
				Ok((
					oid,
					leaf.serial(),
					Record::Bucket {
						kind,
						state,
					},
				))
			}
		}
	}

	/// Merges `mine` with whatever was stored after `base`.
	fn resolve(&self, oid: Oid, base: Serial, mine: Record<K, V>) -> Result<Record<K, V>> {
		let (theirs, _) = self.storage.load(oid)?;
		let ancestor = self.storage.load_revision(oid, base)?;
		if ancestor.kind() != mine.kind() || theirs.kind() != mine.kind() {
			return Err(Error::Conflict(ConflictReason::Unmergeable));
		}
		match (ancestor, mine, theirs) {
			(
				Record::Node {
					kind,
					state: ancestor,
				},
				Record::Node {
					state: mine,
					..
				},
				Record::Node {
					state: theirs,
					..
				},
			) => Ok(Record::Node {
				kind,
				state: resolve_node_conflict(ancestor, mine, theirs)?,
			}),
			(
				Record::Bucket {
					kind,
					state: ancestor,
				},
				Record::Bucket {
					state: mine,
					..
				},
				Record::Bucket {
					state: theirs,
					..
				},
			) => Ok(Record::Bucket {
				kind,
				state: merge_buckets(ancestor, mine, theirs)?,
			}),
			_ => Err(Error::Conflict(ConflictReason::Unmergeable)),
		}
	}

	/// Encodes every registered object, and every object that became
	/// reachable from one, into records.
	fn collect(&self, taken: &mut Vec<Child<K, V, IC, LC>>) -> Result<Vec<Write<K, V, IC, LC>>> {
		let mut writes = Vec::new();
		loop {
			let batch = mem::take(&mut *self.registered.lock());
			if batch.is_empty() {
				return Ok(writes);
			}
			taken.extend(batch.iter().cloned());
			for object in batch {
				let (oid, base, record) = self.encode(&object)?;
				let (base, record, merged) = match self.storage.last_serial(oid) {
					Some(current) if current != base => {
						let record = self.resolve(oid, base, record)?;
						tracing::debug!(oid, base, current, "merged concurrent write");
						(current, record, true)
					}
					_ => (base, record, false),
				};
				writes.push(Write {
					object,
					oid,
					base,
					record,
					merged,
				});
			}
		}
	}

	/// Writes every modified object back to the store and returns the serial
	/// of the new revision.
	///
	/// Objects that another connection rewrote in the meantime are merged with
	/// that revision when both are small enough; otherwise the commit fails
	/// with [`Error::Conflict`], nothing is written, and the modified objects
	/// stay queued until [`Connection::abort`].
	pub fn commit(&self) -> Result<Serial> {
		let mut taken = Vec::new();
		let result = self.write_back(&mut taken);
		if result.is_err() {
			let mut registered = self.registered.lock();
			taken.append(&mut registered);
			*registered = taken;
		}
		result
	}

	fn write_back(&self, taken: &mut Vec<Child<K, V, IC, LC>>) -> Result<Serial> {
		let writes = self.collect(taken)?;
		if writes.is_empty() {
			return Ok(0);
		}
		let (batch, objects): (Vec<_>, Vec<_>) = writes
			.into_iter()
			.map(|w| ((w.oid, w.base, w.record), (w.object, w.merged)))
			.unzip();
		let count = batch.len();
		let serial = self.storage.store(batch)?;
		for (object, merged) in objects {
			match &object {
				Child::Node(node) => {
					node.saved(serial);
					// The live content predates the merge; reload it.
					if merged {
						node.deactivate();
					}
				}
				Child::Leaf(leaf) => {
					leaf.saved(serial);
					if merged {
						leaf.deactivate();
					}
				}
			}
		}
		taken.clear();
		tracing::debug!(objects = count, serial, "committed");
		Ok(serial)
	}

	/// Drops every pending modification.
	///
	/// Stored objects are turned back into ghosts and reload their committed
	/// state on next use. Objects that were never stored lose their oid and
	/// can be added again. An object pinned by a running operation keeps its
	/// content and stays queued for the next commit.
	pub fn abort(&self) {
		let registered = mem::take(&mut *self.registered.lock());
		let count = registered.len();
		let mut pinned = Vec::new();
		for object in registered {
			let (oid, serial) = match &object {
				Child::Node(node) => (node.oid(), node.serial()),
				Child::Leaf(leaf) => (leaf.oid(), leaf.serial()),
			};
			if serial == 0 {
				match &object {
					Child::Node(node) => node.forget(),
					Child::Leaf(leaf) => leaf.forget(),
				}
				if let Some(oid) = oid {
					self.cache.lock().remove(&oid);
					self.roots.lock().remove(&oid);
				}
				continue;
			}
			let reverted = match &object {
				Child::Node(node) => node.invalidate(),
				Child::Leaf(leaf) => leaf.invalidate(),
			};
			if !reverted {
				tracing::warn!(oid, "pinned object keeps its changes");
				pinned.push(object);
			}
		}
		self.registered.lock().extend(pinned);
		tracing::debug!(objects = count, "aborted");
	}

	/// Turns every clean, unpinned cached object into a ghost and returns how
	/// many are ghosts afterwards.
	pub fn minimize(&self) -> usize {
		let objects: Vec<Child<K, V, IC, LC>> = self.cache.lock().values().cloned().collect();
		let ghosts = objects
			.iter()
			.filter(|object| match object {
				Child::Node(node) => node.deactivate(),
				Child::Leaf(leaf) => leaf.deactivate(),
			})
			.count();
		tracing::debug!(ghosts, cached = objects.len(), "minimized cache");
		ghosts
	}

	/// Turns least recently used objects into ghosts until at most `target`
	/// cached objects are loaded. Changed and pinned objects are skipped.
	/// Returns how many objects were deactivated.
	pub fn shrink(&self, target: usize) -> usize {
		let mut loaded: Vec<(u64, Child<K, V, IC, LC>)> = self
			.cache
			.lock()
			.values()
			.filter_map(|object| {
				let (state, accessed) = match object {
					Child::Node(node) => (node.state(), node.last_accessed()),
					Child::Leaf(leaf) => (leaf.state(), leaf.last_accessed()),
				};
				(state == ActivationState::Loaded).then(|| (accessed, object.clone()))
			})
			.collect();
		loaded.sort_by_key(|(accessed, _)| *accessed);
		let excess = loaded.len().saturating_sub(target);
		let mut deactivated = 0;
		for (_, object) in &loaded {
			if deactivated == excess {
				break;
			}
			let ghost = match object {
				Child::Node(node) => node.deactivate(),
				Child::Leaf(leaf) => leaf.deactivate(),
			};
			if ghost {
				deactivated += 1;
			}
		}
		tracing::debug!(deactivated, loaded = loaded.len(), target, "shrunk cache");
		deactivated
	}

	/// Forgets every cached object and pending modification.
	///
	/// Trees opened through the connection keep working for objects that are
	/// already loaded, but ghosts can no longer be reached through the cache.
	pub fn close(&self) {
		self.registered.lock().clear();
		self.roots.lock().clear();
		let cache = mem::take(&mut *self.cache.lock());
		tracing::debug!(cached = cache.len(), "closed connection");
		drop(cache);
	}
}

impl<K, const IC: usize, const LC: usize> Connection<K, (), IC, LC>
where
	K: Clone + Ord + Send + Sync + 'static,
{
	/// Stores `set` through this connection at the next commit and returns the
	/// oid of its root.
	pub fn add_set(&self, set: &GenericSet<K, IC, LC>) -> Result<Oid> {
		self.add_root(set.tree().root())
	}

	/// Opens the set whose root is stored under `oid`.
	pub fn open_set(&self, oid: Oid) -> Result<GenericSet<K, IC, LC>> {
		self.open_root(oid, LeafKind::Set).map(|root| GenericSet::from_tree(GenericTree::from_root(root)))
	}
}

impl<K, V, const IC: usize, const LC: usize> Jar<IndexNode<K, V, IC, LC>> for Connection<K, V, IC, LC>
where
	K: Clone + Ord + Send + Sync + 'static,
	V: Clone + PartialEq + Send + Sync + 'static,
{
	fn load(&self, oid: Oid) -> Result<(LiveState<K, V, IC, LC>, Serial)> {
		let (record, serial) = self.storage.load(oid)?;
		let Record::Node {
			kind,
			state,
		} = record
		else {
			return Err(Error::TypeMismatch("stored object is not an index node"));
		};
		let cached = self.cache.lock().get(&oid).cloned();
		if let Some(Child::Node(node)) = cached {
			if node.peek(|n| n.kind()) != kind {
				return Err(Error::TypeMismatch("stored node has a different leaf kind"));
			}
		}
		Ok((self.decode_node(kind, state)?, serial))
	}

	fn register(&self, object: Arc<Persistent<IndexNode<K, V, IC, LC>>>) -> Result<()> {
		if self.storage.is_read_only() {
			return Err(Error::ReadOnly);
		}
		self.registered.lock().push(Child::Node(object));
		Ok(())
	}
}

impl<K, V, const IC: usize, const LC: usize> Jar<Bucket<K, V, LC>> for Connection<K, V, IC, LC>
where
	K: Clone + Ord + Send + Sync + 'static,
	V: Clone + PartialEq + Send + Sync + 'static,
{
	fn load(&self, oid: Oid) -> Result<(BucketState<K, V, BucketRef<K, V, LC>>, Serial)> {
		let (record, serial) = self.storage.load(oid)?;
		let Record::Bucket {
			kind,
			state,
		} = record
		else {
			return Err(Error::TypeMismatch("stored object is not a leaf"));
		};
		state.items.check_sorted()?;
		let state = state.try_map_refs(&mut |next| self.leaf_ghost(next, kind))?;
		Ok((state, serial))
	}

	fn register(&self, object: BucketRef<K, V, LC>) -> Result<()> {
		if self.storage.is_read_only() {
			return Err(Error::ReadOnly);
		}
		self.registered.lock().push(Child::Leaf(object));
		Ok(())
	}
}
