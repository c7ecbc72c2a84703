//! # Ghost Activation
//!
//! Every node of a persistent tree is wrapped in a [`Persistent`] object. A
//! persistent object is either **loaded** (its content is in memory) or a
//! **ghost** (only its identity is known; the content lives in an object store
//! and is fetched on first use).
//!
//! ```text
//!            acquire (load through jar)
//!    ┌───────┐ ─────────────────────────► ┌────────┐
//!    │ Ghost │                            │ Loaded │ ◄─┐ acquire / release
//!    └───────┘ ◄───────────────────────── └────────┘ ──┘ (pin count)
//!              deactivate (unpinned, clean, stored)
//! ```
//!
//! Two counters are kept apart on purpose:
//!
//! - The `Arc` strong count says who **owns** the object (its parent entry).
//! - The pin count says who is **using** the content right now. A pinned object
//!   is never turned back into a ghost.
//!
//! Access always goes through [`Persistent::acquire`], which returns a [`Pin`].
//! Dropping the pin releases the object on every exit path, including `?`
//! returns and panics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Identity of an object in the object store.
pub type Oid = u64;

/// Version stamp assigned by the object store on every write of an object.
pub type Serial = u64;

/// Logical clock used to record the last access of an object.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Activation state of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
	/// Only the identity is in memory; content must be loaded before use.
	Ghost,
	/// Content is in memory.
	Loaded,
}

/// Content that can be loaded into, and discarded from, a persistent object.
pub trait Activate: Sized {
	/// The logical state the object store hands back for this content.
	type State;

	/// Replaces the current content with `state`.
	fn load(&mut self, state: Self::State) -> Result<()>;

	/// Discards the content, keeping only what a ghost needs to reload itself.
	fn unload(&mut self);
}

/// The object store side of the activation protocol.
///
/// A jar loads ghost content and collects the objects modified since the last
/// write-back. Loading may block on I/O; registration must not.
pub trait Jar<T: Activate>: Send + Sync {
	/// Returns the current stored state of `oid` together with its serial.
	fn load(&self, oid: Oid) -> Result<(T::State, Serial)>;

	/// Queues `object` to be written back at the next commit.
	fn register(&self, object: Arc<Persistent<T>>) -> Result<()>;
}

struct Meta<T: Activate> {
	oid: Option<Oid>,
	jar: Option<Arc<dyn Jar<T>>>,
	state: ActivationState,
	pins: usize,
	changed: bool,
	serial: Serial,
	accessed: u64,
}

/// A node whose content can be unloaded and transparently reloaded.
pub struct Persistent<T: Activate> {
	meta: Mutex<Meta<T>>,
	data: RwLock<T>,
}

impl<T: Activate> fmt::Debug for Persistent<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let meta = self.meta.lock();
		f.debug_struct("Persistent")
			.field("oid", &meta.oid)
			.field("state", &meta.state)
			.field("pins", &meta.pins)
			.field("changed", &meta.changed)
			.field("serial", &meta.serial)
			.finish()
	}
}

impl<T: Activate> Persistent<T> {
	/// Creates a loaded object with no storage identity.
	pub fn new(data: T) -> Persistent<T> {
		Persistent {
			meta: Mutex::new(Meta {
				oid: None,
				jar: None,
				state: ActivationState::Loaded,
				pins: 0,
				changed: false,
				serial: 0,
				accessed: 0,
			}),
			data: RwLock::new(data),
		}
	}

	/// Creates a ghost for `oid`. `empty` is the unloaded content; it must carry
	/// whatever the object needs to know before it is loaded (its leaf kind).
	pub fn ghost(empty: T, oid: Oid, jar: Arc<dyn Jar<T>>) -> Persistent<T> {
		Persistent {
			meta: Mutex::new(Meta {
				oid: Some(oid),
				jar: Some(jar),
				state: ActivationState::Ghost,
				pins: 0,
				changed: false,
				serial: 0,
				accessed: 0,
			}),
			data: RwLock::new(empty),
		}
	}

	/// Loads the object if it is a ghost and pins it.
	///
	/// A failed load leaves the object a ghost and takes no pin, so there is
	/// nothing to release on the error path.
	pub fn acquire(self: &Arc<Self>) -> Result<Pin<'_, T>> {
		let mut meta = self.meta.lock();
		if meta.state == ActivationState::Ghost {
			let (Some(oid), Some(jar)) = (meta.oid, meta.jar.clone()) else {
				return Err(Error::Invariant("ghost object has no jar to load from"));
			};
			let (state, serial) = jar.load(oid)?;
			{
				let mut data = self.data.write();
				if let Err(err) = data.load(state) {
					data.unload();
					return Err(err);
				}
			}
			meta.state = ActivationState::Loaded;
			meta.serial = serial;
			tracing::debug!(oid, serial, "activated ghost");
		}
		meta.pins += 1;
		Ok(Pin {
			object: self,
		})
	}

	/// Unpins the object and records the access.
	fn release(&self) {
		let mut meta = self.meta.lock();
		meta.pins = meta.pins.saturating_sub(1);
		meta.accessed = ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed) + 1;
	}

	/// Records an access without pinning.
	pub fn mark_accessed(&self) {
		self.meta.lock().accessed = ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed) + 1;
	}

	/// Registers the object with its jar for write-back.
	///
	/// Objects without storage identity are written as part of whichever
	/// stored object references them, so for them this is a no-op.
	pub fn mark_dirty(self: &Arc<Self>) -> Result<()> {
		let jar = {
			let meta = self.meta.lock();
			if meta.changed {
				return Ok(());
			}
			match (meta.oid, meta.jar.as_ref()) {
				(Some(_), Some(jar)) => jar.clone(),
				_ => return Ok(()),
			}
		};
		jar.register(self.clone())?;
		self.meta.lock().changed = true;
		Ok(())
	}

	/// Turns a loaded object back into a ghost.
	///
	/// Only clean, unpinned objects that can be reloaded from a jar are
	/// deactivated. Returns whether the object is a ghost afterwards.
	pub fn deactivate(&self) -> bool {
		let mut meta = self.meta.lock();
		if meta.state == ActivationState::Ghost {
			return true;
		}
		if meta.pins > 0 || meta.changed || meta.oid.is_none() || meta.jar.is_none() {
			return false;
		}
		self.data.write().unload();
		meta.state = ActivationState::Ghost;
		tracing::debug!(oid = meta.oid, "deactivated object");
		true
	}

	/// Current activation state.
	pub fn state(&self) -> ActivationState {
		self.meta.lock().state
	}

	/// Storage identity, if the object has been stored.
	pub fn oid(&self) -> Option<Oid> {
		self.meta.lock().oid
	}

	/// Whether the object was modified since it was last stored.
	pub fn is_changed(&self) -> bool {
		self.meta.lock().changed
	}

	/// Serial of the stored state the content was loaded from.
	pub fn serial(&self) -> Serial {
		self.meta.lock().serial
	}

	/// Number of outstanding pins.
	pub fn pins(&self) -> usize {
		self.meta.lock().pins
	}

	/// Logical time of the last release or access.
	pub fn last_accessed(&self) -> u64 {
		self.meta.lock().accessed
	}

	/// Reads content that is valid for ghosts too, without loading.
	pub(crate) fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> R {
		f(&self.data.read())
	}

	/// Gives the object a storage identity. Existing identities are kept.
	pub(crate) fn assign(&self, oid: Oid, jar: Arc<dyn Jar<T>>) {
		let mut meta = self.meta.lock();
		if meta.oid.is_none() {
			meta.oid = Some(oid);
			meta.jar = Some(jar);
		}
	}

	/// Marks the object clean after it was written at `serial`.
	pub(crate) fn saved(&self, serial: Serial) {
		let mut meta = self.meta.lock();
		meta.changed = false;
		meta.serial = serial;
	}

	/// Drops modified content so that the next access reloads the stored
	/// state. A pinned object keeps its content and stays changed. Returns
	/// whether the object is a ghost afterwards.
	pub(crate) fn invalidate(&self) -> bool {
		let mut meta = self.meta.lock();
		if meta.state == ActivationState::Ghost {
			meta.changed = false;
			return true;
		}
		if meta.pins > 0 || meta.oid.is_none() || meta.jar.is_none() {
			return false;
		}
		self.data.write().unload();
		meta.state = ActivationState::Ghost;
		meta.changed = false;
		tracing::debug!(oid = meta.oid, "invalidated object");
		true
	}

	/// Removes the storage identity of an object that was never stored, so
	/// that it can be added to a store again.
	pub(crate) fn forget(&self) {
		let mut meta = self.meta.lock();
		meta.oid = None;
		meta.jar = None;
		meta.changed = false;
		meta.serial = 0;
	}

	/// Consumes the object, returning its content.
	pub(crate) fn into_inner(self) -> T {
		self.data.into_inner()
	}
}

/// A pinned, loaded persistent object. Releases the pin when dropped.
pub struct Pin<'a, T: Activate> {
	object: &'a Arc<Persistent<T>>,
}

impl<'a, T: Activate> Pin<'a, T> {
	/// Shared access to the content.
	pub fn read(&self) -> RwLockReadGuard<'_, T> {
		self.object.data.read()
	}

	/// Exclusive access to the content.
	pub fn write(&self) -> RwLockWriteGuard<'_, T> {
		self.object.data.write()
	}

	/// See [`Persistent::mark_dirty`].
	pub fn mark_dirty(&self) -> Result<()> {
		self.object.mark_dirty()
	}
}

impl<T: Activate> Drop for Pin<'_, T> {
	fn drop(&mut self) {
		self.object.release();
	}
}
