//! # Error Types for the Persistent Tree
//!
//! Every fallible operation in this crate returns [`Result`]. The variants fall
//! into three groups:
//!
//! - **Caller errors** that are part of the normal mapping contract:
//!   [`Error::KeyNotFound`] and [`Error::EmptyTree`].
//! - **Structural errors** raised when a node or a decoded state breaks the
//!   tree's invariants: [`Error::Invariant`] and [`Error::TypeMismatch`]. The
//!   operation that hit them is aborted; nothing is retried.
//! - **Substrate errors** from the object store that supplies ghost content:
//!   [`Error::MissingObject`] and [`Error::ReadOnly`]. These propagate unchanged.
//!
//! Conflict resolution is special: whatever goes wrong while merging three
//! states is reported as [`Error::Conflict`], so that callers can tell "this
//! transaction must be retried" apart from every other failure.
//!
//! ## Error Flow
//!
//! ```text
//! acquire(root) ──► Err(MissingObject) ──► propagate, nothing pinned
//!      │
//!      ▼
//! descend + mutate ──► Err(Invariant) ──► release every pin, propagate
//!      │
//!      ▼
//! mark_dirty ──► Err(ReadOnly) ──► propagate (mutation already applied)
//! ```

use thiserror::Error;

use crate::activation::{Oid, Serial};

/// Errors that can occur during tree operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// A value lookup or a delete named a key that is not in the tree.
	#[error("key not found")]
	KeyNotFound,

	/// `min_key`/`max_key` found nothing to return.
	#[error("empty tree")]
	EmptyTree,

	/// A node or state broke one of the tree's structural invariants, e.g. a
	/// split of a node with fewer than two entries, or a malformed state.
	#[error("structural invariant violated: {0}")]
	Invariant(&'static str),

	/// A decoded state referenced a leaf of the wrong kind, or no leaf at all
	/// where one was required.
	#[error("type mismatch: {0}")]
	TypeMismatch(&'static str),

	/// Three states could not be merged. The reason is informational only.
	#[error("conflict: {0}")]
	Conflict(ConflictReason),

	/// The object store has no record for an oid a ghost was created from.
	#[error("no stored record for object {0}")]
	MissingObject(Oid),

	/// The object store refused to accept a modified object.
	#[error("object store is read-only")]
	ReadOnly,
}

/// Why a three-way merge gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
	/// Both sides changed the value of the same key to different values.
	#[error("both transactions changed the same value")]
	ConflictingChanges,

	/// One side deleted a key the other side changed.
	#[error("a key was deleted by one transaction and changed by the other")]
	DeleteAndChange,

	/// Both sides inserted the same key.
	#[error("both transactions inserted the same key")]
	DuelingInserts,

	/// Both sides deleted the same key.
	#[error("both transactions deleted the same key")]
	DuelingDeletes,

	/// The leaf chain link differs between the states.
	#[error("the leaf chain changed underneath the merge")]
	ChainChanged,

	/// One side emptied a stored leaf, unlinking it from the tree, while the
	/// other side still holds or changed its content.
	#[error("a stored leaf was emptied by one transaction")]
	EmptiedLeaf,

	/// Merging left a stored leaf with no items. Empty leaves are unlinked by
	/// their parent, which the merge cannot do.
	#[error("the merge left a stored leaf empty")]
	EmptyMerge,

	/// A state is neither absent nor a single leaf's content.
	#[error("state shape cannot be merged")]
	Unmergeable,

	/// The stored object was written again after the revision a write was
	/// based on.
	#[error("object {oid} was rewritten at serial {current}, write was based on {base}")]
	StaleWrite { oid: Oid, base: Serial, current: Serial },

	/// Any other failure raised while merging, masked as a conflict.
	#[error("merge failed: {0}")]
	Failed(String),
}

/// A Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;
