//! The *registry* module is the catalog of long lived worker units.
//! The server keeps two of these: one for server units (listeners and
//! directory scanners) and one for client units (one per accepted
//! connection).  An entry owns the unit's lifecycle state, its private
//! payload and, once spawned, the join handle of its thread.
//!
//! Entries are keyed by an opaque unit id so removal is O(1); the
//! supervisor is the only component that removes entries, and it joins
//! the thread before the entry is dropped.
//!
mod registry;
pub use self::registry::*;
