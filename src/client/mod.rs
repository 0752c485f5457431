//! The *client* module holds everything the server remembers about one
//! accepted connection: the socket, the peer identity, the admission
//! grants, the transfer counters with their one step history, and the
//! reader cursor into the ring.
//!
//! The session record is shared between exactly two threads: the
//! client worker (which does all the I/O and owns the counters' write
//! side) and the supervisor (which derives rates and lag on its tick).
//! Counters are atomics so the supervisor can snapshot them without a
//! lock; the rate window is supervisor private.
//!
//! The protocol handlers (DataLink, SeedLink, HTTP detection and all
//! wire state) are not part of this crate; they plug in through the
//! [ProtocolDispatcher] trait.  A discard dispatcher that drains the
//! socket and keeps the receive accounting honest ships as the
//! default.
//!
mod client;
pub use self::client::*;
