//! The *policy* module holds the IP based access control machinery:
//! ordered lists of CIDR networks with an optional stream limit
//! pattern per entry.  The server keeps five of these lists
//! (match, reject, write, trusted, limit) and the listener consults
//! them, in that order, when it admits a connection.
//!
//! Matching is first-hit in insertion order and only ever compares
//! addresses of the same family.  UNIX domain peers have no address
//! and bypass the lists entirely.
//!
mod policy;
pub use self::policy::*;
