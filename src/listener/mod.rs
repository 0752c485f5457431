//! The *listener* module owns one bound endpoint per configured
//! listen port (TCP) or socket path (UNIX).  The acceptor thread
//! admits connections in four steps: match list, reject list,
//! per-address cap, global cap with the write list reserve; sources
//! that survive get a client record and a worker thread running the
//! protocol dispatcher.
//!
//! Sockets are bound (non-blocking) before the listener unit starts so
//! a bind failure is a startup error, not a worker crash.  The
//! acceptor polls its lifecycle state between accepts, which is how a
//! close request or a crashed-listener respawn takes effect.
//!
mod listener;
pub use self::listener::*;
