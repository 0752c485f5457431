//! The *supervisor* module owns the process: the single threaded
//! coordinator that ticks four times a second, reaps terminated
//! units, restarts crashed listeners and scanners, folds per-client
//! rates into the ring wide aggregates, drives transfer log rollover
//! and config re-reads, and orchestrates the graceful shutdown.
//!
//! All shared state hangs off the [ServerCore] value: the config
//! snapshot, the ring handle, the two unit catalogs and the shutdown
//! flag.  The signal dispatcher gets a back reference to it for the
//! diagnostic dump.
//!
mod supervisor;
pub use self::supervisor::*;
