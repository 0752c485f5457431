//! The *ring* module is the server core's view of the packet buffer
//! storage engine.  The engine itself (record layout, mmap
//! persistence, stream index, reader cursors) lives behind the
//! [RingEngine] trait; the core only needs the buffer offsets, a write
//! entry point for replay, and a shutdown hook that flushes indexes.
//!
//! What *is* implemented here is the startup auto-recovery protocol:
//! when opening the buffer files reports corruption or an older on-disk
//! version, the core sets the files aside (or deletes them, per
//! configuration), re-initializes an empty ring and, for version 1
//! files, replays the packets from the backup into the new ring.
//!
//! One concrete engine ships with the crate: a memory backed ring that
//! keeps only the offset arithmetic and a version-stamped header file
//! on disk.  It backs volatile configurations and the test suite.
//!
mod ring;
pub use self::ring::*;
