//! The *scanner* module provides the directory scanner server unit:
//! it walks a configured directory tree on a fixed cadence and hands
//! every new file that passes the name filters to the ingest callback.
//! Scan progress (a modification time threshold) persists in an
//! optional state file so a restart does not re-ingest history.
//!
//! The format of the scanned files and the actual packet ingest belong
//! to the protocol layer; only the controlling lifecycle lives here.
//!
mod scanner;
pub use self::scanner::*;
