//! The *config* module assembles and carries the immutable runtime
//! configuration snapshot.  A snapshot is built from three layers with
//! the precedence command line > environment (`RS_` prefix) > file;
//! the same key set works in all three.  The file format is line
//! oriented `Key value` pairs with `#` comments.
//!
//! The snapshot also remembers the config file's modification time and
//! a change counter; the supervisor polls the mtime on its tick and
//! swaps in a freshly parsed snapshot when the file changed.  Workers
//! copy the fields they need at connect time, so a mid-flight swap
//! never affects an established session.
//!
mod config;
pub use self::config::*;
