//! The *xferlog* module maintains the transfer log window: usage rows
//! appended for every live client each time the wall clock crosses a
//! window boundary.  Windows are aligned to the configured whole-hour
//! interval, and a config re-read recomputes the window from the
//! current time.
//!
mod xferlog;
pub use self::xferlog::*;
