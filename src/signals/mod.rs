//! The *signals* module converts asynchronous process signals into
//! typed server actions on a dedicated thread: SIGINT and SIGTERM
//! raise the process wide shutdown flag, SIGUSR1 asks for a
//! diagnostic dump, anything else in the wait set is logged and
//! ignored.  SIGPIPE is neutralised at startup so writes to closed
//! sockets fail with an error code instead of killing the process.
//!
mod signals;
pub use self::signals::*;
