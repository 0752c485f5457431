//! ringstream is a streaming packet buffer server: a long running
//! process that accepts producer connections, ingests variable sized
//! data packets into a fixed capacity ring buffer, and simultaneously
//! streams those packets back out to many consumer connections.
//!
//! This crate is the server core.  It owns:
//!
//! *  the supervisor loop that drives everything and guarantees a
//! clean shutdown,
//! *  the listeners that bind the configured endpoints (TCP ports or
//! UNIX sockets) and admit connections,
//! *  the per-client lifecycle, statistics and idle eviction,
//! *  the IP based access policy (match / reject / write / trusted /
//! limit lists of CIDR networks),
//! *  the signal dispatcher, the transfer log window and the
//! startup auto-recovery of the ring files.
//!
//! The concrete wire protocols (DataLink, SeedLink, HTTP) and the
//! persistent ring storage engine are collaborators behind traits:
//! protocol handlers plug in through `client::ProtocolDispatcher`,
//! the storage engine through `ring::RingEngine`.  A memory backed
//! engine and a socket draining dispatcher ship as defaults.
//!
//! ## Running the server
//!
//! The binary reads a line oriented configuration file (path from
//! `-c` or `RS_CONFIG_FILE`); every key also works as an `RS_`
//! prefixed environment variable and most as a command line flag.
//! Precedence is command line > environment > file.  The important
//! keys:
//!
//! *  `RingDirectory`, `RingSize`, `MaxPacketSize`, `VolatileRing`,
//! `AutoRecovery` - placement and geometry of the packet buffer and
//! what to do when its files are corrupt or from an older version
//! (0 keep and refuse, 1 move aside, 2 delete).
//! *  `ListenPort <port> [DataLink] [SeedLink] [HTTP] [IPv4] [IPv6]
//! [TLS]` and `UnixSocket <path> [...]` - one line per endpoint.
//! *  `MaxClients`, `MaxClientsPerIP`, `ClientTimeout` - connection
//! caps and idle eviction.
//! *  `MatchIP`, `RejectIP`, `WriteIP`, `TrustedIP`, `LimitIP` -
//! access policy, one CIDR per line, `LimitIP` with a stream id
//! pattern.
//! *  `TransferLogDirectory`, `TransferLogInterval`, ... - periodic
//! per-client usage rows.
//! *  `ScanDir <path> [StateFile=..] [Match=..] [Reject=..]` -
//! directory ingest scanners.
//!
//! ## Signals
//!
//! SIGINT and SIGTERM request a graceful shutdown: listeners close,
//! every client drains, the ring flushes, the process exits 0.
//! SIGUSR1 dumps ring and server state to the log at high verbosity.
//! SIGPIPE is neutralised so writes to dead sockets fail with an
//! error code.
//!
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod policy;
pub mod registry;
pub mod ring;
pub mod scanner;
pub mod signals;
pub mod supervisor;
pub mod xferlog;

pub use error::ServerError;
