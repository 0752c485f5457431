use crate::registry::UnitState;
use crate::ring::RingHandle;
use regex::Regex;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Protocol bits an endpoint may speak.  A client socket starts with
/// the endpoint's whole mask and the handler narrows it down during
/// the handshake.
pub const PROTO_DATALINK: u8 = 0x01;
pub const PROTO_SEEDLINK: u8 = 0x02;
pub const PROTO_HTTP: u8 = 0x04;

/// The protocol a connection settled on.  Stays `Undetermined` until
/// the handler finishes its detection handshake.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Undetermined,
    DataLink,
    SeedLink,
    Http,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Undetermined => "undetermined",
            Protocol::DataLink => "DataLink",
            Protocol::SeedLink => "SeedLink",
            Protocol::Http => "HTTP",
        };
        write!(f, "{}", name)
    }
}

/// Where a connection came from.  UNIX peers have no address; they get
/// the synthetic "unix" host and the endpoint path as port.
///
#[derive(Debug)]
pub enum PeerAddr {
    Ip(SocketAddr),
    Unix(String),
}

impl PeerAddr {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddr::Ip(sa) => Some(sa.ip()),
            PeerAddr::Unix(_) => None,
        }
    }
    /// Same-source comparison for the per-address connection cap:
    /// same family and same full address bytes.  Only IP families
    /// compare; UNIX peers never match.
    pub fn same_source(&self, other: &IpAddr) -> bool {
        match (self.ip(), other) {
            (Some(IpAddr::V4(a)), IpAddr::V4(b)) => a.octets() == b.octets(),
            (Some(IpAddr::V6(a)), IpAddr::V6(b)) => a.octets() == b.octets(),
            _ => false,
        }
    }
}

/// The accepted socket, TCP or UNIX.  Reads go through a shared
/// reference (both stream types support that), so the session does not
/// need a lock around its I/O side.
///
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.set_read_timeout(timeout),
            ClientStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => {
                let mut r: &TcpStream = s;
                r.read(buf)
            }
            ClientStream::Unix(s) => {
                let mut r: &UnixStream = s;
                r.read(buf)
            }
        }
    }
    pub fn shutdown(&self, how: Shutdown) -> std::io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.shutdown(how),
            ClientStream::Unix(s) => s.shutdown(how),
        }
    }
}

/// Cumulative transfer counters.  Written by the owning client worker,
/// read by the supervisor without a lock; each counter only ever
/// grows, so a torn snapshot can only be slightly stale, never wrong.
///
#[derive(Debug, Default)]
pub struct TrafficCounters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
}

/// One instant's view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl TrafficCounters {
    pub fn add_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn add_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Derived per-client rates with the one step counter history.  Only
/// the supervisor touches this, on its tick.
///
#[derive(Debug, Default)]
pub struct RateWindow {
    previous: CounterSnapshot,
    rate_time: Option<Instant>,
    pub tx_packet_rate: f64,
    pub tx_byte_rate: f64,
    pub rx_packet_rate: f64,
    pub rx_byte_rate: f64,
    pub percent_lag: f64,
}

impl RateWindow {
    /// Fold the current counters into rates and roll current ->
    /// history.  The first call uses dt = 1.0 since there is no
    /// history yet.
    pub fn rollover(&mut self, current: CounterSnapshot, now: Instant) {
        let dt = match self.rate_time {
            Some(t) => {
                let secs = now.duration_since(t).as_secs_f64();
                if secs > 0.0 {
                    secs
                } else {
                    1.0
                }
            }
            None => 1.0,
        };
        self.tx_packet_rate = (current.tx_packets - self.previous.tx_packets) as f64 / dt;
        self.tx_byte_rate = (current.tx_bytes - self.previous.tx_bytes) as f64 / dt;
        self.rx_packet_rate = (current.rx_packets - self.previous.rx_packets) as f64 / dt;
        self.rx_byte_rate = (current.rx_bytes - self.previous.rx_bytes) as f64 / dt;
        self.previous = current;
        self.rate_time = Some(now);
    }
}

/// A client's cursor into the ring: packet id plus byte offset.  The
/// offset is unset until the protocol layer positions the reader.
///
#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderCursor {
    pub pktid: u64,
    pub pktoffset: Option<u64>,
}

/// Descriptor of the per-client archive writer, attached when the
/// archive sink is configured globally.  The writer itself belongs to
/// the protocol layer.
///
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    pub path_spec: String,
    pub idle_timeout: u64,
}

/// Percent lag of a reader behind the ring's latest packet.  Offsets
/// are translated into unwrapped coordinates by adding the ring's max
/// offset to any value below the earliest offset.  A reader with no
/// valid position, or an empty span, has no lag defined and reports 0.
///
pub fn percent_lag(latest: u64, earliest: u64, max_offset: u64, reader: Option<u64>) -> f64 {
    let reader = match reader {
        Some(r) => r,
        None => return 0.0,
    };
    let unwrap = |v: u64| if v < earliest { v + max_offset } else { v };
    let latest = unwrap(latest);
    let reader = unwrap(reader);
    let span = latest.saturating_sub(earliest);
    if span == 0 {
        return 0.0;
    }
    let behind = latest.saturating_sub(reader);
    (100.0 * behind as f64 / span as f64).min(100.0)
}

/// Everything the server remembers about one accepted connection.
/// Built by the listener after policy admits the source; owned by the
/// client worker after hand-off; reaped by the supervisor once the
/// lifecycle reaches `Closed`.
///
pub struct ClientSession {
    pub stream: ClientStream,
    pub peer: PeerAddr,
    /// Printable peer address, numeric.
    pub host: String,
    pub port: String,
    /// Display id, `host:port`.
    pub client_id: String,
    /// Port string of the endpoint that admitted this client.
    pub endpoint: String,
    pub tls: bool,
    /// Protocols the admitting endpoint allows.
    pub protocols: u8,
    protocol: Mutex<Protocol>,
    pub trusted: bool,
    pub write_permitted: bool,
    pub limit: Option<Regex>,
    pub http_headers: Option<Arc<String>>,
    pub archive: Option<ArchiveWriter>,
    pub connect_time: Instant,
    pub connect_epoch: u64,
    last_exchange: AtomicU64,
    pub counters: TrafficCounters,
    pub reader: Mutex<ReaderCursor>,
    rates: Mutex<RateWindow>,
    pub unit: Arc<UnitState>,
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ClientSession {
    /// Build the record for a connection the policy just admitted.
    /// Counters start at zero, `lastExchange` at now, the protocol
    /// undetermined, and the lifecycle in `Spawning` until the worker
    /// announces itself.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: ClientStream,
        peer: PeerAddr,
        host: String,
        port: String,
        endpoint: String,
        tls: bool,
        protocols: u8,
        grant: crate::policy::Grant,
        http_headers: Option<Arc<String>>,
        archive: Option<ArchiveWriter>,
    ) -> Arc<ClientSession> {
        let now = now_epoch();
        let client_id = format!("{}:{}", host, port);
        Arc::new(ClientSession {
            stream,
            peer,
            host,
            port,
            client_id,
            endpoint,
            tls,
            protocols,
            protocol: Mutex::new(Protocol::Undetermined),
            trusted: grant.trusted,
            write_permitted: grant.write_permitted,
            limit: grant.limit,
            http_headers,
            archive,
            connect_time: Instant::now(),
            connect_epoch: now,
            last_exchange: AtomicU64::new(now),
            counters: TrafficCounters::default(),
            reader: Mutex::new(ReaderCursor::default()),
            rates: Mutex::new(RateWindow::default()),
            unit: UnitState::new(),
        })
    }

    /// Stamp the session as having exchanged data just now.
    pub fn touch(&self) {
        self.last_exchange.store(now_epoch(), Ordering::Relaxed);
    }
    pub fn last_exchange(&self) -> u64 {
        self.last_exchange.load(Ordering::Relaxed)
    }
    pub fn idle_seconds(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_exchange())
    }
    pub fn protocol(&self) -> Protocol {
        *self.protocol.lock().unwrap()
    }
    pub fn set_protocol(&self, proto: Protocol) {
        *self.protocol.lock().unwrap() = proto;
    }
    /// Derive rates and lag from the counters and the ring offsets.
    /// Contract: called strictly from one thread, the supervisor.
    pub fn update_rates(&self, ring: &RingHandle, now: Instant) {
        let reader = self.reader.lock().unwrap().pktoffset;
        let lag = percent_lag(
            ring.latest_offset(),
            ring.earliest_offset(),
            ring.max_offset(),
            reader,
        );
        let mut rates = self.rates.lock().unwrap();
        rates.rollover(self.counters.snapshot(), now);
        rates.percent_lag = lag;
    }
    /// Current rates and lag, as last derived by the supervisor.
    pub fn rates(&self) -> (f64, f64, f64, f64, f64) {
        let r = self.rates.lock().unwrap();
        (
            r.tx_packet_rate,
            r.tx_byte_rate,
            r.rx_packet_rate,
            r.rx_byte_rate,
            r.percent_lag,
        )
    }
}

/// Entry point of the protocol layer.  The dispatcher owns the
/// protocol selection handshake, all wire state, the counters'
/// write side and `lastExchange`, and it must honour a `Close` request
/// on the session's unit.  The worker wrapper marks the unit `Closed`
/// when `serve` returns, whatever the reason.
///
pub trait ProtocolDispatcher: Send + Sync {
    fn serve(&self, session: &Arc<ClientSession>);
}

/// The built-in stand-in dispatcher: drains the socket, accounts
/// received bytes and packets, and drains out on a close request or
/// peer disconnect.  Useful until real protocol handlers are plugged
/// in, and for exercising the client lifecycle in tests.
///
pub struct DiscardDispatcher;

impl ProtocolDispatcher for DiscardDispatcher {
    fn serve(&self, session: &Arc<ClientSession>) {
        session.unit.announce_active();
        if session
            .stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .is_err()
        {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            if session.unit.close_requested() {
                session.unit.begin_closing();
                break;
            }
            match session.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    session.counters.add_rx(1, n as u64);
                    session.touch();
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {}
                    _ => break,
                },
            }
        }
        let _ = session.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod lag_tests {
    use super::*;

    #[test]
    fn lag_1() {
        // Reader at latest: no lag.  Reader at earliest: full lag.
        assert_eq!(0.0, percent_lag(9000, 1000, 10000, Some(9000)));
        assert_eq!(100.0, percent_lag(9000, 1000, 10000, Some(1000)));
    }
    #[test]
    fn lag_2() {
        // Halfway.
        assert_eq!(50.0, percent_lag(9000, 1000, 10000, Some(5000)));
    }
    #[test]
    fn lag_3() {
        // No valid reader position: no lag defined.
        assert_eq!(0.0, percent_lag(9000, 1000, 10000, None));
    }
    #[test]
    fn lag_4() {
        // Wrapped latest: latest < earliest gets unwrapped by the max
        // offset.  earliest=8000, latest=2000 -> latest'=12000.
        assert_eq!(0.0, percent_lag(2000, 8000, 10000, Some(2000)));
        assert_eq!(100.0, percent_lag(2000, 8000, 10000, Some(8000)));
        assert_eq!(50.0, percent_lag(2000, 8000, 10000, Some(0)));
    }
    #[test]
    fn lag_5() {
        // Empty span (latest == earliest == reader) has no lag
        // defined; report 0 rather than dividing by zero.
        assert_eq!(0.0, percent_lag(5000, 5000, 10000, Some(5000)));
    }
    #[test]
    fn lag_6() {
        // Never outside [0, 100], even with a stale reader beyond the
        // span.
        let lag = percent_lag(9000, 1000, 10000, Some(500));
        assert!(lag >= 0.0 && lag <= 100.0);
    }
}

#[cfg(test)]
mod rate_tests {
    use super::*;

    #[test]
    fn rollover_1() {
        // First call uses dt = 1.0.
        let mut window = RateWindow::default();
        let counters = TrafficCounters::default();
        counters.add_tx(10, 5120);
        window.rollover(counters.snapshot(), Instant::now());
        assert_eq!(10.0, window.tx_packet_rate);
        assert_eq!(5120.0, window.tx_byte_rate);
    }
    #[test]
    fn rollover_2() {
        // Unchanged counters give exactly zero rates.
        let mut window = RateWindow::default();
        let counters = TrafficCounters::default();
        counters.add_rx(3, 1500);
        window.rollover(counters.snapshot(), Instant::now());
        std::thread::sleep(Duration::from_millis(10));
        window.rollover(counters.snapshot(), Instant::now());
        assert_eq!(0.0, window.tx_packet_rate);
        assert_eq!(0.0, window.rx_packet_rate);
        assert_eq!(0.0, window.rx_byte_rate);
    }
    #[test]
    fn counters_1() {
        // Counters only ever grow.
        let counters = TrafficCounters::default();
        let before = counters.snapshot();
        counters.add_tx(1, 512);
        counters.add_rx(2, 1024);
        let after = counters.snapshot();
        assert!(after.tx_packets >= before.tx_packets);
        assert!(after.tx_bytes >= before.tx_bytes);
        assert!(after.rx_packets >= before.rx_packets);
        assert!(after.rx_bytes >= before.rx_bytes);
    }
}
