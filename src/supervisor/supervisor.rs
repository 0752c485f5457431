use crate::client::{now_epoch, ClientSession, ProtocolDispatcher};
use crate::config::Config;
use crate::error::ServerError;
use crate::listener::{bind_endpoints, spawn_listener, BoundEndpoint};
use crate::registry::{LifecycleState, UnitId, UnitState, UnitTable};
use crate::ring::{RingHandle, RingRates};
use crate::scanner::{spawn_scanner, ScanJob};
use crate::signals::{DiagnosticSink, SignalDispatcher};
use crate::xferlog::TransferLog;
use log::{error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Base tick, four per nominal second.
const TICK: Duration = Duration::from_millis(250);
/// Faster tick while draining.
const DRAIN_TICK: Duration = Duration::from_millis(100);
/// Drain ticks after which a clean shutdown is abandoned (~10 s).
const DRAIN_LIMIT: u32 = 100;

/// The payload of a server unit: what to run when the unit (re)spawns.
/// Respawns reuse the same payload, so a listener keeps its bound
/// socket across a crash of its acceptor.
///
#[derive(Clone)]
pub enum ServerTask {
    Listener(Arc<BoundEndpoint>),
    Scanner(Arc<ScanJob>),
}

impl ServerTask {
    pub fn describe(&self) -> String {
        match self {
            ServerTask::Listener(bound) => format!("listener on {}", bound.describe()),
            ServerTask::Scanner(job) => format!("scanner of {}", job.spec.path.display()),
        }
    }
}

/// The constructed server value: every piece of process wide state the
/// components share.  The only global datum is the shutdown flag, a
/// single atomic boolean shared with the signal dispatcher.
///
pub struct ServerCore {
    config: Mutex<Arc<Config>>,
    pub ring: RingHandle,
    pub servers: UnitTable<ServerTask>,
    pub clients: UnitTable<Arc<ClientSession>>,
    pub dispatcher: Arc<dyn ProtocolDispatcher>,
    shutdown: Arc<AtomicBool>,
    started: Instant,
}

impl ServerCore {
    pub fn new(
        config: Config,
        ring: RingHandle,
        dispatcher: Arc<dyn ProtocolDispatcher>,
    ) -> Arc<ServerCore> {
        Arc::new(ServerCore {
            config: Mutex::new(Arc::new(config)),
            ring,
            servers: UnitTable::new(),
            clients: UnitTable::new(),
            dispatcher,
            shutdown: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        })
    }
    /// The current config snapshot.  Workers copy what they need at
    /// connect time; the supervisor may swap the snapshot at any tick.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.lock().unwrap())
    }
    pub fn swap_config(&self, fresh: Arc<Config>) {
        *self.config.lock().unwrap() = fresh;
    }
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
    /// The flag itself, for the signal dispatcher.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
    /// Connections currently held by `addr`: same family, same full
    /// address bytes.
    pub fn connections_from(&self, addr: &IpAddr) -> usize {
        self.clients.count_matching(|s| s.peer.same_source(addr))
    }
}

impl DiagnosticSink for ServerCore {
    /// The high verbosity state dump SIGUSR1 asks for.
    fn dump_diagnostics(&self) {
        let cfg = self.config();
        let rates = self.ring.rates();
        info!(
            "server {} version {} up {}s",
            cfg.server_id,
            env!("CARGO_PKG_VERSION"),
            self.started.elapsed().as_secs()
        );
        info!(
            "ring: earliest {} latest {} max {} packets {}",
            self.ring.earliest_offset(),
            self.ring.latest_offset(),
            self.ring.max_offset(),
            self.ring.packet_count()
        );
        info!(
            "rates: tx {:.1} pkt/s {:.1} B/s, rx {:.1} pkt/s {:.1} B/s",
            rates.tx_packet_rate, rates.tx_byte_rate, rates.rx_packet_rate, rates.rx_byte_rate
        );
        info!(
            "{} server units, {} clients",
            self.servers.len(),
            self.clients.len()
        );
        let now = now_epoch();
        for (_, unit, session) in self.clients.snapshot() {
            let (txp, _txb, rxp, _rxb, lag) = session.rates();
            info!(
                "[{}] {} {:?} lag {:.0}% tx {:.1} pkt/s rx {:.1} pkt/s idle {}s",
                session.client_id,
                session.protocol(),
                unit.state(),
                lag,
                txp,
                rxp,
                session.idle_seconds(now)
            );
        }
    }
}

/// Bind the configured endpoints, compile the scan jobs and spawn one
/// server unit for each.  Must run before [run]; a failure here
/// refuses startup.  Returns the bound endpoints so the caller knows
/// the actual ports.
///
pub fn start_units(core: &Arc<ServerCore>) -> Result<Vec<Arc<BoundEndpoint>>, ServerError> {
    let cfg = core.config();
    let bound = bind_endpoints(&cfg)?;
    for endpoint in &bound {
        respawn(core, ServerTask::Listener(Arc::clone(endpoint)));
    }
    for spec in &cfg.scanners {
        let job = Arc::new(ScanJob::new(spec)?);
        respawn(core, ServerTask::Scanner(job));
    }
    Ok(bound)
}

/// (Re)spawn the worker for a server task.  A failed spawn leaves a
/// `Closed` entry behind so the next tick retries it.
///
fn respawn(core: &Arc<ServerCore>, task: ServerTask) {
    let unit = UnitState::new();
    let spawned = match &task {
        ServerTask::Listener(bound) => spawn_listener(core, Arc::clone(bound), Arc::clone(&unit)),
        ServerTask::Scanner(job) => spawn_scanner(core, Arc::clone(job), Arc::clone(&unit)),
    };
    match spawned {
        Ok(handle) => {
            core.servers.insert(task, unit, Some(handle));
        }
        Err(e) => {
            error!("cannot spawn {}: {}", task.describe(), e);
            unit.mark_closed();
            core.servers.insert(task, unit, None);
        }
    }
}

fn join_entry(id: UnitId, handle: Option<thread::JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("worker thread of {} panicked", id);
        }
    }
}

/// The supervisor loop.  Preconditions: the ring is initialised, the
/// units are started ([start_units]) and, in production, the signal
/// dispatcher is running with the core as its diagnostic sink.  Owns
/// the process until shutdown; returns the exit code.
///
pub fn run(core: Arc<ServerCore>, dispatcher: Option<SignalDispatcher>) -> Result<i32, ServerError> {
    let mut tlog = TransferLog::new(&core.config().tlog, now_epoch());
    let mut tick = TICK;
    let mut draining = false;
    let mut drain_ticks = 0u32;
    loop {
        let now = Instant::now();
        let epoch = now_epoch();
        if !draining && core.shutdown_requested() {
            draining = true;
            tick = DRAIN_TICK;
            info!("draining: closing all listeners and clients");
            core.servers.request_close_all();
            core.clients.request_close_all();
        }
        if draining {
            drain_ticks += 1;
            if drain_ticks > DRAIN_LIMIT {
                error!("shutdown is deadlocked, abandoning clean exit");
                break;
            }
        }
        let rolling = tlog.as_ref().map(|t| t.due(epoch)).unwrap_or(false);

        // Server units: join the dead, respawn the missing.
        for (id, mut entry) in core.servers.take_closed() {
            join_entry(id, entry.handle.take());
            if !draining {
                info!("restarting {}", entry.payload.describe());
                respawn(&core, entry.payload);
            }
        }

        // Client units: reap the closed ones first.
        for (id, mut entry) in core.clients.take_closed() {
            join_entry(id, entry.handle.take());
            info!("[{}] disconnected", entry.payload.client_id);
            if let Some(t) = &tlog {
                if let Err(e) = t.write_row(&entry.payload) {
                    warn!("transfer log write failed: {}", e);
                }
            }
        }

        // Then walk the live ones: rates, aggregate, transfer log,
        // idle eviction.
        let cfg = core.config();
        let mut aggregate = RingRates::default();
        for (_, unit, session) in core.clients.snapshot() {
            if unit.state() == LifecycleState::Closed {
                continue; // reaped next tick
            }
            session.update_rates(&core.ring, now);
            let (txp, txb, rxp, rxb, _) = session.rates();
            aggregate.tx_packet_rate += txp;
            aggregate.tx_byte_rate += txb;
            aggregate.rx_packet_rate += rxp;
            aggregate.rx_byte_rate += rxb;
            if rolling {
                if let Some(t) = &tlog {
                    if let Err(e) = t.write_row(&session) {
                        warn!("transfer log write failed: {}", e);
                    }
                }
            }
            if !draining
                && cfg.client_timeout > 0
                && session.idle_seconds(epoch) > cfg.client_timeout
            {
                info!(
                    "[{}] idle for more than {} seconds, closing",
                    session.client_id, cfg.client_timeout
                );
                unit.request_close();
            }
        }
        core.ring.publish_rates(aggregate);
        if rolling {
            if let Some(t) = &mut tlog {
                t.roll(epoch);
            }
        }

        // Config re-read on mtime change.  A failure keeps the
        // previous snapshot; a success recomputes the transfer log
        // window from the current time.
        if !draining {
            match cfg.reread() {
                Ok(Some(fresh)) => {
                    info!("configuration re-read (update {})", fresh.updates);
                    let fresh = Arc::new(fresh);
                    core.swap_config(Arc::clone(&fresh));
                    tlog = TransferLog::new(&fresh.tlog, now_epoch());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("config re-read failed, keeping previous snapshot: {}", e);
                }
            }
        }

        if draining && core.servers.is_empty() && core.clients.is_empty() {
            info!("all units drained");
            break;
        }
        thread::sleep(tick);
    }
    if let Err(e) = core.ring.shutdown() {
        error!("ring shutdown failed: {}", e);
    }
    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown();
    }
    info!("server stopped");
    Ok(0)
}

#[cfg(test)]
mod supervisor_tests {
    use super::*;
    use crate::client::DiscardDispatcher;
    use crate::config::ListenSpec;
    use crate::ring::{MemoryRing, RingEngine, RingSpec};
    use std::io::Write;
    use std::net::TcpStream;
    use std::path::Path;

    fn test_config(timeout: u64, max_clients: usize) -> Config {
        let mut cfg = Config::default();
        cfg.volatile_ring = true;
        cfg.client_timeout = timeout;
        cfg.max_clients = max_clients;
        cfg.endpoints.push(ListenSpec::tcp("0"));
        cfg
    }

    fn test_core(cfg: Config, dir: &Path) -> (Arc<ServerCore>, Arc<MemoryRing>) {
        let engine = Arc::new(MemoryRing::new(RingSpec {
            dir: dir.to_path_buf(),
            size: 65536,
            pkt_size: 512,
            memory_map: false,
            volatile_ring: true,
        }));
        let shared: Arc<dyn RingEngine> = engine.clone();
        let core = ServerCore::new(cfg, RingHandle::new(shared), Arc::new(DiscardDispatcher));
        (core, engine)
    }

    fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn idle_timeout_1() {
        // A silent client is evicted after the configured timeout and
        // its unit is reaped.
        let tmp = tempfile::tempdir().unwrap();
        let (core, _engine) = test_core(test_config(1, 10), tmp.path());
        let bound = start_units(&core).unwrap();
        let port = bound[0].local_port().unwrap();
        let runner = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, None))
        };
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_until("client admission", || core.client_count() == 1);
        wait_until("idle eviction", || core.client_count() == 0);
        core.request_shutdown();
        assert_eq!(0, runner.join().unwrap().unwrap());
    }

    #[test]
    fn shutdown_1() {
        // Graceful shutdown drains every unit, closes the listener
        // socket and shuts the ring engine down exactly once.
        let tmp = tempfile::tempdir().unwrap();
        let (core, engine) = test_core(test_config(600, 10), tmp.path());
        let bound = start_units(&core).unwrap();
        let port = bound[0].local_port().unwrap();
        drop(bound);
        let runner = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, None))
        };
        let mut streams = Vec::new();
        for _ in 0..5 {
            streams.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
        }
        wait_until("admissions", || core.client_count() == 5);
        core.request_shutdown();
        assert_eq!(0, runner.join().unwrap().unwrap());
        assert!(core.clients.is_empty());
        assert!(core.servers.is_empty());
        assert_eq!(1, engine.shutdown_count());
        // The acceptor is gone; new connections are refused.
        thread::sleep(Duration::from_millis(100));
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn respawn_1() {
        // A server unit that stops outside a drain is restarted on the
        // next tick, reusing its bound socket.
        let tmp = tempfile::tempdir().unwrap();
        let (core, _engine) = test_core(test_config(600, 10), tmp.path());
        let bound = start_units(&core).unwrap();
        let port = bound[0].local_port().unwrap();
        let runner = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, None))
        };
        core.servers.request_close_all();
        // The acceptor exits, gets reaped, and a fresh worker comes up
        // on the same endpoint.
        wait_until("respawned acceptor", || {
            core.servers.len() == 1
                && core
                    .servers
                    .snapshot()
                    .iter()
                    .all(|(_, unit, _)| unit.state() == LifecycleState::Active)
                && TcpStream::connect(("127.0.0.1", port)).is_ok()
        });
        core.request_shutdown();
        assert_eq!(0, runner.join().unwrap().unwrap());
    }

    #[test]
    fn counters_flow_1() {
        // Bytes sent by a client show up in the counters and in the
        // published aggregate rates.
        let tmp = tempfile::tempdir().unwrap();
        let (core, _engine) = test_core(test_config(600, 10), tmp.path());
        let bound = start_units(&core).unwrap();
        let port = bound[0].local_port().unwrap();
        let runner = {
            let core = Arc::clone(&core);
            thread::spawn(move || run(core, None))
        };
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_until("admission", || core.client_count() == 1);
        // Keep traffic flowing so the rate window stays non-zero while
        // we poll.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut rx_seen = false;
        let mut rate_seen = false;
        while !(rx_seen && rate_seen) {
            assert!(Instant::now() < deadline, "rx bytes never surfaced in rates");
            client.write_all(b"0123456789").unwrap();
            client.flush().unwrap();
            rx_seen = rx_seen
                || core
                    .clients
                    .snapshot()
                    .iter()
                    .any(|(_, _, s)| s.counters.snapshot().rx_bytes >= 10);
            rate_seen = rate_seen || core.ring.rates().rx_byte_rate > 0.0;
            thread::sleep(Duration::from_millis(50));
        }
        core.request_shutdown();
        assert_eq!(0, runner.join().unwrap().unwrap());
    }
}
