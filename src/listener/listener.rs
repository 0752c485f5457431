use crate::client::{ArchiveWriter, ClientSession, ClientStream, PeerAddr};
use crate::config::{Config, ListenSpec};
use crate::error::ServerError;
use crate::policy::{Grant, Refusal};
use crate::registry::UnitState;
use crate::supervisor::ServerCore;
use log::{error, info};
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sources on the write list may exceed the global client cap by this
/// reserve budget.
pub const GLOBAL_CAP_RESERVE: usize = 10;

/// How long the acceptor sleeps when there is nothing to accept.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// The bound socket of an endpoint.
pub enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl BoundSocket {
    fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            BoundSocket::Tcp(l) => l.accept().map(|(s, a)| Accepted::Tcp(s, a)),
            BoundSocket::Unix(l) => l.accept().map(|(s, _)| Accepted::Unix(s)),
        }
    }
}

/// An endpoint with its socket already bound.  The payload of a
/// listener server unit; respawns re-enter the acceptor with the same
/// payload, so the endpoint set is immutable after startup.
///
pub struct BoundEndpoint {
    pub spec: ListenSpec,
    pub socket: BoundSocket,
}

impl BoundEndpoint {
    pub fn describe(&self) -> String {
        if self.spec.unix {
            format!("unix socket {}", self.spec.port)
        } else {
            format!("port {}", self.spec.port)
        }
    }
    /// The actually bound TCP port (differs from the configured one
    /// when that was 0).
    pub fn local_port(&self) -> Option<u16> {
        match &self.socket {
            BoundSocket::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            BoundSocket::Unix(_) => None,
        }
    }
}

/// Bind every configured endpoint.  Any failure here refuses startup.
///
pub fn bind_endpoints(cfg: &Config) -> Result<Vec<Arc<BoundEndpoint>>, ServerError> {
    let mut bound = Vec::new();
    for spec in &cfg.endpoints {
        let socket = if spec.unix {
            // A stale socket file from an unclean exit would make the
            // bind fail; remove it first.
            if Path::new(&spec.port).exists() {
                let _ = fs::remove_file(&spec.port);
            }
            let listener = UnixListener::bind(&spec.port)
                .map_err(|e| ServerError::Bind(spec.port.clone(), e))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| ServerError::Bind(spec.port.clone(), e))?;
            BoundSocket::Unix(listener)
        } else {
            let addr = if spec.v6 {
                format!("[::]:{}", spec.port)
            } else {
                format!("0.0.0.0:{}", spec.port)
            };
            let listener =
                TcpListener::bind(&addr).map_err(|e| ServerError::Bind(spec.port.clone(), e))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| ServerError::Bind(spec.port.clone(), e))?;
            BoundSocket::Tcp(listener)
        };
        bound.push(Arc::new(BoundEndpoint {
            spec: spec.clone(),
            socket,
        }));
    }
    Ok(bound)
}

/// Spawn the acceptor thread for an endpoint.
///
pub fn spawn_listener(
    core: &Arc<ServerCore>,
    bound: Arc<BoundEndpoint>,
    unit: Arc<UnitState>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let core = Arc::clone(core);
    thread::Builder::new()
        .name(format!("listen-{}", bound.spec.port))
        .spawn(move || run_listener(core, bound, unit))
}

/// The acceptor loop: accept, admit, hand off; poll the lifecycle
/// state in between.
///
pub fn run_listener(core: Arc<ServerCore>, bound: Arc<BoundEndpoint>, unit: Arc<UnitState>) {
    unit.announce_active();
    info!("listening on {}", bound.describe());
    loop {
        if unit.close_requested() || core.shutdown_requested() {
            unit.begin_closing();
            break;
        }
        match bound.socket.accept() {
            Ok(accepted) => {
                if let Err(e) = admit_connection(&core, &bound, accepted) {
                    // Allocation trouble; exit and let the supervisor
                    // restart the acceptor.
                    error!("{}: leaving acceptor: {}", bound.describe(), e);
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(ref e)
                if e.kind() == ErrorKind::Interrupted
                    || e.kind() == ErrorKind::ConnectionAborted => {}
            Err(e) => {
                error!("accept failed on {}: {}", bound.describe(), e);
                break;
            }
        }
    }
    // On a requested stop the socket is going away for good; remove a
    // UNIX endpoint's filesystem path.  A crash exit keeps the path,
    // since the respawned acceptor reuses the bound socket.
    if unit.close_requested() && bound.spec.unix {
        let _ = fs::remove_file(&bound.spec.port);
        info!("removed {}", bound.spec.port);
    }
    unit.mark_closed();
}

/// Admission steps 3a-3d: the policy lists, then the per-address cap,
/// then the global cap with its write list reserve.  UNIX peers have
/// no address; they skip the lists and the per-address cap but still
/// count against the global cap.
///
pub fn screen(core: &ServerCore, cfg: &Config, ip: Option<std::net::IpAddr>) -> Result<Grant, Refusal> {
    let grant = match ip {
        Some(addr) => cfg.policy.screen(addr)?,
        None => Grant {
            write_permitted: false,
            trusted: false,
            limit: None,
        },
    };
    if let Some(addr) = ip {
        if cfg.max_clients_per_ip > 0
            && !grant.write_permitted
            && core.connections_from(&addr) >= cfg.max_clients_per_ip
        {
            return Err(Refusal::SourceCap);
        }
    }
    if cfg.max_clients > 0 {
        let count = core.client_count();
        if count >= cfg.max_clients
            && !(grant.write_permitted && count < cfg.max_clients + GLOBAL_CAP_RESERVE)
        {
            return Err(Refusal::GlobalCap);
        }
    }
    Ok(grant)
}

/// Build the client record for an admitted connection and hand it to a
/// worker thread.  A policy refusal closes the socket and returns Ok
/// (the acceptor keeps going); only a failed thread spawn propagates.
///
fn admit_connection(
    core: &Arc<ServerCore>,
    bound: &Arc<BoundEndpoint>,
    accepted: Accepted,
) -> std::io::Result<()> {
    let cfg = core.config();
    let (stream, peer, host, port) = match accepted {
        Accepted::Tcp(stream, peer) => {
            let _ = stream.set_nodelay(true);
            let host = peer.ip().to_string();
            let port = peer.port().to_string();
            (ClientStream::Tcp(stream), PeerAddr::Ip(peer), host, port)
        }
        Accepted::Unix(stream) => (
            ClientStream::Unix(stream),
            PeerAddr::Unix(bound.spec.port.clone()),
            String::from("unix"),
            bound.spec.port.clone(),
        ),
    };
    let grant = match screen(core, &cfg, peer.ip()) {
        Ok(grant) => grant,
        Err(refusal) => {
            info!("[{}:{}] connection refused: {}", host, port, refusal);
            // Dropping the stream closes the socket before any
            // protocol bytes are read.
            return Ok(());
        }
    };
    let session = ClientSession::new(
        stream,
        peer,
        host,
        port,
        bound.spec.port.clone(),
        bound.spec.tls,
        bound.spec.protocols,
        grant,
        cfg.http_headers.clone().map(Arc::new),
        cfg.mseed_archive.as_ref().map(|spec| ArchiveWriter {
            path_spec: spec.clone(),
            idle_timeout: cfg.mseed_idle_timeout,
        }),
    );
    info!("[{}] connected via {}", session.client_id, bound.describe());
    spawn_client(core, session)
}

/// Spawn the client worker and link the unit into the client catalog.
///
pub fn spawn_client(core: &Arc<ServerCore>, session: Arc<ClientSession>) -> std::io::Result<()> {
    let dispatcher = Arc::clone(&core.dispatcher);
    let worker_session = Arc::clone(&session);
    let handle = thread::Builder::new()
        .name(format!("client-{}", session.client_id))
        .spawn(move || {
            dispatcher.serve(&worker_session);
            // Whatever the dispatcher did, the unit ends Closed so the
            // supervisor can reap it.
            worker_session.unit.mark_closed();
        })?;
    core.clients
        .insert(Arc::clone(&session), Arc::clone(&session.unit), Some(handle));
    Ok(())
}
