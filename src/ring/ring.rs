use crate::error::ServerError;
use log::{info, warn};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// File names of the persisted ring state inside the ring directory.
pub const PACKET_BUFFER_FILE: &str = "packetbuf";
pub const STREAM_INDEX_FILE: &str = "streamidx";

/// Header magic of the packet buffer file.
pub const BUFFER_MAGIC: &[u8; 4] = b"RSBF";
/// On-disk version this server writes.
pub const BUFFER_VERSION: u32 = 2;

/// Geometry and placement of the ring, extracted from the config
/// snapshot when the ring is opened.
///
#[derive(Debug, Clone)]
pub struct RingSpec {
    pub dir: PathBuf,
    pub size: u64,
    pub pkt_size: u32,
    pub memory_map: bool,
    pub volatile_ring: bool,
}

/// How an engine open attempt can fail.  `Corrupt` and `Version` feed
/// the auto-recovery protocol; `Fatal` never does.
///
#[derive(Debug)]
pub enum RingOpenError {
    Corrupt,
    Version(u32),
    Fatal(String),
}

/// The storage engine contract the core consumes.  Offsets are byte
/// positions into the wrap-around buffer; `max_offset` is the wrap
/// point.
///
pub trait RingEngine: Send + Sync {
    fn latest_offset(&self) -> u64;
    fn earliest_offset(&self) -> u64;
    fn max_offset(&self) -> u64;
    fn packet_count(&self) -> u64;
    /// Append one packet, returning its offset.
    fn write_packet(&self, stream_id: &str, payload: &[u8]) -> Result<u64, ServerError>;
    /// Flush indexes and release resources.  Called exactly once, by
    /// the supervisor, after the loop exits.
    fn shutdown(&self) -> Result<(), ServerError>;
}

/// Opens engines against a [RingSpec].  Factored out so the recovery
/// logic (and the tests) can drive open attempts without knowing the
/// engine.
///
pub trait EngineFactory: Send + Sync {
    fn open(&self, spec: &RingSpec) -> Result<Arc<dyn RingEngine>, RingOpenError>;
}

/// Ring wide transfer rates.  The supervisor is the sole writer; the
/// diagnostic dump and the protocol layer read them.
///
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RingRates {
    pub tx_packet_rate: f64,
    pub tx_byte_rate: f64,
    pub rx_packet_rate: f64,
    pub rx_byte_rate: f64,
}

/// The typed handle the rest of the server holds on the ring: the
/// engine plus the writable aggregate rate fields.
///
pub struct RingHandle {
    engine: Arc<dyn RingEngine>,
    rates: Mutex<RingRates>,
}

impl RingHandle {
    pub fn new(engine: Arc<dyn RingEngine>) -> RingHandle {
        RingHandle {
            engine,
            rates: Mutex::new(RingRates::default()),
        }
    }
    pub fn latest_offset(&self) -> u64 {
        self.engine.latest_offset()
    }
    pub fn earliest_offset(&self) -> u64 {
        self.engine.earliest_offset()
    }
    pub fn max_offset(&self) -> u64 {
        self.engine.max_offset()
    }
    pub fn packet_count(&self) -> u64 {
        self.engine.packet_count()
    }
    pub fn write_packet(&self, stream_id: &str, payload: &[u8]) -> Result<u64, ServerError> {
        self.engine.write_packet(stream_id, payload)
    }
    pub fn publish_rates(&self, rates: RingRates) {
        *self.rates.lock().unwrap() = rates;
    }
    pub fn rates(&self) -> RingRates {
        *self.rates.lock().unwrap()
    }
    pub fn shutdown(&self) -> Result<(), ServerError> {
        self.engine.shutdown()
    }
}

/// Open the ring, applying the auto-recovery policy on a corrupt or
/// old-version buffer: 0 = refuse, 1 = set the files aside, 2 = delete
/// them.  A failure of the second open attempt is fatal.
///
pub fn open_ring(
    spec: &RingSpec,
    factory: &dyn EngineFactory,
    auto_recovery: u8,
) -> Result<RingHandle, ServerError> {
    match factory.open(spec) {
        Ok(engine) => Ok(RingHandle::new(engine)),
        Err(RingOpenError::Fatal(reason)) => Err(ServerError::RingInit(reason)),
        Err(RingOpenError::Corrupt) => {
            warn!("packet buffer is corrupt");
            recover(spec, factory, auto_recovery, None)
        }
        Err(RingOpenError::Version(v)) => {
            warn!("packet buffer has old version {}", v);
            recover(spec, factory, auto_recovery, Some(v))
        }
    }
}

fn recover(
    spec: &RingSpec,
    factory: &dyn EngineFactory,
    auto_recovery: u8,
    version: Option<u32>,
) -> Result<RingHandle, ServerError> {
    if auto_recovery == 0 {
        return Err(ServerError::RingInit(String::from(
            "packet buffer unusable and auto recovery is off",
        )));
    }
    // Only version 1 has a loader; refuse anything else before
    // touching the files.
    if let Some(v) = version {
        if v != 1 {
            return Err(ServerError::RingVersion(v));
        }
    }
    let suffix = match version {
        Some(v) => format!(".version{}", v),
        None => String::from(".corrupt"),
    };
    let backups = if auto_recovery == 1 {
        Some(set_aside(&spec.dir, &suffix)?)
    } else {
        remove_ring_files(&spec.dir)?;
        None
    };
    let engine = factory.open(spec).map_err(|e| {
        ServerError::RingRecovery(format!("re-initialization failed: {:?}", e))
    })?;
    let handle = RingHandle::new(engine);
    if let (Some(1), Some((pktbuf_backup, idx_backup))) = (version, backups.as_ref()) {
        let replayed = load_buffer_v1(pktbuf_backup, &handle)?;
        info!(
            "replayed {} packets from version-1 buffer {}",
            replayed,
            pktbuf_backup.display()
        );
        // The backups served their purpose.
        let _ = fs::remove_file(pktbuf_backup);
        let _ = fs::remove_file(idx_backup);
    }
    Ok(handle)
}

/// Rename the ring files to `<file><suffix>` siblings, never
/// clobbering an earlier backup: if the suffix is taken, a numbered
/// variant (`<suffix>.1`, `<suffix>.2`, ...) is used for both files.
///
fn set_aside(dir: &Path, suffix: &str) -> Result<(PathBuf, PathBuf), ServerError> {
    let pktbuf = dir.join(PACKET_BUFFER_FILE);
    let idx = dir.join(STREAM_INDEX_FILE);
    let mut n = 0;
    let (pktbuf_to, idx_to) = loop {
        let tag = if n == 0 {
            String::from(suffix)
        } else {
            format!("{}.{}", suffix, n)
        };
        let p = dir.join(format!("{}{}", PACKET_BUFFER_FILE, tag));
        let i = dir.join(format!("{}{}", STREAM_INDEX_FILE, tag));
        if !p.exists() && !i.exists() {
            break (p, i);
        }
        n += 1;
    };
    if pktbuf.exists() {
        fs::rename(&pktbuf, &pktbuf_to)?;
        info!("moved {} to {}", pktbuf.display(), pktbuf_to.display());
    }
    if idx.exists() {
        fs::rename(&idx, &idx_to)?;
        info!("moved {} to {}", idx.display(), idx_to.display());
    }
    Ok((pktbuf_to, idx_to))
}

fn remove_ring_files(dir: &Path) -> Result<(), ServerError> {
    for name in &[PACKET_BUFFER_FILE, STREAM_INDEX_FILE] {
        let path = dir.join(name);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("deleted {}", path.display());
        }
    }
    Ok(())
}

/// Replay a version-1 packet buffer into a freshly initialized ring.
/// The v1 layout is an 8 byte header (magic + version) followed by
/// records of `u32 stream id length, stream id, u32 payload length,
/// payload`, all little endian.  Returns the number of packets
/// replayed.
///
pub fn load_buffer_v1(backup: &Path, ring: &RingHandle) -> Result<u64, ServerError> {
    let mut file = fs::File::open(backup)
        .map_err(|e| ServerError::RingRecovery(format!("cannot open v1 backup: {}", e)))?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|e| ServerError::RingRecovery(format!("short v1 header: {}", e)))?;
    let mut count = 0u64;
    loop {
        let mut len = [0u8; 4];
        match file.read_exact(&mut len) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(ServerError::RingRecovery(format!(
                    "truncated v1 record: {}",
                    e
                )))
            }
        }
        let mut sid = vec![0u8; u32::from_le_bytes(len) as usize];
        file.read_exact(&mut sid)
            .map_err(|e| ServerError::RingRecovery(format!("truncated v1 stream id: {}", e)))?;
        let stream_id = String::from_utf8_lossy(&sid).into_owned();
        file.read_exact(&mut len)
            .map_err(|e| ServerError::RingRecovery(format!("truncated v1 record: {}", e)))?;
        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        file.read_exact(&mut payload)
            .map_err(|e| ServerError::RingRecovery(format!("truncated v1 payload: {}", e)))?;
        ring.write_packet(&stream_id, &payload)?;
        count += 1;
    }
    Ok(count)
}

/// The built-in engine: packet storage in memory, offsets maintained
/// with the same wrap-around arithmetic the persistent engine uses,
/// and a version-stamped header file on disk so that startup recovery
/// has something real to inspect.  Volatile configurations skip the
/// files entirely.
///
pub struct MemoryRing {
    spec: RingSpec,
    packets: AtomicU64,
    shutdowns: AtomicUsize,
}

impl MemoryRing {
    pub fn new(spec: RingSpec) -> MemoryRing {
        MemoryRing {
            spec,
            packets: AtomicU64::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }
    /// How many times shutdown ran.  The supervisor must make this
    /// exactly one.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
    fn slots(&self) -> u64 {
        (self.spec.size / u64::from(self.spec.pkt_size)).max(1)
    }
    fn write_header(&self) -> Result<(), ServerError> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(BUFFER_MAGIC);
        buf.extend_from_slice(&BUFFER_VERSION.to_le_bytes());
        fs::write(self.spec.dir.join(PACKET_BUFFER_FILE), &buf)?;
        let idx = self.spec.dir.join(STREAM_INDEX_FILE);
        if !idx.exists() {
            fs::File::create(&idx)?.flush()?;
        }
        Ok(())
    }
}

impl RingEngine for MemoryRing {
    fn latest_offset(&self) -> u64 {
        // One slot per packet; offsets derive from how many packets
        // have ever been written.
        let count = self.packets.load(Ordering::SeqCst);
        if count == 0 {
            0
        } else {
            (count - 1) * u64::from(self.spec.pkt_size) % self.spec.size
        }
    }
    fn earliest_offset(&self) -> u64 {
        let count = self.packets.load(Ordering::SeqCst);
        count.saturating_sub(self.slots()) * u64::from(self.spec.pkt_size) % self.spec.size
    }
    fn max_offset(&self) -> u64 {
        self.spec.size
    }
    fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }
    fn write_packet(&self, _stream_id: &str, _payload: &[u8]) -> Result<u64, ServerError> {
        let count = self.packets.fetch_add(1, Ordering::SeqCst);
        Ok(count * u64::from(self.spec.pkt_size) % self.spec.size)
    }
    fn shutdown(&self) -> Result<(), ServerError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if !self.spec.volatile_ring {
            self.write_header()?;
        }
        Ok(())
    }
}

/// Factory for [MemoryRing].  Non-volatile opens validate the header
/// file and report `Corrupt`/`Version` exactly the way the persistent
/// engine would.
///
pub struct MemoryRingFactory;

impl EngineFactory for MemoryRingFactory {
    fn open(&self, spec: &RingSpec) -> Result<Arc<dyn RingEngine>, RingOpenError> {
        if spec.size == 0 || spec.pkt_size == 0 {
            return Err(RingOpenError::Fatal(String::from(
                "ring size and packet size must be non-zero",
            )));
        }
        let ring = MemoryRing::new(spec.clone());
        if !spec.volatile_ring {
            let path = spec.dir.join(PACKET_BUFFER_FILE);
            if path.exists() {
                let mut header = [0u8; 8];
                let readable = fs::File::open(&path)
                    .and_then(|mut f| f.read_exact(&mut header))
                    .is_ok();
                if !readable || &header[0..4] != BUFFER_MAGIC {
                    return Err(RingOpenError::Corrupt);
                }
                let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                if version != BUFFER_VERSION {
                    return Err(RingOpenError::Version(version));
                }
            }
            ring.write_header()
                .map_err(|e| RingOpenError::Fatal(e.to_string()))?;
        }
        Ok(Arc::new(ring))
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    fn spec(dir: &Path) -> RingSpec {
        RingSpec {
            dir: dir.to_path_buf(),
            size: 4096,
            pkt_size: 512,
            memory_map: false,
            volatile_ring: true,
        }
    }

    #[test]
    fn write_1() {
        let tmp = tempfile::tempdir().unwrap();
        let ring = MemoryRing::new(spec(tmp.path()));
        assert_eq!(0, ring.latest_offset());
        let off = ring.write_packet("XX_TEST", b"payload").unwrap();
        assert_eq!(0, off);
        assert_eq!(0, ring.latest_offset());
        assert_eq!(0, ring.earliest_offset());
        assert_eq!(1, ring.packet_count());
        assert_eq!(512, ring.write_packet("XX_TEST", b"next").unwrap());
        assert_eq!(512, ring.latest_offset());
    }
    #[test]
    fn write_2() {
        // Offsets wrap at the ring size and the earliest offset starts
        // moving once the buffer is full (8 slots here).
        let tmp = tempfile::tempdir().unwrap();
        let ring = MemoryRing::new(spec(tmp.path()));
        for _ in 0..10 {
            ring.write_packet("XX_TEST", b"p").unwrap();
        }
        assert_eq!(512, ring.latest_offset());
        assert_eq!(1024, ring.earliest_offset());
    }
}
