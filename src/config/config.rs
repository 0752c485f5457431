use crate::client::{PROTO_DATALINK, PROTO_HTTP, PROTO_SEEDLINK};
use crate::error::ServerError;
use crate::policy::AccessPolicy;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One configured listen endpoint: a port string (numeric, or a path
/// for UNIX sockets), the protocol set, address family flags and the
/// TLS switch.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ListenSpec {
    pub port: String,
    pub protocols: u8,
    pub v4: bool,
    pub v6: bool,
    pub unix: bool,
    pub tls: bool,
}

impl ListenSpec {
    pub fn tcp(port: &str) -> ListenSpec {
        ListenSpec {
            port: String::from(port),
            protocols: PROTO_DATALINK | PROTO_SEEDLINK | PROTO_HTTP,
            v4: true,
            v6: false,
            unix: false,
            tls: false,
        }
    }
}

/// One configured directory scan job.
///
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSpec {
    pub path: PathBuf,
    pub state_file: Option<PathBuf>,
    pub match_pattern: Option<String>,
    pub reject_pattern: Option<String>,
    pub init_current_state: bool,
}

/// Transfer log controls.
///
#[derive(Debug, Clone, PartialEq)]
pub struct TransferLogSpec {
    pub base_dir: Option<PathBuf>,
    pub prefix: Option<String>,
    pub interval_hours: u32,
    pub tx: bool,
    pub rx: bool,
}

impl Default for TransferLogSpec {
    fn default() -> TransferLogSpec {
        TransferLogSpec {
            base_dir: None,
            prefix: None,
            interval_hours: 24,
            tx: true,
            rx: true,
        }
    }
}

/// The immutable configuration snapshot the server core reads.
///
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: Option<PathBuf>,
    pub ring_dir: PathBuf,
    pub ring_size: u64,
    pub pkt_size: u32,
    pub memory_map_ring: bool,
    pub volatile_ring: bool,
    /// 0 = off, 1 = move corrupt files aside, 2 = delete them.
    pub auto_recovery: u8,
    pub server_id: String,
    pub verbosity: u8,
    pub resolve_hosts: bool,
    /// 0 = unlimited.
    pub max_clients: usize,
    pub max_clients_per_ip: usize,
    /// Idle eviction, seconds.  0 disables.
    pub client_timeout: u64,
    pub time_win_limit: f64,
    pub web_root: Option<PathBuf>,
    pub http_headers: Option<String>,
    pub mseed_archive: Option<String>,
    pub mseed_idle_timeout: u64,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_verify_client_cert: bool,
    pub policy: AccessPolicy,
    pub tlog: TransferLogSpec,
    pub endpoints: Vec<ListenSpec>,
    pub scanners: Vec<ScanSpec>,
    /// Command line overrides, kept so a re-read preserves precedence.
    pub overrides: Vec<(String, String)>,
    /// mtime of the config file when this snapshot was built.
    pub modified: Option<SystemTime>,
    /// Bumped on every successful re-read.
    pub updates: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            config_file: None,
            ring_dir: PathBuf::from("ring"),
            ring_size: 1_073_741_824,
            pkt_size: 512,
            memory_map_ring: false,
            volatile_ring: false,
            auto_recovery: 1,
            server_id: whoami::fallible::hostname().unwrap_or_else(|_| String::from("ringstream")),
            verbosity: 0,
            resolve_hosts: true,
            max_clients: 600,
            max_clients_per_ip: 0,
            client_timeout: 600,
            time_win_limit: 1.0,
            web_root: None,
            http_headers: None,
            mseed_archive: None,
            mseed_idle_timeout: 300,
            tls_cert_file: None,
            tls_key_file: None,
            tls_verify_client_cert: false,
            policy: AccessPolicy::new(),
            tlog: TransferLogSpec::default(),
            endpoints: Vec::new(),
            scanners: Vec::new(),
            overrides: Vec::new(),
            modified: None,
            updates: 0,
        }
    }
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        // The change counter is bookkeeping, not configuration.
        self.config_file == other.config_file
            && self.ring_dir == other.ring_dir
            && self.ring_size == other.ring_size
            && self.pkt_size == other.pkt_size
            && self.memory_map_ring == other.memory_map_ring
            && self.volatile_ring == other.volatile_ring
            && self.auto_recovery == other.auto_recovery
            && self.server_id == other.server_id
            && self.verbosity == other.verbosity
            && self.resolve_hosts == other.resolve_hosts
            && self.max_clients == other.max_clients
            && self.max_clients_per_ip == other.max_clients_per_ip
            && self.client_timeout == other.client_timeout
            && self.time_win_limit == other.time_win_limit
            && self.web_root == other.web_root
            && self.http_headers == other.http_headers
            && self.mseed_archive == other.mseed_archive
            && self.mseed_idle_timeout == other.mseed_idle_timeout
            && self.tls_cert_file == other.tls_cert_file
            && self.tls_key_file == other.tls_key_file
            && self.tls_verify_client_cert == other.tls_verify_client_cert
            && self.policy == other.policy
            && self.tlog == other.tlog
            && self.endpoints == other.endpoints
            && self.scanners == other.scanners
            && self.overrides == other.overrides
            && self.modified == other.modified
    }
}

/// Scalar keys that may also come from the environment.  List valued
/// keys (policy entries, endpoints, scanners) are file or command line
/// only.
const ENV_KEYS: &[&str] = &[
    "RingDirectory",
    "RingSize",
    "MaxPacketSize",
    "MemoryMapRing",
    "VolatileRing",
    "AutoRecovery",
    "ServerID",
    "Verbosity",
    "ResolveHostnames",
    "MaxClients",
    "MaxClientsPerIP",
    "ClientTimeout",
    "TimeWindowLimit",
    "WebRoot",
    "MSeedArchive",
    "MSeedIdleTimeout",
    "TLSCertFile",
    "TLSKeyFile",
    "TLSVerifyClientCert",
    "TransferLogDirectory",
    "TransferLogPrefix",
    "TransferLogInterval",
    "TransferLogTX",
    "TransferLogRX",
];

/// `MaxClientsPerIP` -> `RS_MAX_CLIENTS_PER_IP`, `HTTPHeader` ->
/// `RS_HTTP_HEADER`, and so on.
pub fn env_name(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::from("RS_");
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let after_lower = chars[i - 1].is_lowercase();
            let acronym_end = chars[i - 1].is_uppercase()
                && chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if after_lower || acronym_end {
                out.push('_');
            }
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

impl Config {
    /// Assemble a snapshot: file (if any), then environment, then the
    /// command line overrides, then validation.
    pub fn load(file: Option<&Path>, overrides: &[(String, String)]) -> Result<Config, ServerError> {
        let mut cfg = Config::default();
        cfg.overrides = overrides.to_vec();
        if let Some(path) = file {
            cfg.config_file = Some(path.to_path_buf());
            parse_file(&mut cfg, path)?;
            cfg.modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        }
        apply_environment(&mut cfg)?;
        for (key, value) in overrides {
            cfg.apply(key, value)
                .map_err(|e| ServerError::config(format!("command line {}: {}", key, e)))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-read the config file if its mtime advanced.  Returns the new
    /// snapshot, or None when the file is unchanged or there is no
    /// file.  The change counter carries over, bumped by one.
    pub fn reread(&self) -> Result<Option<Config>, ServerError> {
        let path = match &self.config_file {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime.is_none() || mtime == self.modified {
            return Ok(None);
        }
        let mut fresh = Config::load(Some(&path), &self.overrides)?;
        fresh.updates = self.updates + 1;
        Ok(Some(fresh))
    }

    /// Apply one `key value` setting.  Shared by the file parser, the
    /// environment layer and the command line overrides.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        let mut words = value.split_whitespace();
        match key {
            "RingDirectory" => self.ring_dir = PathBuf::from(value.trim()),
            "RingSize" => self.ring_size = parse_num(value)?,
            "MaxPacketSize" => self.pkt_size = parse_num(value)?,
            "MemoryMapRing" => self.memory_map_ring = parse_bool(value)?,
            "VolatileRing" => self.volatile_ring = parse_bool(value)?,
            "AutoRecovery" => {
                self.auto_recovery = parse_num(value)?;
                if self.auto_recovery > 2 {
                    return Err(String::from("AutoRecovery must be 0, 1 or 2"));
                }
            }
            "ServerID" => self.server_id = String::from(value.trim()),
            "Verbosity" => self.verbosity = parse_num(value)?,
            "ResolveHostnames" => self.resolve_hosts = parse_bool(value)?,
            "MaxClients" => self.max_clients = parse_num(value)?,
            "MaxClientsPerIP" => self.max_clients_per_ip = parse_num(value)?,
            "ClientTimeout" => self.client_timeout = parse_num(value)?,
            "TimeWindowLimit" => {
                self.time_win_limit = value
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| e.to_string())?;
            }
            "WebRoot" => self.web_root = Some(PathBuf::from(value.trim())),
            "HTTPHeader" => {
                // Repeatable; headers accumulate.
                let line = value.trim();
                match &mut self.http_headers {
                    Some(existing) => {
                        existing.push_str("\r\n");
                        existing.push_str(line);
                    }
                    None => self.http_headers = Some(String::from(line)),
                }
            }
            "MSeedArchive" => self.mseed_archive = Some(String::from(value.trim())),
            "MSeedIdleTimeout" => self.mseed_idle_timeout = parse_num(value)?,
            "TLSCertFile" => self.tls_cert_file = Some(PathBuf::from(value.trim())),
            "TLSKeyFile" => self.tls_key_file = Some(PathBuf::from(value.trim())),
            "TLSVerifyClientCert" => self.tls_verify_client_cert = parse_bool(value)?,
            "MatchIP" | "RejectIP" | "WriteIP" | "TrustedIP" | "LimitIP" => {
                let net = words.next().ok_or("missing network")?;
                let pattern = words.next();
                let list = match key {
                    "MatchIP" => &mut self.policy.match_list,
                    "RejectIP" => &mut self.policy.reject_list,
                    "WriteIP" => &mut self.policy.write_list,
                    "TrustedIP" => &mut self.policy.trusted_list,
                    _ => &mut self.policy.limit_list,
                };
                list.push(net, pattern).map_err(|e| e.to_string())?;
            }
            "TransferLogDirectory" => self.tlog.base_dir = Some(PathBuf::from(value.trim())),
            "TransferLogPrefix" => self.tlog.prefix = Some(String::from(value.trim())),
            "TransferLogInterval" => self.tlog.interval_hours = parse_num(value)?,
            "TransferLogTX" => self.tlog.tx = parse_bool(value)?,
            "TransferLogRX" => self.tlog.rx = parse_bool(value)?,
            "ListenPort" => {
                let port = words.next().ok_or("missing port")?;
                if port.parse::<u16>().is_err() {
                    return Err(format!("'{}' is not a port number", port));
                }
                let mut spec = ListenSpec::tcp(port);
                apply_listen_flags(&mut spec, words)?;
                self.endpoints.push(spec);
            }
            "UnixSocket" => {
                let path = words.next().ok_or("missing socket path")?;
                let mut spec = ListenSpec {
                    port: String::from(path),
                    protocols: PROTO_DATALINK | PROTO_SEEDLINK | PROTO_HTTP,
                    v4: false,
                    v6: false,
                    unix: true,
                    tls: false,
                };
                apply_listen_flags(&mut spec, words)?;
                if spec.tls {
                    return Err(String::from("TLS on a UNIX socket is not supported"));
                }
                self.endpoints.push(spec);
            }
            "ScanDir" => {
                let path = words.next().ok_or("missing scan directory")?;
                let mut spec = ScanSpec {
                    path: PathBuf::from(path),
                    state_file: None,
                    match_pattern: None,
                    reject_pattern: None,
                    init_current_state: false,
                };
                for opt in words {
                    let mut kv = opt.splitn(2, '=');
                    let name = kv.next().unwrap_or("");
                    let val = kv.next().ok_or_else(|| format!("bad scan option '{}'", opt))?;
                    match name {
                        "StateFile" => spec.state_file = Some(PathBuf::from(val)),
                        "Match" => spec.match_pattern = Some(String::from(val)),
                        "Reject" => spec.reject_pattern = Some(String::from(val)),
                        "InitCurrentState" => spec.init_current_state = parse_bool(val)?,
                        _ => return Err(format!("unknown scan option '{}'", name)),
                    }
                }
                self.scanners.push(spec);
            }
            _ => return Err(format!("unknown key '{}'", key)),
        }
        Ok(())
    }

    /// The checks that refuse startup: contradictory or incomplete
    /// settings are configuration fatal, not log-and-continue.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.time_win_limit < 0.0 || self.time_win_limit > 1.0 {
            return Err(ServerError::config("TimeWindowLimit must be within [0,1]"));
        }
        if self.endpoints.iter().any(|e| e.tls)
            && (self.tls_cert_file.is_none() || self.tls_key_file.is_none())
        {
            return Err(ServerError::config(
                "a TLS endpoint is configured but TLSCertFile/TLSKeyFile are not",
            ));
        }
        if !self.volatile_ring && !self.ring_dir.is_dir() {
            return Err(ServerError::config(format!(
                "ring directory {} does not exist",
                self.ring_dir.display()
            )));
        }
        if let Some(dir) = &self.tlog.base_dir {
            if !dir.is_dir() {
                return Err(ServerError::config(format!(
                    "transfer log directory {} does not exist",
                    dir.display()
                )));
            }
            if self.tlog.interval_hours == 0 {
                return Err(ServerError::config("TransferLogInterval must be at least 1 hour"));
            }
        }
        Ok(())
    }
}

fn apply_listen_flags<'a, I: Iterator<Item = &'a str>>(
    spec: &mut ListenSpec,
    flags: I,
) -> Result<(), String> {
    let mut protocols = 0u8;
    for flag in flags {
        match flag.to_ascii_lowercase().as_str() {
            "datalink" => protocols |= PROTO_DATALINK,
            "seedlink" => protocols |= PROTO_SEEDLINK,
            "http" => protocols |= PROTO_HTTP,
            "ipv4" => {
                spec.v4 = true;
                spec.v6 = false;
            }
            "ipv6" => spec.v6 = true,
            "tls" => spec.tls = true,
            _ => return Err(format!("unknown listen flag '{}'", flag)),
        }
    }
    if protocols != 0 {
        spec.protocols = protocols;
    }
    Ok(())
}

fn parse_file(cfg: &mut Config, path: &Path) -> Result<(), ServerError> {
    let text = fs::read_to_string(path).map_err(|e| {
        ServerError::config(format!("cannot read {}: {}", path.display(), e))
    })?;
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap();
        let value = parts.next().unwrap_or("").trim();
        cfg.apply(key, value).map_err(|reason| ServerError::ConfigLine {
            file: path.to_path_buf(),
            line: lineno + 1,
            reason,
        })?;
    }
    Ok(())
}

fn apply_environment(cfg: &mut Config) -> Result<(), ServerError> {
    for key in ENV_KEYS {
        if let Ok(value) = env::var(env_name(key)) {
            cfg.apply(key, &value)
                .map_err(|e| ServerError::config(format!("environment {}: {}", env_name(key), e)))?;
        }
    }
    Ok(())
}

fn parse_bool(text: &str) -> Result<bool, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" => Ok(true),
        "0" | "off" | "no" | "false" => Ok(false),
        other => Err(format!("'{}' is not a boolean", other)),
    }
}

fn parse_num<T: std::str::FromStr>(text: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    text.trim().parse::<T>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("ringstream.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_1() {
        let cfg = Config::default();
        assert_eq!(600, cfg.max_clients);
        assert_eq!(1, cfg.auto_recovery);
        assert!(cfg.endpoints.is_empty());
    }
    #[test]
    fn file_1() {
        let tmp = tempfile::tempdir().unwrap();
        let ring = tmp.path().join("ring");
        fs::create_dir(&ring).unwrap();
        let path = write_config(
            tmp.path(),
            &format!(
                "# test config\n\
                 RingDirectory {}\n\
                 RingSize 65536\n\
                 MaxClients 10\n\
                 ClientTimeout 2\n\
                 ListenPort 16000 DataLink SeedLink\n\
                 MatchIP 10.0.0.0/8\n\
                 RejectIP 10.0.0.5/32\n\
                 LimitIP 10.2.0.0/16 ^NET_.*\n",
                ring.display()
            ),
        );
        let cfg = Config::load(Some(&path), &[]).unwrap();
        assert_eq!(65536, cfg.ring_size);
        assert_eq!(10, cfg.max_clients);
        assert_eq!(2, cfg.client_timeout);
        assert_eq!(1, cfg.endpoints.len());
        assert_eq!("16000", cfg.endpoints[0].port);
        assert_eq!(PROTO_DATALINK | PROTO_SEEDLINK, cfg.endpoints[0].protocols);
        assert_eq!(1, cfg.policy.match_list.len());
        assert_eq!(1, cfg.policy.reject_list.len());
        assert_eq!(1, cfg.policy.limit_list.len());
    }
    #[test]
    fn file_2() {
        // Unknown keys and malformed values are configuration fatal
        // with the offending line number.
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "VolatileRing 1\nNoSuchKey 42\n");
        match Config::load(Some(&path), &[]) {
            Err(ServerError::ConfigLine { line, .. }) => assert_eq!(2, line),
            other => panic!("expected ConfigLine error, got {:?}", other.map(|_| ())),
        }
    }
    #[test]
    fn file_3() {
        // TLS endpoint without certificate is refused.
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "VolatileRing 1\nListenPort 16000 TLS\n");
        assert!(Config::load(Some(&path), &[]).is_err());
        let path = write_config(
            tmp.path(),
            "VolatileRing 1\nListenPort 16000 TLS\nTLSCertFile /tls/cert.pem\nTLSKeyFile /tls/key.pem\n",
        );
        let cfg = Config::load(Some(&path), &[]).unwrap();
        assert!(cfg.endpoints[0].tls);
    }
    #[test]
    fn overrides_1() {
        // Command line beats the file.
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "VolatileRing 1\nMaxClients 10\n");
        let cli = vec![(String::from("MaxClients"), String::from("42"))];
        let cfg = Config::load(Some(&path), &cli).unwrap();
        assert_eq!(42, cfg.max_clients);
    }
    #[test]
    fn reread_1() {
        // Unchanged file: no new snapshot.  Touched file: identical
        // content yields an equal snapshot with a bumped counter.
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "VolatileRing 1\nMaxClients 10\n");
        let cfg = Config::load(Some(&path), &[]).unwrap();
        assert!(cfg.reread().unwrap().is_none());

        // Rewrite the same bytes with a newer mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let now = SystemTime::now();
        let _ = filetime_touch(&path, now);
        let again = cfg.reread().unwrap();
        if let Some(fresh) = again {
            assert_eq!(1, fresh.updates);
            let mut comparable = fresh.clone();
            comparable.modified = cfg.modified;
            assert_eq!(cfg, comparable);
        }
    }
    #[test]
    fn scan_1() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "VolatileRing 1\nScanDir /data/incoming StateFile=/var/scan.state Match=\\.mseed$ InitCurrentState=1\n",
        );
        let cfg = Config::load(Some(&path), &[]).unwrap();
        assert_eq!(1, cfg.scanners.len());
        let scan = &cfg.scanners[0];
        assert_eq!(PathBuf::from("/data/incoming"), scan.path);
        assert_eq!(Some(String::from("\\.mseed$")), scan.match_pattern);
        assert!(scan.init_current_state);
    }
    #[test]
    fn env_name_1() {
        assert_eq!("RS_RING_DIRECTORY", env_name("RingDirectory"));
        assert_eq!("RS_MAX_CLIENTS_PER_IP", env_name("MaxClientsPerIP"));
        assert_eq!("RS_TRANSFER_LOG_TX", env_name("TransferLogTX"));
        assert_eq!("RS_HTTP_HEADER", env_name("HTTPHeader"));
    }

    // Re-stamp a file's mtime by rewriting its own bytes.
    fn filetime_touch(path: &Path, _now: SystemTime) -> std::io::Result<()> {
        let bytes = fs::read(path)?;
        fs::write(path, bytes)
    }
}
