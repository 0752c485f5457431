use clap::{App, Arg};
use log::{error, info, warn};
use ringstream::client::DiscardDispatcher;
use ringstream::config::Config;
use ringstream::ring::{open_ring, MemoryRingFactory, RingSpec};
use ringstream::signals::{DiagnosticSink, SignalDispatcher};
use ringstream::supervisor::{run, start_units, ServerCore};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// What the command line contributes before the config snapshot is
/// assembled.
///
#[derive(Debug, Clone)]
struct ProgramOptions {
    config_file: Option<PathBuf>,
    log_file: Option<String>,
    verbosity: u64,
    /// Config key overrides, applied with the highest precedence.
    overrides: Vec<(String, String)>,
}

fn main() {
    process::exit(serve());
}

fn serve() -> i32 {
    let options = process_options();
    let level = match options.verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if let Some(file) = &options.log_file {
        if let Err(e) = simple_logging::log_to_file(file, level) {
            eprintln!("Unable to open log file {} : {}", file, e);
            return 1;
        }
    } else {
        simple_logging::log_to_stderr(level);
    }

    let config = match Config::load(options.config_file.as_deref(), &options.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            error!("configuration error: {}", e);
            return 1;
        }
    };
    info!(
        "ringstream {} starting as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.server_id
    );
    if config.endpoints.is_empty() {
        warn!("no listen endpoints configured, nothing will connect");
    }

    let spec = RingSpec {
        dir: config.ring_dir.clone(),
        size: config.ring_size,
        pkt_size: config.pkt_size,
        memory_map: config.memory_map_ring,
        volatile_ring: config.volatile_ring,
    };
    let ring = match open_ring(&spec, &MemoryRingFactory, config.auto_recovery) {
        Ok(ring) => ring,
        Err(e) => {
            error!("cannot initialize the packet buffer: {}", e);
            return 1;
        }
    };
    info!(
        "packet buffer ready in {} ({} bytes, {} byte packets)",
        spec.dir.display(),
        spec.size,
        spec.pkt_size
    );

    let core = ServerCore::new(config, ring, Arc::new(DiscardDispatcher));
    if let Err(e) = start_units(&core) {
        error!("cannot start server units: {}", e);
        return 1;
    }
    let diagnostics: Arc<dyn DiagnosticSink> = core.clone();
    let dispatcher = match SignalDispatcher::spawn(core.shutdown_flag(), diagnostics) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("cannot start the signal dispatcher: {}", e);
            return 1;
        }
    };
    match run(core, Some(dispatcher)) {
        Ok(code) => code,
        Err(e) => {
            error!("server failed: {}", e);
            1
        }
    }
}

/// Argument processing with clap.  Only the common knobs get flags;
/// everything else comes from the config file or `RS_` environment
/// variables.
///
fn process_options() -> ProgramOptions {
    let parser = App::new("ringstream")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Streaming packet buffer server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config-file")
                .value_name("PATH")
                .help("Configuration file (also RS_CONFIG_FILE)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Raise log verbosity, may repeat"),
        )
        .arg(
            Arg::with_name("log")
                .short("l")
                .long("log-file")
                .value_name("PATH")
                .help("File used to log events, stderr when absent")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ring-directory")
                .short("R")
                .long("ring-directory")
                .value_name("PATH")
                .help("Directory holding the packet buffer files")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server-id")
                .short("I")
                .long("server-id")
                .value_name("ID")
                .help("Server identity, defaults to the hostname")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max-clients")
                .short("M")
                .long("max-clients")
                .value_name("N")
                .help("Global client cap, 0 for unlimited")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("L")
                .long("listen-port")
                .value_name("PORT [FLAGS]")
                .help("Listen endpoint, may repeat (e.g. '16000 DataLink')")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .get_matches();

    let mut result = ProgramOptions {
        config_file: None,
        log_file: None,
        verbosity: parser.occurrences_of("verbose"),
        overrides: Vec::new(),
    };
    if let Some(path) = parser.value_of("config") {
        result.config_file = Some(PathBuf::from(path));
    } else if let Ok(path) = env::var("RS_CONFIG_FILE") {
        result.config_file = Some(PathBuf::from(path));
    }
    if let Some(file) = parser.value_of("log") {
        result.log_file = Some(String::from(file));
    }
    if let Some(dir) = parser.value_of("ring-directory") {
        result
            .overrides
            .push((String::from("RingDirectory"), String::from(dir)));
    }
    if let Some(id) = parser.value_of("server-id") {
        result
            .overrides
            .push((String::from("ServerID"), String::from(id)));
    }
    if let Some(max) = parser.value_of("max-clients") {
        if max.parse::<usize>().is_err() {
            eprintln!("The value of --max-clients must be an unsigned integer");
            process::exit(1);
        }
        result
            .overrides
            .push((String::from("MaxClients"), String::from(max)));
    }
    if let Some(endpoints) = parser.values_of("listen") {
        for endpoint in endpoints {
            result
                .overrides
                .push((String::from("ListenPort"), String::from(endpoint)));
        }
    }
    if result.verbosity > 0 {
        result
            .overrides
            .push((String::from("Verbosity"), result.verbosity.to_string()));
    }
    result
}
