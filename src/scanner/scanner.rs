use crate::client::now_epoch;
use crate::config::ScanSpec;
use crate::error::ServerError;
use crate::registry::UnitState;
use crate::supervisor::ServerCore;
use log::{debug, info, warn};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Pause between scan passes.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);
/// Slice of the pause after which the lifecycle state is re-checked.
const SCAN_POLL: Duration = Duration::from_millis(100);

/// The payload of a directory scanner unit: the compiled job
/// description plus the persistent scan position.
///
pub struct ScanJob {
    pub spec: ScanSpec,
    match_re: Option<Regex>,
    reject_re: Option<Regex>,
    /// Files modified at or before this epoch are considered already
    /// ingested.
    threshold: Mutex<u64>,
}

impl ScanJob {
    pub fn new(spec: &ScanSpec) -> Result<ScanJob, ServerError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, ServerError> {
            match pattern {
                Some(p) => Ok(Some(
                    Regex::new(p).map_err(|e| ServerError::BadPattern(p.clone(), e))?,
                )),
                None => Ok(None),
            }
        };
        let mut threshold = 0;
        if let Some(state_file) = &spec.state_file {
            if let Ok(text) = fs::read_to_string(state_file) {
                threshold = text.trim().parse::<u64>().unwrap_or(0);
            } else if spec.init_current_state {
                // First run and asked to skip existing content.
                threshold = now_epoch();
            }
        } else if spec.init_current_state {
            threshold = now_epoch();
        }
        Ok(ScanJob {
            spec: spec.clone(),
            match_re: compile(&spec.match_pattern)?,
            reject_re: compile(&spec.reject_pattern)?,
            threshold: Mutex::new(threshold),
        })
    }
    pub fn threshold(&self) -> u64 {
        *self.threshold.lock().unwrap()
    }
    fn wants(&self, name: &str) -> bool {
        if let Some(re) = &self.match_re {
            if !re.is_match(name) {
                return false;
            }
        }
        if let Some(re) = &self.reject_re {
            if re.is_match(name) {
                return false;
            }
        }
        true
    }
    fn save_state(&self) {
        if let Some(state_file) = &self.spec.state_file {
            if let Err(e) = fs::write(state_file, format!("{}\n", self.threshold())) {
                warn!("cannot write scan state {}: {}", state_file.display(), e);
            }
        }
    }
}

/// One scan pass over the job's directory tree.  Files whose name
/// passes the filters and whose mtime is beyond the job's threshold go
/// to `on_new`; everything else goes to `on_skip`.  The threshold
/// advances to the newest mtime seen.
///
pub fn scan_directory(
    job: &ScanJob,
    on_new: &mut dyn FnMut(&Path),
    on_skip: &mut dyn FnMut(&Path),
) -> std::io::Result<usize> {
    let mut found = 0;
    let mut newest = job.threshold();
    let mut stack = vec![job.spec.path.clone()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Only the job's root directory is fatal to the pass; a
            // vanished subdirectory just gets skipped.
            Err(e) if dir == job.spec.path => return Err(e),
            Err(_) => continue,
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path: PathBuf = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if job.wants(name) && mtime > job.threshold() {
                on_new(&path);
                found += 1;
                if mtime > newest {
                    newest = mtime;
                }
            } else {
                on_skip(&path);
            }
        }
    }
    *job.threshold.lock().unwrap() = newest;
    Ok(found)
}

pub fn spawn_scanner(
    core: &Arc<ServerCore>,
    job: Arc<ScanJob>,
    unit: Arc<UnitState>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let core = Arc::clone(core);
    thread::Builder::new()
        .name(format!("scan-{}", job.spec.path.display()))
        .spawn(move || run_scanner(core, job, unit))
}

/// The scanner worker: scan, nap, repeat until asked to stop.
///
pub fn run_scanner(core: Arc<ServerCore>, job: Arc<ScanJob>, unit: Arc<UnitState>) {
    unit.announce_active();
    info!("scanning {}", job.spec.path.display());
    loop {
        if unit.close_requested() || core.shutdown_requested() {
            unit.begin_closing();
            break;
        }
        let result = scan_directory(
            &job,
            &mut |path| {
                debug!("queueing {} for ingest", path.display());
            },
            &mut |_path| {},
        );
        match result {
            Ok(found) if found > 0 => {
                info!("{}: {} new files", job.spec.path.display(), found);
                job.save_state();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("scan of {} failed: {}", job.spec.path.display(), e);
            }
        }
        // Nap in slices so a close request is honoured promptly.
        let mut napped = Duration::from_millis(0);
        while napped < SCAN_INTERVAL && !unit.close_requested() && !core.shutdown_requested() {
            thread::sleep(SCAN_POLL);
            napped += SCAN_POLL;
        }
    }
    job.save_state();
    unit.mark_closed();
}

#[cfg(test)]
mod scan_tests {
    use super::*;

    fn job(dir: &Path, pattern: Option<&str>, reject: Option<&str>) -> ScanJob {
        ScanJob::new(&ScanSpec {
            path: dir.to_path_buf(),
            state_file: None,
            match_pattern: pattern.map(String::from),
            reject_pattern: reject.map(String::from),
            init_current_state: false,
        })
        .unwrap()
    }

    #[test]
    fn scan_1() {
        // Name filters: match wins entry, reject vetoes.
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.mseed"), b"x").unwrap();
        fs::write(tmp.path().join("b.mseed.part"), b"x").unwrap();
        fs::write(tmp.path().join("c.txt"), b"x").unwrap();
        let job = job(tmp.path(), Some("\\.mseed"), Some("\\.part$"));
        let mut new_files = Vec::new();
        scan_directory(&job, &mut |p| new_files.push(p.to_path_buf()), &mut |_| {}).unwrap();
        assert_eq!(1, new_files.len());
        assert!(new_files[0].ends_with("a.mseed"));
    }
    #[test]
    fn scan_2() {
        // The threshold advances: a second pass sees nothing new.
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.dat"), b"x").unwrap();
        let job = job(tmp.path(), None, None);
        let count = scan_directory(&job, &mut |_| {}, &mut |_| {}).unwrap();
        assert_eq!(1, count);
        let count = scan_directory(&job, &mut |_| {}, &mut |_| {}).unwrap();
        assert_eq!(0, count);
    }
    #[test]
    fn scan_3() {
        // Subdirectories are walked.
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("deep.dat"), b"x").unwrap();
        let job = job(tmp.path(), None, None);
        let mut seen = 0;
        scan_directory(&job, &mut |_| seen += 1, &mut |_| {}).unwrap();
        assert_eq!(1, seen);
    }
    #[test]
    fn state_1() {
        // The state file persists and reloads the threshold.
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("scan.state");
        fs::write(&state, "12345\n").unwrap();
        let spec = ScanSpec {
            path: tmp.path().to_path_buf(),
            state_file: Some(state),
            match_pattern: None,
            reject_pattern: None,
            init_current_state: false,
        };
        let job = ScanJob::new(&spec).unwrap();
        assert_eq!(12345, job.threshold());
    }
}
