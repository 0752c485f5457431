use crate::error::ServerError;
use log::{error, info};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGTERM, SIGUSR1};
use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Implemented by whoever can produce the high verbosity state dump
/// (the server core); the dispatcher calls it on SIGUSR1 through a
/// shared handle.
///
pub trait DiagnosticSink: Send + Sync {
    fn dump_diagnostics(&self);
}

/// The running dispatcher thread plus the handle used to cancel its
/// signal iterator at shutdown.
///
pub struct SignalDispatcher {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalDispatcher {
    /// Neutralise SIGPIPE and start the dispatcher thread.  `shutdown`
    /// is the single process wide flag the supervisor polls on its
    /// tick.
    pub fn spawn(
        shutdown: Arc<AtomicBool>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Result<SignalDispatcher, ServerError> {
        // An empty handler is enough: writes to a closed socket now
        // fail with EPIPE instead of raising the default action.
        unsafe {
            signal_hook::low_level::register(SIGPIPE, || {}).map_err(ServerError::Signals)?;
        }
        let mut signals =
            Signals::new(&[SIGINT, SIGTERM, SIGHUP, SIGUSR1]).map_err(ServerError::Signals)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name(String::from("signals"))
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGINT | SIGTERM => {
                            info!("received termination signal {}, shutting down", signal);
                            shutdown.store(true, Ordering::SeqCst);
                        }
                        SIGUSR1 => {
                            info!("received SIGUSR1, dumping state");
                            diagnostics.dump_diagnostics();
                        }
                        other => {
                            info!("ignoring signal {}", other);
                        }
                    }
                }
            })
            .map_err(ServerError::Signals)?;
        Ok(SignalDispatcher {
            handle,
            thread: Some(thread),
        })
    }

    /// Cancel the signal iterator and join the thread.  Join errors
    /// are logged and swallowed.
    pub fn shutdown(mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("signal dispatcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;
    use signal_hook::low_level::raise;
    use std::time::Duration;

    struct CountingSink(std::sync::atomic::AtomicUsize);
    impl DiagnosticSink for CountingSink {
        fn dump_diagnostics(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_1() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
        let sink_handle: Arc<dyn DiagnosticSink> = sink.clone();
        let dispatcher = SignalDispatcher::spawn(Arc::clone(&shutdown), sink_handle).unwrap();

        raise(SIGUSR1).unwrap();
        let mut waited = 0;
        while sink.0.load(Ordering::SeqCst) == 0 && waited < 50 {
            thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert_eq!(1, sink.0.load(Ordering::SeqCst));
        assert!(!shutdown.load(Ordering::SeqCst));

        raise(SIGTERM).unwrap();
        waited = 0;
        while !shutdown.load(Ordering::SeqCst) && waited < 50 {
            thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert!(shutdown.load(Ordering::SeqCst));
        dispatcher.shutdown();
    }
}
