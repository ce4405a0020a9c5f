//! Deferred interrupt handling.
//!
//! A device operation must never be cut off halfway: killing `parted` or
//! `cryptsetup` mid-write leaves a worse state than letting it finish. So
//! SIGINT/SIGTERM/SIGHUP only raise a flag that the executor polls between
//! steps, and external commands run in their own process group so a terminal
//! Ctrl+C does not reach them. A second signal exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// Shared "stop at the next step boundary" flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Install handlers that raise `flag` on the first signal.
/// Call this once at program start
pub fn install_signal_handlers(flag: &InterruptFlag) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let flag = flag.clone();

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if flag.is_raised() {
                warn!("Received second {}, exiting without waiting for the current step", signal_name);
                std::process::exit(128 + sig);
            }

            info!("Received {}, stopping after the current step", signal_name);
            flag.raise();
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the child in its own process group so terminal signals skip it.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.process_group(0)
    }
}
