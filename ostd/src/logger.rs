// SPDX-License-Identifier: MPL-2.0

//! Logging support.
//!
//! Currently the logger prints the logs to the console of the platform.
//!
//! This module guarantees _atomicity_ under concurrency: messages are always
//! printed in their entirety without being mixed with messages generated
//! concurrently on other cores.

use alloc::format;

use log::{LevelFilter, Metadata, Record};
use spin::Once;

use crate::{boot::KCmdlineArg, prelude::*};

static LOGGER: Once<Logger> = Once::new();

struct Logger {
    machine: Arc<Machine>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = format!("[{:>10.3}]", self.machine.now().as_secs_f64());
        let line = format!("{} {:<5}: {}\n", timestamp, record.level(), record.args());

        // Use a global lock to prevent interleaving of log messages.
        static RECORD_LOCK: spin::Mutex<()> = spin::Mutex::new(());
        let _lock = RECORD_LOCK.lock();

        self.machine.platform().console_write(&line);
    }

    fn flush(&self) {}
}

/// Initializes the logger. Users should avoid using the log macros before
/// this function is called.
///
/// The level comes from the `hinge.log_level` argument and defaults to
/// `off`. Only the first call has an effect, and only if no other logger
/// (e.g., one installed by a test harness) is present.
pub fn init(machine: &Arc<Machine>, cmdline: &KCmdlineArg) {
    let level = get_log_level(cmdline).unwrap_or(LevelFilter::Off);

    let logger = LOGGER.call_once(|| Logger {
        machine: machine.clone(),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

fn get_log_level(cmdline: &KCmdlineArg) -> Option<LevelFilter> {
    let value = cmdline.get_module_value("hinge", "log_level")?;
    Some(match value {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        // Otherwise, OFF
        _ => LevelFilter::Off,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_level_from_cmdline() {
        let level = |s: &str| get_log_level(&KCmdlineArg::from(s));
        assert_eq!(level("hinge.log_level=debug"), Some(LevelFilter::Debug));
        assert_eq!(level("hinge.log_level=loud"), Some(LevelFilter::Off));
        assert_eq!(level("log_level=warn"), None);
    }
}
