// SPDX-License-Identifier: MPL-2.0

//! SMP configuration from the kernel command line.
//!
//! | Argument                        | Meaning                                   |
//! |---------------------------------|-------------------------------------------|
//! | `maxcpus=N`                     | Bring up at most `N` CPUs in `smp_init`   |
//! | `nosmp`                         | Same as `maxcpus=0`                       |
//! | `nr_cpus=N`                     | Limit the number of possible CPUs         |
//! | `hinge.cpu_up_timeout_ms=T`     | Wait `T` ms for a booting CPU             |
//! | `hinge.cpu_die_timeout_ms=T`    | Wait `T` ms for a dying CPU               |
//! | `hinge.smp_stop_timeout_ms=T`   | Wait `T` ms for CPUs to stop              |

use core::{str::FromStr, time::Duration};

use hinge_frame::{boot::KCmdlineArg, cpu::NR_CPUS};

/// The module name of the kernel's own module arguments.
const MODULE_NAME: &str = "hinge";

/// The SMP configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpConfig {
    /// The maximum number of CPUs online after `smp_init`.
    ///
    /// Zero means that no secondary CPU is brought up.
    pub max_cpus: usize,
    /// The limit of possible CPUs, if any.
    pub nr_cpus: Option<usize>,
    /// How long `cpu_up` waits for a booting CPU to come online.
    pub cpu_up_timeout: Duration,
    /// How long `cpu_down` waits for a dying CPU to signal its death.
    pub cpu_die_timeout: Duration,
    /// How long `smp_send_stop` waits for other CPUs to stop.
    pub smp_stop_timeout: Duration,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            max_cpus: NR_CPUS,
            nr_cpus: None,
            cpu_up_timeout: Duration::from_millis(1000),
            cpu_die_timeout: Duration::from_millis(5000),
            smp_stop_timeout: Duration::from_millis(1000),
        }
    }
}

impl SmpConfig {
    /// Builds the configuration from the command line.
    ///
    /// Malformed values are reported and replaced with the defaults.
    pub fn from_cmdline(cmdline: &KCmdlineArg) -> Self {
        let mut config = Self::default();

        if cmdline.has_flag("nosmp") {
            config.max_cpus = 0;
        }
        if let Some(max_cpus) = parse_value(cmdline.get_value("maxcpus"), "maxcpus") {
            config.max_cpus = max_cpus;
        }
        config.nr_cpus = parse_value(cmdline.get_value("nr_cpus"), "nr_cpus")
            .filter(|nr_cpus: &usize| *nr_cpus > 0);

        let timeout = |key: &str, default: Duration| {
            parse_value(cmdline.get_module_value(MODULE_NAME, key), key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        config.cpu_up_timeout = timeout("cpu_up_timeout_ms", config.cpu_up_timeout);
        config.cpu_die_timeout = timeout("cpu_die_timeout_ms", config.cpu_die_timeout);
        config.smp_stop_timeout = timeout("smp_stop_timeout_ms", config.smp_stop_timeout);

        config
    }
}

fn parse_value<T: FromStr>(value: Option<&str>, name: &str) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring malformed command line value {}={}", name, value);
            None
        }
    }
}
