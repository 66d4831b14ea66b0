// SPDX-License-Identifier: MPL-2.0

//! The module to parse kernel command-line arguments.
//!
//! The format of the command line string conforms to the Linux kernel
//! command line rules:
//!
//! <https://www.kernel.org/doc/html/v6.4/admin-guide/kernel-parameters.html>
//!
//! Arguments without a dot in their name (`nosmp`, `maxcpus=2`) are kernel
//! arguments. Arguments of the form `module.option[=value]` are collected
//! per module.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

/// A parsed argument.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ModuleArg {
    /// A flag without value.
    Arg(String),
    /// A key-value argument.
    KeyVal(String, String),
}

impl ModuleArg {
    fn name(&self) -> &str {
        match self {
            ModuleArg::Arg(name) | ModuleArg::KeyVal(name, _) => name,
        }
    }
}

/// The struct to store the parsed kernel command-line arguments.
#[derive(Debug, Default)]
pub struct KCmdlineArg {
    kernel_args: Vec<ModuleArg>,
    module_args: BTreeMap<String, Vec<ModuleArg>>,
}

// Define get APIs.
impl KCmdlineArg {
    /// Returns whether the kernel flag `name` is present.
    pub fn has_flag(&self, name: &str) -> bool {
        self.kernel_args
            .iter()
            .any(|arg| matches!(arg, ModuleArg::Arg(flag) if flag == name))
    }

    /// Returns the value of the kernel argument `name`.
    ///
    /// If the argument is given several times, the last one wins.
    pub fn get_value(&self, name: &str) -> Option<&str> {
        find_value(&self.kernel_args, name)
    }

    /// Gets the argument vector of a kernel module.
    pub fn get_module_args(&self, module: &str) -> Option<&Vec<ModuleArg>> {
        self.module_args.get(module)
    }

    /// Returns the value of the option `key` of `module`.
    pub fn get_module_value(&self, module: &str, key: &str) -> Option<&str> {
        find_value(self.module_args.get(module)?, key)
    }
}

fn find_value<'a>(args: &'a [ModuleArg], name: &str) -> Option<&'a str> {
    args.iter().rev().find_map(|arg| match arg {
        ModuleArg::KeyVal(key, value) if key == name => Some(value.as_str()),
        _ => None,
    })
}

// Splits the command line string by spaces but preserve
// ones that are protected by double quotes(`"`).
fn split_arg(input: &str) -> impl Iterator<Item = &str> {
    let mut inside_quotes = false;

    input
        .split(move |c: char| {
            if c == '"' {
                inside_quotes = !inside_quotes;
            }

            !inside_quotes && c.is_whitespace()
        })
        .filter(|arg| !arg.is_empty())
}

// Define the way to parse a string to `KCmdlineArg`.
impl From<&str> for KCmdlineArg {
    fn from(cmdline: &str) -> Self {
        let mut result = KCmdlineArg::default();

        for arg in split_arg(cmdline) {
            // Everything after "--" belongs to the init process.
            if arg == "--" {
                break;
            }
            // Arg => Entry | Entry "=" Value
            let (entry, value) = match arg.split_once('=') {
                Some((entry, value)) => (entry, Some(value.trim_matches('"'))),
                None => (arg, None),
            };
            // Entry => Module "." ModuleOptionName | KernelOptionName
            let entry_pattern: Vec<_> = entry.split('.').collect();
            let (node, option) = match entry_pattern.as_slice() {
                [option] => (None, *option),
                [module, option] => (Some(*module), *option),
                _ => {
                    log::warn!(
                        "[KCmdline] Unable to parse entry {} in argument {}, skip for now",
                        entry,
                        arg
                    );
                    continue;
                }
            };
            if option.is_empty() {
                log::warn!("[KCmdline] Empty option in argument {}, skip for now", arg);
                continue;
            }

            let parsed = match value {
                Some(value) => ModuleArg::KeyVal(option.to_string(), value.to_string()),
                None => ModuleArg::Arg(option.to_string()),
            };
            match node {
                Some(modname) => result
                    .module_args
                    .entry(modname.to_string())
                    .or_default()
                    .push(parsed),
                None => result.kernel_args.push(parsed),
            }
        }

        result
    }
}

impl KCmdlineArg {
    /// Returns an iterator over the names of the kernel arguments.
    pub fn kernel_arg_names(&self) -> impl Iterator<Item = &str> {
        self.kernel_args.iter().map(ModuleArg::name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kernel_flags_and_values() {
        let args = KCmdlineArg::from("console=ttyAMA0 nosmp  maxcpus=2 maxcpus=3");
        assert!(args.has_flag("nosmp"));
        assert!(!args.has_flag("maxcpus"));
        assert_eq!(args.get_value("maxcpus"), Some("3"));
        assert_eq!(args.get_value("console"), Some("ttyAMA0"));
        assert_eq!(args.get_value("nr_cpus"), None);
        assert_eq!(
            args.kernel_arg_names().collect::<Vec<_>>(),
            ["console", "nosmp", "maxcpus", "maxcpus"]
        );
    }

    #[test]
    fn module_args_are_grouped() {
        let args = KCmdlineArg::from("hinge.log_level=debug hinge.quiet other.x=1 a.b.c=2");
        assert_eq!(args.get_module_value("hinge", "log_level"), Some("debug"));
        assert_eq!(
            args.get_module_args("hinge").unwrap(),
            &vec![
                ModuleArg::KeyVal("log_level".to_string(), "debug".to_string()),
                ModuleArg::Arg("quiet".to_string()),
            ]
        );
        assert_eq!(args.get_module_value("other", "x"), Some("1"));
        assert!(args.get_module_args("a").is_none());
    }

    #[test]
    fn quotes_and_init_args() {
        let args = KCmdlineArg::from("label=\"two words\" nosmp -- maxcpus=1");
        assert_eq!(args.get_value("label"), Some("two words"));
        assert!(args.has_flag("nosmp"));
        assert_eq!(args.get_value("maxcpus"), None);
    }
}
