// SPDX-License-Identifier: MPL-2.0

//! Boot-time information handed over by the bootloader.

pub mod kcmdline;

pub use kcmdline::{KCmdlineArg, ModuleArg};
