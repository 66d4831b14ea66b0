// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Invalid arguments provided.
    InvalidArgs,
    /// The resource is busy, e.g., the last online CPU or a disabled hotplug.
    Busy,
    /// The platform failed to boot or kill a CPU.
    IoError,
    /// The target CPU is not online.
    NotOnline,
    /// The work could not be queued because its executor is gone.
    NotEnqueued,
    /// Insufficient memory available.
    NoMemory,
    /// The given value is out of the supported range.
    OutOfRange,
    /// A bounded wait has expired.
    TimedOut,
    /// The operation would have to block, but the caller asked not to.
    WouldBlock,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let desc = match self {
            Error::InvalidArgs => "invalid arguments",
            Error::Busy => "resource busy",
            Error::IoError => "I/O error",
            Error::NotOnline => "CPU not online",
            Error::NotEnqueued => "work not enqueued",
            Error::NoMemory => "out of memory",
            Error::OutOfRange => "out of range",
            Error::TimedOut => "timed out",
            Error::WouldBlock => "operation would block",
        };
        f.write_str(desc)
    }
}
