// SPDX-License-Identifier: MPL-2.0

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,      /* Operation not permitted */
    ENOENT = 2,     /* No such file or directory */
    EIO = 5,        /* I/O error */
    ENXIO = 6,      /* No such device or address */
    EAGAIN = 11,    /* Try again */
    ENOMEM = 12,    /* Out of memory */
    EBUSY = 16,     /* Device or resource busy */
    EINVAL = 22,    /* Invalid argument */
    ERANGE = 34,    /* Math result not representable */
    ETIMEDOUT = 110, /* Connection timed out */
}

/// error used in this crate
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.errno == other.errno
    }
}

impl Eq for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl From<hinge_frame::Error> for Error {
    fn from(frame_error: hinge_frame::Error) -> Self {
        match frame_error {
            hinge_frame::Error::InvalidArgs => Error::new(Errno::EINVAL),
            hinge_frame::Error::Busy => Error::new(Errno::EBUSY),
            hinge_frame::Error::IoError => Error::new(Errno::EIO),
            hinge_frame::Error::NotOnline => Error::new(Errno::ENXIO),
            hinge_frame::Error::NotEnqueued => Error::new(Errno::ENOENT),
            hinge_frame::Error::NoMemory => Error::new(Errno::ENOMEM),
            hinge_frame::Error::OutOfRange => Error::new(Errno::ERANGE),
            hinge_frame::Error::TimedOut => Error::new(Errno::ETIMEDOUT),
            hinge_frame::Error::WouldBlock => Error::new(Errno::EAGAIN),
        }
    }
}

impl From<Error> for hinge_frame::Error {
    fn from(error: Error) -> Self {
        match error.errno {
            Errno::EBUSY => hinge_frame::Error::Busy,
            Errno::EIO => hinge_frame::Error::IoError,
            Errno::ENXIO => hinge_frame::Error::NotOnline,
            Errno::ENOENT => hinge_frame::Error::NotEnqueued,
            Errno::ENOMEM => hinge_frame::Error::NoMemory,
            Errno::ERANGE => hinge_frame::Error::OutOfRange,
            Errno::ETIMEDOUT => hinge_frame::Error::TimedOut,
            Errno::EAGAIN => hinge_frame::Error::WouldBlock,
            _ => hinge_frame::Error::InvalidArgs,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_errors_map_to_errnos() {
        let errno = |err| Error::from(err).error();
        assert_eq!(errno(hinge_frame::Error::Busy), Errno::EBUSY);
        assert_eq!(errno(hinge_frame::Error::NotEnqueued), Errno::ENOENT);
        assert_eq!(errno(hinge_frame::Error::WouldBlock), Errno::EAGAIN);
        assert_eq!(
            hinge_frame::Error::from(Error::with_message(Errno::EPERM, "denied")),
            hinge_frame::Error::InvalidArgs
        );
    }
}
