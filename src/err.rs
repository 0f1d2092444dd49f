//! Error codes and the thread-local provider-error channel.
//!
//! Every fallible entry point returns one of the five coarse [`Error`] codes.
//! When the code is [`Error::Provider`], the provider's errno and a formatted
//! message are captured into thread-local storage and can be fetched with
//! [`provider_error`] and [`message`] immediately after the failing call, on
//! the same thread. Successful calls never clear the channel, so its contents
//! are meaningful only right after a failure.

use std::cell::{Cell, RefCell};
use std::io::Error as IoError;

use thiserror::Error;

/// Ceiling for the formatted thread-local message.
const MSG_CAP: usize = 256;

/// Coarse error code returned by every entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The provider failed without setting an errno.
    #[error("unknown provider failure")]
    Unknown,

    /// Operation not supported by this provider or build.
    #[error("operation not supported")]
    NoSupp,

    /// Provider-level failure; fetch the errno with [`provider_error`].
    #[error("provider failure")]
    Provider,

    /// Allocation failure.
    #[error("out of memory")]
    NoMem,

    /// An argument violates the operation's preconditions.
    #[error("invalid argument")]
    Inval,
}

impl Error {
    /// Get the integer code of this error. Codes are negative; zero is
    /// reserved for success.
    pub const fn code(self) -> i32 {
        match self {
            Error::Unknown => -100_000,
            Error::NoSupp => -100_001,
            Error::Provider => -100_002,
            Error::NoMem => -100_003,
            Error::Inval => -100_004,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static PROVIDER_ERR: Cell<i32> = const { Cell::new(0) };
    static PROVIDER_MSG: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Get the provider errno captured by the last failing call on this thread.
pub fn provider_error() -> i32 {
    PROVIDER_ERR.with(Cell::get)
}

/// Get the message formatted by the last failing call on this thread.
pub fn message() -> String {
    PROVIDER_MSG.with(|m| m.borrow().clone())
}

/// Capture a provider errno into the thread-local channel.
pub(crate) fn capture(errno: i32, what: &str) {
    PROVIDER_ERR.with(|e| e.set(errno));
    PROVIDER_MSG.with(|m| {
        let mut msg = format!("{}: {}", what, IoError::from_raw_os_error(errno));
        if msg.len() > MSG_CAP {
            let mut end = MSG_CAP;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            msg.truncate(end);
        }
        *m.borrow_mut() = msg;
    });
}

/// Record a provider failure with an explicit errno.
pub(crate) fn provider(errno: i32, what: &str) -> Error {
    capture(errno, what);
    Error::Provider
}

/// Record a provider failure from the calling thread's current errno.
/// An unset errno yields [`Error::Unknown`].
pub(crate) fn last_os(what: &str) -> Error {
    match IoError::last_os_error().raw_os_error() {
        Some(0) | None => Error::Unknown,
        Some(errno) => provider(errno, what),
    }
}

/// Convert a C return value into a `Result`, capturing the errno on failure.
///
/// For librdmacm entry points, which return `-1` with errno set; libibverbs
/// entry points that return the error code directly go through [`provider`].
pub(crate) fn from_c_ret(ret: i32, what: &str) -> Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(last_os(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Unknown.code(), -100_000);
        assert_eq!(Error::NoSupp.code(), -100_001);
        assert_eq!(Error::Provider.code(), -100_002);
        assert_eq!(Error::NoMem.code(), -100_003);
        assert_eq!(Error::Inval.code(), -100_004);
    }

    #[test]
    fn capture_sets_errno_and_message() {
        let e = provider(libc::ECONNRESET, "rdma_get_cm_event");
        assert_eq!(e, Error::Provider);
        assert_eq!(provider_error(), libc::ECONNRESET);
        assert!(message().starts_with("rdma_get_cm_event: "));
    }

    #[test]
    fn channel_is_thread_local() {
        capture(libc::ENOMEM, "ibv_alloc_pd");
        let handle = std::thread::spawn(|| {
            assert_eq!(provider_error(), 0);
            assert!(message().is_empty());
            capture(libc::EBUSY, "ibv_dealloc_pd");
            assert_eq!(provider_error(), libc::EBUSY);
        });
        handle.join().unwrap();
        assert_eq!(provider_error(), libc::ENOMEM);
        assert!(message().starts_with("ibv_alloc_pd: "));
    }

    #[test]
    fn long_messages_are_bounded() {
        let what = "x".repeat(2 * MSG_CAP);
        capture(libc::EINVAL, &what);
        assert!(message().len() <= MSG_CAP);
    }
}
