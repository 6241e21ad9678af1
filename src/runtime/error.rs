//! Error taxonomy of the runtime core.
//!
//! Only resource exhaustion is reported to callers as an [`Error`]. Broken
//! control-stack invariants, heap exhaustion and (in debug builds) contract
//! violations go through [`fatal`], which never returns.

use std::{any::Any, fmt};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create {what}: {source}")]
    PrimitiveCreation {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("failed to join thread: {0}")]
    ThreadJoin(#[source] std::io::Error),
    #[error("frame stack overflow: more than {limit} active frames")]
    FrameStackOverflow { limit: usize },
    #[error("invocation history overflow: more than {limit} nested calls")]
    InvocationOverflow { limit: usize },
    #[error("thread is already attached to a virtual machine")]
    AlreadyAttached,
    #[error("invalid value for option `{name}`: {value}")]
    InvalidOption { name: &'static str, value: String },
    #[error("{0}")]
    Signal(String),
}

impl Error {
    pub(crate) fn creation(what: &'static str, code: i32) -> Self {
        Error::PrimitiveCreation {
            what,
            source: std::io::Error::from_raw_os_error(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    HeapExhausted,
    ControlIntegrity,
    ContractViolation,
    Internal,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FatalKind::HeapExhausted => "heap exhausted",
            FatalKind::ControlIntegrity => "control integrity violation",
            FatalKind::ContractViolation => "contract violation",
            FatalKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Panic payload carried by every fatal error.
#[derive(Debug, Clone)]
pub struct FatalError {
    pub kind: FatalKind,
    pub message: String,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal {}: {}", self.kind, self.message)
    }
}

impl FatalError {
    /// Extracts the fatal error from a caught panic payload, if it is one.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Option<&FatalError> {
        payload.downcast_ref::<FatalError>()
    }
}

/// Whether a fatal error raised on the calling thread aborts the process.
/// Follows the options of the machine the thread is attached to; unattached
/// threads never abort.
pub fn abort_on_fatal() -> bool {
    crate::vm::thread::current_options(|options| options.abort_on_fatal).unwrap_or(false)
}

/// Terminates the current thread (or the process when its machine is
/// configured so) with a fatal error.
#[cold]
#[inline(never)]
pub fn fatal(kind: FatalKind, message: impl Into<String>) -> ! {
    fatal_with(abort_on_fatal(), kind, message)
}

/// [`fatal`] with an explicit abort policy, for errors raised on behalf of a
/// machine the calling thread may not be attached to.
#[cold]
#[inline(never)]
pub(crate) fn fatal_with(abort: bool, kind: FatalKind, message: impl Into<String>) -> ! {
    let error = FatalError {
        kind,
        message: message.into(),
    };
    log::error!(target: "lisprt::fatal", "{}", error);

    if abort {
        eprintln!("{}", error);
        std::process::abort();
    }

    std::panic::panic_any(error)
}

/// Contract violations are only diagnosed in debug builds.
#[inline]
pub fn contract_violation(message: impl FnOnce() -> String) {
    if cfg!(debug_assertions) {
        fatal(FatalKind::ContractViolation, message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_unwinds_with_typed_payload() {
        let payload = std::panic::catch_unwind(|| fatal(FatalKind::ControlIntegrity, "no frame"))
            .expect_err("fatal must not return");
        let error = FatalError::from_panic(&*payload).expect("payload is a FatalError");
        assert_eq!(error.kind, FatalKind::ControlIntegrity);
        assert_eq!(error.message, "no frame");
    }

    #[test]
    fn creation_errors_keep_os_code() {
        let err = Error::creation("mutex", libc_eagain());
        assert!(err.to_string().starts_with("failed to create mutex"));
    }

    fn libc_eagain() -> i32 {
        11
    }
}
