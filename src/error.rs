//! Error types.
//!
//! One error enum, derived `Display`/`Error` via `thiserror`
//! (`default-features = false` for `no_std`), plus a logging macro used
//! at every fatal site. Narrowed to the one condition this core
//! actually propagates instead of panicking on: a failing block
//! device.

use thiserror::Error;

/// The one recoverable error this core surfaces to its callers.
///
/// Every other failure this core can encounter — a corrupted invariant,
/// an exhausted buffer pool, a negative refcount — is a programmer
/// error, not a recoverable `Result`, and panics instead (see
/// [`fatal!`]).
#[derive(Debug, Error)]
pub enum KernelCoreError<E> {
    /// The block device reported a failure servicing `disk_rw`.
    #[error("block device I/O failed")]
    Disk(#[source] E),
}

/// Logs `$msg` at error level, then panics with the same message.
///
/// Use at every site that hits a fatal programmer error or invariant
/// violation, so the last log line always explains the panic that
/// follows it.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}
