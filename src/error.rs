use std::path::PathBuf;

use thiserror::Error;

use crate::{cpu::GuestAddress, dispatch::HookStage, symbols::SymbolName, thread::ThreadId};

/// The generic Error type covering every failure this library can report.
///
/// The taxonomy separates locally recoverable conditions from fatal ones:
///
/// - [`Error::Decode`] and [`Error::CacheCorrupt`] are recovered at the point
///   of failure (best-effort partial value, cache rebuild) and normally only
///   surface through the trace channel.
/// - [`Error::UnresolvedSymbol`] is reported to the registrant at hook
///   registration time, never deferred to dispatch.
/// - [`Error::SchedulingInvariant`] and [`Error::ReentrancyDepthExceeded`]
///   are fatal for the session and carry the last known dispatch state.
#[derive(Error, Debug)]
pub enum Error {
    /// A pointer or string read from guest memory could not be fully decoded.
    ///
    /// Carries the best-effort partial value when one could be produced, e.g.
    /// the string bytes scanned before the bounded window ran out without a
    /// terminator. Never aborts the session on its own.
    #[error("decode failed: {message}")]
    Decode {
        /// Description of what could not be decoded.
        message: String,
        /// Best-effort partial string value, if any bytes decoded cleanly.
        partial: Option<String>,
    },

    /// A requested intercept target has no load-time address.
    ///
    /// Surfaced from [`crate::dispatch::DispatchEngine::declare_symbol`] at
    /// registration time.
    #[error("unresolved symbol: {symbol}")]
    UnresolvedSymbol {
        /// The symbol that could not be resolved against any loaded image.
        symbol: SymbolName,
    },

    /// A persisted cache entry failed validation.
    ///
    /// The caller treats this as a cache miss and rebuilds the entry; it is
    /// reported through the trace channel, not propagated.
    #[error("corrupt cache entry for {path}: {message}")]
    CacheCorrupt {
        /// Path of the image whose cache entry failed validation.
        path: PathBuf,
        /// What failed: version mismatch, parse error, fingerprint mismatch.
        message: String,
    },

    /// The thread manager detected an impossible scheduling state.
    ///
    /// Either more than one context was Running, or a switch was attempted
    /// with no Ready context. This indicates a bug in the runtime, not in the
    /// guest; the session aborts.
    #[error("scheduling invariant violated on thread {thread}: {message}")]
    SchedulingInvariant {
        /// Description of the violated invariant.
        message: String,
        /// The thread that was current when the violation was detected.
        thread: ThreadId,
    },

    /// Nested dispatch exceeded the configured depth limit.
    ///
    /// Fatal for the session: a pathological hook chain kept re-entering the
    /// dispatch engine. The chain of intercepted addresses that led here is
    /// attached, innermost last.
    #[error("reentrant dispatch exceeded depth limit ({} frames)", chain.len())]
    ReentrancyDepthExceeded {
        /// The intercepted addresses active when the limit was hit.
        chain: Vec<GuestAddress>,
    },

    /// A hook callback reported a failure it could not recover from.
    ///
    /// Fatal for the session; carries the dispatch state at the failure
    /// point. Hooks construct it via
    /// [`ApiCall::fail`](crate::dispatch::ApiCall::fail).
    #[error("hook at {address} failed during {stage} on thread {thread}: {message}")]
    Hook {
        /// The intercepted address whose chain was running.
        address: GuestAddress,
        /// The stage that was executing.
        stage: HookStage,
        /// The guest thread the dispatch arrived on.
        thread: ThreadId,
        /// Hook-provided description.
        message: String,
    },

    /// A loaded image could not provide the metadata the session needs.
    #[error("image {path}: {message}")]
    Image {
        /// Path of the offending image file.
        path: PathBuf,
        /// Description from the container parser boundary.
        message: String,
    },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
