//! In-process, per-task code coverage collection for coverage-guided
//! fuzzers.
//!
//! A fuzzing harness opens a [`Session`], sizes it, maps its shared
//! buffer, and enables collection for a task (a thread).  Instrumented
//! code then calls the [`trace`] sinks, which append fixed-shape records
//! — program counters or comparison operands — into the buffer.  The
//! harness reads the buffer directly through the [`CoverView`] mapping,
//! with no further calls into the facility.
//!
//! # Quick start
//!
//! ```
//! use taskcov::{Session, TraceKind};
//!
//! let session = Session::open();
//! session.init_trace(64)?;
//! let view = session.map(64 * taskcov::protocol::WORD_BYTES)?;
//! session.enable(TraceKind::Pc)?;
//!
//! // Normally called by instrumentation:
//! taskcov::trace::record_pc(0x40_2137);
//!
//! session.disable()?;
//! assert_eq!(view.read_pcs(), vec![0x40_2137]);
//! # Ok::<(), taskcov::Error>(())
//! ```
//!
//! # Remote collection
//!
//! Work done on behalf of a task by background executors can be attributed
//! to a session through opaque handles: the owner registers them with
//! [`Session::remote_enable`], and an executor brackets the attributable
//! work with [`remote::start`] / [`remote::stop`].  Each window records
//! into a private scratch buffer that is merged into the shared buffer
//! when the window closes — or dropped, if the session was disabled in the
//! meantime.
//!
//! # Fast-path contract
//!
//! The trace sinks take no locks.  The per-task mode word is the only
//! cross-context variable on the fast path: published with release
//! ordering after the buffer pointers on enable, cleared before them on
//! disable, and read with acquire ordering by every sink.  Work performed
//! in interrupt context ([`InterruptScope`]) is never recorded.  A full
//! buffer silently drops further records — the count saturating at the
//! capacity is the observable signal.

mod area;
pub mod control;
mod descriptor;
mod error;
mod merge;
pub mod remote;
mod task;
pub mod trace;

pub use area::CoverView;
pub use descriptor::{RemoteEnableArg, Session, TraceKind};
pub use error::{Error, Result};
pub use task::{in_task, InterruptScope};

/// Re-export of the layout and control-surface constants.
pub use taskcov_protocol as protocol;

/// Log a warning the first time a given invariant violation is seen.
/// Steady-state misuse must not flood the log.
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| log::warn!($($arg)*));
    }};
}
pub(crate) use warn_once;
