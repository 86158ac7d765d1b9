//! Remote collection: attributing background-executor work to a session.
//!
//! A session owner that cannot run the interesting code itself (work is
//! done by worker pools, background executors, service threads) registers
//! opaque 64-bit handles with [`Session::remote_enable`].  An executor
//! brackets work attributable to a handle with [`start`] / [`stop`]: the
//! window records into a private scratch buffer, and `stop` merges it into
//! the session's shared buffer — unless the session was disabled in the
//! meantime, in which case the records are silently dropped (the sequence
//! check).
//!
//! The registry is process-wide: a map `handle → session` plus a free-list
//! of scratch buffers keyed by size, both under one non-sleeping lock.
//! Lock order is session lock → registry lock; `start` never holds both,
//! and `stop` takes them one after the other.
//!
//! [`Session::remote_enable`]: crate::Session::remote_enable

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};

use crate::area::ScratchArea;
use crate::descriptor::{SessionShared, SessionState};
use crate::error::{Error, Result};
use crate::merge;
use crate::task;

struct Registry {
    /// Registered handles.  Weak back-edges only: the map never keeps a
    /// session alive.
    entries: HashMap<u64, Weak<SessionShared>>,
    /// Scratch buffers reusable by size.  Mismatched sizes fall through to
    /// fresh allocation; entries live until process exit.
    free: Vec<ScratchArea>,
}

static REGISTRY: OnceLock<spin::Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static spin::Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        spin::Mutex::new(Registry {
            entries: HashMap::new(),
            free: Vec::new(),
        })
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Registration (called under the session lock)
// ═══════════════════════════════════════════════════════════════════════

/// Insert `handles` for `shared`.  On a duplicate, already-inserted
/// entries are left for the caller's rollback purge and `Exists` is
/// returned.
pub(crate) fn register(shared: &Arc<SessionShared>, handles: &[u64]) -> Result<()> {
    let mut reg = registry().lock();
    for &handle in handles {
        if reg.entries.contains_key(&handle) {
            return Err(Error::Exists);
        }
        reg.entries.insert(handle, Arc::downgrade(shared));
    }
    Ok(())
}

/// Purge every entry belonging to `shared` and reset the session state,
/// all before the registry lock is released, so a concurrent [`start`]
/// can never pair a still-registered handle with already-reset state.
pub(crate) fn purge_and_reset(shared: &Arc<SessionShared>, st: &mut SessionState) {
    let target = Arc::as_ptr(shared);
    let mut reg = registry().lock();
    reg.entries.retain(|_, entry| entry.as_ptr() != target);
    st.reset();
}

/// Drop-time backstop: remove any entry still pointing at a dead session.
pub(crate) fn purge_ptr(target: *const SessionShared) {
    if let Some(lock) = REGISTRY.get() {
        lock.lock().entries.retain(|_, entry| entry.as_ptr() != target);
    }
}

/// Return a scratch buffer to the free-list.
pub(crate) fn recycle(scratch: ScratchArea) {
    registry().lock().free.push(scratch);
}

fn scratch_get(words: usize) -> Option<ScratchArea> {
    let mut reg = registry().lock();
    let at = reg.free.iter().position(|s| s.words() == words)?;
    Some(reg.free.swap_remove(at))
}

// ═══════════════════════════════════════════════════════════════════════
//  Collection windows
// ═══════════════════════════════════════════════════════════════════════

/// Begin attributing the calling executor's work to `handle`.
///
/// Silently does nothing when: the caller is not in task context, the
/// caller is already attached to any session (including an open window —
/// windows do not nest), the handle is not registered, or the scratch
/// buffer cannot be obtained.  The executor cannot act on any of these,
/// and untraced work is the normal case.
///
/// Every `start` must be balanced by exactly one [`stop`] on the same
/// task.
pub fn start(handle: u64) {
    let _ = task::with_current(|slot| {
        if !slot.in_task() || slot.session.borrow().is_some() {
            return;
        }
        let shared = {
            let reg = registry().lock();
            match reg.entries.get(&handle).and_then(Weak::upgrade) {
                Some(shared) => shared,
                None => return,
            }
        };
        // Snapshot under the session lock.  A disable that already ran
        // left a non-trace mode (the window records nothing); one that
        // runs later bumps the sequence (stop drops the records).  Either
        // way nothing stale reaches the shared buffer.
        let (words, mode, sequence) = {
            let st = shared.state.lock();
            (st.remote_words, st.mode, st.sequence)
        };
        if words < 2 {
            // Degenerate scratch capacity: cannot hold a count plus one
            // record.  The window's reference drops with `shared`.
            return;
        }
        let scratch = match scratch_get(words).or_else(|| ScratchArea::alloc(words)) {
            Some(scratch) => scratch,
            None => return,
        };
        scratch.reset_count();
        slot.start(words, scratch.base(), mode, sequence);
        *slot.scratch.borrow_mut() = Some(scratch);
        // The window's reference on the session; released in stop().
        *slot.session.borrow_mut() = Some(shared);
    });
}

/// End the window begun by [`start`]: detach, merge the scratch records
/// into the session's buffer (unless the window was invalidated), and
/// recycle the scratch buffer.
///
/// No-op when the task has no open window.  A task enabled through the
/// control plane detaches via `Session::disable`, never through here.
pub fn stop() {
    let _ = task::with_current(|slot| {
        if slot.scratch.borrow().is_none() {
            return;
        }
        let Some(shared) = slot.session.borrow_mut().take() else {
            return;
        };
        let sequence = slot.sequence.get();
        slot.stop();
        let Some(scratch) = slot.scratch.borrow_mut().take() else {
            return;
        };
        {
            let st = shared.state.lock();
            // A disable between start and stop bumped the sequence (and
            // cleared `remote`); the window's records are then dropped.
            if sequence == st.sequence && st.remote {
                if let Some(area) = st.area.as_ref() {
                    merge::move_records(st.mode, area, st.words, &scratch);
                }
            }
        }
        recycle(scratch);
        // The window's reference, taken in start().
        drop(shared);
    });
}

/// Number of words recorded so far in the calling task's open window.
///
/// Zero when no window is open.  Useful for executors that want to skip
/// an expensive flush when nothing was recorded.
pub fn window_len() -> usize {
    task::with_current(|slot| {
        if slot.scratch.borrow().is_none() {
            return 0;
        }
        let base = slot.area.get();
        if base.is_null() {
            return 0;
        }
        unsafe { crate::area::load_word(base, 0, Ordering::Relaxed) }
    })
    .unwrap_or(0)
}
