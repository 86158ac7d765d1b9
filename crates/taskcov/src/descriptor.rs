//! Coverage sessions and their state machine.
//!
//! A [`Session`] is one collection context: a capacity, a shared buffer,
//! at most one attached task, and (optionally) a set of remote handles.
//! The legal transitions, driven by the control operations:
//!
//! ```text
//! Disabled --init_trace(words)--> Init
//! Init     --map(len)-->          Init            (buffer attached)
//! Init     --enable(kind)-->      TracePc|TraceCmp
//! Init     --remote_enable(..)--> TracePc|TraceCmp  (remote = true)
//! Trace*   --disable()-->         Init            (sequence bumped)
//! any      --drop-->              freed on the last reference
//! ```
//!
//! # References
//!
//! The session is freed when its last reference drops.  References are
//! held by: the open [`Session`] handle, the attached task (released by
//! `disable` or by task exit), every in-flight remote window (released by
//! `remote::stop`), and every [`CoverView`] (so a mapped consumer outlives
//! the control handle).  The registry holds only weak back-edges, and the
//! final drop purges any of them that remain.

use std::sync::Arc;

use taskcov_protocol::{MAX_REMOTE_HANDLES, MAX_TRACE_BYTES, MODE_TRACE_CMP, MODE_TRACE_PC, WORD_BYTES};

use crate::area::{CoverArea, CoverView};
use crate::error::{Error, Result};
use crate::remote;
use crate::task::{self, TaskId, TaskSlot};
use crate::warn_once;

// ═══════════════════════════════════════════════════════════════════════
//  Modes
// ═══════════════════════════════════════════════════════════════════════

/// Internal session / per-task mode word.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Mode {
    /// Fresh session, capacity not set.  Also the per-task "off" value.
    Disabled = 0,
    /// Capacity set; buffer may or may not be attached yet.
    Init = 1,
    TracePc = 2,
    TraceCmp = 3,
}

/// Which events a session records.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceKind {
    /// One machine word per basic block: the canonicalized PC.
    Pc,
    /// One four-word record per comparison: type, operands, PC.
    Cmp,
}

impl TraceKind {
    /// Decode a wire mode value (`MODE_TRACE_PC` / `MODE_TRACE_CMP`).
    pub fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            MODE_TRACE_PC => Ok(TraceKind::Pc),
            #[cfg(feature = "comparisons")]
            MODE_TRACE_CMP => Ok(TraceKind::Cmp),
            #[cfg(not(feature = "comparisons"))]
            MODE_TRACE_CMP => Err(Error::NotSupported),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn mode(self) -> Mode {
        match self {
            TraceKind::Pc => Mode::TracePc,
            TraceKind::Cmp => Mode::TraceCmp,
        }
    }
}

/// Arguments for [`Session::remote_enable`].
#[derive(Debug, Clone)]
pub struct RemoteEnableArg {
    /// Which events remote windows record.
    pub trace_mode: TraceKind,
    /// Capacity of each per-executor scratch buffer, in machine words.
    pub scratch_words: usize,
    /// Handles remote executors may claim.  At most
    /// [`MAX_REMOTE_HANDLES`]; globally unique while registered.
    pub handles: Vec<u64>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared state
// ═══════════════════════════════════════════════════════════════════════

pub(crate) struct SessionState {
    pub(crate) mode: Mode,
    /// Capacity of the shared buffer in machine words.
    pub(crate) words: usize,
    /// The shared buffer.  Attached once by `map`, never detached until
    /// the session is freed.
    pub(crate) area: Option<CoverArea>,
    /// The task currently holding this session enabled.
    pub(crate) owner: Option<TaskId>,
    /// Collecting from remote executors rather than the owner's own code.
    pub(crate) remote: bool,
    /// Capacity of each remote scratch buffer, in machine words.
    pub(crate) remote_words: usize,
    /// Bumped on every reset; an in-flight remote window whose snapshot no
    /// longer matches drops its records.
    pub(crate) sequence: u64,
}

impl SessionState {
    /// Back to Init, invalidating in-flight remote windows.
    pub(crate) fn reset(&mut self) {
        self.owner = None;
        self.mode = Mode::Init;
        self.remote = false;
        self.remote_words = 0;
        self.sequence = self.sequence.wrapping_add(1);
    }
}

pub(crate) struct SessionShared {
    /// Serializes all state transitions and the merge.  Non-sleeping; held
    /// for O(1) or O(registered handles) work only.
    pub(crate) state: spin::Mutex<SessionState>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        // Normal teardown purges registry entries on disable and task
        // exit; this is the backstop for a session that dies without one.
        remote::purge_ptr(self as *const SessionShared);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// Handle to one coverage session.
///
/// Obtained with [`Session::open`], configured with [`init_trace`]
/// (capacity) and [`map`] (shared buffer), then driven through
/// [`enable`]/[`disable`] or [`remote_enable`].  Dropping the handle
/// releases the open reference; the buffer itself is freed once no task
/// attachment, remote window, or [`CoverView`] references the session.
///
/// [`init_trace`]: Session::init_trace
/// [`map`]: Session::map
/// [`enable`]: Session::enable
/// [`disable`]: Session::disable
/// [`remote_enable`]: Session::remote_enable
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Default for Session {
    fn default() -> Self {
        Self::open()
    }
}

impl Session {
    /// Open a fresh session in the disabled state.
    pub fn open() -> Self {
        Self {
            shared: Arc::new(SessionShared {
                state: spin::Mutex::new(SessionState {
                    mode: Mode::Disabled,
                    words: 0,
                    area: None,
                    owner: None,
                    remote: false,
                    remote_words: 0,
                    sequence: 1,
                }),
            }),
        }
    }

    /// Set the buffer capacity to `words` machine words.
    ///
    /// Must be the first operation on a session; fails [`Error::Busy`]
    /// otherwise.  The capacity must hold the count word plus at least one
    /// record, and stay below the overflow guard.
    pub fn init_trace(&self, words: usize) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.mode != Mode::Disabled {
            return Err(Error::Busy);
        }
        if words < 2 || words > MAX_TRACE_BYTES / WORD_BYTES {
            return Err(Error::InvalidArgument);
        }
        st.words = words;
        st.mode = Mode::Init;
        Ok(())
    }

    /// Publish the shared buffer and return a consumer view of it.
    ///
    /// `len` must equal `words * WORD_BYTES` exactly and the session must
    /// be in Init.  The first successful call attaches the buffer; later
    /// calls discard their candidate region and return a new view of the
    /// buffer already attached.  The mapping survives disable/enable
    /// cycles.
    pub fn map(&self, len: usize) -> Result<CoverView> {
        // Allocate the candidate before taking the lock; a repeated call
        // (or a failed precondition) discards it after the lock is gone.
        let mut candidate = Some(CoverArea::alloc(len)?);
        let mut st = self.shared.state.lock();
        if st.mode != Mode::Init || len != st.words * WORD_BYTES {
            return Err(Error::InvalidArgument);
        }
        if st.area.is_none() {
            st.area = candidate.take();
        }
        let Some(area) = st.area.as_ref() else {
            return Err(Error::NoMemory);
        };
        Ok(CoverView::new(Arc::clone(&self.shared), area.base(), st.words))
    }

    /// Enable collection of `kind` events for the calling task.
    ///
    /// Requires Init with a mapped buffer ([`Error::InvalidArgument`]
    /// otherwise), no current owner, and a calling task that is not
    /// attached to any session ([`Error::Busy`] otherwise).
    pub fn enable(&self, kind: TraceKind) -> Result<()> {
        #[cfg(not(feature = "comparisons"))]
        if kind == TraceKind::Cmp {
            return Err(Error::NotSupported);
        }
        task::with_current(|slot| {
            let mut st = self.shared.state.lock();
            let base = match st.area.as_ref() {
                Some(area) if st.mode == Mode::Init => area.base(),
                _ => return Err(Error::InvalidArgument),
            };
            if st.owner.is_some() || slot.session.borrow().is_some() {
                return Err(Error::Busy);
            }
            st.mode = kind.mode();
            st.owner = Some(slot.id());
            slot.start(st.words, base, st.mode, st.sequence);
            // Released by disable() or by task-exit teardown.
            *slot.session.borrow_mut() = Some(Arc::clone(&self.shared));
            Ok(())
        })
        .unwrap_or(Err(Error::InvalidArgument))
    }

    /// Enable remote collection: like [`enable`](Session::enable), but the
    /// caller only owns the session — coverage is fed by executors that
    /// claim one of `arg.handles` via [`remote::start`](crate::remote::start).
    ///
    /// Fails [`Error::Exists`] if any handle (including a duplicate within
    /// the call) is already registered; the whole call is rolled back.
    pub fn remote_enable(&self, arg: &RemoteEnableArg) -> Result<()> {
        #[cfg(not(feature = "comparisons"))]
        if arg.trace_mode == TraceKind::Cmp {
            return Err(Error::NotSupported);
        }
        if arg.handles.len() > MAX_REMOTE_HANDLES {
            return Err(Error::InvalidArgument);
        }
        task::with_current(|slot| {
            let mut st = self.shared.state.lock();
            if st.mode != Mode::Init || st.area.is_none() {
                return Err(Error::InvalidArgument);
            }
            if st.owner.is_some() || slot.session.borrow().is_some() {
                return Err(Error::Busy);
            }
            st.mode = arg.trace_mode.mode();
            st.owner = Some(slot.id());
            st.remote = true;
            st.remote_words = arg.scratch_words;
            // The owner itself does not record: its per-task mode stays
            // Disabled and only remote windows write the buffer.
            *slot.session.borrow_mut() = Some(Arc::clone(&self.shared));
            if let Err(err) = remote::register(&self.shared, &arg.handles) {
                // Whole-call rollback: purge whatever this call inserted
                // and put the session back to Init.
                remote::purge_and_reset(&self.shared, &mut st);
                let released = slot.session.borrow_mut().take();
                drop(st);
                drop(released);
                return Err(err);
            }
            Ok(())
        })
        .unwrap_or(Err(Error::InvalidArgument))
    }

    /// Detach the calling task and return the session to Init.
    ///
    /// Only the attached owner may disable; the sequence bump invalidates
    /// any remote window still in flight.
    pub fn disable(&self) -> Result<()> {
        task::with_current(|slot| {
            let attached = matches!(
                &*slot.session.borrow(),
                Some(session) if Arc::ptr_eq(session, &self.shared)
            );
            if !attached {
                return Err(Error::InvalidArgument);
            }
            let mut st = self.shared.state.lock();
            if st.owner != Some(slot.id()) {
                // Attached but not the owner: a task inside a remote window
                // must close it with remote::stop, not disable.
                warn_once!("disable called by a task that does not own the session");
                return Err(Error::InvalidArgument);
            }
            slot.stop();
            let released = slot.session.borrow_mut().take();
            if st.remote {
                remote::purge_and_reset(&self.shared, &mut st);
            } else {
                st.reset();
            }
            drop(st);
            // Attachment reference released outside the lock.
            drop(released);
            Ok(())
        })
        .unwrap_or(Err(Error::InvalidArgument))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Task-exit teardown
// ═══════════════════════════════════════════════════════════════════════

/// Called from the task slot's `Drop` when a thread dies.
///
/// If the exiting task still holds a session, detach it and reset the
/// session so it can be enabled again (remote sessions also purge their
/// handles).  The attachment's reference is always released — including
/// the warned path where the exiting task is a remote window rather than
/// the owner.
pub(crate) fn task_exit(slot: &TaskSlot) {
    let Some(shared) = slot.session.borrow_mut().take() else {
        return;
    };
    slot.stop();
    {
        let mut st = shared.state.lock();
        if st.owner == Some(slot.id()) {
            if st.remote {
                remote::purge_and_reset(&shared, &mut st);
            } else {
                st.reset();
            }
        } else {
            warn_once!("task exited inside an open remote collection window");
        }
    }
    // An open window's scratch buffer goes back to the free-list; its
    // records are dropped.
    if let Some(scratch) = slot.scratch.borrow_mut().take() {
        remote::recycle(scratch);
    }
    drop(shared);
}
