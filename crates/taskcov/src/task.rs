//! Per-task coverage state and task-context discrimination.
//!
//! Every thread of the process is a *task*.  A task carries one slot of
//! coverage state: the mode word the trace sinks poll, cached buffer
//! geometry, a back-reference to the session it currently feeds, and the
//! scratch buffer of an open remote window.  The slot is thread-local, so
//! the fast path costs one TLS access and one atomic load when coverage is
//! off.
//!
//! The slot's `Drop` is the task-exit hook: a thread that dies while still
//! attached is detached, its session is reset, and the attachment's
//! reference is released (see `descriptor::task_exit`).

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::area::ScratchArea;
use crate::descriptor::{Mode, SessionShared};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a task, used for session owner checks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct TaskId(u64);

pub(crate) struct TaskSlot {
    id: TaskId,
    /// Mode word polled by the trace sinks with acquire ordering.  The only
    /// cross-context variable on the fast path.
    pub(crate) mode: AtomicU32,
    /// Cached capacity of the attached buffer, in machine words.
    pub(crate) words: Cell<usize>,
    /// Cached base of the attached buffer.
    pub(crate) area: Cell<*mut u8>,
    /// Session sequence observed when the attachment was made.
    pub(crate) sequence: Cell<u64>,
    /// The session this task feeds; holds the attachment's reference.
    pub(crate) session: RefCell<Option<Arc<SessionShared>>>,
    /// Scratch buffer of an open remote window, if any.
    pub(crate) scratch: RefCell<Option<ScratchArea>>,
    irq_depth: Cell<u32>,
}

thread_local! {
    static TASK: TaskSlot = TaskSlot::new();
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            mode: AtomicU32::new(Mode::Disabled as u32),
            words: Cell::new(0),
            area: Cell::new(std::ptr::null_mut()),
            sequence: Cell::new(0),
            session: RefCell::new(None),
            scratch: RefCell::new(None),
            irq_depth: Cell::new(0),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn in_task(&self) -> bool {
        self.irq_depth.get() == 0
    }

    /// Attach a buffer: publish the pointers first, then the mode with
    /// release ordering.  A sink that observes the enabled mode therefore
    /// also observes the matching buffer pointers.
    pub(crate) fn start(&self, words: usize, area: *mut u8, mode: Mode, sequence: u64) {
        self.words.set(words);
        self.area.set(area);
        self.sequence.set(sequence);
        self.mode.store(mode as u32, Ordering::Release);
    }

    /// Detach: clear the mode first so the sinks stop recording, then the
    /// pointers.  Never the reverse.
    pub(crate) fn stop(&self) {
        self.mode.store(Mode::Disabled as u32, Ordering::Release);
        self.words.set(0);
        self.area.set(std::ptr::null_mut());
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        crate::descriptor::task_exit(self);
    }
}

/// Run `f` against the calling task's slot.  Returns `None` during thread
/// teardown, when the slot is no longer reachable.
pub(crate) fn with_current<R>(f: impl FnOnce(&TaskSlot) -> R) -> Option<R> {
    TASK.try_with(|slot| f(slot)).ok()
}

/// Whether the caller is running in ordinary task context.
///
/// False inside an [`InterruptScope`] and during thread teardown.  Trace
/// sinks and `remote::start` are silent no-ops outside task context.
pub fn in_task() -> bool {
    TASK.try_with(|slot| slot.in_task()).unwrap_or(false)
}

/// Marks the enclosed code as interrupt context.
///
/// Work performed inside the scope is never attributed to the task's
/// coverage session — trace sinks drop their records, exactly as handler
/// code interrupting an enabled task must not pollute its buffer.  Scopes
/// nest.
///
/// ```
/// let _irq = taskcov::InterruptScope::enter();
/// assert!(!taskcov::in_task());
/// ```
pub struct InterruptScope {
    // Tied to the thread that entered it.
    _not_send: PhantomData<*mut ()>,
}

impl InterruptScope {
    pub fn enter() -> Self {
        TASK.with(|slot| slot.irq_depth.set(slot.irq_depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        let _ = TASK.try_with(|slot| slot.irq_depth.set(slot.irq_depth.get().saturating_sub(1)));
    }
}
