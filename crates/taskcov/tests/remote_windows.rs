//! Remote collection scenarios: handle registration, window merge,
//! sequence invalidation, and teardown interleavings.

use std::sync::Barrier;
use std::thread;

use taskcov::protocol::WORD_BYTES;
use taskcov::{remote, trace, CoverView, Error, RemoteEnableArg, Session, TraceKind};

/// Open, size, map, and remote-enable a PC session owned by the calling
/// task.  Handles must be unique per test: the registry is process-wide.
fn remote_session(words: usize, scratch_words: usize, handles: &[u64]) -> (Session, CoverView) {
    let session = Session::open();
    session.init_trace(words).unwrap();
    let view = session.map(words * WORD_BYTES).unwrap();
    session
        .remote_enable(&RemoteEnableArg {
            trace_mode: TraceKind::Pc,
            scratch_words,
            handles: handles.to_vec(),
        })
        .unwrap();
    (session, view)
}

#[test]
fn remote_window_merges_into_the_session_buffer() {
    let (session, view) = remote_session(16, 8, &[0xC401]);

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC401);
            trace::record_pc(0x1000);
            trace::record_pc(0x2000);
            trace::record_pc(0x3000);
            remote::stop();
        });
    });

    assert_eq!(view.read_pcs(), vec![0x1000, 0x2000, 0x3000]);
    session.disable().unwrap();
}

#[test]
fn remote_owner_does_not_record() {
    let (session, view) = remote_session(16, 8, &[0xC402]);

    // The owner's own work is not traced; only claimed windows are.
    trace::record_pc(0xAAAA);

    assert_eq!(view.count(), 0);
    session.disable().unwrap();
}

#[test]
fn disable_between_start_and_stop_drops_the_window() {
    let (session, view) = remote_session(16, 8, &[0xC403]);
    let opened = Barrier::new(2);
    let disabled = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC403);
            trace::record_pc(0x1000);
            opened.wait();
            disabled.wait();
            // Still recording into the scratch buffer, but the sequence no
            // longer matches: stop must discard everything.
            trace::record_pc(0x2000);
            remote::stop();
        });
        opened.wait();
        session.disable().unwrap();
        disabled.wait();
    });

    assert_eq!(view.count(), 0);
}

#[test]
fn duplicate_handles_roll_the_whole_call_back() {
    let session = Session::open();
    session.init_trace(8).unwrap();
    let _view = session.map(8 * WORD_BYTES).unwrap();

    let dup = RemoteEnableArg {
        trace_mode: TraceKind::Pc,
        scratch_words: 8,
        handles: vec![0xC404, 0xC404],
    };
    assert_eq!(session.remote_enable(&dup), Err(Error::Exists));

    // Nothing leaked: the same handle registers cleanly afterwards.
    let ok = RemoteEnableArg {
        trace_mode: TraceKind::Pc,
        scratch_words: 8,
        handles: vec![0xC404],
    };
    session.remote_enable(&ok).unwrap();
    session.disable().unwrap();
}

#[test]
fn registered_handles_are_globally_unique() {
    let (first, _v1) = remote_session(8, 8, &[0xC405, 0xC406]);

    let second = Session::open();
    second.init_trace(8).unwrap();
    let _v2 = second.map(8 * WORD_BYTES).unwrap();
    let overlapping = RemoteEnableArg {
        trace_mode: TraceKind::Pc,
        scratch_words: 8,
        handles: vec![0xC407, 0xC406],
    };

    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(second.remote_enable(&overlapping), Err(Error::Exists));
        });
    });

    first.disable().unwrap();

    // disable released the handles; the overlapping set registers now.
    thread::scope(|s| {
        s.spawn(|| {
            second.remote_enable(&overlapping).unwrap();
            second.disable().unwrap();
        });
    });
}

#[test]
fn merge_truncates_at_destination_capacity() {
    // Destination holds three records; scratch windows are larger.
    let (session, view) = remote_session(4, 16, &[0xC408]);

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC408);
            trace::record_pc(0x10);
            trace::record_pc(0x20);
            remote::stop();

            remote::start(0xC408);
            for pc in [0x30, 0x40, 0x50, 0x60, 0x70] {
                trace::record_pc(pc);
            }
            remote::stop();
        });
    });

    assert_eq!(view.count(), 3);
    assert_eq!(view.read_pcs(), vec![0x10, 0x20, 0x30]);
    session.disable().unwrap();
}

#[test]
fn start_is_ignored_for_an_attached_task() {
    let (remote_sess, remote_view) = remote_session(8, 8, &[0xC409]);

    let own = Session::open();
    own.init_trace(4).unwrap();
    let own_view = own.map(4 * WORD_BYTES).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            own.enable(TraceKind::Pc).unwrap();
            remote::start(0xC409); // ignored: this task is already attached
            trace::record_pc(0x123);
            remote::stop(); // no window open: no-op, stays attached
            trace::record_pc(0x456);
            own.disable().unwrap();
        });
    });

    assert_eq!(own_view.read_pcs(), vec![0x123, 0x456]);
    assert_eq!(remote_view.count(), 0);
    remote_sess.disable().unwrap();
}

#[test]
fn windows_do_not_nest() {
    let (session, view) = remote_session(16, 8, &[0xC40A, 0xC40B]);

    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(remote::window_len(), 0);
            remote::start(0xC40A);
            trace::record_pc(0x1);
            remote::start(0xC40B); // ignored: a window is already open
            trace::record_pc(0x2);
            assert_eq!(remote::window_len(), 2);
            remote::stop();
            assert_eq!(remote::window_len(), 0);
            trace::record_pc(0x99); // detached: dropped
        });
    });

    assert_eq!(view.read_pcs(), vec![0x1, 0x2]);
    session.disable().unwrap();
}

#[test]
fn executor_exit_inside_a_window_drops_it() {
    let (session, view) = remote_session(16, 8, &[0xC40C]);

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC40C);
            trace::record_pc(0x1234);
            // Exits without stop: the exit hook releases the window.
        });
    });

    assert_eq!(view.count(), 0);

    // The session itself is unaffected: the owner can cycle it.
    session.disable().unwrap();
    session
        .remote_enable(&RemoteEnableArg {
            trace_mode: TraceKind::Pc,
            scratch_words: 8,
            handles: vec![0xC40C],
        })
        .unwrap();
    session.disable().unwrap();
}

#[test]
fn owner_exit_purges_registered_handles() {
    let session = Session::open();
    session.init_trace(8).unwrap();
    let _view = session.map(8 * WORD_BYTES).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            session
                .remote_enable(&RemoteEnableArg {
                    trace_mode: TraceKind::Pc,
                    scratch_words: 8,
                    handles: vec![0xC40D],
                })
                .unwrap();
            // Exits without disable.
        });
    });

    // The exit hook purged the handle and reset the session.
    session
        .remote_enable(&RemoteEnableArg {
            trace_mode: TraceKind::Pc,
            scratch_words: 8,
            handles: vec![0xC40D],
        })
        .unwrap();
    session.disable().unwrap();
}

#[test]
fn window_survives_the_control_handle_dropping() {
    let (session, view) = remote_session(16, 8, &[0xC40E]);
    let opened = Barrier::new(2);
    let closed = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC40E);
            trace::record_pc(0x1010);
            opened.wait();
            closed.wait();
            remote::stop();
        });
        opened.wait();
        // Close the control handle mid-window.  The window's and the
        // view's references keep the session alive; no disable ran, so
        // the merge still lands.
        drop(session);
        closed.wait();
    });

    assert_eq!(view.read_pcs(), vec![0x1010]);
}

#[cfg(feature = "comparisons")]
#[test]
fn remote_cmp_window_merges_records() {
    let session = Session::open();
    let words = 256 / WORD_BYTES;
    session.init_trace(words).unwrap();
    let view = session.map(words * WORD_BYTES).unwrap();
    session
        .remote_enable(&RemoteEnableArg {
            trace_mode: TraceKind::Cmp,
            scratch_words: words,
            handles: vec![0xC40F],
        })
        .unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            remote::start(0xC40F);
            trace::record_cmp4(11, 22, 0xF0);
            trace::record_const_cmp1(3, 3, 0xF4);
            remote::stop();
        });
    });

    let recs = view.read_cmps();
    assert_eq!(recs.len(), 2);
    assert_eq!((recs[0].arg1, recs[0].arg2, recs[0].ip), (11, 22, 0xF0));
    assert_eq!(recs[0].width_bits(), 32);
    assert!(recs[1].is_const());
    assert_eq!(recs[1].width_bits(), 8);
    session.disable().unwrap();
}
