//! Numeric control-plane dispatch.
//!
//! The typed [`Session`] methods are the native control surface; this
//! module exposes the same operations keyed by the wire command codes from
//! [`taskcov_protocol`], for harnesses that drive the facility through a
//! request/response channel.  Unknown codes and argument-shape mismatches
//! are reported, matching the session's own error policy.

use taskcov_protocol::{CMD_DISABLE, CMD_ENABLE, CMD_INIT_TRACE, CMD_MAP, CMD_REMOTE_ENABLE};

use crate::area::CoverView;
use crate::descriptor::{RemoteEnableArg, Session, TraceKind};
use crate::error::{Error, Result};

/// Argument accompanying a control command.
pub enum ControlArg<'a> {
    /// A scalar: the size for `CMD_INIT_TRACE`, the mode for `CMD_ENABLE`,
    /// the mandatory zero for `CMD_DISABLE`, the length for `CMD_MAP`.
    Scalar(u64),
    /// The compound argument for `CMD_REMOTE_ENABLE`.
    Remote(&'a RemoteEnableArg),
}

/// Successful dispatch outcome.
pub enum ControlReply {
    Done,
    /// `CMD_MAP` hands back the consumer view of the shared buffer.
    Mapped(CoverView),
}

/// Dispatch one control request against `session`.
pub fn dispatch(session: &Session, command: u32, arg: ControlArg<'_>) -> Result<ControlReply> {
    match (command, arg) {
        (CMD_INIT_TRACE, ControlArg::Scalar(words)) => {
            let words = usize::try_from(words).map_err(|_| Error::InvalidArgument)?;
            session.init_trace(words)?;
            Ok(ControlReply::Done)
        }
        (CMD_ENABLE, ControlArg::Scalar(mode)) => {
            session.enable(TraceKind::from_raw(mode)?)?;
            Ok(ControlReply::Done)
        }
        (CMD_DISABLE, ControlArg::Scalar(arg)) => {
            if arg != 0 {
                return Err(Error::InvalidArgument);
            }
            session.disable()?;
            Ok(ControlReply::Done)
        }
        (CMD_REMOTE_ENABLE, ControlArg::Remote(arg)) => {
            session.remote_enable(arg)?;
            Ok(ControlReply::Done)
        }
        (CMD_MAP, ControlArg::Scalar(len)) => {
            let len = usize::try_from(len).map_err(|_| Error::InvalidArgument)?;
            Ok(ControlReply::Mapped(session.map(len)?))
        }
        // Known command, wrong argument shape.
        (CMD_INIT_TRACE | CMD_ENABLE | CMD_DISABLE | CMD_REMOTE_ENABLE | CMD_MAP, _) => {
            Err(Error::InvalidArgument)
        }
        (unknown, _) => Err(Error::UnknownRequest(unknown)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskcov_protocol::{MODE_TRACE_PC, WORD_BYTES};

    #[test]
    fn unknown_command_is_reported_with_its_code() {
        let session = Session::open();
        assert_eq!(
            dispatch(&session, 0xAB, ControlArg::Scalar(0)).map(|_| ()),
            Err(Error::UnknownRequest(0xAB))
        );
    }

    #[test]
    fn argument_shape_mismatch_is_invalid() {
        let session = Session::open();
        let arg = RemoteEnableArg {
            trace_mode: TraceKind::Pc,
            scratch_words: 8,
            handles: vec![],
        };
        assert_eq!(
            dispatch(&session, CMD_INIT_TRACE, ControlArg::Remote(&arg)).map(|_| ()),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn disable_requires_zero_argument() {
        let session = Session::open();
        assert_eq!(
            dispatch(&session, CMD_DISABLE, ControlArg::Scalar(1)).map(|_| ()),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn full_setup_through_the_dispatcher() {
        let session = Session::open();
        dispatch(&session, CMD_INIT_TRACE, ControlArg::Scalar(4)).unwrap();
        let view = match dispatch(
            &session,
            CMD_MAP,
            ControlArg::Scalar((4 * WORD_BYTES) as u64),
        ) {
            Ok(ControlReply::Mapped(view)) => view,
            other => panic!("expected a mapped view, got {:?}", other.map(|_| ()).err()),
        };
        dispatch(&session, CMD_ENABLE, ControlArg::Scalar(MODE_TRACE_PC)).unwrap();
        crate::trace::record_pc(0x1111);
        dispatch(&session, CMD_DISABLE, ControlArg::Scalar(0)).unwrap();
        assert_eq!(view.read_pcs(), vec![0x1111]);
    }
}
