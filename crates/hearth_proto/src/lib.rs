//! Wire protocol and audio-format primitives shared by the client runtime
//! and the routing server.
//!
//! This crate has no threads: it defines the shapes that travel over the
//! control socket and the audio-notify socket, the numeric constants both
//! sides must agree on, and the one piece of actual I/O both sides share
//! verbatim — the `SCM_RIGHTS` framing in [`scm`], since a client and a
//! server that each hand-rolled their own `sendmsg`/`recvmsg` call would be
//! exactly the kind of duplication the control-socket contract can't
//! afford to let drift apart.
//!
//! # Layout
//!
//! - [`format`] — the negotiated audio format tuple, stream ids, direction.
//! - [`message`] — client→server and server→client message ids and framing.
//! - [`audio_message`] — the fixed 6-byte audio-fd datagram.
//! - [`scm`] — ancillary-fd frame send/receive shared by both peers.
//! - [`constants`] — timing and capacity constants from the external
//!   interface contract.
//! - [`error`] — [`ProtoError`], the shared protocol-level error type.

pub mod audio_message;
pub mod connection;
pub mod constants;
pub mod error;
pub mod format;
pub mod message;
pub mod scm;

pub use audio_message::{AudioMessage, AudioMessageId};
pub use connection::ConnectionType;
pub use error::ProtoError;
pub use format::{AudioFormat, ChannelPosition, Direction, SampleFormat, StreamId, CH_MAX};
pub use message::{ClientMessage, ClientMessageId, NotificationKind, ServerMessage, ServerMessageId};
pub use scm::{recv_frame, send_frame, MAX_FRAME_FDS};
