//! Client-side control and audio runtime.
//!
//! # Architecture
//!
//! ```text
//!  application thread(s)
//!        |  Client:: public methods
//!        v
//!  command pipe  --------->  control task  <------->  server socket
//!                                  |
//!                                  | spawns one audio task per stream
//!                                  v
//!                           audio task(s) <---> audio-notify socket
//!                                  |
//!                                  v
//!                        shared audio buffer (hearth_sab)
//! ```
//!
//! One control task per connected client, one audio task per attached
//! stream (§5's scheduling model). The control task exclusively owns the
//! streams list, the socket state, and the server-state shared mapping;
//! each audio task exclusively owns its `audio_fd`, `wake_pipe`, and the
//! stream's shared audio buffer.

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod file_wait;
pub mod socket_state;
pub mod stream;
pub mod thread;
pub mod wire;

pub use api::Client;
pub use config::HearthConfig;
pub use control::{
    Command, CommandReply, ConnectionCallback, ConnectionEvent, ControlTask, NotificationKind,
    StreamErrorCallback,
};
pub use error::ClientError;
pub use thread::ClientHandle;
pub use socket_state::{ConnectionStatus, SocketState, SocketStateMachine};
pub use stream::{
    try_raise_realtime_priority, AudioCallback, CallbackResult, ClientStream, StreamThreadState,
};
