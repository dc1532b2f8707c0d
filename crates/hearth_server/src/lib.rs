//! Device/node registry and routing policy for the hearth audio server.
//!
//! # Architecture
//!
//! ```text
//!  hearthd (bin) — accept loop over the control socket
//!        |
//!        v
//!  one `RClient` per connection  <-->  shared `Router`
//!                                          |
//!                                          +-- devices (§4.6)
//!                                          +-- stream list (§4.5)
//!                                          +-- loopback/floop (§4.9)
//! ```
//!
//! The router is the single source of truth for "which device is
//! playing what"; every `RClient` holds a reference to the same router
//! behind the server's single main task (§5: "a single main task serves
//! rclient RPCs").

pub mod config;
pub mod device;
pub mod error;
pub mod fallback;
pub mod loopback;
pub mod rclient;
pub mod routing;
pub mod stream_list;
pub mod wire;

pub use config::ServerConfig;
pub use device::{Device, DeviceBackend, DeviceState, Node, NcProvider};
pub use error::ServerError;
pub use loopback::{LoopbackRegistry, LoopbackRegistration, LoopbackType, NUM_FLOOP_PAIRS_MAX};
pub use rclient::{identify_peer, PeerIdentity, RClient};
pub use routing::{DisableMode, Router, IDLE_DEVICE_CLOSE, MIN_POLL_SLEEP};
pub use stream_list::{ClientType, RStream, StreamList, StreamParams};
