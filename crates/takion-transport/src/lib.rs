//! # takion-transport
//!
//! Client-side engine for the Takion remote-play streaming protocol.
//!
//! Establishes an authenticated, encrypted session with a console over UDP,
//! frames and dispatches the tagged control messages, rebuilds lost AV shards
//! with a Cauchy Reed-Solomon decoder over GF(2^8), and reports loss and RTT
//! so the console can adapt its bitrate.
//!
//! ## Crate structure
//!
//! - [`wire`] — Field-level encoding primitives (varints, tagged fields)
//! - [`message`] — `TakionMessage`, the 33-kind control message codec
//! - [`packet`] — Datagram framing: control chunks, AV headers, congestion
//! - [`crypto`] — ECDH handshake, keystream and GMAC at a key position
//! - [`codec`] — Cauchy FEC encoder/decoder
//! - [`reassembly`] — Block-group reassembly and ordered frame delivery
//! - [`congestion`] — Loss/RTT tracking and target bitrate
//! - [`session`] — Sans-IO session state machine
//! - [`launch`] — Launch spec document embedded in BIG
//! - [`config`] — TOML-loadable session configuration
//! - [`stats`] — Serializable counters
//! - [`runtime`] — Socket driver, FEC worker thread, consumer interface

pub mod codec;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod launch;
pub mod message;
pub mod packet;
pub mod reassembly;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod wire;

pub use codec::{FecDecoder, FecEncoder, FecError};
pub use config::SessionConfig;
pub use congestion::CongestionMonitor;
pub use crypto::{CryptoContext, CryptoError, EcdhKeypair, Role};
pub use message::{CodecError, MessageType, TakionMessage};
pub use packet::{Datagram, StreamKind};
pub use reassembly::{Frame, ReassemblyBuffer, StreamShard};
pub use runtime::{StreamConsumer, TakionRuntime};
pub use session::{DisconnectReason, Session, SessionEvent, SessionState};
