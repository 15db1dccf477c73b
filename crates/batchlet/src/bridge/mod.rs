//! Framed JSON protocol between the server and the runner subprocess.

pub mod codec;
pub mod protocol;

pub use codec::JsonCodec;
pub use protocol::{
    BatchOutcome, CancelKind, PROTOCOL_VERSION, RunnerRequest, RunnerResponse,
};
