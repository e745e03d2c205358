//! Transfer state machines, one per direction.

pub mod recv;
pub mod send;

pub use recv::{ReceivedFile, RecvMachine, RecvProgress, RecvStage};
pub use send::{SendMachine, SendProgress, SendStage};
