//! Coordinator/worker messaging
//!
//! Used for registration, wake signals and progress relay. Job payloads never travel over
//! these channels; workers read them from the store.

mod channel;
mod protocol;
mod relay;

pub use channel::{Connector, Outbox, Router, RouterHandle, RouterInbox, WorkerEndpoint};
pub use protocol::{
    Envelope, ProgressUpdate, RelayedEvent, Signal, TransferStats, WorkerId, WorkerMessage,
};
pub use relay::Relay;
