//! # nceph Delivery Layer
//!
//! ## Purpose
//! The reliability brain of the nceph network: per-message delivery records
//! and the handlers that drive them to completion. The socket engine
//! (`nceph-network`) moves frames; this crate decides what each frame means
//! for the guarantee that every published event reaches every subscriber at
//! least once.
//!
//! ## Record Types
//! - **POA** ([`poa::ProofOfAuthentication`]): one per connection handshake,
//!   relay side, deleted on completion
//! - **POD** ([`pod::ProofOfPublish`]): one per published event on each side
//!   of the producer↔relay leg
//! - **POR** ([`por::ProofOfRelay`]): one per (event, subscriber) on each
//!   side of the relay↔consumer leg
//!
//! ## Architecture Role
//! ```text
//! inbound frame  → DeliveryDispatcher → receptor  → record update + reply
//! write complete → DeliveryDispatcher → affector  → record update
//! every interval → Monitor            → re-drive stalled records
//! ```
//!
//! All records move through strictly monotonic state machines ([`state`]),
//! which makes every handler idempotent under retransmission; the monitor
//! can therefore re-send anything that looks stalled without coordination.

pub mod affectors;
pub mod app;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod poa;
pub mod pod;
pub mod por;
pub mod receptors;
pub mod state;
pub mod store;
pub mod timing;

pub use app::{AppReceptor, AppReceptorRegistry};
pub use context::{DeliveryContext, NodeRole};
pub use dispatcher::DeliveryDispatcher;
pub use error::{DeliveryError, DeliveryResult};
pub use monitor::Monitor;
pub use poa::ProofOfAuthentication;
pub use pod::ProofOfPublish;
pub use por::ProofOfRelay;
pub use state::{DeliveryState, PoaState};
pub use store::{DocumentStore, InMemoryDocumentStore, RecordCache};
