//! Collaborator traits: the seams between the scheduler core and the outside world.

pub mod queue;
pub mod store;
pub mod transport;

pub use queue::WorkQueue;
pub use store::RecordStore;
pub use transport::{Transport, TransportHandle, TransportResolver};
