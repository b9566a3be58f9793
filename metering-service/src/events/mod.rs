//! Event store.

mod store;

pub use store::EventStore;
