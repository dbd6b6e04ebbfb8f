//! Long-lived service handles shared across the engine

mod local_store;

pub use local_store::LocalStore;
