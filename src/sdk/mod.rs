/// Software Development Kit (SDK) for Statebridge.
///
/// This module provides a remote [`StateStore`](crate::StateStore) client for
/// the component protocol and environment-based discovery of a store.
pub mod client;
/// Automatic mode discovery and store initialization.
pub mod discovery;

pub use client::{Client, Endpoint};
pub use discovery::new;
