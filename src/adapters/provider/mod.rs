//! Deployment provider adapters.

pub mod static_provider;

pub use static_provider::StaticProvider;
