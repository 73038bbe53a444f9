//! Adapters behind the domain ports.

pub mod in_memory;
pub mod notifier;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod sandbox_gateway;
pub mod timeout;
