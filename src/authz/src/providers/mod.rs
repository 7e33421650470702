//! In-process implementations of the store and transport contracts

pub mod local_bus;
pub mod memory;

pub use local_bus::LocalMessageBus;
pub use memory::MemoryDataProvider;
