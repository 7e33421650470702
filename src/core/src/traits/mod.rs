//! Boundary contracts implemented by the host deployment

pub mod data_provider;
pub mod message_provider;
pub mod resolver;

pub use data_provider::{DataProvider, LoggedActivity};
pub use message_provider::MessageProvider;
pub use resolver::{MissingEntityResolver, ResolvedEntity};
