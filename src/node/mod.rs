pub mod identity;
pub mod store;

pub use identity::NodeIdentity;
pub use store::{ChainSnapshot, ChainStore};
