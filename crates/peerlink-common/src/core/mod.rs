pub mod catalog;
pub mod engine;
pub mod error;
pub mod identity;
pub mod node;
pub mod registry;
pub mod session;
pub mod transfer;
