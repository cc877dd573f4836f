// #![deny(warnings)]

pub mod ads;
pub mod events;
pub mod manager;
pub mod payload;
pub mod player;
pub mod session;
pub mod transport;

pub use anyhow::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
