pub mod accessory;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
