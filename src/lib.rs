pub mod config;
pub mod error;
pub mod backend;
pub mod net;
pub mod identity;
pub mod certificate;
pub mod server;
