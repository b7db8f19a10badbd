//! Network reachability probes used before any sign-in attempt.

mod reachability;

pub use reachability::{ConnectionStatus, HttpReachability, Reachability, connection_status, probe_backend};
