//! Connectivity and bandwidth monitoring.

mod monitor;
mod probe;

pub use monitor::{NetworkMonitor, NetworkSpeed, NetworkState, NetworkTransition, Subscription};
pub use probe::{HttpProbe, ReachabilityProbe};
