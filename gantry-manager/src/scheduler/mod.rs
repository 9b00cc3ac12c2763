//! Scheduler layer
//!
//! Drives monitoring rounds on a fixed interval until shutdown.

pub mod poller;

pub use poller::MonitoringLoop;
