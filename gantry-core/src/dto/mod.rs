//! Data Transfer Objects
//!
//! Job descriptions accepted from users and read-only snapshots handed
//! across threads, so readers never hold a job lock.

pub mod job;
