// src/core/replication/mod.rs

//! Master→slave replication: the per-slave dispatch queues and ack
//! watermarks on the master, the catch-up streaming helpers, and the
//! follower task a slave runs per group.

pub mod dispatcher;
pub mod sync;
pub mod worker;

pub use dispatcher::ReplicationDispatcher;
