//! Epoch scoped request processing.
//!
//! Requests are bound to an [epoch::Epoch] and routed by a [dispatcher::Dispatcher] to a present
//! or a future handler. Each handler runs as a [flow::Flow] which is notified about pulses. Writes
//! are admitted by a [barrier::WriteBarrier] only while their epoch is open, and an epoch change
//! waits until all writes of the closing epoch have finished.

pub mod app;
pub mod barrier;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod epoch;
pub mod flow;
pub mod logging;
pub mod node;
pub(crate) mod utilities;
