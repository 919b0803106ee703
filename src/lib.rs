//! dispatchd: durable multi-tier message dispatch.
//!
//! Producers append [`message::InputMessage`]s to an instant log. Processors
//! filter and batch them, hand them to a [`forwarder::Connector`], and move
//! failed targets through a chain of delayed retry logs. Every terminal
//! outcome goes to a [`feedback::ResultReporter`].

pub mod bootstrap;
pub mod config;
pub mod feedback;
pub mod filter;
pub mod forwarder;
pub mod message;
pub mod queue;
pub mod store;
pub mod telemetry;
