//! Infrastructure layer of the OPC UA binding: the protocol stacks behind
//! [`UaConnector`](crate::UaConnector).
//!
//! - **`server`** – an in-process address space for tests and the simulator.
//! - **`client`** – the `opcua` crate's client stack, behind the `client`
//!   feature.
//!
//! **Dependency rule**: this layer may depend on `application` and `domain`,
//! but MUST NOT be imported by them outside of tests.

#[cfg(feature = "client")]
pub mod client;
pub mod server;
