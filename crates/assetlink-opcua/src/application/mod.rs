//! Application layer of the OPC UA binding.
//!
//! - **`session`** – the [`UaClient`](session::UaClient) and
//!   [`UaConnector`](session::UaConnector) traits every protocol stack
//!   implements, and [`Session`](session::Session), which bounds each request
//!   by the request timeout and the connection's lifecycle.
//!
//! - **`provider`** – value, subscription and operation providers bound to
//!   one session.
//!
//! - **`connection`** – the asset connection: connect with retries, build
//!   the providers all-or-nothing, tear down on close.
//!
//! This layer depends on the traits only.  Which stack sits behind them is
//! decided by whoever calls `init`.

pub mod connection;
pub mod provider;
pub mod session;
