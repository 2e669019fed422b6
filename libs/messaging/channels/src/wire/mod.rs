//! TCP transport for exchange channels
//!
//! `BrokerServer` exposes a broker over TCP and `TcpBroker` implements
//! [`Broker`](crate::Broker) by dialing one. One TCP connection per link.

pub mod client;
pub mod frame;
pub mod server;

pub use client::TcpBroker;
pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE};
pub use server::BrokerServer;
