//! Wire bridge to the Malmo client.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed framing over the mission socket
//! - **protocol**: text commands and fixed-layout binary replies
//! - **connection**: one greeted TCP connection with bounded receives

pub mod codec;
pub mod connection;
pub mod protocol;
