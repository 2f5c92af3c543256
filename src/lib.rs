//! Reliable, sequenced, congestion-aware byte streams over UDP, in the
//! manner of UDT.
//!
//! A [`Udt`] context owns the UDP endpoints and the transmission scheduler.
//! [`UdtListener`] accepts peers, [`UdtConnection`] carries the data.

mod ack_window;
mod common;
mod configuration;
mod connection;
mod control_packet;
mod cookie;
mod data_packet;
mod endpoint;
mod flow;
mod heap;
mod listener;
mod loss_list;
mod packet;
mod queue;
mod rate_control;
mod seq_number;
mod socket;
mod state;
mod timer;
mod udt;

pub use configuration::{CongestionControlFactory, UdtConfiguration, MIN_TIMEOUT};
pub use connection::UdtConnection;
pub use listener::{ListenerEvent, UdtListener};
pub use rate_control::CongestionControl;
pub use seq_number::SeqNumber;
pub use socket::{ConnectionEvent, SocketId, UdtStatus};
pub use udt::Udt;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
