//! Relay engine: session state machine, splice, supervisor, UDP forwarder

mod server;
mod session;
mod splice;
mod udp;

pub use server::{run, EXIT_FORCED, EXIT_OK};
pub use session::Session;
pub use splice::splice;
pub use udp::UdpForwarder;
