/*!
 * Transport implementations for gepace.
 *
 * Concrete byte carriers implementing [`crate::protocol::Transport`] or
 * [`crate::protocol::SyncTransport`].
 */

pub mod mock;
pub mod std_tcp;
pub mod tcp;

pub use mock::{MockCall, MockTransport};
pub use std_tcp::StdTcpTransport;
pub use tcp::TcpTransport;
