//! Line-oriented plumbing for the management socket.

pub mod router;
pub mod transport;

pub use router::{Comparison, MatchMode, MessageRouter};
pub use transport::{LineTransport, TransportEvent, TransportHandle};
