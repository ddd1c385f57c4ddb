//! Transport-scoped DHT node handles and their channel protocol.
//!
//! The routing-table maintenance algorithm is Kademlia-style and assumed
//! external; this module carries the handle each transport owns, the
//! bincode channel messages, and the query/serve plumbing the DHT manager
//! drives.

pub mod node;
pub mod protocol;

pub use node::{node_id_for_endpoint, DhtConnector, DhtNode, DhtPeer, ALPHA};
pub use protocol::{read_message, write_message, DhtMessage, DHT_CHANNEL_SHUNT, MAX_MESSAGE_LEN};
