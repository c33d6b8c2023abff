pub mod channel;
pub mod frame;
pub mod header;
pub mod negotiation;

pub use channel::{ChannelEvent, ChannelRole, ChannelState, PeerChannel, SendOutcome, ANY_MD5};
pub use header::ChannelHeader;
pub use negotiation::{NegotiationConn, PeerRpcHandler};
