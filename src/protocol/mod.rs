//! Wire framing shared by the info and data channels.

pub mod compress;
pub mod frame;
pub mod info;
pub mod message;

pub use frame::{Frame, FrameHeader, HEADER_SIZE, MessageType, PROTO_VERSION, encode_frame};
pub use info::{InfoMap, NodeInfo};
pub use message::MessageHeader;
