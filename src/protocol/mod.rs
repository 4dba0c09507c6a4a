pub mod codec;
pub mod frame;
pub mod initiator;
pub mod registry;
pub mod responder;

pub use codec::FrameCodec;
pub use frame::{Frame, State, IP_LEN, MAC_LEN, REQ_ID_LEN};
