// Message module — types and wire encoding for mesh traffic

pub mod codec;
pub mod types;

pub use codec::{
    decode_frame, encode_frame, from_json, to_json, CodecError, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};
pub use types::{
    Acknowledgment, Attachment, EncryptionInfo, Hop, Message, MessageId, MessageType, Payload,
    Priority, RoutingAlgorithm, RoutingInfo, BROADCAST_DESTINATION,
};
