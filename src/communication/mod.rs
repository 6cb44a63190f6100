pub mod frame;
pub mod protocol;
pub mod request_channel;
pub mod serial;

pub use frame::{Decoded, FrameCodec, FrameDecoder};
pub use protocol::{Method, Reply, Response, StatusReport};
pub use request_channel::{InternalRequest, RequestChannel, RequestResult, Responder};
pub use serial::{Serial2Connector, SerialConnector, SerialLink};
