//! Control-protocol codec: request/response envelopes, vendor constants,
//! and inbound data frames. Pure and stateless — the session state machine
//! consumes this layer but no state lives here.

pub mod constants;
pub mod frames;
pub mod rpc;

pub use constants::{ErrorCodes, Methods, Streams};
pub use frames::{ChannelSelection, DataFrame, EegFrame, MetadataBlob, SamplePacket};
pub use rpc::{Inbound, RequestId, RpcError, RpcRequest, RpcResponse, classify};
