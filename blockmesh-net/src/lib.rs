#![allow(dead_code)]

mod peer;
mod rpc;
mod transport;

pub use peer::{IKeyNetwork, PeerAddr, PeerId, StaticKeyNetwork};
pub use rpc::{
    decode_request, decode_response, encode_request, encode_response, RpcKind, RpcOutcome,
    RpcRequest, RpcResponse,
};
pub use transport::LoopbackTransport;
