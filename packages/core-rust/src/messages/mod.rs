//! Wire-compatible message schemas for the broker's JSON-RPC 2.0 protocol.
//!
//! All types serialize with camelCase field names. `rpc` holds the envelope
//! and error codes; `provider` holds the method names and parameter shapes.

pub mod provider;
pub mod rpc;

pub use provider::{
    ConnectionClosedParams, InvokeProviderParams, ProviderRequest, ProviderResultParams,
    RegisterProviderParams, RespondParams,
};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
