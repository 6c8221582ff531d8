//! Protobuf payload messages carried inside envelope bodies.
//!
//! Generated-style prost structs committed as source; the wire schema is
//! small and stable enough that a build-script round-trip through protoc
//! buys nothing.

/// Body of the `login.signin` request a client sends as its first envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginReq {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
}

/// Session minted by the gateway during login and forwarded to the login
/// service in place of the raw token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Session {
    #[prost(string, tag = "1")]
    pub account: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub channel_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub gate_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub app: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub remote_ip: ::prost::alloc::string::String,
}

/// First binary frame on a peer-to-peer link: the dialing side advertises
/// its service id. No response is required.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InnerHandshakeReq {
    #[prost(string, tag = "1")]
    pub service_id: ::prost::alloc::string::String,
}
