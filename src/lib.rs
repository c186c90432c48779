//! Client-side connectivity for a LAN-hosted inference node.
//!
//! The pieces compose bottom-up: [`probe`] answers "is this node alive and
//! serving", [`discovery`] finds candidate nodes on the local network,
//! [`resolver`] races probes across a primary and its fallbacks to pick one
//! endpoint, [`lifecycle`] drives a chosen node to a desired loaded-model
//! state, and [`stream`] runs a chat turn over the node's WebSocket surface.
//! [`status`] publishes the latest connection verdict to subscribers.
//!
//! Every network-facing operation takes an explicit time budget and, where
//! it can run long, a [`tokio_util::sync::CancellationToken`].

pub mod config;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod model_id;
pub mod probe;
pub mod resolver;
pub mod rpc;
pub mod status;
pub mod stream;

pub use config::LinkConfig;
pub use discovery::{DiscoveredHost, DiscoveryService, DiscoverySource};
pub use errors::LinkError;
pub use lifecycle::{LoadStatus, ModelLifecycleManager, ModelLoadProgress};
pub use probe::{ConnectionState, ProbeClient, ProbeResult};
pub use resolver::{Endpoint, EndpointResolver, EndpointSource, EndpointState, ResolveOptions};
pub use rpc::{DownloadProgress, DownloadStatus, LoadOutcome, ModelControl, NodeRpcClient};
pub use status::ConnectionMonitor;
pub use stream::{
    stream_chat, ChatMessage, ChatRequest, ChatStream, StreamEvent, StreamOptions, ToolCall,
};
