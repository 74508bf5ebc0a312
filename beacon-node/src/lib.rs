// Public modules
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod identity;
pub mod network;
pub mod server;
pub mod services;

// Re-export the facades
pub use client::{Client, ClientBuilder};
pub use server::{Server, ServerBuilder};

pub use config::{BackendOptions, BeaconConfig};
pub use errors::{EngineError, ErrorKind, RpcError};
pub use events::{BeaconEvent, EventBus};
pub use identity::NodeIdentity;

// Re-export the main types from the services module
pub use services::{
    ActionHandler, CallDispatcher, LocalService, PermittedActions, ServiceFuture, ServiceObject,
    ServiceRegistration, ServiceRegistry,
};

// Re-export the main types from the network module
pub use network::discovery::{
    BackendKind, KvEngine, MemoryKvEngine, MemoryTreeEngine, ProviderRecord, RegistryAdapter,
    TreeEngine,
};
pub use network::transport::{MemoryNetwork, MemoryTransport, RpcTransport, TcpTransport};
pub use network::{ConnectionPool, PoolState};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
