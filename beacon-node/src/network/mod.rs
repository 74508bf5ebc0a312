// Network Module
//
// Registry adapters (discovery), the per-alias connection pool and the
// envelope transports.

pub mod connection_pool;
pub mod discovery;
pub mod ring;
pub mod transport;

pub use connection_pool::{ConnectionPool, PoolState, SelectedProvider};
pub use discovery::{
    create_adapter, BackendKind, ChangeListener, KeyCodec, MemoryKvEngine, MemoryTreeEngine,
    ProviderRecord, RegistryAdapter, RegistryEngines, RegistryKey,
};
pub use ring::RoundRobinRing;
pub use transport::{
    CallEnvelope, ConnectionStatus, EnvelopeHandler, MemoryNetwork, MemoryTransport,
    NetworkError, ResponseEnvelope, ResponseOutcome, RpcConnection, RpcListener, RpcTransport,
    TcpTransport,
};
