pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod mcp;
pub mod registry;
pub mod store;
pub mod telegram;
pub mod transport;
pub mod types;

pub use config::{Config, StorageBackend};
pub use coordinator::{Coordinator, ReplyOutcome, SubmitParams, TimeoutScheduler};
pub use directory::SessionDirectory;
pub use error::Error;
pub use mcp::{McpResponse, McpServer};
pub use registry::RequestRegistry;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use store::{InMemoryStore, Store};
pub use telegram::{TelegramAdapter, TelegramTransport};
pub use transport::ChatTransport;
pub use types::{HitlRequest, ReplySelection, RequestStatus, Session};
