pub mod api;
pub mod config;
pub mod connections;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod ws;

pub use config::{load_config, ConfigError, DeskConfig, ServerConfig, StorageConfig};
pub use connections::{Channel, ConnectionRegistry};
pub use error::OrchestratorError;
pub use orchestrator::{OrchestratorSettings, SessionHub, SessionSnapshot};
pub use server::{start, AppState, ServerHandle};
pub use session::SessionState;
