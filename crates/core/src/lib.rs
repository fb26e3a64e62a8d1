pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::{AgentDefaults, Config, GatewayConfig, ProviderConfig, StreamerConfig, VisionConfig};
pub use error::{Error, ErrorKind, Result};
pub use event::{AgentEvent, EventSink};
