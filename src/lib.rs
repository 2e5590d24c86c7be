pub mod admin;
mod error;
pub mod health;
pub mod http;
pub mod proxy;
pub mod store;
pub mod trace;
pub mod upstream;

pub use error::{RelayError, Result};
pub use http::{router, GatewayState};
pub use store::{AccessKey, ConfigStore, GroupConfig, Protocol, ProviderConfig};
pub use trace::TraceRecorder;
