pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowgateError, Result};
pub use event::EventBus;
pub use types::*;
