pub mod config;
pub mod error;
pub mod frame;
pub mod types;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use frame::{Frame, FrameKind};
