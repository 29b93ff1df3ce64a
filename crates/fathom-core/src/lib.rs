pub mod config;
pub mod error;
pub mod events;
pub mod types;
pub mod wire;

pub use config::FathomConfig;
pub use error::{FathomError, Result};
pub use events::TurnEvent;
pub use types::*;
