pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ChartflowError, Result};
pub use event::EventBus;
pub use traits::Generator;
pub use types::*;
