// Library crate - exports the exchange gateway and trading logic

pub mod bybit;
pub mod config;
pub mod error;
pub mod trading_core;

// Re-export commonly used types
pub use config::{ApiCredentials, BotConfig};
pub use error::SessionFault;
pub use trading_core::{SessionLoop, TradingSession};
