//! Trading logic: market state, the order ledger, band computation, the
//! strategy and the decision loop that drives them.

pub mod bands;
pub mod ledger;
pub mod market_cache;
pub mod runner;
pub mod session;
pub mod strategy;

pub use bands::{BandEngine, Bands};
pub use ledger::{OrderLedger, OutstandingOrder, ReconcileAction};
pub use market_cache::{Candle, MarketCache, TopOfBook, WalletState};
pub use runner::SessionLoop;
pub use session::TradingSession;
pub use strategy::{Intent, Strategy};
