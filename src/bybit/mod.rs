//! Bybit v5 exchange gateway: wire models, request signing, the signed REST
//! client and the websocket session layer.

pub mod models;
pub mod rest;
pub mod sign;
pub mod ws;

pub use models::{OrderData, OrderStatus, Side, TradingRules};
pub use rest::BybitRestClient;
pub use ws::{SessionEvent, SessionState, TopicHandler, WsSession, WsTiming};
