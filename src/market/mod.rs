pub mod candle;
pub mod store;

pub use candle::KlineCandle;
pub use store::{MarketStore, Snapshot};
