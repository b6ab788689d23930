pub mod book;
pub mod candle_feed;
pub mod stream;

pub use book::{BookLevel, OrderBookSnapshot, TradeTick};
pub use candle_feed::{Candle, CandleFeed};
pub use stream::MarketStream;
