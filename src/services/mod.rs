//! Domain services layered over the engine's event spine: fee calculation,
//! position projection, price tracking, and the daily settlement boundary.

pub mod fees;
pub mod positions;
pub mod price_feed;
pub mod settlement;
