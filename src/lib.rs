//! Headless Kick drops miner: tracks drop campaigns, keeps one hidden
//! browser session watching the best qualifying live channel, fails over
//! when that channel stops qualifying and claims rewards as they unlock.

pub mod error;
pub mod models;
pub mod services;
pub mod traits;
