pub mod backtest;
pub mod file_asset;
pub mod requests;
pub mod schedule;
pub mod task;

pub use backtest::*;
pub use file_asset::*;
pub use requests::*;
pub use schedule::*;
pub use task::*;
