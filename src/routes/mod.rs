pub(crate) mod backtests;
pub(crate) mod health;
pub(crate) mod schedules;
pub(crate) mod tasks;
