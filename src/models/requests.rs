use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodType {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1d")]
    OneDay,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Tick => "tick",
            PeriodType::OneMinute => "1m",
            PeriodType::FiveMinutes => "5m",
            PeriodType::OneDay => "1d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DividendType {
    #[default]
    None,
    Front,
    Back,
    FrontRatio,
    BackRatio,
}

fn default_time_range() -> String {
    "all".to_string()
}

/// Parses a `YYYYMMDD` trading date into midnight UTC.
pub fn parse_trade_date(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn validate_window(
    stock_files: &[String],
    field_list: &[String],
    start_date: &str,
    end_date: &str,
) -> Result<(), String> {
    if stock_files.iter().all(|f| f.trim().is_empty()) {
        return Err("stock_files requires at least one file".to_string());
    }
    if field_list.is_empty() {
        return Err("field_list must not be empty".to_string());
    }
    let start = parse_trade_date(start_date)
        .ok_or_else(|| format!("start_date must be YYYYMMDD, got '{}'", start_date))?;
    let end = parse_trade_date(end_date)
        .ok_or_else(|| format!("end_date must be YYYYMMDD, got '{}'", end_date))?;
    if end < start {
        return Err("end_date must not precede start_date".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDownloadRequest {
    pub local_data_path: String,
    pub stock_files: Vec<String>,
    pub field_list: Vec<String>,
    pub period_type: PeriodType,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub dividend_type: DividendType,
    #[serde(default = "default_time_range")]
    pub time_range: String,
}

impl DataDownloadRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.local_data_path.trim().is_empty() {
            return Err("local_data_path must not be empty".to_string());
        }
        validate_window(&self.stock_files, &self.field_list, &self.start_date, &self.end_date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplementHistoryRequest {
    pub stock_files: Vec<String>,
    pub field_list: Vec<String>,
    pub period_type: PeriodType,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub dividend_type: DividendType,
    #[serde(default = "default_time_range")]
    pub time_range: String,
}

impl SupplementHistoryRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_window(&self.stock_files, &self.field_list, &self.start_date, &self.end_date)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub config_path: String,
    pub strategy_path: String,
    #[serde(default = "default_true")]
    pub initialize_data: bool,
    #[serde(default)]
    pub run_once: bool,
}

impl PipelineRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_path.trim().is_empty() || self.strategy_path.trim().is_empty() {
            return Err("config_path and strategy_path must not be empty".to_string());
        }
        Ok(())
    }
}

/// Longest accepted retention window, one hundred years.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Overrides for a one-off retention pass. Missing fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub retention_days: Option<i64>,
    pub file_limit: Option<i64>,
    pub task_limit: Option<i64>,
}

impl CleanupRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.retention_days.is_some_and(|d| d < 0) {
            return Err("retention_days must not be negative".to_string());
        }
        if self.retention_days.is_some_and(|d| d > MAX_RETENTION_DAYS) {
            return Err(format!("retention_days must not exceed {}", MAX_RETENTION_DAYS));
        }
        if self.file_limit.is_some_and(|l| l <= 0) || self.task_limit.is_some_and(|l| l <= 0) {
            return Err("limits must be positive".to_string());
        }
        Ok(())
    }
}
