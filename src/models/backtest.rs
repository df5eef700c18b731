use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::JobError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub id: Uuid,
    pub task_id: String,
    pub status: String,
    pub detail: Option<String>,
    pub config_path: Option<String>,
    pub strategy_path: Option<String>,
    pub parameters: Value,
    pub result_path: Option<String>,
    pub cost_summary: Value,
    pub performance_summary: Value,
    pub report_payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BacktestRecord {
    pub fn new(task_id: &str, request: &BacktestRunRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            status: "running".to_string(),
            detail: None,
            config_path: Some(request.config_path.clone()),
            strategy_path: Some(request.strategy_path.clone()),
            parameters: serde_json::to_value(request).unwrap_or(Value::Null),
            result_path: None,
            cost_summary: Value::Object(Default::default()),
            performance_summary: Value::Object(Default::default()),
            report_payload: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Written back onto a BacktestRecord when the run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestCompletion {
    pub status: String,
    pub detail: Option<String>,
    pub result_path: Option<String>,
    pub cost_summary: Value,
    pub performance_summary: Value,
    pub report_payload: Value,
}

impl BacktestCompletion {
    pub fn failed(reason: &str) -> Self {
        Self {
            status: "failed".to_string(),
            detail: Some(reason.to_string()),
            result_path: None,
            cost_summary: Value::Object(Default::default()),
            performance_summary: Value::Object(Default::default()),
            report_payload: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceAdjustment {
    #[default]
    Pre,
    Post,
    None,
}

fn default_fields() -> Vec<String> {
    ["open", "high", "low", "close", "volume", "amount"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bar_count() -> u32 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRunRequest {
    pub config_path: String,
    pub strategy_path: String,
    #[serde(default)]
    pub fq: PriceAdjustment,
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    #[serde(default = "default_bar_count")]
    pub bar_count: u32,
    #[serde(default)]
    pub overrides: Option<BacktestConfigOverrides>,
}

impl BacktestRunRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_path.trim().is_empty() || self.strategy_path.trim().is_empty() {
            return Err("config_path and strategy_path must not be empty".to_string());
        }
        if self.bar_count == 0 {
            return Err("bar_count must be greater than 0".to_string());
        }
        Ok(())
    }
}

// ==============================================================================
// Engine Configuration
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCostConfig {
    pub min_commission: Option<f64>,
    pub commission_rate: Option<f64>,
    pub stamp_tax_rate: Option<f64>,
    pub flow_fee: Option<f64>,
}

fn default_initial_cash() -> f64 {
    1_000_000.0
}

fn default_kline_period() -> String {
    "1d".to_string()
}

/// Typed configuration handed to the backtest engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default)]
    pub stock_list: Vec<String>,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: f64,
    #[serde(default = "default_kline_period")]
    pub kline_period: String,
    pub backtest_start: Option<String>,
    pub backtest_end: Option<String>,
    #[serde(default)]
    pub trade_cost: TradeCostConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfigOverrides {
    pub stock_list: Option<Vec<String>>,
    pub initial_cash: Option<f64>,
    pub kline_period: Option<String>,
    pub backtest_start: Option<String>,
    pub backtest_end: Option<String>,
    pub trade_cost: Option<TradeCostConfig>,
}

impl BacktestConfig {
    pub async fn load(path: &Path, overrides: Option<&BacktestConfigOverrides>) -> Result<Self, JobError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            JobError::Validation(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let mut config: BacktestConfig = serde_json::from_str(&raw).map_err(|e| {
            JobError::Validation(format!("invalid config file {}: {}", path.display(), e))
        })?;
        if let Some(overrides) = overrides {
            config.apply(overrides);
        }
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &BacktestConfigOverrides) {
        if let Some(stock_list) = &overrides.stock_list {
            self.stock_list = stock_list.clone();
        }
        if let Some(cash) = overrides.initial_cash {
            self.initial_cash = cash;
        }
        if let Some(period) = &overrides.kline_period {
            self.kline_period = period.clone();
        }
        if overrides.backtest_start.is_some() {
            self.backtest_start = overrides.backtest_start.clone();
        }
        if overrides.backtest_end.is_some() {
            self.backtest_end = overrides.backtest_end.clone();
        }
        if let Some(cost) = &overrides.trade_cost {
            self.trade_cost = cost.clone();
        }
    }
}

/// What the engine hands back after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutcome {
    pub result_path: Option<String>,
    #[serde(default)]
    pub report: Value,
}

impl EngineOutcome {
    pub fn summary(&self, key: &str) -> Value {
        self.report
            .get(key)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_config_loads_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"stock_list": ["600000.SH"], "initial_cash": 50000}"#)
            .await
            .unwrap();

        let overrides = BacktestConfigOverrides {
            stock_list: Some(vec!["000001.SZ".into(), "600036.SH".into()]),
            ..Default::default()
        };
        let config = BacktestConfig::load(&path, Some(&overrides)).await.unwrap();
        assert_eq!(config.stock_list.len(), 2);
        assert_eq!(config.initial_cash, 50000.0);
        assert_eq!(config.kline_period, "1d");
    }

    #[tokio::test]
    async fn test_missing_config_is_validation_error() {
        let err = BacktestConfig::load(Path::new("/nonexistent/config.json"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn test_outcome_summary_defaults_to_empty_object() {
        let outcome = EngineOutcome {
            result_path: None,
            report: json!({"performance_summary": {"sharpe": 1.2}, "cost_summary": 3}),
        };
        assert_eq!(outcome.summary("performance_summary")["sharpe"], 1.2);
        assert_eq!(outcome.summary("cost_summary"), json!({}));
    }
}
