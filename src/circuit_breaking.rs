//! Operator-driven circuit breaking of access pulls
//!
//! Operators publish rules per module as a JSON array under
//! [`keys::circuit_breaking_key`]:
//!
//! ```json
//! [{"key": "strategy_id", "method": "eq", "value": [1, 2]},
//!  {"key": "strategy_label", "method": "eq", "value": ["noisy"]}]
//! ```
//!
//! Batch access only evaluates strategy-level rules here; rules on other
//! dimensions are applied where tasks are dispatched.

use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::strategy::StrategyId;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Module name of the batch data pull
pub const ACCESS_DATA_MODULE: &str = "access.data";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMethod {
    #[default]
    Eq,
    Neq,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakingRule {
    pub key: String,
    #[serde(default)]
    pub method: RuleMethod,
    #[serde(default)]
    pub value: Vec<Value>,
}

impl CircuitBreakingRule {
    fn contains(&self, candidate: &str) -> bool {
        self.value.iter().any(|v| match v {
            Value::String(s) => s == candidate,
            other => other.to_string() == candidate,
        })
    }

    /// Whether any candidate satisfies the rule; `None` when the key is not strategy-level
    fn matches_strategy(&self, strategy_id: StrategyId, labels: &[String]) -> Option<bool> {
        let hit = match self.key.as_str() {
            "strategy_id" => self.contains(&strategy_id.to_string()),
            "strategy_label" | "labels" => labels.iter().any(|l| self.contains(l)),
            _ => return None,
        };
        Some(match self.method {
            RuleMethod::Eq => hit,
            RuleMethod::Neq => !hit,
        })
    }
}

/// Rules of one module, loaded once per cycle
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakingRules {
    rules: Vec<CircuitBreakingRule>,
}

impl CircuitBreakingRules {
    pub fn new(rules: Vec<CircuitBreakingRule>) -> Self {
        Self { rules }
    }

    /// Read the module's rules. Unreadable or malformed rules disable breaking
    /// for this cycle instead of failing it.
    pub async fn load(kv: &SharedKv, module: &str) -> Self {
        match Self::try_load(kv, module).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(module, "circuit breaking rules unavailable: {}", e);
                Self::default()
            }
        }
    }

    async fn try_load(kv: &SharedKv, module: &str) -> AccessResult<Self> {
        let Some(raw) = kv.get(&keys::circuit_breaking_key(module)).await? else {
            return Ok(Self::default());
        };
        let rules: Vec<CircuitBreakingRule> = serde_json::from_str(&raw)?;
        debug!(module, rules = rules.len(), "circuit breaking rules loaded");
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a strategy-level rule breaks this strategy
    pub fn breaks_strategy(&self, strategy_id: StrategyId, labels: &[String]) -> bool {
        self.rules
            .iter()
            .filter_map(|rule| rule.matches_strategy(strategy_id, labels))
            .any(|hit| hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn rules(value: Value) -> CircuitBreakingRules {
        CircuitBreakingRules::new(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_strategy_id_and_labels() {
        let rules = rules(json!([
            {"key": "strategy_id", "value": [1, "2"]},
            {"key": "strategy_label", "method": "eq", "value": ["noisy"]},
            {"key": "bk_biz_id", "value": [3]}
        ]));
        assert!(rules.breaks_strategy(1, &[]));
        assert!(rules.breaks_strategy(2, &[]));
        assert!(rules.breaks_strategy(7, &["noisy".to_string()]));
        assert!(!rules.breaks_strategy(3, &["quiet".to_string()]));
    }

    #[test]
    fn test_neq_rule() {
        let rules = rules(json!([{"key": "strategy_id", "method": "neq", "value": [1]}]));
        assert!(!rules.breaks_strategy(1, &[]));
        assert!(rules.breaks_strategy(2, &[]));
    }

    #[tokio::test]
    async fn test_load_from_kv() {
        let kv: SharedKv = Arc::new(MemoryStore::new());
        assert!(CircuitBreakingRules::load(&kv, ACCESS_DATA_MODULE).await.is_empty());

        let key = keys::circuit_breaking_key(ACCESS_DATA_MODULE);
        kv.set(&key, "not json", None).await.unwrap();
        assert!(CircuitBreakingRules::load(&kv, ACCESS_DATA_MODULE).await.is_empty());

        kv.set(&key, r#"[{"key": "strategy_id", "value": [5]}]"#, None)
            .await
            .unwrap();
        let rules = CircuitBreakingRules::load(&kv, ACCESS_DATA_MODULE).await;
        assert!(rules.breaks_strategy(5, &[]));
    }
}
