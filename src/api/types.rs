//! Wire types for the execution webhook.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionAction {
    Open,
    Close,
}

/// Instruction sent to the order layer.
///
/// `idempotency_key` is stable per (position, action), so the receiver can
/// drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub idempotency_key: String,
    pub action: ExecutionAction,
    pub position_id: i64,
    pub strategy_id: String,
    pub asset: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        action: ExecutionAction,
        position_id: i64,
        strategy_id: &str,
        asset: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let verb = match action {
            ExecutionAction::Open => "open",
            ExecutionAction::Close => "close",
        };
        Self {
            idempotency_key: format!("{strategy_id}:{position_id}:{verb}"),
            action,
            position_id,
            strategy_id: strategy_id.to_string(),
            asset: asset.to_string(),
            price,
            timestamp,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_request_wire_format() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let request = ExecutionRequest::new(ExecutionAction::Close, 42, "btc-dip", "BTC", dec!(99.9), at)
            .with_reason("trailing stop");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["idempotencyKey"], "btc-dip:42:close");
        assert_eq!(json["action"], "close");
        assert_eq!(json["positionId"], 42);
        assert_eq!(json["price"], "99.9");
        assert_eq!(json["reason"], "trailing stop");
    }
}
