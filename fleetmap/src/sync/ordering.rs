//! Ordering keys for queued mutations.
//!
//! Actions that share a key are delivered strictly in insertion order: while
//! one is waiting for a retry, later actions with the same key wait too.
//! Which kinds share keys is configuration, not code.

use std::collections::HashMap;

use serde_json::Value;

use crate::store::ActionKind;

/// How an action kind derives its ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingRule {
    /// Independent; never waits for other actions.
    None,
    /// Every action of this kind shares one key.
    Kind,
    /// Key is `<prefix>:<payload[field]>`; independent when the field is
    /// missing.
    PayloadField { prefix: String, field: String },
}

impl OrderingRule {
    pub fn payload_field(prefix: impl Into<String>, field: impl Into<String>) -> Self {
        Self::PayloadField {
            prefix: prefix.into(),
            field: field.into(),
        }
    }

    pub fn key_for(&self, kind: ActionKind, payload: &Value) -> Option<String> {
        match self {
            OrderingRule::None => None,
            OrderingRule::Kind => Some(format!("kind:{}", kind.as_str())),
            OrderingRule::PayloadField { prefix, field } => {
                let value = match payload.get(field)? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some(format!("{prefix}:{value}"))
            }
        }
    }
}

static INDEPENDENT: OrderingRule = OrderingRule::None;

/// Ordering rule per action kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingRules {
    rules: HashMap<ActionKind, OrderingRule>,
}

impl Default for OrderingRules {
    /// Mutations of one vehicle are ordered, as are status changes of one
    /// delivery. Logs and acknowledgements are independent.
    fn default() -> Self {
        Self::none()
            .with_rule(ActionKind::CreateVehicle, OrderingRule::payload_field("vehicle", "id"))
            .with_rule(ActionKind::UpdateVehicle, OrderingRule::payload_field("vehicle", "id"))
            .with_rule(ActionKind::DeleteVehicle, OrderingRule::payload_field("vehicle", "id"))
            .with_rule(
                ActionKind::AssignDriver,
                OrderingRule::payload_field("vehicle", "vehicle_id"),
            )
            .with_rule(
                ActionKind::UpdateDeliveryStatus,
                OrderingRule::payload_field("delivery", "delivery_id"),
            )
    }
}

impl OrderingRules {
    /// Every kind independent.
    pub fn none() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, kind: ActionKind, rule: OrderingRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    pub fn set_rule(&mut self, kind: ActionKind, rule: OrderingRule) {
        self.rules.insert(kind, rule);
    }

    pub fn rule(&self, kind: ActionKind) -> &OrderingRule {
        self.rules.get(&kind).unwrap_or(&INDEPENDENT)
    }

    pub fn key_for(&self, kind: ActionKind, payload: &Value) -> Option<String> {
        self.rule(kind).key_for(kind, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_field_key() {
        let rules = OrderingRules::default();
        assert_eq!(
            rules.key_for(ActionKind::UpdateVehicle, &json!({"id": "v7", "speed": 3})),
            Some("vehicle:v7".to_string())
        );
        assert_eq!(
            rules.key_for(ActionKind::AssignDriver, &json!({"vehicle_id": 7})),
            Some("vehicle:7".to_string())
        );
        assert_eq!(rules.key_for(ActionKind::UpdateVehicle, &json!({})), None);
    }

    #[test]
    fn test_unconfigured_kinds_are_independent() {
        let rules = OrderingRules::default();
        assert_eq!(rules.key_for(ActionKind::LogFuel, &json!({"id": "v1"})), None);
        assert_eq!(OrderingRules::none().rule(ActionKind::UpdateVehicle), &OrderingRule::None);
    }

    #[test]
    fn test_kind_rule() {
        let rules = OrderingRules::none().with_rule(ActionKind::LogFuel, OrderingRule::Kind);
        assert_eq!(
            rules.key_for(ActionKind::LogFuel, &json!(null)),
            Some("kind:log_fuel".to_string())
        );
    }
}
