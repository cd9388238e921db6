use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// An order notification from the external catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default, deserialize_with = "loose_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub data: OrderData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderData {
    #[serde(default, deserialize_with = "loose_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub seller: Option<Seller>,
    #[serde(default)]
    pub order_items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seller {
    #[serde(default, deserialize_with = "loose_id")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderItem {
    /// The listing id this line item sold from.
    #[serde(default, deserialize_with = "loose_id")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub quantity: i64,
}

/// Ids arrive as numbers or strings; blank strings count as absent.
fn loose_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// What an event asks the local inventory to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderAction {
    /// Remove sold units.
    Sale,
    /// Put back the units the order removed.
    Restore,
    Ignore(String),
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Sale => "sale",
            OrderAction::Restore => "restore",
            OrderAction::Ignore(_) => "ignore",
        }
    }
}

const PAID: &str = "paid";

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn seller_id(&self) -> Option<&str> {
        self.data.seller.as_ref().and_then(|s| s.id.as_deref())
    }

    pub fn action(&self) -> OrderAction {
        let state = self.data.state.as_str();
        match self.cause.as_str() {
            "order.create" if state == PAID => OrderAction::Sale,
            "order.create" => OrderAction::Ignore(format!("order state is {:?}, not paid", state)),
            "order.update" if matches!(state, "canceled" | "request_for_cancel") => {
                OrderAction::Restore
            }
            "order.update" if self.data.previous_state.as_deref() == Some(PAID) && state != PAID => {
                OrderAction::Restore
            }
            "order.update" => OrderAction::Ignore(format!(
                "state change {:?} -> {:?} does not move quantities",
                self.data.previous_state.as_deref().unwrap_or(""),
                state
            )),
            "order.destroy" => OrderAction::Restore,
            other => OrderAction::Ignore(format!("unsupported cause {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> WebhookEvent {
        WebhookEvent::parse(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_parses_numeric_ids() {
        let e = event(json!({
            "id": "a1b2",
            "cause": "order.create",
            "data": {
                "id": 733,
                "state": "paid",
                "seller": {"id": 42},
                "order_items": [{"product_id": 9001, "quantity": 2}]
            }
        }));
        assert_eq!(e.id.as_deref(), Some("a1b2"));
        assert_eq!(e.data.id.as_deref(), Some("733"));
        assert_eq!(e.seller_id(), Some("42"));
        assert_eq!(e.data.order_items[0].product_id.as_deref(), Some("9001"));
        assert_eq!(e.data.order_items[0].quantity, 2);
    }

    #[test]
    fn test_action_by_cause_and_state() {
        let with = |cause: &str, state: &str, previous: Option<&str>| {
            event(json!({"cause": cause, "data": {"state": state, "previous_state": previous}}))
                .action()
        };

        assert_eq!(with("order.create", "paid", None), OrderAction::Sale);
        assert!(matches!(with("order.create", "pending", None), OrderAction::Ignore(_)));
        assert_eq!(with("order.update", "canceled", None), OrderAction::Restore);
        assert_eq!(with("order.update", "request_for_cancel", None), OrderAction::Restore);
        assert_eq!(with("order.update", "hub_pending", Some("paid")), OrderAction::Restore);
        assert!(matches!(with("order.update", "sent", Some("hub_pending")), OrderAction::Ignore(_)));
        assert!(matches!(with("order.update", "paid", Some("paid")), OrderAction::Ignore(_)));
        assert_eq!(with("order.destroy", "", None), OrderAction::Restore);
        assert!(matches!(with("product.update", "", None), OrderAction::Ignore(_)));
    }

    #[test]
    fn test_missing_fields_default() {
        let e = event(json!({"cause": "order.destroy"}));
        assert!(e.id.is_none());
        assert!(e.data.id.is_none());
        assert!(e.data.order_items.is_empty());
        assert!(e.seller_id().is_none());
    }
}
