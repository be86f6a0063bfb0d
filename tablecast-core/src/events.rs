//! Payloads published on the well-known topics
//!
//! The backend pushes two kinds of JSON events:
//!
//! - table status changes on [`TABLES_TOPIC`]
//! - order lifecycle changes on [`ORDERS_TOPIC`]
//!
//! Older publishers call the discriminator `eventType`; newer consumers read
//! `action`. Both spellings deserialize, and `action` is what gets written.

use serde::{Deserialize, Serialize};

/// Table status updates
pub const TABLES_TOPIC: &str = "/topic/tables";

/// Order created / updated / deleted
pub const ORDERS_TOPIC: &str = "/topic/orders";

/// Application destination whose payload is echoed to [`TABLES_TOPIC`]
pub const TABLE_RELAY_DESTINATION: &str = "/app/table.subscribe";

/// A table changed status, seats or number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatusEvent {
    #[serde(alias = "eventType", default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub table_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats: Option<i32>,
    pub status: String,
}

impl TableStatusEvent {
    pub fn update(table_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            action: Some("UPDATE".to_string()),
            table_id: table_id.into(),
            table_number: None,
            seats: None,
            status: status.into(),
        }
    }
}

/// What happened to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Created,
    Updated,
    Deleted,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Created => "created",
            OrderAction::Updated => "updated",
            OrderAction::Deleted => "deleted",
        }
    }
}

/// An order changed
///
/// `order` carries the full order document for `created`/`updated`;
/// `deleted` events only carry `orderId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    #[serde(alias = "eventType")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<serde_json::Value>,
}

impl OrderEvent {
    pub fn new(action: OrderAction, order_id: impl Into<String>) -> Self {
        Self {
            action: action.as_str().to_string(),
            order_id: Some(order_id.into()),
            table_id: None,
            user_id: None,
            total_amount: None,
            status: None,
            order: None,
        }
    }

    /// Parsed action, `None` for values this client does not know
    pub fn kind(&self) -> Option<OrderAction> {
        match self.action.as_str() {
            "created" => Some(OrderAction::Created),
            "updated" => Some(OrderAction::Updated),
            "deleted" => Some(OrderAction::Deleted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_event_accepts_event_type_alias() {
        let event: TableStatusEvent = serde_json::from_value(json!({
            "eventType": "UPDATE",
            "tableId": "t-1",
            "tableNumber": 4,
            "seats": 6,
            "status": "OCCUPIED"
        }))
        .unwrap();
        assert_eq!(event.action.as_deref(), Some("UPDATE"));
        assert_eq!(event.table_number, Some(4));

        let written = serde_json::to_value(&event).unwrap();
        assert_eq!(written["action"], "UPDATE");
        assert!(written.get("eventType").is_none());
    }

    #[test]
    fn test_table_event_minimal() {
        let event: TableStatusEvent =
            serde_json::from_str(r#"{"tableId":"t-9","status":"AVAILABLE"}"#).unwrap();
        assert_eq!(event, TableStatusEvent {
            action: None,
            ..TableStatusEvent::update("t-9", "AVAILABLE")
        });
    }

    #[test]
    fn test_order_event_kinds() {
        let deleted: OrderEvent =
            serde_json::from_str(r#"{"action":"deleted","orderId":"o-7"}"#).unwrap();
        assert_eq!(deleted.kind(), Some(OrderAction::Deleted));
        assert_eq!(deleted.order_id.as_deref(), Some("o-7"));
        assert!(deleted.order.is_none());

        let legacy: OrderEvent = serde_json::from_value(json!({
            "eventType": "updated",
            "orderId": "o-1",
            "status": "CONFIRMED",
            "totalAmount": 12.5,
            "order": {"id": "o-1"}
        }))
        .unwrap();
        assert_eq!(legacy.kind(), Some(OrderAction::Updated));
        assert_eq!(legacy.order.unwrap()["id"], "o-1");

        let unknown = OrderEvent {
            action: "archived".into(),
            ..OrderEvent::new(OrderAction::Created, "o-2")
        };
        assert_eq!(unknown.kind(), None);
    }
}
