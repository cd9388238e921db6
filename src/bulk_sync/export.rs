//! Export rows as the external catalog delivers them.

use crate::inventory::ItemUpsert;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportRow {
    /// Listing id on the external catalog. Numeric or string on the wire.
    #[serde(default, deserialize_with = "listing_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub blueprint_id: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub price_cents: Option<i64>,
    #[serde(default, alias = "properties")]
    pub properties_hash: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub user_data_field: Option<String>,
    #[serde(default)]
    pub graded: Option<bool>,
}

fn listing_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl ExportRow {
    pub fn to_upsert(&self, catalog_item_id: i64, listing_id: String) -> ItemUpsert {
        let properties = match &self.properties_hash {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(Default::default()),
        };
        ItemUpsert {
            catalog_item_id,
            external_listing_id: listing_id,
            quantity: self.quantity.unwrap_or(0).max(0),
            price_cents: self.price_cents.unwrap_or(0),
            properties,
            description: self.description.clone().filter(|d| !d.is_empty()),
            user_data_field: self.user_data_field.clone().filter(|d| !d.is_empty()),
            graded: self.graded.unwrap_or(false),
        }
    }
}

/// Listing id of a raw row, for error reporting.
pub fn raw_listing_id(row: &Value) -> Option<String> {
    match row.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Extracts the row list from an export: either a bare JSON array or an
/// object wrapping it under `products` or `data`.
pub fn rows_from_value(export: Value) -> Result<Vec<Value>> {
    match export {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => {
            for field in ["products", "data"] {
                if let Some(Value::Array(rows)) = map.remove(field) {
                    return Ok(rows);
                }
            }
            bail!("Export object has no products array")
        }
        other => bail!("Export is not a list of products (got {})", type_name(&other)),
    }
}

pub fn parse_export(bytes: &[u8]) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_slice(bytes).context("Export is not valid JSON")?;
    rows_from_value(value)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_accepts_numeric_and_string_ids() {
        let numeric = ExportRow::deserialize(&json!({"id": 12345, "blueprint_id": 7})).unwrap();
        assert_eq!(numeric.id.as_deref(), Some("12345"));
        let text = ExportRow::deserialize(&json!({"id": "abc", "blueprint_id": 7})).unwrap();
        assert_eq!(text.id.as_deref(), Some("abc"));
        let blank = ExportRow::deserialize(&json!({"id": "", "blueprint_id": 7})).unwrap();
        assert_eq!(blank.id, None);
    }

    #[test]
    fn test_to_upsert_defaults() {
        let row = ExportRow::deserialize(&json!({
            "id": 1,
            "blueprint_id": 2,
            "quantity": -3,
            "properties_hash": {"condition": "Played", "mtg_foil": true},
            "description": ""
        }))
        .unwrap();
        let upsert = row.to_upsert(99, "1".into());
        assert_eq!(upsert.catalog_item_id, 99);
        assert_eq!(upsert.quantity, 0);
        assert_eq!(upsert.price_cents, 0);
        assert_eq!(upsert.properties["mtg_foil"], true);
        assert_eq!(upsert.description, None);
        assert!(!upsert.graded);
    }

    #[test]
    fn test_parse_export_shapes() {
        assert_eq!(parse_export(b"[{\"id\": 1}]").unwrap().len(), 1);
        assert_eq!(parse_export(b"{\"products\": [{}, {}]}").unwrap().len(), 2);
        assert!(parse_export(b"[]").unwrap().is_empty());
        assert!(parse_export(b"{\"oops\": 1}").is_err());
        assert!(parse_export(b"\"text\"").is_err());
        assert!(parse_export(b"not json").is_err());
    }
}
