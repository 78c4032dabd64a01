//! Item model and request DTOs

use serde::{Deserialize, Serialize};

fn default_active() -> bool {
    true
}

/// A stored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub name: String,
    pub price: f64,
    pub is_active: bool,
}

impl Item {
    pub fn from_create(id: u64, req: ItemCreate) -> Self {
        Self {
            id,
            name: req.name,
            price: req.price,
            is_active: req.is_active,
        }
    }

    /// Apply a partial update; only provided fields change
    pub fn apply(&self, req: &ItemUpdate) -> Self {
        Self {
            id: self.id,
            name: req.name.clone().unwrap_or_else(|| self.name.clone()),
            price: req.price.unwrap_or(self.price),
            is_active: req.is_active.unwrap_or(self.is_active),
        }
    }

    /// Event payload for this item
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "price": self.price,
            "is_active": self.is_active,
        })
    }
}

/// Request to create an item, also used for full replacement (PUT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCreate {
    pub name: String,
    pub price: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl ItemCreate {
    pub fn validate(&self) -> Result<(), String> {
        validate_price(self.price)
    }
}

/// Partial update (PATCH)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl ItemUpdate {
    pub fn validate(&self) -> Result<(), String> {
        match self.price {
            Some(price) => validate_price(price),
            None => Ok(()),
        }
    }
}

fn validate_price(price: f64) -> Result<(), String> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(format!("price must be greater than 0, got {}", price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults_active() {
        let req: ItemCreate = serde_json::from_str(r#"{"name":"Test","price":10.0}"#).unwrap();
        assert!(req.is_active);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_price_must_be_positive() {
        let req: ItemCreate = serde_json::from_str(r#"{"name":"Free","price":0}"#).unwrap();
        assert!(req.validate().is_err());

        let update = ItemUpdate {
            price: Some(-1.5),
            ..Default::default()
        };
        assert!(update.validate().is_err());
        assert!(ItemUpdate::default().validate().is_ok());
    }

    #[test]
    fn test_apply_partial_update() {
        let item = Item {
            id: 1,
            name: "Item 1".into(),
            price: 10.0,
            is_active: true,
        };
        let patched = item.apply(&ItemUpdate {
            is_active: Some(false),
            ..Default::default()
        });
        assert_eq!(patched.name, "Item 1");
        assert_eq!(patched.price, 10.0);
        assert!(!patched.is_active);
    }

    #[test]
    fn test_snapshot_matches_serialization() {
        let item = Item {
            id: 7,
            name: "Lamp".into(),
            price: 12.5,
            is_active: false,
        };
        assert_eq!(item.snapshot(), serde_json::to_value(&item).unwrap());
    }
}
