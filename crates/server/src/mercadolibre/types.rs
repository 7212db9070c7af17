//! MercadoLibre API response types.
//!
//! Only the fields the listing flow reads are modelled. Unknown fields are
//! ignored so upstream additions do not break deserialization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `GET /users/me` profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MlUser {
    pub id: i64,
    pub nickname: String,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permalink: Option<String>,
}

/// One result of `GET /sites/{site}/domain_discovery/search`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryPrediction {
    pub domain_id: String,
    pub domain_name: String,
    pub category_id: String,
    pub category_name: String,
    #[serde(default)]
    pub attributes: Vec<PredictedAttribute>,
}

/// Attribute value inferred from the search text.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictedAttribute {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value_id: Option<String>,
    #[serde(default)]
    pub value_name: Option<String>,
}

/// `GET /categories/{id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path_from_root: Vec<CategoryRef>,
    #[serde(default)]
    pub children_categories: Vec<CategoryRef>,
    #[serde(default)]
    pub total_items_in_this_category: Option<u64>,
    #[serde(default)]
    pub settings: Option<CategorySettings>,
}

impl Category {
    /// Only leaf categories accept listings.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children_categories.is_empty()
    }

    /// Breadcrumb such as `Electrónica > Celulares`.
    #[must_use]
    pub fn breadcrumb(&self) -> String {
        self.path_from_root
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryRef {
    pub id: String,
    pub name: String,
}

/// Listing rules of a category. Subset of the upstream object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategorySettings {
    #[serde(default)]
    pub listing_allowed: Option<bool>,
    #[serde(default)]
    pub buying_modes: Vec<String>,
    #[serde(default)]
    pub item_conditions: Vec<String>,
    #[serde(default)]
    pub max_pictures_per_item: Option<u32>,
    #[serde(default)]
    pub max_title_length: Option<u32>,
}

/// One entry of `GET /categories/{id}/attributes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryAttribute {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value_type: Option<String>,
    /// Flags such as `required` or `catalog_required`.
    #[serde(default)]
    pub tags: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub values: Vec<AttributeValue>,
    #[serde(default)]
    pub allowed_units: Vec<AttributeValue>,
    #[serde(default)]
    pub value_max_length: Option<u32>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl CategoryAttribute {
    /// Whether a listing in this category must set the attribute.
    #[must_use]
    pub fn is_required(&self) -> bool {
        ["required", "catalog_required"]
            .iter()
            .any(|tag| self.tags.get(*tag).and_then(serde_json::Value::as_bool) == Some(true))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeValue {
    pub id: String,
    pub name: String,
}
