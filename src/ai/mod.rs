pub mod analyzer;
pub mod synthesizer;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::meals::model::ServingUnit;

/// Structured nutrition facts for a single meal, already coerced to
/// clean non-negative integers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NutritionEstimate {
    pub calories: i32,
    pub fat_g: i32,
    pub carbs_g: i32,
    pub protein_g: i32,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<ServingUnit>,
}

/// Estimates nutrition facts from a meal photo and/or a text
/// description. At least one of the two must be present; validation
/// happens upstream, before the adapter is ever called.
#[async_trait]
pub trait NutritionAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        image: Option<Bytes>,
        description: Option<&str>,
    ) -> anyhow::Result<NutritionEstimate>;
}

/// Synthesizes a photorealistic meal image from a text description.
#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        description: &str,
        food_name_hint: Option<&str>,
    ) -> anyhow::Result<Bytes>;
}

/// Wire shape of the model's JSON reply. The upstream service does not
/// guarantee clean numbers, so everything arrives as optional floats.
#[derive(Debug, Deserialize)]
pub(crate) struct RawEstimate {
    pub calories: Option<f64>,
    pub fat_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub protein_g: Option<f64>,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
}

/// Rounds to the nearest integer; NaN, infinities and negatives floor
/// to zero.
pub(crate) fn coerce_grams(v: Option<f64>) -> i32 {
    match v {
        Some(v) if v.is_finite() && v > 0.0 => v.round() as i32,
        _ => 0,
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_unit(v: Option<String>) -> Option<ServingUnit> {
    match v.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        Some(u) => match u.as_str() {
            "g" | "gram" | "grams" => Some(ServingUnit::Grams),
            "oz" | "ounce" | "ounces" => Some(ServingUnit::Ounces),
            "count" | "piece" | "pieces" | "item" | "items" | "serving" | "servings" => {
                Some(ServingUnit::Count)
            }
            _ => None,
        },
        None => None,
    }
}

impl NutritionEstimate {
    pub(crate) fn from_raw(raw: RawEstimate) -> Self {
        Self {
            calories: coerce_grams(raw.calories),
            fat_g: coerce_grams(raw.fat_g),
            carbs_g: coerce_grams(raw.carbs_g),
            protein_g: coerce_grams(raw.protein_g),
            food_name: non_blank(raw.food_name),
            brand_name: non_blank(raw.brand_name),
            quantity: raw.quantity.filter(|q| q.is_finite() && *q > 0.0),
            unit: parse_unit(raw.unit),
        }
    }
}
