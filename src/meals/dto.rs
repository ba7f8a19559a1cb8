use serde::Deserialize;
use time::{Date, OffsetDateTime};

use super::model::{MealType, ServingUnit};

/// Create body. Image payloads travel base64-encoded; `content_type`
/// applies to all of them and defaults to JPEG. `tz_offset_minutes` is
/// the client's offset in minutes behind UTC (JS `getTimezoneOffset`)
/// and fixes the meal's local calendar day at write time.
#[derive(Debug, Deserialize)]
pub struct CreateMealRequest {
    pub meal_type: MealType,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub images_b64: Vec<String>,
    pub content_type: Option<String>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
    #[serde(default)]
    pub tz_offset_minutes: i32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub logged_at: Option<OffsetDateTime>,
}

/// Patch body. Absent fields are left untouched; an explicit empty
/// `images_b64` removes all images.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateMealRequest {
    pub meal_type: Option<MealType>,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    pub images_b64: Option<Vec<String>>,
    pub content_type: Option<String>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
}

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub date: Date,
    #[serde(default)]
    pub tz_offset_minutes: i32,
}

#[derive(Debug, Deserialize)]
pub struct MonthQuery {
    pub year: i32,
    pub month: u8,
    #[serde(default)]
    pub tz_offset_minutes: i32,
}
