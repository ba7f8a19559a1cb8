use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "breakfast" => Some(MealType::Breakfast),
            "lunch" => Some(MealType::Lunch),
            "dinner" => Some(MealType::Dinner),
            "snack" => Some(MealType::Snack),
            _ => None,
        }
    }
}

impl std::fmt::Display for MealType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingUnit {
    Grams,
    Ounces,
    Count,
}

impl ServingUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingUnit::Grams => "grams",
            ServingUnit::Ounces => "ounces",
            ServingUnit::Count => "count",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grams" => Some(ServingUnit::Grams),
            "ounces" => Some(ServingUnit::Ounces),
            "count" => Some(ServingUnit::Count),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored image references. Older rows carry a bare string, newer ones an
/// ordered list; the untagged encoding lets readers accept both shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRefs {
    Single(String),
    Many(Vec<String>),
}

impl ImageRefs {
    /// Normalizes a key list: empty → `None`, one key → `Single`,
    /// more → `Many`.
    pub fn from_keys(mut keys: Vec<String>) -> Option<Self> {
        match keys.len() {
            0 => None,
            1 => Some(ImageRefs::Single(keys.remove(0))),
            _ => Some(ImageRefs::Many(keys)),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        match self {
            ImageRefs::Single(k) => Some(k.as_str()),
            ImageRefs::Many(ks) => ks.first().map(|k| k.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Meal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub meal_type: MealType,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    pub images: Option<ImageRefs>,
    pub calories: i32,
    pub fat_g: i32,
    pub carbs_g: i32,
    pub protein_g: i32,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
    pub user_provided_image: bool,
    pub analysis_pending: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub logged_at: OffsetDateTime,
    pub logged_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Row to insert for a freshly submitted meal. Nutrition starts at the
/// zero placeholder; flags are decided by the workflow.
#[derive(Debug, Clone)]
pub struct NewMeal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub meal_type: MealType,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    pub images: Option<ImageRefs>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
    pub user_provided_image: bool,
    pub analysis_pending: bool,
    pub logged_at: OffsetDateTime,
    pub logged_date: Date,
}

/// Partial update. `None` leaves the stored value untouched; for images
/// the outer level says "change it" and the inner value may clear them.
#[derive(Debug, Clone, Default)]
pub struct MealPatch {
    pub meal_type: Option<MealType>,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    pub images: Option<Option<ImageRefs>>,
    pub calories: Option<i32>,
    pub fat_g: Option<i32>,
    pub carbs_g: Option<i32>,
    pub protein_g: Option<i32>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
    pub user_provided_image: Option<bool>,
    pub analysis_pending: Option<bool>,
}

impl Meal {
    /// Applies a patch in place. Both store implementations go through
    /// this so the merge semantics cannot drift between them.
    pub fn apply_patch(&mut self, patch: &MealPatch) {
        if let Some(v) = patch.meal_type {
            self.meal_type = v;
        }
        if let Some(v) = &patch.food_name {
            self.food_name = Some(v.clone());
        }
        if let Some(v) = &patch.brand_name {
            self.brand_name = Some(v.clone());
        }
        if let Some(v) = &patch.description {
            self.description = Some(v.clone());
        }
        if let Some(v) = &patch.images {
            self.images = v.clone();
        }
        if let Some(v) = patch.calories {
            self.calories = v;
        }
        if let Some(v) = patch.fat_g {
            self.fat_g = v;
        }
        if let Some(v) = patch.carbs_g {
            self.carbs_g = v;
        }
        if let Some(v) = patch.protein_g {
            self.protein_g = v;
        }
        if let Some(v) = patch.serving_qty {
            self.serving_qty = Some(v);
        }
        if let Some(v) = patch.serving_unit {
            self.serving_unit = Some(v);
        }
        if let Some(v) = patch.user_provided_image {
            self.user_provided_image = v;
        }
        if let Some(v) = patch.analysis_pending {
            self.analysis_pending = v;
        }
    }
}

/// Local calendar day for a UTC instant, given the client's offset in
/// minutes behind UTC (the JS `getTimezoneOffset` convention: UTC-5
/// reports 300).
pub fn local_day(ts: OffsetDateTime, tz_offset_minutes: i32) -> Date {
    (ts - Duration::minutes(tz_offset_minutes as i64)).date()
}

/// Field-wise nutrition rollup over a set of meals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NutritionTotals {
    pub calories: i64,
    pub fat_g: i64,
    pub carbs_g: i64,
    pub protein_g: i64,
}

impl NutritionTotals {
    pub fn add(&mut self, meal: &Meal) {
        self.calories += meal.calories as i64;
        self.fat_g += meal.fat_g as i64;
        self.carbs_g += meal.carbs_g as i64;
        self.protein_g += meal.protein_g as i64;
    }

    pub fn of(meals: &[Meal]) -> Self {
        let mut totals = Self::default();
        for m in meals {
            totals.add(m);
        }
        totals
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_image_refs_both_shapes_decode() {
        let single: ImageRefs = serde_json::from_str(r#""meals/a/b.jpg""#).unwrap();
        assert_eq!(single, ImageRefs::Single("meals/a/b.jpg".into()));

        let many: ImageRefs = serde_json::from_str(r#"["a.jpg","b.jpg"]"#).unwrap();
        assert_eq!(many, ImageRefs::Many(vec!["a.jpg".into(), "b.jpg".into()]));

        assert_eq!(single.primary(), Some("meals/a/b.jpg"));
        assert_eq!(many.primary(), Some("a.jpg"));
    }

    #[test]
    fn test_image_refs_normalization() {
        assert_eq!(ImageRefs::from_keys(vec![]), None);
        assert_eq!(
            ImageRefs::from_keys(vec!["x".into()]),
            Some(ImageRefs::Single("x".into()))
        );
        assert_eq!(
            ImageRefs::from_keys(vec!["x".into(), "y".into()]),
            Some(ImageRefs::Many(vec!["x".into(), "y".into()]))
        );
    }

    #[test]
    fn test_image_refs_roundtrip_shapes() {
        let one = ImageRefs::Single("k".into());
        assert_eq!(serde_json::to_string(&one).unwrap(), r#""k""#);
        let two = ImageRefs::Many(vec!["k".into(), "l".into()]);
        assert_eq!(serde_json::to_string(&two).unwrap(), r#"["k","l"]"#);
    }

    #[test]
    fn test_local_day_uses_client_offset() {
        // 23:50 local in UTC-5 is 04:50 next day in UTC; the meal must
        // bucket into the local date.
        let utc = datetime!(2024-03-08 04:50 UTC);
        assert_eq!(local_day(utc, 300), datetime!(2024-03-07 0:00 UTC).date());
        // Same instant seen from UTC buckets into the UTC date.
        assert_eq!(local_day(utc, 0), datetime!(2024-03-08 0:00 UTC).date());
        // East of UTC the offset is negative.
        let late = datetime!(2024-03-07 23:30 UTC);
        assert_eq!(local_day(late, -120), datetime!(2024-03-08 0:00 UTC).date());
    }

    #[test]
    fn test_meal_type_parse() {
        assert_eq!(MealType::parse("lunch"), Some(MealType::Lunch));
        assert_eq!(MealType::parse("brunch"), None);
        assert_eq!(MealType::Snack.as_str(), "snack");
    }

    #[test]
    fn test_serving_unit_parse() {
        assert_eq!(ServingUnit::parse("grams"), Some(ServingUnit::Grams));
        assert_eq!(ServingUnit::parse("kg"), None);
    }
}
