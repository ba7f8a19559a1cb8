use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::model::{Meal, MealPatch, NewMeal};
use super::store::{FinalizeOutcome, MealStore};

/// In-memory `MealStore`. Backs `AppState::fake()` and the workflow
/// tests; clones share the same map so a test can keep a handle while
/// the state owns the trait object.
#[derive(Clone, Default)]
pub struct MemoryMealStore {
    meals: Arc<RwLock<HashMap<Uuid, Meal>>>,
}

impl MemoryMealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.meals.read().await.len()
    }
}

/// `updated_at` doubles as the optimistic stamp, so consecutive writes
/// must never reuse a value even on a coarse clock.
fn next_stamp(prev: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    match prev {
        Some(prev) if now <= prev => prev + Duration::nanoseconds(1),
        _ => now,
    }
}

#[async_trait]
impl MealStore for MemoryMealStore {
    async fn insert(&self, meal: NewMeal) -> anyhow::Result<Meal> {
        let now = next_stamp(None);
        let meal = Meal {
            id: meal.id,
            user_id: meal.user_id,
            meal_type: meal.meal_type,
            food_name: meal.food_name,
            brand_name: meal.brand_name,
            description: meal.description,
            images: meal.images,
            calories: 0,
            fat_g: 0,
            carbs_g: 0,
            protein_g: 0,
            serving_qty: meal.serving_qty,
            serving_unit: meal.serving_unit,
            user_provided_image: meal.user_provided_image,
            analysis_pending: meal.analysis_pending,
            logged_at: meal.logged_at,
            logged_date: meal.logged_date,
            created_at: now,
            updated_at: now,
        };
        self.meals.write().await.insert(meal.id, meal.clone());
        Ok(meal)
    }

    async fn get(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<Option<Meal>> {
        Ok(self
            .meals
            .read()
            .await
            .get(&id)
            .filter(|m| m.user_id == user_id)
            .cloned())
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: MealPatch,
    ) -> anyhow::Result<Option<Meal>> {
        let mut meals = self.meals.write().await;
        let Some(meal) = meals.get_mut(&id).filter(|m| m.user_id == user_id) else {
            return Ok(None);
        };
        meal.apply_patch(&patch);
        meal.updated_at = next_stamp(Some(meal.updated_at));
        Ok(Some(meal.clone()))
    }

    async fn finalize(
        &self,
        user_id: Uuid,
        id: Uuid,
        expected_updated_at: OffsetDateTime,
        patch: MealPatch,
    ) -> anyhow::Result<FinalizeOutcome> {
        let mut meals = self.meals.write().await;
        let Some(meal) = meals.get_mut(&id).filter(|m| m.user_id == user_id) else {
            return Ok(FinalizeOutcome::Missing);
        };
        if meal.updated_at != expected_updated_at {
            return Ok(FinalizeOutcome::Stale);
        }
        meal.apply_patch(&patch);
        meal.updated_at = next_stamp(Some(meal.updated_at));
        Ok(FinalizeOutcome::Applied(meal.clone()))
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<bool> {
        let mut meals = self.meals.write().await;
        match meals.get(&id) {
            Some(m) if m.user_id == user_id => {
                meals.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_day(&self, user_id: Uuid, day: Date) -> anyhow::Result<Vec<Meal>> {
        self.list_range(user_id, day, day).await
    }

    async fn list_range(&self, user_id: Uuid, from: Date, to: Date) -> anyhow::Result<Vec<Meal>> {
        let mut out: Vec<Meal> = self
            .meals
            .read()
            .await
            .values()
            .filter(|m| m.user_id == user_id && m.logged_date >= from && m.logged_date <= to)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.logged_at);
        Ok(out)
    }
}

#[cfg(test)]
mod memory_store_tests {
    use super::*;
    use crate::meals::model::{local_day, MealType};

    fn new_meal(user_id: Uuid, logged_at: OffsetDateTime, tz_offset: i32) -> NewMeal {
        NewMeal {
            id: Uuid::new_v4(),
            user_id,
            meal_type: MealType::Lunch,
            food_name: None,
            brand_name: None,
            description: Some("soup".into()),
            images: None,
            serving_qty: None,
            serving_unit: None,
            user_provided_image: false,
            analysis_pending: true,
            logged_at,
            logged_date: local_day(logged_at, tz_offset),
        }
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let store = MemoryMealStore::new();
        let owner = Uuid::new_v4();
        let meal = store
            .insert(new_meal(owner, OffsetDateTime::now_utc(), 0))
            .await
            .unwrap();

        assert!(store.get(owner, meal.id).await.unwrap().is_some());
        assert!(store.get(Uuid::new_v4(), meal.id).await.unwrap().is_none());
        assert!(!store.delete(Uuid::new_v4(), meal.id).await.unwrap());
        assert!(store.delete(owner, meal.id).await.unwrap());
        assert!(!store.delete(owner, meal.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_stale_and_missing() {
        let store = MemoryMealStore::new();
        let owner = Uuid::new_v4();
        let meal = store
            .insert(new_meal(owner, OffsetDateTime::now_utc(), 0))
            .await
            .unwrap();

        // An intervening edit bumps the stamp; the old snapshot is stale.
        let edited = store
            .update(
                owner,
                meal.id,
                MealPatch {
                    meal_type: Some(MealType::Dinner),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(edited.updated_at > meal.updated_at);

        let outcome = store
            .finalize(
                owner,
                meal.id,
                meal.updated_at,
                MealPatch {
                    calories: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Stale));
        assert_eq!(store.get(owner, meal.id).await.unwrap().unwrap().calories, 0);

        // A fresh snapshot applies.
        let outcome = store
            .finalize(
                owner,
                meal.id,
                edited.updated_at,
                MealPatch {
                    calories: Some(500),
                    analysis_pending: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Applied(_)));

        store.delete(owner, meal.id).await.unwrap();
        let outcome = store
            .finalize(owner, meal.id, edited.updated_at, MealPatch::default())
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Missing));
    }

    #[tokio::test]
    async fn test_range_queries_use_logged_date() {
        let store = MemoryMealStore::new();
        let owner = Uuid::new_v4();
        let base = time::macros::datetime!(2024-03-08 04:50 UTC);

        // 23:50 local in UTC-5: buckets on 2024-03-07.
        let west = store.insert(new_meal(owner, base, 300)).await.unwrap();
        // Same instant, UTC client: buckets on 2024-03-08.
        let utc = store.insert(new_meal(owner, base, 0)).await.unwrap();

        let day = store
            .list_day(owner, time::macros::date!(2024 - 03 - 07))
            .await
            .unwrap();
        assert_eq!(day.iter().map(|m| m.id).collect::<Vec<_>>(), vec![west.id]);

        let month = store
            .list_range(
                owner,
                time::macros::date!(2024 - 03 - 01),
                time::macros::date!(2024 - 03 - 31),
            )
            .await
            .unwrap();
        assert_eq!(month.len(), 2);
        assert!(month.iter().any(|m| m.id == utc.id));
    }
}
