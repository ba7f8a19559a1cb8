use anyhow::Context;
use async_trait::async_trait;
use sqlx::{types::Json, FromRow, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::model::{ImageRefs, Meal, MealPatch, MealType, NewMeal, ServingUnit};

/// Result of the reconciliation's optimistic final write.
#[derive(Debug)]
pub enum FinalizeOutcome {
    Applied(Meal),
    /// The record changed since the snapshot was taken; nothing written.
    Stale,
    /// The record is gone; nothing written (a deleted meal must not be
    /// resurrected by an in-flight analysis).
    Missing,
}

/// Durable persistence for meal records. Point lookups, the precomputed
/// local-date range queries, read-modify-write partial updates, and the
/// optimistic finalize used by the async reconciliation.
#[async_trait]
pub trait MealStore: Send + Sync {
    async fn insert(&self, meal: NewMeal) -> anyhow::Result<Meal>;
    async fn get(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<Option<Meal>>;
    /// Applies a partial update; returns the updated record, or `None`
    /// if it does not exist. Last writer wins.
    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: MealPatch,
    ) -> anyhow::Result<Option<Meal>>;
    /// Applies a patch only if `updated_at` still matches the caller's
    /// snapshot.
    async fn finalize(
        &self,
        user_id: Uuid,
        id: Uuid,
        expected_updated_at: OffsetDateTime,
        patch: MealPatch,
    ) -> anyhow::Result<FinalizeOutcome>;
    async fn delete(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<bool>;
    async fn list_day(&self, user_id: Uuid, day: Date) -> anyhow::Result<Vec<Meal>>;
    async fn list_range(&self, user_id: Uuid, from: Date, to: Date) -> anyhow::Result<Vec<Meal>>;
}

#[derive(Debug, FromRow)]
struct MealRow {
    id: Uuid,
    user_id: Uuid,
    meal_type: String,
    food_name: Option<String>,
    brand_name: Option<String>,
    description: Option<String>,
    images: Option<Json<ImageRefs>>,
    calories: i32,
    fat_g: i32,
    carbs_g: i32,
    protein_g: i32,
    serving_qty: Option<f64>,
    serving_unit: Option<String>,
    user_provided_image: bool,
    analysis_pending: bool,
    logged_at: OffsetDateTime,
    logged_date: Date,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<MealRow> for Meal {
    type Error = anyhow::Error;

    fn try_from(r: MealRow) -> anyhow::Result<Meal> {
        let meal_type = MealType::parse(&r.meal_type)
            .with_context(|| format!("unknown meal_type in row: {}", r.meal_type))?;
        let serving_unit = match r.serving_unit.as_deref() {
            Some(u) => Some(
                ServingUnit::parse(u)
                    .with_context(|| format!("unknown serving_unit in row: {u}"))?,
            ),
            None => None,
        };
        Ok(Meal {
            id: r.id,
            user_id: r.user_id,
            meal_type,
            food_name: r.food_name,
            brand_name: r.brand_name,
            description: r.description,
            images: r.images.map(|Json(v)| v),
            calories: r.calories,
            fat_g: r.fat_g,
            carbs_g: r.carbs_g,
            protein_g: r.protein_g,
            serving_qty: r.serving_qty,
            serving_unit,
            user_provided_image: r.user_provided_image,
            analysis_pending: r.analysis_pending,
            logged_at: r.logged_at,
            logged_date: r.logged_date,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

const MEAL_COLUMNS: &str = r#"id, user_id, meal_type, food_name, brand_name, description, images,
       calories, fat_g, carbs_g, protein_g, serving_qty, serving_unit,
       user_provided_image, analysis_pending, logged_at, logged_date,
       created_at, updated_at"#;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgMealStore {
    db: PgPool,
}

impl PgMealStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn fetch(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<Option<MealRow>> {
        let row = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            SELECT {MEAL_COLUMNS}
            FROM meals
            WHERE id = $1 AND user_id = $2
            "#
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await
        .context("fetch meal")?;
        Ok(row)
    }

    /// Writes every mutable column of an already-patched record. The
    /// optional `expected_updated_at` turns it into a conditional write.
    async fn write_back(
        &self,
        meal: &Meal,
        expected_updated_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<Option<Meal>> {
        let sql = format!(
            r#"
            UPDATE meals
            SET meal_type = $3, food_name = $4, brand_name = $5, description = $6,
                images = $7, calories = $8, fat_g = $9, carbs_g = $10, protein_g = $11,
                serving_qty = $12, serving_unit = $13, user_provided_image = $14,
                analysis_pending = $15, updated_at = now()
            WHERE id = $1 AND user_id = $2 {}
            RETURNING {MEAL_COLUMNS}
            "#,
            if expected_updated_at.is_some() {
                "AND updated_at = $16"
            } else {
                ""
            }
        );

        let mut query = sqlx::query_as::<_, MealRow>(&sql)
            .bind(meal.id)
            .bind(meal.user_id)
            .bind(meal.meal_type.as_str())
            .bind(&meal.food_name)
            .bind(&meal.brand_name)
            .bind(&meal.description)
            .bind(meal.images.clone().map(Json))
            .bind(meal.calories)
            .bind(meal.fat_g)
            .bind(meal.carbs_g)
            .bind(meal.protein_g)
            .bind(meal.serving_qty)
            .bind(meal.serving_unit.map(|u| u.as_str()))
            .bind(meal.user_provided_image)
            .bind(meal.analysis_pending);
        if let Some(stamp) = expected_updated_at {
            query = query.bind(stamp);
        }

        let row = query
            .fetch_optional(&self.db)
            .await
            .context("update meal")?;
        row.map(Meal::try_from).transpose()
    }
}

#[async_trait]
impl MealStore for PgMealStore {
    async fn insert(&self, meal: NewMeal) -> anyhow::Result<Meal> {
        let row = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            INSERT INTO meals (id, user_id, meal_type, food_name, brand_name, description,
                               images, serving_qty, serving_unit, user_provided_image,
                               analysis_pending, logged_at, logged_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {MEAL_COLUMNS}
            "#
        ))
        .bind(meal.id)
        .bind(meal.user_id)
        .bind(meal.meal_type.as_str())
        .bind(&meal.food_name)
        .bind(&meal.brand_name)
        .bind(&meal.description)
        .bind(meal.images.clone().map(Json))
        .bind(meal.serving_qty)
        .bind(meal.serving_unit.map(|u| u.as_str()))
        .bind(meal.user_provided_image)
        .bind(meal.analysis_pending)
        .bind(meal.logged_at)
        .bind(meal.logged_date)
        .fetch_one(&self.db)
        .await
        .context("insert meal")?;
        row.try_into()
    }

    async fn get(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<Option<Meal>> {
        self.fetch(user_id, id)
            .await?
            .map(Meal::try_from)
            .transpose()
    }

    async fn update(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: MealPatch,
    ) -> anyhow::Result<Option<Meal>> {
        let Some(row) = self.fetch(user_id, id).await? else {
            return Ok(None);
        };
        let mut meal: Meal = row.try_into()?;
        meal.apply_patch(&patch);
        self.write_back(&meal, None).await
    }

    async fn finalize(
        &self,
        user_id: Uuid,
        id: Uuid,
        expected_updated_at: OffsetDateTime,
        patch: MealPatch,
    ) -> anyhow::Result<FinalizeOutcome> {
        let Some(row) = self.fetch(user_id, id).await? else {
            return Ok(FinalizeOutcome::Missing);
        };
        let mut meal: Meal = row.try_into()?;
        if meal.updated_at != expected_updated_at {
            return Ok(FinalizeOutcome::Stale);
        }
        meal.apply_patch(&patch);
        match self.write_back(&meal, Some(expected_updated_at)).await? {
            Some(updated) => Ok(FinalizeOutcome::Applied(updated)),
            // Lost the race between our read and the conditional write.
            None => match self.fetch(user_id, id).await? {
                Some(_) => Ok(FinalizeOutcome::Stale),
                None => Ok(FinalizeOutcome::Missing),
            },
        }
    }

    async fn delete(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM meals
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.db)
        .await
        .context("delete meal")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_day(&self, user_id: Uuid, day: Date) -> anyhow::Result<Vec<Meal>> {
        let rows = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            SELECT {MEAL_COLUMNS}
            FROM meals
            WHERE user_id = $1 AND logged_date = $2
            ORDER BY logged_at ASC
            "#
        ))
        .bind(user_id)
        .bind(day)
        .fetch_all(&self.db)
        .await
        .context("list meals by day")?;
        rows.into_iter().map(Meal::try_from).collect()
    }

    async fn list_range(&self, user_id: Uuid, from: Date, to: Date) -> anyhow::Result<Vec<Meal>> {
        let rows = sqlx::query_as::<_, MealRow>(&format!(
            r#"
            SELECT {MEAL_COLUMNS}
            FROM meals
            WHERE user_id = $1 AND logged_date >= $2 AND logged_date <= $3
            ORDER BY logged_at ASC
            "#
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.db)
        .await
        .context("list meals by range")?;
        rows.into_iter().map(Meal::try_from).collect()
    }
}
