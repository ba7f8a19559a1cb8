use std::collections::BTreeMap;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Redirect,
    routing::{get, patch, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::auth::jwt::AuthUser;
use crate::state::AppState;

use super::dto::{CreateMealRequest, DayQuery, MonthQuery, UpdateMealRequest};
use super::model::{Meal, NutritionTotals};
use super::service::{self, CreateMeal, ImageUpload, UpdateMeal, WorkflowError};
use super::store::MealStore;
use crate::storage::ObjectStorage;

// --- public routers ---

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route("/meals", get(list_meals))
        .route("/meals/:id", get(get_meal))
        .route("/meals/:id/image", get(get_presigned_image))
        .route("/summary", get(get_day_summary))
        .route("/summary/month", get(get_month_summary))
}

pub fn write_router() -> Router<AppState> {
    Router::new()
        .route("/meals", post(create_meal))
        .route("/meals/:id", patch(update_meal).delete(delete_meal))
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 20MB
}

// --- handlers ---

/// POST /meals: persists a placeholder and returns it immediately; the
/// AI reconciliation runs detached.
#[instrument(skip(state, body))]
pub async fn create_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CreateMealRequest>,
) -> Result<(StatusCode, HeaderMap, Json<Meal>), (StatusCode, String)> {
    let images = decode_images(&body.images_b64, body.content_type.as_deref())?;

    let (meal, job) = service::create_meal(
        &state,
        user_id,
        CreateMeal {
            meal_type: body.meal_type,
            food_name: body.food_name,
            brand_name: body.brand_name,
            description: body.description,
            images,
            serving_qty: body.serving_qty,
            serving_unit: body.serving_unit,
            tz_offset_minutes: body.tz_offset_minutes,
            logged_at: body.logged_at,
        },
    )
    .await
    .map_err(error_response)?;

    if let Some(job) = job {
        tokio::spawn(job.run(state.clone()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::LOCATION,
        format!("/api/v1/meals/{}", meal.id).parse().unwrap(),
    );
    Ok((StatusCode::CREATED, headers, Json(meal)))
}

/// PATCH /meals/:id: synchronous merge; regeneration/re-analysis, if
/// the edit triggers any, runs detached.
#[instrument(skip(state, body))]
pub async fn update_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateMealRequest>,
) -> Result<Json<Meal>, (StatusCode, String)> {
    let images = match &body.images_b64 {
        Some(b64s) => Some(decode_images(b64s, body.content_type.as_deref())?),
        None => None,
    };

    let (meal, job) = service::update_meal(
        &state,
        user_id,
        id,
        UpdateMeal {
            meal_type: body.meal_type,
            food_name: body.food_name,
            brand_name: body.brand_name,
            description: body.description,
            images,
            serving_qty: body.serving_qty,
            serving_unit: body.serving_unit,
        },
    )
    .await
    .map_err(error_response)?;

    if let Some(job) = job {
        tokio::spawn(job.run(state.clone()));
    }
    Ok(Json(meal))
}

#[instrument(skip(state))]
pub async fn get_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Meal>, (StatusCode, String)> {
    let meal = state
        .store
        .get(user_id, id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "Meal not found".into()))?;
    Ok(Json(meal))
}

/// GET /meals?date=2024-03-07&tz_offset_minutes=300
#[instrument(skip(state))]
pub async fn list_meals(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<DayQuery>,
) -> Result<Json<Vec<Meal>>, (StatusCode, String)> {
    // Rows bucket by the local date precomputed at write time; the
    // offset is logged for diagnosing clients whose offset changed
    // between logging and querying.
    debug!(tz_offset_minutes = q.tz_offset_minutes, "day query");
    let meals = service::meals_for_day(&state, user_id, q.date)
        .await
        .map_err(error_response)?;
    Ok(Json(meals))
}

#[instrument(skip(state))]
pub async fn get_day_summary(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<DayQuery>,
) -> Result<Json<NutritionTotals>, (StatusCode, String)> {
    let totals = service::day_summary(&state, user_id, q.date)
        .await
        .map_err(error_response)?;
    Ok(Json(totals))
}

#[instrument(skip(state))]
pub async fn get_month_summary(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(q): Query<MonthQuery>,
) -> Result<Json<BTreeMap<String, NutritionTotals>>, (StatusCode, String)> {
    debug!(tz_offset_minutes = q.tz_offset_minutes, "month query");
    let rollup = service::month_summary(&state, user_id, q.year, q.month)
        .await
        .map_err(error_response)?;
    Ok(Json(rollup))
}

#[instrument(skip(state))]
pub async fn delete_meal(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    service::delete_meal(&state, user_id, id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// 302 → presigned url of the primary photo.
#[instrument(skip(state))]
pub async fn get_presigned_image(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Redirect, (StatusCode, String)> {
    let meal = state
        .store
        .get(user_id, id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "Meal not found".into()))?;
    let key = meal
        .images
        .as_ref()
        .and_then(|imgs| imgs.primary())
        .ok_or((StatusCode::NOT_FOUND, "Meal has no image".into()))?;
    let url = state
        .storage
        .presign_get(key, 600)
        .await
        .map_err(internal)?;
    Ok(Redirect::temporary(&url))
}

// --- error mapping ---

fn error_response(e: WorkflowError) -> (StatusCode, String) {
    match e {
        WorkflowError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        WorkflowError::NotFound => (StatusCode::NOT_FOUND, "Meal not found".into()),
        WorkflowError::Internal(e) => {
            error!(error = %e, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn decode_images(
    images_b64: &[String],
    content_type: Option<&str>,
) -> Result<Vec<ImageUpload>, (StatusCode, String)> {
    let ct = content_type.unwrap_or("image/jpeg");
    images_b64
        .iter()
        .map(|b64| {
            BASE64
                .decode(b64.as_bytes())
                .map(|bytes| ImageUpload {
                    bytes: Bytes::from(bytes),
                    content_type: ct.to_string(),
                })
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid base64 image".into()))
        })
        .collect()
}
