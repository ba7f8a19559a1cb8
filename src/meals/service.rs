use bytes::Bytes;
use time::{Date, Month, OffsetDateTime};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ai::{ImageSynthesizer, NutritionAnalyzer, NutritionEstimate};
use crate::state::AppState;
use crate::storage::{photo_key, ObjectStorage};

use super::model::{
    local_day, ImageRefs, Meal, MealPatch, MealType, NewMeal, NutritionTotals, ServingUnit,
};
use super::store::{FinalizeOutcome, MealStore};

/// One decoded image payload from a create/update request.
pub struct ImageUpload {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),
    #[error("meal not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct CreateMeal {
    pub meal_type: MealType,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    pub images: Vec<ImageUpload>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
    pub tz_offset_minutes: i32,
    pub logged_at: Option<OffsetDateTime>,
}

#[derive(Default)]
pub struct UpdateMeal {
    pub meal_type: Option<MealType>,
    pub food_name: Option<String>,
    pub brand_name: Option<String>,
    pub description: Option<String>,
    /// `Some(vec![])` removes all images.
    pub images: Option<Vec<ImageUpload>>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<ServingUnit>,
}

fn normalize(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn is_blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).unwrap_or("").is_empty()
}

/// The asynchronous half of a create/update. Built by the workflow,
/// spawned by the handler, and awaited directly in tests so the
/// reconciliation stays deterministic there.
#[derive(Debug)]
pub struct ReconcileJob {
    meal_id: Uuid,
    user_id: Uuid,
    description: Option<String>,
    food_name_hint: Option<String>,
    analyze_image: Option<Bytes>,
    run_analysis: bool,
    run_synthesis: bool,
    /// Update path only: the regenerated image is what gets analyzed,
    /// so synthesis must complete first. On the create path the two
    /// calls are independent and run concurrently.
    analyze_synthesized: bool,
}

/// Create path: validate, persist the placeholder synchronously, hand
/// back the record plus the reconciliation job. The caller never waits
/// on AI latency.
pub async fn create_meal(
    state: &AppState,
    user_id: Uuid,
    req: CreateMeal,
) -> Result<(Meal, Option<ReconcileJob>), WorkflowError> {
    let description = normalize(req.description);
    let food_name = normalize(req.food_name);
    let brand_name = normalize(req.brand_name);

    if req.images.is_empty() && description.is_none() {
        return Err(WorkflowError::Validation(
            "at least one image or a non-empty description is required".into(),
        ));
    }

    let meal_id = Uuid::new_v4();
    let mut keys = Vec::with_capacity(req.images.len());
    for img in &req.images {
        let key = photo_key(user_id, meal_id, &img.content_type);
        state
            .storage
            .put_object(&key, img.bytes.clone(), &img.content_type)
            .await?;
        keys.push(key);
    }
    let user_provided_image = !keys.is_empty();

    let logged_at = req.logged_at.unwrap_or_else(OffsetDateTime::now_utc);
    let meal = state
        .store
        .insert(NewMeal {
            id: meal_id,
            user_id,
            meal_type: req.meal_type,
            food_name: food_name.clone(),
            brand_name,
            description: description.clone(),
            images: ImageRefs::from_keys(keys),
            serving_qty: req.serving_qty,
            serving_unit: req.serving_unit,
            user_provided_image,
            // Nutrition is never user-supplied at creation, so analysis
            // is always outstanding on the placeholder.
            analysis_pending: true,
            logged_at,
            logged_date: local_day(logged_at, req.tz_offset_minutes),
        })
        .await?;

    info!(%meal_id, %user_id, user_provided_image, "meal placeholder created");

    let job = ReconcileJob {
        meal_id,
        user_id,
        description,
        food_name_hint: food_name,
        analyze_image: req.images.first().map(|i| i.bytes.clone()),
        run_analysis: true,
        run_synthesis: !user_provided_image,
        analyze_synthesized: false,
    };
    Ok((meal, Some(job)))
}

/// Update path: merge the partial edit synchronously and decide, from
/// provenance, whether the edit re-triggers analysis, regeneration,
/// both, or neither.
pub async fn update_meal(
    state: &AppState,
    user_id: Uuid,
    meal_id: Uuid,
    req: UpdateMeal,
) -> Result<(Meal, Option<ReconcileJob>), WorkflowError> {
    let existing = state
        .store
        .get(user_id, meal_id)
        .await?
        .ok_or(WorkflowError::NotFound)?;

    let description = match req.description {
        Some(d) => {
            let d = normalize(Some(d)).ok_or_else(|| {
                WorkflowError::Validation("description must not be blank".into())
            })?;
            Some(d)
        }
        None => None,
    };

    let description_changed = matches!(
        &description,
        Some(d) if existing.description.as_deref() != Some(d.as_str())
    );
    let images_supplied = matches!(&req.images, Some(v) if !v.is_empty());
    let images_cleared = matches!(&req.images, Some(v) if v.is_empty());

    // Provenance is re-evaluated from the incoming image set, not from
    // history.
    let candidate_provenance = if images_supplied {
        true
    } else if images_cleared {
        false
    } else {
        existing.user_provided_image
    };

    // A changed description regenerates an AI-sourced image, but a
    // newly supplied user image moots that and forces re-analysis
    // instead.
    let regenerate = description_changed && !candidate_provenance;
    let reanalyze = images_supplied || regenerate;

    let mut patch = MealPatch {
        meal_type: req.meal_type,
        food_name: normalize(req.food_name),
        brand_name: normalize(req.brand_name),
        description: description.clone(),
        serving_qty: req.serving_qty,
        serving_unit: req.serving_unit,
        ..Default::default()
    };

    let mut analyze_image = None;
    if images_supplied {
        let uploads = req.images.as_deref().unwrap_or_default();
        let mut keys = Vec::with_capacity(uploads.len());
        for img in uploads {
            let key = photo_key(user_id, meal_id, &img.content_type);
            state
                .storage
                .put_object(&key, img.bytes.clone(), &img.content_type)
                .await?;
            keys.push(key);
        }
        patch.images = Some(ImageRefs::from_keys(keys));
        patch.user_provided_image = Some(true);
        analyze_image = uploads.first().map(|i| i.bytes.clone());
    } else if images_cleared {
        patch.images = Some(None);
        patch.user_provided_image = Some(false);
    }

    if regenerate || reanalyze {
        patch.analysis_pending = Some(true);
    }

    let updated = state
        .store
        .update(user_id, meal_id, patch)
        .await?
        .ok_or(WorkflowError::NotFound)?;

    let job = (regenerate || reanalyze).then(|| ReconcileJob {
        meal_id,
        user_id,
        description: updated.description.clone(),
        food_name_hint: updated.food_name.clone(),
        analyze_image,
        run_analysis: reanalyze,
        run_synthesis: regenerate,
        analyze_synthesized: regenerate,
    });

    if job.is_some() {
        info!(%meal_id, regenerate, reanalyze, "edit re-triggered analysis");
    }
    Ok((updated, job))
}

pub async fn delete_meal(
    state: &AppState,
    user_id: Uuid,
    meal_id: Uuid,
) -> Result<(), WorkflowError> {
    if state.store.delete(user_id, meal_id).await? {
        Ok(())
    } else {
        Err(WorkflowError::NotFound)
    }
}

pub async fn meals_for_day(
    state: &AppState,
    user_id: Uuid,
    day: Date,
) -> Result<Vec<Meal>, WorkflowError> {
    Ok(state.store.list_day(user_id, day).await?)
}

/// The rollup is computed over exactly the set the day query returns,
/// so the two views can never disagree.
pub async fn day_summary(
    state: &AppState,
    user_id: Uuid,
    day: Date,
) -> Result<NutritionTotals, WorkflowError> {
    let meals = state.store.list_day(user_id, day).await?;
    Ok(NutritionTotals::of(&meals))
}

pub async fn month_summary(
    state: &AppState,
    user_id: Uuid,
    year: i32,
    month: u8,
) -> Result<std::collections::BTreeMap<String, NutritionTotals>, WorkflowError> {
    let month = Month::try_from(month)
        .map_err(|_| WorkflowError::Validation("month must be between 1 and 12".into()))?;
    let first = Date::from_calendar_date(year, month, 1)
        .map_err(|_| WorkflowError::Validation("invalid year".into()))?;
    let last = first
        .replace_day(time::util::days_in_year_month(year, month))
        .map_err(anyhow::Error::from)?;

    let meals = state.store.list_range(user_id, first, last).await?;
    let mut rollup = std::collections::BTreeMap::<String, NutritionTotals>::new();
    for meal in &meals {
        rollup
            .entry(meal.logged_date.to_string())
            .or_default()
            .add(meal);
    }
    Ok(rollup)
}

impl ReconcileJob {
    /// Runs the detached reconciliation. All failures end here: AI
    /// errors degrade to whatever partial results exist, and the record
    /// is finalized un-pending either way. Nothing propagates to the
    /// client, nothing is retried.
    pub async fn run(self, state: AppState) {
        let meal_id = self.meal_id;
        let description = self.description.as_deref();

        let mut synthesized: Option<Bytes> = None;
        let mut estimate: Option<NutritionEstimate> = None;

        if self.analyze_synthesized {
            if self.run_synthesis {
                match state
                    .synthesizer
                    .synthesize(
                        description.unwrap_or_default(),
                        self.food_name_hint.as_deref(),
                    )
                    .await
                {
                    Ok(bytes) => synthesized = Some(bytes),
                    Err(e) => error!(%meal_id, error = %e, "image synthesis failed"),
                }
            }
            if self.run_analysis {
                let image = synthesized.clone().or_else(|| self.analyze_image.clone());
                match state.analyzer.analyze(image, description).await {
                    Ok(est) => estimate = Some(est),
                    Err(e) => error!(%meal_id, error = %e, "nutrition analysis failed"),
                }
            }
        } else {
            // Independent calls; either may fail without cancelling the
            // other.
            let synth_fut = async {
                if self.run_synthesis {
                    Some(
                        state
                            .synthesizer
                            .synthesize(
                                description.unwrap_or_default(),
                                self.food_name_hint.as_deref(),
                            )
                            .await,
                    )
                } else {
                    None
                }
            };
            let analyze_fut = async {
                if self.run_analysis {
                    Some(
                        state
                            .analyzer
                            .analyze(self.analyze_image.clone(), description)
                            .await,
                    )
                } else {
                    None
                }
            };
            let (synth_res, analyze_res) = tokio::join!(synth_fut, analyze_fut);
            match synth_res {
                Some(Ok(bytes)) => synthesized = Some(bytes),
                Some(Err(e)) => error!(%meal_id, error = %e, "image synthesis failed"),
                None => {}
            }
            match analyze_res {
                Some(Ok(est)) => estimate = Some(est),
                Some(Err(e)) => error!(%meal_id, error = %e, "nutrition analysis failed"),
                None => {}
            }
        }

        let mut synthesized_key = None;
        if let Some(bytes) = synthesized {
            let key = photo_key(self.user_id, meal_id, "image/png");
            match state.storage.put_object(&key, bytes, "image/png").await {
                Ok(()) => synthesized_key = Some(key),
                Err(e) => error!(%meal_id, error = %e, "failed to store synthesized image"),
            }
        }

        // Final write: re-read, merge against the *current* record, and
        // apply with an optimistic stamp so a newer edit is never
        // clobbered and a deleted meal is never resurrected.
        for _ in 0..3 {
            let current = match state.store.get(self.user_id, meal_id).await {
                Ok(Some(meal)) => meal,
                Ok(None) => {
                    warn!(%meal_id, "meal deleted mid-analysis, dropping result");
                    return;
                }
                Err(e) => {
                    error!(%meal_id, error = %e, "reconciliation read failed; record may remain analysis_pending");
                    return;
                }
            };
            let patch = final_patch(&current, estimate.as_ref(), synthesized_key.as_deref());
            match state
                .store
                .finalize(self.user_id, meal_id, current.updated_at, patch)
                .await
            {
                Ok(FinalizeOutcome::Applied(_)) => {
                    info!(%meal_id, analyzed = estimate.is_some(), synthesized = synthesized_key.is_some(), "reconciliation complete");
                    state.notifier.meal_updated(meal_id);
                    return;
                }
                Ok(FinalizeOutcome::Stale) => continue,
                Ok(FinalizeOutcome::Missing) => {
                    warn!(%meal_id, "meal deleted mid-analysis, dropping result");
                    return;
                }
                Err(e) => {
                    error!(%meal_id, error = %e, "reconciliation write failed; record may remain analysis_pending");
                    return;
                }
            }
        }
        warn!(%meal_id, "reconciliation lost repeated write races, dropping result");
    }
}

/// Merge rule: the analyzer overwrites the nutrition placeholders, but
/// a descriptive field the user already filled in always wins over an
/// inferred one.
fn final_patch(
    current: &Meal,
    estimate: Option<&NutritionEstimate>,
    synthesized_key: Option<&str>,
) -> MealPatch {
    let mut patch = MealPatch {
        analysis_pending: Some(false),
        ..Default::default()
    };
    if let Some(est) = estimate {
        patch.calories = Some(est.calories);
        patch.fat_g = Some(est.fat_g);
        patch.carbs_g = Some(est.carbs_g);
        patch.protein_g = Some(est.protein_g);
        if is_blank(&current.food_name) {
            patch.food_name = est.food_name.clone();
        }
        if is_blank(&current.brand_name) {
            patch.brand_name = est.brand_name.clone();
        }
        if current.serving_qty.is_none() {
            patch.serving_qty = est.quantity;
        }
        if current.serving_unit.is_none() {
            patch.serving_unit = est.unit;
        }
    }
    if let Some(key) = synthesized_key {
        patch.images = Some(Some(ImageRefs::Single(key.to_string())));
        patch.user_provided_image = Some(false);
    }
    patch
}

#[cfg(test)]
mod workflow_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::ai::{ImageSynthesizer, NutritionAnalyzer, NutritionEstimate};
    use crate::meals::memory::MemoryMealStore;
    use crate::notify::Notifier;
    use crate::state::AppState;
    use crate::storage::ObjectStorage;

    struct StubAnalyzer {
        estimate: NutritionEstimate,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NutritionAnalyzer for StubAnalyzer {
        async fn analyze(
            &self,
            _image: Option<Bytes>,
            _description: Option<&str>,
        ) -> anyhow::Result<NutritionEstimate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("analyzer unavailable");
            }
            Ok(self.estimate.clone())
        }
    }

    struct StubSynthesizer {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ImageSynthesizer for StubSynthesizer {
        async fn synthesize(
            &self,
            _description: &str,
            _food_name_hint: Option<&str>,
        ) -> anyhow::Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("synthesizer unavailable");
            }
            Ok(Bytes::from_static(b"synthesized-png"))
        }
    }

    struct NullStorage;

    #[async_trait]
    impl ObjectStorage for NullStorage {
        async fn put_object(&self, _k: &str, _b: Bytes, _ct: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn presign_get(&self, k: &str, _s: u64) -> anyhow::Result<String> {
            Ok(format!("https://fake.local/{}", k))
        }
    }

    struct Harness {
        state: AppState,
        store: MemoryMealStore,
        analyzer_calls: Arc<AtomicUsize>,
        synthesizer_calls: Arc<AtomicUsize>,
    }

    fn pizza_estimate() -> NutritionEstimate {
        NutritionEstimate {
            calories: 480,
            fat_g: 20,
            carbs_g: 50,
            protein_g: 22,
            food_name: Some("Margherita Pizza".into()),
            brand_name: None,
            quantity: Some(1.0),
            unit: Some(ServingUnit::Count),
        }
    }

    fn harness_with(analyzer_fails: bool, synthesizer_fails: bool) -> Harness {
        let store = MemoryMealStore::new();
        let analyzer_calls = Arc::new(AtomicUsize::new(0));
        let synthesizer_calls = Arc::new(AtomicUsize::new(0));
        let base = AppState::fake();
        let state = AppState::from_parts(
            base.db.clone(),
            base.config.clone(),
            Arc::new(store.clone()),
            Arc::new(NullStorage),
            Arc::new(StubAnalyzer {
                estimate: pizza_estimate(),
                fail: analyzer_fails,
                calls: analyzer_calls.clone(),
            }),
            Arc::new(StubSynthesizer {
                fail: synthesizer_fails,
                calls: synthesizer_calls.clone(),
            }),
            Notifier::new(16),
        );
        Harness {
            state,
            store,
            analyzer_calls,
            synthesizer_calls,
        }
    }

    fn harness() -> Harness {
        harness_with(false, false)
    }

    fn jpeg() -> ImageUpload {
        ImageUpload {
            bytes: Bytes::from_static(b"\xff\xd8fake-jpeg"),
            content_type: "image/jpeg".into(),
        }
    }

    fn create_req(
        images: Vec<ImageUpload>,
        description: Option<&str>,
        food_name: Option<&str>,
    ) -> CreateMeal {
        CreateMeal {
            meal_type: MealType::Lunch,
            food_name: food_name.map(str::to_string),
            brand_name: None,
            description: description.map(str::to_string),
            images,
            serving_qty: None,
            serving_unit: None,
            tz_offset_minutes: 0,
            logged_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_with_image_placeholder_then_reconcile() {
        let h = harness();
        let user = Uuid::new_v4();
        let mut events = h.state.notifier.subscribe();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![jpeg()], None, Some("Pizza")))
            .await
            .unwrap();

        // Placeholder: zero nutrition, pending, user provenance.
        assert!(meal.analysis_pending);
        assert_eq!(meal.calories, 0);
        assert!(meal.user_provided_image);
        assert!(meal.images.is_some());

        job.unwrap().run(h.state.clone()).await;

        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        assert_eq!(after.calories, 480);
        assert_eq!(after.protein_g, 22);
        // User-supplied name beats the analyzer's inference.
        assert_eq!(after.food_name.as_deref(), Some("Pizza"));
        // Fields the user left empty are filled from the inference.
        assert_eq!(after.serving_qty, Some(1.0));
        assert_eq!(after.serving_unit, Some(ServingUnit::Count));

        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.meal_id, meal.id);
    }

    #[tokio::test]
    async fn test_description_only_create_synthesizes_image() {
        let h = harness();
        let user = Uuid::new_v4();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![], Some("a banana"), None))
            .await
            .unwrap();

        assert!(meal.analysis_pending);
        assert!(!meal.user_provided_image);
        assert!(meal.images.is_none());
        assert_eq!(meal.calories, 0);

        job.unwrap().run(h.state.clone()).await;

        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        assert!(after.calories > 0);
        assert!(!after.user_provided_image);
        let key = after.images.as_ref().and_then(|i| i.primary()).unwrap();
        assert!(key.ends_with(".png"));
        // Nothing user-supplied, so the inferred name lands.
        assert_eq!(after.food_name.as_deref(), Some("Margherita Pizza"));

        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validation_gate_rejects_blank_submissions() {
        let h = harness();
        let user = Uuid::new_v4();

        let err = create_meal(&h.state, user, create_req(vec![], Some("   "), None))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let err = create_meal(&h.state, user, create_req(vec![], None, Some("Pizza")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        // Nothing was written.
        assert_eq!(h.store.len().await, 0);
        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 0);
    }

    /// Reconciles a description-only meal and returns it.
    async fn reconciled_banana(h: &Harness, user: Uuid) -> Meal {
        let (meal, job) = create_meal(&h.state, user, create_req(vec![], Some("a banana"), None))
            .await
            .unwrap();
        job.unwrap().run(h.state.clone()).await;
        h.store.get(user, meal.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_meal_type_edit_stays_synchronous() {
        let h = harness();
        let user = Uuid::new_v4();
        let meal = reconciled_banana(&h, user).await;
        let mut events = h.state.notifier.subscribe();

        let (updated, job) = update_meal(
            &h.state,
            user,
            meal.id,
            UpdateMeal {
                meal_type: Some(MealType::Dinner),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(job.is_none());
        assert_eq!(updated.meal_type, MealType::Dinner);
        assert!(!updated.analysis_pending);
        // No async follow-up means no notification either.
        assert!(events.try_recv().is_err());
        assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_description_edit_regenerates_ai_image() {
        let h = harness();
        let user = Uuid::new_v4();
        let meal = reconciled_banana(&h, user).await;
        let old_key = meal.images.as_ref().and_then(|i| i.primary()).unwrap().to_string();

        let (updated, job) = update_meal(
            &h.state,
            user,
            meal.id,
            UpdateMeal {
                description: Some("a green banana".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(updated.analysis_pending);

        job.expect("description edit must regenerate")
            .run(h.state.clone())
            .await;

        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        // Still AI-sourced, but a fresh image.
        assert!(!after.user_provided_image);
        let new_key = after.images.as_ref().and_then(|i| i.primary()).unwrap();
        assert_ne!(new_key, old_key);
        // Regeneration chains into re-analysis.
        assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_new_image_triggers_reanalysis_and_flips_provenance() {
        let h = harness();
        let user = Uuid::new_v4();
        let meal = reconciled_banana(&h, user).await;

        let (updated, job) = update_meal(
            &h.state,
            user,
            meal.id,
            UpdateMeal {
                // Description changes too: the new user image moots the
                // regeneration that change alone would have scheduled.
                description: Some("actually a pastry".into()),
                images: Some(vec![jpeg()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(updated.user_provided_image);
        assert!(updated.analysis_pending);
        let key = updated.images.as_ref().and_then(|i| i.primary()).unwrap();
        assert!(key.ends_with(".jpg"));

        job.expect("new image must re-analyze").run(h.state.clone()).await;

        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        assert!(after.user_provided_image);
        // Analyzer ran again; the synthesizer did not.
        assert_eq!(h.analyzer_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.synthesizer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_analyzer_failure_degrades_silently() {
        let h = harness_with(true, false);
        let user = Uuid::new_v4();
        let mut events = h.state.notifier.subscribe();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![jpeg()], None, None))
            .await
            .unwrap();
        job.unwrap().run(h.state.clone()).await;

        // Nutrition stays at the placeholder, but the record is
        // finalized and fetchable; the client never saw an error.
        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        assert_eq!(after.calories, 0);
        assert_eq!(events.try_recv().unwrap().meal_id, meal.id);
    }

    #[tokio::test]
    async fn test_synthesis_failure_does_not_block_analysis() {
        let h = harness_with(false, true);
        let user = Uuid::new_v4();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![], Some("a banana"), None))
            .await
            .unwrap();
        job.unwrap().run(h.state.clone()).await;

        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert!(!after.analysis_pending);
        assert_eq!(after.calories, 480);
        assert!(after.images.is_none());
        assert!(!after.user_provided_image);
    }

    #[tokio::test]
    async fn test_midflight_edit_is_not_clobbered() {
        let h = harness();
        let user = Uuid::new_v4();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![], Some("soup"), None))
            .await
            .unwrap();

        // Edit lands while analysis is "in flight" (job not yet run).
        let (edited, no_job) = update_meal(
            &h.state,
            user,
            meal.id,
            UpdateMeal {
                meal_type: Some(MealType::Dinner),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(no_job.is_none());
        assert!(edited.updated_at > meal.updated_at);

        job.unwrap().run(h.state.clone()).await;

        // The reconciliation merged against the edited record instead
        // of resurrecting the snapshot it started from.
        let after = h.store.get(user, meal.id).await.unwrap().unwrap();
        assert_eq!(after.meal_type, MealType::Dinner);
        assert_eq!(after.calories, 480);
        assert!(!after.analysis_pending);
    }

    #[tokio::test]
    async fn test_delete_midflight_is_not_resurrected() {
        let h = harness();
        let user = Uuid::new_v4();

        let (meal, job) = create_meal(&h.state, user, create_req(vec![jpeg()], None, None))
            .await
            .unwrap();
        delete_meal(&h.state, user, meal.id).await.unwrap();

        job.unwrap().run(h.state.clone()).await;

        assert_eq!(h.store.len().await, 0);
        assert!(h.store.get(user, meal.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let h = harness();
        let err = delete_meal(&h.state, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound));
    }

    #[tokio::test]
    async fn test_day_summary_matches_day_query() {
        let h = harness();
        let user = Uuid::new_v4();

        let stamp = time::macros::datetime!(2024-06-01 12:00 UTC);
        for desc in ["oatmeal", "a banana"] {
            let mut req = create_req(vec![], Some(desc), None);
            req.logged_at = Some(stamp);
            let (_, job) = create_meal(&h.state, user, req).await.unwrap();
            job.unwrap().run(h.state.clone()).await;
        }

        let today = local_day(stamp, 0);
        let meals = meals_for_day(&h.state, user, today).await.unwrap();
        assert_eq!(meals.len(), 2);

        let summary = day_summary(&h.state, user, today).await.unwrap();
        assert_eq!(summary, NutritionTotals::of(&meals));
        assert_eq!(summary.calories, 960);

        // A day with no meals rolls up to all zeros.
        let empty = day_summary(&h.state, user, today.next_day().unwrap())
            .await
            .unwrap();
        assert_eq!(empty, NutritionTotals::default());
    }

    #[tokio::test]
    async fn test_month_summary_groups_by_local_date() {
        let h = harness();
        let user = Uuid::new_v4();
        let stamp = time::macros::datetime!(2024-03-08 04:50 UTC);

        // Logged from UTC-5: buckets on 2024-03-07.
        let mut req = create_req(vec![], Some("late snack"), None);
        req.tz_offset_minutes = 300;
        req.logged_at = Some(stamp);
        let (_, job) = create_meal(&h.state, user, req).await.unwrap();
        job.unwrap().run(h.state.clone()).await;

        // Logged from UTC: buckets on 2024-03-08.
        let mut req = create_req(vec![], Some("breakfast"), None);
        req.logged_at = Some(stamp);
        let (_, job) = create_meal(&h.state, user, req).await.unwrap();
        job.unwrap().run(h.state.clone()).await;

        let rollup = month_summary(&h.state, user, 2024, 3).await.unwrap();
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup["2024-03-07"].calories, 480);
        assert_eq!(rollup["2024-03-08"].calories, 480);

        let err = month_summary(&h.state, user, 2024, 13).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_meal_is_not_found() {
        let h = harness();
        let err = update_meal(
            &h.state,
            Uuid::new_v4(),
            Uuid::new_v4(),
            UpdateMeal {
                meal_type: Some(MealType::Snack),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound));
    }

    #[tokio::test]
    async fn test_clearing_images_resets_provenance() {
        let h = harness();
        let user = Uuid::new_v4();
        let (meal, job) = create_meal(
            &h.state,
            user,
            create_req(vec![jpeg()], Some("toast"), None),
        )
        .await
        .unwrap();
        job.unwrap().run(h.state.clone()).await;

        let (updated, job) = update_meal(
            &h.state,
            user,
            meal.id,
            UpdateMeal {
                images: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Provenance re-evaluates from the new (empty) image set; with
        // an unchanged description there is nothing to regenerate.
        assert!(!updated.user_provided_image);
        assert!(updated.images.is_none());
        assert!(job.is_none());
    }
}
