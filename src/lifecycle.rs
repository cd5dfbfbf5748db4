//! Local language model lifecycle.
//!
//! The manager owns the only loaded model. It loads on first use, shares a
//! single in-flight load between concurrent callers, serializes generation
//! and unloads the model after a period of disuse to give the memory back.
//!
//! All shared state sits behind one gate (a `std::sync::Mutex`) that is never
//! held across an `.await`, a load or a generation. Callers get a
//! [`ModelLease`] that keeps the model from being evicted while they use it;
//! dropping the lease is the implicit release.

use crate::config::ModelConfig;
use crate::engine::{EngineError, InferenceEngine, LanguageModel, ModelTier};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Failures surfaced by the lifecycle manager.
///
/// `Clone` so that every caller waiting on one load observes the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model '{tier}' not found at {path}. Run 'arcadia model download {tier}'")]
    NotFound { tier: ModelTier, path: PathBuf },

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),
}

impl ModelError {
    fn from_load(err: EngineError, tier: ModelTier) -> Self {
        match err {
            EngineError::ArtifactMissing(path) => Self::NotFound { tier, path },
            other => Self::Load(other.to_string()),
        }
    }
}

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub tier: ModelTier,
    pub models_dir: PathBuf,
    /// Zero disables idle eviction.
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub generation_timeout: Duration,
}

impl LifecycleConfig {
    pub fn from_config(config: &ModelConfig, models_dir: PathBuf) -> Self {
        Self {
            tier: config.tier,
            models_dir,
            idle_timeout: Duration::from_secs(config.idle_unload_secs),
            check_interval: Duration::from_secs(config.check_interval_secs),
            generation_timeout: Duration::from_secs(config.generation_timeout_secs),
        }
    }
}

/// Observable model state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
}

/// Snapshot returned by [`ModelLifecycleManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    /// Tier used by the next load.
    pub tier: ModelTier,
    /// Tier of the loaded (or loading) model.
    pub loaded_tier: Option<ModelTier>,
    pub load_id: Option<u64>,
    /// Seconds since the model was last used, when loaded.
    pub idle_secs: Option<u64>,
    pub leases: usize,
}

/// Result of [`ModelLifecycleManager::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureOutcome {
    pub tier: ModelTier,
    /// A different tier is loaded; it stays until unloaded.
    pub reload_required: bool,
}

/// Result of [`ModelLifecycleManager::unload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadOutcome {
    Unloaded,
    NotLoaded,
    /// A load is in flight or leases are outstanding.
    Busy,
}

type SharedModel = Arc<Mutex<Box<dyn LanguageModel>>>;

/// Outcome of one load, shared by every waiter: the load id or the failure.
type LoadFuture = Shared<BoxFuture<'static, Result<u64, ModelError>>>;

#[derive(Clone)]
struct Loaded {
    id: u64,
    tier: ModelTier,
    context_length: usize,
    model: SharedModel,
}

enum Phase {
    Unloaded,
    Loading {
        id: u64,
        tier: ModelTier,
        done: LoadFuture,
    },
    Loaded(Loaded),
}

struct Gate {
    phase: Phase,
    /// Tier for the next load.
    tier: ModelTier,
    last_used: Instant,
    leases: usize,
    next_id: u64,
}

struct Inner {
    gate: Mutex<Gate>,
    engine: Arc<dyn InferenceEngine>,
    config: LifecycleConfig,
}

impl Inner {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the outcome of load `id` into the gate.
    fn finish_load(&self, id: u64, outcome: Result<Loaded, ModelError>) -> Result<u64, ModelError> {
        let mut gate = self.gate();
        let current = matches!(gate.phase, Phase::Loading { id: loading, .. } if loading == id);

        match outcome {
            Ok(loaded) if current => {
                gate.phase = Phase::Loaded(loaded);
                gate.last_used = Instant::now();
                Ok(id)
            }
            Ok(_) => Err(ModelError::Load("load was superseded".into())),
            Err(e) => {
                if current {
                    gate.phase = Phase::Unloaded;
                }
                Err(e)
            }
        }
    }
}

/// Owns the local language model's loaded/unloaded state.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<Inner>,
}

impl ModelLifecycleManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: LifecycleConfig) -> Self {
        info!(
            "Model manager ready (engine: {}, tier: {}, idle unload: {}s)",
            engine.name(),
            config.tier,
            config.idle_timeout.as_secs()
        );

        let gate = Gate {
            phase: Phase::Unloaded,
            tier: config.tier,
            last_used: Instant::now(),
            leases: 0,
            next_id: 1,
        };

        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(gate),
                engine,
                config,
            }),
        }
    }

    /// Lease the loaded model, loading it first if needed.
    ///
    /// Callers arriving while a load is in flight wait for that load and
    /// observe its outcome; no second load is started.
    pub async fn acquire(&self) -> Result<ModelLease, ModelError> {
        loop {
            let (load_id, done) = {
                let mut gate = self.inner.gate();
                let pending = match &gate.phase {
                    Phase::Loaded(loaded) => Some(Err(loaded.clone())),
                    Phase::Loading { id, done, .. } => Some(Ok((*id, done.clone()))),
                    Phase::Unloaded => None,
                };
                match pending {
                    Some(Ok(pending)) => pending,
                    Some(Err(loaded)) => return Ok(self.lease(&mut gate, loaded)),
                    None => self.start_load(&mut gate),
                }
            };

            match done.await {
                Ok(id) => {
                    let mut gate = self.inner.gate();
                    let loaded = match &gate.phase {
                        Phase::Loaded(loaded) if loaded.id == id => Some(loaded.clone()),
                        _ => None,
                    };
                    if let Some(loaded) = loaded {
                        return Ok(self.lease(&mut gate, loaded));
                    }
                    debug!("Model {} went away before it could be leased, retrying", id);
                }
                Err(e) => {
                    // The load task normally resets the phase itself; this covers a
                    // task that died before publishing.
                    let mut gate = self.inner.gate();
                    if matches!(gate.phase, Phase::Loading { id, .. } if id == load_id) {
                        gate.phase = Phase::Unloaded;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn lease(&self, gate: &mut Gate, loaded: Loaded) -> ModelLease {
        gate.leases += 1;
        gate.last_used = Instant::now();
        ModelLease {
            deadline: Instant::now() + self.inner.config.generation_timeout,
            inner: Arc::clone(&self.inner),
            loaded: Some(loaded),
        }
    }

    /// Spawn the single load task and mark the gate as loading.
    fn start_load(&self, gate: &mut Gate) -> (u64, LoadFuture) {
        let id = gate.next_id;
        gate.next_id += 1;
        let tier = gate.tier;
        let spec = tier.spec(&self.inner.config.models_dir);
        let engine = Arc::clone(&self.inner.engine);
        let inner = Arc::clone(&self.inner);

        info!("Loading {} model (load {})", tier, id);

        // Spawned so the load finishes even if every waiter is cancelled.
        let task = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let outcome = match tokio::task::spawn_blocking(move || engine.load(&spec)).await {
                Ok(Ok(model)) => Ok(Loaded {
                    id,
                    tier,
                    context_length: model.context_length(),
                    model: Arc::new(Mutex::new(model)),
                }),
                Ok(Err(e)) => Err(ModelError::from_load(e, tier)),
                Err(e) => Err(ModelError::Load(format!("load task failed: {e}"))),
            };

            match &outcome {
                Ok(_) => info!(
                    "{} model loaded in {}ms",
                    tier,
                    started.elapsed().as_millis()
                ),
                Err(ModelError::NotFound { path, .. }) => {
                    warn!("Model artifact missing: {}", path.display())
                }
                Err(e) => error!("Model load failed: {}", e),
            }

            inner.finish_load(id, outcome)
        });

        let done = async move {
            task.await
                .unwrap_or_else(|e| Err(ModelError::Load(format!("load task failed: {e}"))))
        }
        .boxed()
        .shared();

        gate.phase = Phase::Loading {
            id,
            tier,
            done: done.clone(),
        };

        (id, done)
    }

    /// Acquire the model and generate a continuation of `prompt`.
    pub async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, ModelError> {
        self.acquire()
            .await?
            .generate(prompt.to_string(), max_tokens)
            .await
    }

    /// Change the tier used by the next load. The loaded model is left alone.
    pub fn configure(&self, tier: ModelTier) -> ConfigureOutcome {
        let mut gate = self.inner.gate();
        gate.tier = tier;

        let reload_required = match &gate.phase {
            Phase::Loaded(loaded) => loaded.tier != tier,
            Phase::Loading { tier: loading, .. } => *loading != tier,
            Phase::Unloaded => false,
        };

        info!(
            "Model tier set to {} (reload required: {})",
            tier, reload_required
        );

        ConfigureOutcome {
            tier,
            reload_required,
        }
    }

    /// Unload now, unless the model is in use.
    pub fn unload(&self) -> UnloadOutcome {
        let mut gate = self.inner.gate();
        let state = match gate.phase {
            Phase::Unloaded => ModelState::Unloaded,
            Phase::Loading { .. } => ModelState::Loading,
            Phase::Loaded(_) => ModelState::Loaded,
        };
        match state {
            ModelState::Unloaded => UnloadOutcome::NotLoaded,
            ModelState::Loading => UnloadOutcome::Busy,
            ModelState::Loaded if gate.leases > 0 => UnloadOutcome::Busy,
            ModelState::Loaded => {
                Self::release_model(&mut gate, "requested");
                UnloadOutcome::Unloaded
            }
        }
    }

    /// Unload if the model has been idle for the configured timeout.
    pub fn evict_if_idle(&self) -> bool {
        self.evict_if_idle_at(Instant::now())
    }

    /// Idle check against an explicit clock reading.
    pub fn evict_if_idle_at(&self, now: Instant) -> bool {
        let idle_timeout = self.inner.config.idle_timeout;
        if idle_timeout.is_zero() {
            return false;
        }

        let mut gate = self.inner.gate();
        if gate.leases > 0 || !matches!(gate.phase, Phase::Loaded(_)) {
            return false;
        }

        let idle = now.saturating_duration_since(gate.last_used);
        if idle < idle_timeout {
            return false;
        }

        debug!("Model idle for {}s", idle.as_secs());
        Self::release_model(&mut gate, "idle");
        true
    }

    /// Drop the model while holding the gate so no new load can overlap.
    fn release_model(gate: &mut Gate, reason: &str) {
        if let Phase::Loaded(loaded) = std::mem::replace(&mut gate.phase, Phase::Unloaded) {
            info!("Unloading {} model ({})", loaded.tier, reason);
            drop(loaded);
        }
    }

    pub fn status(&self) -> ModelStatus {
        let gate = self.inner.gate();
        let (state, loaded_tier, load_id) = match &gate.phase {
            Phase::Unloaded => (ModelState::Unloaded, None, None),
            Phase::Loading { id, tier, .. } => (ModelState::Loading, Some(*tier), Some(*id)),
            Phase::Loaded(loaded) => (ModelState::Loaded, Some(loaded.tier), Some(loaded.id)),
        };
        let idle_secs = (state == ModelState::Loaded).then(|| gate.last_used.elapsed().as_secs());

        ModelStatus {
            state,
            tier: gate.tier,
            loaded_tier,
            load_id,
            idle_secs,
            leases: gate.leases,
        }
    }

    /// Run the idle check every `check_interval` until `shutdown` flips.
    ///
    /// Returns `None` when idle eviction is disabled.
    pub fn spawn_eviction_loop(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.inner.config.idle_timeout.is_zero() {
            info!("Idle model unloading disabled");
            return None;
        }

        let manager = self.clone();
        let period = self.inner.config.check_interval;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.evict_if_idle();
                    }
                    _ = shutdown.changed() => {
                        debug!("Eviction loop stopped");
                        break;
                    }
                }
            }
        }))
    }
}

/// Short-lived access to the loaded model.
///
/// While any lease exists the model is never evicted. Dropping it updates
/// the last-used timestamp.
///
/// Token counting and generation share one deadline, `generation_timeout`
/// after the lease was granted.
pub struct ModelLease {
    inner: Arc<Inner>,
    loaded: Option<Loaded>,
    deadline: Instant,
}

impl ModelLease {
    fn loaded(&self) -> &Loaded {
        // Only `Drop` takes the value out.
        self.loaded
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease used after release"))
    }

    /// Identifier of the load this lease refers to.
    pub fn load_id(&self) -> u64 {
        self.loaded().id
    }

    pub fn tier(&self) -> ModelTier {
        self.loaded().tier
    }

    pub fn context_length(&self) -> usize {
        self.loaded().context_length
    }

    /// Token counts for each of `texts`.
    ///
    /// Waits for the model while an earlier generation still holds it, but
    /// never past the lease deadline.
    pub async fn count_tokens(&self, texts: Vec<String>) -> Result<Vec<usize>, ModelError> {
        let model = Arc::clone(&self.loaded().model);
        let job = tokio::task::spawn_blocking(move || {
            let model = model.lock().unwrap_or_else(PoisonError::into_inner);
            texts
                .iter()
                .map(|t| model.count_tokens(t))
                .collect::<Result<Vec<_>, _>>()
        });

        match tokio::time::timeout_at(self.deadline, job).await {
            Ok(Ok(counts)) => counts.map_err(|e| ModelError::Generation(e.to_string())),
            Ok(Err(e)) => Err(ModelError::Generation(format!("tokenizer task failed: {e}"))),
            Err(_) => {
                let timeout = self.inner.config.generation_timeout;
                warn!("Model busy for longer than {:?}, giving up", timeout);
                Err(ModelError::Timeout(timeout))
            }
        }
    }

    /// Run inference, bounded by the lease deadline.
    ///
    /// Failures leave the model loaded. A timed-out generation keeps running
    /// in the background and holds the lease until it finishes.
    pub async fn generate(self, prompt: String, max_tokens: usize) -> Result<String, ModelError> {
        let timeout = self.inner.config.generation_timeout;
        let deadline = self.deadline;
        let model = Arc::clone(&self.loaded().model);

        let job = tokio::task::spawn_blocking(move || {
            let _lease = self;
            let mut model = model.lock().unwrap_or_else(PoisonError::into_inner);
            model.generate(&prompt, max_tokens)
        });

        match tokio::time::timeout_at(deadline, job).await {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(e))) => {
                warn!("Generation failed: {}", e);
                Err(ModelError::Generation(e.to_string()))
            }
            Ok(Err(e)) => {
                error!("Generation task failed: {}", e);
                Err(ModelError::Generation(format!("generation task failed: {e}")))
            }
            Err(_) => {
                warn!("Generation timed out after {:?}", timeout);
                Err(ModelError::Timeout(timeout))
            }
        }
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        drop(self.loaded.take());
        let mut gate = self.inner.gate();
        gate.leases = gate.leases.saturating_sub(1);
        gate.last_used = Instant::now();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::ModelSpec;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// How the stub engine responds to `load`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StubLoad {
        Ok,
        Missing,
        Broken,
    }

    /// Engine that counts loads and echoes prompts.
    pub struct StubEngine {
        pub loads: AtomicUsize,
        pub mode: Mutex<StubLoad>,
        pub load_delay: Duration,
        pub context_length: usize,
    }

    impl StubEngine {
        pub fn new(mode: StubLoad) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                mode: Mutex::new(mode),
                load_delay: Duration::from_millis(50),
                context_length: 64,
            }
        }

        pub fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }

        pub fn set_mode(&self, mode: StubLoad) {
            *self.mode.lock().unwrap() = mode;
        }
    }

    impl InferenceEngine for StubEngine {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn load(&self, spec: &ModelSpec) -> Result<Box<dyn LanguageModel>, EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.load_delay);
            match *self.mode.lock().unwrap() {
                StubLoad::Ok => Ok(Box::new(StubModel {
                    context_length: self.context_length,
                })),
                StubLoad::Missing => Err(EngineError::ArtifactMissing(spec.model_path.clone())),
                StubLoad::Broken => Err(EngineError::LoadFailed("corrupt weights".into())),
            }
        }
    }

    /// One token per whitespace-separated word; replies echo the prompt.
    pub struct StubModel {
        context_length: usize,
    }

    impl LanguageModel for StubModel {
        fn context_length(&self) -> usize {
            self.context_length
        }

        fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
            Ok(text.split_whitespace().count())
        }

        fn generate(&mut self, prompt: &str, _max_tokens: usize) -> Result<String, EngineError> {
            if prompt.contains("boom") {
                return Err(EngineError::Inference("bad prompt".into()));
            }
            if prompt.contains("slow") {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(format!("eco: {prompt}"))
        }
    }

    pub fn test_config() -> LifecycleConfig {
        LifecycleConfig {
            tier: ModelTier::Balanced,
            models_dir: PathBuf::from("/nonexistent/models"),
            idle_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(5),
        }
    }

    fn manager_with(engine: &Arc<StubEngine>, config: LifecycleConfig) -> ModelLifecycleManager {
        ModelLifecycleManager::new(Arc::clone(engine) as Arc<dyn InferenceEngine>, config)
    }

    // ===================
    // Loading
    // ===================

    #[tokio::test]
    async fn test_concurrent_acquire_loads_once() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let results = join_all((0..8).map(|_| manager.acquire())).await;

        assert_eq!(engine.loads(), 1);
        let ids: Vec<u64> = results
            .iter()
            .map(|r| r.as_ref().expect("acquire should succeed").load_id())
            .collect();
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(manager.status().leases, 8);
        assert_eq!(manager.status().state, ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_share_failure() {
        let engine = Arc::new(StubEngine::new(StubLoad::Broken));
        let manager = manager_with(&engine, test_config());

        let results = join_all((0..5).map(|_| manager.acquire())).await;

        assert_eq!(engine.loads(), 1);
        let errors: Vec<ModelError> = results.into_iter().filter_map(|r| r.err()).collect();
        assert_eq!(errors.len(), 5);
        assert!(matches!(errors[0], ModelError::Load(_)));
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert_eq!(manager.status().state, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_load_error_allows_retry() {
        let engine = Arc::new(StubEngine::new(StubLoad::Broken));
        let manager = manager_with(&engine, test_config());

        assert!(manager.acquire().await.is_err());
        engine.set_mode(StubLoad::Ok);

        let lease = manager.acquire().await.expect("retry should load");
        assert_eq!(engine.loads(), 2);
        assert_eq!(lease.load_id(), 2);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let engine = Arc::new(StubEngine::new(StubLoad::Missing));
        let manager = manager_with(&engine, test_config());

        match manager.acquire().await {
            Err(ModelError::NotFound { tier, path }) => {
                assert_eq!(tier, ModelTier::Balanced);
                assert!(path.ends_with("phi3-balanced.onnx"));
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("acquire should fail"),
        }
        assert_eq!(manager.status().state, ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_not_found_message_mentions_download() {
        let err = ModelError::NotFound {
            tier: ModelTier::Light,
            path: PathBuf::from("/m/phi3-light.onnx"),
        };
        assert!(err.to_string().contains("arcadia model download light"));
    }

    #[tokio::test]
    async fn test_loaded_model_is_reused() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let first = manager.acquire().await.unwrap().load_id();
        let second = manager.acquire().await.unwrap().load_id();

        assert_eq!(first, second);
        assert_eq!(engine.loads(), 1);
        assert_eq!(manager.status().leases, 0);
    }

    // ===================
    // Idle eviction
    // ===================

    #[tokio::test]
    async fn test_idle_model_is_evicted() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        drop(manager.acquire().await.unwrap());
        let released = Instant::now();

        assert!(!manager.evict_if_idle_at(released + Duration::from_secs(299)));
        assert_eq!(manager.status().state, ModelState::Loaded);

        assert!(manager.evict_if_idle_at(released + Duration::from_secs(300)));
        assert_eq!(manager.status().state, ModelState::Unloaded);

        // Next acquire loads again.
        manager.acquire().await.unwrap();
        assert_eq!(engine.loads(), 2);
    }

    #[tokio::test]
    async fn test_acquire_defers_eviction() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.idle_timeout = Duration::from_secs(10);
        let manager = manager_with(&engine, config);

        drop(manager.acquire().await.unwrap());
        let first_use = Instant::now();

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(manager.acquire().await.unwrap());

        assert!(!manager.evict_if_idle_at(first_use + Duration::from_secs(10)));
        assert!(manager.evict_if_idle_at(Instant::now() + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_outstanding_lease_blocks_eviction() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let lease = manager.acquire().await.unwrap();
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(!manager.evict_if_idle_at(far_future));
        assert_eq!(manager.unload(), UnloadOutcome::Busy);

        drop(lease);
        assert!(manager.evict_if_idle_at(far_future));
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_eviction() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.idle_timeout = Duration::ZERO;
        let manager = manager_with(&engine, config);

        drop(manager.acquire().await.unwrap());
        assert!(!manager.evict_if_idle_at(Instant::now() + Duration::from_secs(86400)));

        let (_tx, rx) = watch::channel(false);
        assert!(manager.spawn_eviction_loop(rx).is_none());
    }

    #[tokio::test]
    async fn test_eviction_loop_unloads_idle_model() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(50);
        config.check_interval = Duration::from_millis(10);
        let manager = manager_with(&engine, config);

        let (tx, rx) = watch::channel(false);
        let handle = manager.spawn_eviction_loop(rx).expect("loop should start");

        drop(manager.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status().state, ModelState::Unloaded);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    // ===================
    // Generation
    // ===================

    #[tokio::test]
    async fn test_generate() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let reply = manager.generate("ciao", 16).await.unwrap();
        assert_eq!(reply, "eco: ciao");
        assert_eq!(manager.status().leases, 0);
    }

    #[tokio::test]
    async fn test_generation_error_keeps_model_loaded() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let err = manager.generate("boom", 16).await.unwrap_err();
        assert!(matches!(err, ModelError::Generation(_)));
        assert_eq!(manager.status().state, ModelState::Loaded);

        assert!(manager.generate("ciao", 16).await.is_ok());
        assert_eq!(engine.loads(), 1);
    }

    #[tokio::test]
    async fn test_generation_timeout_does_not_evict() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.generation_timeout = Duration::from_millis(50);
        let manager = manager_with(&engine, config);

        let err = manager.generate("slow", 16).await.unwrap_err();
        assert_eq!(err, ModelError::Timeout(Duration::from_millis(50)));

        // The generation still holds its lease until it finishes.
        assert_eq!(manager.status().state, ModelState::Loaded);
        assert_eq!(manager.status().leases, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.status().leases, 0);
        assert_eq!(manager.status().state, ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_request_behind_stuck_generation_times_out() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.generation_timeout = Duration::from_millis(50);
        let manager = manager_with(&engine, config);

        // The first generation times out but keeps the model busy.
        let err = manager.generate("slow", 16).await.unwrap_err();
        assert_eq!(err, ModelError::Timeout(Duration::from_millis(50)));

        let started = std::time::Instant::now();
        let lease = manager.acquire().await.unwrap();
        let err = lease.count_tokens(vec!["ciao".into()]).await.unwrap_err();
        assert_eq!(err, ModelError::Timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_deadline_covers_counting_and_generation() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let mut config = test_config();
        config.generation_timeout = Duration::from_millis(100);
        let manager = manager_with(&engine, config);

        let lease = manager.acquire().await.unwrap();
        lease.count_tokens(vec!["slow".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let err = lease.generate("slow".into(), 16).await.unwrap_err();
        assert_eq!(err, ModelError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_count_tokens() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let lease = manager.acquire().await.unwrap();
        let counts = lease
            .count_tokens(vec!["uno due".into(), "".into(), "a b c".into()])
            .await
            .unwrap();
        assert_eq!(counts, vec![2, 0, 3]);
        assert_eq!(lease.context_length(), 64);
    }

    // ===================
    // Configuration
    // ===================

    #[tokio::test]
    async fn test_configure_reports_reload() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        assert!(!manager.configure(ModelTier::Light).reload_required);

        let lease = manager.acquire().await.unwrap();
        assert_eq!(lease.tier(), ModelTier::Light);
        drop(lease);

        let outcome = manager.configure(ModelTier::Full);
        assert!(outcome.reload_required);
        assert!(!manager.configure(ModelTier::Light).reload_required);

        // Loaded tier is untouched until an explicit unload.
        manager.configure(ModelTier::Full);
        assert_eq!(manager.acquire().await.unwrap().tier(), ModelTier::Light);

        assert_eq!(manager.unload(), UnloadOutcome::Unloaded);
        assert_eq!(manager.unload(), UnloadOutcome::NotLoaded);
        assert_eq!(manager.acquire().await.unwrap().tier(), ModelTier::Full);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = Arc::new(StubEngine::new(StubLoad::Ok));
        let manager = manager_with(&engine, test_config());

        let status = manager.status();
        assert_eq!(status.state, ModelState::Unloaded);
        assert_eq!(status.tier, ModelTier::Balanced);
        assert!(status.load_id.is_none());
        assert!(status.idle_secs.is_none());

        let _lease = manager.acquire().await.unwrap();
        let status = manager.status();
        assert_eq!(status.loaded_tier, Some(ModelTier::Balanced));
        assert_eq!(status.load_id, Some(1));
        assert_eq!(status.idle_secs, Some(0));
    }
}
