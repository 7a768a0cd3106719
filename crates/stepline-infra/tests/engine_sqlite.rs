//! End-to-end engine runs over the SQLite state store.
//!
//! These tests exercise the full stack: controller loop, lease lock, subject
//! queue, and checkpoint persistence, all against a real database file, with
//! a process restart simulated by reopening the store.

use std::sync::{Arc, Mutex};

use stepline_core::controller::{RunExit, WorkflowController, load_status, request_stop, start_run};
use stepline_core::environment::{ActionDescriptor, EnvError, Environment, LocationSignal};
use stepline_core::executor::{ExecuteFuture, StepContext, StepExecutor, StepRegistry, StepOutcome};
use stepline_core::resolver::StepSpec;
use stepline_infra::sqlite::SqliteStateStore;
use stepline_types::config::EngineConfig;
use stepline_types::subject::{Subject, SubjectField};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct StaticEnv {
    location: String,
}

impl StaticEnv {
    fn at(location: &str) -> Arc<Self> {
        Arc::new(Self {
            location: location.to_string(),
        })
    }
}

impl Environment for StaticEnv {
    async fn current_location(&self) -> Result<LocationSignal, EnvError> {
        Ok(LocationSignal(self.location.clone()))
    }
    async fn observe(&self, _marker: &str) -> Result<bool, EnvError> {
        Ok(true)
    }
    async fn perform_action(&self, _action: &ActionDescriptor) -> Result<(), EnvError> {
        Ok(())
    }
    async fn trigger_transition(&self, _target: &str) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Executor recording `(step_id, subject_id)` for every execution.
struct Recording {
    id: &'static str,
    log: Arc<Mutex<Vec<(String, Uuid)>>>,
}

impl Recording {
    fn arc(id: &'static str, log: &Arc<Mutex<Vec<(String, Uuid)>>>) -> Arc<dyn StepExecutor<StaticEnv>> {
        Arc::new(Self {
            id,
            log: Arc::clone(log),
        })
    }
}

impl StepExecutor<StaticEnv> for Recording {
    fn step_id(&self) -> &str {
        self.id
    }
    fn execute<'a>(
        &'a self,
        subject: &'a Subject,
        _ctx: &'a mut StepContext,
        _env: &'a StaticEnv,
    ) -> ExecuteFuture<'a> {
        let log = Arc::clone(&self.log);
        let id = self.id;
        Box::pin(async move {
            log.lock().unwrap().push((id.to_string(), subject.id));
            Ok(StepOutcome::advance())
        })
    }
}

/// Executor that completes its step and requests a stop, simulating an
/// operator interrupting mid-run.
struct StopDuringStep {
    id: &'static str,
    store: Arc<SqliteStateStore>,
    config: EngineConfig,
}

impl StepExecutor<StaticEnv> for StopDuringStep {
    fn step_id(&self) -> &str {
        self.id
    }
    fn execute<'a>(
        &'a self,
        _subject: &'a Subject,
        _ctx: &'a mut StepContext,
        _env: &'a StaticEnv,
    ) -> ExecuteFuture<'a> {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        Box::pin(async move {
            request_stop(store, &config).await.unwrap();
            Ok(StepOutcome::advance())
        })
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_step_attempts: 3,
        retry_backoff_ms: 1,
        lock_backoff_min_ms: 1,
        lock_backoff_max_ms: 3,
        ..EngineConfig::default()
    }
}

fn subject(name: &str) -> Subject {
    Subject::new(vec![SubjectField::required("given_name", name)])
}

async fn open_store(url: &str) -> Arc<SqliteStateStore> {
    Arc::new(SqliteStateStore::open(url).await.unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_run_drains_queue_over_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("run.db").display());
    let store = open_store(&url).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = StepRegistry::new(vec![
        (StepSpec::ordered("fill"), Recording::arc("fill", &log)),
        (StepSpec::ordered("submit"), Recording::arc("submit", &log)),
    ])
    .unwrap();

    let config = fast_config();
    let subjects = vec![subject("a"), subject("b")];
    start_run(Arc::clone(&store), &config, subjects).await.unwrap();

    let controller =
        WorkflowController::new(Arc::clone(&store), StaticEnv::at("env://start"), registry, config);
    assert_eq!(controller.run().await.unwrap(), RunExit::QueueDrained);

    assert_eq!(log.lock().unwrap().len(), 4);
    let status = load_status(store).await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.state.stats.success, 2);
    assert!(!status.state.run_flag);
}

#[tokio::test]
async fn test_stop_then_resume_across_store_reopen() {
    // Stop mid-run, reopen the database as a fresh process would, restart,
    // and verify the completed step is not replayed.
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("resume.db").display());
    let config = fast_config();
    let log = Arc::new(Mutex::new(Vec::new()));

    let s = subject("a");
    let sid = s.id;

    {
        let store = open_store(&url).await;
        let stopper: Arc<dyn StepExecutor<StaticEnv>> = Arc::new(StopDuringStep {
            id: "fill",
            store: Arc::clone(&store),
            config: config.clone(),
        });
        let registry = StepRegistry::new(vec![
            (StepSpec::ordered("fill"), stopper),
            (StepSpec::ordered("submit"), Recording::arc("submit", &log)),
        ])
        .unwrap();

        start_run(Arc::clone(&store), &config, vec![s]).await.unwrap();
        let controller = WorkflowController::new(
            Arc::clone(&store),
            StaticEnv::at("env://start"),
            registry,
            config.clone(),
        );
        assert_eq!(controller.run().await.unwrap(), RunExit::Stopped);
        assert!(log.lock().unwrap().is_empty());
    }

    // "Restart": fresh store over the same file, re-arm the run flag.
    let store = open_store(&url).await;
    let status = load_status(Arc::clone(&store)).await.unwrap();
    assert_eq!(status.state.current_step_id.as_deref(), Some("submit"));
    assert_eq!(status.pending, 1);

    let registry = StepRegistry::new(vec![
        (StepSpec::ordered("fill"), Recording::arc("fill", &log)),
        (StepSpec::ordered("submit"), Recording::arc("submit", &log)),
    ])
    .unwrap();

    // start_run would rebuild the queue; resuming re-arms the flag only.
    {
        use stepline_core::store::{get_typed, keys, set_typed};
        use stepline_types::state::WorkflowState;
        let mut state: WorkflowState = get_typed(store.as_ref(), keys::STATE)
            .await
            .unwrap()
            .unwrap();
        state.run_flag = true;
        set_typed(store.as_ref(), keys::STATE, &state).await.unwrap();
    }

    let controller = WorkflowController::new(
        Arc::clone(&store),
        StaticEnv::at("env://start"),
        registry,
        config,
    );
    assert_eq!(controller.run().await.unwrap(), RunExit::QueueDrained);

    // only the checkpointed step ran; "fill" was never replayed
    assert_eq!(log.lock().unwrap().clone(), vec![("submit".to_string(), sid)]);
}

#[tokio::test]
async fn test_two_workers_share_one_queue() {
    // Two controllers over the same store drain the queue cooperatively;
    // every subject is processed exactly once.
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("workers.db").display());
    let store = open_store(&url).await;
    let config = fast_config();
    let log = Arc::new(Mutex::new(Vec::new()));

    let subjects: Vec<Subject> = (0..4).map(|i| subject(&format!("s{i}"))).collect();
    start_run(Arc::clone(&store), &config, subjects).await.unwrap();

    let mut controllers = Vec::new();
    for _ in 0..2 {
        let registry =
            StepRegistry::new(vec![(StepSpec::ordered("only"), Recording::arc("only", &log))])
                .unwrap();
        controllers.push(WorkflowController::new(
            Arc::clone(&store),
            StaticEnv::at("env://start"),
            registry,
            config.clone(),
        ));
    }
    let [c1, c2]: [WorkflowController<_, _>; 2] = controllers.try_into().ok().unwrap();

    let (e1, e2) = tokio::join!(c1.run(), c2.run());
    // one drains the queue; the other observes the cleared run flag
    let exits = [e1.unwrap(), e2.unwrap()];
    assert!(exits.contains(&RunExit::QueueDrained));

    let status = load_status(store).await.unwrap();
    assert_eq!(status.state.stats.processed, 4);
    assert_eq!(status.state.stats.success, 4);
    assert_eq!(status.pending, 0);

    // every subject executed at least once; workers may re-run a step
    // (executors are idempotent) but stats count each subject exactly once
    let executed = log.lock().unwrap().clone();
    let mut ids: Vec<Uuid> = executed.iter().map(|(_, id)| *id).collect();
    ids.sort();
    ids.dedup();
    assert!(executed.len() >= 4);
    assert_eq!(ids.len(), 4);
}
