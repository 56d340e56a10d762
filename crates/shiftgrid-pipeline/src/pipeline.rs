//! Pipeline controller: sequences tier rollouts for a release.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{error, info, warn};

use shiftgrid_core::epoch_secs;
use shiftgrid_core::signal::{cancelled, is_cancelled};
use shiftgrid_rollout::DeploymentController;
use shiftgrid_state::{PipelineRun, PlanStatus, Revision, RunId, RunStatus, StateStore, TierId};

use crate::error::{PipelineError, PipelineResult};
use crate::retry::RetryPolicy;

const INTERRUPTED: &str = "interrupted by restart";

struct RunHandle {
    state: watch::Sender<PipelineRun>,
    cancel: watch::Sender<bool>,
}

struct PipelineInner {
    order: Vec<TierId>,
    controllers: HashMap<TierId, DeploymentController>,
    runs: RwLock<HashMap<RunId, RunHandle>>,
    store: Option<StateStore>,
    retry: RetryPolicy,
    gate: Arc<tokio::sync::Mutex<()>>,
    seq: AtomicU64,
}

/// Runs releases across tiers in dependency order. Cheap to clone.
#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<PipelineInner>,
}

impl PipelineController {
    /// Build the controller.
    ///
    /// Runs persisted as `running` by a previous process are marked
    /// `failed` with reason "interrupted by restart".
    pub fn new(
        order: Vec<TierId>,
        controllers: Vec<DeploymentController>,
        retry: RetryPolicy,
        store: Option<StateStore>,
    ) -> PipelineResult<Self> {
        let controllers: HashMap<TierId, DeploymentController> = controllers
            .into_iter()
            .map(|c| (c.tier().to_string(), c))
            .collect();
        if let Some(missing) = order.iter().find(|t| !controllers.contains_key(*t)) {
            return Err(PipelineError::MissingController(missing.clone()));
        }

        let mut runs = HashMap::new();
        if let Some(store) = &store {
            for mut run in store.list_runs()? {
                if run.finish(RunStatus::Failed, Some(INTERRUPTED.to_string())) {
                    warn!(run = %run.id, "marking run interrupted by restart");
                    store.put_run(&run)?;
                }
                let (state, _) = watch::channel(run.clone());
                let (cancel, _) = watch::channel(false);
                runs.insert(run.id.clone(), RunHandle { state, cancel });
            }
        }

        Ok(Self {
            inner: Arc::new(PipelineInner {
                order,
                controllers,
                runs: RwLock::new(runs),
                store,
                retry,
                gate: Arc::new(tokio::sync::Mutex::new(())),
                seq: AtomicU64::new(1),
            }),
        })
    }

    pub fn order(&self) -> &[TierId] {
        &self.inner.order
    }

    pub fn controller(&self, tier: &str) -> Option<&DeploymentController> {
        self.inner.controllers.get(tier)
    }

    fn runs_read(&self) -> RwLockReadGuard<'_, HashMap<RunId, RunHandle>> {
        self.inner.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn runs_write(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunHandle>> {
        self.inner.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run for `release`. Returns immediately with the run id.
    pub fn submit_release(&self, release: BTreeMap<TierId, Revision>) -> PipelineResult<RunId> {
        if release.is_empty() {
            return Err(PipelineError::EmptyRelease);
        }
        for (tier, revision) in &release {
            if !self.inner.controllers.contains_key(tier) {
                return Err(PipelineError::UnknownTier(tier.clone()));
            }
            if revision.tier != *tier {
                return Err(PipelineError::TierMismatch {
                    tier: tier.clone(),
                    revision_tier: revision.tier.clone(),
                });
            }
        }

        let guard = Arc::clone(&self.inner.gate)
            .try_lock_owned()
            .map_err(|_| PipelineError::Conflict)?;

        let id = format!(
            "run-{}-{}",
            epoch_secs(),
            self.inner.seq.fetch_add(1, Ordering::Relaxed)
        );
        let plans = self
            .inner
            .order
            .iter()
            .filter_map(|tier| {
                let revision = release.get(tier)?;
                let ctrl = self.inner.controllers.get(tier)?;
                Some(ctrl.plan(&format!("{id}/{tier}"), revision.clone()))
            })
            .collect();
        let run = PipelineRun {
            id: id.clone(),
            release,
            plans,
            status: RunStatus::Running,
            reason: None,
            created_at: epoch_secs(),
            finished_at: None,
        };
        self.persist(&run);

        let (state, _) = watch::channel(run.clone());
        let (cancel, cancel_rx) = watch::channel(false);
        self.runs_write()
            .insert(id.clone(), RunHandle { state, cancel });

        info!(run = %id, tiers = run.plans.len(), "pipeline run submitted");
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(run, cancel_rx, guard).await;
        });
        Ok(id)
    }

    /// Snapshot of a run.
    pub fn status(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs_read()
            .get(run_id)
            .map(|h| h.state.borrow().clone())
    }

    /// Every known run, oldest first.
    pub fn list_runs(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .runs_read()
            .values()
            .map(|h| h.state.borrow().clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    /// The run currently holding the pipeline, if any.
    pub fn active_run(&self) -> Option<RunId> {
        self.runs_read()
            .values()
            .map(|h| h.state.borrow().clone())
            .find(|r| r.status == RunStatus::Running)
            .map(|r| r.id)
    }

    /// Ask an active run to stop. The tier being rolled is rolled back and
    /// the run ends `failed`.
    pub fn abort(&self, run_id: &str) -> PipelineResult<()> {
        let runs = self.runs_read();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))?;
        if handle.state.borrow().status.is_terminal() {
            return Err(PipelineError::NotActive(run_id.to_string()));
        }
        handle.cancel.send_replace(true);
        info!(run = %run_id, "pipeline run abort requested");
        Ok(())
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, run_id: &str) -> PipelineResult<PipelineRun> {
        let mut rx = self
            .runs_read()
            .get(run_id)
            .map(|h| h.state.subscribe())
            .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))?;
        let done = rx
            .wait_for(|r| r.status.is_terminal())
            .await
            .map(|run| (*run).clone());
        match done {
            Ok(run) => Ok(run),
            Err(_) => Ok(rx.borrow().clone()),
        }
    }

    fn persist(&self, run: &PipelineRun) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.put_run(run) {
                error!(run = %run.id, error = %e, "failed to persist pipeline run");
            }
        }
    }

    fn publish(&self, run: &PipelineRun) {
        self.persist(run);
        if let Some(handle) = self.runs_read().get(&run.id) {
            handle.state.send_replace(run.clone());
        }
    }

    async fn execute(
        &self,
        mut run: PipelineRun,
        cancel: watch::Receiver<bool>,
        guard: OwnedMutexGuard<()>,
    ) {
        let (status, reason) = self.run_steps(&mut run, cancel).await;
        // Free the pipeline before waiters can observe the terminal status.
        drop(guard);
        self.conclude(&mut run, status, reason);
    }

    /// Roll each tier in order. Returns the run's terminal status.
    async fn run_steps(
        &self,
        run: &mut PipelineRun,
        mut cancel: watch::Receiver<bool>,
    ) -> (RunStatus, Option<String>) {
        for index in 0..run.plans.len() {
            let tier = run.plans[index].tier.clone();
            if is_cancelled(&cancel) {
                return (RunStatus::Failed, Some(format!("aborted before tier {tier}")));
            }
            let Some(ctrl) = self.inner.controllers.get(&tier) else {
                return (RunStatus::Failed, Some(format!("no controller for tier {tier}")));
            };

            let pending = run.plans[index].clone();
            run.plans[index].begin();
            self.publish(run);
            info!(run = %run.id, tier = %tier, target = %pending.target.artifact, "deploying tier");

            let mut retry = 0;
            let outcome = loop {
                match ctrl.deploy(pending.clone(), cancel.clone()).await {
                    Ok(done) => break Ok(done),
                    Err(e) if e.is_transient() && retry < self.inner.retry.max_retries => {
                        retry += 1;
                        let delay = self.inner.retry.backoff(retry);
                        warn!(
                            run = %run.id,
                            tier = %tier,
                            retry,
                            max_retries = self.inner.retry.max_retries,
                            delay = ?delay,
                            error = %e,
                            "transient step failure, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancelled(&mut cancel) => break Err("aborted".to_string()),
                        }
                    }
                    Err(e) if retry > 0 => break Err(format!("{e} (after {retry} retries)")),
                    Err(e) => break Err(e.to_string()),
                }
            };

            match outcome {
                Ok(done) => {
                    let status = done.status;
                    let reason = done.reason.clone();
                    run.plans[index] = done;
                    if status != PlanStatus::Succeeded {
                        let reason = format!(
                            "tier {tier}: plan {status:?}{}",
                            reason.map(|r| format!(": {r}")).unwrap_or_default()
                        );
                        return (RunStatus::Failed, Some(reason));
                    }
                    self.publish(run);
                }
                Err(reason) => {
                    run.plans[index].finish(PlanStatus::Failed, Some(reason.clone()));
                    return (RunStatus::Failed, Some(format!("tier {tier}: {reason}")));
                }
            }
        }

        (RunStatus::Succeeded, None)
    }

    fn conclude(&self, run: &mut PipelineRun, status: RunStatus, reason: Option<String>) {
        run.finish(status, reason);
        match status {
            RunStatus::Succeeded => info!(run = %run.id, "pipeline run succeeded"),
            _ => warn!(run = %run.id, reason = run.reason.as_deref().unwrap_or(""), "pipeline run failed"),
        }
        self.publish(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use shiftgrid_health::{HealthRegistry, ProbeSettings};
    use shiftgrid_rollout::testing::{Behavior, FakeProvisioner, ProvisionCall};
    use shiftgrid_rollout::{ProvisionError, RollingConfig};
    use shiftgrid_routing::TrafficRouter;
    use shiftgrid_state::{InstanceSlot, Lifecycle};

    const TIERS: [&str; 3] = ["api", "web", "edge"];

    struct Harness {
        provisioner: Arc<FakeProvisioner>,
        pipeline: PipelineController,
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        }
    }

    async fn harness(retry: RetryPolicy, store: Option<StateStore>) -> Harness {
        let registry = HealthRegistry::new(ProbeSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            success_threshold: 1,
            failure_threshold: 3,
        });
        let provisioner = Arc::new(FakeProvisioner::new());
        let mut controllers = Vec::new();
        for tier in TIERS {
            let router = Arc::new(TrafficRouter::new(tier, registry.clone()));
            let ctrl = DeploymentController::new(
                tier,
                registry.clone(),
                Arc::clone(&router),
                provisioner.clone(),
                RollingConfig {
                    batch_size: 1,
                    max_unavailable: 1,
                    startup_timeout: Duration::from_secs(30),
                    startup_retries: 1,
                    drain_timeout: Duration::from_secs(5),
                },
                None,
            );
            let v1 = Revision::new(tier, &format!("{tier}:v1"));
            for i in 1..=2 {
                let slot = InstanceSlot::new(&format!("{tier}-v1-{i}"), v1.clone(), Lifecycle::Active);
                ctrl.adopt(slot, FakeProvisioner::healthy_probe());
            }
            router.await_min(2, Duration::from_secs(5)).await.unwrap();
            controllers.push(ctrl);
        }

        let order = TIERS.iter().map(|t| t.to_string()).collect();
        let pipeline = PipelineController::new(order, controllers, retry, store).unwrap();
        Harness {
            provisioner,
            pipeline,
        }
    }

    fn release(artifact_suffix: &str) -> BTreeMap<TierId, Revision> {
        TIERS
            .iter()
            .map(|t| (t.to_string(), Revision::new(t, &format!("{t}:{artifact_suffix}"))))
            .collect()
    }

    fn artifacts(h: &Harness, tier: &str) -> Vec<String> {
        h.pipeline
            .controller(tier)
            .unwrap()
            .slots()
            .into_iter()
            .map(|s| s.revision.artifact)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tiers_deploy_in_dependency_order() {
        let h = harness(policy(0), None).await;
        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.plans.iter().all(|p| p.status == PlanStatus::Succeeded));

        let started_tiers: Vec<String> = h
            .provisioner
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ProvisionCall::Start { artifact, .. } => artifact.split(':').next().map(String::from),
                _ => None,
            })
            .collect();
        let mut seen: Vec<String> = Vec::new();
        for tier in started_tiers {
            if seen.last() != Some(&tier) {
                seen.push(tier);
            }
        }
        assert_eq!(seen, vec!["api", "web", "edge"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tier_stops_run_without_compensation() {
        let h = harness(policy(0), None).await;
        h.provisioner.set_behavior("web:v2", Behavior::Unhealthy);

        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.reason.as_deref().unwrap().contains("tier web"));
        assert_eq!(run.plan_for("api").unwrap().status, PlanStatus::Succeeded);
        assert_eq!(run.plan_for("web").unwrap().status, PlanStatus::RolledBack);
        assert_eq!(run.plan_for("edge").unwrap().status, PlanStatus::Pending);

        assert!(artifacts(&h, "api").iter().all(|a| a == "api:v2"));
        assert!(artifacts(&h, "web").iter().all(|a| a == "web:v1"));
        assert!(artifacts(&h, "edge").iter().all(|a| a == "edge:v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_release_conflicts_while_active() {
        let h = harness(policy(0), None).await;
        h.provisioner.set_start_delay(Duration::from_secs(5));

        let first = h.pipeline.submit_release(release("v2")).unwrap();
        assert!(matches!(
            h.pipeline.submit_release(release("v3")),
            Err(PipelineError::Conflict)
        ));
        assert_eq!(h.pipeline.active_run().as_deref(), Some(first.as_str()));

        let run = h.pipeline.wait(&first).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let second = h.pipeline.submit_release(release("v3")).unwrap();
        assert_eq!(
            h.pipeline.wait(&second).await.unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_run_frees_the_pipeline_for_its_waiters() {
        let h = harness(policy(0), None).await;
        let mut run_id = h
            .pipeline
            .submit_release([("api".to_string(), Revision::new("api", "api:v2"))].into())
            .unwrap();
        for n in 3..8 {
            let run = h.pipeline.wait(&run_id).await.unwrap();
            assert_eq!(run.status, RunStatus::Succeeded);
            // Resubmit the instant the previous run is seen finished.
            let next = Revision::new("api", &format!("api:v{n}"));
            run_id = h
                .pipeline
                .submit_release([("api".to_string(), next)].into())
                .unwrap();
        }
        let last = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(last.status, RunStatus::Succeeded);
        assert!(artifacts(&h, "api").iter().all(|a| a == "api:v7"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_prepare_failures_are_retried() {
        let h = harness(policy(3), None).await;
        for _ in 0..2 {
            h.provisioner
                .fail_next_prepare(ProvisionError::Transient("registry timeout".into()));
        }

        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let api_prepares = h
            .provisioner
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ProvisionCall::Prepare { artifact } if artifact == "api:v2"))
            .count();
        assert_eq!(api_prepares, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let h = harness(policy(2), None).await;
        for _ in 0..5 {
            h.provisioner
                .fail_next_prepare(ProvisionError::Transient("registry timeout".into()));
        }

        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.reason.as_deref().unwrap().contains("after 2 retries"));
        assert_eq!(run.plan_for("api").unwrap().status, PlanStatus::Failed);
        assert_eq!(run.plan_for("web").unwrap().status, PlanStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_prepare_failure_is_not_retried() {
        let h = harness(policy(3), None).await;
        h.provisioner
            .fail_next_prepare(ProvisionError::Fatal("unknown artifact".into()));

        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let prepares = h
            .provisioner
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ProvisionCall::Prepare { .. }))
            .count();
        assert_eq!(prepares, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_rolls_back_current_tier_and_fails_run() {
        let h = harness(policy(0), None).await;
        h.provisioner.set_start_delay(Duration::from_secs(5));

        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.pipeline.abort(&run_id).unwrap();

        let run = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.reason.as_deref().unwrap().contains("aborted"));
        assert_eq!(run.plan_for("api").unwrap().status, PlanStatus::RolledBack);
        assert!(artifacts(&h, "api").iter().all(|a| a == "api:v1"));

        assert!(matches!(
            h.pipeline.abort(&run_id),
            Err(PipelineError::NotActive(_))
        ));
        assert!(matches!(
            h.pipeline.abort("run-missing"),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_releases_are_rejected() {
        let h = harness(policy(0), None).await;
        assert!(matches!(
            h.pipeline.submit_release(BTreeMap::new()),
            Err(PipelineError::EmptyRelease)
        ));

        let mut unknown = BTreeMap::new();
        unknown.insert("db".to_string(), Revision::new("db", "db:v2"));
        assert!(matches!(
            h.pipeline.submit_release(unknown),
            Err(PipelineError::UnknownTier(_))
        ));

        let mut crossed = BTreeMap::new();
        crossed.insert("api".to_string(), Revision::new("web", "web:v2"));
        assert!(matches!(
            h.pipeline.submit_release(crossed),
            Err(PipelineError::TierMismatch { .. })
        ));
        assert!(h.pipeline.list_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_release_only_touches_named_tiers() {
        let h = harness(policy(0), None).await;
        let mut only_web = BTreeMap::new();
        only_web.insert("web".to_string(), Revision::new("web", "web:v2"));

        let run_id = h.pipeline.submit_release(only_web).unwrap();
        let run = h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.plans.len(), 1);
        assert!(artifacts(&h, "api").iter().all(|a| a == "api:v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_are_persisted_and_restart_marks_interrupted() {
        let store = StateStore::open_in_memory().unwrap();
        let h = harness(policy(0), Some(store.clone())).await;
        let run_id = h.pipeline.submit_release(release("v2")).unwrap();
        h.pipeline.wait(&run_id).await.unwrap();
        assert_eq!(store.get_run(&run_id).unwrap().unwrap().status, RunStatus::Succeeded);

        let mut stale = store.get_run(&run_id).unwrap().unwrap();
        stale.id = "run-stale".into();
        stale.status = RunStatus::Running;
        stale.finished_at = None;
        store.put_run(&stale).unwrap();

        let restarted = harness(policy(0), Some(store.clone())).await;
        let run = restarted.pipeline.status("run-stale").unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some(INTERRUPTED));
        assert_eq!(restarted.pipeline.list_runs().len(), 2);
        assert!(restarted.pipeline.active_run().is_none());
    }
}
