//! Worker pool: evaluates the selected instances with at most `max_workers`
//! in flight.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::errors::{HarnessResult, ReportError};
use crate::domain::models::{Config, Prediction, RunManifest, TaskInstance, VerdictKind};
use crate::domain::ports::{EnvironmentProvider, ReportStore};
use crate::services::evaluator::{Evaluator, InstanceOutcome};
use crate::services::instance_selector::{PredictionSet, Selection};
use crate::services::retry::RetryPolicy;
use crate::services::run_state::{RunEvent, RunState, RunStats};

/// One instance to evaluate together with its prediction.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub instance: TaskInstance,
    pub prediction: Prediction,
}

/// Everything a run needs, resolved before dispatch.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: String,
    pub dataset: String,
    pub split: String,
    pub work: Vec<WorkItem>,
    pub rewrite_reports: bool,
    pub retry_infra_errors: bool,
}

impl RunPlan {
    /// Pair every selected instance with its prediction, in selection order.
    pub fn new(
        run_id: impl Into<String>,
        dataset: impl Into<String>,
        split: impl Into<String>,
        instances: &[TaskInstance],
        predictions: &PredictionSet,
        selection: &Selection,
    ) -> Self {
        let by_id: HashMap<&str, &TaskInstance> = instances
            .iter()
            .map(|i| (i.instance_id.as_str(), i))
            .collect();
        let work = selection
            .selected
            .iter()
            .filter_map(|id| {
                let instance = by_id.get(id.as_str())?;
                let prediction = predictions.get(id)?;
                Some(WorkItem {
                    instance: (*instance).clone(),
                    prediction: prediction.clone(),
                })
            })
            .collect();
        Self {
            run_id: run_id.into(),
            dataset: dataset.into(),
            split: split.into(),
            work,
            rewrite_reports: false,
            retry_infra_errors: false,
        }
    }

    pub fn with_rewrite_reports(mut self, rewrite: bool) -> Self {
        self.rewrite_reports = rewrite;
        self
    }

    pub fn with_retry_infra_errors(mut self, retry: bool) -> Self {
        self.retry_infra_errors = retry;
        self
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.work.iter().map(|w| w.instance.instance_id.clone()).collect()
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub stats: RunStats,
    /// Outcomes of instances evaluated by this invocation, in completion order.
    pub outcomes: Vec<InstanceOutcome>,
    /// Instances skipped because a verdict already existed.
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

/// Bounded worker pool over an [`Evaluator`].
pub struct Scheduler {
    evaluator: Arc<Evaluator>,
    store: Arc<dyn ReportStore>,
    max_workers: usize,
}

impl Scheduler {
    pub fn new(evaluator: Arc<Evaluator>, store: Arc<dyn ReportStore>, max_workers: usize) -> Self {
        Self {
            evaluator,
            store,
            max_workers: max_workers.max(1),
        }
    }

    pub fn from_config(
        provider: Arc<dyn EnvironmentProvider>,
        store: Arc<dyn ReportStore>,
        config: &Config,
    ) -> Self {
        let evaluator = Evaluator::new(
            provider,
            Arc::clone(&store),
            RetryPolicy::from_config(&config.retry),
            &config.evaluation,
        );
        Self::new(Arc::new(evaluator), store, config.max_workers)
    }

    /// Execute `plan`.
    ///
    /// Instances already reported are skipped unless the plan asks for a
    /// rewrite. `cancel` stops dispatch; in-flight instances finish their
    /// current phase and release their environment. A report store failure
    /// stops dispatch the same way and is returned once work has drained.
    #[instrument(skip_all, fields(run_id = %plan.run_id, selected = plan.work.len()))]
    pub async fn run(
        &self,
        plan: RunPlan,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> HarnessResult<RunOutcome> {
        let manifest = RunManifest::new(&plan.run_id, &plan.dataset, &plan.split, plan.instance_ids());
        self.store.prepare_run(&manifest, plan.rewrite_reports).await?;

        let (to_run, skipped) = self.partition(&plan).await?;

        let mut state = RunState::new(&plan.run_id, self.max_workers);
        if let Some(tx) = events {
            state = state.with_events(tx);
        }
        let state = Arc::new(state);
        let ids: Vec<String> = to_run.iter().map(|w| w.instance.instance_id.clone()).collect();
        state.enqueue(&ids).await;
        state.mark_skipped(skipped.len()).await;
        state
            .emit(RunEvent::Started {
                run_id: plan.run_id.clone(),
                to_evaluate: to_run.len(),
                skipped: skipped.len(),
            })
            .await;
        info!(
            to_evaluate = to_run.len(),
            skipped = skipped.len(),
            max_workers = self.max_workers,
            "starting run"
        );

        let run_cancel = cancel.child_token();
        let mut tasks: JoinSet<Result<InstanceOutcome, ReportError>> = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut fatal: Option<ReportError> = None;

        for item in to_run {
            let instance_id = item.instance.instance_id.clone();
            let slot = tokio::select! {
                biased;
                () = run_cancel.cancelled() => break,
                slot = state.acquire_slot(&instance_id) => slot?,
            };

            let evaluator = Arc::clone(&self.evaluator);
            let task_state = Arc::clone(&state);
            let task_cancel = run_cancel.clone();
            tasks.spawn(async move {
                let outcome = evaluator
                    .evaluate(&task_state, &item.instance, &item.prediction, &task_cancel)
                    .await;
                task_state.release_slot(slot);
                outcome
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(joined, &run_cancel, &mut outcomes, &mut fatal);
            }
        }

        if run_cancel.is_cancelled() {
            state.emit(RunEvent::Cancelling).await;
            info!(in_flight = tasks.len(), "dispatch stopped, draining in-flight instances");
        }
        while let Some(joined) = tasks.join_next().await {
            collect(joined, &run_cancel, &mut outcomes, &mut fatal);
        }
        state.close();

        let stats = state.stats().await;
        state.emit(RunEvent::Completed(stats.clone())).await;

        if let Some(err) = fatal {
            error!(error = %err, "run aborted by reporting failure");
            return Err(err.into());
        }

        info!(
            done = stats.done,
            failed = stats.failed,
            cancelled = stats.cancelled,
            peak_active = stats.peak_active,
            "run finished"
        );
        Ok(RunOutcome {
            run_id: plan.run_id,
            stats,
            outcomes,
            skipped,
            cancelled: cancel.is_cancelled(),
        })
    }

    /// Split the plan into work to do and instances already reported.
    async fn partition(&self, plan: &RunPlan) -> Result<(Vec<WorkItem>, Vec<String>), ReportError> {
        if plan.rewrite_reports {
            return Ok((plan.work.clone(), Vec::new()));
        }

        let mut to_run = Vec::new();
        let mut skipped = Vec::new();
        for item in &plan.work {
            let id = &item.instance.instance_id;
            if !self.store.has_report(&plan.run_id, id).await? {
                to_run.push(item.clone());
                continue;
            }
            let rerun = plan.retry_infra_errors
                && self
                    .store
                    .read(&plan.run_id, id)
                    .await?
                    .is_some_and(|v| v.kind == VerdictKind::InfraError);
            if rerun {
                info!(instance_id = %id, "re-evaluating previous infra_error");
                to_run.push(item.clone());
            } else {
                skipped.push(id.clone());
            }
        }
        Ok((to_run, skipped))
    }
}

fn collect(
    joined: Result<Result<InstanceOutcome, ReportError>, tokio::task::JoinError>,
    run_cancel: &CancellationToken,
    outcomes: &mut Vec<InstanceOutcome>,
    fatal: &mut Option<ReportError>,
) {
    match joined {
        Ok(Ok(outcome)) => outcomes.push(outcome),
        Ok(Err(err)) => {
            error!(error = %err, "report store failure, stopping dispatch");
            run_cancel.cancel();
            fatal.get_or_insert(err);
        }
        Err(join_err) => {
            warn!(error = %join_err, "evaluation task died outside the pipeline");
        }
    }
}
