/// Slice state transitions
use super::states::*;
use super::visit::{ParallelStage, StageLoop};
use super::Slice;
use crate::barrier::{SliceLink, SyncPoint};
use crate::config::{ExecutionMode, PipelineConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::events::{slice_topic, EventBroker};
use crate::pipeline::{
    QueueChain, Rank, ReportLog, SliceSummary, StageContext, StageId, StageRegistry,
};
use crate::value::PropertySet;
use std::sync::Arc;

// ============================================================================
// Unconfigured State Transitions
// ============================================================================

impl Slice<Unconfigured> {
    pub fn new(
        link: SliceLink,
        run_id: String,
        config: Arc<PipelineConfig>,
        registry: Arc<StageRegistry>,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        Self {
            rank: link.rank(),
            run_id,
            config,
            registry,
            broker,
            link,
            state: Unconfigured,
        }
    }

    /// Open the logging span every later message of this slice is recorded in
    pub fn init_logger(self) -> Slice<LoggerReady> {
        let span = tracing::info_span!("slice", rank = self.rank, run_id = %self.run_id);
        self.advance(|_| LoggerReady { span })
    }
}

// ============================================================================
// LoggerReady State Transitions
// ============================================================================

impl Slice<LoggerReady> {
    pub fn configure(self) -> HarnessResult<Slice<Configured>> {
        if self.rank >= self.config.n_slices {
            return Err(HarnessError::Configuration(format!(
                "Slice rank {} outside a pipeline of {} slices",
                self.rank, self.config.n_slices
            )));
        }
        tracing::debug!(
            "Slice {} configured for pipeline '{}'",
            self.rank,
            self.config.name
        );
        Ok(self.advance(|LoggerReady { span }| Configured { span }))
    }
}

// ============================================================================
// Configured State Transitions
// ============================================================================

impl Slice<Configured> {
    pub fn init_queues(self) -> Slice<QueuesReady> {
        let queues = QueueChain::new(self.config.stage_count());
        self.advance(|Configured { span }| QueuesReady { span, queues })
    }
}

// ============================================================================
// QueuesReady State Transitions
// ============================================================================

impl Slice<QueuesReady> {
    /// Build this slice's parallel halves and subscribe to the slice topics
    pub fn init_stages(self) -> HarnessResult<Slice<StagesReady>> {
        let mut stages = Vec::with_capacity(self.config.stage_count());

        for (index, stage_config) in self.config.app_stages.iter().enumerate() {
            let ctx = self.stage_context(
                &stage_config.name,
                StageId::Sequence(index + 1),
                &stage_config.stage_policy,
            );
            let half = self
                .registry
                .create_parallel(stage_config.parallel_class.as_deref(), &ctx)?;

            let topic = stage_config.event_topic().map(str::to_string);
            let receiver = match &topic {
                Some(topic) => {
                    Some(self.broker.subscribe(&slice_topic(topic, &self.config.name))?)
                }
                None => None,
            };

            stages.push(ParallelStage {
                name: stage_config.name.clone(),
                topic,
                receiver,
                half,
            });
        }

        let failure = match &self.config.failure_stage {
            Some(failure_config) => {
                let ctx = self.stage_context(
                    &failure_config.name,
                    StageId::Detached,
                    &failure_config.stage_policy,
                );
                let half = self
                    .registry
                    .create_parallel(failure_config.parallel_class.as_deref(), &ctx)?;
                Some(ParallelStage {
                    name: failure_config.name.clone(),
                    topic: None,
                    receiver: None,
                    half,
                })
            }
            None => None,
        };

        tracing::debug!("Slice {} built {} stages", self.rank, stages.len());
        Ok(self.advance(|QueuesReady { span, queues }| StagesReady {
            span,
            queues,
            stages,
            failure,
        }))
    }

    fn stage_context(&self, name: &str, stage_id: StageId, policy: &PropertySet) -> StageContext {
        StageContext::detached(policy.clone())
            .with_name(name)
            .with_stage_id(stage_id)
            .with_rank(Rank::Slice(self.rank))
            .with_run_id(self.run_id.as_str())
            .with_universe_size(self.config.universe_size())
            .with_broker(self.broker.clone())
    }
}

// ============================================================================
// StagesReady State Transitions
// ============================================================================

impl Slice<StagesReady> {
    /// Report ready at the startup barrier
    pub fn start_loop(self) -> HarnessResult<Slice<Looping>> {
        if self.link.sync(0, 0, SyncPoint::Startup)?.is_none() {
            return Err(HarnessError::Internal(format!(
                "Slice {} terminated before startup",
                self.rank
            )));
        }

        let stage_loop_parts = (self.rank, self.run_id.clone(), self.config.clone());
        let reports = ReportLog::new(self.config.report_history);
        Ok(self.advance(|state| {
            let StagesReady {
                span,
                queues,
                stages,
                failure,
            } = state;
            let (rank, run_id, config) = stage_loop_parts;
            Looping {
                span,
                stage_loop: StageLoop {
                    rank,
                    run_id,
                    config,
                    queues,
                    stages,
                    failure,
                },
                reports,
                visits: 0,
            }
        }))
    }
}

// ============================================================================
// Looping State Transitions
// ============================================================================

impl Slice<Looping> {
    /// Run visits until terminated, or after one visit in oneloop mode
    ///
    /// Coordination errors end the loop and are recorded in the summary.
    pub fn run(mut self) -> Slice<Terminated> {
        let oneloop = self.config.execution_mode == ExecutionMode::OneLoop;

        let error = loop {
            let visit = self.state.visits + 1;
            match self.link.sync(visit, 0, SyncPoint::VisitStart) {
                Ok(Some(_)) => {}
                Ok(None) => break None,
                Err(e) => break Some(e),
            }

            match self.state.stage_loop.run_visit(&self.link, visit) {
                Ok(Some(report)) => {
                    self.state.visits = visit;
                    self.state.reports.push(report);
                }
                Ok(None) => break None,
                Err(e) => break Some(e),
            }

            if oneloop {
                break None;
            }
        };

        if let Some(e) = &error {
            tracing::error!("Slice {} stopped: {}", self.rank, e);
        } else {
            tracing::debug!("Slice {} terminated after {} visits", self.rank, self.state.visits);
        }

        let summary = SliceSummary {
            rank: self.rank,
            visits_completed: self.state.visits,
            reports: self.state.reports.to_vec(),
            error: error.map(|e| e.to_string()),
        };
        self.advance(|_| Terminated { summary })
    }
}
