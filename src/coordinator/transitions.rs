/// Coordinator state transitions
///
/// Each transition consumes the coordinator in one state and returns it in the
/// next, so the setup sequence cannot be reordered or repeated.
use super::shutdown::ShutdownMonitor;
use super::states::*;
use super::visit::{SerialStage, StageLoop, VisitEnd};
use super::Pipeline;
use crate::barrier::{self, Checkpoint, SyncPoint};
use crate::config::{ExecutionMode, PipelineConfig};
use crate::error::HarnessResult;
use crate::events::{EventBroker, ExitEvent, ShutdownLevel};
use crate::pipeline::{
    QueueChain, Rank, ReportLog, RunSummary, SliceSummary, StageContext, StageId, StageRegistry,
    StopReason,
};
use crate::slice;
use crate::value::PropertySet;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Unconfigured State Transitions
// ============================================================================

impl Pipeline<Unconfigured> {
    /// Create a coordinator with a fresh run id
    pub fn new(
        config: PipelineConfig,
        registry: StageRegistry,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config: Arc::new(config),
            registry: Arc::new(registry),
            broker,
            state: Unconfigured,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Validate the policy and subscribe to the shutdown topic
    pub fn configure(self) -> HarnessResult<Pipeline<Configured>> {
        self.config.validate()?;
        self.registry.check(&self.config)?;

        let receiver = self.broker.subscribe(&self.config.shutdown_topic)?;
        let shutdown = ShutdownMonitor::new(
            receiver,
            self.run_id.as_str(),
            self.config.shutdown_poll(),
            self.config.hard_kill,
        );

        tracing::info!(
            "Configured pipeline '{}' (run: {}, slices: {}, stages: {})",
            self.config.name,
            self.run_id,
            self.config.n_slices,
            self.config.stage_count()
        );
        Ok(self.advance(|_| Configured { shutdown }))
    }
}

// ============================================================================
// Configured State Transitions
// ============================================================================

impl Pipeline<Configured> {
    /// Allocate one queue more than there are stages
    pub fn init_queues(self) -> Pipeline<QueuesReady> {
        let queues = QueueChain::new(self.config.stage_count());
        tracing::debug!("Initialized {} queues", queues.len());

        self.advance(|Configured { shutdown }| QueuesReady { shutdown, queues })
    }
}

// ============================================================================
// QueuesReady State Transitions
// ============================================================================

impl Pipeline<QueuesReady> {
    /// Build the serial halves and subscribe to every stage topic
    pub fn init_stages(self) -> HarnessResult<Pipeline<StagesReady>> {
        let mut stages = Vec::with_capacity(self.config.stage_count());

        for (index, stage_config) in self.config.app_stages.iter().enumerate() {
            let id = index + 1;
            let ctx = self.stage_context(
                &stage_config.name,
                StageId::Sequence(id),
                &stage_config.stage_policy,
            );
            let half = self
                .registry
                .create_serial(stage_config.serial_class.as_deref(), &ctx)?;

            let topic = stage_config.event_topic().map(str::to_string);
            let receiver = match &topic {
                Some(topic) => Some(self.broker.subscribe(topic)?),
                None => None,
            };

            tracing::debug!(
                "Stage {} '{}' ready (serial: {:?}, topic: {:?})",
                id,
                stage_config.name,
                stage_config.serial_class,
                topic
            );
            stages.push(SerialStage {
                id,
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
                    .create_serial(failure_config.serial_class.as_deref(), &ctx)?;
                Some(SerialStage {
                    id: 0,
                    name: failure_config.name.clone(),
                    topic: None,
                    receiver: None,
                    half,
                })
            }
            None => None,
        };

        Ok(self.advance(|QueuesReady { shutdown, queues }| StagesReady {
            shutdown,
            queues,
            stages,
            failure,
        }))
    }

    fn stage_context(&self, name: &str, stage_id: StageId, policy: &PropertySet) -> StageContext {
        StageContext::detached(policy.clone())
            .with_name(name)
            .with_stage_id(stage_id)
            .with_rank(Rank::Master)
            .with_run_id(self.run_id.as_str())
            .with_universe_size(self.config.universe_size())
            .with_broker(self.broker.clone())
    }
}

// ============================================================================
// StagesReady State Transitions
// ============================================================================

impl Pipeline<StagesReady> {
    /// Spawn one thread per slice and wait until all of them are set up
    pub fn start_slices(self) -> HarnessResult<Pipeline<SlicesStarted>> {
        let n_slices = self.config.n_slices;
        let (link, slice_links) = barrier::links(n_slices, self.config.barrier_timeout());

        let mut handles = Vec::with_capacity(n_slices);
        for slice_link in slice_links {
            handles.push(slice::spawn(
                slice_link,
                self.run_id.clone(),
                self.config.clone(),
                self.registry.clone(),
                self.broker.clone(),
            )?);
        }

        link.rendezvous(Checkpoint::new(0, 0, SyncPoint::Startup))?;
        tracing::info!("Started {} slices (run: {})", n_slices, self.run_id);

        let run_id = self.run_id.clone();
        let config = self.config.clone();
        let broker = self.broker.clone();
        Ok(self.advance(|state| {
            let StagesReady {
                shutdown,
                queues,
                stages,
                failure,
            } = state;
            let stage_loop = StageLoop {
                run_id,
                config,
                broker,
                queues,
                stages,
                failure,
            };
            SlicesStarted {
                runtime: Runtime {
                    shutdown,
                    stage_loop,
                    link,
                    slices: handles,
                },
            }
        }))
    }
}

// ============================================================================
// SlicesStarted State Transitions
// ============================================================================

impl Pipeline<SlicesStarted> {
    pub fn start_loop(self) -> Pipeline<Looping> {
        let reports = ReportLog::new(self.config.report_history);
        self.advance(|SlicesStarted { runtime }| Looping {
            runtime,
            reports,
            visits: 0,
        })
    }
}

// ============================================================================
// Looping State Transitions
// ============================================================================

impl Pipeline<Looping> {
    /// Run visits until oneloop mode is done or a shutdown is requested
    ///
    /// Coordination failures end the run with an error; the slices are told to
    /// terminate and otherwise see the coordinator disconnect.
    pub fn run(mut self) -> HarnessResult<Pipeline<ShuttingDown>> {
        let stop_reason = loop {
            let runtime = &mut self.state.runtime;

            if let Some(reason) = stop_reason_for(runtime.shutdown.requested()) {
                break reason;
            }
            if self.config.execution_mode == ExecutionMode::OneLoop && self.state.visits >= 1 {
                break StopReason::OneLoopComplete;
            }
            if let Some(reason) = stop_reason_for(runtime.shutdown.poll()?) {
                break reason;
            }

            let visit = self.state.visits + 1;
            let end = runtime
                .stage_loop
                .run_visit(&runtime.link, &mut runtime.shutdown, visit);
            match end {
                Ok(VisitEnd::Completed(report)) => {
                    self.state.visits = visit;
                    self.state.reports.push(report);
                }
                Ok(VisitEnd::Abandoned) => break StopReason::HardKill,
                Err(e) => {
                    tracing::error!("Visit {} aborted (run: {}): {}", visit, self.run_id, e);
                    runtime.link.terminate();
                    return Err(e);
                }
            }
        };

        tracing::info!(
            "Leaving visit loop after {} visits: {:?} (run: {})",
            self.state.visits,
            stop_reason,
            self.run_id
        );

        Ok(self.advance(
            |Looping {
                 runtime,
                 reports,
                 visits,
             }| ShuttingDown {
                runtime,
                reports,
                visits,
                stop_reason,
            },
        ))
    }
}

fn stop_reason_for(level: Option<ShutdownLevel>) -> Option<StopReason> {
    match level {
        None => None,
        Some(ShutdownLevel::Immediate) => Some(StopReason::HardKill),
        Some(level) => Some(StopReason::ShutdownRequested {
            level: level as i64,
        }),
    }
}

// ============================================================================
// ShuttingDown State Transitions
// ============================================================================

impl Pipeline<ShuttingDown> {
    /// Stop the slices, announce the exit and collect the run summary
    pub fn shutdown(mut self) -> HarnessResult<Pipeline<Terminated>> {
        let runtime = &mut self.state.runtime;
        runtime.link.terminate();

        if let Some(topic) = &self.config.exit_topic {
            let payload = ExitEvent::new(&self.run_id).to_payload()?;
            match self.broker.publish(topic, payload) {
                Ok(()) => tracing::info!("Published exit event on '{}'", topic),
                Err(e) => tracing::warn!("Could not publish exit event on '{}': {}", topic, e),
            }
        }

        let slices: Vec<SliceSummary> = runtime
            .slices
            .drain(..)
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| SliceSummary {
                    rank,
                    visits_completed: 0,
                    reports: Vec::new(),
                    error: Some(format!("slice {} thread panicked", rank)),
                })
            })
            .collect();

        for summary in slices.iter().filter(|s| s.error.is_some()) {
            tracing::warn!(
                "Slice {} ended with an error: {}",
                summary.rank,
                summary.error.as_deref().unwrap_or_default()
            );
        }

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            pipeline_name: self.config.name.clone(),
            visits_completed: self.state.visits,
            stop_reason: self.state.stop_reason.clone(),
            reports: self.state.reports.to_vec(),
            slices,
        };
        tracing::info!(
            "Pipeline '{}' terminated after {} visits (run: {})",
            summary.pipeline_name,
            summary.visits_completed,
            summary.run_id
        );

        // Dropping the old state releases the coordination channels
        Ok(self.advance(|_| Terminated { summary }))
    }
}

// ============================================================================
// Terminated State
// ============================================================================

impl Pipeline<Terminated> {
    pub fn summary(&self) -> &RunSummary {
        &self.state.summary
    }

    pub fn into_summary(self) -> RunSummary {
        self.state.summary
    }
}
