//! The coordinator's stage loop
//!
//! One visit runs every stage in order. Per stage the coordinator waits for the
//! stage event, runs the serial preprocess, lets the slices run the parallel
//! process, then runs the serial postprocess, meeting the slices at four barrier
//! points (stage start, preprocess done, process done, stage end).

use super::shutdown::ShutdownMonitor;
use crate::barrier::{Checkpoint, CoordinatorLink, SharedEntry, SyncPoint};
use crate::config::PipelineConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::{slice_topic, EventBroker, EventReceiver};
use crate::pipeline::core::guarded;
use crate::pipeline::stages::failure::record_failure;
use crate::pipeline::{
    Clipboard, Phase, QueueChain, Rank, SerialProcessing, StageOutcome, VisitReport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serial half of one configured stage, as the coordinator holds it
pub(crate) struct SerialStage {
    pub(crate) id: usize,
    pub(crate) name: String,
    pub(crate) topic: Option<String>,
    pub(crate) receiver: Option<Box<dyn EventReceiver>>,
    pub(crate) half: Box<dyn SerialProcessing>,
}

/// Per-visit state threaded through the stage loop
#[derive(Debug)]
pub(crate) struct VisitState {
    pub(crate) visit: u64,
    pub(crate) error_flagged: bool,
    pub(crate) outcomes: Vec<StageOutcome>,
    started: Instant,
}

impl VisitState {
    pub(crate) fn new(visit: u64) -> Self {
        Self {
            visit,
            error_flagged: false,
            outcomes: Vec::new(),
            started: Instant::now(),
        }
    }

    fn into_report(self, final_keys: Vec<String>) -> VisitReport {
        VisitReport {
            visit: self.visit,
            error_flagged: self.error_flagged,
            stages: self.outcomes,
            final_keys,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// How a visit ended
pub(crate) enum VisitEnd {
    Completed(VisitReport),
    /// A level 1 shutdown arrived mid-visit
    Abandoned,
}

enum StageFlow {
    Continue,
    Abandon,
}

/// Where the stage's clipboard is between preprocess and postprocess
enum Interim {
    /// Preprocess succeeded; the coordinator holds the clipboard
    Ready(Clipboard),
    /// Preprocess failed; an empty clipboard already went to the output
    Failed { clipboard: Clipboard, message: String },
    /// The visit was flagged; the clipboard already went to the output
    PassedThrough,
}

/// Everything the coordinator needs to run visits
pub(crate) struct StageLoop {
    pub(crate) run_id: String,
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) broker: Arc<dyn EventBroker>,
    pub(crate) queues: QueueChain,
    pub(crate) stages: Vec<SerialStage>,
    pub(crate) failure: Option<SerialStage>,
}

impl StageLoop {
    /// Run one complete visit
    pub(crate) fn run_visit(
        &mut self,
        link: &CoordinatorLink,
        shutdown: &mut ShutdownMonitor,
        visit: u64,
    ) -> HarnessResult<VisitEnd> {
        let span = tracing::info_span!("visit", visit);
        let _entered = span.enter();

        link.rendezvous(Checkpoint::new(visit, 0, SyncPoint::VisitStart))?;

        self.queues.seed();
        let mut state = VisitState::new(visit);

        for index in 0..self.stages.len() {
            if let StageFlow::Abandon = self.run_stage(index, &mut state, link, shutdown)? {
                tracing::warn!("Abandoning visit {} at stage {}", visit, index + 1);
                return Ok(VisitEnd::Abandoned);
            }
        }

        let final_keys = match self.queues.drain_final() {
            Some(mut clipboard) => {
                let keys = clipboard.keys();
                clipboard.close();
                keys
            }
            None => {
                tracing::warn!("No clipboard reached the end of visit {}", visit);
                Vec::new()
            }
        };

        tracing::info!(
            "Visit {} complete (errorFlagged: {}, run: {})",
            visit,
            state.error_flagged,
            self.run_id
        );
        Ok(VisitEnd::Completed(state.into_report(final_keys)))
    }

    fn run_stage(
        &mut self,
        index: usize,
        state: &mut VisitState,
        link: &CoordinatorLink,
        shutdown: &mut ShutdownMonitor,
    ) -> HarnessResult<StageFlow> {
        let id = index + 1;
        let visit = state.visit;
        let span = tracing::debug_span!("stage", id, name = %self.stages[index].name);
        let _entered = span.enter();

        if shutdown.abandon_requested()? {
            return Ok(StageFlow::Abandon);
        }

        let event_published = self.handle_events(index, shutdown)?;
        if shutdown.abandon_requested()? {
            return Ok(StageFlow::Abandon);
        }

        link.rendezvous(Checkpoint::new(visit, id, SyncPoint::StageStart))?;

        let started = Instant::now();
        let mut interim = self.try_preprocess(index, state);

        link.rendezvous(
            Checkpoint::new(visit, id, SyncPoint::PreprocessDone)
                .flagged(state.error_flagged)
                .with_event(event_published),
        )?;

        if !state.error_flagged && self.config.shares_data(id) {
            if let Interim::Ready(clipboard) = &mut interim {
                share_round(link, visit, id, clipboard)?;
            }
        }

        let acks = link.rendezvous(Checkpoint::new(visit, id, SyncPoint::ProcessDone))?;
        let failed_ranks: Vec<usize> = acks
            .iter()
            .filter(|ack| ack.stage_failed)
            .map(|ack| ack.rank)
            .collect();

        let mut outcome = self.try_postprocess(index, interim, state, started);

        // Slice failures flag the visit from the next stage on, in every context
        if !failed_ranks.is_empty() {
            state.error_flagged = true;
            if !outcome.is_failed() {
                outcome = StageOutcome::failed(
                    id,
                    self.stages[index].name.as_str(),
                    Phase::Process,
                    format!("process failed in slices {:?}", failed_ranks),
                    started.elapsed(),
                );
            }
        }
        state.outcomes.push(outcome);

        link.rendezvous(Checkpoint::new(visit, id, SyncPoint::StageEnd))?;
        Ok(StageFlow::Continue)
    }

    /// Wait for the stage event and hand it on to the slices
    ///
    /// The payload lands on the stage's input clipboard even in a flagged visit,
    /// so the trigger data survives to the end of the visit. Returns whether an
    /// event was republished on the slice topic. Absence of an event within the
    /// timeout is not an error. A pending shutdown cuts the wait short.
    fn handle_events(
        &mut self,
        index: usize,
        shutdown: &mut ShutdownMonitor,
    ) -> HarnessResult<bool> {
        let id = index + 1;
        let stage = &self.stages[index];
        let (Some(topic), Some(receiver)) = (stage.topic.as_deref(), stage.receiver.as_ref())
        else {
            return Ok(false);
        };

        tracing::debug!("Waiting for event on topic '{}'", topic);
        let deadline = Instant::now() + self.config.event_timeout();
        let slice_wait = shutdown.poll_interval().max(Duration::from_millis(1));

        let payload = loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!("No event on topic '{}' before timeout; proceeding", topic);
                return Ok(false);
            }
            if let Some(payload) = receiver.receive((deadline - now).min(slice_wait))? {
                break payload;
            }
            if shutdown.check_now()?.is_some() {
                tracing::info!("Shutdown requested while waiting on topic '{}'", topic);
                return Ok(false);
            }
        };

        match self.queues.input(id).element_mut() {
            Some(clipboard) => clipboard.put(topic, payload.clone()),
            None => tracing::warn!("No input clipboard for event on topic '{}'", topic),
        }

        self.broker.publish(&slice_topic(topic, &self.config.name), payload)?;
        tracing::debug!("Republished event from '{}' for the slices", topic);
        Ok(true)
    }

    fn try_preprocess(&mut self, index: usize, state: &mut VisitState) -> Interim {
        let id = index + 1;
        if state.error_flagged {
            tracing::trace!("Skipping preprocess due to flagged error");
            self.queues.transfer(id);
            return Interim::PassedThrough;
        }

        let mut clipboard = self.take_input(id);
        let stage = &mut self.stages[index];
        match guarded(|| stage.half.preprocess(&mut clipboard)) {
            Ok(()) => Interim::Ready(clipboard),
            Err(e) => {
                state.error_flagged = true;
                self.stage_failed(index, Phase::Preprocess, &e);
                if self.record_for_failure_stage(index, &mut clipboard, &e) {
                    self.run_failure_stage(Phase::Preprocess, &mut clipboard);
                }
                self.queues.post_empty(id);
                Interim::Failed {
                    clipboard,
                    message: e.to_string(),
                }
            }
        }
    }

    fn try_postprocess(
        &mut self,
        index: usize,
        interim: Interim,
        state: &mut VisitState,
        started: Instant,
    ) -> StageOutcome {
        let id = index + 1;
        let name = self.stages[index].name.clone();

        match interim {
            Interim::PassedThrough => {
                tracing::trace!("Skipping postprocess due to flagged error");
                StageOutcome::passed_through(id, name)
            }
            Interim::Failed {
                mut clipboard,
                message,
            } => {
                self.run_failure_stage(Phase::Postprocess, &mut clipboard);
                clipboard.close();
                StageOutcome::failed(id, name, Phase::Preprocess, message, started.elapsed())
            }
            Interim::Ready(mut clipboard) => {
                let stage = &mut self.stages[index];
                match guarded(|| stage.half.postprocess(&mut clipboard)) {
                    Ok(()) => {
                        self.queues.output(id).add_dataset(clipboard);
                        StageOutcome::completed(id, name, started.elapsed())
                    }
                    Err(e) => {
                        state.error_flagged = true;
                        self.stage_failed(index, Phase::Postprocess, &e);
                        if self.record_for_failure_stage(index, &mut clipboard, &e) {
                            self.run_failure_stage(Phase::Postprocess, &mut clipboard);
                        }
                        clipboard.close();
                        self.queues.post_empty(id);
                        StageOutcome::failed(
                            id,
                            name,
                            Phase::Postprocess,
                            e.to_string(),
                            started.elapsed(),
                        )
                    }
                }
            }
        }
    }

    fn take_input(&mut self, id: usize) -> Clipboard {
        self.queues.input(id).get_next_dataset().unwrap_or_else(|| {
            tracing::warn!("Stage {} has no input clipboard; using an empty one", id);
            Clipboard::new()
        })
    }

    fn stage_failed(&self, index: usize, phase: Phase, error: &HarnessError) {
        let stage = &self.stages[index];
        tracing::error!(
            stage_id = stage.id,
            stage = %stage.name,
            run_id = %self.run_id,
            rank = %Rank::Master,
            "Stage {} failed in {}: {}",
            stage.name,
            phase,
            error
        );
    }

    /// Whether a failure stage is configured with a serial half that does something
    fn has_failure_stage(&self) -> bool {
        self.failure
            .as_ref()
            .map_or(false, |failure| !failure.half.is_noop())
    }

    /// Put the failure diagnostics on the clipboard when a failure stage will read them
    fn record_for_failure_stage(
        &self,
        index: usize,
        clipboard: &mut Clipboard,
        error: &HarnessError,
    ) -> bool {
        if !self.has_failure_stage() {
            return false;
        }
        let stage = &self.stages[index];
        record_failure(clipboard, &stage.name, stage.id, error);
        true
    }

    fn run_failure_stage(&mut self, phase: Phase, clipboard: &mut Clipboard) {
        if !self.has_failure_stage() {
            return;
        }
        let Some(failure) = self.failure.as_mut() else {
            return;
        };
        let result = guarded(|| match phase {
            Phase::Postprocess => failure.half.postprocess(clipboard),
            _ => failure.half.preprocess(clipboard),
        });
        if let Err(e) = result {
            tracing::error!(
                "Failure stage '{}' failed in {} (run: {}): {}",
                failure.name,
                phase,
                self.run_id,
                e
            );
        }
    }
}

/// Exchange shareable entries between the coordinator and every slice
///
/// Each participant receives the entries of every other participant under
/// `"{key}-{rank}"`, or `"{key}-master"` for the coordinator's.
fn share_round(
    link: &CoordinatorLink,
    visit: u64,
    stage: usize,
    clipboard: &mut Clipboard,
) -> HarnessResult<()> {
    let acks = link.rendezvous(Checkpoint::new(visit, stage, SyncPoint::ShareCollect))?;

    let mut entries: Vec<SharedEntry> = clipboard
        .shared_entries()
        .into_iter()
        .map(|(key, value)| SharedEntry {
            origin: Rank::Master,
            key,
            value,
        })
        .collect();
    entries.extend(acks.into_iter().flat_map(|ack| ack.shared));

    for entry in entries.iter().filter(|e| e.origin != Rank::Master) {
        clipboard.put(entry.neighbor_key(), entry.value.clone());
    }
    tracing::debug!("Sharing {} entries in stage {}", entries.len(), stage);

    link.rendezvous(Checkpoint::new(visit, stage, SyncPoint::ShareDeliver).with_shared(entries))?;
    Ok(())
}
