use crate::barrier::{Acknowledgement, SharedEntry, SliceLink, SyncPoint};
use crate::config::PipelineConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::EventReceiver;
use crate::pipeline::core::guarded;
use crate::pipeline::stages::failure::record_failure;
use crate::pipeline::{ParallelProcessing, Phase, QueueChain, Rank, StageOutcome, VisitReport};
use std::sync::Arc;
use std::time::Instant;

/// Parallel half of one configured stage, as a slice holds it
pub(crate) struct ParallelStage {
    pub(crate) name: String,
    pub(crate) topic: Option<String>,
    /// Subscription to the slice sub-topic of the stage topic
    pub(crate) receiver: Option<Box<dyn EventReceiver>>,
    pub(crate) half: Box<dyn ParallelProcessing>,
}

/// Everything a slice needs to run visits
pub(crate) struct StageLoop {
    pub(crate) rank: usize,
    pub(crate) run_id: String,
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) queues: QueueChain,
    pub(crate) stages: Vec<ParallelStage>,
    pub(crate) failure: Option<ParallelStage>,
}

impl StageLoop {
    /// Run one visit in step with the coordinator
    ///
    /// Returns `None` when the coordinator asked the slice to terminate.
    pub(crate) fn run_visit(
        &mut self,
        link: &SliceLink,
        visit: u64,
    ) -> HarnessResult<Option<VisitReport>> {
        let span = tracing::debug_span!("visit", visit);
        let _entered = span.enter();

        let started = Instant::now();
        self.queues.seed();
        let mut error_flagged = false;
        let mut outcomes = Vec::with_capacity(self.stages.len());

        for index in 0..self.stages.len() {
            match self.run_stage(index, visit, &mut error_flagged, link)? {
                Some(outcome) => outcomes.push(outcome),
                None => return Ok(None),
            }
        }

        let final_keys = match self.queues.drain_final() {
            Some(mut clipboard) => {
                let keys = clipboard.keys();
                clipboard.close();
                keys
            }
            None => Vec::new(),
        };

        Ok(Some(VisitReport {
            visit,
            error_flagged,
            stages: outcomes,
            final_keys,
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }

    fn run_stage(
        &mut self,
        index: usize,
        visit: u64,
        error_flagged: &mut bool,
        link: &SliceLink,
    ) -> HarnessResult<Option<StageOutcome>> {
        let id = index + 1;

        if link.sync(visit, id, SyncPoint::StageStart)?.is_none() {
            return Ok(None);
        }

        let Some(checkpoint) = link.await_point(visit, id, SyncPoint::PreprocessDone)? else {
            return Ok(None);
        };
        *error_flagged |= checkpoint.error_flagged;
        link.acknowledge(Acknowledgement::to(&checkpoint, self.rank))?;

        if checkpoint.event_published {
            self.receive_event(index)?;
        }

        if !*error_flagged && self.config.shares_data(id) && !self.share_round(link, visit, id)? {
            return Ok(None);
        }

        let (outcome, failed) = self.try_process(index, error_flagged);

        let Some(checkpoint) = link.await_point(visit, id, SyncPoint::ProcessDone)? else {
            return Ok(None);
        };
        link.acknowledge(Acknowledgement::to(&checkpoint, self.rank).failed(failed))?;

        if link.sync(visit, id, SyncPoint::StageEnd)?.is_none() {
            return Ok(None);
        }
        Ok(Some(outcome))
    }

    /// Take the event the coordinator republished for this stage
    fn receive_event(&mut self, index: usize) -> HarnessResult<()> {
        let id = index + 1;
        let stage = &self.stages[index];
        let (Some(topic), Some(receiver)) = (stage.topic.as_deref(), stage.receiver.as_ref())
        else {
            return Ok(());
        };

        match receiver.receive(self.config.event_timeout())? {
            Some(payload) => match self.queues.input(id).element_mut() {
                Some(clipboard) => clipboard.put(topic, payload),
                None => tracing::warn!("No input clipboard for event on topic '{}'", topic),
            },
            None => tracing::warn!("Coordinator announced an event on '{}' that never came", topic),
        }
        Ok(())
    }

    /// Returns `false` when terminated during the round
    fn share_round(&mut self, link: &SliceLink, visit: u64, id: usize) -> HarnessResult<bool> {
        let own = Rank::Slice(self.rank);

        let Some(checkpoint) = link.await_point(visit, id, SyncPoint::ShareCollect)? else {
            return Ok(false);
        };
        let entries: Vec<SharedEntry> = self
            .queues
            .input(id)
            .element()
            .map(|clipboard| clipboard.shared_entries())
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| SharedEntry {
                origin: own,
                key,
                value,
            })
            .collect();
        link.acknowledge(Acknowledgement::to(&checkpoint, self.rank).with_shared(entries))?;

        let Some(checkpoint) = link.await_point(visit, id, SyncPoint::ShareDeliver)? else {
            return Ok(false);
        };
        if let Some(clipboard) = self.queues.input(id).element_mut() {
            for entry in checkpoint.shared.iter().filter(|e| e.origin != own) {
                clipboard.put(entry.neighbor_key(), entry.value.clone());
            }
        }
        link.acknowledge(Acknowledgement::to(&checkpoint, self.rank))?;
        Ok(true)
    }

    /// Run the stage's process, or pass the clipboard through when flagged
    ///
    /// Returns the outcome and whether this slice's process failed.
    fn try_process(&mut self, index: usize, error_flagged: &mut bool) -> (StageOutcome, bool) {
        let id = index + 1;
        let name = self.stages[index].name.clone();

        if *error_flagged {
            tracing::trace!("Skipping process due to flagged error");
            self.queues.transfer(id);
            return (StageOutcome::passed_through(id, name), false);
        }

        let started = Instant::now();
        let stage = &mut self.stages[index];
        let result = match self.queues.input(id).element_mut() {
            Some(clipboard) => guarded(|| stage.half.process(clipboard)),
            None => Err(HarnessError::Internal(format!("stage {} has no input clipboard", id))),
        };

        let outcome = match result {
            Ok(()) => StageOutcome::completed(id, name, started.elapsed()),
            Err(e) => {
                *error_flagged = true;
                tracing::error!(
                    stage_id = id,
                    stage = %name,
                    run_id = %self.run_id,
                    rank = self.rank,
                    "Stage {} failed in process: {}",
                    name,
                    e
                );
                self.run_failure_stage(index, &e);
                StageOutcome::failed(id, name, Phase::Process, e.to_string(), started.elapsed())
            }
        };

        // The processed (or failed) clipboard moves on to the next stage either way
        self.queues.transfer(id);
        let failed = outcome.is_failed();
        (outcome, failed)
    }

    fn run_failure_stage(&mut self, index: usize, error: &HarnessError) {
        let id = index + 1;
        let Some(failure) = self.failure.as_mut().filter(|f| !f.half.is_noop()) else {
            return;
        };
        let Some(clipboard) = self.queues.input(id).element_mut() else {
            return;
        };

        record_failure(clipboard, &self.stages[index].name, id, error);
        if let Err(e) = guarded(|| failure.half.process(clipboard)) {
            tracing::error!(
                "Failure stage '{}' failed in process (run: {}, rank: {}): {}",
                failure.name,
                self.run_id,
                self.rank,
                e
            );
        }
    }
}
