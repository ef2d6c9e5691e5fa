#![allow(dead_code)]

use stage_harness::config::{ExecutionMode, HardKillAction, PipelineConfig};
use stage_harness::error::{HarnessError, HarnessResult};
use stage_harness::events::{event_names, ShutdownEvent, ShutdownLevel};
use stage_harness::pipeline::{
    Clipboard, ParallelProcessing, Rank, SerialProcessing, StageContext, StageId, StageRegistry,
};
use std::sync::{Arc, Mutex};

/// Shared record of which hook ran where, in order
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Single-visit policy tuned for tests: short polls, bounded waits, no process exit
pub fn fast_config(name: &str, n_slices: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new(name)
        .with_slices(n_slices)
        .with_execution_mode(ExecutionMode::OneLoop);
    config.shutdown_poll_ms = 5;
    config.event_timeout_ms = 200;
    config.barrier_timeout_ms = Some(10_000);
    config.hard_kill = HardKillAction::Abandon;
    config
}

/// Serial half that asks for a shutdown during its `visits`-th preprocess
///
/// Policy: `visits` (default 1), `level` (default 4), `runId` (default: own run).
struct ShutdownAfter {
    ctx: StageContext,
    visits: i64,
    level: i64,
    run_id: Option<String>,
    seen: i64,
}

impl SerialProcessing for ShutdownAfter {
    fn preprocess(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.seen += 1;
        if self.seen == self.visits {
            let level = ShutdownLevel::from_level(self.level)
                .ok_or_else(|| HarnessError::Configuration(format!("level {}", self.level)))?;
            let run_id = self.run_id.clone().unwrap_or_else(|| self.ctx.run_id.clone());
            let payload = ShutdownEvent::new(level, Some(run_id)).to_payload()?;
            self.ctx
                .publish(event_names::DEFAULT_SHUTDOWN_TOPIC, payload)?;
        }
        Ok(())
    }
}

/// Parallel half that fails the first time it runs in slice `failRank`
struct FailOnce {
    rank: Rank,
    fail_rank: Rank,
    failed: bool,
}

impl ParallelProcessing for FailOnce {
    fn process(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.rank == self.fail_rank && !self.failed {
            self.failed = true;
            return Err(HarnessError::StageProcessing(format!(
                "deliberate failure in slice {}",
                self.rank
            )));
        }
        Ok(())
    }
}

/// Serial half whose preprocess always fails
struct FailPreprocess;

impl SerialProcessing for FailPreprocess {
    fn preprocess(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        Err(HarnessError::MissingData("nothing to preprocess".to_string()))
    }
}

/// Both halves append `{hook}:{rank}:{stage}` to the call log
struct RecordSerial {
    log: CallLog,
    stage: StageId,
}

impl SerialProcessing for RecordSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.log.lock()?.push(format!("pre:master:{}", self.stage));
        clipboard.put(format!("pre-{}", self.stage), true);
        Ok(())
    }

    fn postprocess(&mut self, _clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.log.lock()?.push(format!("post:master:{}", self.stage));
        Ok(())
    }
}

struct RecordParallel {
    log: CallLog,
    stage: StageId,
    rank: Rank,
}

impl ParallelProcessing for RecordParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        self.log
            .lock()?
            .push(format!("proc:{}:{}", self.rank, self.stage));
        clipboard.put(format!("proc-{}", self.stage), true);
        Ok(())
    }
}

/// Both halves put a shareable `token` naming their rank
struct ShareSerial;

impl SerialProcessing for ShareSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        clipboard.put_shared("token", "master", true);
        Ok(())
    }
}

struct ShareParallel {
    rank: Rank,
}

impl ParallelProcessing for ShareParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        clipboard.put_shared("token", self.rank.as_i64(), true);
        Ok(())
    }
}

/// Built-in stages plus the test stages above
pub fn registry(log: &CallLog) -> StageRegistry {
    let mut registry = StageRegistry::with_builtins();

    registry.register_serial("ShutdownAfter", |ctx: &StageContext| {
        Ok(Box::new(ShutdownAfter {
            ctx: ctx.clone(),
            visits: ctx.policy.get_i64("visits").unwrap_or(1),
            level: ctx.policy.get_i64("level").unwrap_or(4),
            run_id: ctx.policy.get_str("runId").map(str::to_string),
            seen: 0,
        }))
    });

    registry.register_parallel("FailOnce", |ctx: &StageContext| {
        let fail_rank = ctx.policy.get_i64("failRank").unwrap_or(0) as usize;
        Ok(Box::new(FailOnce {
            rank: ctx.rank,
            fail_rank: Rank::Slice(fail_rank),
            failed: false,
        }))
    });

    registry.register_serial("FailPreprocess", |_| Ok(Box::new(FailPreprocess)));

    let serial_log = log.clone();
    registry.register_serial("Record", move |ctx: &StageContext| {
        Ok(Box::new(RecordSerial {
            log: serial_log.clone(),
            stage: ctx.stage_id,
        }))
    });
    let parallel_log = log.clone();
    registry.register_parallel("Record", move |ctx: &StageContext| {
        Ok(Box::new(RecordParallel {
            log: parallel_log.clone(),
            stage: ctx.stage_id,
            rank: ctx.rank,
        }))
    });

    registry.register_serial("Share", |_| Ok(Box::new(ShareSerial)));
    registry.register_parallel("Share", |ctx: &StageContext| {
        Ok(Box::new(ShareParallel { rank: ctx.rank }))
    });

    registry
}
