use crate::config::HardKillAction;
use crate::error::HarnessResult;
use crate::events::{EventReceiver, ShutdownEvent, ShutdownLevel};
use std::time::Duration;

/// Watches the shutdown topic on behalf of the coordinator
///
/// The first accepted request sticks: later checks return it without touching the
/// subscription again. Requests scoped to another run are dropped.
pub struct ShutdownMonitor {
    receiver: Box<dyn EventReceiver>,
    run_id: String,
    poll: Duration,
    hard_kill: HardKillAction,
    pending: Option<ShutdownLevel>,
}

impl ShutdownMonitor {
    pub fn new(
        receiver: Box<dyn EventReceiver>,
        run_id: impl Into<String>,
        poll: Duration,
        hard_kill: HardKillAction,
    ) -> Self {
        Self {
            receiver,
            run_id: run_id.into(),
            poll,
            hard_kill,
            pending: None,
        }
    }

    /// Wait up to the poll interval for a shutdown request
    pub fn poll(&mut self) -> HarnessResult<Option<ShutdownLevel>> {
        self.check(self.poll)
    }

    /// Look for a request that has already arrived
    pub fn check_now(&mut self) -> HarnessResult<Option<ShutdownLevel>> {
        self.check(Duration::ZERO)
    }

    /// Whether a level 1 request asks to abandon the run
    pub fn abandon_requested(&mut self) -> HarnessResult<bool> {
        Ok(self.check_now()? == Some(ShutdownLevel::Immediate))
    }

    /// The accepted request, if any, without checking the topic
    pub fn requested(&self) -> Option<ShutdownLevel> {
        self.pending
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    fn check(&mut self, timeout: Duration) -> HarnessResult<Option<ShutdownLevel>> {
        if self.pending.is_some() {
            return Ok(self.pending);
        }

        let mut wait = timeout;
        while let Some(payload) = self.receiver.receive(wait)? {
            // Only the first receive waits; anything else already queued is drained
            wait = Duration::ZERO;

            let event = match ShutdownEvent::from_payload(&payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Ignoring malformed shutdown event: {}", e);
                    continue;
                }
            };
            if !event.applies_to(&self.run_id) {
                tracing::debug!(
                    "Ignoring shutdown event for run {:?} (this run: {})",
                    event.run_id,
                    self.run_id
                );
                continue;
            }

            match ShutdownLevel::from_level(event.level) {
                Some(level) => {
                    tracing::info!("Shutdown requested at level {} (run: {})", event.level, self.run_id);
                    if level == ShutdownLevel::Immediate && self.hard_kill == HardKillAction::Exit {
                        tracing::error!("Level 1 shutdown: exiting process (run: {})", self.run_id);
                        std::process::exit(1);
                    }
                    self.pending = Some(level);
                    break;
                }
                None => {
                    tracing::warn!("Ignoring shutdown event with unknown level {}", event.level);
                }
            }
        }

        Ok(self.pending)
    }
}
