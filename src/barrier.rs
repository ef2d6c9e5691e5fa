//! Rendezvous between the coordinator and its slices
//!
//! Every slice owns a pair of channels to the coordinator: a signal channel the
//! coordinator writes "proceed at point P" or "terminate" to, and an acknowledgement
//! channel the slice answers on. A rendezvous sends the signal to every slice and
//! then collects one acknowledgement from each, so no party gets past P until all
//! of them have reached it.
//!
//! A dropped channel end means the peer is gone, which is fatal to the observer.

use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::Rank;
use crate::value::Value;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Synchronization points of the visit loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPoint {
    /// Every slice finished its setup
    Startup,
    VisitStart,
    /// Before the coordinator's preprocess
    StageStart,
    /// After the coordinator's preprocess, before the slices' process
    PreprocessDone,
    /// Slices hand in their shareable entries
    ShareCollect,
    /// Coordinator hands every participant's shareable entries back out
    ShareDeliver,
    /// After the slices' process, before the coordinator's postprocess
    ProcessDone,
    /// After the coordinator's postprocess
    StageEnd,
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPoint::Startup => "startup",
            SyncPoint::VisitStart => "visit start",
            SyncPoint::StageStart => "stage start",
            SyncPoint::PreprocessDone => "preprocess done",
            SyncPoint::ShareCollect => "share collect",
            SyncPoint::ShareDeliver => "share deliver",
            SyncPoint::ProcessDone => "process done",
            SyncPoint::StageEnd => "stage end",
        };
        f.write_str(name)
    }
}

/// A shareable clipboard entry travelling between execution contexts
#[derive(Debug, Clone, PartialEq)]
pub struct SharedEntry {
    pub origin: Rank,
    pub key: String,
    pub value: Value,
}

impl SharedEntry {
    /// Key under which other participants store the entry
    pub fn neighbor_key(&self) -> String {
        format!("{}-{}", self.key, self.origin.label())
    }
}

/// Coordinator's half of a rendezvous
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub visit: u64,
    pub stage: usize,
    pub point: SyncPoint,
    /// Visit-wide error flag as the coordinator knows it
    pub error_flagged: bool,
    /// Whether the stage event was republished on the slice topic
    pub event_published: bool,
    pub shared: Vec<SharedEntry>,
}

impl Checkpoint {
    pub fn new(visit: u64, stage: usize, point: SyncPoint) -> Self {
        Self {
            visit,
            stage,
            point,
            error_flagged: false,
            event_published: false,
            shared: Vec::new(),
        }
    }

    pub fn flagged(mut self, error_flagged: bool) -> Self {
        self.error_flagged = error_flagged;
        self
    }

    pub fn with_event(mut self, event_published: bool) -> Self {
        self.event_published = event_published;
        self
    }

    pub fn with_shared(mut self, shared: Vec<SharedEntry>) -> Self {
        self.shared = shared;
        self
    }
}

/// What the coordinator tells a slice
#[derive(Debug, Clone)]
pub enum Signal {
    Proceed(Checkpoint),
    Terminate,
}

/// Slice's half of a rendezvous
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub rank: usize,
    pub visit: u64,
    pub stage: usize,
    pub point: SyncPoint,
    /// The slice's process failed for this stage
    pub stage_failed: bool,
    pub shared: Vec<SharedEntry>,
}

impl Acknowledgement {
    pub fn to(checkpoint: &Checkpoint, rank: usize) -> Self {
        Self {
            rank,
            visit: checkpoint.visit,
            stage: checkpoint.stage,
            point: checkpoint.point,
            stage_failed: false,
            shared: Vec::new(),
        }
    }

    pub fn failed(mut self, stage_failed: bool) -> Self {
        self.stage_failed = stage_failed;
        self
    }

    pub fn with_shared(mut self, shared: Vec<SharedEntry>) -> Self {
        self.shared = shared;
        self
    }
}

struct SliceChannel {
    signals: Sender<Signal>,
    acks: Receiver<Acknowledgement>,
}

/// Coordinator end of the links to every slice
pub struct CoordinatorLink {
    slices: Vec<SliceChannel>,
    timeout: Option<Duration>,
}

/// Slice end of its link to the coordinator
pub struct SliceLink {
    rank: usize,
    signals: Receiver<Signal>,
    acks: Sender<Acknowledgement>,
    timeout: Option<Duration>,
}

/// Create linked channel pairs for `n_slices` slices
///
/// `timeout` bounds each wait; `None` waits until the peer answers or disconnects.
pub fn links(n_slices: usize, timeout: Option<Duration>) -> (CoordinatorLink, Vec<SliceLink>) {
    let mut slices = Vec::with_capacity(n_slices);
    let mut slice_links = Vec::with_capacity(n_slices);

    for rank in 0..n_slices {
        let (signal_tx, signal_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        slices.push(SliceChannel {
            signals: signal_tx,
            acks: ack_rx,
        });
        slice_links.push(SliceLink {
            rank,
            signals: signal_rx,
            acks: ack_tx,
            timeout,
        });
    }

    (CoordinatorLink { slices, timeout }, slice_links)
}

impl CoordinatorLink {
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Bring every slice to `checkpoint.point` and collect their acknowledgements
    ///
    /// Acknowledgements are returned in rank order.
    pub fn rendezvous(&self, checkpoint: Checkpoint) -> HarnessResult<Vec<Acknowledgement>> {
        let point = checkpoint.point;

        for (rank, slice) in self.slices.iter().enumerate() {
            slice
                .signals
                .send(Signal::Proceed(checkpoint.clone()))
                .map_err(|_| {
                    HarnessError::PeerDisconnected(format!("slice {} left before {}", rank, point))
                })?;
        }

        let mut acks = Vec::with_capacity(self.slices.len());
        for (rank, slice) in self.slices.iter().enumerate() {
            let ack = match self.timeout {
                Some(timeout) => slice.acks.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => HarnessError::CoordinationTimeout {
                        party: format!("slice {}", rank),
                        point: point.to_string(),
                    },
                    RecvTimeoutError::Disconnected => {
                        HarnessError::PeerDisconnected(format!("slice {} at {}", rank, point))
                    }
                })?,
                None => slice.acks.recv().map_err(|_| {
                    HarnessError::PeerDisconnected(format!("slice {} at {}", rank, point))
                })?,
            };

            if ack.rank != rank
                || ack.point != point
                || ack.stage != checkpoint.stage
                || ack.visit != checkpoint.visit
            {
                return Err(HarnessError::ProtocolViolation(format!(
                    "expected slice {} at {} (visit {}, stage {}), got slice {} at {} (visit {}, stage {})",
                    rank, point, checkpoint.visit, checkpoint.stage, ack.rank, ack.point, ack.visit, ack.stage
                )));
            }
            acks.push(ack);
        }

        tracing::trace!(
            "Rendezvous at {} (visit {}, stage {}) with {} slices",
            point,
            checkpoint.visit,
            checkpoint.stage,
            acks.len()
        );
        Ok(acks)
    }

    /// Ask every slice to stop at its next barrier
    ///
    /// Slices that already left are skipped.
    pub fn terminate(&self) {
        for slice in &self.slices {
            let _ = slice.signals.send(Signal::Terminate);
        }
    }
}

impl SliceLink {
    pub fn rank(&self) -> usize {
        self.rank
    }

    fn next_signal(&self, point: SyncPoint) -> HarnessResult<Signal> {
        match self.timeout {
            Some(timeout) => self.signals.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => HarnessError::CoordinationTimeout {
                    party: "coordinator".to_string(),
                    point: point.to_string(),
                },
                RecvTimeoutError::Disconnected => {
                    HarnessError::PeerDisconnected(format!("coordinator at {}", point))
                }
            }),
            None => self
                .signals
                .recv()
                .map_err(|_| HarnessError::PeerDisconnected(format!("coordinator at {}", point))),
        }
    }

    /// Wait for the coordinator to reach `point`; `None` when asked to terminate
    pub fn await_point(
        &self,
        visit: u64,
        stage: usize,
        point: SyncPoint,
    ) -> HarnessResult<Option<Checkpoint>> {
        match self.next_signal(point)? {
            Signal::Terminate => Ok(None),
            Signal::Proceed(checkpoint) => {
                if checkpoint.point != point || checkpoint.stage != stage || checkpoint.visit != visit
                {
                    return Err(HarnessError::ProtocolViolation(format!(
                        "slice {} expected {} (visit {}, stage {}), got {} (visit {}, stage {})",
                        self.rank,
                        point,
                        visit,
                        stage,
                        checkpoint.point,
                        checkpoint.visit,
                        checkpoint.stage
                    )));
                }
                Ok(Some(checkpoint))
            }
        }
    }

    pub fn acknowledge(&self, ack: Acknowledgement) -> HarnessResult<()> {
        let point = ack.point;
        self.acks
            .send(ack)
            .map_err(|_| HarnessError::PeerDisconnected(format!("coordinator at {}", point)))
    }

    /// Wait for `point` and acknowledge it right away
    pub fn sync(&self, visit: u64, stage: usize, point: SyncPoint) -> HarnessResult<Option<Checkpoint>> {
        let checkpoint = self.await_point(visit, stage, point)?;
        if let Some(checkpoint) = &checkpoint {
            self.acknowledge(Acknowledgement::to(checkpoint, self.rank))?;
        }
        Ok(checkpoint)
    }
}
