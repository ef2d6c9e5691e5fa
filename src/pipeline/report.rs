use super::core::VisitReport;
use serde::Serialize;

/// Fixed-size history of visit reports
///
/// Keeps the most recent `capacity` reports; older ones are overwritten.
#[derive(Debug, Clone)]
pub struct ReportLog {
    buffer: Vec<VisitReport>,
    head: usize,
    capacity: usize,
    total: u64,
}

impl ReportLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            head: 0,
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, report: VisitReport) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(report);
        } else {
            self.buffer[self.head] = report;
            self.head = (self.head + 1) % self.capacity;
        }
        self.total += 1;
    }

    /// Retained reports, oldest first
    pub fn to_vec(&self) -> Vec<VisitReport> {
        let mut result = Vec::with_capacity(self.buffer.len());
        result.extend_from_slice(&self.buffer[self.head..]);
        result.extend_from_slice(&self.buffer[..self.head]);
        result
    }

    pub fn last(&self) -> Option<&VisitReport> {
        if self.buffer.is_empty() {
            None
        } else if self.buffer.len() < self.capacity {
            self.buffer.last()
        } else {
            let newest = (self.head + self.capacity - 1) % self.capacity;
            self.buffer.get(newest)
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Reports pushed since creation, including overwritten ones
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Why the coordinator left its visit loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum StopReason {
    /// Oneloop mode finished its single visit
    OneLoopComplete,
    /// A graceful shutdown event arrived
    ShutdownRequested { level: i64 },
    /// A level 1 shutdown abandoned the run
    HardKill,
}

/// What one slice reported when it was joined
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceSummary {
    pub rank: usize,
    pub visits_completed: u64,
    pub reports: Vec<VisitReport>,
    /// Error that ended the slice early, if any
    pub error: Option<String>,
}

/// Result of a complete run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline_name: String,
    pub visits_completed: u64,
    pub stop_reason: StopReason,
    /// Coordinator reports, oldest first
    pub reports: Vec<VisitReport>,
    pub slices: Vec<SliceSummary>,
}

impl RunSummary {
    /// Whether any visit, in the coordinator or a slice, was error-flagged
    pub fn any_flagged(&self) -> bool {
        self.reports.iter().any(|r| r.error_flagged)
            || self
                .slices
                .iter()
                .flat_map(|s| s.reports.iter())
                .any(|r| r.error_flagged)
    }

    /// Whether every slice ended without an error
    pub fn slices_clean(&self) -> bool {
        self.slices.iter().all(|s| s.error.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(visit: u64) -> VisitReport {
        VisitReport {
            visit,
            error_flagged: visit % 2 == 0,
            stages: vec![],
            final_keys: vec![],
            duration_ms: 0,
        }
    }

    #[test]
    fn test_log_keeps_order_before_wrapping() {
        let mut log = ReportLog::new(3);
        log.push(report(1));
        log.push(report(2));

        let visits: Vec<u64> = log.to_vec().iter().map(|r| r.visit).collect();
        assert_eq!(visits, vec![1, 2]);
        assert_eq!(log.last().unwrap().visit, 2);
    }

    #[test]
    fn test_log_overwrites_oldest() {
        let mut log = ReportLog::new(3);
        for visit in 1..=5 {
            log.push(report(visit));
        }

        let visits: Vec<u64> = log.to_vec().iter().map(|r| r.visit).collect();
        assert_eq!(visits, vec![3, 4, 5]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.total(), 5);
        assert_eq!(log.last().unwrap().visit, 5);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut log = ReportLog::new(0);
        log.push(report(1));
        log.push(report(2));
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().unwrap().visit, 2);
    }

    #[test]
    fn test_summary_flags() {
        let summary = RunSummary {
            run_id: "r".into(),
            pipeline_name: "p".into(),
            visits_completed: 1,
            stop_reason: StopReason::OneLoopComplete,
            reports: vec![report(1)],
            slices: vec![SliceSummary {
                rank: 0,
                visits_completed: 1,
                reports: vec![report(2)],
                error: None,
            }],
        };
        assert!(summary.any_flagged());
        assert!(summary.slices_clean());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stopReason"]["reason"], "oneLoopComplete");
        assert_eq!(json["slices"][0]["visitsCompleted"], 1);
    }
}
