use super::clipboard::Clipboard;
use super::core::{guarded, Rank, StageContext, StageId};
use super::registry::StageRegistry;
use crate::error::HarnessResult;
use crate::events::EventBroker;
use crate::value::PropertySet;
use std::sync::Arc;

/// Runs a single stage outside a pipeline
///
/// `run_master` plays the coordinator (preprocess then postprocess) and
/// `run_worker` plays one slice (process). The caller builds the input clipboard.
///
/// # Example
/// ```
/// use stage_harness::pipeline::{Clipboard, StageRegistry, StageTester};
/// use stage_harness::value::PropertySet;
///
/// let registry = StageRegistry::with_builtins();
/// let policy = PropertySet::new().with("inputScale", 0).with("outputScale", 0);
/// let mut tester = StageTester::new(&registry, "Area", policy);
///
/// let mut clipboard = Clipboard::new();
/// clipboard.put("width", 3.0);
/// clipboard.put("height", 4.0);
///
/// let out = tester.run_worker(clipboard, 0).unwrap();
/// assert_eq!(out.get_f64("area").unwrap(), 12.0);
/// ```
pub struct StageTester {
    registry: StageRegistry,
    serial_class: Option<String>,
    parallel_class: Option<String>,
    policy: PropertySet,
    run_id: String,
    universe_size: usize,
    broker: Option<Arc<dyn EventBroker>>,
    event: Option<(String, PropertySet)>,
}

impl StageTester {
    pub const DEFAULT_RUN_ID: &'static str = "simpleTest";

    /// Test `class`, using whichever halves the registry knows for it
    pub fn new(registry: &StageRegistry, class: &str, policy: PropertySet) -> Self {
        let serial = registry.has_serial(class).then(|| class);
        let parallel = registry.has_parallel(class).then(|| class);
        Self::with_classes(registry, serial, parallel, policy)
    }

    /// Test an explicit pair of serial and parallel classes
    pub fn with_classes(
        registry: &StageRegistry,
        serial_class: Option<&str>,
        parallel_class: Option<&str>,
        policy: PropertySet,
    ) -> Self {
        Self {
            registry: registry.clone(),
            serial_class: serial_class.map(str::to_string),
            parallel_class: parallel_class.map(str::to_string),
            policy,
            run_id: Self::DEFAULT_RUN_ID.to_string(),
            universe_size: 1,
            broker: None,
            event: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_universe_size(mut self, universe_size: usize) -> Self {
        self.universe_size = universe_size;
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn EventBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Event placed on the clipboard under `topic` before every run
    pub fn set_event(&mut self, topic: impl Into<String>, payload: PropertySet) {
        self.event = Some((topic.into(), payload));
    }

    /// Run the serial half as the coordinator would
    pub fn run_master(&mut self, mut clipboard: Clipboard) -> HarnessResult<Clipboard> {
        let ctx = self.context(Rank::Master);
        let mut stage = self
            .registry
            .create_serial(self.serial_class.as_deref(), &ctx)?;

        self.attach_event(&mut clipboard);
        guarded(|| stage.preprocess(&mut clipboard))?;
        guarded(|| stage.postprocess(&mut clipboard))?;
        Ok(clipboard)
    }

    /// Run the parallel half as slice `rank` would
    pub fn run_worker(&mut self, mut clipboard: Clipboard, rank: usize) -> HarnessResult<Clipboard> {
        let ctx = self.context(Rank::Slice(rank));
        let mut stage = self
            .registry
            .create_parallel(self.parallel_class.as_deref(), &ctx)?;

        self.attach_event(&mut clipboard);
        guarded(|| stage.process(&mut clipboard))?;
        Ok(clipboard)
    }

    fn context(&self, rank: Rank) -> StageContext {
        let ctx = StageContext::detached(self.policy.clone())
            .with_stage_id(StageId::Detached)
            .with_rank(rank)
            .with_run_id(self.run_id.as_str())
            .with_universe_size(self.universe_size);
        match &self.broker {
            Some(broker) => ctx.with_broker(broker.clone()),
            None => ctx,
        }
    }

    fn attach_event(&self, clipboard: &mut Clipboard) {
        if let Some((topic, payload)) = &self.event {
            clipboard.put(topic.as_str(), payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::pipeline::ParallelProcessing;

    fn area_input() -> Clipboard {
        let mut clipboard = Clipboard::new();
        clipboard.put("width", 3.0);
        clipboard.put("height", 4.0);
        clipboard
    }

    #[test]
    fn test_run_worker_area() {
        let registry = StageRegistry::with_builtins();
        let policy = PropertySet::new().with("inputScale", 0).with("outputScale", 0);
        let mut tester = StageTester::new(&registry, "Area", policy);

        let out = tester.run_worker(area_input(), 0).unwrap();
        assert_eq!(out.get_f64("area").unwrap(), 12.0);
        assert_eq!(out.get_f64("width").unwrap(), 3.0);
        assert_eq!(out.get_f64("height").unwrap(), 4.0);
    }

    #[test]
    fn test_run_master_validates() {
        let registry = StageRegistry::with_builtins();
        let mut tester = StageTester::new(&registry, "Area", PropertySet::new());

        let out = tester.run_master(area_input()).unwrap();
        assert!(!out.contains("area"));

        let result = tester.run_master(Clipboard::new());
        assert!(matches!(result, Err(HarnessError::MissingData(_))));
    }

    #[test]
    fn test_event_is_attached() {
        let registry = StageRegistry::new();
        let mut tester = StageTester::new(&registry, "NoOp", PropertySet::new());
        tester.set_event("trigger", PropertySet::new().with("visitId", 5));

        let out = tester.run_worker(Clipboard::new(), 0).unwrap();
        assert_eq!(out.get_set("trigger").unwrap().get_i64("visitId"), Some(5));
    }

    struct RecordContext(StageContext);

    impl ParallelProcessing for RecordContext {
        fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
            clipboard.put("runId", self.0.run_id.as_str());
            clipboard.put("rank", self.0.rank.as_i64());
            clipboard.put("universeSize", self.0.universe_size);
            Ok(())
        }
    }

    #[test]
    fn test_context_defaults_and_overrides() {
        let mut registry = StageRegistry::new();
        registry.register_parallel("Record", |ctx| Ok(Box::new(RecordContext(ctx.clone()))));

        let mut tester = StageTester::new(&registry, "Record", PropertySet::new());
        let out = tester.run_worker(Clipboard::new(), 2).unwrap();
        assert_eq!(out.get_str("runId").unwrap(), "simpleTest");
        assert_eq!(out.get_i64("rank").unwrap(), 2);
        assert_eq!(out.get_i64("universeSize").unwrap(), 1);

        let mut tester = StageTester::new(&registry, "Record", PropertySet::new())
            .with_run_id("custom")
            .with_universe_size(4);
        let out = tester.run_worker(Clipboard::new(), 0).unwrap();
        assert_eq!(out.get_str("runId").unwrap(), "custom");
        assert_eq!(out.get_i64("universeSize").unwrap(), 4);
    }
}
