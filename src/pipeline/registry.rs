use super::core::{NoOpParallel, NoOpSerial, ParallelProcessing, SerialProcessing, StageContext};
use super::stages;
use crate::config::PipelineConfig;
use crate::error::{HarnessError, HarnessResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds the serial half of a stage class
pub type SerialFactory =
    Arc<dyn Fn(&StageContext) -> HarnessResult<Box<dyn SerialProcessing>> + Send + Sync>;

/// Builds the parallel half of a stage class
pub type ParallelFactory =
    Arc<dyn Fn(&StageContext) -> HarnessResult<Box<dyn ParallelProcessing>> + Send + Sync>;

/// Name of the class registered for both halves that does nothing
pub const NOOP_CLASS: &str = "NoOp";

/// Maps the class names used in a policy to stage constructors
///
/// The coordinator asks for serial halves and every slice asks for its own parallel
/// halves, so the registry is shared behind an `Arc` and factories must be `Sync`.
///
/// # Example
/// ```
/// use stage_harness::pipeline::{Clipboard, ParallelProcessing, StageRegistry};
/// use stage_harness::error::HarnessResult;
///
/// struct Double;
///
/// impl ParallelProcessing for Double {
///     fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
///         let x = clipboard.get_f64("x")?;
///         clipboard.put("x", x * 2.0);
///         Ok(())
///     }
/// }
///
/// let mut registry = StageRegistry::with_builtins();
/// registry.register_parallel("Double", |_ctx| Ok(Box::new(Double)));
/// assert!(registry.has_parallel("Double"));
/// ```
#[derive(Clone)]
pub struct StageRegistry {
    serial: HashMap<String, SerialFactory>,
    parallel: HashMap<String, ParallelFactory>,
}

impl StageRegistry {
    /// Registry knowing only the no-op class
    pub fn new() -> Self {
        let mut registry = Self {
            serial: HashMap::new(),
            parallel: HashMap::new(),
        };
        registry.register_serial(NOOP_CLASS, |_| Ok(Box::new(NoOpSerial)));
        registry.register_parallel(NOOP_CLASS, |_| Ok(Box::new(NoOpParallel)));
        registry
    }

    /// Registry with every stage shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        stages::register_builtins(&mut registry);
        registry
    }

    pub fn register_serial<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&StageContext) -> HarnessResult<Box<dyn SerialProcessing>> + Send + Sync + 'static,
    {
        self.serial.insert(class.into(), Arc::new(factory));
    }

    pub fn register_parallel<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&StageContext) -> HarnessResult<Box<dyn ParallelProcessing>> + Send + Sync + 'static,
    {
        self.parallel.insert(class.into(), Arc::new(factory));
    }

    pub fn has_serial(&self, class: &str) -> bool {
        self.serial.contains_key(class)
    }

    pub fn has_parallel(&self, class: &str) -> bool {
        self.parallel.contains_key(class)
    }

    /// Sorted serial class names
    pub fn serial_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.serial.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted parallel class names
    pub fn parallel_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parallel.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct a serial half; no class means the no-op half
    pub fn create_serial(
        &self,
        class: Option<&str>,
        ctx: &StageContext,
    ) -> HarnessResult<Box<dyn SerialProcessing>> {
        let Some(class) = class else {
            return Ok(Box::new(NoOpSerial));
        };
        let factory = self
            .serial
            .get(class)
            .ok_or_else(|| HarnessError::UnknownStageClass(format!("serial class '{}'", class)))?;
        factory(ctx)
    }

    /// Construct a parallel half; no class means the no-op half
    pub fn create_parallel(
        &self,
        class: Option<&str>,
        ctx: &StageContext,
    ) -> HarnessResult<Box<dyn ParallelProcessing>> {
        let Some(class) = class else {
            return Ok(Box::new(NoOpParallel));
        };
        let factory = self.parallel.get(class).ok_or_else(|| {
            HarnessError::UnknownStageClass(format!("parallel class '{}'", class))
        })?;
        factory(ctx)
    }

    /// Verify that every class a policy names is registered
    pub fn check(&self, config: &PipelineConfig) -> HarnessResult<()> {
        let failure = config
            .failure_stage
            .iter()
            .map(|f| (&f.name, &f.serial_class, &f.parallel_class));
        let stages = config
            .app_stages
            .iter()
            .map(|s| (&s.name, &s.serial_class, &s.parallel_class));

        for (name, serial, parallel) in stages.chain(failure) {
            if let Some(class) = serial {
                if !self.has_serial(class) {
                    return Err(HarnessError::Configuration(format!(
                        "Stage '{}' names unknown serial class '{}'",
                        name, class
                    )));
                }
            }
            if let Some(class) = parallel {
                if !self.has_parallel(class) {
                    return Err(HarnessError::Configuration(format!(
                        "Stage '{}' names unknown parallel class '{}'",
                        name, class
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("serial", &self.serial_classes())
            .field("parallel", &self.parallel_classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailureStageConfig, StageConfig};
    use crate::pipeline::Clipboard;
    use crate::value::PropertySet;

    struct Mark;

    impl ParallelProcessing for Mark {
        fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
            clipboard.put("marked", true);
            Ok(())
        }
    }

    #[test]
    fn test_missing_class_defaults_to_noop() {
        let registry = StageRegistry::new();
        let ctx = StageContext::detached(PropertySet::new());

        assert!(registry.create_serial(None, &ctx).unwrap().is_noop());
        assert!(registry.create_parallel(None, &ctx).unwrap().is_noop());
        assert!(registry.create_parallel(Some("NoOp"), &ctx).unwrap().is_noop());
    }

    #[test]
    fn test_unknown_class() {
        let registry = StageRegistry::new();
        let ctx = StageContext::detached(PropertySet::new());

        let result = registry.create_serial(Some("Nope"), &ctx);
        assert!(matches!(result, Err(HarnessError::UnknownStageClass(_))));
    }

    #[test]
    fn test_registered_factory_is_used() {
        let mut registry = StageRegistry::new();
        registry.register_parallel("Mark", |_| Ok(Box::new(Mark)));

        let ctx = StageContext::detached(PropertySet::new());
        let mut stage = registry.create_parallel(Some("Mark"), &ctx).unwrap();
        let mut clipboard = Clipboard::new();
        stage.process(&mut clipboard).unwrap();

        assert!(clipboard.get_bool("marked").unwrap());
    }

    #[test]
    fn test_factory_errors_propagate() {
        let mut registry = StageRegistry::new();
        registry.register_serial("Broken", |_| {
            Err(HarnessError::Configuration("bad policy".into()))
        });

        let ctx = StageContext::detached(PropertySet::new());
        let result = registry.create_serial(Some("Broken"), &ctx);
        assert!(matches!(result, Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = StageRegistry::with_builtins();
        for class in ["Area", "Event", "SymLink", "FailureReport", "NoOp"] {
            assert!(registry.has_serial(class), "serial {}", class);
            assert!(registry.has_parallel(class), "parallel {}", class);
        }
    }

    #[test]
    fn test_check_policy_classes() {
        let registry = StageRegistry::with_builtins();
        let config = PipelineConfig::new("p")
            .with_stage(StageConfig::new("area").serial("Area").parallel("Area"));
        registry.check(&config).unwrap();

        let config = config.with_failure_stage(FailureStageConfig {
            name: "failure".into(),
            serial_class: None,
            parallel_class: Some("Missing".into()),
            stage_policy: PropertySet::new(),
        });
        assert!(matches!(
            registry.check(&config),
            Err(HarnessError::Configuration(_))
        ));
    }
}
