use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::{Clipboard, ParallelProcessing, SerialProcessing, StageContext};

pub const CLASS: &str = "Area";

/// Serial half of the area stage: checks that the inputs are present
///
/// # Context Requirements
/// - Input: `width` (number)
/// - Input: `height` (number)
pub struct AreaSerial;

impl SerialProcessing for AreaSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        for key in ["width", "height"] {
            if !clipboard.contains(key) {
                return Err(HarnessError::MissingData(format!(
                    "Missing {} on clipboard",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Parallel half of the area stage: computes `width * height` in output units
///
/// # Policy
/// - `inputScale` (int, default 0) - power of ten of the input unit
/// - `outputScale` (int, default 0) - power of ten of the output unit
///
/// # Context Outputs
/// - `area` (float)
pub struct AreaParallel {
    input_scale: i64,
    output_scale: i64,
}

impl AreaParallel {
    pub fn new(input_scale: i64, output_scale: i64) -> Self {
        Self {
            input_scale,
            output_scale,
        }
    }

    pub fn from_context(ctx: &StageContext) -> Self {
        Self::new(
            ctx.policy.get_i64("inputScale").unwrap_or(0),
            ctx.policy.get_i64("outputScale").unwrap_or(0),
        )
    }

    fn scale_factor(&self) -> f64 {
        let ratio = 10f64.powi(self.input_scale as i32) / 10f64.powi(self.output_scale as i32);
        ratio * ratio
    }
}

impl ParallelProcessing for AreaParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        let width = clipboard.get_f64("width")?;
        let height = clipboard.get_f64("height")?;
        let area = width * height * self.scale_factor();

        tracing::debug!("Computed area {} from {} x {}", area, width, height);
        clipboard.put("area", area);

        Ok(())
    }
}
