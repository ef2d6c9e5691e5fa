use super::RunMode;
use crate::error::{HarnessError, HarnessResult};
use crate::pipeline::additional_data::{create_additional_data, format_template};
use crate::pipeline::{Clipboard, ParallelProcessing, SerialProcessing, StageContext};
use std::path::Path;

pub const CLASS: &str = "SymLink";

#[derive(Debug, Clone)]
struct LinkTemplate {
    source: String,
    dest: String,
}

/// Links files named by path templates
///
/// # Policy
/// - `Links` (list of `{sourcePath, destPath}`) - templates with `%(key)`
///   placeholders filled from the additional data (run id, slice id, partition id
///   and any `additionalData` clipboard entries)
/// - `RunMode` - `preprocess` or `postprocess` link once in the coordinator;
///   anything else (the default) links in every slice
struct Linker {
    ctx: StageContext,
    mode: RunMode,
    links: Vec<LinkTemplate>,
}

impl Linker {
    fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        let mode = RunMode::from_policy(&ctx.policy, RunMode::Process)?;
        let list = ctx
            .policy
            .get_list("Links")
            .or_else(|| ctx.policy.get_list("links"))
            .unwrap_or_default();

        let mut links = Vec::with_capacity(list.len());
        for item in list {
            let link = item.as_set().ok_or_else(|| {
                HarnessError::Configuration("Links entries must be property sets".to_string())
            })?;
            let template = |name: &str| {
                link.get_str(name).map(str::to_string).ok_or_else(|| {
                    HarnessError::Configuration(format!("Link entry without {}", name))
                })
            };
            links.push(LinkTemplate {
                source: template("sourcePath")?,
                dest: template("destPath")?,
            });
        }

        if links.is_empty() {
            tracing::warn!("No Links found for stage '{}'", ctx.name);
        }

        Ok(Self {
            ctx: ctx.clone(),
            mode,
            links,
        })
    }

    fn link_all(&self, clipboard: &Clipboard) -> HarnessResult<()> {
        if self.links.is_empty() {
            return Ok(());
        }

        let data = create_additional_data(&self.ctx, &self.ctx.policy, clipboard)?;
        for link in &self.links {
            let source = format_template(&link.source, &data)?;
            let dest = format_template(&link.dest, &data)?;
            tracing::trace!("Linking {} to {} (rank: {})", source, dest, self.ctx.rank);

            let dest = Path::new(&dest);
            if let Some(parent) = dest.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            match make_symlink(Path::new(&source), dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn make_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, dest)
    } else {
        std::os::windows::fs::symlink_file(source, dest)
    }
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_source: &Path, _dest: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}

/// Serial half: links once in the coordinator in preprocess or postprocess mode
pub struct SymLinkSerial {
    linker: Linker,
}

impl SymLinkSerial {
    pub fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        Ok(Self {
            linker: Linker::from_context(ctx)?,
        })
    }
}

impl SerialProcessing for SymLinkSerial {
    fn preprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.linker.mode == RunMode::Preprocess {
            self.linker.link_all(clipboard)?;
        }
        Ok(())
    }

    fn postprocess(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.linker.mode == RunMode::Postprocess {
            self.linker.link_all(clipboard)?;
        }
        Ok(())
    }
}

/// Parallel half: links in every slice unless a serial mode is selected
pub struct SymLinkParallel {
    linker: Linker,
}

impl SymLinkParallel {
    pub fn from_context(ctx: &StageContext) -> HarnessResult<Self> {
        Ok(Self {
            linker: Linker::from_context(ctx)?,
        })
    }
}

impl ParallelProcessing for SymLinkParallel {
    fn process(&mut self, clipboard: &mut Clipboard) -> HarnessResult<()> {
        if self.linker.mode == RunMode::Process {
            self.linker.link_all(clipboard)?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::core::Rank;
    use crate::value::{PropertySet, Value};
    use tempfile::TempDir;

    fn policy(source: &str, dest: &str) -> PropertySet {
        let link = PropertySet::new()
            .with("sourcePath", source)
            .with("destPath", dest);
        PropertySet::new().with("Links", vec![Value::Set(link)])
    }

    #[test]
    fn test_links_per_slice() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("input.fits");
        std::fs::write(&source, b"pixels").unwrap();

        let dest = format!("{}/run-%(runId)/ccd%(ccdId).fits", temp_dir.path().display());
        let ctx = StageContext::detached(policy(&source.display().to_string(), &dest))
            .with_run_id("r9")
            .with_rank(Rank::Slice(1));
        let mut stage = SymLinkParallel::from_context(&ctx).unwrap();

        stage.process(&mut Clipboard::new()).unwrap();

        let linked = temp_dir.path().join("run-r9").join("ccd02.fits");
        assert!(std::fs::symlink_metadata(&linked).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&linked).unwrap(), b"pixels");
    }

    #[test]
    fn test_existing_link_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a");
        std::fs::write(&source, b"a").unwrap();
        let dest = temp_dir.path().join("b");

        let ctx = StageContext::detached(policy(
            &source.display().to_string(),
            &dest.display().to_string(),
        ));
        let mut stage = SymLinkParallel::from_context(&ctx).unwrap();

        stage.process(&mut Clipboard::new()).unwrap();
        stage.process(&mut Clipboard::new()).unwrap();
        assert!(dest.exists());
    }

    #[test]
    fn test_serial_mode_skips_slices() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("link");
        let mut policy = policy("/nonexistent", &dest.display().to_string());
        policy.set("RunMode", "preprocess");

        let ctx = StageContext::detached(policy);
        let mut parallel = SymLinkParallel::from_context(&ctx).unwrap();
        parallel.process(&mut Clipboard::new()).unwrap();
        assert!(std::fs::symlink_metadata(&dest).is_err());

        let mut serial = SymLinkSerial::from_context(&ctx).unwrap();
        serial.preprocess(&mut Clipboard::new()).unwrap();
        assert!(std::fs::symlink_metadata(&dest).is_ok());
    }

    #[test]
    fn test_malformed_links() {
        let policy = PropertySet::new().with("Links", vec![Value::from("not-a-set")]);
        let result = SymLinkParallel::from_context(&StageContext::detached(policy));
        assert!(matches!(result, Err(HarnessError::Configuration(_))));
    }
}
