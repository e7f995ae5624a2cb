//! Instance disk image preparation
//!
//! Provides qemu-img operations on instance images:
//! - Grow an image to the requested disk size
//! - Convert raw images to qcow2

use crate::error::ImageError;
use crate::memory_size::MemorySize;
use crate::process::{display_name, ProcessOutcome, ProcessRunner, ProcessSpec};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bound on resize and convert runs
pub const IMAGE_RESIZE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default image tool, looked up in PATH
pub const DEFAULT_IMAGE_TOOL: &str = "qemu-img";

/// The part of `qemu-img info --output=json` we care about
#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: Option<String>,
}

/// Runs the image tool against instance images
pub struct ImagePreparer<'a> {
    runner: &'a dyn ProcessRunner,
    tool: PathBuf,
    timeout: Duration,
}

impl<'a> ImagePreparer<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self {
            runner,
            tool: PathBuf::from(DEFAULT_IMAGE_TOOL),
            timeout: IMAGE_RESIZE_TIMEOUT,
        }
    }

    /// Use a different image tool binary
    pub fn with_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Bound resize and convert by `timeout` instead of the default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn tool_name(&self) -> String {
        display_name(&self.tool)
    }

    fn spec<I, S>(&self, args: I) -> ProcessSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        ProcessSpec::new(&self.tool).args(args)
    }

    /// Resize `image_path` to `disk_space` bytes
    pub fn resize(&self, image_path: &Path, disk_space: MemorySize) -> Result<(), ImageError> {
        let spec = self
            .spec([
                OsString::from("resize"),
                image_path.as_os_str().to_owned(),
                OsString::from(disk_space.in_bytes().to_string()),
            ])
            .timeout(self.timeout);

        let outcome = self.runner.run(&spec);
        if !outcome.state.completed_successfully() {
            let (tool, failure, stderr) = self.failure(&outcome);
            return Err(ImageError::ResizeFailed { tool, failure, stderr });
        }

        tracing::debug!(image = %image_path.display(), bytes = disk_space.in_bytes(), "Resized image");
        Ok(())
    }

    /// Convert a raw image to qcow2, returning the path to use from now on
    ///
    /// Non-raw images, and images whose format cannot be read from the tool's
    /// output, are returned unchanged.
    pub fn convert_to_target_format_if_needed(&self, image_path: &Path) -> Result<PathBuf, ImageError> {
        let info = self.spec([
            OsString::from("info"),
            OsString::from("--output=json"),
            image_path.as_os_str().to_owned(),
        ]);

        let outcome = self.runner.run(&info);
        if !outcome.state.completed_successfully() {
            let (tool, failure, stderr) = self.failure(&outcome);
            return Err(ImageError::InfoFailed { tool, failure, stderr });
        }

        let format = match serde_json::from_slice::<ImageInfo>(&outcome.stdout) {
            Ok(info) => info.format,
            Err(e) => {
                tracing::debug!(image = %image_path.display(), error = %e, "Unreadable image info");
                None
            }
        };

        if format.as_deref() != Some("raw") {
            return Ok(image_path.to_path_buf());
        }

        let mut target = image_path.as_os_str().to_owned();
        target.push(".qcow2");
        let target = PathBuf::from(target);

        let convert = self
            .spec([
                OsString::from("convert"),
                OsString::from("-p"),
                OsString::from("-O"),
                OsString::from("qcow2"),
                image_path.as_os_str().to_owned(),
                target.as_os_str().to_owned(),
            ])
            .timeout(self.timeout);

        let outcome = self.runner.run(&convert);
        if !outcome.state.completed_successfully() {
            let (tool, failure, stderr) = self.failure(&outcome);
            return Err(ImageError::ConvertFailed { tool, failure, stderr });
        }

        tracing::info!(from = %image_path.display(), to = %target.display(), "Converted raw image to qcow2");
        Ok(target)
    }

    fn failure(&self, outcome: &ProcessOutcome) -> (String, String, String) {
        (
            self.tool_name(),
            outcome.state.failure_message(),
            outcome.stderr_str(),
        )
    }
}
