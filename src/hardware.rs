//! Host virtualization checks
//!
//! Provides:
//! - KVM support detection through the `check_kvm_support` helper
//! - Detection of another hypervisor holding the accelerator
//! - Host CPU architecture naming

use crate::error::HardwareError;
use crate::process::{ProcessRunner, ProcessSpec};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Helper shipped next to the binary
pub const KVM_HELPER: &str = "check_kvm_support";

/// Default accelerator device
pub const KVM_DEVICE: &str = "/dev/kvm";

// KVM_CREATE_VM = _IO(KVMIO, 0x01)
nix::ioctl_write_int_bad!(kvm_create_vm, nix::request_code_none!(0xAE, 0x01));

/// Directory holding the running executable, falling back to the working
/// directory
pub fn default_helper_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Image-catalogue name for a Rust target architecture
pub fn arch_name(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("x86_64"),
        "arm" => Some("arm"),
        "aarch64" => Some("aarch64"),
        "x86" => Some("i386"),
        "powerpc" => Some("ppc"),
        "powerpc64" => Some("ppc64le"),
        "s390x" => Some("s390x"),
        _ => None,
    }
}

/// Architecture of the running host, if it has a catalogue name
pub fn host_arch() -> Option<&'static str> {
    arch_name(std::env::consts::ARCH)
}

/// Probes the host's hardware acceleration
pub struct HardwareProbe<'a> {
    runner: &'a dyn ProcessRunner,
    helper_dir: PathBuf,
    device: PathBuf,
}

impl<'a> HardwareProbe<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self {
            runner,
            helper_dir: default_helper_dir(),
            device: PathBuf::from(KVM_DEVICE),
        }
    }

    pub fn with_helper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_dir = dir.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = device.into();
        self
    }

    /// Run the helper; exit code 1 means KVM is unusable and its output says why
    pub fn check_acceleration_support(&self) -> Result<(), HardwareError> {
        let helper = self.helper_dir.join(KVM_HELPER);
        let outcome = self.runner.run(&ProcessSpec::new(&helper).merged());

        if outcome.state.failed_to_start() {
            return Err(HardwareError::HelperFailedToStart {
                path: helper,
                message: outcome.state.failure_message(),
            });
        }

        if outcome.state.exit_code == Some(1) {
            return Err(HardwareError::Unsupported(
                outcome.merged_output().trim().to_string(),
            ));
        }

        tracing::debug!(helper = %helper.display(), state = %outcome.state, "KVM support check passed");
        Ok(())
    }

    /// Fail if another hypervisor holds the accelerator
    ///
    /// Only EBUSY from `KVM_CREATE_VM` counts; a missing or unopenable device
    /// is left to [`check_acceleration_support`](Self::check_acceleration_support).
    pub fn check_acceleration_not_in_use(&self) -> Result<(), HardwareError> {
        let device = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.device)
        {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(device = %self.device.display(), error = %e, "Cannot open accelerator");
                return Ok(());
            }
        };

        // SAFETY: KVM_CREATE_VM takes a plain integer machine type; the fd is
        // valid for the lifetime of `device`.
        let result = unsafe { kvm_create_vm(device.as_raw_fd(), 0) };

        classify_create_vm(result.map(|vm_fd| {
            // SAFETY: on success the kernel hands us a fresh descriptor
            unsafe { OwnedFd::from_raw_fd(vm_fd) }
        }))
    }
}

/// Outcome of `KVM_CREATE_VM`: only EBUSY means the accelerator is taken.
/// A VM descriptor, if one was created, is closed here.
fn classify_create_vm(result: nix::Result<OwnedFd>) -> Result<(), HardwareError> {
    match result {
        Ok(vm_fd) => {
            drop(vm_fd);
            Ok(())
        }
        Err(Errno::EBUSY) => Err(HardwareError::AcceleratorBusy),
        Err(errno) => {
            tracing::debug!(%errno, "KVM_CREATE_VM failed");
            Ok(())
        }
    }
}
