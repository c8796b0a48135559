//! The KVM control plane.
//!
//! Everything in this module speaks the `/dev/kvm` ioctl protocol. KVM
//! exposes three levels of file descriptor, each supporting a different
//! set of calls:
//!
//! ```text
//! /dev/kvm ────────────► device fd    version, capabilities, supported
//!     │                               CPUID/MSRs, mmap size, CREATE_VM
//!     │ KVM_CREATE_VM
//!     ▼
//! machine fd ──────────► Vm           memory slots, in-kernel devices,
//!     │                               CREATE_VCPU
//!     │ KVM_CREATE_VCPU
//!     ▼
//! vcpu fd ─────────────► Vcpu         CPUID programming, registers, run
//! ```
//!
//! The device fd is short-lived: [`create_vm`] opens it, negotiates
//! against it, asks it for a machine fd, and closes it. The machine and
//! vCPU fds live in [`Vm`] and [`Vcpu`] and are closed exactly once, when
//! those objects drop. Every fd is owned through an RAII handle, so a
//! failure partway through construction cannot leak what was already
//! opened.
//!
//! # Negotiation
//!
//! Nothing is created until the device has proven itself usable. The API
//! version must equal the one this crate was built against - a strict
//! equality check, not a minimum, because the ioctl numbering and struct
//! layouts are version-specific and accepting a newer version could
//! silently accept an incompatible ABI. After that, every entry of
//! [`REQUIRED_CAPABILITIES`] is probed, and the first miss aborts.
//!
//! Failures here are the loud kind. The quiet kind lives in the CPUID
//! path: a wrong table is not an error, it is a guest that observes the
//! wrong processor.

mod cap;
mod cpuid;
mod msr;
mod vcpu;
mod vm;

pub use cap::{CapabilityRequirement, REQUIRED_CAPABILITIES};
pub use cpuid::CpuidEntry;
pub use vcpu::{Vcpu, VcpuInfo};
pub use vm::Vm;

use std::os::raw::c_ulong;
use std::os::unix::io::{AsRawFd, RawFd};

use kvm_bindings::{KVMIO, KVM_API_VERSION};
use thiserror::Error;
use vmm_sys_util::ioctl::ioctl_with_val;
use vmm_sys_util::ioctl_io_nr;

ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);

/// Errors raised by the control plane.
///
/// Each variant maps to one construction step; whichever step fails
/// aborts the whole sequence it occurs in, so callers either get a fully
/// assembled object or no object at all.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("failed to open /dev/kvm: {0}")]
    DeviceUnavailable(#[source] kvm_ioctls::Error),

    /// The device reported an API version other than the one this crate
    /// was built against. Fatal; there is no fallback.
    #[error("KVM API version {0} does not match the supported version {KVM_API_VERSION}")]
    IncompatibleVersion(i32),

    /// A required extension is absent (or below its required minimum).
    #[error("missing required KVM capability: {name} (cap {id})")]
    MissingCapability { id: u32, name: &'static str },

    /// Failed to query the per-vCPU mmap region size.
    #[error("failed to query vcpu mmap size: {0}")]
    MmapSizeQuery(#[source] kvm_ioctls::Error),

    /// The supported-CPUID query hard-failed or exhausted its retries.
    #[error("failed to query supported CPUID: {0}")]
    CpuidQuery(#[source] kvm_ioctls::Error),

    /// Serialization or the set-CPUID call failed while programming a
    /// vCPU's table.
    #[error("failed to program vcpu CPUID: {0}")]
    CpuidSet(#[source] kvm_ioctls::Error),

    /// Failed to enumerate the exposable MSR indices.
    #[error("failed to query MSR index list: {0}")]
    MsrQuery(#[source] kvm_ioctls::Error),

    /// KVM_CREATE_VM failed.
    #[error("failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    /// KVM_CREATE_VCPU failed.
    #[error("failed to create vcpu {id}: {source}")]
    VcpuCreate {
        id: u32,
        #[source]
        source: kvm_ioctls::Error,
    },
}

/// The negotiated `/dev/kvm` device handle.
///
/// Constructing one proves the device is present, speaks the expected API
/// version, and carries every required capability. It exists only long
/// enough to build a [`Vm`]; [`create_vm`] drops it (closing the device
/// fd) once the machine-level descriptor exists.
pub struct Kvm {
    fd: kvm_ioctls::Kvm,
}

impl Kvm {
    /// Opens `/dev/kvm` (read-write, close-on-exec) and negotiates.
    pub fn open() -> Result<Self, KvmError> {
        let fd = kvm_ioctls::Kvm::new().map_err(KvmError::DeviceUnavailable)?;
        let kvm = Kvm { fd };
        negotiate(kvm.fd.get_api_version(), |id| kvm.check_extension(id))?;
        Ok(kvm)
    }

    /// Raw `KVM_CHECK_EXTENSION` probe.
    ///
    /// Returns the kernel's value for the extension: 0 when absent,
    /// positive when present (some capabilities encode a limit in the
    /// value), negative on call error. Takes the raw capability id so the
    /// fixed requirement table is not limited to what a binding enum
    /// happens to name.
    fn check_extension(&self, id: u32) -> i32 {
        // SAFETY: the fd is a KVM device fd and the call reads no memory
        // through its argument.
        unsafe { ioctl_with_val(self, KVM_CHECK_EXTENSION(), c_ulong::from(id)) }
    }

    /// Byte size of the shared mmap region backing each vCPU's run
    /// structure.
    pub fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.fd.get_vcpu_mmap_size().map_err(KvmError::MmapSizeQuery)
    }

    pub(crate) fn fd(&self) -> &kvm_ioctls::Kvm {
        &self.fd
    }
}

impl AsRawFd for Kvm {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Validates a device's reported API version and extension set.
///
/// The version gate comes first: nothing else is probed, let alone
/// created, against a device speaking a different ABI. Capability probes
/// then run in table order and the first miss aborts; no partial
/// negotiation. `check_extension` is injected so the sequence can be
/// exercised against simulated devices.
fn negotiate(version: i32, mut check_extension: impl FnMut(u32) -> i32) -> Result<(), KvmError> {
    if version != KVM_API_VERSION as i32 {
        return Err(KvmError::IncompatibleVersion(version));
    }

    for cap in REQUIRED_CAPABILITIES {
        if !cap.satisfied_by(check_extension(cap.id)) {
            return Err(KvmError::MissingCapability {
                id: cap.id,
                name: cap.name,
            });
        }
    }

    Ok(())
}

/// Negotiates with `/dev/kvm` and creates a virtual machine.
///
/// The construction sequence, each step aborting the whole operation on
/// failure:
///
/// 1. Open the device and negotiate (version, capabilities).
/// 2. Query the per-vCPU mmap size.
/// 3. Build the default guest CPUID table.
/// 4. Enumerate the exposable MSRs.
/// 5. `KVM_CREATE_VM`, yielding the machine-level descriptor (the kernel
///    hands it back close-on-exec).
///
/// The device fd used for steps 1-5 is closed when this function returns;
/// the `Vm`'s day-to-day operations go through the machine fd.
pub fn create_vm() -> Result<Vm, KvmError> {
    let kvm = Kvm::open()?;

    let vcpu_mmap_size = kvm.vcpu_mmap_size()?;
    let cpuid = cpuid::default_cpuid(&kvm)?;
    let msrs = msr::available_msrs(&kvm)?;

    let vm = kvm.fd().create_vm().map_err(KvmError::VmCreate)?;
    log::info!("kvm: VM created");

    Ok(Vm::new(vm, cpuid, msrs, vcpu_mmap_size))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard};

    static DEVICE_LOCK: Mutex<()> = Mutex::new(());

    /// Device-backed tests touch the real `/dev/kvm` and the
    /// process-global descriptor table; they serialize on this lock
    /// instead of racing each other under the parallel test harness.
    pub fn device_lock() -> MutexGuard<'static, ()> {
        DEVICE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm_usable() -> bool {
        std::path::Path::new("/dev/kvm").exists() && Kvm::open().is_ok()
    }

    /// Counts descriptors in this process that refer to KVM objects: the
    /// control device plus the anon inodes backing machine and vCPU fds.
    fn kvm_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.unwrap().path()).ok())
            .filter(|target| {
                let target = target.to_string_lossy();
                target.ends_with("/dev/kvm") || target.starts_with("anon_inode:kvm")
            })
            .count()
    }

    #[test]
    fn negotiation_rejects_a_version_mismatch_before_any_capability_check() {
        let mut checked = Vec::new();
        let result = negotiate(11, |id| {
            checked.push(id);
            1
        });
        assert!(matches!(result, Err(KvmError::IncompatibleVersion(11))));
        // The version gate fired before any capability was checked.
        assert!(checked.is_empty());
    }

    #[test]
    fn negotiation_accepts_a_device_with_every_capability() {
        assert!(negotiate(KVM_API_VERSION as i32, |_| 1024).is_ok());
    }

    #[test]
    fn negotiation_stops_at_the_first_missing_capability() {
        let missing = &REQUIRED_CAPABILITIES[2];
        let mut checked = Vec::new();

        let result = negotiate(KVM_API_VERSION as i32, |id| {
            checked.push(id);
            if id == missing.id {
                0
            } else {
                1024
            }
        });

        match result {
            Err(KvmError::MissingCapability { id, name }) => {
                assert_eq!(id, missing.id);
                assert_eq!(name, missing.name);
            }
            other => panic!("expected MissingCapability, got {other:?}"),
        }

        // Checks ran in table order and aborted at the miss.
        let expected: Vec<u32> = REQUIRED_CAPABILITIES[..3].iter().map(|c| c.id).collect();
        assert_eq!(checked, expected);
    }

    #[test]
    fn capability_below_its_floor_counts_as_missing() {
        let floored = REQUIRED_CAPABILITIES
            .iter()
            .find(|c| c.minimum.is_some())
            .unwrap();
        let result = negotiate(KVM_API_VERSION as i32, |id| {
            if id == floored.id {
                floored.minimum.unwrap() - 1
            } else {
                1024
            }
        });
        assert!(
            matches!(result, Err(KvmError::MissingCapability { id, .. }) if id == floored.id)
        );
    }

    #[test]
    fn negotiation_succeeds_on_a_usable_device() {
        let _device = testing::device_lock();
        if !kvm_usable() {
            return;
        }
        let kvm = Kvm::open().unwrap();
        assert!(kvm.vcpu_mmap_size().unwrap() > 0);
    }

    #[test]
    fn dropping_the_vm_releases_every_descriptor() {
        let _device = testing::device_lock();
        if !kvm_usable() {
            return;
        }
        let before = kvm_fd_count();
        {
            let mut vm = create_vm().unwrap();
            vm.create_vcpu().unwrap();
            vm.create_vcpu().unwrap();
        }
        assert_eq!(kvm_fd_count(), before);
    }

    #[test]
    fn failed_construction_leaves_no_descriptor_open() {
        // Runs on every host: where /dev/kvm is absent or unusable this
        // exercises the failure path, elsewhere the success path. Either
        // way no KVM descriptor may outlive the construction attempt.
        let _device = testing::device_lock();
        let before = kvm_fd_count();
        drop(create_vm());
        assert_eq!(kvm_fd_count(), before);
    }
}
