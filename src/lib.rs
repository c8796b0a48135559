//! Argon - the control-plane core of a KVM-based virtual machine monitor.
//!
//! This crate owns the narrow strip of a VMM that talks the `/dev/kvm`
//! ioctl protocol: opening the device, negotiating the API version and the
//! required capability set, building the guest-visible CPUID table,
//! enumerating exposable MSRs, and creating the VM and vCPU objects that
//! the rest of a monitor builds on.
//!
//! Everything downstream of those objects is a collaborator, not a part of
//! this crate: guest memory allocation and mapping, device emulation, the
//! per-vCPU run loop and exit dispatch, and boot loading all consume the
//! handles produced here through [`Vm`] and [`Vcpu`].
//!
//! # Example Usage
//!
//! ```ignore
//! // Negotiate with /dev/kvm and create a VM.
//! let mut vm = argon::create_vm()?;
//!
//! // Create vCPUs; each is programmed with the VM's default CPUID table.
//! let id = vm.create_vcpu()?;
//!
//! // Hand facts to collaborators: memory slots, mmap size, the vCPU fds.
//! let slot = vm.allocate_region_slot();
//! let run_size = vm.vcpu_mmap_size();
//! for vcpu in vm.vcpus() {
//!     assert!(!vcpu.get_cpuid().is_empty());
//! }
//! ```
//!
//! This crate requires Linux with KVM support on x86_64; on other targets
//! it compiles to nothing.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

pub mod kvm;

pub use kvm::{
    create_vm, CapabilityRequirement, CpuidEntry, Kvm, KvmError, Vcpu, VcpuInfo, Vm,
    REQUIRED_CAPABILITIES,
};
