//! Guest CPUID table construction.
//!
//! The CPUID instruction is how a guest discovers what processor it is
//! running on: vendor string, family/model/stepping, and feature flags.
//! KVM reports which leaves it is willing to virtualize through
//! `KVM_GET_SUPPORTED_CPUID`, but the table a guest should actually see is
//! not the raw supported set:
//!
//! - **Leaf 0** (vendor identification) is overwritten with the *host's*
//!   real leaf 0, so guest tooling that branches on the vendor string sees
//!   the true vendor.
//! - **Leaf 1** (feature/model) takes the host's EAX (true model and
//!   stepping) and always has EDX bit 9 forced on: the monitor presents a
//!   virtual APIC to every guest, whatever the queried set says.
//! - **Leaf 0x80000001** (extended features) always has EDX bit 19
//!   cleared, hiding the NX capability from the guest independent of host
//!   support.
//!
//! All other leaves pass through unmodified, in the order the kernel
//! returned them. Order matters: KVM consumes and produces these tables
//! positionally.
//!
//! # The supported-set size protocol
//!
//! `KVM_GET_SUPPORTED_CPUID` takes a length-prefixed entry table. If the
//! declared capacity is too small the call fails with an out-of-space
//! errno *after* rewriting the capacity field to the required entry count,
//! so the caller reallocates at that size and reissues the identical call.
//! The loop is capped so a misbehaving kernel cannot spin us forever.

use std::arch::x86_64::__cpuid_count;
use std::mem::size_of;

use kvm_bindings::{kvm_cpuid2, kvm_cpuid_entry2, CpuId, KVMIO};
use kvm_ioctls::Error;
use vmm_sys_util::ioctl::ioctl_with_mut_ptr;
use vmm_sys_util::ioctl_iowr_nr;

use super::{Kvm, KvmError};

ioctl_iowr_nr!(KVM_GET_SUPPORTED_CPUID, KVMIO, 0x05, kvm_cpuid2);

/// Leaf 1 EDX bit 9: local APIC present.
pub(super) const CPUID1_EDX_APIC: u32 = 1 << 9;

/// Leaf 0x80000001 EDX bit 19: no-execute page protection.
pub(super) const CPUID_EXT_EDX_NX: u32 = 1 << 19;

/// Scratch tables handed to the kernel are one page, as many entries as
/// fit after the length-prefix header.
const SCRATCH_TABLE_BYTES: usize = 4096;
const SCRATCH_TABLE_ENTRIES: usize =
    (SCRATCH_TABLE_BYTES - size_of::<kvm_cpuid2>()) / size_of::<kvm_cpuid_entry2>();

/// Attempts before giving up on the supported-set query. Each retry uses
/// the capacity the kernel itself asked for, so more than one retry only
/// happens if the kernel keeps changing its answer.
const MAX_QUERY_ATTEMPTS: usize = 8;

/// One CPUID leaf: the input function code and the four output registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidEntry {
    /// The function code placed in EAX before executing CPUID.
    pub function: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidEntry {
    fn from_raw(raw: &kvm_cpuid_entry2) -> Self {
        CpuidEntry {
            function: raw.function,
            eax: raw.eax,
            ebx: raw.ebx,
            ecx: raw.ecx,
            edx: raw.edx,
        }
    }

    fn to_raw(self) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function: self.function,
            eax: self.eax,
            ebx: self.ebx,
            ecx: self.ecx,
            edx: self.edx,
            ..Default::default()
        }
    }
}

/// Queries the host CPU directly, bypassing KVM.
///
/// CPUID is unprivileged, so this is the ground truth for what the
/// hardware reports, as opposed to what the kernel is willing to
/// virtualize.
fn host_cpuid(function: u32) -> CpuidEntry {
    // SAFETY: CPUID is always available on x86_64 and has no memory
    // operands; sub-leaf 0 matches the single-entry model used here.
    let regs = unsafe { __cpuid_count(function, 0) };
    CpuidEntry {
        function,
        eax: regs.eax,
        ebx: regs.ebx,
        ecx: regs.ecx,
        edx: regs.edx,
    }
}

/// Queries the set of CPUID leaves KVM supports exposing to a guest.
fn supported_cpuid(kvm: &Kvm) -> Result<Vec<CpuidEntry>, KvmError> {
    query_supported_cpuid(|table| {
        // SAFETY: the table's declared capacity matches its allocation, and
        // the kernel writes at most that many entries plus the header.
        let ret = unsafe {
            ioctl_with_mut_ptr(kvm, KVM_GET_SUPPORTED_CPUID(), table.as_mut_fam_struct_ptr())
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::last())
        }
    })
}

/// The size-negotiation loop described in the module docs.
///
/// `query` issues one supported-CPUID call against the given table and
/// reports the errno on failure; it is injected, like the host lookup in
/// [`adjust_for_guest`], so the loop can be exercised against a simulated
/// kernel. Any errno other than the out-of-space pair, or exhausting the
/// retry cap, is [`KvmError::CpuidQuery`].
fn query_supported_cpuid(
    mut query: impl FnMut(&mut CpuId) -> Result<(), Error>,
) -> Result<Vec<CpuidEntry>, KvmError> {
    let mut capacity = SCRATCH_TABLE_ENTRIES;

    for _ in 0..MAX_QUERY_ATTEMPTS {
        let mut table =
            CpuId::new(capacity).map_err(|_| KvmError::CpuidQuery(Error::new(libc::ENOMEM)))?;

        match query(&mut table) {
            Ok(()) => {
                // The kernel rewrote the length prefix to the number of
                // valid entries; the wrapper's slice view is bounded by it.
                return Ok(table.as_slice().iter().map(CpuidEntry::from_raw).collect());
            }
            Err(err) => match err.errno() {
                // Out of space: the kernel stored the required entry count
                // in the length prefix. Reissue the call at that capacity.
                libc::E2BIG | libc::ENOMEM => {
                    let required = table.as_fam_struct_ref().nent as usize;
                    capacity = required.max(capacity);
                }
                _ => return Err(KvmError::CpuidQuery(err)),
            },
        }
    }

    Err(KvmError::CpuidQuery(Error::new(libc::E2BIG)))
}

/// Rewrites the supported set into the table a guest should observe.
///
/// `host` supplies the real hardware value for a leaf; it is a parameter
/// so the rewrite rules can be exercised against synthetic hosts.
fn adjust_for_guest(entries: &mut [CpuidEntry], host: impl Fn(u32) -> CpuidEntry) {
    for entry in entries.iter_mut() {
        match entry.function {
            0 => {
                let native = host(0);
                entry.eax = native.eax;
                entry.ebx = native.ebx;
                entry.ecx = native.ecx;
                entry.edx = native.edx;
            }
            1 => {
                let native = host(1);
                entry.eax = native.eax;
                entry.edx |= CPUID1_EDX_APIC;
            }
            0x8000_0001 => {
                entry.edx &= !CPUID_EXT_EDX_NX;
            }
            _ => {}
        }
    }
}

/// Builds the default guest CPUID table: the kernel's supported set with
/// the host-truth adjustments applied. This becomes the VM's baseline
/// table, programmed into each vCPU at creation.
pub(super) fn default_cpuid(kvm: &Kvm) -> Result<Vec<CpuidEntry>, KvmError> {
    let mut entries = supported_cpuid(kvm)?;
    adjust_for_guest(&mut entries, host_cpuid);
    log::debug!("built default guest CPUID table, {} leaves", entries.len());
    Ok(entries)
}

/// Serializes a table into the one-page scratch layout for `KVM_SET_CPUID2`.
///
/// Fails with [`KvmError::CpuidSet`] when the entries do not fit the
/// scratch capacity.
pub(super) fn serialize_table(entries: &[CpuidEntry]) -> Result<CpuId, KvmError> {
    if entries.len() > SCRATCH_TABLE_ENTRIES {
        return Err(KvmError::CpuidSet(Error::new(libc::E2BIG)));
    }
    let raw: Vec<kvm_cpuid_entry2> = entries.iter().map(|e| e.to_raw()).collect();
    CpuId::from_entries(&raw).map_err(|_| KvmError::CpuidSet(Error::new(libc::ENOMEM)))
}
