//! The VM object.
//!
//! A [`Vm`] owns the machine-level KVM descriptor plus everything the
//! control plane negotiated on its behalf: the default guest CPUID table,
//! the exposable-MSR list, the per-vCPU mmap size, and the vCPU
//! collection. It is also the allocator for the two process-lifetime
//! counters the rest of the monitor depends on:
//!
//! - **vCPU ids** are issued in creation order (0, 1, 2, …) and never
//!   reused, even if a vCPU were later to go away.
//! - **Memory-region slots** are likewise monotonic. They are deliberately
//!   not persisted: a restarted monitor re-registers every region and may
//!   number the slots differently the second time around.
//!
//! Both counters and the vCPU collection are touched only through
//! `&mut self`, so the uniqueness of ids and slots is enforced by the
//! borrow checker rather than a lock; a caller that wants to create vCPUs
//! from several threads must already hold exclusive access to the `Vm`.

use kvm_ioctls::VmFd;

use super::cpuid::CpuidEntry;
use super::vcpu::{Vcpu, VcpuInfo};
use super::KvmError;

/// A created virtual machine and its negotiated state.
///
/// Construction goes through [`super::create_vm`], which either returns a
/// fully assembled `Vm` or no object at all. Dropping the `Vm` closes the
/// machine descriptor exactly once; the owned vCPUs close theirs the same
/// way.
pub struct Vm {
    vm: VmFd,

    /// Next vCPU id to issue. Monotonic, never reused.
    next_vcpu_id: u32,

    /// Next memory-region slot to issue. Monotonic, process-lifetime only.
    next_region_slot: u32,

    /// The default guest CPUID table. Fixed after construction; per-vCPU
    /// tables may diverge from it only through [`Vcpu::set_cpuid`].
    cpuid: Vec<CpuidEntry>,

    /// Indices of the MSRs KVM supports exposing to a guest.
    msrs: Vec<u32>,

    /// Byte size of each vCPU's shared mmap region, constant for the
    /// process lifetime.
    vcpu_mmap_size: usize,

    /// All vCPUs created under this VM, in id order.
    vcpus: Vec<Vcpu>,
}

impl Vm {
    pub(super) fn new(
        vm: VmFd,
        cpuid: Vec<CpuidEntry>,
        msrs: Vec<u32>,
        vcpu_mmap_size: usize,
    ) -> Self {
        Vm {
            vm,
            next_vcpu_id: 0,
            next_region_slot: 0,
            cpuid,
            msrs,
            vcpu_mmap_size,
            vcpus: Vec::new(),
        }
    }

    /// Creates the next vCPU and returns its id.
    ///
    /// The new vCPU is programmed with the VM's default CPUID table before
    /// it is added to the collection, so a vCPU that callers can observe
    /// always has a coherent identification state. On any failure nothing
    /// is added and the id is not consumed.
    pub fn create_vcpu(&mut self) -> Result<u32, KvmError> {
        let id = self.next_vcpu_id;
        let fd = self
            .vm
            .create_vcpu(u64::from(id))
            .map_err(|e| KvmError::VcpuCreate { id, source: e })?;

        let mut vcpu = Vcpu::new(id, fd);
        vcpu.set_cpuid(&self.cpuid)?;

        self.next_vcpu_id += 1;
        self.vcpus.push(vcpu);
        log::info!("kvm: vcpu {id} created");
        Ok(id)
    }

    /// The vCPUs created so far, in id order.
    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    /// Mutable access to the vCPUs, for the run-loop collaborator.
    pub fn vcpus_mut(&mut self) -> &mut [Vcpu] {
        &mut self.vcpus
    }

    /// A read-only snapshot of every vCPU's public state.
    pub fn vcpu_info(&self) -> Result<Vec<VcpuInfo>, KvmError> {
        Ok(self.vcpus.iter().map(VcpuInfo::from_vcpu).collect())
    }

    /// Issues the next unique memory-region slot number.
    pub fn allocate_region_slot(&mut self) -> u32 {
        let slot = self.next_region_slot;
        self.next_region_slot += 1;
        slot
    }

    /// The default guest CPUID table negotiated at construction.
    pub fn cpuid(&self) -> &[CpuidEntry] {
        &self.cpuid
    }

    /// The MSR indices KVM supports exposing to a guest.
    pub fn msrs(&self) -> &[u32] {
        &self.msrs
    }

    /// Byte size of each vCPU's shared mmap region.
    pub fn vcpu_mmap_size(&self) -> usize {
        self.vcpu_mmap_size
    }

    /// The machine-level KVM descriptor, for collaborators that register
    /// memory regions or configure in-kernel devices.
    pub fn vm_fd(&self) -> &VmFd {
        &self.vm
    }
}

#[cfg(test)]
mod tests {
    use super::super::cpuid::{CPUID1_EDX_APIC, CPUID_EXT_EDX_NX};
    use super::super::{create_vm, KvmError};
    use super::*;

    /// Device-backed tests run only where a usable /dev/kvm exists; on
    /// hosts without one (or without access to it) they pass vacuously.
    fn test_vm() -> Option<Vm> {
        if !std::path::Path::new("/dev/kvm").exists() {
            return None;
        }
        match create_vm() {
            Ok(vm) => Some(vm),
            // Environmental, not a regression: no access, or a host whose
            // KVM we refuse to negotiate with.
            Err(KvmError::DeviceUnavailable(_))
            | Err(KvmError::IncompatibleVersion(_))
            | Err(KvmError::MissingCapability { .. }) => None,
            Err(e) => panic!("create_vm failed: {e}"),
        }
    }

    #[test]
    fn default_table_forces_apic_and_hides_nx() {
        let _device = super::super::testing::device_lock();
        let Some(vm) = test_vm() else { return };

        let leaf1 = vm.cpuid().iter().find(|e| e.function == 1).unwrap();
        assert_ne!(leaf1.edx & CPUID1_EDX_APIC, 0);

        if let Some(ext) = vm.cpuid().iter().find(|e| e.function == 0x8000_0001) {
            assert_eq!(ext.edx & CPUID_EXT_EDX_NX, 0);
        }
    }

    #[test]
    fn negotiated_facts_are_populated() {
        let _device = super::super::testing::device_lock();
        let Some(vm) = test_vm() else { return };
        assert!(vm.vcpu_mmap_size() > 0);
        assert!(!vm.msrs().is_empty());
        assert!(!vm.cpuid().is_empty());
    }

    #[test]
    fn vcpu_ids_are_dense_and_ordered() {
        let _device = super::super::testing::device_lock();
        let Some(mut vm) = test_vm() else { return };
        assert_eq!(vm.create_vcpu().unwrap(), 0);
        assert_eq!(vm.create_vcpu().unwrap(), 1);
        assert_eq!(vm.create_vcpu().unwrap(), 2);

        let ids: Vec<u32> = vm.vcpus().iter().map(Vcpu::id).collect();
        assert_eq!(ids, [0, 1, 2]);

        let info = vm.vcpu_info().unwrap();
        assert_eq!(info.len(), 3);
        assert!(info.iter().zip(&ids).all(|(i, id)| i.id == *id));
    }

    #[test]
    fn new_vcpus_report_the_default_table() {
        let _device = super::super::testing::device_lock();
        let Some(mut vm) = test_vm() else { return };
        vm.create_vcpu().unwrap();
        let vcpu = &vm.vcpus()[0];
        assert_eq!(vcpu.get_cpuid(), vm.cpuid());
    }

    #[test]
    fn cpuid_cache_round_trips_exactly() {
        let _device = super::super::testing::device_lock();
        let Some(mut vm) = test_vm() else { return };
        vm.create_vcpu().unwrap();

        let table: Vec<_> = vm.cpuid().iter().take(8).copied().collect();
        let vcpu = &mut vm.vcpus_mut()[0];
        vcpu.set_cpuid(&table).unwrap();

        // Round trip, and stability across repeated reads.
        assert_eq!(vcpu.get_cpuid(), table);
        assert_eq!(vcpu.get_cpuid(), table);
    }

    #[test]
    fn region_slots_are_monotonic() {
        let _device = super::super::testing::device_lock();
        let Some(mut vm) = test_vm() else { return };
        assert_eq!(vm.allocate_region_slot(), 0);
        assert_eq!(vm.allocate_region_slot(), 1);
        assert_eq!(vm.allocate_region_slot(), 2);
    }
}
