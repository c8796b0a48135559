//! Virtual CPU objects.
//!
//! A [`Vcpu`] pairs the per-CPU KVM file descriptor with the CPUID table
//! last programmed into it. The descriptor is owned exclusively; dropping
//! the `Vcpu` closes it exactly once. Execution (the run loop, exit
//! dispatch, register state) is the consumer's business, driven through
//! the lent-out descriptor.

use kvm_ioctls::VcpuFd;

use super::cpuid::{self, CpuidEntry};
use super::KvmError;

/// One virtual CPU under a [`super::Vm`].
///
/// Ids are issued by the VM in creation order, starting at zero, and are
/// never reused for the life of the process.
pub struct Vcpu {
    id: u32,
    vcpu: VcpuFd,

    /// The CPUID table last successfully applied with [`Vcpu::set_cpuid`].
    ///
    /// This cache is the only view of the vCPU's CPUID state this process
    /// keeps, and [`Vcpu::get_cpuid`] reads it instead of asking the
    /// kernel. The two kernel calls negotiate sizes differently: the
    /// supported-set query takes a capacity hint and rewrites it in place
    /// on failure, while the read-back call wants a zero-sized request and
    /// only signals "too big" without saying how big. Since this process
    /// is the only writer of the vCPU's table, caching the last applied
    /// write is strictly correct and avoids a second, differently-shaped
    /// retry protocol.
    cpuid: Vec<CpuidEntry>,
}

impl Vcpu {
    pub(super) fn new(id: u32, vcpu: VcpuFd) -> Self {
        Vcpu {
            id,
            vcpu,
            cpuid: Vec::new(),
        }
    }

    /// This vCPU's creation-order id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Programs the vCPU's CPUID table.
    ///
    /// The entries are serialized into the one-page scratch layout and
    /// applied with `KVM_SET_CPUID2`; only after the kernel accepts them
    /// is the cache updated, so a failed set leaves the previous table in
    /// place on both sides.
    pub fn set_cpuid(&mut self, entries: &[CpuidEntry]) -> Result<(), KvmError> {
        let table = cpuid::serialize_table(entries)?;
        self.vcpu.set_cpuid2(&table).map_err(KvmError::CpuidSet)?;
        self.cpuid = entries.to_vec();
        Ok(())
    }

    /// The CPUID table this vCPU currently reports, as last applied by
    /// [`Vcpu::set_cpuid`]. Served from the cache; never a kernel query.
    pub fn get_cpuid(&self) -> &[CpuidEntry] {
        &self.cpuid
    }

    /// The underlying KVM vCPU descriptor, for the run-loop collaborator.
    pub fn fd(&self) -> &VcpuFd {
        &self.vcpu
    }
}

/// Read-only snapshot of one vCPU's public state, for callers that want
/// to inspect the machine without borrowing the live objects.
#[derive(Debug, Clone)]
pub struct VcpuInfo {
    pub id: u32,
    pub cpuid: Vec<CpuidEntry>,
}

impl VcpuInfo {
    pub(super) fn from_vcpu(vcpu: &Vcpu) -> Self {
        VcpuInfo {
            id: vcpu.id(),
            cpuid: vcpu.get_cpuid().to_vec(),
        }
    }
}
