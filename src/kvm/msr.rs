//! MSR enumeration.
//!
//! `KVM_GET_MSR_INDEX_LIST` reports which model-specific registers the
//! kernel supports exposing to a guest. Unlike the supported-CPUID query
//! there is no growth protocol here: the list is bounded by a known
//! maximum, so a single fixed-capacity call either succeeds or fails.

use super::{Kvm, KvmError};

/// Queries the indices of the MSRs KVM can expose to a guest.
pub(super) fn available_msrs(kvm: &Kvm) -> Result<Vec<u32>, KvmError> {
    let list = kvm
        .fd()
        .get_msr_index_list()
        .map_err(KvmError::MsrQuery)?;
    Ok(list.as_slice().to_vec())
}
