//! Required KVM capability table.
//!
//! KVM advertises optional functionality through `KVM_CHECK_EXTENSION`.
//! The monitor is not written to degrade gracefully when one of the
//! extensions it relies on is absent, so the full set is probed up front,
//! before any VM object exists, and the first missing capability aborts
//! negotiation. The table is process-wide configuration, not mutable
//! state.

use kvm_bindings::{
    KVM_CAP_ADJUST_CLOCK, KVM_CAP_IOEVENTFD, KVM_CAP_IRQCHIP, KVM_CAP_NR_MEMSLOTS,
    KVM_CAP_PIT2, KVM_CAP_SET_TSS_ADDR, KVM_CAP_USER_MEMORY,
};

/// One KVM extension the monitor refuses to run without.
///
/// `KVM_CHECK_EXTENSION` returns 0 when a capability is absent and a
/// positive value when present. For most capabilities any positive value
/// means "supported"; a few report a limit instead (e.g. the number of
/// memory slots), and for those `minimum` states the smallest acceptable
/// value.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityRequirement {
    /// The `KVM_CAP_*` identifier passed to `KVM_CHECK_EXTENSION`.
    pub id: u32,

    /// Human-readable name, used only in error reporting.
    pub name: &'static str,

    /// Smallest acceptable extension value, when the capability reports a
    /// limit rather than a boolean.
    pub minimum: Option<i32>,
}

impl CapabilityRequirement {
    const fn present(id: u32, name: &'static str) -> Self {
        CapabilityRequirement {
            id,
            name,
            minimum: None,
        }
    }

    const fn at_least(id: u32, name: &'static str, minimum: i32) -> Self {
        CapabilityRequirement {
            id,
            name,
            minimum: Some(minimum),
        }
    }

    /// Whether `value`, as returned by `KVM_CHECK_EXTENSION`, satisfies
    /// this requirement.
    pub fn satisfied_by(&self, value: i32) -> bool {
        match self.minimum {
            Some(minimum) => value >= minimum,
            None => value > 0,
        }
    }
}

/// Capabilities checked during negotiation, in probe order.
///
/// These cover the ioctls issued by the control plane and its immediate
/// collaborators: userspace memory slots for guest RAM, the TSS address
/// and in-kernel irqchip/PIT for x86 bring-up, ioeventfd for device
/// emulation, and clock adjustment for time handling. `KVM_CAP_NR_MEMSLOTS`
/// reports a limit, so it carries a floor instead of a boolean check.
pub const REQUIRED_CAPABILITIES: &[CapabilityRequirement] = &[
    CapabilityRequirement::present(KVM_CAP_USER_MEMORY, "user memory"),
    CapabilityRequirement::present(KVM_CAP_SET_TSS_ADDR, "set TSS address"),
    CapabilityRequirement::present(KVM_CAP_IRQCHIP, "in-kernel irqchip"),
    CapabilityRequirement::present(KVM_CAP_PIT2, "in-kernel PIT"),
    CapabilityRequirement::present(KVM_CAP_IOEVENTFD, "ioeventfd"),
    CapabilityRequirement::present(KVM_CAP_ADJUST_CLOCK, "clock adjustment"),
    CapabilityRequirement::at_least(KVM_CAP_NR_MEMSLOTS, "memory slots", 32),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_ids_are_unique() {
        for (i, a) in REQUIRED_CAPABILITIES.iter().enumerate() {
            for b in &REQUIRED_CAPABILITIES[i + 1..] {
                assert_ne!(a.id, b.id, "{} and {} share an id", a.name, b.name);
            }
        }
    }

    #[test]
    fn boolean_requirement_accepts_any_positive_value() {
        let cap = CapabilityRequirement::present(0, "test");
        assert!(!cap.satisfied_by(0));
        assert!(!cap.satisfied_by(-1));
        assert!(cap.satisfied_by(1));
        assert!(cap.satisfied_by(24));
    }

    #[test]
    fn minimum_requirement_enforces_floor() {
        let cap = CapabilityRequirement::at_least(0, "test", 32);
        assert!(!cap.satisfied_by(0));
        assert!(!cap.satisfied_by(31));
        assert!(cap.satisfied_by(32));
        assert!(cap.satisfied_by(509));
    }
}
