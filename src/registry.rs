//! Process-wide object registry.
//!
//! The registry owns the three entity arenas (policies, addresses, farms;
//! farms in turn own their backends, bindings and sessions) and hands out
//! the stable numeric ids that back-references use instead of pointers. It
//! also hosts the global mark allocator and the rulerize driver that walks
//! dirty objects in dependency order.

use std::sync::Arc;

use crate::action::{Action, State};
use crate::address::Address;
use crate::backend::{BACKEND_MARK_MAX, BACKEND_MARK_MIN, DEFAULT_MARK};
use crate::error::{Error, Result};
use crate::farm::Farm;
use crate::net::NetProber;
use crate::nft::{RuleEmitter, RuleRequest};
use crate::policy::Policy;

/// Default masquerade mark band ORed into the effective mark of SNAT farms.
pub const MASQUERADE_MARK_DEFAULT: u32 = 0x80000000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Object ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FarmId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyId(pub u32);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Registry {
    pub farms: Vec<Farm>,
    pub addresses: Vec<Address>,
    pub policies: Vec<Policy>,
    /// Global masquerade mark band (CLI override).
    pub masq_mark: u32,
    pub(crate) emitter: Arc<dyn RuleEmitter>,
    pub(crate) net: Arc<dyn NetProber>,
    next_id: u32,
}

impl Registry {
    pub fn new(emitter: Arc<dyn RuleEmitter>, net: Arc<dyn NetProber>, masq_mark: u32) -> Registry {
        Registry {
            farms: Vec::new(),
            addresses: Vec::new(),
            policies: Vec::new(),
            masq_mark,
            emitter,
            net,
            next_id: 0,
        }
    }

    pub fn total_farms(&self) -> usize {
        self.farms.len()
    }

    pub fn total_addresses(&self) -> usize {
        self.addresses.len()
    }

    pub fn total_policies(&self) -> usize {
        self.policies.len()
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn alloc_farm_id(&mut self) -> FarmId {
        FarmId(self.alloc_id())
    }

    pub(crate) fn alloc_backend_id(&mut self) -> BackendId {
        BackendId(self.alloc_id())
    }

    pub(crate) fn alloc_address_id(&mut self) -> AddressId {
        AddressId(self.alloc_id())
    }

    pub(crate) fn alloc_policy_id(&mut self) -> PolicyId {
        PolicyId(self.alloc_id())
    }

    // ── Mark allocator ─────────────────────────────────────────────

    /// Smallest mark unused across every backend of every farm. On
    /// exhaustion the sentinel is returned: such a backend is not steerable
    /// and rule generation skips it.
    pub fn next_backend_mark(&self) -> u32 {
        for mark in BACKEND_MARK_MIN..=BACKEND_MARK_MAX {
            let taken = self
                .farms
                .iter()
                .any(|f| f.backends.iter().any(|b| b.mark == mark));
            if !taken {
                return mark;
            }
        }
        tracing::warn!("backend mark space exhausted");
        DEFAULT_MARK
    }

    // ── Rulerize driver ────────────────────────────────────────────

    /// Walk every dirty object in dependency order and dispatch it to the
    /// rule emitter: policies first (farms bind their sets), then farms
    /// (each emits with its bound addresses), then stray addresses.
    ///
    /// Objects keep their pending action when the emitter fails, so a later
    /// walk retries; the error carries the aggregate failure count.
    pub fn rulerize_all(&mut self) -> Result<()> {
        let mut failed = 0usize;

        for p in 0..self.policies.len() {
            if self.policies[p].action == Action::None {
                continue;
            }
            let emitter = self.emitter.clone();
            let req = RuleRequest::Policy {
                policy: &self.policies[p],
                action: self.policies[p].action,
            };
            match emitter.rulerize(&req) {
                Ok(()) => self.policies[p].action = Action::None,
                Err(e) => {
                    tracing::warn!(policy = %self.policies[p].name, error = %e,
                                   "policy rulerize failed");
                    failed += 1;
                }
            }
        }

        for f in 0..self.farms.len() {
            if let Err(e) = self.farm_rulerize(f) {
                tracing::warn!(farm = %self.farms[f].name, error = %e, "farm rulerize failed");
                failed += 1;
            }
        }

        for a in 0..self.addresses.len() {
            if let Err(e) = self.address_rulerize(a) {
                tracing::warn!(address = %self.addresses[a].name, error = %e,
                               "address rulerize failed");
                failed += 1;
            }
        }

        if failed > 0 {
            Err(Error::Emit { failed })
        } else {
            Ok(())
        }
    }

    // ── Periodic network refresh ───────────────────────────────────

    /// Re-run interface and neighbor discovery for every ingress farm that
    /// still has unresolved backends, then emit whatever changed.
    pub fn refresh_netinfo(&mut self) {
        for f in 0..self.farms.len() {
            if !self.farms[f].mode.is_ingress() {
                continue;
            }
            if !matches!(self.farms[f].state, State::Up | State::ConfErr) {
                continue;
            }
            self.farm_s_set_netinfo(f);
        }
        if let Err(e) = self.rulerize_all() {
            tracing::warn!(error = %e, "rulerize after netinfo refresh failed");
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Delete every object and flush the kernel rules. Invoked from the
    /// signal handler on shutdown.
    pub fn teardown(&mut self) {
        tracing::info!(
            farms = self.total_farms(),
            addresses = self.total_addresses(),
            policies = self.total_policies(),
            "tearing down"
        );

        self.farm_s_set_action(Action::Delete);
        while !self.addresses.is_empty() {
            self.address_delete(0);
        }
        self.policy_s_set_action(Action::Delete);

        if let Err(e) = self.emitter.clone().rulerize(&RuleRequest::FlushAll) {
            tracing::warn!(error = %e, "final rule flush failed");
        }
    }
}

#[cfg(test)]
impl Registry {
    /// Registry wired to a no-op emitter and an unreachable network prober.
    pub(crate) fn for_tests() -> Registry {
        Registry::new(
            Arc::new(crate::nft::NullEmitter::default()),
            Arc::new(crate::net::UnreachableProber),
            MASQUERADE_MARK_DEFAULT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    #[test]
    fn marks_allocate_smallest_free_value() {
        let mut reg = Registry::for_tests();
        reg.farms.push(Farm::new(FarmId(1), "f1"));
        assert_eq!(reg.next_backend_mark(), 0x001);

        reg.farms[0]
            .backends
            .push(Backend::new(BackendId(2), "b1", 0x001));
        reg.farms[0]
            .backends
            .push(Backend::new(BackendId(3), "b2", 0x003));
        assert_eq!(reg.next_backend_mark(), 0x002);
    }

    #[test]
    fn marks_are_unique_across_farms() {
        let mut reg = Registry::for_tests();
        reg.farms.push(Farm::new(FarmId(1), "f1"));
        reg.farms.push(Farm::new(FarmId(2), "f2"));
        reg.farms[0]
            .backends
            .push(Backend::new(BackendId(3), "b1", 0x001));

        let mark = reg.next_backend_mark();
        assert_eq!(mark, 0x002);
        reg.farms[1]
            .backends
            .push(Backend::new(BackendId(4), "b2", mark));
        assert_eq!(reg.next_backend_mark(), 0x003);
    }

    #[test]
    fn exhausted_mark_space_returns_the_sentinel() {
        let mut reg = Registry::for_tests();
        reg.farms.push(Farm::new(FarmId(1), "f1"));
        for (i, mark) in (BACKEND_MARK_MIN..=BACKEND_MARK_MAX).enumerate() {
            reg.farms[0]
                .backends
                .push(Backend::new(BackendId(i as u32 + 10), "b", mark));
        }
        assert_eq!(reg.next_backend_mark(), DEFAULT_MARK);
    }

    #[test]
    fn deleting_a_backend_frees_its_mark() {
        let mut reg = Registry::for_tests();
        reg.farms.push(Farm::new(FarmId(1), "f1"));
        reg.farms[0]
            .backends
            .push(Backend::new(BackendId(2), "b1", 0x001));
        reg.farms[0]
            .backends
            .push(Backend::new(BackendId(3), "b2", 0x002));

        reg.farms[0].backends.remove(0);
        assert_eq!(reg.next_backend_mark(), 0x001);
    }
}
