//! Listening endpoints: an IP + port(s) + protocol on an input interface.
//!
//! Addresses are registry-owned and shared: any number of farms may bind the
//! same address through a `FarmAddress`. The `used` counter mirrors the
//! number of live bindings.

use crate::action::Action;
use crate::error::{Error, Result};
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{AddressId, PolicyId, Registry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Ipv4,
    Ipv6,
    Dual,
}

impl Family {
    pub fn parse(s: &str) -> Option<Family> {
        match s {
            "ipv4" => Some(Family::Ipv4),
            "ipv6" => Some(Family::Ipv6),
            "dual" => Some(Family::Dual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
            Family::Dual => "dual",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
    All,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Protocol> {
        match s {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "sctp" => Some(Protocol::Sctp),
            "all" => Some(Protocol::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::All => "all",
        }
    }
}

/// Listening endpoint shared by farms.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub id: AddressId,
    pub name: String,
    pub family: Family,
    pub protocol: Protocol,
    pub ipaddr: Option<String>,
    pub ports: Option<String>,
    pub iface: Option<String>,
    pub ifidx: Option<u32>,
    /// MAC of the input interface, used as source for neighbor discovery.
    pub ethaddr: Option<String>,
    pub logprefix: Option<String>,
    pub policies: Vec<PolicyId>,
    pub action: Action,
    /// Number of farms bound to this address.
    pub nported: u32,
    /// Live FarmAddress references.
    pub used: u32,
}

impl Address {
    pub fn new(id: AddressId, name: &str) -> Address {
        Address {
            id,
            name: name.to_string(),
            family: Family::default(),
            protocol: Protocol::default(),
            ipaddr: None,
            ports: None,
            iface: None,
            ifidx: None,
            ethaddr: None,
            logprefix: None,
            policies: Vec::new(),
            action: Action::default(),
            nported: 0,
            used: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    pub fn address_by_name(&self, name: &str) -> Option<usize> {
        self.addresses.iter().position(|a| a.name == name)
    }

    pub fn address_idx(&self, id: AddressId) -> Option<usize> {
        self.addresses.iter().position(|a| a.id == id)
    }

    /// Look up or create an address by name, returning its index.
    pub fn address_get_or_create(&mut self, name: &str) -> usize {
        if let Some(a) = self.address_by_name(name) {
            return a;
        }
        let id = self.alloc_address_id();
        self.addresses.push(Address::new(id, name));
        let a = self.addresses.len() - 1;
        self.addresses[a].action = Action::Start;
        a
    }

    pub fn address_set_action(&mut self, a: usize, action: Action) -> bool {
        if action == Action::Delete {
            self.address_delete(a);
            return true;
        }
        if action.overrides(self.addresses[a].action) {
            self.addresses[a].action = action;
            return true;
        }
        false
    }

    /// Delete an address: unbind it from every farm, release its policy
    /// references, emit the kernel teardown and drop it from the model.
    pub fn address_delete(&mut self, a: usize) {
        let id = self.addresses[a].id;
        let name = self.addresses[a].name.clone();

        for f in 0..self.farms.len() {
            let before = self.farms[f].addresses.len();
            self.farms[f].addresses.retain(|fa| fa.address != id);
            if self.farms[f].addresses.len() != before {
                self.farm_set_action(f, Action::Reload);
            }
        }

        let refs: Vec<PolicyId> = self.addresses[a].policies.clone();
        for pid in refs {
            if let Some(p) = self.policy_idx(pid) {
                self.policies[p].used = self.policies[p].used.saturating_sub(1);
            }
        }

        let emitter = self.emitter.clone();
        let policies = self.address_policy_refs(a);
        let req = crate::nft::RuleRequest::Address {
            address: &self.addresses[a],
            policies,
            action: Action::Delete,
        };
        if let Err(e) = emitter.rulerize(&req) {
            tracing::warn!(address = %name, error = %e, "address teardown failed");
        }

        self.addresses.remove(a);
    }

    /// Resolve the referenced policies of an address for a rule request.
    pub fn address_policy_refs(&self, a: usize) -> Vec<&crate::policy::Policy> {
        self.addresses[a]
            .policies
            .iter()
            .filter_map(|pid| self.policy_idx(*pid).map(|p| &self.policies[p]))
            .collect()
    }

    /// Emit the pending rules for one address and clear its action.
    pub fn address_rulerize(&mut self, a: usize) -> Result<()> {
        if self.addresses[a].action == Action::None {
            return Ok(());
        }
        let emitter = self.emitter.clone();
        let req = crate::nft::RuleRequest::Address {
            address: &self.addresses[a],
            policies: self.address_policy_refs(a),
            action: self.addresses[a].action,
        };
        emitter.rulerize(&req)?;
        self.addresses[a].action = Action::None;
        Ok(())
    }

    /// Propagate a policy action to every address referencing it.
    pub fn address_s_lookup_policy_action(&mut self, policy: &str, action: Action) {
        let Some(pid) = self.policy_by_name(policy).map(|p| self.policies[p].id) else {
            return;
        };
        for a in 0..self.addresses.len() {
            if !self.addresses[a].policies.contains(&pid) {
                continue;
            }
            if action == Action::Delete {
                self.addresses[a].policies.retain(|r| *r != pid);
                if let Some(p) = self.policy_idx(pid) {
                    self.policies[p].used = self.policies[p].used.saturating_sub(1);
                }
            }
            self.address_set_action(a, Action::Reload);
        }
    }

    pub fn address_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        if pair.key == Key::Name {
            return Ok(true);
        }
        let a = ctx
            .address
            .and_then(|id| self.address_idx(id))
            .ok_or_else(|| Error::ObjUnknown("address".into()))?;
        let a = &self.addresses[a];

        Ok(match pair.key {
            Key::NewName => a.name != pair.val.str()?,
            Key::Family => Some(a.family) != Family::parse(pair.val.str()?),
            Key::Protocol => Some(a.protocol) != Protocol::parse(pair.val.str()?),
            Key::IpAddr => a.ipaddr.as_deref() != Some(pair.val.str()?),
            Key::Ports => a.ports.as_deref() != Some(pair.val.str()?),
            Key::Iface => a.iface.as_deref() != Some(pair.val.str()?),
            Key::LogPrefix => a.logprefix.as_deref() != Some(pair.val.str()?),
            Key::Action => Some(a.action) != Action::parse(pair.val.str()?),
            _ => true,
        })
    }

    pub fn address_pre_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        let Some(a) = ctx.address.and_then(|id| self.address_idx(id)) else {
            return Ok(());
        };

        match pair.key {
            Key::Family | Key::Protocol | Key::IpAddr | Key::Ports | Key::Iface => {
                // Identity change: the listener must be torn down before the
                // new value lands, and every bound farm reprogrammed.
                if self.address_set_action(a, Action::Stop) {
                    let id = self.addresses[a].id;
                    for f in 0..self.farms.len() {
                        if self.farms[f].addresses.iter().any(|fa| fa.address == id) {
                            self.farm_set_action(f, Action::Reload);
                        }
                    }
                    if let Err(e) = self.address_rulerize(a) {
                        tracing::warn!(error = %e, "address stop failed, keeping pending action");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn address_pos_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        // The object may have been deleted by an `action` key.
        let Some(a) = ctx.address.and_then(|id| self.address_idx(id)) else {
            return Ok(());
        };

        match pair.key {
            Key::Family | Key::Protocol | Key::IpAddr | Key::Ports | Key::Iface => {
                self.address_set_action(a, Action::Start);
                let id = self.addresses[a].id;
                for f in 0..self.farms.len() {
                    if self.farms[f].addresses.iter().any(|fa| fa.address == id) {
                        self.farm_set_action(f, Action::Reload);
                    }
                }
            }
            Key::LogPrefix => {
                self.address_set_action(a, Action::Reload);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn address_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        if pair.key == Key::Name {
            let a = self.address_get_or_create(pair.val.str()?);
            ctx.address = Some(self.addresses[a].id);
            return Ok(());
        }

        let a = ctx
            .address
            .and_then(|id| self.address_idx(id))
            .ok_or_else(|| Error::ObjUnknown("address".into()))?;

        match pair.key {
            Key::NewName => self.addresses[a].name = pair.val.str()?.to_string(),
            Key::Family => {
                let family = Family::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("family {}", pair.val)))?;
                self.addresses[a].family = family;
            }
            Key::Protocol => {
                let protocol = Protocol::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("protocol {}", pair.val)))?;
                self.addresses[a].protocol = protocol;
            }
            Key::IpAddr => self.addresses[a].ipaddr = Some(pair.val.str()?.to_string()),
            Key::Ports => self.addresses[a].ports = Some(pair.val.str()?.to_string()),
            Key::Iface => {
                let iface = pair.val.str()?.to_string();
                match self.net.iface_info(&iface) {
                    Ok((ifidx, mac)) => {
                        self.addresses[a].ifidx = Some(ifidx);
                        self.addresses[a].ethaddr = Some(mac);
                    }
                    Err(e) => {
                        tracing::info!(address = %self.addresses[a].name, iface = %iface,
                                       error = %e, "input interface lookup failed");
                        self.addresses[a].ifidx = None;
                        self.addresses[a].ethaddr = None;
                    }
                }
                self.addresses[a].iface = Some(iface);
            }
            Key::LogPrefix => self.addresses[a].logprefix = Some(pair.val.str()?.to_string()),
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                self.address_set_action(a, action);
            }
            _ => return Err(Error::StructFailed(format!("address key {:?}", pair.key))),
        }

        Ok(())
    }

    // ── Address policy references ──────────────────────────────────

    pub fn address_policy_set_attribute(
        &mut self,
        ctx: &mut ParserCtx,
        pair: &ConfigPair,
    ) -> Result<()> {
        let a = ctx
            .address
            .and_then(|id| self.address_idx(id))
            .ok_or_else(|| Error::ObjUnknown("address".into()))?;

        match pair.key {
            Key::Name => {
                let p = self
                    .policy_by_name(pair.val.str()?)
                    .ok_or_else(|| Error::ObjUnknown(format!("policy {}", pair.val)))?;
                let pid = self.policies[p].id;
                if !self.addresses[a].policies.contains(&pid) {
                    self.addresses[a].policies.push(pid);
                    self.policies[p].used += 1;
                    self.address_set_action(a, Action::Reload);
                }
            }
            Key::Action => {
                if Action::parse(pair.val.str()?) == Some(Action::Delete) {
                    // Deleting the reference, not the policy itself.
                    if let Some(pid) = self.addresses[a].policies.last().copied() {
                        self.addresses[a].policies.retain(|r| *r != pid);
                        if let Some(p) = self.policy_idx(pid) {
                            self.policies[p].used = self.policies[p].used.saturating_sub(1);
                        }
                        self.address_set_action(a, Action::Reload);
                    }
                }
            }
            _ => return Err(Error::StructFailed(format!("address policy key {:?}", pair.key))),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ObjScope, Value};
    use crate::registry::Registry;

    fn pair(key: Key, val: &str) -> ConfigPair {
        ConfigPair { key, val: Value::Str(val.to_string()) }
    }

    #[test]
    fn address_created_with_defaults() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Address, &pair(Key::Name, "web80"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Address, &pair(Key::IpAddr, "192.168.1.10"))
            .unwrap();

        let a = &reg.addresses[0];
        assert_eq!(a.name, "web80");
        assert_eq!(a.family, Family::Ipv4);
        assert_eq!(a.protocol, Protocol::Tcp);
        assert_eq!(a.ipaddr.as_deref(), Some("192.168.1.10"));
        assert_eq!(a.used, 0);
    }

    #[test]
    fn attaching_unknown_policy_fails() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Address, &pair(Key::Name, "web80"))
            .unwrap();

        let err = reg
            .apply_pair(&mut ctx, ObjScope::AddressPolicy, &pair(Key::Name, "nope"))
            .unwrap_err();
        assert!(matches!(err, Error::ObjUnknown(_)));
    }

    #[test]
    fn policy_attach_bumps_used() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Address, &pair(Key::Name, "web80"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::AddressPolicy, &pair(Key::Name, "blocked"))
            .unwrap();

        assert_eq!(reg.policies[0].used, 1);
        assert_eq!(reg.addresses[0].policies.len(), 1);
    }
}
