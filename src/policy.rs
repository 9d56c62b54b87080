//! Policies: named kernel IP sets used for accept/deny/rate-limit filtering.
//!
//! A policy owns an ordered list of elements (IP or MAC strings). Farms and
//! addresses reference policies by id; the `used` counter tracks live
//! references so the rule emitter knows when a set binding must be kept.

use crate::action::Action;
use crate::error::{Error, Result};
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{PolicyId, Registry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyType {
    #[default]
    Blacklist,
    Whitelist,
    Rtlimit,
}

impl PolicyType {
    pub fn parse(s: &str) -> Option<PolicyType> {
        match s {
            "blacklist" | "black" => Some(PolicyType::Blacklist),
            "whitelist" | "white" => Some(PolicyType::Whitelist),
            "rtlimit" => Some(PolicyType::Rtlimit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Blacklist => "blacklist",
            PolicyType::Whitelist => "whitelist",
            PolicyType::Rtlimit => "rtlimit",
        }
    }
}

/// Which traffic direction the policy set is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    In,
    Out,
}

impl Route {
    pub fn parse(s: &str) -> Option<Route> {
        match s {
            "in" => Some(Route::In),
            "out" => Some(Route::Out),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::In => "in",
            Route::Out => "out",
        }
    }
}

/// One member of a policy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub data: String,
    pub time: Option<String>,
    pub action: Action,
}

/// Named kernel set with a type, family and timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub ptype: PolicyType,
    pub route: Route,
    pub family: crate::address::Family,
    pub timeout: u32,
    pub logprefix: Option<String>,
    pub used: u32,
    pub action: Action,
    pub elements: Vec<Element>,
}

impl Policy {
    pub fn new(id: PolicyId, name: &str) -> Policy {
        Policy {
            id,
            name: name.to_string(),
            ptype: PolicyType::default(),
            route: Route::default(),
            family: crate::address::Family::Ipv4,
            timeout: 0,
            logprefix: None,
            used: 0,
            action: Action::default(),
            elements: Vec::new(),
        }
    }

    pub fn total_elem(&self) -> usize {
        self.elements.len()
    }

    pub fn element(&self, data: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.data == data)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    pub fn policy_by_name(&self, name: &str) -> Option<usize> {
        self.policies.iter().position(|p| p.name == name)
    }

    pub fn policy_idx(&self, id: PolicyId) -> Option<usize> {
        self.policies.iter().position(|p| p.id == id)
    }

    /// Apply an action to a policy, cascading to every farm and address that
    /// references it. Returns whether anything changed.
    pub fn policy_set_action(&mut self, p: usize, action: Action) -> bool {
        let current = self.policies[p].action;
        if current == action || (current == Action::Start && action == Action::Reload) {
            return false;
        }

        tracing::debug!(policy = %self.policies[p].name, action = %action, "policy action");

        if action == Action::Delete {
            self.policy_delete(p);
            return true;
        }

        if action == Action::Stop || action == Action::Reload {
            let name = self.policies[p].name.clone();
            self.farm_s_lookup_policy_action(&name, action);
            self.address_s_lookup_policy_action(&name, action);
        }

        self.policies[p].action = action;
        true
    }

    pub fn policy_s_set_action(&mut self, action: Action) {
        for p in (0..self.policies.len()).rev() {
            self.policy_set_action(p, action);
        }
    }

    /// Remove the policy from the model, dropping every farm and address
    /// reference first. The kernel set teardown is emitted eagerly so a
    /// deleted policy does not leave an orphan set behind.
    fn policy_delete(&mut self, p: usize) {
        let name = self.policies[p].name.clone();
        self.farm_s_lookup_policy_action(&name, Action::Delete);
        self.address_s_lookup_policy_action(&name, Action::Delete);

        let emitter = self.emitter.clone();
        let req = crate::nft::RuleRequest::Policy {
            policy: &self.policies[p],
            action: Action::Delete,
        };
        if let Err(e) = emitter.rulerize(&req) {
            tracing::warn!(policy = %name, error = %e, "policy set teardown failed");
        }

        self.policies.remove(p);
    }

    pub fn policy_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        if pair.key == Key::Name {
            return Ok(true);
        }
        let p = ctx
            .policy
            .and_then(|id| self.policy_idx(id))
            .ok_or_else(|| Error::ObjUnknown("policy".into()))?;
        let p = &self.policies[p];

        Ok(match pair.key {
            Key::NewName => p.name != pair.val.str()?,
            Key::Type => Some(p.ptype) != PolicyType::parse(pair.val.str()?),
            Key::Route => Some(p.route) != Route::parse(pair.val.str()?),
            Key::Family => Some(p.family) != crate::address::Family::parse(pair.val.str()?),
            Key::Timeout => i64::from(p.timeout) != pair.val.int()?,
            Key::LogPrefix => p.logprefix.as_deref() != Some(pair.val.str()?),
            Key::Action => Some(p.action) != Action::parse(pair.val.str()?),
            _ => true,
        })
    }

    pub fn policy_pre_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        let Some(p) = ctx.policy.and_then(|id| self.policy_idx(id)) else {
            // Name creates the cursor; nothing to do before that.
            return Ok(());
        };

        match pair.key {
            Key::Name | Key::NewName | Key::Used | Key::Action => {}
            Key::Family | Key::Route | Key::Timeout => {
                self.policy_set_action(p, Action::Stop);
            }
            _ => {
                self.policy_set_action(p, Action::Reload);
            }
        }
        Ok(())
    }

    pub fn policy_pos_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        // The object may have been deleted by an `action` key.
        let Some(p) = ctx.policy.and_then(|id| self.policy_idx(id)) else {
            return Ok(());
        };

        match pair.key {
            Key::Name | Key::NewName | Key::Used | Key::Action => {}
            Key::Family | Key::Type | Key::Route | Key::Timeout => {
                self.policy_set_action(p, Action::Start);
            }
            _ => {
                self.policy_set_action(p, Action::Reload);
            }
        }
        Ok(())
    }

    pub fn policy_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        if pair.key == Key::Name {
            let name = pair.val.str()?;
            let p = match self.policy_by_name(name) {
                Some(p) => {
                    self.policy_set_action(p, Action::Reload);
                    p
                }
                None => {
                    let id = self.alloc_policy_id();
                    self.policies.push(Policy::new(id, name));
                    let p = self.policies.len() - 1;
                    self.policy_set_action(p, Action::Start);
                    p
                }
            };
            ctx.policy = Some(self.policies[p].id);
            return Ok(());
        }

        let p = ctx
            .policy
            .and_then(|id| self.policy_idx(id))
            .ok_or_else(|| Error::ObjUnknown("policy".into()))?;

        match pair.key {
            Key::NewName => self.policies[p].name = pair.val.str()?.to_string(),
            Key::Type => {
                let ptype = PolicyType::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("policy type {}", pair.val)))?;
                self.policies[p].ptype = ptype;
            }
            Key::Route => {
                let route = Route::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("policy route {}", pair.val)))?;
                self.policies[p].route = route;
            }
            Key::Family => {
                let family = crate::address::Family::parse(pair.val.str()?);
                match family {
                    Some(f @ crate::address::Family::Ipv4)
                    | Some(f @ crate::address::Family::Ipv6) => self.policies[p].family = f,
                    _ => {
                        // Dual-family sets are not supported by the kernel side.
                        tracing::info!(
                            policy = %self.policies[p].name,
                            family = %pair.val,
                            "family not supported for policies"
                        );
                    }
                }
            }
            Key::Timeout => self.policies[p].timeout = pair.val.int()? as u32,
            Key::LogPrefix => self.policies[p].logprefix = Some(pair.val.str()?.to_string()),
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                self.policy_set_action(p, action);
            }
            Key::Used => {}
            _ => return Err(Error::StructFailed(format!("policy key {:?}", pair.key))),
        }

        Ok(())
    }

    // ── Elements ───────────────────────────────────────────────────

    pub fn element_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        if pair.key == Key::Data {
            return Ok(true);
        }
        let p = ctx
            .policy
            .and_then(|id| self.policy_idx(id))
            .ok_or_else(|| Error::ObjUnknown("policy".into()))?;
        let e = ctx
            .element
            .as_deref()
            .and_then(|d| self.policies[p].element(d))
            .ok_or_else(|| Error::ObjUnknown("element".into()))?;
        let e = &self.policies[p].elements[e];

        Ok(match pair.key {
            Key::Time => e.time.as_deref() != Some(pair.val.str()?),
            Key::Action => Some(e.action) != Action::parse(pair.val.str()?),
            _ => true,
        })
    }

    pub fn element_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        let p = ctx
            .policy
            .and_then(|id| self.policy_idx(id))
            .ok_or_else(|| Error::ObjUnknown("policy".into()))?;

        if pair.key == Key::Data {
            let data = pair.val.str()?;
            if self.policies[p].element(data).is_none() {
                self.policies[p].elements.push(Element {
                    data: data.to_string(),
                    time: None,
                    action: Action::Start,
                });
            }
            ctx.element = Some(data.to_string());
            return Ok(());
        }

        let e = ctx
            .element
            .as_deref()
            .and_then(|d| self.policies[p].element(d))
            .ok_or_else(|| Error::ObjUnknown("element".into()))?;

        match pair.key {
            Key::Time => self.policies[p].elements[e].time = Some(pair.val.str()?.to_string()),
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                if action == Action::Delete {
                    self.policies[p].elements.remove(e);
                    ctx.element = None;
                } else if action.overrides(self.policies[p].elements[e].action) {
                    self.policies[p].elements[e].action = action;
                }
            }
            _ => return Err(Error::StructFailed(format!("element key {:?}", pair.key))),
        }

        Ok(())
    }

    /// Element edits always rebuild the parent set.
    pub fn element_actionable(&mut self, ctx: &ParserCtx) -> Result<()> {
        let p = ctx
            .policy
            .and_then(|id| self.policy_idx(id))
            .ok_or_else(|| Error::ObjUnknown("policy".into()))?;
        self.policy_set_action(p, Action::Reload);
        Ok(())
    }

    /// Remove one element by value, reloading the parent policy.
    pub fn element_delete(&mut self, policy: &str, data: &str) -> Result<()> {
        let p = self
            .policy_by_name(policy)
            .ok_or_else(|| Error::NotFound(format!("policy {policy}")))?;
        let e = self.policies[p]
            .element(data)
            .ok_or_else(|| Error::NotFound(format!("element {data}")))?;
        self.policies[p].elements.remove(e);
        self.policy_set_action(p, Action::Reload);
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
    fn policy_created_on_first_name_mention() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();

        assert_eq!(reg.policies.len(), 1);
        assert_eq!(reg.policies[0].name, "blocked");
        assert_eq!(reg.policies[0].action, Action::Start);
        assert_eq!(reg.policies[0].ptype, PolicyType::Blacklist);
    }

    #[test]
    fn timeout_change_stops_then_starts() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();
        reg.policies[0].action = Action::None;

        reg.apply_pair(
            &mut ctx,
            ObjScope::Policy,
            &ConfigPair { key: Key::Timeout, val: Value::Int(120) },
        )
        .unwrap();

        assert_eq!(reg.policies[0].timeout, 120);
        // Post hook promotes the pending Stop to Start for a full rebuild.
        assert_eq!(reg.policies[0].action, Action::Start);
    }

    #[test]
    fn elements_collect_under_current_policy() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Element, &pair(Key::Data, "10.0.0.8"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Element, &pair(Key::Data, "10.0.0.9"))
            .unwrap();

        assert_eq!(reg.policies[0].total_elem(), 2);
        assert_eq!(reg.policies[0].elements[0].data, "10.0.0.8");
    }

    #[test]
    fn duplicate_element_is_not_readded() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Element, &pair(Key::Data, "10.0.0.8"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Element, &pair(Key::Data, "10.0.0.8"))
            .unwrap();

        assert_eq!(reg.policies[0].total_elem(), 1);
    }

    #[test]
    fn dual_family_is_rejected_for_policies() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Name, "blocked"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Policy, &pair(Key::Family, "dual"))
            .unwrap();

        assert_eq!(reg.policies[0].family, crate::address::Family::Ipv4);
    }
}
