//! Backends: real servers behind a farm.
//!
//! A backend owns a steering mark, weight, priority tier and an operational
//! state machine. State transitions are routed: an `Up` request lands in
//! `ConfErr` when the backend fails validation and in `Avail` (hot standby)
//! when its tier sits above the farm's active priority.

use crate::action::{Action, PostAction, State};
use crate::error::{Error, Result};
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{BackendId, Registry};

pub const BACKEND_MARK_MIN: u32 = 0x00000001;
pub const BACKEND_MARK_MAX: u32 = 0x00000FFF;
/// Sentinel mark: the allocator is exhausted and the backend cannot be
/// steered until the operator frees a mark.
pub const DEFAULT_MARK: u32 = 0x0;
pub const DEFAULT_PRIORITY: i32 = 1;
pub const DEFAULT_WEIGHT: i32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: BackendId,
    pub name: String,
    pub fqdn: Option<String>,
    pub ipaddr: Option<String>,
    pub port: Option<String>,
    pub srcaddr: Option<String>,
    pub ethaddr: Option<String>,
    /// Discovered output interface, set only when it differs from the farm's.
    pub oface: Option<String>,
    pub ofidx: Option<u32>,
    pub weight: i32,
    pub priority: i32,
    pub mark: u32,
    pub estconnlimit: i64,
    pub estconnlimit_logprefix: Option<String>,
    pub state: State,
    pub action: Action,
}

impl Backend {
    pub fn new(id: BackendId, name: &str, mark: u32) -> Backend {
        Backend {
            id,
            name: name.to_string(),
            fqdn: None,
            ipaddr: None,
            port: None,
            srcaddr: None,
            ethaddr: None,
            oface: None,
            ofidx: None,
            weight: DEFAULT_WEIGHT,
            priority: DEFAULT_PRIORITY,
            mark,
            estconnlimit: 0,
            estconnlimit_logprefix: None,
            state: State::Up,
            action: Action::Start,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    /// Route a backend state request through the transition rules.
    ///
    /// `Up` requests are demoted to `ConfErr` on validation failure and to
    /// `Avail` when the backend's tier is above the farm priority. Any
    /// transition that leaves an action behind reloads the farm and
    /// recomputes the priority tier.
    pub fn backend_set_state(&mut self, f: usize, b: usize, new_value: State) {
        let old = self.farms[f].backends[b].state;
        let mut new_value = new_value;

        if new_value == State::Up {
            if !self.farms[f].backend_validate(&self.farms[f].backends[b]) {
                new_value = State::ConfErr;
            }
            if !self.farms[f].backend_below_prio(&self.farms[f].backends[b]) {
                new_value = State::Avail;
            }
        }

        if old == new_value {
            return;
        }

        tracing::debug!(
            farm = %self.farms[f].name,
            backend = %self.farms[f].backends[b].name,
            from = %old,
            to = %new_value,
            "backend state"
        );
        self.farms[f].backends[b].state = new_value;

        match new_value {
            State::ConfErr | State::Off => {
                if old == State::Up {
                    self.farms[f].backends[b].action = Action::Stop;
                }
            }
            State::Avail => {
                // Hot standby: parked, session side-effects suppressed.
                if old == State::Up {
                    self.farms[f].backends[b].action = Action::Stop;
                }
            }
            State::Up => {
                if !self.farms[f].persistence.is_empty() {
                    self.session_backend_action(f, b, Action::Start);
                }
                self.farms[f].backends[b].action = if old == State::Off {
                    Action::Reload
                } else {
                    Action::Start
                };
            }
            State::Down => {
                if old == State::Up || old == State::Off {
                    self.farms[f].backends[b].action = Action::Stop;
                }
            }
        }

        if self.farms[f].backends[b].action != Action::None {
            self.farm_set_action(f, Action::Reload);
            self.farm_gen_priority(f);
        }
    }

    /// Apply an action to a backend. `Stop`/`Start` couple into the state
    /// machine; the return value reports whether a kernel-visible action was
    /// recorded (callers bubble that up to the farm).
    pub fn backend_set_action(&mut self, f: usize, b: usize, action: Action) -> bool {
        match action {
            Action::Delete => {
                self.backend_delete(f, b);
                true
            }
            Action::Stop => {
                let mut actionated = false;
                if self.farms[f].backend_available(&self.farms[f].backends[b]) {
                    self.farms[f].backends[b].action = Action::Stop;
                    actionated = true;
                }
                self.backend_set_state(f, b, State::Down);
                actionated
            }
            Action::Start => {
                let mut actionated = false;
                if !self.farms[f].backend_available(&self.farms[f].backends[b]) {
                    self.farms[f].backends[b].action = Action::Start;
                    actionated = true;
                }
                self.backend_set_state(f, b, State::Up);
                actionated
            }
            _ => {
                if action.overrides(self.farms[f].backends[b].action) {
                    self.farms[f].backends[b].action = action;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Delete a backend: stop it, detach its sessions, free its mark and
    /// rebalance the farm. The kernel is reprogrammed twice when the backend
    /// was part of the active tier (once without it in the pool, once after
    /// the tier settles).
    pub fn backend_delete(&mut self, f: usize, b: usize) {
        self.backend_set_action(f, b, Action::Stop);
        self.session_backend_action(f, b, Action::Stop);

        if self.farms[f].backend_below_prio(&self.farms[f].backends[b]) {
            self.farm_gen_priority(f);
            if let Err(e) = self.rulerize_all() {
                tracing::warn!(error = %e, "rulerize after backend stop failed");
            }
        }

        self.session_backend_action(f, b, Action::Delete);

        let name = self.farms[f].backends[b].name.clone();
        self.farms[f].backends.remove(b);
        self.farms[f].total_bcks = self.farms[f].total_bcks.saturating_sub(1);
        self.farms[f].recount_ports();
        self.farms[f].recount_srcaddr();
        self.farms[f].recount_have_iface();
        tracing::debug!(farm = %self.farms[f].name, backend = %name, "backend deleted");

        if self.farm_gen_priority(f) {
            self.farm_set_action(f, Action::Reload);
            self.farmaddress_s_set_action(f, Action::Reload);
            if let Err(e) = self.rulerize_all() {
                tracing::warn!(error = %e, "rulerize after backend delete failed");
            }
        }
    }

    // ── Network discovery ──────────────────────────────────────────

    /// Discover the output interface serving the backend's IP. The farm
    /// adopts the first discovered index; backends reached through another
    /// interface record their own and flag the farm.
    fn backend_set_ifinfo(&mut self, f: usize, b: usize) -> bool {
        if !self.farms[f].mode.is_ingress()
            || !matches!(self.farms[f].state, State::Up | State::ConfErr)
        {
            return true;
        }

        if self.farms[f].oface.as_deref() == Some("lo") {
            self.farms[f].ofidx = Some(0);
            return true;
        }

        let Some(ip) = self.farms[f].backends[b].ipaddr.clone() else {
            tracing::debug!(farm = %self.farms[f].name, "backend has no address for ifinfo yet");
            return true;
        };

        let (ifidx, ifname) = match self.net.local_ifindex(&ip) {
            Ok(v) => v,
            Err(e) => {
                tracing::info!(
                    farm = %self.farms[f].name,
                    backend = %self.farms[f].backends[b].name,
                    ip = %ip,
                    error = %e,
                    "no outbound interface for backend"
                );
                return false;
            }
        };

        if self.farms[f].ofidx.is_none() {
            self.farms[f].ofidx = Some(ifidx);
        }
        if self.farms[f].ofidx != Some(ifidx) {
            self.farms[f].bcks_have_if = true;
            self.farms[f].backends[b].ofidx = Some(ifidx);
        }

        if self.farms[f].oface.is_none() {
            self.farms[f].oface = Some(ifname);
        } else if self.farms[f].oface.as_deref() != Some(ifname.as_str()) {
            self.farms[f].backends[b].oface = Some(ifname);
        }
        true
    }

    /// Resolve the backend MAC through neighbor discovery, retrying once
    /// with the farm/backend overrides of output interface and source
    /// address.
    fn backend_resolve_ether(&mut self, f: usize, b: usize) -> bool {
        if !self.farms[f].mode.is_ingress()
            || !matches!(self.farms[f].state, State::Up | State::ConfErr)
        {
            return true;
        }

        let Some(fa) = self.farms[f].addresses.first() else {
            tracing::info!(farm = %self.farms[f].name, "no farm address configured");
            return false;
        };
        let Some(a) = self.address_idx(fa.address) else {
            return false;
        };

        let farm = &self.farms[f];
        let bck = &farm.backends[b];
        let addr = &self.addresses[a];

        let (Some(src_mac), Some(dst_ip)) = (addr.ethaddr.clone(), bck.ipaddr.clone()) else {
            return false;
        };
        if farm.ofidx.is_none() {
            return false;
        }
        let family = addr.family;

        let src_ip = farm
            .srcaddr
            .clone()
            .or_else(|| addr.ipaddr.clone());

        let first = match (addr.ifidx, &src_ip) {
            (Some(ifidx), Some(src)) => self
                .net
                .neigh_ether(family, &src_mac, src, &dst_ip, ifidx)
                .ok(),
            _ => None,
        };

        let resolved = first.or_else(|| {
            let farm = &self.farms[f];
            let bck = &farm.backends[b];
            let ifidx = bck.ofidx.or(farm.ofidx)?;
            let src = bck
                .srcaddr
                .clone()
                .or_else(|| farm.srcaddr.clone())
                .or_else(|| self.addresses.get(a).and_then(|ad| ad.ipaddr.clone()))?;
            self.net.neigh_ether(family, &src_mac, &src, &dst_ip, ifidx).ok()
        });

        match resolved {
            Some(mac) => {
                tracing::debug!(
                    backend = %self.farms[f].backends[b].name,
                    ether = %mac,
                    "discovered ether address"
                );
                self.farms[f].backends[b].ethaddr = Some(mac);
                true
            }
            None => false,
        }
    }

    /// Run both discovery steps and route the backend state on the outcome.
    pub fn backend_set_netinfo(&mut self, f: usize, b: usize) {
        if self.backend_set_ifinfo(f, b) && self.backend_resolve_ether(f, b) {
            if self.farms[f].backends[b].state == State::ConfErr {
                self.backend_set_state(f, b, State::Up);
            }
        } else {
            self.backend_set_state(f, b, State::ConfErr);
        }
    }

    /// Re-resolve every backend that currently fails validation.
    pub fn farm_s_set_netinfo(&mut self, f: usize) {
        for b in 0..self.farms[f].backends.len() {
            if self.farms[f].backend_validate(&self.farms[f].backends[b]) {
                continue;
            }
            self.backend_set_netinfo(f, b);
        }
    }

    /// Kernel neighbor-table update entry point: refresh the MAC of every
    /// backend carrying `ip`. Under persistence the kernel session set is
    /// refreshed and reloaded so affinity entries follow the new MAC.
    pub fn backend_s_set_ether_by_ipaddr(&mut self, f: usize, ip: &str, mac: &str) -> bool {
        let mut changed = false;
        for b in 0..self.farms[f].backends.len() {
            if self.farms[f].backends[b].ipaddr.as_deref() != Some(ip) {
                continue;
            }
            if self.farms[f].backends[b].ethaddr.as_deref() == Some(mac) {
                continue;
            }

            let has_persist = !self.farms[f].persistence.is_empty();
            if has_persist {
                self.session_get_timed(f);
            }
            self.farms[f].backends[b].ethaddr = Some(mac.to_string());
            changed = true;
            if has_persist {
                self.session_backend_action(f, b, Action::Reload);
                self.farm_set_action(f, Action::Reload);
                if let Err(e) = self.rulerize_all() {
                    tracing::warn!(error = %e, "rulerize after ether update failed");
                }
                self.session_s_delete(f, crate::session::SessionType::Timed);
            }

            tracing::info!(
                backend = %self.farms[f].backends[b].name,
                ether = %mac,
                "ether address changed for backend"
            );
        }
        changed
    }

    // ── Attribute plumbing ─────────────────────────────────────────

    pub fn backend_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;
        if pair.key == Key::Name {
            return Ok(true);
        }
        let b = ctx
            .backend
            .and_then(|id| self.farms[f].backend_idx(id))
            .ok_or_else(|| Error::ObjUnknown("backend".into()))?;
        let b = &self.farms[f].backends[b];

        Ok(match pair.key {
            Key::NewName => b.name != pair.val.str()?,
            Key::Fqdn => b.fqdn.as_deref() != Some(pair.val.str()?),
            Key::IpAddr => b.ipaddr.as_deref() != Some(pair.val.str()?),
            Key::EthAddr => b.ethaddr.as_deref() != Some(pair.val.str()?),
            Key::Port => b.port.as_deref() != Some(pair.val.str()?),
            Key::SrcAddr => b.srcaddr.as_deref() != Some(pair.val.str()?),
            Key::Weight => i64::from(b.weight) != pair.val.int()?,
            Key::Priority => i64::from(b.priority) != pair.val.int()?,
            Key::Mark => {
                let raw = pair.val.str()?.trim_start_matches("0x");
                u32::from_str_radix(raw, 16).map_or(true, |m| m != b.mark)
            }
            Key::State => {
                let req = State::parse(pair.val.str()?);
                let req = if req == Some(State::ConfErr) { Some(State::Up) } else { req };
                Some(b.state) != req
            }
            Key::EstConnLimit => b.estconnlimit != pair.val.int()?,
            Key::EstConnLimitLogPrefix => {
                b.estconnlimit_logprefix.as_deref() != Some(pair.val.str()?)
            }
            Key::Action => Some(b.action) != Action::parse(pair.val.str()?),
            _ => true,
        })
    }

    pub fn backend_pre_actionable(
        &mut self,
        ctx: &ParserCtx,
        pair: &ConfigPair,
    ) -> Result<PostAction> {
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Err(Error::ObjUnknown("farm".into()));
        };
        if pair.key == Key::Name {
            return Ok(PostAction::None);
        }
        let Some(b) = ctx.backend.and_then(|id| self.farms[f].backend_idx(id)) else {
            return Err(Error::ObjUnknown("backend".into()));
        };

        let state = self.farms[f].backends[b].state;

        // Changing the priority of a parked backend can redistribute the
        // others: force a full farm restart.
        if state != State::Up && state != State::ConfErr && pair.key == Key::Priority {
            self.farm_set_action(f, Action::Stop);
            self.farmaddress_s_set_action(f, Action::Stop);
            if let Err(e) = self.farm_rulerize(f) {
                tracing::warn!(error = %e, "farm stop failed, keeping pending action");
            }
            return Ok(PostAction::Flush);
        }

        if state != State::Up && pair.key != Key::State {
            return Ok(PostAction::None);
        }

        match pair.key {
            Key::EthAddr
            | Key::IpAddr
            | Key::SrcAddr
            | Key::Mark
            | Key::Priority
            | Key::EstConnLimit => {
                // Identity keys: the live rules reference the old value, stop
                // the backend and emit before mutating.
                if self.backend_set_action(f, b, Action::Stop) {
                    self.farm_set_action(f, Action::Reload);
                    self.farmaddress_s_set_action(f, Action::Reload);
                    if let Err(e) = self.farm_rulerize(f) {
                        tracing::warn!(error = %e, "backend stop failed, keeping pending action");
                    }
                }
                Ok(PostAction::Start)
            }
            Key::Port | Key::State | Key::Weight | Key::EstConnLimitLogPrefix => {
                Ok(PostAction::Reload)
            }
            _ => Ok(PostAction::None),
        }
    }

    pub fn backend_pos_actionable(
        &mut self,
        ctx: &ParserCtx,
        _pair: &ConfigPair,
        action: PostAction,
    ) -> Result<()> {
        // The object may have been deleted by an `action` key.
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Ok(());
        };
        let Some(b) = ctx.backend.and_then(|id| self.farms[f].backend_idx(id)) else {
            return Ok(());
        };

        match action {
            PostAction::Start => {
                if self.backend_set_action(f, b, Action::Start) {
                    self.farm_set_action(f, Action::Reload);
                    self.farmaddress_s_set_action(f, Action::Reload);
                    if let Err(e) = self.farm_rulerize(f) {
                        tracing::warn!(error = %e, "backend start failed, keeping pending action");
                    }
                }
            }
            PostAction::Reload => {
                self.farm_set_action(f, Action::Reload);
            }
            PostAction::Flush => {
                self.farm_set_action(f, Action::Start);
                if let Err(e) = self.farm_rulerize(f) {
                    tracing::warn!(error = %e, "farm restart failed, keeping pending action");
                }
            }
            PostAction::None => {}
        }
        Ok(())
    }

    pub fn backend_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;

        if pair.key == Key::Name {
            let name = pair.val.str()?;
            let b = match self.farms[f].backend_by_name(name) {
                Some(b) => b,
                None => {
                    let mark = self.next_backend_mark();
                    let id = self.alloc_backend_id();
                    let farm = &mut self.farms[f];
                    farm.backends.push(Backend::new(id, name, mark));
                    farm.total_bcks += 1;
                    farm.bcks_have_port = false;
                    farm.backends.len() - 1
                }
            };
            ctx.backend = Some(self.farms[f].backends[b].id);
            return Ok(());
        }

        let b = ctx
            .backend
            .and_then(|id| self.farms[f].backend_idx(id))
            .ok_or_else(|| Error::ObjUnknown("backend".into()))?;

        match pair.key {
            Key::NewName => self.farms[f].backends[b].name = pair.val.str()?.to_string(),
            Key::Fqdn => self.farms[f].backends[b].fqdn = Some(pair.val.str()?.to_string()),
            Key::IpAddr => self.backend_set_ipaddr(f, b, pair.val.str()?),
            Key::EthAddr => {
                self.farms[f].backends[b].ethaddr = Some(pair.val.str()?.to_string());
            }
            Key::Port => self.backend_set_port(f, b, pair.val.str()?),
            Key::SrcAddr => self.backend_set_srcaddr(f, b, pair.val.str()?),
            Key::Weight => self.backend_set_weight(f, b, pair.val.int()?),
            Key::Priority => self.backend_set_priority(f, b, pair.val.int()?),
            Key::Mark => {
                let raw = pair.val.str()?.trim_start_matches("0x");
                match u32::from_str_radix(raw, 16) {
                    Ok(mark) => self.backend_set_mark(f, b, mark),
                    Err(_) => {
                        tracing::info!(value = %pair.val, "invalid backend mark, ignored");
                    }
                }
            }
            Key::State => {
                let state = State::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("state {}", pair.val)))?;
                let state = if state == State::ConfErr { State::Up } else { state };
                self.backend_set_state(f, b, state);
            }
            Key::EstConnLimit => self.farms[f].backends[b].estconnlimit = pair.val.int()?,
            Key::EstConnLimitLogPrefix => {
                self.farms[f].backends[b].estconnlimit_logprefix =
                    Some(pair.val.str()?.to_string());
            }
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                self.backend_set_action(f, b, action);
            }
            _ => return Err(Error::StructFailed(format!("backend key {:?}", pair.key))),
        }

        Ok(())
    }

    // ── Field setters with coupled side effects ────────────────────

    /// A new IP invalidates the resolved MAC; rediscover and route the
    /// backend state on the outcome (unless this is the first assignment).
    fn backend_set_ipaddr(&mut self, f: usize, b: usize, new_value: &str) {
        let old = self.farms[f].backends[b].ipaddr.take();
        self.farms[f].backends[b].ipaddr = Some(new_value.to_string());
        self.farms[f].backends[b].ethaddr = None;

        let netconfig = self.backend_set_ifinfo(f, b) && self.backend_resolve_ether(f, b);

        if old.is_none() {
            return;
        }

        if netconfig {
            if self.farms[f].backends[b].state == State::ConfErr {
                self.backend_set_state(f, b, State::Up);
            }
        } else {
            self.backend_set_state(f, b, State::ConfErr);
        }
    }

    fn backend_set_port(&mut self, f: usize, b: usize, new_value: &str) {
        self.farms[f].backends[b].port = if new_value.is_empty() {
            None
        } else {
            Some(new_value.to_string())
        };
        self.farms[f].recount_ports();
    }

    fn backend_set_srcaddr(&mut self, f: usize, b: usize, new_value: &str) {
        self.farms[f].backends[b].srcaddr = if new_value.is_empty() {
            None
        } else {
            Some(new_value.to_string())
        };
        self.farms[f].recount_srcaddr();
    }

    fn backend_set_weight(&mut self, f: usize, b: usize, new_value: i64) {
        let old = self.farms[f].backends[b].weight;
        let new_value = new_value as i32;
        self.farms[f].backends[b].weight = new_value;

        if self.farms[f].backend_available(&self.farms[f].backends[b]) {
            self.farms[f].total_weight += new_value - old;
        }
    }

    fn backend_set_priority(&mut self, f: usize, b: usize, new_value: i64) {
        if new_value <= 0 {
            tracing::info!(value = new_value, "invalid backend priority, ignored");
            return;
        }
        self.farms[f].backends[b].priority = new_value as i32;
        self.farm_gen_priority(f);
    }

    /// Manual mark override. Out-of-band or already-taken values are
    /// ignored so mark uniqueness holds across the registry.
    fn backend_set_mark(&mut self, f: usize, b: usize, new_value: u32) {
        if !(BACKEND_MARK_MIN..=BACKEND_MARK_MAX).contains(&new_value) {
            return;
        }
        let id = self.farms[f].backends[b].id;
        let taken = self
            .farms
            .iter()
            .flat_map(|farm| farm.backends.iter())
            .any(|bck| bck.id != id && bck.mark == new_value);
        if taken {
            tracing::info!(mark = format!("0x{new_value:x}"), "mark already in use, ignored");
            return;
        }
        self.farms[f].backends[b].mark = new_value;
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

    fn int_pair(key: Key, val: i64) -> ConfigPair {
        ConfigPair { key, val: Value::Int(val) }
    }

    fn farm_with_backend(reg: &mut Registry, ctx: &mut ParserCtx, bck: &str, ip: &str) {
        if reg.farms.is_empty() {
            reg.apply_pair(ctx, ObjScope::Farm, &pair(Key::Name, "f1")).unwrap();
            reg.apply_pair(ctx, ObjScope::Farm, &pair(Key::Mode, "dnat")).unwrap();
        }
        reg.apply_pair(ctx, ObjScope::Backend, &pair(Key::Name, bck)).unwrap();
        reg.apply_pair(ctx, ObjScope::Backend, &pair(Key::IpAddr, ip)).unwrap();
    }

    #[test]
    fn backend_starts_up_with_allocated_mark() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");

        let b = &reg.farms[0].backends[0];
        assert_eq!(b.mark, 0x001);
        assert_eq!(b.state, State::Up);
        assert_eq!(reg.farms[0].total_bcks, 1);
    }

    #[test]
    fn invalid_priority_is_silently_rejected() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");

        reg.apply_pair(&mut ctx, ObjScope::Backend, &int_pair(Key::Priority, 0))
            .unwrap();
        assert_eq!(reg.farms[0].backends[0].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn duplicate_manual_mark_is_rejected() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");
        farm_with_backend(&mut reg, &mut ctx, "b2", "10.0.0.2");

        reg.apply_pair(&mut ctx, ObjScope::Backend, &pair(Key::Mark, "0x001"))
            .unwrap();
        // b2 keeps its allocated mark, 0x001 belongs to b1.
        assert_eq!(reg.farms[0].backends[1].mark, 0x002);
    }

    #[test]
    fn down_state_drops_weight_from_the_pool() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");
        reg.apply_pair(&mut ctx, ObjScope::Backend, &int_pair(Key::Weight, 2))
            .unwrap();
        farm_with_backend(&mut reg, &mut ctx, "b2", "10.0.0.2");
        reg.apply_pair(&mut ctx, ObjScope::Backend, &int_pair(Key::Weight, 3))
            .unwrap();
        assert_eq!(reg.farms[0].total_weight, 5);

        // Target b1 again and take it down.
        reg.apply_pair(&mut ctx, ObjScope::Backend, &pair(Key::Name, "b1"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Backend, &pair(Key::State, "down"))
            .unwrap();

        assert_eq!(reg.farms[0].total_weight, 3);
        assert_eq!(reg.farms[0].bcks_available, 1);
        assert_eq!(reg.farms[0].action, Action::Reload);
    }

    #[test]
    fn neighbor_update_refreshes_matching_backends() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");
        farm_with_backend(&mut reg, &mut ctx, "b2", "10.0.0.2");

        assert!(reg.backend_s_set_ether_by_ipaddr(0, "10.0.0.1", "02:00:00:aa:bb:01"));
        assert_eq!(
            reg.farms[0].backends[0].ethaddr.as_deref(),
            Some("02:00:00:aa:bb:01")
        );
        assert!(reg.farms[0].backends[1].ethaddr.is_none());

        // Same MAC again is a no-op.
        assert!(!reg.backend_s_set_ether_by_ipaddr(0, "10.0.0.1", "02:00:00:aa:bb:01"));
    }

    #[test]
    fn conferr_state_request_routes_to_up() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        farm_with_backend(&mut reg, &mut ctx, "b1", "10.0.0.1");
        reg.apply_pair(&mut ctx, ObjScope::Backend, &pair(Key::State, "down"))
            .unwrap();

        reg.apply_pair(&mut ctx, ObjScope::Backend, &pair(Key::State, "conferr"))
            .unwrap();
        assert_eq!(reg.farms[0].backends[0].state, State::Up);
    }
}
