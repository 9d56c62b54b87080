//! Farms: virtual load-balanced services.
//!
//! A farm aggregates backends, address bindings, policy references and
//! session tables, and carries the scheduler/persistence configuration the
//! rule emitter turns into kernel verdict maps. The farm priority is a
//! computed field: it tracks the lowest backend tier that still has life in
//! it so hot-standby backends take over when a tier dies.

use crate::action::{Action, PostAction, State};
use crate::backend::{Backend, DEFAULT_PRIORITY};
use crate::error::{Error, Result};
use crate::farmaddress::FarmAddress;
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{BackendId, FarmId, PolicyId, Registry};
use crate::session::Session;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Snat,
    Dnat,
    Dsr,
    StlsDnat,
    Local,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Mode> {
        match s {
            "snat" => Some(Mode::Snat),
            "dnat" => Some(Mode::Dnat),
            "dsr" => Some(Mode::Dsr),
            "stlsdnat" => Some(Mode::StlsDnat),
            "local" => Some(Mode::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Snat => "snat",
            Mode::Dnat => "dnat",
            Mode::Dsr => "dsr",
            Mode::StlsDnat => "stlsdnat",
            Mode::Local => "local",
        }
    }

    /// Ingress modes rewrite the destination MAC instead of NATing, so every
    /// backend needs a resolved ethernet address.
    pub fn is_ingress(&self) -> bool {
        matches!(self, Mode::Dsr | Mode::StlsDnat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduler {
    #[default]
    Rr,
    Weight,
    Hash,
    SymHash,
}

impl Scheduler {
    pub fn parse(s: &str) -> Option<Scheduler> {
        match s {
            "rr" => Some(Scheduler::Rr),
            "weight" => Some(Scheduler::Weight),
            "hash" => Some(Scheduler::Hash),
            "symhash" => Some(Scheduler::SymHash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheduler::Rr => "rr",
            Scheduler::Weight => "weight",
            Scheduler::Hash => "hash",
            Scheduler::SymHash => "symhash",
        }
    }
}

bitflags::bitflags! {
    /// Packet meta components used for scheduler hashing and persistence keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaMask: u32 {
        const SRCIP = 1 << 0;
        const DSTIP = 1 << 1;
        const SRCPORT = 1 << 2;
        const DSTPORT = 1 << 3;
        const MAC = 1 << 4;
    }
}

impl MetaMask {
    pub fn parse(s: &str) -> Option<MetaMask> {
        if s == "none" {
            return Some(MetaMask::empty());
        }
        let mut mask = MetaMask::empty();
        for tok in s.split_whitespace() {
            mask |= match tok {
                "srcip" => MetaMask::SRCIP,
                "dstip" => MetaMask::DSTIP,
                "srcport" => MetaMask::SRCPORT,
                "dstport" => MetaMask::DSTPORT,
                "mac" => MetaMask::MAC,
                _ => return None,
            };
        }
        Some(mask)
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        let mut toks = Vec::new();
        if self.contains(MetaMask::SRCIP) {
            toks.push("srcip");
        }
        if self.contains(MetaMask::DSTIP) {
            toks.push("dstip");
        }
        if self.contains(MetaMask::SRCPORT) {
            toks.push("srcport");
        }
        if self.contains(MetaMask::DSTPORT) {
            toks.push("dstport");
        }
        if self.contains(MetaMask::MAC) {
            toks.push("mac");
        }
        toks.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Helper {
    #[default]
    None,
    Ftp,
    Pptp,
    Sip,
    Snmp,
    Tftp,
}

impl Helper {
    pub fn parse(s: &str) -> Option<Helper> {
        match s {
            "none" => Some(Helper::None),
            "ftp" => Some(Helper::Ftp),
            "pptp" => Some(Helper::Pptp),
            "sip" => Some(Helper::Sip),
            "snmp" => Some(Helper::Snmp),
            "tftp" => Some(Helper::Tftp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Helper::None => "none",
            Helper::Ftp => "ftp",
            Helper::Pptp => "pptp",
            Helper::Sip => "sip",
            Helper::Snmp => "snmp",
            Helper::Tftp => "tftp",
        }
    }
}

bitflags::bitflags! {
    /// Which rule stages log matched packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogMask: u32 {
        const INPUT = 1 << 0;
        const FORWARD = 1 << 1;
        const OUTPUT = 1 << 2;
    }
}

impl LogMask {
    pub fn parse(s: &str) -> Option<LogMask> {
        if s == "none" {
            return Some(LogMask::empty());
        }
        let mut mask = LogMask::empty();
        for tok in s.split_whitespace() {
            mask |= match tok {
                "input" => LogMask::INPUT,
                "forward" => LogMask::FORWARD,
                "output" => LogMask::OUTPUT,
                _ => return None,
            };
        }
        Some(mask)
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        let mut toks = Vec::new();
        if self.contains(LogMask::INPUT) {
            toks.push("input");
        }
        if self.contains(LogMask::FORWARD) {
            toks.push("forward");
        }
        if self.contains(LogMask::OUTPUT) {
            toks.push("output");
        }
        toks.join(" ")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Farm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Virtual service: front-end bindings plus a backend pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Farm {
    pub id: FarmId,
    pub name: String,
    pub mode: Mode,
    pub scheduler: Scheduler,
    pub sched_param: MetaMask,
    pub persistence: MetaMask,
    pub persist_ttl: u32,
    pub helper: Helper,
    pub log: LogMask,
    pub mark: u32,
    /// Computed: the active backend priority tier.
    pub priority: i32,
    pub state: State,
    pub action: Action,
    pub srcaddr: Option<String>,
    pub oface: Option<String>,
    pub ofidx: Option<u32>,
    pub total_bcks: u32,
    pub bcks_available: u32,
    pub bcks_usable: u32,
    pub total_weight: i32,
    pub bcks_have_port: bool,
    pub bcks_have_srcaddr: bool,
    pub bcks_have_if: bool,
    pub backends: Vec<Backend>,
    pub addresses: Vec<FarmAddress>,
    pub policies: Vec<PolicyId>,
    pub static_sessions: Vec<Session>,
    pub timed_sessions: Vec<Session>,
}

impl Farm {
    pub fn new(id: FarmId, name: &str) -> Farm {
        Farm {
            id,
            name: name.to_string(),
            mode: Mode::default(),
            scheduler: Scheduler::default(),
            sched_param: MetaMask::empty(),
            persistence: MetaMask::empty(),
            persist_ttl: 60,
            helper: Helper::default(),
            log: LogMask::empty(),
            mark: 0,
            priority: DEFAULT_PRIORITY,
            state: State::Up,
            action: Action::Start,
            srcaddr: None,
            oface: None,
            ofidx: None,
            total_bcks: 0,
            bcks_available: 0,
            bcks_usable: 0,
            total_weight: 0,
            bcks_have_port: false,
            bcks_have_srcaddr: false,
            bcks_have_if: false,
            backends: Vec::new(),
            addresses: Vec::new(),
            policies: Vec::new(),
            static_sessions: Vec::new(),
            timed_sessions: Vec::new(),
        }
    }

    /// The fwmark contributed by the farm, including the global masquerade
    /// bit pattern for SNAT farms.
    pub fn get_mark(&self, masq_mark: u32) -> u32 {
        if self.mode == Mode::Snat {
            self.mark | masq_mark
        } else {
            self.mark
        }
    }

    /// Mark carried by connection tracking for one backend: the backend
    /// discriminator ORed with the farm band.
    pub fn effective_mark(&self, b: &Backend, masq_mark: u32) -> u32 {
        if b.srcaddr.is_some() {
            b.mark | self.mark
        } else {
            b.mark | self.get_mark(masq_mark)
        }
    }

    /// Structural validity of a backend within this farm.
    pub fn backend_validate(&self, b: &Backend) -> bool {
        if self.mode.is_ingress() && b.ethaddr.as_deref().map_or(true, |e| e.is_empty()) {
            return false;
        }
        b.ipaddr.as_deref().map_or(false, |ip| !ip.is_empty())
    }

    pub fn backend_below_prio(&self, b: &Backend) -> bool {
        b.priority <= self.priority
    }

    /// Valid, administratively up, and within the active priority tier.
    pub fn backend_available(&self, b: &Backend) -> bool {
        self.backend_validate(b) && b.state == State::Up && self.backend_below_prio(b)
    }

    /// Steerable on demand: up or admin-disabled, within the tier.
    pub fn backend_usable(&self, b: &Backend) -> bool {
        matches!(b.state, State::Up | State::Off) && self.backend_below_prio(b)
    }

    pub fn backend_by_name(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name == name)
    }

    pub fn backend_idx(&self, id: BackendId) -> Option<usize> {
        self.backends.iter().position(|b| b.id == id)
    }

    /// Resolve a kernel session key to a backend, per the farm mode: NAT and
    /// local farms key sessions by effective fwmark, DSR by MAC, stateless
    /// DNAT by IP.
    pub fn backend_for_session_key(&self, key: &str, masq_mark: u32) -> Option<BackendId> {
        match self.mode {
            Mode::Dnat | Mode::Snat | Mode::Local => {
                let raw = key.trim_start_matches("0x");
                let mark = u32::from_str_radix(raw, 16).ok()?;
                self.backends
                    .iter()
                    .find(|b| self.effective_mark(b, masq_mark) == mark)
                    .map(|b| b.id)
            }
            Mode::Dsr => self
                .backends
                .iter()
                .find(|b| b.ethaddr.as_deref() == Some(key))
                .map(|b| b.id),
            Mode::StlsDnat => self
                .backends
                .iter()
                .find(|b| b.ipaddr.as_deref() == Some(key))
                .map(|b| b.id),
        }
    }

    /// Recompute the availability counters from the backend list.
    pub fn recount(&mut self) {
        let mut available = 0;
        let mut usable = 0;
        let mut weight = 0;
        for b in &self.backends {
            if self.backend_available(b) {
                available += 1;
                weight += b.weight;
            }
            if self.backend_usable(b) {
                usable += 1;
            }
        }
        self.bcks_available = available;
        self.bcks_usable = usable;
        self.total_weight = weight;
    }

    /// All backends carry an explicit port: the emitter can generate
    /// per-backend dnat-to-port rules.
    pub fn recount_ports(&mut self) {
        self.bcks_have_port = !self.backends.is_empty()
            && self.backends.iter().all(|b| b.port.is_some());
    }

    pub fn recount_srcaddr(&mut self) {
        self.bcks_have_srcaddr = self
            .backends
            .iter()
            .any(|b| b.srcaddr.as_deref().map_or(false, |s| !s.is_empty()));
    }

    pub fn recount_have_iface(&mut self) {
        self.bcks_have_if = self
            .backends
            .iter()
            .any(|b| b.ofidx.is_some() && b.ofidx != self.ofidx);
    }

    /// A farm can come up once it has at least one bound address with an IP.
    fn has_listener(&self, reg: &Registry) -> bool {
        self.addresses.iter().any(|fa| {
            reg.address_idx(fa.address)
                .map_or(false, |a| reg.addresses[a].ipaddr.is_some())
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    pub fn farm_by_name(&self, name: &str) -> Option<usize> {
        self.farms.iter().position(|f| f.name == name)
    }

    pub fn farm_idx(&self, id: FarmId) -> Option<usize> {
        self.farms.iter().position(|f| f.id == id)
    }

    pub fn farm_set_action(&mut self, f: usize, action: Action) -> bool {
        if action == Action::Delete {
            self.farm_delete(f);
            return true;
        }
        // A pending Start already implies a full rule build.
        if self.farms[f].action == Action::Start && action == Action::Reload {
            return false;
        }
        if action.overrides(self.farms[f].action) {
            self.farms[f].action = action;
            return true;
        }
        false
    }

    pub fn farm_s_set_action(&mut self, action: Action) {
        for f in (0..self.farms.len()).rev() {
            self.farm_set_action(f, action);
        }
    }

    /// Recompute the active priority tier of a farm.
    ///
    /// Starting at the default tier, every dead backend sitting exactly at
    /// the candidate tier bumps it, until a scan finds none. Backends in
    /// `Up`/`Avail` are then re-routed through the state machine so standbys
    /// promote or park themselves against the new tier. Returns whether the
    /// farm priority changed.
    pub fn farm_gen_priority(&mut self, f: usize) -> bool {
        let old_prio = self.farms[f].priority;
        let mut new_prio = DEFAULT_PRIORITY;
        loop {
            let are_down = self.farms[f]
                .backends
                .iter()
                .filter(|b| {
                    b.priority == new_prio && b.state != State::Up && b.state != State::Avail
                })
                .count() as i32;
            new_prio += are_down;
            if are_down == 0 {
                break;
            }
        }
        self.farms[f].priority = new_prio;

        for b in 0..self.farms[f].backends.len() {
            if matches!(self.farms[f].backends[b].state, State::Up | State::Avail) {
                self.backend_set_state(f, b, State::Up);
            }
        }

        self.farms[f].recount();
        self.farms[f].priority != old_prio
    }

    pub fn farm_set_state(&mut self, f: usize, new_value: State) {
        let old = self.farms[f].state;
        let mut new_value = new_value;

        if new_value == State::Up && !self.farms[f].has_listener(self) {
            new_value = State::ConfErr;
        }
        if old == new_value {
            return;
        }

        tracing::debug!(farm = %self.farms[f].name, from = %old, to = %new_value, "farm state");
        self.farms[f].state = new_value;

        match new_value {
            State::Up => {
                self.farm_set_action(f, Action::Start);
                self.farmaddress_s_set_action(f, Action::Start);
                self.farm_s_set_netinfo(f);
                self.farm_gen_priority(f);
            }
            State::Down | State::Off | State::ConfErr => {
                self.farm_set_action(f, Action::Stop);
                self.farmaddress_s_set_action(f, Action::Stop);
            }
            _ => {}
        }
    }

    /// Cascade delete: sessions and backends die with the farm, address and
    /// policy references are released, and the kernel teardown is emitted.
    pub fn farm_delete(&mut self, f: usize) {
        let name = self.farms[f].name.clone();

        let emitter = self.emitter.clone();
        let req = crate::nft::RuleRequest::Farm {
            farm: &self.farms[f],
            addresses: self.farm_address_refs(f),
            policies: self.farm_policy_refs(f),
            action: Action::Delete,
        };
        if let Err(e) = emitter.rulerize(&req) {
            tracing::warn!(farm = %name, error = %e, "farm teardown failed");
        }

        let bound: Vec<crate::registry::AddressId> =
            self.farms[f].addresses.iter().map(|fa| fa.address).collect();
        for id in bound {
            if let Some(a) = self.address_idx(id) {
                self.addresses[a].used = self.addresses[a].used.saturating_sub(1);
                self.addresses[a].nported = self.addresses[a].nported.saturating_sub(1);
            }
        }

        let refs: Vec<PolicyId> = self.farms[f].policies.clone();
        for pid in refs {
            if let Some(p) = self.policy_idx(pid) {
                self.policies[p].used = self.policies[p].used.saturating_sub(1);
            }
        }

        self.farms.remove(f);
    }

    /// Propagate a policy action to every farm referencing it.
    pub fn farm_s_lookup_policy_action(&mut self, policy: &str, action: Action) {
        let Some(pid) = self.policy_by_name(policy).map(|p| self.policies[p].id) else {
            return;
        };
        for f in 0..self.farms.len() {
            if !self.farms[f].policies.contains(&pid) {
                continue;
            }
            if action == Action::Delete {
                self.farms[f].policies.retain(|r| *r != pid);
                if let Some(p) = self.policy_idx(pid) {
                    self.policies[p].used = self.policies[p].used.saturating_sub(1);
                }
            }
            self.farm_set_action(f, Action::Reload);
        }
    }

    pub fn farm_address_refs(&self, f: usize) -> Vec<(&crate::address::Address, Action)> {
        self.farms[f]
            .addresses
            .iter()
            .filter_map(|fa| {
                self.address_idx(fa.address)
                    .map(|a| (&self.addresses[a], fa.action))
            })
            .collect()
    }

    pub fn farm_policy_refs(&self, f: usize) -> Vec<&crate::policy::Policy> {
        self.farms[f]
            .policies
            .iter()
            .filter_map(|pid| self.policy_idx(*pid).map(|p| &self.policies[p]))
            .collect()
    }

    /// Emit the pending rules for one farm and clear the per-object actions
    /// it consumed. A failed emit keeps every action pending for retry.
    pub fn farm_rulerize(&mut self, f: usize) -> Result<()> {
        if self.farms[f].action == Action::None {
            return Ok(());
        }

        let emitter = self.emitter.clone();
        let req = crate::nft::RuleRequest::Farm {
            farm: &self.farms[f],
            addresses: self.farm_address_refs(f),
            policies: self.farm_policy_refs(f),
            action: self.farms[f].action,
        };
        emitter.rulerize(&req)?;

        let farm = &mut self.farms[f];
        farm.action = Action::None;
        for fa in &mut farm.addresses {
            fa.action = Action::None;
        }
        for b in &mut farm.backends {
            b.action = Action::None;
        }
        for s in &mut farm.static_sessions {
            s.action = Action::None;
        }
        for s in &mut farm.timed_sessions {
            s.action = Action::None;
        }
        Ok(())
    }

    // ── Attribute plumbing ─────────────────────────────────────────

    pub fn farm_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        if pair.key == Key::Name {
            return Ok(true);
        }
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;
        let f = &self.farms[f];

        Ok(match pair.key {
            Key::NewName => f.name != pair.val.str()?,
            Key::Mode => Some(f.mode) != Mode::parse(pair.val.str()?),
            Key::Scheduler => Some(f.scheduler) != Scheduler::parse(pair.val.str()?),
            Key::SchedParam => Some(f.sched_param) != MetaMask::parse(pair.val.str()?),
            Key::Persistence => Some(f.persistence) != MetaMask::parse(pair.val.str()?),
            Key::PersistTtl => i64::from(f.persist_ttl) != pair.val.int()?,
            Key::Helper => Some(f.helper) != Helper::parse(pair.val.str()?),
            Key::Log => Some(f.log) != LogMask::parse(pair.val.str()?),
            Key::Mark => {
                let raw = pair.val.str()?.trim_start_matches("0x");
                u32::from_str_radix(raw, 16).map_or(true, |m| m != f.mark)
            }
            Key::State => {
                let req = State::parse(pair.val.str()?);
                // conferr requests are routed as Up; compare accordingly.
                let req = if req == Some(State::ConfErr) { Some(State::Up) } else { req };
                Some(f.state) != req
            }
            Key::SrcAddr => f.srcaddr.as_deref() != Some(pair.val.str()?),
            Key::OFace => f.oface.as_deref() != Some(pair.val.str()?),
            Key::Action => Some(f.action) != Action::parse(pair.val.str()?),
            _ => true,
        })
    }

    pub fn farm_pre_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<PostAction> {
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Ok(PostAction::None);
        };

        if self.farms[f].state != State::Up && pair.key != Key::State {
            return Ok(PostAction::None);
        }

        match pair.key {
            Key::Name | Key::NewName | Key::Action => Ok(PostAction::None),
            // Structural keys: the whole farm program changes shape, take it
            // down before mutating.
            Key::Mode | Key::Mark | Key::Persistence | Key::PersistTtl | Key::Helper => {
                if self.farm_set_action(f, Action::Stop) {
                    self.farmaddress_s_set_action(f, Action::Stop);
                    if let Err(e) = self.farm_rulerize(f) {
                        tracing::warn!(error = %e, "farm stop failed, keeping pending action");
                    }
                }
                Ok(PostAction::Start)
            }
            _ => Ok(PostAction::Reload),
        }
    }

    pub fn farm_pos_actionable(
        &mut self,
        ctx: &ParserCtx,
        _pair: &ConfigPair,
        action: PostAction,
    ) -> Result<()> {
        // The object may have been deleted by an `action` key.
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Ok(());
        };

        match action {
            PostAction::Start => {
                self.farm_set_action(f, Action::Start);
                self.farmaddress_s_set_action(f, Action::Start);
                if let Err(e) = self.farm_rulerize(f) {
                    tracing::warn!(error = %e, "farm restart failed, keeping pending action");
                }
            }
            PostAction::Reload => {
                self.farm_set_action(f, Action::Reload);
                self.farmaddress_s_set_action(f, Action::Reload);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn farm_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        if pair.key == Key::Name {
            let name = pair.val.str()?;
            let f = match self.farm_by_name(name) {
                Some(f) => f,
                None => {
                    let id = self.alloc_farm_id();
                    self.farms.push(Farm::new(id, name));
                    self.farms.len() - 1
                }
            };
            ctx.farm = Some(self.farms[f].id);
            // A new farm header resets the narrower cursors.
            ctx.backend = None;
            ctx.session = None;
            return Ok(());
        }

        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;

        match pair.key {
            Key::NewName => self.farms[f].name = pair.val.str()?.to_string(),
            Key::Mode => {
                let mode = Mode::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("mode {}", pair.val)))?;
                self.farm_set_mode(f, mode);
            }
            Key::Scheduler => {
                let sched = Scheduler::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("scheduler {}", pair.val)))?;
                self.farms[f].scheduler = sched;
            }
            Key::SchedParam => {
                let mask = MetaMask::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("sched-param {}", pair.val)))?;
                self.farms[f].sched_param = mask;
            }
            Key::Persistence => {
                let mask = MetaMask::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("persistence {}", pair.val)))?;
                self.farms[f].persistence = mask;
            }
            Key::PersistTtl => self.farms[f].persist_ttl = pair.val.int()? as u32,
            Key::Helper => {
                let helper = Helper::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("helper {}", pair.val)))?;
                self.farms[f].helper = helper;
            }
            Key::Log => {
                let mask = LogMask::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("log {}", pair.val)))?;
                self.farms[f].log = mask;
            }
            Key::Mark => {
                let raw = pair.val.str()?.trim_start_matches("0x");
                match u32::from_str_radix(raw, 16) {
                    Ok(mark) => self.farms[f].mark = mark,
                    Err(_) => {
                        tracing::info!(farm = %self.farms[f].name, value = %pair.val,
                                       "invalid farm mark, ignored");
                    }
                }
            }
            Key::State => {
                let state = State::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("state {}", pair.val)))?;
                let state = if state == State::ConfErr { State::Up } else { state };
                self.farm_set_state(f, state);
            }
            Key::SrcAddr => self.farms[f].srcaddr = Some(pair.val.str()?.to_string()),
            Key::OFace => {
                let iface = pair.val.str()?.to_string();
                match self.net.iface_info(&iface) {
                    Ok((ifidx, _mac)) => self.farms[f].ofidx = Some(ifidx),
                    Err(e) => {
                        tracing::info!(farm = %self.farms[f].name, iface = %iface,
                                       error = %e, "output interface lookup failed");
                        self.farms[f].ofidx = None;
                    }
                }
                self.farms[f].oface = Some(iface);
            }
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                self.farm_set_action(f, action);
            }
            _ => return Err(Error::StructFailed(format!("farm key {:?}", pair.key))),
        }

        Ok(())
    }

    /// Mode changes invalidate session keys and the ingress validation
    /// rules, so the timed cache is dropped and backends re-validated.
    fn farm_set_mode(&mut self, f: usize, mode: Mode) {
        self.farms[f].mode = mode;
        self.session_s_delete(f, crate::session::SessionType::Timed);
        if mode.is_ingress() {
            self.farm_s_set_netinfo(f);
        }
        for b in 0..self.farms[f].backends.len() {
            let valid = self.farms[f].backend_validate(&self.farms[f].backends[b]);
            match self.farms[f].backends[b].state {
                State::ConfErr if valid => self.backend_set_state(f, b, State::Up),
                State::Up | State::Avail if !valid => self.backend_set_state(f, b, State::ConfErr),
                _ => {}
            }
        }
        self.farms[f].recount();
    }

    // ── Farm policy references ─────────────────────────────────────

    pub fn farm_policy_set_attribute(
        &mut self,
        ctx: &mut ParserCtx,
        pair: &ConfigPair,
    ) -> Result<()> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;

        match pair.key {
            Key::Name => {
                let p = self
                    .policy_by_name(pair.val.str()?)
                    .ok_or_else(|| Error::ObjUnknown(format!("policy {}", pair.val)))?;
                let pid = self.policies[p].id;
                if !self.farms[f].policies.contains(&pid) {
                    self.farms[f].policies.push(pid);
                    self.policies[p].used += 1;
                    self.farm_set_action(f, Action::Reload);
                }
            }
            Key::Action => {
                if Action::parse(pair.val.str()?) == Some(Action::Delete) {
                    if let Some(pid) = self.farms[f].policies.last().copied() {
                        self.farms[f].policies.retain(|r| *r != pid);
                        if let Some(p) = self.policy_idx(pid) {
                            self.policies[p].used = self.policies[p].used.saturating_sub(1);
                        }
                        self.farm_set_action(f, Action::Reload);
                    }
                }
            }
            _ => return Err(Error::StructFailed(format!("farm policy key {:?}", pair.key))),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_mask_parses_token_lists() {
        assert_eq!(MetaMask::parse("none"), Some(MetaMask::empty()));
        assert_eq!(
            MetaMask::parse("srcip srcport"),
            Some(MetaMask::SRCIP | MetaMask::SRCPORT)
        );
        assert_eq!(MetaMask::parse("bogus"), None);
    }

    #[test]
    fn meta_mask_renders_stable_order() {
        let mask = MetaMask::DSTPORT | MetaMask::SRCIP;
        assert_eq!(mask.render(), "srcip dstport");
        assert_eq!(MetaMask::empty().render(), "none");
    }

    #[test]
    fn snat_farm_mark_carries_masquerade_band() {
        let mut f = Farm::new(crate::registry::FarmId(1), "f1");
        f.mark = 0x200;
        assert_eq!(f.get_mark(0x80000000), 0x80000200);
        f.mode = Mode::Dnat;
        assert_eq!(f.get_mark(0x80000000), 0x200);
    }

    #[test]
    fn effective_mark_prefers_farm_mark_with_srcaddr() {
        let mut f = Farm::new(crate::registry::FarmId(1), "f1");
        f.mark = 0x400;
        let mut b = Backend::new(crate::registry::BackendId(1), "b1", 0x002);
        assert_eq!(f.effective_mark(&b, 0x80000000), 0x80000402);
        b.srcaddr = Some("192.168.10.1".to_string());
        assert_eq!(f.effective_mark(&b, 0x80000000), 0x402);
    }

    #[test]
    fn ingress_validation_requires_ethaddr() {
        let mut f = Farm::new(crate::registry::FarmId(1), "f1");
        f.mode = Mode::Dsr;
        let mut b = Backend::new(crate::registry::BackendId(1), "b1", 0x001);
        b.ipaddr = Some("10.0.0.1".to_string());
        assert!(!f.backend_validate(&b));
        b.ethaddr = Some("02:00:00:aa:bb:cc".to_string());
        assert!(f.backend_validate(&b));
    }

    #[test]
    fn session_key_resolution_follows_mode() {
        let mut f = Farm::new(crate::registry::FarmId(1), "f1");
        f.mode = Mode::Dnat;
        let mut b = Backend::new(crate::registry::BackendId(7), "b1", 0x002);
        b.ipaddr = Some("10.0.0.2".to_string());
        b.ethaddr = Some("02:00:00:aa:bb:02".to_string());
        f.backends.push(b);

        assert_eq!(
            f.backend_for_session_key("0x002", 0x80000000),
            Some(crate::registry::BackendId(7))
        );
        f.mode = Mode::Dsr;
        assert_eq!(
            f.backend_for_session_key("02:00:00:aa:bb:02", 0x80000000),
            Some(crate::registry::BackendId(7))
        );
        f.mode = Mode::StlsDnat;
        assert_eq!(
            f.backend_for_session_key("10.0.0.2", 0x80000000),
            Some(crate::registry::BackendId(7))
        );
        assert_eq!(f.backend_for_session_key("10.9.9.9", 0x80000000), None);
    }
}
