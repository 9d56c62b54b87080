//! Typed key/value configuration stream.
//!
//! Both the config file and the admin API speak the same JSON shape; this
//! module flattens it into `(scope, key, value)` pairs targeting the current
//! object cursors, runs the pre/post action hooks around each mutation, and
//! renders the model back into the identical JSON form.

use serde_json::{json, Map, Value as Json};

use crate::error::{Error, Result};
use crate::registry::{AddressId, BackendId, FarmId, PolicyId, Registry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keys and values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Name,
    NewName,
    Fqdn,
    IpAddr,
    Ports,
    Port,
    SrcAddr,
    EthAddr,
    Iface,
    OFace,
    Weight,
    Priority,
    Mark,
    State,
    EstConnLimit,
    EstConnLimitLogPrefix,
    Mode,
    Scheduler,
    SchedParam,
    Persistence,
    PersistTtl,
    Helper,
    Log,
    LogPrefix,
    Family,
    Protocol,
    Type,
    Route,
    Timeout,
    Client,
    BackendRef,
    Data,
    Time,
    Used,
    Action,
}

impl Key {
    pub fn parse(s: &str) -> Option<Key> {
        match s {
            "name" => Some(Key::Name),
            "newname" => Some(Key::NewName),
            "fqdn" => Some(Key::Fqdn),
            "ip-addr" => Some(Key::IpAddr),
            "ports" => Some(Key::Ports),
            "port" => Some(Key::Port),
            "source-addr" => Some(Key::SrcAddr),
            "ether-addr" => Some(Key::EthAddr),
            "iface" => Some(Key::Iface),
            "out-iface" => Some(Key::OFace),
            "weight" => Some(Key::Weight),
            "priority" => Some(Key::Priority),
            "mark" => Some(Key::Mark),
            "state" => Some(Key::State),
            "est-connlimit" => Some(Key::EstConnLimit),
            "est-connlimit-log-prefix" => Some(Key::EstConnLimitLogPrefix),
            "mode" => Some(Key::Mode),
            "scheduler" => Some(Key::Scheduler),
            "sched-param" => Some(Key::SchedParam),
            "persistence" => Some(Key::Persistence),
            "persist-ttl" => Some(Key::PersistTtl),
            "helper" => Some(Key::Helper),
            "log" => Some(Key::Log),
            "log-prefix" => Some(Key::LogPrefix),
            "family" => Some(Key::Family),
            "protocol" => Some(Key::Protocol),
            "type" => Some(Key::Type),
            "route" => Some(Key::Route),
            "timeout" => Some(Key::Timeout),
            "client" => Some(Key::Client),
            "backend" => Some(Key::BackendRef),
            "data" => Some(Key::Data),
            "time" => Some(Key::Time),
            "used" => Some(Key::Used),
            "action" => Some(Key::Action),
            _ => None,
        }
    }

    /// Keys carrying integral values; everything else is textual.
    fn is_int(&self) -> bool {
        matches!(
            self,
            Key::Weight | Key::Priority | Key::PersistTtl | Key::Timeout | Key::EstConnLimit
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    pub fn str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Int(_) => Err(Error::StructFailed("expected string value".into())),
        }
    }

    pub fn int(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Str(s) => s
                .parse()
                .map_err(|_| Error::StructFailed(format!("expected numeric value, got {s}"))),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
        }
    }
}

/// One flattened configuration mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPair {
    pub key: Key,
    pub val: Value,
}

/// Which object kind a pair targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjScope {
    Farm,
    Backend,
    FarmAddress,
    FarmPolicy,
    Session,
    Address,
    AddressPolicy,
    Policy,
    Element,
}

/// The parser's current-object cursors, threaded explicitly through every
/// attribute-setter call.
#[derive(Debug, Clone, Default)]
pub struct ParserCtx {
    pub farm: Option<FarmId>,
    pub backend: Option<BackendId>,
    pub address: Option<AddressId>,
    pub policy: Option<PolicyId>,
    pub session: Option<String>,
    pub element: Option<String>,
}

fn pair_from(key: &str, val: &Json) -> Result<ConfigPair> {
    let key = Key::parse(key).ok_or_else(|| Error::ObjUnknown(format!("key {key}")))?;

    let val = if key.is_int() {
        match val {
            Json::Number(n) => Value::Int(
                n.as_i64()
                    .ok_or_else(|| Error::StructFailed(format!("bad number for {key:?}")))?,
            ),
            Json::String(s) => Value::Int(
                s.parse()
                    .map_err(|_| Error::StructFailed(format!("bad number for {key:?}")))?,
            ),
            _ => return Err(Error::StructFailed(format!("bad value for {key:?}"))),
        }
    } else {
        match val {
            Json::String(s) => Value::Str(s.clone()),
            // Marks may arrive as bare numbers; keep the hex convention.
            Json::Number(n) if key == Key::Mark => {
                Value::Str(format!("0x{:x}", n.as_u64().unwrap_or(0)))
            }
            Json::Number(n) => Value::Str(n.to_string()),
            _ => return Err(Error::StructFailed(format!("bad value for {key:?}"))),
        }
    };

    Ok(ConfigPair { key, val })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    /// Apply one configuration pair: probe whether the value changes, run
    /// the pre-mutation hook, mutate, run the post-mutation hook.
    pub fn apply_pair(
        &mut self,
        ctx: &mut ParserCtx,
        scope: ObjScope,
        pair: &ConfigPair,
    ) -> Result<()> {
        match scope {
            ObjScope::Farm => {
                if !self.farm_changed(ctx, pair)? {
                    return Ok(());
                }
                let post = self.farm_pre_actionable(ctx, pair)?;
                self.farm_set_attribute(ctx, pair)?;
                self.farm_pos_actionable(ctx, pair, post)?;
            }
            ObjScope::Backend => {
                if !self.backend_changed(ctx, pair)? {
                    return Ok(());
                }
                let post = self.backend_pre_actionable(ctx, pair)?;
                self.backend_set_attribute(ctx, pair)?;
                self.backend_pos_actionable(ctx, pair, post)?;
            }
            ObjScope::FarmAddress => {
                if !self.farmaddress_changed(ctx, pair)? {
                    return Ok(());
                }
                self.farmaddress_set_attribute(ctx, pair)?;
                self.farmaddress_actionable(ctx)?;
            }
            ObjScope::FarmPolicy => {
                self.farm_policy_set_attribute(ctx, pair)?;
            }
            ObjScope::Session => {
                if !self.session_changed(ctx, pair)? {
                    return Ok(());
                }
                self.session_pre_actionable(ctx, pair)?;
                self.session_set_attribute(ctx, pair)?;
                self.session_pos_actionable(ctx, pair)?;
            }
            ObjScope::Address => {
                if !self.address_changed(ctx, pair)? {
                    return Ok(());
                }
                self.address_pre_actionable(ctx, pair)?;
                self.address_set_attribute(ctx, pair)?;
                self.address_pos_actionable(ctx, pair)?;
            }
            ObjScope::AddressPolicy => {
                self.address_policy_set_attribute(ctx, pair)?;
            }
            ObjScope::Policy => {
                if !self.policy_changed(ctx, pair)? {
                    return Ok(());
                }
                self.policy_pre_actionable(ctx, pair)?;
                self.policy_set_attribute(ctx, pair)?;
                self.policy_pos_actionable(ctx, pair)?;
            }
            ObjScope::Element => {
                if !self.element_changed(ctx, pair)? {
                    return Ok(());
                }
                self.element_set_attribute(ctx, pair)?;
                self.element_actionable(ctx)?;
            }
        }
        Ok(())
    }

    // ── JSON walking ───────────────────────────────────────────────

    /// Feed a whole configuration document through the pair stream.
    /// Top-level sections resolve in dependency order regardless of their
    /// position in the document.
    pub fn load_json(&mut self, root: &Json) -> Result<()> {
        let obj = root
            .as_object()
            .ok_or_else(|| Error::StructFailed("top-level object expected".into()))?;

        for key in obj.keys() {
            if !matches!(key.as_str(), "policies" | "addresses" | "farms") {
                return Err(Error::ObjUnknown(format!("section {key}")));
            }
        }

        let mut ctx = ParserCtx::default();

        if let Some(list) = obj.get("policies") {
            for item in as_list(list, "policies")? {
                self.walk_policy(&mut ctx, as_map(item)?)?;
            }
        }
        if let Some(list) = obj.get("addresses") {
            for item in as_list(list, "addresses")? {
                self.walk_address(&mut ctx, as_map(item)?)?;
            }
        }
        if let Some(list) = obj.get("farms") {
            for item in as_list(list, "farms")? {
                self.walk_farm(&mut ctx, as_map(item)?)?;
            }
        }

        Ok(())
    }

    fn walk_scalars(
        &mut self,
        ctx: &mut ParserCtx,
        scope: ObjScope,
        map: &Map<String, Json>,
        header: Key,
    ) -> Result<()> {
        // The header key selects (or creates) the object; it must land first.
        let header_name = match header {
            Key::Client => "client",
            Key::Data => "data",
            _ => "name",
        };
        if let Some(v) = map.get(header_name) {
            self.apply_pair(ctx, scope, &pair_from(header_name, v)?)?;
        }

        for (k, v) in map {
            if k == header_name || v.is_array() {
                continue;
            }
            self.apply_pair(ctx, scope, &pair_from(k, v)?)?;
        }
        Ok(())
    }

    fn walk_policy(&mut self, ctx: &mut ParserCtx, map: &Map<String, Json>) -> Result<()> {
        ctx.element = None;
        self.walk_scalars(ctx, ObjScope::Policy, map, Key::Name)?;
        if let Some(list) = map.get("elements") {
            for item in as_list(list, "elements")? {
                ctx.element = None;
                self.walk_scalars(ctx, ObjScope::Element, as_map(item)?, Key::Data)?;
            }
        }
        Ok(())
    }

    fn walk_address(&mut self, ctx: &mut ParserCtx, map: &Map<String, Json>) -> Result<()> {
        self.walk_scalars(ctx, ObjScope::Address, map, Key::Name)?;
        if let Some(list) = map.get("policies") {
            for item in as_list(list, "policies")? {
                self.walk_scalars(ctx, ObjScope::AddressPolicy, as_map(item)?, Key::Name)?;
            }
        }
        Ok(())
    }

    fn walk_farm(&mut self, ctx: &mut ParserCtx, map: &Map<String, Json>) -> Result<()> {
        ctx.backend = None;
        ctx.session = None;
        self.walk_scalars(ctx, ObjScope::Farm, map, Key::Name)?;

        // Nested sections in dependency order: listeners first (ether
        // resolution needs them), sessions last (they reference backends).
        if let Some(list) = map.get("addresses") {
            for item in as_list(list, "addresses")? {
                self.walk_scalars(ctx, ObjScope::FarmAddress, as_map(item)?, Key::Name)?;
            }
        }
        if let Some(list) = map.get("policies") {
            for item in as_list(list, "policies")? {
                self.walk_scalars(ctx, ObjScope::FarmPolicy, as_map(item)?, Key::Name)?;
            }
        }
        if let Some(list) = map.get("backends") {
            for item in as_list(list, "backends")? {
                self.walk_scalars(ctx, ObjScope::Backend, as_map(item)?, Key::Name)?;
            }
        }
        if let Some(list) = map.get("sessions") {
            for item in as_list(list, "sessions")? {
                ctx.session = None;
                self.walk_scalars(ctx, ObjScope::Session, as_map(item)?, Key::Client)?;
            }
        }
        Ok(())
    }

    // ── Rendering ──────────────────────────────────────────────────

    /// Render the whole model back into the configuration shape the parser
    /// accepts. Runtime-only fields (actions, counters) are not rendered.
    pub fn render(&self) -> Json {
        json!({
            "policies": self.policies.iter().map(render_policy).collect::<Vec<_>>(),
            "addresses": self.addresses.iter().map(|a| self.render_address(a)).collect::<Vec<_>>(),
            "farms": self.farms.iter().map(|f| self.render_farm(f)).collect::<Vec<_>>(),
        })
    }

    pub fn render_farm_by_name(&self, name: &str) -> Option<Json> {
        self.farm_by_name(name).map(|f| self.render_farm(&self.farms[f]))
    }

    fn render_address(&self, a: &crate::address::Address) -> Json {
        let mut m = Map::new();
        m.insert("name".into(), json!(a.name));
        m.insert("family".into(), json!(a.family.as_str()));
        if let Some(ip) = &a.ipaddr {
            m.insert("ip-addr".into(), json!(ip));
        }
        if let Some(ports) = &a.ports {
            m.insert("ports".into(), json!(ports));
        }
        m.insert("protocol".into(), json!(a.protocol.as_str()));
        if let Some(iface) = &a.iface {
            m.insert("iface".into(), json!(iface));
        }
        if let Some(lp) = &a.logprefix {
            m.insert("log-prefix".into(), json!(lp));
        }
        if !a.policies.is_empty() {
            let refs: Vec<Json> = a
                .policies
                .iter()
                .filter_map(|pid| self.policy_idx(*pid))
                .map(|p| json!({ "name": self.policies[p].name }))
                .collect();
            m.insert("policies".into(), Json::Array(refs));
        }
        Json::Object(m)
    }

    fn render_farm(&self, f: &crate::farm::Farm) -> Json {
        let mut m = Map::new();
        m.insert("name".into(), json!(f.name));
        m.insert("mode".into(), json!(f.mode.as_str()));
        m.insert("scheduler".into(), json!(f.scheduler.as_str()));
        m.insert("sched-param".into(), json!(f.sched_param.render()));
        m.insert("persistence".into(), json!(f.persistence.render()));
        m.insert("persist-ttl".into(), json!(f.persist_ttl));
        m.insert("helper".into(), json!(f.helper.as_str()));
        m.insert("log".into(), json!(f.log.render()));
        m.insert("mark".into(), json!(format!("0x{:x}", f.mark)));
        m.insert("state".into(), json!(f.state.as_str()));
        if let Some(src) = &f.srcaddr {
            m.insert("source-addr".into(), json!(src));
        }
        if let Some(oface) = &f.oface {
            m.insert("out-iface".into(), json!(oface));
        }

        if !f.addresses.is_empty() {
            let refs: Vec<Json> = f
                .addresses
                .iter()
                .filter_map(|fa| self.address_idx(fa.address))
                .map(|a| json!({ "name": self.addresses[a].name }))
                .collect();
            m.insert("addresses".into(), Json::Array(refs));
        }
        if !f.policies.is_empty() {
            let refs: Vec<Json> = f
                .policies
                .iter()
                .filter_map(|pid| self.policy_idx(*pid))
                .map(|p| json!({ "name": self.policies[p].name }))
                .collect();
            m.insert("policies".into(), Json::Array(refs));
        }
        if !f.backends.is_empty() {
            let bcks: Vec<Json> = f.backends.iter().map(render_backend).collect();
            m.insert("backends".into(), Json::Array(bcks));
        }
        if !f.static_sessions.is_empty() {
            let sessions: Vec<Json> = f
                .static_sessions
                .iter()
                .map(|s| {
                    let mut sm = Map::new();
                    sm.insert("client".into(), json!(s.client));
                    if let Some(bid) = s.bck {
                        if let Some(b) = f.backend_idx(bid) {
                            sm.insert("backend".into(), json!(f.backends[b].name));
                        }
                    }
                    Json::Object(sm)
                })
                .collect();
            m.insert("sessions".into(), Json::Array(sessions));
        }
        Json::Object(m)
    }

    /// Render the session tables of one farm, including the freshly fetched
    /// kernel entries.
    pub fn render_sessions(&mut self, f: usize) -> Json {
        self.session_get_timed(f);
        let farm = &self.farms[f];
        let render = |s: &crate::session::Session| {
            let mut m = Map::new();
            m.insert("client".into(), json!(s.client));
            if let Some(b) = s.bck.and_then(|id| farm.backend_idx(id)) {
                m.insert("backend".into(), json!(farm.backends[b].name));
            }
            if let Some(exp) = &s.expiration {
                m.insert("expiration".into(), json!(exp));
            }
            Json::Object(m)
        };
        json!({
            "sessions": {
                "static": farm.static_sessions.iter().map(render).collect::<Vec<_>>(),
                "timed": farm.timed_sessions.iter().map(render).collect::<Vec<_>>(),
            }
        })
    }
}

fn render_policy(p: &crate::policy::Policy) -> Json {
    let mut m = Map::new();
    m.insert("name".into(), json!(p.name));
    m.insert("type".into(), json!(p.ptype.as_str()));
    m.insert("route".into(), json!(p.route.as_str()));
    m.insert("family".into(), json!(p.family.as_str()));
    m.insert("timeout".into(), json!(p.timeout));
    if let Some(lp) = &p.logprefix {
        m.insert("log-prefix".into(), json!(lp));
    }
    if !p.elements.is_empty() {
        let els: Vec<Json> = p
            .elements
            .iter()
            .map(|e| {
                let mut em = Map::new();
                em.insert("data".into(), json!(e.data));
                if let Some(t) = &e.time {
                    em.insert("time".into(), json!(t));
                }
                Json::Object(em)
            })
            .collect();
        m.insert("elements".into(), Json::Array(els));
    }
    Json::Object(m)
}

fn render_backend(b: &crate::backend::Backend) -> Json {
    let mut m = Map::new();
    m.insert("name".into(), json!(b.name));
    if let Some(fqdn) = &b.fqdn {
        m.insert("fqdn".into(), json!(fqdn));
    }
    if let Some(ip) = &b.ipaddr {
        m.insert("ip-addr".into(), json!(ip));
    }
    if let Some(port) = &b.port {
        m.insert("port".into(), json!(port));
    }
    if let Some(src) = &b.srcaddr {
        m.insert("source-addr".into(), json!(src));
    }
    if let Some(mac) = &b.ethaddr {
        m.insert("ether-addr".into(), json!(mac));
    }
    m.insert("weight".into(), json!(b.weight));
    m.insert("priority".into(), json!(b.priority));
    m.insert("mark".into(), json!(format!("0x{:x}", b.mark)));
    m.insert("state".into(), json!(b.state.as_str()));
    m.insert("est-connlimit".into(), json!(b.estconnlimit));
    if let Some(lp) = &b.estconnlimit_logprefix {
        m.insert("est-connlimit-log-prefix".into(), json!(lp));
    }
    Json::Object(m)
}

fn as_list<'a>(v: &'a Json, what: &str) -> Result<&'a Vec<Json>> {
    v.as_array()
        .ok_or_else(|| Error::StructFailed(format!("{what} must be a list")))
}

fn as_map(v: &Json) -> Result<&Map<String, Json>> {
    v.as_object()
        .ok_or_else(|| Error::StructFailed("object expected".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(reg: &mut Registry, doc: serde_json::Value) {
        reg.load_json(&doc).unwrap();
    }

    #[test]
    fn loads_a_full_document() {
        let mut reg = Registry::for_tests();
        load(
            &mut reg,
            json!({
                "policies": [
                    { "name": "blocked", "type": "blacklist",
                      "elements": [ { "data": "10.0.0.8" } ] }
                ],
                "addresses": [
                    { "name": "web80", "ip-addr": "192.168.1.10", "ports": "80" }
                ],
                "farms": [
                    { "name": "f1", "mode": "dnat",
                      "addresses": [ { "name": "web80" } ],
                      "policies": [ { "name": "blocked" } ],
                      "backends": [
                          { "name": "b1", "ip-addr": "10.0.0.1", "weight": 2 }
                      ] }
                ]
            }),
        );

        assert_eq!(reg.policies.len(), 1);
        assert_eq!(reg.addresses.len(), 1);
        assert_eq!(reg.farms.len(), 1);
        assert_eq!(reg.farms[0].backends.len(), 1);
        assert_eq!(reg.farms[0].policies.len(), 1);
        assert_eq!(reg.policies[0].used, 1);
        assert_eq!(reg.addresses[0].used, 1);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut reg = Registry::for_tests();
        let err = reg.load_json(&json!({ "services": [] })).unwrap_err();
        assert!(matches!(err, Error::ObjUnknown(_)));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut reg = Registry::for_tests();
        let err = reg
            .load_json(&json!({ "farms": [ { "name": "f1", "bogus": 1 } ] }))
            .unwrap_err();
        assert!(matches!(err, Error::ObjUnknown(_)));
    }

    #[test]
    fn applying_the_same_document_twice_is_idempotent() {
        let doc = json!({
            "farms": [
                { "name": "f1", "mode": "dnat", "scheduler": "weight",
                  "addresses": [ { "name": "web80" } ],
                  "backends": [
                      { "name": "b1", "ip-addr": "10.0.0.1", "weight": 2 },
                      { "name": "b2", "ip-addr": "10.0.0.2", "weight": 3 }
                  ] }
            ]
        });

        let mut reg = Registry::for_tests();
        load(&mut reg, doc.clone());
        let farms = reg.farms.clone();
        let addresses = reg.addresses.clone();

        load(&mut reg, doc);
        assert_eq!(reg.farms, farms);
        assert_eq!(reg.addresses, addresses);
    }

    #[test]
    fn render_and_reparse_reproduce_the_model() {
        let doc = json!({
            "policies": [
                { "name": "blocked", "type": "whitelist", "timeout": 30,
                  "elements": [ { "data": "10.0.0.8" }, { "data": "10.0.0.9" } ] }
            ],
            "addresses": [
                { "name": "web80", "ip-addr": "192.168.1.10", "ports": "80",
                  "protocol": "tcp" }
            ],
            "farms": [
                { "name": "f1", "mode": "dnat", "scheduler": "weight",
                  "persistence": "srcip", "persist-ttl": 120,
                  "addresses": [ { "name": "web80" } ],
                  "policies": [ { "name": "blocked" } ],
                  "backends": [
                      { "name": "b1", "ip-addr": "10.0.0.1", "weight": 2, "port": "8080" },
                      { "name": "b2", "ip-addr": "10.0.0.2", "weight": 3, "state": "off" }
                  ],
                  "sessions": [ { "client": "1.2.3.4", "backend": "b1" } ] }
            ]
        });

        let mut reg = Registry::for_tests();
        load(&mut reg, doc);
        let rendered = reg.render();

        let mut reg2 = Registry::for_tests();
        load(&mut reg2, rendered.clone());
        assert_eq!(reg2.render(), rendered);
    }
}
