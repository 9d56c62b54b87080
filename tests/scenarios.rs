//! End-to-end admin scenarios driven through the key/value stream, with a
//! recording rule emitter standing in for the kernel.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use nftbal::action::{Action, State};
use nftbal::address::Address;
use nftbal::error::Result;
use nftbal::farm::Farm;
use nftbal::net::UnreachableProber;
use nftbal::nft::{RuleEmitter, RuleRequest};
use nftbal::parser::{ConfigPair, Key, ObjScope, ParserCtx, Value};
use nftbal::registry::{Registry, MASQUERADE_MARK_DEFAULT};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test fixtures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RecordingEmitter {
    log: Mutex<Vec<(String, Action)>>,
    sessions: Mutex<String>,
}

impl RecordingEmitter {
    fn emitted(&self) -> Vec<(String, Action)> {
        self.log.lock().clone()
    }

    fn clear(&self) {
        self.log.lock().clear();
    }

    fn set_sessions(&self, buf: &str) {
        *self.sessions.lock() = buf.to_string();
    }
}

impl RuleEmitter for RecordingEmitter {
    fn rulerize(&self, req: &RuleRequest<'_>) -> Result<()> {
        let entry = match req {
            RuleRequest::Policy { policy, action } => (format!("policy:{}", policy.name), *action),
            RuleRequest::Farm { farm, action, .. } => (format!("farm:{}", farm.name), *action),
            RuleRequest::Address { address, action, .. } => {
                (format!("address:{}", address.name), *action)
            }
            RuleRequest::FlushAll => ("flush".to_string(), Action::Flush),
        };
        self.log.lock().push(entry);
        Ok(())
    }

    fn sessions_buffer(&self, _farm: &Farm, _address: &Address) -> Result<String> {
        Ok(self.sessions.lock().clone())
    }
}

fn registry() -> (Arc<RecordingEmitter>, Registry) {
    let emitter = Arc::new(RecordingEmitter::default());
    let reg = Registry::new(
        emitter.clone(),
        Arc::new(UnreachableProber),
        MASQUERADE_MARK_DEFAULT,
    );
    (emitter, reg)
}

fn apply(reg: &mut Registry, ctx: &mut ParserCtx, scope: ObjScope, key: Key, val: &str) {
    reg.apply_pair(ctx, scope, &ConfigPair { key, val: Value::Str(val.to_string()) })
        .unwrap();
}

fn apply_int(reg: &mut Registry, ctx: &mut ParserCtx, scope: ObjScope, key: Key, val: i64) {
    reg.apply_pair(ctx, scope, &ConfigPair { key, val: Value::Int(val) })
        .unwrap();
}

/// The quantified invariants every admin sequence must preserve.
fn check_invariants(reg: &Registry) {
    // Mark uniqueness across the whole registry (sentinel excepted).
    let mut seen = HashSet::new();
    for f in &reg.farms {
        for b in &f.backends {
            if b.mark != 0 {
                assert!(seen.insert(b.mark), "duplicate mark 0x{:x}", b.mark);
            }
        }
    }

    for f in &reg.farms {
        // Counter coherence.
        let avail = f.backends.iter().filter(|b| f.backend_available(b)).count() as u32;
        let usable = f.backends.iter().filter(|b| f.backend_usable(b)).count() as u32;
        let weight: i32 = f
            .backends
            .iter()
            .filter(|b| f.backend_available(b))
            .map(|b| b.weight)
            .sum();
        assert_eq!(f.bcks_available, avail, "{}: bcks_available", f.name);
        assert_eq!(f.bcks_usable, usable, "{}: bcks_usable", f.name);
        assert_eq!(f.total_weight, weight, "{}: total_weight", f.name);

        // The active tier has life in it, or nothing sits at it.
        let tier_alive = f
            .backends
            .iter()
            .any(|b| b.priority == f.priority && matches!(b.state, State::Up | State::Avail));
        let tier_populated = f.backends.iter().any(|b| b.priority == f.priority);
        assert!(tier_alive || !tier_populated, "{}: dead active tier", f.name);

        // Session-backend locality.
        for s in f.static_sessions.iter().chain(f.timed_sessions.iter()) {
            if let Some(bid) = s.bck {
                assert!(f.backend_idx(bid).is_some(), "{}: foreign session backend", f.name);
            }
        }
    }

    // Address refcounts mirror live bindings.
    for a in &reg.addresses {
        let bindings = reg
            .farms
            .iter()
            .flat_map(|f| f.addresses.iter())
            .filter(|fa| fa.address == a.id)
            .count() as u32;
        assert_eq!(a.used, bindings, "{}: used refcount", a.name);
    }
}

/// Steps 1–2 of the bootstrap: dnat farm with two weighted backends.
fn bootstrap(reg: &mut Registry, ctx: &mut ParserCtx) {
    apply(reg, ctx, ObjScope::Farm, Key::Name, "f1");
    apply(reg, ctx, ObjScope::Farm, Key::Mode, "dnat");
    apply(reg, ctx, ObjScope::FarmAddress, Key::Name, "web80");
    apply(reg, ctx, ObjScope::Backend, Key::Name, "b1");
    apply(reg, ctx, ObjScope::Backend, Key::IpAddr, "10.0.0.1");
    apply_int(reg, ctx, ObjScope::Backend, Key::Weight, 2);
    apply_int(reg, ctx, ObjScope::Backend, Key::Priority, 1);
    apply(reg, ctx, ObjScope::Backend, Key::Name, "b2");
    apply(reg, ctx, ObjScope::Backend, Key::IpAddr, "10.0.0.2");
    apply_int(reg, ctx, ObjScope::Backend, Key::Weight, 3);
    apply_int(reg, ctx, ObjScope::Backend, Key::Priority, 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[test]
fn two_backends_come_up_with_allocated_marks() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    let f = &reg.farms[0];
    assert_eq!(f.priority, 1);
    assert_eq!(f.total_weight, 5);
    assert_eq!(f.bcks_available, 2);
    assert_eq!(f.backends[0].mark, 0x001);
    assert_eq!(f.backends[1].mark, 0x002);
    assert_eq!(f.backends[0].state, State::Up);
    assert_eq!(f.backends[1].state, State::Up);
    check_invariants(&reg);
}

#[test]
fn taking_one_backend_down_reloads_the_farm() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);
    reg.rulerize_all().unwrap();
    emitter.clear();

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b1");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");

    let f = &reg.farms[0];
    assert_eq!(f.backends[0].state, State::Down);
    assert_eq!(f.total_weight, 3);
    assert_eq!(f.bcks_available, 1);
    assert_eq!(f.action, Action::Reload);
    check_invariants(&reg);
}

#[test]
fn priority_advances_when_the_tier_dies() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b1");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b2");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");

    // Two dead backends at tier 1 bump the candidate tier past both.
    let f = &reg.farms[0];
    assert_eq!(f.priority, 3);
    assert_eq!(f.backends[0].state, State::Down);
    assert_eq!(f.backends[1].state, State::Down);
    assert_eq!(f.bcks_available, 0);
    check_invariants(&reg);
}

#[test]
fn standby_backend_takes_over_a_dead_tier() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b1");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b2");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b3");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::IpAddr, "10.0.0.3");
    apply_int(&mut reg, &mut ctx, ObjScope::Backend, Key::Priority, 2);
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "up");

    let f = &reg.farms[0];
    let b3 = &f.backends[2];
    assert_eq!(b3.state, State::Up);
    assert!(f.backend_below_prio(b3));
    assert_eq!(f.total_weight, b3.weight);
    assert_eq!(f.bcks_available, 1);
    check_invariants(&reg);
}

#[test]
fn standby_parks_itself_while_the_tier_lives() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b3");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::IpAddr, "10.0.0.3");
    apply_int(&mut reg, &mut ctx, ObjScope::Backend, Key::Priority, 2);

    // Tier 1 is healthy, so the priority-2 backend parks as hot standby.
    let f = &reg.farms[0];
    assert_eq!(f.priority, 1);
    assert_eq!(f.backends[2].state, State::Avail);
    assert_eq!(f.total_weight, 5);
    check_invariants(&reg);
}

#[test]
fn deleted_backend_frees_its_mark_for_reuse() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    let b1 = reg.farms[0].backend_by_name("b1").unwrap();
    reg.backend_set_action(0, b1, Action::Delete);

    assert_eq!(reg.farms[0].total_bcks, 1);
    assert!(reg.farms[0].backend_by_name("b1").is_none());
    check_invariants(&reg);

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b4");
    assert_eq!(
        reg.farms[0].backends[reg.farms[0].backend_by_name("b4").unwrap()].mark,
        0x001
    );
    check_invariants(&reg);
}

#[test]
fn ipaddr_change_runs_a_stop_start_cycle() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);
    reg.rulerize_all().unwrap();
    emitter.clear();

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b2");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::IpAddr, "10.0.0.22");

    // The pre hook emits the farm with the backend stopped, the post hook
    // emits it again with the backend restarted.
    let farm_emits: Vec<_> = emitter
        .emitted()
        .into_iter()
        .filter(|(obj, _)| obj == "farm:f1")
        .collect();
    assert_eq!(farm_emits.len(), 2);
    assert!(farm_emits.iter().all(|(_, a)| *a == Action::Reload));

    let b2 = &reg.farms[0].backends[1];
    assert_eq!(b2.ipaddr.as_deref(), Some("10.0.0.22"));
    assert_eq!(b2.state, State::Up);
    assert!(b2.ethaddr.is_none());
    check_invariants(&reg);
}

#[test]
fn timed_sessions_resolve_backends_by_mark() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    emitter.set_sessions("map persist-f1 { elements = { 1.2.3.4 expires 30s : 0x002 } }");
    reg.session_get_timed(0);

    let f = &reg.farms[0];
    assert_eq!(f.timed_sessions.len(), 1);
    let s = &f.timed_sessions[0];
    assert_eq!(s.client, "1.2.3.4");
    assert_eq!(s.expiration.as_deref(), Some("30s"));
    assert_eq!(s.bck, Some(f.backends[1].id));
    assert_eq!(s.state, State::Up);
    check_invariants(&reg);
}

#[test]
fn unresolvable_session_keys_leave_the_backend_unset() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    emitter.set_sessions("elements = { 9.9.9.9 expires 10s : 0xfff }");
    reg.session_get_timed(0);

    assert_eq!(reg.farms[0].timed_sessions.len(), 1);
    assert!(reg.farms[0].timed_sessions[0].bck.is_none());
    check_invariants(&reg);
}

#[test]
fn static_sessions_follow_their_backend() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);
    apply(&mut reg, &mut ctx, ObjScope::Farm, Key::Name, "f1");
    apply(&mut reg, &mut ctx, ObjScope::Farm, Key::Persistence, "srcip");

    apply(&mut reg, &mut ctx, ObjScope::Session, Key::Client, "1.2.3.4");
    apply(&mut reg, &mut ctx, ObjScope::Session, Key::BackendRef, "b1");
    assert_eq!(reg.farms[0].static_sessions[0].state, State::Up);
    check_invariants(&reg);

    // Park the session, then bounce the backend: re-entering Up replays a
    // Start over the sessions pinned to it.
    let f = 0;
    assert!(reg.session_set_action(f, nftbal::session::SessionType::Static, 0, Action::Stop));
    assert_eq!(reg.farms[0].static_sessions[0].state, State::Off);

    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::Name, "b1");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "down");
    apply(&mut reg, &mut ctx, ObjScope::Backend, Key::State, "up");
    assert_eq!(reg.farms[0].static_sessions[0].state, State::Up);
    check_invariants(&reg);
}

#[test]
fn deleting_a_backend_detaches_its_sessions() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);
    apply(&mut reg, &mut ctx, ObjScope::Farm, Key::Name, "f1");
    apply(&mut reg, &mut ctx, ObjScope::Farm, Key::Persistence, "srcip");
    apply(&mut reg, &mut ctx, ObjScope::Session, Key::Client, "1.2.3.4");
    apply(&mut reg, &mut ctx, ObjScope::Session, Key::BackendRef, "b1");

    let b1 = reg.farms[0].backend_by_name("b1").unwrap();
    reg.backend_set_action(0, b1, Action::Delete);

    assert!(reg.farms[0].static_sessions.is_empty());
    check_invariants(&reg);
}

#[test]
fn farm_delete_releases_addresses_and_policies() {
    let (_emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    apply(&mut reg, &mut ctx, ObjScope::Policy, Key::Name, "blocked");
    bootstrap(&mut reg, &mut ctx);
    apply(&mut reg, &mut ctx, ObjScope::FarmPolicy, Key::Name, "blocked");
    assert_eq!(reg.policies[0].used, 1);
    assert_eq!(reg.addresses[0].used, 1);

    let f = reg.farm_by_name("f1").unwrap();
    reg.farm_set_action(f, Action::Delete);

    assert!(reg.farms.is_empty());
    assert_eq!(reg.policies[0].used, 0);
    assert_eq!(reg.addresses[0].used, 0);
    check_invariants(&reg);
}

#[test]
fn policy_reload_cascades_to_referencing_farms() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    apply(&mut reg, &mut ctx, ObjScope::Policy, Key::Name, "blocked");
    bootstrap(&mut reg, &mut ctx);
    apply(&mut reg, &mut ctx, ObjScope::FarmPolicy, Key::Name, "blocked");
    reg.rulerize_all().unwrap();
    emitter.clear();

    let p = reg.policy_by_name("blocked").unwrap();
    reg.policy_set_action(p, Action::Reload);

    assert_eq!(reg.farms[0].action, Action::Reload);
    reg.rulerize_all().unwrap();
    let emits = emitter.emitted();
    assert!(emits.contains(&("policy:blocked".to_string(), Action::Reload)));
    assert!(emits.contains(&("farm:f1".to_string(), Action::Reload)));
    check_invariants(&reg);
}

#[test]
fn failed_emit_keeps_the_pending_action() {
    struct FailingEmitter;
    impl RuleEmitter for FailingEmitter {
        fn rulerize(&self, _req: &RuleRequest<'_>) -> Result<()> {
            Err(nftbal::error::Error::Net("kernel said no".into()))
        }
        fn sessions_buffer(&self, _f: &Farm, _a: &Address) -> Result<String> {
            Ok(String::new())
        }
    }

    let mut reg = Registry::new(
        Arc::new(FailingEmitter),
        Arc::new(UnreachableProber),
        MASQUERADE_MARK_DEFAULT,
    );
    let mut ctx = ParserCtx::default();
    bootstrap(&mut reg, &mut ctx);

    assert!(reg.rulerize_all().is_err());
    assert_ne!(reg.farms[0].action, Action::None);
    check_invariants(&reg);
}

#[test]
fn teardown_empties_the_registry() {
    let (emitter, mut reg) = registry();
    let mut ctx = ParserCtx::default();
    apply(&mut reg, &mut ctx, ObjScope::Policy, Key::Name, "blocked");
    bootstrap(&mut reg, &mut ctx);

    reg.teardown();

    assert!(reg.farms.is_empty());
    assert!(reg.addresses.is_empty());
    assert!(reg.policies.is_empty());
    let emits = emitter.emitted();
    assert!(emits.contains(&("flush".to_string(), Action::Flush)));
}
