//! Farm-to-address bindings.
//!
//! A binding carries its own action so a farm can add or remove one listener
//! without restarting the rest. The address side keeps `used`/`nported`
//! counters in step with the live bindings.

use crate::action::Action;
use crate::error::{Error, Result};
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{AddressId, Registry};

/// Binding of one address to one farm.
#[derive(Debug, Clone, PartialEq)]
pub struct FarmAddress {
    pub address: AddressId,
    pub action: Action,
}

impl Registry {
    /// Apply an action to every binding of a farm.
    pub fn farmaddress_s_set_action(&mut self, f: usize, action: Action) {
        for fa in &mut self.farms[f].addresses {
            if action.overrides(fa.action) {
                fa.action = action;
            }
        }
    }

    pub fn farmaddress_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;

        Ok(match pair.key {
            Key::Name => {
                // Binding an already-bound address is a no-op.
                match self.address_by_name(pair.val.str()?) {
                    Some(a) => {
                        let id = self.addresses[a].id;
                        !self.farms[f].addresses.iter().any(|fa| fa.address == id)
                    }
                    None => true,
                }
            }
            _ => true,
        })
    }

    /// Bind an address (creating it on first mention) or detach the current
    /// one via `action = delete`.
    pub fn farmaddress_set_attribute(
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
                let a = self.address_get_or_create(pair.val.str()?);
                let id = self.addresses[a].id;
                if !self.farms[f].addresses.iter().any(|fa| fa.address == id) {
                    self.farms[f].addresses.push(FarmAddress {
                        address: id,
                        action: Action::Start,
                    });
                    self.addresses[a].used += 1;
                    self.addresses[a].nported += 1;
                    self.farm_set_action(f, Action::Reload);
                }
                ctx.address = Some(id);
            }
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                let id = ctx
                    .address
                    .ok_or_else(|| Error::ObjUnknown("address".into()))?;
                if action == Action::Delete {
                    self.farmaddress_unbind(f, id);
                    ctx.address = None;
                } else {
                    if let Some(fa) = self.farms[f].addresses.iter_mut().find(|fa| fa.address == id)
                    {
                        if action.overrides(fa.action) {
                            fa.action = action;
                        }
                    }
                }
            }
            _ => {
                return Err(Error::StructFailed(format!(
                    "farm address key {:?}",
                    pair.key
                )))
            }
        }

        Ok(())
    }

    /// Drop a binding and release the address counters.
    pub fn farmaddress_unbind(&mut self, f: usize, id: AddressId) {
        let before = self.farms[f].addresses.len();
        self.farms[f].addresses.retain(|fa| fa.address != id);
        if self.farms[f].addresses.len() == before {
            return;
        }
        if let Some(a) = self.address_idx(id) {
            self.addresses[a].used = self.addresses[a].used.saturating_sub(1);
            self.addresses[a].nported = self.addresses[a].nported.saturating_sub(1);
        }
        self.farm_set_action(f, Action::Reload);
    }

    /// Binding edits reload the farm on the way out.
    pub fn farmaddress_actionable(&mut self, ctx: &ParserCtx) -> Result<()> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;
        self.farm_set_action(f, Action::Reload);
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
    fn binding_creates_the_address_and_counts_it() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Farm, &pair(Key::Name, "f1")).unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();

        assert_eq!(reg.addresses.len(), 1);
        assert_eq!(reg.addresses[0].used, 1);
        assert_eq!(reg.addresses[0].nported, 1);
        assert_eq!(reg.farms[0].addresses.len(), 1);
    }

    #[test]
    fn rebinding_is_idempotent() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Farm, &pair(Key::Name, "f1")).unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();

        assert_eq!(reg.addresses[0].used, 1);
        assert_eq!(reg.farms[0].addresses.len(), 1);
    }

    #[test]
    fn two_farms_share_one_address() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Farm, &pair(Key::Name, "f1")).unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::Farm, &pair(Key::Name, "f2")).unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();

        assert_eq!(reg.addresses.len(), 1);
        assert_eq!(reg.addresses[0].used, 2);
    }

    #[test]
    fn unbind_releases_the_counters() {
        let mut reg = Registry::for_tests();
        let mut ctx = ParserCtx::default();
        reg.apply_pair(&mut ctx, ObjScope::Farm, &pair(Key::Name, "f1")).unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Name, "web80"))
            .unwrap();
        reg.apply_pair(&mut ctx, ObjScope::FarmAddress, &pair(Key::Action, "delete"))
            .unwrap();

        assert_eq!(reg.addresses[0].used, 0);
        assert!(reg.farms[0].addresses.is_empty());
    }
}
