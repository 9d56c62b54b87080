//! Client-to-backend affinity tracking.
//!
//! Static sessions are administrator-declared and survive reloads; timed
//! sessions mirror the kernel persistence set and are advisory. The kernel
//! reports set contents as a textual buffer which `parse_session_elements`
//! turns into structured records without touching the kernel itself.

use crate::action::{Action, State};
use crate::error::{Error, Result};
use crate::parser::{ConfigPair, Key, ParserCtx};
use crate::registry::{BackendId, Registry};

/// Which of the two per-farm session tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Static,
    Timed,
}

/// One affinity record. The client key is opaque to the control plane; its
/// syntax depends on the farm persistence mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub client: String,
    pub bck: Option<BackendId>,
    pub state: State,
    pub action: Action,
    pub expiration: Option<String>,
}

impl Session {
    pub fn new_static(client: &str, bck: Option<BackendId>) -> Session {
        Session {
            client: client.to_string(),
            bck,
            state: State::Off,
            action: Action::None,
            expiration: None,
        }
    }

    pub fn new_timed(client: &str, bck: Option<BackendId>, expiration: &str) -> Session {
        Session {
            client: client.to_string(),
            bck,
            state: State::Up,
            action: Action::None,
            expiration: Some(expiration.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kernel buffer parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One element parsed out of a kernel set listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionElement {
    pub client: String,
    pub expiration: String,
    pub backend_key: String,
}

/// Parse a kernel set listing of the form
/// `elements = { <client> [timeout <t>] expires <e> : <bck_key>, … }`.
///
/// Parsing stops at the first element that does not follow the shape;
/// everything successfully parsed before it is returned. Trailing
/// whitespace and the closing brace are tolerated.
pub fn parse_session_elements(buf: &str) -> Vec<SessionElement> {
    let mut out = Vec::new();

    let Some(start) = buf.find("elements = {") else {
        return out;
    };
    let body = &buf[start + "elements = {".len()..];

    for chunk in body.split(',') {
        let chunk = chunk.trim_matches(|c: char| c.is_whitespace() || c == '}' || c == '\0');
        if chunk.is_empty() {
            continue;
        }

        let Some((lhs, backend_key)) = chunk.rsplit_once(" : ") else {
            break;
        };
        let Some((head, expiration)) = lhs.rsplit_once(" expires ") else {
            break;
        };
        // The timeout clause is optional; the client is everything before it.
        let client = match head.split_once(" timeout ") {
            Some((client, _)) => client,
            None => head,
        };
        let client = client.trim();
        if client.is_empty() {
            break;
        }

        out.push(SessionElement {
            client: client.to_string(),
            expiration: expiration.trim().to_string(),
            backend_key: backend_key.trim().to_string(),
        });
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Registry {
    /// Apply an action to one session, honoring the session state machine.
    /// `Delete` removes the record. Returns whether anything changed.
    pub fn session_set_action(
        &mut self,
        f: usize,
        stype: SessionType,
        s: usize,
        action: Action,
    ) -> bool {
        let sessions = match stype {
            SessionType::Static => &mut self.farms[f].static_sessions,
            SessionType::Timed => &mut self.farms[f].timed_sessions,
        };

        if sessions[s].action == action {
            return false;
        }

        if action == Action::Delete {
            sessions.remove(s);
            return true;
        }

        if action == Action::Stop && sessions[s].state == State::Up {
            sessions[s].action = action;
            sessions[s].state = State::Off;
            return true;
        }

        if action == Action::Start && sessions[s].state != State::Up && sessions[s].bck.is_some() {
            sessions[s].action = Action::Start;
            sessions[s].state = State::Up;
            return true;
        }

        if action == Action::Reload && sessions[s].state == State::Up && sessions[s].bck.is_some() {
            sessions[s].action = Action::Reload;
        }

        false
    }

    /// Drop a whole session table.
    pub fn session_s_delete(&mut self, f: usize, stype: SessionType) {
        match stype {
            SessionType::Static => self.farms[f].static_sessions.clear(),
            SessionType::Timed => self.farms[f].timed_sessions.clear(),
        }
    }

    /// Refresh the timed table from the kernel persistence sets of every
    /// bound address.
    pub fn session_get_timed(&mut self, f: usize) {
        self.farms[f].timed_sessions.clear();

        let bufs: Vec<String> = {
            let farm = &self.farms[f];
            farm.addresses
                .iter()
                .filter_map(|fa| {
                    let a = self.address_idx(fa.address)?;
                    match self.emitter.sessions_buffer(farm, &self.addresses[a]) {
                        Ok(buf) => Some(buf),
                        Err(e) => {
                            tracing::debug!(farm = %farm.name, error = %e,
                                            "session set query failed");
                            None
                        }
                    }
                })
                .collect()
        };

        let mut fresh = Vec::new();
        for buf in &bufs {
            for el in parse_session_elements(buf) {
                let bck = self.farms[f].backend_for_session_key(&el.backend_key, self.masq_mark);
                fresh.push(Session::new_timed(&el.client, bck, &el.expiration));
            }
        }

        tracing::debug!(farm = %self.farms[f].name, sessions = fresh.len(), "timed sessions");
        self.farms[f].timed_sessions = fresh;
    }

    /// Replay a backend action over the sessions pinned to it.
    ///
    /// Static sessions match by effective mark for NAT/local farms and by
    /// backend identity for ingress farms. If no timed sessions were cached,
    /// the kernel set is fetched, the action applied, and the cache dropped
    /// again so stale entries never linger.
    pub fn session_backend_action(&mut self, f: usize, b: usize, action: Action) {
        let hastimed = !self.farms[f].timed_sessions.is_empty();
        let ingress = self.farms[f].mode.is_ingress();
        let bid = self.farms[f].backends[b].id;
        let bmark = self
            .farms[f]
            .effective_mark(&self.farms[f].backends[b], self.masq_mark);

        let matches = |reg: &Registry, s: &Session| -> bool {
            let Some(sbck) = s.bck else { return false };
            if ingress {
                sbck == bid
            } else {
                let farm = &reg.farms[f];
                farm.backend_idx(sbck)
                    .map_or(false, |sb| farm.effective_mark(&farm.backends[sb], reg.masq_mark) == bmark)
            }
        };

        let mut s = 0;
        while s < self.farms[f].static_sessions.len() {
            let hit = matches(self, &self.farms[f].static_sessions[s]);
            let removed = hit
                && action == Action::Delete
                && self.session_set_action(f, SessionType::Static, s, action);
            if hit && action != Action::Delete {
                self.session_set_action(f, SessionType::Static, s, action);
            }
            if !removed {
                s += 1;
            }
        }

        if !hastimed {
            self.session_get_timed(f);
        }

        let mut s = 0;
        while s < self.farms[f].timed_sessions.len() {
            let hit = matches(self, &self.farms[f].timed_sessions[s]);
            let removed = hit
                && action == Action::Delete
                && self.session_set_action(f, SessionType::Timed, s, action);
            if hit && action != Action::Delete {
                self.session_set_action(f, SessionType::Timed, s, action);
            }
            if !removed {
                s += 1;
            }
        }

        if !hastimed {
            self.session_s_delete(f, SessionType::Timed);
        }
    }

    // ── Attribute plumbing (static sessions) ───────────────────────

    pub fn session_changed(&self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<bool> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;
        if pair.key == Key::Client {
            return Ok(true);
        }
        let s = ctx
            .session
            .as_deref()
            .and_then(|c| self.farms[f].static_sessions.iter().position(|s| s.client == c))
            .ok_or_else(|| Error::ObjUnknown("session".into()))?;
        let s = &self.farms[f].static_sessions[s];

        Ok(match pair.key {
            Key::BackendRef => {
                let b = self.farms[f].backend_by_name(pair.val.str()?);
                match (s.bck, b) {
                    (Some(sbck), Some(b)) => sbck != self.farms[f].backends[b].id,
                    _ => true,
                }
            }
            _ => true,
        })
    }

    pub fn session_pre_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Err(Error::ObjUnknown("farm".into()));
        };
        let Some(s) = ctx
            .session
            .as_deref()
            .and_then(|c| self.farms[f].static_sessions.iter().position(|s| s.client == c))
        else {
            return Ok(());
        };

        if pair.key == Key::BackendRef
            && self.session_set_action(f, SessionType::Static, s, Action::Stop)
        {
            self.farm_set_action(f, Action::Reload);
            if let Err(e) = self.farm_rulerize(f) {
                tracing::warn!(error = %e, "session stop failed, keeping pending action");
            }
        }
        Ok(())
    }

    pub fn session_pos_actionable(&mut self, ctx: &ParserCtx, pair: &ConfigPair) -> Result<()> {
        // The record may have been deleted by an `action` key.
        let Some(f) = ctx.farm.and_then(|id| self.farm_idx(id)) else {
            return Ok(());
        };
        let Some(s) = ctx
            .session
            .as_deref()
            .and_then(|c| self.farms[f].static_sessions.iter().position(|s| s.client == c))
        else {
            return Ok(());
        };

        if pair.key == Key::BackendRef
            && self.session_set_action(f, SessionType::Static, s, Action::Start)
        {
            self.farm_set_action(f, Action::Reload);
            if let Err(e) = self.farm_rulerize(f) {
                tracing::warn!(error = %e, "session start failed, keeping pending action");
            }
        }
        Ok(())
    }

    pub fn session_set_attribute(&mut self, ctx: &mut ParserCtx, pair: &ConfigPair) -> Result<()> {
        let f = ctx
            .farm
            .and_then(|id| self.farm_idx(id))
            .ok_or_else(|| Error::ObjUnknown("farm".into()))?;

        if pair.key == Key::Client {
            let client = pair.val.str()?;
            if client.is_empty() {
                return Err(Error::StructFailed("empty session client".into()));
            }
            if self.farms[f].static_sessions.iter().all(|s| s.client != client) {
                self.farms[f]
                    .static_sessions
                    .push(Session::new_static(client, None));
            }
            ctx.session = Some(client.to_string());
            return Ok(());
        }

        let s = ctx
            .session
            .as_deref()
            .and_then(|c| self.farms[f].static_sessions.iter().position(|s| s.client == c))
            .ok_or_else(|| Error::ObjUnknown("session".into()))?;

        match pair.key {
            Key::BackendRef => {
                let b = self
                    .farms[f]
                    .backend_by_name(pair.val.str()?)
                    .ok_or_else(|| Error::ObjUnknown(format!("backend {}", pair.val)))?;
                self.farms[f].static_sessions[s].bck = Some(self.farms[f].backends[b].id);
                if self.session_set_action(f, SessionType::Static, s, Action::Start) {
                    self.farm_set_action(f, Action::Reload);
                }
            }
            Key::Action => {
                let action = Action::parse(pair.val.str()?)
                    .ok_or_else(|| Error::StructFailed(format!("action {}", pair.val)))?;
                if self.session_set_action(f, SessionType::Static, s, action)
                    && action == Action::Delete
                {
                    ctx.session = None;
                }
            }
            _ => return Err(Error::StructFailed(format!("session key {:?}", pair.key))),
        }

        Ok(())
    }

    /// Delete one static session by client key (admin API entry point).
    pub fn session_delete(&mut self, farm: &str, client: &str) -> Result<()> {
        let f = self
            .farm_by_name(farm)
            .ok_or_else(|| Error::NotFound(format!("farm {farm}")))?;
        let s = self.farms[f]
            .static_sessions
            .iter()
            .position(|s| s.client == client)
            .ok_or_else(|| Error::NotFound(format!("session {client}")))?;
        self.session_set_action(f, SessionType::Static, s, Action::Delete);
        self.farm_set_action(f, Action::Reload);
        Ok(())
    }
}
