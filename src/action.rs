//! Pending-change algebra shared by every configuration object.
//!
//! Each object carries an `Action` describing the kernel-side change it still
//! owes, and backends/farms/sessions carry an operational `State`. The action
//! ordering is load-bearing: `overrides` must compare discriminants exactly
//! this way or reload churn changes (see the per-object `set_action`
//! implementations).

use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pending kernel-side change for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    #[default]
    None = 0,
    Reload = 1,
    Start = 2,
    Stop = 3,
    Delete = 4,
    Flush = 5,
}

impl Action {
    /// Whether a request for `self` replaces the `current` pending action.
    ///
    /// Severity grows along the enum: a stronger request overwrites a weaker
    /// pending action, an equal or weaker request is dropped. Objects with
    /// coupled state transitions (backends, sessions, policies) layer their
    /// own branches on top of this rule.
    pub fn overrides(self, current: Action) -> bool {
        (self as u8) > (current as u8)
    }

    pub fn parse(s: &str) -> Option<Action> {
        match s {
            "none" => Some(Action::None),
            "reload" => Some(Action::Reload),
            "start" => Some(Action::Start),
            "stop" => Some(Action::Stop),
            "delete" => Some(Action::Delete),
            "flush" => Some(Action::Flush),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Reload => "reload",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Delete => "delete",
            Action::Flush => "flush",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the post-mutation hook must apply once an attribute landed.
///
/// Returned by the per-object pre-mutation hooks; `Flush` means the whole
/// farm has to be torn down and restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostAction {
    #[default]
    None,
    Reload,
    Start,
    Flush,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operational status of a backend, farm or session.
///
/// `Avail` is the hot-standby state: configured and healthy but parked
/// because its priority is below the farm's current priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Up,
    Down,
    Off,
    ConfErr,
    Avail,
}

impl State {
    pub fn parse(s: &str) -> Option<State> {
        match s {
            "up" => Some(State::Up),
            "down" => Some(State::Down),
            "off" => Some(State::Off),
            "conferr" => Some(State::ConfErr),
            "avail" => Some(State::Avail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Up => "up",
            State::Down => "down",
            State::Off => "off",
            State::ConfErr => "conferr",
            State::Avail => "avail",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stronger_action_overwrites_weaker() {
        // A pending Start is replaced by a Stop request, not the reverse.
        assert!(Action::Stop.overrides(Action::Start));
        assert!(!Action::Start.overrides(Action::Stop));
    }

    #[test]
    fn reload_never_downgrades_start() {
        assert!(!Action::Reload.overrides(Action::Start));
        assert!(Action::Start.overrides(Action::Reload));
    }

    #[test]
    fn any_request_lands_on_a_clean_object() {
        assert!(Action::Reload.overrides(Action::None));
        assert!(Action::Stop.overrides(Action::None));
        assert!(!Action::None.overrides(Action::Reload));
    }

    #[test]
    fn action_round_trips_through_parse() {
        for a in [
            Action::None,
            Action::Reload,
            Action::Start,
            Action::Stop,
            Action::Delete,
            Action::Flush,
        ] {
            assert_eq!(Action::parse(a.as_str()), Some(a));
        }
        assert_eq!(Action::parse("restart"), None);
    }

    #[test]
    fn state_round_trips_through_parse() {
        for s in [State::Up, State::Down, State::Off, State::ConfErr, State::Avail] {
            assert_eq!(State::parse(s.as_str()), Some(s));
        }
        assert_eq!(State::parse("unknown"), None);
    }
}
