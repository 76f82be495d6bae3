//! The plugin lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle states. `Error` and `Crashed` are absorbing except for the
/// explicit recovery edges.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum PluginState {
    Discovered,
    Validated,
    Loading,
    Loaded,
    Enabled,
    Disabled,
    Unloading,
    Error,
    Crashed,
}

impl PluginState {
    /// Whether `from -> to` is an edge of the allowed graph. Any live
    /// state may fall into `Error`; only `Crashed` has a recovery edge
    /// back out of the terminals.
    pub fn can_transition(from: PluginState, to: PluginState) -> bool {
        use PluginState::*;
        if to == Error {
            return !matches!(from, Error | Crashed | Unloading);
        }
        matches!(
            (from, to),
            (Discovered, Validated)
                | (Validated, Loading)
                | (Loading, Loaded)
                | (Loaded, Enabled)
                | (Loaded, Unloading)
                | (Enabled, Disabled)
                | (Enabled, Crashed)
                | (Disabled, Enabled)
                | (Disabled, Unloading)
                | (Crashed, Enabled)
        )
    }

    /// States in which the plugin's worker exists.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Loaded | Self::Enabled | Self::Disabled)
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Unloading => "unloading",
            Self::Error => "error",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::PluginState::*;
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [Discovered, Validated, Loading, Loaded, Enabled, Disabled, Unloading];
        for pair in path.windows(2) {
            assert!(
                PluginState::can_transition(pair[0], pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_enable_disable_cycle() {
        assert!(PluginState::can_transition(Enabled, Disabled));
        assert!(PluginState::can_transition(Disabled, Enabled));
    }

    #[test]
    fn test_crash_recovery_via_enable() {
        assert!(PluginState::can_transition(Enabled, Crashed));
        assert!(PluginState::can_transition(Crashed, Enabled));
        // Crashed does not go anywhere else.
        assert!(!PluginState::can_transition(Crashed, Disabled));
        assert!(!PluginState::can_transition(Crashed, Unloading));
    }

    #[test]
    fn test_forbidden_edges() {
        assert!(!PluginState::can_transition(Discovered, Loaded));
        assert!(!PluginState::can_transition(Validated, Enabled));
        assert!(!PluginState::can_transition(Error, Enabled));
        assert!(!PluginState::can_transition(Unloading, Enabled));
        assert!(!PluginState::can_transition(Enabled, Loading));
    }
}
