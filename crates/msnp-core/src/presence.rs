//! Internal presence model.
//!
//! Wire status tokens are translated to and from this model only by the
//! notification channel.

use serde::{Deserialize, Serialize};

/// Availability state of the local user or a contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Presence {
    Online,
    Busy,
    Idle,
    BeRightBack,
    Away,
    OnThePhone,
    OutToLunch,
    /// Signed in but appearing offline to others.
    Invisible,
    #[default]
    Offline,
}

impl Presence {
    /// Reachable for chat.
    pub fn is_online(&self) -> bool {
        !matches!(self, Presence::Offline | Presence::Invisible)
    }

    /// Any of the "not at the keyboard" states.
    pub fn is_away(&self) -> bool {
        matches!(
            self,
            Presence::Idle
                | Presence::BeRightBack
                | Presence::Away
                | Presence::OnThePhone
                | Presence::OutToLunch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_states() {
        assert!(Presence::Busy.is_online());
        assert!(!Presence::Invisible.is_online());
        assert!(!Presence::Offline.is_online());
        assert!(Presence::OutToLunch.is_away());
        assert!(!Presence::Online.is_away());
    }
}
