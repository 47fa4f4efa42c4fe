use std::fmt;

use crate::types::SessionId;

/// Attribution attached to every transaction the protocol layer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// Edit made by the owning process.
    Local,
    /// Operations received from a peer session.
    Session(SessionId),
    /// State restored from persistence.
    Persistence,
}

impl UpdateOrigin {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Session(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether an update tagged with this origin must be withheld from `session`.
    pub fn is_echo_for(&self, session: SessionId) -> bool {
        self.session() == Some(session)
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Persistence => f.write_str("persistence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_originating_session_is_an_echo() {
        let origin_session = SessionId::new();
        let other = SessionId::new();
        let origin = UpdateOrigin::Session(origin_session);

        assert!(origin.is_echo_for(origin_session));
        assert!(!origin.is_echo_for(other));
        assert!(!UpdateOrigin::Local.is_echo_for(origin_session));
    }

    #[test]
    fn display_is_stable_transaction_tag() {
        let id: SessionId = "11111111-2222-4333-8444-555555555555".parse().expect("valid id");
        assert_eq!(
            UpdateOrigin::Session(id).to_string(),
            "session:11111111-2222-4333-8444-555555555555"
        );
        assert_eq!(UpdateOrigin::Persistence.to_string(), "persistence");
    }
}
