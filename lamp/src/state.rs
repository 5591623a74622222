//! Session finite-state-machine types.
//!
//! The transitions themselves live in [`crate::client`] and
//! [`crate::server`]; this module only names the states and which moves
//! between them are legal, so both sides can assert on them.

use std::fmt;

/// Client session states.
///
/// ```text
///  INIT ──INIT-ACK──▶ ACTIVE ──DATA──▶ AWAITING_REPLY ──ACK──▶ ACTIVE
///   │                   │                  │    │
///   │ timeout           │ count reached    │    └─ACK, follow-up on──▶ FOLLOWUP_PENDING
///   ▼                   ▼                  │                                │
///  FAILED              DONE ◀──────────────┴──────── FOLLOWUP / expiry ─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Init,
    Active,
    AwaitingReply,
    FollowupPending,
    Done,
    Failed,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Done | ClientState::Failed)
    }

    /// Whether `self → next` is a legal move.
    pub fn can_move_to(self, next: ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (Init, Active) | (Init, Failed) | (Init, Done) => true,
            (Active, AwaitingReply) | (Active, Done) | (Active, Failed) => true,
            (AwaitingReply, Active)
            | (AwaitingReply, FollowupPending)
            | (AwaitingReply, Done)
            | (AwaitingReply, Failed) => true,
            (FollowupPending, Active) | (FollowupPending, Done) | (FollowupPending, Failed) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Init => "INIT",
            ClientState::Active => "ACTIVE",
            ClientState::AwaitingReply => "AWAITING_REPLY",
            ClientState::FollowupPending => "FOLLOWUP_PENDING",
            ClientState::Done => "DONE",
            ClientState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Server states.
///
/// ```text
///  LISTENING ──INIT──▶ SERVING ──END / idle timeout──▶ LISTENING (daemon)
///      ▲                                         └────▶ TERMINATED
///      └─────────────── stop ───────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Listening,
    Serving,
    Terminated,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Listening => "LISTENING",
            ServerState::Serving => "SERVING",
            ServerState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ClientState::Done.is_terminal());
        assert!(ClientState::Failed.is_terminal());
        assert!(!ClientState::AwaitingReply.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(!ClientState::Done.can_move_to(ClientState::Active));
        assert!(!ClientState::Failed.can_move_to(ClientState::Init));
    }

    #[test]
    fn handshake_must_precede_probing() {
        assert!(!ClientState::Init.can_move_to(ClientState::AwaitingReply));
        assert!(ClientState::Init.can_move_to(ClientState::Active));
        assert!(ClientState::AwaitingReply.can_move_to(ClientState::FollowupPending));
        assert!(!ClientState::Active.can_move_to(ClientState::FollowupPending));
    }

    #[test]
    fn display_uses_protocol_names() {
        assert_eq!(ClientState::AwaitingReply.to_string(), "AWAITING_REPLY");
        assert_eq!(ServerState::Listening.to_string(), "LISTENING");
    }
}
