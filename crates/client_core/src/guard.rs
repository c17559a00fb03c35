use shared::domain::{ConversationId, ProfileId};
use tokio::sync::watch;
use tracing::debug;

/// Identity of the active conversation at the moment an async operation was issued.
///
/// The epoch makes an A -> B -> A round trip distinguishable from never leaving A.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTicket {
    pub conversation: Option<ConversationId>,
    pub epoch: u64,
}

impl ConversationTicket {
    pub fn peer(&self) -> Option<&ProfileId> {
        self.conversation.as_ref().and_then(ConversationId::peer)
    }
}

/// Hands out tickets and answers "is this still the active conversation?" against the
/// live value, never against a copy captured when the operation started.
pub struct ConversationSwitchGuard {
    active: watch::Sender<ConversationTicket>,
}

impl Default for ConversationSwitchGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationSwitchGuard {
    pub fn new() -> Self {
        let (active, _) = watch::channel(ConversationTicket {
            conversation: None,
            epoch: 0,
        });
        Self { active }
    }

    pub fn ticket(&self) -> ConversationTicket {
        self.active.borrow().clone()
    }

    pub fn is_current(&self, ticket: &ConversationTicket) -> bool {
        *self.active.borrow() == *ticket
    }

    /// Moves to `conversation` and returns the new ticket. Every earlier ticket is stale.
    pub fn switch_to(&self, conversation: ConversationId) -> ConversationTicket {
        self.active.send_modify(|current| {
            current.conversation = Some(conversation);
            current.epoch += 1;
        });
        let ticket = self.ticket();
        debug!(epoch = ticket.epoch, "guard: active conversation changed");
        ticket
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationTicket> {
        self.active.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> ConversationId {
        ConversationId::Peer(ProfileId::new(id))
    }

    #[test]
    fn ticket_goes_stale_after_switch() {
        let guard = ConversationSwitchGuard::new();
        let a = guard.switch_to(peer("a"));
        assert!(guard.is_current(&a));

        guard.switch_to(peer("b"));
        assert!(!guard.is_current(&a));
    }

    #[test]
    fn returning_to_the_same_conversation_still_invalidates_old_tickets() {
        let guard = ConversationSwitchGuard::new();
        let first_visit = guard.switch_to(peer("a"));
        guard.switch_to(peer("b"));
        let second_visit = guard.switch_to(peer("a"));

        assert!(!guard.is_current(&first_visit));
        assert!(guard.is_current(&second_visit));
        assert_eq!(second_visit.peer(), Some(&ProfileId::new("a")));
    }

    #[test]
    fn subscribers_observe_switches() {
        let guard = ConversationSwitchGuard::new();
        let rx = guard.subscribe();
        guard.switch_to(ConversationId::Chatbot);
        assert_eq!(rx.borrow().conversation, Some(ConversationId::Chatbot));
    }
}
