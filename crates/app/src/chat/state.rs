/// Local name of a conversation, valid before any durable id exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationHandle(pub u64);

impl ConversationHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one outbound generation request.
///
/// This must change on every send so stale fragments can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key used for stale-fragment rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation: ConversationHandle,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(conversation: ConversationHandle, session_id: StreamSessionId) -> Self {
        Self {
            conversation,
            session_id,
        }
    }
}

/// What the presentation layer shows next to the in-flight reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activity {
    #[default]
    Idle,
    /// Request sent, no text yet.
    Waiting,
    /// Text is growing.
    Generating,
}

/// Lifecycle of one user turn.
///
/// `Idle -> Sending -> Streaming -> Finalizing -> Idle`, with
/// `Sending | Streaming -> Cancelled -> Idle` on a user stop. Errors return straight to
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Sending(StreamTarget),
    Streaming(StreamTarget),
    Finalizing(StreamTarget),
    Cancelled(StreamTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransition {
    Send(StreamTarget),
    FirstFragment(StreamTarget),
    Complete(StreamTarget),
    Fail(StreamTarget),
    Cancel(StreamTarget),
    /// Leaves `Finalizing` or `Cancelled` once their bookkeeping is done.
    Settle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    NotIdle {
        phase: TurnPhase,
    },
    NoActiveTurn,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    Unsettled {
        phase: TurnPhase,
    },
}

pub type TurnTransitionResult = Result<TurnPhase, TurnTransitionRejection>;

impl TurnPhase {
    /// Target of the request that may still deliver fragments.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Sending(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Finalizing(_) | Self::Cancelled(_) => None,
        }
    }

    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn activity(&self) -> Activity {
        match self {
            Self::Sending(_) => Activity::Waiting,
            Self::Streaming(_) => Activity::Generating,
            Self::Idle | Self::Finalizing(_) | Self::Cancelled(_) => Activity::Idle,
        }
    }

    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Send(target) => match self {
                Self::Idle => Ok(Self::Sending(target)),
                phase => Err(TurnTransitionRejection::NotIdle { phase: *phase }),
            },
            TurnTransition::FirstFragment(target) => {
                self.expect_active(target).map(|_| Self::Streaming(target))
            }
            TurnTransition::Complete(target) => {
                self.expect_active(target).map(|_| Self::Finalizing(target))
            }
            TurnTransition::Fail(target) => self.expect_active(target).map(|_| Self::Idle),
            TurnTransition::Cancel(target) => {
                self.expect_active(target).map(|_| Self::Cancelled(target))
            }
            TurnTransition::Settle => match self {
                Self::Idle | Self::Finalizing(_) | Self::Cancelled(_) => Ok(Self::Idle),
                phase => Err(TurnTransitionRejection::Unsettled { phase: *phase }),
            },
        }
    }

    fn expect_active(&self, target: StreamTarget) -> Result<StreamTarget, TurnTransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(active),
            Some(active) => Err(TurnTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            None => Err(TurnTransitionRejection::NoActiveTurn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(session: u64) -> StreamTarget {
        StreamTarget::new(ConversationHandle::new(1), StreamSessionId::new(session))
    }

    #[test]
    fn happy_path_walks_every_phase() {
        let t = target(1);
        let phase = TurnPhase::Idle
            .apply(TurnTransition::Send(t))
            .and_then(|phase| phase.apply(TurnTransition::FirstFragment(t)))
            .and_then(|phase| phase.apply(TurnTransition::FirstFragment(t)))
            .and_then(|phase| phase.apply(TurnTransition::Complete(t)));
        assert_eq!(phase, Ok(TurnPhase::Finalizing(t)));

        let settled = phase.and_then(|phase| phase.apply(TurnTransition::Settle));
        assert_eq!(settled, Ok(TurnPhase::Idle));
    }

    #[test]
    fn second_send_is_rejected_not_queued() {
        let sending = TurnPhase::Sending(target(1));
        assert_eq!(
            sending.apply(TurnTransition::Send(target(2))),
            Err(TurnTransitionRejection::NotIdle { phase: sending })
        );
    }

    #[test]
    fn stale_target_cannot_finish_the_active_turn() {
        let streaming = TurnPhase::Streaming(target(2));
        assert_eq!(
            streaming.apply(TurnTransition::Complete(target(1))),
            Err(TurnTransitionRejection::SessionMismatch {
                active: target(2),
                attempted: target(1),
            })
        );
        assert!(!streaming.accepts_stream_event(target(1)));
    }

    #[test]
    fn cancel_is_only_valid_while_a_request_is_open() {
        assert_eq!(
            TurnPhase::Idle.apply(TurnTransition::Cancel(target(1))),
            Err(TurnTransitionRejection::NoActiveTurn)
        );
        assert_eq!(
            TurnPhase::Sending(target(1)).apply(TurnTransition::Cancel(target(1))),
            Ok(TurnPhase::Cancelled(target(1)))
        );
    }

    #[test]
    fn activity_separates_waiting_from_generating() {
        assert_eq!(TurnPhase::Sending(target(1)).activity(), Activity::Waiting);
        assert_eq!(TurnPhase::Streaming(target(1)).activity(), Activity::Generating);
        assert_eq!(TurnPhase::Finalizing(target(1)).activity(), Activity::Idle);
    }
}
