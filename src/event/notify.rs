use serde::Serialize;
use tokio::sync::broadcast;

use crate::matching::ParticipantId;

use super::state::RoundStatus;

/// Change announcements sent after a successful commit. Consumers that fall
/// behind simply reload a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RoundUpdate {
        event_id: String,
        round_number: u32,
        status: RoundStatus,
    },
    CheckinUpdate {
        event_id: String,
        participant: ParticipantId,
        active: bool,
        active_count: usize,
    },
    SignalUpdate {
        event_id: String,
        from: ParticipantId,
        to: ParticipantId,
        mutual: bool,
    },
    TimerUpdate {
        event_id: String,
        status: RoundStatus,
        remaining_secs: Option<u64>,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::RoundUpdate { .. } => "round_update",
            Notification::CheckinUpdate { .. } => "checkin_update",
            Notification::SignalUpdate { .. } => "signal_update",
            Notification::TimerUpdate { .. } => "timer_update",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Notifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn send(&self, notification: Notification) {
        tracing::debug!(event = notification.name(), "notify");
        let _ = self.sender.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        notifier.send(Notification::RoundUpdate {
            event_id: "e".into(),
            round_number: 1,
            status: RoundStatus::InProgress,
        });
        notifier.send(Notification::TimerUpdate {
            event_id: "e".into(),
            status: RoundStatus::Paused,
            remaining_secs: Some(30),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "round_update");
        assert_eq!(rx.recv().await.unwrap().name(), "timer_update");
    }

    #[test]
    fn test_send_without_subscribers_is_fine() {
        Notifier::new(0).send(Notification::SignalUpdate {
            event_id: "e".into(),
            from: "a".into(),
            to: "b".into(),
            mutual: false,
        });
    }

    #[test]
    fn test_wire_name_matches_tag() {
        let json = serde_json::to_value(Notification::CheckinUpdate {
            event_id: "e".into(),
            participant: "a".into(),
            active: true,
            active_count: 3,
        })
        .unwrap();
        assert_eq!(json["event"], "checkin_update");
    }
}
