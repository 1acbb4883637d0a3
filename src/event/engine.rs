use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::matching::{
    solve, CompatibilityMatrix, DegradeReason, PairKey, Participant, ParticipantId, PlannedRound, RoundResult,
    ScoringContext, SolveRequest,
};
use crate::requests::{validate_event_id, validate_participant_id};

use super::notify::{Notification, Notifier};
use super::state::{EventSettings, EventState, RoundStatus, SettingsUpdate};
use super::store::EventStore;

/// Result of a successful advance: the committed round plus the lookahead that
/// justified it.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub round: RoundResult,
    pub advisory: Vec<PlannedRound>,
    pub horizon: u32,
    pub relaxed: Vec<(u32, PairKey)>,
    pub degraded: Option<DegradeReason>,
}

fn poisoned<T>(_: T) -> EngineError {
    EngineError::Internal("event lock poisoned".into())
}

/// One event: its state, its score matrix and the lock serializing changes.
pub struct EventContext {
    id: String,
    /// Held for the whole of every mutation, solver run included.
    mutation: Mutex<()>,
    state: RwLock<Arc<EventState>>,
    matrix: RwLock<Arc<CompatibilityMatrix>>,
    config: Arc<EngineConfig>,
    store: Arc<dyn EventStore>,
    notifier: Notifier,
}

impl EventContext {
    fn new(
        state: EventState,
        matrix: CompatibilityMatrix,
        config: Arc<EngineConfig>,
        store: Arc<dyn EventStore>,
        notifier: Notifier,
    ) -> Self {
        EventContext {
            id: state.event_id.clone(),
            mutation: Mutex::new(()),
            state: RwLock::new(Arc::new(state)),
            matrix: RwLock::new(Arc::new(matrix)),
            config,
            store,
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whole, consistent view of the last committed state.
    pub fn snapshot(&self) -> Result<Arc<EventState>, EngineError> {
        Ok(Arc::clone(&*self.state.read().map_err(poisoned)?))
    }

    pub fn matrix(&self) -> Result<Arc<CompatibilityMatrix>, EngineError> {
        Ok(Arc::clone(&*self.matrix.read().map_err(poisoned)?))
    }

    /// Stores `next` and only then makes it visible.
    async fn install(&self, mut next: EventState) -> Result<Arc<EventState>, EngineError> {
        next.version += 1;
        let next = Arc::new(next);
        let store = Arc::clone(&self.store);
        let document = Arc::clone(&next);
        tokio::task::spawn_blocking(move || store.commit(&document))
            .await
            .map_err(|e| EngineError::Internal(format!("store task failed: {e}")))?
            .map_err(|e| {
                error!(event = %self.id, error = %e, "commit failed, state unchanged");
                EngineError::CommitFailure(e)
            })?;
        *self.state.write().map_err(poisoned)? = Arc::clone(&next);
        Ok(next)
    }

    /// Applies `op` to a copy of the state and commits the copy. Nothing is
    /// stored when `op` fails or leaves the state as it was.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut EventState) -> Result<T, EngineError>,
    ) -> Result<(T, Arc<EventState>), EngineError> {
        let _guard = self.mutation.lock().await;
        let current = self.snapshot()?;
        let mut next = (*current).clone();
        let out = op(&mut next)?;
        if next == *current {
            return Ok((out, current));
        }
        let installed = self.install(next).await?;
        Ok((out, installed))
    }

    fn notify_round(&self, state: &EventState) {
        self.notifier.send(Notification::RoundUpdate {
            event_id: self.id.clone(),
            round_number: state.round_number,
            status: state.status,
        });
    }

    fn notify_timer(&self, state: &EventState) {
        self.notifier.send(Notification::TimerUpdate {
            event_id: self.id.clone(),
            status: state.status,
            remaining_secs: state.timer.remaining(Utc::now()),
        });
    }

    /// Solves and commits the next round. On any error the state is untouched.
    pub async fn advance_round(&self) -> Result<AdvanceOutcome, EngineError> {
        let _guard = self.mutation.lock().await;
        let current = self.snapshot()?;
        current.ensure_can_advance()?;

        let matrix = self.matrix()?;
        let config = Arc::clone(&self.config);
        let input = Arc::clone(&current);
        let plan = tokio::task::spawn_blocking(move || {
            let pool = input.active_pool();
            let ledger = input.pit_stop_ledger();
            let signals = input.interest_signals();
            solve(SolveRequest {
                pool: &pool,
                scoring: ScoringContext {
                    source: &*matrix,
                    history: &input.history,
                    signals: &signals,
                    config: &config.scoring,
                },
                pit_stops: &ledger,
                round_number: input.round_number + 1,
                horizon: input.horizon(),
                config: &config.solver,
            })
        })
        .await
        .map_err(|e| EngineError::Internal(format!("solver task failed: {e}")))?
        .map_err(|e| {
            warn!(event = %self.id, error = %e, "round not advanced");
            EngineError::from(e)
        })?;

        let mut next = (*current).clone();
        let round = next.apply_round(&plan.committed, plan.degraded.is_some(), Utc::now())?;
        let installed = self.install(next).await?;

        info!(
            event = %self.id,
            round = round.round_number,
            pairs = round.pairings.len(),
            pit_stop = ?round.pit_stop.as_ref().map(ParticipantId::as_str),
            average = round.average_score,
            degraded = round.degraded,
            "round committed"
        );
        self.notify_round(&installed);
        self.notify_timer(&installed);

        Ok(AdvanceOutcome {
            round,
            advisory: plan.advisory,
            horizon: plan.horizon,
            relaxed: plan.relaxed,
            degraded: plan.degraded,
        })
    }

    pub async fn finish_round(&self) -> Result<Arc<EventState>, EngineError> {
        let (_, state) = self.mutate(EventState::finish_round).await?;
        info!(event = %self.id, round = state.round_number, "round finished");
        self.notify_round(&state);
        Ok(state)
    }

    /// Finishes the running round when its timer has elapsed.
    pub async fn expire_if_due(&self, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let due = {
            let state = self.snapshot()?;
            state.status == RoundStatus::InProgress && state.timer.expired(now)
        };
        if !due {
            return Ok(false);
        }
        let (expired, state) = self.mutate(|s| Ok(s.expire_if_due(now))).await?;
        if expired {
            info!(event = %self.id, round = state.round_number, "round timer expired");
            self.notify_round(&state);
        }
        Ok(expired)
    }

    pub async fn pause(&self) -> Result<Arc<EventState>, EngineError> {
        let (_, state) = self.mutate(|s| s.pause(Utc::now())).await?;
        self.notify_timer(&state);
        Ok(state)
    }

    pub async fn resume(&self) -> Result<Arc<EventState>, EngineError> {
        let (_, state) = self.mutate(|s| s.resume(Utc::now())).await?;
        self.notify_timer(&state);
        Ok(state)
    }

    pub async fn undo_last_round(&self) -> Result<RoundResult, EngineError> {
        let (undone, state) = self.mutate(EventState::undo_last_round).await?;
        info!(event = %self.id, round = undone.round_number, "round undone");
        self.notify_round(&state);
        Ok(undone)
    }

    pub async fn swap_override(
        &self,
        round_number: u32,
        x: &ParticipantId,
        y: &ParticipantId,
    ) -> Result<RoundResult, EngineError> {
        let matrix = self.matrix()?;
        let scoring = &self.config.scoring;
        let (round, state) = self
            .mutate(|s| s.swap_partners(round_number, x, y, &*matrix, scoring))
            .await?;
        info!(event = %self.id, round = round_number, a = %x, b = %y, "partners swapped");
        self.notify_round(&state);
        Ok(round)
    }

    /// Activates a participant for the next round. Unknown ids need a
    /// registration and join as walk-ins.
    pub async fn check_in(&self, id: &ParticipantId, walk_in: Option<Participant>) -> Result<bool, EngineError> {
        validate_participant_id(id.as_str()).map_err(EngineError::InvalidRequest)?;
        let (registered, state) = self.mutate(|s| s.check_in(id, walk_in)).await?;
        if registered {
            let pending = state.pending_scoring(&*self.matrix()?).len();
            info!(event = %self.id, participant = %id, pending, "walk-in registered, scores pending");
        }
        self.notifier.send(Notification::CheckinUpdate {
            event_id: self.id.clone(),
            participant: id.clone(),
            active: true,
            active_count: state.active_pool().len(),
        });
        Ok(registered)
    }

    pub async fn check_out(&self, id: &ParticipantId) -> Result<(), EngineError> {
        let (_, state) = self.mutate(|s| s.check_out(id)).await?;
        self.notifier.send(Notification::CheckinUpdate {
            event_id: self.id.clone(),
            participant: id.clone(),
            active: false,
            active_count: state.active_pool().len(),
        });
        Ok(())
    }

    pub async fn end_event(&self) -> Result<Arc<EventState>, EngineError> {
        let (_, state) = self.mutate(EventState::end_event).await?;
        info!(event = %self.id, rounds = state.round_number, "event ended, open networking");
        self.notify_round(&state);
        Ok(state)
    }

    pub async fn update_settings(&self, update: &SettingsUpdate) -> Result<EventSettings, EngineError> {
        let (_, state) = self.mutate(|s| s.update_settings(update)).await?;
        Ok(state.settings.clone())
    }

    /// Returns true when the signal completed a mutual match.
    pub async fn record_signal(
        &self,
        round_number: u32,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<bool, EngineError> {
        let (mutual, _) = self
            .mutate(|s| s.record_signal(round_number, from, to, Utc::now()))
            .await?;
        if mutual {
            info!(event = %self.id, a = %from, b = %to, "mutual match");
        }
        self.notifier.send(Notification::SignalUpdate {
            event_id: self.id.clone(),
            from: from.clone(),
            to: to.clone(),
            mutual,
        });
        Ok(mutual)
    }

    /// Merges externally produced base scores into the matrix.
    pub async fn set_pair_scores(&self, entries: Vec<(PairKey, f64)>) -> Result<usize, EngineError> {
        let _guard = self.mutation.lock().await;
        let mut matrix = (*self.matrix()?).clone();
        let count = entries.len();
        for (key, score) in entries {
            if !score.is_finite() {
                return Err(EngineError::InvalidRequest(format!("score for {key} is not a number")));
            }
            matrix.insert(key.low(), key.high(), score);
        }

        let matrix = Arc::new(matrix);
        let store = Arc::clone(&self.store);
        let document = Arc::clone(&matrix);
        let event_id = self.id.clone();
        tokio::task::spawn_blocking(move || store.save_matrix(&event_id, &document))
            .await
            .map_err(|e| EngineError::Internal(format!("store task failed: {e}")))??;
        *self.matrix.write().map_err(poisoned)? = matrix;
        info!(event = %self.id, count, "pair scores ingested");
        Ok(count)
    }

    pub fn pending_scoring(&self) -> Result<Vec<PairKey>, EngineError> {
        Ok(self.snapshot()?.pending_scoring(&*self.matrix()?))
    }
}

/// All events served by this process.
pub struct EventRegistry {
    events: RwLock<HashMap<String, Arc<EventContext>>>,
    /// Held for the whole of `create_event`, store write included.
    creating: Mutex<()>,
    config: Arc<EngineConfig>,
    store: Arc<dyn EventStore>,
    notifier: Notifier,
}

impl EventRegistry {
    pub fn new(config: EngineConfig, store: Arc<dyn EventStore>) -> Self {
        EventRegistry {
            events: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
            config: Arc::new(config),
            store,
            notifier: Notifier::default(),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub async fn create_event(
        &self,
        event_id: &str,
        participants: Vec<Participant>,
        matrix: CompatibilityMatrix,
    ) -> Result<Arc<EventContext>, EngineError> {
        validate_event_id(event_id).map_err(EngineError::InvalidRequest)?;
        let _creating = self.creating.lock().await;
        match self.get(event_id) {
            Ok(_) => return Err(EngineError::InvalidRequest(format!("event {event_id} already exists"))),
            Err(EngineError::UnknownEvent(_)) => {}
            Err(e) => return Err(e),
        }

        let mut state = EventState::new(event_id, EventSettings::from_config(&self.config));
        for participant in participants {
            validate_participant_id(participant.id.as_str()).map_err(EngineError::InvalidRequest)?;
            if state.participants.contains_key(&participant.id) {
                return Err(EngineError::InvalidRequest(format!("duplicate participant {}", participant.id)));
            }
            state.participants.insert(participant.id.clone(), participant);
        }
        state.version = 1;
        let (people, scored) = (state.participants.len(), matrix.len());

        let store = Arc::clone(&self.store);
        let (document, scores) = (state.clone(), matrix.clone());
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            store.commit(&document)?;
            store.save_matrix(&document.event_id, &scores)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("store task failed: {e}")))??;

        // A lazy load may have picked the committed state up already.
        let mut events = self.events.write().map_err(poisoned)?;
        let context = events.entry(event_id.to_string()).or_insert_with(|| {
            Arc::new(EventContext::new(
                state,
                matrix,
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                self.notifier.clone(),
            ))
        });
        info!(event = event_id, people, scored, "event created");
        Ok(Arc::clone(context))
    }

    /// Looks an event up, loading it from the store on first use.
    pub fn get(&self, event_id: &str) -> Result<Arc<EventContext>, EngineError> {
        validate_event_id(event_id).map_err(EngineError::InvalidRequest)?;
        if let Some(context) = self.events.read().map_err(poisoned)?.get(event_id) {
            return Ok(Arc::clone(context));
        }
        let stored = self
            .store
            .load(event_id)?
            .ok_or_else(|| EngineError::UnknownEvent(event_id.to_string()))?;

        let mut events = self.events.write().map_err(poisoned)?;
        let context = events.entry(event_id.to_string()).or_insert_with(|| {
            Arc::new(EventContext::new(
                stored.state,
                stored.matrix,
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                self.notifier.clone(),
            ))
        });
        Ok(Arc::clone(context))
    }

    /// Loads every event the store knows about.
    pub fn restore_all(&self) -> Result<usize, EngineError> {
        let ids = self.store.event_ids()?;
        for id in &ids {
            self.get(id)?;
        }
        Ok(ids.len())
    }

    pub fn event_ids(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self.events.read().map_err(poisoned)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Finishes every running round whose timer ran out. Returns how many did.
    pub async fn sweep_timers(&self, now: DateTime<Utc>) -> usize {
        let contexts: Vec<Arc<EventContext>> = match self.events.read() {
            Ok(events) => events.values().cloned().collect(),
            Err(_) => return 0,
        };
        let mut expired = 0;
        for context in contexts {
            match context.expire_if_due(now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(event = context.id(), error = %e, "timer sweep failed"),
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::store::{FileStore, MemoryStore, StoredEvent};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose commits can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl EventStore for FlakyStore {
        fn load(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
            self.inner.load(event_id)
        }

        fn commit(&self, state: &EventState) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected failure".into()));
            }
            self.inner.commit(state)
        }

        fn save_matrix(&self, event_id: &str, matrix: &CompatibilityMatrix) -> Result<(), StoreError> {
            self.inner.save_matrix(event_id, matrix)
        }

        fn event_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.event_ids()
        }
    }

    fn people(ids: &[&str]) -> Vec<Participant> {
        ids.iter().map(|id| Participant::new(*id, *id)).collect()
    }

    async fn event_with(store: Arc<dyn EventStore>, ids: &[&str]) -> (EventRegistry, Arc<EventContext>) {
        let registry = EventRegistry::new(EngineConfig::default(), store);
        let context = registry
            .create_event("test", people(ids), CompatibilityMatrix::new())
            .await
            .unwrap();
        (registry, context)
    }

    #[tokio::test]
    async fn test_advance_commits_round() {
        let (_registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c", "d"]).await;
        let outcome = event.advance_round().await.unwrap();
        assert_eq!(outcome.round.round_number, 1);
        assert_eq!(outcome.round.pairings.len(), 2);

        let state = event.snapshot().unwrap();
        assert_eq!(state.status, RoundStatus::InProgress);
        assert_eq!(state.history.len(), 2);
        for pairing in &outcome.round.pairings {
            assert!(state.history.contains(&pairing.key()));
        }
        // second advance needs the round to finish first
        assert!(matches!(
            event.advance_round().await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let (_registry, event) = event_with(store.clone(), &["a", "b", "c", "d", "e"]).await;
        let before = event.snapshot().unwrap();

        store.failing.store(true, Ordering::SeqCst);
        assert!(matches!(event.advance_round().await, Err(EngineError::CommitFailure(_))));
        assert_eq!(*event.snapshot().unwrap(), *before);
        assert_eq!(store.load("test").unwrap().unwrap().state, *before);

        store.failing.store(false, Ordering::SeqCst);
        let outcome = event.advance_round().await.unwrap();
        assert_eq!(outcome.round.round_number, 1);
        assert_eq!(store.load("test").unwrap().unwrap().state, *event.snapshot().unwrap());
    }

    #[tokio::test]
    async fn test_undo_restores_previous_state() {
        let (_registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c", "d", "e"]).await;
        event.advance_round().await.unwrap();
        event.finish_round().await.unwrap();
        let before = event.snapshot().unwrap();

        let outcome = event.advance_round().await.unwrap();
        let partner = outcome.round.pairings[0].clone();
        event.record_signal(2, &partner.a, &partner.b).await.unwrap();
        event.undo_last_round().await.unwrap();

        let after = event.snapshot().unwrap();
        assert_eq!(after.round_number, before.round_number);
        assert_eq!(after.rounds, before.rounds);
        assert_eq!(after.history, before.history);
        assert_eq!(after.participants, before.participants);
        assert_eq!(after.signals, before.signals);
        assert_eq!(after.status, RoundStatus::BetweenRounds);
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn test_concurrent_advances_commit_once() {
        let (_registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c", "d", "e", "f"]).await;
        let (first, second) = tokio::join!(event.advance_round(), event.advance_round());
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(event.snapshot().unwrap().round_number, 1);
        assert_eq!(event.snapshot().unwrap().rounds.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_of_five_through_the_engine() {
        let registry = EventRegistry::new(
            EngineConfig {
                event: crate::config::EventConfig { round_duration_secs: 60, total_rounds: 5 },
                ..EngineConfig::default()
            },
            Arc::new(MemoryStore::new()),
        );
        let event = registry
            .create_event("five", people(&["a", "b", "c", "d", "e"]), CompatibilityMatrix::new())
            .await
            .unwrap();

        let mut pairs = BTreeSet::new();
        for _ in 0..5 {
            let outcome = event.advance_round().await.unwrap();
            for pairing in &outcome.round.pairings {
                assert!(pairs.insert(pairing.key()));
            }
            event.finish_round().await.unwrap();
        }
        let state = event.snapshot().unwrap();
        assert!(state.participants.values().all(|p| p.pit_stops.len() == 1));
        assert!(matches!(event.advance_round().await, Err(EngineError::RoundsExhausted { total: 5 })));

        event.end_event().await.unwrap();
        assert_eq!(event.snapshot().unwrap().status, RoundStatus::OpenNetworking);
    }

    #[tokio::test]
    async fn test_check_in_takes_effect_next_round() {
        let (_registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c", "d"]).await;
        event.advance_round().await.unwrap();

        let walk_in = Participant::new("w", "Walk In");
        assert!(event.check_in(&"w".into(), Some(walk_in)).await.unwrap());
        event.check_out(&"a".into()).await.unwrap();
        // the running round is untouched
        assert!(event.snapshot().unwrap().rounds[0].pairing_of(&"a".into()).is_some());

        event.finish_round().await.unwrap();
        let outcome = event.advance_round().await.unwrap();
        assert!(outcome.round.pairing_of(&"a".into()).is_none());
        let seated_or_out = outcome
            .round
            .pairing_of(&"w".into())
            .is_some()
            || outcome.round.pit_stop == Some(ParticipantId::from("w"));
        assert!(seated_or_out);
        assert!(matches!(
            event.check_out(&"nobody".into()).await,
            Err(EngineError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_scores_ingest_and_pending_backfill() {
        let (registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c"]).await;
        assert_eq!(event.pending_scoring().unwrap().len(), 3);

        let key = PairKey::new(&"a".into(), &"b".into());
        event.set_pair_scores(vec![(key.clone(), 88.0)]).await.unwrap();
        assert_eq!(event.pending_scoring().unwrap().len(), 2);
        assert_eq!(event.matrix().unwrap().get(&key), Some(88.0));
        assert!(event.set_pair_scores(vec![(key, f64::INFINITY)]).await.is_err());

        // a fresh registry sees the stored matrix
        let reloaded = EventRegistry::new(EngineConfig::default(), registry.store.clone());
        assert_eq!(reloaded.get("test").unwrap().pending_scoring().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_swap_and_signal_through_the_engine() {
        let (registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b", "c", "d"]).await;
        let outcome = event.advance_round().await.unwrap();
        let (first, second) = (&outcome.round.pairings[0], &outcome.round.pairings[1]);

        let swapped = event.swap_override(1, &first.a, &second.a).await.unwrap();
        assert_eq!(swapped.pairings.len(), 2);
        let state = event.snapshot().unwrap();
        assert!(!state.history.contains(&first.key()));
        assert!(state.history.contains(&PairKey::new(&first.a, &second.b)));

        let mut rx = registry.notifier().subscribe();
        assert!(!event.record_signal(1, &first.a, &second.b).await.unwrap());
        assert!(event.record_signal(1, &second.b, &first.a).await.unwrap());
        assert_eq!(rx.recv().await.unwrap().name(), "signal_update");
        assert!(matches!(
            event.record_signal(1, &first.a, &first.b).await,
            Err(EngineError::SignalRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_timer_sweep_finishes_expired_rounds() {
        let (registry, event) = event_with(Arc::new(MemoryStore::new()), &["a", "b"]).await;
        event.advance_round().await.unwrap();
        assert_eq!(registry.sweep_timers(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::seconds(481);
        assert_eq!(registry.sweep_timers(later).await, 1);
        assert_eq!(event.snapshot().unwrap().status, RoundStatus::BetweenRounds);
    }

    #[tokio::test]
    async fn test_registry_rejects_bad_and_duplicate_events() {
        let (registry, _event) = event_with(Arc::new(MemoryStore::new()), &["a", "b"]).await;
        assert!(registry
            .create_event("test", Vec::new(), CompatibilityMatrix::new())
            .await
            .is_err());
        assert!(registry
            .create_event("../x", Vec::new(), CompatibilityMatrix::new())
            .await
            .is_err());
        assert!(matches!(registry.get("missing"), Err(EngineError::UnknownEvent(_))));
        assert_eq!(registry.event_ids().unwrap(), vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_creates_of_one_id_admit_one() {
        let registry = EventRegistry::new(EngineConfig::default(), Arc::new(MemoryStore::new()));
        let (first, second) = tokio::join!(
            registry.create_event("gala", people(&["a", "b"]), CompatibilityMatrix::new()),
            registry.create_event("gala", people(&["c", "d", "e"]), CompatibilityMatrix::new()),
        );
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        let loser = if first.is_ok() { second.err() } else { first.err() };
        assert!(matches!(loser, Some(EngineError::InvalidRequest(_))));

        // The stored event and the registered one are the winner's.
        let winner = registry.get("gala").unwrap().snapshot().unwrap();
        let reloaded = EventRegistry::new(EngineConfig::default(), Arc::clone(&registry.store));
        assert_eq!(reloaded.get("gala").unwrap().snapshot().unwrap().participants, winner.participants);
    }

    #[tokio::test]
    async fn test_lookup_rejects_unsafe_event_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path().join("events")).unwrap());
        let registry = EventRegistry::new(EngineConfig::default(), store);
        assert!(matches!(registry.get("../events"), Err(EngineError::InvalidRequest(_))));
        assert!(matches!(registry.get(""), Err(EngineError::InvalidRequest(_))));
        assert!(matches!(registry.get("fine-id"), Err(EngineError::UnknownEvent(_))));
    }
}
