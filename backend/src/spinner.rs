use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wheel_core::{
    apply_action, draw_spin, Email, GameAction, GameError, GameEvent, GameState, Phase, Reveal,
    Wheel,
};

use crate::store::{SessionStore, StoreError};

pub const DEFAULT_REVEAL_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, thiserror::Error)]
pub enum SpinnerError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reveal task failed: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientView {
    pub phase: Phase,
    pub email: Option<Email>,
    pub rotation: f64,
    pub spinning: bool,
    pub selected_emojis: Vec<String>,
    pub total: usize,
    pub complete: bool,
    pub last_reveal: Option<Reveal>,
}

impl ClientView {
    fn of(state: &GameState) -> Self {
        Self {
            phase: state.phase.clone(),
            email: state.email().cloned(),
            rotation: state.rotation,
            spinning: state.spinning,
            selected_emojis: state.selected_emojis.clone(),
            total: state.wheel.len(),
            complete: state.is_complete(),
            last_reveal: state.last_reveal.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpinOutcome {
    pub rotation: f64,
    pub index: usize,
    pub emoji: String,
    pub newly_collected: bool,
    pub selected_emojis: Vec<String>,
    pub complete: bool,
}

enum SaveJob {
    Write { email: Email, selections: Vec<String> },
    Flush(oneshot::Sender<()>),
}

/// One client's game, bound to a session store.
pub struct Spinner {
    state: Mutex<GameState>,
    rng: Mutex<ChaCha8Rng>,
    store: Arc<dyn SessionStore>,
    saves: mpsc::UnboundedSender<SaveJob>,
    reveal_delay: Duration,
    opened_at: Instant,
    last_seen_ms: AtomicU64,
}

impl Spinner {
    pub fn new(
        store: Arc<dyn SessionStore>,
        wheel: Wheel,
        rng: ChaCha8Rng,
        reveal_delay: Duration,
    ) -> Self {
        let (saves, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_saves(Arc::clone(&store), jobs));
        Self {
            state: Mutex::new(GameState::new(wheel)),
            rng: Mutex::new(rng),
            store,
            saves,
            reveal_delay,
            opened_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last_seen)
    }

    pub async fn view(&self) -> ClientView {
        ClientView::of(&*self.state.lock().await)
    }

    /// Load-or-create. A store failure leaves the client at `NoSession`.
    pub async fn submit_email(&self, raw: &str) -> Result<ClientView, SpinnerError> {
        let email = {
            let mut state = self.state.lock().await;
            apply_action(
                &mut state,
                GameAction::SubmitEmail {
                    email: raw.to_string(),
                },
            )?;
            state.email().cloned().ok_or(GameError::WrongPhase)?
        };

        match self.store.find(&email).await {
            Ok(session) => {
                let mut state = self.state.lock().await;
                apply_action(&mut state, GameAction::LookupFound { session })?;
                info!(%email, collected = state.selected_emojis.len(), "session loaded");
                return Ok(ClientView::of(&state));
            }
            Err(StoreError::NotFound) => {
                let mut state = self.state.lock().await;
                apply_action(&mut state, GameAction::LookupMissing)?;
            }
            Err(err) => {
                warn!(%email, error = %err, "session lookup failed");
                let mut state = self.state.lock().await;
                apply_action(
                    &mut state,
                    GameAction::LookupFailed {
                        reason: err.to_string(),
                    },
                )?;
                return Err(err.into());
            }
        }

        match self.store.create(&email).await {
            Ok(session) => {
                let mut state = self.state.lock().await;
                apply_action(&mut state, GameAction::CreateSucceeded { session })?;
                info!(%email, "session created");
                Ok(ClientView::of(&state))
            }
            Err(err) => {
                warn!(%email, error = %err, "session create failed");
                let mut state = self.state.lock().await;
                apply_action(
                    &mut state,
                    GameAction::CreateFailed {
                        reason: err.to_string(),
                    },
                )?;
                let err = match err {
                    StoreError::NotFound => {
                        StoreError::BackendUnavailable("insert returned no record".to_string())
                    }
                    other => other,
                };
                Err(err.into())
            }
        }
    }

    /// The reveal runs on its own task so it lands even if the caller stops waiting.
    pub async fn spin(self: &Arc<Self>) -> Result<SpinOutcome, SpinnerError> {
        {
            let mut state = self.state.lock().await;
            let draw = draw_spin(&mut *self.rng.lock().await);
            apply_action(&mut state, GameAction::Spin { draw })?;
            debug!(rotation = state.rotation, "spin started");
        }

        let spinner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(spinner.reveal_delay).await;
            spinner.reveal().await
        })
        .await
        .map_err(|err| SpinnerError::Interrupted(err.to_string()))?
    }

    async fn reveal(&self) -> Result<SpinOutcome, SpinnerError> {
        let (events, outcome) = {
            let mut state = self.state.lock().await;
            let events = apply_action(&mut state, GameAction::Reveal)?;
            let reveal = state.last_reveal.clone().ok_or(GameError::NoSpinPending)?;
            let outcome = SpinOutcome {
                rotation: state.rotation,
                index: reveal.index,
                emoji: reveal.emoji,
                newly_collected: reveal.newly_collected,
                selected_emojis: state.selected_emojis.clone(),
                complete: state.is_complete(),
            };
            (events, outcome)
        };
        debug!(emoji = %outcome.emoji, new = outcome.newly_collected, "spin revealed");
        if events.contains(&GameEvent::Completed) {
            info!(collected = outcome.selected_emojis.len(), "collection complete");
        }
        self.queue_saves(events);
        Ok(outcome)
    }

    pub async fn reset(&self) -> Result<ClientView, SpinnerError> {
        let mut state = self.state.lock().await;
        let events = apply_action(&mut state, GameAction::Reset)?;
        self.queue_saves(events);
        Ok(ClientView::of(&state))
    }

    pub async fn change_user(&self) -> Result<ClientView, SpinnerError> {
        let mut state = self.state.lock().await;
        apply_action(&mut state, GameAction::ChangeUser)?;
        Ok(ClientView::of(&state))
    }

    /// Waits until every save queued so far has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.saves.send(SaveJob::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn queue_saves(&self, events: Vec<GameEvent>) {
        for event in events {
            if let GameEvent::SelectionsChanged { email, selections } = event {
                if self.saves.send(SaveJob::Write { email, selections }).is_err() {
                    warn!("save queue closed; dropping session update");
                }
            }
        }
    }
}

async fn run_saves(store: Arc<dyn SessionStore>, mut jobs: mpsc::UnboundedReceiver<SaveJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            SaveJob::Write { email, selections } => {
                match store.update(&email, &selections).await {
                    Ok(_) => debug!(%email, count = selections.len(), "session saved"),
                    // Local state stays authoritative; the next change overwrites.
                    Err(err) => warn!(%email, error = %err, "session save failed"),
                }
            }
            SaveJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wheel_core::Session;

    /// Wraps a `MemoryStore`, counting writes and failing on demand.
    #[derive(Default)]
    struct ProbeStore {
        inner: MemoryStore,
        updates: AtomicUsize,
        fail_find: AtomicBool,
        fail_create: AtomicBool,
        fail_update: AtomicBool,
    }

    fn down() -> StoreError {
        StoreError::BackendUnavailable("connection refused".into())
    }

    #[async_trait]
    impl SessionStore for ProbeStore {
        async fn find(&self, email: &Email) -> Result<Session, StoreError> {
            if self.fail_find.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.find(email).await
        }

        async fn create(&self, email: &Email) -> Result<Session, StoreError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.create(email).await
        }

        async fn update(&self, email: &Email, selections: &[String]) -> Result<Session, StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(down());
            }
            self.inner.update(email, selections).await
        }
    }

    fn spinner_with(store: Arc<ProbeStore>, wheel: Wheel, delay: Duration) -> Arc<Spinner> {
        Arc::new(Spinner::new(
            store,
            wheel,
            ChaCha8Rng::seed_from_u64(3),
            delay,
        ))
    }

    fn single() -> Wheel {
        Wheel::from_emojis(["🎯"]).unwrap()
    }

    fn email(raw: &str) -> Email {
        Email::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn new_email_creates_session_and_existing_email_loads_it() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);

        let view = spinner.submit_email("  A@B.com ").await.unwrap();
        assert_eq!(view.email, Some(email("a@b.com")));
        assert!(view.selected_emojis.is_empty());
        assert!(store.inner.find(&email("a@b.com")).await.is_ok());

        spinner.spin().await.unwrap();
        spinner.flush().await;

        let other = spinner_with(store.clone(), single(), Duration::ZERO);
        let view = other.submit_email("a@b.com").await.unwrap();
        assert_eq!(view.selected_emojis, vec!["🎯".to_string()]);
        assert!(view.complete);
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_email_is_rejected_without_touching_the_store() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);
        let err = spinner.submit_email("not-an-email").await.unwrap_err();
        assert!(matches!(err, SpinnerError::Game(GameError::InvalidEmail)));
        assert_eq!(spinner.view().await.phase, Phase::NoSession);
        assert!(store.inner.is_empty().await);
    }

    #[tokio::test]
    async fn lookup_or_create_failure_returns_to_no_session() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);

        store.fail_find.store(true, Ordering::SeqCst);
        let err = spinner.submit_email("a@b.com").await.unwrap_err();
        assert!(matches!(err, SpinnerError::Store(StoreError::BackendUnavailable(_))));
        assert_eq!(spinner.view().await.phase, Phase::NoSession);

        store.fail_find.store(false, Ordering::SeqCst);
        store.fail_create.store(true, Ordering::SeqCst);
        let err = spinner.submit_email("a@b.com").await.unwrap_err();
        assert!(matches!(err, SpinnerError::Store(StoreError::BackendUnavailable(_))));
        assert_eq!(spinner.view().await.phase, Phase::NoSession);

        store.fail_create.store(false, Ordering::SeqCst);
        let view = spinner.submit_email("a@b.com").await.unwrap();
        assert!(matches!(view.phase, Phase::Loaded { .. }));
    }

    #[tokio::test]
    async fn repeated_emoji_is_shown_but_not_saved_again() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);
        spinner.submit_email("a@b.com").await.unwrap();

        let first = spinner.spin().await.unwrap();
        assert!(first.newly_collected);
        let second = spinner.spin().await.unwrap();
        assert!(!second.newly_collected);
        assert_eq!(second.emoji, "🎯");
        assert!(second.rotation > first.rotation);
        spinner.flush().await;

        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        assert_eq!(second.selected_emojis, vec!["🎯".to_string()]);
    }

    #[tokio::test]
    async fn overlapping_spin_is_dropped() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::from_millis(200));
        spinner.submit_email("a@b.com").await.unwrap();

        let running = {
            let spinner = Arc::clone(&spinner);
            tokio::spawn(async move { spinner.spin().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(spinner.view().await.spinning);

        let err = spinner.spin().await.unwrap_err();
        assert!(matches!(err, SpinnerError::Game(GameError::SpinInProgress)));
        let err = spinner.reset().await.unwrap_err();
        assert!(matches!(err, SpinnerError::Game(GameError::SpinInProgress)));

        let outcome = running.await.unwrap().unwrap();
        assert!(outcome.newly_collected);
        assert!(!spinner.view().await.spinning);
    }

    #[tokio::test]
    async fn reveal_lands_even_if_caller_gives_up() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::from_millis(100));
        spinner.submit_email("a@b.com").await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), spinner.spin()).await;
        assert!(abandoned.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;

        let view = spinner.view().await;
        assert!(!view.spinning);
        assert_eq!(view.selected_emojis, vec!["🎯".to_string()]);
    }

    #[tokio::test]
    async fn failed_save_keeps_local_progress() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);
        spinner.submit_email("a@b.com").await.unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        let outcome = spinner.spin().await.unwrap();
        spinner.flush().await;

        assert!(outcome.complete);
        assert_eq!(spinner.view().await.selected_emojis, vec!["🎯".to_string()]);
        let stored = store.inner.find(&email("a@b.com")).await.unwrap();
        assert!(stored.selected_emojis.is_empty());
    }

    #[tokio::test]
    async fn reset_persists_empty_collection() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);
        spinner.submit_email("a@b.com").await.unwrap();
        spinner.spin().await.unwrap();

        let view = spinner.reset().await.unwrap();
        assert!(view.selected_emojis.is_empty());
        assert_eq!(view.rotation, 0.0);
        spinner.flush().await;

        let stored = store.inner.find(&email("a@b.com")).await.unwrap();
        assert!(stored.selected_emojis.is_empty());
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn collecting_the_whole_wheel_completes() {
        let store = Arc::new(ProbeStore::default());
        let wheel = Wheel::from_emojis(["🍎", "🍌", "🍒", "🥝"]).unwrap();
        let spinner = spinner_with(store.clone(), wheel, Duration::ZERO);
        spinner.submit_email("a@b.com").await.unwrap();

        let mut spins = 0;
        while !spinner.view().await.complete {
            spinner.spin().await.unwrap();
            spins += 1;
            assert!(spins < 500, "wheel never completed");
        }
        spinner.flush().await;

        let stored = store.inner.find(&email("a@b.com")).await.unwrap();
        assert_eq!(stored.selected_emojis.len(), 4);
        assert_eq!(store.updates.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn change_user_clears_local_state_only() {
        let store = Arc::new(ProbeStore::default());
        let spinner = spinner_with(store.clone(), single(), Duration::ZERO);
        spinner.submit_email("a@b.com").await.unwrap();
        spinner.spin().await.unwrap();
        spinner.flush().await;

        let view = spinner.change_user().await.unwrap();
        assert_eq!(view.phase, Phase::NoSession);
        assert!(view.selected_emojis.is_empty());

        let stored = store.inner.find(&email("a@b.com")).await.unwrap();
        assert_eq!(stored.selected_emojis, vec!["🎯".to_string()]);

        let view = spinner.submit_email("c@d.com").await.unwrap();
        assert_eq!(view.email, Some(email("c@d.com")));
        assert!(view.selected_emojis.is_empty());
    }
}
