use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const FULL_TURN: f64 = 360.0;
pub const MIN_SPINS: f64 = 5.0;
pub const MAX_SPINS: f64 = 10.0;

pub const DEFAULT_EMOJIS: [&str; 12] = [
    "😀", "😂", "😍", "😎", "🤔", "😴", "🥳", "😡", "😱", "🤖", "👻", "🦄",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub emoji: String,
    /// Display hint only; never affects outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Segment {
    pub fn new(emoji: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            color: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelError {
    #[error("wheel needs at least one segment")]
    Empty,
    #[error("segment label must not be blank")]
    BlankLabel,
    #[error("emoji {0} appears on more than one segment")]
    DuplicateEmoji(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Wheel {
    segments: Vec<Segment>,
}

impl Wheel {
    pub fn new(segments: Vec<Segment>) -> Result<Self, WheelError> {
        if segments.is_empty() {
            return Err(WheelError::Empty);
        }
        let mut seen = HashSet::new();
        for segment in &segments {
            if segment.emoji.trim().is_empty() {
                return Err(WheelError::BlankLabel);
            }
            if !seen.insert(segment.emoji.as_str()) {
                return Err(WheelError::DuplicateEmoji(segment.emoji.clone()));
            }
        }
        Ok(Self { segments })
    }

    pub fn from_emojis<I, S>(emojis: I) -> Result<Self, WheelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(emojis.into_iter().map(Segment::new).collect())
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn emoji_at(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(|s| s.emoji.as_str())
    }

    /// True once every segment's emoji appears in `selected`.
    pub fn is_complete(&self, selected: &[String]) -> bool {
        selected.len() == self.segments.len()
            && self
                .segments
                .iter()
                .all(|s| selected.iter().any(|e| e == &s.emoji))
    }
}

impl Default for Wheel {
    fn default() -> Self {
        Self {
            segments: DEFAULT_EMOJIS.iter().copied().map(Segment::new).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpinDraw {
    pub spins: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpinResult {
    pub rotation: f64,
    pub spins: f64,
    pub offset: f64,
    pub index: usize,
}

pub fn draw_spin<R: Rng + ?Sized>(rng: &mut R) -> SpinDraw {
    SpinDraw {
        spins: rng.gen_range(MIN_SPINS..MAX_SPINS),
        offset: rng.gen_range(0.0..FULL_TURN),
    }
}

/// Segment under the fixed top pointer. Offsets turn clockwise, so they are walked back.
pub fn resolve_segment(offset: f64, segment_count: usize) -> usize {
    if segment_count == 0 {
        return 0;
    }
    let segment_angle = FULL_TURN / segment_count as f64;
    let normalized = (FULL_TURN - offset.rem_euclid(FULL_TURN)).rem_euclid(FULL_TURN);
    let index = (normalized / segment_angle).floor();
    if !index.is_finite() || index < 0.0 {
        return 0;
    }
    // Rounding can push a value a hair under 360 onto `segment_count`.
    (index as usize).min(segment_count - 1)
}

pub fn resolve_spin(rotation: f64, draw: SpinDraw, segment_count: usize) -> SpinResult {
    SpinResult {
        rotation: rotation + draw.spins * FULL_TURN + draw.offset,
        spins: draw.spins,
        offset: draw.offset,
        index: resolve_segment(draw.offset, segment_count),
    }
}

pub fn spin<R: Rng + ?Sized>(rng: &mut R, rotation: f64, segment_count: usize) -> SpinResult {
    resolve_spin(rotation, draw_spin(rng), segment_count)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, GameError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() || !normalized.contains('@') {
            return Err(GameError::InvalidEmail);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Email {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub email: Email,
    #[serde(default)]
    pub selected_emojis: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(email: Email, now: DateTime<Utc>) -> Self {
        Self {
            email,
            selected_emojis: Vec::new(),
            updated_at: now,
        }
    }

    pub fn replace(&mut self, selections: &[String], now: DateTime<Utc>) {
        self.selected_emojis = dedup_in_order(selections);
        self.updated_at = now;
    }
}

pub fn dedup_in_order(selections: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    selections
        .iter()
        .filter(|e| seen.insert(e.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Phase {
    NoSession,
    Checking { email: Email },
    Creating { email: Email },
    Loaded { email: Email },
}

impl Phase {
    pub fn email(&self) -> Option<&Email> {
        match self {
            Phase::NoSession => None,
            Phase::Checking { email } | Phase::Creating { email } | Phase::Loaded { email } => {
                Some(email)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reveal {
    pub index: usize,
    pub emoji: String,
    pub newly_collected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameAction {
    SubmitEmail { email: String },
    LookupFound { session: Session },
    LookupMissing,
    LookupFailed { reason: String },
    CreateSucceeded { session: Session },
    CreateFailed { reason: String },
    Spin { draw: SpinDraw },
    Reveal,
    Reset,
    ChangeUser,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum GameEvent {
    LookupStarted { email: Email },
    SessionLoaded { email: Email, collected: usize },
    CreateStarted { email: Email },
    SessionCreated { email: Email },
    AcquisitionFailed { reason: String },
    SpinStarted { rotation: f64 },
    EmojiRevealed { index: usize, emoji: String, newly_collected: bool },
    /// The collection for `email` must be written back to the store.
    SelectionsChanged { email: Email, selections: Vec<String> },
    Completed,
    GameReset,
    SignedOut,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("email must be non-empty and contain '@'")]
    InvalidEmail,
    #[error("action not allowed in the current phase")]
    WrongPhase,
    #[error("a spin is already in progress")]
    SpinInProgress,
    #[error("no spin is waiting to be revealed")]
    NoSpinPending,
    #[error("session belongs to a different email")]
    SessionMismatch,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GameState {
    pub phase: Phase,
    pub wheel: Wheel,
    pub rotation: f64,
    pub selected_emojis: Vec<String>,
    pub spinning: bool,
    pub pending: Option<SpinResult>,
    pub last_reveal: Option<Reveal>,
}

impl GameState {
    pub fn new(wheel: Wheel) -> Self {
        Self {
            phase: Phase::NoSession,
            wheel,
            rotation: 0.0,
            selected_emojis: Vec::new(),
            spinning: false,
            pending: None,
            last_reveal: None,
        }
    }

    pub fn email(&self) -> Option<&Email> {
        self.phase.email()
    }

    pub fn is_complete(&self) -> bool {
        self.wheel.is_complete(&self.selected_emojis)
    }

    fn clear_local(&mut self) {
        self.rotation = 0.0;
        self.selected_emojis.clear();
        self.spinning = false;
        self.pending = None;
        self.last_reveal = None;
    }
}

pub fn apply_action(state: &mut GameState, action: GameAction) -> Result<Vec<GameEvent>, GameError> {
    let mut events = Vec::new();
    match action {
        GameAction::SubmitEmail { email } => submit_email(state, &email, &mut events)?,
        GameAction::LookupFound { session } => {
            let email = checking_email(state)?;
            if session.email != email {
                return Err(GameError::SessionMismatch);
            }
            let collected = dedup_in_order(&session.selected_emojis);
            events.push(GameEvent::SessionLoaded {
                email: email.clone(),
                collected: collected.len(),
            });
            state.clear_local();
            state.selected_emojis = collected;
            state.phase = Phase::Loaded { email };
        }
        GameAction::LookupMissing => {
            let email = checking_email(state)?;
            events.push(GameEvent::CreateStarted {
                email: email.clone(),
            });
            state.phase = Phase::Creating { email };
        }
        GameAction::LookupFailed { reason } => {
            checking_email(state)?;
            fail_acquisition(state, reason, &mut events);
        }
        GameAction::CreateSucceeded { session } => {
            let email = creating_email(state)?;
            if session.email != email {
                return Err(GameError::SessionMismatch);
            }
            state.clear_local();
            state.phase = Phase::Loaded {
                email: email.clone(),
            };
            events.push(GameEvent::SessionCreated { email });
        }
        GameAction::CreateFailed { reason } => {
            creating_email(state)?;
            fail_acquisition(state, reason, &mut events);
        }
        GameAction::Spin { draw } => start_spin(state, draw, &mut events)?,
        GameAction::Reveal => reveal(state, &mut events)?,
        GameAction::Reset => reset(state, &mut events)?,
        GameAction::ChangeUser => {
            if state.spinning {
                return Err(GameError::SpinInProgress);
            }
            if matches!(state.phase, Phase::Checking { .. } | Phase::Creating { .. }) {
                return Err(GameError::WrongPhase);
            }
            state.clear_local();
            state.phase = Phase::NoSession;
            events.push(GameEvent::SignedOut);
        }
    }
    Ok(events)
}

fn submit_email(state: &mut GameState, raw: &str, events: &mut Vec<GameEvent>) -> Result<(), GameError> {
    if !matches!(state.phase, Phase::NoSession) {
        return Err(GameError::WrongPhase);
    }
    let email = Email::parse(raw)?;
    events.push(GameEvent::LookupStarted {
        email: email.clone(),
    });
    state.phase = Phase::Checking { email };
    Ok(())
}

fn checking_email(state: &GameState) -> Result<Email, GameError> {
    match &state.phase {
        Phase::Checking { email } => Ok(email.clone()),
        _ => Err(GameError::WrongPhase),
    }
}

fn creating_email(state: &GameState) -> Result<Email, GameError> {
    match &state.phase {
        Phase::Creating { email } => Ok(email.clone()),
        _ => Err(GameError::WrongPhase),
    }
}

fn loaded_email(state: &GameState) -> Result<Email, GameError> {
    match &state.phase {
        Phase::Loaded { email } => Ok(email.clone()),
        _ => Err(GameError::WrongPhase),
    }
}

fn fail_acquisition(state: &mut GameState, reason: String, events: &mut Vec<GameEvent>) {
    state.clear_local();
    state.phase = Phase::NoSession;
    events.push(GameEvent::AcquisitionFailed { reason });
}

fn start_spin(state: &mut GameState, draw: SpinDraw, events: &mut Vec<GameEvent>) -> Result<(), GameError> {
    if state.spinning {
        return Err(GameError::SpinInProgress);
    }
    loaded_email(state)?;

    let result = resolve_spin(state.rotation, draw, state.wheel.len());
    state.rotation = result.rotation;
    state.spinning = true;
    state.pending = Some(result);
    state.last_reveal = None;
    events.push(GameEvent::SpinStarted {
        rotation: result.rotation,
    });
    Ok(())
}

fn reveal(state: &mut GameState, events: &mut Vec<GameEvent>) -> Result<(), GameError> {
    let email = loaded_email(state)?;
    let Some(result) = state.pending else {
        return Err(GameError::NoSpinPending);
    };
    let emoji = state
        .wheel
        .emoji_at(result.index)
        .map(str::to_owned)
        .ok_or(GameError::NoSpinPending)?;

    state.pending = None;
    state.spinning = false;

    let newly_collected = !state.selected_emojis.contains(&emoji);
    events.push(GameEvent::EmojiRevealed {
        index: result.index,
        emoji: emoji.clone(),
        newly_collected,
    });
    if newly_collected {
        state.selected_emojis.push(emoji.clone());
        events.push(GameEvent::SelectionsChanged {
            email,
            selections: state.selected_emojis.clone(),
        });
        if state.is_complete() {
            events.push(GameEvent::Completed);
        }
    }
    state.last_reveal = Some(Reveal {
        index: result.index,
        emoji,
        newly_collected,
    });
    Ok(())
}

fn reset(state: &mut GameState, events: &mut Vec<GameEvent>) -> Result<(), GameError> {
    if state.spinning {
        return Err(GameError::SpinInProgress);
    }
    let email = loaded_email(state)?;
    state.clear_local();
    events.push(GameEvent::SelectionsChanged {
        email,
        selections: Vec::new(),
    });
    events.push(GameEvent::GameReset);
    Ok(())
}
