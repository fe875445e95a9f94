//! Conversation session state
//!
//! A [`Session`] owns the bounded history, the turn generation used to spot
//! stale pipelines, and the activity flags and timers the orchestrator
//! watches. Everything here is shared between the orchestrator loop and the
//! spawned turn pipeline, so mutations go through these methods.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    #[serde(rename = "content")]
    pub text: String,
}

impl Turn {
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    history: Vec<Turn>,
    last_interaction: Option<Instant>,
}

/// The single live conversational context
#[derive(Debug)]
pub struct Session {
    state: Mutex<SessionState>,
    system: Turn,
    max_turns: usize,
    generation: AtomicU64,
    active: AtomicBool,
}

impl Session {
    /// Create a session holding only the system turn
    #[must_use]
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        let system = Turn::system(system_prompt);
        Self {
            state: Mutex::new(SessionState {
                history: vec![system.clone()],
                last_interaction: None,
            }),
            system,
            max_turns: max_turns.max(1),
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the history, system turn first
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        self.lock().history.clone()
    }

    /// Number of turns held, system turn included
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    /// Whether only the system turn is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Most turns the history may hold
    #[must_use]
    pub const fn capacity(&self) -> usize {
        1 + 2 * self.max_turns
    }

    /// Append a turn, evicting the oldest pairs past the cap
    pub fn push(&self, turn: Turn) {
        let mut state = self.lock();
        Self::append(&mut state, turn, self.capacity());
    }

    /// Append a turn only if `generation` is still current
    ///
    /// The check and the append happen under one lock, so a pipeline
    /// superseded mid-append cannot slip a turn in.
    pub fn push_if_current(&self, generation: u64, turn: Turn) -> bool {
        let mut state = self.lock();
        if !self.is_current(generation) {
            return false;
        }
        Self::append(&mut state, turn, self.capacity());
        true
    }

    fn append(state: &mut SessionState, turn: Turn, capacity: usize) {
        state.history.push(turn);

        // Evict the oldest user/assistant pair; index 0 is the system turn.
        // A user turn left without a reply goes on its own.
        while state.history.len() > capacity {
            let paired = matches!(
                state.history.get(1..3),
                Some([first, second]) if first.role == Role::User && second.role == Role::Assistant
            );
            let end = if paired { 3 } else { 2 };
            state.history.drain(1..end);
        }
    }

    /// Clear history back to the system turn
    ///
    /// Calling this twice in a row leaves the same state.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.history.push(self.system.clone());
        state.last_interaction = None;
    }

    /// Record that a turn just completed
    pub fn touch(&self) {
        self.lock().last_interaction = Some(Instant::now());
    }

    /// When the last turn completed
    #[must_use]
    pub fn last_interaction(&self) -> Option<Instant> {
        self.lock().last_interaction
    }

    /// Whether there is history worth a "welcome back"
    #[must_use]
    pub fn has_recent_history(&self, window: Duration) -> bool {
        let state = self.lock();
        state.history.len() > 1
            && state
                .last_interaction
                .is_some_and(|at| at.elapsed() < window)
    }

    /// Start a new recording attempt, superseding any pipeline in flight
    ///
    /// Taken under the history lock: once this returns, no older pipeline
    /// can append.
    pub fn begin_attempt(&self) -> u64 {
        let _state = self.lock();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Generation of the latest attempt
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether `generation` is still the latest attempt
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Activity flags the idle timer respects
#[derive(Debug, Default)]
pub struct Operations {
    speaking: AtomicBool,
    active_asking: AtomicBool,
    processing: AtomicBool,
}

impl Operations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_speaking(&self, on: bool) {
        self.speaking.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn set_active_asking(&self, on: bool) {
        self.active_asking.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active_asking(&self) -> bool {
        self.active_asking.load(Ordering::SeqCst)
    }

    pub fn set_processing(&self, on: bool) {
        self.processing.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Whether any operation is in progress
    #[must_use]
    pub fn any(&self) -> bool {
        self.is_speaking() || self.is_active_asking() || self.is_processing()
    }

    pub fn clear(&self) {
        self.set_speaking(false);
        self.set_active_asking(false);
        self.set_processing(false);
    }
}

/// A single-shot deadline polled by the recording monitor
///
/// Arming always replaces the previous deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    window: Duration,
    at: Option<Instant>,
}

impl Deadline {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, at: None }
    }

    /// Arm for the full window from now
    pub fn arm(&mut self) {
        self.at = Some(Instant::now() + self.window);
    }

    pub const fn disarm(&mut self) {
        self.at = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// Whether the deadline is armed and has passed
    #[must_use]
    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, if armed
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Clears session history after a stretch of inactivity
///
/// Backed by a spawned sleep that is aborted whenever the timer is rearmed or
/// disarmed, so at most one expiry is ever pending.
#[derive(Debug)]
pub struct HistoryExpiry {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryExpiry {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    /// Full expiry window
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Arm for the full window
    pub fn arm(&self, session: &Arc<Session>) {
        self.arm_after(session, self.window);
    }

    /// Arm for whatever is left of the window since the last interaction
    pub fn arm_remaining(&self, session: &Arc<Session>) {
        let left = session
            .last_interaction()
            .map_or(self.window, |at| self.window.saturating_sub(at.elapsed()));
        self.arm_after(session, left);
    }

    fn arm_after(&self, session: &Arc<Session>, delay: Duration) {
        let session = Arc::clone(session);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !session.is_empty() {
                tracing::info!("conversation history expired");
            }
            session.reset();
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn disarm(&self) {
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether an expiry is scheduled and has not fired
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HistoryExpiry {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(session: &Session, n: usize) {
        session.push(Turn::user(format!("question {n}")));
        session.push(Turn::assistant(format!("answer {n}")));
    }

    #[test]
    fn history_stays_bounded_in_pairs() {
        let session = Session::new("system", 3);
        for n in 0..10 {
            pair(&session, n);
        }

        let history = session.history();
        assert_eq!(history.len(), 7);
        assert_eq!(history[0], Turn::system("system"));
        assert_eq!(history[1], Turn::user("question 7"));
        assert_eq!(history[6], Turn::assistant("answer 9"));
    }

    #[test]
    fn trailing_user_turn_never_exceeds_cap() {
        let session = Session::new("system", 1);
        pair(&session, 0);
        session.push(Turn::user("follow up"));

        let history = session.history();
        assert!(history.len() <= session.capacity());
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history.last(), Some(&Turn::user("follow up")));
    }

    #[test]
    fn reset_is_idempotent() {
        let session = Session::new("system", 3);
        pair(&session, 0);
        session.touch();

        session.reset();
        let once = session.history();
        session.reset();
        assert_eq!(session.history(), once);
        assert_eq!(once, vec![Turn::system("system")]);
        assert!(session.last_interaction().is_none());
    }

    #[test]
    fn stale_generation_cannot_append() {
        let session = Session::new("system", 3);
        let first = session.begin_attempt();
        let second = session.begin_attempt();

        assert!(!session.push_if_current(first, Turn::user("late")));
        assert!(session.push_if_current(second, Turn::user("fresh")));
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn operations_any() {
        let ops = Operations::new();
        assert!(!ops.any());
        ops.set_processing(true);
        assert!(ops.any());
        ops.clear();
        assert!(!ops.any());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_window() {
        let mut deadline = Deadline::new(Duration::from_secs(8));
        assert!(!deadline.expired());

        deadline.arm();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!deadline.expired());

        // Re-arming restarts the full window
        deadline.arm();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!deadline.expired());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(deadline.expired());

        deadline.disarm();
        assert!(!deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn welcome_back_needs_recent_history() {
        let session = Session::new("system", 3);
        let window = Duration::from_secs(300);
        assert!(!session.has_recent_history(window));

        pair(&session, 0);
        session.touch();
        assert!(session.has_recent_history(window));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!session.has_recent_history(window));
    }
}
