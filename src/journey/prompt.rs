//! Suspend/resume bridge between in-flight collector actions and the human.
//!
//! An action calls [`PromptCoordinator::raise`] and awaits the returned
//! [`PendingAnswer`]. The UI observes the active prompt through
//! [`PromptCoordinator::subscribe`] and answers with `resolve` or `cancel`.
//! Exactly one resolution reaches the awaiting action; later attempts are
//! no-ops. Only one prompt is active per flow at any time.

use super::error::{FlowError, Result};
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnswerShape {
    /// Free-text secret (PIN, passphrase).
    Secret,
    /// Index into the supplied candidates (e.g. available device keys).
    OneOf(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub expected: AnswerShape,
}

impl Prompt {
    #[must_use]
    pub fn secret(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: String::new(),
            description: String::new(),
            expected: AnswerShape::Secret,
        }
    }

    #[must_use]
    pub fn one_of(title: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            expected: AnswerShape::OneOf(candidates),
            ..Self::secret(title)
        }
    }

    #[must_use]
    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug)]
pub enum PromptAnswer {
    Secret(SecretString),
    Selection(usize),
}

impl PromptAnswer {
    #[must_use]
    pub fn secret(value: impl Into<String>) -> Self {
        Self::Secret(SecretString::from(value.into()))
    }

    fn fits(&self, expected: &AnswerShape) -> bool {
        match (self, expected) {
            (Self::Secret(secret), AnswerShape::Secret) => !secret.expose_secret().is_empty(),
            (Self::Selection(index), AnswerShape::OneOf(candidates)) => *index < candidates.len(),
            _ => false,
        }
    }
}

/// What the UI sees: the prompt plus an id to tell consecutive prompts apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivePrompt {
    pub id: u64,
    pub prompt: Prompt,
}

struct Slot {
    id: u64,
    prompt: Prompt,
    tx: oneshot::Sender<Result<PromptAnswer>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    active: Option<Slot>,
    closed: Option<String>,
}

#[derive(Clone)]
pub struct PromptCoordinator {
    state: Arc<Mutex<State>>,
    published: Arc<watch::Sender<Option<ActivePrompt>>>,
}

impl Default for PromptCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PromptCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptCoordinator")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl PromptCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (published, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            published: Arc::new(published),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `prompt` and returns the handle the caller awaits.
    ///
    /// # Errors
    /// `InvalidState` if another prompt is still active, `Cancelled` if the
    /// flow was cancelled.
    pub fn raise(&self, prompt: Prompt) -> Result<PendingAnswer> {
        let mut state = self.lock();

        if let Some(reason) = &state.closed {
            return Err(FlowError::Cancelled(reason.clone()));
        }
        if let Some(active) = &state.active {
            return Err(FlowError::invalid_state(format!(
                "prompt '{}' is still waiting for an answer",
                active.prompt.title
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = oneshot::channel();
        state.active = Some(Slot {
            id,
            prompt: prompt.clone(),
            tx,
        });
        debug!(prompt_id = id, title = %prompt.title, "prompt raised");
        self.published
            .send_replace(Some(ActivePrompt { id, prompt }));

        Ok(PendingAnswer {
            id,
            rx,
            coordinator: self.clone(),
        })
    }

    /// Delivers `answer` to the outstanding prompt.
    ///
    /// Returns `Ok(false)` when nothing is outstanding (already answered,
    /// cancelled or never raised).
    ///
    /// # Errors
    /// `InvalidState` if the answer does not fit the prompt's expected shape;
    /// the prompt stays active.
    pub fn resolve(&self, answer: PromptAnswer) -> Result<bool> {
        let mut state = self.lock();
        let Some(slot) = state.active.take() else {
            debug!("resolve ignored, no active prompt");
            return Ok(false);
        };

        if !answer.fits(&slot.prompt.expected) {
            let title = slot.prompt.title.clone();
            state.active = Some(slot);
            return Err(FlowError::invalid_state(format!(
                "answer does not match what prompt '{title}' expects"
            )));
        }

        self.published.send_replace(None);
        drop(state);

        debug!(prompt_id = slot.id, "prompt resolved");
        Ok(slot.tx.send(Ok(answer)).is_ok())
    }

    /// Completes the outstanding prompt with `Cancelled`. Returns false when
    /// nothing was outstanding.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.active.take() else {
            return false;
        };
        self.published.send_replace(None);
        drop(state);

        let reason = reason.into();
        debug!(prompt_id = slot.id, %reason, "prompt cancelled");
        slot.tx.send(Err(FlowError::Cancelled(reason))).is_ok()
    }

    /// Cancels the outstanding prompt and rejects every later `raise` until
    /// [`reopen`](Self::reopen) is called.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.lock().closed = Some(reason.clone());
        if self.cancel(reason) {
            warn!("flow cancelled while a prompt was waiting for an answer");
        }
    }

    pub fn reopen(&self) {
        self.lock().closed = None;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    #[must_use]
    pub fn active(&self) -> Option<ActivePrompt> {
        self.published.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ActivePrompt>> {
        self.published.subscribe()
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|slot| slot.id == id) {
            state.active = None;
            self.published.send_replace(None);
            debug!(prompt_id = id, "prompt abandoned by its caller");
        }
    }
}

/// One-shot handle on a raised prompt. Dropping it withdraws the prompt.
#[must_use = "a raised prompt stays published until its answer is awaited or dropped"]
pub struct PendingAnswer {
    id: u64,
    rx: oneshot::Receiver<Result<PromptAnswer>>,
    coordinator: PromptCoordinator,
}

impl PendingAnswer {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits at most `duration` for the answer; on expiry the prompt is
    /// withdrawn and `Cancelled` is returned.
    ///
    /// # Errors
    /// `Cancelled` on timeout or cancellation.
    pub async fn with_timeout(self, duration: Duration) -> Result<PromptAnswer> {
        let id = self.id;
        match tokio::time::timeout(duration, self).await {
            Ok(answer) => answer,
            Err(_) => {
                warn!(prompt_id = id, "prompt timed out after {:?}", duration);
                Err(FlowError::Cancelled(format!(
                    "no answer within {duration:?}"
                )))
            }
        }
    }
}

impl Future for PendingAnswer {
    type Output = Result<PromptAnswer>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(answer)) => Poll::Ready(answer),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FlowError::Cancelled(
                "prompt was withdrawn".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingAnswer {
    fn drop(&mut self) {
        self.coordinator.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_answer_once() {
        let prompts = PromptCoordinator::new();
        let pending = prompts.raise(Prompt::secret("Enter PIN")).unwrap();
        assert!(prompts.active().is_some());

        assert!(prompts.resolve(PromptAnswer::secret("1234")).unwrap());
        // second resolution is a no-op
        assert!(!prompts.resolve(PromptAnswer::secret("9999")).unwrap());

        match pending.await.unwrap() {
            PromptAnswer::Secret(pin) => assert_eq!(pin.expose_secret(), "1234"),
            PromptAnswer::Selection(_) => panic!("expected a secret"),
        }
        assert!(prompts.active().is_none());
    }

    #[tokio::test]
    async fn second_raise_fails_fast() {
        let prompts = PromptCoordinator::new();
        let _first = prompts.raise(Prompt::secret("first")).unwrap();
        let err = prompts.raise(Prompt::secret("second")).err().unwrap();
        assert!(err.is_invalid_state());
        assert_eq!(prompts.active().unwrap().prompt.title, "first");
    }

    #[tokio::test]
    async fn cancel_completes_with_cancelled() {
        let prompts = PromptCoordinator::new();
        let pending = prompts.raise(Prompt::secret("Enter PIN")).unwrap();
        assert!(prompts.cancel("user dismissed"));
        assert!(!prompts.cancel("again"));
        assert!(!prompts.resolve(PromptAnswer::secret("1234")).unwrap());
        assert!(pending.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn close_rejects_new_prompts_until_reopened() {
        let prompts = PromptCoordinator::new();
        let pending = prompts.raise(Prompt::secret("Enter PIN")).unwrap();
        prompts.close("flow cancelled");
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(prompts.raise(Prompt::secret("late")).err().unwrap().is_cancelled());

        prompts.reopen();
        assert!(prompts.raise(Prompt::secret("fresh")).is_ok());
    }

    #[tokio::test]
    async fn mismatched_answer_keeps_prompt_active() {
        let prompts = PromptCoordinator::new();
        let keys = vec!["laptop".to_string(), "phone".to_string()];
        let pending = prompts.raise(Prompt::one_of("Pick a key", keys)).unwrap();

        assert!(prompts
            .resolve(PromptAnswer::secret("1234"))
            .unwrap_err()
            .is_invalid_state());
        assert!(prompts
            .resolve(PromptAnswer::Selection(5))
            .unwrap_err()
            .is_invalid_state());
        assert!(prompts.resolve(PromptAnswer::Selection(1)).unwrap());
        assert!(matches!(pending.await.unwrap(), PromptAnswer::Selection(1)));
    }

    #[tokio::test]
    async fn dropping_the_handle_withdraws_the_prompt() {
        let prompts = PromptCoordinator::new();
        let mut observed = prompts.subscribe();
        let pending = prompts.raise(Prompt::secret("Enter PIN")).unwrap();
        assert!(observed.borrow_and_update().is_some());

        drop(pending);
        assert!(observed.borrow_and_update().is_none());
        assert!(prompts.raise(Prompt::secret("next")).is_ok());
    }

    #[tokio::test]
    async fn timeout_cancels_and_frees_the_slot() {
        let prompts = PromptCoordinator::new();
        let pending = prompts.raise(Prompt::secret("Enter PIN")).unwrap();
        let err = pending
            .with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "cancelled: no answer within 20ms");
        assert!(prompts.active().is_none());
    }
}
