//! QueryOrchestrator: one logical conversation against the streaming API.
//!
//! Each query runs the same cycle:
//! 1. **Pre-flight**: select a credential from the shared pool. Failures are
//!    reported to the sink and nothing is sent.
//! 2. **Send**: POST the conversation, racing the cancellation token.
//! 3. **Stream**: drive the accumulator, which reports progress to the sink.
//! 4. **Commit**: on completion append the model turn and report usage for
//!    the credential that was actually used.
//!
//! At most one query is in flight per orchestrator. Starting a new query
//! cancels the previous one; the superseded query ends as `Cancelled` and
//! never touches the state of its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::inference::types::{Content, GenerateContentRequest};
use crate::inference::{
    accumulate, GeminiClient, ModelOption, QueryError, ResponseSink, Settings, StreamOutcome,
};
use crate::keys::{RateLimit, SharedKeyPool};

use super::history::ConversationHistory;
use super::telemetry::{HttpTelemetry, NoopTelemetry, TelemetrySink, UsageEvent};
use super::types::{ImageAttachment, QueryOutcome, QueryState};

/// Lock a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The query currently allowed to mutate orchestrator state.
struct InFlight {
    generation: u64,
    token: CancellationToken,
}

// ─── QueryOrchestrator ───────────────────────────────────────────────────────

pub struct QueryOrchestrator {
    client: GeminiClient,
    pool: SharedKeyPool,
    rate_limit: RateLimit,
    model: Mutex<ModelOption>,
    telemetry: Arc<dyn TelemetrySink>,
    history: Mutex<ConversationHistory>,
    in_flight: Mutex<Option<InFlight>>,
    state: Mutex<QueryState>,
    last_terminal: Mutex<Option<QueryState>>,
    next_generation: AtomicU64,
}

impl QueryOrchestrator {
    pub fn new(
        client: GeminiClient,
        pool: SharedKeyPool,
        rate_limit: RateLimit,
        model: ModelOption,
    ) -> Self {
        Self {
            client,
            pool,
            rate_limit,
            model: Mutex::new(model),
            telemetry: Arc::new(NoopTelemetry),
            history: Mutex::new(ConversationHistory::new()),
            in_flight: Mutex::new(None),
            state: Mutex::new(QueryState::Idle),
            last_terminal: Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Build the client, rate limit, model and telemetry from settings.
    pub fn from_settings(settings: &Settings, pool: SharedKeyPool) -> Result<Self, QueryError> {
        let client = GeminiClient::from_settings(settings)?;
        let mut orchestrator = Self::new(
            client,
            pool,
            settings.rate_limit(),
            settings.selected_model(),
        );
        if let Some(telemetry) = HttpTelemetry::from_settings(settings) {
            orchestrator = orchestrator.with_telemetry(Arc::new(telemetry?));
        }
        Ok(orchestrator)
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> QueryState {
        *lock(&self.state)
    }

    /// How the most recent finished query ended (`Completed`, `Errored` or
    /// `Cancelled`). `None` before any query has finished.
    pub fn last_terminal_state(&self) -> Option<QueryState> {
        *lock(&self.last_terminal)
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> Vec<Content> {
        lock(&self.history).turns().to_vec()
    }

    pub fn model(&self) -> ModelOption {
        lock(&self.model).clone()
    }

    /// Takes effect from the next query.
    pub fn set_model(&self, model: ModelOption) {
        tracing::info!(model = %model.model_id, name = %model.display_name, "model selected");
        *lock(&self.model) = model;
    }

    pub fn pool(&self) -> &SharedKeyPool {
        &self.pool
    }

    // ─── Control ─────────────────────────────────────────────────────────

    /// Cancel the in-flight query. Returns `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        match lock(&self.in_flight).as_ref() {
            Some(in_flight) => {
                tracing::info!(generation = in_flight.generation, "cancelling query");
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any in-flight query and start a fresh conversation.
    pub fn clear_conversation(&self) {
        self.cancel();
        lock(&self.history).clear();
        tracing::info!("conversation cleared");
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// Ask a text question, replaying the conversation so far.
    pub async fn query_text(&self, text: &str, sink: &dyn ResponseSink) -> QueryOutcome {
        let (generation, token) = self.begin();

        let (api_key, model) = match self.preflight() {
            Ok(selected) => selected,
            Err(e) => return self.fail(generation, &token, e, sink),
        };

        let contents = {
            let mut history = lock(&self.history);
            history.push_user_text(text);
            history.request_contents()
        };

        self.telemetry
            .record(UsageEvent::new(&model.model_id, text, false));
        self.dispatch(generation, &token, &api_key, &model, contents, sink)
            .await
    }

    /// Ask about an image. Only the image turn is sent; it is appended to
    /// history once and later text queries replay its question text only.
    pub async fn query_with_image(
        &self,
        image: ImageAttachment,
        text: &str,
        sink: &dyn ResponseSink,
    ) -> QueryOutcome {
        let (generation, token) = self.begin();

        let (api_key, model) = match self.preflight() {
            Ok(selected) => selected,
            Err(e) => return self.fail(generation, &token, e, sink),
        };

        let turn = Content::user_with_image(image.into_inline_data(), text);
        lock(&self.history).push_turn(turn.clone());

        self.telemetry
            .record(UsageEvent::new(&model.model_id, text, true));
        self.dispatch(generation, &token, &api_key, &model, vec![turn], sink)
            .await
    }

    // ─── Cycle ───────────────────────────────────────────────────────────

    /// Register a new in-flight query, cancelling the previous one.
    fn begin(&self) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        let mut in_flight = lock(&self.in_flight);
        let previous = in_flight.replace(InFlight {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            tracing::info!(
                superseded = previous.generation,
                generation,
                "new query supersedes in-flight query"
            );
            previous.token.cancel();
        }
        *lock(&self.state) = QueryState::Sending;

        (generation, token)
    }

    /// Select a credential for the current model.
    fn preflight(&self) -> Result<(String, ModelOption), QueryError> {
        let model = self.model();
        let mut pool = lock(self.pool.as_ref());
        let api_key = pool.select(self.rate_limit)?;
        tracing::info!(
            key = pool.name_for_value(&api_key).unwrap_or("unknown"),
            model = %model.model_id,
            "credential selected"
        );
        Ok((api_key, model))
    }

    async fn dispatch(
        &self,
        generation: u64,
        token: &CancellationToken,
        api_key: &str,
        model: &ModelOption,
        contents: Vec<Content>,
        sink: &dyn ResponseSink,
    ) -> QueryOutcome {
        let body = GenerateContentRequest {
            contents,
            generation_config: model.generation_config(),
        };

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return self.cancelled(generation),
            sent = self.client.stream_generate(&model.model_id, api_key, &body) => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => return self.fail(generation, token, e, sink),
        };

        self.transition(generation, QueryState::Streaming);

        match accumulate(self.client.body_stream(response), token, sink).await {
            Ok(StreamOutcome::Completed(text)) => {
                // The sink has already seen the final text; a cancel raised
                // from here on does not withdraw it.
                lock(&self.history).push_model_text(&text);
                lock(self.pool.as_ref()).report_usage(api_key);
                tracing::info!(generation, chars = text.chars().count(), "query completed");
                self.finish(generation, QueryState::Completed);
                QueryOutcome::Completed { text }
            }
            Ok(StreamOutcome::Empty) => {
                // The accumulator has already reported the empty response.
                tracing::warn!(generation, "query returned no text");
                self.finish(generation, QueryState::Errored);
                QueryOutcome::Failed(QueryError::EmptyResponse)
            }
            Ok(StreamOutcome::Cancelled) => self.cancelled(generation),
            Err(e) => self.fail(generation, token, e, sink),
        }
    }

    fn fail(
        &self,
        generation: u64,
        token: &CancellationToken,
        err: QueryError,
        sink: &dyn ResponseSink,
    ) -> QueryOutcome {
        if token.is_cancelled() {
            return self.cancelled(generation);
        }
        tracing::warn!(
            generation,
            error = %err,
            preflight = err.is_preflight(),
            "query failed"
        );
        sink.on_error(&err.to_string());
        self.finish(generation, QueryState::Errored);
        QueryOutcome::Failed(err)
    }

    fn cancelled(&self, generation: u64) -> QueryOutcome {
        tracing::info!(generation, "query cancelled");
        self.finish(generation, QueryState::Cancelled);
        QueryOutcome::Cancelled
    }

    /// Move to `next` if `generation` is still the in-flight query.
    fn transition(&self, generation: u64, next: QueryState) {
        let in_flight = lock(&self.in_flight);
        if in_flight.as_ref().map(|f| f.generation) != Some(generation) {
            return;
        }
        let mut state = lock(&self.state);
        tracing::debug!(generation, from = ?*state, to = ?next, "query state");
        *state = next;
    }

    /// Record a terminal state and return to `Idle`. A superseded query
    /// leaves the slot and state to its replacement.
    fn finish(&self, generation: u64, terminal: QueryState) {
        debug_assert!(terminal.is_terminal());
        let mut in_flight = lock(&self.in_flight);
        if in_flight.as_ref().map(|f| f.generation) != Some(generation) {
            tracing::debug!(generation, outcome = ?terminal, "superseded query finished");
            return;
        }
        *in_flight = None;
        let mut state = lock(&self.state);
        tracing::debug!(generation, from = ?*state, outcome = ?terminal, "query finished");
        *state = QueryState::Idle;
        *lock(&self.last_terminal) = Some(terminal);
    }
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("base_url", &self.client.base_url())
            .field("model", &self.model().model_id)
            .field("state", &self.state())
            .field("turns", &lock(&self.history).len())
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
