use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use aisle_core::config::{AppConfig, AssistantConfig, TimeoutConfig};
use aisle_core::domain::turn::{
    Capability, SafetyDirection, Stage, StreamEvent, TimingRecord, TurnRequest, UserId,
};
use aisle_core::errors::{ApplicationError, DomainError};
use aisle_core::flows::{TurnEvent, TurnMachine, TurnState, TurnTransitionError};
use aisle_db::{ContextRepository, StoredContext};

use crate::catalog::CatalogClient;
use crate::generator::{Fragment, GenerationError, ResponseGenerator};
use crate::guardrails::{GuardrailDecision, SafetyClassifier, SafetyGate};
use crate::handlers::cart::CartSettings;
use crate::handlers::retriever::RetrieverSettings;
use crate::handlers::{
    CartHandler, ChatterHandler, HandlerInput, HandlerOutput, HandlerRegistry, RetrieverHandler,
};
use crate::llm::LlmClient;
use crate::prompts::{ChatterPrompt, PromptError, PromptLibrary};
use crate::router::{RouteDecision, Router};
use crate::summary::ContextSummarizer;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("no handler registered for capability `{0}`")]
    MissingHandler(Capability),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<TurnTransitionError> for TurnError {
    fn from(value: TurnTransitionError) -> Self {
        Self::Domain(DomainError::from(value))
    }
}

impl From<TurnError> for ApplicationError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::Domain(domain) => Self::Domain(domain),
            TurnError::MissingHandler(capability) => {
                Self::Configuration(format!("no handler registered for `{capability}`"))
            }
            TurnError::Generation(error) => {
                Self::Upstream { service: "generation", detail: error.to_string() }
            }
        }
    }
}

/// Destination for stream events. `emit` reports false once the consumer is gone.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: StreamEvent) -> bool;
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn emit(&mut self, event: StreamEvent) -> bool {
        self.send(event).await.is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Buffers every event; used by the non-streaming entry point and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Vec<StreamEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&mut self, event: StreamEvent) -> bool {
        self.events.push(event);
        true
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
pub struct TurnSettings {
    pub error_message: String,
    pub image_only_query: String,
    pub context_store_timeout: Duration,
    pub generation_timeout: Duration,
    pub turn_timeout: Duration,
}

impl TurnSettings {
    pub fn from_config(assistant: &AssistantConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            error_message: assistant.error_message.clone(),
            image_only_query: assistant.image_only_query.clone(),
            context_store_timeout: timeouts.context_store(),
            generation_timeout: timeouts.generation(),
            turn_timeout: timeouts.turn(),
        }
    }
}

/// Everything observable about a finished turn.
#[derive(Clone, Debug)]
pub struct TurnReport {
    pub correlation_id: String,
    pub state: TurnState,
    pub capability: Option<Capability>,
    pub response: String,
    pub images: BTreeMap<String, String>,
    pub timings: TimingRecord,
    pub persisted: bool,
}

enum Screening {
    Blocked { reason: String, fallback: String },
    Routed(RouteDecision),
}

struct TurnScope {
    correlation_id: String,
    user_id: UserId,
    machine: TurnMachine,
    timings: TimingRecord,
    capability: Option<Capability>,
    response: String,
    images: BTreeMap<String, String>,
    persisted: bool,
    started: Instant,
    deadline: Instant,
}

impl TurnScope {
    fn new(user_id: UserId, turn_timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            user_id,
            machine: TurnMachine::default(),
            timings: TimingRecord::new(),
            capability: None,
            response: String::new(),
            images: BTreeMap::new(),
            persisted: false,
            started,
            deadline: started + turn_timeout,
        }
    }

    fn advance(&mut self, event: TurnEvent) -> Result<TurnState, TurnTransitionError> {
        let state = self.machine.advance(event)?;
        debug!(
            event_name = "turn.state.transition",
            correlation_id = %self.correlation_id,
            event = ?event,
            state = ?state,
            "turn state advanced"
        );
        Ok(state)
    }

    /// False when the consumer is gone or stops reading past the turn deadline.
    async fn emit(&mut self, sink: &mut dyn EventSink, event: StreamEvent) -> bool {
        match &event {
            StreamEvent::Content(text) => self.response.push_str(text),
            StreamEvent::Images(images) => self.images = images.clone(),
            StreamEvent::Done => {}
        }
        match tokio::time::timeout_at(self.deadline, sink.emit(event)).await {
            Ok(delivered) => delivered,
            Err(_) => {
                warn!(
                    event_name = "turn.emit.stalled",
                    correlation_id = %self.correlation_id,
                    "consumer stopped reading before the turn deadline"
                );
                false
            }
        }
    }

    fn into_report(mut self) -> TurnReport {
        self.timings.set_total(self.started.elapsed());
        TurnReport {
            correlation_id: self.correlation_id,
            state: self.machine.state(),
            capability: self.capability,
            response: self.response,
            images: self.images,
            timings: self.timings,
            persisted: self.persisted,
        }
    }
}

enum Completion {
    Finished,
    Cancelled,
}

/// Drives one turn from request to done sentinel.
pub struct TurnOrchestrator {
    store: Arc<dyn ContextRepository>,
    safety: SafetyGate,
    router: Router,
    handlers: HandlerRegistry,
    generator: ResponseGenerator,
    summarizer: ContextSummarizer,
    settings: TurnSettings,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn ContextRepository>,
        safety: SafetyGate,
        router: Router,
        handlers: HandlerRegistry,
        generator: ResponseGenerator,
        summarizer: ContextSummarizer,
        settings: TurnSettings,
    ) -> Self {
        Self { store, safety, router, handlers, generator, summarizer, settings }
    }

    /// Wires the standard router, handlers and generator around the given collaborators.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ContextRepository>,
        llm: Arc<dyn LlmClient>,
        catalog: Arc<dyn CatalogClient>,
        classifier: Arc<dyn SafetyClassifier>,
    ) -> Result<Self, PromptError> {
        let assistant = &config.assistant;
        let timeouts = &config.timeouts;
        let prompts = Arc::new(PromptLibrary::new(
            assistant.routing_prompt.clone(),
            assistant.chatter_prompt.clone(),
            assistant.summary_prompt.clone(),
        )?);

        let mut handlers = HandlerRegistry::default();
        handlers.register(CartHandler::new(
            llm.clone(),
            catalog.clone(),
            prompts.clone(),
            CartSettings {
                categories: assistant.categories.clone(),
                similarity_threshold: assistant.similarity_threshold,
                llm_timeout: timeouts.generation(),
                catalog_timeout: timeouts.catalog(),
            },
        ));
        handlers.register(RetrieverHandler::new(
            llm.clone(),
            catalog,
            prompts.clone(),
            RetrieverSettings {
                categories: assistant.categories.clone(),
                top_k: assistant.top_k,
                llm_timeout: timeouts.generation(),
                catalog_timeout: timeouts.catalog(),
            },
        ));
        handlers.register(ChatterHandler::new());

        Ok(Self::new(
            store,
            SafetyGate::new(classifier, timeouts.safety(), assistant.unsafe_message.clone()),
            Router::new(llm.clone(), prompts.clone(), timeouts.generation()),
            handlers,
            ResponseGenerator::new(llm.clone(), prompts.clone()),
            ContextSummarizer::new(llm, prompts, assistant.memory_length, timeouts.generation()),
            TurnSettings::from_config(assistant, timeouts),
        ))
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Streams events into `sink`. An empty turn is rejected before any external call.
    pub async fn run(
        &self,
        request: TurnRequest,
        sink: &mut dyn EventSink,
    ) -> Result<TurnReport, TurnError> {
        request.validate()?;

        let mut scope = TurnScope::new(request.user_id, self.settings.turn_timeout);
        info!(
            event_name = "turn.start",
            correlation_id = %scope.correlation_id,
            user_id = request.user_id,
            has_image = request.has_image(),
            guardrails = request.guardrails,
            "turn started"
        );

        match self.drive(&request, &mut scope, sink).await {
            Ok(Completion::Finished) => {}
            Ok(Completion::Cancelled) => {
                info!(
                    event_name = "turn.cancelled",
                    correlation_id = %scope.correlation_id,
                    "client disconnected; persistence skipped"
                );
            }
            Err(failure) => {
                error!(
                    event_name = "turn.failed",
                    correlation_id = %scope.correlation_id,
                    error = %failure,
                    "turn failed"
                );
                if !scope.machine.state().is_terminal() {
                    scope.advance(TurnEvent::Fail)?;
                }
                let notice = StreamEvent::Content(self.settings.error_message.clone());
                if scope.emit(sink, notice).await {
                    scope.emit(sink, StreamEvent::Done).await;
                }
            }
        }

        let report = scope.into_report();
        info!(
            event_name = "turn.finish",
            correlation_id = %report.correlation_id,
            state = ?report.state,
            persisted = report.persisted,
            "turn finished"
        );
        Ok(report)
    }

    /// Runs the turn to completion and returns the collected report.
    pub async fn run_collect(&self, request: TurnRequest) -> Result<TurnReport, TurnError> {
        let mut sink = CollectingSink::new();
        self.run(request, &mut sink).await
    }

    /// Spawns the turn and returns the receiving end of its event stream.
    pub fn spawn_streaming(
        self: &Arc<Self>,
        request: TurnRequest,
        buffer: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, TurnError> {
        request.validate()?;
        let (mut sender, receiver) = mpsc::channel(buffer.max(1));
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(failure) = orchestrator.run(request, &mut sender).await {
                error!(event_name = "turn.aborted", error = %failure, "turn aborted");
            }
        });
        Ok(receiver)
    }

    async fn drive(
        &self,
        request: &TurnRequest,
        scope: &mut TurnScope,
        sink: &mut dyn EventSink,
    ) -> Result<Completion, TurnError> {
        let turn_deadline = scope.deadline;

        let (stored, memory_ok) = self.load_context(request, scope).await;
        scope.advance(TurnEvent::LoadContext)?;

        let query = if request.has_query() {
            request.query.clone()
        } else {
            self.settings.image_only_query.clone()
        };

        let screening = self.screen_and_route(request, &query, &stored, scope).await;
        let decision = match screening {
            Screening::Blocked { reason, fallback } => {
                info!(
                    event_name = "turn.input.blocked",
                    correlation_id = %scope.correlation_id,
                    reason = %reason,
                    "input rejected by safety gate"
                );
                scope.advance(TurnEvent::BlockInput)?;
                if !scope.emit(sink, StreamEvent::Content(fallback)).await {
                    scope.advance(TurnEvent::Disconnect)?;
                    return Ok(Completion::Cancelled);
                }
                // A degraded load has nothing to write back.
                if memory_ok {
                    self.persist(scope, &stored).await;
                }
                scope.advance(TurnEvent::Persist)?;
                scope.emit(sink, StreamEvent::Done).await;
                scope.advance(TurnEvent::Finish)?;
                return Ok(Completion::Finished);
            }
            Screening::Routed(decision) => decision,
        };

        info!(
            event_name = "turn.route.selected",
            correlation_id = %scope.correlation_id,
            capability = decision.capability.as_str(),
            from_model = decision.from_model,
            "capability selected"
        );
        scope.capability = Some(decision.capability);
        scope.advance(TurnEvent::Route)?;
        if sink.is_closed() {
            scope.advance(TurnEvent::Disconnect)?;
            return Ok(Completion::Cancelled);
        }

        let handler = self
            .handlers
            .get(decision.capability)
            .ok_or(TurnError::MissingHandler(decision.capability))?;
        let handler_started = Instant::now();
        let output = handler
            .handle(HandlerInput {
                user_id: request.user_id,
                query: &request.query,
                image: request.image(),
                context: &stored.context,
                cart: &stored.cart,
                retrieved: &request.retrieved,
            })
            .await;
        let stage = capability_stage(decision.capability);
        scope.timings.record(stage, handler_started.elapsed());
        if output.degraded {
            scope.timings.mark_degraded(stage);
        }
        scope.advance(TurnEvent::Dispatch)?;

        self.generate_and_release(request, &query, &stored, output, scope, sink, turn_deadline)
            .await
    }

    async fn load_context(
        &self,
        request: &TurnRequest,
        scope: &mut TurnScope,
    ) -> (StoredContext, bool) {
        let started = Instant::now();
        let fetched = tokio::time::timeout(
            self.settings.context_store_timeout,
            self.store.get(request.user_id),
        )
        .await;
        scope.timings.record(Stage::Memory, started.elapsed());

        match fetched {
            Ok(Ok(stored)) => (stored, true),
            Ok(Err(failure)) => {
                warn!(
                    event_name = "turn.memory.degraded",
                    correlation_id = %scope.correlation_id,
                    error = %failure,
                    "context store read failed; starting from an empty context"
                );
                scope.timings.mark_degraded(Stage::Memory);
                (StoredContext::default(), false)
            }
            Err(_) => {
                warn!(
                    event_name = "turn.memory.degraded",
                    correlation_id = %scope.correlation_id,
                    "context store read timed out; starting from an empty context"
                );
                scope.timings.mark_degraded(Stage::Memory);
                (StoredContext::default(), false)
            }
        }
    }

    /// Input check and routing overlap; a block wins and the routing future is dropped unpolled
    /// or mid-flight.
    async fn screen_and_route(
        &self,
        request: &TurnRequest,
        query: &str,
        stored: &StoredContext,
        scope: &mut TurnScope,
    ) -> Screening {
        let route = self.router.route(&request.query, request.has_image(), &stored.cart, &stored.context);
        tokio::pin!(route);

        let started = Instant::now();
        if !request.guardrails {
            let decision = route.await;
            scope.timings.record(Stage::Planner, started.elapsed());
            return Screening::Routed(decision);
        }

        let check = self.safety.check(request.user_id, query, SafetyDirection::Input);
        tokio::pin!(check);

        let mut routed: Option<RouteDecision> = None;
        let verdict = loop {
            tokio::select! {
                biased;
                verdict = &mut check => break verdict,
                decision = &mut route, if routed.is_none() => {
                    scope.timings.record(Stage::Planner, started.elapsed());
                    routed = Some(decision);
                }
            }
        };
        scope.timings.record(Stage::Rails, started.elapsed());
        if verdict.is_degraded() {
            scope.timings.mark_degraded(Stage::Rails);
        }

        if let GuardrailDecision::Deny { reason_code, user_message } = verdict {
            return Screening::Blocked { reason: reason_code, fallback: user_message };
        }

        match routed {
            Some(decision) => Screening::Routed(decision),
            None => {
                let decision = route.await;
                scope.timings.record(Stage::Planner, started.elapsed());
                Screening::Routed(decision)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_and_release(
        &self,
        request: &TurnRequest,
        query: &str,
        stored: &StoredContext,
        output: HandlerOutput,
        scope: &mut TurnScope,
        sink: &mut dyn EventSink,
        turn_deadline: Instant,
    ) -> Result<Completion, TurnError> {
        let images = output.images();
        let live = !request.guardrails;
        let prompt = ChatterPrompt {
            query,
            image_only: !request.has_query(),
            context: &stored.context,
            notes: &output.notes,
            cart: Some(&output.cart),
            retrieved: output.retrieved_hint.clone(),
        };

        let generation_started = Instant::now();
        let deadline = (generation_started + self.settings.generation_timeout).min(turn_deadline);
        let mut generation = self.generator.start(&prompt, deadline).await?;

        if live && !images.is_empty() && !scope.emit(sink, StreamEvent::Images(images.clone())).await
        {
            scope.advance(TurnEvent::Disconnect)?;
            return Ok(Completion::Cancelled);
        }

        while let Some(fragment) = generation.next_fragment().await {
            let Fragment::Text(text) = fragment else { break };
            let delivered = if live {
                scope.emit(sink, StreamEvent::Content(text)).await
            } else {
                !sink.is_closed()
            };
            if !delivered {
                scope.advance(TurnEvent::Disconnect)?;
                return Ok(Completion::Cancelled);
            }
        }
        scope.timings.record(Stage::Chatter, generation_started.elapsed());
        scope.advance(TurnEvent::Generate)?;

        let answer = generation.text();
        let mut fallback: Option<String> = None;
        if request.guardrails && !answer.is_empty() {
            let started = Instant::now();
            let verdict = self.safety.check(request.user_id, &answer, SafetyDirection::Output).await;
            scope.timings.record(Stage::Rails, started.elapsed());
            if verdict.is_degraded() {
                scope.timings.mark_degraded(Stage::Rails);
            }
            if let GuardrailDecision::Deny { reason_code, user_message } = verdict {
                info!(
                    event_name = "turn.output.blocked",
                    correlation_id = %scope.correlation_id,
                    reason = %reason_code,
                    "generated answer rejected by safety gate"
                );
                fallback = Some(user_message);
            }
        }
        scope.advance(TurnEvent::CheckOutput)?;

        if !live {
            let mut released = Vec::new();
            if let Some(message) = &fallback {
                released.push(StreamEvent::Content(message.clone()));
            } else {
                if !images.is_empty() {
                    released.push(StreamEvent::Images(images));
                }
                released.extend(generation.fragments().iter().cloned().map(StreamEvent::Content));
            }
            for event in released {
                if !scope.emit(sink, event).await {
                    scope.advance(TurnEvent::Disconnect)?;
                    return Ok(Completion::Cancelled);
                }
            }
        }

        if let Some(reason) = generation.failure() {
            warn!(
                event_name = "turn.generation.interrupted",
                correlation_id = %scope.correlation_id,
                reason,
                "generation stopped mid-stream"
            );
            scope.advance(TurnEvent::Fail)?;
            let notice = StreamEvent::Content(self.settings.error_message.clone());
            if scope.emit(sink, notice).await {
                scope.emit(sink, StreamEvent::Done).await;
            }
            return Ok(Completion::Finished);
        }

        let final_answer = fallback.unwrap_or(answer);
        let summary_started = Instant::now();
        let summary = self.summarizer.summarize(&stored.context, query, &final_answer).await;
        scope.timings.record(Stage::Summarizer, summary_started.elapsed());
        if summary.degraded {
            scope.timings.mark_degraded(Stage::Summarizer);
        }

        self.persist(scope, &StoredContext::new(summary.context, output.cart)).await;
        scope.advance(TurnEvent::Persist)?;
        scope.emit(sink, StreamEvent::Done).await;
        scope.advance(TurnEvent::Finish)?;
        Ok(Completion::Finished)
    }

    /// Failures are logged and swallowed.
    async fn persist(&self, scope: &mut TurnScope, stored: &StoredContext) {
        let written = tokio::time::timeout(
            self.settings.context_store_timeout,
            self.store.put(scope.user_id, stored),
        )
        .await;

        match written {
            Ok(Ok(())) => scope.persisted = true,
            Ok(Err(failure)) => warn!(
                event_name = "turn.persist.failed",
                correlation_id = %scope.correlation_id,
                error = %failure,
                "context store write failed"
            ),
            Err(_) => warn!(
                event_name = "turn.persist.failed",
                correlation_id = %scope.correlation_id,
                "context store write timed out"
            ),
        }
    }
}

fn capability_stage(capability: Capability) -> Stage {
    match capability {
        Capability::Cart => Stage::Cart,
        Capability::Retriever => Stage::Retriever,
        Capability::Chatter => Stage::Chatter,
    }
}
