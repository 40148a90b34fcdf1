//! The ReAct step loop.
//!
//! Each step optionally plans, asks the model for an action, runs the
//! requested tool calls and code, and observes the results. Advisory phases
//! (divergence tracking, reflection, evaluation, refinement) annotate the
//! step before it is recorded. A run ends on a final answer, when the step
//! budget is spent, or on a model error that cannot be retried.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, Instrument};

use ravel_domain::{
    ChatMessage, Emitter, FinalAnswerTool, GenerateOptions, Model, ModelError, RetrievalMatcher,
    RuntimeEvent, TokenUsage, ToolCall, Toolbox, FINAL_ANSWER_TOOL,
};
use ravel_sandbox::{redact_secrets, CodeExecutor};

use crate::config::{AgentConfig, FeedbackSource};
use crate::divergence::DivergenceTracker;
use crate::error::Result;
use crate::evaluation::{EvaluationStatus, EvaluationVerdict, Evaluator};
use crate::memory::AgentMemory;
use crate::metrics::METRICS;
use crate::obs;
use crate::parallel::{
    execute_call, execute_parallel, non_empty_success, PendingCollector, QualityPredicate,
    ToolOutcome,
};
use crate::planning::Planner;
use crate::prompts;
use crate::refinement::{refine, ModelRefiner, RefinementResult};
use crate::reflection::{Reflection, ReflectionOutcome, ReflectionStore};
use crate::routing::{route_or_passthrough, ModelRouter, ObservationRouter, PassThroughRouter};
use crate::step::{write_transcript, ActionStep, FinalAnswerStep, Step};

const NO_ACTION_ERROR: &str = "The reply contained neither a tool call nor a ```rhai code block. \
Call a tool, write code, or call `final_answer` with the answer.";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Success,
    MaxStepsReached,
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Success => write!(f, "success"),
            RunState::MaxStepsReached => write!(f, "max_steps_reached"),
            RunState::Error => write!(f, "error"),
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub state: RunState,
    /// The final answer, for successful runs.
    pub output: Option<Value>,
    pub steps: Vec<Step>,
    /// Observation of the last step, for runs that ran out of steps.
    pub last_observation: Option<String>,
    /// Redacted error text, for failed runs.
    pub error: Option<String>,
    pub token_usage: TokenUsage,
    /// Parallel tool results that finished after their step moved on.
    pub late_results: Vec<ToolOutcome>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Success
    }

    pub fn action_steps(&self) -> impl Iterator<Item = &ActionStep> {
        self.steps.iter().filter_map(|s| match s {
            Step::Action(a) => Some(a),
            _ => None,
        })
    }

    /// The run's steps as JSON lines; see [`read_transcript`](crate::step::read_transcript).
    pub fn transcript(&self) -> serde_json::Result<String> {
        write_transcript(&self.steps)
    }
}

/// Per-run state owned by the step loop.
struct RunContext {
    run_id: String,
    divergence: DivergenceTracker,
    pending: Vec<PendingCollector>,
    late_results: Vec<ToolOutcome>,
}

/// A ReAct agent over one model and one toolbox.
pub struct Agent {
    model: Arc<dyn Model>,
    toolbox: Toolbox,
    config: AgentConfig,
    executor: Option<Arc<dyn CodeExecutor>>,
    router: Arc<dyn ObservationRouter>,
    router_model: Option<Arc<dyn Model>>,
    emitter: Emitter,
    reflections: Arc<ReflectionStore>,
    shared_reflections: bool,
    quality: QualityPredicate,
    retrieval: RetrievalMatcher,
}

impl Agent {
    /// Build an agent. The final-answer tool is always available.
    pub fn new(model: Arc<dyn Model>, toolbox: Toolbox) -> Self {
        let config = AgentConfig::default();
        let toolbox = toolbox.with_tool(Arc::new(FinalAnswerTool));
        Self {
            model,
            toolbox,
            reflections: Arc::new(ReflectionStore::new(config.reflection.max_store)),
            shared_reflections: false,
            retrieval: config.retrieval_matcher(),
            config,
            executor: None,
            router: Arc::new(PassThroughRouter),
            router_model: None,
            emitter: Emitter::none(),
            quality: non_empty_success(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.retrieval = config.retrieval_matcher();
        if !self.shared_reflections {
            self.reflections = Arc::new(ReflectionStore::new(config.reflection.max_store));
        }
        if let Some(model) = &self.router_model {
            self.router = Arc::new(ModelRouter::new(model.clone(), config.routing.min_chars));
        }
        self.config = config;
        self
    }

    /// Executor for ```rhai code actions.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn ObservationRouter>) -> Self {
        self.router = router;
        self.router_model = None;
        self
    }

    /// Route long observations through `model`, using the `routing` config.
    pub fn with_router_model(mut self, model: Arc<dyn Model>) -> Self {
        self.router = Arc::new(ModelRouter::new(
            model.clone(),
            self.config.routing.min_chars,
        ));
        self.router_model = Some(model);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Share a reflection store across agents or runs.
    pub fn with_reflection_store(mut self, store: Arc<ReflectionStore>) -> Self {
        self.reflections = store;
        self.shared_reflections = true;
        self
    }

    /// Predicate that lets a parallel batch yield early.
    pub fn with_quality_predicate(mut self, predicate: QualityPredicate) -> Self {
        self.quality = predicate;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub fn reflections(&self) -> &Arc<ReflectionStore> {
        &self.reflections
    }

    pub async fn run(&self, task: &str) -> Result<RunResult> {
        self.run_with_images(task, Vec::new()).await
    }

    pub async fn run_with_images(&self, task: &str, images: Vec<String>) -> Result<RunResult> {
        self.config.validate()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, self.model.model_id());
        self.drive(run_id, task, images).instrument(span).await
    }

    async fn drive(&self, run_id: String, task: &str, images: Vec<String>) -> Result<RunResult> {
        let started = Instant::now();
        let max_steps = self.config.max_steps;
        obs::emit_run_started(&run_id, self.model.model_id(), max_steps);

        let lessons = if self.config.reflection.enabled {
            self.reflections.relevant(task, self.config.reflection.top_n)
        } else {
            Vec::new()
        };
        let system = prompts::system_prompt(
            &self.toolbox,
            self.config.instructions.as_deref(),
            &lessons,
        );
        let mut memory = AgentMemory::new(system, task, images);
        let mut ctx = RunContext {
            run_id: run_id.clone(),
            divergence: DivergenceTracker::new(),
            pending: Vec::new(),
            late_results: Vec::new(),
        };
        let planner = Planner::new(self.config.planning_interval);
        let evaluator = Evaluator::new(
            self.config.evaluation.interval,
            self.config.evaluation.done_confidence,
        );
        let tool_names = self.toolbox.names();

        let mut state = RunState::MaxStepsReached;
        let mut output = None;
        let mut last_observation = None;
        let mut run_error = None;
        let mut parent_trace_id = None;

        for step_number in 1..=max_steps {
            if planner.should_plan(step_number) {
                match planner
                    .plan(self.model.as_ref(), &memory, &tool_names, step_number)
                    .await
                {
                    Ok(planning) => {
                        ctx.divergence.set_plan(&planning.plan, &tool_names);
                        obs::emit_planning(&run_id, step_number, planning.plan.len());
                        memory.push(Step::Planning(planning))?;
                    }
                    Err(e) => obs::emit_phase_failed(&run_id, "planning", &e),
                }
            }

            let mut step = ActionStep::new(step_number, parent_trace_id.take());
            self.surface_late_results(&mut ctx, &mut step);

            let fatal = match self.act(&memory, &mut ctx, &mut step).await {
                Ok(()) => None,
                Err(e) => {
                    let message = redact_secrets(&e.to_string());
                    step.push_error(&message);
                    (!e.is_retriable()).then_some(message)
                }
            };

            if fatal.is_none() {
                self.track_divergence(&mut ctx, &step);
                self.reflect_on_error(&ctx, task, &step);
                self.evaluate(&evaluator, &ctx, &memory, &mut step).await;
                self.refine_step(&ctx, task, &mut step).await;
            }

            step.timing = step.timing.finish();
            self.record_step_completed(&ctx, &step);
            parent_trace_id = Some(step.trace_id.clone());

            if let Some(message) = fatal {
                memory.push(Step::Action(step))?;
                state = RunState::Error;
                run_error = Some(message);
                break;
            }
            if step.is_final_answer {
                let answer = step.action_output.clone().unwrap_or(Value::Null);
                memory.push(Step::Action(step))?;
                memory.push(Step::FinalAnswer(FinalAnswerStep {
                    output: answer.clone(),
                }))?;
                state = RunState::Success;
                output = Some(answer);
                break;
            }
            if step_number == max_steps {
                last_observation = step.observations.clone().or_else(|| step.error.clone());
            }
            memory.push(Step::Action(step))?;
        }

        let late = join_all(
            std::mem::take(&mut ctx.pending)
                .into_iter()
                .map(PendingCollector::collect),
        )
        .await;
        ctx.late_results.extend(late.into_iter().flatten());

        let duration_ms = started.elapsed().as_millis() as u64;
        let token_usage = memory.token_usage();
        let steps = memory.into_steps();
        let action_count = steps.iter().filter(|s| matches!(s, Step::Action(_))).count();
        METRICS.inc_runs();
        obs::emit_run_finished(&run_id, &state.to_string(), action_count, duration_ms);
        METRICS.flush();

        Ok(RunResult {
            run_id,
            state,
            output,
            steps,
            last_observation,
            error: run_error,
            token_usage,
            late_results: ctx.late_results,
            duration_ms,
        })
    }

    /// Ask the model for an action and carry it out.
    ///
    /// Tool and code failures are captured into the step; only model errors
    /// are returned.
    async fn act(
        &self,
        memory: &AgentMemory,
        ctx: &mut RunContext,
        step: &mut ActionStep,
    ) -> std::result::Result<(), ModelError> {
        let mut messages = memory.to_messages();
        if let Some(pending) = &step.observations {
            messages.push(ChatMessage::tool_response(format!("Observation:\n{pending}")));
        }
        let reply = self
            .model
            .generate(&messages, &GenerateOptions::default())
            .await?;
        step.token_usage = reply.token_usage;
        step.tool_calls = reply.tool_calls.clone();
        let code = extract_code(&reply.content);
        step.output_message = Some(reply);

        if step.tool_calls.is_empty() && code.is_none() {
            step.push_error(NO_ACTION_ERROR);
            return Ok(());
        }

        let retrieval = self
            .retrieval
            .first_retrieval(step.tool_names().filter(|n| *n != FINAL_ANSWER_TOOL))
            .map(str::to_string);
        let calls = guard_final_answer(step, retrieval.as_deref());
        if !calls.is_empty() {
            self.run_tools(memory.task(), ctx, step, calls).await;
        }
        if let Some(code) = code {
            self.run_code(step, code, retrieval.as_deref()).await;
        }
        Ok(())
    }

    async fn run_tools(
        &self,
        task: &str,
        ctx: &mut RunContext,
        step: &mut ActionStep,
        calls: Vec<ToolCall>,
    ) {
        let total = calls.len();
        METRICS.add_tool_calls(total as u64);
        // Final answers run outside the batch so an early yield cannot strand them.
        let (finals, mut calls): (Vec<ToolCall>, Vec<ToolCall>) =
            calls.into_iter().partition(|c| c.name == FINAL_ANSWER_TOOL);
        let mut outcomes = Vec::with_capacity(total);
        for call in finals {
            outcomes.push(execute_call(&self.toolbox, call, 0).await);
        }
        let batched: Vec<ToolOutcome> = if calls.len() <= 1 {
            match calls.pop() {
                Some(call) => vec![execute_call(&self.toolbox, call, 0).await],
                None => Vec::new(),
            }
        } else if self.config.parallel_tools.enabled {
            let batch = execute_parallel(&self.toolbox, calls, &self.quality).await;
            let finished: Vec<ToolOutcome> = batch.results.into_iter().flatten().collect();
            if !batch.pending.is_empty() {
                step.push_observation(&format!(
                    "{} tool call(s) are still running; their results will be reported later.",
                    batch.pending.remaining()
                ));
                ctx.pending.push(batch.pending);
            }
            finished
        } else {
            let mut finished = Vec::with_capacity(calls.len());
            for (index, call) in calls.into_iter().enumerate() {
                finished.push(execute_call(&self.toolbox, call, index).await);
            }
            finished
        };
        outcomes.extend(batched);

        for outcome in outcomes {
            let name = outcome.call.name.clone();
            match &outcome.output {
                Ok(value) if name == FINAL_ANSWER_TOOL => {
                    step.action_output = Some(value.clone());
                    step.is_final_answer = true;
                }
                Ok(_) => {
                    let raw = outcome.observation();
                    let (text, usage) =
                        route_or_passthrough(self.router.as_ref(), task, &name, &raw).await;
                    add_usage(step, usage);
                    if total > 1 {
                        step.push_observation(&format!("[{name}] {text}"));
                    } else {
                        step.push_observation(&text);
                    }
                }
                Err(error) => step.push_error(error),
            }
        }
    }

    async fn run_code(&self, step: &mut ActionStep, code: String, retrieval: Option<&str>) {
        step.code_action = Some(code.clone());
        let Some(executor) = &self.executor else {
            step.push_error("Code actions are not available: no code executor is configured.");
            return;
        };
        METRICS.inc_code_executions();
        match executor.execute(&code).await {
            Ok(result) => {
                let observation = result.observation();
                match result.error {
                    Some(error) => {
                        if !result.logs.trim().is_empty() {
                            step.push_observation(&format!(
                                "Execution logs:\n{}",
                                result.logs.trim_end()
                            ));
                        }
                        step.push_error(&error);
                    }
                    None => {
                        step.push_observation(&observation);
                        match retrieval.filter(|_| result.is_final_answer) {
                            Some(tool) => {
                                debug!(
                                    step = step.step_number,
                                    tool = %tool,
                                    "final answer rejected"
                                );
                                step.push_error(&final_answer_guard_error(tool));
                            }
                            None => {
                                step.is_final_answer |= result.is_final_answer;
                                step.action_output = Some(result.output);
                            }
                        }
                    }
                }
            }
            Err(e) => step.push_error(&redact_secrets(&e.to_string())),
        }
    }

    /// Move results of earlier early-yielded batches into this step.
    fn surface_late_results(&self, ctx: &mut RunContext, step: &mut ActionStep) {
        for pending in &mut ctx.pending {
            for outcome in pending.drain_ready() {
                step.push_observation(&format!(
                    "Late result from {}: {}",
                    outcome.call.name,
                    outcome.observation()
                ));
                ctx.late_results.push(outcome);
            }
        }
        ctx.pending.retain(|p| !p.is_empty());
    }

    fn track_divergence(&self, ctx: &mut RunContext, step: &ActionStep) {
        let score = ctx.divergence.alignment_score(step);
        let Some(level) = ctx.divergence.record(score) else {
            return;
        };
        let off_topic = ctx.divergence.off_topic_count();
        METRICS.inc_divergence_signals();
        obs::emit_divergence(&ctx.run_id, step.step_number, &level.to_string(), off_topic);
        self.emitter.emit_with(|| RuntimeEvent::DivergenceDetected {
            run_id: ctx.run_id.clone(),
            step_number: step.step_number,
            level: level.to_string(),
            off_topic_count: off_topic,
        });
    }

    fn reflect_on_error(&self, ctx: &RunContext, task: &str, step: &ActionStep) {
        if !self.config.reflection.enabled {
            return;
        }
        if let Some(reflection) = Reflection::from_failed_step(task, step) {
            self.store_reflection(ctx, reflection);
        }
    }

    fn store_reflection(&self, ctx: &RunContext, reflection: Reflection) {
        let step_number = reflection.step_number;
        let outcome = reflection.outcome.to_string();
        self.reflections.record(reflection);
        METRICS.inc_reflections();
        obs::emit_reflection_recorded(&ctx.run_id, step_number, &outcome);
        self.emitter.emit_with(|| RuntimeEvent::ReflectionRecorded {
            run_id: ctx.run_id.clone(),
            step_number,
            outcome,
        });
    }

    async fn evaluate(
        &self,
        evaluator: &Evaluator,
        ctx: &RunContext,
        memory: &AgentMemory,
        step: &mut ActionStep,
    ) {
        if !self.config.evaluation.enabled
            || step.is_final_answer
            || !evaluator.is_checkpoint(step.step_number)
        {
            return;
        }
        let mut history = memory.history_messages();
        history.extend(Step::Action(step.clone()).to_messages());
        let verdict = match evaluator
            .evaluate(self.model.as_ref(), memory.task(), history)
            .await
        {
            Ok((verdict, usage)) => {
                add_usage(step, usage);
                verdict
            }
            Err(e) => {
                obs::emit_phase_failed(&ctx.run_id, "evaluation", &e);
                return;
            }
        };
        obs::emit_evaluation(
            &ctx.run_id,
            step.step_number,
            &verdict.status.to_string(),
            verdict.confidence,
        );

        if evaluator.accepts_done(&verdict) {
            step.action_output = Some(done_answer(&verdict, step));
            step.is_final_answer = true;
            return;
        }
        if verdict.status == EvaluationStatus::Stuck {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "no progress is being made".to_string());
            if self.config.reflection.enabled {
                let reflection = Reflection::new(
                    memory.task(),
                    step.step_number,
                    format!("step {} evaluated as stuck", step.step_number),
                    format!(
                        "The run got stuck: {reason}. Change strategy early instead of \
                         repeating actions."
                    ),
                    ReflectionOutcome::Stuck,
                );
                self.store_reflection(ctx, reflection);
            }
            step.push_observation(&format!(
                "Progress check: the task appears stuck ({reason}). \
                 Try a different approach instead of repeating previous actions."
            ));
        }
    }

    async fn refine_step(&self, ctx: &RunContext, task: &str, step: &mut ActionStep) {
        let settings = &self.config.refinement;
        if !settings.enabled || step.is_final_answer {
            return;
        }
        // Execution feedback only makes sense for code; prose is refined by critique.
        let candidate = match settings.source {
            FeedbackSource::Execution => step.code_action.clone(),
            _ => step.code_action.clone().or_else(|| {
                step.output_message
                    .as_ref()
                    .map(|m| m.content.trim().to_string())
                    .filter(|c| !c.is_empty())
            }),
        };
        let Some(candidate) = candidate else {
            return;
        };

        let mut refiner = ModelRefiner::new(self.model.clone(), settings.source)
            .with_known_error(step.error.clone());
        if settings.source == FeedbackSource::Execution {
            if let Some(executor) = &self.executor {
                refiner = refiner.with_executor(executor.clone());
            }
        }
        let result = match refine(&refiner, task, &candidate, settings.max_iterations).await {
            Ok(result) => result,
            Err(e) => {
                obs::emit_phase_failed(&ctx.run_id, "refinement", &e);
                return;
            }
        };
        self.record_refinement(ctx, step, &result);
        add_usage(step, Some(result.token_usage));
        if result.improved {
            step.push_observation(&format!(
                "Suggested revision for the next step:\n{}",
                result.refined
            ));
        }
    }

    fn record_refinement(&self, ctx: &RunContext, step: &ActionStep, result: &RefinementResult) {
        METRICS.inc_refinements();
        obs::emit_refinement_completed(
            &ctx.run_id,
            step.step_number,
            result.iterations,
            result.improved,
        );
        self.emitter.emit_with(|| RuntimeEvent::RefinementCompleted {
            run_id: ctx.run_id.clone(),
            step_number: step.step_number,
            iterations: result.iterations,
            improved: result.improved,
            confidence: result.confidence,
        });
    }

    fn record_step_completed(&self, ctx: &RunContext, step: &ActionStep) {
        let duration_ms = step.timing.duration_ms();
        METRICS.inc_steps();
        obs::emit_step_completed(
            &ctx.run_id,
            step.step_number,
            step.tool_calls.len(),
            duration_ms,
            step.error.as_deref(),
        );
        self.emitter.emit_with(|| RuntimeEvent::StepCompleted {
            run_id: ctx.run_id.clone(),
            step_number: step.step_number,
            duration_ms,
            tool_calls: step.tool_calls.len(),
            is_final_answer: step.is_final_answer,
            error: step.error.clone(),
        });
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model.model_id())
            .field("tools", &self.toolbox.names())
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .field("max_steps", &self.config.max_steps)
            .finish()
    }
}

/// Drop any final-answer call when a retrieval tool shares the action.
fn guard_final_answer(step: &mut ActionStep, retrieval: Option<&str>) -> Vec<ToolCall> {
    let calls = step.tool_calls.clone();
    let Some(tool) = retrieval else {
        return calls;
    };
    if !calls.iter().any(|c| c.name == FINAL_ANSWER_TOOL) {
        return calls;
    }
    debug!(step = step.step_number, tool = %tool, "final answer rejected");
    step.push_error(&final_answer_guard_error(tool));
    calls
        .into_iter()
        .filter(|c| c.name != FINAL_ANSWER_TOOL)
        .collect()
}

fn final_answer_guard_error(tool: &str) -> String {
    format!(
        "`{FINAL_ANSWER_TOOL}` was called in the same step as the retrieval tool `{tool}`. \
         Observe the retrieved data first and give the final answer in a later step."
    )
}

fn add_usage(step: &mut ActionStep, usage: Option<TokenUsage>) {
    if let Some(usage) = usage {
        step.token_usage = Some(step.token_usage.unwrap_or_default() + usage);
    }
}

fn done_answer(verdict: &EvaluationVerdict, step: &ActionStep) -> Value {
    verdict
        .answer
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| Value::String(a.to_string()))
        .or_else(|| step.action_output.clone())
        .unwrap_or(Value::Null)
}

fn code_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```(?:rhai)?[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// Code from ```rhai (or unlabelled) fenced blocks, joined in order.
pub fn extract_code(text: &str) -> Option<String> {
    let blocks: Vec<&str> = code_pattern()?
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|block| !block.is_empty())
        .collect();
    (!blocks.is_empty()).then(|| blocks.join("\n"))
}
