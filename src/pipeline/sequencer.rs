//! Stage Sequencer: Switch, collaborative fan-out, Minimux, optional Guesser

use super::outcome::{GroupOutcome, PipelineOutput};
use super::stage::{self, Stage, StageCall};
use crate::assembler::{fill_template, format_numbered};
use crate::completion::{CompletionPort, ModelPort};
use crate::config::{PipelineConfig, MAX_PARALLEL_CEILING};
use crate::consensus::{consensus_answers, fit_to_len, majority_vote, UNKNOWN};
use crate::cost::{CostAccumulator, PricingTable};
use crate::error::{Error, Result};
use crate::fallback::{default_decider, default_groups};
use crate::fanout::{FanOutExecutor, DEFAULT_MAX_PARALLEL};
use crate::llm_client::LlmClient;
use crate::parser::{get_str, get_string_list, Mapping};
use crate::persona::{PersonaGroup, SwitchOutput};
use crate::profile::{ResearchMode, SynthesisPrompts, TaskItem, TaskProfile, TaskType, GUESS_FIELD};
use crate::prompts::FACTS_HEADING;
use crate::trace::{StageRecord, StageTrace, TraceAnnotation};
use crate::types::{RunId, TokenUsage};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

type Bindings = Vec<(&'static str, String)>;
type Branch = Box<dyn FnOnce() -> BoxFuture<'static, Result<BranchOutput>> + Send>;

/// Payload key that keeps guesses the arbiter wrote itself
pub const ARBITRATION_GUESS_FIELD: &str = "arbitration_guessed_words";

const NO_SPYMASTER_CLUE: &str = "(none)";

/// Runs task items through the fixed stage order.
///
/// The arbiter port serves Switch and Minimux, the worker port serves every
/// fan-out branch and the Guesser. Both share one [`CostAccumulator`].
pub struct Sequencer {
    arbiter: Arc<dyn CompletionPort>,
    worker: Arc<dyn CompletionPort>,
    cost: Arc<CostAccumulator>,
    executor: FanOutExecutor,
    research_mode: Option<ResearchMode>,
}

/// Builder for [`Sequencer`]
pub struct SequencerBuilder {
    arbiter: Option<Arc<dyn CompletionPort>>,
    worker: Option<Arc<dyn CompletionPort>>,
    cost: Option<Arc<CostAccumulator>>,
    pricing: Option<PricingTable>,
    max_parallel: usize,
    research_mode: Option<ResearchMode>,
}

impl SequencerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            arbiter: None,
            worker: None,
            cost: None,
            pricing: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            research_mode: None,
        }
    }

    /// Port for Switch and Minimux
    pub fn arbiter_port(mut self, port: Arc<dyn CompletionPort>) -> Self {
        self.arbiter = Some(port);
        self
    }

    /// Port for Researcher, Thinker and Guesser
    pub fn worker_port(mut self, port: Arc<dyn CompletionPort>) -> Self {
        self.worker = Some(port);
        self
    }

    /// Use one port for every stage
    pub fn port(self, port: Arc<dyn CompletionPort>) -> Self {
        self.arbiter_port(Arc::clone(&port)).worker_port(port)
    }

    /// Share an existing cost accumulator
    pub fn cost(mut self, cost: Arc<CostAccumulator>) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Fan-out worker ceiling
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Override the profile's research strategy
    pub fn research_mode(mut self, mode: ResearchMode) -> Self {
        self.research_mode = Some(mode);
        self
    }

    /// Apply parallelism, research mode and pricing from a configuration
    pub fn config(mut self, config: &PipelineConfig) -> Self {
        self.max_parallel = config.effective_parallelism();
        self.research_mode = config.research_mode;
        self.pricing = Some(config.pricing_table());
        self
    }

    /// Build the sequencer
    pub fn build(self) -> Result<Sequencer> {
        let arbiter = self
            .arbiter
            .ok_or_else(|| Error::config("Sequencer requires an arbiter port"))?;
        let worker = self
            .worker
            .ok_or_else(|| Error::config("Sequencer requires a worker port"))?;
        let pricing = self.pricing;
        let cost = self
            .cost
            .unwrap_or_else(|| Arc::new(CostAccumulator::new(pricing.unwrap_or_default())));

        Ok(Sequencer {
            arbiter,
            worker,
            cost,
            executor: FanOutExecutor::new(self.max_parallel.clamp(1, MAX_PARALLEL_CEILING)),
            research_mode: self.research_mode,
        })
    }
}

impl Default for SequencerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state of one run
struct Run<'a> {
    profile: TaskProfile,
    item: &'a TaskItem,
    bindings: Bindings,
    mode: ResearchMode,
    trace: StageTrace,
    degraded: bool,
}

/// Handles a fan-out branch owns
struct BranchContext {
    worker: Arc<dyn CompletionPort>,
    cost: Arc<CostAccumulator>,
    profile: TaskProfile,
    bindings: Bindings,
    question_count: usize,
}

enum BranchOutput {
    MergedResearch {
        record: StageRecord,
        answers: Vec<Vec<String>>,
        failed: bool,
    },
    Group {
        outcome: GroupOutcome,
        records: Vec<StageRecord>,
    },
}

impl Sequencer {
    /// Create a sequencer builder
    pub fn builder() -> SequencerBuilder {
        SequencerBuilder::new()
    }

    /// Build both ports over one transport from a configuration
    pub fn from_config(config: &PipelineConfig, client: Arc<dyn LlmClient>) -> Result<Self> {
        config.validate()?;
        let arbiter = ModelPort::new(Arc::clone(&client), config.arbiter_model_config());
        let worker = ModelPort::new(client, config.worker_model_config());
        Self::builder()
            .arbiter_port(Arc::new(arbiter))
            .worker_port(Arc::new(worker))
            .config(config)
            .build()
    }

    /// Session cost accumulator
    pub fn cost(&self) -> &Arc<CostAccumulator> {
        &self.cost
    }

    /// Run one item for a task identifier such as `recall-and-write`.
    ///
    /// Unknown identifiers and missing item fields fail before any model call.
    pub async fn run(&self, task_id: &str, item: &TaskItem) -> Result<PipelineOutput> {
        let task: TaskType = task_id.parse()?;
        self.run_task(task, item).await
    }

    /// Run one item. Only configuration errors are returned; every other
    /// failure degrades the payload and shows up in the trace.
    pub async fn run_task(&self, task: TaskType, item: &TaskItem) -> Result<PipelineOutput> {
        item.validate(task)?;
        let run_id = RunId::new();
        let span = tracing::info_span!("pipeline", run_id = %run_id, task = %task);
        Ok(self.execute(run_id, task.profile(), item).instrument(span).await)
    }

    async fn execute(&self, run_id: RunId, profile: TaskProfile, item: &TaskItem) -> PipelineOutput {
        tracing::info!("pipeline started");
        let mut run = Run {
            profile,
            item,
            bindings: item.bindings(),
            mode: profile.resolve_research_mode(self.research_mode),
            trace: StageTrace::new(),
            degraded: false,
        };

        let switch = self.switch_stage(&mut run).await;
        let clue = spymaster_clue(&switch).unwrap_or(NO_SPYMASTER_CLUE).to_string();
        run.bindings.push(("spymaster_clue", clue));

        let groups = self.collaborative_stage(&mut run, &switch).await;
        let mut payload = self.arbitration_stage(&mut run, &switch, &groups).await;
        if let Some(prompts) = profile.guesser {
            self.synthesis_stage(&mut run, prompts, &mut payload).await;
        }

        let cost = self.cost.snapshot();
        tracing::info!(
            degraded = run.degraded,
            stages = run.trace.len(),
            tokens = run.trace.total_tokens().total_tokens,
            session_cost_usd = cost.summary().cost_usd,
            "pipeline finished"
        );

        PipelineOutput {
            run_id,
            task: profile.task,
            payload,
            degraded: run.degraded,
            switch,
            groups,
            trace: run.trace,
            cost,
        }
    }

    async fn switch_stage(&self, run: &mut Run<'_>) -> SwitchOutput {
        let task = run.profile.task;
        let prompt = fill_template(run.profile.switch_user, &run.bindings);
        let call = stage::call(
            self.arbiter.as_ref(),
            &self.cost,
            Stage::Switch.key(None),
            run.profile.switch_system,
            &prompt,
        )
        .await;

        let mut switch = SwitchOutput::from_mapping(&call.mapping());
        if call.failed() {
            tracing::warn!(stage = "switch", "persona generation failed, run is degraded");
            run.degraded = true;
        }
        let mut record = call.record;
        if switch.groups.is_empty() {
            tracing::warn!(stage = "switch", "no usable persona groups, using defaults");
            switch.groups = default_groups(task);
            record.annotate(TraceAnnotation::FallbackApplied {
                detail: "default persona groups".to_string(),
            });
        }
        if switch.decider.is_none() {
            tracing::warn!(stage = "switch", "no decider persona, using default");
            switch.decider = Some(default_decider(task));
            record.annotate(TraceAnnotation::FallbackApplied {
                detail: "default decider".to_string(),
            });
        }

        tracing::info!(
            stage = "switch",
            groups = switch.groups.len(),
            tokens = record.tokens.total_tokens,
            "stage finished"
        );
        run.trace.record(record);
        switch
    }

    async fn collaborative_stage(&self, run: &mut Run<'_>, switch: &SwitchOutput) -> Vec<GroupOutcome> {
        let mode = run.mode;
        tracing::info!(stage = "collaborative", groups = switch.groups.len(), mode = ?mode, "stage started");

        let ctx = Arc::new(BranchContext {
            worker: Arc::clone(&self.worker),
            cost: Arc::clone(&self.cost),
            profile: run.profile,
            bindings: run.bindings.clone(),
            question_count: run.item.questions.len(),
        });

        let merged = mode == ResearchMode::Merged;
        let per_group = mode == ResearchMode::PerGroup;
        let mut branches: Vec<Branch> = Vec::with_capacity(switch.groups.len() + 1);
        if merged {
            let ctx = Arc::clone(&ctx);
            let groups = switch.groups.clone();
            branches.push(Box::new(move || merged_research(ctx, groups).map(Ok::<_, Error>).boxed()));
        }
        for group in &switch.groups {
            let ctx = Arc::clone(&ctx);
            let group = group.clone();
            branches.push(Box::new(move || run_group(ctx, group, per_group).map(Ok::<_, Error>).boxed()));
        }

        let offset = usize::from(merged);
        let mut outcomes: Vec<GroupOutcome> = switch.groups.iter().map(GroupOutcome::pending).collect();
        let mut merged_answers = None;

        for (index, result) in self.executor.run_all(branches).await.into_iter().enumerate() {
            match result {
                Ok(BranchOutput::MergedResearch { record, answers, failed }) => {
                    run.degraded |= failed;
                    run.trace.record(record);
                    merged_answers = Some(answers);
                }
                Ok(BranchOutput::Group { outcome, records }) => {
                    for record in records {
                        run.trace.record(record);
                    }
                    outcomes[index - offset] = outcome;
                }
                Err(e) if merged && index == 0 => {
                    run.degraded = true;
                    run.trace.record(StageRecord::failed(Stage::Researcher.key(None), e.to_string()));
                }
                Err(e) => {
                    let outcome = &mut outcomes[index - offset];
                    outcome.failed = true;
                    tracing::warn!(group = outcome.id, error = %e, "group branch aborted");
                    run.trace.record(StageRecord::failed(group_key(outcome.id), e.to_string()));
                }
            }
        }

        if let Some(answers) = merged_answers {
            for (outcome, facts) in outcomes.iter_mut().zip(answers) {
                outcome.facts = facts;
            }
        }

        tracing::info!(
            stage = "collaborative",
            contributing = outcomes.iter().filter(|g| g.contributed()).count(),
            total = outcomes.len(),
            "stage finished"
        );
        outcomes
    }

    async fn arbitration_stage(
        &self,
        run: &mut Run<'_>,
        switch: &SwitchOutput,
        groups: &[GroupOutcome],
    ) -> Mapping {
        let profile = run.profile;
        let researched: Vec<&GroupOutcome> = groups.iter().filter(|g| !g.facts.is_empty()).collect();
        let proposed: Vec<&GroupOutcome> = groups.iter().filter(|g| g.proposal.is_some()).collect();
        let failed: Vec<u32> = groups
            .iter()
            .filter(|g| !responded(g))
            .map(|g| g.id)
            .collect();
        let responded_count = groups.len() - failed.len();

        let mut bindings = run.bindings.clone();
        bindings.push(("answers", answers_block(&researched)));
        bindings.push(("directions", directions_block(&proposed)));
        bindings.push((
            "coverage",
            coverage_line(run.mode, groups.len(), responded_count, researched.len(), proposed.len()),
        ));
        let prompt = fill_template(profile.minimux, &bindings);

        tracing::info!(stage = "minimux", responded = responded_count, total = groups.len(), "stage started");
        let StageCall { mut record, reply } = stage::call(
            self.arbiter.as_ref(),
            &self.cost,
            Stage::Minimux.key(None),
            switch.decider_text(),
            &prompt,
        )
        .await;

        if !failed.is_empty() {
            tracing::warn!(failed = ?failed, "arbitrating without every group");
            run.degraded = true;
            record.annotate(TraceAnnotation::PartialGroupFailure { failed });
        }

        let mut payload = match reply {
            Some(reply) if !reply.mapping.is_empty() => reply.mapping,
            Some(reply) => {
                tracing::warn!(stage = "minimux", "unparsable arbitration output, keeping raw text");
                run.degraded = true;
                record.annotate(TraceAnnotation::Degraded {
                    reason: "arbitration output unparsable; raw text kept".to_string(),
                });
                let mut payload = Mapping::new();
                if let Some(raw) = reply.raw_text() {
                    payload.insert(profile.result_text_field.to_string(), Value::String(raw));
                }
                payload
            }
            None => {
                run.degraded = true;
                record.annotate(TraceAnnotation::Degraded {
                    reason: "arbitration call failed; payload rebuilt from groups".to_string(),
                });
                Mapping::new()
            }
        };

        if complete_payload(&profile, &mut payload, switch, groups, run.item.questions.len(), &mut record) {
            run.degraded = true;
        }
        tracing::info!(stage = "minimux", degraded = run.degraded, "stage finished");
        run.trace.record(record);
        payload
    }

    async fn synthesis_stage(&self, run: &mut Run<'_>, prompts: SynthesisPrompts, payload: &mut Mapping) {
        let Some(clue) = get_str(payload, run.profile.result_text_field) else {
            tracing::warn!(stage = "guesser", "no clue to guess from, skipping");
            run.degraded = true;
            run.trace.record(
                StageRecord::new(Stage::Guesser.key(None), "", TokenUsage::default()).with_annotation(
                    TraceAnnotation::Degraded {
                        reason: "no final clue; guessing skipped".to_string(),
                    },
                ),
            );
            merge_guesses(payload, Vec::new());
            return;
        };

        let mut bindings = run.bindings.clone();
        bindings.push(("final_clue", clue));
        let prompt = fill_template(prompts.user, &bindings);
        let call = stage::call(
            self.worker.as_ref(),
            &self.cost,
            Stage::Guesser.key(None),
            prompts.system,
            &prompt,
        )
        .await;

        run.degraded |= call.failed();
        let raw_guesses = get_string_list(&call.mapping(), GUESS_FIELD);
        let guesses = filter_guesses(&raw_guesses, &run.item.word_list, run.item.n());
        tracing::info!(stage = "guesser", proposed = raw_guesses.len(), kept = guesses.len(), "stage finished");
        run.trace.record(call.record);
        merge_guesses(payload, guesses);
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("arbiter", &self.arbiter.model_id())
            .field("worker", &self.worker.model_id())
            .field("executor", &self.executor)
            .field("research_mode", &self.research_mode)
            .finish()
    }
}

async fn merged_research(ctx: Arc<BranchContext>, groups: Vec<PersonaGroup>) -> BranchOutput {
    let template = ctx.profile.merged_researcher.unwrap_or(ctx.profile.researcher);
    let personas = groups
        .iter()
        .enumerate()
        .map(|(i, group)| match group.researcher_text() {
            "" => format!("r{}: General researcher", i + 1),
            text => format!("r{}: {}", i + 1, text),
        })
        .collect::<Vec<_>>()
        .join("\n");
    let schema = format!(
        "{{{}}}",
        (1..=groups.len())
            .map(|i| format!("\"r{}\": [\"...\"]", i))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut bindings = ctx.bindings.clone();
    bindings.push(("personas", personas));
    bindings.push(("schema", schema));
    let prompt = fill_template(template, &bindings);
    let call = stage::call(
        ctx.worker.as_ref(),
        &ctx.cost,
        Stage::Researcher.key(None),
        "",
        &prompt,
    )
    .await;

    let mapping = call.mapping();
    let answers = (1..=groups.len())
        .map(|i| {
            let answers = get_string_list(&mapping, &format!("r{}", i));
            if answers.is_empty() {
                answers
            } else {
                fit_to_len(answers, ctx.question_count)
            }
        })
        .collect();

    if !call.failed() && mapping.is_empty() {
        tracing::warn!(stage = "researcher", "merged research unparsable, groups have no facts");
    }

    BranchOutput::MergedResearch {
        failed: call.failed() || mapping.is_empty(),
        record: call.record,
        answers,
    }
}

async fn run_group(ctx: Arc<BranchContext>, group: PersonaGroup, research: bool) -> BranchOutput {
    let profile = ctx.profile;
    let mut outcome = GroupOutcome::pending(&group);
    let mut records = Vec::with_capacity(2);

    if research && !group.researcher_text().is_empty() {
        let prompt = fill_template(profile.researcher, &ctx.bindings);
        let call = stage::call(
            ctx.worker.as_ref(),
            &ctx.cost,
            Stage::Researcher.key(Some(group.id)),
            group.researcher_text(),
            &prompt,
        )
        .await;
        outcome.failed |= call.failed();
        outcome.facts = research_facts(&profile, &call, ctx.question_count);
        records.push(call.record);
    }

    if !group.thinker_text().is_empty() {
        let mut bindings = ctx.bindings.clone();
        bindings.push(("facts", facts_section(&outcome.facts)));
        let prompt = fill_template(profile.thinker, &bindings);
        let call = stage::call(
            ctx.worker.as_ref(),
            &ctx.cost,
            Stage::Thinker.key(Some(group.id)),
            group.thinker_text(),
            &prompt,
        )
        .await;
        outcome.failed |= call.failed();
        if let Some(reply) = &call.reply {
            // unparsable thinker text is still a usable proposal
            outcome.proposal = get_str(&reply.mapping, profile.thinker_field)
                .or_else(|| reply.mapping.is_empty().then(|| reply.raw_text()).flatten());
            outcome.reasoning = get_str(&reply.mapping, "reasoning");
        }
        records.push(call.record);
    }

    BranchOutput::Group { outcome, records }
}

fn research_facts(profile: &TaskProfile, call: &StageCall, question_count: usize) -> Vec<String> {
    let Some(reply) = &call.reply else {
        return Vec::new();
    };
    let facts = get_string_list(&reply.mapping, profile.research_field);
    match profile.task {
        TaskType::Trivia if facts.is_empty() => facts,
        TaskType::Trivia => fit_to_len(facts, question_count),
        _ if facts.is_empty() && reply.mapping.is_empty() => reply.raw_text().into_iter().collect(),
        _ => facts,
    }
}

fn facts_section(facts: &[String]) -> String {
    if facts.is_empty() {
        String::new()
    } else {
        format!("{}\n{}\n", FACTS_HEADING, format_numbered(facts))
    }
}

fn answers_block(groups: &[&GroupOutcome]) -> String {
    if groups.is_empty() {
        return "(none)".to_string();
    }
    groups
        .iter()
        .map(|g| {
            format!(
                "Group {} ({}): {}",
                g.id,
                g.researcher.as_deref().unwrap_or("researcher"),
                g.facts.join(" | ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn directions_block(groups: &[&GroupOutcome]) -> String {
    if groups.is_empty() {
        return "(none)".to_string();
    }
    groups
        .iter()
        .filter_map(|g| {
            let proposal = g.proposal.as_deref()?;
            let mut line = format!("Group {} ({}): {}", g.id, g.thinker.as_deref().unwrap_or("thinker"), proposal);
            if let Some(reasoning) = &g.reasoning {
                line.push_str(&format!(" | reasoning: {}", reasoning));
            }
            Some(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a group finished cleanly and produced something to arbitrate
fn responded(group: &GroupOutcome) -> bool {
    !group.failed && group.contributed()
}

/// Trace key for a group branch that aborted before returning its records
fn group_key(id: u32) -> String {
    format!("group.g{}", id)
}

fn coverage_line(mode: ResearchMode, total: usize, responded: usize, researched: usize, proposed: usize) -> String {
    let research = match mode {
        ResearchMode::None => "research skipped".to_string(),
        _ => format!("research from {} of {}", researched, total),
    };
    format!(
        "{} of {} groups responded ({}, proposals from {} of {} groups)",
        responded, total, research, proposed, total
    )
}

fn spymaster_clue(switch: &SwitchOutput) -> Option<&str> {
    switch
        .extras
        .get("spymaster_clue")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|clue| !clue.is_empty())
}

/// Fill result fields the arbiter left out from what the groups produced.
///
/// Returns whether anything was substituted.
fn complete_payload(
    profile: &TaskProfile,
    payload: &mut Mapping,
    switch: &SwitchOutput,
    groups: &[GroupOutcome],
    question_count: usize,
    record: &mut StageRecord,
) -> bool {
    let mut substituted = false;
    let text_field = profile.result_text_field;
    if get_str(payload, text_field).is_none() {
        let proposals: Vec<&str> = groups.iter().filter_map(|g| g.proposal.as_deref()).collect();
        let fallback = majority_vote(&proposals)
            .map(|vote| vote.value)
            .or_else(|| spymaster_clue(switch).map(str::to_string));
        if let Some(value) = fallback {
            tracing::warn!(field = text_field, "result field missing, filled from group proposals");
            payload.insert(text_field.to_string(), Value::String(value));
            substituted = true;
            record.annotate(TraceAnnotation::FallbackApplied {
                detail: format!("{} from group proposals", text_field),
            });
        }
    }

    if let Some(list_field) = profile.result_list_field {
        let answers = get_string_list(payload, list_field);
        let fact_sets: Vec<Vec<String>> = groups.iter().map(|g| g.facts.clone()).collect();
        let consensus = consensus_answers(&fact_sets, question_count);
        let completed: Vec<String> = consensus
            .into_iter()
            .enumerate()
            .map(|(i, agreed)| match answers.get(i) {
                Some(answer) if !answer.is_empty() && !answer.eq_ignore_ascii_case(UNKNOWN) => answer.clone(),
                _ => agreed,
            })
            .collect();

        if completed != answers {
            tracing::warn!(
                field = list_field,
                returned = answers.len(),
                expected = question_count,
                "answers completed from researcher consensus"
            );
            substituted = true;
            record.annotate(TraceAnnotation::FallbackApplied {
                detail: format!("{} completed from researcher consensus", list_field),
            });
        }
        payload.insert(
            list_field.to_string(),
            Value::Array(completed.into_iter().map(Value::String).collect()),
        );
    }
    substituted
}

/// Keep board words only, in board spelling, without repeats, at most `n`
fn filter_guesses(guesses: &[String], board: &[String], n: usize) -> Vec<String> {
    let mut kept: Vec<String> = Vec::with_capacity(n);
    for guess in guesses {
        if kept.len() >= n {
            break;
        }
        let guess = guess.trim().trim_matches('"');
        let Some(word) = board.iter().find(|w| w.trim().eq_ignore_ascii_case(guess)) else {
            continue;
        };
        if !kept.contains(word) {
            kept.push(word.clone());
        }
    }
    kept
}

fn merge_guesses(payload: &mut Mapping, guesses: Vec<String>) {
    if let Some(prior) = payload.remove(GUESS_FIELD) {
        let target = free_key(payload, ARBITRATION_GUESS_FIELD);
        tracing::warn!(
            field = GUESS_FIELD,
            moved_to = %target,
            "arbitration output already had guesses"
        );
        payload.insert(target, prior);
    }
    payload.insert(
        GUESS_FIELD.to_string(),
        Value::Array(guesses.into_iter().map(Value::String).collect()),
    );
}

/// `base`, or `base_2`, `base_3`, ... when taken
fn free_key(payload: &Mapping, base: &str) -> String {
    if !payload.contains_key(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|key| !payload.contains_key(key))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openrouter::Message;
    use crate::pipeline::testing::{system_text, user_text, ScriptedPort};
    use crate::prompts;

    const TRIVIA_SWITCH: &str = r#"{"groups": [
        {"id": 1, "researcher": "Egyptologist", "thinker": "Poet"},
        {"id": 2, "researcher": "Archivist", "thinker": "Bard"},
        {"id": 3, "researcher": "Tour Guide", "thinker": "Novelist"}
    ], "decider": "Editor"}"#;

    const MERGED_ANSWERS: &str =
        r#"{"r1": ["Nile", "Ra", "Giza"], "r2": ["Nile", "Ra", "Saqqara"], "r3": ["Nile", "Amun", "Giza"]}"#;

    fn trivia_item() -> TaskItem {
        TaskItem::trivia(
            "Ancient Egypt",
            vec![
                "Longest river?".to_string(),
                "Sun god?".to_string(),
                "Site of the Great Pyramid?".to_string(),
            ],
        )
    }

    fn trivia_reply(messages: &[Message], switch: &str, minimux: &str, failing_thinker: &str) -> Result<String> {
        let system = system_text(messages);
        let user = user_text(messages);
        if system == prompts::trivia::SWITCH_SYSTEM {
            Ok(switch.to_string())
        } else if user.contains("Answer as each of these researchers") {
            Ok(MERGED_ANSWERS.to_string())
        } else if user.contains("Answer each question in order") {
            Ok(r#"{"answers": ["Nile"]}"#.to_string())
        } else if user.contains("Propose a creative direction") {
            if system == failing_thinker {
                Err(Error::completion("connection reset"))
            } else {
                Ok(format!(r#"{{"creative_direction": "{} voice"}}"#, system))
            }
        } else if user.contains("You judge a trivia-and-story task") {
            Ok(minimux.to_string())
        } else {
            Err(Error::completion(format!("unexpected prompt: {}", user)))
        }
    }

    const GOOD_MINIMUX: &str = "```json\n{\"final_answers\": [\"Nile\", \"Ra\", \"Giza\"], \
\"final_story\": \"Along the Nile, Ra rose over Giza.\"}\n```";

    fn trivia_ports(switch: &'static str, minimux: &'static str, failing_thinker: &'static str) -> Arc<ScriptedPort> {
        Arc::new(ScriptedPort::new("gpt-4o-mini", move |m| {
            trivia_reply(m, switch, minimux, failing_thinker)
        }))
    }

    fn sequencer(port: &Arc<ScriptedPort>) -> Sequencer {
        Sequencer::builder().port(port.clone()).build().unwrap()
    }

    #[tokio::test]
    async fn test_recall_and_write_happy_path() {
        let port = trivia_ports(TRIVIA_SWITCH, GOOD_MINIMUX, "");
        let output = sequencer(&port).run("recall-and-write", &trivia_item()).await.unwrap();

        let answers = output.list("final_answers");
        assert_eq!(answers.len(), 3);
        assert_eq!(answers, vec!["Nile", "Ra", "Giza"]);
        assert!(!output.field("final_story").unwrap().is_empty());
        assert!(!output.degraded);

        assert_eq!(
            output.trace.stages(),
            vec!["switch", "researcher", "thinker.g1", "thinker.g2", "thinker.g3", "minimux"]
        );
        assert_eq!(output.groups[1].facts, vec!["Nile", "Ra", "Saqqara"]);
        assert_eq!(output.groups[2].proposal.as_deref(), Some("Novelist voice"));
        assert_eq!(output.switch.decider_text(), "Editor");
        assert_eq!(output.cost.calls, 6);
        assert_eq!(port.call_count(), 6);
    }

    #[tokio::test]
    async fn test_unparsable_switch_uses_fallback_groups() {
        let garbage = "I think a historian and a poet would be great here!";
        let port = trivia_ports(garbage, GOOD_MINIMUX, "");
        let output = sequencer(&port).run_task(TaskType::Trivia, &trivia_item()).await.unwrap();

        assert_eq!(output.switch.groups, default_groups(TaskType::Trivia));
        assert_eq!(output.groups.len(), 3);
        let switch = output.trace.get("switch").unwrap();
        assert_eq!(switch.raw, garbage);
        assert!(switch.annotations.contains(&TraceAnnotation::MalformedOutput));
        assert!(switch.annotations.contains(&TraceAnnotation::FallbackApplied {
            detail: "default persona groups".to_string()
        }));
        assert_eq!(output.groups[0].proposal.as_deref(), Some("Story Weaver voice"));
        assert_eq!(output.switch.decider, Some(default_decider(TaskType::Trivia)));
    }

    #[tokio::test]
    async fn test_thinker_failure_arbitrates_with_remaining_groups() {
        let port = trivia_ports(TRIVIA_SWITCH, GOOD_MINIMUX, "Bard");
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        let minimux_prompt = port
            .prompts()
            .into_iter()
            .find(|p| p.contains("You judge a trivia-and-story task"))
            .unwrap();
        assert!(minimux_prompt.contains("Poet voice"));
        assert!(minimux_prompt.contains("Novelist voice"));
        assert!(!minimux_prompt.contains("Bard"));
        assert!(minimux_prompt.contains("proposals from 2 of 3 groups"));

        assert!(!output.payload.is_empty());
        assert!(output.field("final_story").is_some());
        assert!(output.degraded);
        assert!(output.trace.get("thinker.g2").unwrap().is_failure());
        assert!(output.groups[1].failed);
        let minimux = output.trace.get("minimux").unwrap();
        assert!(minimux
            .annotations
            .contains(&TraceAnnotation::PartialGroupFailure { failed: vec![2] }));
    }

    #[tokio::test]
    async fn test_unparsable_minimux_keeps_raw_text() {
        let raw = "The answers are Nile, Ra and Giza, and the story is lost.";
        let port = trivia_ports(TRIVIA_SWITCH, raw, "");
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        assert_eq!(output.field("final_story").unwrap(), raw);
        assert_eq!(output.list("final_answers"), vec!["Nile", "Ra", "Giza"]);
    }

    #[tokio::test]
    async fn test_short_answer_list_is_completed() {
        let minimux = r#"{"final_answers": ["Nile", "unknown"], "final_story": "A river story."}"#;
        let port = trivia_ports(TRIVIA_SWITCH, minimux, "");
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert_eq!(output.list("final_answers"), vec!["Nile", "Ra", "Giza"]);
        let minimux = output.trace.get("minimux").unwrap();
        assert!(minimux.annotations.contains(&TraceAnnotation::FallbackApplied {
            detail: "final_answers completed from researcher consensus".to_string()
        }));
        assert!(output.degraded);
    }

    #[tokio::test]
    async fn test_switch_failure_degrades_to_default_groups() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if system_text(m) == prompts::trivia::SWITCH_SYSTEM {
                return Err(Error::completion("gateway timeout"));
            }
            trivia_reply(m, TRIVIA_SWITCH, GOOD_MINIMUX, "")
        }));
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        assert_eq!(output.switch.groups, default_groups(TaskType::Trivia));
        let switch = output.trace.get("switch").unwrap();
        assert!(switch.is_failure());
        assert!(switch.annotations.contains(&TraceAnnotation::FallbackApplied {
            detail: "default persona groups".to_string()
        }));
        assert_eq!(output.list("final_answers"), vec!["Nile", "Ra", "Giza"]);
    }

    #[tokio::test]
    async fn test_merged_research_failure_degrades() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if user_text(m).contains("Answer as each of these researchers") {
                return Err(Error::completion("quota exceeded"));
            }
            trivia_reply(m, TRIVIA_SWITCH, GOOD_MINIMUX, "")
        }));
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        assert!(output.trace.get("researcher").unwrap().is_failure());
        assert!(output.groups.iter().all(|g| g.facts.is_empty()));
        let minimux_prompt = port
            .prompts()
            .into_iter()
            .find(|p| p.contains("You judge a trivia-and-story task"))
            .unwrap();
        assert!(minimux_prompt.contains("research from 0 of 3"));
        assert_eq!(output.list("final_answers"), vec!["Nile", "Ra", "Giza"]);
    }

    #[tokio::test]
    async fn test_unparsable_research_and_missing_story_degrade() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if user_text(m).contains("Answer as each of these researchers") {
                return Ok("I refuse".to_string());
            }
            trivia_reply(m, TRIVIA_SWITCH, r#"{"final_answers": ["Nile"]}"#, "")
        }));
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        let research = output.trace.get("researcher").unwrap();
        assert!(research.annotations.contains(&TraceAnnotation::MalformedOutput));
        assert_eq!(output.field("final_story").unwrap(), "Poet voice");
        assert_eq!(output.list("final_answers"), vec!["Nile", "unknown", "unknown"]);
        let minimux = output.trace.get("minimux").unwrap();
        assert!(minimux.annotations.contains(&TraceAnnotation::FallbackApplied {
            detail: "final_story from group proposals".to_string()
        }));
    }

    #[tokio::test]
    async fn test_panicking_thinker_is_contained() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if system_text(m) == "Bard" {
                panic!("thinker crashed");
            }
            trivia_reply(m, TRIVIA_SWITCH, GOOD_MINIMUX, "")
        }));
        let output = sequencer(&port).run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        assert!(output.groups[1].failed);
        assert!(output.trace.get("thinker.g2").is_none());
        let aborted = output.trace.get("group.g2").unwrap();
        assert!(aborted.annotations.iter().any(|a| matches!(
            a,
            TraceAnnotation::TransportFailure { message } if message.contains("thinker crashed")
        )));
        assert!(output
            .trace
            .get("minimux")
            .unwrap()
            .annotations
            .contains(&TraceAnnotation::PartialGroupFailure { failed: vec![2] }));
        assert_eq!(output.groups[2].proposal.as_deref(), Some("Novelist voice"));
        assert!(output.field("final_story").is_some());
    }

    #[tokio::test]
    async fn test_panicking_researcher_uses_group_key() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if system_text(m) == "Archivist" {
                panic!("researcher crashed");
            }
            trivia_reply(m, TRIVIA_SWITCH, GOOD_MINIMUX, "")
        }));
        let sequencer = Sequencer::builder()
            .port(port.clone())
            .research_mode(ResearchMode::PerGroup)
            .build()
            .unwrap();
        let output = sequencer.run("trivia", &trivia_item()).await.unwrap();

        assert!(output.degraded);
        assert!(output.trace.get("group.g2").unwrap().is_failure());
        assert!(output.trace.get("researcher.g2").is_none());
        assert!(output.trace.get("thinker.g2").is_none());
        assert!(output.trace.get("thinker.g3").is_some());
    }

    #[tokio::test]
    async fn test_per_group_research_feeds_thinkers() {
        let port = trivia_ports(TRIVIA_SWITCH, GOOD_MINIMUX, "");
        let sequencer = Sequencer::builder()
            .port(port.clone())
            .research_mode(ResearchMode::PerGroup)
            .build()
            .unwrap();
        let output = sequencer.run("trivia", &trivia_item()).await.unwrap();

        assert!(output.trace.get("researcher").is_none());
        assert!(output.trace.get("researcher.g3").is_some());
        assert_eq!(output.groups[0].facts, vec!["Nile", "unknown", "unknown"]);
        let thinker_prompts: Vec<String> = port
            .prompts()
            .into_iter()
            .filter(|p| p.contains("Propose a creative direction"))
            .collect();
        assert_eq!(thinker_prompts.len(), 3);
        assert!(thinker_prompts.iter().all(|p| p.contains(FACTS_HEADING)));
        assert_eq!(port.call_count(), 8);
    }

    fn codenames_reply(messages: &[Message]) -> Result<String> {
        let system = system_text(messages);
        let user = user_text(messages);
        let reply = if system == prompts::codenames::SWITCH_SYSTEM {
            r#"{"spymaster_clue": "ocean", "groups": [
                {"group_id": 1, "researcher": {"persona": "Sailor"}, "thinker": {"persona": "Poet"}},
                {"group_id": 2, "researcher": {"persona": "Biologist"}, "thinker": {"persona": "Gamer"}}
            ], "decider": {"persona": "Captain"}}"#
        } else if user.contains("List words and ideas") {
            r#"{"associations": ["sea", "boat"]}"#
        } else if user.contains("Choose ONE clue word") {
            assert!(user.contains("Spymaster's first idea: ocean"));
            assert!(user.contains(FACTS_HEADING));
            r#"{"clue": "sea", "reasoning": "waves and ships"}"#
        } else if user.contains("Pick the final clue") {
            r#"{"final_clue": "sea", "guessed_words": ["tree"]}"#
        } else if system == prompts::codenames::GUESSER_SYSTEM {
            assert!(user.contains("Clue: sea"));
            r#"{"guessed_words": ["Wave", "moon", "SHIP", "wave", "car"]}"#
        } else {
            return Err(Error::completion("unexpected prompt"));
        };
        Ok(reply.to_string())
    }

    #[tokio::test]
    async fn test_word_link_guesses_are_filtered_and_merged() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", codenames_reply));
        let item = TaskItem::codenames(
            vec!["wave".into(), "ship".into()],
            vec!["wave".into(), "ship".into(), "car".into(), "tree".into()],
        );
        let output = sequencer(&port).run("word-link", &item).await.unwrap();

        assert_eq!(output.field("final_clue").unwrap(), "sea");
        assert_eq!(output.list(GUESS_FIELD), vec!["wave", "ship"]);
        assert_eq!(output.list(ARBITRATION_GUESS_FIELD), vec!["tree"]);
        assert_eq!(output.switch.extras["spymaster_clue"], "ocean");
        assert_eq!(
            output.trace.stages(),
            vec![
                "switch",
                "researcher.g1",
                "thinker.g1",
                "researcher.g2",
                "thinker.g2",
                "minimux",
                "guesser"
            ]
        );
        assert!(!output.degraded);
    }

    fn word_link_item() -> TaskItem {
        TaskItem::codenames(
            vec!["wave".into(), "ship".into()],
            vec!["wave".into(), "ship".into(), "car".into(), "tree".into()],
        )
    }

    #[tokio::test]
    async fn test_guesser_failure_degrades() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            if system_text(m) == prompts::codenames::GUESSER_SYSTEM {
                return Err(Error::completion("connection refused"));
            }
            codenames_reply(m)
        }));
        let output = sequencer(&port).run("word-link", &word_link_item()).await.unwrap();

        assert!(output.degraded);
        assert_eq!(output.field("final_clue").unwrap(), "sea");
        assert!(output.trace.get("guesser").unwrap().is_failure());
        assert!(output.list(GUESS_FIELD).is_empty());
        assert_eq!(output.list(ARBITRATION_GUESS_FIELD), vec!["tree"]);
    }

    #[tokio::test]
    async fn test_guesser_skipped_without_clue() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", |m| {
            let user = user_text(m);
            if system_text(m) == prompts::codenames::SWITCH_SYSTEM {
                Ok(r#"{"groups": [{"id": 1, "researcher": "Sailor", "thinker": "Poet"}], "decider": "Captain"}"#
                    .to_string())
            } else if user.contains("List words and ideas") {
                Ok(r#"{"associations": ["sea"]}"#.to_string())
            } else if user.contains("Pick the final clue") {
                Ok(r#"{"reasoning": "nothing fits"}"#.to_string())
            } else {
                Err(Error::completion("unavailable"))
            }
        }));
        let output = sequencer(&port).run("word-link", &word_link_item()).await.unwrap();

        assert!(output.degraded);
        assert!(output.field("final_clue").is_none());
        assert!(output.list(GUESS_FIELD).is_empty());
        assert!(output.payload.contains_key(GUESS_FIELD));
        let guesser = output.trace.get("guesser").unwrap();
        assert!(!guesser.is_failure());
        assert!(guesser.annotations.iter().any(|a| matches!(a, TraceAnnotation::Degraded { .. })));
        assert!(port.prompts().iter().all(|p| !p.contains("Pick exactly")));
    }

    fn logic_reply(messages: &[Message]) -> Result<String> {
        let system = system_text(messages);
        let user = user_text(messages);
        if system == prompts::logic::SWITCH_SYSTEM {
            return Ok("not json".to_string());
        }
        if user.contains("List every constraint") {
            return Ok("Alice is left of Bob.".to_string());
        }
        if user.contains("Solve the puzzle") {
            let answer = if system == "Deductive Solver" { "Bob" } else { "Alice" };
            return Ok(format!(r#"{{"answer": "{}", "reasoning": "by elimination"}}"#, answer));
        }
        Err(Error::completion("arbiter unavailable"))
    }

    #[tokio::test]
    async fn test_failed_arbitration_degrades_to_majority() {
        let port = Arc::new(ScriptedPort::new("gpt-4o-mini", logic_reply));
        let item = TaskItem::logic("Alice and Bob sit in a row. Who sits first?");
        let output = sequencer(&port).run("constraint-puzzle", &item).await.unwrap();

        assert!(output.degraded);
        assert_eq!(output.field("final_answer").unwrap(), "Alice");
        assert_eq!(output.groups[0].facts, vec!["Alice is left of Bob."]);
        let minimux = output.trace.get("minimux").unwrap();
        assert!(minimux.is_failure());
        assert!(minimux.annotations.iter().any(|a| matches!(a, TraceAnnotation::Degraded { .. })));
    }

    #[tokio::test]
    async fn test_configuration_errors_precede_any_call() {
        let port = trivia_ports(TRIVIA_SWITCH, GOOD_MINIMUX, "");
        let sequencer = sequencer(&port);

        let err = sequencer.run("chess", &trivia_item()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTask(_)));

        let err = sequencer.run("trivia", &TaskItem::trivia("Egypt", vec![])).await.unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));
        assert_eq!(port.call_count(), 0);
    }

    #[test]
    fn test_builder_requires_ports() {
        let err = Sequencer::builder().build().unwrap_err();
        assert!(err.is_configuration());

        let port: Arc<dyn CompletionPort> = Arc::new(ScriptedPort::new("m", |_| Ok(String::new())));
        assert!(Sequencer::builder().arbiter_port(port).build().is_err());
    }

    #[test]
    fn test_merge_guesses_keeps_prior_fields() {
        let mut payload = Mapping::new();
        payload.insert(GUESS_FIELD.to_string(), serde_json::json!(["a"]));
        payload.insert(ARBITRATION_GUESS_FIELD.to_string(), serde_json::json!(["b"]));

        merge_guesses(&mut payload, vec!["c".to_string()]);

        assert_eq!(payload[GUESS_FIELD], serde_json::json!(["c"]));
        assert_eq!(payload[ARBITRATION_GUESS_FIELD], serde_json::json!(["b"]));
        assert_eq!(payload["arbitration_guessed_words_2"], serde_json::json!(["a"]));
    }

    #[test]
    fn test_filter_guesses() {
        let board: Vec<String> = ["Apple", "pear", "fig"].iter().map(|s| s.to_string()).collect();
        let guesses: Vec<String> = ["apple", "kiwi", "\"PEAR\"", "Apple", "fig"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(filter_guesses(&guesses, &board, 2), vec!["Apple", "pear"]);
        assert!(filter_guesses(&guesses, &board, 0).is_empty());
    }
}
