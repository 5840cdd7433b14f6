//! `Rule<I>` + `Pipeline<I>` — §4.10. Rules enrich a shared mutable carrier
//! so downstream rules can skip re-fetching; a rule that needs an enrichment
//! it doesn't have must report `NoIssue`, never fail.

pub mod cts_rules;

use async_trait::async_trait;
use futures::FutureExt;

#[derive(Debug, Clone)]
pub struct RuleResult {
    pub has_issue: bool,
    pub issue_code: Option<String>,
    pub context_data: Option<bson::Document>,
}

impl RuleResult {
    pub fn no_issue() -> Self {
        Self { has_issue: false, issue_code: None, context_data: None }
    }

    pub fn issue(code: impl Into<String>, context_data: Option<bson::Document>) -> Self {
        Self { has_issue: true, issue_code: Some(code.into()), context_data }
    }
}

#[async_trait]
pub trait Rule<I: Send + Sync>: Send + Sync {
    fn code(&self) -> &str;

    /// Never returns `Err` to the pipeline: any internal failure is caught
    /// and reported as a `Failed` step result instead (see `PipelineStep`).
    async fn execute(&self, input: &mut I, ctx: &crate::query::cache::AnalysisContext) -> RuleResult;
}

pub enum Continuation {
    StopOnIssue,
    ContinueAlways,
    /// Stops when the predicate over the step's `RuleResult` returns `true`.
    StopWhen(Box<dyn Fn(&RuleResult) -> bool + Send + Sync>),
}

pub struct PipelineStep {
    pub rule_code: String,
    pub result: Result<RuleResult, String>,
    pub stop_processing: bool,
}

pub struct Pipeline<I: Send + Sync> {
    steps: Vec<(Box<dyn Rule<I>>, Continuation)>,
}

impl<I: Send + Sync> Pipeline<I> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn add(mut self, rule: Box<dyn Rule<I>>, continuation: Continuation) -> Self {
        self.steps.push((rule, continuation));
        self
    }

    pub async fn run(&self, input: &mut I, ctx: &crate::query::cache::AnalysisContext) -> Vec<PipelineStep> {
        let mut out = Vec::with_capacity(self.steps.len());

        for (rule, continuation) in &self.steps {
            let result = std::panic::AssertUnwindSafe(rule.execute(input, ctx)).catch_unwind().await;
            let (result, has_issue) = match result {
                Ok(r) => {
                    let has_issue = r.has_issue;
                    (Ok(r), has_issue)
                }
                Err(_) => (Err(format!("rule {} panicked", rule.code())), false),
            };

            let stop_processing = match continuation {
                Continuation::StopOnIssue => has_issue || result.is_err(),
                Continuation::ContinueAlways => false,
                Continuation::StopWhen(pred) => result.as_ref().map(pred.as_ref()).unwrap_or(true),
            };

            out.push(PipelineStep { rule_code: rule.code().to_string(), result, stop_processing });

            if stop_processing {
                break;
            }
        }

        out
    }
}

impl<I: Send + Sync> Default for Pipeline<I> {
    fn default() -> Self {
        Self::new()
    }
}
