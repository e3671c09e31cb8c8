//! Declarative workflows loaded from TOML.
//!
//! ```toml
//! name = "review"
//!
//! [[units]]
//! type = "text"
//! name = "draft"
//! template = "Draft for: {input}"
//!
//! [[units]]
//! type = "condition"
//! name = "long_only"
//! when = "len(input) > 10"
//!
//! [[units.units]]
//! type = "shell"
//! name = "shout"
//! command = "tr a-z A-Z"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::types::StepResult;

use crate::condition::Condition;
use crate::context::StepContext;
use crate::expr::{context_value, Expr};
use crate::loop_step::{Loop, DEFAULT_MAX_ITERATIONS};
use crate::parallel::Parallel;
use crate::router::Router;
use crate::step::Step;
use crate::steps::Steps;
use crate::unit::UnitRef;
use crate::workflow::{Workflow, WorkflowBuilder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Initial session state.
    #[serde(default)]
    pub state: Map<String, Value>,
    pub units: Vec<UnitDef>,
}

/// Settings shared by atomic units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtomicOptions {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retries: usize,
    /// Halt the run when this unit fails.
    #[serde(default)]
    pub halt_on_failure: bool,
    /// Halt the run when this expression holds. `output` is the unit's own content.
    #[serde(default)]
    pub halt_when: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitDef {
    /// Render a template. `{input}`, `{previous}` and `{all_previous}` are substituted.
    Text {
        name: String,
        template: String,
        #[serde(flatten)]
        options: AtomicOptions,
    },
    /// Run `sh -c command` with the previous content on stdin and the
    /// workflow input in `FLOWLINE_INPUT`. Non-zero exit is a failure.
    Shell {
        name: String,
        command: String,
        #[serde(flatten)]
        options: AtomicOptions,
    },
    Steps {
        name: String,
        #[serde(default)]
        description: Option<String>,
        units: Vec<UnitDef>,
    },
    Parallel {
        name: String,
        #[serde(default)]
        description: Option<String>,
        units: Vec<UnitDef>,
    },
    Loop {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default = "default_max_iterations")]
        max_iterations: usize,
        /// End condition over each iteration's results.
        #[serde(default)]
        until: Option<String>,
        units: Vec<UnitDef>,
    },
    Condition {
        name: String,
        #[serde(default)]
        description: Option<String>,
        when: String,
        units: Vec<UnitDef>,
    },
    Router {
        name: String,
        #[serde(default)]
        description: Option<String>,
        /// Checked in order; the first match selects.
        #[serde(default)]
        routes: Vec<RouteDef>,
        /// Selection when no route matches.
        #[serde(default)]
        default: Vec<String>,
        units: Vec<UnitDef>,
    },
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    pub when: String,
    pub select: Vec<String>,
}

impl UnitDef {
    pub fn name(&self) -> &str {
        match self {
            UnitDef::Text { name, .. }
            | UnitDef::Shell { name, .. }
            | UnitDef::Steps { name, .. }
            | UnitDef::Parallel { name, .. }
            | UnitDef::Loop { name, .. }
            | UnitDef::Condition { name, .. }
            | UnitDef::Router { name, .. } => name,
        }
    }

    /// Build the executable unit, parsing every expression up front.
    pub fn build(&self) -> Result<UnitRef> {
        match self {
            UnitDef::Text {
                name,
                template,
                options,
            } => {
                let template = template.clone();
                let halt_when = parse_opt(options.halt_when.as_deref())?;
                let step = Step::from_fn(name.clone(), move |ctx: StepContext| {
                    let result = StepResult::new(render(&template, &ctx));
                    let result = gate(result, &ctx, halt_when.as_ref());
                    async move { Ok(result) }
                });
                Ok(apply_options(step, options).into())
            }
            UnitDef::Shell {
                name,
                command,
                options,
            } => {
                let command = Arc::new(command.clone());
                let halt_when = parse_opt(options.halt_when.as_deref())?;
                let step = Step::from_fn(name.clone(), move |ctx: StepContext| {
                    let command = Arc::clone(&command);
                    let halt_when = halt_when.clone();
                    async move {
                        let result = run_shell(&command, &ctx).await?;
                        Ok(gate(result, &ctx, halt_when.as_ref()))
                    }
                });
                Ok(apply_options(step, options).into())
            }
            UnitDef::Steps {
                name,
                description,
                units,
            } => {
                let mut steps = Steps::new(name.clone(), build_all(units)?);
                if let Some(d) = description {
                    steps = steps.with_description(d.clone());
                }
                Ok(steps.into())
            }
            UnitDef::Parallel {
                name,
                description,
                units,
            } => {
                let mut parallel = Parallel::new(name.clone(), build_all(units)?);
                if let Some(d) = description {
                    parallel = parallel.with_description(d.clone());
                }
                Ok(parallel.into())
            }
            UnitDef::Loop {
                name,
                description,
                max_iterations,
                until,
                units,
            } => {
                let mut l = Loop::new(name.clone(), build_all(units)?)
                    .with_max_iterations(*max_iterations);
                if let Some(expr) = parse_opt(until.as_deref())? {
                    l = l.with_end_condition(move |results| expr.evaluate_results(results));
                }
                if let Some(d) = description {
                    l = l.with_description(d.clone());
                }
                Ok(l.into())
            }
            UnitDef::Condition {
                name,
                description,
                when,
                units,
            } => {
                let expr = Expr::parse(when)?;
                let mut condition = Condition::new(
                    name.clone(),
                    move |ctx: &StepContext| expr.evaluate_context(ctx),
                    build_all(units)?,
                );
                if let Some(d) = description {
                    condition = condition.with_description(d.clone());
                }
                Ok(condition.into())
            }
            UnitDef::Router {
                name,
                description,
                routes,
                default,
                units,
            } => {
                let declared: HashSet<&str> = units.iter().map(UnitDef::name).collect();
                let selections = routes
                    .iter()
                    .map(|r| &r.select)
                    .chain(std::iter::once(default));
                for selection in selections {
                    if let Some(missing) = selection.iter().find(|s| !declared.contains(s.as_str())) {
                        return Err(FlowlineError::InvalidWorkflow(format!(
                            "router '{}' routes to '{}', which is not one of its units",
                            name, missing
                        )));
                    }
                }

                let routes: Vec<(Expr, Vec<String>)> = routes
                    .iter()
                    .map(|r| Ok((Expr::parse(&r.when)?, r.select.clone())))
                    .collect::<Result<_>>()?;
                let fallback = default.clone();
                let mut router = Router::new(
                    name.clone(),
                    move |ctx: &StepContext| {
                        routes
                            .iter()
                            .find(|(expr, _)| expr.evaluate_context(ctx))
                            .map(|(_, select)| select.clone())
                            .unwrap_or_else(|| fallback.clone())
                    },
                    build_all(units)?,
                );
                if let Some(d) = description {
                    router = router.with_description(d.clone());
                }
                Ok(router.into())
            }
        }
    }
}

impl WorkflowDef {
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| FlowlineError::InvalidWorkflow(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
    }

    /// A builder with this definition's identity, state and units.
    pub fn builder(&self) -> Result<WorkflowBuilder> {
        let mut builder = Workflow::builder(self.name.clone())
            .initial_state(self.state.clone())
            .units(build_all(&self.units)?);
        if let Some(id) = &self.workflow_id {
            builder = builder.workflow_id(id.clone());
        }
        if let Some(d) = &self.description {
            builder = builder.description(d.clone());
        }
        Ok(builder)
    }
}

fn build_all(defs: &[UnitDef]) -> Result<Vec<UnitRef>> {
    defs.iter().map(UnitDef::build).collect()
}

fn parse_opt(source: Option<&str>) -> Result<Option<Expr>> {
    source.map(Expr::parse).transpose()
}

fn apply_options(mut step: Step, options: &AtomicOptions) -> Step {
    if let Some(d) = &options.description {
        step = step.with_description(d.clone());
    }
    if options.retries > 0 {
        step = step.with_retries(options.retries);
    }
    if options.halt_on_failure {
        step = step.halt_on_failure();
    }
    step
}

/// Substitute placeholders in one pass, so substituted text is never rescanned.
fn render(template: &str, ctx: &StepContext) -> String {
    let input = ctx.input_text();
    let previous = ctx
        .previous_content()
        .map(|c| c.to_text())
        .unwrap_or_else(|| input.clone());
    let all_previous = ctx.get_all_previous_content();
    let placeholders = [
        ("{all_previous}", all_previous.as_str()),
        ("{previous}", previous.as_str()),
        ("{input}", input.as_str()),
    ];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match placeholders.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Set `halt` when the expression holds for this result.
fn gate(mut result: StepResult, ctx: &StepContext, halt_when: Option<&Expr>) -> StepResult {
    if let Some(expr) = halt_when {
        let output = result.content.to_text();
        let holds = expr.evaluate(&|key: &str| {
            if key == "output" {
                Some(output.clone())
            } else {
                context_value(ctx, key)
            }
        });
        if holds {
            debug!(expr = %expr, "Halt expression matched");
            result.halt = true;
        }
    }
    result
}

async fn run_shell(command: &str, ctx: &StepContext) -> Result<StepResult> {
    let stdin_text = ctx.collaborator_input().to_text();
    let mut child = tokio::process::Command::new("sh")
        .args(["-c", command])
        .env("FLOWLINE_INPUT", ctx.input_text())
        .env("FLOWLINE_SESSION_ID", ctx.session_id())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // Written from a separate task so a chatty command cannot deadlock on a full pipe.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(stdin_text.as_bytes()).await {
                debug!(error = %e, "Command closed stdin early");
            }
        });
    }

    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    if output.status.success() {
        return Ok(StepResult::new(stdout));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Ok(StepResult::failure(format!(
        "command exited with {}: {}",
        code,
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::state::SessionState;
    use flowline_core::types::{Content, UnitKind, WorkflowInput};

    use crate::workflow::RunOptions;

    const FULL: &str = r#"
name = "everything"
workflow_id = "wf-everything"

[state]
mode = "strict"

[[units]]
type = "text"
name = "draft"
template = "draft({input})"

[[units]]
type = "parallel"
name = "fan"

[[units.units]]
type = "text"
name = "left"
template = "L:{previous}"

[[units.units]]
type = "text"
name = "right"
template = "R:{previous}"

[[units]]
type = "loop"
name = "polish"
max_iterations = 5
until = 'previous contains "++"'

[[units.units]]
type = "text"
name = "pass"
template = "{previous}+"

[[units]]
type = "router"
name = "route"
default = ["plain"]

[[units.routes]]
when = 'state.mode == "strict"'
select = ["strict"]

[[units.units]]
type = "text"
name = "strict"
template = "strict"

[[units.units]]
type = "text"
name = "plain"
template = "plain"
"#;

    #[test]
    fn test_parse_all_kinds() {
        let def = WorkflowDef::from_toml(FULL).unwrap();
        assert_eq!(def.units.len(), 4);
        assert_eq!(def.state["mode"], "strict");
        match &def.units[2] {
            UnitDef::Loop { max_iterations, until, .. } => {
                assert_eq!(*max_iterations, 5);
                assert!(until.is_some());
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[test]
    fn test_loop_max_iterations_defaults() {
        let src = r#"
name = "looping"

[[units]]
type = "loop"
name = "again"

[[units.units]]
type = "text"
name = "pass"
template = "{previous}"
"#;
        let def = WorkflowDef::from_toml(src).unwrap();
        match &def.units[0] {
            UnitDef::Loop { max_iterations, .. } => {
                assert_eq!(*max_iterations, DEFAULT_MAX_ITERATIONS)
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_and_run_full_definition() {
        let wf = WorkflowDef::from_toml(FULL).unwrap().builder().unwrap().build().unwrap();
        assert_eq!(wf.workflow_id(), "wf-everything");
        let resp = wf.run("x", RunOptions::new()).await.unwrap();

        assert_eq!(
            resp.executed_step_names(),
            vec!["draft", "left", "right", "pass", "pass", "strict"]
        );
        let polish = &resp.unit_results[2];
        assert_eq!(polish.kind, UnitKind::Loop);
        assert_eq!(polish.children.len(), 2);
        assert_eq!(resp.content, Some(Content::text("strict")));
    }

    #[test]
    fn test_router_routes_must_name_declared_units() {
        let src = r#"
name = "bad"

[[units]]
type = "router"
name = "r"
default = ["ghost"]

[[units.units]]
type = "text"
name = "real"
template = "x"
"#;
        let err = WorkflowDef::from_toml(src).unwrap().builder().err().unwrap();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_bad_expression_fails_at_build() {
        let src = r#"
name = "bad"

[[units]]
type = "condition"
name = "c"
when = "len(input) > lots"

[[units.units]]
type = "text"
name = "t"
template = "x"
"#;
        assert!(WorkflowDef::from_toml(src).unwrap().builder().is_err());
    }

    #[test]
    fn test_render_placeholders() {
        let mut ctx = StepContext::new(WorkflowInput::new("in"), SessionState::new(), "s", None);
        assert_eq!(render("{input}/{previous}", &ctx), "in/in");
        ctx.record(&StepResult::new("p").with_name("a"));
        assert_eq!(render("{input}/{previous}", &ctx), "in/p");
        assert_eq!(render("[{all_previous}]", &ctx), "[=== a ===\np]");
    }

    #[test]
    fn test_render_does_not_rescan_substituted_text() {
        let mut ctx = StepContext::new(WorkflowInput::new("in"), SessionState::new(), "s", None);
        ctx.record(&StepResult::new("literal {input} {x").with_name("a"));
        assert_eq!(render("{previous} / {input} {other}", &ctx), "literal {input} {x / in {other}");
    }

    #[tokio::test]
    async fn test_halt_when_uses_output() {
        let src = r#"
name = "gated"

[[units]]
type = "text"
name = "check"
template = "verdict: REJECT"
halt_when = 'output contains "REJECT"'

[[units]]
type = "text"
name = "after"
template = "unreachable"
"#;
        let wf = WorkflowDef::from_toml(src).unwrap().builder().unwrap().build().unwrap();
        let resp = wf.run("x", RunOptions::new()).await.unwrap();
        assert!(resp.is_halted());
        assert_eq!(resp.executed_step_names(), vec!["check"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_step_reads_stdin_and_env() {
        let src = r#"
name = "shell"

[[units]]
type = "shell"
name = "upper"
command = "tr a-z A-Z"

[[units]]
type = "shell"
name = "env"
command = 'printf "%s" "$FLOWLINE_INPUT"'

[[units]]
type = "shell"
name = "fails"
command = "echo broken >&2; exit 3"
"#;
        let wf = WorkflowDef::from_toml(src).unwrap().builder().unwrap().build().unwrap();
        let resp = wf.run("hello", RunOptions::new()).await.unwrap();
        assert_eq!(resp.step_results[0].content, Content::text("HELLO"));
        assert_eq!(resp.step_results[1].content, Content::text("hello"));
        let failed = &resp.step_results[2];
        assert!(!failed.success);
        assert!(failed.content.to_text().contains("exited with 3"));
        assert!(failed.content.to_text().contains("broken"));
    }
}
