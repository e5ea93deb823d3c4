//! Prompts for the analysis assistant and the planner

use serde_json::json;

use crate::llm::{ChatMessage, Role};

/// Markers a planner uses to end a run. The Chinese forms are the canonical
/// ones; the English forms are accepted too.
pub const TASK_COMPLETE_MARKER: &str = "任务已完成";
pub const TASK_FAILED_MARKER: &str = "任务无法完成";
pub const COMPLETION_MARKERS: [&str; 4] = [
    TASK_COMPLETE_MARKER,
    TASK_FAILED_MARKER,
    "TASK COMPLETE",
    "TASK FAILED",
];

/// Default system prompt for the single agent and the executor
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a data analysis assistant working inside the user's workspace.

Your tools:
- read_directory: list the files in the workspace (name, kind, size, modification time)
- read_files: read the contents of one or more files
- exec_code: run Python in a persistent interpreter; variables survive between calls
- install_package: pip install a missing package

Work like this:
- Look at the data with read_directory and read_files before analysing it
- Do the analysis, processing and plotting with exec_code
- If reading a file fails, try another encoding before giving up
- Print intermediate results so you can check the code did what you expected
- Label axes and give every chart a title; figures are captured automatically
- Save generated results under a `results` directory in the workspace
- If code fails, read the traceback and fix it

Present key findings as Markdown tables and finish with a short summary of
method, sample size and conclusions. Ask the user when the data contradicts
itself, when business context is needed, or when you find personal data."#;

/// System prompt for the planner role
pub const PLANNER_SYSTEM_PROMPT: &str =
    "You are a planning agent. You never call tools yourself; you decide what the tool agent should do next.";

const PLANNER_TEMPLATE: &str = r#"You are a user agent helping me reach a goal.
My goal: [{goal}]
History of the tool agent: [{history}]

A tool agent exists in the system. Do not carry out the task yourself: refine and break
down my goal into an action plan for the tool agent.
Tools available to the tool agent:
- exec_code: execute Python code
- read_directory: list a directory
- read_files: read file contents
- install_package: install a Python package

If the history shows that my goal has been reached, say '任务已完成' explicitly and summarise the result.
Otherwise give the next action plan with a clear objective and concrete steps. Write the plan in the
second person. Do not fix concrete parameters; leave the tool agent room to decide.
If the goal cannot be reached for some reason, say '任务无法完成' explicitly and explain why.
Important: do not over-extend and do not chase perfection. My time is valuable."#;

/// Render the planner's prompt from the goal and the executor's transcript
///
/// Only user and assistant turns are shown, as `{role, content}` JSON.
pub fn render_planner_prompt(goal: &str, executor_transcript: &[ChatMessage]) -> String {
    let history: Vec<_> = executor_transcript
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    let history = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());

    fill(PLANNER_TEMPLATE, &[("{goal}", goal), ("{history}", &history)])
}

/// Substitute placeholders in one pass over `template`; inserted values are
/// never scanned again
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some((at, key, value)) = values
        .iter()
        .filter_map(|&(key, value)| rest.find(key).map(|at| (at, key, value)))
        .min_by_key(|&(at, _, _)| at)
    {
        out.push_str(&rest[..at]);
        out.push_str(value);
        rest = &rest[at + key.len()..];
    }
    out.push_str(rest);
    out
}

pub fn contains_completion_marker(text: &str) -> bool {
    COMPLETION_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Final answer when the round cap is reached without a marker
pub fn max_rounds_fallback(max_rounds: usize, last_response: &str) -> String {
    format!("已达到最大循环次数({max_rounds})，当前执行结果:\n{last_response}")
}
