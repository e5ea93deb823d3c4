//! Prometheus metrics for agent and execution observability
//!
//! All metrics live in the default registry so they can be scraped or dumped
//! with [`gather_text`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Agent tasks by mode and outcome.
    ///
    /// Labels:
    /// - mode: "single" or "dual"
    /// - outcome: "success", "exhausted", "error"
    pub static ref AGENT_TASKS: CounterVec = register_counter_vec!(
        "codevisor_agent_tasks_total",
        "Agent tasks by mode and outcome",
        &["mode", "outcome"]
    ).expect("failed to register AGENT_TASKS metric");

    /// Tool invocations by tool name and envelope status.
    pub static ref AGENT_TOOL_CALLS: CounterVec = register_counter_vec!(
        "codevisor_agent_tool_calls_total",
        "Tool invocations by tool and result status",
        &["tool", "status"]
    ).expect("failed to register AGENT_TOOL_CALLS metric");

    /// Duration of chat completion calls, by model.
    pub static ref LLM_CALL_TIME: HistogramVec = register_histogram_vec!(
        "codevisor_llm_call_duration_seconds",
        "Duration of LLM chat completion calls",
        &["model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register LLM_CALL_TIME metric");

    /// Executor rounds used by a plan/act/observe run.
    pub static ref REACT_ROUNDS: Histogram = register_histogram!(
        "codevisor_react_rounds",
        "Executor rounds per dual-agent run",
        vec![1.0, 2.0, 3.0, 4.0, 5.0]
    ).expect("failed to register REACT_ROUNDS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions by terminal status.
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "codevisor_code_executions_total",
        "Code executions by terminal status",
        &["status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    /// Wall-clock time from submission to settle.
    pub static ref CODE_EXECUTION_DURATION: Histogram = register_histogram!(
        "codevisor_code_execution_duration_seconds",
        "Duration of code executions",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    /// Kernel start attempts by interpreter and outcome.
    pub static ref KERNEL_STARTS: CounterVec = register_counter_vec!(
        "codevisor_kernel_starts_total",
        "Kernel start attempts by interpreter and outcome",
        &["interpreter", "outcome"]
    ).expect("failed to register KERNEL_STARTS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        CODE_EXECUTIONS.with_label_values(&["completed"]).inc();
        let text = gather_text();
        assert!(text.contains("codevisor_code_executions_total"));
    }
}
