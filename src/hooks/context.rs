//! Context injected with each task: the task itself, its plan, finished
//! dependencies and the most relevant memory, fitted greedily into a
//! character budget.

use serde::Serialize;
use tracing::warn;

use crate::knowledge::KnowledgeService;
use crate::plan::{Plan, PlanProgress, Task};
use crate::retrieval::ResultNode;

const ITEM_CHARS: usize = 240;

#[derive(Debug, Clone, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub chars_budget: usize,
    pub chars_used: usize,
    pub memory_selected: usize,
    pub memory_dropped: usize,
}

fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

fn task_section(task: &Task) -> String {
    let mut out = format!("## Current task: {}\n", task.title);
    if !task.description.trim().is_empty() {
        out.push_str(task.description.trim());
        out.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for c in &task.acceptance_criteria {
            out.push_str(&format!("- {c}\n"));
        }
    }
    out.push_str(&format!(
        "\nTask id: {} (priority {}, {} complexity)\n",
        task.id, task.priority, task.complexity
    ));
    out
}

fn plan_section(plan: &Plan, progress: &PlanProgress) -> String {
    format!(
        "## Plan\nGoal: {}\nProgress: {}/{} tasks completed\n",
        plan.goal, progress.completed, progress.total
    )
}

fn deps_section(deps: &[Task]) -> Option<String> {
    if deps.is_empty() {
        return None;
    }
    let mut out = String::from("## Builds on\n");
    for d in deps {
        let first = d.description.lines().next().unwrap_or_default();
        if first.trim().is_empty() {
            out.push_str(&format!("- {} ({})\n", d.title, d.status));
        } else {
            out.push_str(&format!("- {} ({}): {}\n", d.title, d.status, clip(first, ITEM_CHARS)));
        }
    }
    Some(out)
}

fn memory_line(node: &ResultNode) -> String {
    let detail = if node.summary.trim().is_empty() {
        node.snippet.as_deref().unwrap_or_default()
    } else {
        node.summary.as_str()
    };
    if detail.trim().is_empty() {
        format!("- [{}] {} ({})\n", node.node_type, node.title, node.node_id)
    } else {
        format!(
            "- [{}] {}: {} ({})\n",
            node.node_type,
            node.title,
            clip(detail, ITEM_CHARS),
            node.node_id
        )
    }
}

/// Top-`k` memory for the task. Search failures only cost the recall.
pub fn recall(svc: &KnowledgeService, task: &Task, k: usize) -> Vec<ResultNode> {
    if k == 0 {
        return Vec::new();
    }
    let query = format!("{} {}", task.title, task.description);
    let mut opts = svc.search_options();
    opts.limit = k;
    match svc.search(&query, &opts) {
        Ok(resp) => resp.results,
        Err(e) => {
            warn!(task = %task.id, "memory recall skipped: {e:#}");
            Vec::new()
        }
    }
}

/// Task and plan always go in (the task clipped to the budget if it must be);
/// dependencies next, then memory items in rank order while they fit.
pub fn assemble(
    task: &Task,
    plan: &Plan,
    progress: &PlanProgress,
    deps: &[Task],
    memory: &[ResultNode],
    chars_budget: usize,
) -> AssembledContext {
    let mut text = clip(&task_section(task), chars_budget);
    let push = |text: &mut String, section: &str| -> bool {
        if text.chars().count() + 1 + section.chars().count() > chars_budget {
            return false;
        }
        text.push('\n');
        text.push_str(section);
        true
    };

    push(&mut text, &plan_section(plan, progress));
    if let Some(section) = deps_section(deps) {
        push(&mut text, &section);
    }

    let mut selected = 0;
    let mut dropped = 0;
    if !memory.is_empty() && push(&mut text, "## Related project memory\n") {
        for node in memory {
            let line = memory_line(node);
            if text.chars().count() + line.chars().count() <= chars_budget {
                text.push_str(&line);
                selected += 1;
            } else {
                dropped += 1;
            }
        }
    } else {
        dropped = memory.len();
    }

    AssembledContext {
        chars_used: text.chars().count(),
        text,
        chars_budget,
        memory_selected: selected,
        memory_dropped: dropped,
    }
}
