//! Plans and tasks: storage, state machines and scheduling.
//!
//! Plan: `draft → active ↔ archived`, `active → completed`.
//! Task: `pending → in_progress → {completed, blocked}`, `blocked → pending`,
//! anything → `cancelled`. A task starts only when its dependencies are
//! completed, and the dependency graph of a plan stays acyclic.

pub mod dag;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::error::MemoryError;
use crate::memory::graph::find_path;
use crate::memory::model::tagged_enum;
use crate::memory::{from_json, new_id, storage_err, to_json};
pub use dag::DagCheck;

/// Longest dependency chain followed when checking for cycles.
const MAX_CHAIN: usize = 256;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Completed,
    Archived,
}

tagged_enum!(PlanStatus, "plan status", {
    Draft => "draft",
    Active => "active",
    Completed => "completed",
    Archived => "archived",
});

impl PlanStatus {
    pub fn can_become(self, to: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, to),
            (Draft, Active) | (Active, Archived) | (Archived, Active) | (Active, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

tagged_enum!(TaskStatus, "task status", {
    Pending => "pending",
    InProgress => "in_progress",
    Blocked => "blocked",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    pub fn can_become(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Blocked) | (Blocked, Pending) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

tagged_enum!(Complexity, "complexity", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub workspace_id: String,
    pub goal: String,
    pub enriched_goal: String,
    pub status: PlanStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub complexity: Complexity,
    pub priority: i64,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<String>,
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub workspace_id: String,
    pub goal: String,
    pub enriched_goal: String,
}

impl NewPlan {
    pub fn for_goal(workspace_id: &str, goal: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            goal: goal.to_string(),
            enriched_goal: String::new(),
        }
    }
}

/// A task in a create request. `temp_id`, `dependencies` and `parent` are
/// request-local names, resolved to stored ids on insert.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub temp_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub complexity: Complexity,
    pub priority: i64,
    pub dependencies: Vec<String>,
    pub parent: Option<String>,
}

impl NewTask {
    pub fn new(temp_id: &str, title: &str) -> Self {
        Self {
            temp_id: temp_id.to_string(),
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.dependencies.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl PlanProgress {
    /// Cancelled tasks count as done.
    pub fn is_finished(&self) -> bool {
        self.completed + self.cancelled == self.total
    }

    pub fn percent(&self) -> f64 {
        let live = self.total - self.cancelled;
        if live == 0 {
            return 100.0;
        }
        self.completed as f64 / live as f64 * 100.0
    }
}

// ── Rows ────────────────────────────────────────────────────────────────────

const PLAN_COLUMNS: &str = "id, workspace_id, goal, enriched_goal, status, created_at, updated_at";
const TASK_COLUMNS: &str = "id, plan_id, title, description, acceptance_criteria, complexity, priority, \
                            status, parent_id, created_at, updated_at, completed_at";

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<Plan> {
    let status: String = row.get(4)?;
    Ok(Plan {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        goal: row.get(2)?,
        enriched_goal: row.get(3)?,
        status: PlanStatus::parse(&status).unwrap_or(PlanStatus::Draft),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let criteria: String = row.get(4)?;
    let complexity: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        acceptance_criteria: from_json(&criteria),
        complexity: Complexity::parse(&complexity).unwrap_or_default(),
        priority: row.get(6)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        dependencies: BTreeSet::new(),
        parent_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn task_deps(conn: &Connection, task_id: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare("SELECT depends_on FROM task_dep WHERE task_id = ?1")
        .map_err(storage_err)?;
    let deps = stmt
        .query_map(params![task_id], |r| r.get::<_, String>(0))
        .map_err(storage_err)?
        .collect::<rusqlite::Result<BTreeSet<_>>>()
        .map_err(storage_err)?;
    Ok(deps)
}

// ── Plans ───────────────────────────────────────────────────────────────────

/// Insert a draft plan with its tasks. Dependencies are validated and the
/// graph checked for cycles before anything is written.
pub fn create_plan(conn: &Connection, now: i64, plan: NewPlan, tasks: Vec<NewTask>) -> Result<(Plan, Vec<Task>)> {
    if plan.goal.trim().is_empty() {
        return Err(MemoryError::validation("plan goal must not be empty").into());
    }

    let mut ids: HashMap<String, String> = HashMap::new();
    for t in &tasks {
        if t.title.trim().is_empty() {
            return Err(MemoryError::validation("task title must not be empty").into());
        }
        if ids.insert(t.temp_id.clone(), new_id()).is_some() {
            return Err(MemoryError::validation(format!("duplicate task id '{}' in plan request", t.temp_id)).into());
        }
    }
    let resolve = |temp: &str, of: &str| -> Result<String> {
        ids.get(temp)
            .cloned()
            .ok_or_else(|| MemoryError::validation(format!("task '{of}' references unknown task '{temp}'")).into())
    };

    let plan = Plan {
        id: new_id(),
        workspace_id: plan.workspace_id,
        goal: plan.goal.trim().to_string(),
        enriched_goal: plan.enriched_goal,
        status: PlanStatus::Draft,
        created_at: now,
        updated_at: now,
    };
    let mut stored = Vec::with_capacity(tasks.len());
    for t in tasks {
        let mut deps = BTreeSet::new();
        for d in &t.dependencies {
            if d == &t.temp_id {
                return Err(MemoryError::validation(format!("task '{}' cannot depend on itself", t.temp_id)).into());
            }
            deps.insert(resolve(d, &t.temp_id)?);
        }
        let parent_id = t.parent.as_deref().map(|p| resolve(p, &t.temp_id)).transpose()?;
        stored.push(Task {
            id: resolve(&t.temp_id, &t.temp_id)?,
            plan_id: plan.id.clone(),
            title: t.title.trim().to_string(),
            description: t.description,
            acceptance_criteria: t.acceptance_criteria,
            complexity: t.complexity,
            priority: t.priority,
            status: TaskStatus::Pending,
            dependencies: deps,
            parent_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        });
    }
    if let DagCheck::Cycle { path } = dag::topo_order(&dag::dep_map(&stored)) {
        return Err(MemoryError::CycleWould { path }.into());
    }

    conn.execute(
        &format!("INSERT INTO plan({PLAN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            plan.id,
            plan.workspace_id,
            plan.goal,
            plan.enriched_goal,
            plan.status.as_str(),
            plan.created_at,
            plan.updated_at,
        ],
    )
    .map_err(storage_err)
    .context("Failed to insert plan")?;
    // Parent links and dependencies once every row exists.
    for t in &stored {
        insert_task(conn, t)?;
    }
    for t in &stored {
        if t.parent_id.is_some() {
            conn.execute("UPDATE task SET parent_id = ?2 WHERE id = ?1", params![t.id, t.parent_id])
                .map_err(storage_err)?;
        }
        for d in &t.dependencies {
            conn.execute(
                "INSERT OR IGNORE INTO task_dep(task_id, depends_on) VALUES (?1, ?2)",
                params![t.id, d],
            )
            .map_err(storage_err)?;
        }
    }
    info!(plan = %plan.id, tasks = stored.len(), "plan created");
    Ok((plan, stored))
}

fn insert_task(conn: &Connection, t: &Task) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO task({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
        params![
            t.id,
            t.plan_id,
            t.title,
            t.description,
            to_json(&t.acceptance_criteria)?,
            t.complexity.as_str(),
            t.priority,
            t.status.as_str(),
            Option::<String>::None,
            t.created_at,
            t.updated_at,
            t.completed_at,
        ],
    )
    .map_err(storage_err)
    .context("Failed to insert task")?;
    Ok(())
}

pub fn get_plan(conn: &Connection, id: &str) -> Result<Plan> {
    conn.query_row(&format!("SELECT {PLAN_COLUMNS} FROM plan WHERE id = ?1"), params![id], row_to_plan)
        .optional()
        .map_err(storage_err)
        .context("Failed to load plan")?
        .ok_or_else(|| MemoryError::not_found("plan", id).into())
}

/// Newest first.
pub fn list_plans(conn: &Connection, workspace_id: &str) -> Result<Vec<Plan>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PLAN_COLUMNS} FROM plan WHERE workspace_id = ?1 ORDER BY created_at DESC, id"
        ))
        .map_err(storage_err)?;
    let plans = stmt
        .query_map(params![workspace_id], row_to_plan)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Failed to list plans")?;
    Ok(plans)
}

pub fn active_plan(conn: &Connection, workspace_id: &str) -> Result<Option<Plan>> {
    conn.query_row(
        &format!("SELECT {PLAN_COLUMNS} FROM plan WHERE workspace_id = ?1 AND status = 'active'"),
        params![workspace_id],
        row_to_plan,
    )
    .optional()
    .map_err(storage_err)
    .context("Failed to load active plan")
}

/// Activating a plan archives whichever plan was active before it.
pub fn set_plan_status(conn: &Connection, now: i64, id: &str, to: PlanStatus) -> Result<Plan> {
    let mut plan = get_plan(conn, id)?;
    if plan.status == to {
        return Ok(plan);
    }
    if !plan.status.can_become(to) {
        return Err(MemoryError::validation(format!("plan cannot move from {} to {}", plan.status, to)).into());
    }
    if to == PlanStatus::Active {
        let archived = conn
            .execute(
                "UPDATE plan SET status = 'archived', updated_at = ?3
                 WHERE workspace_id = ?1 AND status = 'active' AND id != ?2",
                params![plan.workspace_id, plan.id, now],
            )
            .map_err(storage_err)?;
        if archived > 0 {
            debug!(workspace = %plan.workspace_id, "previous active plan archived");
        }
    }
    conn.execute(
        "UPDATE plan SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![plan.id, to.as_str(), now],
    )
    .map_err(storage_err)
    .context("Failed to update plan status")?;
    plan.status = to;
    plan.updated_at = now;
    Ok(plan)
}

// ── Tasks ───────────────────────────────────────────────────────────────────

pub fn get_task(conn: &Connection, id: &str) -> Result<Task> {
    let mut task = conn
        .query_row(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?1"), params![id], row_to_task)
        .optional()
        .map_err(storage_err)
        .context("Failed to load task")?
        .ok_or_else(|| anyhow::Error::from(MemoryError::not_found("task", id)))?;
    task.dependencies = task_deps(conn, &task.id)?;
    Ok(task)
}

/// Tasks of a plan in creation order, dependencies filled in.
pub fn list_tasks(conn: &Connection, plan_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE plan_id = ?1 ORDER BY created_at, rowid"
        ))
        .map_err(storage_err)?;
    let mut tasks = stmt
        .query_map(params![plan_id], row_to_task)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
        .context("Failed to list tasks")?;

    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT d.task_id, d.depends_on FROM task_dep d JOIN task t ON t.id = d.task_id
             WHERE t.plan_id = ?1",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params![plan_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .map_err(storage_err)?;
    for row in rows {
        let (task, dep) = row.map_err(storage_err)?;
        deps.entry(task).or_default().insert(dep);
    }
    for t in &mut tasks {
        t.dependencies = deps.remove(&t.id).unwrap_or_default();
    }
    Ok(tasks)
}

/// Make `task_id` depend on `depends_on`. Both must belong to the same plan
/// and the edge must not close a cycle; the error path starts and ends at
/// `task_id`. A task already past `pending` only accepts finished
/// dependencies.
pub fn add_dependency(conn: &Connection, now: i64, task_id: &str, depends_on: &str) -> Result<bool> {
    let task = get_task(conn, task_id)?;
    let dep = get_task(conn, depends_on)?;
    if task.plan_id != dep.plan_id {
        return Err(MemoryError::validation("tasks in different plans cannot depend on each other").into());
    }
    if task.dependencies.contains(depends_on) {
        return Ok(false);
    }
    if matches!(task.status, TaskStatus::InProgress | TaskStatus::Completed)
        && dep.status != TaskStatus::Completed
    {
        return Err(MemoryError::validation(format!(
            "task '{}' is {}; dependency '{}' must be completed first",
            task.title, task.status, dep.title
        ))
        .into());
    }
    if task_id == depends_on {
        return Err(MemoryError::CycleWould {
            path: vec![task_id.to_string(), task_id.to_string()],
        }
        .into());
    }
    let back = find_path(depends_on, task_id, MAX_CHAIN, |n| {
        Ok(task_deps(conn, n)?.into_iter().collect())
    })?;
    if let Some(back) = back {
        let mut path = vec![task_id.to_string()];
        path.extend(back);
        return Err(MemoryError::CycleWould { path }.into());
    }
    conn.execute(
        "INSERT INTO task_dep(task_id, depends_on) VALUES (?1, ?2)",
        params![task_id, depends_on],
    )
    .map_err(storage_err)?;
    touch_task(conn, now, task_id)?;
    Ok(true)
}

pub fn remove_dependency(conn: &Connection, now: i64, task_id: &str, depends_on: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM task_dep WHERE task_id = ?1 AND depends_on = ?2",
            params![task_id, depends_on],
        )
        .map_err(storage_err)?;
    if n > 0 {
        touch_task(conn, now, task_id)?;
    }
    Ok(n > 0)
}

fn touch_task(conn: &Connection, now: i64, task_id: &str) -> Result<()> {
    conn.execute("UPDATE task SET updated_at = ?2 WHERE id = ?1", params![task_id, now])
        .map_err(storage_err)?;
    Ok(())
}

/// Move a task along its state machine. Starting requires every dependency
/// to be completed, and a completed task cannot be cancelled out from under
/// a dependent that is already running.
pub fn set_task_status(conn: &Connection, now: i64, id: &str, to: TaskStatus) -> Result<Task> {
    let mut task = get_task(conn, id)?;
    if task.status == to {
        return Ok(task);
    }
    if !task.status.can_become(to) {
        return Err(MemoryError::validation(format!(
            "task '{}' cannot move from {} to {}",
            task.title, task.status, to
        ))
        .into());
    }
    if to == TaskStatus::InProgress {
        let mut unmet = Vec::new();
        for d in &task.dependencies {
            let dep = get_task(conn, d)?;
            if dep.status != TaskStatus::Completed {
                unmet.push(dep.title);
            }
        }
        if !unmet.is_empty() {
            return Err(MemoryError::validation(format!(
                "task '{}' waits on unfinished dependencies: {}",
                task.title,
                unmet.join(", ")
            ))
            .into());
        }
    }
    if task.status == TaskStatus::Completed && to == TaskStatus::Cancelled {
        let running: Vec<String> = list_tasks(conn, &task.plan_id)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress && t.dependencies.contains(&task.id))
            .map(|t| t.title)
            .collect();
        if !running.is_empty() {
            return Err(MemoryError::validation(format!(
                "task '{}' cannot be cancelled while dependents are in progress: {}",
                task.title,
                running.join(", ")
            ))
            .into());
        }
    }
    task.completed_at = (to == TaskStatus::Completed).then_some(now);
    task.status = to;
    task.updated_at = now;
    conn.execute(
        "UPDATE task SET status = ?2, updated_at = ?3, completed_at = ?4 WHERE id = ?1",
        params![task.id, task.status.as_str(), now, task.completed_at],
    )
    .map_err(storage_err)
    .context("Failed to update task status")?;
    debug!(task = %task.id, status = %to, "task status changed");
    Ok(task)
}

// ── Scheduling ──────────────────────────────────────────────────────────────

pub fn next_task(conn: &Connection, plan_id: &str) -> Result<Option<Task>> {
    let tasks = list_tasks(conn, plan_id)?;
    Ok(dag::ready_tasks(&tasks).first().map(|t| (*t).clone()))
}

pub fn validate_dag(conn: &Connection, plan_id: &str) -> Result<DagCheck> {
    get_plan(conn, plan_id)?;
    let tasks = list_tasks(conn, plan_id)?;
    Ok(dag::topo_order(&dag::dep_map(&tasks)))
}

pub fn plan_progress(conn: &Connection, plan_id: &str) -> Result<PlanProgress> {
    let mut p = PlanProgress::default();
    for t in list_tasks(conn, plan_id)? {
        p.total += 1;
        match t.status {
            TaskStatus::Pending => p.pending += 1,
            TaskStatus::InProgress => p.in_progress += 1,
            TaskStatus::Blocked => p.blocked += 1,
            TaskStatus::Completed => p.completed += 1,
            TaskStatus::Cancelled => p.cancelled += 1,
        }
    }
    Ok(p)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Active plan with `tasks`; returns the plan and task ids by temp id.
    pub fn active_plan_with(conn: &Connection, workspace_id: &str, tasks: Vec<NewTask>) -> (Plan, HashMap<String, String>) {
        let temp: Vec<String> = tasks.iter().map(|t| t.temp_id.clone()).collect();
        let (plan, stored) = create_plan(conn, 1, NewPlan::for_goal(workspace_id, "ship it"), tasks).unwrap();
        let plan = set_plan_status(conn, 2, &plan.id, PlanStatus::Active).unwrap();
        let ids = temp.into_iter().zip(stored.into_iter().map(|t| t.id)).collect();
        (plan, ids)
    }
}
