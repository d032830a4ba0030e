//! Stop-hook controller for autonomous runs.
//!
//! On every stop signal the executor asks `continue_check` whether to stop
//! (`approve`) or keep going with the next task (`block`). Rules, in order:
//! auto-init the session, circuit breaker, no active plan, nothing ready,
//! otherwise hand out the next task with its context. The hook never moves
//! tasks through their state machine; the executor does.

pub mod context;
pub mod session;

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::HooksConfig;
use crate::knowledge::KnowledgeService;
use crate::plan::{self, Plan, Task, TaskStatus};
use session::{HookSession, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Block,
}

/// One line of the hook protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookDecision {
    pub decision: Verdict,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl HookDecision {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            decision: Verdict::Approve,
            reason: reason.into(),
            context: None,
        }
    }

    fn block(reason: String, context: String) -> Self {
        Self {
            decision: Verdict::Block,
            reason,
            context: Some(context),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tasks_started: u32,
    pub tasks_completed: u32,
    pub minutes: i64,
}

pub struct HookController<'a> {
    svc: &'a KnowledgeService,
    store: SessionStore,
    cfg: HooksConfig,
    clock: Arc<dyn Clock>,
}

impl<'a> HookController<'a> {
    pub fn new(svc: &'a KnowledgeService, memory_dir: &Path, cfg: HooksConfig) -> Self {
        Self {
            svc,
            store: SessionStore::new(memory_dir),
            cfg,
            clock: svc.repo().clock(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn active_plan(&self) -> Result<Option<Plan>> {
        let ws = self.svc.workspace_id();
        self.svc.repo().read(|c| plan::active_plan(c, ws))
    }

    /// Starts a fresh session (replacing any previous one) and returns the
    /// banner shown to the user.
    pub fn session_init(&self) -> Result<String> {
        let mut session = HookSession::start(self.clock.now());
        let plan = self.active_plan()?;
        session.plan_id = plan.as_ref().map(|p| p.id.clone());
        self.store.save(&session)?;
        info!(session = %session.session_id, "hook session started");

        let mut banner = format!("TaskWing session {} started\n", session.short_id());
        match plan {
            Some(plan) => {
                let (progress, next) = self.svc.repo().read(|c| {
                    Ok((plan::plan_progress(c, &plan.id)?, plan::next_task(c, &plan.id)?))
                })?;
                banner.push_str(&format!(
                    "Active plan: {} ({}/{} tasks completed)\n",
                    plan.goal, progress.completed, progress.total
                ));
                if let Some(next) = next {
                    banner.push_str(&format!("Next task: {}\n", next.title));
                }
            }
            None => banner.push_str("No active plan: create and activate one to run tasks autonomously.\n"),
        }
        banner.push_str(&format!(
            "Circuit breaker: {} tasks or {} minutes per session\n",
            self.cfg.max_tasks, self.cfg.max_minutes
        ));
        Ok(banner)
    }

    pub fn continue_check(&self) -> Result<HookDecision> {
        let now = self.clock.now();
        let mut session = match self.store.load()? {
            Some(s) => s,
            None => {
                let s = HookSession::start(now);
                self.store.save(&s)?;
                debug!(session = %s.session_id, "hook session auto-initialized");
                s
            }
        };

        let elapsed = session.elapsed_minutes(now);
        if session.tasks_completed >= self.cfg.max_tasks || elapsed >= i64::from(self.cfg.max_minutes) {
            let why = if session.tasks_completed >= self.cfg.max_tasks {
                "task limit reached".to_string()
            } else {
                format!("{elapsed} of {} minutes used", self.cfg.max_minutes)
            };
            info!(session = %session.session_id, "circuit breaker tripped: {why}");
            return Ok(HookDecision::approve(format!(
                "Circuit breaker: Completed {}/{} tasks ({why}). Start a new session to continue.",
                session.tasks_completed, self.cfg.max_tasks
            )));
        }

        let Some(plan) = self.active_plan()? else {
            return Ok(HookDecision::approve("No active plan."));
        };

        let (tasks, progress) = self
            .svc
            .repo()
            .read(|c| Ok((plan::list_tasks(c, &plan.id)?, plan::plan_progress(c, &plan.id)?)))?;
        let current = session
            .current_task_id
            .as_deref()
            .and_then(|id| tasks.iter().find(|t| t.id == id));
        if current.is_some_and(|t| t.status == TaskStatus::Completed) {
            session.complete_current();
            self.store.save(&session)?;
        }

        // A task the executor already started stays the one to work on.
        let next: Option<&Task> = match current {
            Some(t) if t.status == TaskStatus::InProgress => Some(t),
            _ => plan::dag::ready_tasks(&tasks).first().copied(),
        };
        let Some(next) = next else {
            let reason = if progress.is_finished() {
                format!("Plan complete: {}/{} tasks completed.", progress.completed, progress.total)
            } else {
                "No ready tasks; check blocked tasks and unmet dependencies.".to_string()
            };
            return Ok(HookDecision::approve(reason));
        };

        session.plan_id = Some(plan.id.clone());
        session.track(&next.id);
        self.store.save(&session)?;

        let deps: Vec<Task> = tasks
            .iter()
            .filter(|t| next.dependencies.contains(&t.id))
            .cloned()
            .collect();
        let memory = context::recall(self.svc, next, self.cfg.recall_k);
        let ctx = context::assemble(next, &plan, &progress, &deps, &memory, self.cfg.context_chars);
        info!(session = %session.session_id, task = %next.id, "hook continues with next task");
        Ok(HookDecision::block(
            format!(
                "Continue with task {}/{}: {}",
                session.tasks_started, self.cfg.max_tasks, next.title
            ),
            ctx.text,
        ))
    }

    /// Removes the session file; None when there was no session.
    pub fn session_end(&self) -> Result<Option<SessionSummary>> {
        let Some(session) = self.store.load()? else {
            self.store.remove()?;
            return Ok(None);
        };
        self.store.remove()?;
        let summary = SessionSummary {
            minutes: session.elapsed_minutes(self.clock.now()),
            session_id: session.session_id,
            tasks_started: session.tasks_started,
            tasks_completed: session.tasks_completed,
        };
        info!(session = %summary.session_id, completed = summary.tasks_completed, "hook session ended");
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::memory::model::{Workspace, WorkspaceKind};
    use crate::memory::Repo;
    use crate::plan::testutil::active_plan_with;
    use crate::plan::NewTask;
    use crate::providers::{FsSource, Providers};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        svc: KnowledgeService,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at_millis(1_700_000_000_000));
        let repo = Repo::open_with_clock(&tmp.path().join("memory.db"), clock.clone()).unwrap();
        let ws = Workspace {
            id: "wshooks00000001".into(),
            root_path: tmp.path().display().to_string(),
            kind: WorkspaceKind::Single,
            services: vec![],
        };
        let svc = KnowledgeService::new(Arc::new(repo), Providers::none(), Arc::new(FsSource::new(tmp.path())), ws).unwrap();
        Fixture { tmp, svc, clock }
    }

    fn plan_ab(f: &Fixture) -> HashMap<String, String> {
        let ws = f.svc.workspace_id().to_string();
        f.svc
            .repo()
            .write(|tx| Ok(active_plan_with(tx, &ws, vec![NewTask::new("a", "A"), NewTask::new("b", "B").after(&["a"])]).1))
            .unwrap()
    }

    fn finish(f: &Fixture, id: &str) {
        f.svc
            .repo()
            .write(|tx| {
                plan::set_task_status(tx, 10, id, TaskStatus::InProgress)?;
                plan::set_task_status(tx, 11, id, TaskStatus::Completed)
            })
            .unwrap();
    }

    #[test]
    fn no_plan_approves_after_auto_init() {
        let f = fixture();
        let hooks = HookController::new(&f.svc, f.tmp.path(), HooksConfig::default());
        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Approve);
        assert_eq!(d.reason, "No active plan.");
        assert!(hooks.store().load().unwrap().is_some());
    }

    #[test]
    fn walks_the_plan_then_reports_completion() {
        let f = fixture();
        let ids = plan_ab(&f);
        let hooks = HookController::new(&f.svc, f.tmp.path(), HooksConfig::default());

        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Block);
        assert!(d.context.unwrap().contains("## Current task: A"));

        finish(&f, &ids["a"]);
        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Block);
        assert!(d.reason.ends_with(": B"));
        let s = hooks.store().load().unwrap().unwrap();
        assert_eq!((s.tasks_started, s.tasks_completed), (2, 1));

        finish(&f, &ids["b"]);
        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Approve);
        assert_eq!(d.reason, "Plan complete: 2/2 tasks completed.");
        let s = hooks.store().load().unwrap().unwrap();
        assert_eq!((s.tasks_started, s.tasks_completed), (2, 2));
        assert!(s.current_task_id.is_none());
    }

    #[test]
    fn blocked_plan_approves_with_hint() {
        let f = fixture();
        let ids = plan_ab(&f);
        f.svc
            .repo()
            .write(|tx| {
                plan::set_task_status(tx, 10, &ids["a"], TaskStatus::InProgress)?;
                plan::set_task_status(tx, 11, &ids["a"], TaskStatus::Blocked)
            })
            .unwrap();
        let hooks = HookController::new(&f.svc, f.tmp.path(), HooksConfig::default());
        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Approve);
        assert!(d.reason.starts_with("No ready tasks"));
    }

    #[test]
    fn time_breaker_trips() {
        let f = fixture();
        plan_ab(&f);
        let hooks = HookController::new(&f.svc, f.tmp.path(), HooksConfig::default());
        hooks.session_init().unwrap();
        f.clock.advance(chrono::Duration::minutes(31));
        let d = hooks.continue_check().unwrap();
        assert_eq!(d.decision, Verdict::Approve);
        assert!(d.reason.starts_with("Circuit breaker: Completed 0/5 tasks"));
    }

    #[test]
    fn init_banner_and_end_summary() {
        let f = fixture();
        plan_ab(&f);
        let hooks = HookController::new(&f.svc, f.tmp.path(), HooksConfig::default());
        let banner = hooks.session_init().unwrap();
        assert!(banner.contains("Active plan: ship it (0/2 tasks completed)"));
        assert!(banner.contains("Next task: A"));
        let summary = hooks.session_end().unwrap().unwrap();
        assert_eq!(summary.tasks_started, 0);
        assert!(hooks.session_end().unwrap().is_none());
    }
}
