//! Fixed-size worker pool that runs agents side by side.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::stream::EventType;
use super::{Agent, AgentError, AgentInput, AgentOutput};
use crate::error::is_cancelled;

pub struct AgentRuntime {
    workers: usize,
}

impl AgentRuntime {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One output per agent, in `agents` order. Agent errors and panics are
    /// captured in the output; only pool construction can fail.
    pub fn run(&self, agents: &[Arc<dyn Agent>], input: &AgentInput) -> Result<Vec<AgentOutput>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers.min(agents.len().max(1)))
            .thread_name(|i| format!("taskwing-agent-{i}"))
            .build()
            .context("Failed to start agent pool")?;
        Ok(pool.install(|| agents.par_iter().map(|a| run_one(a.as_ref(), input)).collect()))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_one(agent: &dyn Agent, input: &AgentInput) -> AgentOutput {
    let name = agent.name();
    input.stream.emit(name, EventType::AgentStarted, input.root.display().to_string());
    let started = Instant::now();

    let mut out = match panic::catch_unwind(AssertUnwindSafe(|| agent.run(input))) {
        Ok(Ok(out)) => out,
        Ok(Err(e)) if is_cancelled(&e) => AgentOutput::failed(name, AgentError::Cancelled),
        Ok(Err(e)) => AgentOutput::failed(name, AgentError::Failed(format!("{e:#}"))),
        Err(payload) => AgentOutput::failed(name, AgentError::Panicked(panic_message(payload.as_ref()))),
    };
    out.agent = name.to_string();
    out.duration = started.elapsed();

    match &out.error {
        None => {
            debug!(agent = name, findings = out.findings.len(), "agent finished");
            input.stream.emit(name, EventType::AgentFinished, format!("{} findings", out.findings.len()));
        }
        Some(err) => {
            warn!(agent = name, "agent {err}");
            input.stream.emit(name, EventType::AgentFailed, err.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testutil::input;
    use crate::error::MemoryError;
    use crate::memory::model::{Finding, FindingType};

    struct Fixed(&'static str);
    impl Agent for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
            let mut out = AgentOutput::new(self.0);
            out.push(input, Finding::new(self.0, FindingType::Pattern, "Layered modules"));
            Ok(out)
        }
    }

    struct Boom;
    impl Agent for Boom {
        fn name(&self) -> &'static str {
            "boom"
        }
        fn run(&self, _: &AgentInput) -> Result<AgentOutput> {
            panic!("bad finding")
        }
    }

    struct Erring;
    impl Agent for Erring {
        fn name(&self) -> &'static str {
            "erring"
        }
        fn run(&self, input: &AgentInput) -> Result<AgentOutput> {
            input.cancel.check()?;
            Err(MemoryError::validation("unparseable manifest").into())
        }
    }

    #[test]
    fn failures_are_captured_per_agent() {
        let input = input(&[]);
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(Fixed("a")), Arc::new(Boom), Arc::new(Erring)];
        let outs = AgentRuntime::new(2).run(&agents, &input).unwrap();
        assert_eq!(outs.len(), 3);
        assert_eq!(outs[0].findings.len(), 1);
        assert!(outs[0].error.is_none());
        assert_eq!(outs[1].error, Some(AgentError::Panicked("bad finding".into())));
        assert!(matches!(outs[2].error, Some(AgentError::Failed(ref m)) if m.contains("unparseable")));
        let failed = input
            .stream
            .snapshot()
            .iter()
            .filter(|e| e.event_type == EventType::AgentFailed)
            .count();
        assert_eq!(failed, 2);
    }

    #[test]
    fn cancelled_errors_map_to_cancelled() {
        let input = input(&[]);
        input.cancel.cancel();
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(Erring)];
        let outs = AgentRuntime::new(1).run(&agents, &input).unwrap();
        assert_eq!(outs[0].error, Some(AgentError::Cancelled));
    }
}
