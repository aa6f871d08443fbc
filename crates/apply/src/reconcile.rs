//! One reconcile pass over a previous/desired pair of component sets.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use metrics::{counter, histogram};
use outpost_core::{sanitize_message, Component, Condition, ConditionStatus, Error, Installation, Result};
use outpost_kubehub::StatusSink;
use tracing::{debug, error, info, warn};

use crate::diff::{diff, Action, Step};
use crate::engine::ChartEngine;

/// Condition recording whether the component sets could be planned at all.
pub const CONFIG_CONDITION: &str = "ComponentsConfig";

/// Slack on top of a component's own timeout before the call is abandoned.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

pub struct Reconciler<'a> {
    engine: &'a dyn ChartEngine,
    sink: &'a dyn StatusSink,
}

impl<'a> Reconciler<'a> {
    pub fn new(engine: &'a dyn ChartEngine, sink: &'a dyn StatusSink) -> Self {
        Self { engine, sink }
    }

    /// Diff and apply. Units run strictly in plan order; the first failing
    /// unit stops the pass and later passes resume from it.
    pub async fn reconcile(&self, inst: &mut Installation, previous: &[Component], desired: &[Component]) -> Result<()> {
        let generation = inst.generation();
        let plan = match diff(previous, desired) {
            Ok(plan) => plan,
            Err(e @ Error::InvalidConfig(_)) => {
                error!(installation = %inst.display_name(), error = %e, "component sets cannot be reconciled");
                inst.set_condition(Condition::new(CONFIG_CONDITION, ConditionStatus::False, "InvalidConfig", sanitize_message(&e.to_string()), generation));
                self.flush(inst).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if inst.conditions().and_then(|c| c.get(CONFIG_CONDITION)).map(|c| !c.is_true()).unwrap_or(false) {
            inst.set_condition(Condition::new(CONFIG_CONDITION, ConditionStatus::True, "Valid", "", generation));
            self.flush(inst).await?;
        }

        info!(
            installation = %inst.display_name(),
            install = plan.count(Action::Install),
            upgrade = plan.count(Action::Upgrade),
            uninstall = plan.count(Action::Uninstall),
            unchanged = plan.count(Action::NoChange),
            "reconciling components"
        );
        for step in plan.ordered() {
            self.run_step(inst, step).await?;
        }
        Ok(())
    }

    async fn run_step(&self, inst: &mut Installation, step: &Step) -> Result<()> {
        let generation = inst.generation();
        let ctype = step.component.condition_type();
        let key = step.component.key();

        if inst.conditions().map(|c| c.is_true_for(&ctype, generation)).unwrap_or(false) {
            debug!(component = %key, action = %step.action, "already done this generation");
            counter!("components_skipped_total", 1u64);
            return Ok(());
        }

        if let Some(reason) = step.action.progressing_reason() {
            inst.set_condition(Condition::new(&ctype, ConditionStatus::False, reason, "", generation));
            self.flush(inst).await?;
        }

        let started = Instant::now();
        let outcome = self.apply(step).await;
        histogram!("components_apply_ms", started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(()) => {
                counter!("components_actions_total", 1u64);
                info!(component = %key, action = %step.action, "component reconciled");
                inst.set_condition(Condition::new(&ctype, ConditionStatus::True, step.action.done_reason(), "", generation));
                self.flush(inst).await
            }
            Err(source) => {
                counter!("components_failures_total", 1u64);
                warn!(component = %key, action = %step.action, error = %format!("{:#}", source), "component failed; stopping pass");
                let msg = sanitize_message(&format!("{:#}", source));
                inst.set_condition(Condition::new(&ctype, ConditionStatus::False, step.action.failed_reason(), msg, generation));
                if let Err(e) = self.flush(inst).await {
                    warn!(error = %e, "could not record failure");
                }
                Err(Error::Unit { key: key.to_string(), verb: step.action.verb(), source })
            }
        }
    }

    async fn apply(&self, step: &Step) -> anyhow::Result<()> {
        let c = &step.component;
        let limit = c.timeout_duration() + TIMEOUT_GRACE;
        let call = async {
            match step.action {
                Action::Install => {
                    if self.engine.exists(&c.namespace, &c.name).await? {
                        debug!(component = %c.key(), "release present; install already satisfied");
                        return Ok::<(), anyhow::Error>(());
                    }
                    self.engine.install(c).await
                }
                Action::Upgrade => self.engine.upgrade(c, c.force_upgrade).await,
                Action::Uninstall => {
                    if !self.engine.exists(&c.namespace, &c.name).await? {
                        debug!(component = %c.key(), "release absent; uninstall already satisfied");
                        return Ok::<(), anyhow::Error>(());
                    }
                    self.engine.uninstall(&c.namespace, &c.name, true).await
                }
                Action::NoChange => Ok(()),
            }
        };
        match tokio::time::timeout(limit, call).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("timed out after {}s", limit.as_secs())),
        }
    }

    async fn flush(&self, inst: &Installation) -> Result<()> {
        self.sink.flush(inst).await.map_err(Error::Status)
    }
}

/// Convenience wrapper for a single pass.
pub async fn reconcile(engine: &dyn ChartEngine, sink: &dyn StatusSink, inst: &mut Installation, previous: &[Component], desired: &[Component]) -> Result<()> {
    Reconciler::new(engine, sink).reconcile(inst, previous, desired).await
}
