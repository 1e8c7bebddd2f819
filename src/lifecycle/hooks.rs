//! Lifecycle hook registry.
//!
//! Hooks are zero-argument callbacks attached to one of four
//! [`HookPoint`]s. They run synchronously on the dispatcher's task, in the
//! order they were registered. A panicking hook is caught and logged; the
//! [`HookFailurePolicy`] decides whether the rest of that point still runs.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::config::HookFailurePolicy;
use crate::observability::metrics;

/// A lifecycle callback.
pub type Hook = Box<dyn Fn() + Send + 'static>;

/// Moments in a generation's life at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeStop,
    AfterStop,
    BeforeReload,
    AfterReload,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::BeforeStop => "before_stop",
            HookPoint::AfterStop => "after_stop",
            HookPoint::BeforeReload => "before_reload",
            HookPoint::AfterReload => "after_reload",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of invoking one hook point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookReport {
    /// Hooks that were called, including ones that panicked.
    pub invoked: usize,
    /// Hooks that panicked.
    pub failed: usize,
}

/// Append-only map from hook point to callbacks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<Hook>>,
    policy: HookFailurePolicy,
}

impl HookRegistry {
    pub fn new(policy: HookFailurePolicy) -> Self {
        Self {
            hooks: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> HookFailurePolicy {
        self.policy
    }

    /// Append a single callback to `point`.
    pub fn push<F>(&mut self, point: HookPoint, hook: F)
    where
        F: Fn() + Send + 'static,
    {
        self.hooks.entry(point).or_default().push(Box::new(hook));
    }

    /// Append several callbacks to `point`, keeping their order.
    pub fn register<I>(&mut self, point: HookPoint, hooks: I)
    where
        I: IntoIterator<Item = Hook>,
    {
        self.hooks.entry(point).or_default().extend(hooks);
    }

    /// Number of callbacks registered at `point`.
    pub fn len(&self, point: HookPoint) -> usize {
        self.hooks.get(&point).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }

    /// Run every callback at `point` in registration order.
    pub fn invoke(&self, point: HookPoint) -> HookReport {
        let mut report = HookReport::default();
        let Some(hooks) = self.hooks.get(&point) else {
            return report;
        };

        for (index, hook) in hooks.iter().enumerate() {
            report.invoked += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                report.failed += 1;
                metrics::record_hook_failure(point.as_str());
                tracing::error!(
                    hook_point = %point,
                    hook_index = index,
                    panic = panic_message(payload.as_ref()),
                    "Lifecycle hook panicked"
                );
                if self.policy == HookFailurePolicy::Abort {
                    tracing::warn!(
                        hook_point = %point,
                        skipped = hooks.len() - index - 1,
                        "Skipping remaining hooks"
                    );
                    break;
                }
            }
        }

        tracing::debug!(
            hook_point = %point,
            invoked = report.invoked,
            failed = report.failed,
            "Lifecycle hooks invoked"
        );
        report
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.hooks.iter().map(|(p, h)| (*p, h.len())).collect();
        f.debug_struct("HookRegistry")
            .field("hooks", &counts)
            .field("policy", &self.policy)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
