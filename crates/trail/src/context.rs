//! Request context: per-operation actor identity and recording switches
//!
//! A `RequestContext` belongs to one logical operation and is passed by
//! reference through the recording call chain. The process-wide switch lives
//! on [`crate::Trail`]; recording happens only when that switch, this
//! context's switch and the per-model switch all agree.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Scoped state of one logical operation
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    enabled: bool,
    enabled_for_model: HashMap<String, bool>,
    whodunnit: Option<String>,
    controller_info: Map<String, Value>,
    transaction_id: Option<i64>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_for_model: HashMap::new(),
            whodunnit: None,
            controller_info: Map::new(),
            transaction_id: None,
        }
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for an actor, with recording enabled
    pub fn for_actor(whodunnit: impl Into<String>) -> Self {
        Self {
            whodunnit: Some(whodunnit.into()),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Per-model switch, enabled unless turned off in this context
    pub fn is_enabled_for_model(&self, model: &str) -> bool {
        self.enabled_for_model.get(model).copied().unwrap_or(true)
    }

    pub fn set_enabled_for_model(&mut self, model: impl Into<String>, enabled: bool) {
        self.enabled_for_model.insert(model.into(), enabled);
    }

    pub fn disable_for_model(&mut self, model: impl Into<String>) {
        self.set_enabled_for_model(model, false);
    }

    pub fn enable_for_model(&mut self, model: impl Into<String>) {
        self.set_enabled_for_model(model, true);
    }

    pub fn whodunnit(&self) -> Option<&str> {
        self.whodunnit.as_deref()
    }

    pub fn set_whodunnit(&mut self, whodunnit: Option<String>) {
        self.whodunnit = whodunnit;
    }

    pub fn controller_info(&self) -> &Map<String, Value> {
        &self.controller_info
    }

    pub fn set_controller_info(&mut self, info: Map<String, Value>) {
        self.controller_info = info;
    }

    /// Add one entry to the controller info
    pub fn insert_controller_info(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.controller_info.insert(key.into(), value.into());
    }

    /// Correlation id forced onto every version recorded in this context
    pub fn transaction_id(&self) -> Option<i64> {
        self.transaction_id
    }

    pub fn set_transaction_id(&mut self, transaction_id: Option<i64>) {
        self.transaction_id = transaction_id;
    }

    pub fn clear_transaction_id(&mut self) {
        self.transaction_id = None;
    }

    /// Enable recording until the returned guard drops, then restore the
    /// previous value
    pub fn enable_versioning(&mut self) -> ContextGuard<'_> {
        let previous = self.enabled;
        self.enabled = true;
        ContextGuard {
            ctx: self,
            restore: Restore::Enabled(previous),
        }
    }

    /// Disable recording until the returned guard drops
    pub fn disable_versioning(&mut self) -> ContextGuard<'_> {
        let previous = self.enabled;
        self.enabled = false;
        ContextGuard {
            ctx: self,
            restore: Restore::Enabled(previous),
        }
    }

    /// Override the actor until the returned guard drops
    pub fn scoped_whodunnit(&mut self, whodunnit: impl Into<String>) -> ContextGuard<'_> {
        let previous = self.whodunnit.replace(whodunnit.into());
        ContextGuard {
            ctx: self,
            restore: Restore::Whodunnit(previous),
        }
    }

    /// Run `op` with recording enabled; the previous value is restored on
    /// every exit path, including unwinding
    pub fn with_versioning<T>(&mut self, op: impl FnOnce(&mut RequestContext) -> T) -> T {
        let mut guard = self.enable_versioning();
        op(&mut guard)
    }

    /// Run `op` with `whodunnit` as the actor, restoring the previous actor
    pub fn with_whodunnit<T>(
        &mut self,
        whodunnit: impl Into<String>,
        op: impl FnOnce(&mut RequestContext) -> T,
    ) -> T {
        let mut guard = self.scoped_whodunnit(whodunnit);
        op(&mut guard)
    }
}

enum Restore {
    Enabled(bool),
    Whodunnit(Option<String>),
}

/// Restores one context field when dropped
pub struct ContextGuard<'a> {
    ctx: &'a mut RequestContext,
    restore: Restore,
}

impl Deref for ContextGuard<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        match &mut self.restore {
            Restore::Enabled(previous) => {
                self.ctx.enabled = *previous;
                debug!("Restored context recording switch to {}", previous);
            }
            Restore::Whodunnit(previous) => {
                self.ctx.whodunnit = previous.take();
            }
        }
    }
}
