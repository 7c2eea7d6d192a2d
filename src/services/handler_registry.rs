//! Handler Registry Service
//!
//! Stores handlers, rejects dependency cycles at registration, selects handlers for an
//! event and orders a selection into an [`ExecutionPlan`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::models::{
    EventKind, HandlerConfig, HandlerDescriptor, HandlerId, Phase, Priority,
};
use crate::domain::ports::Handler;
use crate::services::builtin_handlers;
use crate::services::notices::{Notice, NoticeBus};

/// A handler together with the descriptor captured at registration.
#[derive(Clone)]
pub struct RegisteredHandler {
    descriptor: Arc<HandlerDescriptor>,
    handler: Arc<dyn Handler>,
    registered_at: DateTime<Utc>,
}

impl RegisteredHandler {
    fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            descriptor: Arc::new(handler.describe()),
            handler,
            registered_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &HandlerId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("descriptor", &self.descriptor)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Handlers that may start once every earlier stage has finished.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    handlers: Vec<RegisteredHandler>,
}

impl Stage {
    /// Handlers of this stage, sorted by id.
    pub fn handlers(&self) -> &[RegisteredHandler] {
        &self.handlers
    }

    /// Split the stage into execution groups.
    ///
    /// Consecutive parallelizable handlers share a group and run concurrently; every
    /// non-parallelizable handler forms a group of its own.
    pub fn groups(&self) -> Vec<Vec<RegisteredHandler>> {
        let mut groups: Vec<Vec<RegisteredHandler>> = Vec::new();
        let mut current: Vec<RegisteredHandler> = Vec::new();

        for handler in &self.handlers {
            if handler.descriptor().parallelizable {
                current.push(handler.clone());
            } else {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                groups.push(vec![handler.clone()]);
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    /// Worst-case time for this stage: groups run one after another.
    pub fn budget(&self) -> Duration {
        self.groups()
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|h| h.descriptor().timeout)
                    .max()
                    .unwrap_or_default()
            })
            .sum()
    }
}

/// Dependency-ordered stages for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    stages: Vec<Stage>,
}

impl ExecutionPlan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Every execution group of every stage, in execution order.
    pub fn groups(&self) -> Vec<Vec<RegisteredHandler>> {
        self.stages.iter().flat_map(Stage::groups).collect()
    }

    /// Handler ids in execution order.
    pub fn handler_ids(&self) -> Vec<HandlerId> {
        self.stages
            .iter()
            .flat_map(|s| s.handlers.iter().map(|h| h.id().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of stage budgets.
    pub fn budget(&self) -> Duration {
        self.stages.iter().map(Stage::budget).sum()
    }
}

#[derive(Debug, Deserialize)]
struct HandlersFile {
    #[serde(default)]
    handlers: Vec<HandlerConfig>,
}

/// Registry of dispatchable handlers.
///
/// Handlers are kept in a `BTreeMap` so iteration, and therefore selection, is ordered
/// by id. No lock is held while a handler runs: selection clones the `Arc`s out.
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<HandlerId, RegisteredHandler>>,
    notices: Option<Arc<NoticeBus>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            notices: None,
        }
    }

    /// Publish registration changes on the given bus.
    #[must_use]
    pub fn with_notices(mut self, notices: Arc<NoticeBus>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Register a handler.
    ///
    /// Fails with `DuplicateId` if the id is taken, `FastPathDependency` if a critical
    /// handler declares dependencies, and `CyclicDependency` if the new edges close a
    /// cycle among handlers with overlapping selectors.
    #[instrument(skip(self, handler))]
    pub fn register(&self, handler: Arc<dyn Handler>) -> DispatchResult<()> {
        let entry = RegisteredHandler::new(handler);
        validate_descriptor(entry.descriptor())?;

        let id = entry.id().clone();
        {
            let mut handlers = self.handlers.write();
            if handlers.contains_key(&id) {
                return Err(DispatchError::DuplicateId(id));
            }
            if let Some(path) = find_cycle(&handlers, entry.descriptor()) {
                return Err(DispatchError::CyclicDependency { path });
            }
            handlers.insert(id.clone(), entry.clone());
        }

        let descriptor = entry.descriptor();
        info!(
            handler_id = %id,
            selector = %descriptor.selector,
            priority_class = %descriptor.priority_class,
            dependencies = descriptor.depends_on.len(),
            "Registered handler"
        );
        self.publish(Notice::HandlerRegistered { id });
        Ok(())
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn deregister(&self, id: &HandlerId) -> bool {
        let removed = self.handlers.write().remove(id).is_some();
        if removed {
            info!(handler_id = %id, "Deregistered handler");
            self.publish(Notice::HandlerDeregistered { id: id.clone() });
        }
        removed
    }

    /// Enable or disable a handler. Returns the previous value.
    pub fn set_enabled(&self, id: &HandlerId, enabled: bool) -> DispatchResult<bool> {
        let mut handlers = self.handlers.write();
        let entry = handlers
            .get_mut(id)
            .ok_or_else(|| DispatchError::HandlerNotFound(id.clone()))?;
        let previous = entry.descriptor.enabled;
        Arc::make_mut(&mut entry.descriptor).enabled = enabled;
        debug!(handler_id = %id, enabled, "Handler enablement changed");
        Ok(previous)
    }

    /// Swap in a new version of a handler under the same id.
    ///
    /// Registration checks run against the registry without the old version. On failure
    /// the old version stays registered. Registers the handler if the id is unknown.
    #[instrument(skip(self, handler))]
    pub fn replace(&self, handler: Arc<dyn Handler>) -> DispatchResult<Option<HandlerDescriptor>> {
        let entry = RegisteredHandler::new(handler);
        validate_descriptor(entry.descriptor())?;

        let id = entry.id().clone();
        let previous = {
            let mut handlers = self.handlers.write();
            let previous = handlers.remove(&id);
            if let Some(path) = find_cycle(&handlers, entry.descriptor()) {
                if let Some(old) = previous {
                    handlers.insert(id, old);
                }
                return Err(DispatchError::CyclicDependency { path });
            }
            handlers.insert(id.clone(), entry);
            previous
        };

        info!(handler_id = %id, replaced = previous.is_some(), "Replaced handler");
        self.publish(Notice::HandlerRegistered { id });
        Ok(previous.map(|old| old.descriptor().clone()))
    }

    /// Enabled handlers matching `(kind, phase)`, sorted by id.
    ///
    /// With `min_priority`, only handlers whose priority class is at least that
    /// priority are returned.
    pub fn select(
        &self,
        kind: &EventKind,
        phase: Phase,
        min_priority: Option<Priority>,
    ) -> Vec<RegisteredHandler> {
        let handlers = self.handlers.read();
        let selected: Vec<RegisteredHandler> = handlers
            .values()
            .filter(|h| {
                let d = h.descriptor();
                d.enabled
                    && d.selector.matches(kind, phase)
                    && min_priority.map_or(true, |min| d.priority_class >= min)
            })
            .cloned()
            .collect();
        debug!(kind = %kind, phase = %phase, selected = selected.len(), "Selected handlers");
        selected
    }

    /// Order a selection into dependency stages.
    ///
    /// Dependencies on handlers outside the selection are ignored. Each stage is sorted
    /// by id, so the plan is a pure function of the selection. A cycle inside the
    /// selection is reported as `PipelineFatal`.
    pub fn order(&self, selected: &[RegisteredHandler]) -> DispatchResult<ExecutionPlan> {
        order_handlers(selected)
    }

    pub fn get(&self, id: &HandlerId) -> Option<RegisteredHandler> {
        self.handlers.read().get(id).cloned()
    }

    /// Descriptors of every registered handler, sorted by id.
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers
            .read()
            .values()
            .map(|h| h.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Register the built-in handlers declared in configuration.
    ///
    /// Disabled declarations are registered disabled. Stops at the first failure.
    #[instrument(skip(self, configs))]
    pub fn load_from_config(&self, configs: &[HandlerConfig]) -> DispatchResult<usize> {
        for config in configs {
            self.register(builtin_handlers::from_config(config))?;
        }
        info!(total_handlers = configs.len(), "Handlers loaded from configuration");
        Ok(configs.len())
    }

    /// Load handler declarations from a YAML file with a top-level `handlers` list.
    #[instrument(skip(self))]
    pub fn load_from_file(&self, path: &Path) -> anyhow::Result<usize> {
        info!(path = ?path, "Loading handlers from file");

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read handlers file {}", path.display()))?;
        let file: HandlersFile =
            serde_yaml::from_str(&content).context("Failed to parse handlers file")?;

        self.load_from_config(&file.handlers)
            .context("Failed to register handlers")
    }

    fn publish(&self, notice: Notice) {
        if let Some(notices) = &self.notices {
            notices.publish(notice);
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_descriptor(descriptor: &HandlerDescriptor) -> DispatchResult<()> {
    if descriptor.id.as_str().trim().is_empty() {
        return Err(DispatchError::Config("handler id cannot be empty".to_string()));
    }
    if descriptor.is_fast_path() && !descriptor.depends_on.is_empty() {
        return Err(DispatchError::FastPathDependency(descriptor.id.clone()));
    }
    Ok(())
}

/// Look for a dependency cycle through `candidate` if it were added to `handlers`.
///
/// Only edges between handlers with overlapping selectors count: handlers that can
/// never be selected for the same event never run together.
fn find_cycle(
    handlers: &BTreeMap<HandlerId, RegisteredHandler>,
    candidate: &HandlerDescriptor,
) -> Option<Vec<HandlerId>> {
    let mut descriptors: HashMap<&HandlerId, &HandlerDescriptor> = handlers
        .iter()
        .map(|(id, h)| (id, h.descriptor()))
        .collect();
    descriptors.insert(&candidate.id, candidate);

    let graph: HashMap<&HandlerId, Vec<&HandlerId>> = descriptors
        .iter()
        .map(|(&id, &descriptor)| {
            let edges = descriptor
                .depends_on
                .iter()
                .filter_map(|dep| {
                    descriptors
                        .get_key_value(dep)
                        .filter(|(_, target)| descriptor.selector.overlaps(&target.selector))
                        .map(|(&dep_id, _)| dep_id)
                })
                .collect();
            (id, edges)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    // The existing graph is acyclic, so any new cycle passes through the candidate.
    if detect_cycle_util(&candidate.id, &graph, &mut visited, &mut rec_stack, &mut path) {
        Some(path.into_iter().cloned().collect())
    } else {
        None
    }
}

/// DFS cycle search. On success `path` holds the cycle, closed by its first node.
fn detect_cycle_util<'a>(
    node: &'a HandlerId,
    graph: &HashMap<&'a HandlerId, Vec<&'a HandlerId>>,
    visited: &mut HashSet<&'a HandlerId>,
    rec_stack: &mut HashSet<&'a HandlerId>,
    path: &mut Vec<&'a HandlerId>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    path.push(neighbor);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

/// Kahn layering of a selection.
fn order_handlers(selected: &[RegisteredHandler]) -> DispatchResult<ExecutionPlan> {
    let by_id: BTreeMap<&HandlerId, &RegisteredHandler> =
        selected.iter().map(|h| (h.id(), h)).collect();

    let mut in_degree: BTreeMap<&HandlerId, usize> = BTreeMap::new();
    let mut dependents: HashMap<&HandlerId, Vec<&HandlerId>> = HashMap::new();

    for (&id, handler) in &by_id {
        let deps: Vec<&HandlerId> = handler
            .descriptor()
            .depends_on
            .iter()
            .filter_map(|dep| by_id.get_key_value(dep).map(|(&dep_id, _)| dep_id))
            .collect();
        in_degree.insert(id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut stages = Vec::new();
    let mut ready: Vec<&HandlerId> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();
        for &id in &ready {
            if let Some(children) = dependents.get(id) {
                for &child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child);
                        }
                    }
                }
            }
        }

        placed += ready.len();
        stages.push(Stage {
            handlers: ready
                .iter()
                .filter_map(|id| by_id.get(id).map(|&h| h.clone()))
                .collect(),
        });
        ready = next;
    }

    if placed < by_id.len() {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, &degree)| degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(DispatchError::PipelineFatal(format!(
            "dependency cycle among selected handlers: {}",
            stuck.join(", ")
        )));
    }

    Ok(ExecutionPlan { stages })
}
