//! The workflow runner: dependency resolution, dispatch, fan-out expansion,
//! condition gating, cache consultation, retries/timeouts, and cancellation.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{Map, Number, Value};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{fingerprint, from_config, Cache, CacheConfig, CacheStats, InflightIndex};
use crate::cache::MemoryCache;
use crate::error::{EngineError, ErrorKind};
use crate::events::{EventSink, RunEvent};
use crate::interpolate::{apply_element, collect_references, interpolate_value};
use crate::registry::TaskRegistry;
use crate::result::TaskResult;
use crate::spec::TaskSpec;
use crate::store::{RefScope, ValueStore};
use crate::stream::{stream_channel, StreamReceiver, StreamSender};
use crate::task::TaskContext;

/// How long running tasks get to honour a cancellation before the scheduler
/// abandons them.
const CANCEL_GRACE_MS: u64 = 5_000;

/// A workflow: a registry, a set of task specs forming a DAG, and the
/// machinery to run them.
///
/// Tasks are executed after all their declared dependencies reach a terminal
/// state; simultaneously ready tasks dispatch in declaration order. `run`
/// returns the final [`TaskResult`] of every task, including skipped and
/// failed ones, so callers can inspect partial success.
pub struct Workflow {
    name: String,
    registry: TaskRegistry,
    specs: Vec<TaskSpec>,
    index: HashMap<String, usize>,
    cache: Option<Arc<dyn Cache>>,
    cache_config: Option<CacheConfig>,
    max_parallel: Option<usize>,
    events: EventSink,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("specs", &self.specs)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Workflow::with_registry(name, TaskRegistry::new())
    }

    pub fn with_registry(name: impl Into<String>, registry: TaskRegistry) -> Self {
        Workflow {
            name: name.into(),
            registry,
            specs: Vec::new(),
            index: HashMap::new(),
            cache: None,
            cache_config: None,
            max_parallel: None,
            events: EventSink::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    pub fn task(&self, instance_id: &str) -> Option<&TaskSpec> {
        self.index.get(instance_id).map(|&idx| &self.specs[idx])
    }

    pub fn task_mut(&mut self, instance_id: &str) -> Option<&mut TaskSpec> {
        let idx = *self.index.get(instance_id)?;
        Some(&mut self.specs[idx])
    }

    pub(crate) fn cache_config(&self) -> Option<&CacheConfig> {
        self.cache_config.as_ref()
    }

    pub fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    /// Cap the number of concurrently executing tasks. Unbounded by default.
    /// Streaming producer/consumer pairs need at least two slots.
    pub fn set_max_parallel(&mut self, limit: usize) {
        self.max_parallel = Some(limit.max(1));
    }

    /// Register a task constructor on the workflow's registry.
    pub fn register<F>(&mut self, task_type: impl Into<String>, constructor: F)
    where
        F: Fn(&str, &Value) -> Arc<dyn crate::task::Task> + Send + Sync + 'static,
    {
        self.registry.register(task_type, constructor);
    }

    /// Register a plain async function as a task type.
    pub fn register_function<F, Fut>(&mut self, task_type: impl Into<String>, func: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        self.registry.register_function(task_type, func);
    }

    /// Create a singleton task and return it for further configuration.
    pub fn create_task(
        &mut self,
        task_type: impl Into<String>,
        instance_id: impl Into<String>,
        config: Value,
    ) -> Result<&mut TaskSpec, EngineError> {
        self.add_task(TaskSpec::new(task_type, instance_id, config))
    }

    /// Add a fully built spec to the graph.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<&mut TaskSpec, EngineError> {
        if self.index.contains_key(&spec.instance_id) {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("duplicate task instance_id '{}'", spec.instance_id),
            ));
        }
        if !self.registry.contains(&spec.task_type) {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!(
                    "task '{}' uses unregistered type '{}'",
                    spec.instance_id, spec.task_type
                ),
            ));
        }
        self.index.insert(spec.instance_id.clone(), self.specs.len());
        self.specs.push(spec);
        let idx = self.specs.len() - 1;
        Ok(&mut self.specs[idx])
    }

    /// Declare that `child` waits for `parent`. Order of declaration drives
    /// the `prev*` aliases.
    pub fn add_dependency(&mut self, child: &str, parent: &str) -> Result<(), EngineError> {
        if child == parent {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("task '{}' cannot depend on itself", child),
            ));
        }
        if !self.index.contains_key(parent) {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("dependency '{}' of task '{}' does not exist", parent, child),
            ));
        }
        let idx = *self.index.get(child).ok_or_else(|| {
            EngineError::new(
                ErrorKind::Validation,
                format!("task '{}' does not exist", child),
            )
        })?;
        let deps = &mut self.specs[idx].dependencies;
        if !deps.contains(&parent.to_string()) {
            deps.push(parent.to_string());
        }
        Ok(())
    }

    pub fn set_cache(&mut self, cache: Arc<dyn Cache>) {
        self.cache = Some(cache);
        self.cache_config = None;
    }

    /// Build and attach a backend from its declarative description.
    pub fn set_cache_config(&mut self, config: CacheConfig) -> Result<(), EngineError> {
        self.cache = Some(from_config(&config)?);
        self.cache_config = Some(config);
        Ok(())
    }

    pub fn enable_memory_cache(&mut self, max_size: usize, default_ttl: Option<u64>) {
        self.set_cache(Arc::new(MemoryCache::new(max_size, default_ttl)));
        self.cache_config = Some(CacheConfig::Memory {
            max_size,
            default_ttl,
        });
    }

    pub async fn cache_stats(&self) -> Result<Option<CacheStats>, EngineError> {
        match &self.cache {
            Some(cache) => Ok(Some(cache.stats().await?)),
            None => Ok(None),
        }
    }

    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        if let Some(cache) = &self.cache {
            cache.clear().await?;
        }
        Ok(())
    }

    pub async fn cleanup_expired_cache(&self) -> Result<usize, EngineError> {
        match &self.cache {
            Some(cache) => cache.cleanup_expired().await,
            None => Ok(0),
        }
    }

    /// Subscribe to run-progress events.
    pub fn on_event(&mut self, tx: mpsc::UnboundedSender<RunEvent>) {
        self.events = EventSink::new(Some(tx));
    }

    /// Token cancelled by [`Workflow::cancel`]; callers may watch or cancel
    /// it directly.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every running and queued task. Running tasks receive the
    /// signal through their context token and are expected to return
    /// promptly; stragglers are abandoned after a grace period.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Validate the static graph: structural checks per spec, known types,
    /// existing dependencies, acyclicity, resolvable reference paths, and
    /// well-formed streaming pairs.
    pub fn validate(&self) -> Result<(), EngineError> {
        for spec in &self.specs {
            spec.validate()?;
            if !self.registry.contains(&spec.task_type) {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!(
                        "task '{}' uses unregistered type '{}'",
                        spec.instance_id, spec.task_type
                    ),
                ));
            }
            for dep in &spec.dependencies {
                if !self.index.contains_key(dep) {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!(
                            "task '{}' depends on unknown task '{}'",
                            spec.instance_id, dep
                        ),
                    ));
                }
                if dep == &spec.instance_id {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!("task '{}' cannot depend on itself", spec.instance_id),
                    ));
                }
            }
            if spec.fan_out.is_some() && (spec.produces_stream || spec.consumes_stream.is_some()) {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!("task '{}': fan-out tasks cannot take part in streaming", spec.instance_id),
                ));
            }
        }
        self.check_stream_pairs()?;
        self.check_acyclic()?;
        self.check_references()?;
        Ok(())
    }

    fn check_stream_pairs(&self) -> Result<(), EngineError> {
        let mut consumers_by_producer: HashMap<&str, &str> = HashMap::new();
        for spec in &self.specs {
            let Some(producer) = spec.consumes_stream.as_deref() else {
                continue;
            };
            let Some(&producer_idx) = self.index.get(producer) else {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!(
                        "task '{}' consumes stream of unknown task '{}'",
                        spec.instance_id, producer
                    ),
                ));
            };
            if !self.specs[producer_idx].produces_stream {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!(
                        "task '{}' consumes stream of '{}', which is not a producer",
                        spec.instance_id, producer
                    ),
                ));
            }
            if let Some(existing) = consumers_by_producer.insert(producer, &spec.instance_id) {
                return Err(EngineError::new(
                    ErrorKind::Validation,
                    format!(
                        "stream producer '{}' has two consumers: '{}' and '{}'",
                        producer, existing, spec.instance_id
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), EngineError> {
        let n = self.specs.len();
        let mut unmet: Vec<usize> = self.specs.iter().map(|s| s.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, spec) in self.specs.iter().enumerate() {
            for dep in &spec.dependencies {
                dependents[self.index[dep]].push(idx);
            }
        }
        let mut queue: VecDeque<usize> =
            (0..n).filter(|&idx| unmet[idx] == 0).collect();
        let mut visited = 0;
        while let Some(idx) = queue.pop_front() {
            visited += 1;
            for &dependent in &dependents[idx] {
                unmet[dependent] -= 1;
                if unmet[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if visited < n {
            let mut cyclic: Vec<&str> = self
                .specs
                .iter()
                .enumerate()
                .filter(|(idx, _)| unmet[*idx] > 0)
                .map(|(_, spec)| spec.instance_id.as_str())
                .collect();
            cyclic.sort_unstable();
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("dependency cycle involving: {}", cyclic.join(", ")),
            ));
        }
        Ok(())
    }

    /// Every reference path in configs, conditions, and `for_each` fields
    /// must point at a task in the graph or a resolvable `prev*` alias.
    fn check_references(&self) -> Result<(), EngineError> {
        for spec in &self.specs {
            let scope = RefScope::new(&spec.instance_id, &spec.dependencies);
            let mut paths = collect_references(&spec.config)
                .map_err(|err| err.with_task(spec.instance_id.clone()))?;
            if let Some(condition) = &spec.condition {
                paths.extend(
                    condition
                        .reference_paths()
                        .map_err(|err| err.with_task(spec.instance_id.clone()))?,
                );
            }
            if let Some(fan_out) = &spec.fan_out {
                paths.push(fan_out.for_each.clone());
                let template_refs = collect_references(&fan_out.config_template)
                    .map_err(|err| err.with_task(spec.instance_id.clone()))?;
                // `${item}` in a config template names the fan-out element,
                // not a task.
                paths.extend(
                    template_refs
                        .into_iter()
                        .filter(|path| path != "item" && !path.starts_with("item.")),
                );
            }
            for path in paths {
                let absolute = scope
                    .absolute_path(&path)
                    .map_err(|err| {
                        EngineError::new(ErrorKind::Validation, err.message)
                            .with_task(spec.instance_id.clone())
                    })?;
                let target = absolute.split('.').next().unwrap_or_default();
                if !self.index.contains_key(target) {
                    return Err(EngineError::new(
                        ErrorKind::Validation,
                        format!(
                            "task '{}' references unknown task '{}' via '{}'",
                            spec.instance_id, target, path
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run the workflow to completion and return every task's final result.
    pub async fn run(&self) -> Result<BTreeMap<String, TaskResult>, EngineError> {
        self.validate()?;
        let run_id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        tracing::info!(
            run_id = %run_id,
            workflow = %self.name,
            tasks = self.specs.len(),
            "workflow starting"
        );
        self.events.emit(RunEvent::WorkflowStarted {
            run_id,
            workflow: self.name.clone(),
        });

        let shared = Arc::new(RunShared {
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            store: Arc::new(RwLock::new(ValueStore::new())),
            inflight: InflightIndex::default(),
            events: self.events.clone(),
        });

        // Streaming channels exist before anything runs so producers and
        // consumers can start in either order.
        let mut senders: HashMap<usize, StreamSender> = HashMap::new();
        let mut receivers: HashMap<usize, StreamReceiver> = HashMap::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            if let Some(producer) = spec.consumes_stream.as_deref() {
                let producer_idx = self.index[producer];
                let capacity = self.specs[producer_idx].stream_capacity;
                let (tx, rx) = stream_channel(capacity);
                senders.insert(producer_idx, tx);
                receivers.insert(idx, rx);
            }
        }

        let n = self.specs.len();
        let mut unmet: Vec<usize> = self.specs.iter().map(|s| s.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, spec) in self.specs.iter().enumerate() {
            for dep in &spec.dependencies {
                dependents[self.index[dep]].push(idx);
            }
        }
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&idx| unmet[idx] == 0)
            .map(Reverse)
            .collect();
        let limit = self.max_parallel.unwrap_or(usize::MAX);

        let mut results: Vec<Option<TaskResult>> = (0..n).map(|_| None).collect();
        let mut blocked: HashMap<usize, String> = HashMap::new();
        let mut running: JoinSet<(usize, TaskResult)> = JoinSet::new();
        let mut running_idx: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut inline: VecDeque<(usize, TaskResult)> = VecDeque::new();
        let mut finished = 0usize;
        let mut cancelled = cancel.is_cancelled();

        while finished < n {
            while running.len() < limit {
                let Some(Reverse(idx)) = ready.pop() else { break };
                if cancelled {
                    // Close any stream ends the node would have owned so its
                    // peer observes end-of-stream instead of blocking.
                    senders.remove(&idx);
                    receivers.remove(&idx);
                    inline.push_back((idx, TaskResult::cancelled()));
                    continue;
                }
                if let Some(origin) = blocked.get(&idx) {
                    senders.remove(&idx);
                    receivers.remove(&idx);
                    let result = TaskResult::skipped_by_upstream(origin);
                    shared.events.emit(RunEvent::TaskSkipped {
                        instance_id: self.specs[idx].instance_id.clone(),
                        upstream: Some(origin.clone()),
                    });
                    tracing::info!(
                        task_id = %self.specs[idx].instance_id,
                        origin = %origin,
                        "task skipped: upstream failure"
                    );
                    inline.push_back((idx, result));
                    continue;
                }
                let spec = self.specs[idx].clone();
                let shared = Arc::clone(&shared);
                let node_cancel = cancel.clone();
                let stream_out = senders.remove(&idx);
                let stream_in = receivers.remove(&idx);
                let handle = running.spawn(async move {
                    let result = run_node(&spec, shared, node_cancel, stream_out, stream_in).await;
                    (idx, result)
                });
                running_idx.insert(handle.id(), idx);
            }

            let completion = if let Some(pair) = inline.pop_front() {
                Some(pair)
            } else if running.is_empty() {
                break;
            } else if cancelled {
                match timeout(
                    Duration::from_millis(CANCEL_GRACE_MS),
                    running.join_next_with_id(),
                )
                .await
                {
                    Ok(joined) => joined.map(|joined| match joined {
                        Ok((id, (idx, result))) => {
                            running_idx.remove(&id);
                            (idx, result)
                        }
                        Err(join_err) => {
                            let idx = running_idx.remove(&join_err.id()).unwrap_or_default();
                            (idx, panic_result(&self.specs[idx].instance_id, &join_err))
                        }
                    }),
                    Err(_) => {
                        // Grace expired: abandon the stragglers.
                        running.abort_all();
                        while let Some(joined) = running.join_next_with_id().await {
                            let (id, result) = match joined {
                                Ok((id, (idx, result))) => {
                                    running_idx.remove(&id);
                                    inline.push_back((idx, result));
                                    continue;
                                }
                                Err(join_err) => (join_err.id(), TaskResult::cancelled()),
                            };
                            if let Some(idx) = running_idx.remove(&id) {
                                inline.push_back((idx, result));
                            }
                        }
                        continue;
                    }
                }
            } else {
                tokio::select! {
                    joined = running.join_next_with_id() => joined.map(|joined| match joined {
                        Ok((id, (idx, result))) => {
                            running_idx.remove(&id);
                            (idx, result)
                        }
                        Err(join_err) => {
                            let idx = running_idx.remove(&join_err.id()).unwrap_or_default();
                            (idx, panic_result(&self.specs[idx].instance_id, &join_err))
                        }
                    }),
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        continue;
                    }
                }
            };

            let Some((idx, result)) = completion else { continue };
            if results[idx].is_some() {
                continue;
            }

            let instance_id = &self.specs[idx].instance_id;
            shared
                .store
                .write()
                .await
                .put(instance_id.clone(), result.clone());

            // Failures block dependents; inherited skips propagate the
            // original failure's instance id.
            let origin = if !result.success && !result.skipped {
                Some(
                    result
                        .error
                        .as_ref()
                        .and_then(|err| err.origin.clone())
                        .unwrap_or_else(|| instance_id.clone()),
                )
            } else if result.skipped {
                result.error.as_ref().and_then(|err| err.origin.clone())
            } else {
                None
            };
            for &dependent in &dependents[idx] {
                if let Some(origin) = &origin {
                    blocked.entry(dependent).or_insert_with(|| origin.clone());
                }
                unmet[dependent] -= 1;
                if unmet[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
            results[idx] = Some(result);
            finished += 1;
        }

        let mut summary = BTreeMap::new();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for (spec, result) in self.specs.iter().zip(results.into_iter()) {
            let result = result.unwrap_or_else(TaskResult::cancelled);
            if result.skipped {
                skipped += 1;
            } else if result.success {
                succeeded += 1;
            } else {
                failed += 1;
            }
            summary.insert(spec.instance_id.clone(), result);
        }
        tracing::info!(
            run_id = %run_id,
            workflow = %self.name,
            succeeded,
            failed,
            skipped,
            "workflow finished"
        );
        self.events.emit(RunEvent::WorkflowFinished {
            run_id,
            succeeded,
            failed,
            skipped,
        });
        Ok(summary)
    }
}

/// State shared by every node of one run.
struct RunShared {
    registry: TaskRegistry,
    cache: Option<Arc<dyn Cache>>,
    store: Arc<RwLock<ValueStore>>,
    inflight: InflightIndex,
    events: EventSink,
}

fn panic_result(instance_id: &str, join_err: &tokio::task::JoinError) -> TaskResult {
    if join_err.is_cancelled() {
        return TaskResult::cancelled();
    }
    let err = EngineError::new(
        ErrorKind::Task,
        format!("task '{}' panicked: {}", instance_id, join_err),
    );
    TaskResult::failed(&err, Utc::now(), 1)
}

/// Execute one graph node and publish its result.
///
/// The result lands in the ValueStore before the node's stream sender (if
/// any) is dropped, so a consumer observing end-of-stream can immediately
/// resolve the producer's final output.
async fn run_node(
    spec: &TaskSpec,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
    stream_out: Option<StreamSender>,
    stream_in: Option<StreamReceiver>,
) -> TaskResult {
    let result = run_node_inner(spec, &shared, &cancel, stream_out.clone(), stream_in).await;
    shared
        .store
        .write()
        .await
        .put(spec.instance_id.clone(), result.clone());
    if let Some(sender) = &stream_out {
        if !result.success {
            let message = result
                .error
                .as_ref()
                .map(|err| err.message.clone())
                .unwrap_or_else(|| "producer failed".to_string());
            sender.abort(message).await;
        }
    }
    result
}

/// Condition gate, then fan-out expansion or the singleton pipeline.
async fn run_node_inner(
    spec: &TaskSpec,
    shared: &Arc<RunShared>,
    cancel: &CancellationToken,
    stream_out: Option<StreamSender>,
    stream_in: Option<StreamReceiver>,
) -> TaskResult {
    let deps = Arc::new(spec.dependencies.clone());

    if let Some(condition) = &spec.condition {
        let verdict = {
            let store = shared.store.read().await;
            let scope = RefScope::new(&spec.instance_id, &deps);
            condition.evaluate(&store, &scope)
        };
        match verdict {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(task_id = %spec.instance_id, "task skipped: condition false");
                shared.events.emit(RunEvent::TaskSkipped {
                    instance_id: spec.instance_id.clone(),
                    upstream: None,
                });
                return TaskResult::skipped_by_condition();
            }
            Err(err) => {
                let err = err.with_task(spec.instance_id.clone());
                tracing::warn!(task_id = %spec.instance_id, error = %err, "condition failed");
                return TaskResult::failed(&err, Utc::now(), 0);
            }
        }
    }

    if spec.fan_out.is_some() {
        return run_fan_out(spec, &deps, shared, cancel).await;
    }

    execute_pipeline(spec, &deps, shared, cancel, stream_out, stream_in).await
}

/// Expand a fan-out spec into one child per element and aggregate the
/// children in input order.
async fn run_fan_out(
    spec: &TaskSpec,
    deps: &Arc<Vec<String>>,
    shared: &Arc<RunShared>,
    cancel: &CancellationToken,
) -> TaskResult {
    let started_at = Utc::now();
    let fan_out = spec.fan_out.as_ref().expect("fan-out spec");
    let elements = {
        let store = shared.store.read().await;
        let scope = RefScope::new(&spec.instance_id, deps);
        match store.resolve_path(&fan_out.for_each, &scope) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                let err = EngineError::new(
                    ErrorKind::Reference,
                    format!(
                        "for_each path '{}' must resolve to a list, got {}",
                        fan_out.for_each,
                        match other {
                            Value::Null => "null",
                            Value::Bool(_) => "bool",
                            Value::Number(_) => "number",
                            Value::String(_) => "string",
                            Value::Object(_) => "map",
                            Value::Array(_) => unreachable!(),
                        }
                    ),
                )
                .with_task(spec.instance_id.clone());
                return TaskResult::failed(&err, started_at, 0);
            }
            Err(err) => {
                return TaskResult::failed(&err.with_task(spec.instance_id.clone()), started_at, 0)
            }
        }
    };

    tracing::info!(
        task_id = %spec.instance_id,
        children = elements.len(),
        max_concurrent = fan_out.max_concurrent,
        "fan-out expanding"
    );

    let mut children: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = TaskResult> + Send>>> =
        Vec::with_capacity(elements.len());
    for (position, element) in elements.iter().enumerate() {
        let shared = Arc::clone(shared);
        let cancel = cancel.clone();
        let deps = Arc::clone(deps);
        let parent = spec;
        let element = element.clone();
        children.push(Box::pin(async move {
            let mut child = parent.clone();
            child.instance_id = format!("{}_{}", parent.instance_id, position);
            child.fan_out = None;
            child.condition = None;
            match apply_element(&parent.fan_out.as_ref().expect("fan-out spec").config_template, &element)
            {
                Ok(config) => child.config = config,
                Err(err) => {
                    let err = err.with_task(child.instance_id.clone());
                    return TaskResult::failed(&err, Utc::now(), 0);
                }
            }
            execute_pipeline(&child, &deps, &shared, &cancel, None, None).await
        }));
    }
    let child_results: Vec<TaskResult> = futures::stream::iter(children)
        .buffered(fan_out.max_concurrent)
        .collect()
        .await;

    let success_count = child_results.iter().filter(|r| r.success).count();
    let failure_count = child_results.len() - success_count;
    let mut output = Map::new();
    output.insert(
        "results".to_string(),
        Value::Array(child_results.iter().map(|r| r.output.clone()).collect()),
    );
    output.insert(
        "success_count".to_string(),
        Value::Number(Number::from(success_count)),
    );
    output.insert(
        "failure_count".to_string(),
        Value::Number(Number::from(failure_count)),
    );
    output.insert("items".to_string(), Value::Array(elements));
    let output = Value::Object(output);

    // Every child failing fails the group; anything less is partial success.
    if success_count == 0 && failure_count > 0 {
        let err = EngineError::new(
            ErrorKind::Task,
            format!("all {} fan-out children failed", failure_count),
        )
        .with_task(spec.instance_id.clone());
        let mut result = TaskResult::failed(&err, started_at, 1);
        result.output = output;
        shared.events.emit(RunEvent::TaskCompleted {
            instance_id: spec.instance_id.clone(),
            success: false,
            from_cache: false,
            attempts: 1,
        });
        return result;
    }
    shared.events.emit(RunEvent::TaskCompleted {
        instance_id: spec.instance_id.clone(),
        success: true,
        from_cache: false,
        attempts: 1,
    });
    TaskResult::completed(output, started_at, 1)
}

/// The singleton execution pipeline: interpolate, consult the cache, run with
/// retries and a timeout, publish the outcome.
async fn execute_pipeline(
    spec: &TaskSpec,
    deps: &Arc<Vec<String>>,
    shared: &Arc<RunShared>,
    cancel: &CancellationToken,
    stream_out: Option<StreamSender>,
    stream_in: Option<StreamReceiver>,
) -> TaskResult {
    let started_at = Utc::now();

    let interpolated = {
        let store = shared.store.read().await;
        let scope = RefScope::new(&spec.instance_id, deps);
        interpolate_value(&spec.config, &store, &scope)
    };
    let interpolated = match interpolated {
        Ok(interpolated) => interpolated,
        Err(err) => {
            let err = err.with_task(spec.instance_id.clone());
            tracing::warn!(task_id = %spec.instance_id, error = %err, "config resolution failed");
            return TaskResult::failed(&err, started_at, 0);
        }
    };
    let config = interpolated.value;

    let cache_key = match (&shared.cache, spec.cache.enabled) {
        (Some(_), true) => {
            let store = shared.store.read().await;
            let upstream: BTreeMap<String, Value> = interpolated
                .referenced
                .iter()
                .filter_map(|id| store.get(id).map(|r| (id.clone(), r.output.clone())))
                .collect();
            Some(fingerprint(
                &spec.task_type,
                &config,
                &upstream,
                spec.cache.version.as_deref(),
            ))
        }
        _ => None,
    };

    if let Some(key) = &cache_key {
        let cache = shared.cache.as_ref().expect("cache present");
        if let Some(hit) = cache_lookup(cache, key, &spec.instance_id).await {
            shared.events.emit(RunEvent::TaskCompleted {
                instance_id: spec.instance_id.clone(),
                success: true,
                from_cache: true,
                attempts: 0,
            });
            return TaskResult::from_cache(hit, started_at);
        }

        // One computation per fingerprint per run: later holders of the
        // lease re-check the cache and reuse the first result.
        let lease = shared.inflight.lease(key);
        let _guard = lease.lock().await;
        if let Some(hit) = cache_lookup(cache, key, &spec.instance_id).await {
            shared.events.emit(RunEvent::TaskCompleted {
                instance_id: spec.instance_id.clone(),
                success: true,
                from_cache: true,
                attempts: 0,
            });
            return TaskResult::from_cache(hit, started_at);
        }

        let result =
            execute_with_retries(spec, &config, deps, shared, cancel, stream_out, stream_in, started_at)
                .await;
        if result.success {
            if let Err(err) = cache.put(key, &result.output, spec.cache.ttl_seconds).await {
                tracing::warn!(
                    task_id = %spec.instance_id,
                    error = %err,
                    "cache write failed; result delivered uncached"
                );
            }
        }
        return result;
    }

    execute_with_retries(spec, &config, deps, shared, cancel, stream_out, stream_in, started_at)
        .await
}

async fn cache_lookup(cache: &Arc<dyn Cache>, key: &str, instance_id: &str) -> Option<Value> {
    match cache.get(key).await {
        Ok(Some(entry)) => {
            tracing::info!(task_id = %instance_id, "cache hit");
            Some(entry.value)
        }
        Ok(None) => None,
        Err(err) => {
            // Backend trouble reads as a miss; the task still runs.
            tracing::warn!(task_id = %instance_id, error = %err, "cache read failed");
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_with_retries(
    spec: &TaskSpec,
    config: &Value,
    deps: &Arc<Vec<String>>,
    shared: &Arc<RunShared>,
    cancel: &CancellationToken,
    stream_out: Option<StreamSender>,
    mut stream_in: Option<StreamReceiver>,
    started_at: chrono::DateTime<Utc>,
) -> TaskResult {
    let task = match shared
        .registry
        .construct(&spec.task_type, &spec.instance_id, config)
    {
        Ok(task) => task,
        Err(err) => {
            let err = err.with_task(spec.instance_id.clone());
            return TaskResult::failed(&err, started_at, 0);
        }
    };

    let max_attempts = spec.retry.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            let err = EngineError::new(ErrorKind::Cancelled, "workflow cancelled")
                .with_task(spec.instance_id.clone());
            return TaskResult::failed(&err, started_at, attempt.saturating_sub(1));
        }
        tracing::info!(
            task_id = %spec.instance_id,
            task_type = %spec.task_type,
            attempt,
            max_attempts,
            "task starting"
        );
        shared.events.emit(RunEvent::TaskStarted {
            instance_id: spec.instance_id.clone(),
            attempt,
        });

        let attempt_cancel = cancel.child_token();
        let ctx = TaskContext::new(
            spec.instance_id.clone(),
            config.clone(),
            attempt,
            attempt_cancel.clone(),
            Arc::clone(&shared.store),
            Arc::clone(deps),
            stream_out.clone(),
            stream_in.take(),
        );

        let execution = task.execute(ctx);
        let outcome = match spec.timeout_ms {
            Some(budget) => match timeout(Duration::from_millis(budget), execution).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Cooperative cancellation of the abandoned attempt.
                    attempt_cancel.cancel();
                    Err(EngineError::new(
                        ErrorKind::Timeout,
                        format!("task timed out after {} ms", budget),
                    ))
                }
            },
            None => execution.await,
        };

        match outcome {
            Ok(output) => {
                tracing::info!(task_id = %spec.instance_id, attempt, "task completed");
                shared.events.emit(RunEvent::TaskCompleted {
                    instance_id: spec.instance_id.clone(),
                    success: true,
                    from_cache: false,
                    attempts: attempt,
                });
                return TaskResult::completed(output, started_at, attempt);
            }
            Err(err) => {
                let err = err.with_task(spec.instance_id.clone());
                let out_of_attempts = attempt >= max_attempts;
                if out_of_attempts || !err.is_retriable() || cancel.is_cancelled() {
                    tracing::warn!(
                        task_id = %spec.instance_id,
                        attempt,
                        error = %err,
                        "task failed"
                    );
                    shared.events.emit(RunEvent::TaskCompleted {
                        instance_id: spec.instance_id.clone(),
                        success: false,
                        from_cache: false,
                        attempts: attempt,
                    });
                    return TaskResult::failed(&err, started_at, attempt);
                }
                tracing::warn!(
                    task_id = %spec.instance_id,
                    attempt,
                    backoff_ms = spec.retry.backoff_ms,
                    error = %err,
                    "task attempt failed; retrying"
                );
                if spec.retry.backoff_ms > 0 {
                    tokio::select! {
                        _ = sleep(Duration::from_millis(spec.retry.backoff_ms)) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }
}
