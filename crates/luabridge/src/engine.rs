//! Engine instances: one Lua state, one handle registry, one engine lock.
//!
//! An [`Engine`] is a cheap, cloneable reference. Every operation on the
//! Lua state happens through a [`Session`], which holds the engine lock
//! for its lifetime. The lock is re-entrant, so host functions called from
//! scripts can open a nested session on the same thread.

use crate::callbacks::BridgeContext;
use crate::config::BridgeConfig;
use crate::error::{AccessError, Error, Result, StackEntry, StatusCode, SubmitError};
use crate::instances::{self, InstanceId};
use crate::logging;
use crate::reflect::StructRef;
use crate::registry::{Handle, Registry};
use crate::session::Session;
use crate::stack::ValueStack;
use crate::tasks::{self, TaskQueue, TaskStats, TaskStatsSnapshot};
use crate::value::ScriptValue;
use mlua::{Function, Lua, LuaOptions, RegistryKey, Value};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// State reachable only while the engine lock is held.
pub(crate) struct EngineState {
    pub(crate) stack: RefCell<ValueStack>,
    pub(crate) failure: RefCell<Option<AccessError>>,
    pub(crate) xpcall: RegistryKey,
    pub(crate) handler: RegistryKey,
    pub(crate) trace: Arc<Mutex<Vec<StackEntry>>>,
    // Dropped last: closing the state finalizes every handle userdata.
    pub(crate) lua: Lua,
}

pub(crate) struct EngineShared {
    pub(crate) id: InstanceId,
    pub(crate) state: ReentrantMutex<EngineState>,
    pub(crate) registry: Arc<Registry>,
    tasks: Mutex<Option<TaskQueue>>,
    stats: Arc<TaskStats>,
    config: BridgeConfig,
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        instances::unregister(self.id);
        let released = self.registry.clear();
        debug!(instance = %self.id, released, "engine closed");
    }
}

/// Handle to one engine instance.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        if config.log.install {
            logging::ensure_logging(&config.log)
                .map_err(|err| Error::Config(err.to_string()))?;
        }
        let lua = Lua::new_with(config.std_libs()?, LuaOptions::default())?;

        let trace = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&trace);
        let handler = lua.create_function(move |lua, raised: Value| {
            *sink.lock() = capture_stack(lua);
            Ok(raised)
        })?;
        let handler = lua.create_registry_value(handler)?;
        let xpcall: Function = lua.globals().get("xpcall")?;
        let xpcall = lua.create_registry_value(xpcall)?;

        let id = InstanceId::next();
        let shared = Arc::new_cyclic(|weak| {
            lua.set_app_data(BridgeContext {
                engine: weak.clone(),
            });
            EngineShared {
                id,
                state: ReentrantMutex::new(EngineState {
                    stack: RefCell::new(ValueStack::new()),
                    failure: RefCell::new(None),
                    xpcall,
                    handler,
                    trace,
                    lua,
                }),
                registry: Arc::new(Registry::new()),
                tasks: Mutex::new(None),
                stats: Arc::new(TaskStats::default()),
                config,
            }
        });

        if shared.config.worker.enabled {
            let queue = TaskQueue::spawn(
                Arc::downgrade(&shared),
                id,
                Arc::clone(&shared.stats),
                shared.config.worker.queue_capacity,
            )
            .map_err(Error::Spawn)?;
            *shared.tasks.lock() = Some(queue);
        }

        instances::register(id, Arc::downgrade(&shared));
        debug!(
            instance = %id,
            worker = shared.config.worker.enabled,
            "engine created"
        );
        Ok(Self { shared })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(BridgeConfig::default())
    }

    pub(crate) fn from_shared(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> InstanceId {
        self.shared.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Acquire the engine lock, blocking until it is free.
    pub fn lock(&self) -> Session<'_> {
        Session::new(&self.shared)
    }

    /// Acquire the engine lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<Session<'_>> {
        self.shared
            .state
            .try_lock_for(timeout)
            .map(|guard| Session::from_guard(&self.shared, guard))
    }

    /// Queue `task` for the worker thread.
    ///
    /// Blocks while the queue is full, up to the configured submit timeout.
    pub fn submit<F>(&self, task: F) -> std::result::Result<(), SubmitError>
    where
        F: FnOnce(&Session<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let sender = match self.shared.tasks.lock().as_ref() {
            Some(queue) => queue.sender(),
            None if self.shared.config.worker.enabled => return Err(SubmitError::Disconnected),
            None => return Err(SubmitError::NoWorker),
        };
        tasks::submit(
            &sender,
            Box::new(task),
            self.shared.config.worker.submit_timeout(),
        )
    }

    pub fn task_stats(&self) -> TaskStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop the worker after it drains queued tasks, then drop this handle.
    ///
    /// The Lua state closes once the last handle is gone. When the current
    /// thread holds a session on this engine, queued tasks cannot run until
    /// it is released, so the worker is detached instead of joined.
    pub fn close(self) {
        let queue = self.shared.tasks.lock().take();
        if let Some(queue) = queue {
            let held = self.shared.state.is_owned_by_current_thread();
            if held {
                warn!(
                    instance = %self.shared.id,
                    "engine closed while its lock is held; worker drains after release"
                );
            }
            queue.shutdown(!held);
        }
        debug!(instance = %self.shared.id, "engine close requested");
    }

    pub fn do_string(&self, source: &str) -> Result<()> {
        self.lock().do_string(source)
    }

    pub fn register_function<F>(&self, name: &str, function: F) -> Result<Handle>
    where
        F: Fn(&Session<'_>) -> Result<usize> + Send + Sync + 'static,
    {
        self.lock().register_function(name, function)
    }

    pub fn expose(&self, name: &str, value: impl Into<StructRef>) -> Result<Handle> {
        self.lock().expose(name, value)
    }

    pub fn call_global(
        &self,
        name: &str,
        args: impl IntoIterator<Item = ScriptValue>,
        results: Option<usize>,
    ) -> Result<Vec<ScriptValue>> {
        self.lock().call_global(name, args, results)
    }
}

fn capture_stack(lua: &Lua) -> Vec<StackEntry> {
    let mut frames = Vec::new();
    // Level 0 is the message handler itself.
    let mut level = 1;
    while let Some(debug) = lua.inspect_stack(level) {
        let names = debug.names();
        let source = debug.source();
        frames.push(StackEntry {
            name: names.name.map(|name| name.to_string()).unwrap_or_default(),
            source: source.source.map(|s| s.to_string()).unwrap_or_default(),
            short_source: source.short_src.map(|s| s.to_string()).unwrap_or_default(),
            current_line: debug.curr_line(),
        });
        level += 1;
    }
    frames
}

fn root_cause(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Render a raised error value as text.
pub(crate) fn describe_error(raised: &Value<'_>) -> String {
    match raised {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Error(err) => root_cause(err),
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

pub(crate) fn status_of(raised: &Value<'_>, message: &str) -> StatusCode {
    match raised {
        Value::Error(mlua::Error::MemoryError(_)) => StatusCode::Memory,
        _ if message == "not enough memory" => StatusCode::Memory,
        _ if message == "error in error handling" => StatusCode::Handler,
        _ => StatusCode::Runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn engine() -> Engine {
        Engine::with_defaults().unwrap()
    }

    #[test]
    fn engines_are_independent() {
        let a = engine();
        let b = engine();
        assert_ne!(a.id(), b.id());
        a.do_string("x = 1").unwrap();
        b.do_string("x = 2").unwrap();
        let ax = a.lock().eval("return x").unwrap();
        let bx = b.lock().eval("return x").unwrap();
        assert_eq!(ax, vec![ScriptValue::Integer(1)]);
        assert_eq!(bx, vec![ScriptValue::Integer(2)]);
    }

    #[test]
    fn lookup_finds_live_engine() {
        let engine = engine();
        let found = instances::lookup(engine.id()).unwrap();
        assert_eq!(found.id(), engine.id());
    }

    #[test]
    fn dropping_last_handle_unregisters() {
        let engine = engine();
        let id = engine.id();
        let clone = engine.clone();
        drop(engine);
        assert!(instances::lookup(id).is_some());
        clone.close();
        assert!(instances::lookup(id).is_none());
    }

    #[test]
    fn lock_is_reentrant() {
        let engine = engine();
        let outer = engine.lock();
        outer.push_integer(1);
        let inner = engine.lock();
        assert_eq!(inner.get_top(), 1);
    }

    #[test]
    fn try_lock_times_out_while_held_elsewhere() {
        let engine = engine();
        let held = engine.lock();
        let other = engine.clone();
        let acquired = thread::spawn(move || {
            other
                .try_lock_for(Duration::from_millis(20))
                .is_some()
        })
        .join()
        .unwrap();
        assert!(!acquired);
        drop(held);
        assert!(engine.try_lock_for(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn debug_library_is_not_opened() {
        let engine = engine();
        let result = engine.lock().eval("return debug").unwrap();
        assert_eq!(result, vec![ScriptValue::Nil]);
    }

    #[test]
    fn configured_libraries_only() {
        let config = BridgeConfig {
            libraries: vec!["string".to_string()],
            ..BridgeConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        let result = engine.lock().eval("return math, string.upper('a')").unwrap();
        assert_eq!(result, vec![ScriptValue::Nil, ScriptValue::from("A")]);
    }

    #[test]
    fn submit_without_worker() {
        let mut config = BridgeConfig::default();
        config.worker.enabled = false;
        let engine = Engine::new(config).unwrap();
        assert_eq!(
            engine.submit(|_session: &Session<'_>| Ok(())),
            Err(SubmitError::NoWorker)
        );
    }

    #[test]
    fn submit_after_close_is_disconnected() {
        let engine = engine();
        let clone = engine.clone();
        engine.close();
        assert_eq!(
            clone.submit(|_session: &Session<'_>| Ok(())),
            Err(SubmitError::Disconnected)
        );
    }

    #[test]
    fn close_while_holding_a_session_returns() {
        let engine = engine();
        let clone = engine.clone();
        let session = clone.lock();
        engine
            .submit(|s: &Session<'_>| {
                s.do_string("ran = true")?;
                Ok(())
            })
            .unwrap();
        engine.close();
        assert_eq!(
            clone.submit(|_session: &Session<'_>| Ok(())),
            Err(SubmitError::Disconnected)
        );
        assert_eq!(clone.task_stats().completed, 0);
        drop(session);

        let deadline = Instant::now() + Duration::from_secs(5);
        while clone.task_stats().completed == 0 {
            assert!(Instant::now() < deadline, "queued task never ran");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            clone.lock().eval("return ran").unwrap(),
            vec![ScriptValue::Boolean(true)]
        );
    }

    #[test]
    fn creating_an_engine_installs_logging() {
        let _engine = engine();
        assert!(logging::is_logging_initialized());
    }

    #[test]
    fn describe_error_renders_values() {
        let lua = Lua::new();
        let message = lua.create_string("boom").unwrap();
        assert_eq!(describe_error(&Value::String(message)), "boom");
        assert_eq!(describe_error(&Value::Nil), "nil");
        let table = lua.create_table().unwrap();
        assert_eq!(
            describe_error(&Value::Table(table)),
            "(error object is a table value)"
        );
    }
}
