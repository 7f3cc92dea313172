//! Scoped access to an engine while its lock is held.
//!
//! A [`Session`] is the only way to touch an engine's Lua state or its
//! evaluation stack. Dropping it releases the engine lock on every exit
//! path. Sessions nest on one thread: host functions called from scripts
//! receive a session of their own, scoped to a fresh stack frame.
//!
//! Stack operations follow the Lua C API conventions (1-based indices,
//! negative indices from the top) but take and return owned values.

use crate::callbacks;
use crate::engine::{EngineShared, EngineState, describe_error, status_of};
use crate::error::{AccessError, CoercionError, Error, Result, ScriptError, StatusCode};
use crate::instances::InstanceId;
use crate::marshal::{self, coerce_arg};
use crate::reflect::{Marshal, StructRef};
use crate::registry::{Entry, EntryKind, Handle, HostFunction, Registry};
use crate::stack::{StackMark, ValueStack};
use crate::value::{HostValue, Kind, ScriptFunction, ScriptRef, ScriptType, ScriptValue};
use bstr::BString;
use mlua::{Function, Lua, MultiValue, Value};
use parking_lot::ReentrantMutexGuard;
use std::cell::RefMut;
use std::path::Path;
use std::sync::Arc;

/// Engine lock guard plus the operations valid while it is held.
pub struct Session<'a> {
    engine: &'a EngineShared,
    state: ReentrantMutexGuard<'a, EngineState>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(engine: &'a EngineShared) -> Self {
        Self {
            engine,
            state: engine.state.lock(),
        }
    }

    pub(crate) fn from_guard(
        engine: &'a EngineShared,
        state: ReentrantMutexGuard<'a, EngineState>,
    ) -> Self {
        Self { engine, state }
    }

    pub(crate) fn lua(&self) -> &Lua {
        &self.state.lua
    }

    fn stack(&self) -> RefMut<'_, ValueStack> {
        self.state.stack.borrow_mut()
    }

    pub fn engine_id(&self) -> InstanceId {
        self.engine.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.engine.registry
    }

    // ── frames ──────────────────────────────────────────────────

    pub(crate) fn enter_frame(&self, args: Vec<ScriptValue>) {
        self.stack().enter(args);
    }

    pub(crate) fn leave_frame(&self, results: usize) -> Result<Vec<ScriptValue>> {
        self.stack().leave(results)
    }

    pub(crate) fn mark(&self) -> StackMark {
        self.stack().mark()
    }

    pub(crate) fn restore(&self, mark: StackMark) {
        self.stack().restore(mark);
    }

    pub(crate) fn record_access_failure(&self, err: AccessError) {
        *self.state.failure.borrow_mut() = Some(err);
    }

    /// The most recent failed field read, field write or host call made
    /// from a script, if any. Clears the record.
    pub fn take_access_failure(&self) -> Option<AccessError> {
        self.state.failure.borrow_mut().take()
    }

    // ── push ────────────────────────────────────────────────────

    pub fn push(&self, value: ScriptValue) {
        self.stack().push(value);
    }

    pub fn push_nil(&self) {
        self.push(ScriptValue::Nil);
    }

    pub fn push_boolean(&self, value: bool) {
        self.push(ScriptValue::Boolean(value));
    }

    pub fn push_integer(&self, value: i64) {
        self.push(ScriptValue::Integer(value));
    }

    pub fn push_number(&self, value: f64) {
        self.push(ScriptValue::Number(value));
    }

    pub fn push_string(&self, value: &str) {
        self.push(ScriptValue::String(BString::from(value)));
    }

    pub fn push_bytes(&self, value: &[u8]) {
        self.push(ScriptValue::String(BString::from(value)));
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&self, idx: i32) -> Result<()> {
        let value = self.value(idx).ok_or(Error::InvalidIndex(idx))?;
        self.push(value);
        Ok(())
    }

    /// Register `function` under a fresh handle and push it.
    pub fn push_function<F>(&self, function: F) -> Result<Handle>
    where
        F: Fn(&Session<'_>) -> Result<usize> + Send + Sync + 'static,
    {
        self.push_host_function(Arc::new(function))
    }

    pub fn push_host_function(&self, function: HostFunction) -> Result<Handle> {
        self.push_entry(Entry::Function(function))
    }

    /// Register `value` under a fresh handle and push it.
    pub fn push_struct(&self, value: impl Into<StructRef>) -> Result<Handle> {
        self.push_entry(Entry::Struct(value.into()))
    }

    fn push_entry(&self, entry: Entry) -> Result<Handle> {
        let value = callbacks::new_handle(self.lua(), self.registry(), entry)?;
        let handle = value
            .handle()
            .ok_or_else(|| Error::Lua(mlua::Error::RuntimeError("handle userdata expected".into())))?;
        self.push(value);
        Ok(handle)
    }

    /// Push a host value. Returns `false`, pushing nothing, for kinds with
    /// no script mapping.
    pub fn push_host(&self, value: HostValue) -> Result<bool> {
        match marshal::to_script(self.lua(), self.registry(), value)? {
            Some(value) => {
                self.push(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── stack ───────────────────────────────────────────────────

    pub fn get_top(&self) -> usize {
        self.stack().top()
    }

    pub fn set_top(&self, idx: i32) -> Result<()> {
        self.stack().set_top(idx)
    }

    pub fn pop(&self, n: usize) -> Result<()> {
        self.stack().pop_n(n).map(drop)
    }

    pub fn remove(&self, idx: i32) -> Result<()> {
        self.stack().remove(idx).map(drop)
    }

    /// Snapshot of the value at `idx`.
    pub fn value(&self, idx: i32) -> Option<ScriptValue> {
        self.stack().get(idx).cloned()
    }

    fn pop_one(&self) -> Result<ScriptValue> {
        self.stack().pop().ok_or(Error::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    pub fn type_of(&self, idx: i32) -> ScriptType {
        self.stack()
            .get(idx)
            .map_or(ScriptType::None, ScriptValue::script_type)
    }

    // ── predicates ──────────────────────────────────────────────

    pub fn is_nil(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Nil
    }

    pub fn is_none(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::None
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), ScriptType::None | ScriptType::Nil)
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Boolean
    }

    pub fn is_number(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Number
    }

    /// Strings only; numbers are not treated as strings.
    pub fn is_string(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::String
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Table
    }

    /// Script functions only; see [`Session::is_host_function`].
    pub fn is_function(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Function
    }

    pub fn is_host_function(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::HostFunction
    }

    pub fn is_host_struct(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::HostStruct
    }

    /// Any userdata, handles included.
    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(
            self.type_of(idx),
            ScriptType::UserData | ScriptType::HostFunction | ScriptType::HostStruct
        )
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        self.type_of(idx) == ScriptType::Thread
    }

    // ── accessors ───────────────────────────────────────────────

    /// Convert the value at `idx` to `M` using the argument coercion rules.
    pub fn to_host<M: Marshal>(&self, idx: i32) -> std::result::Result<M, CoercionError> {
        let value = self.value(idx);
        let converted = coerce_arg(self.registry(), M::KIND, value.as_ref())?;
        let found = converted.kind_name();
        M::from_host(converted).ok_or(CoercionError::Rejected {
            expected: M::KIND,
            found,
        })
    }

    pub fn to_boolean(&self, idx: i32) -> std::result::Result<bool, CoercionError> {
        self.to_host(idx)
    }

    pub fn to_integer(&self, idx: i32) -> std::result::Result<i64, CoercionError> {
        self.to_host(idx)
    }

    pub fn to_number(&self, idx: i32) -> std::result::Result<f64, CoercionError> {
        self.to_host(idx)
    }

    /// Lossy for non-UTF-8 strings; use [`Session::to_bytes`] for raw data.
    pub fn to_string(&self, idx: i32) -> std::result::Result<String, CoercionError> {
        self.to_host(idx)
    }

    pub fn to_bytes(&self, idx: i32) -> std::result::Result<Vec<u8>, CoercionError> {
        self.to_host(idx)
    }

    pub fn to_struct(&self, idx: i32) -> std::result::Result<StructRef, CoercionError> {
        self.to_host(idx)
    }

    /// Pin the script function at `idx` so the host can call it later.
    pub fn to_function_ref(&self, idx: i32) -> std::result::Result<ScriptFunction, CoercionError> {
        self.to_host(idx)
    }

    pub fn to_host_function(&self, idx: i32) -> std::result::Result<HostFunction, CoercionError> {
        match self.value(idx) {
            Some(ScriptValue::Handle {
                handle,
                kind: EntryKind::Function,
                ..
            }) => self
                .registry()
                .resolve_function(handle)
                .ok_or(CoercionError::UnknownHandle(handle)),
            Some(ScriptValue::Handle { handle, .. }) => Err(CoercionError::NotAFunction(handle)),
            other => Err(CoercionError::Mismatch {
                expected: Kind::Function,
                found: other.map_or(ScriptType::None, |v| v.script_type()),
            }),
        }
    }

    pub fn to_handle(&self, idx: i32) -> std::result::Result<Handle, CoercionError> {
        match self.value(idx) {
            Some(ScriptValue::Handle { handle, .. }) => Ok(handle),
            other => Err(CoercionError::Mismatch {
                expected: Kind::Struct,
                found: other.map_or(ScriptType::None, |v| v.script_type()),
            }),
        }
    }

    // ── globals and tables ──────────────────────────────────────

    /// Push the global `name`.
    pub fn get_global(&self, name: &str) -> Result<()> {
        let value: Value = self.lua().globals().get(name)?;
        let value = ScriptValue::from_lua(self.lua(), value)?;
        self.push(value);
        Ok(())
    }

    /// Pop the top value into the global `name`.
    pub fn set_global(&self, name: &str) -> Result<()> {
        let value = self.pop_one()?;
        self.lua().globals().set(name, value.to_lua(self.lua())?)?;
        Ok(())
    }

    pub fn new_table(&self) -> Result<()> {
        let table = self.lua().create_table()?;
        let value = ScriptValue::from_lua(self.lua(), Value::Table(table))?;
        self.push(value);
        Ok(())
    }

    /// Push `t[key]` where `t` is the table or host struct at `idx`.
    ///
    /// Always pushes exactly one value; a failed host-struct read pushes
    /// nil and is reported by [`Session::take_access_failure`].
    pub fn get_field(&self, idx: i32, key: &str) -> Result<()> {
        let target = self.value(idx).ok_or(Error::InvalidIndex(idx))?;
        let value = match &target {
            ScriptValue::Table(pinned) => {
                let Value::Table(table) = pinned.get(self.lua())? else {
                    return Err(not_indexable(ScriptType::Table));
                };
                let value: Value = table.get(key)?;
                ScriptValue::from_lua(self.lua(), value)?
            }
            ScriptValue::Handle {
                handle,
                kind: EntryKind::Struct,
                ..
            } => match callbacks::get_field(self, *handle, key) {
                Ok(value) => value,
                Err(Error::Access(err)) => {
                    self.record_access_failure(err);
                    ScriptValue::Nil
                }
                Err(err) => return Err(err),
            },
            other => return Err(not_indexable(other.script_type())),
        };
        self.push(value);
        Ok(())
    }

    /// Pop the top value into `t[key]` where `t` is the table or host
    /// struct at `idx`. A rejected host-struct write is returned as
    /// [`Error::Access`]; the value is popped either way.
    pub fn set_field(&self, idx: i32, key: &str) -> Result<()> {
        let target = self.value(idx).ok_or(Error::InvalidIndex(idx))?;
        let value = self.pop_one()?;
        match &target {
            ScriptValue::Table(pinned) => {
                let Value::Table(table) = pinned.get(self.lua())? else {
                    return Err(not_indexable(ScriptType::Table));
                };
                table.set(key, value.to_lua(self.lua())?)?;
                Ok(())
            }
            ScriptValue::Handle {
                handle,
                kind: EntryKind::Struct,
                ..
            } => Ok(callbacks::set_field(self, *handle, key, &value)?),
            other => Err(not_indexable(other.script_type())),
        }
    }

    fn table_at(&self, idx: i32) -> Result<mlua::Table<'_>> {
        match self.value(idx).ok_or(Error::InvalidIndex(idx))? {
            ScriptValue::Table(pinned) => match pinned.get(self.lua())? {
                Value::Table(table) => Ok(table),
                _ => Err(not_indexable(ScriptType::Table)),
            },
            other => Err(not_indexable(other.script_type())),
        }
    }

    /// Pop a key and push `t[key]` for the table at `idx`, bypassing
    /// metamethods.
    pub fn raw_get(&self, idx: i32) -> Result<()> {
        let table = self.table_at(idx)?;
        let key = self.pop_one()?;
        let value: Value = table.raw_get(key.to_lua(self.lua())?)?;
        self.push(ScriptValue::from_lua(self.lua(), value)?);
        Ok(())
    }

    /// Pop a value and then a key into `t[key]` for the table at `idx`,
    /// bypassing metamethods.
    pub fn raw_set(&self, idx: i32) -> Result<()> {
        let table = self.table_at(idx)?;
        let mut popped = self.stack().pop_n(2)?;
        let value = popped.remove(1);
        let key = popped.remove(0);
        table.raw_set(key.to_lua(self.lua())?, value.to_lua(self.lua())?)?;
        Ok(())
    }

    /// Push `t[n]` for the table at `idx` without metamethods.
    pub fn raw_geti(&self, idx: i32, n: i64) -> Result<()> {
        let table = self.table_at(idx)?;
        let value: Value = table.raw_get(n)?;
        self.push(ScriptValue::from_lua(self.lua(), value)?);
        Ok(())
    }

    /// Pop the top value into `t[n]` for the table at `idx` without
    /// metamethods.
    pub fn raw_seti(&self, idx: i32, n: i64) -> Result<()> {
        let table = self.table_at(idx)?;
        let value = self.pop_one()?;
        table.raw_set(n, value.to_lua(self.lua())?)?;
        Ok(())
    }

    /// Register `function` and bind it to the global `name`.
    pub fn register_function<F>(&self, name: &str, function: F) -> Result<Handle>
    where
        F: Fn(&Session<'_>) -> Result<usize> + Send + Sync + 'static,
    {
        let handle = self.push_function(function)?;
        self.set_global(name)?;
        Ok(handle)
    }

    /// Register `value` and bind it to the global `name`.
    pub fn expose(&self, name: &str, value: impl Into<StructRef>) -> Result<Handle> {
        let handle = self.push_struct(value)?;
        self.set_global(name)?;
        Ok(handle)
    }

    // ── loading and running ─────────────────────────────────────

    fn compile(&self, chunk_name: &str, source: &str) -> Result<ScriptValue> {
        let chunk = self.lua().load(source).set_name(chunk_name);
        match chunk.into_function() {
            Ok(function) => Ok(ScriptValue::from_lua(
                self.lua(),
                Value::Function(function),
            )?),
            Err(mlua::Error::SyntaxError { message, .. }) => {
                Err(Error::Load(ScriptError::load(message)))
            }
            Err(mlua::Error::MemoryError(message)) => Err(Error::Load(ScriptError {
                code: StatusCode::Memory,
                message,
                stack_trace: Vec::new(),
            })),
            Err(err) => Err(err.into()),
        }
    }

    /// Compile `source` and push the resulting function. The chunk is named
    /// after its own text, as `luaL_loadstring` does.
    pub fn load_string(&self, source: &str) -> Result<()> {
        let function = self.compile(source, source)?;
        self.push(function);
        Ok(())
    }

    /// Compile `source` under the display name `name` and push it.
    pub fn load_named(&self, name: &str, source: &str) -> Result<()> {
        let function = self.compile(&format!("={name}"), source)?;
        self.push(function);
        Ok(())
    }

    pub fn do_string(&self, source: &str) -> Result<()> {
        let function = self.compile(source, source)?;
        self.protected_call(&function, &[]).map(drop)
    }

    pub fn do_named(&self, name: &str, source: &str) -> Result<()> {
        let function = self.compile(&format!("={name}"), source)?;
        self.protected_call(&function, &[]).map(drop)
    }

    pub fn do_file(&self, path: &Path) -> Result<()> {
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let function = self.compile(&format!("@{}", path.display()), &source)?;
        self.protected_call(&function, &[]).map(drop)
    }

    /// Run `source` and return everything it returns.
    pub fn eval(&self, source: &str) -> Result<Vec<ScriptValue>> {
        let function = self.compile(source, source)?;
        self.protected_call(&function, &[])
    }

    // ── calls ───────────────────────────────────────────────────

    /// Pop a function and its `nargs` arguments, call it, and push the
    /// results. `None` keeps every result; `Some(n)` pads or truncates to
    /// `n`. On failure nothing is pushed.
    pub fn call(&self, nargs: usize, results: Option<usize>) -> Result<()> {
        let available = self.get_top();
        let needed = nargs
            .checked_add(1)
            .ok_or(Error::StackUnderflow { needed: nargs, available })?;
        let mut popped = self.stack().pop_n(needed)?;
        let args = popped.split_off(1);
        let function = popped.remove(0);
        let returned = adjust(self.protected_call(&function, &args)?, results);
        let mut stack = self.stack();
        for value in returned {
            stack.push(value);
        }
        Ok(())
    }

    pub fn call_global(
        &self,
        name: &str,
        args: impl IntoIterator<Item = ScriptValue>,
        results: Option<usize>,
    ) -> Result<Vec<ScriptValue>> {
        let value: Value = self.lua().globals().get(name)?;
        let function = ScriptValue::from_lua(self.lua(), value)?;
        let args: Vec<ScriptValue> = args.into_iter().collect();
        Ok(adjust(self.protected_call(&function, &args)?, results))
    }

    pub fn call_ref(
        &self,
        function: &ScriptFunction,
        args: impl IntoIterator<Item = ScriptValue>,
        results: Option<usize>,
    ) -> Result<Vec<ScriptValue>> {
        let args: Vec<ScriptValue> = args.into_iter().collect();
        let function = ScriptValue::Function(function.clone());
        Ok(adjust(self.protected_call(&function, &args)?, results))
    }

    fn protected_call(&self, function: &ScriptValue, args: &[ScriptValue]) -> Result<Vec<ScriptValue>> {
        let lua = self.lua();
        let xpcall: Function = lua.registry_value(&self.state.xpcall)?;
        let handler: Function = lua.registry_value(&self.state.handler)?;

        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(function.to_lua(lua)?);
        call_args.push(Value::Function(handler));
        for arg in args {
            call_args.push(arg.to_lua(lua)?);
        }

        self.state.trace.lock().clear();
        let mut returned = xpcall
            .call::<_, MultiValue>(MultiValue::from_vec(call_args))?
            .into_vec()
            .into_iter();

        match returned.next() {
            Some(Value::Boolean(true)) => Ok(returned
                .map(|value| ScriptValue::from_lua(lua, value))
                .collect::<mlua::Result<Vec<_>>>()?),
            _ => {
                let raised = returned.next().unwrap_or(Value::Nil);
                let message = describe_error(&raised);
                let code = status_of(&raised, &message);
                let stack_trace = std::mem::take(&mut *self.state.trace.lock());
                Err(Error::Runtime(ScriptError {
                    code,
                    message,
                    stack_trace,
                }))
            }
        }
    }

    // ── persistent references ───────────────────────────────────

    /// Pin the value at `idx` in the engine's reference table.
    pub fn ref_value(&self, idx: i32) -> Result<ScriptRef> {
        let value = self.value(idx).ok_or(Error::InvalidIndex(idx))?;
        Ok(match value {
            ScriptValue::Function(ScriptFunction(pinned))
            | ScriptValue::Table(pinned)
            | ScriptValue::Handle { pinned, .. }
            | ScriptValue::Other(pinned) => pinned,
            scalar => ScriptRef::pin(self.lua(), scalar.to_lua(self.lua())?)?,
        })
    }

    pub fn push_ref(&self, pinned: &ScriptRef) -> Result<()> {
        let value = ScriptValue::from_lua(self.lua(), pinned.get(self.lua())?)?;
        self.push(value);
        Ok(())
    }

    // ── handles ─────────────────────────────────────────────────

    /// Release `handle` from the host side. Script references to it stop
    /// resolving.
    pub fn release(&self, handle: Handle) -> bool {
        self.registry().release(handle).is_some()
    }

    /// Pop `nargs` arguments, invoke the host function behind `handle`,
    /// and push its results. Returns the number pushed.
    pub fn invoke_handle(&self, handle: Handle, nargs: usize) -> Result<usize> {
        let args = self.stack().pop_n(nargs)?;
        let results = callbacks::invoke(self, handle, args)?;
        let count = results.len();
        let mut stack = self.stack();
        for value in results {
            stack.push(value);
        }
        Ok(count)
    }

    /// Deliver the engine's collection notice for `handle`.
    pub fn finalize_handle(&self, handle: Handle) -> bool {
        callbacks::finalize(self.registry(), handle)
    }

    /// Push member `name` of the struct behind `handle`, or push nothing
    /// and report why.
    pub fn get_handle_field(&self, handle: Handle, name: &str) -> Result<()> {
        let value = callbacks::get_field(self, handle, name)?;
        self.push(value);
        Ok(())
    }

    /// Pop the top value into member `name` of the struct behind `handle`.
    pub fn set_handle_field(&self, handle: Handle, name: &str) -> Result<()> {
        let value = self.pop_one()?;
        Ok(callbacks::set_field(self, handle, name, &value)?)
    }

    /// Run a full collection cycle, finalizing unreachable handles.
    pub fn collect_garbage(&self) -> Result<()> {
        self.lua().expire_registry_values();
        self.lua().gc_collect()?;
        self.lua().gc_collect()?;
        Ok(())
    }
}

fn not_indexable(found: ScriptType) -> Error {
    Error::Lua(mlua::Error::RuntimeError(format!(
        "attempt to index a {found} value"
    )))
}

fn adjust(mut values: Vec<ScriptValue>, results: Option<usize>) -> Vec<ScriptValue> {
    if let Some(n) = results {
        values.resize(n, ScriptValue::Nil);
    }
    values
}
