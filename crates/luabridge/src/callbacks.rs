//! Entry points the engine calls back into.
//!
//! Every handle visible to scripts is a [`HandleCell`] userdata whose
//! metamethods route calls, field reads and field writes through the
//! owning engine's registry. The owning engine is found through the
//! context object stored in the Lua app-data slot, never through global
//! state. Dropping the userdata (when Lua collects it, or when the state
//! closes) releases the handle.

use crate::engine::EngineShared;
use crate::error::{AccessError, Error, Result};
use crate::marshal;
use crate::registry::{Entry, EntryKind, Handle, Registry};
use crate::session::Session;
use crate::value::{ScriptRef, ScriptValue};
use mlua::{Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Context installed in each engine's Lua app data.
pub(crate) struct BridgeContext {
    pub(crate) engine: Weak<EngineShared>,
}

/// Script-side carrier of a registry handle.
pub struct HandleCell {
    pub(crate) handle: Handle,
    pub(crate) kind: EntryKind,
    registry: Weak<Registry>,
}

impl Drop for HandleCell {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if finalize(&registry, self.handle) {
                trace!(handle = %self.handle, "handle finalized");
            }
        }
    }
}

impl UserData for HandleCell {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Call, |lua, cell, args: MultiValue| {
            call_handler(lua, cell.handle, args)
        });

        methods.add_meta_method(MetaMethod::Index, |lua, cell, key: Value| {
            index_handler(lua, cell.handle, key)
        });

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, cell, (key, value): (Value, Value)| {
                newindex_handler(lua, cell.handle, key, value)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, cell, ()| {
            let label = match cell.kind {
                EntryKind::Function => "host function",
                EntryKind::Struct => "host struct",
            };
            Ok(format!("{label}: {}", cell.handle))
        });
    }
}

/// Register `entry` and wrap the new handle in a userdata.
pub(crate) fn new_handle(
    lua: &Lua,
    registry: &Arc<Registry>,
    entry: Entry,
) -> mlua::Result<ScriptValue> {
    let kind = entry.kind();
    let handle = registry.register(entry);
    let cell = HandleCell {
        handle,
        kind,
        registry: Arc::downgrade(registry),
    };
    let userdata = lua.create_userdata(cell)?;
    let pinned = ScriptRef::pin(lua, Value::UserData(userdata))?;
    Ok(ScriptValue::Handle {
        handle,
        kind,
        pinned,
    })
}

fn owning_engine(lua: &Lua) -> mlua::Result<Arc<EngineShared>> {
    let engine = lua
        .app_data_ref::<BridgeContext>()
        .and_then(|context| context.engine.upgrade());
    engine.ok_or_else(|| mlua::Error::RuntimeError("luabridge engine is gone".to_string()))
}

fn to_script_values(lua: &Lua, values: MultiValue<'_>) -> mlua::Result<Vec<ScriptValue>> {
    values
        .into_iter()
        .map(|value| ScriptValue::from_lua(lua, value))
        .collect()
}

fn to_lua_values<'lua>(lua: &'lua Lua, values: &[ScriptValue]) -> mlua::Result<MultiValue<'lua>> {
    let values = values
        .iter()
        .map(|value| value.to_lua(lua))
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}

fn call_handler<'lua>(
    lua: &'lua Lua,
    handle: Handle,
    args: MultiValue<'lua>,
) -> mlua::Result<MultiValue<'lua>> {
    let engine = owning_engine(lua)?;
    let session = Session::new(&engine);
    let args = to_script_values(lua, args)?;
    match invoke(&session, handle, args) {
        Ok(results) => to_lua_values(lua, &results),
        Err(Error::Access(err)) => {
            debug!(handle = %handle, error = %err, "host call returned no results");
            session.record_access_failure(err);
            Ok(MultiValue::new())
        }
        Err(err) => Err(mlua::Error::external(err)),
    }
}

fn index_handler<'lua>(
    lua: &'lua Lua,
    handle: Handle,
    key: Value<'lua>,
) -> mlua::Result<MultiValue<'lua>> {
    let Value::String(key) = key else {
        return Ok(MultiValue::new());
    };
    let name = key.to_string_lossy().into_owned();
    let engine = owning_engine(lua)?;
    let session = Session::new(&engine);
    match get_field(&session, handle, &name) {
        Ok(value) => Ok(MultiValue::from_vec(vec![value.to_lua(lua)?])),
        Err(Error::Access(err)) => {
            debug!(handle = %handle, field = %name, error = %err, "field read produced nothing");
            session.record_access_failure(err);
            Ok(MultiValue::new())
        }
        Err(err) => Err(mlua::Error::external(err)),
    }
}

fn newindex_handler(lua: &Lua, handle: Handle, key: Value<'_>, value: Value<'_>) -> mlua::Result<()> {
    let Value::String(key) = key else {
        return Ok(());
    };
    let name = key.to_string_lossy().into_owned();
    let engine = owning_engine(lua)?;
    let session = Session::new(&engine);
    let value = ScriptValue::from_lua(lua, value)?;
    if let Err(err) = set_field(&session, handle, &name, &value) {
        debug!(handle = %handle, field = %name, error = %err, "field write rejected");
        session.record_access_failure(err);
    }
    Ok(())
}

/// Invoke the function behind `handle` with `args` in a fresh frame and
/// return the values it reports.
pub fn invoke(session: &Session<'_>, handle: Handle, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>> {
    let function = match session.registry().resolve(handle) {
        Some(Entry::Function(function)) => function,
        Some(Entry::Struct(target)) => {
            return Err(Error::Lua(mlua::Error::RuntimeError(format!(
                "attempt to call a host struct ({})",
                target.type_name()
            ))));
        }
        None => return Err(AccessError::UnknownHandle(handle).into()),
    };

    session.enter_frame(args);
    match function(session) {
        Ok(count) => session.leave_frame(count),
        Err(err) => {
            // The frame is discarded whatever the function left on it.
            session.leave_frame(0)?;
            Err(err)
        }
    }
}

/// Release `handle` because the engine no longer references it.
/// Returns whether a live entry was removed.
pub fn finalize(registry: &Registry, handle: Handle) -> bool {
    registry.release(handle).is_some()
}

/// Read member `name` through `handle`.
pub fn get_field(session: &Session<'_>, handle: Handle, name: &str) -> Result<ScriptValue> {
    marshal::get_field(session.lua(), session.registry(), handle, name)
}

/// Write member `name` through `handle`.
pub fn set_field(
    session: &Session<'_>,
    handle: Handle,
    name: &str,
    value: &ScriptValue,
) -> std::result::Result<(), AccessError> {
    marshal::set_field(session.registry(), handle, name, value)
}
