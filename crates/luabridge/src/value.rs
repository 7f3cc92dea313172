//! Values on both sides of the boundary.
//!
//! [`HostValue`] is what host code produces and consumes; [`Kind`] is the
//! declared type tag a field or parameter carries. [`ScriptValue`] is an
//! owned snapshot of a Lua value as it sits on the host evaluation stack:
//! reference-typed values (functions, tables, userdata) are pinned in the
//! Lua registry for as long as the snapshot lives.

use crate::callbacks::HandleCell;
use crate::reflect::StructRef;
use crate::registry::{EntryKind, Handle};
use bstr::{BString, ByteSlice};
use mlua::{Lua, RegistryKey, Value};
use std::fmt;
use std::sync::Arc;

/// Declared host type of a field, parameter or return value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Bytes,
    Struct,
    /// Pinned script function the host may call later.
    Function,
    /// A host type with no script mapping.
    Unsupported(&'static str),
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Struct => "struct",
            Self::Function => "function",
            Self::Unsupported(name) => name,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_signed() || self.is_unsigned() || self.is_float()
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A host-typed value crossing the boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Struct(StructRef),
    Function(ScriptFunction),
    /// A value whose kind has no script mapping; never pushed.
    Unmapped(&'static str),
}

impl HostValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Uint(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Struct(_) => "struct",
            Self::Function(_) => "function",
            Self::Unmapped(name) => name,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for HostValue {
    fn from(value: u64) -> Self {
        Self::Uint(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<StructRef> for HostValue {
    fn from(value: StructRef) -> Self {
        Self::Struct(value)
    }
}

impl From<ScriptFunction> for HostValue {
    fn from(value: ScriptFunction) -> Self {
        Self::Function(value)
    }
}

/// Dynamic type of a stack slot as the script sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptType {
    /// Index outside the current frame.
    None,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    HostFunction,
    HostStruct,
    UserData,
    Thread,
}

impl ScriptType {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "no value",
            Self::Nil => "nil",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Table => "table",
            Self::Function => "function",
            Self::HostFunction => "host function",
            Self::HostStruct => "host struct",
            Self::UserData => "userdata",
            Self::Thread => "thread",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A Lua value pinned in the Lua registry.
#[derive(Clone)]
pub struct ScriptRef {
    key: Arc<RegistryKey>,
    type_name: &'static str,
}

impl ScriptRef {
    pub(crate) fn pin(lua: &Lua, value: Value<'_>) -> mlua::Result<Self> {
        let type_name = value.type_name();
        let key = lua.create_registry_value(value)?;
        Ok(Self {
            key: Arc::new(key),
            type_name,
        })
    }

    pub(crate) fn get<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        lua.registry_value(&self.key)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for ScriptRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.key, &other.key)
    }
}

impl fmt::Debug for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptRef({})", self.type_name)
    }
}

/// Opaque token for a script function pinned in the engine's
/// persistent-reference table. The host may invoke it later through
/// [`Session::call_ref`](crate::Session::call_ref); it stays pinned until
/// the last clone is dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptFunction(pub(crate) ScriptRef);

/// Owned snapshot of one evaluation-stack slot.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(BString),
    Function(ScriptFunction),
    Table(ScriptRef),
    /// Userdata carrying a registry handle.
    Handle {
        handle: Handle,
        kind: EntryKind,
        pinned: ScriptRef,
    },
    /// Threads, foreign userdata and anything else.
    Other(ScriptRef),
}

impl ScriptValue {
    pub fn script_type(&self) -> ScriptType {
        match self {
            Self::Nil => ScriptType::Nil,
            Self::Boolean(_) => ScriptType::Boolean,
            Self::Integer(_) | Self::Number(_) => ScriptType::Number,
            Self::String(_) => ScriptType::String,
            Self::Function(_) => ScriptType::Function,
            Self::Table(_) => ScriptType::Table,
            Self::Handle {
                kind: EntryKind::Function,
                ..
            } => ScriptType::HostFunction,
            Self::Handle {
                kind: EntryKind::Struct,
                ..
            } => ScriptType::HostStruct,
            Self::Other(pinned) => match pinned.type_name() {
                "thread" => ScriptType::Thread,
                _ => ScriptType::UserData,
            },
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Handle { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub(crate) fn from_lua(lua: &Lua, value: Value<'_>) -> mlua::Result<Self> {
        Ok(match value {
            Value::Nil => Self::Nil,
            Value::Boolean(b) => Self::Boolean(b),
            Value::Integer(i) => Self::Integer(i),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(BString::from(s.as_bytes())),
            Value::Function(f) => Self::Function(ScriptFunction(ScriptRef::pin(
                lua,
                Value::Function(f),
            )?)),
            Value::Table(t) => Self::Table(ScriptRef::pin(lua, Value::Table(t))?),
            Value::UserData(ud) => {
                let tagged = ud
                    .borrow::<HandleCell>()
                    .map(|cell| (cell.handle, cell.kind))
                    .ok();
                let pinned = ScriptRef::pin(lua, Value::UserData(ud))?;
                match tagged {
                    Some((handle, kind)) => Self::Handle {
                        handle,
                        kind,
                        pinned,
                    },
                    None => Self::Other(pinned),
                }
            }
            other => Self::Other(ScriptRef::pin(lua, other)?),
        })
    }

    pub(crate) fn to_lua<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        Ok(match self {
            Self::Nil => Value::Nil,
            Self::Boolean(b) => Value::Boolean(*b),
            Self::Integer(i) => Value::Integer(*i),
            Self::Number(n) => Value::Number(*n),
            Self::String(s) => Value::String(lua.create_string(s.as_slice())?),
            Self::Function(ScriptFunction(pinned))
            | Self::Table(pinned)
            | Self::Handle { pinned, .. }
            | Self::Other(pinned) => pinned.get(lua)?,
        })
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::String(BString::from(value))
    }
}
