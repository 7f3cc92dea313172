//! Kind-directed conversion between script values and host values.
//!
//! Script → host coercion is strict: a value converts only when its script
//! type belongs to the family of the declared [`Kind`]. Numbers move freely
//! between integer and float kinds (floats truncate toward zero for integer
//! kinds, negatives wrap for unsigned kinds); strings feed both string and
//! byte kinds; handle userdata resolve to host structs through the registry.
//!
//! Host → script conversion never fails on kind: values with no script
//! mapping are skipped, so a method returning one shrinks its result count.

use crate::callbacks::new_handle;
use crate::error::{AccessError, CoercionError, Error, Result};
use crate::reflect::{FieldSlot, StructRef};
use crate::registry::{Entry, EntryKind, HostFunction, Registry};
use crate::session::Session;
use crate::value::{HostValue, Kind, ScriptType, ScriptValue};
use bstr::{BString, ByteSlice};
use mlua::Lua;
use std::sync::Arc;
use tracing::debug;

/// Convert the script value supplied for a parameter of kind `kind`.
///
/// `None` means the caller supplied fewer arguments than declared.
pub fn coerce_arg(
    registry: &Registry,
    kind: Kind,
    value: Option<&ScriptValue>,
) -> std::result::Result<HostValue, CoercionError> {
    if let Kind::Unsupported(name) = kind {
        return Err(CoercionError::Unsupported(name));
    }
    let Some(value) = value else {
        return Err(CoercionError::Mismatch {
            expected: kind,
            found: ScriptType::None,
        });
    };

    let converted = match (kind, value) {
        (Kind::Bool, ScriptValue::Boolean(b)) => HostValue::Bool(*b),
        (k, ScriptValue::Integer(i)) if k.is_signed() => HostValue::Int(*i),
        (k, ScriptValue::Number(n)) if k.is_signed() => HostValue::Int(*n as i64),
        (k, ScriptValue::Integer(i)) if k.is_unsigned() => HostValue::Uint(*i as u64),
        (k, ScriptValue::Number(n)) if k.is_unsigned() => HostValue::Uint((*n as i64) as u64),
        (k, ScriptValue::Integer(i)) if k.is_float() => HostValue::Float(*i as f64),
        (k, ScriptValue::Number(n)) if k.is_float() => HostValue::Float(*n),
        (Kind::String, ScriptValue::String(s)) => HostValue::String(s.to_str_lossy().into_owned()),
        (Kind::Bytes, ScriptValue::String(s)) => HostValue::Bytes(s.to_vec()),
        (
            Kind::Struct,
            ScriptValue::Handle {
                handle,
                kind: EntryKind::Struct,
                ..
            },
        ) => HostValue::Struct(
            registry
                .resolve_struct(*handle)
                .ok_or(CoercionError::UnknownHandle(*handle))?,
        ),
        (
            Kind::Struct,
            ScriptValue::Handle {
                handle,
                kind: EntryKind::Function,
                ..
            },
        ) => return Err(CoercionError::NotAStruct(*handle)),
        (Kind::Function, ScriptValue::Function(f)) => HostValue::Function(f.clone()),
        (expected, other) => {
            return Err(CoercionError::Mismatch {
                expected,
                found: other.script_type(),
            });
        }
    };
    Ok(converted)
}

/// Like [`coerce_arg`], but integer kinds only accept integral numbers.
/// Used for field writes, which store in place.
pub fn coerce_field(
    registry: &Registry,
    kind: Kind,
    value: &ScriptValue,
) -> std::result::Result<HostValue, CoercionError> {
    if let ScriptValue::Number(n) = value {
        if (kind.is_signed() || kind.is_unsigned()) && n.fract() != 0.0 {
            return Err(CoercionError::Mismatch {
                expected: kind,
                found: ScriptType::Number,
            });
        }
    }
    coerce_arg(registry, kind, Some(value))
}

/// Convert a host value for the script side. `None` for unmapped kinds.
pub fn to_script(
    lua: &Lua,
    registry: &Arc<Registry>,
    value: HostValue,
) -> mlua::Result<Option<ScriptValue>> {
    Ok(Some(match value {
        HostValue::Bool(b) => ScriptValue::Boolean(b),
        HostValue::Int(i) => ScriptValue::Integer(i),
        HostValue::Uint(u) => ScriptValue::Integer(u as i64),
        HostValue::Float(f) => ScriptValue::Number(f),
        HostValue::String(s) => ScriptValue::String(BString::from(s)),
        HostValue::Bytes(b) => ScriptValue::String(BString::from(b)),
        HostValue::Struct(s) => new_handle(lua, registry, Entry::Struct(s))?,
        HostValue::Function(f) => ScriptValue::Function(f),
        HostValue::Unmapped(_) => return Ok(None),
    }))
}

fn resolve_target(registry: &Registry, handle: crate::Handle) -> Result<StructRef> {
    match registry.resolve(handle) {
        Some(Entry::Struct(target)) => Ok(target),
        Some(Entry::Function(_)) => Err(AccessError::NotAStruct(handle).into()),
        None => Err(AccessError::UnknownHandle(handle).into()),
    }
}

/// Read member `name` of the struct behind `handle`.
///
/// Fields win over methods. A method is returned as a fresh host-function
/// handle bound to this receiver.
pub fn get_field(
    lua: &Lua,
    registry: &Arc<Registry>,
    handle: crate::Handle,
    name: &str,
) -> Result<ScriptValue> {
    let target = resolve_target(registry, handle)?;
    match target.read_field(name) {
        FieldSlot::Value(HostValue::Unmapped(kind)) => {
            if !target.has_method(name) {
                return Err(AccessError::Unmapped {
                    field: name.to_string(),
                    kind,
                }
                .into());
            }
        }
        FieldSlot::Value(value) => {
            return to_script(lua, registry, value)?.ok_or_else(|| {
                AccessError::Unmapped {
                    field: name.to_string(),
                    kind: "unknown",
                }
                .into()
            });
        }
        FieldSlot::Null => return Err(AccessError::NilField(name.to_string()).into()),
        FieldSlot::Absent => {}
    }

    if !target.has_method(name) {
        return Err(AccessError::NoSuchMember {
            type_name: target.type_name(),
            member: name.to_string(),
        }
        .into());
    }
    let adapter = method_adapter(target, name.to_string());
    Ok(new_handle(lua, registry, Entry::Function(adapter))?)
}

/// Write member `name` of the struct behind `handle`. The field is
/// updated only when `value` matches its declared kind exactly.
pub fn set_field(
    registry: &Registry,
    handle: crate::Handle,
    name: &str,
    value: &ScriptValue,
) -> std::result::Result<(), AccessError> {
    let target = match registry.resolve(handle) {
        Some(Entry::Struct(target)) => target,
        Some(Entry::Function(_)) => return Err(AccessError::NotAStruct(handle)),
        None => return Err(AccessError::UnknownHandle(handle)),
    };
    let kind = target
        .field_kind(name)
        .ok_or_else(|| AccessError::NoSuchMember {
            type_name: target.type_name(),
            member: name.to_string(),
        })?;
    let converted = coerce_field(registry, kind, value)?;
    target.write_field(name, converted)
}

/// Call method `name` on `target` with the current frame's arguments.
///
/// The receiver sits at index 1 (`Obj:Method(...)`), so parameters are read
/// from index 2 on. The first parameter that fails to convert aborts the
/// call before the method runs.
pub fn invoke_method(session: &Session<'_>, target: &StructRef, name: &str) -> Result<usize> {
    let params = target
        .method_params(name)
        .ok_or_else(|| AccessError::NoSuchMember {
            type_name: target.type_name(),
            member: name.to_string(),
        })?
        .to_vec();

    let mut args = Vec::with_capacity(params.len());
    for (position, kind) in params.into_iter().enumerate() {
        let value = session.value(position as i32 + 2);
        args.push(coerce_arg(session.registry(), kind, value.as_ref())?);
    }

    let results = target.call_method(name, args)?;
    let mut pushed = 0;
    for value in results {
        let kind = value.kind_name();
        if session.push_host(value)? {
            pushed += 1;
        } else {
            debug!(method = name, kind, "skipping result with no script mapping");
        }
    }
    Ok(pushed)
}

/// Script-callable wrapper around one method of one receiver.
pub fn method_adapter(target: StructRef, name: String) -> HostFunction {
    Arc::new(move |session: &Session<'_>| {
        invoke_method(session, &target, &name).map_err(|err| match err {
            Error::Access(access) => {
                debug!(method = %name, error = %access, "method call produced no results");
                Error::Access(access)
            }
            other => other,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handle;

    fn registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn numbers_cross_families() {
        let r = registry();
        assert_eq!(
            coerce_arg(&r, Kind::I32, Some(&ScriptValue::Number(2.9))).unwrap(),
            HostValue::Int(2)
        );
        assert_eq!(
            coerce_arg(&r, Kind::I32, Some(&ScriptValue::Number(-2.9))).unwrap(),
            HostValue::Int(-2)
        );
        assert_eq!(
            coerce_arg(&r, Kind::F64, Some(&ScriptValue::Integer(3))).unwrap(),
            HostValue::Float(3.0)
        );
        assert_eq!(
            coerce_arg(&r, Kind::U32, Some(&ScriptValue::Integer(-1))).unwrap(),
            HostValue::Uint(u64::MAX)
        );
    }

    #[test]
    fn strings_feed_strings_and_bytes() {
        let r = registry();
        let value = ScriptValue::String(BString::from(&b"a\xffb"[..]));
        assert_eq!(
            coerce_arg(&r, Kind::Bytes, Some(&value)).unwrap(),
            HostValue::Bytes(b"a\xffb".to_vec())
        );
        assert_eq!(
            coerce_arg(&r, Kind::String, Some(&value)).unwrap(),
            HostValue::String("a\u{FFFD}b".to_string())
        );
    }

    #[test]
    fn mismatches_are_tagged() {
        let r = registry();
        assert_eq!(
            coerce_arg(&r, Kind::I64, Some(&ScriptValue::from("x"))),
            Err(CoercionError::Mismatch {
                expected: Kind::I64,
                found: ScriptType::String
            })
        );
        assert_eq!(
            coerce_arg(&r, Kind::Bool, Some(&ScriptValue::Integer(1))),
            Err(CoercionError::Mismatch {
                expected: Kind::Bool,
                found: ScriptType::Number
            })
        );
        assert_eq!(
            coerce_arg(&r, Kind::String, None),
            Err(CoercionError::Mismatch {
                expected: Kind::String,
                found: ScriptType::None
            })
        );
    }

    #[test]
    fn unsupported_kind_always_fails() {
        let r = registry();
        assert_eq!(
            coerce_arg(&r, Kind::Unsupported("chan"), Some(&ScriptValue::Nil)),
            Err(CoercionError::Unsupported("chan"))
        );
    }

    #[test]
    fn field_writes_reject_fractional_integers() {
        let r = registry();
        assert!(coerce_field(&r, Kind::I32, &ScriptValue::Number(4.0)).is_ok());
        assert!(coerce_field(&r, Kind::I32, &ScriptValue::Number(4.5)).is_err());
        assert!(coerce_field(&r, Kind::F32, &ScriptValue::Number(4.5)).is_ok());
    }

    #[test]
    fn to_script_skips_unmapped() {
        let lua = Lua::new();
        let r = Arc::new(registry());
        assert_eq!(
            to_script(&lua, &r, HostValue::Unmapped("opaque")).unwrap(),
            None
        );
        assert_eq!(
            to_script(&lua, &r, HostValue::Uint(7)).unwrap(),
            Some(ScriptValue::Integer(7))
        );
        assert_eq!(
            to_script(&lua, &r, HostValue::Bytes(vec![1, 2])).unwrap(),
            Some(ScriptValue::String(BString::from(vec![1_u8, 2])))
        );
    }

    #[test]
    fn field_access_on_unknown_handle() {
        let lua = Lua::new();
        let r = Arc::new(registry());
        let handle = Handle::from_raw(3).unwrap();
        let err = get_field(&lua, &r, handle, "Name").unwrap_err();
        assert!(matches!(err, Error::Access(AccessError::UnknownHandle(h)) if h == handle));
        assert_eq!(
            set_field(&r, handle, "Name", &ScriptValue::Nil),
            Err(AccessError::UnknownHandle(handle))
        );
    }
}
