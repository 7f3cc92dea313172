//! Capability tables for host structs.
//!
//! A host type opts into script access by implementing [`HostStruct`] and
//! listing its fields and methods in [`HostStruct::describe`]. The resulting
//! [`Describe`] table is built once per type and shared by every instance,
//! so member lookup from scripts is a map probe plus one kind-directed
//! conversion rather than open-ended reflection.
//!
//! Instances are shared between host and engine through [`Exposed<T>`]; the
//! engine's registry stores the type-erased [`StructRef`].
//!
//! Methods run with the receiver locked. Passing the receiver back in as an
//! argument is rejected with [`AccessError::AliasedReceiver`]; host code
//! inside a method body must still not lock its own `Exposed` again.

use crate::error::{AccessError, CoercionError};
use crate::value::{HostValue, Kind, ScriptFunction};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Conversion between a Rust type and [`HostValue`], tagged with its [`Kind`].
///
/// Integer narrowing uses `as`: values wider than the declared width are
/// truncated and unsigned targets wrap negative inputs.
pub trait Marshal: Sized + 'static {
    const KIND: Kind;

    fn into_host(self) -> HostValue;

    fn from_host(value: HostValue) -> Option<Self>;
}

impl Marshal for bool {
    const KIND: Kind = Kind::Bool;

    fn into_host(self) -> HostValue {
        HostValue::Bool(self)
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Bool(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! marshal_int {
    ($($ty:ty => $kind:ident, $variant:ident, $wide:ty;)*) => {
        $(
            impl Marshal for $ty {
                const KIND: Kind = Kind::$kind;

                fn into_host(self) -> HostValue {
                    HostValue::$variant(self as $wide)
                }

                fn from_host(value: HostValue) -> Option<Self> {
                    match value {
                        HostValue::Int(i) => Some(i as $ty),
                        HostValue::Uint(u) => Some(u as $ty),
                        _ => None,
                    }
                }
            }
        )*
    };
}

marshal_int! {
    i8 => I8, Int, i64;
    i16 => I16, Int, i64;
    i32 => I32, Int, i64;
    i64 => I64, Int, i64;
    isize => I64, Int, i64;
    u8 => U8, Uint, u64;
    u16 => U16, Uint, u64;
    u32 => U32, Uint, u64;
    u64 => U64, Uint, u64;
    usize => U64, Uint, u64;
}

macro_rules! marshal_float {
    ($($ty:ty => $kind:ident;)*) => {
        $(
            impl Marshal for $ty {
                const KIND: Kind = Kind::$kind;

                fn into_host(self) -> HostValue {
                    HostValue::Float(self as f64)
                }

                fn from_host(value: HostValue) -> Option<Self> {
                    match value {
                        HostValue::Float(f) => Some(f as $ty),
                        _ => None,
                    }
                }
            }
        )*
    };
}

marshal_float! {
    f32 => F32;
    f64 => F64;
}

impl Marshal for String {
    const KIND: Kind = Kind::String;

    fn into_host(self) -> HostValue {
        HostValue::String(self)
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Marshal for Vec<u8> {
    const KIND: Kind = Kind::Bytes;

    fn into_host(self) -> HostValue {
        HostValue::Bytes(self)
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl Marshal for StructRef {
    const KIND: Kind = Kind::Struct;

    fn into_host(self) -> HostValue {
        HostValue::Struct(self)
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Struct(s) => Some(s),
            _ => None,
        }
    }
}

impl<T: HostStruct> Marshal for Exposed<T> {
    const KIND: Kind = Kind::Struct;

    fn into_host(self) -> HostValue {
        HostValue::Struct(self.struct_ref())
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Struct(s) => s.downcast::<T>(),
            _ => None,
        }
    }
}

impl Marshal for ScriptFunction {
    const KIND: Kind = Kind::Function;

    fn into_host(self) -> HostValue {
        HostValue::Function(self)
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// Wrapper for host values that have no script representation.
///
/// As a parameter it makes every call fail; as a result it is skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Opaque<T>(pub T);

impl<T: Send + 'static> Marshal for Opaque<T> {
    const KIND: Kind = Kind::Unsupported("opaque");

    fn into_host(self) -> HostValue {
        HostValue::Unmapped("opaque")
    }

    fn from_host(_value: HostValue) -> Option<Self> {
        None
    }
}

/// Return value of a described method.
pub trait IntoResults {
    fn into_results(self) -> Vec<HostValue>;
}

impl IntoResults for () {
    fn into_results(self) -> Vec<HostValue> {
        Vec::new()
    }
}

impl<A: Marshal> IntoResults for A {
    fn into_results(self) -> Vec<HostValue> {
        vec![self.into_host()]
    }
}

macro_rules! results_tuple {
    ($($name:ident),+) => {
        impl<$($name: Marshal),+> IntoResults for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_results(self) -> Vec<HostValue> {
                let ($($name,)+) = self;
                vec![$($name.into_host()),+]
            }
        }
    };
}

results_tuple!(A);
results_tuple!(A, B);
results_tuple!(A, B, C);
results_tuple!(A, B, C, D);

/// Method with its parameter kinds already checked and its signature erased.
pub type ErasedMethod<T> =
    Box<dyn Fn(&mut T, Vec<HostValue>) -> Result<Vec<HostValue>, CoercionError> + Send + Sync>;

/// Closures usable as methods of `T`: `Fn(&mut T, A, B, ..) -> R` with
/// [`Marshal`] parameters and an [`IntoResults`] return.
pub trait IntoMethod<T, Args>: Send + Sync + 'static {
    fn params() -> Vec<Kind>;

    fn into_erased(self) -> ErasedMethod<T>;
}

macro_rules! into_method {
    ($($arg:ident),*) => {
        impl<T, Func, Ret, $($arg,)*> IntoMethod<T, ($($arg,)*)> for Func
        where
            T: 'static,
            Func: Fn(&mut T, $($arg),*) -> Ret + Send + Sync + 'static,
            Ret: IntoResults,
            $($arg: Marshal,)*
        {
            fn params() -> Vec<Kind> {
                vec![$($arg::KIND),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_erased(self) -> ErasedMethod<T> {
                Box::new(move |target: &mut T, args: Vec<HostValue>| {
                    let mut args = args.into_iter();
                    $(
                        let $arg = match args.next() {
                            Some(value) => {
                                let found = value.kind_name();
                                $arg::from_host(value).ok_or(CoercionError::Rejected {
                                    expected: $arg::KIND,
                                    found,
                                })?
                            }
                            None => {
                                return Err(CoercionError::Rejected {
                                    expected: $arg::KIND,
                                    found: "nothing",
                                })
                            }
                        };
                    )*
                    Ok(self(target, $($arg),*).into_results())
                })
            }
        }
    };
}

into_method!();
into_method!(A);
into_method!(A, B);
into_method!(A, B, C);
into_method!(A, B, C, D);

type FieldRead<T> = Box<dyn Fn(&mut T) -> FieldSlot + Send + Sync>;
type FieldWrite<T> = Box<dyn Fn(&mut T, HostValue) -> Result<(), AccessError> + Send + Sync>;

struct FieldEntry<T> {
    kind: Kind,
    read: FieldRead<T>,
    write: FieldWrite<T>,
}

struct MethodEntry<T> {
    params: Vec<Kind>,
    call: ErasedMethod<T>,
}

/// Result of reading a described field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldSlot {
    Value(HostValue),
    /// An indirect field that currently points at nothing.
    Null,
    /// No field of that name.
    Absent,
}

/// Capability table of one host struct type.
pub struct Describe<T> {
    type_name: &'static str,
    fields: HashMap<&'static str, FieldEntry<T>>,
    methods: HashMap<&'static str, MethodEntry<T>>,
}

impl<T: 'static> Describe<T> {
    fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            fields: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    /// Expose a field read and written in place through `lens`.
    pub fn field<F>(&mut self, name: &'static str, lens: fn(&mut T) -> &mut F) -> &mut Self
    where
        F: Marshal + Clone,
    {
        self.fields.insert(
            name,
            FieldEntry {
                kind: F::KIND,
                read: Box::new(move |target| FieldSlot::Value(lens(target).clone().into_host())),
                write: Box::new(move |target, value| {
                    let found = value.kind_name();
                    let value = F::from_host(value).ok_or(CoercionError::Rejected {
                        expected: F::KIND,
                        found,
                    })?;
                    *lens(target) = value;
                    Ok(())
                }),
            },
        );
        self
    }

    /// Expose a field behind one level of indirection. `None` reads as
    /// nothing and rejects writes.
    pub fn field_ref<F>(
        &mut self,
        name: &'static str,
        lens: fn(&mut T) -> Option<&mut F>,
    ) -> &mut Self
    where
        F: Marshal + Clone,
    {
        self.fields.insert(
            name,
            FieldEntry {
                kind: F::KIND,
                read: Box::new(move |target| match lens(target) {
                    Some(inner) => FieldSlot::Value(inner.clone().into_host()),
                    None => FieldSlot::Null,
                }),
                write: Box::new(move |target, value| {
                    let Some(slot) = lens(target) else {
                        return Err(AccessError::NilField(name.to_string()));
                    };
                    let found = value.kind_name();
                    *slot = F::from_host(value).ok_or(CoercionError::Rejected {
                        expected: F::KIND,
                        found,
                    })?;
                    Ok(())
                }),
            },
        );
        self
    }

    pub fn method<Args, M>(&mut self, name: &'static str, method: M) -> &mut Self
    where
        M: IntoMethod<T, Args>,
    {
        self.methods.insert(
            name,
            MethodEntry {
                params: M::params(),
                call: method.into_erased(),
            },
        );
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.keys().copied()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}

/// A host type whose fields and methods scripts may reach through a handle.
pub trait HostStruct: Sized + Send + 'static {
    fn describe(d: &mut Describe<Self>);

    /// Name used in diagnostics.
    fn type_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

type DescriptorCache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

static DESCRIPTORS: OnceLock<DescriptorCache> = OnceLock::new();

/// The shared capability table for `T`, built on first use.
pub fn descriptor<T: HostStruct>() -> Arc<Describe<T>> {
    let cache = DESCRIPTORS.get_or_init(|| RwLock::new(HashMap::new()));
    let id = TypeId::of::<T>();
    if let Some(found) = cache.read().get(&id).cloned() {
        if let Ok(table) = found.downcast::<Describe<T>>() {
            return table;
        }
    }

    let mut table = Describe::new(T::type_name());
    T::describe(&mut table);
    let table: Arc<dyn Any + Send + Sync> = Arc::new(table);
    let stored = Arc::clone(cache.write().entry(id).or_insert(table));
    match stored.downcast::<Describe<T>>() {
        Ok(table) => table,
        // TypeId keys cannot collide across types.
        Err(_) => unreachable!("descriptor cache holds a foreign type"),
    }
}

struct Shared<T> {
    value: Mutex<T>,
    descriptor: Arc<Describe<T>>,
}

/// A host struct shared with one or more engines.
///
/// Clones point at the same value; mutations made by scripts are visible
/// through [`Exposed::lock`].
pub struct Exposed<T>(Arc<Shared<T>>);

impl<T: HostStruct> Exposed<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Shared {
            value: Mutex::new(value),
            descriptor: descriptor::<T>(),
        }))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.value.lock()
    }

    pub fn struct_ref(&self) -> StructRef {
        StructRef(Arc::clone(&self.0) as Arc<dyn ErasedStruct>)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Exposed<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: HostStruct + fmt::Debug> fmt::Debug for Exposed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exposed").field(&*self.lock()).finish()
    }
}

impl<T: HostStruct> From<Exposed<T>> for StructRef {
    fn from(exposed: Exposed<T>) -> Self {
        exposed.struct_ref()
    }
}

impl<T: HostStruct> From<&Exposed<T>> for StructRef {
    fn from(exposed: &Exposed<T>) -> Self {
        exposed.struct_ref()
    }
}

pub(crate) trait ErasedStruct: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn read_field(&self, name: &str) -> FieldSlot;

    fn field_kind(&self, name: &str) -> Option<Kind>;

    fn write_field(&self, name: &str, value: HostValue) -> Result<(), AccessError>;

    fn has_method(&self, name: &str) -> bool;

    fn method_params(&self, name: &str) -> Option<&[Kind]>;

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> Result<Vec<HostValue>, AccessError>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: HostStruct> ErasedStruct for Shared<T> {
    fn type_name(&self) -> &'static str {
        self.descriptor.type_name
    }

    fn read_field(&self, name: &str) -> FieldSlot {
        match self.descriptor.fields.get(name) {
            Some(field) => (field.read)(&mut *self.value.lock()),
            None => FieldSlot::Absent,
        }
    }

    fn field_kind(&self, name: &str) -> Option<Kind> {
        self.descriptor.fields.get(name).map(|field| field.kind)
    }

    fn write_field(&self, name: &str, value: HostValue) -> Result<(), AccessError> {
        let field = self
            .descriptor
            .fields
            .get(name)
            .ok_or_else(|| AccessError::NoSuchMember {
                type_name: self.descriptor.type_name,
                member: name.to_string(),
            })?;
        (field.write)(&mut *self.value.lock(), value)
    }

    fn has_method(&self, name: &str) -> bool {
        self.descriptor.methods.contains_key(name)
    }

    fn method_params(&self, name: &str) -> Option<&[Kind]> {
        self.descriptor
            .methods
            .get(name)
            .map(|method| method.params.as_slice())
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> Result<Vec<HostValue>, AccessError> {
        let method = self
            .descriptor
            .methods
            .get(name)
            .ok_or_else(|| AccessError::NoSuchMember {
                type_name: self.descriptor.type_name,
                member: name.to_string(),
            })?;
        Ok((method.call)(&mut *self.value.lock(), args)?)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased reference to an [`Exposed`] value, as stored in a registry.
#[derive(Clone)]
pub struct StructRef(Arc<dyn ErasedStruct>);

impl StructRef {
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Recover the typed handle when this refers to an `Exposed<T>`.
    pub fn downcast<T: HostStruct>(&self) -> Option<Exposed<T>> {
        Arc::clone(&self.0)
            .as_any()
            .downcast::<Shared<T>>()
            .ok()
            .map(Exposed)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    pub fn read_field(&self, name: &str) -> FieldSlot {
        self.0.read_field(name)
    }

    pub fn field_kind(&self, name: &str) -> Option<Kind> {
        self.0.field_kind(name)
    }

    pub(crate) fn write_field(&self, name: &str, value: HostValue) -> Result<(), AccessError> {
        self.0.write_field(name, value)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.0.has_method(name)
    }

    pub fn method_params(&self, name: &str) -> Option<&[Kind]> {
        self.0.method_params(name)
    }

    pub(crate) fn call_method(
        &self,
        name: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, AccessError> {
        // The receiver is locked for the call; a second lock on it would never return.
        if args
            .iter()
            .any(|arg| matches!(arg, HostValue::Struct(other) if other.ptr_eq(self)))
        {
            return Err(AccessError::AliasedReceiver {
                type_name: self.type_name(),
                method: name.to_string(),
            });
        }
        self.0.call_method(name, args)
    }
}

impl PartialEq for StructRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for StructRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StructRef({})", self.type_name())
    }
}
