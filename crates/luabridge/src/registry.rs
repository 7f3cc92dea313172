//! Handle registry: opaque, revocable ids for host values.
//!
//! Scripts never see a host address. They hold a userdata carrying a
//! [`Handle`], and every access goes back through [`Registry::resolve`].
//! The registry owns the mapping entry only; the host keeps its own
//! references to the values themselves.

use crate::reflect::StructRef;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Opaque id of a registered host value. Zero is never issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host function callable from scripts.
///
/// Arguments sit in a fresh stack frame at indices `1..=n`; the function
/// pushes its results and returns how many it pushed.
pub type HostFunction = Arc<dyn Fn(&Session<'_>) -> crate::Result<usize> + Send + Sync>;

/// What a handle refers to.
#[derive(Clone)]
pub enum Entry {
    Function(HostFunction),
    Struct(StructRef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Function,
    Struct,
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Function(_) => EntryKind::Function,
            Self::Struct(_) => EntryKind::Struct,
        }
    }

    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            Self::Function(f) => Some(f),
            Self::Struct(_) => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructRef> {
        match self {
            Self::Struct(s) => Some(s),
            Self::Function(_) => None,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Entry::Function"),
            Self::Struct(s) => f.debug_tuple("Entry::Struct").field(s).finish(),
        }
    }
}

struct Slots {
    last: u32,
    entries: HashMap<u32, Entry>,
}

/// Thread-safe handle table scoped to one engine instance.
pub struct Registry {
    slots: Mutex<Slots>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    fn starting_after(last: u32) -> Self {
        Self {
            slots: Mutex::new(Slots {
                last,
                entries: HashMap::new(),
            }),
        }
    }

    /// Store `entry` under a fresh handle.
    ///
    /// Ids increase monotonically. After wrapping, zero and any id that is
    /// still live are skipped, so a live handle is never issued twice.
    pub fn register(&self, entry: Entry) -> Handle {
        let mut slots = self.slots.lock();
        let handle = loop {
            slots.last = slots.last.wrapping_add(1);
            let Some(id) = NonZeroU32::new(slots.last) else {
                continue;
            };
            if !slots.entries.contains_key(&id.get()) {
                break Handle(id);
            }
        };
        slots.entries.insert(handle.get(), entry);
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Option<Entry> {
        self.slots.lock().entries.get(&handle.get()).cloned()
    }

    pub fn resolve_function(&self, handle: Handle) -> Option<HostFunction> {
        self.resolve(handle)
            .and_then(|entry| entry.as_function().cloned())
    }

    pub fn resolve_struct(&self, handle: Handle) -> Option<StructRef> {
        self.resolve(handle).and_then(|entry| entry.as_struct().cloned())
    }

    /// Remove and return the entry. Unknown or already released handles
    /// yield `None`.
    pub fn release(&self, handle: Handle) -> Option<Entry> {
        self.slots.lock().entries.remove(&handle.get())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.lock().entries.contains_key(&handle.get())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.slots.lock().entries);
        drained.len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Registry")
            .field("last", &slots.last)
            .field("live", &slots.entries.len())
            .finish()
    }
}
