//! Process-wide index of live engines.
//!
//! This is the only global state in the crate. Boundary callbacks find
//! their engine through the context stored in Lua app data; the index
//! exists for host code that holds an [`InstanceId`] and needs the engine
//! back. Entries are added on creation and removed when the engine drops.

use crate::engine::{Engine, EngineShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};

/// Opaque key of one engine instance, unique for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Index = Mutex<HashMap<InstanceId, Weak<EngineShared>>>;

static INSTANCES: OnceLock<Index> = OnceLock::new();

fn index() -> &'static Index {
    INSTANCES.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn register(id: InstanceId, engine: Weak<EngineShared>) {
    index().lock().insert(id, engine);
}

pub(crate) fn unregister(id: InstanceId) -> bool {
    index().lock().remove(&id).is_some()
}

/// The engine registered under `id`, if it is still alive.
pub fn lookup(id: InstanceId) -> Option<Engine> {
    let weak = index().lock().get(&id).cloned()?;
    weak.upgrade().map(Engine::from_shared)
}

/// Number of engines currently alive in this process.
pub fn live_count() -> usize {
    index()
        .lock()
        .values()
        .filter(|engine| engine.strong_count() > 0)
        .count()
}
