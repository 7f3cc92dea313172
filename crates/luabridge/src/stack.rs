//! Host-side evaluation stack with Lua-style indexing.
//!
//! Positive indices count from the base of the current frame starting at 1,
//! negative indices count back from the top, and 0 is never valid. A host
//! function called from a script runs in its own frame whose slots start
//! with the call arguments.

use crate::error::{Error, Result};
use crate::value::ScriptValue;

/// Saved stack shape, see [`ValueStack::restore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackMark {
    depth: usize,
    len: usize,
}

#[derive(Debug, Default)]
pub struct ValueStack {
    slots: Vec<ScriptValue>,
    base: usize,
    frames: Vec<usize>,
}

impl ValueStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots in the current frame.
    pub fn top(&self) -> usize {
        self.slots.len() - self.base
    }

    /// Absolute slot position of `idx` within the current frame.
    pub fn absolute(&self, idx: i32) -> Option<usize> {
        let top = self.top();
        let relative = match idx {
            0 => return None,
            i if i > 0 => {
                let i = i as usize;
                if i > top {
                    return None;
                }
                i - 1
            }
            i => {
                let back = i.unsigned_abs() as usize;
                if back > top {
                    return None;
                }
                top - back
            }
        };
        Some(self.base + relative)
    }

    /// Slot at `idx`, or `None` when `idx` is outside the frame.
    pub fn get(&self, idx: i32) -> Option<&ScriptValue> {
        self.absolute(idx).map(|pos| &self.slots[pos])
    }

    pub fn push(&mut self, value: ScriptValue) {
        self.slots.push(value);
    }

    pub fn pop(&mut self) -> Option<ScriptValue> {
        if self.top() == 0 {
            return None;
        }
        self.slots.pop()
    }

    /// Remove the top `n` values, returning them bottom-first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<ScriptValue>> {
        let available = self.top();
        if n > available {
            return Err(Error::StackUnderflow {
                needed: n,
                available,
            });
        }
        let at = self.slots.len() - n;
        Ok(self.slots.split_off(at))
    }

    /// Set the frame size, padding with nil or discarding from the top.
    /// Negative values count from the current top, as in `lua_settop`.
    pub fn set_top(&mut self, idx: i32) -> Result<()> {
        let new_top = if idx >= 0 {
            idx as usize
        } else {
            let back = idx.unsigned_abs() as usize - 1;
            self.top()
                .checked_sub(back)
                .ok_or(Error::InvalidIndex(idx))?
        };
        self.slots.resize(self.base + new_top, ScriptValue::Nil);
        Ok(())
    }

    pub fn remove(&mut self, idx: i32) -> Result<ScriptValue> {
        let pos = self.absolute(idx).ok_or(Error::InvalidIndex(idx))?;
        Ok(self.slots.remove(pos))
    }

    pub fn insert(&mut self, idx: i32, value: ScriptValue) -> Result<()> {
        let pos = self.absolute(idx).ok_or(Error::InvalidIndex(idx))?;
        self.slots.insert(pos, value);
        Ok(())
    }

    /// Open a frame holding `args` at indices `1..=args.len()`.
    pub fn enter(&mut self, args: Vec<ScriptValue>) {
        self.frames.push(self.base);
        self.base = self.slots.len();
        self.slots.extend(args);
    }

    /// Close the current frame and return its top `results` values.
    pub fn leave(&mut self, results: usize) -> Result<Vec<ScriptValue>> {
        let returned = self.pop_n(results);
        self.slots.truncate(self.base);
        self.base = self.frames.pop().unwrap_or(0);
        returned
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn mark(&self) -> StackMark {
        StackMark {
            depth: self.frames.len(),
            len: self.slots.len(),
        }
    }

    /// Unwind frames left open above `mark` and drop values pushed since.
    pub fn restore(&mut self, mark: StackMark) {
        while self.frames.len() > mark.depth {
            self.slots.truncate(self.base);
            self.base = self.frames.pop().unwrap_or(0);
        }
        self.slots.truncate(mark.len);
    }
}
