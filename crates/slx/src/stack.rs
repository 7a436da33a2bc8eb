//! The operand stack and the pooled temporaries behind it.

use crate::value::{StorageClass, Value, ValueType};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to a shader value.
pub type ValueRef = Rc<RefCell<Value>>;

/// One stack slot: a value handle plus whether it is a pool temporary or a
/// bound reference to a named variable.
#[derive(Clone)]
pub struct StackEntry {
    pub data: ValueRef,
    pub is_temp: bool,
}

struct PoolSlot {
    value: ValueRef,
    in_use: bool,
}

/// Operand stack with a `(type, class)`-keyed temporary pool.
///
/// Temporaries are recycled: [`Stack::release`] returns a popped temp to the
/// pool, and each pool grows only when every instance of its key is in use.
/// This keeps steady-state shading free of per-opcode allocation.
#[derive(Default)]
pub struct Stack {
    entries: Vec<StackEntry>,
    pools: HashMap<(ValueType, StorageClass), Vec<PoolSlot>>,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    /// Pushes a pool temporary.
    pub fn push(&mut self, v: ValueRef) {
        self.entries.push(StackEntry { data: v, is_temp: true });
    }

    /// Pushes a bound reference to a named variable.
    pub fn push_var(&mut self, v: ValueRef) {
        self.entries.push(StackEntry { data: v, is_temp: false });
    }

    /// Pops the top entry. `varying` accumulates whether any popped operand
    /// was varying, which decides the class of the opcode's result.
    pub fn pop(&mut self, varying: &mut bool) -> Option<StackEntry> {
        let e = self.entries.pop()?;
        *varying |= e.data.borrow().is_varying();
        Some(e)
    }

    /// Duplicates the top of the stack into a fresh temporary.
    pub fn dup(&mut self, grid_size: usize) -> Option<()> {
        let top = self.entries.last()?.data.clone();
        let (ty, class) = {
            let b = top.borrow();
            (b.ty(), b.class())
        };
        let t = self.next_temp(ty, class, grid_size);
        {
            let src = top.borrow();
            let mut dst = t.borrow_mut();
            for lane in 0..src.size() {
                dst.set_from(&src, lane);
            }
        }
        self.push(t);
        Some(())
    }

    pub fn drop_top(&mut self) {
        if let Some(e) = {
            let mut varying = false;
            self.pop(&mut varying)
        } {
            self.release(e);
        }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Grabs a free temporary of the given type and class, growing the pool
    /// if none is free. Varying temps are sized to `grid_size` lanes.
    pub fn next_temp(&mut self, ty: ValueType, class: StorageClass, grid_size: usize) -> ValueRef {
        let pool = self.pools.entry((ty, class)).or_default();
        for slot in pool.iter_mut() {
            if !slot.in_use {
                slot.in_use = true;
                slot.value.borrow_mut().set_size(grid_size);
                return slot.value.clone();
            }
        }
        let size = if class.is_varying() { grid_size } else { 1 };
        let value: ValueRef = Rc::new(RefCell::new(Value::new(ty, class, size)));
        pool.push(PoolSlot {
            value: value.clone(),
            in_use: true,
        });
        value
    }

    /// Returns a popped temporary to its pool. A no-op for bound references.
    pub fn release(&mut self, entry: StackEntry) {
        if !entry.is_temp {
            return;
        }
        for pool in self.pools.values_mut() {
            for slot in pool.iter_mut() {
                if Rc::ptr_eq(&slot.value, &entry.data) {
                    slot.in_use = false;
                    return;
                }
            }
        }
    }

    /// Number of temporaries currently checked out of the pools.
    pub fn live_temps(&self) -> usize {
        self.pools
            .values()
            .flat_map(|p| p.iter())
            .filter(|s| s.in_use)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        for pool in self.pools.values_mut() {
            for slot in pool.iter_mut() {
                slot.in_use = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temps_are_recycled() {
        let mut stack = Stack::new();
        let a = stack.next_temp(ValueType::Float, StorageClass::Uniform, 1);
        stack.push(a.clone());
        let mut varying = false;
        let e = stack.pop(&mut varying).unwrap();
        stack.release(e);
        assert_eq!(stack.live_temps(), 0);
        let b = stack.next_temp(ValueType::Float, StorageClass::Uniform, 1);
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn pool_grows_per_key() {
        let mut stack = Stack::new();
        let _a = stack.next_temp(ValueType::Float, StorageClass::Varying, 8);
        let _b = stack.next_temp(ValueType::Float, StorageClass::Varying, 8);
        let _c = stack.next_temp(ValueType::Color, StorageClass::Varying, 8);
        assert_eq!(stack.live_temps(), 3);
    }

    #[test]
    fn bound_references_are_not_pooled() {
        let mut stack = Stack::new();
        let var: ValueRef = Rc::new(RefCell::new(Value::uniform_float(1.0)));
        stack.push_var(var);
        let mut varying = false;
        let e = stack.pop(&mut varying).unwrap();
        assert!(!e.is_temp);
        stack.release(e);
        assert_eq!(stack.live_temps(), 0);
    }

    #[test]
    fn pop_tracks_varying() {
        let mut stack = Stack::new();
        let t = stack.next_temp(ValueType::Float, StorageClass::Varying, 4);
        stack.push(t);
        let mut varying = false;
        let e = stack.pop(&mut varying).unwrap();
        assert!(varying);
        stack.release(e);
    }
}
