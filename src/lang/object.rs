use crate::lang::value::Value;
use crate::types::TypeId;

/// Runtime instance of a state: a flat array of value slots indexed by the
/// compile-time-assigned self-var ids.
///
/// Construction allocates exactly `var_count` slots; destruction drops the
/// slots in reverse id order, mirroring construction order so partially
/// initialized objects unwind safely.
#[derive(Debug)]
pub struct Obj {
    /// The state this object is an instance of (non-owning handle).
    pub state: TypeId,
    vars: Vec<Value>,
}

impl Obj {
    pub fn new(state: TypeId, var_count: usize) -> Self {
        Obj {
            state,
            vars: vec![Value::Null; var_count],
        }
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn get(&self, id: u8) -> &Value {
        match self.vars.get(id as usize) {
            Some(v) => v,
            None => panic!("fatal: object slot {} out of range", id),
        }
    }

    pub fn set(&mut self, id: u8, v: Value) {
        match self.vars.get_mut(id as usize) {
            Some(slot) => *slot = v,
            None => panic!("fatal: object slot {} out of range", id),
        }
    }

    pub fn get_mut(&mut self, id: u8) -> &mut Value {
        match self.vars.get_mut(id as usize) {
            Some(slot) => slot,
            None => panic!("fatal: object slot {} out of range", id),
        }
    }
}

impl Drop for Obj {
    fn drop(&mut self) {
        while self.vars.pop().is_some() {}
    }
}
