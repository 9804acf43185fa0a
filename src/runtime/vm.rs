use std::cell::RefCell;
use std::sync::Arc;

use log::trace;

use crate::bytecode::op::Op;
use crate::bytecode::seg::CodeSeg;
use crate::lang::object::Obj;
use crate::lang::value::{Place, Value};
use crate::runtime::runtime_error::RuntimeError;
use crate::types::{truthy, TypeId, TypeStore};

// =============================================================================
// VM - Byte-at-a-time fetch/decode/dispatch interpreter
// =============================================================================
//
// One frame per active call, all sharing a single value stack. A frame is
// (base, self object, outer object, result slot); arguments sit below the
// base, block locals above it. Type errors that a correct generator cannot
// produce are fatals; everything a running program can trigger unwinds as
// a RuntimeError.

pub struct Vm<'a> {
    store: &'a TypeStore,
    /// Module instances by registration index, for static variable access.
    datasegs: &'a [Arc<RefCell<Obj>>],
    /// Everything `echo` produced.
    pub output: String,
    /// Current source line, maintained by LineNum markers.
    pub line: u16,
    pub enable_assert: bool,
}

fn pop(stack: &mut Vec<Value>) -> Value {
    match stack.pop() {
        Some(v) => v,
        None => panic!("fatal: value stack underflow"),
    }
}

fn pop_ord(stack: &mut Vec<Value>) -> Result<i64, RuntimeError> {
    let v = pop(stack);
    v.as_ord()
        .ok_or_else(|| RuntimeError::type_mismatch("ordinal", v.kind_name()))
}

fn pop_index(stack: &mut Vec<Value>) -> Result<i64, RuntimeError> {
    let i = pop_ord(stack)?;
    if i < 0 {
        return Err(RuntimeError::IndexOutOfBounds { index: i });
    }
    Ok(i)
}

fn pop_place(stack: &mut Vec<Value>) -> Place {
    match pop(stack) {
        Value::Place(p) => p,
        other => panic!("fatal: place expected, got {}", other.kind_name()),
    }
}

fn pop_obj(stack: &mut Vec<Value>) -> Result<Arc<RefCell<Obj>>, RuntimeError> {
    match pop(stack) {
        Value::Obj(o) => Ok(o),
        other => Err(RuntimeError::type_mismatch("object", other.kind_name())),
    }
}

fn local_idx(base: usize, slot: i8) -> usize {
    let idx = base as i64 + slot as i64;
    debug_assert!(idx >= 0);
    idx as usize
}

fn expect_obj<'o>(obj: Option<&'o Arc<RefCell<Obj>>>, what: &str) -> &'o Arc<RefCell<Obj>> {
    match obj {
        Some(o) => o,
        None => panic!("fatal: no {} object in this frame", what),
    }
}

/// Unquoted rendition used by `echo` and string conversion.
fn text(v: &Value) -> String {
    match v {
        Value::Str(s) => s.iter().map(|&b| b as char).collect(),
        Value::Char(c) => (*c as char).to_string(),
        other => other.to_string(),
    }
}

impl<'a> Vm<'a> {
    pub fn new(store: &'a TypeStore, datasegs: &'a [Arc<RefCell<Obj>>]) -> Self {
        Vm {
            store,
            datasegs,
            output: String::new(),
            line: 0,
            enable_assert: true,
        }
    }

    /// Run a state body in a fresh bottom frame over the given instance.
    pub fn run_state(
        &mut self,
        state: TypeId,
        instance: &Arc<RefCell<Obj>>,
        stack: &mut Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let store = self.store;
        let body = store.body(state);
        self.exec(body, stack, 0, Some(instance), None)?;
        Ok(())
    }

    fn dataseg(&self, module: u8) -> &Arc<RefCell<Obj>> {
        match self.datasegs.get(module as usize) {
            Some(d) => d,
            None => panic!("fatal: module {} has no data segment", module),
        }
    }

    /// Resolve a place to its storage and run `f` on it.
    fn with_place<R>(
        &self,
        stack: &mut Vec<Value>,
        base: usize,
        self_obj: Option<&Arc<RefCell<Obj>>>,
        outer_obj: Option<&Arc<RefCell<Obj>>>,
        place: Place,
        f: impl FnOnce(&mut Value) -> R,
    ) -> R {
        match place {
            Place::Local(slot) => f(&mut stack[local_idx(base, slot)]),
            Place::SelfVar(slot) => {
                let o = expect_obj(self_obj, "self");
                let mut b = o.borrow_mut();
                f(b.get_mut(slot))
            }
            Place::OuterVar(slot) => {
                let o = expect_obj(outer_obj, "outer");
                let mut b = o.borrow_mut();
                f(b.get_mut(slot))
            }
            Place::Static { module, var } => {
                let mut b = self.dataseg(module).borrow_mut();
                f(b.get_mut(var))
            }
            Place::Member(obj, slot) => {
                let mut b = obj.borrow_mut();
                f(b.get_mut(slot))
            }
            Place::Ref(cell) => f(&mut cell.borrow_mut()),
        }
    }

    /// The dispatch loop for one frame. Returns the frame's result value
    /// (null for a void body).
    fn exec(
        &mut self,
        seg: &CodeSeg,
        stack: &mut Vec<Value>,
        base: usize,
        self_obj: Option<&Arc<RefCell<Obj>>>,
        outer_obj: Option<&Arc<RefCell<Obj>>>,
    ) -> Result<Value, RuntimeError> {
        stack.reserve(seg.stack_size);
        let mut ip = 0usize;
        let mut result = Value::Null;
        loop {
            let op = seg.op_at(ip);
            ip += 1;
            match op {
                Op::End => return Ok(result),
                Op::Nop => {}
                Op::Exit => return Err(RuntimeError::Exit(pop(stack))),

                // ------------------------------------------------- constants
                Op::LoadNull => stack.push(Value::Null),
                Op::LoadFalse => stack.push(Value::Bool(false)),
                Op::LoadTrue => stack.push(Value::Bool(true)),
                Op::LoadChar => {
                    stack.push(Value::Char(seg.u8_at(ip)));
                    ip += 1;
                }
                Op::Load0 => stack.push(Value::Int(0)),
                Op::Load1 => stack.push(Value::Int(1)),
                Op::LoadByte => {
                    stack.push(Value::Int(seg.u8_at(ip) as i64));
                    ip += 1;
                }
                Op::LoadInt => {
                    stack.push(Value::Int(seg.i64_at(ip)));
                    ip += 8;
                }
                Op::LoadEmpty => {
                    let t = TypeId::from_index(seg.u32_at(ip));
                    ip += 4;
                    stack.push(self.store.empty_value(t));
                }
                Op::LoadConst => {
                    stack.push(seg.const_at(seg.u8_at(ip) as usize).clone());
                    ip += 1;
                }
                Op::LoadConst2 => {
                    stack.push(seg.const_at(seg.u16_at(ip) as usize).clone());
                    ip += 2;
                }
                Op::LoadTypeRef => {
                    stack.push(Value::Type(TypeId::from_index(seg.u32_at(ip))));
                    ip += 4;
                }

                // ------------------------------------------------- stack ops
                Op::Pop => {
                    pop(stack);
                }
                Op::Swap => {
                    let n = stack.len();
                    stack.swap(n - 1, n - 2);
                }

                // ----------------------------------------------------- casts
                Op::ToBool => {
                    let v = pop(stack);
                    stack.push(Value::Bool(truthy(&v)));
                }
                Op::ToStr => {
                    let v = pop(stack);
                    stack.push(Value::str(text(&v)));
                }
                Op::Cast => {
                    let t = TypeId::from_index(seg.u32_at(ip));
                    ip += 4;
                    let top = stack.last_mut().unwrap_or_else(|| {
                        panic!("fatal: value stack underflow")
                    });
                    self.store.runtime_typecast(t, top)?;
                }
                Op::IsType => {
                    let t = TypeId::from_index(seg.u32_at(ip));
                    ip += 4;
                    let v = pop(stack);
                    stack.push(Value::Bool(self.store.is_my_type(t, &v)));
                }

                // ------------------------------------------------ arithmetic
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::BitAnd
                | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr => {
                    let b = pop_ord(stack)?;
                    let a = pop_ord(stack)?;
                    let r = match op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Mul => a.wrapping_mul(b),
                        Op::Div => {
                            if b == 0 {
                                return Err(RuntimeError::other("division by zero"));
                            }
                            a.wrapping_div(b)
                        }
                        Op::Mod => {
                            if b == 0 {
                                return Err(RuntimeError::other("division by zero"));
                            }
                            a.wrapping_rem(b)
                        }
                        Op::BitAnd => a & b,
                        Op::BitOr => a | b,
                        Op::BitXor => a ^ b,
                        Op::Shl => a.wrapping_shl(b as u32),
                        Op::Shr => a.wrapping_shr(b as u32),
                        _ => unreachable!(),
                    };
                    stack.push(Value::Int(r));
                }
                Op::Neg => {
                    let a = pop_ord(stack)?;
                    stack.push(Value::Int(a.wrapping_neg()));
                }
                Op::BitNot => {
                    let a = pop_ord(stack)?;
                    stack.push(Value::Int(!a));
                }
                Op::Not => {
                    let v = pop(stack);
                    stack.push(Value::Bool(!truthy(&v)));
                }

                // -------------------------------------------- concatenation
                Op::CharToStr => {
                    let v = pop(stack);
                    stack.push(Value::str(text(&v)));
                }
                Op::CharCat => {
                    let c = pop_ord(stack)?;
                    stack
                        .last_mut()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"))
                        .char_cat(c as u8);
                }
                Op::StrCat => {
                    let b = pop(stack);
                    let s = match &b {
                        Value::Str(s) => s.clone(),
                        other => {
                            return Err(RuntimeError::type_mismatch("str", other.kind_name()))
                        }
                    };
                    stack
                        .last_mut()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"))
                        .str_cat(&s);
                }
                Op::ElemToVec => {
                    let v = pop(stack);
                    stack.push(Value::list(vec![v]));
                }
                Op::ElemCat => {
                    let e = pop(stack);
                    let top = stack
                        .last_mut()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"));
                    match top {
                        Value::Set(_) | Value::OrdSet(_) => top.set_add(e),
                        _ => top.elem_cat(e),
                    }
                }
                Op::VecCat => {
                    let b = pop(stack);
                    let items = match &b {
                        Value::List(l) => l.clone(),
                        other => {
                            return Err(RuntimeError::type_mismatch("vector", other.kind_name()))
                        }
                    };
                    stack
                        .last_mut()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"))
                        .vec_cat(&items);
                }

                // ---------------------------------------------------- ranges
                Op::MkRange => {
                    let right = pop_ord(stack)?;
                    let left = pop_ord(stack)?;
                    stack.push(Value::range(left, right));
                }
                Op::InRange => {
                    let r = pop(stack);
                    let v = pop_ord(stack)?;
                    match r {
                        Value::Range(b) => stack.push(Value::Bool(v >= b.0 && v <= b.1)),
                        other => {
                            return Err(RuntimeError::type_mismatch("range", other.kind_name()))
                        }
                    }
                }

                // ------------------------------------------------ comparison
                Op::CmpOrd => {
                    let b = pop_ord(stack)?;
                    let a = pop_ord(stack)?;
                    stack.push(Value::Int(match a.cmp(&b) {
                        std::cmp::Ordering::Less => -1,
                        std::cmp::Ordering::Equal => 0,
                        std::cmp::Ordering::Greater => 1,
                    }));
                }
                Op::CmpStr | Op::CmpVar => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(Value::Int(match a.cmp(&b) {
                        std::cmp::Ordering::Less => -1,
                        std::cmp::Ordering::Equal => 0,
                        std::cmp::Ordering::Greater => 1,
                    }));
                }
                Op::Equal | Op::NotEq | Op::LessThan | Op::LessEq | Op::GreaterThan
                | Op::GreaterEq => {
                    let c = pop_ord(stack)?;
                    let r = match op {
                        Op::Equal => c == 0,
                        Op::NotEq => c != 0,
                        Op::LessThan => c < 0,
                        Op::LessEq => c <= 0,
                        Op::GreaterThan => c > 0,
                        Op::GreaterEq => c >= 0,
                        _ => unreachable!(),
                    };
                    stack.push(Value::Bool(r));
                }
                Op::CaseOrd => {
                    let label = pop(stack);
                    let sel = stack
                        .last()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"));
                    let eq = match (sel.as_ord(), label.as_ord()) {
                        (Some(a), Some(b)) => a == b,
                        _ => *sel == label,
                    };
                    stack.push(Value::Bool(eq));
                }
                Op::CaseRange => {
                    let right = pop_ord(stack)?;
                    let left = pop_ord(stack)?;
                    let sel = stack
                        .last()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"));
                    let s = sel
                        .as_ord()
                        .ok_or_else(|| RuntimeError::type_mismatch("ordinal", sel.kind_name()))?;
                    stack.push(Value::Bool(s >= left && s <= right));
                }

                // --------------------------------------------------- loaders
                Op::LoadResult => stack.push(result.clone()),
                Op::LoadLocal => {
                    let slot = seg.i8_at(ip);
                    ip += 1;
                    let v = stack[local_idx(base, slot)].clone();
                    stack.push(v);
                }
                Op::LoadSelfVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let v = expect_obj(self_obj, "self").borrow().get(slot).clone();
                    stack.push(v);
                }
                Op::LoadOuterVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let v = expect_obj(outer_obj, "outer").borrow().get(slot).clone();
                    stack.push(v);
                }
                Op::LoadStatic => {
                    let module = seg.u8_at(ip);
                    let slot = seg.u8_at(ip + 1);
                    ip += 2;
                    let v = self.dataseg(module).borrow().get(slot).clone();
                    stack.push(v);
                }
                Op::LoadMember => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let obj = pop_obj(stack)?;
                    let v = obj.borrow().get(slot).clone();
                    stack.push(v);
                }
                Op::Deref => {
                    let v = match pop(stack) {
                        Value::Ref(cell) => cell.borrow().clone(),
                        other => {
                            return Err(RuntimeError::type_mismatch("ref", other.kind_name()))
                        }
                    };
                    stack.push(v);
                }
                Op::LoadStrElem => {
                    let i = pop_index(stack)?;
                    let s = pop(stack);
                    match &s {
                        Value::Str(s) => match s.get(i as usize) {
                            Some(c) => stack.push(Value::Char(*c)),
                            None => return Err(RuntimeError::IndexOutOfBounds { index: i }),
                        },
                        other => {
                            return Err(RuntimeError::type_mismatch("str", other.kind_name()))
                        }
                    }
                }
                Op::LoadVecElem | Op::LoadArrElem => {
                    let i = pop_index(stack)?;
                    let l = pop(stack);
                    match &l {
                        Value::List(items) => match items.get(i as usize) {
                            Some(v) => stack.push(v.clone()),
                            None => return Err(RuntimeError::IndexOutOfBounds { index: i }),
                        },
                        other => {
                            return Err(RuntimeError::type_mismatch("vector", other.kind_name()))
                        }
                    }
                }
                Op::LoadDictElem => {
                    let key = pop(stack);
                    let d = pop(stack);
                    match &d {
                        Value::Dict(pairs) => match pairs.get(&key) {
                            Some(v) => stack.push(v.clone()),
                            None => return Err(RuntimeError::KeyNotFound),
                        },
                        other => {
                            return Err(RuntimeError::type_mismatch("dict", other.kind_name()))
                        }
                    }
                }

                // --------------------------------------------------- storers
                Op::StoreResult => result = pop(stack),
                Op::StoreLocal => {
                    let slot = seg.i8_at(ip);
                    ip += 1;
                    let v = pop(stack);
                    stack[local_idx(base, slot)] = v;
                }
                Op::StoreSelfVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let v = pop(stack);
                    expect_obj(self_obj, "self").borrow_mut().set(slot, v);
                }
                Op::StoreOuterVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let v = pop(stack);
                    expect_obj(outer_obj, "outer").borrow_mut().set(slot, v);
                }
                Op::StoreStatic => {
                    let module = seg.u8_at(ip);
                    let slot = seg.u8_at(ip + 1);
                    ip += 2;
                    let v = pop(stack);
                    self.dataseg(module).borrow_mut().set(slot, v);
                }
                Op::StoreMember => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let v = pop(stack);
                    let obj = pop_obj(stack)?;
                    obj.borrow_mut().set(slot, v);
                }
                Op::StoreRef => {
                    let v = pop(stack);
                    match pop(stack) {
                        Value::Ref(cell) => *cell.borrow_mut() = v,
                        other => {
                            return Err(RuntimeError::type_mismatch("ref", other.kind_name()))
                        }
                    }
                }
                Op::StoreStrElem => {
                    let v = pop_ord(stack)?;
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.put_str_elem(i as usize, v as u8)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::StoreVecElem | Op::StoreArrElem => {
                    let v = pop(stack);
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.put_list_elem(i as usize, v)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::StoreDictElem => {
                    let v = pop(stack);
                    let key = pop(stack);
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.dict_put(key, v)
                    });
                }

                // ------------------------------------------------------ leas
                Op::LeaLocal => {
                    let slot = seg.i8_at(ip);
                    ip += 1;
                    stack.push(Value::Place(Place::Local(slot)));
                }
                Op::LeaSelfVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    stack.push(Value::Place(Place::SelfVar(slot)));
                }
                Op::LeaOuterVar => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    stack.push(Value::Place(Place::OuterVar(slot)));
                }
                Op::LeaStatic => {
                    let module = seg.u8_at(ip);
                    let var = seg.u8_at(ip + 1);
                    ip += 2;
                    stack.push(Value::Place(Place::Static { module, var }));
                }
                Op::LeaMember => {
                    let slot = seg.u8_at(ip);
                    ip += 1;
                    let obj = pop_obj(stack)?;
                    stack.push(Value::Place(Place::Member(obj, slot)));
                }
                Op::LeaRef => match pop(stack) {
                    Value::Ref(cell) => stack.push(Value::Place(Place::Ref(cell))),
                    other => {
                        return Err(RuntimeError::type_mismatch("ref", other.kind_name()))
                    }
                },

                // --------------------------------- in-place cat through a place
                Op::CharCatAssign => {
                    let c = pop_ord(stack)?;
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.char_cat(c as u8)
                    });
                }
                Op::StrCatAssign => {
                    let b = pop(stack);
                    let s = match &b {
                        Value::Str(s) => s.clone(),
                        other => {
                            return Err(RuntimeError::type_mismatch("str", other.kind_name()))
                        }
                    };
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.str_cat(&s)
                    });
                }
                Op::ElemCatAssign => {
                    let e = pop(stack);
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| match t {
                        Value::Set(_) | Value::OrdSet(_) => t.set_add(e),
                        _ => t.elem_cat(e),
                    });
                }
                Op::VecCatAssign => {
                    let b = pop(stack);
                    let items = match &b {
                        Value::List(l) => l.clone(),
                        other => {
                            return Err(RuntimeError::type_mismatch("vector", other.kind_name()))
                        }
                    };
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.vec_cat(&items)
                    });
                }

                // --------------------------------------- inserters, deleters
                Op::StrIns => {
                    let c = pop_ord(stack)?;
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.str_insert(i as usize, c as u8)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::VecIns => {
                    let v = pop(stack);
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.list_insert(i as usize, v)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::DelStrElem => {
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.del_str_elem(i as usize)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::DelVecElem => {
                    let i = pop_index(stack)?;
                    let place = pop_place(stack);
                    let ok = self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.del_list_elem(i as usize)
                    });
                    if !ok {
                        return Err(RuntimeError::IndexOutOfBounds { index: i });
                    }
                }
                Op::DelDictElem => {
                    let key = pop(stack);
                    let place = pop_place(stack);
                    // slot arrays null the slot; true dictionaries drop the key
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| match t {
                        Value::List(_) => {
                            if let Some(i) = key.as_ord() {
                                t.put_list_elem(i as usize, Value::Null);
                            }
                        }
                        _ => t.dict_remove(&key),
                    });
                }
                Op::DelSetElem => {
                    let e = pop(stack);
                    let place = pop_place(stack);
                    self.with_place(stack, base, self_obj, outer_obj, place, |t| {
                        t.set_remove(&e)
                    });
                }

                // ----------------------------------------------------- jumps
                Op::Jump => {
                    let d = seg.i16_at(ip);
                    ip = (ip as i64 + 2 + d as i64) as usize;
                }
                Op::JumpTrue => {
                    let d = seg.i16_at(ip);
                    ip += 2;
                    if truthy(&pop(stack)) {
                        ip = (ip as i64 + d as i64) as usize;
                    }
                }
                Op::JumpFalse => {
                    let d = seg.i16_at(ip);
                    ip += 2;
                    if !truthy(&pop(stack)) {
                        ip = (ip as i64 + d as i64) as usize;
                    }
                }
                Op::JumpOr => {
                    let d = seg.i16_at(ip);
                    ip += 2;
                    let top = stack
                        .last()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"));
                    if truthy(top) {
                        ip = (ip as i64 + d as i64) as usize;
                    } else {
                        pop(stack);
                    }
                }
                Op::JumpAnd => {
                    let d = seg.i16_at(ip);
                    ip += 2;
                    let top = stack
                        .last()
                        .unwrap_or_else(|| panic!("fatal: value stack underflow"));
                    if !truthy(top) {
                        ip = (ip as i64 + d as i64) as usize;
                    } else {
                        pop(stack);
                    }
                }

                // ----------------------------------------------------- calls
                Op::SiblingCall | Op::ChildCall | Op::MethodCall => {
                    let callee = TypeId::from_index(seg.u32_at(ip));
                    ip += 4;
                    self.call(op, callee, stack, self_obj, outer_obj)?;
                }
                Op::IndirectCall => {
                    panic!("fatal: indirect calls are not implemented")
                }
                Op::MkRef => {
                    let v = pop(stack);
                    stack.push(Value::Ref(Arc::new(RefCell::new(v))));
                }

                // ------------------------------------------------ statements
                Op::Echo => {
                    let v = pop(stack);
                    self.output.push_str(&text(&v));
                }
                Op::EchoLn => self.output.push('\n'),
                Op::Assert => {
                    let idx = seg.u16_at(ip) as usize;
                    ip += 2;
                    let cond = pop(stack);
                    if self.enable_assert && !truthy(&cond) {
                        let source = text(seg.const_at(idx));
                        return Err(RuntimeError::AssertionFailed(source));
                    }
                }
                Op::LineNum => {
                    self.line = seg.u16_at(ip);
                    ip += 2;
                }
            }
        }
    }

    fn call(
        &mut self,
        op: Op,
        callee: TypeId,
        stack: &mut Vec<Value>,
        self_obj: Option<&Arc<RefCell<Obj>>>,
        outer_obj: Option<&Arc<RefCell<Obj>>>,
    ) -> Result<(), RuntimeError> {
        let store = self.store;
        let (nargs, is_void, var_count) = {
            let s = store.state(callee);
            (s.args.len(), store.is_void(s.ret), s.self_var_count as usize)
        };
        trace!("{:?} '{}' nargs={}", op, store.name(callee), nargs);
        let callee_outer: Option<Arc<RefCell<Obj>>> = match op {
            Op::ChildCall => self_obj.cloned(),
            Op::SiblingCall => outer_obj.cloned(),
            Op::MethodCall => {
                let pos = stack.len() - nargs - 1;
                match stack.remove(pos) {
                    Value::Obj(o) => Some(o),
                    other => {
                        return Err(RuntimeError::type_mismatch("object", other.kind_name()))
                    }
                }
            }
            _ => unreachable!(),
        };
        let callee_self = Arc::new(RefCell::new(Obj::new(callee, var_count)));
        let new_base = stack.len();
        let body = store.body(callee);
        let result = self.exec(body, stack, new_base, Some(&callee_self), callee_outer.as_ref())?;
        stack.truncate(new_base - nargs);
        if !is_void {
            stack.push(result);
        }
        Ok(())
    }
}

/// Evaluate a closed state-less segment, e.g. a constant expression.
pub fn run_const(store: &TypeStore, seg: &CodeSeg) -> Result<Value, RuntimeError> {
    let mut vm = Vm::new(store, &[]);
    let mut stack = Vec::new();
    vm.exec(seg, &mut stack, 0, None, None)?;
    match stack.pop() {
        Some(v) => Ok(v),
        None => panic!("fatal: constant expression left no value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::codegen::CodeGen;

    fn store() -> TypeStore {
        TypeStore::new()
    }

    fn run(store: &TypeStore, build: impl FnOnce(&mut CodeSeg)) -> Result<Vec<Value>, RuntimeError> {
        let mut seg = CodeSeg::new(None);
        build(&mut seg);
        seg.close(16);
        let mut vm = Vm::new(store, &[]);
        let mut stack = Vec::new();
        vm.exec(&seg, &mut stack, 0, None, None)?;
        Ok(stack)
    }

    #[test]
    fn test_arithmetic() {
        let st = store();
        let stack = run(&st, |s| {
            s.add_op(Op::LoadByte);
            s.add_u8(6);
            s.add_op(Op::LoadByte);
            s.add_u8(7);
            s.add_op(Op::Mul);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Int(42)]);
    }

    #[test]
    fn test_division_by_zero() {
        let st = store();
        let err = run(&st, |s| {
            s.add_op(Op::Load1);
            s.add_op(Op::Load0);
            s.add_op(Op::Div);
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::other("division by zero"));
    }

    #[test]
    fn test_str_cat() {
        let st = store();
        let stack = run(&st, |s| {
            let a = s.add_const(Value::str("ab"));
            let b = s.add_const(Value::str("cd"));
            s.add_op(Op::LoadConst);
            s.add_u8(a as u8);
            s.add_op(Op::LoadConst);
            s.add_u8(b as u8);
            s.add_op(Op::StrCat);
            s.add_op(Op::LoadChar);
            s.add_u8(b'!');
            s.add_op(Op::CharCat);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::str("abcd!")]);
    }

    #[test]
    fn test_str_elem_full_char_domain() {
        // a char above 127 stays one element wide through cat and load
        let st = store();
        let stack = run(&st, |s| {
            let idx = s.add_const(Value::str("a"));
            s.add_op(Op::LoadConst);
            s.add_u8(idx as u8);
            s.add_op(Op::LoadChar);
            s.add_u8(200);
            s.add_op(Op::CharCat);
            s.add_op(Op::Load1);
            s.add_op(Op::LoadStrElem);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Char(200)]);
    }

    #[test]
    fn test_shared_const_not_mutated() {
        // concatenating onto a loaded constant must copy, not touch the
        // segment's constant table
        let st = store();
        let mut seg = CodeSeg::new(None);
        let a = seg.add_const(Value::str("ab"));
        seg.add_op(Op::LoadConst);
        seg.add_u8(a as u8);
        seg.add_op(Op::LoadChar);
        seg.add_u8(b'c');
        seg.add_op(Op::CharCat);
        seg.close(4);
        let mut vm = Vm::new(&st, &[]);
        let mut stack = Vec::new();
        vm.exec(&seg, &mut stack, 0, None, None).unwrap();
        assert_eq!(stack, vec![Value::str("abc")]);
        assert_eq!(seg.const_at(0), &Value::str("ab"));
    }

    #[test]
    fn test_jump_false_skips() {
        let st = store();
        let stack = run(&st, |s| {
            s.add_op(Op::LoadFalse);
            s.add_op(Op::JumpFalse);
            s.add_i16(1); // over the Load1
            s.add_op(Op::Load1);
            s.add_op(Op::Load0);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Int(0)]);
    }

    #[test]
    fn test_jump_or_short_circuit() {
        let st = store();
        let stack = run(&st, |s| {
            s.add_op(Op::LoadTrue);
            s.add_op(Op::JumpOr);
            s.add_i16(1); // over the LoadFalse
            s.add_op(Op::LoadFalse);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_cmp_ord() {
        let st = store();
        let stack = run(&st, |s| {
            s.add_op(Op::Load0);
            s.add_op(Op::Load1);
            s.add_op(Op::CmpOrd);
            s.add_op(Op::LessThan);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_assert_failure_carries_source() {
        let st = store();
        let err = run(&st, |s| {
            let idx = s.add_const(Value::str("x > 0"));
            s.add_op(Op::LoadFalse);
            s.add_op(Op::Assert);
            s.add_u16(idx as u16);
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::AssertionFailed("x > 0".into()));
    }

    #[test]
    fn test_exit_unwinds_with_value() {
        let st = store();
        let err = run(&st, |s| {
            s.add_op(Op::LoadByte);
            s.add_u8(3);
            s.add_op(Op::Exit);
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::Exit(Value::Int(3)));
    }

    #[test]
    fn test_echo_output() {
        let st = store();
        let mut seg = CodeSeg::new(None);
        let idx = seg.add_const(Value::str("hello"));
        seg.add_op(Op::LoadConst);
        seg.add_u8(idx as u8);
        seg.add_op(Op::Echo);
        seg.add_op(Op::EchoLn);
        seg.close(2);
        let mut vm = Vm::new(&st, &[]);
        let mut stack = Vec::new();
        vm.exec(&seg, &mut stack, 0, None, None).unwrap();
        assert_eq!(vm.output, "hello\n");
    }

    #[test]
    fn test_load_empty_array_is_presized() {
        let mut st = store();
        let arr = st.derive_container(st.builtins.bool_, st.builtins.int);
        let stack = run(&st, |s| {
            s.add_op(Op::LoadEmpty);
            s.add_u32(arr.index());
        })
        .unwrap();
        match &stack[0] {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {}", other),
        }
    }

    #[test]
    fn test_vec_elem_out_of_bounds() {
        let st = store();
        let err = run(&st, |s| {
            let idx = s.add_const(Value::list(vec![Value::Int(1)]));
            s.add_op(Op::LoadConst);
            s.add_u8(idx as u8);
            s.add_op(Op::LoadByte);
            s.add_u8(5);
            s.add_op(Op::LoadVecElem);
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::IndexOutOfBounds { index: 5 });
    }

    #[test]
    fn test_runtime_cast_out_of_range() {
        let mut st = store();
        let digits = st.derive_subrange(st.builtins.char_, 48, 57).unwrap();
        let err = run(&st, |s| {
            s.add_op(Op::LoadByte);
            s.add_u8(200);
            s.add_op(Op::Cast);
            s.add_u32(digits.index());
        })
        .unwrap_err();
        assert_eq!(err, RuntimeError::OutOfRange);
    }

    #[test]
    fn test_member_store_and_load() {
        let mut st = store();
        let m = st.new_module("m");
        let obj = Arc::new(RefCell::new(Obj::new(m, 1)));
        let stack = run(&st, |s| {
            let idx = s.add_const(Value::Obj(obj.clone()));
            s.add_op(Op::LoadConst);
            s.add_u8(idx as u8);
            s.add_op(Op::LoadByte);
            s.add_u8(7);
            s.add_op(Op::StoreMember);
            s.add_u8(0);
            s.add_op(Op::LoadConst);
            s.add_u8(idx as u8);
            s.add_op(Op::LoadMember);
            s.add_u8(0);
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Int(7)]);
        assert_eq!(*obj.borrow().get(0), Value::Int(7));
    }

    #[test]
    fn test_method_call_uses_receiver_as_outer() {
        // getx() reads the receiver's first variable through the outer frame
        let mut st = store();
        let int = st.builtins.int;
        let m = st.new_module("m");
        st.add_this_var(m, "x", int).unwrap();
        let getx = st.new_state("getx", m, Vec::new(), Some(int)).unwrap();
        let body = {
            let mut cg = CodeGen::new(&mut st, getx);
            cg.load_ident("result").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_ident("x").unwrap();
            cg.assignment(storer).unwrap();
            cg.end()
        };
        st.set_body(getx, body);
        let obj = Arc::new(RefCell::new(Obj::new(m, 1)));
        obj.borrow_mut().set(0, Value::Int(5));
        let stack = run(&st, |s| {
            let idx = s.add_const(Value::Obj(obj.clone()));
            s.add_op(Op::LoadConst);
            s.add_u8(idx as u8);
            s.add_op(Op::MethodCall);
            s.add_u32(getx.index());
        })
        .unwrap();
        assert_eq!(stack, vec![Value::Int(5)]);
    }

    #[test]
    fn test_function_call_round_trip() {
        // double(x) = x * 2, called from the module body
        let mut st = store();
        let int = st.builtins.int;
        let m = st.new_module("m");
        let double = st
            .new_state("double", m, vec![("x".into(), int)], Some(int))
            .unwrap();
        let body = {
            let mut cg = CodeGen::new(&mut st, double);
            // result := x * 2
            cg.load_ident("result").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_ident("x").unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.arithm_binary(Op::Mul).unwrap();
            cg.assignment(storer).unwrap();
            cg.end()
        };
        st.set_body(double, body);
        let main = {
            let mut cg = CodeGen::new(&mut st, m);
            cg.load_const(int, Value::Int(21)).unwrap();
            cg.call(double, true).unwrap();
            cg.program_exit();
            cg.end()
        };
        st.set_body(m, main);
        let instance = Arc::new(RefCell::new(Obj::new(m, 0)));
        let mut vm = Vm::new(&st, &[]);
        let mut stack = Vec::new();
        let err = vm.run_state(m, &instance, &mut stack).unwrap_err();
        assert_eq!(err, RuntimeError::Exit(Value::Int(42)));
        assert!(stack.is_empty());
    }
}
