use log::debug;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::Op;
use crate::bytecode::seg::CodeSeg;
use crate::lang::value::Value;
use crate::runtime::vm;
use crate::types::scope::{Symbol, SymbolKind};
use crate::types::{ContClass, TypeId, TypeStore};

// =============================================================================
// CODEGEN - One-pass bytecode generator with a simulated operand stack
// =============================================================================
//
// The generator mirrors the future runtime stack at compile time: every
// emitted instruction pushes/pops simulated items carrying the static type
// and enough code offsets to rewrite an already-emitted loader into its
// storer/lea/inserter/deleter counterpart when the expression turns out to
// be an assignment target.

/// One simulated stack slot.
#[derive(Debug, Clone)]
struct SimItem {
    type_id: TypeId,
    /// Start of the contiguous code that computed this value; truncating
    /// to here undoes the whole subexpression.
    offs: usize,
    /// Offset of the final loader instruction, when this value was pushed
    /// by a rewritable loader.
    loader_offs: Option<usize>,
    /// For element loads: the loader that pushed the container the element
    /// came from, so a store can address the container in place.
    base_loader_offs: Option<usize>,
}

#[derive(Debug, Clone)]
struct LocalVar {
    name: String,
    type_id: TypeId,
    /// Frame offset: locals count up from 0, arguments down from -1.
    slot: i8,
}

pub struct CodeGen<'a> {
    pub store: &'a mut TypeStore,
    seg: CodeSeg,
    /// Code owner; `None` for a free constant expression.
    state: Option<TypeId>,
    sim: Vec<SimItem>,
    locals: Vec<LocalVar>,
    args: Vec<LocalVar>,
    max_stack: usize,
    last_op_offs: Option<usize>,
    /// When false, `line_num` emits nothing (release-style builds).
    pub emit_line_markers: bool,
}

impl<'a> CodeGen<'a> {
    pub fn new(store: &'a mut TypeStore, state: TypeId) -> Self {
        let mut args = Vec::new();
        {
            let s = store.state(state);
            let n = s.args.len() as i8;
            for (i, (name, t)) in s.args.iter().enumerate() {
                args.push(LocalVar {
                    name: name.clone(),
                    type_id: *t,
                    slot: i as i8 - n,
                });
            }
        }
        CodeGen {
            store,
            seg: CodeSeg::new(Some(state)),
            state: Some(state),
            sim: Vec::new(),
            locals: Vec::new(),
            args,
            max_stack: 0,
            last_op_offs: None,
            emit_line_markers: true,
        }
    }

    /// Generator for a constant expression: no owner state, no variable
    /// access, result computed by running the finished segment.
    pub fn new_const_expr(store: &'a mut TypeStore) -> Self {
        CodeGen {
            store,
            seg: CodeSeg::new(None),
            state: None,
            sim: Vec::new(),
            locals: Vec::new(),
            args: Vec::new(),
            max_stack: 0,
            last_op_offs: None,
            emit_line_markers: true,
        }
    }

    pub fn is_const_expr(&self) -> bool {
        self.state.is_none()
    }

    pub fn stack_len(&self) -> usize {
        self.sim.len()
    }

    pub fn here(&self) -> usize {
        self.seg.len()
    }

    // =========================================================================
    // Simulated stack
    // =========================================================================

    fn stk_push_at(&mut self, item: SimItem) {
        self.sim.push(item);
        let depth = self.sim.len() + self.locals.len();
        if depth > self.max_stack {
            self.max_stack = depth;
        }
    }

    /// Push the result of the instruction just emitted at `offs`.
    fn stk_push_loaded(&mut self, type_id: TypeId, offs: usize) {
        self.stk_push_at(SimItem {
            type_id,
            offs,
            loader_offs: Some(offs),
            base_loader_offs: None,
        });
    }

    /// Pop `n` operands and push a combined result: not a loader, starts
    /// where the deepest operand started.
    fn stk_replace(&mut self, n: usize, type_id: TypeId) {
        debug_assert!(self.sim.len() >= n && n >= 1);
        let offs = self.sim[self.sim.len() - n].offs;
        self.sim.truncate(self.sim.len() - n);
        self.stk_push_at(SimItem {
            type_id,
            offs,
            loader_offs: None,
            base_loader_offs: None,
        });
    }

    fn stk_pop(&mut self) -> SimItem {
        match self.sim.pop() {
            Some(i) => i,
            None => panic!("fatal: simulated stack underflow"),
        }
    }

    pub fn stk_top_type(&self) -> TypeId {
        match self.sim.last() {
            Some(i) => i.type_id,
            None => panic!("fatal: simulated stack underflow"),
        }
    }

    fn stk_replace_type(&mut self, type_id: TypeId) {
        match self.sim.last_mut() {
            Some(i) => i.type_id = type_id,
            None => panic!("fatal: simulated stack underflow"),
        }
    }

    /// Throw away the top value and the code that computed it.
    pub fn undo_subexpr(&mut self) {
        let item = self.stk_pop();
        self.seg.truncate(item.offs);
        self.last_op_offs = None;
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit(&mut self, op: Op) -> usize {
        let offs = self.seg.len();
        self.seg.add_op(op);
        self.last_op_offs = Some(offs);
        offs
    }

    // =========================================================================
    // Casts
    // =========================================================================

    /// Retype or adapt the top value to `to` without emitting checks.
    /// Returns false when no implicit path exists.
    pub fn try_implicit_cast(&mut self, to: TypeId) -> bool {
        let from = self.stk_top_type();
        if from == to {
            return true;
        }
        if self.store.identical_to(from, to) || self.store.can_assign_to(from, to) {
            self.stk_replace_type(to);
            return true;
        }
        // an untyped empty container literal becomes the expected empty
        if self.store.is_null_cont(from)
            && (self.store.is_any_cont(to) || self.store.is_fifo(to))
        {
            self.undo_subexpr();
            self.load_empty(to);
            return true;
        }
        // single element absorbed into a vector context, e.g. char -> str
        if self.store.is_any_vec(to) {
            if let Some((_, elem, _)) = self.store.cont(to) {
                if self.store.can_assign_to(from, elem) {
                    self.elem_to_vec();
                    self.stk_replace_type(to);
                    return true;
                }
            }
        }
        false
    }

    pub fn implicit_cast(&mut self, to: TypeId, detail: &str) -> Result<(), CompileError> {
        if self.try_implicit_cast(to) {
            Ok(())
        } else {
            Err(CompileError::type_mismatch(detail))
        }
    }

    /// `as`-style conversion: implicit paths first, then runtime-checked
    /// ordinal casts, bool truthiness and stringification.
    pub fn explicit_cast(&mut self, to: TypeId) -> Result<(), CompileError> {
        if self.try_implicit_cast(to) {
            return Ok(());
        }
        let from = self.stk_top_type();
        if self.store.is_bool(to) {
            self.emit(Op::ToBool);
            self.stk_replace(1, to);
            return Ok(());
        }
        if self.store.is_str(to) {
            self.emit(Op::ToStr);
            self.stk_replace(1, to);
            return Ok(());
        }
        if self.store.is_ordinal(to)
            && (self.store.is_variant(from) || self.store.is_ordinal(from))
        {
            self.emit(Op::Cast);
            self.seg.add_u32(to.index());
            self.stk_replace(1, to);
            return Ok(());
        }
        Err(CompileError::type_mismatch("invalid type cast"))
    }

    /// `is`-style dynamic membership test; leaves a bool.
    pub fn is_type(&mut self, t: TypeId) {
        self.emit(Op::IsType);
        self.seg.add_u32(t.index());
        let b = self.store.builtins.bool_;
        self.stk_replace(1, b);
    }

    // =========================================================================
    // Loaders
    // =========================================================================

    pub fn load_const(&mut self, type_id: TypeId, v: Value) -> Result<(), CompileError> {
        let offs = match v {
            Value::Null => self.emit(Op::LoadNull),
            Value::Bool(false) => self.emit(Op::LoadFalse),
            Value::Bool(true) => self.emit(Op::LoadTrue),
            Value::Char(c) => {
                let o = self.emit(Op::LoadChar);
                self.seg.add_u8(c);
                o
            }
            Value::Int(0) => self.emit(Op::Load0),
            Value::Int(1) => self.emit(Op::Load1),
            Value::Int(i) if (0..=255).contains(&i) => {
                let o = self.emit(Op::LoadByte);
                self.seg.add_u8(i as u8);
                o
            }
            Value::Int(i) => {
                let o = self.emit(Op::LoadInt);
                self.seg.add_i64(i);
                o
            }
            Value::Type(t) => {
                let o = self.emit(Op::LoadTypeRef);
                self.seg.add_u32(t.index());
                o
            }
            other => {
                let idx = self.seg.add_const(other);
                if idx <= u8::MAX as usize {
                    let o = self.emit(Op::LoadConst);
                    self.seg.add_u8(idx as u8);
                    o
                } else if idx <= u16::MAX as usize {
                    let o = self.emit(Op::LoadConst2);
                    self.seg.add_u16(idx as u16);
                    o
                } else {
                    return Err(CompileError::ConstOutOfRange);
                }
            }
        };
        self.stk_push_loaded(type_id, offs);
        Ok(())
    }

    pub fn load_typeref(&mut self, t: TypeId) {
        let offs = self.emit(Op::LoadTypeRef);
        self.seg.add_u32(t.index());
        let tr = self.store.builtins.typeref;
        self.stk_push_loaded(tr, offs);
    }

    /// The empty value of a type, e.g. `[]` retyped by context.
    pub fn load_empty(&mut self, t: TypeId) {
        let offs = self.emit(Op::LoadEmpty);
        self.seg.add_u32(t.index());
        self.stk_push_loaded(t, offs);
    }

    /// The untyped empty container literal.
    pub fn load_null_cont(&mut self) {
        let offs = self.emit(Op::LoadNull);
        let nc = self.store.builtins.null_cont;
        self.stk_push_loaded(nc, offs);
    }

    /// Resolve and load an identifier: block locals and arguments first,
    /// then the owner state's scope chain. Constant expressions may only
    /// name definitions.
    pub fn load_ident(&mut self, name: &str) -> Result<(), CompileError> {
        if let Some(local) = self
            .locals
            .iter()
            .rev()
            .chain(self.args.iter())
            .find(|l| l.name == name)
            .cloned()
        {
            let offs = self.emit(Op::LoadLocal);
            self.seg.add_i8(local.slot);
            self.stk_push_loaded(local.type_id, offs);
            return Ok(());
        }
        let state = match self.state {
            Some(s) => s,
            None => return self.load_definition(name),
        };
        let (host, sym) = match self.store.deep_find(state, name) {
            Some((h, s)) => (h, s.clone()),
            None => return Err(CompileError::unknown_ident(name)),
        };
        self.load_symbol(host, &sym)
    }

    fn load_definition(&mut self, name: &str) -> Result<(), CompileError> {
        let system = self.store.system;
        let sym = match self.store.find_shallow(system, name) {
            Some(s) => s.clone(),
            None => return Err(CompileError::unknown_ident(name)),
        };
        match sym.kind {
            SymbolKind::Const(_) | SymbolKind::TypeAlias(_) => {
                self.load_symbol(system, &sym)
            }
            _ => Err(CompileError::other(format!("'{}' is not a constant", name))),
        }
    }

    pub fn load_symbol(&mut self, host: TypeId, sym: &Symbol) -> Result<(), CompileError> {
        match &sym.kind {
            SymbolKind::Const(v) => self.load_const(sym.type_id, v.clone()),
            SymbolKind::TypeAlias(t) => {
                self.load_typeref(*t);
                Ok(())
            }
            SymbolKind::ResultVar => {
                if self.state != Some(host) {
                    return Err(CompileError::other(
                        "result variable of an enclosing function",
                    ));
                }
                let offs = self.emit(Op::LoadResult);
                self.stk_push_loaded(sym.type_id, offs);
                Ok(())
            }
            SymbolKind::SelfVar { slot } => {
                let state = match self.state {
                    Some(s) => s,
                    None => {
                        return Err(CompileError::other(format!(
                            "'{}' is not a constant",
                            sym.name
                        )))
                    }
                };
                let offs = if host == state {
                    let o = self.emit(Op::LoadSelfVar);
                    self.seg.add_u8(*slot);
                    o
                } else if self.store.state(state).parent == Some(host) {
                    let o = self.emit(Op::LoadOuterVar);
                    self.seg.add_u8(*slot);
                    o
                } else if self.store.is_module(host) {
                    let module = match self.store.state(host).module_index {
                        Some(m) => m,
                        None => {
                            return Err(CompileError::other(format!(
                                "module '{}' is not registered",
                                self.store.name(host)
                            )))
                        }
                    };
                    let o = self.emit(Op::LoadStatic);
                    self.seg.add_u8(module);
                    self.seg.add_u8(*slot);
                    o
                } else {
                    return Err(CompileError::other(format!(
                        "variable '{}' is not accessible here",
                        sym.name
                    )));
                };
                self.stk_push_loaded(sym.type_id, offs);
                Ok(())
            }
        }
    }

    /// Member access on an object value: `obj.name`.
    pub fn load_member(&mut self, name: &str) -> Result<(), CompileError> {
        let obj_t = self.stk_top_type();
        if !self.store.is_state(obj_t) {
            return Err(CompileError::type_mismatch("object expected"));
        }
        let sym = match self.store.find_shallow(obj_t, name) {
            Some(s) => s.clone(),
            None => return Err(CompileError::unknown_ident(name)),
        };
        match sym.kind {
            SymbolKind::SelfVar { slot } => {
                let base = self.stk_pop();
                let offs = self.emit(Op::LoadMember);
                self.seg.add_u8(slot);
                self.stk_push_at(SimItem {
                    type_id: sym.type_id,
                    offs: base.offs,
                    loader_offs: Some(offs),
                    base_loader_offs: None,
                });
                Ok(())
            }
            SymbolKind::Const(_) | SymbolKind::TypeAlias(_) => {
                // definitions need no object value at runtime
                self.undo_subexpr();
                self.load_symbol(obj_t, &sym)
            }
            SymbolKind::ResultVar => Err(CompileError::NotLvalue),
        }
    }

    /// Dereference a reference value.
    pub fn deref(&mut self) -> Result<(), CompileError> {
        // reference types are transparent at the sim level; the item type
        // is already the referent's
        let item = self.stk_pop();
        let offs = self.emit(Op::Deref);
        self.stk_push_at(SimItem {
            type_id: item.type_id,
            offs: item.offs,
            loader_offs: Some(offs),
            base_loader_offs: None,
        });
        Ok(())
    }

    /// Wrap the top value into a fresh shared reference cell.
    pub fn mk_ref(&mut self) {
        let t = self.stk_top_type();
        self.emit(Op::MkRef);
        self.stk_replace(1, t);
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// `cont[index]`: stack holds [container, index].
    pub fn load_container_elem(&mut self) -> Result<(), CompileError> {
        let cont_t = self.sim[self.sim.len() - 2].type_id;
        let (index_t, elem_t, class) = match self.store.cont(cont_t) {
            Some(c) => c,
            None => return Err(CompileError::type_mismatch("container expected")),
        };
        let int = self.store.builtins.int;
        let op = match class {
            ContClass::Vector => {
                self.implicit_cast(int, "integer index expected")?;
                if self.store.is_str(cont_t) {
                    Op::LoadStrElem
                } else {
                    Op::LoadVecElem
                }
            }
            ContClass::Array => {
                self.implicit_cast(index_t, "invalid array index type")?;
                // slot arrays are zero-based; shift non-zero domains
                let left = self
                    .store
                    .ord(index_t)
                    .map(|o| o.left)
                    .unwrap_or(0);
                if left != 0 {
                    self.load_const(int, Value::Int(left))?;
                    self.emit(Op::Sub);
                    self.stk_replace(2, int);
                }
                Op::LoadArrElem
            }
            ContClass::Dict => {
                self.implicit_cast(index_t, "invalid dictionary key type")?;
                Op::LoadDictElem
            }
            ContClass::Set | ContClass::OrdSet => {
                return Err(CompileError::type_mismatch("set elements have no value"))
            }
        };
        self.stk_pop(); // index
        let cont_item = self.stk_pop();
        let offs = self.emit(op);
        let elem_t = if self.store.is_variant(elem_t) || self.store.is_none(elem_t) {
            self.store.builtins.variant
        } else {
            elem_t
        };
        self.stk_push_at(SimItem {
            type_id: elem_t,
            offs: cont_item.offs,
            loader_offs: Some(offs),
            base_loader_offs: cont_item.loader_offs,
        });
        Ok(())
    }

    /// Lift the top element into a one-element vector of it.
    pub fn elem_to_vec(&mut self) {
        let elem_t = self.stk_top_type();
        if self.store.is_char(elem_t) {
            self.emit(Op::CharToStr);
            let s = self.store.builtins.str_;
            self.stk_replace(1, s);
        } else {
            self.emit(Op::ElemToVec);
            let v = self.store.derive_vector(elem_t);
            self.stk_replace(1, v);
        }
    }

    /// `vec | elem`: append one element; stack [vec, elem]. Also grows
    /// sets, whose append is insertion.
    pub fn elem_cat(&mut self) -> Result<(), CompileError> {
        let cont_t = self.sim[self.sim.len() - 2].type_id;
        if self.store.is_any_set(cont_t) {
            let (index_t, _, _) = self.store.cont(cont_t).unwrap_or_else(|| {
                panic!("fatal: set type without container info")
            });
            self.implicit_cast(index_t, "set element type mismatch")?;
            self.emit(Op::ElemCat);
            self.stk_replace(2, cont_t);
            return Ok(());
        }
        let (_, elem_t, _) = match self.store.cont(cont_t) {
            Some(c) if self.store.is_any_vec(cont_t) => c,
            _ => return Err(CompileError::type_mismatch("vector expected")),
        };
        self.implicit_cast(elem_t, "element type mismatch")?;
        if self.store.is_str(cont_t) {
            self.emit(Op::CharCat);
        } else {
            self.emit(Op::ElemCat);
        }
        self.stk_replace(2, cont_t);
        Ok(())
    }

    /// `vec | vec`: concatenation of two vectors of the same type.
    pub fn cat(&mut self) -> Result<(), CompileError> {
        let cont_t = self.sim[self.sim.len() - 2].type_id;
        if !self.store.is_any_vec(cont_t) {
            return Err(CompileError::type_mismatch("vector expected"));
        }
        self.implicit_cast(cont_t, "concatenation type mismatch")?;
        if self.store.is_str(cont_t) {
            self.emit(Op::StrCat);
        } else {
            self.emit(Op::VecCat);
        }
        self.stk_replace(2, cont_t);
        Ok(())
    }

    // =========================================================================
    // Ranges
    // =========================================================================

    /// `a..b` over an ordinal base; stack [left, right].
    pub fn mk_range(&mut self) -> Result<(), CompileError> {
        let left_t = self.sim[self.sim.len() - 2].type_id;
        if !self.store.is_ordinal(left_t) {
            return Err(CompileError::type_mismatch("ordinal range bounds expected"));
        }
        self.implicit_cast(left_t, "range bound type mismatch")?;
        let range_t = self.store.derive_range(left_t)?;
        self.emit(Op::MkRange);
        self.stk_replace(2, range_t);
        Ok(())
    }

    /// `x in r`; stack [value, range].
    pub fn in_range(&mut self) -> Result<(), CompileError> {
        let range_t = self.stk_top_type();
        let val_t = self.sim[self.sim.len() - 2].type_id;
        if !self.store.is_range(range_t) || !self.store.is_ordinal(val_t) {
            return Err(CompileError::type_mismatch("ordinal in range expected"));
        }
        self.emit(Op::InRange);
        let b = self.store.builtins.bool_;
        self.stk_replace(2, b);
        Ok(())
    }

    // =========================================================================
    // Arithmetic, logic, comparison
    // =========================================================================

    pub fn arithm_binary(&mut self, op: Op) -> Result<(), CompileError> {
        let int = self.store.builtins.int;
        let a = self.sim[self.sim.len() - 2].type_id;
        let b = self.stk_top_type();
        if !self.store.can_cast_impl_to(a, int) || !self.store.can_cast_impl_to(b, int) {
            return Err(CompileError::type_mismatch("integer operands expected"));
        }
        self.emit(op);
        self.stk_replace(2, int);
        Ok(())
    }

    pub fn arithm_unary(&mut self, op: Op) -> Result<(), CompileError> {
        let int = self.store.builtins.int;
        if !self.store.can_cast_impl_to(self.stk_top_type(), int) {
            return Err(CompileError::type_mismatch("integer operand expected"));
        }
        self.emit(op);
        self.stk_replace(1, int);
        Ok(())
    }

    pub fn not_op(&mut self) -> Result<(), CompileError> {
        let b = self.store.builtins.bool_;
        self.implicit_cast(b, "boolean operand expected")?;
        self.emit(Op::Not);
        self.stk_replace(1, b);
        Ok(())
    }

    /// Relational comparison; `rel` is one of the six fold opcodes.
    pub fn cmp(&mut self, rel: Op) -> Result<(), CompileError> {
        debug_assert!(matches!(
            rel,
            Op::Equal | Op::NotEq | Op::LessThan | Op::LessEq | Op::GreaterThan | Op::GreaterEq
        ));
        let a = self.sim[self.sim.len() - 2].type_id;
        let b = self.stk_top_type();
        if !self.store.can_cast_impl_to(b, a) && !self.store.can_cast_impl_to(a, b) {
            return Err(CompileError::type_mismatch("comparison type mismatch"));
        }
        let ordered = matches!(
            rel,
            Op::LessThan | Op::LessEq | Op::GreaterThan | Op::GreaterEq
        );
        let cmp_op = if self.store.is_ordinal(a) {
            Op::CmpOrd
        } else if self.store.is_str(a) {
            Op::CmpStr
        } else if ordered {
            return Err(CompileError::type_mismatch(
                "ordering requires ordinal or string operands",
            ));
        } else {
            Op::CmpVar
        };
        self.emit(cmp_op);
        self.emit(rel);
        let bool_ = self.store.builtins.bool_;
        self.stk_replace(2, bool_);
        Ok(())
    }

    /// Case label test: [selector, label] -> [selector, bool].
    pub fn case_cmp(&mut self) -> Result<(), CompileError> {
        let sel_t = self.sim[self.sim.len() - 2].type_id;
        self.implicit_cast(sel_t, "case label type mismatch")?;
        self.emit(Op::CaseOrd);
        let label = self.stk_pop();
        let b = self.store.builtins.bool_;
        self.stk_push_at(SimItem {
            type_id: b,
            offs: label.offs,
            loader_offs: None,
            base_loader_offs: None,
        });
        Ok(())
    }

    /// Case range test: [selector, left, right] -> [selector, bool].
    pub fn case_range_cmp(&mut self) -> Result<(), CompileError> {
        let int = self.store.builtins.int;
        let l = self.sim[self.sim.len() - 2].type_id;
        let r = self.stk_top_type();
        if !self.store.can_cast_impl_to(l, int) || !self.store.can_cast_impl_to(r, int) {
            return Err(CompileError::type_mismatch("ordinal case range expected"));
        }
        self.emit(Op::CaseRange);
        let right = self.stk_pop();
        let _left = self.stk_pop();
        let b = self.store.builtins.bool_;
        self.stk_push_at(SimItem {
            type_id: b,
            offs: right.offs,
            loader_offs: None,
            base_loader_offs: None,
        });
        Ok(())
    }

    // =========================================================================
    // Jumps
    // =========================================================================

    /// Emit a forward conditional jump over a bool; returns the patch
    /// offset for `resolve_jump`.
    pub fn bool_jump_forward(&mut self, op: Op) -> Result<usize, CompileError> {
        debug_assert!(op.is_jump() && op != Op::Jump);
        if !self.store.is_bool(self.stk_top_type()) {
            return Err(CompileError::type_mismatch("boolean expression expected"));
        }
        self.stk_pop();
        self.emit(op);
        let patch = self.seg.len();
        self.seg.add_i16(0);
        Ok(patch)
    }

    /// Unconditional forward jump; returns the patch offset.
    pub fn jump_forward(&mut self) -> usize {
        self.emit(Op::Jump);
        let patch = self.seg.len();
        self.seg.add_i16(0);
        patch
    }

    /// Point a forward jump at the current position.
    pub fn resolve_jump(&mut self, patch: usize) -> Result<(), CompileError> {
        let dist = self.seg.len() as i64 - (patch as i64 + 2);
        debug_assert!(dist >= 0);
        if dist > i16::MAX as i64 {
            return Err(CompileError::JumpTooFar);
        }
        self.seg.put_i16(patch, dist as i16);
        Ok(())
    }

    /// Backward jump to an already generated position (loop closure).
    pub fn jump_backward(&mut self, target: usize) -> Result<(), CompileError> {
        let dist = target as i64 - (self.seg.len() as i64 + 3);
        debug_assert!(dist < 0);
        if dist < i16::MIN as i64 {
            return Err(CompileError::JumpTooFar);
        }
        self.emit(Op::Jump);
        self.seg.add_i16(dist as i16);
        Ok(())
    }

    // =========================================================================
    // Lvalues - retroactive rewriting of already emitted loaders
    // =========================================================================

    /// Turn the designator on top into an assignment target: the final
    /// loader becomes its storer and is excised for re-appending after the
    /// right-hand side; an element store additionally addresses its
    /// container in place.
    pub fn lvalue(&mut self) -> Result<Vec<u8>, CompileError> {
        let item = match self.sim.last() {
            Some(i) => i.clone(),
            None => panic!("fatal: simulated stack underflow"),
        };
        let loader_offs = item.loader_offs.ok_or(CompileError::NotLvalue)?;
        let loader = self.seg.op_at(loader_offs);
        let storer = loader.loader_to_storer()?;
        if matches!(
            storer,
            Op::StoreStrElem | Op::StoreVecElem | Op::StoreDictElem | Op::StoreArrElem
        ) {
            let base = item.base_loader_offs.ok_or(CompileError::NotAddressable)?;
            let base_lea = self.seg.op_at(base).loader_to_lea()?;
            self.seg.replace_op_at(base, base_lea);
        }
        self.seg.replace_op_at(loader_offs, storer);
        self.last_op_offs = None;
        Ok(self.seg.cut_tail(loader_offs))
    }

    /// Complete `lhs := rhs`: cast the right-hand side to the target type
    /// and re-append the excised storer.
    pub fn assignment(&mut self, storer: Vec<u8>) -> Result<(), CompileError> {
        let target_t = self.sim[self.sim.len() - 2].type_id;
        self.implicit_cast(target_t, "type mismatch in assignment")?;
        self.seg.append_bytes(&storer);
        self.last_op_offs = None;
        self.stk_pop(); // rhs
        self.stk_pop(); // target placeholder
        Ok(())
    }

    /// Turn the element designator on top into an insertion target.
    pub fn ins_lvalue(&mut self) -> Result<Vec<u8>, CompileError> {
        let item = match self.sim.last() {
            Some(i) => i.clone(),
            None => panic!("fatal: simulated stack underflow"),
        };
        let loader_offs = item.loader_offs.ok_or(CompileError::NotLvalue)?;
        let inserter = self.seg.op_at(loader_offs).loader_to_inserter()?;
        let base = item.base_loader_offs.ok_or(CompileError::NotAddressable)?;
        let base_lea = self.seg.op_at(base).loader_to_lea()?;
        self.seg.replace_op_at(base, base_lea);
        self.seg.replace_op_at(loader_offs, inserter);
        self.last_op_offs = None;
        Ok(self.seg.cut_tail(loader_offs))
    }

    /// `del cont[index]`: rewrite the element loader into its deleter.
    pub fn delete_elem(&mut self) -> Result<(), CompileError> {
        let item = self.stk_pop();
        let loader_offs = item.loader_offs.ok_or(CompileError::NotLvalue)?;
        let deleter = self.seg.op_at(loader_offs).loader_to_deleter()?;
        let base = item.base_loader_offs.ok_or(CompileError::NotAddressable)?;
        let base_lea = self.seg.op_at(base).loader_to_lea()?;
        self.seg.replace_op_at(base, base_lea);
        self.seg.replace_op_at(loader_offs, deleter);
        self.last_op_offs = None;
        Ok(())
    }

    /// `del s[x]` on a set; stack [set, elem].
    pub fn delete_set_elem(&mut self) -> Result<(), CompileError> {
        let set_t = self.sim[self.sim.len() - 2].type_id;
        if !self.store.is_any_set(set_t) {
            return Err(CompileError::type_mismatch("set expected"));
        }
        let (index_t, _, _) = self
            .store
            .cont(set_t)
            .unwrap_or_else(|| panic!("fatal: set type without container info"));
        self.implicit_cast(index_t, "set element type mismatch")?;
        let set_item = &self.sim[self.sim.len() - 2];
        let base = set_item.loader_offs.ok_or(CompileError::NotAddressable)?;
        let base_lea = self.seg.op_at(base).loader_to_lea()?;
        self.seg.replace_op_at(base, base_lea);
        self.emit(Op::DelSetElem);
        self.stk_pop();
        self.stk_pop();
        Ok(())
    }

    /// Prepare `lhs |= ...`: the designator's loader becomes a lea so the
    /// concatenation can run in place.
    pub fn lea_lvalue(&mut self) -> Result<(), CompileError> {
        let item = match self.sim.last() {
            Some(i) => i.clone(),
            None => panic!("fatal: simulated stack underflow"),
        };
        let loader_offs = item.loader_offs.ok_or(CompileError::NotLvalue)?;
        let lea = self.seg.op_at(loader_offs).loader_to_lea()?;
        self.seg.replace_op_at(loader_offs, lea);
        self.last_op_offs = None;
        Ok(())
    }

    /// Complete `lhs |= rhs` after `lea_lvalue`; stack [place, rhs].
    pub fn cat_assign(&mut self) -> Result<(), CompileError> {
        let target_t = self.sim[self.sim.len() - 2].type_id;
        if !self.store.is_any_vec(target_t) {
            return Err(CompileError::type_mismatch("vector target expected"));
        }
        let rhs_t = self.stk_top_type();
        let (_, elem_t, _) = self
            .store
            .cont(target_t)
            .unwrap_or_else(|| panic!("fatal: vector type without container info"));
        let op = if self.store.identical_to(rhs_t, target_t)
            || self.store.can_cast_impl_to(rhs_t, target_t)
        {
            if self.store.is_str(target_t) {
                Op::StrCatAssign
            } else {
                Op::VecCatAssign
            }
        } else if self.try_implicit_cast(elem_t) {
            if self.store.is_str(target_t) {
                Op::CharCatAssign
            } else {
                Op::ElemCatAssign
            }
        } else {
            return Err(CompileError::type_mismatch("concatenation type mismatch"));
        };
        self.emit(op);
        self.stk_pop();
        self.stk_pop();
        Ok(())
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Adopt the value on top of the stack as a new block-scope variable.
    /// The value physically stays where it is; only bookkeeping changes.
    pub fn init_local_var(&mut self, name: &str) -> Result<(), CompileError> {
        if self.is_const_expr() {
            return Err(CompileError::other("local variable in constant expression"));
        }
        if self.locals.len() + self.args.len() >= 127 {
            return Err(CompileError::TooManyVars);
        }
        if self
            .locals
            .iter()
            .chain(self.args.iter())
            .any(|l| l.name == name)
        {
            return Err(CompileError::DuplicateIdent(name.to_string()));
        }
        let item = self.stk_pop();
        self.locals.push(LocalVar {
            name: name.to_string(),
            type_id: item.type_id,
            slot: self.locals.len() as i8,
        });
        self.last_op_offs = None;
        Ok(())
    }

    /// Close a block scope: pop its variables off the runtime stack.
    pub fn deinit_local_var(&mut self) {
        debug_assert!(!self.locals.is_empty());
        self.locals.pop();
        self.seg.add_op(Op::Pop);
        self.last_op_offs = None;
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call a state. Arguments are already on the stack in declaration
    /// order; a method call additionally has the receiver object below
    /// them. In expression position a void callee is an error; in
    /// statement position a non-void result is discarded.
    pub fn call(&mut self, callee: TypeId, as_expression: bool) -> Result<(), CompileError> {
        if !self.store.is_state(callee) {
            return Err(CompileError::type_mismatch("callable expected"));
        }
        let (arg_types, ret, callee_parent): (Vec<TypeId>, TypeId, Option<TypeId>) = {
            let s = self.store.state(callee);
            (s.args.iter().map(|(_, t)| *t).collect(), s.ret, s.parent)
        };
        let is_void = self.store.is_void(ret);
        if as_expression && is_void {
            return Err(CompileError::VoidFuncAsValue);
        }
        let n = arg_types.len();
        if self.sim.len() < n {
            panic!("fatal: not enough arguments on the simulated stack");
        }
        for (i, want) in arg_types.iter().enumerate() {
            let got = self.sim[self.sim.len() - n + i].type_id;
            if !self.store.can_assign_to(got, *want) {
                return Err(CompileError::type_mismatch("argument type mismatch"));
            }
        }

        let caller = self.state;
        let caller_parent = caller.and_then(|c| self.store.state(c).parent);
        let op = if caller.is_some() && callee_parent == caller {
            Op::ChildCall
        } else if caller.is_some() && callee_parent == caller_parent {
            Op::SiblingCall
        } else {
            // receiver object below the arguments
            let recv_pos = self
                .sim
                .len()
                .checked_sub(n + 1)
                .unwrap_or_else(|| panic!("fatal: method call without receiver"));
            let recv_t = self.sim[recv_pos].type_id;
            match callee_parent {
                Some(p) if self.store.can_cast_impl_to(recv_t, p) => Op::MethodCall,
                _ => return Err(CompileError::type_mismatch("method receiver mismatch")),
            }
        };

        let consumed = n + if op == Op::MethodCall { 1 } else { 0 };
        let result_offs = if consumed > 0 {
            self.sim[self.sim.len() - consumed].offs
        } else {
            self.seg.len()
        };
        self.emit(op);
        self.seg.add_u32(callee.index());
        self.sim.truncate(self.sim.len() - consumed);
        if !is_void {
            self.stk_push_at(SimItem {
                type_id: ret,
                offs: result_offs,
                loader_offs: None,
                base_loader_offs: None,
            });
            if !as_expression {
                self.pop_value();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Discard the top value (expression statement).
    pub fn pop_value(&mut self) {
        self.stk_pop();
        self.seg.add_op(Op::Pop);
        self.last_op_offs = None;
    }

    /// `assert cond`; carries the source text for the failure message.
    pub fn assertion(&mut self, source: &str) -> Result<(), CompileError> {
        let b = self.store.builtins.bool_;
        self.implicit_cast(b, "boolean expression expected")?;
        let idx = self.seg.add_const(Value::str(source));
        if idx > u16::MAX as usize {
            return Err(CompileError::ConstOutOfRange);
        }
        self.emit(Op::Assert);
        self.seg.add_u16(idx as u16);
        self.stk_pop();
        Ok(())
    }

    pub fn echo(&mut self) {
        self.stk_pop();
        self.seg.add_op(Op::Echo);
        self.last_op_offs = None;
    }

    pub fn echo_ln(&mut self) {
        self.seg.add_op(Op::EchoLn);
        self.last_op_offs = None;
    }

    pub fn line_num(&mut self, line: u16) {
        if !self.emit_line_markers {
            return;
        }
        self.emit(Op::LineNum);
        self.seg.add_u16(line);
    }

    /// `exit expr`: unwinds the whole program with the given result.
    pub fn program_exit(&mut self) {
        self.stk_pop();
        self.seg.add_op(Op::Exit);
        self.last_op_offs = None;
    }

    // =========================================================================
    // Finishing
    // =========================================================================

    /// Close the segment. Block scopes must be balanced by now.
    pub fn end(mut self) -> CodeSeg {
        debug_assert!(self.sim.is_empty(), "value left on the simulated stack");
        debug_assert!(self.locals.is_empty(), "unclosed block scope");
        self.seg.close(self.max_stack);
        debug!(
            "closed segment: {} bytes, {} consts, stack depth {}",
            self.seg.len(),
            self.seg.consts().len(),
            self.max_stack
        );
        self.seg
    }

    /// Close a constant expression and evaluate it immediately. The
    /// result is also implicitly cast to `expected` when given.
    pub fn end_const_expr(
        mut self,
        expected: Option<TypeId>,
    ) -> Result<(Value, TypeId), CompileError> {
        if let Some(t) = expected {
            self.implicit_cast(t, "constant expression type mismatch")?;
        }
        let t = self.stk_top_type();
        self.stk_pop();
        self.seg.close(self.max_stack);
        let v = vm::run_const(self.store, &self.seg)
            .map_err(|e| CompileError::other(format!("constant expression: {}", e)))?;
        Ok((v, t))
    }
}
