use std::cell::RefCell;
use std::sync::Arc;

use log::debug;

use crate::bytecode::codegen::CodeGen;
use crate::bytecode::compile_error::CompileError;
use crate::lang::object::Obj;
use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::Vm;
use crate::types::{TypeId, TypeStore};

// =============================================================================
// CONTEXT - Owns the type store and drives compiled modules
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub enable_assert: bool,
    /// Whether the compiling side should emit line markers.
    pub line_numbers: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            enable_assert: true,
            line_numbers: true,
        }
    }
}

/// What a finished program run produced.
#[derive(Debug, PartialEq)]
pub struct RunOutcome {
    /// The `exit` value, or null when every module ran to completion.
    pub exit_value: Value,
    /// Everything `echo` printed.
    pub output: String,
}

/// One program: a type store, the modules registered against it in
/// execution order, and their instances while running. Dropping the
/// context tears the instances down in reverse registration order.
pub struct Context {
    pub store: TypeStore,
    modules: Vec<TypeId>,
    datasegs: Vec<Arc<RefCell<Obj>>>,
    pub options: ContextOptions,
}

impl Context {
    pub fn new() -> Self {
        Context {
            store: TypeStore::new(),
            modules: Vec::new(),
            datasegs: Vec::new(),
            options: ContextOptions::default(),
        }
    }

    pub fn with_options(options: ContextOptions) -> Self {
        let mut ctx = Context::new();
        ctx.options = options;
        ctx
    }

    /// Register a module; registration order is execution order, and the
    /// assigned index is what static variable access encodes.
    pub fn register_module(&mut self, name: &str) -> Result<TypeId, CompileError> {
        if self.modules.len() > u8::MAX as usize {
            return Err(CompileError::other("too many modules"));
        }
        let m = self.store.new_module(name);
        self.store.state_mut(m).module_index = Some(self.modules.len() as u8);
        self.modules.push(m);
        Ok(m)
    }

    pub fn modules(&self) -> &[TypeId] {
        &self.modules
    }

    /// Generator for one state body, configured by the context options.
    pub fn codegen(&mut self, state: TypeId) -> CodeGen<'_> {
        let mut cg = CodeGen::new(&mut self.store, state);
        cg.emit_line_markers = self.options.line_numbers;
        cg
    }

    /// Instantiate every module and run their bodies in registration
    /// order. An `exit` anywhere stops the program with its value; all
    /// other runtime errors propagate.
    pub fn run(&mut self) -> Result<RunOutcome, RuntimeError> {
        self.datasegs.clear();
        for m in &self.modules {
            let vars = self.store.state(*m).self_var_count as usize;
            self.datasegs.push(Arc::new(RefCell::new(Obj::new(*m, vars))));
        }
        let mut vm = Vm::new(&self.store, &self.datasegs);
        vm.enable_assert = self.options.enable_assert;
        let mut exit_value = Value::Null;
        for (i, m) in self.modules.iter().enumerate() {
            debug!("running module '{}'", self.store.name(*m));
            let instance = self.datasegs[i].clone();
            let mut stack = Vec::new();
            match vm.run_state(*m, &instance, &mut stack) {
                Ok(()) => {}
                Err(RuntimeError::Exit(v)) => {
                    exit_value = v;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(RunOutcome {
            exit_value,
            output: std::mem::take(&mut vm.output),
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // reverse of registration order, like construction unwinding
        while self.datasegs.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Op;

    #[test]
    fn test_locals_and_arithmetic() {
        // var a = 3; var b = 4; exit a * b + 2
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_const(int, Value::Int(3)).unwrap();
            cg.init_local_var("a").unwrap();
            cg.load_const(int, Value::Int(4)).unwrap();
            cg.init_local_var("b").unwrap();
            cg.load_ident("a").unwrap();
            cg.load_ident("b").unwrap();
            cg.arithm_binary(Op::Mul).unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.arithm_binary(Op::Add).unwrap();
            cg.program_exit();
            cg.deinit_local_var();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.exit_value, Value::Int(14));
    }

    #[test]
    fn test_scalar_assignment_does_not_alias() {
        // var a = 1; var b = a; a := 2; assert a == 2 and b == 1
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.init_local_var("a").unwrap();
            cg.load_ident("a").unwrap();
            cg.init_local_var("b").unwrap();
            cg.load_ident("a").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.assignment(storer).unwrap();
            cg.load_ident("a").unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("a == 2").unwrap();
            cg.load_ident("b").unwrap();
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("b == 1").unwrap();
            cg.deinit_local_var();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        ctx.run().unwrap();
    }

    #[test]
    fn test_elem_store_does_not_touch_copy() {
        // var v0 = [7, 8, 9]; var v = v0; v[2] := 42; v0 unaffected
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let vec_int = ctx.store.derive_vector(int);
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_const(vec_int, Value::list(vec![Value::Int(7), Value::Int(8), Value::Int(9)]))
                .unwrap();
            cg.init_local_var("v0").unwrap();
            cg.load_ident("v0").unwrap();
            cg.init_local_var("v").unwrap();
            cg.load_ident("v").unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.load_container_elem().unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_const(int, Value::Int(42)).unwrap();
            cg.assignment(storer).unwrap();
            cg.load_ident("v").unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.load_container_elem().unwrap();
            cg.load_const(int, Value::Int(42)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("v[2] == 42").unwrap();
            cg.load_ident("v0").unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.load_container_elem().unwrap();
            cg.load_const(int, Value::Int(9)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("v0[2] == 9").unwrap();
            cg.deinit_local_var();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        ctx.run().unwrap();
    }

    #[test]
    fn test_store_through_reference() {
        // var r = ref 1; r^ := 5; assert r^ == 5
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.mk_ref();
            cg.init_local_var("r").unwrap();
            cg.load_ident("r").unwrap();
            cg.deref().unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_const(int, Value::Int(5)).unwrap();
            cg.assignment(storer).unwrap();
            cg.load_ident("r").unwrap();
            cg.deref().unwrap();
            cg.load_const(int, Value::Int(5)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("r^ == 5").unwrap();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        ctx.run().unwrap();
    }

    #[test]
    fn test_string_cow_isolation() {
        // var s = 'abc'; var t = s; s |= 'd'; assert the copy is untouched
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let str_ = ctx.store.builtins.str_;
        let ch = ctx.store.builtins.char_;
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_const(str_, Value::str("abc")).unwrap();
            cg.init_local_var("s").unwrap();
            cg.load_ident("s").unwrap();
            cg.init_local_var("t").unwrap();
            cg.load_ident("s").unwrap();
            cg.lea_lvalue().unwrap();
            cg.load_const(ch, Value::Char(b'd')).unwrap();
            cg.cat_assign().unwrap();
            // assert s == 'abcd'
            cg.load_ident("s").unwrap();
            cg.load_const(str_, Value::str("abcd")).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("s == 'abcd'").unwrap();
            // assert t == 'abc'
            cg.load_ident("t").unwrap();
            cg.load_const(str_, Value::str("abc")).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("t == 'abc'").unwrap();
            cg.deinit_local_var();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.exit_value, Value::Null);
    }

    #[test]
    fn test_vector_insert_delete() {
        // var v = []; v |= 1; ins v[0] = 2; del v[0]; assert v[0] == 1
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let vec_int = ctx.store.derive_vector(int);
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_null_cont();
            assert!(cg.try_implicit_cast(vec_int));
            cg.init_local_var("v").unwrap();
            cg.load_ident("v").unwrap();
            cg.lea_lvalue().unwrap();
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.cat_assign().unwrap();
            // ins v[0] = 2
            cg.load_ident("v").unwrap();
            cg.load_const(int, Value::Int(0)).unwrap();
            cg.load_container_elem().unwrap();
            let inserter = cg.ins_lvalue().unwrap();
            cg.load_const(int, Value::Int(2)).unwrap();
            cg.assignment(inserter).unwrap();
            // del v[0]
            cg.load_ident("v").unwrap();
            cg.load_const(int, Value::Int(0)).unwrap();
            cg.load_container_elem().unwrap();
            cg.delete_elem().unwrap();
            // assert v[0] == 1
            cg.load_ident("v").unwrap();
            cg.load_const(int, Value::Int(0)).unwrap();
            cg.load_container_elem().unwrap();
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.cmp(Op::Equal).unwrap();
            cg.assertion("v[0] == 1").unwrap();
            cg.deinit_local_var();
            cg.end()
        };
        ctx.store.set_body(m, body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.exit_value, Value::Null);
    }

    #[test]
    fn test_function_updates_module_var() {
        // var count (module); bump() { count := count + 1 }; bump(); bump()
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        ctx.store.add_this_var(m, "count", int).unwrap();
        let bump = ctx.store.new_state("bump", m, Vec::new(), None).unwrap();
        let bump_body = {
            let mut cg = CodeGen::new(&mut ctx.store, bump);
            cg.load_ident("count").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_ident("count").unwrap();
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.arithm_binary(Op::Add).unwrap();
            cg.assignment(storer).unwrap();
            cg.end()
        };
        ctx.store.set_body(bump, bump_body);
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_ident("count").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_const(int, Value::Int(0)).unwrap();
            cg.assignment(storer).unwrap();
            cg.call(bump, false).unwrap();
            cg.call(bump, false).unwrap();
            cg.load_ident("count").unwrap();
            cg.program_exit();
            cg.end()
        };
        ctx.store.set_body(m, body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.exit_value, Value::Int(2));
    }

    #[test]
    fn test_modules_run_in_registration_order() {
        let mut ctx = Context::new();
        let lib = ctx.register_module("lib").unwrap();
        let main = ctx.register_module("main").unwrap();
        let int = ctx.store.builtins.int;
        let str_ = ctx.store.builtins.str_;
        ctx.store.add_this_var(lib, "x", int).unwrap();
        ctx.store.add_uses(main, lib);
        let lib_body = {
            let mut cg = CodeGen::new(&mut ctx.store, lib);
            cg.load_ident("x").unwrap();
            let storer = cg.lvalue().unwrap();
            cg.load_const(int, Value::Int(7)).unwrap();
            cg.assignment(storer).unwrap();
            cg.load_const(str_, Value::str("lib ")).unwrap();
            cg.echo();
            cg.end()
        };
        ctx.store.set_body(lib, lib_body);
        let main_body = {
            let mut cg = CodeGen::new(&mut ctx.store, main);
            // x resolves through the used module, as a static access
            cg.load_ident("x").unwrap();
            cg.echo();
            cg.end()
        };
        ctx.store.set_body(main, main_body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.output, "lib 7");
    }

    #[test]
    fn test_assert_failure_stops_run() {
        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_ident("false").unwrap();
            cg.assertion("false").unwrap();
            cg.end()
        };
        ctx.store.set_body(m, body);
        let err = ctx.run().unwrap_err();
        assert_eq!(err, RuntimeError::AssertionFailed("false".into()));
    }

    #[test]
    fn test_asserts_can_be_disabled() {
        let mut ctx = Context::with_options(ContextOptions {
            enable_assert: false,
            line_numbers: false,
        });
        let m = ctx.register_module("main").unwrap();
        let body = {
            let mut cg = CodeGen::new(&mut ctx.store, m);
            cg.load_ident("false").unwrap();
            cg.assertion("false").unwrap();
            cg.end()
        };
        ctx.store.set_body(m, body);
        assert!(ctx.run().is_ok());
    }

    #[test]
    fn test_line_markers_follow_options() {
        let mut ctx = Context::with_options(ContextOptions {
            enable_assert: true,
            line_numbers: false,
        });
        let m = ctx.register_module("main").unwrap();
        let body = {
            let mut cg = ctx.codegen(m);
            cg.line_num(5);
            cg.end()
        };
        // just the End marker
        assert_eq!(body.len(), 1);

        let mut ctx = Context::new();
        let m = ctx.register_module("main").unwrap();
        let body = {
            let mut cg = ctx.codegen(m);
            cg.line_num(5);
            cg.end()
        };
        assert_eq!(body.op_at(0), Op::LineNum);
        assert_eq!(body.u16_at(1), 5);
    }

    #[test]
    fn test_exit_skips_later_modules() {
        let mut ctx = Context::new();
        let first = ctx.register_module("first").unwrap();
        let second = ctx.register_module("second").unwrap();
        let int = ctx.store.builtins.int;
        let first_body = {
            let mut cg = CodeGen::new(&mut ctx.store, first);
            cg.load_const(int, Value::Int(9)).unwrap();
            cg.program_exit();
            cg.end()
        };
        ctx.store.set_body(first, first_body);
        let second_body = {
            let mut cg = CodeGen::new(&mut ctx.store, second);
            cg.load_const(int, Value::Int(1)).unwrap();
            cg.echo();
            cg.end()
        };
        ctx.store.set_body(second, second_body);
        let outcome = ctx.run().unwrap();
        assert_eq!(outcome.exit_value, Value::Int(9));
        assert_eq!(outcome.output, "");
    }
}
