pub mod scope;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::seg::CodeSeg;
use crate::lang::value::{Bitmap256, Value};
use crate::runtime::runtime_error::RuntimeError;
use scope::{Symbol, SymbolKind, SymbolTable};

// =============================================================================
// TYPE STORE - Arena of type descriptors addressed by stable handles
// =============================================================================

/// Handle into the [`TypeStore`] arena. Type identity comparisons are
/// handle comparisons; a handle stays valid for the life of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> u32 {
        self.0
    }

    pub fn from_index(i: u32) -> Self {
        TypeId(i)
    }
}

/// Scalar class of an ordinal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdClass {
    Int,
    Char,
    Bool,
    Enum,
}

/// Integer/char subrange, or an enumeration over a shared value list.
/// Bounds are inclusive. Subrange enumerations share the base's value list
/// by reference; cast compatibility between enumerations is value-list
/// identity.
#[derive(Debug, Clone)]
pub struct OrdDef {
    pub class: OrdClass,
    pub left: i64,
    pub right: i64,
    pub values: Option<Arc<Vec<String>>>,
}

impl OrdDef {
    pub fn contains(&self, v: i64) -> bool {
        v >= self.left && v <= self.right
    }

    /// Whether the whole domain fits in `n` distinct slots.
    pub fn domain_fits(&self, n: u32) -> bool {
        self.right >= self.left
            && (self.right as i128 - self.left as i128) < n as i128
    }
}

/// Container classification, computed from the index/element pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContClass {
    Vector,
    /// Dictionary whose key domain fits a flat slot array.
    Array,
    Set,
    /// Set whose element domain fits the 256-bit bitmap.
    OrdSet,
    Dict,
}

/// A state is both a type and a scope: a callable/instantiable template
/// owning its instance-variable symbol table and (once compiled) its
/// bytecode body. The body's back edge to the state is the non-owning
/// `TypeId`, never an owning pointer.
#[derive(Debug)]
pub struct StateDef {
    pub parent: Option<TypeId>,
    pub level: u8,
    /// Index into the context's module/data-segment tables; set when a
    /// level-0 state is registered with a context.
    pub module_index: Option<u8>,
    pub self_var_count: u32,
    pub symbols: SymbolTable,
    /// Imported scopes, searched before the outer scope, newest first.
    pub uses: Vec<TypeId>,
    pub args: Vec<(String, TypeId)>,
    /// Return type; the unit type means the state is void when called.
    pub ret: TypeId,
    pub body: Option<CodeSeg>,
}

#[derive(Debug)]
pub enum TypeKind {
    None_,
    Variant,
    /// The type of types. Self-referential: its own runtime type is
    /// itself.
    TypeRef,
    /// The type of an untyped empty container literal, retyped on use.
    NullCont,
    Ord(OrdDef),
    Range { base: TypeId },
    Cont { index: TypeId, elem: TypeId, class: ContClass },
    Fifo { elem: TypeId },
    State(StateDef),
}

#[derive(Debug)]
pub struct TypeDef {
    pub name: String,
    /// Runtime type of this descriptor as a value; the type-of-types for
    /// everything, including (self-referentially) itself.
    pub rt: TypeId,
    /// The state/module whose compilation registered this type.
    pub owner: Option<TypeId>,
    pub kind: TypeKind,
    derived_vec: Option<TypeId>,
    derived_set: Option<TypeId>,
    derived_fifo: Option<TypeId>,
    derived_range: Option<TypeId>,
}

/// Handles of the built-in types, populated by the store's two-phase
/// constructor.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub typeref: TypeId,
    pub none: TypeId,
    pub int: TypeId,
    pub bool_: TypeId,
    pub char_: TypeId,
    pub variant: TypeId,
    pub null_cont: TypeId,
    pub str_: TypeId,
    pub char_fifo: TypeId,
}

/// The process-wide type registry: an explicitly constructed object passed
/// by reference to every compilation unit (no mutable globals). Also owns
/// the system module that publishes the built-in names.
#[derive(Debug)]
pub struct TypeStore {
    defs: Vec<TypeDef>,
    pub builtins: Builtins,
    /// The implicit system module every user module imports.
    pub system: TypeId,
}

impl TypeStore {
    /// Two-phase construction: allocate the self-referential type-of-types
    /// node first, then populate the built-ins and the system module.
    pub fn new() -> Self {
        let mut defs = Vec::new();
        let typeref = TypeId(0);
        defs.push(TypeDef {
            name: "typeref".into(),
            rt: typeref,
            owner: None,
            kind: TypeKind::TypeRef,
            derived_vec: None,
            derived_set: None,
            derived_fifo: None,
            derived_range: None,
        });

        let mut store = TypeStore {
            defs,
            builtins: Builtins {
                typeref,
                none: typeref,
                int: typeref,
                bool_: typeref,
                char_: typeref,
                variant: typeref,
                null_cont: typeref,
                str_: typeref,
                char_fifo: typeref,
            },
            system: typeref,
        };

        let none = store.push("none", None, TypeKind::None_);
        let int = store.push(
            "int",
            None,
            TypeKind::Ord(OrdDef {
                class: OrdClass::Int,
                left: i64::MIN,
                right: i64::MAX,
                values: None,
            }),
        );
        let bool_values = Arc::new(vec!["false".to_string(), "true".to_string()]);
        let bool_ = store.push(
            "bool",
            None,
            TypeKind::Ord(OrdDef {
                class: OrdClass::Bool,
                left: 0,
                right: 1,
                values: Some(bool_values),
            }),
        );
        let char_ = store.push(
            "char",
            None,
            TypeKind::Ord(OrdDef {
                class: OrdClass::Char,
                left: 0,
                right: 255,
                values: None,
            }),
        );
        let variant = store.push("any", None, TypeKind::Variant);
        let null_cont = store.push("", None, TypeKind::NullCont);

        let system = store.push(
            "system",
            None,
            TypeKind::State(StateDef {
                parent: None,
                level: 0,
                module_index: None,
                self_var_count: 0,
                symbols: SymbolTable::new(),
                uses: Vec::new(),
                args: Vec::new(),
                ret: none,
                body: None,
            }),
        );

        store.builtins = Builtins {
            typeref,
            none,
            int,
            bool_,
            char_,
            variant,
            null_cont,
            // derived below, once the store object exists
            str_: typeref,
            char_fifo: typeref,
        };
        store.system = system;

        // Second phase: derived built-ins and the system namespace. These
        // cannot run before the store object exists.
        store.builtins.str_ = store.derive_vector(char_);
        store.builtins.char_fifo = store.derive_fifo(char_);

        let b = store.builtins;
        store.add_type_alias(system, "typeref", b.typeref).unwrap();
        store.add_type_alias(system, "none", b.none).unwrap();
        store.add_constant(system, "null", b.none, Value::Null).unwrap();
        store.add_type_alias(system, "int", b.int).unwrap();
        store.add_constant(system, "false", b.bool_, Value::Bool(false)).unwrap();
        store.add_constant(system, "true", b.bool_, Value::Bool(true)).unwrap();
        store.add_type_alias(system, "bool", b.bool_).unwrap();
        store.add_type_alias(system, "char", b.char_).unwrap();
        store.add_type_alias(system, "str", b.str_).unwrap();
        store.add_type_alias(system, "any", b.variant).unwrap();

        store
    }

    fn push(&mut self, name: &str, owner: Option<TypeId>, kind: TypeKind) -> TypeId {
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(TypeDef {
            name: name.to_string(),
            rt: self.builtins.typeref,
            owner,
            kind,
            derived_vec: None,
            derived_set: None,
            derived_fifo: None,
            derived_range: None,
        });
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.defs[id.0 as usize]
    }

    fn get_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.defs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.get(id).name
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    pub fn ord(&self, id: TypeId) -> Option<&OrdDef> {
        match &self.get(id).kind {
            TypeKind::Ord(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_ordinal(&self, id: TypeId) -> bool {
        self.ord(id).is_some()
    }

    pub fn is_int(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.class == OrdClass::Int)
    }

    pub fn is_bool(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.class == OrdClass::Bool)
    }

    pub fn is_char(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.class == OrdClass::Char)
    }

    pub fn is_enum(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.class == OrdClass::Enum || o.class == OrdClass::Bool)
    }

    pub fn is_none(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::None_)
    }

    pub fn is_variant(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Variant)
    }

    pub fn is_typeref(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::TypeRef)
    }

    pub fn is_null_cont(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::NullCont)
    }

    pub fn is_range(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Range { .. })
    }

    pub fn cont(&self, id: TypeId) -> Option<(TypeId, TypeId, ContClass)> {
        match self.get(id).kind {
            TypeKind::Cont { index, elem, class } => Some((index, elem, class)),
            _ => None,
        }
    }

    pub fn cont_class(&self, id: TypeId) -> Option<ContClass> {
        self.cont(id).map(|(_, _, c)| c)
    }

    pub fn is_any_cont(&self, id: TypeId) -> bool {
        self.cont(id).is_some()
    }

    pub fn is_any_vec(&self, id: TypeId) -> bool {
        matches!(self.cont_class(id), Some(ContClass::Vector))
    }

    /// A string is a vector of chars.
    pub fn is_str(&self, id: TypeId) -> bool {
        matches!(self.cont(id), Some((_, elem, ContClass::Vector)) if self.is_char(elem))
    }

    pub fn is_any_set(&self, id: TypeId) -> bool {
        matches!(
            self.cont_class(id),
            Some(ContClass::Set) | Some(ContClass::OrdSet)
        )
    }

    pub fn is_byte_set(&self, id: TypeId) -> bool {
        matches!(self.cont_class(id), Some(ContClass::OrdSet))
    }

    pub fn is_any_dict(&self, id: TypeId) -> bool {
        matches!(
            self.cont_class(id),
            Some(ContClass::Dict) | Some(ContClass::Array)
        )
    }

    pub fn is_byte_dict(&self, id: TypeId) -> bool {
        matches!(self.cont_class(id), Some(ContClass::Array))
    }

    pub fn is_fifo(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Fifo { .. })
    }

    /// Char fifos are string streams.
    pub fn is_char_fifo(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Fifo { elem } if self.is_char(elem))
    }

    pub fn is_state(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::State(_))
    }

    pub fn is_module(&self, id: TypeId) -> bool {
        matches!(&self.get(id).kind, TypeKind::State(s) if s.level == 0)
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        self.is_none(id)
    }

    fn can_be_array_index(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.domain_fits(256))
    }

    // ordinal sets store raw ordinals in the bitmap, so the bounds
    // themselves must fit a byte; arrays shift by the lower bound and only
    // need the span to fit
    fn can_be_ordset_index(&self, id: TypeId) -> bool {
        matches!(self.ord(id), Some(o) if o.left >= 0 && o.right <= 255 && o.left <= o.right)
    }

    // =========================================================================
    // Derivations (memoized)
    // =========================================================================

    fn classify_container(&self, index: TypeId, elem: TypeId) -> ContClass {
        if self.is_none(index) {
            ContClass::Vector
        } else if self.is_none(elem) {
            if self.can_be_ordset_index(index) {
                ContClass::OrdSet
            } else {
                ContClass::Set
            }
        } else if self.can_be_array_index(index) {
            ContClass::Array
        } else {
            ContClass::Dict
        }
    }

    /// Register a container type from an index/element pair. Dictionary
    /// derivation is not memoized; the four standard derivations below
    /// are.
    pub fn derive_container(&mut self, index: TypeId, elem: TypeId) -> TypeId {
        let class = self.classify_container(index, elem);
        let owner = self.get(elem).owner;
        self.push("", owner, TypeKind::Cont { index, elem, class })
    }

    /// vector-of-T; first call builds and caches, later calls return the
    /// identical handle.
    pub fn derive_vector(&mut self, base: TypeId) -> TypeId {
        if let Some(v) = self.get(base).derived_vec {
            return v;
        }
        let none = self.builtins.none;
        let v = self.derive_container(none, base);
        self.get_mut(base).derived_vec = Some(v);
        v
    }

    /// set-of-T (ordinal-set when the domain fits the bitmap).
    pub fn derive_set(&mut self, base: TypeId) -> TypeId {
        if let Some(v) = self.get(base).derived_set {
            return v;
        }
        let none = self.builtins.none;
        let v = self.derive_container(base, none);
        self.get_mut(base).derived_set = Some(v);
        v
    }

    /// fifo-of-T.
    pub fn derive_fifo(&mut self, base: TypeId) -> TypeId {
        if let Some(v) = self.get(base).derived_fifo {
            return v;
        }
        let owner = self.get(base).owner;
        let v = self.push("", owner, TypeKind::Fifo { elem: base });
        self.get_mut(base).derived_fifo = Some(v);
        v
    }

    /// range-of-T; the base must be ordinal.
    pub fn derive_range(&mut self, base: TypeId) -> Result<TypeId, CompileError> {
        if !self.is_ordinal(base) {
            return Err(CompileError::type_mismatch("non-ordinal range base"));
        }
        if let Some(v) = self.get(base).derived_range {
            return Ok(v);
        }
        let owner = self.get(base).owner;
        let v = self.push("", owner, TypeKind::Range { base });
        self.get_mut(base).derived_range = Some(v);
        Ok(v)
    }

    /// Narrow an ordinal to a subrange. Unchanged bounds return the base
    /// itself; bounds outside the base are a subrange error; enumerations
    /// share the base's value list by reference.
    pub fn derive_subrange(
        &mut self,
        base: TypeId,
        left: i64,
        right: i64,
    ) -> Result<TypeId, CompileError> {
        let o = match self.ord(base) {
            Some(o) => o.clone(),
            None => return Err(CompileError::type_mismatch("ordinal type expected")),
        };
        if left == o.left && right == o.right {
            return Ok(base);
        }
        if left > right || left < o.left || right > o.right {
            return Err(CompileError::Subrange);
        }
        let owner = self.get(base).owner;
        Ok(self.push(
            "",
            owner,
            TypeKind::Ord(OrdDef {
                class: o.class,
                left,
                right,
                values: o.values,
            }),
        ))
    }

    /// Build an enumeration over a fresh value list, registering each
    /// value as a named constant of the new type in the owner scope.
    pub fn new_enum(
        &mut self,
        owner: TypeId,
        name: &str,
        value_names: &[&str],
    ) -> Result<TypeId, CompileError> {
        let values: Arc<Vec<String>> =
            Arc::new(value_names.iter().map(|s| s.to_string()).collect());
        let right = value_names.len() as i64 - 1;
        let id = self.push(
            name,
            Some(owner),
            TypeKind::Ord(OrdDef {
                class: OrdClass::Enum,
                left: 0,
                right,
                values: Some(values),
            }),
        );
        for (i, v) in value_names.iter().enumerate() {
            self.add_constant(owner, v, id, Value::Int(i as i64))?;
        }
        Ok(id)
    }

    // =========================================================================
    // Identity and cast compatibility
    // =========================================================================

    /// Structural-or-nominal equality. Ordinals compare class and bounds
    /// (enumerations nominally), containers compare classification and
    /// component types, states compare by handle only.
    pub fn identical_to(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (TypeKind::None_, TypeKind::None_) => true,
            (TypeKind::Variant, TypeKind::Variant) => true,
            (TypeKind::TypeRef, TypeKind::TypeRef) => true,
            (TypeKind::NullCont, TypeKind::NullCont) => true,
            (TypeKind::Ord(x), TypeKind::Ord(y)) => match (x.class, y.class) {
                (OrdClass::Int, OrdClass::Int) | (OrdClass::Char, OrdClass::Char) => {
                    x.left == y.left && x.right == y.right
                }
                // enumerations (and bool subranges) are nominal
                _ => false,
            },
            (TypeKind::Range { base: x }, TypeKind::Range { base: y }) => {
                self.identical_to(*x, *y)
            }
            (
                TypeKind::Cont { index: i1, elem: e1, class: c1 },
                TypeKind::Cont { index: i2, elem: e2, class: c2 },
            ) => c1 == c2 && self.identical_to(*e1, *e2) && self.identical_to(*i1, *i2),
            (TypeKind::Fifo { elem: x }, TypeKind::Fifo { elem: y }) => {
                self.identical_to(*x, *y)
            }
            // states compare by handle only; the a == b case above
            _ => false,
        }
    }

    /// Implicit-cast compatibility, weaker than identity: any subrange of
    /// an ordinal class casts to any other range of the same class (range
    /// check pending at runtime); enumerations cast only when they share
    /// the exact same value list.
    pub fn can_cast_impl_to(&self, a: TypeId, b: TypeId) -> bool {
        if self.identical_to(a, b) {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (TypeKind::Ord(x), TypeKind::Ord(y)) => match (x.class, y.class) {
                (OrdClass::Int, OrdClass::Int) | (OrdClass::Char, OrdClass::Char) => true,
                (OrdClass::Bool, OrdClass::Bool) | (OrdClass::Enum, OrdClass::Enum) => {
                    match (&x.values, &y.values) {
                        (Some(v1), Some(v2)) => Arc::ptr_eq(v1, v2),
                        _ => false,
                    }
                }
                _ => false,
            },
            (TypeKind::Range { base: x }, TypeKind::Range { base: y }) => {
                self.can_cast_impl_to(*x, *y)
            }
            _ => false,
        }
    }

    /// Assignability: identity, casting into the universal type, or an
    /// implicit cast.
    pub fn can_assign_to(&self, from: TypeId, to: TypeId) -> bool {
        self.is_variant(to) || self.can_cast_impl_to(from, to)
    }

    // =========================================================================
    // Dynamic membership and coercion
    // =========================================================================

    /// Dynamic membership test for a runtime value.
    pub fn is_my_type(&self, id: TypeId, v: &Value) -> bool {
        match &self.get(id).kind {
            TypeKind::None_ | TypeKind::NullCont => v.is_null(),
            TypeKind::Variant => true,
            TypeKind::TypeRef => matches!(v, Value::Type(_)),
            TypeKind::Ord(o) => match o.class {
                OrdClass::Bool => true,
                _ => matches!(v.as_ord(), Some(i) if o.contains(i)),
            },
            TypeKind::Range { .. } => matches!(v, Value::Range(_)),
            TypeKind::Cont { class, .. } => match class {
                ContClass::Vector => {
                    if self.is_str(id) {
                        matches!(v, Value::Str(_))
                    } else {
                        matches!(v, Value::List(_))
                    }
                }
                ContClass::Array => matches!(v, Value::List(_)),
                ContClass::Set => matches!(v, Value::Set(_)),
                ContClass::OrdSet => matches!(v, Value::OrdSet(_)),
                ContClass::Dict => matches!(v, Value::Dict(_)),
            },
            TypeKind::Fifo { .. } => false,
            TypeKind::State(_) => match v {
                Value::Obj(o) => self.can_cast_impl_to(o.borrow().state, id),
                _ => false,
            },
        }
    }

    /// Mutating coercion of a compile-time-ambiguous value to this type.
    /// Bool coercion normalizes to the boolean tag; ordinal coercion
    /// range-checks and retags; anything else must already be a member.
    pub fn runtime_typecast(&self, id: TypeId, v: &mut Value) -> Result<(), RuntimeError> {
        match &self.get(id).kind {
            TypeKind::Variant => Ok(()),
            TypeKind::Ord(o) => {
                if o.class == OrdClass::Bool {
                    *v = Value::Bool(truthy(v));
                    return Ok(());
                }
                let i = v
                    .as_ord()
                    .ok_or_else(|| RuntimeError::type_mismatch("ordinal", v.kind_name()))?;
                if !o.contains(i) {
                    return Err(RuntimeError::OutOfRange);
                }
                *v = match o.class {
                    OrdClass::Char => Value::Char(i as u8),
                    OrdClass::Int | OrdClass::Enum => Value::Int(i),
                    OrdClass::Bool => unreachable!(),
                };
                Ok(())
            }
            _ => {
                if self.is_my_type(id, v) {
                    Ok(())
                } else {
                    Err(RuntimeError::type_mismatch(
                        self.describe(id),
                        v.kind_name(),
                    ))
                }
            }
        }
    }

    /// The empty/default value of a type, used by the empty-constant
    /// loader. Arrays pre-size their slot vector to the index domain so
    /// element stores need no growth path.
    pub fn empty_value(&self, id: TypeId) -> Value {
        match &self.get(id).kind {
            TypeKind::Ord(o) => match o.class {
                OrdClass::Bool => Value::Bool(false),
                OrdClass::Char => Value::Char(0),
                _ => Value::Int(0),
            },
            TypeKind::Range { .. } => Value::range(0, -1),
            TypeKind::Cont { index, class, .. } => match class {
                ContClass::Vector => {
                    if self.is_str(id) {
                        Value::str("")
                    } else {
                        Value::list(Vec::new())
                    }
                }
                ContClass::Array => {
                    let o = match self.ord(*index) {
                        Some(o) => o,
                        None => panic!("fatal: array index type is not ordinal"),
                    };
                    let size = (o.right - o.left + 1) as usize;
                    Value::list(vec![Value::Null; size])
                }
                ContClass::Set => Value::Set(Arc::new(BTreeSet::new())),
                ContClass::OrdSet => Value::OrdSet(Arc::new(Bitmap256::new())),
                ContClass::Dict => Value::Dict(Arc::new(BTreeMap::new())),
            },
            _ => Value::Null,
        }
    }

    fn describe(&self, id: TypeId) -> String {
        let name = self.name(id);
        if name.is_empty() {
            format!("type #{}", id.index())
        } else {
            name.to_string()
        }
    }

    // =========================================================================
    // States and scopes
    // =========================================================================

    pub fn state(&self, id: TypeId) -> &StateDef {
        match &self.get(id).kind {
            TypeKind::State(s) => s,
            _ => panic!("fatal: type #{} is not a state", id.index()),
        }
    }

    pub fn state_mut(&mut self, id: TypeId) -> &mut StateDef {
        match &mut self.get_mut(id).kind {
            TypeKind::State(s) => s,
            _ => panic!("fatal: type #{} is not a state", id.index()),
        }
    }

    /// New module (level-0 state). The system module is imported
    /// implicitly.
    pub fn new_module(&mut self, name: &str) -> TypeId {
        let none = self.builtins.none;
        let system = self.system;
        let id = self.push(
            name,
            None,
            TypeKind::State(StateDef {
                parent: None,
                level: 0,
                module_index: None,
                self_var_count: 0,
                symbols: SymbolTable::new(),
                uses: vec![system],
                args: Vec::new(),
                ret: none,
                body: None,
            }),
        );
        id
    }

    /// New nested state (function/object template). A non-void return
    /// type registers the implicit result variable.
    pub fn new_state(
        &mut self,
        name: &str,
        parent: TypeId,
        args: Vec<(String, TypeId)>,
        ret: Option<TypeId>,
    ) -> Result<TypeId, CompileError> {
        let none = self.builtins.none;
        let ret = ret.unwrap_or(none);
        let level = self.state(parent).level + 1;
        let id = self.push(
            name,
            Some(parent),
            TypeKind::State(StateDef {
                parent: Some(parent),
                level,
                module_index: None,
                self_var_count: 0,
                symbols: SymbolTable::new(),
                uses: Vec::new(),
                args,
                ret,
                body: None,
            }),
        );
        if !self.is_void(ret) {
            let added = self.state_mut(id).symbols.add_unique(Symbol {
                name: "result".to_string(),
                type_id: ret,
                kind: SymbolKind::ResultVar,
            });
            if added.is_err() {
                panic!("fatal: fresh scope collides on 'result'");
            }
        }
        Ok(id)
    }

    pub fn add_constant(
        &mut self,
        state: TypeId,
        name: &str,
        type_id: TypeId,
        value: Value,
    ) -> Result<(), CompileError> {
        self.state_mut(state).symbols.add_unique(Symbol {
            name: name.to_string(),
            type_id,
            kind: SymbolKind::Const(value),
        })
    }

    pub fn add_type_alias(
        &mut self,
        state: TypeId,
        name: &str,
        aliased: TypeId,
    ) -> Result<(), CompileError> {
        let typeref = self.builtins.typeref;
        self.state_mut(state).symbols.add_unique(Symbol {
            name: name.to_string(),
            type_id: typeref,
            kind: SymbolKind::TypeAlias(aliased),
        })?;
        if self.get(aliased).name.is_empty() {
            self.get_mut(aliased).name = name.to_string();
        }
        Ok(())
    }

    /// Register an instance variable. Slot ids are dense, assigned in
    /// declaration order starting at the scope's base offset; more than
    /// 255 slots is a hard compile error.
    pub fn add_this_var(
        &mut self,
        state: TypeId,
        name: &str,
        type_id: TypeId,
    ) -> Result<u8, CompileError> {
        let s = self.state(state);
        let id = s.self_var_count;
        if id >= 255 {
            return Err(CompileError::TooManyVars);
        }
        let slot = id as u8;
        let s = self.state_mut(state);
        s.symbols.add_unique(Symbol {
            name: name.to_string(),
            type_id,
            kind: SymbolKind::SelfVar { slot },
        })?;
        s.self_var_count += 1;
        Ok(slot)
    }

    pub fn add_uses(&mut self, state: TypeId, imported: TypeId) {
        self.state_mut(state).uses.push(imported);
    }

    pub fn find_shallow(&self, state: TypeId, name: &str) -> Option<&Symbol> {
        self.state(state).symbols.find(name)
    }

    /// Scope-chain lookup: own table, then used scopes newest-first, then
    /// the outer chain. Never mutates; usable from every compilation
    /// phase.
    pub fn deep_find(&self, state: TypeId, name: &str) -> Option<(TypeId, &Symbol)> {
        let s = self.state(state);
        if let Some(sym) = s.symbols.find(name) {
            return Some((state, sym));
        }
        for used in s.uses.iter().rev() {
            if let Some(sym) = self.find_shallow(*used, name) {
                return Some((*used, sym));
            }
        }
        match s.parent {
            Some(outer) => self.deep_find(outer, name),
            None => None,
        }
    }

    pub fn set_body(&mut self, state: TypeId, body: CodeSeg) {
        let slot = &mut self.state_mut(state).body;
        debug_assert!(slot.is_none(), "state body attached twice");
        *slot = Some(body);
    }

    pub fn body(&self, state: TypeId) -> &CodeSeg {
        match &self.state(state).body {
            Some(b) => b,
            None => panic!("fatal: state '{}' has no body", self.name(state)),
        }
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        TypeStore::new()
    }
}

/// Truthiness used by bool coercion: null, zero ordinals and empty
/// containers are false.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Char(c) => *c != 0,
        Value::Int(i) => *i != 0,
        Value::Real(r) => *r != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::List(l) => !l.is_empty(),
        Value::Set(s) => !s.is_empty(),
        Value::OrdSet(b) => !b.is_empty(),
        Value::Dict(d) => !d.is_empty(),
        Value::Range(r) => r.0 <= r.1,
        _ => true,
    }
}
