use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::lang::object::Obj;
use crate::types::TypeId;

// =============================================================================
// VALUE - Tagged runtime/compile-time value with copy-on-write containers
// =============================================================================

/// 256-bit membership bitmap backing ordinal sets (small-domain sets whose
/// index type fits in a byte).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Bitmap256 {
    bits: [u8; 32],
}

impl Bitmap256 {
    pub fn new() -> Self {
        Bitmap256 { bits: [0; 32] }
    }

    pub fn add(&mut self, i: u8) {
        self.bits[(i >> 3) as usize] |= 1 << (i & 7);
    }

    pub fn remove(&mut self, i: u8) {
        self.bits[(i >> 3) as usize] &= !(1 << (i & 7));
    }

    pub fn has(&self, i: u8) -> bool {
        self.bits[(i >> 3) as usize] & (1 << (i & 7)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).filter(|i| self.has(*i as u8)).map(|i| i as u8)
    }
}

/// A runtime lvalue: the storage location a `Lea*` instruction resolved.
///
/// The original design pushed raw pointers into variant slots; here an
/// address is a first-class descriptor resolved by the storer/inserter/
/// deleter opcodes. Places never end up inside containers.
#[derive(Debug, Clone)]
pub enum Place {
    Local(i8),
    SelfVar(u8),
    OuterVar(u8),
    Static { module: u8, var: u8 },
    Member(Arc<RefCell<Obj>>, u8),
    Ref(Arc<RefCell<Value>>),
}

/// Every value the compiler and the VM manipulate.
///
/// Scalars are stored inline; strings, vectors, sets, ordinal sets,
/// dictionaries and ranges are shared buffers behind an atomic reference
/// count. Mutation goes through [`Arc::make_mut`]: a shared buffer is
/// deep-copied on the first mutating access, an exclusively-owned one is
/// written in place (copy-on-write).
///
/// Strings are byte strings: the char domain is 0..=255 and each element
/// occupies exactly one byte, so element ops index bytes directly.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Char(u8),
    Int(i64),
    Real(f64),
    Str(Arc<Vec<u8>>),
    Range(Arc<(i64, i64)>),
    List(Arc<Vec<Value>>),
    Set(Arc<BTreeSet<Value>>),
    OrdSet(Arc<Bitmap256>),
    Dict(Arc<BTreeMap<Value, Value>>),
    Ref(Arc<RefCell<Value>>),
    Obj(Arc<RefCell<Obj>>),
    Type(TypeId),
    Place(Place),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn str<S: Into<Vec<u8>>>(s: S) -> Value {
        Value::Str(Arc::new(s.into()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(items))
    }

    pub fn range(left: i64, right: i64) -> Value {
        Value::Range(Arc::new((left, right)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Ordinal payload of a bool/char/int value.
    pub fn as_ord(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Char(c) => Some(*c as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_ordinal(&self) -> bool {
        self.as_ord().is_some()
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Char(_) => "char",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Str(_) => "str",
            Value::Range(_) => "range",
            Value::List(_) => "vector",
            Value::Set(_) => "set",
            Value::OrdSet(_) => "ordset",
            Value::Dict(_) => "dict",
            Value::Ref(_) => "ref",
            Value::Obj(_) => "object",
            Value::Type(_) => "typeref",
            Value::Place(_) => "place",
        }
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// True if this value owns its buffer exclusively (always true for
    /// inline scalars). A mutating operation on a unique value must not
    /// copy.
    pub fn unique(&self) -> bool {
        self.refcount() == 1
    }

    /// Number of live handles to the underlying buffer; 1 for scalars.
    pub fn refcount(&self) -> usize {
        match self {
            Value::Str(a) => Arc::strong_count(a),
            Value::Range(a) => Arc::strong_count(a),
            Value::List(a) => Arc::strong_count(a),
            Value::Set(a) => Arc::strong_count(a),
            Value::OrdSet(a) => Arc::strong_count(a),
            Value::Dict(a) => Arc::strong_count(a),
            Value::Ref(a) => Arc::strong_count(a),
            Value::Obj(a) => Arc::strong_count(a),
            _ => 1,
        }
    }

    // =========================================================================
    // Copy-on-write mutators
    //
    // Each of these is the single mutation point for its container kind:
    // `Arc::make_mut` tests uniqueness and deep-copies a shared buffer
    // before the write. Calling them on the wrong value kind is a bug in
    // the generator or the VM, not in the compiled program.
    // =========================================================================

    fn expect_str(&mut self) -> &mut Vec<u8> {
        match self {
            Value::Str(a) => Arc::make_mut(a),
            other => panic!("fatal: string operation on {}", other.kind_name()),
        }
    }

    fn expect_list(&mut self) -> &mut Vec<Value> {
        match self {
            Value::List(a) => Arc::make_mut(a),
            other => panic!("fatal: vector operation on {}", other.kind_name()),
        }
    }

    /// str |= char
    pub fn char_cat(&mut self, c: u8) {
        self.expect_str().push(c);
    }

    /// str |= str
    pub fn str_cat(&mut self, other: &[u8]) {
        self.expect_str().extend_from_slice(other);
    }

    /// vec |= elem
    pub fn elem_cat(&mut self, elem: Value) {
        self.expect_list().push(elem);
    }

    /// vec |= vec
    pub fn vec_cat(&mut self, other: &[Value]) {
        self.expect_list().extend_from_slice(other);
    }

    pub fn put_str_elem(&mut self, i: usize, c: u8) -> bool {
        let s = self.expect_str();
        if i >= s.len() {
            return false;
        }
        s[i] = c;
        true
    }

    pub fn put_list_elem(&mut self, i: usize, v: Value) -> bool {
        let items = self.expect_list();
        match items.get_mut(i) {
            Some(slot) => {
                *slot = v;
                true
            }
            None => false,
        }
    }

    pub fn str_insert(&mut self, i: usize, c: u8) -> bool {
        let s = self.expect_str();
        if i > s.len() {
            return false;
        }
        s.insert(i, c);
        true
    }

    pub fn list_insert(&mut self, i: usize, v: Value) -> bool {
        let items = self.expect_list();
        if i > items.len() {
            return false;
        }
        items.insert(i, v);
        true
    }

    pub fn del_str_elem(&mut self, i: usize) -> bool {
        let s = self.expect_str();
        if i >= s.len() {
            return false;
        }
        s.remove(i);
        true
    }

    pub fn del_list_elem(&mut self, i: usize) -> bool {
        let items = self.expect_list();
        if i >= items.len() {
            return false;
        }
        items.remove(i);
        true
    }

    pub fn dict_put(&mut self, key: Value, v: Value) {
        match self {
            Value::Dict(a) => {
                Arc::make_mut(a).insert(key, v);
            }
            other => panic!("fatal: dict operation on {}", other.kind_name()),
        }
    }

    pub fn dict_remove(&mut self, key: &Value) {
        match self {
            Value::Dict(a) => {
                Arc::make_mut(a).remove(key);
            }
            other => panic!("fatal: dict operation on {}", other.kind_name()),
        }
    }

    pub fn set_add(&mut self, v: Value) {
        match self {
            Value::Set(a) => {
                Arc::make_mut(a).insert(v);
            }
            Value::OrdSet(a) => match v.as_ord() {
                Some(i) if (0..256).contains(&i) => Arc::make_mut(a).add(i as u8),
                _ => panic!("fatal: ordinal set element out of domain"),
            },
            other => panic!("fatal: set operation on {}", other.kind_name()),
        }
    }

    pub fn set_remove(&mut self, v: &Value) {
        match self {
            Value::Set(a) => {
                Arc::make_mut(a).remove(v);
            }
            Value::OrdSet(a) => {
                if let Some(i) = v.as_ord() {
                    if (0..256).contains(&i) {
                        Arc::make_mut(a).remove(i as u8);
                    }
                }
            }
            other => panic!("fatal: set operation on {}", other.kind_name()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Char(_) => 2,
            Value::Int(_) => 3,
            Value::Real(_) => 4,
            Value::Str(_) => 5,
            Value::Range(_) => 6,
            Value::List(_) => 7,
            Value::Set(_) => 8,
            Value::OrdSet(_) => 9,
            Value::Dict(_) => 10,
            Value::Ref(_) => 11,
            Value::Obj(_) => 12,
            Value::Type(_) => 13,
            Value::Place(_) => 14,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order: tag rank first, then payload. Heterogeneous container
    /// keys sort by kind, same-kind keys by value; reference-like values
    /// order by buffer address.
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Char(a), Char(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Range(a), Range(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (OrdSet(a), OrdSet(b)) => a.cmp(b),
            (Dict(a), Dict(b)) => a.cmp(b),
            (Ref(a), Ref(b)) => (Arc::as_ptr(a) as usize).cmp(&(Arc::as_ptr(b) as usize)),
            (Obj(a), Obj(b)) => (Arc::as_ptr(a) as usize).cmp(&(Arc::as_ptr(b) as usize)),
            (Type(a), Type(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Char(c) => write!(f, "'{}'", *c as char),
            Value::Int(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Str(s) => {
                write!(f, "'")?;
                for &b in s.iter() {
                    write!(f, "{}", b as char)?;
                }
                write!(f, "'")
            }
            Value::Range(r) => write!(f, "[{}..{}]", r.0, r.1),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::OrdSet(bits) => {
                write!(f, "[")?;
                for (i, v) in bits.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Dict(pairs) => {
                write!(f, "[")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "]")
            }
            Value::Ref(v) => write!(f, "ref {}", v.borrow()),
            Value::Obj(_) => write!(f, "[object]"),
            Value::Type(t) => write!(f, "<type #{}>", t.index()),
            Value::Place(_) => write!(f, "<place>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_refcount_is_one() {
        assert!(Value::Int(7).unique());
        assert_eq!(Value::Null.refcount(), 1);
    }

    #[test]
    fn test_assignment_shares_buffer() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(a.unique());
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert_eq!(b.refcount(), 2);
        assert!(!a.unique());
        drop(b);
        assert!(a.unique());
    }

    #[test]
    fn test_cow_mutation_detaches() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let mut b = a.clone();
        assert!(b.put_list_elem(1, Value::str("x")));
        // b detached, a untouched
        assert!(a.unique());
        assert!(b.unique());
        assert_eq!(
            a,
            Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            b,
            Value::list(vec![Value::Int(1), Value::str("x"), Value::Int(3)])
        );
    }

    #[test]
    fn test_unique_mutation_does_not_copy() {
        let mut a = Value::str("ab");
        let before = match &a {
            Value::Str(s) => Arc::as_ptr(s),
            _ => unreachable!(),
        };
        a.char_cat(b'c');
        let after = match &a {
            Value::Str(s) => Arc::as_ptr(s),
            _ => unreachable!(),
        };
        assert_eq!(before, after);
        assert_eq!(a, Value::str("abc"));
    }

    #[test]
    fn test_str_elem_ops() {
        let mut s = Value::str("abc");
        assert!(s.put_str_elem(1, b'x'));
        assert_eq!(s, Value::str("axc"));
        assert!(s.str_insert(3, b'!'));
        assert_eq!(s, Value::str("axc!"));
        assert!(s.del_str_elem(0));
        assert_eq!(s, Value::str("xc!"));
        assert!(!s.put_str_elem(10, b'y'));
    }

    #[test]
    fn test_str_full_char_domain() {
        // chars above 127 are ordinary one-byte elements
        let mut s = Value::str("abc");
        assert!(s.put_str_elem(0, 200));
        match &s {
            Value::Str(b) => assert_eq!(b.as_slice(), &[200, b'b', b'c']),
            _ => unreachable!(),
        }
        let mut t = Value::str("");
        t.char_cat(200);
        t.char_cat(0);
        match &t {
            Value::Str(b) => assert_eq!(b.as_slice(), &[200, 0]),
            _ => unreachable!(),
        }
        assert!(t.str_insert(1, 255));
        assert!(t.del_str_elem(0));
        match &t {
            Value::Str(b) => assert_eq!(b.as_slice(), &[255, 0]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_dict_cow() {
        let mut d = Value::Dict(Arc::new(BTreeMap::new()));
        d.dict_put(Value::str("k"), Value::Int(1));
        let shared = d.clone();
        d.dict_put(Value::str("k2"), Value::Int(2));
        match (&d, &shared) {
            (Value::Dict(a), Value::Dict(b)) => {
                assert_eq!(a.len(), 2);
                assert_eq!(b.len(), 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_bitmap() {
        let mut b = Bitmap256::new();
        assert!(b.is_empty());
        b.add(0);
        b.add(131);
        b.add(255);
        assert!(b.has(131));
        assert!(!b.has(130));
        b.remove(131);
        assert!(!b.has(131));
        assert_eq!(b.iter().collect::<Vec<_>>(), vec![0, 255]);
    }

    #[test]
    fn test_value_ordering_by_rank_then_payload() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Bool(true) < Value::Char(0));
        assert!(Value::Int(10) < Value::str("abc"));
        assert!(Value::str("abc") < Value::str("abd"));
        assert_eq!(Value::Int(5), Value::Int(5));
        assert_ne!(Value::Int(5), Value::Char(5));
    }

    #[test]
    fn test_ordset_value_ops() {
        let mut s = Value::OrdSet(Arc::new(Bitmap256::new()));
        s.set_add(Value::Int(5));
        s.set_add(Value::Char(100));
        let shared = s.clone();
        s.set_remove(&Value::Int(5));
        match (&s, &shared) {
            (Value::OrdSet(a), Value::OrdSet(b)) => {
                assert!(!a.has(5));
                assert!(b.has(5));
                assert!(a.has(100));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::str("abc").to_string(), "'abc'");
        assert_eq!(Value::Char(b'x').to_string(), "'x'");
        assert_eq!(Value::range(1, 2).to_string(), "[1..2]");
        assert_eq!(
            Value::list(vec![Value::Int(0), Value::Bool(true)]).to_string(),
            "[0, true]"
        );
    }
}
