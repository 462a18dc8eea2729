//! Storage pools: per-type instance containers linked by inheritance.
//!
//! Every user type owns one pool. Pools of one inheritance tree share
//! the SkillID space of their base pool; an instance's SkillID is its
//! 1-based position there, 0 marks null or deleted. Instances read from
//! a file live in `data`; instances created this session live in
//! `new_objects` until the next write or append migrates them.

use crate::ir::{FieldType, TypeId};
use crate::value::FieldValue;
use std::collections::{HashMap, HashSet};

pub type PoolId = usize;

/// Handle to one instance: owning pool plus position within that pool.
/// Positions cover `data` first, then `new_objects`, and stay stable
/// for the lifetime of the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub pool: PoolId,
    pub index: usize,
}

/// What one file block contributed to a pool: the local base pool start
/// index and the dynamic instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub bpsi: u64,
    pub count: u64,
}

/// One runtime object. Field cells are sparse; unset cells serialize as
/// the type's default.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    /// Last assigned SkillID; 0 when unassigned or deleted.
    pub skill_id: u64,
    pub deleted: bool,
    pub fields: HashMap<String, FieldValue>,
}

/// Per-type instance container.
#[derive(Debug, Clone)]
pub struct StoragePool {
    /// Lower-case type name (wire name).
    pub name: String,
    /// Backing declaration; `None` for types read from a file that the
    /// schema does not know — those are carried through as opaque pools.
    pub decl: Option<TypeId>,
    pub super_pool: Option<PoolId>,
    pub base_pool: PoolId,
    /// Direct sub pools, in type order.
    pub sub_pools: Vec<PoolId>,
    /// Instances replayed from the file, in SkillID order.
    pub data: Vec<Instance>,
    /// Instances created this session, not yet serialized.
    pub new_objects: Vec<Instance>,
    pub blocks: Vec<BlockInfo>,
    /// Names of the declared on-wire fields (from the schema).
    pub known_fields: Vec<String>,
    /// Fields found in a file with no schema counterpart, with their
    /// decoded types, in file order.
    pub unknown_fields: Vec<(String, FieldType)>,
    /// Values of unknown fields, keyed by field name and instance index.
    pub unknown_field_data: HashMap<String, HashMap<usize, FieldValue>>,
    /// Whether any file block has described this type yet.
    pub in_file: bool,
    /// Field names in the order blocks first described them; a prefix
    /// of every later block's field list.
    pub file_fields: Vec<String>,
}

impl StoragePool {
    pub fn new(name: String, decl: Option<TypeId>) -> StoragePool {
        StoragePool {
            name,
            decl,
            super_pool: None,
            base_pool: 0,
            sub_pools: Vec::new(),
            data: Vec::new(),
            new_objects: Vec::new(),
            blocks: Vec::new(),
            known_fields: Vec::new(),
            unknown_fields: Vec::new(),
            unknown_field_data: HashMap::new(),
            in_file: false,
            file_fields: Vec::new(),
        }
    }

    /// Static size: instances whose dynamic type is exactly this one.
    pub fn static_len(&self) -> usize {
        self.data.len() + self.new_objects.len()
    }

    pub fn instance(&self, index: usize) -> Option<&Instance> {
        if index < self.data.len() {
            self.data.get(index)
        } else {
            self.new_objects.get(index - self.data.len())
        }
    }

    pub fn instance_mut(&mut self, index: usize) -> Option<&mut Instance> {
        if index < self.data.len() {
            self.data.get_mut(index)
        } else {
            let i = index - self.data.len();
            self.new_objects.get_mut(i)
        }
    }

    pub fn is_known_field(&self, name: &str) -> bool {
        self.known_fields.iter().any(|f| f == name)
    }

    pub fn is_unknown_field(&self, name: &str) -> bool {
        self.unknown_fields.iter().any(|(f, _)| f == name)
    }

    /// Migrate this session's objects into `data` after a successful
    /// write or append.
    pub fn commit_new_objects(&mut self) {
        self.data.append(&mut self.new_objects);
    }
}

/// Which region of each pool a type-order walk visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    All,
    NewOnly,
}

/// Explicit depth-first iterator over a pool subtree in type order:
/// the pool's own instances, then each sub pool recursively.
pub struct TypeOrderIter<'a> {
    pools: &'a [StoragePool],
    walk: Walk,
    /// Pools still to visit, top of stack next.
    stack: Vec<PoolId>,
    current: Option<(PoolId, usize, usize)>,
}

impl<'a> TypeOrderIter<'a> {
    pub fn new(pools: &'a [StoragePool], root: PoolId, walk: Walk) -> TypeOrderIter<'a> {
        TypeOrderIter {
            pools,
            walk,
            stack: vec![root],
            current: None,
        }
    }

    fn enter(&mut self, pool: PoolId) {
        for &c in self.pools[pool].sub_pools.iter().rev() {
            self.stack.push(c);
        }
        let p = &self.pools[pool];
        let (start, end) = match self.walk {
            Walk::All => (0, p.static_len()),
            Walk::NewOnly => (p.data.len(), p.static_len()),
        };
        self.current = Some((pool, start, end));
    }
}

impl<'a> Iterator for TypeOrderIter<'a> {
    type Item = ObjectRef;

    fn next(&mut self) -> Option<ObjectRef> {
        loop {
            if let Some((pool, next, end)) = self.current {
                if next < end {
                    self.current = Some((pool, next + 1, end));
                    return Some(ObjectRef { pool, index: next });
                }
                self.current = None;
            }
            let pool = self.stack.pop()?;
            self.enter(pool);
        }
    }
}

/// All instances of a subtree in type order (bulk field writing order).
pub fn all_in_type_order(pools: &[StoragePool], root: PoolId) -> TypeOrderIter<'_> {
    TypeOrderIter::new(pools, root, Walk::All)
}

/// This session's new instances of a subtree in type order (append order).
pub fn new_in_type_order(pools: &[StoragePool], root: PoolId) -> TypeOrderIter<'_> {
    TypeOrderIter::new(pools, root, Walk::NewOnly)
}

/// Sanity guard for pool links: every sub pool names its parent and all
/// pools of a tree agree on the base. Used by state construction.
pub fn validate_links(pools: &[StoragePool]) -> bool {
    let mut seen = HashSet::new();
    for (id, p) in pools.iter().enumerate() {
        if !seen.insert(p.name.clone()) {
            return false;
        }
        for &c in &p.sub_pools {
            if pools[c].super_pool != Some(id) || pools[c].base_pool != p.base_pool {
                return false;
            }
        }
    }
    true
}
