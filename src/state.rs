//! The serialization state machine: one session over one file.
//!
//! A [`SkillState`] owns a string pool and one storage pool per user
//! type. It is either created empty ([`SkillState::create`]) or
//! populated from a file ([`SkillState::read`]); mutations accumulate
//! in the pools' `new_objects` regions until [`SkillState::write`]
//! rewrites the whole state or [`SkillState::append`] emits one delta
//! block against the base file.
//!
//! Writes are two-phase: field data streams into an in-memory
//! [`OutBuffer`] first so the type block can record end offsets, and
//! the assembled block goes to a `<target>.part` side file that is
//! renamed over the target only on success and removed on every
//! failure path.

use crate::ir::{FieldType, TypeContext};
use crate::pool::{
    all_in_type_order, new_in_type_order, BlockInfo, Instance, ObjectRef, PoolId, StoragePool,
    TypeOrderIter, Walk,
};
use crate::strings::StringPool;
use crate::value::FieldValue;
use crate::wire;
use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("append requires a base file; this state was not read from or written to disk")]
    NoBasePath,
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("{0}")]
    Invariant(String),
}

/// In-memory side buffer for the two-phase write. Field data is
/// streamed here before the type block exists; the assembled block is
/// copied into the output afterwards.
#[derive(Debug, Default)]
pub struct OutBuffer {
    buf: Vec<u8>,
}

impl OutBuffer {
    pub fn new() -> OutBuffer {
        OutBuffer::default()
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for OutBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One pool's contribution to a block being assembled.
struct BlockLayout {
    /// 1-based base-pool index where each pool's range begins.
    lbpsi: Vec<u64>,
    /// Dynamic instance count of each pool in this block.
    count: Vec<u64>,
}

/// A field as it appears in a type block entry.
struct WireField {
    name: String,
    ftype: FieldType,
    constant: Option<i64>,
    /// Declared in the schema, as opposed to carried through from a file.
    known: bool,
}

pub struct SkillState {
    ir: TypeContext,
    strings: StringPool,
    pools: Vec<StoragePool>,
    by_name: HashMap<String, PoolId>,
    /// SkillID -> instance, one map per base pool.
    id_maps: HashMap<PoolId, HashMap<u64, ObjectRef>>,
    from_path: Option<PathBuf>,
}

impl SkillState {
    /// A fresh state with empty pools; `write` serializes a complete
    /// file, `append` fails until one exists.
    pub fn create(ir: TypeContext) -> SkillState {
        let mut pools: Vec<StoragePool> = Vec::with_capacity(ir.len());
        let mut by_name = HashMap::new();
        for (id, decl) in ir.iter().enumerate() {
            let mut p = StoragePool::new(decl.skill_name.clone(), Some(id));
            p.super_pool = decl.super_type;
            p.base_pool = decl.base_type;
            p.known_fields = decl.fields.iter().map(|f| f.skill_name.clone()).collect();
            by_name.insert(p.name.clone(), id);
            pools.push(p);
        }
        for id in 0..pools.len() {
            if let Some(parent) = pools[id].super_pool {
                pools[parent].sub_pools.push(id);
            }
        }
        debug_assert!(crate::pool::validate_links(&pools));
        SkillState {
            ir,
            strings: StringPool::new(),
            pools,
            by_name,
            id_maps: HashMap::new(),
            from_path: None,
        }
    }

    /// Populate a state from an existing file.
    pub fn read(ir: TypeContext, path: &Path) -> Result<SkillState, SkillError> {
        let mut state = SkillState::create(ir);
        let bytes = std::fs::read(path)?;
        let mut cur = Cursor::new(&bytes[..]);
        while (cur.position() as usize) < bytes.len() {
            state.read_block(&mut cur)?;
        }
        state.from_path = Some(path.to_path_buf());
        Ok(state)
    }

    pub fn ir(&self) -> &TypeContext {
        &self.ir
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn pools(&self) -> &[StoragePool] {
        &self.pools
    }

    pub fn from_path(&self) -> Option<&Path> {
        self.from_path.as_deref()
    }

    pub fn pool_id(&self, type_name: &str) -> Option<PoolId> {
        self.by_name.get(&type_name.to_lowercase()).copied()
    }

    pub fn pool(&self, type_name: &str) -> Option<&StoragePool> {
        self.pool_id(type_name).map(|id| &self.pools[id])
    }

    /// Create a new instance of the named type.
    pub fn add(&mut self, type_name: &str) -> Result<ObjectRef, SkillError> {
        let pool = self
            .pool_id(type_name)
            .ok_or_else(|| SkillError::UnknownType(type_name.to_string()))?;
        let p = &mut self.pools[pool];
        p.new_objects.push(Instance::default());
        Ok(ObjectRef {
            pool,
            index: p.static_len() - 1,
        })
    }

    /// Mark an instance for deletion; it is dropped by the next full
    /// write and references to it are serialized as null.
    pub fn delete(&mut self, obj: ObjectRef) -> Result<(), SkillError> {
        let inst = self.pools[obj.pool]
            .instance_mut(obj.index)
            .ok_or_else(|| SkillError::Invariant("stale object handle".to_string()))?;
        inst.deleted = true;
        inst.skill_id = 0;
        Ok(())
    }

    /// Set a field value. The field must be declared on the instance's
    /// type (or inherited), or carried through from the file.
    pub fn set(
        &mut self,
        obj: ObjectRef,
        field: &str,
        value: FieldValue,
    ) -> Result<(), SkillError> {
        let field = field.to_lowercase();
        if let Some(f) = self.lookup_field(obj.pool, &field) {
            if f.is_constant {
                return Err(SkillError::Invariant(format!(
                    "constant field \"{}\" cannot be assigned",
                    field
                )));
            }
            let inst = self.pools[obj.pool]
                .instance_mut(obj.index)
                .ok_or_else(|| SkillError::Invariant("stale object handle".to_string()))?;
            inst.fields.insert(field, value);
            return Ok(());
        }
        // Reflective access to fields the schema does not know.
        if self.pools[obj.pool].is_unknown_field(&field) {
            self.pools[obj.pool]
                .unknown_field_data
                .entry(field)
                .or_default()
                .insert(obj.index, value);
            return Ok(());
        }
        Err(SkillError::UnknownField(field))
    }

    /// Get a field value; constants yield their declared value,
    /// unset data fields yield `None`.
    pub fn get(&self, obj: ObjectRef, field: &str) -> Option<FieldValue> {
        let field = field.to_lowercase();
        if let Some(f) = self.lookup_field(obj.pool, &field) {
            if f.is_constant {
                return f.constant_value.map(FieldValue::I64);
            }
            return self.pools[obj.pool]
                .instance(obj.index)
                .and_then(|i| i.fields.get(&field).cloned());
        }
        self.pools[obj.pool]
            .unknown_field_data
            .get(&field)
            .and_then(|m| m.get(&obj.index).cloned())
    }

    /// All instances of a type and its subtypes, in type order.
    pub fn all_in_type_order(&self, type_name: &str) -> Result<TypeOrderIter<'_>, SkillError> {
        let pool = self
            .pool_id(type_name)
            .ok_or_else(|| SkillError::UnknownType(type_name.to_string()))?;
        Ok(all_in_type_order(&self.pools, pool))
    }

    /// This session's new instances of a type and its subtypes, in
    /// type order.
    pub fn new_in_type_order(&self, type_name: &str) -> Result<TypeOrderIter<'_>, SkillError> {
        let pool = self
            .pool_id(type_name)
            .ok_or_else(|| SkillError::UnknownType(type_name.to_string()))?;
        Ok(new_in_type_order(&self.pools, pool))
    }

    fn lookup_field(&self, pool: PoolId, name: &str) -> Option<&crate::ir::Field> {
        let decl = self.pools[pool].decl?;
        self.ir
            .all_fields(decl)
            .into_iter()
            .find(|f| f.skill_name == name)
    }

    // ---------------- write path ----------------

    /// Rewrite the entire state to `target` as one block.
    pub fn write(&mut self, target: &Path) -> Result<(), SkillError> {
        self.strings.reset();
        for p in &mut self.pools {
            p.in_file = false;
            p.file_fields.clear();
            p.blocks.clear();
        }
        self.id_maps.clear();
        self.prepare_strings(Walk::All)?;
        let layout = self.assign_ids(Walk::All);
        let block = self.emit_block(&layout)?;
        commit_to_file(target, None, &block)?;
        self.finish_block(&layout, target);
        Ok(())
    }

    /// Append one block of new objects to the base file in place.
    pub fn append(&mut self) -> Result<(), SkillError> {
        let base = self.from_path.clone().ok_or(SkillError::NoBasePath)?;
        let target = base.clone();
        self.append_impl(&base, &target)
    }

    /// Append against the base file, writing the result to `target`.
    pub fn append_to(&mut self, target: &Path) -> Result<(), SkillError> {
        let base = self.from_path.clone().ok_or(SkillError::NoBasePath)?;
        self.append_impl(&base, target)
    }

    fn append_impl(&mut self, base: &Path, target: &Path) -> Result<(), SkillError> {
        self.prepare_strings(Walk::NewOnly)?;
        let layout = self.assign_ids(Walk::NewOnly);
        let block = self.emit_block(&layout)?;
        commit_to_file(target, Some(base), &block)?;
        self.finish_block(&layout, target);
        Ok(())
    }

    /// Intern every string the next block will reference: type and
    /// field names, and each string cell reachable from the covered
    /// instances at any nesting depth.
    fn prepare_strings(&mut self, walk: Walk) -> Result<(), SkillError> {
        let strings = &mut self.strings;
        for p in &self.pools {
            strings.intern(&p.name);
        }
        for pool in 0..self.pools.len() {
            for wf in self.wire_field_list(pool)? {
                self.strings.intern(&wf.name);
            }
        }
        // Data strings. Annotation base-type names are pool names and
        // are already interned above.
        for pool in 0..self.pools.len() {
            let wfs = self.wire_field_list(pool)?;
            let objs: Vec<ObjectRef> = TypeOrderIter::new(&self.pools, pool, walk).collect();
            for wf in &wfs {
                if wf.constant.is_some() {
                    continue;
                }
                for &obj in &objs {
                    if self.pools[obj.pool]
                        .instance(obj.index)
                        .map(|i| i.deleted)
                        .unwrap_or(true)
                    {
                        continue;
                    }
                    let v = self.field_value_of(obj, wf);
                    collect_strings(&v, &mut self.strings);
                }
            }
        }
        Ok(())
    }

    /// Assign SkillIDs and compute each pool's range for the next
    /// block. Full writes number the whole tree from 1; appends number
    /// new objects after the highest existing ID.
    fn assign_ids(&mut self, walk: Walk) -> BlockLayout {
        let n = self.pools.len();
        let mut layout = BlockLayout {
            lbpsi: vec![0; n],
            count: vec![0; n],
        };
        let bases: Vec<PoolId> = (0..n)
            .filter(|&i| self.pools[i].super_pool.is_none())
            .collect();
        for base in bases {
            let mut next: u64 = match walk {
                Walk::All => {
                    self.id_maps.insert(base, HashMap::new());
                    1
                }
                Walk::NewOnly => {
                    let max = self
                        .subtree(base)
                        .into_iter()
                        .flat_map(|p| self.pools[p].data.iter())
                        .map(|i| i.skill_id)
                        .max()
                        .unwrap_or(0);
                    self.id_maps.entry(base).or_default();
                    max + 1
                }
            };
            self.assign_rec(base, base, walk, &mut next, &mut layout);
        }
        layout
    }

    fn assign_rec(
        &mut self,
        pool: PoolId,
        base: PoolId,
        walk: Walk,
        next: &mut u64,
        layout: &mut BlockLayout,
    ) {
        layout.lbpsi[pool] = *next;
        let data_len = self.pools[pool].data.len();
        let (start, end) = match walk {
            Walk::All => (0, self.pools[pool].static_len()),
            Walk::NewOnly => (data_len, self.pools[pool].static_len()),
        };
        for index in start..end {
            let id = *next;
            let inst = self.pools[pool]
                .instance_mut(index)
                .expect("index within static_len");
            if inst.deleted {
                inst.skill_id = 0;
                continue;
            }
            inst.skill_id = id;
            *next += 1;
            self.id_maps
                .get_mut(&base)
                .expect("map created per base")
                .insert(id, ObjectRef { pool, index });
        }
        let children = self.pools[pool].sub_pools.clone();
        for c in children {
            self.assign_rec(c, base, walk, next, layout);
        }
        layout.count[pool] = *next - layout.lbpsi[pool];
    }

    /// Assemble one block: string delta, type block, field data.
    fn emit_block(&mut self, layout: &BlockLayout) -> Result<Vec<u8>, SkillError> {
        // Phase one: field data into the side buffer, collecting each
        // field's cumulative end offset.
        let mut side = OutBuffer::new();
        let mut entries: Vec<(PoolId, Vec<(WireField, u64)>)> = Vec::new();
        for pool in 0..self.pools.len() {
            let wfs = self.wire_field_list(pool)?;
            let mut fields = Vec::with_capacity(wfs.len());
            for wf in wfs {
                if wf.constant.is_none() {
                    let base = self.pools[pool].base_pool;
                    for id in layout.lbpsi[pool]..layout.lbpsi[pool] + layout.count[pool] {
                        let obj = *self
                            .id_maps
                            .get(&base)
                            .and_then(|m| m.get(&id))
                            .ok_or_else(|| {
                                SkillError::Invariant(format!("no instance for SkillID {}", id))
                            })?;
                        let v = self.field_value_of(obj, &wf);
                        encode_cell(&mut side, &wf.ftype, &v, &self.pools, &self.strings)?;
                    }
                }
                let end = side.len();
                fields.push((wf, end));
            }
            entries.push((pool, fields));
        }

        // Phase two: the type block, now that sizes are known.
        let mut tb = Vec::new();
        wire::write_v64(&mut tb, self.pools.len() as u64)?;
        for (pool, fields) in &entries {
            let p = &self.pools[*pool];
            let first = !p.in_file;
            wire::write_v64(&mut tb, self.string_id(&p.name)?)?;
            if first {
                match p.super_pool {
                    Some(sp) => {
                        let super_name = self.pools[sp].name.clone();
                        wire::write_v64(&mut tb, self.string_id(&super_name)?)?;
                    }
                    None => wire::write_v64(&mut tb, 0)?,
                }
            }
            wire::write_v64(&mut tb, layout.lbpsi[*pool])?;
            wire::write_v64(&mut tb, layout.count[*pool])?;
            if first {
                wire::write_v64(&mut tb, 0)?;
            }
            wire::write_v64(&mut tb, fields.len() as u64)?;
            for (wf, end) in fields {
                let field_first = !p.file_fields.contains(&wf.name);
                if field_first {
                    wire::write_v64(&mut tb, 0)?;
                    wire::write_field_type(&mut tb, &wf.ftype, wf.constant)?;
                }
                wire::write_v64(&mut tb, self.string_id(&wf.name)?)?;
                wire::write_v64(&mut tb, *end)?;
            }
        }

        let mut out = Vec::new();
        self.strings.write_block(&mut out)?;
        out.extend_from_slice(&tb);
        out.extend_from_slice(&side.into_inner());
        Ok(out)
    }

    /// Bookkeeping after the block reached disk.
    fn finish_block(&mut self, layout: &BlockLayout, target: &Path) {
        for pool in 0..self.pools.len() {
            let wire_names: Vec<String> = self
                .wire_field_list(pool)
                .map(|wfs| wfs.into_iter().map(|w| w.name).collect())
                .unwrap_or_default();
            let p = &mut self.pools[pool];
            for name in wire_names {
                if !p.file_fields.contains(&name) {
                    p.file_fields.push(name);
                }
            }
            p.blocks.push(BlockInfo {
                bpsi: layout.lbpsi[pool],
                count: layout.count[pool],
            });
            p.in_file = true;
            p.commit_new_objects();
        }
        self.from_path = Some(target.to_path_buf());
    }

    /// The ordered field list of one type block entry: fields in the
    /// order earlier blocks introduced them, then declared fields not
    /// yet on file, then carried-through unknown fields.
    fn wire_field_list(&self, pool: PoolId) -> Result<Vec<WireField>, SkillError> {
        let p = &self.pools[pool];
        let mut declared: Vec<WireField> = match p.decl {
            Some(d) => self
                .ir
                .decl(d)
                .fields
                .iter()
                .filter(|f| f.on_wire())
                .map(|f| WireField {
                    name: f.skill_name.clone(),
                    ftype: f.field_type.clone(),
                    constant: if f.is_constant { f.constant_value } else { None },
                    known: true,
                })
                .collect(),
            None => Vec::new(),
        };
        let mut unknown: Vec<WireField> = p
            .unknown_fields
            .iter()
            .map(|(n, t)| WireField {
                name: n.clone(),
                ftype: t.clone(),
                constant: None,
                known: false,
            })
            .collect();
        let mut out = Vec::with_capacity(declared.len() + unknown.len());
        for fname in &p.file_fields {
            if let Some(pos) = declared.iter().position(|w| &w.name == fname) {
                out.push(declared.remove(pos));
            } else if let Some(pos) = unknown.iter().position(|w| &w.name == fname) {
                out.push(unknown.remove(pos));
            } else {
                return Err(SkillError::Invariant(format!(
                    "file field \"{}\" has no backing declaration",
                    fname
                )));
            }
        }
        out.append(&mut declared);
        out.append(&mut unknown);
        Ok(out)
    }

    fn field_value_of(&self, obj: ObjectRef, wf: &WireField) -> FieldValue {
        let p = &self.pools[obj.pool];
        let stored = if wf.known {
            p.instance(obj.index)
                .and_then(|i| i.fields.get(&wf.name).cloned())
        } else {
            p.unknown_field_data
                .get(&wf.name)
                .and_then(|m| m.get(&obj.index).cloned())
        };
        stored.unwrap_or_else(|| FieldValue::default_for(&wf.ftype))
    }

    fn string_id(&self, s: &str) -> Result<u64, SkillError> {
        self.strings
            .id_of(s)
            .ok_or_else(|| SkillError::Invariant(format!("string \"{}\" was not prepared", s)))
    }

    fn subtree(&self, root: PoolId) -> Vec<PoolId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(p) = stack.pop() {
            out.push(p);
            for &c in self.pools[p].sub_pools.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    // ---------------- read path ----------------

    fn read_block(&mut self, cur: &mut Cursor<&[u8]>) -> Result<(), SkillError> {
        self.strings.read_block(cur)?;

        struct EntryField {
            name: String,
            ftype: FieldType,
            constant: Option<i64>,
            known: bool,
            end: u64,
        }
        struct Entry {
            pool: PoolId,
            lbpsi: u64,
            count: u64,
            fields: Vec<EntryField>,
        }

        let type_count = wire::read_v64(cur)? as usize;
        let mut entries: Vec<Entry> = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            let name_id = wire::read_v64(cur)?;
            let name = self
                .strings
                .get(name_id)
                .ok_or_else(|| SkillError::InvalidFile(format!("bad type name index {}", name_id)))?
                .to_string();
            let existing = self.by_name.get(&name).copied();
            let first = existing.map(|p| !self.pools[p].in_file).unwrap_or(true);

            let super_name = if first {
                let super_id = wire::read_v64(cur)?;
                match super_id {
                    0 => None,
                    id => Some(
                        self.strings
                            .get(id)
                            .ok_or_else(|| {
                                SkillError::InvalidFile(format!("bad super name index {}", id))
                            })?
                            .to_string(),
                    ),
                }
            } else {
                None
            };

            let pool = match existing {
                Some(p) => {
                    if first {
                        let expected = self.pools[p].super_pool.map(|s| self.pools[s].name.clone());
                        if expected != super_name {
                            return Err(SkillError::InvalidFile(format!(
                                "type \"{}\" disagrees about its super type",
                                name
                            )));
                        }
                    }
                    p
                }
                // A type the schema does not know: carry it as an
                // opaque pool.
                None => self.create_opaque_pool(&name, super_name.as_deref())?,
            };

            let lbpsi = wire::read_v64(cur)?;
            let count = wire::read_v64(cur)?;
            if first {
                let restrictions = wire::read_v64(cur)?;
                if restrictions != 0 {
                    return Err(SkillError::InvalidFile(
                        "serialized type restrictions are not supported".to_string(),
                    ));
                }
            }
            let field_count = wire::read_v64(cur)? as usize;
            let prior = self.pools[pool].file_fields.len();
            if field_count < prior {
                return Err(SkillError::InvalidFile(format!(
                    "type \"{}\" lost fields between blocks",
                    name
                )));
            }

            let mut fields = Vec::with_capacity(field_count);
            for i in 0..field_count {
                if i < prior {
                    let fname_id = wire::read_v64(cur)?;
                    let fname = self
                        .strings
                        .get(fname_id)
                        .ok_or_else(|| {
                            SkillError::InvalidFile(format!("bad field name index {}", fname_id))
                        })?
                        .to_string();
                    if self.pools[pool].file_fields[i] != fname {
                        return Err(SkillError::InvalidFile(format!(
                            "field order of type \"{}\" changed between blocks",
                            name
                        )));
                    }
                    let end = wire::read_v64(cur)?;
                    let (ftype, constant, known) = self.resolve_known_entry(pool, &fname)?;
                    fields.push(EntryField {
                        name: fname,
                        ftype,
                        constant,
                        known,
                        end,
                    });
                } else {
                    let restrictions = wire::read_v64(cur)?;
                    if restrictions != 0 {
                        return Err(SkillError::InvalidFile(
                            "serialized field restrictions are not supported".to_string(),
                        ));
                    }
                    // Type IDs may point at pools this block introduces
                    // in later entries; the entry count bounds them.
                    let bound = self.pools.len().max(type_count);
                    let (ftype, constant) = wire::read_field_type(cur, bound)?;
                    let fname_id = wire::read_v64(cur)?;
                    let fname = self
                        .strings
                        .get(fname_id)
                        .ok_or_else(|| {
                            SkillError::InvalidFile(format!("bad field name index {}", fname_id))
                        })?
                        .to_string();
                    let end = wire::read_v64(cur)?;
                    let known = self.register_field(pool, &fname, &ftype, constant)?;
                    fields.push(EntryField {
                        name: fname,
                        ftype,
                        constant,
                        known,
                        end,
                    });
                }
            }
            let fresh: Vec<String> = fields[prior..].iter().map(|f| f.name.clone()).collect();
            self.pools[pool].file_fields.extend(fresh);
            self.pools[pool].in_file = true;
            entries.push(Entry {
                pool,
                lbpsi,
                count,
                fields,
            });
        }

        // Instances: each pool's own range precedes its sub pools'
        // ranges, so its own contribution is its dynamic count minus
        // the direct children's.
        let counts: HashMap<PoolId, u64> = entries.iter().map(|e| (e.pool, e.count)).collect();
        for e in &entries {
            let child_sum: u64 = self.pools[e.pool]
                .sub_pools
                .iter()
                .map(|c| counts.get(c).copied().unwrap_or(0))
                .sum();
            let own = e.count.checked_sub(child_sum).ok_or_else(|| {
                SkillError::InvalidFile(format!(
                    "instance counts of type \"{}\" are inconsistent",
                    self.pools[e.pool].name
                ))
            })?;
            let base = self.pools[e.pool].base_pool;
            for k in 0..own {
                let id = e.lbpsi + k;
                let p = &mut self.pools[e.pool];
                p.data.push(Instance {
                    skill_id: id,
                    deleted: false,
                    fields: HashMap::new(),
                });
                let index = p.data.len() - 1;
                self.id_maps
                    .entry(base)
                    .or_default()
                    .insert(id, ObjectRef { pool: e.pool, index });
            }
            self.pools[e.pool].blocks.push(BlockInfo {
                bpsi: e.lbpsi,
                count: e.count,
            });
        }

        // Field data blob, then each field's region in entry order.
        let blob_len = entries
            .iter()
            .flat_map(|e| e.fields.iter().map(|f| f.end))
            .max()
            .unwrap_or(0) as usize;
        let start = cur.position() as usize;
        let all = *cur.get_ref();
        if start + blob_len > all.len() {
            return Err(SkillError::InvalidFile(
                "field data extends past the end of the file".to_string(),
            ));
        }
        let blob = &all[start..start + blob_len];
        cur.set_position((start + blob_len) as u64);

        let mut prev_end = 0u64;
        for e in &entries {
            for f in &e.fields {
                if f.constant.is_some() {
                    if f.end != prev_end {
                        return Err(SkillError::InvalidFile(format!(
                            "constant field \"{}\" owns field data",
                            f.name
                        )));
                    }
                    continue;
                }
                if f.end < prev_end {
                    return Err(SkillError::InvalidFile(
                        "field end offsets must not decrease".to_string(),
                    ));
                }
                let region = &blob[prev_end as usize..f.end as usize];
                let mut rcur = Cursor::new(region);
                let base = self.pools[e.pool].base_pool;
                for id in e.lbpsi..e.lbpsi + e.count {
                    let obj = *self
                        .id_maps
                        .get(&base)
                        .and_then(|m| m.get(&id))
                        .ok_or_else(|| {
                            SkillError::InvalidFile(format!("no instance for SkillID {}", id))
                        })?;
                    let value = decode_cell(
                        &mut rcur,
                        &f.ftype,
                        &self.pools,
                        &self.strings,
                        &self.by_name,
                        &self.id_maps,
                    )?;
                    if f.known {
                        self.pools[obj.pool]
                            .instance_mut(obj.index)
                            .expect("instance created above")
                            .fields
                            .insert(f.name.clone(), value);
                    } else {
                        self.pools[obj.pool]
                            .unknown_field_data
                            .entry(f.name.clone())
                            .or_default()
                            .insert(obj.index, value);
                    }
                }
                if (rcur.position() as usize) != region.len() {
                    return Err(SkillError::InvalidFile(format!(
                        "field \"{}\" leaves unread data",
                        f.name
                    )));
                }
                prev_end = f.end;
            }
        }
        Ok(())
    }

    fn create_opaque_pool(
        &mut self,
        name: &str,
        super_name: Option<&str>,
    ) -> Result<PoolId, SkillError> {
        let super_pool = match super_name {
            None => None,
            Some(s) => Some(self.by_name.get(s).copied().ok_or_else(|| {
                SkillError::InvalidFile(format!(
                    "type \"{}\" extends \"{}\" which was not declared first",
                    name, s
                ))
            })?),
        };
        let mut p = StoragePool::new(name.to_string(), None);
        p.super_pool = super_pool;
        let id = self.pools.len();
        p.base_pool = match super_pool {
            Some(sp) => self.pools[sp].base_pool,
            None => id,
        };
        self.pools.push(p);
        self.by_name.insert(name.to_string(), id);
        if let Some(sp) = super_pool {
            self.pools[sp].sub_pools.push(id);
        }
        Ok(id)
    }

    /// Field entry of an already described field: look its type up
    /// again on the pool.
    fn resolve_known_entry(
        &self,
        pool: PoolId,
        fname: &str,
    ) -> Result<(FieldType, Option<i64>, bool), SkillError> {
        if let Some(f) = self.lookup_declared(pool, fname) {
            return Ok((
                f.field_type.clone(),
                if f.is_constant { f.constant_value } else { None },
                true,
            ));
        }
        if let Some((_, t)) = self.pools[pool]
            .unknown_fields
            .iter()
            .find(|(n, _)| n == fname)
        {
            return Ok((t.clone(), None, false));
        }
        Err(SkillError::Invariant(format!(
            "file field \"{}\" has no backing declaration",
            fname
        )))
    }

    /// First description of a field in the file: match it against the
    /// schema or register it as carried-through.
    fn register_field(
        &mut self,
        pool: PoolId,
        fname: &str,
        ftype: &FieldType,
        constant: Option<i64>,
    ) -> Result<bool, SkillError> {
        if let Some(f) = self.lookup_declared(pool, fname) {
            if f.field_type != *ftype {
                return Err(SkillError::InvalidFile(format!(
                    "field \"{}\" has a different type on file",
                    fname
                )));
            }
            let declared_const = if f.is_constant { f.constant_value } else { None };
            if declared_const != constant {
                return Err(SkillError::InvalidFile(format!(
                    "constant field \"{}\" has a different value on file",
                    fname
                )));
            }
            return Ok(true);
        }
        self.pools[pool]
            .unknown_fields
            .push((fname.to_string(), ftype.clone()));
        Ok(false)
    }

    fn lookup_declared(&self, pool: PoolId, fname: &str) -> Option<&crate::ir::Field> {
        let decl = self.pools[pool].decl?;
        self.ir
            .decl(decl)
            .fields
            .iter()
            .find(|f| f.on_wire() && f.skill_name == fname)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

/// Write a block to `<target>.part` (on top of a copy of `base` for
/// appends) and rename it over the target. The side file is removed on
/// every failure path.
fn commit_to_file(target: &Path, base: Option<&Path>, block: &[u8]) -> Result<(), SkillError> {
    let part = part_path(target);
    let result = (|| -> Result<(), SkillError> {
        match base {
            None => std::fs::write(&part, block)?,
            Some(b) => {
                std::fs::copy(b, &part)?;
                let mut f = std::fs::OpenOptions::new().append(true).open(&part)?;
                f.write_all(block)?;
            }
        }
        std::fs::rename(&part, target)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&part);
    }
    result
}

fn collect_strings(v: &FieldValue, strings: &mut StringPool) {
    match v {
        FieldValue::String(Some(s)) => {
            strings.intern(s);
        }
        FieldValue::Array(items) | FieldValue::List(items) | FieldValue::Set(items) => {
            for item in items {
                collect_strings(item, strings);
            }
        }
        FieldValue::Map(entries) => {
            for (k, val) in entries {
                collect_strings(k, strings);
                collect_strings(val, strings);
            }
        }
        _ => {}
    }
}

fn encode_cell(
    w: &mut impl Write,
    ft: &FieldType,
    v: &FieldValue,
    pools: &[StoragePool],
    strings: &StringPool,
) -> Result<(), SkillError> {
    use crate::ir::GroundType as G;
    match ft {
        FieldType::Ground(G::I8) => wire::write_i8(w, v.as_i64().unwrap_or(0) as i8)?,
        FieldType::Ground(G::I16) => wire::write_i16(w, v.as_i64().unwrap_or(0) as i16)?,
        FieldType::Ground(G::I32) => wire::write_i32(w, v.as_i64().unwrap_or(0) as i32)?,
        FieldType::Ground(G::I64) => wire::write_i64(w, v.as_i64().unwrap_or(0))?,
        FieldType::Ground(G::V64) => wire::write_v64_signed(w, v.as_i64().unwrap_or(0))?,
        FieldType::Ground(G::F32) => wire::write_f32(w, v.as_f64().unwrap_or(0.0) as f32)?,
        FieldType::Ground(G::F64) => wire::write_f64(w, v.as_f64().unwrap_or(0.0))?,
        FieldType::Ground(G::Bool) => wire::write_bool(w, v.as_i64().unwrap_or(0) != 0)?,
        FieldType::Ground(G::String) => match v.as_str() {
            None => wire::write_v64(w, 0)?,
            Some(s) => {
                let id = strings.id_of(s).ok_or_else(|| {
                    SkillError::Invariant(format!("string \"{}\" was not prepared", s))
                })?;
                wire::write_v64(w, id)?;
            }
        },
        FieldType::Ground(G::Annotation) => match live_target(v, pools) {
            None => {
                // The null annotation: two zero bytes.
                wire::write_v64(w, 0)?;
                wire::write_v64(w, 0)?;
            }
            Some((r, id)) => {
                let base_name = &pools[pools[r.pool].base_pool].name;
                let name_id = strings.id_of(base_name).ok_or_else(|| {
                    SkillError::Invariant(format!("string \"{}\" was not prepared", base_name))
                })?;
                wire::write_v64(w, name_id)?;
                wire::write_v64(w, id)?;
            }
        },
        FieldType::UserRef(_) => match live_target(v, pools) {
            None => wire::write_v64(w, 0)?,
            Some((_, id)) => wire::write_v64(w, id)?,
        },
        FieldType::FixedArray(elem, n) => {
            let items = v.as_elements().unwrap_or(&[]);
            for k in 0..*n as usize {
                match items.get(k) {
                    Some(item) => encode_cell(w, elem, item, pools, strings)?,
                    None => encode_cell(w, elem, &FieldValue::default_for(elem), pools, strings)?,
                }
            }
        }
        FieldType::VarArray(elem) | FieldType::List(elem) | FieldType::Set(elem) => {
            let items = v.as_elements().unwrap_or(&[]);
            wire::write_v64(w, items.len() as u64)?;
            for item in items {
                encode_cell(w, elem, item, pools, strings)?;
            }
        }
        FieldType::Map(elems) => encode_map(w, elems, v, pools, strings)?,
    }
    Ok(())
}

fn encode_map(
    w: &mut impl Write,
    elems: &[FieldType],
    v: &FieldValue,
    pools: &[StoragePool],
    strings: &StringPool,
) -> Result<(), SkillError> {
    let entries = v.as_map().unwrap_or(&[]);
    wire::write_v64(w, entries.len() as u64)?;
    for (k, val) in entries {
        encode_cell(w, &elems[0], k, pools, strings)?;
        if elems.len() == 2 {
            encode_cell(w, &elems[1], val, pools, strings)?;
        } else {
            encode_map(w, &elems[1..], val, pools, strings)?;
        }
    }
    Ok(())
}

/// Resolve a reference value to its target and that target's SkillID;
/// deleted and unassigned targets count as null.
fn live_target(v: &FieldValue, pools: &[StoragePool]) -> Option<(ObjectRef, u64)> {
    let r = v.as_ref_target()?;
    let inst = pools[r.pool].instance(r.index)?;
    if inst.deleted || inst.skill_id == 0 {
        return None;
    }
    Some((r, inst.skill_id))
}

fn decode_cell(
    r: &mut Cursor<&[u8]>,
    ft: &FieldType,
    pools: &[StoragePool],
    strings: &StringPool,
    by_name: &HashMap<String, PoolId>,
    id_maps: &HashMap<PoolId, HashMap<u64, ObjectRef>>,
) -> Result<FieldValue, SkillError> {
    use crate::ir::GroundType as G;
    let v = match ft {
        FieldType::Ground(G::I8) => FieldValue::I8(wire::read_i8(r)?),
        FieldType::Ground(G::I16) => FieldValue::I16(wire::read_i16(r)?),
        FieldType::Ground(G::I32) => FieldValue::I32(wire::read_i32(r)?),
        FieldType::Ground(G::I64) => FieldValue::I64(wire::read_i64(r)?),
        FieldType::Ground(G::V64) => FieldValue::V64(wire::read_v64_signed(r)?),
        FieldType::Ground(G::F32) => FieldValue::F32(wire::read_f32(r)?),
        FieldType::Ground(G::F64) => FieldValue::F64(wire::read_f64(r)?),
        FieldType::Ground(G::Bool) => FieldValue::Bool(wire::read_bool(r)?),
        FieldType::Ground(G::String) => {
            let id = wire::read_v64(r)?;
            if id == 0 {
                FieldValue::String(None)
            } else {
                let s = strings.get(id).ok_or_else(|| {
                    SkillError::InvalidFile(format!("bad string index {}", id))
                })?;
                FieldValue::String(Some(s.to_string()))
            }
        }
        FieldType::Ground(G::Annotation) => {
            let name_id = wire::read_v64(r)?;
            let skill_id = wire::read_v64(r)?;
            if name_id == 0 {
                FieldValue::Annotation(None)
            } else {
                let name = strings.get(name_id).ok_or_else(|| {
                    SkillError::InvalidFile(format!("bad annotation type index {}", name_id))
                })?;
                let pool = by_name.get(name).copied().ok_or_else(|| {
                    SkillError::InvalidFile(format!("annotation names unknown type \"{}\"", name))
                })?;
                let base = pools[pool].base_pool;
                let obj = id_maps
                    .get(&base)
                    .and_then(|m| m.get(&skill_id))
                    .copied()
                    .ok_or_else(|| {
                        SkillError::InvalidFile(format!(
                            "annotation references missing SkillID {}",
                            skill_id
                        ))
                    })?;
                FieldValue::Annotation(Some(obj))
            }
        }
        FieldType::UserRef(t) => {
            let skill_id = wire::read_v64(r)?;
            if skill_id == 0 {
                FieldValue::Ref(None)
            } else {
                let base = pools
                    .get(*t)
                    .map(|p| p.base_pool)
                    .ok_or_else(|| {
                        SkillError::InvalidFile(format!("reference into missing type {}", t))
                    })?;
                let obj = id_maps
                    .get(&base)
                    .and_then(|m| m.get(&skill_id))
                    .copied()
                    .ok_or_else(|| {
                        SkillError::InvalidFile(format!("reference to missing SkillID {}", skill_id))
                    })?;
                FieldValue::Ref(Some(obj))
            }
        }
        FieldType::FixedArray(elem, n) => {
            let mut items = Vec::with_capacity(*n as usize);
            for _ in 0..*n {
                items.push(decode_cell(r, elem, pools, strings, by_name, id_maps)?);
            }
            FieldValue::Array(items)
        }
        FieldType::VarArray(elem) | FieldType::List(elem) => {
            let n = wire::read_v64(r)?;
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                items.push(decode_cell(r, elem, pools, strings, by_name, id_maps)?);
            }
            FieldValue::List(items)
        }
        FieldType::Set(elem) => {
            let n = wire::read_v64(r)?;
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                items.push(decode_cell(r, elem, pools, strings, by_name, id_maps)?);
            }
            FieldValue::Set(items)
        }
        FieldType::Map(elems) => decode_map(r, elems, pools, strings, by_name, id_maps)?,
    };
    Ok(v)
}

fn decode_map(
    r: &mut Cursor<&[u8]>,
    elems: &[FieldType],
    pools: &[StoragePool],
    strings: &StringPool,
    by_name: &HashMap<String, PoolId>,
    id_maps: &HashMap<PoolId, HashMap<u64, ObjectRef>>,
) -> Result<FieldValue, SkillError> {
    let n = wire::read_v64(r)?;
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let k = decode_cell(r, &elems[0], pools, strings, by_name, id_maps)?;
        let v = if elems.len() == 2 {
            decode_cell(r, &elems[1], pools, strings, by_name, id_maps)?
        } else {
            decode_map(r, &elems[1..], pools, strings, by_name, id_maps)?
        };
        entries.push((k, v));
    }
    Ok(FieldValue::Map(entries))
}
