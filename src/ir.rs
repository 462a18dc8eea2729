//! The checked intermediate representation of a schema.
//!
//! [`TypeContext`] is an arena of [`Declaration`]s in *type order* (every
//! declaration precedes all of its subtypes, siblings stable by first
//! definition). Fields reference other declarations through [`TypeId`]
//! indices, so cyclic type graphs (linked lists and friends) are
//! representable without ownership cycles. The whole structure is
//! read-only once the checker returns it.

use std::collections::HashMap;

/// Index of a declaration in its [`TypeContext`], assigned in type order.
pub type TypeId = usize;

/// Built-in field base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundType {
    I8,
    I16,
    I32,
    I64,
    V64,
    F32,
    F64,
    Bool,
    Annotation,
    String,
}

impl GroundType {
    pub fn from_name(name: &str) -> Option<GroundType> {
        match name {
            "i8" => Some(GroundType::I8),
            "i16" => Some(GroundType::I16),
            "i32" => Some(GroundType::I32),
            "i64" => Some(GroundType::I64),
            "v64" => Some(GroundType::V64),
            "f32" => Some(GroundType::F32),
            "f64" => Some(GroundType::F64),
            "bool" => Some(GroundType::Bool),
            "annotation" => Some(GroundType::Annotation),
            "string" => Some(GroundType::String),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GroundType::I8 => "i8",
            GroundType::I16 => "i16",
            GroundType::I32 => "i32",
            GroundType::I64 => "i64",
            GroundType::V64 => "v64",
            GroundType::F32 => "f32",
            GroundType::F64 => "f64",
            GroundType::Bool => "bool",
            GroundType::Annotation => "annotation",
            GroundType::String => "string",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            GroundType::I8 | GroundType::I16 | GroundType::I32 | GroundType::I64 | GroundType::V64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, GroundType::F32 | GroundType::F64)
    }
}

/// A resolved field type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Ground(GroundType),
    UserRef(TypeId),
    FixedArray(Box<FieldType>, u64),
    VarArray(Box<FieldType>),
    List(Box<FieldType>),
    Set(Box<FieldType>),
    /// At least two base types; `map<k1, k2, v>` nests as
    /// `k1 -> (k2 -> v)` both in memory and on the wire.
    Map(Vec<FieldType>),
}

/// A validated restriction.
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    IntRange {
        low: i64,
        high: i64,
        inclusive_low: bool,
        inclusive_high: bool,
    },
    FloatRange {
        low: f64,
        high: f64,
        inclusive_low: bool,
        inclusive_high: bool,
    },
    NonNull,
    Unique,
    Singleton,
    Monotone,
    Default(DefaultValue),
    Coding(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A validated hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Access,
    Distributed,
    Hide,
    Ignore,
    Monotone,
    OnDemand,
    Pure,
    ReadOnly,
    Unique,
}

impl Hint {
    pub fn from_name(name: &str) -> Option<Hint> {
        match name.to_lowercase().as_str() {
            "access" => Some(Hint::Access),
            "distributed" => Some(Hint::Distributed),
            "hide" => Some(Hint::Hide),
            "ignore" => Some(Hint::Ignore),
            "monotone" => Some(Hint::Monotone),
            "ondemand" => Some(Hint::OnDemand),
            "pure" => Some(Hint::Pure),
            "readonly" => Some(Hint::ReadOnly),
            "unique" => Some(Hint::Unique),
            _ => None,
        }
    }
}

/// A field of a declaration.
#[derive(Debug, Clone)]
pub struct Field {
    /// Lower-case name used on the wire.
    pub skill_name: String,
    pub field_type: FieldType,
    pub is_constant: bool,
    pub constant_value: Option<i64>,
    /// Auto fields live in memory only and are never serialized.
    pub is_auto: bool,
    /// Set by the `!ignore` hint; treated like auto for serialization.
    pub is_ignored: bool,
    pub doc: Option<String>,
    pub restrictions: Vec<Restriction>,
    pub hints: Vec<Hint>,
}

impl Field {
    /// Whether this field owns a region in the field-data blob.
    pub fn has_data(&self) -> bool {
        !self.is_constant && !self.is_auto && !self.is_ignored
    }

    /// Whether this field appears in the type block at all.
    pub fn on_wire(&self) -> bool {
        !self.is_auto && !self.is_ignored
    }
}

/// A user type declaration.
#[derive(Debug, Clone)]
pub struct Declaration {
    /// Lower-case name used on the wire.
    pub skill_name: String,
    /// Name as written in the schema (display form).
    pub capital_name: String,
    pub doc: Option<String>,
    pub super_type: Option<TypeId>,
    /// Root of the super chain; itself for root types.
    pub base_type: TypeId,
    /// All transitive subtypes, in type order.
    pub sub_types: Vec<TypeId>,
    /// Declared fields only; inherited fields live on the supertype.
    pub fields: Vec<Field>,
    pub restrictions: Vec<Restriction>,
    pub hints: Vec<Hint>,
}

/// The immutable, checked schema model.
#[derive(Debug, Clone, Default)]
pub struct TypeContext {
    decls: Vec<Declaration>,
    by_name: HashMap<String, TypeId>,
    /// Lenient-mode hint diagnostics; empty in strict mode.
    pub warnings: Vec<String>,
}

impl TypeContext {
    pub(crate) fn new(decls: Vec<Declaration>, warnings: Vec<String>) -> TypeContext {
        let by_name = decls
            .iter()
            .enumerate()
            .map(|(i, d)| (d.skill_name.clone(), i))
            .collect();
        TypeContext {
            decls,
            by_name,
            warnings,
        }
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Declarations in type order.
    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    pub fn decl(&self, id: TypeId) -> &Declaration {
        &self.decls[id]
    }

    /// Case-insensitive lookup by name.
    pub fn id_of(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.id_of(name).map(|id| &self.decls[id])
    }

    /// All fields of a declaration, inherited first, each group in
    /// declaration order. Field indices on the wire follow this order.
    pub fn all_fields(&self, id: TypeId) -> Vec<&Field> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(t) = cur {
            chain.push(t);
            cur = self.decls[t].super_type;
        }
        chain
            .iter()
            .rev()
            .flat_map(|&t| self.decls[t].fields.iter())
            .collect()
    }

    /// Whether `sub` equals `ancestor` or inherits from it.
    pub fn is_subtype_of(&self, sub: TypeId, ancestor: TypeId) -> bool {
        let mut cur = Some(sub);
        while let Some(t) = cur {
            if t == ancestor {
                return true;
            }
            cur = self.decls[t].super_type;
        }
        false
    }
}
