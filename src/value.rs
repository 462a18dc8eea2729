//! Runtime field values stored in storage pools.

use crate::ir::{FieldType, GroundType};
use crate::pool::ObjectRef;

/// One field cell of an instance.
///
/// Var-length arrays and lists share the [`FieldValue::List`] arm; they
/// differ only in their wire type ID, not in their data layout. Maps
/// over more than two base types nest: the value side of each entry is
/// the next map level down.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    V64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(Option<String>),
    /// Typed reference to another instance; `None` encodes as SkillID 0.
    Ref(Option<ObjectRef>),
    /// Untyped reference; `None` encodes as the (0, 0) pair.
    Annotation(Option<ObjectRef>),
    /// Fixed-length array.
    Array(Vec<FieldValue>),
    List(Vec<FieldValue>),
    Set(Vec<FieldValue>),
    Map(Vec<(FieldValue, FieldValue)>),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I8(x) => Some(*x as i64),
            FieldValue::I16(x) => Some(*x as i64),
            FieldValue::I32(x) => Some(*x as i64),
            FieldValue::I64(x) => Some(*x),
            FieldValue::V64(x) => Some(*x),
            FieldValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F32(x) => Some(*x as f64),
            FieldValue::F64(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_target(&self) -> Option<ObjectRef> {
        match self {
            FieldValue::Ref(r) => *r,
            FieldValue::Annotation(r) => *r,
            _ => None,
        }
    }

    pub fn as_elements(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(v) | FieldValue::List(v) | FieldValue::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(FieldValue, FieldValue)]> {
        match self {
            FieldValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The zero/null value for a field type; used for cells never set
    /// by the caller.
    pub fn default_for(ft: &FieldType) -> FieldValue {
        match ft {
            FieldType::Ground(GroundType::I8) => FieldValue::I8(0),
            FieldType::Ground(GroundType::I16) => FieldValue::I16(0),
            FieldType::Ground(GroundType::I32) => FieldValue::I32(0),
            FieldType::Ground(GroundType::I64) => FieldValue::I64(0),
            FieldType::Ground(GroundType::V64) => FieldValue::V64(0),
            FieldType::Ground(GroundType::F32) => FieldValue::F32(0.0),
            FieldType::Ground(GroundType::F64) => FieldValue::F64(0.0),
            FieldType::Ground(GroundType::Bool) => FieldValue::Bool(false),
            FieldType::Ground(GroundType::String) => FieldValue::String(None),
            FieldType::Ground(GroundType::Annotation) => FieldValue::Annotation(None),
            FieldType::UserRef(_) => FieldValue::Ref(None),
            FieldType::FixedArray(elem, n) => {
                FieldValue::Array(vec![FieldValue::default_for(elem); *n as usize])
            }
            FieldType::VarArray(_) | FieldType::List(_) => FieldValue::List(Vec::new()),
            FieldType::Set(_) => FieldValue::Set(Vec::new()),
            FieldType::Map(_) => FieldValue::Map(Vec::new()),
        }
    }
}
