//! Binary wire primitives: v64, little-endian ground types, and the
//! type-ID table shared by the type block and field data.

use crate::ir::{FieldType, GroundType, TypeId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const TYPE_CONST_I8: u64 = 0;
pub const TYPE_CONST_I16: u64 = 1;
pub const TYPE_CONST_I32: u64 = 2;
pub const TYPE_CONST_I64: u64 = 3;
pub const TYPE_CONST_V64: u64 = 4;
pub const TYPE_ANNOTATION: u64 = 5;
pub const TYPE_BOOL: u64 = 6;
pub const TYPE_I8: u64 = 7;
pub const TYPE_I16: u64 = 8;
pub const TYPE_I32: u64 = 9;
pub const TYPE_I64: u64 = 10;
pub const TYPE_V64: u64 = 11;
pub const TYPE_F32: u64 = 12;
pub const TYPE_F64: u64 = 13;
pub const TYPE_STRING: u64 = 14;
pub const TYPE_FIXED_ARRAY: u64 = 15;
// 16 is reserved.
pub const TYPE_VAR_ARRAY: u64 = 17;
pub const TYPE_LIST: u64 = 18;
pub const TYPE_SET: u64 = 19;
pub const TYPE_MAP: u64 = 20;
/// User types start here; ID = `TYPE_USER_BASE + type order index`.
pub const TYPE_USER_BASE: u64 = 32;

/// Write a v64: 7-bit groups with a continuation bit, except the ninth
/// byte which carries a full 8 bits. Minimal length.
pub fn write_v64<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    let mut v = value;
    for _ in 0..8 {
        if v < 0x80 {
            w.write_u8(v as u8)?;
            return Ok(());
        }
        w.write_u8((v as u8 & 0x7f) | 0x80)?;
        v >>= 7;
    }
    w.write_u8(v as u8)?;
    Ok(())
}

pub fn read_v64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut result = 0u64;
    for i in 0..8 {
        let b = r.read_u8()?;
        result |= ((b & 0x7f) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    let b = r.read_u8()?;
    result |= (b as u64) << 56;
    Ok(result)
}

/// Signed values travel as their two's-complement bit pattern.
pub fn write_v64_signed<W: Write>(w: &mut W, value: i64) -> io::Result<()> {
    write_v64(w, value as u64)
}

pub fn read_v64_signed<R: Read>(r: &mut R) -> io::Result<i64> {
    read_v64(r).map(|v| v as i64)
}

pub fn write_i8<W: Write>(w: &mut W, v: i8) -> io::Result<()> {
    w.write_i8(v)
}
pub fn write_i16<W: Write>(w: &mut W, v: i16) -> io::Result<()> {
    w.write_i16::<LittleEndian>(v)
}
pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_i32::<LittleEndian>(v)
}
pub fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_i64::<LittleEndian>(v)
}
pub fn write_f32<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_f32::<LittleEndian>(v)
}
pub fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_f64::<LittleEndian>(v)
}
pub fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
    w.write_u8(v as u8)
}

pub fn read_i8<R: Read>(r: &mut R) -> io::Result<i8> {
    r.read_i8()
}
pub fn read_i16<R: Read>(r: &mut R) -> io::Result<i16> {
    r.read_i16::<LittleEndian>()
}
pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    r.read_i32::<LittleEndian>()
}
pub fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    r.read_i64::<LittleEndian>()
}
pub fn read_f32<R: Read>(r: &mut R) -> io::Result<f32> {
    r.read_f32::<LittleEndian>()
}
pub fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    r.read_f64::<LittleEndian>()
}
pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    r.read_u8().map(|b| b != 0)
}

fn ground_id(g: GroundType) -> u64 {
    match g {
        GroundType::Annotation => TYPE_ANNOTATION,
        GroundType::Bool => TYPE_BOOL,
        GroundType::I8 => TYPE_I8,
        GroundType::I16 => TYPE_I16,
        GroundType::I32 => TYPE_I32,
        GroundType::I64 => TYPE_I64,
        GroundType::V64 => TYPE_V64,
        GroundType::F32 => TYPE_F32,
        GroundType::F64 => TYPE_F64,
        GroundType::String => TYPE_STRING,
    }
}

fn const_id(g: GroundType) -> u64 {
    match g {
        GroundType::I8 => TYPE_CONST_I8,
        GroundType::I16 => TYPE_CONST_I16,
        GroundType::I32 => TYPE_CONST_I32,
        GroundType::I64 => TYPE_CONST_I64,
        // The checker only admits integral constants.
        _ => TYPE_CONST_V64,
    }
}

/// Base-type ID for a compound element (ground or user reference).
fn base_id(ft: &FieldType) -> io::Result<u64> {
    match ft {
        FieldType::Ground(g) => Ok(ground_id(*g)),
        FieldType::UserRef(t) => Ok(TYPE_USER_BASE + *t as u64),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compound element must be a base type",
        )),
    }
}

/// Write a field's type descriptor into the type block. A constant
/// carries its value right after the (constant) type ID.
pub fn write_field_type<W: Write>(
    w: &mut W,
    ft: &FieldType,
    constant_value: Option<i64>,
) -> io::Result<()> {
    if let Some(value) = constant_value {
        let g = match ft {
            FieldType::Ground(g) => *g,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "constant fields have ground types",
                ))
            }
        };
        write_v64(w, const_id(g))?;
        match g {
            GroundType::I8 => write_i8(w, value as i8)?,
            GroundType::I16 => write_i16(w, value as i16)?,
            GroundType::I32 => write_i32(w, value as i32)?,
            GroundType::I64 => write_i64(w, value)?,
            _ => write_v64_signed(w, value)?,
        }
        return Ok(());
    }
    match ft {
        FieldType::Ground(g) => write_v64(w, ground_id(*g)),
        FieldType::UserRef(t) => write_v64(w, TYPE_USER_BASE + *t as u64),
        FieldType::FixedArray(elem, n) => {
            write_v64(w, TYPE_FIXED_ARRAY)?;
            write_v64(w, *n)?;
            write_v64(w, base_id(elem)?)
        }
        FieldType::VarArray(elem) => {
            write_v64(w, TYPE_VAR_ARRAY)?;
            write_v64(w, base_id(elem)?)
        }
        FieldType::List(elem) => {
            write_v64(w, TYPE_LIST)?;
            write_v64(w, base_id(elem)?)
        }
        FieldType::Set(elem) => {
            write_v64(w, TYPE_SET)?;
            write_v64(w, base_id(elem)?)
        }
        FieldType::Map(elems) => {
            write_v64(w, TYPE_MAP)?;
            write_v64(w, elems.len() as u64)?;
            for e in elems {
                write_v64(w, base_id(e)?)?;
            }
            Ok(())
        }
    }
}

fn base_from_id(id: u64, type_count: usize) -> io::Result<FieldType> {
    if id >= TYPE_USER_BASE {
        let idx = (id - TYPE_USER_BASE) as usize;
        if idx >= type_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("user type ID {} out of range", id),
            ));
        }
        return Ok(FieldType::UserRef(idx as TypeId));
    }
    let g = match id {
        TYPE_ANNOTATION => GroundType::Annotation,
        TYPE_BOOL => GroundType::Bool,
        TYPE_I8 => GroundType::I8,
        TYPE_I16 => GroundType::I16,
        TYPE_I32 => GroundType::I32,
        TYPE_I64 => GroundType::I64,
        TYPE_V64 => GroundType::V64,
        TYPE_F32 => GroundType::F32,
        TYPE_F64 => GroundType::F64,
        TYPE_STRING => GroundType::String,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("type ID {} is not a base type", id),
            ))
        }
    };
    Ok(FieldType::Ground(g))
}

/// Read a field's type descriptor. `type_count` bounds user-type IDs
/// (pools present in the file, in type order). Returns the type and,
/// for constants, the declared value.
pub fn read_field_type<R: Read>(
    r: &mut R,
    type_count: usize,
) -> io::Result<(FieldType, Option<i64>)> {
    let id = read_v64(r)?;
    let ft = match id {
        TYPE_CONST_I8 => {
            return Ok((
                FieldType::Ground(GroundType::I8),
                Some(read_i8(r)? as i64),
            ))
        }
        TYPE_CONST_I16 => {
            return Ok((
                FieldType::Ground(GroundType::I16),
                Some(read_i16(r)? as i64),
            ))
        }
        TYPE_CONST_I32 => {
            return Ok((
                FieldType::Ground(GroundType::I32),
                Some(read_i32(r)? as i64),
            ))
        }
        TYPE_CONST_I64 => return Ok((FieldType::Ground(GroundType::I64), Some(read_i64(r)?))),
        TYPE_CONST_V64 => {
            return Ok((FieldType::Ground(GroundType::V64), Some(read_v64_signed(r)?)))
        }
        TYPE_FIXED_ARRAY => {
            let n = read_v64(r)?;
            let elem = base_from_id(read_v64(r)?, type_count)?;
            FieldType::FixedArray(Box::new(elem), n)
        }
        TYPE_VAR_ARRAY => FieldType::VarArray(Box::new(base_from_id(read_v64(r)?, type_count)?)),
        TYPE_LIST => FieldType::List(Box::new(base_from_id(read_v64(r)?, type_count)?)),
        TYPE_SET => FieldType::Set(Box::new(base_from_id(read_v64(r)?, type_count)?)),
        TYPE_MAP => {
            let n = read_v64(r)? as usize;
            if n < 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "map type needs at least two base types",
                ));
            }
            let mut elems = Vec::with_capacity(n);
            for _ in 0..n {
                elems.push(base_from_id(read_v64(r)?, type_count)?);
            }
            FieldType::Map(elems)
        }
        other => base_from_id(other, type_count)?,
    };
    Ok((ft, None))
}
