//! # skillgen — SKilL schema front-end and binary file format runtime
//!
//! SKilL is a language-neutral schema language for typed, persisted
//! object graphs with a standardized binary representation. This crate
//! implements the generator core: the schema front-end that turns
//! `.skill` sources into a checked IR, and the serialization runtime
//! model (string pool, storage pools, block format) that generated
//! bindings target.
//!
//! ## Schema surface
//!
//! ```text
//! include "base.skill"
//!
//! /* A thing that happened. */
//! Message {
//!   string text;
//!   auto i32 cachedHash;
//! }
//!
//! DatedMessage : Message {
//!   @range(0, 0x7fffffffffffffff)
//!   v64 timestamp;
//! }
//! ```
//!
//! ## Pipeline
//!
//! - [`parse`] turns one source into an AST; [`from_file`] resolves
//!   includes transitively and runs the type checker.
//! - The checker returns a [`TypeContext`]: declarations in type order
//!   (supertypes before subtypes), fields resolved, restrictions and
//!   hints validated. It is immutable and freely shareable.
//! - [`SkillState`] is one serialization session: create it empty or
//!   [`SkillState::read`] a file, mutate instances, then
//!   [`SkillState::write`] a complete file or [`SkillState::append`]
//!   a delta block that leaves the base bytes untouched.
//!
//! ## Wire format
//!
//! A file is a sequence of blocks, each a string block, a type block
//! and concatenated field data. Integers use the `v64` variable-length
//! encoding; everything fixed-width is little-endian. See [`wire`] for
//! the type-ID table and [`state`] for the block layout.

pub mod ast;
pub mod check;
pub mod gen;
pub mod include;
pub mod ir;
pub mod parser;
pub mod pool;
pub mod state;
pub mod strings;
pub mod value;
pub mod wire;

pub use check::HintMode;
pub use gen::{Backend, GeneratorContext};
pub use include::{
    from_file, from_file_with_mode, from_source, from_source_with_mode, SchemaError,
};
pub use ir::{Declaration, Field, FieldType, GroundType, Hint, Restriction, TypeContext, TypeId};
pub use parser::parse;
pub use pool::{BlockInfo, ObjectRef, StoragePool};
pub use state::{OutBuffer, SkillError, SkillState};
pub use strings::StringPool;
pub use value::FieldValue;
