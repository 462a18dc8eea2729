//! The seam between the schema front-end and generator backends.
//!
//! A CLI (an external collaborator) parses arguments into a
//! [`GeneratorContext`] and hands it, together with the checked IR, to
//! one [`Backend`]. Backends own all host-language template text; this
//! crate only defines the contract.

use crate::include::SchemaError;
use crate::ir::TypeContext;
use std::path::PathBuf;

/// Generator configuration, threaded from the CLI into each backend.
/// There is deliberately no process-wide state.
#[derive(Debug, Clone)]
pub struct GeneratorContext {
    pub out_dir: PathBuf,
    pub package_prefix: String,
    pub backend_name: String,
}

/// A code generator backend: receives the IR and emits source text for
/// one host language into `ctx.out_dir`.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn generate(&self, ir: &TypeContext, ctx: &GeneratorContext) -> Result<(), SchemaError>;
}

/// Dispatch to the backend selected by `ctx.backend_name`.
pub fn run_backend(
    backends: &[&dyn Backend],
    ir: &TypeContext,
    ctx: &GeneratorContext,
) -> Result<(), SchemaError> {
    let backend = backends
        .iter()
        .find(|b| b.name() == ctx.backend_name)
        .ok_or_else(|| {
            SchemaError::Semantic(format!("no such backend: {}", ctx.backend_name))
        })?;
    backend.generate(ir, ctx)
}
