//! Dump the checked IR of a schema file, in type order.
//!
//! Usage:
//!   skill_ir [OPTIONS] FILE.skill
//!
//! Options:
//!   --lenient, -l  Report unknown hints as warnings instead of errors
//!
//! Exit code 1 with a diagnostic on stderr if the schema does not check.

use skillgen::ir::{FieldType, TypeContext};
use skillgen::{from_file_with_mode, HintMode};
use std::path::Path;

fn type_name(ir: &TypeContext, ft: &FieldType) -> String {
    match ft {
        FieldType::Ground(g) => g.name().to_string(),
        FieldType::UserRef(t) => ir.decl(*t).skill_name.clone(),
        FieldType::FixedArray(elem, n) => format!("{}[{}]", type_name(ir, elem), n),
        FieldType::VarArray(elem) => format!("{}[]", type_name(ir, elem)),
        FieldType::List(elem) => format!("list<{}>", type_name(ir, elem)),
        FieldType::Set(elem) => format!("set<{}>", type_name(ir, elem)),
        FieldType::Map(elems) => {
            let inner: Vec<String> = elems.iter().map(|e| type_name(ir, e)).collect();
            format!("map<{}>", inner.join(", "))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mode = if let Some(pos) = args.iter().position(|a| a == "--lenient" || a == "-l") {
        args.remove(pos);
        HintMode::Lenient
    } else {
        HintMode::Strict
    };
    let file = match args.first() {
        Some(f) => f.clone(),
        None => {
            eprintln!("usage: skill_ir [--lenient] FILE.skill");
            std::process::exit(1);
        }
    };

    let ir = match from_file_with_mode(Path::new(&file), mode) {
        Ok(ir) => ir,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    for w in &ir.warnings {
        eprintln!("warning: {}", w);
    }
    for decl in ir.iter() {
        match decl.super_type {
            Some(s) => println!("{} : {} {{", decl.capital_name, ir.decl(s).skill_name),
            None => println!("{} {{", decl.capital_name),
        }
        for f in &decl.fields {
            let prefix = if f.is_constant {
                "const "
            } else if f.is_auto {
                "auto "
            } else {
                ""
            };
            match f.constant_value {
                Some(v) if f.is_constant => println!(
                    "\t{}{} {} = {};",
                    prefix,
                    type_name(&ir, &f.field_type),
                    f.skill_name,
                    v
                ),
                _ => println!(
                    "\t{}{} {};",
                    prefix,
                    type_name(&ir, &f.field_type),
                    f.skill_name
                ),
            }
        }
        println!("}}");
    }
    Ok(())
}
