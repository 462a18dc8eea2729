//! Lift the parsed AST into the checked IR.
//!
//! Runs after include resolution, on the flat declaration list: builds
//! the case-insensitive name table, resolves super clauses and field
//! types, validates restrictions and hints, and emits the declarations
//! in type order.

use crate::ast::{Definition, FieldDef, HintDef, RestrictionArg, RestrictionDef, TypeExpr};
use crate::include::SchemaError;
use crate::ir::{
    DefaultValue, Declaration, Field, FieldType, GroundType, Hint, Restriction, TypeContext,
};
use std::collections::{HashMap, HashSet};

/// How to treat unknown hint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintMode {
    /// Unknown hints are errors (the default for the public drivers).
    Strict,
    /// Unknown hints are collected as warnings on the result.
    Lenient,
}

fn sem<T>(msg: String) -> Result<T, SchemaError> {
    Err(SchemaError::Semantic(msg))
}

fn unknown_type(name: &str, known: &[String]) -> String {
    format!(
        "The type \"{}\" is unknown!\nKnown types are: {}",
        name,
        known.join(", ")
    )
}

/// Type-check a flat declaration list and return the IR in type order.
pub fn check(defs: Vec<Definition>, mode: HintMode) -> Result<TypeContext, SchemaError> {
    // Name table. Lower-cased names must be injective.
    let mut by_lower: HashMap<String, usize> = HashMap::new();
    let mut known: Vec<String> = Vec::new();
    for (i, d) in defs.iter().enumerate() {
        let lower = d.name.to_lowercase();
        if lower == "any" {
            return sem(format!("\"{}\" is not a legal type name", d.name));
        }
        if by_lower.insert(lower.clone(), i).is_some() {
            return sem(format!("duplicate definition of type \"{}\"", lower));
        }
        known.push(lower);
    }

    // Super resolution against the user-type table.
    let mut supers: Vec<Option<usize>> = Vec::with_capacity(defs.len());
    for d in &defs {
        match &d.super_name {
            None => supers.push(None),
            Some(s) => match by_lower.get(&s.to_lowercase()) {
                Some(&p) => supers.push(Some(p)),
                None => return sem(unknown_type(s, &known)),
            },
        }
    }

    // Type order: depth-first from each root, roots and siblings in
    // first-definition order.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
    for (i, s) in supers.iter().enumerate() {
        if let Some(p) = *s {
            children[p].push(i);
        }
    }
    let mut order: Vec<usize> = Vec::with_capacity(defs.len());
    let mut stack: Vec<usize> = Vec::new();
    for i in 0..defs.len() {
        if supers[i].is_none() {
            stack.push(i);
            while let Some(cur) = stack.pop() {
                order.push(cur);
                for &c in children[cur].iter().rev() {
                    stack.push(c);
                }
            }
        }
    }
    if order.len() != defs.len() {
        let stuck: Vec<&str> = (0..defs.len())
            .filter(|i| !order.contains(i))
            .map(|i| known[i].as_str())
            .collect();
        return sem(format!("cyclic inheritance involving: {}", stuck.join(", ")));
    }
    let mut new_id = vec![0usize; defs.len()];
    for (ni, &si) in order.iter().enumerate() {
        new_id[si] = ni;
    }

    // Build declarations in the final order.
    let mut warnings: Vec<String> = Vec::new();
    let mut decls: Vec<Declaration> = Vec::with_capacity(defs.len());
    for &si in &order {
        let d = &defs[si];
        let super_type = supers[si].map(|p| new_id[p]);
        let base_type = {
            let mut r = si;
            while let Some(p) = supers[r] {
                r = p;
            }
            new_id[r]
        };

        let hints = check_hints(&d.description.hints, mode, &mut warnings, &d.name)?;
        let mut restrictions = Vec::new();
        for r in &d.description.restrictions {
            restrictions.push(check_restriction(r, None)?);
        }

        let mut fields = Vec::new();
        let mut seen_fields: HashSet<String> = HashSet::new();
        for f in &d.body {
            let lower = f.name().to_lowercase();
            if !seen_fields.insert(lower) {
                return sem(format!(
                    "duplicate field \"{}\" in type \"{}\"",
                    f.name(),
                    d.name
                ));
            }
            fields.push(build_field(f, &by_lower, &new_id, &known, mode, &mut warnings)?);
        }

        decls.push(Declaration {
            skill_name: d.name.to_lowercase(),
            capital_name: d.name.clone(),
            doc: d.description.doc_comment.clone(),
            super_type,
            base_type,
            sub_types: Vec::new(),
            fields,
            restrictions,
            hints,
        });
    }

    // Transitive subtype lists; ids ascend in type order, so each list
    // comes out in type order as well.
    for id in 0..decls.len() {
        let mut cur = decls[id].super_type;
        while let Some(a) = cur {
            decls[a].sub_types.push(id);
            cur = decls[a].super_type;
        }
    }

    Ok(TypeContext::new(decls, warnings))
}

fn build_field(
    f: &FieldDef,
    by_lower: &HashMap<String, usize>,
    new_id: &[usize],
    known: &[String],
    mode: HintMode,
    warnings: &mut Vec<String>,
) -> Result<Field, SchemaError> {
    let desc = f.description();
    let (type_expr, is_constant, constant_value, is_auto) = match f {
        FieldDef::Constant {
            type_expr, value, ..
        } => (type_expr, true, Some(*value), false),
        FieldDef::Data {
            type_expr, auto, ..
        } => (type_expr, false, None, *auto),
    };

    let field_type = resolve_type(type_expr, by_lower, new_id, known)?;
    if is_constant && !matches!(field_type, FieldType::Ground(g) if g.is_integer()) {
        return sem(format!(
            "constant field \"{}\" requires an integral base type",
            f.name()
        ));
    }

    let hints = check_hints(&desc.hints, mode, warnings, f.name())?;
    let mut restrictions = Vec::new();
    for r in &desc.restrictions {
        restrictions.push(check_restriction(r, Some(&field_type))?);
    }

    Ok(Field {
        skill_name: f.name().to_lowercase(),
        field_type,
        is_constant,
        constant_value,
        is_auto,
        is_ignored: hints.contains(&Hint::Ignore),
        doc: desc.doc_comment.clone(),
        restrictions,
        hints,
    })
}

fn resolve_type(
    expr: &TypeExpr,
    by_lower: &HashMap<String, usize>,
    new_id: &[usize],
    known: &[String],
) -> Result<FieldType, SchemaError> {
    let base = |name: &str| -> Result<FieldType, SchemaError> {
        if let Some(g) = GroundType::from_name(&name.to_lowercase()) {
            return Ok(FieldType::Ground(g));
        }
        match by_lower.get(&name.to_lowercase()) {
            Some(&i) => Ok(FieldType::UserRef(new_id[i])),
            None => sem(unknown_type(name, known)),
        }
    };
    match expr {
        TypeExpr::Base(n) => base(n),
        TypeExpr::FixedArray(n, len) => Ok(FieldType::FixedArray(Box::new(base(n)?), *len)),
        TypeExpr::VarArray(n) => Ok(FieldType::VarArray(Box::new(base(n)?))),
        TypeExpr::List(n) => Ok(FieldType::List(Box::new(base(n)?))),
        TypeExpr::Set(n) => Ok(FieldType::Set(Box::new(base(n)?))),
        TypeExpr::Map(elems) => {
            let mut out = Vec::with_capacity(elems.len());
            for n in elems {
                out.push(base(n)?);
            }
            Ok(FieldType::Map(out))
        }
    }
}

fn check_hints(
    hints: &[HintDef],
    mode: HintMode,
    warnings: &mut Vec<String>,
    owner: &str,
) -> Result<Vec<Hint>, SchemaError> {
    let mut out = Vec::new();
    for h in hints {
        match Hint::from_name(&h.name) {
            Some(k) => out.push(k),
            None => match mode {
                HintMode::Strict => {
                    return sem(format!("unknown hint !{} on {}", h.name, owner));
                }
                HintMode::Lenient => {
                    warnings.push(format!("unknown hint !{} on {} (ignored)", h.name, owner));
                }
            },
        }
    }
    Ok(out)
}

fn check_restriction(
    r: &RestrictionDef,
    target: Option<&FieldType>,
) -> Result<Restriction, SchemaError> {
    let expect_args = |n: usize| -> Result<(), SchemaError> {
        if r.args.len() != n {
            return sem(format!(
                "{} expects {} argument(s), found {}",
                r.name,
                n,
                r.args.len()
            ));
        }
        Ok(())
    };
    match r.name.to_lowercase().as_str() {
        "range" => check_range(r, target),
        "nonnull" => {
            expect_args(0)?;
            Ok(Restriction::NonNull)
        }
        "unique" => {
            expect_args(0)?;
            Ok(Restriction::Unique)
        }
        "singleton" => {
            expect_args(0)?;
            Ok(Restriction::Singleton)
        }
        "monotone" => {
            expect_args(0)?;
            Ok(Restriction::Monotone)
        }
        "default" => {
            expect_args(1)?;
            let v = match &r.args[0] {
                RestrictionArg::Int(i) => DefaultValue::Int(*i),
                RestrictionArg::Float(f) => DefaultValue::Float(*f),
                RestrictionArg::Str(s) => DefaultValue::Str(s.clone()),
            };
            Ok(Restriction::Default(v))
        }
        "coding" => {
            expect_args(1)?;
            match &r.args[0] {
                RestrictionArg::Str(s) => Ok(Restriction::Coding(s.clone())),
                _ => sem("coding expects a string argument".to_string()),
            }
        }
        _ => sem(format!(
            "{}() is either not supported or an invalid restriction name",
            r.name
        )),
    }
}

fn check_range(r: &RestrictionDef, target: Option<&FieldType>) -> Result<Restriction, SchemaError> {
    let ground = match target {
        Some(FieldType::Ground(g)) if g.is_integer() || g.is_float() => *g,
        _ => {
            return sem(
                "a range restriction requires an integral or floating field type".to_string(),
            )
        }
    };
    let (inclusive_low, inclusive_high) = match r.args.len() {
        2 => (true, true),
        4 => (bound_kind(&r.args[2])?, bound_kind(&r.args[3])?),
        n => return sem(format!("range expects 2 or 4 arguments, found {}", n)),
    };
    if ground.is_integer() {
        let low = r.args[0]
            .as_i64()
            .ok_or_else(|| SchemaError::Semantic("integral range bounds must be integers".into()))?;
        let high = r.args[1]
            .as_i64()
            .ok_or_else(|| SchemaError::Semantic("integral range bounds must be integers".into()))?;
        if low >= high {
            return sem(format!(
                "Integer range restriction has no legal values: {} -> {}",
                low, high
            ));
        }
        Ok(Restriction::IntRange {
            low,
            high,
            inclusive_low,
            inclusive_high,
        })
    } else {
        let low = r.args[0]
            .as_f64()
            .ok_or_else(|| SchemaError::Semantic("float range bounds must be numbers".into()))?;
        let high = r.args[1]
            .as_f64()
            .ok_or_else(|| SchemaError::Semantic("float range bounds must be numbers".into()))?;
        // Empty float ranges report with the integer wording.
        if low >= high {
            return sem(format!(
                "Integer range restriction has no legal values: {} -> {}",
                low, high
            ));
        }
        Ok(Restriction::FloatRange {
            low,
            high,
            inclusive_low,
            inclusive_high,
        })
    }
}

fn bound_kind(arg: &RestrictionArg) -> Result<bool, SchemaError> {
    match arg {
        RestrictionArg::Str(s) if s.eq_ignore_ascii_case("inclusive") => Ok(true),
        RestrictionArg::Str(s) if s.eq_ignore_ascii_case("exclusive") => Ok(false),
        _ => sem("range bound kinds must be \"inclusive\" or \"exclusive\"".to_string()),
    }
}
