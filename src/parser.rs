//! Parse SKilL schema source into the AST using PEST.

use crate::ast::*;
use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct SchemaParser;

/// Parse one schema source into includes and declarations.
pub fn parse(source: &str) -> Result<SchemaFile, String> {
    let pairs = SchemaParser::parse(Rule::skill_file, source)
        .map_err(|e| format!("Parse error: {}", e))?;
    let pair = pairs.into_iter().next().ok_or("Empty parse")?;

    let mut includes = Vec::new();
    let mut declarations = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::include_stmt => {
                for s in inner.into_inner() {
                    if matches!(s.as_rule(), Rule::string) {
                        includes.push(unquote(s.as_str()));
                    }
                }
            }
            Rule::declaration => declarations.push(build_declaration(inner)?),
            _ => {}
        }
    }

    Ok(SchemaFile {
        includes,
        declarations,
    })
}

fn build_declaration(pair: pest::iterators::Pair<Rule>) -> Result<Definition, String> {
    let mut description = Description::default();
    let mut name = String::new();
    let mut super_name = None;
    let mut body = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::description => description = build_description(inner)?,
            Rule::ident => name = inner.as_str().to_string(),
            Rule::super_clause => {
                let id = inner
                    .into_inner()
                    .find(|p| matches!(p.as_rule(), Rule::ident))
                    .ok_or("Missing super type name")?;
                super_name = Some(id.as_str().to_string());
            }
            Rule::field => body.push(build_field(inner)?),
            _ => {}
        }
    }

    Ok(Definition {
        description,
        name,
        super_name,
        body,
    })
}

fn build_field(pair: pest::iterators::Pair<Rule>) -> Result<FieldDef, String> {
    let mut description = Description::default();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::description => description = build_description(inner)?,
            Rule::constant => {
                let mut type_expr = None;
                let mut name = String::new();
                let mut value = None;
                for p in inner.into_inner() {
                    match p.as_rule() {
                        Rule::type_expr => type_expr = Some(build_type_expr(p)?),
                        Rule::ident => name = p.as_str().to_string(),
                        Rule::int => value = Some(parse_int(p.as_str())?),
                        _ => {}
                    }
                }
                return Ok(FieldDef::Constant {
                    description,
                    type_expr: type_expr.ok_or("Missing type in constant field")?,
                    name,
                    value: value.ok_or("Missing value in constant field")?,
                });
            }
            Rule::data => {
                let mut auto = false;
                let mut type_expr = None;
                let mut name = String::new();
                for p in inner.into_inner() {
                    match p.as_rule() {
                        Rule::auto_kw => auto = true,
                        Rule::type_expr => type_expr = Some(build_type_expr(p)?),
                        Rule::ident => name = p.as_str().to_string(),
                        _ => {}
                    }
                }
                return Ok(FieldDef::Data {
                    description,
                    auto,
                    type_expr: type_expr.ok_or("Missing type in field")?,
                    name,
                });
            }
            _ => {}
        }
    }
    Err("Empty field".to_string())
}

fn build_type_expr(pair: pest::iterators::Pair<Rule>) -> Result<TypeExpr, String> {
    let inner = pair.into_inner().next().ok_or("Empty type expression")?;
    match inner.as_rule() {
        Rule::base_ref => Ok(TypeExpr::Base(inner.as_str().to_string())),
        Rule::array_type => {
            let mut base = String::new();
            let mut len = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::base_ref => base = p.as_str().to_string(),
                    Rule::int => len = Some(parse_int(p.as_str())?),
                    _ => {}
                }
            }
            match len {
                Some(n) if n < 0 => Err(format!("Negative array length: {}", n)),
                Some(n) => Ok(TypeExpr::FixedArray(base, n as u64)),
                None => Ok(TypeExpr::VarArray(base)),
            }
        }
        Rule::compound_type => {
            let mut kw = "";
            let mut elems = Vec::new();
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::compound_kw => kw = p.as_str(),
                    Rule::base_ref => elems.push(p.as_str().to_string()),
                    _ => {}
                }
            }
            match kw {
                "list" => {
                    if elems.len() != 1 {
                        return Err(format!(
                            "list requires exactly one element type, found {}",
                            elems.len()
                        ));
                    }
                    Ok(TypeExpr::List(elems.pop().expect("one element")))
                }
                "set" => {
                    if elems.len() != 1 {
                        return Err(format!(
                            "set requires exactly one element type, found {}",
                            elems.len()
                        ));
                    }
                    Ok(TypeExpr::Set(elems.pop().expect("one element")))
                }
                "map" => {
                    if elems.len() < 2 {
                        return Err(format!(
                            "map requires at least two base types, found {}",
                            elems.len()
                        ));
                    }
                    Ok(TypeExpr::Map(elems))
                }
                _ => Err(format!("Unknown compound type: {}", kw)),
            }
        }
        _ => Err(format!("Unhandled type rule: {:?}", inner.as_rule())),
    }
}

fn build_description(pair: pest::iterators::Pair<Rule>) -> Result<Description, String> {
    let mut out = Description::default();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::doc_comment => out.doc_comment = Some(clean_comment(inner.as_str())),
            Rule::restriction => {
                let mut name = String::new();
                let mut args = Vec::new();
                for p in inner.into_inner() {
                    match p.as_rule() {
                        Rule::ident => name = p.as_str().to_string(),
                        Rule::rest_arg => args.push(build_rest_arg(p)?),
                        _ => {}
                    }
                }
                out.restrictions.push(RestrictionDef { name, args });
            }
            Rule::hint => {
                let id = inner
                    .into_inner()
                    .find(|p| matches!(p.as_rule(), Rule::ident))
                    .ok_or("Missing hint name")?;
                out.hints.push(HintDef {
                    name: id.as_str().to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(out)
}

fn build_rest_arg(pair: pest::iterators::Pair<Rule>) -> Result<RestrictionArg, String> {
    let inner = pair.into_inner().next().ok_or("Empty restriction argument")?;
    match inner.as_rule() {
        Rule::string => Ok(RestrictionArg::Str(unquote(inner.as_str()))),
        Rule::float => inner
            .as_str()
            .parse::<f64>()
            .map(RestrictionArg::Float)
            .map_err(|_| format!("Bad float literal: {}", inner.as_str())),
        Rule::int => parse_int(inner.as_str()).map(RestrictionArg::Int),
        _ => Err(format!("Unhandled argument rule: {:?}", inner.as_rule())),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map(|v| v as i64)
            .map_err(|_| format!("Bad hex literal: {}", s));
    }
    s.parse::<i64>().map_err(|_| format!("Bad int literal: {}", s))
}

/// String literals have no interior escapes; just drop the quotes.
fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

/// Strip comment delimiters and per-line `*` gutters.
fn clean_comment(raw: &str) -> String {
    let body = raw
        .trim_start_matches("/*")
        .trim_end_matches("*/");
    let lines: Vec<&str> = body
        .lines()
        .map(|l| l.trim().trim_start_matches('*').trim())
        .filter(|l| !l.is_empty())
        .collect();
    lines.join("\n")
}
