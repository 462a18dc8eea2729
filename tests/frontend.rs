//! Schema front-end tests: parsing, include resolution, type checking,
//! type order, and the pinned diagnostic messages.

use skillgen::{from_file, from_file_with_mode, from_source, HintMode, SchemaError};
use std::path::PathBuf;

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

// ==================== File-based scenarios ====================

#[test]
fn hints_check_out() {
    let ir = from_file(&data("hints.skill")).expect("hints.skill checks");
    assert!(ir.len() > 0);
    let message = ir.get("message").expect("message type");
    assert!(!message.hints.is_empty());
}

#[test]
fn bad_hints_rejected_in_strict_mode() {
    let err = from_file(&data("badHints.skill")).expect_err("unknown hint");
    assert!(matches!(err, SchemaError::Semantic(_)));
    assert!(err.to_string().contains("unknown hint"));
}

#[test]
fn bad_hints_warn_in_lenient_mode() {
    let ir = from_file_with_mode(&data("badHints.skill"), HintMode::Lenient)
        .expect("lenient mode tolerates unknown hints");
    assert_eq!(ir.len(), 1);
    assert!(!ir.warnings.is_empty());
}

#[test]
fn unknown_restriction_message_is_exact() {
    let err = from_file(&data("restrictions.skill")).expect_err("unknown restriction");
    assert_eq!(
        err.to_string(),
        "notahint() is either not supported or an invalid restriction name"
    );
}

#[test]
fn empty_schema_yields_empty_ir() {
    let ir = from_file(&data("empty.skill")).expect("empty input is fine");
    assert_eq!(ir.len(), 0);
}

#[test]
fn type_order_roots_before_subtypes() {
    let ir = from_file(&data("typeOrderIR.skill")).expect("typeOrderIR.skill checks");
    let order: String = ir.iter().map(|d| d.skill_name.as_str()).collect();
    assert!(
        order == "abdc" || order == "acbd",
        "unexpected type order {}",
        order
    );
    // Every declaration follows its super type.
    for (i, d) in ir.iter().enumerate() {
        if let Some(s) = d.super_type {
            assert!(s < i, "{} precedes its super", d.skill_name);
        }
    }
}

#[test]
fn regression_casing() {
    let ir = from_file(&data("regressionCasing.skill")).expect("regressionCasing.skill checks");
    assert_eq!(ir.len(), 2);
    let names: Vec<&str> = ir.iter().map(|d| d.skill_name.as_str()).collect();
    assert_eq!(names[0], "message");
    assert_eq!(names[1], "datedmessage");
    assert_eq!(ir.decl(0).capital_name, "Message");
    assert_eq!(ir.decl(1).capital_name, "DatedMessage");
}

#[test]
fn missing_type_message_is_exact() {
    let err =
        from_file(&data("failures/missingTypeCausedBySpelling.skill")).expect_err("bad super");
    assert_eq!(
        err.to_string(),
        "The type \"MessSage\" is unknown!\nKnown types are: message, datedmessage"
    );
}

#[test]
fn duplicate_definition_rejected() {
    let err = from_file(&data("failures/duplicateDefinition.skill")).expect_err("dup type");
    assert!(err.to_string().contains("duplicate definition"));
}

#[test]
fn duplicate_field_rejected() {
    let err = from_file(&data("failures/duplicateField.skill")).expect_err("dup field");
    assert!(err.to_string().contains("duplicate field"));
}

#[test]
fn half_float_rejected() {
    assert!(from_file(&data("failures/halfFloat.skill")).is_err());
}

#[test]
fn float_constant_rejected() {
    assert!(from_file(&data("failures/floatConstant.skill")).is_err());
}

#[test]
fn self_referential_constant_rejected() {
    assert!(from_file(&data("failures/selfConst.skill")).is_err());
}

#[test]
fn unknown_field_type_rejected() {
    let err = from_file(&data("failures/unknownType.skill")).expect_err("unknown field type");
    assert!(err.to_string().starts_with("The type \"Nonexistent\" is unknown!"));
}

#[test]
fn missing_include_names_file_and_directory() {
    let err = from_file(&data("failures/unknownFile.skill")).expect_err("missing include");
    assert!(matches!(err, SchemaError::MissingInclude { .. }));
    let msg = err.to_string();
    assert!(msg.contains("doesNotExist.skill"));
    assert!(msg.contains("failures"));
}

#[test]
fn comment_only_schema_rejected() {
    let err = from_file(&data("failures/empty.skill")).expect_err("no definitions");
    assert!(matches!(err, SchemaError::Semantic(_)));
}

#[test]
fn any_type_rejected() {
    assert!(from_file(&data("failures/anyType.skill")).is_err());
}

#[test]
fn includes_resolve_transitively_and_cycles_terminate() {
    let ir = from_file(&data("includeRoot.skill")).expect("include cycle resolves");
    assert!(ir.get("root").is_some());
    assert!(ir.get("leaf").is_some());
}

// ==================== Inline sources: parsing ====================

#[test]
fn parse_collects_includes_and_declarations() {
    let src = r#"
include "a.skill" "b.skill"
with "c.skill"

Message {
	string text;
}
"#;
    let file = skillgen::parse(src).expect("parse");
    assert_eq!(file.includes, vec!["a.skill", "b.skill", "c.skill"]);
    assert_eq!(file.declarations.len(), 1);
    assert_eq!(file.declarations[0].name, "Message");
}

#[test]
fn set_requires_exactly_one_element_type() {
    let err = skillgen::parse("A {\n\tset<i8, i16> s;\n}\n").expect_err("set arity");
    assert!(err.contains("set"));
}

#[test]
fn map_requires_at_least_two_base_types() {
    let err = skillgen::parse("A {\n\tmap<i8> m;\n}\n").expect_err("map arity");
    assert!(err.contains("map"));
}

#[test]
fn parse_error_pinpoints_location() {
    let err = skillgen::parse("A {\n\ti32 ;\n}\n").expect_err("missing field name");
    assert!(err.starts_with("Parse error:"));
    assert!(err.contains("2"), "line number in {}", err);
}

#[test]
fn constants_accept_hex_literals() {
    let ir = from_source("A {\n\tconst v64 magic = 0xCAFE;\n}\n").expect("check");
    let f = &ir.get("a").expect("a").fields[0];
    assert!(f.is_constant);
    assert_eq!(f.constant_value, Some(0xCAFE));
}

#[test]
fn arrays_fixed_and_variable() {
    use skillgen::{FieldType, GroundType};
    let ir = from_source("A {\n\ti8[4] quad;\n\ti8[] tail;\n}\n").expect("check");
    let a = ir.get("a").expect("a");
    assert_eq!(
        a.fields[0].field_type,
        FieldType::FixedArray(Box::new(FieldType::Ground(GroundType::I8)), 4)
    );
    assert_eq!(
        a.fields[1].field_type,
        FieldType::VarArray(Box::new(FieldType::Ground(GroundType::I8)))
    );
}

#[test]
fn doc_comments_attach_to_types_and_fields() {
    let src = "/* the type */\nA {\n\t/* the field */\n\ti32 x;\n}\n";
    let ir = from_source(src).expect("check");
    let a = ir.get("a").expect("a");
    assert_eq!(a.doc.as_deref(), Some("the type"));
    assert_eq!(a.fields[0].doc.as_deref(), Some("the field"));
}

// ==================== Inline sources: semantics ====================

#[test]
fn empty_integral_range_message_is_exact() {
    let err = from_source("A {\n\t@range(5, 2)\n\ti32 x;\n}\n").expect_err("empty range");
    assert_eq!(
        err.to_string(),
        "Integer range restriction has no legal values: 5 -> 2"
    );
}

#[test]
fn empty_float_range_reuses_integer_wording() {
    let err = from_source("A {\n\t@range(2.0, 1.0)\n\tf64 x;\n}\n").expect_err("empty range");
    assert_eq!(
        err.to_string(),
        "Integer range restriction has no legal values: 2 -> 1"
    );
}

#[test]
fn four_argument_range_with_bound_kinds() {
    use skillgen::Restriction;
    let ir = from_source(
        "A {\n\t@range(0, 10, \"inclusive\", \"exclusive\")\n\ti64 x;\n}\n",
    )
    .expect("check");
    let f = &ir.get("a").expect("a").fields[0];
    assert_eq!(
        f.restrictions[0],
        Restriction::IntRange {
            low: 0,
            high: 10,
            inclusive_low: true,
            inclusive_high: false,
        }
    );
}

#[test]
fn range_on_non_numeric_field_rejected() {
    let err = from_source("A {\n\t@range(0, 1)\n\tstring s;\n}\n").expect_err("range on string");
    assert!(err.to_string().contains("range"));
}

#[test]
fn known_restrictions_parse() {
    let src = "@unique\n@singleton\nA {\n\t@nonnull\n\tannotation any_ref;\n\t@default(7)\n\ti32 x;\n\t@coding(\"zlib\")\n\tstring s;\n}\n";
    let ir = from_source(src).expect("check");
    let a = ir.get("a").expect("a");
    assert_eq!(a.restrictions.len(), 2);
    assert_eq!(a.fields[0].restrictions.len(), 1);
}

#[test]
fn auto_fields_are_flagged() {
    let ir = from_source("A {\n\tauto i32 cache;\n\ti32 real;\n}\n").expect("check");
    let a = ir.get("a").expect("a");
    assert!(a.fields[0].is_auto);
    assert!(!a.fields[0].has_data());
    assert!(a.fields[1].has_data());
}

#[test]
fn ignore_hint_marks_field() {
    let ir = from_source("A {\n\t!ignore\n\ti32 scratch;\n}\n").expect("check");
    assert!(ir.get("a").expect("a").fields[0].is_ignored);
}

#[test]
fn cyclic_inheritance_rejected() {
    let err = from_source("a : b {\n\ti32 x;\n}\nb : a {\n\ti32 y;\n}\n").expect_err("cycle");
    assert!(err.to_string().contains("cyclic"));
}

#[test]
fn cyclic_field_references_are_fine() {
    use skillgen::FieldType;
    let ir = from_source("Node {\n\tNode next;\n}\n").expect("check");
    let node = ir.get("node").expect("node");
    assert_eq!(node.fields[0].field_type, FieldType::UserRef(0));
}

#[test]
fn inherited_fields_come_first() {
    let ir = from_file(&data("regressionCasing.skill")).expect("check");
    let dated = ir.id_of("datedmessage").expect("id");
    let all: Vec<&str> = ir
        .all_fields(dated)
        .iter()
        .map(|f| f.skill_name.as_str())
        .collect();
    assert_eq!(all, vec!["text", "date"]);
}

#[test]
fn transitive_subtypes_in_type_order() {
    let ir = from_file(&data("typeOrderIR.skill")).expect("check");
    let a = ir.id_of("a").expect("a");
    let subs: Vec<&str> = ir
        .decl(a)
        .sub_types
        .iter()
        .map(|&s| ir.decl(s).skill_name.as_str())
        .collect();
    let order: String = ir.iter().map(|d| d.skill_name.as_str()).collect();
    if order == "abdc" {
        assert_eq!(subs, vec!["b", "d", "c"]);
    } else {
        assert_eq!(subs, vec!["c", "b", "d"]);
    }
}

// ==================== Generator seam ====================

struct TypeListBackend;

impl skillgen::Backend for TypeListBackend {
    fn name(&self) -> &'static str {
        "typelist"
    }

    fn generate(
        &self,
        ir: &skillgen::TypeContext,
        ctx: &skillgen::GeneratorContext,
    ) -> Result<(), SchemaError> {
        let names: Vec<String> = ir
            .iter()
            .map(|d| format!("{}.{}", ctx.package_prefix, d.skill_name))
            .collect();
        std::fs::write(ctx.out_dir.join("types.txt"), names.join("\n"))?;
        Ok(())
    }
}

#[test]
fn backends_receive_ir_and_context() {
    use skillgen::{gen, Backend, GeneratorContext};
    let dir = tempfile::tempdir().expect("tempdir");
    let ir = from_file(&data("regressionCasing.skill")).expect("check");
    let ctx = GeneratorContext {
        out_dir: dir.path().to_path_buf(),
        package_prefix: "demo".to_string(),
        backend_name: "typelist".to_string(),
    };
    let backends: &[&dyn Backend] = &[&TypeListBackend];
    gen::run_backend(backends, &ir, &ctx).expect("generate");
    let written = std::fs::read_to_string(dir.path().join("types.txt")).expect("output");
    assert_eq!(written, "demo.message\ndemo.datedmessage");

    let missing = GeneratorContext {
        backend_name: "no-such-backend".to_string(),
        ..ctx
    };
    assert!(gen::run_backend(backends, &ir, &missing).is_err());
}

#[test]
fn repeated_checks_are_deterministic() {
    let first = from_file(&data("typeOrderIR.skill")).expect("check");
    let second = from_file(&data("typeOrderIR.skill")).expect("check");
    let a: Vec<String> = first.iter().map(|d| d.skill_name.clone()).collect();
    let b: Vec<String> = second.iter().map(|d| d.skill_name.clone()).collect();
    assert_eq!(a, b);
}
