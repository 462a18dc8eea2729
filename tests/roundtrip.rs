//! State machine tests: write, read, append, and the wire-level
//! guarantees (bit-identical round trips, prefix-preserving appends,
//! carry-through of unknown fields and types).

use skillgen::{from_source, FieldValue, ObjectRef, SkillError, SkillState, TypeContext};
use std::path::Path;

const GRAPH: &str = "
Message {
	string text;
	v64 count;
}

DatedMessage : Message {
	v64 date;
}

Node {
	Node next;
	annotation payload;
}
";

fn graph_ir() -> TypeContext {
    from_source(GRAPH).expect("schema checks")
}

fn populate(state: &mut SkillState) -> (ObjectRef, ObjectRef, ObjectRef, ObjectRef) {
    let m = state.add("Message").expect("add");
    state
        .set(m, "text", FieldValue::String(Some("hello".to_string())))
        .expect("set");
    state.set(m, "count", FieldValue::V64(3)).expect("set");

    let d = state.add("DatedMessage").expect("add");
    state
        .set(d, "text", FieldValue::String(Some("dated".to_string())))
        .expect("set");
    state.set(d, "count", FieldValue::V64(-1)).expect("set");
    state.set(d, "date", FieldValue::V64(99)).expect("set");

    let n1 = state.add("Node").expect("add");
    let n2 = state.add("Node").expect("add");
    state.set(n1, "next", FieldValue::Ref(Some(n2))).expect("set");
    state.set(n2, "next", FieldValue::Ref(Some(n1))).expect("set");
    state
        .set(n1, "payload", FieldValue::Annotation(Some(m)))
        .expect("set");
    (m, d, n1, n2)
}

#[test]
fn write_read_write_is_bit_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = dir.path().join("a.sf");
    let b = dir.path().join("b.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    state.write(&a).expect("write");

    let mut back = SkillState::read(graph_ir(), &a).expect("read");
    back.write(&b).expect("rewrite");

    let first = std::fs::read(&a).expect("read bytes");
    let second = std::fs::read(&b).expect("read bytes");
    assert_eq!(first, second);
}

#[test]
fn read_replays_values_and_references() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    state.write(&path).expect("write");

    let back = SkillState::read(graph_ir(), &path).expect("read");
    let messages: Vec<ObjectRef> = back
        .all_in_type_order("message")
        .expect("iterate")
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        back.get(messages[0], "text"),
        Some(FieldValue::String(Some("hello".to_string())))
    );
    assert_eq!(back.get(messages[1], "date"), Some(FieldValue::V64(99)));
    assert_eq!(back.get(messages[1], "count"), Some(FieldValue::V64(-1)));

    let nodes: Vec<ObjectRef> = back.all_in_type_order("node").expect("iterate").collect();
    assert_eq!(nodes.len(), 2);
    let next = back.get(nodes[0], "next").expect("next set");
    assert_eq!(next, FieldValue::Ref(Some(nodes[1])));
    let cycle = back.get(nodes[1], "next").expect("next set");
    assert_eq!(cycle, FieldValue::Ref(Some(nodes[0])));
    match back.get(nodes[0], "payload") {
        Some(FieldValue::Annotation(Some(target))) => {
            assert_eq!(back.pools()[target.pool].name, "message");
        }
        other => panic!("expected annotation target, got {:?}", other),
    }
}

#[test]
fn append_preserves_the_base_file_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    state.write(&path).expect("write");
    let base = std::fs::read(&path).expect("read bytes");

    let m = state.add("Message").expect("add");
    state
        .set(m, "text", FieldValue::String(Some("appended".to_string())))
        .expect("set");
    state.append().expect("append");

    let after = std::fs::read(&path).expect("read bytes");
    assert!(after.len() > base.len());
    assert_eq!(&after[..base.len()], &base[..]);

    let back = SkillState::read(graph_ir(), &path).expect("read");
    let messages: Vec<ObjectRef> = back
        .all_in_type_order("message")
        .expect("iterate")
        .collect();
    assert_eq!(messages.len(), 3);
    let texts: Vec<Option<FieldValue>> =
        messages.iter().map(|&m| back.get(m, "text")).collect();
    assert!(texts.contains(&Some(FieldValue::String(Some("appended".to_string())))));
}

#[test]
fn append_to_a_new_target_leaves_the_base_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a = dir.path().join("a.sf");
    let b = dir.path().join("b.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    state.write(&a).expect("write");
    let base = std::fs::read(&a).expect("read bytes");

    state.add("Message").expect("add");
    state.append_to(&b).expect("append to");

    assert_eq!(std::fs::read(&a).expect("read bytes"), base);
    let appended = std::fs::read(&b).expect("read bytes");
    assert_eq!(&appended[..base.len()], &base[..]);
    assert_eq!(state.from_path(), Some(b.as_path()));
}

#[test]
fn append_without_a_base_file_fails() {
    let mut state = SkillState::create(graph_ir());
    state.add("Message").expect("add");
    match state.append() {
        Err(SkillError::NoBasePath) => {}
        other => panic!("expected NoBasePath, got {:?}", other),
    }
}

#[test]
fn null_annotation_is_two_zero_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("holder.sf");

    let ir = from_source("Holder {\n\tannotation thing;\n}\n").expect("schema checks");
    let mut state = SkillState::create(ir);
    state.add("Holder").expect("add");
    state.write(&path).expect("write");

    let bytes = std::fs::read(&path).expect("read bytes");
    assert!(bytes.ends_with(&[0, 0]));
}

#[test]
fn nested_strings_are_interned_and_survive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bag.sf");

    let src = "Bag {\n\tlist<string> items;\n\tmap<string, string, i32> index;\n}\n";
    let ir = from_source(src).expect("schema checks");
    let mut state = SkillState::create(ir);
    let bag = state.add("Bag").expect("add");
    state
        .set(
            bag,
            "items",
            FieldValue::List(vec![
                FieldValue::String(Some("x".to_string())),
                FieldValue::String(None),
                FieldValue::String(Some("y".to_string())),
            ]),
        )
        .expect("set");
    state
        .set(
            bag,
            "index",
            FieldValue::Map(vec![(
                FieldValue::String(Some("outer".to_string())),
                FieldValue::Map(vec![(
                    FieldValue::String(Some("inner".to_string())),
                    FieldValue::I32(5),
                )]),
            )]),
        )
        .expect("set");
    state.write(&path).expect("write");

    for s in ["x", "y", "outer", "inner"] {
        let id = state.strings().id_of(s).expect("interned");
        assert!(id >= 1 && id <= state.strings().len() as u64);
    }

    let back = SkillState::read(
        from_source(src).expect("schema checks"),
        &path,
    )
    .expect("read");
    let bags: Vec<ObjectRef> = back.all_in_type_order("bag").expect("iterate").collect();
    assert_eq!(back.get(bags[0], "items"), state.get(bag, "items"));
    assert_eq!(back.get(bags[0], "index"), state.get(bag, "index"));
}

#[test]
fn block_layout_tracks_lbpsi_per_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tree.sf");
    let src = "a {\n}\nb : a {\n}\nc : a {\n}\nd extends b {\n}\n";

    let mut state = SkillState::create(from_source(src).expect("schema checks"));
    state.add("a").expect("add");
    state.add("a").expect("add");
    state.add("b").expect("add");
    state.add("c").expect("add");
    state.add("d").expect("add");
    state.write(&path).expect("write");

    let back = SkillState::read(from_source(src).expect("schema checks"), &path).expect("read");
    let block = |name: &str| back.pool(name).expect("pool").blocks[0];
    assert_eq!((block("a").bpsi, block("a").count), (1, 5));
    assert_eq!((block("b").bpsi, block("b").count), (3, 2));
    assert_eq!((block("d").bpsi, block("d").count), (4, 1));
    assert_eq!((block("c").bpsi, block("c").count), (5, 1));

    // One appended subtype instance lands at the end of the ID space.
    let mut grown = back;
    grown.add("d").expect("add");
    grown.append().expect("append");
    let again =
        SkillState::read(from_source(src).expect("schema checks"), &path).expect("read");
    assert_eq!(again.pool("d").expect("pool").static_len(), 2);
    let blocks = &again.pool("d").expect("pool").blocks;
    assert_eq!(blocks.len(), 2);
    assert_eq!((blocks[1].bpsi, blocks[1].count), (6, 1));
    assert_eq!(again.all_in_type_order("a").expect("iterate").count(), 6);
}

#[test]
fn deleted_instances_vanish_and_references_null_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.sf");

    let mut state = SkillState::create(graph_ir());
    let keep = state.add("Node").expect("add");
    let gone = state.add("Node").expect("add");
    state
        .set(keep, "next", FieldValue::Ref(Some(gone)))
        .expect("set");
    state.delete(gone).expect("delete");
    state.write(&path).expect("write");

    let back = SkillState::read(graph_ir(), &path).expect("read");
    let nodes: Vec<ObjectRef> = back.all_in_type_order("node").expect("iterate").collect();
    assert_eq!(nodes.len(), 1);
    assert_eq!(back.get(nodes[0], "next"), Some(FieldValue::Ref(None)));
}

#[test]
fn constants_live_in_the_type_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("const.sf");
    let src = "A {\n\tconst v64 magic = 42;\n\ti32 x;\n}\n";

    let mut state = SkillState::create(from_source(src).expect("schema checks"));
    let a = state.add("A").expect("add");
    state.set(a, "x", FieldValue::I32(7)).expect("set");
    state.write(&path).expect("write");

    let back = SkillState::read(from_source(src).expect("schema checks"), &path).expect("read");
    let objs: Vec<ObjectRef> = back.all_in_type_order("a").expect("iterate").collect();
    assert_eq!(back.get(objs[0], "magic"), Some(FieldValue::I64(42)));
    assert_eq!(back.get(objs[0], "x"), Some(FieldValue::I32(7)));
}

#[test]
fn assigning_a_constant_fails() {
    let src = "A {\n\tconst v64 magic = 42;\n}\n";
    let mut state = SkillState::create(from_source(src).expect("schema checks"));
    let a = state.add("A").expect("add");
    assert!(state.set(a, "magic", FieldValue::V64(1)).is_err());
}

#[test]
fn unknown_fields_are_carried_through_rewrites() {
    let dir = tempfile::tempdir().expect("tempdir");
    let full = dir.path().join("full.sf");
    let copy = dir.path().join("copy.sf");
    let wide = "A {\n\ti32 x;\n\ti32 y;\n}\n";
    let narrow = "A {\n\ti32 x;\n}\n";

    let mut state = SkillState::create(from_source(wide).expect("schema checks"));
    let a = state.add("A").expect("add");
    state.set(a, "x", FieldValue::I32(1)).expect("set");
    state.set(a, "y", FieldValue::I32(2)).expect("set");
    state.write(&full).expect("write");

    // A binding generated for the narrow schema still sees y
    // reflectively and keeps it across a full rewrite.
    let mut narrow_state =
        SkillState::read(from_source(narrow).expect("schema checks"), &full).expect("read");
    let objs: Vec<ObjectRef> = narrow_state
        .all_in_type_order("a")
        .expect("iterate")
        .collect();
    assert_eq!(narrow_state.get(objs[0], "y"), Some(FieldValue::I32(2)));
    narrow_state
        .set(objs[0], "y", FieldValue::I32(3))
        .expect("reflective set");
    narrow_state.write(&copy).expect("rewrite");

    let wide_again =
        SkillState::read(from_source(wide).expect("schema checks"), &copy).expect("read");
    let objs: Vec<ObjectRef> = wide_again.all_in_type_order("a").expect("iterate").collect();
    assert_eq!(wide_again.get(objs[0], "x"), Some(FieldValue::I32(1)));
    assert_eq!(wide_again.get(objs[0], "y"), Some(FieldValue::I32(3)));
}

#[test]
fn unknown_types_are_carried_as_opaque_pools() {
    let dir = tempfile::tempdir().expect("tempdir");
    let full = dir.path().join("full.sf");
    let copy = dir.path().join("copy.sf");
    let both = "A {\n\ti32 x;\n}\nB {\n\tstring name;\n}\n";
    let only_a = "A {\n\ti32 x;\n}\n";

    let mut state = SkillState::create(from_source(both).expect("schema checks"));
    state.add("A").expect("add");
    let b = state.add("B").expect("add");
    state
        .set(b, "name", FieldValue::String(Some("kept".to_string())))
        .expect("set");
    state.write(&full).expect("write");

    let mut partial =
        SkillState::read(from_source(only_a).expect("schema checks"), &full).expect("read");
    let pool = partial.pool("b").expect("opaque pool");
    assert!(pool.decl.is_none());
    assert_eq!(pool.static_len(), 1);
    partial.write(&copy).expect("rewrite");

    let restored =
        SkillState::read(from_source(both).expect("schema checks"), &copy).expect("read");
    let objs: Vec<ObjectRef> = restored.all_in_type_order("b").expect("iterate").collect();
    assert_eq!(
        restored.get(objs[0], "name"),
        Some(FieldValue::String(Some("kept".to_string())))
    );
}

#[test]
fn every_ground_type_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("all.sf");
    let src = "All {
	i8 a;
	i16 b;
	i32 c;
	i64 d;
	v64 e;
	f32 f;
	f64 g;
	bool h;
	string s;
	i16[3] fixed;
	set<i32> uniq;
}
";
    let ir = from_source(src).expect("schema checks");
    let mut state = SkillState::create(ir);
    let o = state.add("All").expect("add");
    state.set(o, "a", FieldValue::I8(-8)).expect("set");
    state.set(o, "b", FieldValue::I16(-16)).expect("set");
    state.set(o, "c", FieldValue::I32(1 << 20)).expect("set");
    state.set(o, "d", FieldValue::I64(i64::MIN)).expect("set");
    state.set(o, "e", FieldValue::V64(1 << 40)).expect("set");
    state.set(o, "f", FieldValue::F32(1.5)).expect("set");
    state.set(o, "g", FieldValue::F64(-2.25)).expect("set");
    state.set(o, "h", FieldValue::Bool(true)).expect("set");
    state
        .set(o, "s", FieldValue::String(Some("σκιλλ".to_string())))
        .expect("set");
    state
        .set(
            o,
            "fixed",
            FieldValue::Array(vec![
                FieldValue::I16(1),
                FieldValue::I16(2),
                FieldValue::I16(3),
            ]),
        )
        .expect("set");
    state
        .set(
            o,
            "uniq",
            FieldValue::Set(vec![FieldValue::I32(4), FieldValue::I32(9)]),
        )
        .expect("set");
    state.write(&path).expect("write");

    let back = SkillState::read(from_source(src).expect("schema checks"), &path).expect("read");
    let objs: Vec<ObjectRef> = back.all_in_type_order("all").expect("iterate").collect();
    for field in ["a", "b", "c", "d", "e", "f", "g", "h", "s", "fixed", "uniq"] {
        assert_eq!(back.get(objs[0], field), state.get(o, field), "field {}", field);
    }
}

#[test]
fn new_in_type_order_sees_only_this_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("graph.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    state.write(&path).expect("write");

    let mut back = SkillState::read(graph_ir(), &path).expect("read");
    assert_eq!(back.new_in_type_order("message").expect("iterate").count(), 0);
    back.add("DatedMessage").expect("add");
    let fresh: Vec<ObjectRef> = back
        .new_in_type_order("message")
        .expect("iterate")
        .collect();
    assert_eq!(fresh.len(), 1);
    assert_eq!(back.pools()[fresh[0].pool].name, "datedmessage");
    assert_eq!(back.all_in_type_order("message").expect("iterate").count(), 3);
}

#[test]
fn failed_writes_leave_no_side_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("no/such/dir/out.sf");

    let mut state = SkillState::create(graph_ir());
    populate(&mut state);
    assert!(state.write(&missing).is_err());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .collect();
    assert!(leftovers.is_empty());
    assert!(!Path::new(&format!("{}.part", missing.display())).exists());
}
