use super::*;
use crate::analyzer::DelimitedAnalyzer;
use crate::model::{ElementKind, ElementSpec, Fixup, OffsetBase};
use crate::transform::Hex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::io::Cursor;

fn build(spec: ElementSpec) -> Model {
    Model::build(spec).unwrap()
}

fn id(model: &Model, name: &str) -> ElementId {
    model.find(model.root(), name).unwrap()
}

fn bytes_of(model: &Model, name: &str) -> Vec<u8> {
    model[id(model, name)].value().unwrap().data.to_vec()
}

fn crack(model: &mut Model, data: &[u8]) -> (Cracker, BitStream, Result<()>) {
    let mut cracker = Cracker::new();
    let mut stream = BitStream::new(data);
    let root = model.root();
    let result = cracker.crack(model, root, &mut stream);
    (cracker, stream, result)
}

fn line_model() -> Model {
    build(
        ElementSpec::block("Line")
            .child(ElementSpec::blob("text"))
            .child(ElementSpec::blob("eol").token(&b"\r\n"[..])),
    )
}

#[test]
fn test_explicit_length_honored() {
    for data in [&b"abcd"[..], &b"\0\0\0\0"[..], &b"\xff\xfe\xfd\xfc\xfb"[..]] {
        let mut model = build(ElementSpec::blob("data").length_bytes(4));
        let (cracker, stream, result) = crack(&mut model, data);
        result.unwrap();

        let root = model.root();
        assert_eq!(cracker.size_of(root), Some(32));
        assert_eq!(stream.tell_bits(), 32);
        assert_eq!(&model[root].value().unwrap().data[..], &data[..4]);
    }
}

#[test]
fn test_explicit_length_past_end_is_insufficient_data() {
    let mut model = build(ElementSpec::blob("data").length_bytes(8));
    let (cracker, stream, result) = crack(&mut model, b"abcd");

    match result.unwrap_err() {
        Error::InsufficientData {
            needed, available, ..
        } => {
            assert_eq!(needed, 64);
            assert_eq!(available, 32);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cracker.positions().is_empty());
    assert_eq!(stream.tell_bits(), 0);
}

fn offset_model() -> Model {
    build(
        ElementSpec::block("M")
            .child(ElementSpec::blob("hdr").length_bytes(9))
            .child(ElementSpec::number("off", 8).offset_of("data", OffsetBase::FromEnd))
            .child(ElementSpec::blob("data").length_bytes(2)),
    )
}

#[test]
fn test_offset_relation_seeks_forward() {
    let mut model = offset_model();
    let (cracker, stream, result) = crack(&mut model, b"123456789\x02xxok");
    result.unwrap();

    let off = id(&model, "off");
    let data = id(&model, "data");
    assert_eq!(cracker.position(off).unwrap().end, Some(80));
    assert_eq!(cracker.position(data).unwrap().begin, 96);
    assert_eq!(bytes_of(&model, "data"), b"ok");
    assert_eq!(stream.tell_bits(), 112);
}

#[test]
fn test_offset_relation_beyond_data() {
    let mut model = offset_model();
    let (_, _, result) = crack(&mut model, b"123456789\x02x");
    assert!(result.unwrap_err().is_insufficient_data());
}

#[test]
fn test_offset_relation_backwards_fails() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("off", 8).offset_of("data", OffsetBase::Absolute))
            .child(ElementSpec::blob("data").length_bytes(1)),
    );
    let (_, _, result) = crack(&mut model, b"\x00abc");
    assert!(result.unwrap_err().is_cracking_failure());
}

#[derive(Default)]
struct SizeProbe {
    watch: Option<ElementId>,
    from: Option<ElementId>,
    at_entry: Option<Option<u64>>,
    at_from_exit: Option<Option<u64>>,
}

impl CrackObserver for SizeProbe {
    fn element_entered(&mut self, element: ElementId, _position: &Position, table: &PositionTable) {
        if Some(element) == self.watch {
            self.at_entry = Some(table.size_of(element));
        }
    }

    fn element_exited(&mut self, element: ElementId, _position: &Position, table: &PositionTable) {
        if Some(element) == self.from {
            self.at_from_exit = self.watch.map(|watch| table.size_of(watch));
        }
    }
}

#[test]
fn test_size_relation_resolves_late() {
    let mut model = build(
        ElementSpec::block("M")
            .child(
                ElementSpec::block("body")
                    .child(ElementSpec::number("a", 8))
                    .child(ElementSpec::number("b", 8)),
            )
            .child(ElementSpec::number("len", 8).size_of("body")),
    );
    let body = id(&model, "body");
    let len = id(&model, "len");
    let mut probe = SizeProbe {
        watch: Some(body),
        from: Some(len),
        ..SizeProbe::default()
    };

    let mut cracker = Cracker::new();
    let mut stream = BitStream::new(b"AB\x02");
    let root = model.root();
    cracker
        .crack_with(&mut model, root, &mut stream, &mut probe)
        .unwrap();

    assert_eq!(probe.at_entry, Some(None));
    assert_eq!(probe.at_from_exit, Some(Some(16)));
    assert_eq!(cracker.size_of(body), Some(16));
}

#[test]
fn test_size_relation_sizes_following_blob() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("len", 16).size_of("payload"))
            .child(ElementSpec::blob("payload"))
            .child(ElementSpec::blob("trailer")),
    );
    let (cracker, _, result) = crack(&mut model, b"\x00\x03abcrest");
    result.unwrap();

    assert_eq!(bytes_of(&model, "payload"), b"abc");
    assert_eq!(bytes_of(&model, "trailer"), b"rest");
    assert_eq!(cracker.size_of(id(&model, "payload")), Some(24));
}

#[test]
fn test_token_sizing() {
    let mut model = line_model();
    let (cracker, stream, result) = crack(&mut model, b"ABC\r\nDEF");
    result.unwrap();

    assert_eq!(cracker.size_of(id(&model, "text")), Some(24));
    assert_eq!(bytes_of(&model, "text"), b"ABC");
    assert_eq!(stream.tell_bits(), 40);
}

#[test]
fn test_token_search_grows_stream() {
    let mut model = line_model();
    let mut stream = BitStream::from_reader(Cursor::new(b"ABC\r\nDEF".to_vec()));
    let root = model.root();
    let mut cracker = Cracker::new();
    cracker.crack(&mut model, root, &mut stream).unwrap();

    assert_eq!(bytes_of(&model, "text"), b"ABC");
    assert_eq!(stream.tell_bits(), 40);
}

#[test]
fn test_missing_required_token_fails() {
    let mut model = line_model();
    let (cracker, _, result) = crack(&mut model, b"ABCDEF");
    assert!(result.unwrap_err().is_cracking_failure());
    assert!(cracker.positions().is_empty());
}

#[test]
fn test_two_unsized_leaves_are_unknowable() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::blob("a"))
            .child(ElementSpec::blob("b")),
    );
    let (_, _, result) = crack(&mut model, b"abcdef");
    assert!(result.unwrap_err().is_cracking_failure());
}

#[test]
fn test_last_unsized_takes_remainder() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("kind", 8))
            .child(ElementSpec::blob("body"))
            .child(ElementSpec::number("crc", 16)),
    );
    let (_, stream, result) = crack(&mut model, b"\x01hello\xbe\xef");
    result.unwrap();

    assert_eq!(bytes_of(&model, "body"), b"hello");
    assert_eq!(bytes_of(&model, "crc"), b"\xbe\xef");
    assert_eq!(stream.tell_bits(), 64);
}

#[test]
fn test_fixed_count_array() {
    let mut model = build(
        ElementSpec::array("items", ElementSpec::blob("item").length_bytes(8)).occurs(3, Some(3)),
    );
    let data: Vec<u8> = (0u8..30).collect();
    let (cracker, stream, result) = crack(&mut model, &data);
    result.unwrap();

    let root = model.root();
    assert_eq!(cracker.size_of(root), Some(192));
    assert_eq!(stream.tell_bits(), 192);

    let names: Vec<_> = model[root]
        .children()
        .iter()
        .map(|c| model[*c].name().to_string())
        .collect();
    assert_eq!(names, vec!["item_0", "item_1", "item_2"]);
    assert_eq!(bytes_of(&model, "item_2"), &data[16..24]);
}

#[test]
fn test_count_relation_array() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("n", 8).count_of("items"))
            .child(ElementSpec::array("items", ElementSpec::number("v", 8)))
            .child(ElementSpec::blob("tail").length_bytes(1)),
    );
    let (cracker, _, result) = crack(&mut model, b"\x02\x0a\x14\x63");
    result.unwrap();

    let items = id(&model, "items");
    assert_eq!(model[items].children().len(), 2);
    assert_eq!(cracker.size_of(items), Some(16));
    assert_eq!(model[id(&model, "v_1")].integer(), Some(20));
    assert_eq!(bytes_of(&model, "tail"), b"\x63");
}

#[test]
fn test_array_until_exhausted_with_tokens() {
    let mut model = build(
        ElementSpec::block("M").child(ElementSpec::array(
            "lines",
            ElementSpec::block("line")
                .child(ElementSpec::blob("text"))
                .child(ElementSpec::blob("eol").token(&b"\n"[..])),
        )),
    );
    let (_, stream, result) = crack(&mut model, b"ab\ncd\n");
    result.unwrap();

    let lines = id(&model, "lines");
    let texts: Vec<_> = model[lines]
        .children()
        .iter()
        .map(|line| {
            let text = model.child_named(*line, "text").unwrap();
            model[text].value().unwrap().data.to_vec()
        })
        .collect();
    assert_eq!(texts, vec![b"ab".to_vec(), b"cd".to_vec()]);
    assert_eq!(stream.tell_bits(), 48);
}

#[test]
fn test_array_below_min_occurs_fails() {
    let mut model = build(
        ElementSpec::array("items", ElementSpec::number("v", 8).constraint("value == 1"))
            .occurs(2, None),
    );
    let (_, _, result) = crack(&mut model, b"\x01\x02\x01");
    assert!(result.unwrap_err().is_cracking_failure());
}

#[test]
fn test_array_stops_at_failing_instance() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::array(
                "ones",
                ElementSpec::number("v", 8).constraint("value == 1"),
            ))
            .child(ElementSpec::blob("rest").length_bytes(2)),
    );
    let mut cracker = Cracker::new();
    let mut stream = BitStream::new(b"\x01\x01\x07\x08\x09");
    let mut log = EventLog::new();
    let root = model.root();
    cracker
        .crack_with(&mut model, root, &mut stream, &mut log)
        .unwrap();

    // The array spans everything but the trailing two bytes
    let ones = id(&model, "ones");
    assert_eq!(cracker.size_of(ones), Some(24));
    assert_eq!(model[ones].children().len(), 2);
    assert_eq!(log.failures(), 1);
    assert_eq!(bytes_of(&model, "rest"), b"\x08\x09");
    assert!(cracker
        .positions()
        .iter()
        .all(|(el, _)| model.is_attached(el)));
}

#[test]
fn test_array_respects_item_limit() {
    let mut model = build(ElementSpec::array("items", ElementSpec::number("v", 8)));
    let mut cracker = Cracker::with_config(CrackerConfig::new().max_array_items(4));
    let mut stream = BitStream::new([0u8; 10]);
    let root = model.root();
    cracker.crack(&mut model, root, &mut stream).unwrap();

    assert_eq!(model[root].children().len(), 4);
    assert_eq!(stream.tell_bits(), 32);
}

#[test]
fn test_placement_and_fixup_rewrite() {
    let mut model = build(
        ElementSpec::block("M")
            .child(
                ElementSpec::block("A")
                    .child(ElementSpec::blob("X").length_bytes(2).place_after("Y"))
                    .child(ElementSpec::blob("pad").length_bytes(1)),
            )
            .child(
                ElementSpec::block("B")
                    .child(ElementSpec::blob("Y").length_bytes(1))
                    .child(ElementSpec::blob("Z").length_bytes(1)),
            )
            .child(
                ElementSpec::blob("sum")
                    .length_bytes(1)
                    .fixup(Fixup::new("crc32").reference("ref", "X")),
            ),
    );
    let x = id(&model, "X");
    let y = id(&model, "Y");
    let a = id(&model, "A");
    let sum = id(&model, "sum");

    let mut cracker = Cracker::new();
    let mut stream = BitStream::new(b"xxpyzs");
    let mut log = EventLog::new();
    let root = model.root();
    cracker
        .crack_with(&mut model, root, &mut stream, &mut log)
        .unwrap();

    assert_eq!(model.next_sibling(y), Some(x));
    assert_eq!(model.full_name(x), "M.B.X");
    assert_eq!(
        model[sum].fixup().unwrap().references().collect::<Vec<_>>(),
        vec![("ref", "M.B.X")]
    );
    assert_eq!(
        log.events().last(),
        Some(&CrackEvent::Placed {
            element: x,
            old_name: "M.A.X".to_string(),
            new_name: "M.B.X".to_string(),
            old_container: Some(a),
        })
    );
    assert_eq!(&model.generate(root).unwrap()[..], b"pyxxzs");
}

#[test]
fn test_placement_target_missing() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::blob("X").length_bytes(1).place_before("nowhere"))
            .child(ElementSpec::blob("Y").length_bytes(1)),
    );
    let (_, _, result) = crack(&mut model, b"xy");
    assert!(result.unwrap_err().is_cracking_failure());
}

#[test]
fn test_rollback_in_choice() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("a", 8))
            .child(
                ElementSpec::choice("c")
                    .child(ElementSpec::number("E", 8).constraint("value == 7"))
                    .child(ElementSpec::number("F", 8)),
            ),
    );
    let e = id(&model, "E");
    let f = id(&model, "F");
    let c = id(&model, "c");

    let mut cracker = Cracker::new();
    let mut stream = BitStream::new([0x01u8, 0x05]);
    let mut log = EventLog::new();
    let root = model.root();
    cracker
        .crack_with(&mut model, root, &mut stream, &mut log)
        .unwrap();

    assert!(cracker.position(e).is_none());
    assert_eq!(cracker.position(f).unwrap().begin, 8);
    assert!(matches!(
        model[c].kind(),
        ElementKind::Choice { chosen: Some(chosen), .. } if *chosen == f
    ));
    assert!(log.events().iter().any(|event| matches!(
        event,
        CrackEvent::Failed { element, bit_position: 8, .. } if *element == e
    )));
    assert_eq!(log.failures(), 1);
    assert_eq!(stream.tell_bits(), 16);
}

#[test]
fn test_rollback_restores_stream() {
    let mut model = build(ElementSpec::number("E", 8).constraint("value == 7"));
    let (cracker, stream, result) = crack(&mut model, b"\x05");

    assert!(result.unwrap_err().is_cracking_failure());
    assert!(cracker.position(model.root()).is_none());
    assert_eq!(stream.tell_bits(), 0);
}

#[test]
fn test_transform_decodes_content() {
    let mut model = build(
        ElementSpec::block("M")
            .child(
                ElementSpec::blob("payload")
                    .length_bytes(4)
                    .transform(Arc::new(Hex)),
            )
            .child(ElementSpec::number("n", 8)),
    );
    let (_, _, result) = crack(&mut model, b"4142\x09");
    result.unwrap();

    assert_eq!(bytes_of(&model, "payload"), b"AB");
    assert_eq!(model[id(&model, "n")].integer(), Some(9));
    assert_eq!(&model.generate(model.root()).unwrap()[..], b"4142\x09");
}

#[test]
fn test_null_terminated_string() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::string("name").null_terminated())
            .child(ElementSpec::number("n", 8)),
    );
    let (cracker, _, result) = crack(&mut model, b"hi\0\x05");
    result.unwrap();

    let name = id(&model, "name");
    assert_eq!(bytes_of(&model, "name"), b"hi\0");
    assert_eq!(cracker.size_of(name), None);
    assert_eq!(cracker.position(name).unwrap().end, Some(24));
    assert_eq!(model[id(&model, "n")].integer(), Some(5));
}

#[test]
fn test_unterminated_string() {
    let mut model = build(ElementSpec::string("name").null_terminated());
    let (_, _, result) = crack(&mut model, b"hi");
    assert!(result.unwrap_err().is_insufficient_data());
}

#[test]
fn test_depth_limit() {
    let mut model = build(ElementSpec::block("a").child(
        ElementSpec::block("b").child(ElementSpec::block("c").child(ElementSpec::number("n", 8))),
    ));
    let mut cracker = Cracker::with_config(CrackerConfig::new().max_depth(2));
    let mut stream = BitStream::new([1u8]);
    let root = model.root();
    let err = cracker.crack(&mut model, root, &mut stream).unwrap_err();
    assert!(err.is_cracking_failure());
}

#[test]
fn test_scan_depth_limit() {
    // The blob's lookahead has to scan the whole nested tail
    let mut tail = ElementSpec::number("n", 8);
    for i in 0..20 {
        tail = ElementSpec::block(format!("b{i}")).child(tail);
    }
    let mut model = build(ElementSpec::block("M").child(ElementSpec::blob("data")).child(tail));
    let mut cracker = Cracker::with_config(CrackerConfig::new().max_depth(8));
    let mut stream = BitStream::new([0u8, 0, 1]);
    let root = model.root();
    let err = cracker.crack(&mut model, root, &mut stream).unwrap_err();
    assert!(err.is_cracking_failure());
    assert!(err.to_string().contains("nesting exceeds 8 levels"));
}

#[test]
fn test_huge_size_relation_is_insufficient_data() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("len", 64).size_of("payload"))
            .child(ElementSpec::blob("payload")),
    );
    let (_, _, result) = crack(&mut model, b"\x7f\xff\xff\xff\xff\xff\xff\xffabc");
    assert!(result.unwrap_err().is_insufficient_data());

    // Top bit set still reads as a length, not a negative number
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("len", 64).size_of("payload"))
            .child(ElementSpec::blob("payload")),
    );
    let (_, _, result) = crack(&mut model, b"\xff\xff\xff\xff\xff\xff\xff\xffabc");
    assert!(result.unwrap_err().is_insufficient_data());
}

#[test]
fn test_huge_offset_from_end_is_insufficient_data() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("off", 64).offset_of("data", OffsetBase::FromEnd))
            .child(ElementSpec::blob("data").length_bytes(1)),
    );
    let (_, _, result) = crack(&mut model, b"\x7f\xff\xff\xff\xff\xff\xff\xffabc");
    assert!(result.unwrap_err().is_insufficient_data());
}

#[test]
fn test_offset_relation_bounds_unsized_blob() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("off", 8).offset_of("data", OffsetBase::Absolute))
            .child(ElementSpec::blob("pad"))
            .child(ElementSpec::blob("data").length_bytes(2)),
    );
    let (cracker, _, result) = crack(&mut model, b"\x05abcdXY");
    result.unwrap();

    assert_eq!(bytes_of(&model, "pad"), b"abcd");
    assert_eq!(bytes_of(&model, "data"), b"XY");
    assert_eq!(cracker.positions().get(id(&model, "data")).unwrap().begin, 40);
}

#[test]
fn test_relative_to_offset_bounds_unsized_blob() {
    let mut model = build(
        ElementSpec::block("M")
            .child(ElementSpec::number("lead", 8))
            .child(
                ElementSpec::block("hdr")
                    .child(ElementSpec::blob("magic").length_bytes(1))
                    .child(
                        ElementSpec::number("off", 8)
                            .offset_of("data", OffsetBase::RelativeTo("hdr".into())),
                    ),
            )
            .child(ElementSpec::blob("pad"))
            .child(ElementSpec::blob("data").length_bytes(2)),
    );
    let (cracker, _, result) = crack(&mut model, b"\x00M\x06abcdXY");
    result.unwrap();

    assert_eq!(bytes_of(&model, "pad"), b"abcd");
    assert_eq!(bytes_of(&model, "data"), b"XY");
    assert_eq!(cracker.positions().get(id(&model, "data")).unwrap().begin, 56);
}

#[test]
fn test_analyzer_runs_after_crack() {
    let mut model = build(
        ElementSpec::block("M").child(
            ElementSpec::blob("query")
                .length_bytes(9)
                .analyzer(Arc::new(DelimitedAnalyzer::new(b'&'))),
        ),
    );
    let (_, _, result) = crack(&mut model, b"a=1&b=2&c");
    result.unwrap();

    let query = id(&model, "query");
    assert_eq!(model[query].children().len(), 3);
    assert_eq!(bytes_of(&model, "part_1"), b"b=2&");
}

proptest! {
    #[test]
    fn prop_crack_then_generate_is_identity(data in proptest::collection::vec(any::<u8>(), 7)) {
        let mut model = build(
            ElementSpec::block("M")
                .child(ElementSpec::number("kind", 8))
                .child(ElementSpec::number("len", 16).little_endian())
                .child(ElementSpec::blob("tag").length_bytes(3))
                .child(ElementSpec::number("hi", 4))
                .child(ElementSpec::number("lo", 4).signed()),
        );
        let (_, _, result) = crack(&mut model, &data);
        prop_assert!(result.is_ok());
        prop_assert_eq!(model.generate(model.root()).unwrap().to_vec(), data);
    }
}
