//! End-to-end scenarios: parse, build, transform and round-trip classes
//! entirely in memory.
use classforge::{
    opcodes, AccessFlags, AnnotationSink, ByteVector, ClassReader, ClassSink, ClassWriter,
    Constant, Error, FieldSink, FrameItem, FrameKind, Label, MethodSink, ParseOptions, Result,
    TypePath, WriterFlags, V1_8,
};

/// Records the event stream as strings, plus the frames seen.
#[derive(Default)]
struct EventLog {
    events: Vec<String>,
    frames: Vec<(Vec<FrameItem>, Vec<FrameItem>)>,
}

impl ClassSink for EventLog {
    fn visit_class(
        &mut self,
        version: u32,
        access: AccessFlags,
        name: &str,
        _signature: Option<&str>,
        super_name: Option<&str>,
        interfaces: &[&str],
    ) -> Result<()> {
        self.events.push(format!(
            "class {name} v{} acc {:#06x} super {:?} if {}",
            version & 0xFFFF,
            access.wire_bits(),
            super_name,
            interfaces.len()
        ));
        Ok(())
    }

    fn visit_field(
        &mut self,
        _access: AccessFlags,
        name: &str,
        descriptor: &str,
        _signature: Option<&str>,
        _value: Option<&Constant>,
    ) -> Result<Option<&mut dyn FieldSink>> {
        self.events.push(format!("field {name} {descriptor}"));
        Ok(None)
    }

    fn visit_method(
        &mut self,
        _access: AccessFlags,
        name: &str,
        descriptor: &str,
        _signature: Option<&str>,
        _exceptions: &[&str],
    ) -> Result<Option<&mut dyn MethodSink>> {
        self.events.push(format!("method {name} {descriptor}"));
        Ok(Some(self))
    }

    fn visit_end(&mut self) -> Result<()> {
        self.events.push("end".to_owned());
        Ok(())
    }
}

impl MethodSink for EventLog {
    fn visit_insn(&mut self, opcode: u8) -> Result<()> {
        self.events.push(format!("insn {opcode}"));
        Ok(())
    }

    fn visit_var_insn(&mut self, opcode: u8, var: u16) -> Result<()> {
        self.events.push(format!("var {opcode} {var}"));
        Ok(())
    }

    fn visit_jump_insn(&mut self, opcode: u8, _label: Label) -> Result<()> {
        self.events.push(format!("jump {opcode}"));
        Ok(())
    }

    fn visit_ldc_insn(&mut self, constant: &Constant) -> Result<()> {
        self.events.push(format!("ldc {constant:?}"));
        Ok(())
    }

    fn visit_table_switch_insn(
        &mut self,
        min: i32,
        max: i32,
        _default: Label,
        labels: &[Label],
    ) -> Result<()> {
        self.events
            .push(format!("tableswitch {min}..{max} x{}", labels.len()));
        Ok(())
    }

    fn visit_frame(
        &mut self,
        _kind: FrameKind,
        locals: &[FrameItem],
        stack: &[FrameItem],
    ) -> Result<()> {
        self.frames.push((locals.to_vec(), stack.to_vec()));
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<()> {
        self.events.push(format!("maxs {max_stack} {max_locals}"));
        Ok(())
    }

    fn visit_annotation(
        &mut self,
        descriptor: &str,
        _visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        self.events.push(format!("annotation {descriptor}"));
        Ok(None)
    }

    fn visit_type_annotation(
        &mut self,
        _type_ref: u32,
        _type_path: Option<&TypePath>,
        descriptor: &str,
        _visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        self.events.push(format!("type-annotation {descriptor}"));
        Ok(None)
    }
}

fn parse(bytes: Vec<u8>, options: ParseOptions) -> EventLog {
    let reader = ClassReader::new(bytes).expect("readable class");
    let mut log = EventLog::default();
    reader.accept(&mut log, &[], options).expect("parse");
    log
}

/// The smallest possible class: one Utf8 and one Class entry, no super,
/// no members.
#[test]
fn parses_minimal_class() {
    let mut out = ByteVector::new();
    out.put_u32(0xCAFE_BABE);
    out.put_u16(0); // minor
    out.put_u16(52); // major
    out.put_u16(3); // constant pool count
    out.put_u8(1); // Utf8
    out.put_utf8("A").unwrap();
    out.put_u8(7); // Class
    out.put_u16(1);
    out.put_u16(0x0020); // access
    out.put_u16(2); // this
    out.put_u16(0); // super
    out.put_u16(0); // interfaces
    out.put_u16(0); // fields
    out.put_u16(0); // methods
    out.put_u16(0); // attributes

    let log = parse(out.into_vec(), ParseOptions::empty());
    assert_eq!(
        log.events,
        vec!["class A v52 acc 0x0020 super None if 0".to_owned(), "end".to_owned()]
    );
}

/// Builds class X from scratch, serializes, re-parses, and checks both
/// the member order and the emitted code bytes.
#[test]
fn builds_class_from_scratch() {
    let mut writer = ClassWriter::new(WriterFlags::COMPUTE_MAXS);
    writer
        .visit_class(
            V1_8,
            AccessFlags::PUBLIC | AccessFlags::SUPER,
            "X",
            None,
            Some("Y"),
            &[],
        )
        .unwrap();
    writer
        .visit_field(AccessFlags::PRIVATE, "n", "I", None, None)
        .unwrap();
    {
        let method = writer
            .visit_method(
                AccessFlags::PUBLIC | AccessFlags::STATIC,
                "m",
                "()I",
                None,
                &[],
            )
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        method.visit_insn(opcodes::ICONST_1).unwrap();
        method.visit_insn(opcodes::IRETURN).unwrap();
        method.visit_maxs(0, 0).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let bytes = writer.to_bytes().unwrap();

    let log = parse(bytes, ParseOptions::empty());
    assert_eq!(log.events[0], "class X v52 acc 0x0021 super Some(\"Y\") if 0");
    assert_eq!(log.events[1], "field n I");
    assert_eq!(log.events[2], "method m ()I");
    assert_eq!(log.events[3], format!("insn {}", opcodes::ICONST_1));
    assert_eq!(log.events[4], format!("insn {}", opcodes::IRETURN));
    // COMPUTE_MAXS on a 1.8 class recomputes through the frame engine.
    assert_eq!(log.events[5], "maxs 1 0");
}

/// Round-trip byte identity: reading the writer's own output into a
/// copy-pool writer with no adapter in between reproduces it exactly,
/// taking the per-method verbatim fast path.
#[test]
fn round_trip_is_byte_identical() {
    let mut writer = ClassWriter::new(WriterFlags::empty());
    writer
        .visit_class(
            V1_8,
            AccessFlags::PUBLIC | AccessFlags::SUPER,
            "X",
            None,
            Some("java/lang/Object"),
            &[],
        )
        .unwrap();
    {
        let method = writer
            .visit_method(
                AccessFlags::PUBLIC | AccessFlags::STATIC,
                "add",
                "(II)I",
                None,
                &["java/lang/Exception"],
            )
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        method.visit_var_insn(opcodes::ILOAD, 0).unwrap();
        method.visit_var_insn(opcodes::ILOAD, 1).unwrap();
        method.visit_insn(opcodes::IADD).unwrap();
        method.visit_insn(opcodes::IRETURN).unwrap();
        method.visit_maxs(2, 2).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let original = writer.to_bytes().unwrap();

    let reader = ClassReader::new(original.clone()).unwrap();
    let mut copier = ClassWriter::with_copy_pool(&reader, WriterFlags::empty()).unwrap();
    reader.accept(&mut copier, &[], ParseOptions::empty()).unwrap();
    let copied = copier.to_bytes().unwrap();
    assert_eq!(original, copied);
}

/// A +40000 byte forward goto overflows its 16-bit offset; the writer
/// expands it to goto_w in a second pass and the result re-parses with no
/// internal opcodes left.
#[test]
fn expands_overflowing_forward_goto() {
    let mut writer = ClassWriter::new(WriterFlags::empty());
    writer
        .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
        .unwrap();
    {
        let method = writer
            .visit_method(AccessFlags::STATIC, "far", "()V", None, &[])
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        let end = method.new_label();
        method.visit_jump_insn(opcodes::GOTO, end).unwrap();
        for _ in 0..40_000 {
            method.visit_insn(opcodes::NOP).unwrap();
        }
        method.visit_label(end).unwrap();
        method.visit_insn(opcodes::RETURN).unwrap();
        method.visit_maxs(0, 0).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let bytes = writer.to_bytes().unwrap();

    let log = parse(bytes, ParseOptions::empty());
    // goto_w parses back as a plain goto event.
    assert!(log.events.contains(&format!("jump {}", opcodes::GOTO)));
}

/// The conditional flavor: the expansion rewrites `ifeq far` into
/// `ifne +8; goto_w far` and inserts the stack map frame the new
/// fallthrough position needs.
#[test]
fn expands_overflowing_conditional_with_frames() {
    let mut writer = ClassWriter::new(WriterFlags::empty());
    writer
        .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
        .unwrap();
    {
        let method = writer
            .visit_method(AccessFlags::STATIC, "far", "(I)V", None, &[])
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        let end = method.new_label();
        method.visit_var_insn(opcodes::ILOAD, 0).unwrap();
        method.visit_jump_insn(opcodes::IFEQ, end).unwrap();
        for _ in 0..40_000 {
            method.visit_insn(opcodes::NOP).unwrap();
        }
        method.visit_label(end).unwrap();
        method
            .visit_frame(FrameKind::Same, &[], &[])
            .unwrap();
        method.visit_insn(opcodes::RETURN).unwrap();
        method.visit_maxs(1, 1).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let bytes = writer.to_bytes().unwrap();

    let log = parse(bytes, ParseOptions::EXPAND_FRAMES);
    assert!(log.events.contains(&format!("jump {}", opcodes::IFNE)));
    assert!(log.events.contains(&format!("jump {}", opcodes::GOTO)));
    // One frame at the inserted fallthrough, one at the original target.
    assert_eq!(log.frames.len(), 2);
}

/// Frame computation consults the common-supertype oracle; the merged
/// type lands in the serialized frame.
#[test]
fn frame_merge_uses_the_oracle() {
    let mut writer = ClassWriter::new(WriterFlags::COMPUTE_FRAMES);
    writer.set_common_superclass_fn(|a, b| {
        assert_ne!(a, b);
        "T".to_owned()
    });
    writer
        .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
        .unwrap();
    {
        let method = writer
            .visit_method(
                AccessFlags::STATIC,
                "pick",
                "(I)Ljava/lang/Object;",
                None,
                &[],
            )
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        let other = method.new_label();
        let done = method.new_label();
        method.visit_var_insn(opcodes::ILOAD, 0).unwrap();
        method.visit_jump_insn(opcodes::IFEQ, other).unwrap();
        method.visit_field_insn(opcodes::GETSTATIC, "X", "a", "LA;").unwrap();
        method.visit_jump_insn(opcodes::GOTO, done).unwrap();
        method.visit_label(other).unwrap();
        method.visit_field_insn(opcodes::GETSTATIC, "X", "b", "LB;").unwrap();
        method.visit_label(done).unwrap();
        method.visit_insn(opcodes::ARETURN).unwrap();
        method.visit_maxs(0, 0).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let bytes = writer.to_bytes().unwrap();

    let log = parse(bytes, ParseOptions::EXPAND_FRAMES);
    assert_eq!(log.frames.len(), 2);
    let merged = log
        .frames
        .iter()
        .any(|(_, stack)| stack.contains(&FrameItem::Object("T".to_owned())));
    assert!(merged, "expected a frame whose stack holds Object(T)");
}

/// A long constant round-trips through ldc2_w, and its second pool slot
/// stays unusable.
#[test]
fn long_constants_round_trip() {
    let mut writer = ClassWriter::new(WriterFlags::empty());
    writer
        .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
        .unwrap();
    {
        let method = writer
            .visit_method(AccessFlags::STATIC, "l", "()J", None, &[])
            .unwrap()
            .unwrap();
        method.visit_code().unwrap();
        method.visit_ldc_insn(&Constant::Long(1 << 40)).unwrap();
        method.visit_insn(opcodes::LRETURN).unwrap();
        method.visit_maxs(2, 0).unwrap();
        method.visit_end().unwrap();
    }
    writer.visit_end().unwrap();
    let bytes = writer.to_bytes().unwrap();

    let log = parse(bytes.clone(), ParseOptions::empty());
    assert!(log
        .events
        .contains(&format!("ldc {:?}", Constant::Long(1 << 40))));

    // And a second round trip stays byte-identical, so the unusable slot
    // after the long entry was preserved rather than compacted away.
    let reader = ClassReader::new(bytes.clone()).unwrap();
    let mut copier = ClassWriter::with_copy_pool(&reader, WriterFlags::empty()).unwrap();
    reader.accept(&mut copier, &[], ParseOptions::empty()).unwrap();
    assert_eq!(copier.to_bytes().unwrap(), bytes);
}

/// tableswitch padding depends on the opcode's own offset; shifting the
/// instruction must regenerate it.
#[test]
fn tableswitch_padding_regenerates() {
    let build = |leading_nops: usize| -> Vec<u8> {
        let mut writer = ClassWriter::new(WriterFlags::COMPUTE_FRAMES);
        writer
            .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
            .unwrap();
        {
            let method = writer
                .visit_method(AccessFlags::STATIC, "sw", "(I)V", None, &[])
                .unwrap()
                .unwrap();
            method.visit_code().unwrap();
            let default = method.new_label();
            let zero = method.new_label();
            let one = method.new_label();
            for _ in 0..leading_nops {
                method.visit_insn(opcodes::NOP).unwrap();
            }
            method.visit_var_insn(opcodes::ILOAD, 0).unwrap();
            method
                .visit_table_switch_insn(0, 1, default, &[zero, one])
                .unwrap();
            method.visit_label(zero).unwrap();
            method.visit_insn(opcodes::RETURN).unwrap();
            method.visit_label(one).unwrap();
            method.visit_insn(opcodes::RETURN).unwrap();
            method.visit_label(default).unwrap();
            method.visit_insn(opcodes::RETURN).unwrap();
            method.visit_maxs(0, 0).unwrap();
            method.visit_end().unwrap();
        }
        writer.visit_end().unwrap();
        writer.to_bytes().unwrap()
    };

    for leading_nops in 0..4 {
        let log = parse(build(leading_nops), ParseOptions::empty());
        assert!(
            log.events.contains(&"tableswitch 0..1 x2".to_owned()),
            "switch must survive a shift of {leading_nops}"
        );
    }
}

/// A label that is branched to but never placed fails at visit_end.
#[test]
fn unresolved_labels_are_rejected() {
    let mut writer = ClassWriter::new(WriterFlags::empty());
    writer
        .visit_class(V1_8, AccessFlags::SUPER, "X", None, Some("java/lang/Object"), &[])
        .unwrap();
    let method = writer
        .visit_method(AccessFlags::STATIC, "m", "()V", None, &[])
        .unwrap()
        .unwrap();
    method.visit_code().unwrap();
    let nowhere = method.new_label();
    method.visit_jump_insn(opcodes::GOTO, nowhere).unwrap();
    method.visit_maxs(0, 0).unwrap();
    let err = method.visit_end().unwrap_err();
    assert!(matches!(err, Error::InvalidInvocation(_)));
}

/// Unsupported versions fail fast; the check is opt-out.
#[test]
fn version_ceiling_is_enforced_but_optional() {
    let mut out = ByteVector::new();
    out.put_u32(0xCAFE_BABE);
    out.put_u16(0);
    out.put_u16(99);
    out.put_u16(1);
    out.put_u16(0x0020);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    out.put_u16(0);
    let bytes = out.into_vec();
    assert!(matches!(
        ClassReader::new(bytes.clone()),
        Err(Error::UnsupportedVersion(99))
    ));
    assert!(ClassReader::with_max_version(bytes, u16::MAX).is_ok());
}
