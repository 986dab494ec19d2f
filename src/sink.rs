//! The event-sink traits through which class files are streamed.
//!
//! A parser drives a [`ClassSink`]; a [`crate::ClassWriter`] implements it;
//! adapters sit in between by holding a delegate and forwarding the events
//! they do not care about. Event ordering is part of the contract: class
//! events arrive as
//! `visit_class (visit_source? visit_module? visit_nest_host?
//! visit_outer_class? (visit_annotation | visit_type_annotation |
//! visit_attribute)* visit_nest_member* visit_permitted_subclass*
//! visit_inner_class* visit_record_component* visit_field* visit_method*)
//! visit_end`, and method events as
//! `visit_parameter* (annotation events)* visit_code (visit_frame |
//! instruction | visit_label | visit_try_catch_block | debug event)*
//! visit_maxs visit_end`. Sinks may reject out-of-order events with
//! [`crate::Error::InvalidInvocation`].
use std::rc::Rc;

use crate::attribute::Attribute;
use crate::constant::{Constant, Handle};
use crate::error::Result;
use crate::flags::AccessFlags;
use crate::label::Label;

/// A step of a type annotation's path from the annotated outer type to
/// the annotated inner component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypePathStep {
    ArrayElement,
    InnerType,
    WildcardBound,
    TypeArgument(u8),
}

/// The location of an annotated type component inside a compound type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypePath {
    pub steps: Vec<TypePathStep>,
}

impl TypePath {
    pub(crate) fn read(cursor: &mut crate::buffer::ByteCursor<'_>) -> Result<Option<TypePath>> {
        let count = cursor.u8()?;
        if count == 0 {
            return Ok(None);
        }
        let mut steps = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let kind = cursor.u8()?;
            let argument = cursor.u8()?;
            steps.push(match kind {
                0 => TypePathStep::ArrayElement,
                1 => TypePathStep::InnerType,
                2 => TypePathStep::WildcardBound,
                3 => TypePathStep::TypeArgument(argument),
                _ => {
                    return Err(crate::error::Error::malformed(format!(
                        "invalid type path step kind {kind}"
                    )))
                }
            });
        }
        Ok(Some(TypePath { steps }))
    }

    pub(crate) fn put(path: Option<&TypePath>, out: &mut crate::buffer::ByteVector) {
        match path {
            None => out.put_u8(0),
            Some(path) => {
                out.put_u8(path.steps.len() as u8);
                for step in &path.steps {
                    let (kind, argument) = match step {
                        TypePathStep::ArrayElement => (0, 0),
                        TypePathStep::InnerType => (1, 0),
                        TypePathStep::WildcardBound => (2, 0),
                        TypePathStep::TypeArgument(index) => (3, *index),
                    };
                    out.put_u8(kind);
                    out.put_u8(argument);
                }
            }
        }
    }
}

/// A primitive, string or class annotation element value. Enum constants
/// and nested annotations go through their own sink methods.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// A class literal, as a type descriptor.
    Class(String),
}

/// One verification type in an expanded stack map frame. A `Long` or
/// `Double` item implicitly covers two slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameItem {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// An object type, as an internal name or array descriptor.
    Object(String),
    /// A value produced by the `new` instruction at the given label.
    Uninitialized(Label),
}

/// How a `visit_frame` event encodes its frame relative to the previous
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Expanded form: complete locals and stack.
    New,
    /// Compressed full frame.
    Full,
    /// Same locals as the previous frame plus 1..3 appended ones.
    Append,
    /// Previous locals with the last `n` (1..3) removed, empty stack.
    Chop(u8),
    /// Same locals, empty stack.
    Same,
    /// Same locals, exactly one stack item.
    SameLocals1,
    /// A frame at a position the writer itself introduced while expanding
    /// wide branches; content is recomputed by simulation.
    Insert,
}

/// Identity of a method inside a parsed class, offered to a sink for the
/// verbatim-copy fast path. Only a writer whose constant pool is a
/// verbatim copy of the same buffer may accept it.
pub struct MethodSource<'a> {
    pub(crate) buffer: &'a Rc<Vec<u8>>,
    pub(crate) access: AccessFlags,
    pub(crate) name: &'a str,
    pub(crate) descriptor: &'a str,
    pub(crate) signature: Option<&'a str>,
    pub(crate) exceptions: &'a [String],
    /// Byte range of the method's `attributes_count` and attributes.
    pub(crate) attributes_range: (usize, usize),
}

/// Receives the events of one annotation. Nested values arrive through
/// the returned child sinks; `visit_end` closes the annotation.
pub trait AnnotationSink {
    fn visit_value(&mut self, name: Option<&str>, value: &AnnotationValue) -> Result<()> {
        let _ = (name, value);
        Ok(())
    }

    fn visit_enum(&mut self, name: Option<&str>, descriptor: &str, value: &str) -> Result<()> {
        let _ = (name, descriptor, value);
        Ok(())
    }

    fn visit_annotation(
        &mut self,
        name: Option<&str>,
        descriptor: &str,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = (name, descriptor);
        Ok(None)
    }

    fn visit_array(&mut self, name: Option<&str>) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = name;
        Ok(None)
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives the events of one field.
pub trait FieldSink {
    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = (descriptor, visible);
        Ok(None)
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = (type_ref, type_path, descriptor, visible);
        Ok(None)
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        let _ = attribute;
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives the events of one record component.
pub trait RecordComponentSink {
    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = (descriptor, visible);
        Ok(None)
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let _ = (type_ref, type_path, descriptor, visible);
        Ok(None)
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        let _ = attribute;
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives the directives of a Module attribute.
pub trait ModuleSink {
    fn visit_main_class(&mut self, main_class: &str) -> Result<()> {
        let _ = main_class;
        Ok(())
    }

    fn visit_package(&mut self, package: &str) -> Result<()> {
        let _ = package;
        Ok(())
    }

    fn visit_require(
        &mut self,
        module: &str,
        access: AccessFlags,
        version: Option<&str>,
    ) -> Result<()> {
        let _ = (module, access, version);
        Ok(())
    }

    fn visit_export(&mut self, package: &str, access: AccessFlags, modules: &[&str]) -> Result<()> {
        let _ = (package, access, modules);
        Ok(())
    }

    fn visit_open(&mut self, package: &str, access: AccessFlags, modules: &[&str]) -> Result<()> {
        let _ = (package, access, modules);
        Ok(())
    }

    fn visit_use(&mut self, service: &str) -> Result<()> {
        let _ = service;
        Ok(())
    }

    fn visit_provide(&mut self, service: &str, providers: &[&str]) -> Result<()> {
        let _ = (service, providers);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives the events of one method.
#[allow(unused_variables)]
pub trait MethodSink {
    /// Mints a fresh label for use with the jump, try/catch and debug
    /// events of this method. Sinks that build code override this;
    /// pass-through sinks that only observe events may keep the default.
    fn new_label(&mut self) -> Label {
        Label(0)
    }

    /// Offers the method for a verbatim copy. Implementations return true
    /// to claim the raw bytes instead of receiving individual events.
    fn try_copy_method(&mut self, source: &MethodSource<'_>) -> Result<bool> {
        Ok(false)
    }

    fn visit_parameter(&mut self, name: Option<&str>, access: AccessFlags) -> Result<()> {
        Ok(())
    }

    fn visit_annotation_default(&mut self) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    /// Declares how many of the parameters in the descriptor can carry
    /// runtime (in)visible annotations.
    fn visit_annotable_parameter_count(&mut self, count: u8, visible: bool) -> Result<()> {
        Ok(())
    }

    fn visit_parameter_annotation(
        &mut self,
        parameter: u8,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        Ok(())
    }

    fn visit_code(&mut self) -> Result<()> {
        Ok(())
    }

    fn visit_frame(
        &mut self,
        kind: FrameKind,
        locals: &[FrameItem],
        stack: &[FrameItem],
    ) -> Result<()> {
        Ok(())
    }

    fn visit_insn(&mut self, opcode: u8) -> Result<()> {
        Ok(())
    }

    fn visit_int_insn(&mut self, opcode: u8, operand: i32) -> Result<()> {
        Ok(())
    }

    fn visit_var_insn(&mut self, opcode: u8, var: u16) -> Result<()> {
        Ok(())
    }

    fn visit_type_insn(&mut self, opcode: u8, type_name: &str) -> Result<()> {
        Ok(())
    }

    fn visit_field_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_method_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_invoke_dynamic_insn(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap: &Handle,
        arguments: &[Constant],
    ) -> Result<()> {
        Ok(())
    }

    fn visit_jump_insn(&mut self, opcode: u8, label: Label) -> Result<()> {
        Ok(())
    }

    fn visit_label(&mut self, label: Label) -> Result<()> {
        Ok(())
    }

    fn visit_ldc_insn(&mut self, constant: &Constant) -> Result<()> {
        Ok(())
    }

    fn visit_iinc_insn(&mut self, var: u16, increment: i16) -> Result<()> {
        Ok(())
    }

    fn visit_table_switch_insn(
        &mut self,
        min: i32,
        max: i32,
        default: Label,
        labels: &[Label],
    ) -> Result<()> {
        Ok(())
    }

    fn visit_lookup_switch_insn(
        &mut self,
        default: Label,
        keys: &[i32],
        labels: &[Label],
    ) -> Result<()> {
        Ok(())
    }

    fn visit_multi_a_new_array_insn(&mut self, descriptor: &str, dimensions: u8) -> Result<()> {
        Ok(())
    }

    fn visit_insn_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_try_catch_block(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_try_catch_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_local_variable(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        start: Label,
        end: Label,
        index: u16,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_local_variable_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        starts: &[Label],
        ends: &[Label],
        indices: &[u16],
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<()> {
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<()> {
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receives the events of one class file.
#[allow(unused_variables)]
pub trait ClassSink {
    fn visit_class(
        &mut self,
        version: u32,
        access: AccessFlags,
        name: &str,
        signature: Option<&str>,
        super_name: Option<&str>,
        interfaces: &[&str],
    ) -> Result<()>;

    fn visit_source(&mut self, source: Option<&str>, debug: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn visit_module(
        &mut self,
        name: &str,
        access: AccessFlags,
        version: Option<&str>,
    ) -> Result<Option<&mut dyn ModuleSink>> {
        Ok(None)
    }

    fn visit_nest_host(&mut self, host: &str) -> Result<()> {
        Ok(())
    }

    fn visit_outer_class(
        &mut self,
        owner: &str,
        method_name: Option<&str>,
        method_descriptor: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        Ok(None)
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        Ok(())
    }

    fn visit_nest_member(&mut self, member: &str) -> Result<()> {
        Ok(())
    }

    fn visit_permitted_subclass(&mut self, subclass: &str) -> Result<()> {
        Ok(())
    }

    fn visit_inner_class(
        &mut self,
        name: &str,
        outer_name: Option<&str>,
        inner_name: Option<&str>,
        access: AccessFlags,
    ) -> Result<()> {
        Ok(())
    }

    fn visit_record_component(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
    ) -> Result<Option<&mut dyn RecordComponentSink>> {
        Ok(None)
    }

    fn visit_field(
        &mut self,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        value: Option<&Constant>,
    ) -> Result<Option<&mut dyn FieldSink>> {
        Ok(None)
    }

    fn visit_method(
        &mut self,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<Option<&mut dyn MethodSink>> {
        Ok(None)
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}
