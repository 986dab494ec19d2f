//! Serialization of one method: instructions, labels, exception table,
//! debug tables, annotations and the Code attribute, with optional
//! max/frame computation.
use std::cell::RefCell;
use std::rc::Rc;

use crate::annotation::{AnnotationSet, AnnotationWriter, ParameterAnnotations};
use crate::attribute::Attribute;
use crate::buffer::ByteVector;
use crate::constant::{Constant, Handle};
use crate::error::{Error, Result};
use crate::flags::AccessFlags;
use crate::frame::{self, FrameComputation, HandlerRange, SerItem};
use crate::label::{ForwardRef, Label, LabelState};
use crate::opcodes::{self, InsnShape};
use crate::sink::{AnnotationSink, FrameItem, FrameKind, MethodSink, MethodSource, TypePath};
use crate::symbols::SymbolTable;
use crate::types;

/// How the writer computes max_stack/max_locals and stack map frames for
/// one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameStrategy {
    /// Everything is taken verbatim from the events.
    None,
    /// Recompute max_stack and max_locals; frames pass through.
    MaxsOnly,
    /// Compute frames only at positions the writer itself introduced
    /// while expanding wide branches.
    InsertedOnly,
    /// Recompute all frames and maxes from scratch.
    All,
}

struct TryCatch {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<String>,
}

/// Event sink building the `method_info` structure for one method.
pub struct MethodWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    strategy: FrameStrategy,
    class_name: String,
    class_major: u16,
    oracle: Rc<dyn Fn(&str, &str) -> String>,

    access: AccessFlags,
    name: String,
    name_index: u16,
    descriptor: String,
    descriptor_index: u16,
    signature: Option<String>,
    exception_names: Vec<String>,
    exception_indices: Vec<u16>,

    has_code: bool,
    maxs_done: bool,
    code: ByteVector,
    labels: Vec<LabelState>,
    has_synthetic: bool,
    last_insn_at: u32,
    try_catch: Vec<TryCatch>,
    /// Handler ranges recomputed by the frame engine (dead code pruned).
    computed_handlers: Option<Vec<HandlerRange>>,
    max_stack: u16,
    max_locals: u16,

    line_numbers: ByteVector,
    line_count: u16,
    local_vars: ByteVector,
    local_var_count: u16,
    local_var_types: ByteVector,
    local_var_type_count: u16,
    parameters: ByteVector,
    parameter_count: u8,
    has_parameters: bool,

    stack_map: ByteVector,
    frame_count: u16,
    encoder: Option<frame::FrameEncoder>,
    /// Last known frame, the simulation anchor for inserted frames.
    anchor: Option<(u32, Vec<SerItem>, Vec<SerItem>)>,

    annotations: AnnotationSet,
    invisible_annotations: AnnotationSet,
    type_annotations: AnnotationSet,
    invisible_type_annotations: AnnotationSet,
    code_type_annotations: AnnotationSet,
    code_invisible_type_annotations: AnnotationSet,
    parameter_annotations: ParameterAnnotations,
    invisible_parameter_annotations: ParameterAnnotations,
    annotation_default: Option<Rc<RefCell<ByteVector>>>,
    annotation_default_writer: Option<AnnotationWriter>,
    attributes: Vec<Attribute>,

    source: Option<Rc<Vec<u8>>>,
    verbatim: Option<(usize, usize)>,
}

impl MethodWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        symbols: Rc<RefCell<SymbolTable>>,
        strategy: FrameStrategy,
        class_name: String,
        class_major: u16,
        oracle: Rc<dyn Fn(&str, &str) -> String>,
        source: Option<Rc<Vec<u8>>>,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<MethodWriter> {
        let (name_index, descriptor_index, exception_indices) = {
            let mut table = symbols.borrow_mut();
            let name_index = table.utf8(name)?;
            let descriptor_index = table.utf8(descriptor)?;
            let mut indices = Vec::with_capacity(exceptions.len());
            for exception in exceptions {
                indices.push(table.class(exception)?);
            }
            (name_index, descriptor_index, indices)
        };
        Ok(MethodWriter {
            symbols,
            strategy,
            class_name,
            class_major,
            oracle,
            access,
            name: name.to_owned(),
            name_index,
            descriptor: descriptor.to_owned(),
            descriptor_index,
            signature: signature.map(str::to_owned),
            exception_names: exceptions.iter().map(|s| (*s).to_owned()).collect(),
            exception_indices,
            has_code: false,
            maxs_done: false,
            code: ByteVector::new(),
            labels: Vec::new(),
            has_synthetic: false,
            last_insn_at: 0,
            try_catch: Vec::new(),
            computed_handlers: None,
            max_stack: 0,
            max_locals: 0,
            line_numbers: ByteVector::new(),
            line_count: 0,
            local_vars: ByteVector::new(),
            local_var_count: 0,
            local_var_types: ByteVector::new(),
            local_var_type_count: 0,
            parameters: ByteVector::new(),
            parameter_count: 0,
            has_parameters: false,
            stack_map: ByteVector::new(),
            frame_count: 0,
            encoder: None,
            anchor: None,
            annotations: AnnotationSet::default(),
            invisible_annotations: AnnotationSet::default(),
            type_annotations: AnnotationSet::default(),
            invisible_type_annotations: AnnotationSet::default(),
            code_type_annotations: AnnotationSet::default(),
            code_invisible_type_annotations: AnnotationSet::default(),
            parameter_annotations: ParameterAnnotations::default(),
            invisible_parameter_annotations: ParameterAnnotations::default(),
            annotation_default: None,
            annotation_default_writer: None,
            attributes: Vec::new(),
            source,
            verbatim: None,
        })
    }

    pub(crate) fn has_synthetic_branches(&self) -> bool {
        self.has_synthetic
    }

    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn state_mut(&mut self, label: Label) -> &mut LabelState {
        let index = label.index();
        if self.labels.len() <= index {
            self.labels.resize_with(index + 1, LabelState::default);
        }
        &mut self.labels[index]
    }

    fn resolved_offset(&self, label: Label) -> Result<u32> {
        self.labels
            .get(label.index())
            .filter(|state| state.resolved)
            .map(|state| state.offset)
            .ok_or_else(|| Error::invalid("label used before being visited"))
    }

    fn require_code(&self) -> Result<()> {
        if !self.has_code {
            return Err(Error::invalid(
                "instruction events require a preceding visit_code",
            ));
        }
        if self.maxs_done {
            return Err(Error::invalid("instruction events after visit_maxs"));
        }
        Ok(())
    }

    /// Registers a 2-byte forward reference at the current position.
    fn short_forward_ref(&mut self, label: Label, insn_at: u32) {
        let patch_at = self.offset();
        self.code.put_u16(0);
        self.state_mut(label).forward_refs.push(ForwardRef {
            patch_at,
            insn_at,
            wide: false,
        });
    }

    /// Registers a 4-byte forward reference at the current position.
    fn wide_forward_ref(&mut self, label: Label, insn_at: u32) {
        let patch_at = self.offset();
        self.code.put_u32(0);
        self.state_mut(label).forward_refs.push(ForwardRef {
            patch_at,
            insn_at,
            wide: true,
        });
    }

    fn resolved_handlers(&self) -> Result<Vec<HandlerRange>> {
        self.try_catch
            .iter()
            .map(|entry| {
                Ok(HandlerRange {
                    start: self.resolved_offset(entry.start)?,
                    end: self.resolved_offset(entry.end)?,
                    handler: self.resolved_offset(entry.handler)?,
                    catch_type: entry.catch_type.clone(),
                })
            })
            .collect()
    }

    fn ensure_encoder(&mut self) -> Result<()> {
        if self.encoder.is_none() {
            let mut symbols = self.symbols.borrow_mut();
            let initial = frame::initial_locals(
                &mut symbols,
                &self.class_name,
                self.access,
                &self.name,
                &self.descriptor,
            )?;
            self.anchor = Some((0, initial.clone(), Vec::new()));
            self.encoder = Some(frame::FrameEncoder::new(initial));
        }
        Ok(())
    }

    /// Serializes the method_info into `out`, which is emitted before the
    /// constant pool; every pool reference is interned here.
    pub(crate) fn put(&mut self, out: &mut ByteVector) -> Result<()> {
        out.put_u16(self.access.wire_bits());
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);

        if let Some((start, end)) = self.verbatim {
            let source = self.source.as_ref().expect("verbatim implies a source");
            out.put_bytes(&source[start..end]);
            return Ok(());
        }

        let symbols = Rc::clone(&self.symbols);
        let mut symbols = symbols.borrow_mut();

        let use_synthetic_attr =
            self.class_major < 49 && self.access.contains(AccessFlags::SYNTHETIC);
        let deprecated = self.access.contains(AccessFlags::DEPRECATED);

        let mut count: u16 = 0;
        if self.has_code {
            count += 1;
        }
        if !self.exception_indices.is_empty() {
            count += 1;
        }
        if self.signature.is_some() {
            count += 1;
        }
        if deprecated {
            count += 1;
        }
        if use_synthetic_attr {
            count += 1;
        }
        if !self.annotations.is_empty() {
            count += 1;
        }
        if !self.invisible_annotations.is_empty() {
            count += 1;
        }
        if !self.parameter_annotations.is_empty() {
            count += 1;
        }
        if !self.invisible_parameter_annotations.is_empty() {
            count += 1;
        }
        if !self.type_annotations.is_empty() {
            count += 1;
        }
        if !self.invisible_type_annotations.is_empty() {
            count += 1;
        }
        if self.annotation_default.is_some() {
            count += 1;
        }
        if self.has_parameters {
            count += 1;
        }
        count += self.attributes.len() as u16;
        out.put_u16(count);

        if self.has_code {
            self.put_code(&mut symbols, out)?;
        }
        if !self.exception_indices.is_empty() {
            let name = symbols.utf8("Exceptions")?;
            out.put_u16(name);
            out.put_u32(2 + 2 * self.exception_indices.len() as u32);
            out.put_u16(self.exception_indices.len() as u16);
            for index in &self.exception_indices {
                out.put_u16(*index);
            }
        }
        if let Some(signature) = &self.signature {
            let name = symbols.utf8("Signature")?;
            let value = symbols.utf8(signature)?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(value);
        }
        if deprecated {
            let name = symbols.utf8("Deprecated")?;
            out.put_u16(name);
            out.put_u32(0);
        }
        if use_synthetic_attr {
            let name = symbols.utf8("Synthetic")?;
            out.put_u16(name);
            out.put_u32(0);
        }
        put_annotation_set(&mut symbols, out, "RuntimeVisibleAnnotations", &self.annotations)?;
        put_annotation_set(
            &mut symbols,
            out,
            "RuntimeInvisibleAnnotations",
            &self.invisible_annotations,
        )?;
        if !self.parameter_annotations.is_empty() {
            let name = symbols.utf8("RuntimeVisibleParameterAnnotations")?;
            out.put_u16(name);
            out.put_u32(self.parameter_annotations.payload_len() as u32);
            self.parameter_annotations.put(out);
        }
        if !self.invisible_parameter_annotations.is_empty() {
            let name = symbols.utf8("RuntimeInvisibleParameterAnnotations")?;
            out.put_u16(name);
            out.put_u32(self.invisible_parameter_annotations.payload_len() as u32);
            self.invisible_parameter_annotations.put(out);
        }
        put_annotation_set(
            &mut symbols,
            out,
            "RuntimeVisibleTypeAnnotations",
            &self.type_annotations,
        )?;
        put_annotation_set(
            &mut symbols,
            out,
            "RuntimeInvisibleTypeAnnotations",
            &self.invisible_type_annotations,
        )?;
        if let Some(default) = &self.annotation_default {
            let name = symbols.utf8("AnnotationDefault")?;
            out.put_u16(name);
            let body = default.borrow();
            out.put_u32(body.len() as u32);
            out.put_bytes(body.as_slice());
        }
        if self.has_parameters {
            let name = symbols.utf8("MethodParameters")?;
            out.put_u16(name);
            out.put_u32(1 + self.parameters.len() as u32);
            out.put_u8(self.parameter_count);
            out.put_bytes(self.parameters.as_slice());
        }
        for attribute in &self.attributes {
            let name = symbols.utf8(&attribute.name)?;
            out.put_u16(name);
            out.put_u32(attribute.payload.len() as u32);
            out.put_bytes(&attribute.payload);
        }
        Ok(())
    }

    fn put_code(&self, symbols: &mut SymbolTable, out: &mut ByteVector) -> Result<()> {
        if self.code.len() > 0xFFFF {
            return Err(Error::MethodTooLarge {
                name: self.name.clone(),
                size: self.code.len(),
            });
        }

        let handlers = match &self.computed_handlers {
            Some(handlers) => handlers.clone(),
            None => self.resolved_handlers()?,
        };
        let mut handler_entries = ByteVector::new();
        for handler in &handlers {
            handler_entries.put_u16(handler.start as u16);
            handler_entries.put_u16(handler.end as u16);
            handler_entries.put_u16(handler.handler as u16);
            match &handler.catch_type {
                Some(name) => handler_entries.put_u16(symbols.class(name)?),
                None => handler_entries.put_u16(0),
            }
        }

        // Code sub-attributes.
        let mut sub_count: u16 = 0;
        let mut sub_len: usize = 0;
        if self.line_count > 0 {
            sub_count += 1;
            sub_len += 6 + 2 + self.line_numbers.len();
        }
        if self.local_var_count > 0 {
            sub_count += 1;
            sub_len += 6 + 2 + self.local_vars.len();
        }
        if self.local_var_type_count > 0 {
            sub_count += 1;
            sub_len += 6 + 2 + self.local_var_types.len();
        }
        if self.frame_count > 0 {
            sub_count += 1;
            sub_len += 6 + 2 + self.stack_map.len();
        }
        if !self.code_type_annotations.is_empty() {
            sub_count += 1;
            sub_len += 6 + self.code_type_annotations.payload_len();
        }
        if !self.code_invisible_type_annotations.is_empty() {
            sub_count += 1;
            sub_len += 6 + self.code_invisible_type_annotations.payload_len();
        }

        let payload_len = 2 + 2 + 4 + self.code.len() + 2 + handler_entries.len() + 2 + sub_len;
        let name = symbols.utf8("Code")?;
        out.put_u16(name);
        out.put_u32(payload_len as u32);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.put_bytes(self.code.as_slice());
        out.put_u16(handlers.len() as u16);
        out.put_bytes(handler_entries.as_slice());
        out.put_u16(sub_count);
        if self.line_count > 0 {
            let name = symbols.utf8("LineNumberTable")?;
            out.put_u16(name);
            out.put_u32(2 + self.line_numbers.len() as u32);
            out.put_u16(self.line_count);
            out.put_bytes(self.line_numbers.as_slice());
        }
        if self.local_var_count > 0 {
            let name = symbols.utf8("LocalVariableTable")?;
            out.put_u16(name);
            out.put_u32(2 + self.local_vars.len() as u32);
            out.put_u16(self.local_var_count);
            out.put_bytes(self.local_vars.as_slice());
        }
        if self.local_var_type_count > 0 {
            let name = symbols.utf8("LocalVariableTypeTable")?;
            out.put_u16(name);
            out.put_u32(2 + self.local_var_types.len() as u32);
            out.put_u16(self.local_var_type_count);
            out.put_bytes(self.local_var_types.as_slice());
        }
        if self.frame_count > 0 {
            let name = symbols.utf8("StackMapTable")?;
            out.put_u16(name);
            out.put_u32(2 + self.stack_map.len() as u32);
            out.put_u16(self.frame_count);
            out.put_bytes(self.stack_map.as_slice());
        }
        if !self.code_type_annotations.is_empty() {
            let name = symbols.utf8("RuntimeVisibleTypeAnnotations")?;
            out.put_u16(name);
            out.put_u32(self.code_type_annotations.payload_len() as u32);
            self.code_type_annotations.put(out);
        }
        if !self.code_invisible_type_annotations.is_empty() {
            let name = symbols.utf8("RuntimeInvisibleTypeAnnotations")?;
            out.put_u16(name);
            out.put_u32(self.code_invisible_type_annotations.payload_len() as u32);
            self.code_invisible_type_annotations.put(out);
        }
        Ok(())
    }
}

fn put_annotation_set(
    symbols: &mut SymbolTable,
    out: &mut ByteVector,
    name: &str,
    set: &AnnotationSet,
) -> Result<()> {
    if set.is_empty() {
        return Ok(());
    }
    let name = symbols.utf8(name)?;
    out.put_u16(name);
    out.put_u32(set.payload_len() as u32);
    set.put(out);
    Ok(())
}

impl MethodSink for MethodWriter {
    fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelState::default());
        label
    }

    fn try_copy_method(&mut self, source: &MethodSource<'_>) -> Result<bool> {
        let matches_source = match &self.source {
            Some(own) => Rc::ptr_eq(own, source.buffer),
            None => false,
        };
        if !matches_source
            || self.strategy != FrameStrategy::None
            || self.has_code
            || !self.code.is_empty()
            || !self.attributes.is_empty()
            || !self.annotations.is_empty()
            || !self.invisible_annotations.is_empty()
        {
            return Ok(false);
        }
        if self.access != source.access
            || self.name != source.name
            || self.descriptor != source.descriptor
            || self.signature.as_deref() != source.signature
            || self.exception_names != source.exceptions
        {
            return Ok(false);
        }
        self.verbatim = Some(source.attributes_range);
        Ok(true)
    }

    fn visit_parameter(&mut self, name: Option<&str>, access: AccessFlags) -> Result<()> {
        self.has_parameters = true;
        let index = match name {
            Some(name) => self.symbols.borrow_mut().utf8(name)?,
            None => 0,
        };
        self.parameters.put_u16(index);
        self.parameters.put_u16(access.wire_bits());
        self.parameter_count += 1;
        Ok(())
    }

    fn visit_annotation_default(&mut self) -> Result<Option<&mut dyn AnnotationSink>> {
        let vec = Rc::new(RefCell::new(ByteVector::new()));
        self.annotation_default = Some(Rc::clone(&vec));
        self.annotation_default_writer =
            Some(AnnotationWriter::value_only(&self.symbols, &vec));
        Ok(Some(self.annotation_default_writer.as_mut().unwrap()))
    }

    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let set = if visible {
            &mut self.annotations
        } else {
            &mut self.invisible_annotations
        };
        Ok(Some(set.add_annotation(&self.symbols, descriptor)?))
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let set = if visible {
            &mut self.type_annotations
        } else {
            &mut self.invisible_type_annotations
        };
        Ok(Some(set.add_type_annotation(
            &self.symbols,
            type_ref,
            type_path,
            descriptor,
        )?))
    }

    fn visit_annotable_parameter_count(&mut self, count: u8, visible: bool) -> Result<()> {
        let annotations = if visible {
            &mut self.parameter_annotations
        } else {
            &mut self.invisible_parameter_annotations
        };
        annotations.explicit_count = Some(count);
        Ok(())
    }

    fn visit_parameter_annotation(
        &mut self,
        parameter: u8,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let annotations = if visible {
            &mut self.parameter_annotations
        } else {
            &mut self.invisible_parameter_annotations
        };
        let set = annotations.set_for(parameter);
        Ok(Some(set.add_annotation(&self.symbols, descriptor)?))
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_code(&mut self) -> Result<()> {
        if self.access.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE) {
            return Err(Error::invalid("abstract and native methods have no code"));
        }
        self.has_code = true;
        Ok(())
    }

    fn visit_frame(
        &mut self,
        kind: FrameKind,
        locals: &[FrameItem],
        stack: &[FrameItem],
    ) -> Result<()> {
        self.require_code()?;
        if self.strategy == FrameStrategy::All {
            return Ok(());
        }
        self.ensure_encoder()?;
        let offset = self.offset();
        let symbols = Rc::clone(&self.symbols);
        let mut symbols = symbols.borrow_mut();

        if kind == FrameKind::Insert && self.strategy == FrameStrategy::InsertedOnly {
            // Recompute the content by simulating forward from the last
            // known frame.
            let (anchor_offset, anchor_locals, anchor_stack) =
                self.anchor.clone().expect("encoder initializes the anchor");
            let mut sim =
                frame::frame_from_ser(&anchor_locals, &anchor_stack, &mut symbols)?;
            frame::simulate_forward(
                &mut sim,
                self.code.as_slice(),
                anchor_offset,
                offset,
                &mut symbols,
                &self.class_name,
            )?;
            let (locals, stack) = frame::ser_frame(&sim, &mut symbols, &self.labels)?;
            self.anchor = Some((offset, locals.clone(), stack.clone()));
            self.encoder
                .as_mut()
                .unwrap()
                .encode(offset, locals, stack, &mut self.stack_map)?;
            self.frame_count += 1;
            return Ok(());
        }

        // Reconstruct the absolute frame relative to the previous one.
        let previous = self.encoder.as_ref().unwrap().previous_locals().to_vec();
        let (new_locals, new_stack): (Vec<SerItem>, Vec<SerItem>) = match kind {
            FrameKind::New | FrameKind::Full | FrameKind::Insert => {
                let mut ls = Vec::with_capacity(locals.len());
                for item in locals {
                    ls.push(frame::ser_item_from_frame_item(item, &mut symbols, &self.labels)?);
                }
                let mut ss = Vec::with_capacity(stack.len());
                for item in stack {
                    ss.push(frame::ser_item_from_frame_item(item, &mut symbols, &self.labels)?);
                }
                (ls, ss)
            }
            FrameKind::Append => {
                if locals.is_empty() || locals.len() > 3 || !stack.is_empty() {
                    return Err(Error::invalid("append frames take 1..3 locals and no stack"));
                }
                let mut ls = previous;
                for item in locals {
                    ls.push(frame::ser_item_from_frame_item(item, &mut symbols, &self.labels)?);
                }
                (ls, Vec::new())
            }
            FrameKind::Chop(n) => {
                if !(1..=3).contains(&n) || usize::from(n) > previous.len() {
                    return Err(Error::invalid("chop frames remove 1..3 existing locals"));
                }
                let mut ls = previous;
                ls.truncate(ls.len() - usize::from(n));
                (ls, Vec::new())
            }
            FrameKind::Same => (previous, Vec::new()),
            FrameKind::SameLocals1 => {
                if stack.len() != 1 {
                    return Err(Error::invalid(
                        "same-locals-1-stack-item frames take exactly one stack item",
                    ));
                }
                let item = frame::ser_item_from_frame_item(&stack[0], &mut symbols, &self.labels)?;
                (previous, vec![item])
            }
        };
        self.anchor = Some((offset, new_locals.clone(), new_stack.clone()));
        self.encoder
            .as_mut()
            .unwrap()
            .encode(offset, new_locals, new_stack, &mut self.stack_map)?;
        self.frame_count += 1;
        Ok(())
    }

    fn visit_insn(&mut self, opcode: u8) -> Result<()> {
        self.require_code()?;
        if !matches!(opcodes::shape(opcode), InsnShape::Plain) {
            return Err(Error::invalid(format!(
                "opcode {opcode} carries operands and needs a specific visit method"
            )));
        }
        self.last_insn_at = self.offset();
        self.code.put_u8(opcode);
        Ok(())
    }

    fn visit_int_insn(&mut self, opcode: u8, operand: i32) -> Result<()> {
        self.require_code()?;
        self.last_insn_at = self.offset();
        match opcode {
            opcodes::BIPUSH => {
                let operand = i8::try_from(operand)
                    .map_err(|_| Error::invalid("bipush operand out of i8 range"))?;
                self.code.put_u8(opcode);
                self.code.put_i8(operand);
            }
            opcodes::SIPUSH => {
                let operand = i16::try_from(operand)
                    .map_err(|_| Error::invalid("sipush operand out of i16 range"))?;
                self.code.put_u8(opcode);
                self.code.put_i16(operand);
            }
            opcodes::NEWARRAY => {
                if !(i32::from(opcodes::T_BOOLEAN)..=i32::from(opcodes::T_LONG))
                    .contains(&operand)
                {
                    return Err(Error::invalid("invalid newarray type code"));
                }
                self.code.put_u8(opcode);
                self.code.put_u8(operand as u8);
            }
            _ => {
                return Err(Error::invalid(format!(
                    "opcode {opcode} is not an int-operand instruction"
                )))
            }
        }
        Ok(())
    }

    fn visit_var_insn(&mut self, opcode: u8, var: u16) -> Result<()> {
        self.require_code()?;
        if !matches!(opcodes::shape(opcode), InsnShape::VarByte) {
            return Err(Error::invalid(format!(
                "opcode {opcode} is not a variable instruction"
            )));
        }
        self.last_insn_at = self.offset();
        if var < 4 && opcode != opcodes::RET {
            let short = if opcode <= opcodes::ALOAD {
                26 + (opcode - opcodes::ILOAD) * 4 + var as u8
            } else {
                59 + (opcode - opcodes::ISTORE) * 4 + var as u8
            };
            self.code.put_u8(short);
        } else if var <= 0xFF {
            self.code.put_u8(opcode);
            self.code.put_u8(var as u8);
        } else {
            self.code.put_u8(opcodes::WIDE);
            self.code.put_u8(opcode);
            self.code.put_u16(var);
        }
        Ok(())
    }

    fn visit_type_insn(&mut self, opcode: u8, type_name: &str) -> Result<()> {
        self.require_code()?;
        if !matches!(opcodes::shape(opcode), InsnShape::TypeRef) {
            return Err(Error::invalid(format!(
                "opcode {opcode} is not a type instruction"
            )));
        }
        self.last_insn_at = self.offset();
        let index = self.symbols.borrow_mut().class(type_name)?;
        self.code.put_u8(opcode);
        self.code.put_u16(index);
        Ok(())
    }

    fn visit_field_insn(
        &mut self,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<()> {
        self.require_code()?;
        if !matches!(opcodes::shape(opcode), InsnShape::FieldRef) {
            return Err(Error::invalid(format!(
                "opcode {opcode} is not a field instruction"
            )));
        }
        self.last_insn_at = self.offset();
        let index = self.symbols.borrow_mut().field_ref(owner, name, descriptor)?;
        self.code.put_u8(opcode);
        self.code.put_u16(index);
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
        self.require_code()?;
        self.last_insn_at = self.offset();
        match opcode {
            opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => {
                let index = self
                    .symbols
                    .borrow_mut()
                    .method_ref(owner, name, descriptor, is_interface)?;
                self.code.put_u8(opcode);
                self.code.put_u16(index);
            }
            opcodes::INVOKEINTERFACE => {
                let index = self
                    .symbols
                    .borrow_mut()
                    .method_ref(owner, name, descriptor, true)?;
                let (arg_slots, _) = types::method_descriptor_sizes(descriptor)?;
                self.code.put_u8(opcode);
                self.code.put_u16(index);
                self.code.put_u8((arg_slots + 1) as u8);
                self.code.put_u8(0);
            }
            _ => {
                return Err(Error::invalid(format!(
                    "opcode {opcode} is not a method instruction"
                )))
            }
        }
        Ok(())
    }

    fn visit_invoke_dynamic_insn(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap: &Handle,
        arguments: &[Constant],
    ) -> Result<()> {
        self.require_code()?;
        self.last_insn_at = self.offset();
        let index = self
            .symbols
            .borrow_mut()
            .invoke_dynamic(name, descriptor, bootstrap, arguments)?;
        self.code.put_u8(opcodes::INVOKEDYNAMIC);
        self.code.put_u16(index);
        self.code.put_u16(0);
        Ok(())
    }

    fn visit_jump_insn(&mut self, opcode: u8, label: Label) -> Result<()> {
        self.require_code()?;
        if !matches!(
            opcodes::shape(opcode),
            InsnShape::Jump | InsnShape::JumpWide
        ) {
            return Err(Error::invalid(format!(
                "opcode {opcode} is not a jump instruction"
            )));
        }
        let insn_at = self.offset();
        self.last_insn_at = insn_at;
        self.state_mut(label).jump_target = true;

        let resolved = self
            .labels
            .get(label.index())
            .filter(|state| state.resolved)
            .map(|state| state.offset);
        match resolved {
            Some(target) => {
                let delta = i64::from(target) - i64::from(insn_at);
                if opcode == opcodes::GOTO_W || opcode == opcodes::JSR_W {
                    self.code.put_u8(opcode);
                    self.code.put_i32(delta as i32);
                } else if delta >= i64::from(i16::MIN) && delta <= i64::from(i16::MAX) {
                    self.code.put_u8(opcode);
                    self.code.put_i16(delta as i16);
                } else if opcode == opcodes::GOTO {
                    self.code.put_u8(opcodes::GOTO_W);
                    self.code.put_i32(delta as i32);
                } else if opcode == opcodes::JSR {
                    self.code.put_u8(opcodes::JSR_W);
                    self.code.put_i32(delta as i32);
                } else {
                    // Far backward conditional: branch around a goto_w.
                    self.code.put_u8(opcodes::opposite_branch(opcode));
                    self.code.put_i16(8);
                    let wide_at = self.offset();
                    if self.strategy == FrameStrategy::All {
                        self.code.put_u8(opcodes::GOTO_W);
                    } else {
                        // A frame is needed after the goto_w; mark it for
                        // the second pass.
                        self.code.put_u8(opcodes::WIDE_GOTO_W);
                        self.has_synthetic = true;
                    }
                    self.code
                        .put_i32((i64::from(target) - i64::from(wide_at)) as i32);
                }
            }
            None => {
                self.code.put_u8(opcode);
                if opcode == opcodes::GOTO_W || opcode == opcodes::JSR_W {
                    self.wide_forward_ref(label, insn_at);
                } else {
                    self.short_forward_ref(label, insn_at);
                }
            }
        }
        Ok(())
    }

    fn visit_label(&mut self, label: Label) -> Result<()> {
        self.require_code()?;
        let offset = self.offset();
        let state = self.state_mut(label);
        let lines = std::mem::take(&mut state.lines);
        let mut code = std::mem::take(&mut self.code);
        let rewrote = self.state_mut(label).resolve(&mut code, offset)?;
        self.code = code;
        if rewrote {
            self.has_synthetic = true;
        }
        for line in lines {
            self.line_numbers.put_u16(offset as u16);
            self.line_numbers.put_u16(line);
            self.line_count += 1;
        }
        Ok(())
    }

    fn visit_ldc_insn(&mut self, constant: &Constant) -> Result<()> {
        self.require_code()?;
        self.last_insn_at = self.offset();
        let index = self.symbols.borrow_mut().constant(constant)?;
        if constant.is_wide() {
            self.code.put_u8(opcodes::LDC2_W);
            self.code.put_u16(index);
        } else if index <= 0xFF {
            self.code.put_u8(opcodes::LDC);
            self.code.put_u8(index as u8);
        } else {
            self.code.put_u8(opcodes::LDC_W);
            self.code.put_u16(index);
        }
        Ok(())
    }

    fn visit_iinc_insn(&mut self, var: u16, increment: i16) -> Result<()> {
        self.require_code()?;
        self.last_insn_at = self.offset();
        if var <= 0xFF && (-128..=127).contains(&increment) {
            self.code.put_u8(opcodes::IINC);
            self.code.put_u8(var as u8);
            self.code.put_i8(increment as i8);
        } else {
            self.code.put_u8(opcodes::WIDE);
            self.code.put_u8(opcodes::IINC);
            self.code.put_u16(var);
            self.code.put_i16(increment);
        }
        Ok(())
    }

    fn visit_table_switch_insn(
        &mut self,
        min: i32,
        max: i32,
        default: Label,
        labels: &[Label],
    ) -> Result<()> {
        self.require_code()?;
        if max < min || labels.len() != (max - min + 1) as usize {
            return Err(Error::invalid(
                "tableswitch requires one target per value in min..=max",
            ));
        }
        let insn_at = self.offset();
        self.last_insn_at = insn_at;
        self.code.put_u8(opcodes::TABLESWITCH);
        while self.code.len() % 4 != 0 {
            self.code.put_u8(0);
        }
        self.switch_target(default, insn_at)?;
        self.code.put_i32(min);
        self.code.put_i32(max);
        for label in labels {
            self.switch_target(*label, insn_at)?;
        }
        Ok(())
    }

    fn visit_lookup_switch_insn(
        &mut self,
        default: Label,
        keys: &[i32],
        labels: &[Label],
    ) -> Result<()> {
        self.require_code()?;
        if keys.len() != labels.len() {
            return Err(Error::invalid("lookupswitch requires one target per key"));
        }
        let insn_at = self.offset();
        self.last_insn_at = insn_at;
        self.code.put_u8(opcodes::LOOKUPSWITCH);
        while self.code.len() % 4 != 0 {
            self.code.put_u8(0);
        }
        self.switch_target(default, insn_at)?;
        self.code.put_i32(keys.len() as i32);
        for (key, label) in keys.iter().zip(labels) {
            self.code.put_i32(*key);
            self.switch_target(*label, insn_at)?;
        }
        Ok(())
    }

    fn visit_multi_a_new_array_insn(&mut self, descriptor: &str, dimensions: u8) -> Result<()> {
        self.require_code()?;
        if dimensions == 0 {
            return Err(Error::invalid("multianewarray needs at least one dimension"));
        }
        self.last_insn_at = self.offset();
        let index = self.symbols.borrow_mut().class(descriptor)?;
        self.code.put_u8(opcodes::MULTIANEWARRAY);
        self.code.put_u16(index);
        self.code.put_u8(dimensions);
        Ok(())
    }

    fn visit_insn_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let offset = self.last_insn_at as u16;
        let symbols = Rc::clone(&self.symbols);
        let set = if visible {
            &mut self.code_type_annotations
        } else {
            &mut self.code_invisible_type_annotations
        };
        Ok(Some(set.add_offset_type_annotation(
            &symbols, type_ref, offset, type_path, descriptor,
        )?))
    }

    fn visit_try_catch_block(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> Result<()> {
        self.state_mut(start).jump_target = true;
        self.state_mut(end).jump_target = true;
        self.state_mut(handler).jump_target = true;
        self.try_catch.push(TryCatch {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_owned),
        });
        Ok(())
    }

    fn visit_try_catch_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let symbols = Rc::clone(&self.symbols);
        let set = if visible {
            &mut self.code_type_annotations
        } else {
            &mut self.code_invisible_type_annotations
        };
        Ok(Some(set.add_type_annotation(
            &symbols, type_ref, type_path, descriptor,
        )?))
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
        let start_offset = self.resolved_offset(start)?;
        let end_offset = self.resolved_offset(end)?;
        let mut symbols = self.symbols.borrow_mut();
        let name_index = symbols.utf8(name)?;
        let descriptor_index = symbols.utf8(descriptor)?;
        self.local_vars.put_u16(start_offset as u16);
        self.local_vars.put_u16((end_offset - start_offset) as u16);
        self.local_vars.put_u16(name_index);
        self.local_vars.put_u16(descriptor_index);
        self.local_vars.put_u16(index);
        self.local_var_count += 1;
        if let Some(signature) = signature {
            let signature_index = symbols.utf8(signature)?;
            self.local_var_types.put_u16(start_offset as u16);
            self.local_var_types
                .put_u16((end_offset - start_offset) as u16);
            self.local_var_types.put_u16(name_index);
            self.local_var_types.put_u16(signature_index);
            self.local_var_types.put_u16(index);
            self.local_var_type_count += 1;
        }
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
        if starts.len() != ends.len() || starts.len() != indices.len() {
            return Err(Error::invalid(
                "local variable annotation ranges must have matching lengths",
            ));
        }
        let mut ranges = Vec::with_capacity(starts.len());
        for ((start, end), index) in starts.iter().zip(ends).zip(indices) {
            let start_offset = self.resolved_offset(*start)?;
            let end_offset = self.resolved_offset(*end)?;
            ranges.push((
                start_offset as u16,
                (end_offset - start_offset) as u16,
                *index,
            ));
        }
        let symbols = Rc::clone(&self.symbols);
        let set = if visible {
            &mut self.code_type_annotations
        } else {
            &mut self.code_invisible_type_annotations
        };
        Ok(Some(set.add_local_var_type_annotation(
            &symbols, type_ref, &ranges, type_path, descriptor,
        )?))
    }

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<()> {
        match self.labels.get(start.index()) {
            Some(state) if state.resolved => {
                self.line_numbers.put_u16(state.offset as u16);
                self.line_numbers.put_u16(line);
                self.line_count += 1;
            }
            _ => {
                self.state_mut(start).lines.push(line);
            }
        }
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<()> {
        if !self.has_code {
            return Err(Error::invalid("visit_maxs requires a preceding visit_code"));
        }
        if self.maxs_done {
            return Err(Error::invalid("visit_maxs called twice"));
        }
        self.maxs_done = true;
        match self.strategy {
            FrameStrategy::None | FrameStrategy::InsertedOnly => {
                self.max_stack = max_stack;
                self.max_locals = max_locals;
            }
            FrameStrategy::MaxsOnly => {
                let handlers = self.resolved_handlers()?;
                let symbols = self.symbols.borrow();
                let (stack, locals) = frame::compute_maxs(
                    self.code.as_slice(),
                    &symbols,
                    self.access,
                    &self.descriptor,
                    &handlers,
                )?;
                self.max_stack = stack;
                self.max_locals = locals;
            }
            FrameStrategy::All => {
                let handlers = self.resolved_handlers()?;
                let symbols = Rc::clone(&self.symbols);
                let mut symbols = symbols.borrow_mut();
                let oracle = Rc::clone(&self.oracle);
                let result = frame::compute_all_frames(
                    FrameComputation {
                        symbols: &mut symbols,
                        oracle: &move |a: &str, b: &str| (*oracle)(a, b),
                        class_name: &self.class_name,
                        method_access: self.access,
                        method_name: &self.name,
                        descriptor: &self.descriptor,
                        labels: &self.labels,
                        handlers: &handlers,
                    },
                    &mut self.code,
                )?;
                self.max_stack = result.max_stack;
                self.max_locals = result.max_locals;
                self.frame_count = result.frame_count;
                self.stack_map = result.stack_map;
                self.computed_handlers = Some(result.handlers);
            }
        }
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        for (index, state) in self.labels.iter().enumerate() {
            if !state.resolved && (!state.forward_refs.is_empty() || state.jump_target) {
                return Err(Error::invalid(format!(
                    "label {index} is referenced but never visited"
                )));
            }
        }
        if self.has_code && !self.maxs_done {
            return Err(Error::invalid("visit_end before visit_maxs"));
        }
        Ok(())
    }
}

impl MethodWriter {
    /// Emits a switch target: a resolved 32-bit delta or a wide forward
    /// reference.
    fn switch_target(&mut self, label: Label, insn_at: u32) -> Result<()> {
        self.state_mut(label).jump_target = true;
        let resolved = self
            .labels
            .get(label.index())
            .filter(|state| state.resolved)
            .map(|state| state.offset);
        match resolved {
            Some(target) => {
                let delta = i64::from(target) - i64::from(insn_at);
                self.code.put_i32(delta as i32);
            }
            None => self.wide_forward_ref(label, insn_at),
        }
        Ok(())
    }
}
