//! Stack map frame computation: basic block discovery, abstract
//! interpretation over the verification type lattice, worklist merging and
//! serialization in the wire-compressed form.
use std::collections::{BTreeSet, HashMap, VecDeque};

use log::trace;

use crate::buffer::{ByteCursor, ByteVector};
use crate::error::{Error, Result};
use crate::flags::AccessFlags;
use crate::label::LabelState;
use crate::opcodes::{self, InsnShape};
use crate::sink::FrameItem;
use crate::symbols::{Entry, SymbolTable, TypeEntry};
use crate::types;

/// One verification type. Reference and uninitialized types point into
/// the symbol table's type table so merges memoize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbstractType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(u32),
    Uninitialized(u32),
}

impl AbstractType {
    fn slots(self) -> u32 {
        match self {
            AbstractType::Long | AbstractType::Double => 2,
            _ => 1,
        }
    }
}

/// Locals and operand stack at one point. Locals are slot-expanded: a
/// long or double occupies its own slot plus a `Top` marker in the next
/// one. Stack entries each represent a whole value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Frame {
    pub locals: Vec<AbstractType>,
    pub stack: Vec<AbstractType>,
}

impl Frame {
    fn stack_slots(&self) -> u32 {
        self.stack.iter().map(|t| t.slots()).sum()
    }

    fn push(&mut self, t: AbstractType) {
        self.stack.push(t);
    }

    fn pop(&mut self) -> Result<AbstractType> {
        self.stack
            .pop()
            .ok_or_else(|| Error::invalid("operand stack underflow during frame computation"))
    }

    /// Pops values totaling exactly `slots` stack slots, top first.
    fn pop_slots(&mut self, mut slots: u32) -> Result<Vec<AbstractType>> {
        let mut values = Vec::new();
        while slots > 0 {
            let value = self.pop()?;
            if value.slots() > slots {
                return Err(Error::invalid("split of a two-slot stack value"));
            }
            slots -= value.slots();
            values.push(value);
        }
        values.reverse();
        Ok(values)
    }

    fn local(&self, index: u16) -> AbstractType {
        self.locals
            .get(usize::from(index))
            .copied()
            .unwrap_or(AbstractType::Top)
    }

    fn set_local(&mut self, index: u16, t: AbstractType) {
        let index = usize::from(index);
        let needed = index + t.slots() as usize;
        if self.locals.len() < needed {
            self.locals.resize(needed, AbstractType::Top);
        }
        // Overwriting the second half of a wide value invalidates it.
        if index > 0 {
            if let AbstractType::Long | AbstractType::Double = self.locals[index - 1] {
                self.locals[index - 1] = AbstractType::Top;
            }
        }
        self.locals[index] = t;
        if t.slots() == 2 {
            self.locals[index + 1] = AbstractType::Top;
        } else if index + 1 < self.locals.len() {
            // A one-slot store over the first half of a wide value also
            // leaves the second half unusable; it already reads as Top.
        }
    }

    /// Replaces every occurrence of an uninitialized type with the class
    /// it was initialized to.
    fn initialize(&mut self, from: AbstractType, to: AbstractType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *slot == from {
                *slot = to;
            }
        }
    }
}

/// An exception handler range with resolved offsets.
#[derive(Debug, Clone)]
pub(crate) struct HandlerRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub catch_type: Option<String>,
}

/// Inputs of a full frame computation.
pub(crate) struct FrameComputation<'a> {
    pub symbols: &'a mut SymbolTable,
    pub oracle: &'a dyn Fn(&str, &str) -> String,
    pub class_name: &'a str,
    pub method_access: AccessFlags,
    pub method_name: &'a str,
    pub descriptor: &'a str,
    pub labels: &'a [LabelState],
    pub handlers: &'a [HandlerRange],
}

/// Outputs of a full frame computation.
#[derive(Debug)]
pub(crate) struct FrameResult {
    pub max_stack: u16,
    pub max_locals: u16,
    pub frame_count: u16,
    pub stack_map: ByteVector,
    /// Handler ranges with dead code removed (possibly split).
    pub handlers: Vec<HandlerRange>,
}

/// A serialization-ready verification type: pool and offset references
/// already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SerItem {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl SerItem {
    fn put(&self, out: &mut ByteVector) {
        match self {
            SerItem::Top => out.put_u8(opcodes::ITEM_TOP),
            SerItem::Integer => out.put_u8(opcodes::ITEM_INTEGER),
            SerItem::Float => out.put_u8(opcodes::ITEM_FLOAT),
            SerItem::Double => out.put_u8(opcodes::ITEM_DOUBLE),
            SerItem::Long => out.put_u8(opcodes::ITEM_LONG),
            SerItem::Null => out.put_u8(opcodes::ITEM_NULL),
            SerItem::UninitializedThis => out.put_u8(opcodes::ITEM_UNINITIALIZED_THIS),
            SerItem::Object(index) => {
                out.put_u8(opcodes::ITEM_OBJECT);
                out.put_u16(*index);
            }
            SerItem::Uninitialized(offset) => {
                out.put_u8(opcodes::ITEM_UNINITIALIZED);
                out.put_u16(*offset);
            }
        }
    }
}

/// Converts an engine type to its wire form.
fn ser_item(
    t: AbstractType,
    symbols: &mut SymbolTable,
    labels: &[LabelState],
) -> Result<SerItem> {
    Ok(match t {
        AbstractType::Top => SerItem::Top,
        AbstractType::Integer => SerItem::Integer,
        AbstractType::Float => SerItem::Float,
        AbstractType::Long => SerItem::Long,
        AbstractType::Double => SerItem::Double,
        AbstractType::Null => SerItem::Null,
        AbstractType::UninitializedThis => SerItem::UninitializedThis,
        AbstractType::Object(index) => {
            let name = symbols.type_entry(index).name().to_owned();
            SerItem::Object(symbols.class(&name)?)
        }
        AbstractType::Uninitialized(index) => match symbols.type_entry(index) {
            TypeEntry::Uninitialized { offset, .. } => SerItem::Uninitialized(*offset as u16),
            TypeEntry::ForwardUninitialized { label, .. } => {
                let state = labels
                    .get(label.index())
                    .filter(|state| state.resolved)
                    .ok_or_else(|| Error::invalid("unresolved label in frame type"))?;
                SerItem::Uninitialized(state.offset as u16)
            }
            TypeEntry::Object(_) => {
                return Err(Error::invalid("object type used as uninitialized"))
            }
        },
    })
}

/// Converts a sink-level frame item to its wire form. Uninitialized
/// items go through the type table so the `new` site is tracked as a
/// label until serialization resolves it.
pub(crate) fn ser_item_from_frame_item(
    item: &FrameItem,
    symbols: &mut SymbolTable,
    labels: &[LabelState],
) -> Result<SerItem> {
    Ok(match item {
        FrameItem::Top => SerItem::Top,
        FrameItem::Integer => SerItem::Integer,
        FrameItem::Float => SerItem::Float,
        FrameItem::Double => SerItem::Double,
        FrameItem::Long => SerItem::Long,
        FrameItem::Null => SerItem::Null,
        FrameItem::UninitializedThis => SerItem::UninitializedThis,
        FrameItem::Object(name) => SerItem::Object(symbols.class(name)?),
        FrameItem::Uninitialized(label) => {
            let index = symbols.add_forward_uninitialized_type("", *label);
            return ser_item(AbstractType::Uninitialized(index), symbols, labels);
        }
    })
}

/// Compresses slot-expanded locals into wire items, trimming trailing
/// `Top`s (chop frames reintroduce them when needed).
fn compress_locals(
    locals: &[AbstractType],
    symbols: &mut SymbolTable,
    labels: &[LabelState],
) -> Result<Vec<SerItem>> {
    let mut trimmed = locals;
    while let Some(AbstractType::Top) = trimmed.last() {
        // Keep the implicit Top of a trailing wide value.
        if trimmed.len() >= 2 {
            if let AbstractType::Long | AbstractType::Double = trimmed[trimmed.len() - 2] {
                break;
            }
        }
        trimmed = &trimmed[..trimmed.len() - 1];
    }
    let mut items = Vec::new();
    let mut i = 0;
    while i < trimmed.len() {
        let t = trimmed[i];
        items.push(ser_item(t, symbols, labels)?);
        i += t.slots() as usize;
    }
    Ok(items)
}

/// Compresses an engine frame into serialization-ready item lists.
pub(crate) fn ser_frame(
    frame: &Frame,
    symbols: &mut SymbolTable,
    labels: &[LabelState],
) -> Result<(Vec<SerItem>, Vec<SerItem>)> {
    let locals = compress_locals(&frame.locals, symbols, labels)?;
    let mut stack = Vec::with_capacity(frame.stack.len());
    for t in &frame.stack {
        stack.push(ser_item(*t, symbols, labels)?);
    }
    Ok((locals, stack))
}

/// Rebuilds an engine type from its wire form, for simulation anchors.
pub(crate) fn abstract_from_ser(item: &SerItem, symbols: &mut SymbolTable) -> Result<AbstractType> {
    Ok(match item {
        SerItem::Top => AbstractType::Top,
        SerItem::Integer => AbstractType::Integer,
        SerItem::Float => AbstractType::Float,
        SerItem::Double => AbstractType::Double,
        SerItem::Long => AbstractType::Long,
        SerItem::Null => AbstractType::Null,
        SerItem::UninitializedThis => AbstractType::UninitializedThis,
        SerItem::Object(index) => {
            let name = symbols.class_name_at(*index)?.to_owned();
            AbstractType::Object(symbols.add_object_type(&name))
        }
        SerItem::Uninitialized(offset) => {
            AbstractType::Uninitialized(symbols.add_uninitialized_type("", u32::from(*offset)))
        }
    })
}

/// Slot-expands wire item lists into an engine frame.
pub(crate) fn frame_from_ser(
    locals: &[SerItem],
    stack: &[SerItem],
    symbols: &mut SymbolTable,
) -> Result<Frame> {
    let mut frame = Frame::default();
    for item in locals {
        let t = abstract_from_ser(item, symbols)?;
        frame.locals.push(t);
        if t.slots() == 2 {
            frame.locals.push(AbstractType::Top);
        }
    }
    for item in stack {
        frame.stack.push(abstract_from_ser(item, symbols)?);
    }
    Ok(frame)
}

/// The compressed locals of the implicit frame at offset 0.
pub(crate) fn initial_locals(
    symbols: &mut SymbolTable,
    class_name: &str,
    method_access: AccessFlags,
    method_name: &str,
    descriptor: &str,
) -> Result<Vec<SerItem>> {
    let frame = initial_frame(symbols, class_name, method_access, method_name, descriptor)?;
    compress_locals(&frame.locals, symbols, &[])
}

/// Encodes frames with the compact frame types and delta offsets.
pub(crate) struct FrameEncoder {
    prev_locals: Vec<SerItem>,
    prev_offset: i64,
}

impl FrameEncoder {
    /// `initial_locals` is the implicit frame derived from the method
    /// descriptor; it never appears in the table but anchors compression.
    pub(crate) fn new(initial_locals: Vec<SerItem>) -> Self {
        FrameEncoder {
            prev_locals: initial_locals,
            prev_offset: -1,
        }
    }

    pub(crate) fn previous_locals(&self) -> &[SerItem] {
        &self.prev_locals
    }

    pub(crate) fn encode(
        &mut self,
        offset: u32,
        locals: Vec<SerItem>,
        stack: Vec<SerItem>,
        out: &mut ByteVector,
    ) -> Result<()> {
        let delta = i64::from(offset) - self.prev_offset - 1;
        if delta < 0 {
            return Err(Error::invalid(
                "stack map frames must be at increasing bytecode offsets",
            ));
        }
        let delta = delta as u16;
        let same_locals = locals == self.prev_locals;
        if same_locals && stack.is_empty() {
            if delta < 64 {
                out.put_u8(delta as u8);
            } else {
                out.put_u8(251);
                out.put_u16(delta);
            }
        } else if same_locals && stack.len() == 1 {
            if delta < 64 {
                out.put_u8(64 + delta as u8);
            } else {
                out.put_u8(247);
                out.put_u16(delta);
            }
            stack[0].put(out);
        } else if stack.is_empty()
            && locals.len() < self.prev_locals.len()
            && self.prev_locals.len() - locals.len() <= 3
            && locals == self.prev_locals[..locals.len()]
        {
            let chopped = (self.prev_locals.len() - locals.len()) as u8;
            out.put_u8(251 - chopped);
            out.put_u16(delta);
        } else if stack.is_empty()
            && locals.len() > self.prev_locals.len()
            && locals.len() - self.prev_locals.len() <= 3
            && locals[..self.prev_locals.len()] == self.prev_locals
        {
            let appended = locals.len() - self.prev_locals.len();
            out.put_u8(251 + appended as u8);
            out.put_u16(delta);
            for item in &locals[self.prev_locals.len()..] {
                item.put(out);
            }
        } else {
            out.put_u8(255);
            out.put_u16(delta);
            out.put_u16(locals.len() as u16);
            for item in &locals {
                item.put(out);
            }
            out.put_u16(stack.len() as u16);
            for item in &stack {
                item.put(out);
            }
        }
        self.prev_locals = locals;
        self.prev_offset = i64::from(offset);
        Ok(())
    }
}

/// Length in bytes of the instruction at `at`.
pub(crate) fn insn_length(code: &[u8], at: usize) -> Result<usize> {
    let opcode = *code
        .get(at)
        .ok_or_else(|| Error::malformed("bytecode offset out of range"))?;
    Ok(match opcodes::shape(opcode) {
        InsnShape::Plain | InsnShape::ImplicitVar => 1,
        InsnShape::IntByte | InsnShape::VarByte | InsnShape::Ldc => 2,
        InsnShape::IntShort
        | InsnShape::LdcWide
        | InsnShape::Iinc
        | InsnShape::Jump
        | InsnShape::TypeRef
        | InsnShape::FieldRef
        | InsnShape::MethodRef
        | InsnShape::SyntheticJump => 3,
        InsnShape::MultiANewArray => 4,
        InsnShape::InterfaceMethodRef
        | InsnShape::InvokeDynamicRef
        | InsnShape::JumpWide
        | InsnShape::SyntheticJumpWide => 5,
        InsnShape::WidePrefix => {
            let sub = *code
                .get(at + 1)
                .ok_or_else(|| Error::malformed("truncated wide instruction"))?;
            if sub == opcodes::IINC {
                6
            } else {
                4
            }
        }
        InsnShape::TableSwitch => {
            let pad = (4 - (at + 1) % 4) % 4;
            let mut cursor = ByteCursor::at(code, at + 1 + pad + 4);
            let low = cursor.i32()?;
            let high = cursor.i32()?;
            if high < low {
                return Err(Error::malformed("tableswitch high below low"));
            }
            1 + pad + 12 + 4 * (high - low + 1) as usize
        }
        InsnShape::LookupSwitch => {
            let pad = (4 - (at + 1) % 4) % 4;
            let mut cursor = ByteCursor::at(code, at + 1 + pad + 4);
            let pairs = cursor.i32()?;
            if pairs < 0 {
                return Err(Error::malformed("negative lookupswitch pair count"));
            }
            1 + pad + 8 + 8 * pairs as usize
        }
        InsnShape::Invalid => {
            return Err(Error::malformed(format!("invalid opcode {opcode}")))
        }
    })
}

/// Branch targets of the instruction at `at`, plus whether execution can
/// fall through to the next instruction.
fn branch_targets(code: &[u8], at: usize) -> Result<(Vec<u32>, bool)> {
    let opcode = code[at];
    Ok(match opcodes::shape(opcode) {
        InsnShape::Jump => {
            let mut cursor = ByteCursor::at(code, at + 1);
            let target = (at as i64 + i64::from(cursor.i16()?)) as u32;
            let fallthrough = opcode != opcodes::GOTO;
            (vec![target], fallthrough)
        }
        InsnShape::JumpWide => {
            let mut cursor = ByteCursor::at(code, at + 1);
            let target = (at as i64 + i64::from(cursor.i32()?)) as u32;
            // A jsr_w falls through at its return site.
            (vec![target], opcode == opcodes::JSR_W)
        }
        InsnShape::SyntheticJump => {
            let mut cursor = ByteCursor::at(code, at + 1);
            let target = at as u32 + u32::from(cursor.u16()?);
            let base = if opcode >= opcodes::WIDE_IFNULL {
                opcode - opcodes::WIDE_NULL_DELTA
            } else {
                opcode - opcodes::WIDE_COND_DELTA
            };
            (vec![target], base != opcodes::GOTO)
        }
        InsnShape::SyntheticJumpWide => {
            let mut cursor = ByteCursor::at(code, at + 1);
            let target = (at as i64 + i64::from(cursor.i32()?)) as u32;
            (vec![target], false)
        }
        InsnShape::TableSwitch => {
            let pad = (4 - (at + 1) % 4) % 4;
            let mut cursor = ByteCursor::at(code, at + 1 + pad);
            let default = (at as i64 + i64::from(cursor.i32()?)) as u32;
            let low = cursor.i32()?;
            let high = cursor.i32()?;
            let mut targets = vec![default];
            for _ in low..=high {
                targets.push((at as i64 + i64::from(cursor.i32()?)) as u32);
            }
            (targets, false)
        }
        InsnShape::LookupSwitch => {
            let pad = (4 - (at + 1) % 4) % 4;
            let mut cursor = ByteCursor::at(code, at + 1 + pad);
            let default = (at as i64 + i64::from(cursor.i32()?)) as u32;
            let pairs = cursor.i32()?;
            let mut targets = vec![default];
            for _ in 0..pairs {
                cursor.i32()?;
                targets.push((at as i64 + i64::from(cursor.i32()?)) as u32);
            }
            (targets, false)
        }
        _ => {
            let fallthrough = !matches!(opcode, opcodes::IRETURN..=opcodes::RETURN)
                && opcode != opcodes::ATHROW
                && opcode != opcodes::RET
                && !(opcode == opcodes::WIDE && code.get(at + 1) == Some(&opcodes::RET));
            (Vec::new(), fallthrough)
        }
    })
}

struct Block {
    start: u32,
    end: u32,
    successors: Vec<u32>,
    /// Targeted by a branch, switch or handler; needs an explicit frame.
    is_target: bool,
}

/// Splits the code into basic blocks. Leaders are offset 0, branch and
/// switch targets, handler boundaries, and the instruction after any
/// branch.
fn build_blocks(code: &[u8], handlers: &[HandlerRange]) -> Result<(Vec<Block>, HashMap<u32, usize>)> {
    let mut leaders = BTreeSet::new();
    let mut targets = BTreeSet::new();
    leaders.insert(0u32);
    let mut at = 0usize;
    while at < code.len() {
        let len = insn_length(code, at)?;
        let (branch_to, _) = branch_targets(code, at)?;
        for target in &branch_to {
            leaders.insert(*target);
            targets.insert(*target);
        }
        if is_terminator(code, at) {
            leaders.insert((at + len) as u32);
        }
        at += len;
    }
    for handler in handlers {
        leaders.insert(handler.start);
        leaders.insert(handler.end);
        leaders.insert(handler.handler);
        targets.insert(handler.handler);
    }
    leaders.retain(|leader| (*leader as usize) <= code.len());

    let bounds: Vec<u32> = leaders.into_iter().collect();
    let mut blocks = Vec::new();
    let mut index_of = HashMap::new();
    for (i, start) in bounds.iter().enumerate() {
        if *start as usize >= code.len() {
            continue;
        }
        let end = bounds
            .get(i + 1)
            .copied()
            .unwrap_or(code.len() as u32)
            .min(code.len() as u32);
        index_of.insert(*start, blocks.len());
        blocks.push(Block {
            start: *start,
            end,
            successors: Vec::new(),
            is_target: targets.contains(start),
        });
    }

    // Successor edges from each block's last instruction.
    for i in 0..blocks.len() {
        let (start, end) = (blocks[i].start, blocks[i].end);
        let mut at = start as usize;
        let mut last = at;
        while at < end as usize {
            last = at;
            at += insn_length(code, at)?;
        }
        let (branch_to, fallthrough) = branch_targets(code, last)?;
        let mut successors = branch_to;
        if fallthrough {
            if end < code.len() as u32 {
                successors.push(end);
            } else {
                return Err(Error::malformed("execution falls off the end of the code"));
            }
        }
        blocks[i].successors = successors;
    }
    Ok((blocks, index_of))
}

fn is_terminator(code: &[u8], at: usize) -> bool {
    let opcode = code[at];
    matches!(opcode, opcodes::IRETURN..=opcodes::RETURN | opcodes::ATHROW | opcodes::RET)
        || (opcode == opcodes::WIDE && code.get(at + 1) == Some(&opcodes::RET))
        || matches!(
            opcodes::shape(opcode),
            InsnShape::Jump
                | InsnShape::JumpWide
                | InsnShape::TableSwitch
                | InsnShape::LookupSwitch
                | InsnShape::SyntheticJump
                | InsnShape::SyntheticJumpWide
        )
}

/// The implicit frame at offset 0, derived from the method's access
/// flags and descriptor.
pub(crate) fn initial_frame(
    symbols: &mut SymbolTable,
    class_name: &str,
    method_access: AccessFlags,
    method_name: &str,
    descriptor: &str,
) -> Result<Frame> {
    let mut frame = Frame::default();
    if !method_access.contains(AccessFlags::STATIC) {
        if method_name == "<init>" {
            frame.locals.push(AbstractType::UninitializedThis);
        } else {
            frame
                .locals
                .push(AbstractType::Object(symbols.add_object_type(class_name)));
        }
    }
    let (args, _) = types::split_method_descriptor(descriptor)?;
    for arg in types::arguments(args) {
        let t = abstract_from_descriptor(arg?, symbols);
        frame.locals.push(t);
        if t.slots() == 2 {
            frame.locals.push(AbstractType::Top);
        }
    }
    Ok(frame)
}

/// Verification type of a value with the given field descriptor.
fn abstract_from_descriptor(descriptor: &str, symbols: &mut SymbolTable) -> AbstractType {
    match descriptor.as_bytes()[0] {
        b'B' | b'C' | b'I' | b'S' | b'Z' => AbstractType::Integer,
        b'F' => AbstractType::Float,
        b'J' => AbstractType::Long,
        b'D' => AbstractType::Double,
        b'L' => AbstractType::Object(
            symbols.add_object_type(&descriptor[1..descriptor.len() - 1]),
        ),
        _ => AbstractType::Object(symbols.add_object_type(descriptor)),
    }
}

/// Element type of an array type name.
fn array_element(name: &str, symbols: &mut SymbolTable) -> AbstractType {
    if let Some(rest) = name.strip_prefix('[') {
        abstract_from_descriptor(rest, symbols)
    } else {
        // aaload on something the lattice lost track of.
        AbstractType::Object(symbols.add_object_type("java/lang/Object"))
    }
}

fn merge_types(
    a: AbstractType,
    b: AbstractType,
    symbols: &mut SymbolTable,
    oracle: &dyn Fn(&str, &str) -> String,
) -> AbstractType {
    use AbstractType::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Null, Object(t)) | (Object(t), Null) => Object(t),
        (Object(x), Object(y)) => Object(symbols.merge_object_types(x, y, oracle)),
        _ => Top,
    }
}

/// Lattice meet of `incoming` into `target`; true when `target` changed.
fn merge_frames(
    target: &mut Frame,
    incoming: &Frame,
    symbols: &mut SymbolTable,
    oracle: &dyn Fn(&str, &str) -> String,
) -> Result<bool> {
    if target.stack.len() != incoming.stack.len() {
        return Err(Error::invalid(
            "inconsistent operand stack height at a merge point",
        ));
    }
    let mut changed = false;
    let max_locals = target.locals.len().max(incoming.locals.len());
    for i in 0..max_locals {
        let a = target.locals.get(i).copied().unwrap_or(AbstractType::Top);
        let b = incoming.locals.get(i).copied().unwrap_or(AbstractType::Top);
        let merged = merge_types(a, b, symbols, oracle);
        if i < target.locals.len() {
            if target.locals[i] != merged {
                target.locals[i] = merged;
                changed = true;
            }
        } else {
            target.locals.push(merged);
            changed = true;
        }
    }
    for i in 0..target.stack.len() {
        let merged = merge_types(target.stack[i], incoming.stack[i], symbols, oracle);
        if target.stack[i] != merged {
            target.stack[i] = merged;
            changed = true;
        }
    }
    Ok(changed)
}

/// Computes max stack, max locals and all stack map frames by abstract
/// interpretation, neutralizing unreachable code so the emitted frames
/// always verify. `jsr`/`ret` predate stack map frames and are rejected.
pub(crate) fn compute_all_frames(
    input: FrameComputation<'_>,
    code: &mut ByteVector,
) -> Result<FrameResult> {
    let FrameComputation {
        symbols,
        oracle,
        class_name,
        method_access,
        method_name,
        descriptor,
        labels,
        handlers,
    } = input;

    {
        let bytes = code.as_slice();
        let mut at = 0usize;
        while at < bytes.len() {
            let opcode = bytes[at];
            if opcode == opcodes::JSR
                || opcode == opcodes::JSR_W
                || opcode == opcodes::RET
                || opcode == opcodes::WIDE_JSR
                || (opcode == opcodes::WIDE && bytes.get(at + 1) == Some(&opcodes::RET))
            {
                return Err(Error::invalid(
                    "jsr/ret are not supported when frames are computed",
                ));
            }
            at += insn_length(bytes, at)?;
        }
    }

    let (blocks, index_of) = build_blocks(code.as_slice(), handlers)?;
    let entry_frame = initial_frame(symbols, class_name, method_access, method_name, descriptor)?;
    let mut inputs: Vec<Option<Frame>> = vec![None; blocks.len()];
    inputs[0] = Some(entry_frame.clone());

    let mut max_stack: u32 = 0;
    let mut max_locals: u32 = entry_frame.locals.len() as u32;

    let mut worklist: VecDeque<usize> = VecDeque::new();
    let mut queued = vec![false; blocks.len()];
    worklist.push_back(0);
    queued[0] = true;

    while let Some(block_index) = worklist.pop_front() {
        queued[block_index] = false;
        let block = &blocks[block_index];
        let mut frame = inputs[block_index]
            .clone()
            .expect("scheduled block has an input frame");
        trace!(
            "frame fixpoint: block {}..{} stack={} locals={}",
            block.start,
            block.end,
            frame.stack.len(),
            frame.locals.len()
        );

        // Exception edges use the locals at block entry and a one-element
        // stack holding the caught type.
        for handler in handlers {
            if block.start >= handler.start && block.start < handler.end {
                let catch = handler
                    .catch_type
                    .clone()
                    .unwrap_or_else(|| "java/lang/Throwable".to_owned());
                let handler_frame = Frame {
                    locals: frame.locals.clone(),
                    stack: vec![AbstractType::Object(symbols.add_object_type(&catch))],
                };
                max_stack = max_stack.max(handler_frame.stack_slots());
                let handler_block = *index_of
                    .get(&handler.handler)
                    .ok_or_else(|| Error::malformed("handler offset inside an instruction"))?;
                let changed = match &mut inputs[handler_block] {
                    Some(existing) => merge_frames(existing, &handler_frame, symbols, oracle)?,
                    slot @ None => {
                        *slot = Some(handler_frame);
                        true
                    }
                };
                if changed && !queued[handler_block] {
                    queued[handler_block] = true;
                    worklist.push_back(handler_block);
                }
            }
        }

        let mut at = block.start as usize;
        while at < block.end as usize {
            execute(
                &mut frame,
                code.as_slice(),
                at,
                symbols,
                class_name,
                &mut max_stack,
            )?;
            max_locals = max_locals.max(frame.locals.len() as u32);
            max_stack = max_stack.max(frame.stack_slots());
            at += insn_length(code.as_slice(), at)?;
        }

        for successor in &blocks[block_index].successors {
            let successor_block = *index_of
                .get(successor)
                .ok_or_else(|| Error::malformed("branch target inside an instruction"))?;
            let changed = match &mut inputs[successor_block] {
                Some(existing) => merge_frames(existing, &frame, symbols, oracle)?,
                slot @ None => {
                    *slot = Some(frame.clone());
                    true
                }
            };
            if changed && !queued[successor_block] {
                queued[successor_block] = true;
                worklist.push_back(successor_block);
            }
        }
    }

    // Neutralize unreachable ranges: nop ... athrow with a frame declaring
    // a Throwable on the stack, so every remaining instruction verifies.
    let reachable: Vec<bool> = inputs.iter().map(Option::is_some).collect();
    let throwable = AbstractType::Object(symbols.add_object_type("java/lang/Throwable"));
    for (i, block) in blocks.iter().enumerate() {
        if reachable[i] {
            continue;
        }
        let bytes = code.as_mut_slice();
        for offset in block.start..block.end - 1 {
            bytes[offset as usize] = opcodes::NOP;
        }
        bytes[(block.end - 1) as usize] = opcodes::ATHROW;
        inputs[i] = Some(Frame {
            locals: Vec::new(),
            stack: vec![throwable],
        });
        max_stack = max_stack.max(1);
    }

    // Drop (or shrink) handler ranges that cover neutralized code.
    let mut live_handlers = Vec::new();
    for handler in handlers {
        let mut run_start: Option<u32> = None;
        for (i, block) in blocks.iter().enumerate() {
            let in_range = block.start >= handler.start && block.start < handler.end;
            let live = in_range && reachable[i];
            match (run_start, live) {
                (None, true) => run_start = Some(block.start.max(handler.start)),
                (Some(start), false) => {
                    live_handlers.push(HandlerRange {
                        start,
                        end: block.start,
                        handler: handler.handler,
                        catch_type: handler.catch_type.clone(),
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            live_handlers.push(HandlerRange {
                start,
                end: handler.end,
                handler: handler.handler,
                catch_type: handler.catch_type.clone(),
            });
        }
    }

    // Serialize a frame for every block that is a jump or handler target,
    // plus every neutralized block (whose predecessor no longer falls
    // through).
    let initial_locals = {
        let frame = initial_frame(symbols, class_name, method_access, method_name, descriptor)?;
        compress_locals(&frame.locals, symbols, labels)?
    };
    let mut encoder = FrameEncoder::new(initial_locals);
    let mut stack_map = ByteVector::new();
    let mut frame_count: u16 = 0;
    for (i, block) in blocks.iter().enumerate() {
        if !(block.is_target || !reachable[i]) {
            continue;
        }
        let frame = inputs[i].as_ref().expect("every block has a frame now");
        let locals = compress_locals(&frame.locals, symbols, labels)?;
        let mut stack = Vec::with_capacity(frame.stack.len());
        for t in &frame.stack {
            stack.push(ser_item(*t, symbols, labels)?);
        }
        encoder.encode(block.start, locals, stack, &mut stack_map)?;
        frame_count += 1;
    }

    Ok(FrameResult {
        max_stack: max_stack.min(u32::from(u16::MAX)) as u16,
        max_locals: max_locals.min(u32::from(u16::MAX)) as u16,
        frame_count,
        stack_map,
        handlers: live_handlers,
    })
}

/// Simulates straight-line execution of `[from, to)` over `frame`.
/// Used to compute the content of writer-inserted frames from the nearest
/// preceding known frame.
pub(crate) fn simulate_forward(
    frame: &mut Frame,
    code: &[u8],
    from: u32,
    to: u32,
    symbols: &mut SymbolTable,
    class_name: &str,
) -> Result<()> {
    let mut max_stack = 0;
    let mut at = from as usize;
    while at < to as usize {
        execute(frame, code, at, symbols, class_name, &mut max_stack)?;
        at += insn_length(code, at)?;
    }
    Ok(())
}

/// Interprets one instruction's effect on the frame.
fn execute(
    frame: &mut Frame,
    code: &[u8],
    at: usize,
    symbols: &mut SymbolTable,
    class_name: &str,
    max_stack: &mut u32,
) -> Result<()> {
    use AbstractType::*;
    let opcode = code[at];
    let mut cursor = ByteCursor::at(code, at + 1);
    match opcode {
        opcodes::NOP => {}
        opcodes::ACONST_NULL => frame.push(Null),
        opcodes::ICONST_M1..=opcodes::ICONST_5 => frame.push(Integer),
        opcodes::LCONST_0 | opcodes::LCONST_1 => frame.push(Long),
        opcodes::FCONST_0..=opcodes::FCONST_2 => frame.push(Float),
        opcodes::DCONST_0 | opcodes::DCONST_1 => frame.push(Double),
        opcodes::BIPUSH | opcodes::SIPUSH => frame.push(Integer),
        opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => {
            let index = if opcode == opcodes::LDC {
                u16::from(cursor.u8()?)
            } else {
                cursor.u16()?
            };
            frame.push(loadable_type(index, symbols)?);
        }
        opcodes::ILOAD => {
            cursor.u8()?;
            frame.push(Integer);
        }
        opcodes::LLOAD => frame.push(Long),
        opcodes::FLOAD => frame.push(Float),
        opcodes::DLOAD => frame.push(Double),
        opcodes::ALOAD => {
            let var = u16::from(cursor.u8()?);
            frame.push(frame.local(var));
        }
        26..=29 => frame.push(Integer),
        30..=33 => frame.push(Long),
        34..=37 => frame.push(Float),
        38..=41 => frame.push(Double),
        42..=45 => {
            let (_, var) = opcodes::implicit_var(opcode);
            frame.push(frame.local(var));
        }
        opcodes::IALOAD | opcodes::BALOAD | opcodes::CALOAD | opcodes::SALOAD => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::LALOAD => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Long);
        }
        opcodes::FALOAD => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Float);
        }
        opcodes::DALOAD => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Double);
        }
        opcodes::AALOAD => {
            frame.pop()?;
            let array = frame.pop()?;
            let element = match array {
                Null => Null,
                Object(index) => {
                    let name = symbols.type_entry(index).name().to_owned();
                    array_element(&name, symbols)
                }
                _ => return Err(Error::invalid("aaload on a non-reference value")),
            };
            frame.push(element);
        }
        opcodes::ISTORE | opcodes::FSTORE => {
            let var = u16::from(cursor.u8()?);
            let value = frame.pop()?;
            frame.set_local(var, value);
        }
        opcodes::LSTORE | opcodes::DSTORE => {
            let var = u16::from(cursor.u8()?);
            let value = frame.pop()?;
            frame.set_local(var, value);
        }
        opcodes::ASTORE => {
            let var = u16::from(cursor.u8()?);
            let value = frame.pop()?;
            frame.set_local(var, value);
        }
        59..=78 => {
            let (_, var) = opcodes::implicit_var(opcode);
            let value = frame.pop()?;
            frame.set_local(var, value);
        }
        opcodes::IASTORE..=opcodes::SASTORE => {
            frame.pop()?;
            frame.pop()?;
            frame.pop()?;
        }
        opcodes::POP => {
            frame.pop()?;
        }
        opcodes::POP2 => {
            frame.pop_slots(2)?;
        }
        opcodes::DUP => {
            let top = frame.pop()?;
            frame.push(top);
            frame.push(top);
        }
        opcodes::DUP_X1 | opcodes::DUP_X2 | opcodes::DUP2 | opcodes::DUP2_X1
        | opcodes::DUP2_X2 => {
            let (first_slots, second_slots) = match opcode {
                opcodes::DUP_X1 => (1, 1),
                opcodes::DUP_X2 => (1, 2),
                opcodes::DUP2 => (2, 0),
                opcodes::DUP2_X1 => (2, 1),
                _ => (2, 2),
            };
            let first = frame.pop_slots(first_slots)?;
            let second = frame.pop_slots(second_slots)?;
            for value in &first {
                frame.push(*value);
            }
            for value in &second {
                frame.push(*value);
            }
            for value in &first {
                frame.push(*value);
            }
        }
        opcodes::SWAP => {
            let a = frame.pop()?;
            let b = frame.pop()?;
            frame.push(a);
            frame.push(b);
        }
        opcodes::IADD | opcodes::ISUB | opcodes::IMUL | opcodes::IDIV | opcodes::IREM
        | opcodes::ISHL | opcodes::ISHR | opcodes::IUSHR | opcodes::IAND | opcodes::IOR
        | opcodes::IXOR => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::LADD | opcodes::LSUB | opcodes::LMUL | opcodes::LDIV | opcodes::LREM
        | opcodes::LAND | opcodes::LOR | opcodes::LXOR => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Long);
        }
        opcodes::LSHL | opcodes::LSHR | opcodes::LUSHR => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Long);
        }
        opcodes::FADD | opcodes::FSUB | opcodes::FMUL | opcodes::FDIV | opcodes::FREM => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Float);
        }
        opcodes::DADD | opcodes::DSUB | opcodes::DMUL | opcodes::DDIV | opcodes::DREM => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Double);
        }
        opcodes::INEG | opcodes::LNEG | opcodes::FNEG | opcodes::DNEG => {
            let value = frame.pop()?;
            frame.push(value);
        }
        opcodes::IINC => {
            cursor.u8()?;
            cursor.i8()?;
        }
        opcodes::I2L | opcodes::F2L | opcodes::D2L => {
            frame.pop()?;
            frame.push(Long);
        }
        opcodes::I2F | opcodes::L2F | opcodes::D2F => {
            frame.pop()?;
            frame.push(Float);
        }
        opcodes::I2D | opcodes::L2D | opcodes::F2D => {
            frame.pop()?;
            frame.push(Double);
        }
        opcodes::L2I | opcodes::F2I | opcodes::D2I | opcodes::I2B | opcodes::I2C
        | opcodes::I2S => {
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::LCMP | opcodes::FCMPL | opcodes::FCMPG | opcodes::DCMPL | opcodes::DCMPG => {
            frame.pop()?;
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => {
            frame.pop()?;
        }
        opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => {
            frame.pop()?;
            frame.pop()?;
        }
        opcodes::WIDE_IFEQ..=opcodes::WIDE_IFNONNULL => {
            let base = if opcode >= opcodes::WIDE_IFNULL {
                opcode - opcodes::WIDE_NULL_DELTA
            } else {
                opcode - opcodes::WIDE_COND_DELTA
            };
            if base != opcodes::GOTO && base != opcodes::JSR {
                if matches!(base, opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE) {
                    frame.pop()?;
                }
                frame.pop()?;
            }
        }
        opcodes::GOTO | opcodes::GOTO_W | opcodes::WIDE_GOTO_W => {}
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => {
            frame.pop()?;
        }
        opcodes::IRETURN | opcodes::FRETURN | opcodes::ARETURN => {
            frame.pop()?;
        }
        opcodes::LRETURN | opcodes::DRETURN => {
            frame.pop()?;
        }
        opcodes::RETURN => {}
        opcodes::GETSTATIC | opcodes::GETFIELD | opcodes::PUTSTATIC | opcodes::PUTFIELD => {
            let index = cursor.u16()?;
            let descriptor = field_descriptor(index, symbols)?;
            if opcode == opcodes::GETFIELD || opcode == opcodes::PUTFIELD {
                if opcode == opcodes::PUTFIELD {
                    frame.pop()?;
                }
                frame.pop()?;
                if opcode == opcodes::GETFIELD {
                    frame.push(abstract_from_descriptor(&descriptor, symbols));
                }
            } else if opcode == opcodes::GETSTATIC {
                frame.push(abstract_from_descriptor(&descriptor, symbols));
            } else {
                frame.pop()?;
            }
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
            let index = cursor.u16()?;
            let (owner, name, descriptor) = method_ref_parts(index, symbols)?;
            let (args, ret) = types::split_method_descriptor(&descriptor)?;
            let mut arg_count = 0;
            for arg in types::arguments(args) {
                arg?;
                arg_count += 1;
            }
            for _ in 0..arg_count {
                frame.pop()?;
            }
            if opcode != opcodes::INVOKESTATIC {
                let receiver = frame.pop()?;
                if opcode == opcodes::INVOKESPECIAL && name == "<init>" {
                    let initialized = match receiver {
                        UninitializedThis => {
                            Object(symbols.add_object_type(class_name))
                        }
                        Uninitialized(index) => {
                            let mut type_name =
                                symbols.type_entry(index).name().to_owned();
                            if type_name.is_empty() {
                                // Anchor frames parsed from a class file do
                                // not carry the class of a pending `new`;
                                // the constructor's owner is that class.
                                type_name = owner.clone();
                            }
                            Object(symbols.add_object_type(&type_name))
                        }
                        other => other,
                    };
                    frame.initialize(receiver, initialized);
                }
            }
            if ret != "V" {
                frame.push(abstract_from_descriptor(ret, symbols));
            }
        }
        opcodes::INVOKEDYNAMIC => {
            let index = cursor.u16()?;
            let descriptor = invoke_dynamic_descriptor(index, symbols)?;
            let (args, ret) = types::split_method_descriptor(&descriptor)?;
            for arg in types::arguments(args) {
                arg?;
                frame.pop()?;
            }
            if ret != "V" {
                frame.push(abstract_from_descriptor(ret, symbols));
            }
        }
        opcodes::NEW => {
            let index = cursor.u16()?;
            let name = class_name_at(index, symbols)?;
            frame.push(Uninitialized(
                symbols.add_uninitialized_type(&name, at as u32),
            ));
        }
        opcodes::NEWARRAY => {
            let atype = cursor.u8()?;
            frame.pop()?;
            let name = match atype {
                opcodes::T_BOOLEAN => "[Z",
                opcodes::T_CHAR => "[C",
                opcodes::T_FLOAT => "[F",
                opcodes::T_DOUBLE => "[D",
                opcodes::T_BYTE => "[B",
                opcodes::T_SHORT => "[S",
                opcodes::T_INT => "[I",
                opcodes::T_LONG => "[J",
                _ => return Err(Error::malformed(format!("invalid newarray type {atype}"))),
            };
            frame.push(Object(symbols.add_object_type(name)));
        }
        opcodes::ANEWARRAY => {
            let index = cursor.u16()?;
            let element = class_name_at(index, symbols)?;
            frame.pop()?;
            let name = if element.starts_with('[') {
                format!("[{element}")
            } else {
                format!("[L{element};")
            };
            frame.push(Object(symbols.add_object_type(&name)));
        }
        opcodes::ARRAYLENGTH => {
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::ATHROW => {
            frame.pop()?;
        }
        opcodes::CHECKCAST => {
            let index = cursor.u16()?;
            let name = class_name_at(index, symbols)?;
            frame.pop()?;
            frame.push(Object(symbols.add_object_type(&name)));
        }
        opcodes::INSTANCEOF => {
            frame.pop()?;
            frame.push(Integer);
        }
        opcodes::MONITORENTER | opcodes::MONITOREXIT => {
            frame.pop()?;
        }
        opcodes::WIDE => {
            let sub = cursor.u8()?;
            let var = cursor.u16()?;
            match sub {
                opcodes::ILOAD => frame.push(Integer),
                opcodes::LLOAD => frame.push(Long),
                opcodes::FLOAD => frame.push(Float),
                opcodes::DLOAD => frame.push(Double),
                opcodes::ALOAD => frame.push(frame.local(var)),
                opcodes::ISTORE..=opcodes::ASTORE => {
                    let value = frame.pop()?;
                    frame.set_local(var, value);
                }
                opcodes::IINC => {
                    cursor.i16()?;
                }
                _ => return Err(Error::malformed(format!("invalid wide opcode {sub}"))),
            }
        }
        opcodes::MULTIANEWARRAY => {
            let index = cursor.u16()?;
            let dimensions = cursor.u8()?;
            let name = class_name_at(index, symbols)?;
            for _ in 0..dimensions {
                frame.pop()?;
            }
            frame.push(Object(symbols.add_object_type(&name)));
        }
        _ => {
            return Err(Error::malformed(format!(
                "unexpected opcode {opcode} during frame computation"
            )))
        }
    }
    *max_stack = (*max_stack).max(frame.stack_slots());
    Ok(())
}

fn class_name_at(index: u16, symbols: &SymbolTable) -> Result<String> {
    Ok(symbols.class_name_at(index)?.to_owned())
}

fn method_ref_parts(index: u16, symbols: &SymbolTable) -> Result<(String, String, String)> {
    match symbols.entry(index) {
        Some(Entry::MethodRef { class, name_and_type })
        | Some(Entry::InterfaceMethodRef { class, name_and_type }) => {
            let owner = symbols.class_name_at(*class)?.to_owned();
            let (name, descriptor) = symbols.name_and_type_at(*name_and_type)?;
            Ok((owner, name.to_owned(), descriptor.to_owned()))
        }
        _ => Err(Error::malformed(format!("index {index} is not a method ref"))),
    }
}

fn field_descriptor(index: u16, symbols: &SymbolTable) -> Result<String> {
    match symbols.entry(index) {
        Some(Entry::FieldRef { name_and_type, .. }) => {
            Ok(symbols.name_and_type_at(*name_and_type)?.1.to_owned())
        }
        _ => Err(Error::malformed(format!("index {index} is not a field ref"))),
    }
}

fn method_name_and_descriptor(index: u16, symbols: &SymbolTable) -> Result<(String, String)> {
    match symbols.entry(index) {
        Some(Entry::MethodRef { name_and_type, .. })
        | Some(Entry::InterfaceMethodRef { name_and_type, .. }) => {
            let (name, descriptor) = symbols.name_and_type_at(*name_and_type)?;
            Ok((name.to_owned(), descriptor.to_owned()))
        }
        _ => Err(Error::malformed(format!("index {index} is not a method ref"))),
    }
}

fn invoke_dynamic_descriptor(index: u16, symbols: &SymbolTable) -> Result<String> {
    match symbols.entry(index) {
        Some(Entry::InvokeDynamic { name_and_type, .. }) => {
            Ok(symbols.name_and_type_at(*name_and_type)?.1.to_owned())
        }
        _ => Err(Error::malformed(format!(
            "index {index} is not an invokedynamic entry"
        ))),
    }
}

/// Verification type pushed by `ldc`-family instructions.
fn loadable_type(index: u16, symbols: &mut SymbolTable) -> Result<AbstractType> {
    Ok(match symbols.entry(index) {
        Some(Entry::Integer(_)) => AbstractType::Integer,
        Some(Entry::Float(_)) => AbstractType::Float,
        Some(Entry::Long(_)) => AbstractType::Long,
        Some(Entry::Double(_)) => AbstractType::Double,
        Some(Entry::String { .. }) => {
            AbstractType::Object(symbols.add_object_type("java/lang/String"))
        }
        Some(Entry::Class { .. }) => {
            AbstractType::Object(symbols.add_object_type("java/lang/Class"))
        }
        Some(Entry::MethodType { .. }) => {
            AbstractType::Object(symbols.add_object_type("java/lang/invoke/MethodType"))
        }
        Some(Entry::MethodHandle { .. }) => {
            AbstractType::Object(symbols.add_object_type("java/lang/invoke/MethodHandle"))
        }
        Some(Entry::Dynamic { name_and_type, .. }) => {
            let descriptor = symbols.name_and_type_at(*name_and_type)?.1.to_owned();
            abstract_from_descriptor(&descriptor, symbols)
        }
        _ => {
            return Err(Error::malformed(format!(
                "index {index} is not a loadable constant"
            )))
        }
    })
}

/// The untyped analysis behind the MaxsOnly strategy: per-block stack
/// deltas propagated over the control flow graph, with `jsr` edges marked
/// (target entered with one extra slot, the return site resuming at the
/// call's depth) and handler entries seeded with a one-slot stack.
pub(crate) fn compute_maxs(
    code: &[u8],
    symbols: &SymbolTable,
    method_access: AccessFlags,
    descriptor: &str,
    handlers: &[HandlerRange],
) -> Result<(u16, u16)> {
    let (arg_slots, _) = types::method_descriptor_sizes(descriptor)?;
    let this_slot = if method_access.contains(AccessFlags::STATIC) { 0 } else { 1 };
    let mut max_locals: u32 = arg_slots + this_slot;

    // Locals high-water mark from variable instructions.
    let mut at = 0usize;
    while at < code.len() {
        let opcode = code[at];
        match opcodes::shape(opcode) {
            InsnShape::VarByte => {
                let var = u32::from(code[at + 1]);
                let width = match opcode {
                    opcodes::LLOAD | opcodes::DLOAD | opcodes::LSTORE | opcodes::DSTORE => 2,
                    _ => 1,
                };
                max_locals = max_locals.max(var + width);
            }
            InsnShape::ImplicitVar => {
                let (base, var) = opcodes::implicit_var(opcode);
                let width = match base {
                    opcodes::LLOAD | opcodes::DLOAD | opcodes::LSTORE | opcodes::DSTORE => 2,
                    _ => 1,
                };
                max_locals = max_locals.max(u32::from(var) + width);
            }
            InsnShape::Iinc => {
                max_locals = max_locals.max(u32::from(code[at + 1]) + 1);
            }
            InsnShape::WidePrefix => {
                let sub = code[at + 1];
                let var = u32::from(code[at + 2]) << 8 | u32::from(code[at + 3]);
                let width = match sub {
                    opcodes::LLOAD | opcodes::DLOAD | opcodes::LSTORE | opcodes::DSTORE => 2,
                    _ => 1,
                };
                max_locals = max_locals.max(var + width);
            }
            _ => {}
        }
        at += insn_length(code, at)?;
    }

    let (blocks, index_of) = build_blocks(code, handlers)?;
    // Per-block relative stack delta and high-water mark.
    let mut deltas = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let mut depth: i32 = 0;
        let mut high: i32 = 0;
        let mut at = block.start as usize;
        while at < block.end as usize {
            depth += stack_delta_at(code, at, symbols)?;
            high = high.max(depth);
            at += insn_length(code, at)?;
        }
        deltas.push((depth, high));
    }

    let mut entry_depth: Vec<Option<i32>> = vec![None; blocks.len()];
    entry_depth[0] = Some(0);
    let mut worklist = VecDeque::new();
    worklist.push_back(0usize);
    let mut max_stack: i32 = 0;
    while let Some(block_index) = worklist.pop_front() {
        let depth = entry_depth[block_index].expect("scheduled block has a depth");
        let (delta, high) = deltas[block_index];
        max_stack = max_stack.max(depth + high);
        let block = &blocks[block_index];

        for handler in handlers {
            if block.start >= handler.start && block.start < handler.end {
                let handler_block = *index_of
                    .get(&handler.handler)
                    .ok_or_else(|| Error::malformed("handler offset inside an instruction"))?;
                if entry_depth[handler_block].is_none() {
                    entry_depth[handler_block] = Some(1);
                    worklist.push_back(handler_block);
                }
            }
        }

        let last = last_insn_offset(code, block)?;
        let is_jsr = matches!(code[last as usize], opcodes::JSR | opcodes::JSR_W)
            || code[last as usize] == opcodes::WIDE_JSR;
        for successor in &block.successors {
            let successor_block = *index_of
                .get(successor)
                .ok_or_else(|| Error::malformed("branch target inside an instruction"))?;
            // The jsr target starts with the return address pushed; the
            // return site (the fall-through successor) resumes at the
            // caller's depth, which `delta` already reflects.
            let bonus = if is_jsr && *successor != block.end { 1 } else { 0 };
            let successor_depth = depth + delta + bonus;
            if entry_depth[successor_block].is_none() {
                entry_depth[successor_block] = Some(successor_depth);
                worklist.push_back(successor_block);
            }
        }
    }

    Ok((
        max_stack.clamp(0, i32::from(u16::MAX)) as u16,
        max_locals.min(u32::from(u16::MAX)) as u16,
    ))
}

fn last_insn_offset(code: &[u8], block: &Block) -> Result<u32> {
    let mut at = block.start as usize;
    let mut last = at;
    while at < block.end as usize {
        last = at;
        at += insn_length(code, at)?;
    }
    Ok(last as u32)
}

/// Stack slot delta of the instruction at `at`, resolving descriptors
/// through the symbol table where needed.
fn stack_delta_at(code: &[u8], at: usize, symbols: &SymbolTable) -> Result<i32> {
    let opcode = code[at];
    let mut cursor = ByteCursor::at(code, at + 1);
    Ok(match opcode {
        opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => {
            let index = if opcode == opcodes::LDC {
                u16::from(cursor.u8()?)
            } else {
                cursor.u16()?
            };
            match symbols.entry(index) {
                Some(Entry::Long(_)) | Some(Entry::Double(_)) => 2,
                Some(Entry::Dynamic { name_and_type, .. }) => {
                    let descriptor = symbols.name_and_type_at(*name_and_type)?.1;
                    types::descriptor_size(descriptor) as i32
                }
                _ => 1,
            }
        }
        opcodes::GETSTATIC | opcodes::GETFIELD | opcodes::PUTSTATIC | opcodes::PUTFIELD => {
            let index = cursor.u16()?;
            let descriptor = field_descriptor(index, symbols)?;
            let size = types::descriptor_size(&descriptor) as i32;
            match opcode {
                opcodes::GETSTATIC => size,
                opcodes::PUTSTATIC => -size,
                opcodes::GETFIELD => size - 1,
                _ => -size - 1,
            }
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
            let index = cursor.u16()?;
            let (_, descriptor) = method_name_and_descriptor(index, symbols)?;
            let (args, ret) = types::method_descriptor_sizes(&descriptor)?;
            let receiver = if opcode == opcodes::INVOKESTATIC { 0 } else { 1 };
            ret as i32 - args as i32 - receiver
        }
        opcodes::INVOKEDYNAMIC => {
            let index = cursor.u16()?;
            let descriptor = invoke_dynamic_descriptor(index, symbols)?;
            let (args, ret) = types::method_descriptor_sizes(&descriptor)?;
            ret as i32 - args as i32
        }
        opcodes::MULTIANEWARRAY => {
            cursor.u16()?;
            1 - i32::from(cursor.u8()?)
        }
        opcodes::WIDE => {
            let sub = cursor.u8()?;
            opcodes::fixed_stack_delta(sub)
        }
        opcodes::WIDE_IFEQ..=opcodes::WIDE_IFNONNULL => {
            let base = if opcode >= opcodes::WIDE_IFNULL {
                opcode - opcodes::WIDE_NULL_DELTA
            } else {
                opcode - opcodes::WIDE_COND_DELTA
            };
            opcodes::fixed_stack_delta(base)
        }
        opcodes::WIDE_GOTO_W => 0,
        _ => opcodes::fixed_stack_delta(opcode),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_round_trips_offset_deltas() {
        let mut encoder = FrameEncoder::new(vec![SerItem::Integer]);
        let mut out = ByteVector::new();
        encoder
            .encode(5, vec![SerItem::Integer], Vec::new(), &mut out)
            .unwrap();
        encoder
            .encode(80, vec![SerItem::Integer], Vec::new(), &mut out)
            .unwrap();
        encoder
            .encode(81, vec![SerItem::Integer], vec![SerItem::Null], &mut out)
            .unwrap();
        let bytes = out.as_slice();
        // same_frame(5), same_frame_extended(delta 74), then a
        // same_locals_1_stack_item frame with delta 0.
        assert_eq!(bytes[0], 5);
        assert_eq!(bytes[1], 251);
        assert_eq!(u16::from(bytes[2]) << 8 | u16::from(bytes[3]), 74);
        assert_eq!(bytes[4], 64);
        assert_eq!(bytes[5], opcodes::ITEM_NULL);
        // Decoding the deltas yields the original absolute offsets.
        let mut offset: i64 = -1;
        offset += i64::from(bytes[0]) + 1;
        assert_eq!(offset, 5);
        offset += i64::from(u16::from(bytes[2]) << 8 | u16::from(bytes[3])) + 1;
        assert_eq!(offset, 80);
        offset += i64::from(bytes[4] - 64) + 1;
        assert_eq!(offset, 81);
    }

    #[test]
    fn encoder_chops_and_appends() {
        let mut encoder = FrameEncoder::new(vec![SerItem::Integer, SerItem::Float]);
        let mut out = ByteVector::new();
        encoder
            .encode(10, vec![SerItem::Integer], Vec::new(), &mut out)
            .unwrap();
        assert_eq!(out.as_slice()[0], 250); // chop 1
        let at = out.len();
        encoder
            .encode(
                20,
                vec![SerItem::Integer, SerItem::Long, SerItem::Null],
                Vec::new(),
                &mut out,
            )
            .unwrap();
        assert_eq!(out.as_slice()[at], 253); // append 2
    }

    #[test]
    fn untyped_maxs_of_straight_line_code() {
        let symbols = SymbolTable::new();
        // iconst_1; iconst_1; iadd; ireturn
        let code = [4u8, 4, 96, 172];
        let (max_stack, max_locals) = compute_maxs(
            &code,
            &symbols,
            AccessFlags::STATIC,
            "()I",
            &[],
        )
        .unwrap();
        assert_eq!(max_stack, 2);
        assert_eq!(max_locals, 0);
    }

    #[test]
    fn untyped_maxs_counts_locals_and_handlers() {
        let symbols = SymbolTable::new();
        // lload_0; lstore_2; return
        let code = [30u8, 65, 177];
        let handlers = [HandlerRange {
            start: 0,
            end: 2,
            handler: 2,
            catch_type: None,
        }];
        let (max_stack, max_locals) = compute_maxs(
            &code,
            &symbols,
            AccessFlags::STATIC,
            "(J)V",
            &handlers,
        )
        .unwrap();
        assert_eq!(max_stack, 2);
        assert_eq!(max_locals, 4);
    }

    #[test]
    fn full_frames_reject_jsr() {
        let mut symbols = SymbolTable::new();
        let mut code = ByteVector::new();
        code.put_u8(opcodes::JSR);
        code.put_u16(3);
        code.put_u8(opcodes::RETURN);
        let oracle = |_: &str, _: &str| "java/lang/Object".to_owned();
        let err = compute_all_frames(
            FrameComputation {
                symbols: &mut symbols,
                oracle: &oracle,
                class_name: "X",
                method_access: AccessFlags::STATIC,
                method_name: "m",
                descriptor: "()V",
                labels: &[],
                handlers: &[],
            },
            &mut code,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInvocation(_)));
    }
}
