//! Binary parser for class files: a deterministic, single-pass,
//! forward-only walk over a fully loaded buffer, streaming structured
//! events to a [`ClassSink`].
use std::collections::HashMap;
use std::rc::Rc;

use crate::attribute::{find_codec, Attribute, AttributeCodec};
use crate::buffer::ByteCursor;
use crate::constant::{Constant, ConstantDynamic, Handle};
use crate::error::{Error, Result};
use crate::flags::{AccessFlags, ParseOptions, MAX_MAJOR_VERSION, MIN_MAJOR_VERSION};
use crate::label::Label;
use crate::opcodes::{self, InsnShape};
use crate::sink::{AnnotationSink, ClassSink, FrameItem, FrameKind, MethodSink, MethodSource, TypePath};
use crate::symbols::{self, Entry};
use crate::types;

/// Parser for one class file held entirely in memory.
///
/// Construction validates the magic number and the major version and
/// precomputes the offset of every constant pool entry, so later lookups
/// are O(1).
pub struct ClassReader {
    buffer: Rc<Vec<u8>>,
    /// Content offset (past the tag byte) of each pool entry; index 0 and
    /// the slots shadowed by long/double entries hold 0.
    cp_offsets: Vec<usize>,
    /// Offset of the access_flags field, right after the constant pool.
    header: usize,
}

struct AttributeSpan {
    name: String,
    start: usize,
    len: usize,
}

/// Per-method parsing state: the labels minted for this method, keyed by
/// bytecode offset.
#[derive(Default)]
struct LabelPool {
    by_offset: HashMap<u32, Label>,
    next: u32,
}

impl LabelPool {
    fn label_at(&mut self, offset: u32) -> Label {
        *self.by_offset.entry(offset).or_insert_with(|| {
            let label = Label(self.next);
            self.next += 1;
            label
        })
    }

    fn get(&self, offset: u32) -> Option<Label> {
        self.by_offset.get(&offset).copied()
    }
}

/// A code-level type annotation, parsed far enough to know where it
/// applies; element values are replayed lazily.
struct CodeTypeAnnotation {
    visible: bool,
    type_ref: u32,
    /// Bytecode offset for instruction targets.
    offset: Option<u32>,
    /// Resolved ranges for local variable targets.
    ranges: Option<Vec<(u16, u16, u16)>>,
    is_catch: bool,
    path: Option<TypePath>,
    descriptor: String,
    values_at: usize,
}

impl ClassReader {
    /// Parses the header of `bytes`, accepting major versions up to the
    /// library default.
    pub fn new(bytes: Vec<u8>) -> Result<ClassReader> {
        Self::with_max_version(bytes, MAX_MAJOR_VERSION)
    }

    /// Parses the header of `bytes` with a caller-chosen version ceiling;
    /// pass `u16::MAX` to opt out of the check entirely.
    pub fn with_max_version(bytes: Vec<u8>, max_major: u16) -> Result<ClassReader> {
        let buffer = Rc::new(bytes);
        let mut cursor = ByteCursor::new(&buffer);
        if cursor.u32()? != 0xCAFE_BABE {
            return Err(Error::malformed("bad magic number"));
        }
        cursor.u16()?; // minor
        let major = cursor.u16()?;
        if major < MIN_MAJOR_VERSION || major > max_major {
            return Err(Error::UnsupportedVersion(major));
        }
        let count = cursor.u16()?;
        let mut cp_offsets = vec![0usize; usize::from(count)];
        let mut index = 1usize;
        while index < usize::from(count) {
            let tag = cursor.u8()?;
            cp_offsets[index] = cursor.position();
            let mut wide = false;
            match tag {
                symbols::TAG_UTF8 => {
                    let len = cursor.u16()?;
                    cursor.skip(usize::from(len))?;
                }
                symbols::TAG_INTEGER
                | symbols::TAG_FLOAT
                | symbols::TAG_FIELD_REF
                | symbols::TAG_METHOD_REF
                | symbols::TAG_INTERFACE_METHOD_REF
                | symbols::TAG_NAME_AND_TYPE
                | symbols::TAG_DYNAMIC
                | symbols::TAG_INVOKE_DYNAMIC => cursor.skip(4)?,
                symbols::TAG_LONG | symbols::TAG_DOUBLE => {
                    cursor.skip(8)?;
                    wide = true;
                }
                symbols::TAG_CLASS
                | symbols::TAG_STRING
                | symbols::TAG_METHOD_TYPE
                | symbols::TAG_MODULE
                | symbols::TAG_PACKAGE => cursor.skip(2)?,
                symbols::TAG_METHOD_HANDLE => cursor.skip(3)?,
                _ => {
                    return Err(Error::malformed(format!(
                        "unknown constant pool tag {tag} at index {index}"
                    )))
                }
            }
            index += if wide { 2 } else { 1 };
        }
        let header = cursor.position();
        // The class header proper must also fit.
        ByteCursor::at(&buffer, header).skip(8)?;
        Ok(ClassReader {
            buffer: Rc::clone(&buffer),
            cp_offsets,
            header,
        })
    }

    /// Used for the writer's internal second pass, where the bytes are
    /// self-emitted and the version was already validated.
    pub(crate) fn new_unchecked(bytes: Vec<u8>) -> Result<ClassReader> {
        Self::with_max_version(bytes, u16::MAX)
    }

    pub fn minor_version(&self) -> u16 {
        u16::from(self.buffer[4]) << 8 | u16::from(self.buffer[5])
    }

    pub fn major_version(&self) -> u16 {
        u16::from(self.buffer[6]) << 8 | u16::from(self.buffer[7])
    }

    fn version(&self) -> u32 {
        u32::from(self.minor_version()) << 16 | u32::from(self.major_version())
    }

    pub fn access_flags(&self) -> AccessFlags {
        let mut cursor = ByteCursor::at(&self.buffer, self.header);
        AccessFlags::from_bits_retain(u32::from(cursor.u16().unwrap_or(0)))
    }

    pub fn class_name(&self) -> Result<String> {
        let mut cursor = ByteCursor::at(&self.buffer, self.header + 2);
        self.class_name_at(cursor.u16()?)
    }

    pub fn super_name(&self) -> Result<Option<String>> {
        let mut cursor = ByteCursor::at(&self.buffer, self.header + 4);
        let index = cursor.u16()?;
        if index == 0 {
            Ok(None)
        } else {
            Ok(Some(self.class_name_at(index)?))
        }
    }

    pub fn interfaces(&self) -> Result<Vec<String>> {
        let mut cursor = ByteCursor::at(&self.buffer, self.header + 6);
        let count = cursor.u16()?;
        let mut names = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            names.push(self.class_name_at(cursor.u16()?)?);
        }
        Ok(names)
    }

    pub(crate) fn buffer_rc(&self) -> Rc<Vec<u8>> {
        Rc::clone(&self.buffer)
    }

    pub(crate) fn pool_count(&self) -> u16 {
        self.cp_offsets.len() as u16
    }

    pub(crate) fn pool_bytes(&self) -> &[u8] {
        &self.buffer[10..self.header]
    }

    fn entry_offset(&self, index: u16) -> Result<usize> {
        self.cp_offsets
            .get(usize::from(index))
            .copied()
            .filter(|offset| *offset != 0)
            .ok_or_else(|| Error::malformed(format!("invalid constant pool index {index}")))
    }

    pub(crate) fn utf8_at(&self, index: u16) -> Result<String> {
        let offset = self.entry_offset(index)?;
        if self.buffer[offset - 1] != symbols::TAG_UTF8 {
            return Err(Error::malformed(format!("index {index} is not a Utf8 entry")));
        }
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        let len = cursor.u16()?;
        cursor.utf8(usize::from(len))
    }

    fn opt_utf8_at(&self, index: u16) -> Result<Option<String>> {
        if index == 0 {
            Ok(None)
        } else {
            Ok(Some(self.utf8_at(index)?))
        }
    }

    pub(crate) fn class_name_at(&self, index: u16) -> Result<String> {
        let offset = self.entry_offset(index)?;
        if self.buffer[offset - 1] != symbols::TAG_CLASS {
            return Err(Error::malformed(format!(
                "index {index} is not a Class entry"
            )));
        }
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        let name = cursor.u16()?;
        self.utf8_at(name)
    }

    fn opt_class_name_at(&self, index: u16) -> Result<Option<String>> {
        if index == 0 {
            Ok(None)
        } else {
            Ok(Some(self.class_name_at(index)?))
        }
    }

    fn name_and_type_at(&self, index: u16) -> Result<(String, String)> {
        let offset = self.entry_offset(index)?;
        if self.buffer[offset - 1] != symbols::TAG_NAME_AND_TYPE {
            return Err(Error::malformed(format!(
                "index {index} is not a NameAndType entry"
            )));
        }
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        let name = cursor.u16()?;
        let descriptor = cursor.u16()?;
        Ok((self.utf8_at(name)?, self.utf8_at(descriptor)?))
    }

    /// A member reference: owner, name, descriptor, is-interface.
    fn member_ref_at(&self, index: u16) -> Result<(String, String, String, bool)> {
        let offset = self.entry_offset(index)?;
        let tag = self.buffer[offset - 1];
        if !matches!(
            tag,
            symbols::TAG_FIELD_REF | symbols::TAG_METHOD_REF | symbols::TAG_INTERFACE_METHOD_REF
        ) {
            return Err(Error::malformed(format!(
                "index {index} is not a member reference"
            )));
        }
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        let class = cursor.u16()?;
        let name_and_type = cursor.u16()?;
        let owner = self.class_name_at(class)?;
        let (name, descriptor) = self.name_and_type_at(name_and_type)?;
        Ok((owner, name, descriptor, tag == symbols::TAG_INTERFACE_METHOD_REF))
    }

    fn handle_at(&self, index: u16) -> Result<Handle> {
        let offset = self.entry_offset(index)?;
        if self.buffer[offset - 1] != symbols::TAG_METHOD_HANDLE {
            return Err(Error::malformed(format!(
                "index {index} is not a MethodHandle entry"
            )));
        }
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        let kind = cursor.u8()?;
        let reference = cursor.u16()?;
        let (owner, name, descriptor, is_interface) = self.member_ref_at(reference)?;
        Ok(Handle {
            kind,
            owner,
            name,
            descriptor,
            is_interface,
        })
    }

    fn bootstrap_parts_at(&self, entry_offset: usize, bsm: &[usize]) -> Result<(Handle, Vec<Constant>)> {
        let mut cursor = ByteCursor::at(&self.buffer, entry_offset);
        let handle = self.handle_at(cursor.u16()?)?;
        let argc = cursor.u16()?;
        let mut arguments = Vec::with_capacity(usize::from(argc));
        for _ in 0..argc {
            arguments.push(self.constant_at(cursor.u16()?, bsm)?);
        }
        Ok((handle, arguments))
    }

    /// A loadable constant, as used by `ldc`, bootstrap arguments and
    /// ConstantValue. Nested dynamic constants resolve recursively.
    fn constant_at(&self, index: u16, bsm: &[usize]) -> Result<Constant> {
        let offset = self.entry_offset(index)?;
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        Ok(match self.buffer[offset - 1] {
            symbols::TAG_INTEGER => Constant::Integer(cursor.i32()?),
            symbols::TAG_FLOAT => Constant::Float(cursor.f32()?),
            symbols::TAG_LONG => Constant::Long(cursor.i64()?),
            symbols::TAG_DOUBLE => Constant::Double(cursor.f64()?),
            symbols::TAG_STRING => Constant::String(self.utf8_at(cursor.u16()?)?),
            symbols::TAG_CLASS => Constant::Class(self.utf8_at(cursor.u16()?)?),
            symbols::TAG_METHOD_TYPE => Constant::MethodType(self.utf8_at(cursor.u16()?)?),
            symbols::TAG_METHOD_HANDLE => Constant::MethodHandle(self.handle_at(index)?),
            symbols::TAG_DYNAMIC => {
                let bootstrap = usize::from(cursor.u16()?);
                let name_and_type = cursor.u16()?;
                let entry_offset = *bsm.get(bootstrap).ok_or_else(|| {
                    Error::malformed(format!("invalid bootstrap method index {bootstrap}"))
                })?;
                let (handle, arguments) = self.bootstrap_parts_at(entry_offset, bsm)?;
                let (name, descriptor) = self.name_and_type_at(name_and_type)?;
                Constant::Dynamic(ConstantDynamic {
                    name,
                    descriptor,
                    bootstrap: handle,
                    arguments,
                })
            }
            tag => {
                return Err(Error::malformed(format!(
                    "constant pool entry {index} (tag {tag}) is not loadable"
                )))
            }
        })
    }

    /// The writer-side entry for one pool slot, used by the verbatim pool
    /// copy. Returns `None` for slots shadowed by a long or double.
    pub(crate) fn pool_entry(&self, index: u16) -> Result<Option<Entry>> {
        let offset = match self.cp_offsets.get(usize::from(index)) {
            Some(0) | None => return Ok(None),
            Some(offset) => *offset,
        };
        let mut cursor = ByteCursor::at(&self.buffer, offset);
        Ok(Some(match self.buffer[offset - 1] {
            symbols::TAG_UTF8 => {
                let len = cursor.u16()?;
                Entry::Utf8(cursor.utf8(usize::from(len))?)
            }
            symbols::TAG_INTEGER => Entry::Integer(cursor.i32()?),
            symbols::TAG_FLOAT => Entry::Float(cursor.u32()?),
            symbols::TAG_LONG => Entry::Long(cursor.i64()?),
            symbols::TAG_DOUBLE => Entry::Double(cursor.i64()? as u64),
            symbols::TAG_CLASS => Entry::Class { name: cursor.u16()? },
            symbols::TAG_STRING => Entry::String { utf8: cursor.u16()? },
            symbols::TAG_FIELD_REF => Entry::FieldRef {
                class: cursor.u16()?,
                name_and_type: cursor.u16()?,
            },
            symbols::TAG_METHOD_REF => Entry::MethodRef {
                class: cursor.u16()?,
                name_and_type: cursor.u16()?,
            },
            symbols::TAG_INTERFACE_METHOD_REF => Entry::InterfaceMethodRef {
                class: cursor.u16()?,
                name_and_type: cursor.u16()?,
            },
            symbols::TAG_NAME_AND_TYPE => Entry::NameAndType {
                name: cursor.u16()?,
                descriptor: cursor.u16()?,
            },
            symbols::TAG_METHOD_HANDLE => Entry::MethodHandle {
                kind: cursor.u8()?,
                reference: cursor.u16()?,
            },
            symbols::TAG_METHOD_TYPE => Entry::MethodType {
                descriptor: cursor.u16()?,
            },
            symbols::TAG_DYNAMIC => Entry::Dynamic {
                bootstrap: cursor.u16()?,
                name_and_type: cursor.u16()?,
            },
            symbols::TAG_INVOKE_DYNAMIC => Entry::InvokeDynamic {
                bootstrap: cursor.u16()?,
                name_and_type: cursor.u16()?,
            },
            symbols::TAG_MODULE => Entry::Module { name: cursor.u16()? },
            symbols::TAG_PACKAGE => Entry::Package { name: cursor.u16()? },
            tag => return Err(Error::malformed(format!("unknown constant pool tag {tag}"))),
        }))
    }

    /// Reads one attribute table, returning the spans of its entries.
    fn read_attribute_spans(&self, cursor: &mut ByteCursor<'_>) -> Result<Vec<AttributeSpan>> {
        let count = cursor.u16()?;
        let mut spans = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = self.utf8_at(cursor.u16()?)?;
            let len = cursor.u32()? as usize;
            let start = cursor.position();
            cursor.skip(len)?;
            spans.push(AttributeSpan { name, start, len });
        }
        Ok(spans)
    }

    fn attributes_start(&self) -> Result<usize> {
        let mut cursor = ByteCursor::at(&self.buffer, self.header + 6);
        let interfaces = cursor.u16()?;
        cursor.skip(2 * usize::from(interfaces))?;
        for _ in 0..2 {
            let members = cursor.u16()?;
            for _ in 0..members {
                cursor.skip(6)?;
                let attributes = cursor.u16()?;
                for _ in 0..attributes {
                    cursor.skip(2)?;
                    let len = cursor.u32()?;
                    cursor.skip(len as usize)?;
                }
            }
        }
        Ok(cursor.position())
    }

    /// Count and raw entry bytes of the BootstrapMethods attribute.
    pub(crate) fn bootstrap_region(&self) -> Result<Option<(u16, &[u8])>> {
        let mut cursor = ByteCursor::at(&self.buffer, self.attributes_start()?);
        for span in self.read_attribute_spans(&mut cursor)? {
            if span.name == "BootstrapMethods" {
                let mut body = ByteCursor::at(&self.buffer, span.start);
                let count = body.u16()?;
                return Ok(Some((
                    count,
                    &self.buffer[span.start + 2..span.start + span.len],
                )));
            }
        }
        Ok(None)
    }

    /// Offsets of each bootstrap method entry, for Dynamic resolution.
    fn bootstrap_offsets(&self) -> Result<Vec<usize>> {
        let region = self.bootstrap_region()?;
        let Some((count, bytes)) = region else {
            return Ok(Vec::new());
        };
        let base = bytes.as_ptr() as usize - self.buffer.as_ptr() as usize;
        let mut offsets = Vec::with_capacity(usize::from(count));
        let mut cursor = ByteCursor::new(bytes);
        for _ in 0..count {
            offsets.push(base + cursor.position());
            cursor.skip(2)?;
            let argc = cursor.u16()?;
            cursor.skip(2 * usize::from(argc))?;
        }
        Ok(offsets)
    }

    /// Streams the class file to `sink`. Non-standard attributes whose
    /// names match a codec are decoded through it; other unknown
    /// attributes are forwarded as opaque payloads (class, field and
    /// method level) or skipped (Code level).
    pub fn accept(
        &self,
        sink: &mut dyn ClassSink,
        codecs: &[&dyn AttributeCodec],
        options: ParseOptions,
    ) -> Result<()> {
        let bsm = self.bootstrap_offsets()?;

        let mut cursor = ByteCursor::at(&self.buffer, self.header);
        let mut access = AccessFlags::from_bits_retain(u32::from(cursor.u16()?));
        let this_class = cursor.u16()?;
        let super_class = cursor.u16()?;
        let interface_count = cursor.u16()?;
        let mut interface_names = Vec::with_capacity(usize::from(interface_count));
        for _ in 0..interface_count {
            interface_names.push(self.class_name_at(cursor.u16()?)?);
        }
        let fields_start = cursor.position();

        // Locate every class-level attribute before emitting any event:
        // the prescribed event order differs from the storage order.
        let mut attrs_cursor = ByteCursor::at(&self.buffer, self.attributes_start()?);
        let spans = self.read_attribute_spans(&mut attrs_cursor)?;
        let mut signature = None;
        let mut source_file = None;
        let mut source_debug = None;
        let mut module_span = None;
        let mut module_packages_span = None;
        let mut module_main_class = None;
        let mut nest_host = None;
        let mut nest_members_span = None;
        let mut permitted_span = None;
        let mut inner_classes_span = None;
        let mut enclosing_span = None;
        let mut record_span = None;
        let mut annotation_spans: [Option<usize>; 4] = [None; 4];
        let mut custom = Vec::new();
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" => signature = self.opt_utf8_at(body.u16()?)?,
                "SourceFile" => source_file = self.opt_utf8_at(body.u16()?)?,
                "SourceDebugExtension" => {
                    source_debug = Some(body.clone().utf8(span.len)?);
                }
                "Module" => module_span = Some(span.start),
                "ModulePackages" => module_packages_span = Some(span.start),
                "ModuleMainClass" => module_main_class = self.opt_class_name_at(body.u16()?)?,
                "NestHost" => nest_host = self.opt_class_name_at(body.u16()?)?,
                "NestMembers" => nest_members_span = Some(span.start),
                "PermittedSubclasses" => permitted_span = Some(span.start),
                "InnerClasses" => inner_classes_span = Some(span.start),
                "EnclosingMethod" => enclosing_span = Some(span.start),
                "Record" => record_span = Some(span.start),
                "Synthetic" => access |= AccessFlags::SYNTHETIC,
                "Deprecated" => access |= AccessFlags::DEPRECATED,
                "RuntimeVisibleAnnotations" => annotation_spans[0] = Some(span.start),
                "RuntimeInvisibleAnnotations" => annotation_spans[1] = Some(span.start),
                "RuntimeVisibleTypeAnnotations" => annotation_spans[2] = Some(span.start),
                "RuntimeInvisibleTypeAnnotations" => annotation_spans[3] = Some(span.start),
                "BootstrapMethods" => {}
                _ => custom.push(span),
            }
        }

        let interface_refs: Vec<&str> = interface_names.iter().map(String::as_str).collect();
        sink.visit_class(
            self.version(),
            access,
            &self.class_name_at(this_class)?,
            signature.as_deref(),
            self.opt_class_name_at(super_class)?.as_deref(),
            &interface_refs,
        )?;

        if !options.contains(ParseOptions::SKIP_DEBUG)
            && (source_file.is_some() || source_debug.is_some())
        {
            sink.visit_source(source_file.as_deref(), source_debug.as_deref())?;
        }

        if let Some(start) = module_span {
            self.read_module(
                sink,
                start,
                module_packages_span,
                module_main_class.as_deref(),
            )?;
        }

        if let Some(host) = &nest_host {
            sink.visit_nest_host(host)?;
        }

        if let Some(start) = enclosing_span {
            let mut body = ByteCursor::at(&self.buffer, start);
            let owner = self.class_name_at(body.u16()?)?;
            let method = body.u16()?;
            let (name, descriptor) = match method {
                0 => (None, None),
                index => {
                    let (name, descriptor) = self.name_and_type_at(index)?;
                    (Some(name), Some(descriptor))
                }
            };
            sink.visit_outer_class(&owner, name.as_deref(), descriptor.as_deref())?;
        }

        for (slot, visible, typed) in [
            (0, true, false),
            (1, false, false),
            (2, true, true),
            (3, false, true),
        ] {
            if let Some(start) = annotation_spans[slot] {
                let mut body = ByteCursor::at(&self.buffer, start);
                let count = body.u16()?;
                for _ in 0..count {
                    if typed {
                        let (type_ref, path, descriptor) =
                            self.read_declaration_target(&mut body)?;
                        let target = sink.visit_type_annotation(
                            type_ref,
                            path.as_ref(),
                            &descriptor,
                            visible,
                        )?;
                        self.read_element_values(&mut body, true, target)?;
                    } else {
                        let descriptor = self.utf8_at(body.u16()?)?;
                        let target = sink.visit_annotation(&descriptor, visible)?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
            }
        }

        for span in &custom {
            let attribute = self.decode_attribute(span, codecs)?;
            sink.visit_attribute(attribute)?;
        }

        if let Some(start) = nest_members_span {
            let mut body = ByteCursor::at(&self.buffer, start);
            let count = body.u16()?;
            for _ in 0..count {
                sink.visit_nest_member(&self.class_name_at(body.u16()?)?)?;
            }
        }

        if let Some(start) = permitted_span {
            let mut body = ByteCursor::at(&self.buffer, start);
            let count = body.u16()?;
            for _ in 0..count {
                sink.visit_permitted_subclass(&self.class_name_at(body.u16()?)?)?;
            }
        }

        if let Some(start) = inner_classes_span {
            let mut body = ByteCursor::at(&self.buffer, start);
            let count = body.u16()?;
            for _ in 0..count {
                let name = self.class_name_at(body.u16()?)?;
                let outer = self.opt_class_name_at(body.u16()?)?;
                let inner = self.opt_utf8_at(body.u16()?)?;
                let inner_access = AccessFlags::from_bits_retain(u32::from(body.u16()?));
                sink.visit_inner_class(&name, outer.as_deref(), inner.as_deref(), inner_access)?;
            }
        }

        if let Some(start) = record_span {
            let mut body = ByteCursor::at(&self.buffer, start);
            let count = body.u16()?;
            for _ in 0..count {
                self.read_record_component(sink, &mut body, codecs)?;
            }
        }

        let mut member_cursor = ByteCursor::at(&self.buffer, fields_start);
        let field_count = member_cursor.u16()?;
        for _ in 0..field_count {
            self.read_field(sink, &mut member_cursor, codecs, &bsm, options)?;
        }
        let method_count = member_cursor.u16()?;
        for _ in 0..method_count {
            self.read_method(sink, &mut member_cursor, codecs, &bsm, options)?;
        }

        sink.visit_end()
    }

    fn decode_attribute(
        &self,
        span: &AttributeSpan,
        codecs: &[&dyn AttributeCodec],
    ) -> Result<Attribute> {
        let payload = &self.buffer[span.start..span.start + span.len];
        match find_codec(codecs, &span.name) {
            Some(codec) => codec.read(payload),
            None => Ok(Attribute::new(span.name.clone(), payload.to_vec())),
        }
    }

    fn read_module(
        &self,
        sink: &mut dyn ClassSink,
        start: usize,
        packages_span: Option<usize>,
        main_class: Option<&str>,
    ) -> Result<()> {
        let mut body = ByteCursor::at(&self.buffer, start);
        let name_index = body.u16()?;
        let name = {
            let offset = self.entry_offset(name_index)?;
            if self.buffer[offset - 1] != symbols::TAG_MODULE {
                return Err(Error::malformed("Module attribute must name a Module entry"));
            }
            let mut cursor = ByteCursor::at(&self.buffer, offset);
            self.utf8_at(cursor.u16()?)?
        };
        let flags = AccessFlags::from_bits_retain(u32::from(body.u16()?));
        let version = self.opt_utf8_at(body.u16()?)?;
        let Some(module_sink) = sink.visit_module(&name, flags, version.as_deref())? else {
            return Ok(());
        };

        if let Some(main_class) = main_class {
            module_sink.visit_main_class(main_class)?;
        }
        if let Some(start) = packages_span {
            let mut packages = ByteCursor::at(&self.buffer, start);
            let count = packages.u16()?;
            for _ in 0..count {
                let index = packages.u16()?;
                let offset = self.entry_offset(index)?;
                let mut cursor = ByteCursor::at(&self.buffer, offset);
                module_sink.visit_package(&self.utf8_at(cursor.u16()?)?)?;
            }
        }

        let requires = body.u16()?;
        for _ in 0..requires {
            let index = body.u16()?;
            let offset = self.entry_offset(index)?;
            let mut entry = ByteCursor::at(&self.buffer, offset);
            let module = self.utf8_at(entry.u16()?)?;
            let flags = AccessFlags::from_bits_retain(u32::from(body.u16()?));
            let version = self.opt_utf8_at(body.u16()?)?;
            module_sink.visit_require(&module, flags, version.as_deref())?;
        }
        let exports = body.u16()?;
        for _ in 0..exports {
            let (package, flags, to) = self.read_module_clause(&mut body)?;
            let refs: Vec<&str> = to.iter().map(String::as_str).collect();
            module_sink.visit_export(&package, flags, &refs)?;
        }
        let opens = body.u16()?;
        for _ in 0..opens {
            let (package, flags, to) = self.read_module_clause(&mut body)?;
            let refs: Vec<&str> = to.iter().map(String::as_str).collect();
            module_sink.visit_open(&package, flags, &refs)?;
        }
        let uses = body.u16()?;
        for _ in 0..uses {
            module_sink.visit_use(&self.class_name_at(body.u16()?)?)?;
        }
        let provides = body.u16()?;
        for _ in 0..provides {
            let service = self.class_name_at(body.u16()?)?;
            let count = body.u16()?;
            let mut providers = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                providers.push(self.class_name_at(body.u16()?)?);
            }
            let refs: Vec<&str> = providers.iter().map(String::as_str).collect();
            module_sink.visit_provide(&service, &refs)?;
        }
        module_sink.visit_end()
    }

    /// One exports/opens clause: package, flags, target modules.
    fn read_module_clause(
        &self,
        body: &mut ByteCursor<'_>,
    ) -> Result<(String, AccessFlags, Vec<String>)> {
        let index = body.u16()?;
        let offset = self.entry_offset(index)?;
        if self.buffer[offset - 1] != symbols::TAG_PACKAGE {
            return Err(Error::malformed("module clause must name a Package entry"));
        }
        let mut entry = ByteCursor::at(&self.buffer, offset);
        let package = self.utf8_at(entry.u16()?)?;
        let flags = AccessFlags::from_bits_retain(u32::from(body.u16()?));
        let count = body.u16()?;
        let mut modules = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let index = body.u16()?;
            let offset = self.entry_offset(index)?;
            let mut entry = ByteCursor::at(&self.buffer, offset);
            modules.push(self.utf8_at(entry.u16()?)?);
        }
        Ok((package, flags, modules))
    }

    fn read_record_component(
        &self,
        sink: &mut dyn ClassSink,
        cursor: &mut ByteCursor<'_>,
        codecs: &[&dyn AttributeCodec],
    ) -> Result<()> {
        let name = self.utf8_at(cursor.u16()?)?;
        let descriptor = self.utf8_at(cursor.u16()?)?;
        let spans = self.read_attribute_spans(cursor)?;
        let mut signature = None;
        for span in &spans {
            if span.name == "Signature" {
                let mut body = ByteCursor::at(&self.buffer, span.start);
                signature = self.opt_utf8_at(body.u16()?)?;
            }
        }
        let Some(component) =
            sink.visit_record_component(&name, &descriptor, signature.as_deref())?
        else {
            return Ok(());
        };
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" => {}
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                    let visible = span.name == "RuntimeVisibleAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let descriptor = self.utf8_at(body.u16()?)?;
                        let target = component.visit_annotation(&descriptor, visible)?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    let visible = span.name == "RuntimeVisibleTypeAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let (type_ref, path, descriptor) =
                            self.read_declaration_target(&mut body)?;
                        let target = component.visit_type_annotation(
                            type_ref,
                            path.as_ref(),
                            &descriptor,
                            visible,
                        )?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                _ => {
                    let attribute = self.decode_attribute(span, codecs)?;
                    component.visit_attribute(attribute)?;
                }
            }
        }
        component.visit_end()
    }

    fn read_field(
        &self,
        sink: &mut dyn ClassSink,
        cursor: &mut ByteCursor<'_>,
        codecs: &[&dyn AttributeCodec],
        bsm: &[usize],
        _options: ParseOptions,
    ) -> Result<()> {
        let mut access = AccessFlags::from_bits_retain(u32::from(cursor.u16()?));
        let name = self.utf8_at(cursor.u16()?)?;
        let descriptor = self.utf8_at(cursor.u16()?)?;
        let spans = self.read_attribute_spans(cursor)?;

        let mut signature = None;
        let mut value = None;
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" => signature = self.opt_utf8_at(body.u16()?)?,
                "ConstantValue" => value = Some(self.constant_at(body.u16()?, bsm)?),
                "Synthetic" => access |= AccessFlags::SYNTHETIC,
                "Deprecated" => access |= AccessFlags::DEPRECATED,
                _ => {}
            }
        }

        let Some(field) =
            sink.visit_field(access, &name, &descriptor, signature.as_deref(), value.as_ref())?
        else {
            return Ok(());
        };
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" | "ConstantValue" | "Synthetic" | "Deprecated" => {}
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                    let visible = span.name == "RuntimeVisibleAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let descriptor = self.utf8_at(body.u16()?)?;
                        let target = field.visit_annotation(&descriptor, visible)?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    let visible = span.name == "RuntimeVisibleTypeAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let (type_ref, path, descriptor) =
                            self.read_declaration_target(&mut body)?;
                        let target = field.visit_type_annotation(
                            type_ref,
                            path.as_ref(),
                            &descriptor,
                            visible,
                        )?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                _ => {
                    let attribute = self.decode_attribute(span, codecs)?;
                    field.visit_attribute(attribute)?;
                }
            }
        }
        field.visit_end()
    }

    fn read_method(
        &self,
        sink: &mut dyn ClassSink,
        cursor: &mut ByteCursor<'_>,
        codecs: &[&dyn AttributeCodec],
        bsm: &[usize],
        options: ParseOptions,
    ) -> Result<()> {
        let mut access = AccessFlags::from_bits_retain(u32::from(cursor.u16()?));
        let name = self.utf8_at(cursor.u16()?)?;
        let descriptor = self.utf8_at(cursor.u16()?)?;
        let attributes_at = cursor.position();
        let spans = self.read_attribute_spans(cursor)?;
        let method_end = cursor.position();

        let mut signature = None;
        let mut exceptions = Vec::new();
        let mut code_span = None;
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" => signature = self.opt_utf8_at(body.u16()?)?,
                "Exceptions" => {
                    let count = body.u16()?;
                    for _ in 0..count {
                        exceptions.push(self.class_name_at(body.u16()?)?);
                    }
                }
                "Code" => code_span = Some(span.start),
                "Synthetic" => access |= AccessFlags::SYNTHETIC,
                "Deprecated" => access |= AccessFlags::DEPRECATED,
                _ => {}
            }
        }

        let exception_refs: Vec<&str> = exceptions.iter().map(String::as_str).collect();
        let Some(method) = sink.visit_method(
            access,
            &name,
            &descriptor,
            signature.as_deref(),
            &exception_refs,
        )?
        else {
            return Ok(());
        };

        // Fast path: offer a verbatim copy when nothing in the options or
        // codec set could alter the method's bytes.
        if options.is_empty() && codecs.is_empty() {
            let source = MethodSource {
                buffer: &self.buffer,
                access,
                name: &name,
                descriptor: &descriptor,
                signature: signature.as_deref(),
                exceptions: &exceptions,
                attributes_range: (attributes_at, method_end),
            };
            if method.try_copy_method(&source)? {
                return Ok(());
            }
        }

        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "Signature" | "Exceptions" | "Code" | "Synthetic" | "Deprecated" => {}
                "MethodParameters" => {
                    if !options.contains(ParseOptions::SKIP_DEBUG) {
                        let count = body.u8()?;
                        for _ in 0..count {
                            let name = self.opt_utf8_at(body.u16()?)?;
                            let flags = AccessFlags::from_bits_retain(u32::from(body.u16()?));
                            method.visit_parameter(name.as_deref(), flags)?;
                        }
                    }
                }
                "AnnotationDefault" => {
                    let target = method.visit_annotation_default()?;
                    let target = self.read_element_value(&mut body, None, target)?;
                    if let Some(target) = target {
                        target.visit_end()?;
                    }
                }
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                    let visible = span.name == "RuntimeVisibleAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let descriptor = self.utf8_at(body.u16()?)?;
                        let target = method.visit_annotation(&descriptor, visible)?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                "RuntimeVisibleParameterAnnotations" | "RuntimeInvisibleParameterAnnotations" => {
                    let visible = span.name == "RuntimeVisibleParameterAnnotations";
                    let parameters = body.u8()?;
                    method.visit_annotable_parameter_count(parameters, visible)?;
                    for parameter in 0..parameters {
                        let count = body.u16()?;
                        for _ in 0..count {
                            let descriptor = self.utf8_at(body.u16()?)?;
                            let target =
                                method.visit_parameter_annotation(parameter, &descriptor, visible)?;
                            self.read_element_values(&mut body, true, target)?;
                        }
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    let visible = span.name == "RuntimeVisibleTypeAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let (type_ref, path, descriptor) =
                            self.read_declaration_target(&mut body)?;
                        let target = method.visit_type_annotation(
                            type_ref,
                            path.as_ref(),
                            &descriptor,
                            visible,
                        )?;
                        self.read_element_values(&mut body, true, target)?;
                    }
                }
                _ => {
                    let attribute = self.decode_attribute(span, codecs)?;
                    method.visit_attribute(attribute)?;
                }
            }
        }

        if let Some(code_start) = code_span {
            if !options.contains(ParseOptions::SKIP_CODE) {
                self.read_code(method, code_start, codecs, bsm, options, access, &name, &descriptor)?;
            }
        }
        method.visit_end()
    }

    // ------------------------------------------------------------------
    // Annotation parsing
    // ------------------------------------------------------------------

    /// Reads `num_element_value_pairs` (or array elements when `named` is
    /// false) and closes the annotation sink.
    fn read_element_values(
        &self,
        cursor: &mut ByteCursor<'_>,
        named: bool,
        mut sink: Option<&mut dyn AnnotationSink>,
    ) -> Result<()> {
        let count = cursor.u16()?;
        for _ in 0..count {
            let name = if named {
                Some(self.utf8_at(cursor.u16()?)?)
            } else {
                None
            };
            sink = self.read_element_value(cursor, name.as_deref(), sink)?;
        }
        if let Some(sink) = sink {
            sink.visit_end()?;
        }
        Ok(())
    }

    /// Reads a single element_value.
    fn read_element_value<'sink>(
        &self,
        cursor: &mut ByteCursor<'_>,
        name: Option<&str>,
        mut sink: Option<&'sink mut dyn AnnotationSink>,
    ) -> Result<Option<&'sink mut dyn AnnotationSink>> {
        use crate::sink::AnnotationValue as V;
        let tag = cursor.u8()?;
        match tag {
            b'B' | b'C' | b'I' | b'S' | b'Z' => {
                let index = cursor.u16()?;
                let Constant::Integer(raw) = self.constant_at(index, &[])? else {
                    return Err(Error::malformed("integral element value must be an Integer"));
                };
                let value = match tag {
                    b'B' => V::Byte(raw as i8),
                    b'C' => V::Char(raw as u16),
                    b'S' => V::Short(raw as i16),
                    b'Z' => V::Boolean(raw != 0),
                    _ => V::Int(raw),
                };
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &value)?;
                }
            }
            b'J' => {
                let Constant::Long(raw) = self.constant_at(cursor.u16()?, &[])? else {
                    return Err(Error::malformed("long element value must be a Long"));
                };
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &V::Long(raw))?;
                }
            }
            b'F' => {
                let Constant::Float(raw) = self.constant_at(cursor.u16()?, &[])? else {
                    return Err(Error::malformed("float element value must be a Float"));
                };
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &V::Float(raw))?;
                }
            }
            b'D' => {
                let Constant::Double(raw) = self.constant_at(cursor.u16()?, &[])? else {
                    return Err(Error::malformed("double element value must be a Double"));
                };
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &V::Double(raw))?;
                }
            }
            b's' => {
                let value = self.utf8_at(cursor.u16()?)?;
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &V::String(value))?;
                }
            }
            b'c' => {
                let value = self.utf8_at(cursor.u16()?)?;
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_value(name, &V::Class(value))?;
                }
            }
            b'e' => {
                let type_name = self.utf8_at(cursor.u16()?)?;
                let const_name = self.utf8_at(cursor.u16()?)?;
                if let Some(sink) = sink.as_deref_mut() {
                    sink.visit_enum(name, &type_name, &const_name)?;
                }
            }
            b'@' => {
                let descriptor = self.utf8_at(cursor.u16()?)?;
                let nested = match sink.as_deref_mut() {
                    Some(sink) => sink.visit_annotation(name, &descriptor)?,
                    None => None,
                };
                self.read_element_values(cursor, true, nested)?;
            }
            b'[' => {
                let nested = match sink.as_deref_mut() {
                    Some(sink) => sink.visit_array(name)?,
                    None => None,
                };
                self.read_element_values(cursor, false, nested)?;
            }
            _ => {
                return Err(Error::malformed(format!(
                    "unknown element value tag {}",
                    tag as char
                )))
            }
        }
        Ok(sink)
    }

    /// Reads the target, path and type of one type annotation whose
    /// target cannot reference code (class, field, method declarations),
    /// leaving the cursor at the element values.
    fn read_declaration_target(
        &self,
        cursor: &mut ByteCursor<'_>,
    ) -> Result<(u32, Option<TypePath>, String)> {
        let target_type = cursor.u8()?;
        let type_ref: u32 = match target_type {
            0x00 | 0x01 => {
                let param = cursor.u8()?;
                u32::from(target_type) << 24 | u32::from(param) << 16
            }
            0x10 => {
                let index = cursor.u16()?;
                u32::from(target_type) << 24 | u32::from(index) << 8
            }
            0x11 | 0x12 => {
                let param = cursor.u8()?;
                let bound = cursor.u8()?;
                u32::from(target_type) << 24 | u32::from(param) << 16 | u32::from(bound) << 8
            }
            0x13..=0x15 => u32::from(target_type) << 24,
            0x16 => {
                let param = cursor.u8()?;
                u32::from(target_type) << 24 | u32::from(param) << 16
            }
            0x17 => {
                let index = cursor.u16()?;
                u32::from(target_type) << 24 | u32::from(index) << 8
            }
            _ => {
                return Err(Error::malformed(format!(
                    "type annotation target 0x{target_type:02x} is not valid on a declaration"
                )))
            }
        };
        let path = TypePath::read(cursor)?;
        let descriptor = self.utf8_at(cursor.u16()?)?;
        Ok((type_ref, path, descriptor))
    }

    // ------------------------------------------------------------------
    // Code parsing
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn read_code(
        &self,
        method: &mut dyn MethodSink,
        code_attr_start: usize,
        codecs: &[&dyn AttributeCodec],
        bsm: &[usize],
        options: ParseOptions,
        method_access: AccessFlags,
        method_name: &str,
        method_descriptor: &str,
    ) -> Result<()> {
        let expand_synthetic = options.contains(ParseOptions::EXPAND_SYNTHETIC);
        let expand_frames = options.contains(ParseOptions::EXPAND_FRAMES);

        let mut cursor = ByteCursor::at(&self.buffer, code_attr_start);
        let max_stack = cursor.u16()?;
        let max_locals = cursor.u16()?;
        let code_len = cursor.u32()? as usize;
        let code_start = cursor.position();
        let code = cursor.bytes(code_len)?;

        let mut labels = LabelPool::default();
        // Positions introduced by wide-branch expansion that need an
        // inserted frame in the second writer pass.
        let mut inserted = Vec::new();

        // First pass: discover labels.
        let mut at = 0usize;
        while at < code_len {
            let opcode = code[at];
            if opcode >= opcodes::WIDE_IFEQ && !expand_synthetic {
                return Err(Error::malformed(format!("invalid opcode {opcode} at {at}")));
            }
            match opcodes::shape(opcode) {
                InsnShape::Jump => {
                    let mut operand = ByteCursor::at(code, at + 1);
                    labels.label_at((at as i64 + i64::from(operand.i16()?)) as u32);
                }
                InsnShape::JumpWide => {
                    let mut operand = ByteCursor::at(code, at + 1);
                    labels.label_at((at as i64 + i64::from(operand.i32()?)) as u32);
                }
                InsnShape::SyntheticJump => {
                    let mut operand = ByteCursor::at(code, at + 1);
                    let target = at as u32 + u32::from(operand.u16()?);
                    labels.label_at(target);
                    let base = if opcode >= opcodes::WIDE_IFNULL {
                        opcode - opcodes::WIDE_NULL_DELTA
                    } else {
                        opcode - opcodes::WIDE_COND_DELTA
                    };
                    if base != opcodes::GOTO && base != opcodes::JSR {
                        // The expansion adds a fallthrough label with an
                        // inserted frame.
                        labels.label_at(at as u32 + 3);
                        inserted.push(at as u32 + 3);
                    }
                }
                InsnShape::SyntheticJumpWide => {
                    let mut operand = ByteCursor::at(code, at + 1);
                    labels.label_at((at as i64 + i64::from(operand.i32()?)) as u32);
                    labels.label_at(at as u32 + 5);
                    inserted.push(at as u32 + 5);
                }
                InsnShape::TableSwitch | InsnShape::LookupSwitch => {
                    for target in switch_targets(code, at)? {
                        labels.label_at(target);
                    }
                }
                InsnShape::Invalid => {
                    return Err(Error::malformed(format!("invalid opcode {opcode} at {at}")))
                }
                _ => {}
            }
            at += crate::frame::insn_length(code, at)?;
        }

        // Exception table.
        let exception_count = cursor.u16()?;
        let mut handlers = Vec::with_capacity(usize::from(exception_count));
        for _ in 0..exception_count {
            let start = u32::from(cursor.u16()?);
            let end = u32::from(cursor.u16()?);
            let handler = u32::from(cursor.u16()?);
            let catch_type = self.opt_class_name_at(cursor.u16()?)?;
            labels.label_at(start);
            labels.label_at(end);
            labels.label_at(handler);
            handlers.push((start, end, handler, catch_type));
        }

        // Code attributes.
        let spans = self.read_attribute_spans(&mut cursor)?;
        let mut stack_map_span = None;
        let mut line_tables = Vec::new();
        let mut local_vars = Vec::new();
        let mut local_var_types = Vec::new();
        let mut type_annotations: Vec<CodeTypeAnnotation> = Vec::new();
        for span in &spans {
            let mut body = ByteCursor::at(&self.buffer, span.start);
            match span.name.as_str() {
                "StackMapTable" => {
                    if !options.contains(ParseOptions::SKIP_FRAMES) {
                        stack_map_span = Some(span.start);
                    }
                }
                "LineNumberTable" => {
                    if !options.contains(ParseOptions::SKIP_DEBUG) {
                        let count = body.u16()?;
                        for _ in 0..count {
                            let start = u32::from(body.u16()?);
                            let line = body.u16()?;
                            labels.label_at(start);
                            line_tables.push((start, line));
                        }
                    }
                }
                "LocalVariableTable" => {
                    if !options.contains(ParseOptions::SKIP_DEBUG) {
                        let count = body.u16()?;
                        for _ in 0..count {
                            let start = u32::from(body.u16()?);
                            let length = u32::from(body.u16()?);
                            let name = self.utf8_at(body.u16()?)?;
                            let descriptor = self.utf8_at(body.u16()?)?;
                            let index = body.u16()?;
                            labels.label_at(start);
                            labels.label_at(start + length);
                            local_vars.push((start, length, name, descriptor, index));
                        }
                    }
                }
                "LocalVariableTypeTable" => {
                    if !options.contains(ParseOptions::SKIP_DEBUG) {
                        let count = body.u16()?;
                        for _ in 0..count {
                            let start = body.u16()?;
                            let length = body.u16()?;
                            let name = self.utf8_at(body.u16()?)?;
                            let signature = self.utf8_at(body.u16()?)?;
                            let index = body.u16()?;
                            local_var_types.push((start, length, name, signature, index));
                        }
                    }
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    let visible = span.name == "RuntimeVisibleTypeAnnotations";
                    let count = body.u16()?;
                    for _ in 0..count {
                        let annotation =
                            self.read_code_type_annotation_head(&mut body, visible, &mut labels)?;
                        type_annotations.push(annotation);
                    }
                }
                _ => {
                    if let Some(codec) = find_codec(codecs, &span.name) {
                        let payload = &self.buffer[span.start..span.start + span.len];
                        method.visit_attribute(codec.read(payload)?)?;
                    }
                    // Unknown Code attributes without a codec are dropped:
                    // their payloads routinely embed bytecode offsets that
                    // the writer may shift.
                }
            }
        }

        // Frames, pre-parsed so their offsets can interleave with the
        // instruction walk.
        let frames = match stack_map_span {
            Some(start) => self.read_stack_map(
                start,
                expand_frames,
                &mut labels,
                method_access,
                method_name,
                method_descriptor,
            )?,
            None => Vec::new(),
        };

        method.visit_code()?;

        for (start, end, handler, catch_type) in &handlers {
            method.visit_try_catch_block(
                labels.get(*start).expect("handler labels were created"),
                labels.get(*end).expect("handler labels were created"),
                labels.get(*handler).expect("handler labels were created"),
                catch_type.as_deref(),
            )?;
        }
        for annotation in &type_annotations {
            if annotation.is_catch {
                let target = method.visit_try_catch_annotation(
                    annotation.type_ref,
                    annotation.path.as_ref(),
                    &annotation.descriptor,
                    annotation.visible,
                )?;
                let mut values = ByteCursor::at(&self.buffer, annotation.values_at);
                self.read_element_values(&mut values, true, target)?;
            }
        }

        // Per-instruction annotations replay through offset-sorted
        // cursors, one per visibility.
        let mut visible_insn_annotations: Vec<&CodeTypeAnnotation> = type_annotations
            .iter()
            .filter(|a| a.visible && a.offset.is_some())
            .collect();
        visible_insn_annotations.sort_by_key(|a| a.offset);
        let mut invisible_insn_annotations: Vec<&CodeTypeAnnotation> = type_annotations
            .iter()
            .filter(|a| !a.visible && a.offset.is_some())
            .collect();
        invisible_insn_annotations.sort_by_key(|a| a.offset);
        let mut visible_cursor = 0usize;
        let mut invisible_cursor = 0usize;

        let mut line_map: HashMap<u32, Vec<u16>> = HashMap::new();
        for (start, line) in &line_tables {
            line_map.entry(*start).or_default().push(*line);
        }

        let mut frame_cursor = 0usize;
        let mut inserted_cursor = 0usize;
        inserted.sort_unstable();

        // Second pass: emit.
        let mut at = 0usize;
        while at < code_len {
            let offset = at as u32;
            if let Some(label) = labels.get(offset) {
                method.visit_label(label)?;
                if let Some(lines) = line_map.get(&offset) {
                    for line in lines {
                        method.visit_line_number(*line, label)?;
                    }
                }
            }
            if frame_cursor < frames.len() && frames[frame_cursor].offset == offset {
                let frame = &frames[frame_cursor];
                method.visit_frame(frame.kind, &frame.locals, &frame.stack)?;
                frame_cursor += 1;
            }
            if inserted_cursor < inserted.len() && inserted[inserted_cursor] == offset {
                if !frames.is_empty() {
                    method.visit_frame(FrameKind::Insert, &[], &[])?;
                }
                inserted_cursor += 1;
            }

            let opcode = code[at];
            let insn_len = crate::frame::insn_length(code, at)?;
            self.emit_instruction(method, code, at, opcode, &mut labels, bsm)?;

            for (cursor_index, annotations) in [
                (&mut visible_cursor, &visible_insn_annotations),
                (&mut invisible_cursor, &invisible_insn_annotations),
            ] {
                while *cursor_index < annotations.len()
                    && annotations[*cursor_index].offset == Some(offset)
                {
                    let annotation = annotations[*cursor_index];
                    let target = method.visit_insn_annotation(
                        annotation.type_ref,
                        annotation.path.as_ref(),
                        &annotation.descriptor,
                        annotation.visible,
                    )?;
                    let mut values = ByteCursor::at(&self.buffer, annotation.values_at);
                    self.read_element_values(&mut values, true, target)?;
                    *cursor_index += 1;
                }
            }

            at += insn_len;
        }
        if let Some(label) = labels.get(code_len as u32) {
            method.visit_label(label)?;
        }

        for (start, length, name, descriptor, index) in &local_vars {
            let signature = local_var_types
                .iter()
                .find(|(s, _, n, _, i)| u32::from(*s) == *start && n == name && i == index)
                .map(|(_, _, _, signature, _)| signature.as_str());
            method.visit_local_variable(
                name,
                descriptor,
                signature,
                labels.get(*start).expect("local variable labels were created"),
                labels
                    .get(*start + *length)
                    .expect("local variable labels were created"),
                *index,
            )?;
        }
        for annotation in &type_annotations {
            if let Some(ranges) = &annotation.ranges {
                let mut starts = Vec::with_capacity(ranges.len());
                let mut ends = Vec::with_capacity(ranges.len());
                let mut indices = Vec::with_capacity(ranges.len());
                for (start, length, index) in ranges {
                    starts.push(labels.label_at(u32::from(*start)));
                    ends.push(labels.label_at(u32::from(*start) + u32::from(*length)));
                    indices.push(*index);
                }
                let target = method.visit_local_variable_annotation(
                    annotation.type_ref,
                    annotation.path.as_ref(),
                    &starts,
                    &ends,
                    &indices,
                    &annotation.descriptor,
                    annotation.visible,
                )?;
                let mut values = ByteCursor::at(&self.buffer, annotation.values_at);
                self.read_element_values(&mut values, true, target)?;
            }
        }

        method.visit_maxs(max_stack, max_locals)
    }

    /// Emits the event for the instruction at `at`.
    #[allow(clippy::too_many_arguments)]
    fn emit_instruction(
        &self,
        method: &mut dyn MethodSink,
        code: &[u8],
        at: usize,
        opcode: u8,
        labels: &mut LabelPool,
        bsm: &[usize],
    ) -> Result<()> {
        let mut operand = ByteCursor::at(code, at + 1);
        match opcodes::shape(opcode) {
            InsnShape::Plain => method.visit_insn(opcode)?,
            InsnShape::ImplicitVar => {
                let (base, var) = opcodes::implicit_var(opcode);
                method.visit_var_insn(base, var)?;
            }
            InsnShape::IntByte => {
                let value = if opcode == opcodes::NEWARRAY {
                    i32::from(operand.u8()?)
                } else {
                    i32::from(operand.i8()?)
                };
                method.visit_int_insn(opcode, value)?;
            }
            InsnShape::IntShort => method.visit_int_insn(opcode, i32::from(operand.i16()?))?,
            InsnShape::VarByte => method.visit_var_insn(opcode, u16::from(operand.u8()?))?,
            InsnShape::Ldc => {
                let constant = self.constant_at(u16::from(operand.u8()?), bsm)?;
                method.visit_ldc_insn(&constant)?;
            }
            InsnShape::LdcWide => {
                let constant = self.constant_at(operand.u16()?, bsm)?;
                method.visit_ldc_insn(&constant)?;
            }
            InsnShape::Iinc => {
                let var = u16::from(operand.u8()?);
                let increment = i16::from(operand.i8()?);
                method.visit_iinc_insn(var, increment)?;
            }
            InsnShape::TypeRef => {
                let name = self.class_name_at(operand.u16()?)?;
                method.visit_type_insn(opcode, &name)?;
            }
            InsnShape::FieldRef => {
                let (owner, name, descriptor, _) = self.member_ref_at(operand.u16()?)?;
                method.visit_field_insn(opcode, &owner, &name, &descriptor)?;
            }
            InsnShape::MethodRef => {
                let (owner, name, descriptor, is_interface) =
                    self.member_ref_at(operand.u16()?)?;
                method.visit_method_insn(opcode, &owner, &name, &descriptor, is_interface)?;
            }
            InsnShape::InterfaceMethodRef => {
                let (owner, name, descriptor, _) = self.member_ref_at(operand.u16()?)?;
                method.visit_method_insn(opcode, &owner, &name, &descriptor, true)?;
            }
            InsnShape::InvokeDynamicRef => {
                let index = operand.u16()?;
                let entry_offset = self.entry_offset(index)?;
                if self.buffer[entry_offset - 1] != symbols::TAG_INVOKE_DYNAMIC {
                    return Err(Error::malformed(
                        "invokedynamic must reference an InvokeDynamic entry",
                    ));
                }
                let mut entry = ByteCursor::at(&self.buffer, entry_offset);
                let bootstrap = usize::from(entry.u16()?);
                let name_and_type = entry.u16()?;
                let bootstrap_offset = *bsm.get(bootstrap).ok_or_else(|| {
                    Error::malformed(format!("invalid bootstrap method index {bootstrap}"))
                })?;
                let (handle, arguments) = self.bootstrap_parts_at(bootstrap_offset, bsm)?;
                let (name, descriptor) = self.name_and_type_at(name_and_type)?;
                method.visit_invoke_dynamic_insn(&name, &descriptor, &handle, &arguments)?;
            }
            InsnShape::Jump => {
                let target = (at as i64 + i64::from(operand.i16()?)) as u32;
                method.visit_jump_insn(opcode, labels.label_at(target))?;
            }
            InsnShape::JumpWide => {
                let target = (at as i64 + i64::from(operand.i32()?)) as u32;
                // Wide jumps re-narrow when the writer can reach the target
                // with a 16-bit offset.
                let base = if opcode == opcodes::GOTO_W {
                    opcodes::GOTO
                } else {
                    opcodes::JSR
                };
                method.visit_jump_insn(base, labels.label_at(target))?;
            }
            InsnShape::SyntheticJump => {
                let target = at as u32 + u32::from(operand.u16()?);
                let base = if opcode >= opcodes::WIDE_IFNULL {
                    opcode - opcodes::WIDE_NULL_DELTA
                } else {
                    opcode - opcodes::WIDE_COND_DELTA
                };
                if base == opcodes::GOTO {
                    method.visit_jump_insn(opcodes::GOTO_W, labels.label_at(target))?;
                } else if base == opcodes::JSR {
                    method.visit_jump_insn(opcodes::JSR_W, labels.label_at(target))?;
                } else {
                    // not-X over a wide goto; the fallthrough label and its
                    // inserted frame follow at the next offset.
                    let fallthrough = labels.label_at(at as u32 + 3);
                    method.visit_jump_insn(opcodes::opposite_branch(base), fallthrough)?;
                    method.visit_jump_insn(opcodes::GOTO_W, labels.label_at(target))?;
                }
            }
            InsnShape::SyntheticJumpWide => {
                let target = (at as i64 + i64::from(operand.i32()?)) as u32;
                method.visit_jump_insn(opcodes::GOTO_W, labels.label_at(target))?;
            }
            InsnShape::TableSwitch => {
                let pad = (4 - (at + 1) % 4) % 4;
                let mut body = ByteCursor::at(code, at + 1 + pad);
                let default = labels.label_at((at as i64 + i64::from(body.i32()?)) as u32);
                let low = body.i32()?;
                let high = body.i32()?;
                let mut targets = Vec::with_capacity((high - low + 1) as usize);
                for _ in low..=high {
                    targets.push(labels.label_at((at as i64 + i64::from(body.i32()?)) as u32));
                }
                method.visit_table_switch_insn(low, high, default, &targets)?;
            }
            InsnShape::LookupSwitch => {
                let pad = (4 - (at + 1) % 4) % 4;
                let mut body = ByteCursor::at(code, at + 1 + pad);
                let default = labels.label_at((at as i64 + i64::from(body.i32()?)) as u32);
                let pairs = body.i32()?;
                let mut keys = Vec::with_capacity(pairs as usize);
                let mut targets = Vec::with_capacity(pairs as usize);
                for _ in 0..pairs {
                    keys.push(body.i32()?);
                    targets.push(labels.label_at((at as i64 + i64::from(body.i32()?)) as u32));
                }
                method.visit_lookup_switch_insn(default, &keys, &targets)?;
            }
            InsnShape::MultiANewArray => {
                let descriptor = self.class_name_at(operand.u16()?)?;
                let dimensions = operand.u8()?;
                method.visit_multi_a_new_array_insn(&descriptor, dimensions)?;
            }
            InsnShape::WidePrefix => {
                let sub = operand.u8()?;
                let var = operand.u16()?;
                if sub == opcodes::IINC {
                    method.visit_iinc_insn(var, operand.i16()?)?;
                } else {
                    method.visit_var_insn(sub, var)?;
                }
            }
            InsnShape::Invalid => {
                return Err(Error::malformed(format!("invalid opcode {opcode} at {at}")))
            }
        }
        Ok(())
    }

    /// Reads the head of one code-level type annotation, leaving the
    /// element values for replay.
    fn read_code_type_annotation_head(
        &self,
        cursor: &mut ByteCursor<'_>,
        visible: bool,
        labels: &mut LabelPool,
    ) -> Result<CodeTypeAnnotation> {
        let target_type = cursor.u8()?;
        let mut offset = None;
        let mut ranges = None;
        let mut is_catch = false;
        let type_ref: u32 = match target_type {
            0x40 | 0x41 => {
                let count = cursor.u16()?;
                let mut table = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let start = cursor.u16()?;
                    let length = cursor.u16()?;
                    let index = cursor.u16()?;
                    labels.label_at(u32::from(start));
                    labels.label_at(u32::from(start) + u32::from(length));
                    table.push((start, length, index));
                }
                ranges = Some(table);
                u32::from(target_type) << 24
            }
            0x42 => {
                is_catch = true;
                let index = cursor.u16()?;
                u32::from(target_type) << 24 | u32::from(index) << 8
            }
            0x43..=0x46 => {
                offset = Some(u32::from(cursor.u16()?));
                u32::from(target_type) << 24
            }
            0x47..=0x4B => {
                offset = Some(u32::from(cursor.u16()?));
                let argument = cursor.u8()?;
                u32::from(target_type) << 24 | u32::from(argument)
            }
            _ => {
                return Err(Error::malformed(format!(
                    "type annotation target 0x{target_type:02x} is not valid in code"
                )))
            }
        };
        let path = TypePath::read(cursor)?;
        let descriptor = self.utf8_at(cursor.u16()?)?;
        let values_at = cursor.position();
        // Skip the values; they replay later from `values_at`.
        self.read_element_values(cursor, true, None)?;
        Ok(CodeTypeAnnotation {
            visible,
            type_ref,
            offset,
            ranges,
            is_catch,
            path,
            descriptor,
            values_at,
        })
    }

    /// Pre-parses the StackMapTable into offset-keyed frames, creating
    /// labels for every frame offset and every uninitialized type.
    fn read_stack_map(
        &self,
        start: usize,
        expand: bool,
        labels: &mut LabelPool,
        method_access: AccessFlags,
        method_name: &str,
        method_descriptor: &str,
    ) -> Result<Vec<RawFrame>> {
        let mut cursor = ByteCursor::at(&self.buffer, start);
        let count = cursor.u16()?;
        let mut frames = Vec::with_capacity(usize::from(count));
        let mut offset: i64 = -1;
        // Absolute locals, maintained only when expanding.
        let mut current_locals: Vec<FrameItem> = if expand {
            self.initial_frame_items(method_access, method_name, method_descriptor)?
        } else {
            Vec::new()
        };
        for _ in 0..count {
            let tag = cursor.u8()?;
            let (delta, kind, locals, stack): (u16, FrameKind, Vec<FrameItem>, Vec<FrameItem>) =
                match tag {
                    0..=63 => (u16::from(tag), FrameKind::Same, Vec::new(), Vec::new()),
                    64..=127 => {
                        let item = self.read_frame_item(&mut cursor, labels)?;
                        (u16::from(tag - 64), FrameKind::SameLocals1, Vec::new(), vec![item])
                    }
                    247 => {
                        let delta = cursor.u16()?;
                        let item = self.read_frame_item(&mut cursor, labels)?;
                        (delta, FrameKind::SameLocals1, Vec::new(), vec![item])
                    }
                    248..=250 => {
                        let delta = cursor.u16()?;
                        (delta, FrameKind::Chop(251 - tag), Vec::new(), Vec::new())
                    }
                    251 => {
                        let delta = cursor.u16()?;
                        (delta, FrameKind::Same, Vec::new(), Vec::new())
                    }
                    252..=254 => {
                        let delta = cursor.u16()?;
                        let mut locals = Vec::with_capacity(usize::from(tag - 251));
                        for _ in 0..tag - 251 {
                            locals.push(self.read_frame_item(&mut cursor, labels)?);
                        }
                        (delta, FrameKind::Append, locals, Vec::new())
                    }
                    255 => {
                        let delta = cursor.u16()?;
                        let local_count = cursor.u16()?;
                        let mut locals = Vec::with_capacity(usize::from(local_count));
                        for _ in 0..local_count {
                            locals.push(self.read_frame_item(&mut cursor, labels)?);
                        }
                        let stack_count = cursor.u16()?;
                        let mut stack = Vec::with_capacity(usize::from(stack_count));
                        for _ in 0..stack_count {
                            stack.push(self.read_frame_item(&mut cursor, labels)?);
                        }
                        (delta, FrameKind::Full, locals, stack)
                    }
                    tag => {
                        return Err(Error::malformed(format!(
                            "reserved stack map frame tag {tag}"
                        )))
                    }
                };
            offset += i64::from(delta) + 1;
            let frame_offset = offset as u32;
            labels.label_at(frame_offset);
            if expand {
                match kind {
                    FrameKind::Same => {}
                    FrameKind::SameLocals1 => {}
                    FrameKind::Chop(n) => {
                        let keep = current_locals
                            .len()
                            .checked_sub(usize::from(n))
                            .ok_or_else(|| Error::malformed("chop frame below zero locals"))?;
                        current_locals.truncate(keep);
                    }
                    FrameKind::Append => current_locals.extend(locals.iter().cloned()),
                    FrameKind::Full => current_locals = locals.clone(),
                    _ => {}
                }
                frames.push(RawFrame {
                    offset: frame_offset,
                    kind: FrameKind::New,
                    locals: current_locals.clone(),
                    stack,
                });
            } else {
                frames.push(RawFrame {
                    offset: frame_offset,
                    kind,
                    locals,
                    stack,
                });
            }
        }
        Ok(frames)
    }

    fn read_frame_item(
        &self,
        cursor: &mut ByteCursor<'_>,
        labels: &mut LabelPool,
    ) -> Result<FrameItem> {
        Ok(match cursor.u8()? {
            0 => FrameItem::Top,
            1 => FrameItem::Integer,
            2 => FrameItem::Float,
            3 => FrameItem::Double,
            4 => FrameItem::Long,
            5 => FrameItem::Null,
            6 => FrameItem::UninitializedThis,
            7 => FrameItem::Object(self.class_name_at(cursor.u16()?)?),
            8 => FrameItem::Uninitialized(labels.label_at(u32::from(cursor.u16()?))),
            tag => {
                return Err(Error::malformed(format!(
                    "invalid verification type tag {tag}"
                )))
            }
        })
    }

    /// The implicit frame locals at offset 0, in item form.
    fn initial_frame_items(
        &self,
        method_access: AccessFlags,
        method_name: &str,
        method_descriptor: &str,
    ) -> Result<Vec<FrameItem>> {
        let mut locals = Vec::new();
        if !method_access.contains(AccessFlags::STATIC) {
            if method_name == "<init>" {
                locals.push(FrameItem::UninitializedThis);
            } else {
                locals.push(FrameItem::Object(self.class_name()?));
            }
        }
        let (args, _) = types::split_method_descriptor(method_descriptor)?;
        for arg in types::arguments(args) {
            let arg = arg?;
            locals.push(match arg.as_bytes()[0] {
                b'B' | b'C' | b'I' | b'S' | b'Z' => FrameItem::Integer,
                b'F' => FrameItem::Float,
                b'J' => FrameItem::Long,
                b'D' => FrameItem::Double,
                b'L' => FrameItem::Object(arg[1..arg.len() - 1].to_owned()),
                _ => FrameItem::Object(arg.to_owned()),
            });
        }
        Ok(locals)
    }
}

struct RawFrame {
    offset: u32,
    kind: FrameKind,
    locals: Vec<FrameItem>,
    stack: Vec<FrameItem>,
}

/// Targets of a switch instruction, default first.
fn switch_targets(code: &[u8], at: usize) -> Result<Vec<u32>> {
    let pad = (4 - (at + 1) % 4) % 4;
    let mut cursor = ByteCursor::at(code, at + 1 + pad);
    let default = (at as i64 + i64::from(cursor.i32()?)) as u32;
    let mut targets = vec![default];
    if code[at] == opcodes::TABLESWITCH {
        let low = cursor.i32()?;
        let high = cursor.i32()?;
        for _ in low..=high {
            targets.push((at as i64 + i64::from(cursor.i32()?)) as u32);
        }
    } else {
        let pairs = cursor.i32()?;
        for _ in 0..pairs {
            cursor.i32()?;
            targets.push((at as i64 + i64::from(cursor.i32()?)) as u32);
        }
    }
    Ok(targets)
}
