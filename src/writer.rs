//! The class writer: an event sink serializing a complete class file.
use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::annotation::AnnotationSet;
use crate::attribute::{warn_opaque_relocation, Attribute};
use crate::buffer::ByteVector;
use crate::constant::Constant;
use crate::error::{Error, Result};
use crate::field::{FieldWriter, RecordComponentWriter};
use crate::flags::{AccessFlags, ParseOptions, WriterFlags};
use crate::method::{FrameStrategy, MethodWriter};
use crate::module::ModuleWriter;
use crate::reader::ClassReader;
use crate::sink::{
    AnnotationSink, ClassSink, FieldSink, MethodSink, ModuleSink, RecordComponentSink, TypePath,
};
use crate::symbols::{object_root_oracle, SymbolTable};

/// Event sink that serializes a class file into a byte vector, optionally
/// recomputing max stack/locals and stack map frames.
///
/// Build one from scratch with [`ClassWriter::new`], or with
/// [`ClassWriter::with_copy_pool`] to adopt a reader's constant pool
/// verbatim, which preserves pool indices, enables byte-identical round
/// trips and the per-method verbatim copy fast path.
pub struct ClassWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    flags: WriterFlags,
    strategy_override: Option<FrameStrategy>,
    source: Option<Rc<Vec<u8>>>,
    oracle: Rc<dyn Fn(&str, &str) -> String>,

    version: u32,
    access: AccessFlags,
    class_name: String,
    this_class: u16,
    super_class: u16,
    signature: Option<String>,
    interfaces: Vec<u16>,
    header_set: bool,

    source_file: Option<String>,
    source_debug: Option<String>,
    module: Option<ModuleWriter>,
    nest_host_index: u16,
    enclosing_class_index: u16,
    enclosing_method_index: u16,
    has_enclosing: bool,
    annotations: AnnotationSet,
    invisible_annotations: AnnotationSet,
    type_annotations: AnnotationSet,
    invisible_type_annotations: AnnotationSet,
    nest_members: ByteVector,
    nest_member_count: u16,
    permitted_subclasses: ByteVector,
    permitted_subclass_count: u16,
    inner_classes: ByteVector,
    inner_class_count: u16,
    record_components: Vec<RecordComponentWriter>,
    fields: Vec<FieldWriter>,
    methods: Vec<MethodWriter>,
    attributes: Vec<Attribute>,
}

impl ClassWriter {
    /// A writer with a fresh, empty constant pool.
    pub fn new(flags: WriterFlags) -> ClassWriter {
        Self::build(flags, Rc::new(RefCell::new(SymbolTable::new())), None)
    }

    /// A writer whose constant pool starts as a verbatim copy of the
    /// reader's.
    pub fn with_copy_pool(reader: &ClassReader, flags: WriterFlags) -> Result<ClassWriter> {
        let symbols = SymbolTable::copy_from(reader)?;
        Ok(Self::build(
            flags,
            Rc::new(RefCell::new(symbols)),
            Some(reader.buffer_rc()),
        ))
    }

    fn build(
        flags: WriterFlags,
        symbols: Rc<RefCell<SymbolTable>>,
        source: Option<Rc<Vec<u8>>>,
    ) -> ClassWriter {
        ClassWriter {
            symbols,
            flags,
            strategy_override: None,
            source,
            oracle: Rc::new(|a: &str, b: &str| object_root_oracle(a, b)),
            version: 0,
            access: AccessFlags::empty(),
            class_name: String::new(),
            this_class: 0,
            super_class: 0,
            signature: None,
            interfaces: Vec::new(),
            header_set: false,
            source_file: None,
            source_debug: None,
            module: None,
            nest_host_index: 0,
            enclosing_class_index: 0,
            enclosing_method_index: 0,
            has_enclosing: false,
            annotations: AnnotationSet::default(),
            invisible_annotations: AnnotationSet::default(),
            type_annotations: AnnotationSet::default(),
            invisible_type_annotations: AnnotationSet::default(),
            nest_members: ByteVector::new(),
            nest_member_count: 0,
            permitted_subclasses: ByteVector::new(),
            permitted_subclass_count: 0,
            inner_classes: ByteVector::new(),
            inner_class_count: 0,
            record_components: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Installs the common-supertype oracle used when frames are computed.
    /// The default maps every pair of distinct classes to
    /// `java/lang/Object`.
    pub fn set_common_superclass_fn(
        &mut self,
        oracle: impl Fn(&str, &str) -> String + 'static,
    ) {
        self.oracle = Rc::new(oracle);
    }

    fn major_version(&self) -> u16 {
        self.version as u16
    }

    /// Strategy selection: frames imply a full recomputation; so does
    /// maxs-only on 1.7+ classes, which require valid frames anyway.
    fn strategy(&self) -> FrameStrategy {
        if let Some(strategy) = self.strategy_override {
            return strategy;
        }
        if self.flags.contains(WriterFlags::COMPUTE_FRAMES) {
            FrameStrategy::All
        } else if self.flags.contains(WriterFlags::COMPUTE_MAXS) {
            if self.major_version() >= 51 {
                FrameStrategy::All
            } else {
                FrameStrategy::MaxsOnly
            }
        } else {
            FrameStrategy::None
        }
    }

    fn require_header(&self) -> Result<()> {
        if !self.header_set {
            return Err(Error::invalid("visit_class must be the first event"));
        }
        Ok(())
    }

    /// Serializes the class file. When wide-branch expansion left
    /// writer-internal opcodes in some method, the emitted bytes are
    /// re-parsed into a fresh writer that expands them and inserts the
    /// missing frames; the spec guarantees this settles within two passes.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.require_header()?;

        let mut fields_buf = ByteVector::new();
        for field in &self.fields {
            field.put(&mut fields_buf)?;
        }
        let mut methods_buf = ByteVector::new();
        let mut has_synthetic = false;
        for method in &mut self.methods {
            method.put(&mut methods_buf)?;
            has_synthetic |= method.has_synthetic_branches();
        }
        let (attr_count, attrs_buf) = self.put_class_attributes()?;

        // The pool count is validated as entries are interned; past this
        // point serialization cannot fail on size.
        let symbols = self.symbols.borrow();
        let mut out = ByteVector::new();
        out.put_u32(0xCAFE_BABE);
        out.put_u16((self.version >> 16) as u16);
        out.put_u16(self.version as u16);
        symbols.put_pool(&mut out);
        out.put_u16(self.access.wire_bits());
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        out.put_u16(self.fields.len() as u16);
        out.put_bytes(fields_buf.as_slice());
        out.put_u16(self.methods.len() as u16);
        out.put_bytes(methods_buf.as_slice());
        out.put_u16(attr_count);
        out.put_bytes(attrs_buf.as_slice());
        drop(symbols);

        let bytes = out.into_vec();
        if !has_synthetic {
            return Ok(bytes);
        }

        // Second pass: expand the internal wide-branch opcodes and compute
        // frames at the positions the expansion introduced.
        debug!(
            "class {} contains expanded wide branches, rewriting in a second pass",
            self.class_name
        );
        let reader = ClassReader::new_unchecked(bytes)?;
        let mut rewriter = ClassWriter::with_copy_pool(&reader, WriterFlags::empty())?;
        rewriter.strategy_override = Some(FrameStrategy::InsertedOnly);
        rewriter.oracle = Rc::clone(&self.oracle);
        reader.accept(
            &mut rewriter,
            &[],
            ParseOptions::EXPAND_FRAMES | ParseOptions::EXPAND_SYNTHETIC,
        )?;
        rewriter.to_bytes()
    }

    fn put_class_attributes(&mut self) -> Result<(u16, ByteVector)> {
        // Record components intern through their own handle on the symbol
        // table, so serialize them before taking the long borrow below.
        let record_body = if self.record_components.is_empty() {
            None
        } else {
            let mut body = ByteVector::new();
            for component in &self.record_components {
                component.put(&mut body)?;
            }
            Some(body)
        };

        let symbols = Rc::clone(&self.symbols);
        let mut symbols = symbols.borrow_mut();
        let mut out = ByteVector::new();
        let mut count: u16 = 0;

        if self.inner_class_count > 0 {
            count += 1;
            let name = symbols.utf8("InnerClasses")?;
            out.put_u16(name);
            out.put_u32(2 + self.inner_classes.len() as u32);
            out.put_u16(self.inner_class_count);
            out.put_bytes(self.inner_classes.as_slice());
        }
        if self.has_enclosing {
            count += 1;
            let name = symbols.utf8("EnclosingMethod")?;
            out.put_u16(name);
            out.put_u32(4);
            out.put_u16(self.enclosing_class_index);
            out.put_u16(self.enclosing_method_index);
        }
        if self.major_version() < 49 && self.access.contains(AccessFlags::SYNTHETIC) {
            count += 1;
            let name = symbols.utf8("Synthetic")?;
            out.put_u16(name);
            out.put_u32(0);
        }
        if let Some(signature) = &self.signature {
            count += 1;
            let name = symbols.utf8("Signature")?;
            let value = symbols.utf8(signature)?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(value);
        }
        if let Some(source_file) = &self.source_file {
            count += 1;
            let name = symbols.utf8("SourceFile")?;
            let value = symbols.utf8(source_file)?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(value);
        }
        if let Some(debug_extension) = &self.source_debug {
            count += 1;
            let name = symbols.utf8("SourceDebugExtension")?;
            let encoded = cesu8::to_java_cesu8(debug_extension);
            out.put_u16(name);
            out.put_u32(encoded.len() as u32);
            out.put_bytes(&encoded);
        }
        if self.access.contains(AccessFlags::DEPRECATED) {
            count += 1;
            let name = symbols.utf8("Deprecated")?;
            out.put_u16(name);
            out.put_u32(0);
        }
        for (attr_name, set) in [
            ("RuntimeVisibleAnnotations", &self.annotations),
            ("RuntimeInvisibleAnnotations", &self.invisible_annotations),
            ("RuntimeVisibleTypeAnnotations", &self.type_annotations),
            (
                "RuntimeInvisibleTypeAnnotations",
                &self.invisible_type_annotations,
            ),
        ] {
            if !set.is_empty() {
                count += 1;
                let name = symbols.utf8(attr_name)?;
                out.put_u16(name);
                out.put_u32(set.payload_len() as u32);
                set.put(&mut out);
            }
        }
        if let Some(body) = &record_body {
            count += 1;
            let name = symbols.utf8("Record")?;
            out.put_u16(name);
            out.put_u32(2 + body.len() as u32);
            out.put_u16(self.record_components.len() as u16);
            out.put_bytes(body.as_slice());
        }
        if let Some(module) = &self.module {
            count += 1;
            let name = symbols.utf8("Module")?;
            out.put_u16(name);
            out.put_u32(module.module_len() as u32);
            module.put_module(&mut out);
            if module.has_packages() {
                count += 1;
                let name = symbols.utf8("ModulePackages")?;
                out.put_u16(name);
                out.put_u32(module.packages_len() as u32);
                module.put_packages(&mut out);
            }
            if module.has_main_class() {
                count += 1;
                let name = symbols.utf8("ModuleMainClass")?;
                out.put_u16(name);
                out.put_u32(2);
                out.put_u16(module.main_class_index());
            }
        }
        if self.nest_host_index != 0 {
            count += 1;
            let name = symbols.utf8("NestHost")?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(self.nest_host_index);
        }
        if self.nest_member_count > 0 {
            count += 1;
            let name = symbols.utf8("NestMembers")?;
            out.put_u16(name);
            out.put_u32(2 + self.nest_members.len() as u32);
            out.put_u16(self.nest_member_count);
            out.put_bytes(self.nest_members.as_slice());
        }
        if self.permitted_subclass_count > 0 {
            count += 1;
            let name = symbols.utf8("PermittedSubclasses")?;
            out.put_u16(name);
            out.put_u32(2 + self.permitted_subclasses.len() as u32);
            out.put_u16(self.permitted_subclass_count);
            out.put_bytes(self.permitted_subclasses.as_slice());
        }
        for attribute in &self.attributes {
            count += 1;
            let name = symbols.utf8(&attribute.name)?;
            out.put_u16(name);
            out.put_u32(attribute.payload.len() as u32);
            out.put_bytes(&attribute.payload);
        }
        if let Some((bootstrap_count, bootstrap_bytes)) = symbols.bootstrap_methods() {
            let bytes = bootstrap_bytes.to_vec();
            count += 1;
            let name = symbols.utf8("BootstrapMethods")?;
            out.put_u16(name);
            out.put_u32(2 + bytes.len() as u32);
            out.put_u16(bootstrap_count);
            out.put_bytes(&bytes);
        }
        Ok((count, out))
    }
}

impl ClassSink for ClassWriter {
    fn visit_class(
        &mut self,
        version: u32,
        access: AccessFlags,
        name: &str,
        signature: Option<&str>,
        super_name: Option<&str>,
        interfaces: &[&str],
    ) -> Result<()> {
        if self.header_set {
            return Err(Error::invalid("visit_class called twice"));
        }
        let mut symbols = self.symbols.borrow_mut();
        self.version = version;
        self.access = access;
        self.class_name = name.to_owned();
        self.this_class = symbols.class(name)?;
        self.super_class = match super_name {
            Some(super_name) => symbols.class(super_name)?,
            None => 0,
        };
        self.signature = signature.map(str::to_owned);
        self.interfaces = interfaces
            .iter()
            .map(|interface| symbols.class(interface))
            .collect::<Result<_>>()?;
        self.header_set = true;
        Ok(())
    }

    fn visit_source(&mut self, source: Option<&str>, debug: Option<&str>) -> Result<()> {
        self.source_file = source.map(str::to_owned);
        self.source_debug = debug.map(str::to_owned);
        Ok(())
    }

    fn visit_module(
        &mut self,
        name: &str,
        access: AccessFlags,
        version: Option<&str>,
    ) -> Result<Option<&mut dyn ModuleSink>> {
        self.require_header()?;
        let writer = ModuleWriter::new(Rc::clone(&self.symbols), name, access, version)?;
        self.module = Some(writer);
        Ok(Some(self.module.as_mut().unwrap()))
    }

    fn visit_nest_host(&mut self, host: &str) -> Result<()> {
        self.nest_host_index = self.symbols.borrow_mut().class(host)?;
        Ok(())
    }

    fn visit_outer_class(
        &mut self,
        owner: &str,
        method_name: Option<&str>,
        method_descriptor: Option<&str>,
    ) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        self.enclosing_class_index = symbols.class(owner)?;
        self.enclosing_method_index = match (method_name, method_descriptor) {
            (Some(name), Some(descriptor)) => symbols.name_and_type(name, descriptor)?,
            _ => 0,
        };
        self.has_enclosing = true;
        Ok(())
    }

    fn visit_annotation(
        &mut self,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let symbols = Rc::clone(&self.symbols);
        let set = if visible {
            &mut self.annotations
        } else {
            &mut self.invisible_annotations
        };
        Ok(Some(set.add_annotation(&symbols, descriptor)?))
    }

    fn visit_type_annotation(
        &mut self,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
        visible: bool,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        let symbols = Rc::clone(&self.symbols);
        let set = if visible {
            &mut self.type_annotations
        } else {
            &mut self.invisible_type_annotations
        };
        Ok(Some(set.add_type_annotation(
            &symbols, type_ref, type_path, descriptor,
        )?))
    }

    fn visit_attribute(&mut self, attribute: Attribute) -> Result<()> {
        if self.source.is_none() {
            warn_opaque_relocation(&attribute.name);
        }
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_nest_member(&mut self, member: &str) -> Result<()> {
        let index = self.symbols.borrow_mut().class(member)?;
        self.nest_members.put_u16(index);
        self.nest_member_count += 1;
        Ok(())
    }

    fn visit_permitted_subclass(&mut self, subclass: &str) -> Result<()> {
        let index = self.symbols.borrow_mut().class(subclass)?;
        self.permitted_subclasses.put_u16(index);
        self.permitted_subclass_count += 1;
        Ok(())
    }

    fn visit_inner_class(
        &mut self,
        name: &str,
        outer_name: Option<&str>,
        inner_name: Option<&str>,
        access: AccessFlags,
    ) -> Result<()> {
        let mut symbols = self.symbols.borrow_mut();
        let name_index = symbols.class(name)?;
        let outer_index = match outer_name {
            Some(outer) => symbols.class(outer)?,
            None => 0,
        };
        let inner_index = match inner_name {
            Some(inner) => symbols.utf8(inner)?,
            None => 0,
        };
        self.inner_classes.put_u16(name_index);
        self.inner_classes.put_u16(outer_index);
        self.inner_classes.put_u16(inner_index);
        self.inner_classes.put_u16(access.wire_bits());
        self.inner_class_count += 1;
        Ok(())
    }

    fn visit_record_component(
        &mut self,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
    ) -> Result<Option<&mut dyn RecordComponentSink>> {
        self.require_header()?;
        let writer =
            RecordComponentWriter::new(Rc::clone(&self.symbols), name, descriptor, signature)?;
        self.record_components.push(writer);
        Ok(Some(self.record_components.last_mut().unwrap()))
    }

    fn visit_field(
        &mut self,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        value: Option<&Constant>,
    ) -> Result<Option<&mut dyn FieldSink>> {
        self.require_header()?;
        let writer = FieldWriter::new(
            Rc::clone(&self.symbols),
            self.major_version(),
            access,
            name,
            descriptor,
            signature,
            value,
        )?;
        self.fields.push(writer);
        Ok(Some(self.fields.last_mut().unwrap()))
    }

    fn visit_method(
        &mut self,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        exceptions: &[&str],
    ) -> Result<Option<&mut dyn MethodSink>> {
        self.require_header()?;
        let writer = MethodWriter::new(
            Rc::clone(&self.symbols),
            self.strategy(),
            self.class_name.clone(),
            self.major_version(),
            Rc::clone(&self.oracle),
            self.source.clone(),
            access,
            name,
            descriptor,
            signature,
            exceptions,
        )?;
        self.methods.push(writer);
        Ok(Some(self.methods.last_mut().unwrap()))
    }

    fn visit_end(&mut self) -> Result<()> {
        self.require_header()
    }
}
