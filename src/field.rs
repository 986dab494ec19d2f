//! Serialization of one field.
use std::cell::RefCell;
use std::rc::Rc;

use crate::annotation::AnnotationSet;
use crate::attribute::Attribute;
use crate::buffer::ByteVector;
use crate::constant::Constant;
use crate::error::{Error, Result};
use crate::flags::AccessFlags;
use crate::sink::{AnnotationSink, FieldSink, RecordComponentSink, TypePath};
use crate::symbols::SymbolTable;

/// Event sink building the `field_info` structure for one field.
pub struct FieldWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    class_major: u16,
    access: AccessFlags,
    name_index: u16,
    descriptor_index: u16,
    signature: Option<String>,
    constant_value_index: u16,
    annotations: AnnotationSet,
    invisible_annotations: AnnotationSet,
    type_annotations: AnnotationSet,
    invisible_type_annotations: AnnotationSet,
    attributes: Vec<Attribute>,
}

impl FieldWriter {
    pub(crate) fn new(
        symbols: Rc<RefCell<SymbolTable>>,
        class_major: u16,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
        value: Option<&Constant>,
    ) -> Result<FieldWriter> {
        let (name_index, descriptor_index, constant_value_index) = {
            let mut table = symbols.borrow_mut();
            let name_index = table.utf8(name)?;
            let descriptor_index = table.utf8(descriptor)?;
            let constant_value_index = match value {
                Some(constant) => match constant {
                    Constant::Integer(_)
                    | Constant::Float(_)
                    | Constant::Long(_)
                    | Constant::Double(_)
                    | Constant::String(_) => table.constant(constant)?,
                    _ => {
                        return Err(Error::invalid(
                            "a ConstantValue must be a primitive or string constant",
                        ))
                    }
                },
                None => 0,
            };
            (name_index, descriptor_index, constant_value_index)
        };
        Ok(FieldWriter {
            symbols,
            class_major,
            access,
            name_index,
            descriptor_index,
            signature: signature.map(str::to_owned),
            constant_value_index,
            annotations: AnnotationSet::default(),
            invisible_annotations: AnnotationSet::default(),
            type_annotations: AnnotationSet::default(),
            invisible_type_annotations: AnnotationSet::default(),
            attributes: Vec::new(),
        })
    }

    /// Serializes the field_info into `out`.
    pub(crate) fn put(&self, out: &mut ByteVector) -> Result<()> {
        let symbols = Rc::clone(&self.symbols);
        let mut symbols = symbols.borrow_mut();

        out.put_u16(self.access.wire_bits());
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);

        let use_synthetic_attr =
            self.class_major < 49 && self.access.contains(AccessFlags::SYNTHETIC);
        let deprecated = self.access.contains(AccessFlags::DEPRECATED);

        let mut count: u16 = 0;
        if self.constant_value_index != 0 {
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
        for set in [
            &self.annotations,
            &self.invisible_annotations,
            &self.type_annotations,
            &self.invisible_type_annotations,
        ] {
            if !set.is_empty() {
                count += 1;
            }
        }
        count += self.attributes.len() as u16;
        out.put_u16(count);

        if self.constant_value_index != 0 {
            let name = symbols.utf8("ConstantValue")?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(self.constant_value_index);
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
                let name = symbols.utf8(attr_name)?;
                out.put_u16(name);
                out.put_u32(set.payload_len() as u32);
                set.put(out);
            }
        }
        for attribute in &self.attributes {
            let name = symbols.utf8(&attribute.name)?;
            out.put_u16(name);
            out.put_u32(attribute.payload.len() as u32);
            out.put_bytes(&attribute.payload);
        }
        Ok(())
    }
}

/// Event sink building one `record_component_info` structure.
pub struct RecordComponentWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    name_index: u16,
    descriptor_index: u16,
    signature: Option<String>,
    annotations: AnnotationSet,
    invisible_annotations: AnnotationSet,
    type_annotations: AnnotationSet,
    invisible_type_annotations: AnnotationSet,
    attributes: Vec<Attribute>,
}

impl RecordComponentWriter {
    pub(crate) fn new(
        symbols: Rc<RefCell<SymbolTable>>,
        name: &str,
        descriptor: &str,
        signature: Option<&str>,
    ) -> Result<RecordComponentWriter> {
        let (name_index, descriptor_index) = {
            let mut table = symbols.borrow_mut();
            (table.utf8(name)?, table.utf8(descriptor)?)
        };
        Ok(RecordComponentWriter {
            symbols,
            name_index,
            descriptor_index,
            signature: signature.map(str::to_owned),
            annotations: AnnotationSet::default(),
            invisible_annotations: AnnotationSet::default(),
            type_annotations: AnnotationSet::default(),
            invisible_type_annotations: AnnotationSet::default(),
            attributes: Vec::new(),
        })
    }

    pub(crate) fn put(&self, out: &mut ByteVector) -> Result<()> {
        let symbols = Rc::clone(&self.symbols);
        let mut symbols = symbols.borrow_mut();

        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);

        let mut count: u16 = 0;
        if self.signature.is_some() {
            count += 1;
        }
        for set in [
            &self.annotations,
            &self.invisible_annotations,
            &self.type_annotations,
            &self.invisible_type_annotations,
        ] {
            if !set.is_empty() {
                count += 1;
            }
        }
        count += self.attributes.len() as u16;
        out.put_u16(count);

        if let Some(signature) = &self.signature {
            let name = symbols.utf8("Signature")?;
            let value = symbols.utf8(signature)?;
            out.put_u16(name);
            out.put_u32(2);
            out.put_u16(value);
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
                let name = symbols.utf8(attr_name)?;
                out.put_u16(name);
                out.put_u32(set.payload_len() as u32);
                set.put(out);
            }
        }
        for attribute in &self.attributes {
            let name = symbols.utf8(&attribute.name)?;
            out.put_u16(name);
            out.put_u32(attribute.payload.len() as u32);
            out.put_bytes(&attribute.payload);
        }
        Ok(())
    }
}

impl RecordComponentSink for RecordComponentWriter {
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
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FieldSink for FieldWriter {
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
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        Ok(())
    }
}
