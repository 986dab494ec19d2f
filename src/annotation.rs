//! Serialization of annotations, type annotations and element values.
use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::ByteVector;
use crate::error::{Error, Result};
use crate::sink::{AnnotationSink, AnnotationValue, TypePath};
use crate::symbols::SymbolTable;

/// Writes the `target_type` and `target_info` of a type annotation whose
/// payload is fully described by the packed `type_ref` (class, field and
/// method contexts plus `catch` targets). Instruction and local variable
/// targets carry bytecode offsets and are written by the method writer.
pub(crate) fn put_target(type_ref: u32, out: &mut ByteVector) -> Result<()> {
    let target_type = (type_ref >> 24) as u8;
    out.put_u8(target_type);
    match target_type {
        // type parameter of a class or method
        0x00 | 0x01 => out.put_u8((type_ref >> 16) as u8),
        // supertype / implemented interface
        0x10 => out.put_u16((type_ref >> 8) as u16),
        // type parameter bound
        0x11 | 0x12 => {
            out.put_u8((type_ref >> 16) as u8);
            out.put_u8((type_ref >> 8) as u8);
        }
        // field type, method return type, receiver type
        0x13..=0x15 => {}
        // formal parameter
        0x16 => out.put_u8((type_ref >> 16) as u8),
        // throws clause entry
        0x17 => out.put_u16((type_ref >> 8) as u16),
        // exception parameter of a catch clause
        0x42 => out.put_u16((type_ref >> 8) as u16),
        _ => {
            return Err(Error::invalid(format!(
                "type reference target 0x{target_type:02x} is not valid in this context"
            )))
        }
    }
    Ok(())
}

/// An event sink serializing one annotation (or one array value) directly
/// into a shared byte vector. Nested annotations and arrays write into
/// the same vector through child writers; each writer only retains the
/// position of its element count, patched at `visit_end`.
pub struct AnnotationWriter {
    symbols: Rc<RefCell<SymbolTable>>,
    vec: Rc<RefCell<ByteVector>>,
    count_at: usize,
    count: u16,
    /// Element-value pairs are named inside annotations, unnamed inside
    /// array values.
    named: bool,
    child: Option<Box<AnnotationWriter>>,
}

impl AnnotationWriter {
    /// Starts a regular annotation: `type_index num_element_value_pairs`.
    pub(crate) fn annotation(
        symbols: &Rc<RefCell<SymbolTable>>,
        vec: &Rc<RefCell<ByteVector>>,
        descriptor: &str,
    ) -> Result<AnnotationWriter> {
        let type_index = symbols.borrow_mut().utf8(descriptor)?;
        let count_at = {
            let mut out = vec.borrow_mut();
            out.put_u16(type_index);
            let at = out.len();
            out.put_u16(0);
            at
        };
        Ok(AnnotationWriter {
            symbols: Rc::clone(symbols),
            vec: Rc::clone(vec),
            count_at,
            count: 0,
            named: true,
            child: None,
        })
    }

    /// A writer for a single unnamed element value, as stored by the
    /// AnnotationDefault attribute.
    pub(crate) fn value_only(
        symbols: &Rc<RefCell<SymbolTable>>,
        vec: &Rc<RefCell<ByteVector>>,
    ) -> AnnotationWriter {
        AnnotationWriter {
            symbols: Rc::clone(symbols),
            vec: Rc::clone(vec),
            count_at: usize::MAX,
            count: 0,
            named: false,
            child: None,
        }
    }

    /// Starts an array value; the caller has already written the `[` tag.
    fn array(
        symbols: &Rc<RefCell<SymbolTable>>,
        vec: &Rc<RefCell<ByteVector>>,
    ) -> AnnotationWriter {
        let count_at = {
            let mut out = vec.borrow_mut();
            let at = out.len();
            out.put_u16(0);
            at
        };
        AnnotationWriter {
            symbols: Rc::clone(symbols),
            vec: Rc::clone(vec),
            count_at,
            count: 0,
            named: false,
            child: None,
        }
    }

    fn put_name(&mut self, name: Option<&str>) -> Result<()> {
        if self.named {
            let name = name.ok_or_else(|| {
                Error::invalid("annotation element values must be named outside arrays")
            })?;
            let index = self.symbols.borrow_mut().utf8(name)?;
            self.vec.borrow_mut().put_u16(index);
        }
        self.count += 1;
        Ok(())
    }
}

impl AnnotationSink for AnnotationWriter {
    fn visit_value(&mut self, name: Option<&str>, value: &AnnotationValue) -> Result<()> {
        self.put_name(name)?;
        let mut symbols = self.symbols.borrow_mut();
        let (tag, index) = match value {
            AnnotationValue::Boolean(v) => (b'Z', symbols.integer(i32::from(*v))?),
            AnnotationValue::Byte(v) => (b'B', symbols.integer(i32::from(*v))?),
            AnnotationValue::Char(v) => (b'C', symbols.integer(i32::from(*v))?),
            AnnotationValue::Short(v) => (b'S', symbols.integer(i32::from(*v))?),
            AnnotationValue::Int(v) => (b'I', symbols.integer(*v)?),
            AnnotationValue::Long(v) => (b'J', symbols.long(*v)?),
            AnnotationValue::Float(v) => (b'F', symbols.float(*v)?),
            AnnotationValue::Double(v) => (b'D', symbols.double(*v)?),
            AnnotationValue::String(v) => (b's', symbols.utf8(v)?),
            AnnotationValue::Class(v) => (b'c', symbols.utf8(v)?),
        };
        let mut out = self.vec.borrow_mut();
        out.put_u8(tag);
        out.put_u16(index);
        Ok(())
    }

    fn visit_enum(&mut self, name: Option<&str>, descriptor: &str, value: &str) -> Result<()> {
        self.put_name(name)?;
        let mut symbols = self.symbols.borrow_mut();
        let type_index = symbols.utf8(descriptor)?;
        let value_index = symbols.utf8(value)?;
        let mut out = self.vec.borrow_mut();
        out.put_u8(b'e');
        out.put_u16(type_index);
        out.put_u16(value_index);
        Ok(())
    }

    fn visit_annotation(
        &mut self,
        name: Option<&str>,
        descriptor: &str,
    ) -> Result<Option<&mut dyn AnnotationSink>> {
        self.put_name(name)?;
        self.vec.borrow_mut().put_u8(b'@');
        let child = AnnotationWriter::annotation(&self.symbols, &self.vec, descriptor)?;
        self.child = Some(Box::new(child));
        Ok(Some(self.child.as_mut().unwrap().as_mut()))
    }

    fn visit_array(&mut self, name: Option<&str>) -> Result<Option<&mut dyn AnnotationSink>> {
        self.put_name(name)?;
        self.vec.borrow_mut().put_u8(b'[');
        let child = AnnotationWriter::array(&self.symbols, &self.vec);
        self.child = Some(Box::new(child));
        Ok(Some(self.child.as_mut().unwrap().as_mut()))
    }

    fn visit_end(&mut self) -> Result<()> {
        if self.count_at != usize::MAX {
            self.vec.borrow_mut().patch_u16(self.count_at, self.count);
        }
        Ok(())
    }
}

/// One Runtime(In)Visible[Type]Annotations attribute under construction:
/// a shared byte vector of serialized annotations plus their count.
pub(crate) struct AnnotationSet {
    vec: Rc<RefCell<ByteVector>>,
    count: u16,
    writers: Vec<AnnotationWriter>,
}

impl Default for AnnotationSet {
    fn default() -> Self {
        AnnotationSet {
            vec: Rc::new(RefCell::new(ByteVector::new())),
            count: 0,
            writers: Vec::new(),
        }
    }
}

impl AnnotationSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn add_annotation(
        &mut self,
        symbols: &Rc<RefCell<SymbolTable>>,
        descriptor: &str,
    ) -> Result<&mut dyn AnnotationSink> {
        self.count += 1;
        let writer = AnnotationWriter::annotation(symbols, &self.vec, descriptor)?;
        self.writers.push(writer);
        Ok(self.writers.last_mut().unwrap())
    }

    /// Adds a type annotation whose target is fully described by
    /// `type_ref` (class, field and method contexts).
    pub(crate) fn add_type_annotation(
        &mut self,
        symbols: &Rc<RefCell<SymbolTable>>,
        type_ref: u32,
        type_path: Option<&TypePath>,
        descriptor: &str,
    ) -> Result<&mut dyn AnnotationSink> {
        {
            let mut out = self.vec.borrow_mut();
            put_target(type_ref, &mut out)?;
            TypePath::put(type_path, &mut out);
        }
        self.add_annotation(symbols, descriptor)
    }

    /// Adds a type annotation whose target carries a bytecode offset
    /// (`instanceof`, `new`, method reference and cast/type-argument
    /// targets).
    pub(crate) fn add_offset_type_annotation(
        &mut self,
        symbols: &Rc<RefCell<SymbolTable>>,
        type_ref: u32,
        offset: u16,
        type_path: Option<&TypePath>,
        descriptor: &str,
    ) -> Result<&mut dyn AnnotationSink> {
        let target_type = (type_ref >> 24) as u8;
        {
            let mut out = self.vec.borrow_mut();
            out.put_u8(target_type);
            out.put_u16(offset);
            if let 0x47..=0x4B = target_type {
                out.put_u8(type_ref as u8);
            }
            TypePath::put(type_path, &mut out);
        }
        self.add_annotation(symbols, descriptor)
    }

    /// Adds a local variable type annotation with its resolved ranges.
    pub(crate) fn add_local_var_type_annotation(
        &mut self,
        symbols: &Rc<RefCell<SymbolTable>>,
        type_ref: u32,
        ranges: &[(u16, u16, u16)],
        type_path: Option<&TypePath>,
        descriptor: &str,
    ) -> Result<&mut dyn AnnotationSink> {
        {
            let mut out = self.vec.borrow_mut();
            out.put_u8((type_ref >> 24) as u8);
            out.put_u16(ranges.len() as u16);
            for (start, length, index) in ranges {
                out.put_u16(*start);
                out.put_u16(*length);
                out.put_u16(*index);
            }
            TypePath::put(type_path, &mut out);
        }
        self.add_annotation(symbols, descriptor)
    }

    /// Payload length of the enclosing attribute.
    pub(crate) fn payload_len(&self) -> usize {
        2 + self.vec.borrow().len()
    }

    /// Writes `num_annotations` and the serialized annotations.
    pub(crate) fn put(&self, out: &mut ByteVector) {
        out.put_u16(self.count);
        out.put_bytes(self.vec.borrow().as_slice());
    }
}

/// Parameter annotations: one [`AnnotationSet`] per declared parameter,
/// with an explicit annotable-parameter count.
#[derive(Default)]
pub(crate) struct ParameterAnnotations {
    pub(crate) sets: Vec<AnnotationSet>,
    pub(crate) explicit_count: Option<u8>,
}

impl ParameterAnnotations {
    pub(crate) fn is_empty(&self) -> bool {
        self.explicit_count.is_none() && self.sets.iter().all(AnnotationSet::is_empty)
    }

    pub(crate) fn set_for(&mut self, parameter: u8) -> &mut AnnotationSet {
        let needed = usize::from(parameter) + 1;
        if self.sets.len() < needed {
            self.sets.resize_with(needed, AnnotationSet::default);
        }
        &mut self.sets[parameter as usize]
    }

    pub(crate) fn count(&self) -> u8 {
        self.explicit_count.unwrap_or(self.sets.len() as u8)
    }

    pub(crate) fn payload_len(&self) -> usize {
        1 + (0..usize::from(self.count()))
            .map(|i| match self.sets.get(i) {
                Some(set) => set.payload_len(),
                None => 2,
            })
            .sum::<usize>()
    }

    pub(crate) fn put(&self, out: &mut ByteVector) {
        out.put_u8(self.count());
        for i in 0..usize::from(self.count()) {
            match self.sets.get(i) {
                Some(set) => set.put(out),
                None => out.put_u16(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_named_values_and_nested_arrays() {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        let mut set = AnnotationSet::default();
        {
            let writer = set.add_annotation(&symbols, "LAnno;").unwrap();
            writer
                .visit_value(Some("count"), &AnnotationValue::Int(3))
                .unwrap();
            let array = writer.visit_array(Some("names")).unwrap().unwrap();
            array
                .visit_value(None, &AnnotationValue::String("a".into()))
                .unwrap();
            array
                .visit_value(None, &AnnotationValue::String("b".into()))
                .unwrap();
            array.visit_end().unwrap();
            writer.visit_end().unwrap();
        }
        let mut out = ByteVector::new();
        set.put(&mut out);
        let bytes = out.as_slice();
        // num_annotations, then type_index and two element value pairs.
        assert_eq!(&bytes[..2], &[0, 1]);
        let pairs = u16::from(bytes[4]) << 8 | u16::from(bytes[5]);
        assert_eq!(pairs, 2);
        assert!(bytes.contains(&b'['));
        assert_eq!(set.payload_len(), 2 + bytes.len() - 2);
    }

    #[test]
    fn unnamed_value_outside_array_is_rejected() {
        let symbols = Rc::new(RefCell::new(SymbolTable::new()));
        let mut set = AnnotationSet::default();
        let writer = set.add_annotation(&symbols, "LAnno;").unwrap();
        assert!(writer
            .visit_value(None, &AnnotationValue::Int(1))
            .is_err());
    }
}
