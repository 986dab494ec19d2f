//! A library for reading, transforming and writing JVM class files.
//!
//! The crate works on three levels that compose freely:
//!
//! - [`ClassReader`] parses a class file held in memory and streams its
//!   contents to a [`ClassSink`];
//! - [`ClassWriter`] implements [`ClassSink`] and serializes the events
//!   back into class file bytes, optionally recomputing max stack/locals
//!   and stack map frames;
//! - piping a reader straight into a writer (optionally through adapters
//!   that implement the sink traits and forward to a delegate) transforms
//!   an existing class, with a verbatim-copy fast path for every method
//!   the adapters do not touch.
//!
//! Building a class from scratch uses the writer alone:
//!
//! ```
//! use classforge::{opcodes, AccessFlags, ClassSink, ClassWriter, MethodSink, WriterFlags, V17};
//!
//! let mut writer = ClassWriter::new(WriterFlags::COMPUTE_MAXS);
//! writer.visit_class(V17, AccessFlags::PUBLIC | AccessFlags::SUPER, "X",
//!                    None, Some("java/lang/Object"), &[])?;
//! let method = writer.visit_method(AccessFlags::PUBLIC | AccessFlags::STATIC,
//!                                  "m", "()I", None, &[])?.unwrap();
//! method.visit_code()?;
//! method.visit_insn(opcodes::ICONST_1)?;
//! method.visit_insn(opcodes::IRETURN)?;
//! method.visit_maxs(0, 0)?;
//! method.visit_end()?;
//! writer.visit_end()?;
//! let bytes = writer.to_bytes()?;
//! # assert!(bytes.len() > 20);
//! # Ok::<(), classforge::Error>(())
//! ```
//!
//! Unknown attributes round-trip as opaque byte payloads; if they embed
//! constant pool indices and the pool is rebuilt rather than copied
//! verbatim, the output may point at relocated entries. A diagnostic is
//! emitted through the `log` facade when this can happen.

mod annotation;
mod attribute;
mod buffer;
mod constant;
mod error;
mod field;
mod flags;
mod frame;
mod label;
mod method;
mod module;
pub mod opcodes;
mod reader;
mod sink;
mod symbols;
mod types;
mod writer;

pub use annotation::AnnotationWriter;
pub use attribute::{Attribute, AttributeCodec};
pub use buffer::{ByteCursor, ByteVector};
pub use constant::{Constant, ConstantDynamic, Handle};
pub use error::{Error, Result};
pub use field::{FieldWriter, RecordComponentWriter};
pub use flags::*;
pub use label::Label;
pub use method::MethodWriter;
pub use module::ModuleWriter;
pub use reader::ClassReader;
pub use sink::{
    AnnotationSink, AnnotationValue, ClassSink, FieldSink, FrameItem, FrameKind, MethodSink,
    MethodSource, ModuleSink, RecordComponentSink, TypePath, TypePathStep,
};
pub use symbols::SymbolTable;
pub use writer::ClassWriter;
