//! Opaque attributes and the codec registry for non-standard ones.
use log::warn;

use crate::error::Result;
use crate::symbols::SymbolTable;

/// A named attribute payload the library does not interpret.
///
/// Attributes with names the parser does not know are captured this way
/// and written back verbatim. If such a payload embeds constant pool
/// indices and the pool was rebuilt rather than copied, the re-emitted
/// bytes may point at the wrong entries; the writer surfaces this through
/// the `log` facade and continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Attribute {
            name: name.into(),
            payload,
        }
    }
}

/// A decoder/encoder pair for one non-standard attribute name.
///
/// A slice of codecs is passed to [`crate::ClassReader::accept`]; an
/// attribute whose name matches a codec is decoded through it instead of
/// being captured opaquely, and encoded through it again at write time.
pub trait AttributeCodec {
    /// The attribute name this codec handles.
    fn name(&self) -> &str;

    /// Decodes the raw payload into the attribute the sink will receive.
    fn read(&self, payload: &[u8]) -> Result<Attribute>;

    /// Encodes the attribute back into a payload, interning whatever
    /// constants it needs.
    fn write(&self, attribute: &Attribute, symbols: &mut SymbolTable) -> Result<Vec<u8>>;
}

pub(crate) fn find_codec<'a>(
    codecs: &'a [&'a dyn AttributeCodec],
    name: &str,
) -> Option<&'a dyn AttributeCodec> {
    codecs.iter().copied().find(|codec| codec.name() == name)
}

/// Emits the diagnostic for an opaque payload re-serialized over a pool
/// that is not a verbatim copy of the one its indices refer to.
pub(crate) fn warn_opaque_relocation(name: &str) {
    warn!(
        "attribute {name} is written back verbatim over a rebuilt constant pool; \
         embedded pool indices may no longer match"
    );
}
