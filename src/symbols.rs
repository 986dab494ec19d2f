//! The writer-side symbol table: a deduplicating constant pool builder,
//! the bootstrap methods table, and the per-class type table consumed by
//! the stack map frame engine.
use indexmap::IndexMap;
use std::collections::HashMap;

use crate::buffer::ByteVector;
use crate::constant::{Constant, ConstantDynamic, Handle};
use crate::error::{Error, Result};
use crate::label::Label;
use crate::reader::ClassReader;

pub(crate) const TAG_UTF8: u8 = 1;
pub(crate) const TAG_INTEGER: u8 = 3;
pub(crate) const TAG_FLOAT: u8 = 4;
pub(crate) const TAG_LONG: u8 = 5;
pub(crate) const TAG_DOUBLE: u8 = 6;
pub(crate) const TAG_CLASS: u8 = 7;
pub(crate) const TAG_STRING: u8 = 8;
pub(crate) const TAG_FIELD_REF: u8 = 9;
pub(crate) const TAG_METHOD_REF: u8 = 10;
pub(crate) const TAG_INTERFACE_METHOD_REF: u8 = 11;
pub(crate) const TAG_NAME_AND_TYPE: u8 = 12;
pub(crate) const TAG_METHOD_HANDLE: u8 = 15;
pub(crate) const TAG_METHOD_TYPE: u8 = 16;
pub(crate) const TAG_DYNAMIC: u8 = 17;
pub(crate) const TAG_INVOKE_DYNAMIC: u8 = 18;
pub(crate) const TAG_MODULE: u8 = 19;
pub(crate) const TAG_PACKAGE: u8 = 20;

/// One constant pool entry, with nested references expressed as pool
/// indices. Deduplication is structural: because children are interned
/// bottom-up, equal indices imply equal payloads. Float and double
/// payloads are stored as bit patterns so entries are `Eq + Hash`.
///
/// A `MethodHandle` referencing an interface method points at an
/// `InterfaceMethodRef` entry rather than a `MethodRef` one, so handle
/// equality incorporates the interface bit by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Entry {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name: u16 },
    String { utf8: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
}

impl Entry {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Entry::Utf8(_) => TAG_UTF8,
            Entry::Integer(_) => TAG_INTEGER,
            Entry::Float(_) => TAG_FLOAT,
            Entry::Long(_) => TAG_LONG,
            Entry::Double(_) => TAG_DOUBLE,
            Entry::Class { .. } => TAG_CLASS,
            Entry::String { .. } => TAG_STRING,
            Entry::FieldRef { .. } => TAG_FIELD_REF,
            Entry::MethodRef { .. } => TAG_METHOD_REF,
            Entry::InterfaceMethodRef { .. } => TAG_INTERFACE_METHOD_REF,
            Entry::NameAndType { .. } => TAG_NAME_AND_TYPE,
            Entry::MethodHandle { .. } => TAG_METHOD_HANDLE,
            Entry::MethodType { .. } => TAG_METHOD_TYPE,
            Entry::Dynamic { .. } => TAG_DYNAMIC,
            Entry::InvokeDynamic { .. } => TAG_INVOKE_DYNAMIC,
            Entry::Module { .. } => TAG_MODULE,
            Entry::Package { .. } => TAG_PACKAGE,
        }
    }

    /// Number of pool indices the entry occupies.
    fn width(&self) -> u32 {
        match self {
            Entry::Long(_) | Entry::Double(_) => 2,
            _ => 1,
        }
    }
}

/// An entry of the writer-internal type table. Object types hold internal
/// names (or array descriptors); uninitialized types remember the `new`
/// instruction that produced them, either as a resolved bytecode offset or
/// as a label still awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TypeEntry {
    Object(String),
    Uninitialized { name: String, offset: u32 },
    ForwardUninitialized { name: String, label: Label },
}

impl TypeEntry {
    pub(crate) fn name(&self) -> &str {
        match self {
            TypeEntry::Object(name) => name,
            TypeEntry::Uninitialized { name, .. } => name,
            TypeEntry::ForwardUninitialized { name, .. } => name,
        }
    }
}

/// Deduplicating store for constant pool entries, bootstrap methods and
/// frame types. Entries are serialized into the output byte form the
/// moment they are interned, so emission is a plain copy.
pub struct SymbolTable {
    entries: IndexMap<Entry, u16>,
    by_index: HashMap<u16, Entry>,
    next_index: u32,
    pool: ByteVector,
    bootstrap: ByteVector,
    bootstrap_offsets: Vec<(usize, usize)>,
    types: Vec<TypeEntry>,
    type_index: HashMap<TypeEntry, u32>,
    merges: HashMap<(u32, u32), u32>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable {
            entries: IndexMap::new(),
            by_index: HashMap::new(),
            next_index: 1,
            pool: ByteVector::new(),
            bootstrap: ByteVector::new(),
            bootstrap_offsets: Vec::new(),
            types: Vec::new(),
            type_index: HashMap::new(),
            merges: HashMap::new(),
        }
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a symbol table whose constant pool is a verbatim copy of the
    /// reader's. Interning continues from the copied entries, which keeps
    /// all source indices valid and enables byte-identical round trips.
    pub(crate) fn copy_from(reader: &ClassReader) -> Result<SymbolTable> {
        let mut table = SymbolTable::new();
        table.pool.put_bytes(reader.pool_bytes());
        table.next_index = u32::from(reader.pool_count());
        for index in 1..reader.pool_count() {
            if let Some(entry) = reader.pool_entry(index)? {
                table.by_index.insert(index, entry.clone());
                // First occurrence wins so later interning reuses it.
                table.entries.entry(entry).or_insert(index);
            }
        }
        if let Some((count, bytes)) = reader.bootstrap_region()? {
            table.bootstrap.put_bytes(bytes);
            let mut pos = 0usize;
            for _ in 0..count {
                let start = pos;
                if pos + 4 > bytes.len() {
                    return Err(Error::malformed("truncated bootstrap methods table"));
                }
                let argc = usize::from(u16::from(bytes[pos + 2]) << 8 | u16::from(bytes[pos + 3]));
                pos += 4 + 2 * argc;
                if pos > bytes.len() {
                    return Err(Error::malformed("truncated bootstrap methods table"));
                }
                table.bootstrap_offsets.push((start, pos - start));
            }
        }
        Ok(table)
    }

    /// Number the `constant_pool_count` field will carry.
    pub fn pool_count(&self) -> u16 {
        self.next_index as u16
    }

    pub(crate) fn entry(&self, index: u16) -> Option<&Entry> {
        self.by_index.get(&index)
    }

    pub(crate) fn utf8_at(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Entry::Utf8(value)) => Ok(value),
            _ => Err(Error::malformed(format!("index {index} is not a Utf8 entry"))),
        }
    }

    pub(crate) fn class_name_at(&self, index: u16) -> Result<&str> {
        match self.entry(index) {
            Some(Entry::Class { name }) => self.utf8_at(*name),
            _ => Err(Error::malformed(format!("index {index} is not a Class entry"))),
        }
    }

    pub(crate) fn name_and_type_at(&self, index: u16) -> Result<(&str, &str)> {
        match self.entry(index) {
            Some(Entry::NameAndType { name, descriptor }) => {
                Ok((self.utf8_at(*name)?, self.utf8_at(*descriptor)?))
            }
            _ => Err(Error::malformed(format!(
                "index {index} is not a NameAndType entry"
            ))),
        }
    }

    /// Interns an entry, returning the existing index on a structural match.
    pub(crate) fn intern(&mut self, entry: Entry) -> Result<u16> {
        if let Some(index) = self.entries.get(&entry) {
            return Ok(*index);
        }
        let width = entry.width();
        if self.next_index + width > 0xFFFF {
            return Err(Error::ClassTooLarge((self.next_index + width) as usize));
        }
        let index = self.next_index as u16;
        self.serialize_entry(&entry)?;
        self.by_index.insert(index, entry.clone());
        self.entries.insert(entry, index);
        self.next_index += width;
        Ok(index)
    }

    fn serialize_entry(&mut self, entry: &Entry) -> Result<()> {
        self.pool.put_u8(entry.tag());
        match entry {
            Entry::Utf8(value) => self.pool.put_utf8(value)?,
            Entry::Integer(value) => self.pool.put_i32(*value),
            Entry::Float(bits) => self.pool.put_u32(*bits),
            Entry::Long(value) => self.pool.put_i64(*value),
            Entry::Double(bits) => self.pool.put_i64(*bits as i64),
            Entry::Class { name }
            | Entry::Module { name }
            | Entry::Package { name } => self.pool.put_u16(*name),
            Entry::String { utf8 } => self.pool.put_u16(*utf8),
            Entry::FieldRef { class, name_and_type }
            | Entry::MethodRef { class, name_and_type }
            | Entry::InterfaceMethodRef { class, name_and_type } => {
                self.pool.put_u16(*class);
                self.pool.put_u16(*name_and_type);
            }
            Entry::NameAndType { name, descriptor } => {
                self.pool.put_u16(*name);
                self.pool.put_u16(*descriptor);
            }
            Entry::MethodHandle { kind, reference } => {
                self.pool.put_u8(*kind);
                self.pool.put_u16(*reference);
            }
            Entry::MethodType { descriptor } => self.pool.put_u16(*descriptor),
            Entry::Dynamic { bootstrap, name_and_type }
            | Entry::InvokeDynamic { bootstrap, name_and_type } => {
                self.pool.put_u16(*bootstrap);
                self.pool.put_u16(*name_and_type);
            }
        }
        Ok(())
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(Entry::Utf8(value.to_owned()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.intern(Entry::Class { name })
    }

    pub fn string(&mut self, value: &str) -> Result<u16> {
        let utf8 = self.utf8(value)?;
        self.intern(Entry::String { utf8 })
    }

    pub fn integer(&mut self, value: i32) -> Result<u16> {
        self.intern(Entry::Integer(value))
    }

    pub fn float(&mut self, value: f32) -> Result<u16> {
        self.intern(Entry::Float(value.to_bits()))
    }

    pub fn long(&mut self, value: i64) -> Result<u16> {
        self.intern(Entry::Long(value))
    }

    pub fn double(&mut self, value: f64) -> Result<u16> {
        self.intern(Entry::Double(value.to_bits()))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        let descriptor = self.utf8(descriptor)?;
        self.intern(Entry::NameAndType { name, descriptor })
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        self.intern(Entry::FieldRef { class, name_and_type })
    }

    pub fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16> {
        let class = self.class(owner)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        if is_interface {
            self.intern(Entry::InterfaceMethodRef { class, name_and_type })
        } else {
            self.intern(Entry::MethodRef { class, name_and_type })
        }
    }

    pub fn method_type(&mut self, descriptor: &str) -> Result<u16> {
        let descriptor = self.utf8(descriptor)?;
        self.intern(Entry::MethodType { descriptor })
    }

    pub fn module(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.intern(Entry::Module { name })
    }

    pub fn package(&mut self, name: &str) -> Result<u16> {
        let name = self.utf8(name)?;
        self.intern(Entry::Package { name })
    }

    pub fn method_handle(&mut self, handle: &Handle) -> Result<u16> {
        let reference = if handle.is_field() {
            self.field_ref(&handle.owner, &handle.name, &handle.descriptor)?
        } else {
            self.method_ref(
                &handle.owner,
                &handle.name,
                &handle.descriptor,
                handle.is_interface,
            )?
        };
        self.intern(Entry::MethodHandle {
            kind: handle.kind,
            reference,
        })
    }

    pub fn dynamic(&mut self, dynamic: &ConstantDynamic) -> Result<u16> {
        let bootstrap = self.add_bootstrap_method(&dynamic.bootstrap, &dynamic.arguments)?;
        let name_and_type = self.name_and_type(&dynamic.name, &dynamic.descriptor)?;
        self.intern(Entry::Dynamic { bootstrap, name_and_type })
    }

    pub fn invoke_dynamic(
        &mut self,
        name: &str,
        descriptor: &str,
        bootstrap: &Handle,
        arguments: &[Constant],
    ) -> Result<u16> {
        let bootstrap = self.add_bootstrap_method(bootstrap, arguments)?;
        let name_and_type = self.name_and_type(name, descriptor)?;
        self.intern(Entry::InvokeDynamic { bootstrap, name_and_type })
    }

    pub fn constant(&mut self, constant: &Constant) -> Result<u16> {
        match constant {
            Constant::Integer(value) => self.integer(*value),
            Constant::Float(value) => self.float(*value),
            Constant::Long(value) => self.long(*value),
            Constant::Double(value) => self.double(*value),
            Constant::String(value) => self.string(value),
            Constant::Class(name) => self.class(name),
            Constant::MethodType(descriptor) => self.method_type(descriptor),
            Constant::MethodHandle(handle) => self.method_handle(handle),
            Constant::Dynamic(dynamic) => self.dynamic(dynamic),
        }
    }

    /// Adds a bootstrap method entry unless an identical one exists.
    /// Constituent arguments are interned first (nested dynamic constants
    /// resolve bottom-up); the comparison is byte-by-byte over the already
    /// serialized region.
    pub fn add_bootstrap_method(
        &mut self,
        handle: &Handle,
        arguments: &[Constant],
    ) -> Result<u16> {
        let handle_index = self.method_handle(handle)?;
        let mut argument_indices = Vec::with_capacity(arguments.len());
        for argument in arguments {
            argument_indices.push(self.constant(argument)?);
        }
        let mut candidate = ByteVector::with_capacity(4 + 2 * arguments.len());
        candidate.put_u16(handle_index);
        candidate.put_u16(argument_indices.len() as u16);
        for index in argument_indices {
            candidate.put_u16(index);
        }
        let candidate = candidate.into_vec();
        for (position, (start, len)) in self.bootstrap_offsets.iter().enumerate() {
            if &self.bootstrap.as_slice()[*start..*start + *len] == candidate.as_slice() {
                return Ok(position as u16);
            }
        }
        if self.bootstrap_offsets.len() >= 0xFFFF {
            return Err(Error::ClassTooLarge(self.bootstrap_offsets.len() + 1));
        }
        let start = self.bootstrap.len();
        self.bootstrap.put_bytes(&candidate);
        self.bootstrap_offsets.push((start, candidate.len()));
        Ok((self.bootstrap_offsets.len() - 1) as u16)
    }

    /// Count and serialized body of the BootstrapMethods attribute, if any
    /// entry exists.
    pub(crate) fn bootstrap_methods(&self) -> Option<(u16, &[u8])> {
        if self.bootstrap_offsets.is_empty() {
            None
        } else {
            Some((self.bootstrap_offsets.len() as u16, self.bootstrap.as_slice()))
        }
    }

    /// Writes `constant_pool_count` followed by the serialized pool.
    pub(crate) fn put_pool(&self, out: &mut ByteVector) {
        out.put_u16(self.pool_count());
        out.put_bytes(self.pool.as_slice());
    }

    // ------------------------------------------------------------------
    // Type table
    // ------------------------------------------------------------------

    fn add_type(&mut self, entry: TypeEntry) -> u32 {
        if let Some(index) = self.type_index.get(&entry) {
            return *index;
        }
        let index = self.types.len() as u32;
        self.types.push(entry.clone());
        self.type_index.insert(entry, index);
        index
    }

    pub(crate) fn add_object_type(&mut self, name: &str) -> u32 {
        self.add_type(TypeEntry::Object(name.to_owned()))
    }

    pub(crate) fn add_uninitialized_type(&mut self, name: &str, offset: u32) -> u32 {
        self.add_type(TypeEntry::Uninitialized {
            name: name.to_owned(),
            offset,
        })
    }

    pub(crate) fn add_forward_uninitialized_type(&mut self, name: &str, label: Label) -> u32 {
        self.add_type(TypeEntry::ForwardUninitialized {
            name: name.to_owned(),
            label,
        })
    }

    pub(crate) fn type_entry(&self, index: u32) -> &TypeEntry {
        &self.types[index as usize]
    }

    /// Merges two object types, consulting `oracle` for the common
    /// supertype of plain class names. The computed result is memoized so
    /// repeated merges are O(1); the key is normalized, which also makes
    /// the operation commutative.
    pub(crate) fn merge_object_types(
        &mut self,
        a: u32,
        b: u32,
        oracle: &dyn Fn(&str, &str) -> String,
    ) -> u32 {
        if a == b {
            return a;
        }
        let key = (a.min(b), a.max(b));
        if let Some(merged) = self.merges.get(&key) {
            return *merged;
        }
        let name_a = self.type_entry(a).name().to_owned();
        let name_b = self.type_entry(b).name().to_owned();
        let merged_name = merge_type_names(&name_a, &name_b, oracle);
        let merged = self.add_object_type(&merged_name);
        self.merges.insert(key, merged);
        merged
    }
}

fn array_dimensions(name: &str) -> usize {
    name.bytes().take_while(|b| *b == b'[').count()
}

/// Common supertype of two reference type names. Plain names go through
/// the oracle; arrays of reference elements with equal dimension merge
/// element-wise; any other array combination degrades toward
/// `java/lang/Object`.
fn merge_type_names(a: &str, b: &str, oracle: &dyn Fn(&str, &str) -> String) -> String {
    if a == b {
        return a.to_owned();
    }
    let dims_a = array_dimensions(a);
    let dims_b = array_dimensions(b);
    if dims_a == 0 && dims_b == 0 {
        return oracle(a, b);
    }
    if dims_a == dims_b {
        let elem_a = &a[dims_a..];
        let elem_b = &b[dims_b..];
        if elem_a.starts_with('L')
            && elem_a.ends_with(';')
            && elem_b.starts_with('L')
            && elem_b.ends_with(';')
        {
            let merged = oracle(
                &elem_a[1..elem_a.len() - 1],
                &elem_b[1..elem_b.len() - 1],
            );
            let mut result = "[".repeat(dims_a);
            result.push('L');
            result.push_str(&merged);
            result.push(';');
            return result;
        }
    }
    let dims = dims_a.min(dims_b);
    if dims <= 1 {
        "java/lang/Object".to_owned()
    } else {
        let mut result = "[".repeat(dims - 1);
        result.push_str("Ljava/lang/Object;");
        result
    }
}

/// The default common-supertype oracle.
pub(crate) fn object_root_oracle(_a: &str, _b: &str) -> String {
    "java/lang/Object".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{H_INVOKESTATIC, H_INVOKEVIRTUAL};

    #[test]
    fn interning_is_deterministic() {
        let mut table = SymbolTable::new();
        let first = table.class("java/lang/String").unwrap();
        let second = table.class("java/lang/String").unwrap();
        assert_eq!(first, second);
        assert_eq!(table.pool_count(), 3); // Utf8 + Class, count is entries + 1
    }

    #[test]
    fn long_and_double_take_two_indices() {
        let mut table = SymbolTable::new();
        let long = table.long(42).unwrap();
        let next = table.integer(7).unwrap();
        assert_eq!(long, 1);
        assert_eq!(next, 3);
        assert!(table.entry(2).is_none());
    }

    #[test]
    fn method_handles_distinguish_interface_owners() {
        let mut table = SymbolTable::new();
        let plain = table
            .method_handle(&Handle::new(H_INVOKEVIRTUAL, "A", "m", "()V", false))
            .unwrap();
        let iface = table
            .method_handle(&Handle::new(H_INVOKEVIRTUAL, "A", "m", "()V", true))
            .unwrap();
        assert_ne!(plain, iface);
    }

    #[test]
    fn bootstrap_methods_deduplicate_by_bytes() {
        let mut table = SymbolTable::new();
        let handle = Handle::new(
            H_INVOKESTATIC,
            "java/lang/invoke/LambdaMetafactory",
            "metafactory",
            "()V",
            false,
        );
        let args = vec![Constant::Integer(1), Constant::String("x".into())];
        let first = table.add_bootstrap_method(&handle, &args).unwrap();
        let second = table.add_bootstrap_method(&handle, &args).unwrap();
        let third = table
            .add_bootstrap_method(&handle, &[Constant::Integer(2)])
            .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn type_merges_are_memoized_and_commutative() {
        let mut table = SymbolTable::new();
        let a = table.add_object_type("A");
        let b = table.add_object_type("B");
        let oracle = |_: &str, _: &str| "T".to_owned();
        let ab = table.merge_object_types(a, b, &oracle);
        let ba = table.merge_object_types(b, a, &oracle);
        assert_eq!(ab, ba);
        assert_eq!(table.type_entry(ab).name(), "T");
        assert_eq!(table.merge_object_types(ab, ab, &oracle), ab);
    }

    #[test]
    fn array_merges_degrade_sensibly() {
        let oracle: &dyn Fn(&str, &str) -> String = &object_root_oracle;
        assert_eq!(merge_type_names("[I", "[I", oracle), "[I");
        assert_eq!(
            merge_type_names("[LA;", "[LB;", oracle),
            "[Ljava/lang/Object;"
        );
        assert_eq!(merge_type_names("[I", "[J", oracle), "java/lang/Object");
        assert_eq!(
            merge_type_names("[[LA;", "[LB;", oracle),
            "java/lang/Object"
        );
    }
}
