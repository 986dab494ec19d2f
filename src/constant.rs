//! The loadable-constant model shared by `ldc`, bootstrap method arguments
//! and annotation element values.
use crate::opcodes;

/// A constant that can be loaded onto the operand stack or passed to a
/// bootstrap method.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    /// A class reference, as an internal name (`java/lang/Thread`) or an
    /// array descriptor (`[Ljava/lang/Object;`).
    Class(String),
    MethodType(String),
    MethodHandle(Handle),
    Dynamic(ConstantDynamic),
}

impl Constant {
    /// Slots the constant occupies on the operand stack.
    pub fn size(&self) -> u32 {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            Constant::Dynamic(dynamic) => dynamic.size(),
            _ => 1,
        }
    }

    /// Whether the constant must be loaded through `ldc2_w`.
    pub(crate) fn is_wide(&self) -> bool {
        self.size() == 2
    }
}

/// A reference to a field or method, as stored by `CONSTANT_MethodHandle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    /// One of the `H_*` reference kinds in [`crate::opcodes`].
    pub kind: u8,
    /// Internal name of the owner class.
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    /// Whether the owner is an interface. Two handles that differ only in
    /// this bit are distinct constants.
    pub is_interface: bool,
}

impl Handle {
    pub fn new(
        kind: u8,
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        is_interface: bool,
    ) -> Self {
        Handle {
            kind,
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
            is_interface,
        }
    }

    /// Whether the handle designates a field access rather than an
    /// invocation.
    pub fn is_field(&self) -> bool {
        self.kind <= opcodes::H_PUTSTATIC
    }
}

/// A `CONSTANT_Dynamic` entry: a value produced at run time by a bootstrap
/// method. Arguments may themselves be dynamic; they are interned
/// bottom-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantDynamic {
    pub name: String,
    pub descriptor: String,
    pub bootstrap: Handle,
    pub arguments: Vec<Constant>,
}

impl ConstantDynamic {
    pub fn new(
        name: impl Into<String>,
        descriptor: impl Into<String>,
        bootstrap: Handle,
        arguments: Vec<Constant>,
    ) -> Self {
        ConstantDynamic {
            name: name.into(),
            descriptor: descriptor.into(),
            bootstrap,
            arguments,
        }
    }

    /// Slots the produced value occupies on the operand stack.
    pub fn size(&self) -> u32 {
        match self.descriptor.as_str() {
            "J" | "D" => 2,
            _ => 1,
        }
    }
}
