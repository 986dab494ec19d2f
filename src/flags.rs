//! Access flags, class file versions, and the option sets accepted by the
//! reader and writer entry points.
use bitflags::bitflags;

bitflags! {
    /// Class, field, method, parameter and module access/property flags.
    ///
    /// The JVM specification reuses bit values across contexts
    /// (`0x0020` is `ACC_SUPER` on a class but `ACC_SYNCHRONIZED` on a
    /// method); the aliases below carry every name. Only the low 16 bits
    /// are ever written to a class file. `DEPRECATED` is a pseudo-flag
    /// conveying the `Deprecated` attribute through the event stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const SYNCHRONIZED = 0x0020;
        const OPEN = 0x0020;
        const TRANSITIVE = 0x0020;
        const VOLATILE = 0x0040;
        const BRIDGE = 0x0040;
        const STATIC_PHASE = 0x0040;
        const VARARGS = 0x0080;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
        const MANDATED = 0x8000;
        // Pseudo-flag, never serialized as an access bit.
        const DEPRECATED = 0x2_0000;
    }
}

impl AccessFlags {
    /// The 16 bits that belong in the class file.
    pub fn wire_bits(self) -> u16 {
        (self.bits() & 0xFFFF) as u16
    }
}

bitflags! {
    /// Options controlling what [`crate::ClassReader::accept`] parses and
    /// how it replays frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseOptions: u32 {
        /// Do not parse Code attributes.
        const SKIP_CODE = 0x01;
        /// Omit SourceFile, SourceDebugExtension, LineNumberTable,
        /// LocalVariable[Type]Table and MethodParameters events.
        const SKIP_DEBUG = 0x02;
        /// Ignore StackMapTable attributes.
        const SKIP_FRAMES = 0x04;
        /// Emit frames in uncompressed form regardless of how the source
        /// encodes them.
        const EXPAND_FRAMES = 0x08;
        /// Re-expand the writer-internal wide-forward-branch opcodes.
        /// Only meaningful when reading back self-emitted classes between
        /// the two writer passes.
        const EXPAND_SYNTHETIC = 0x10;
    }
}

bitflags! {
    /// Options controlling what [`crate::ClassWriter`] computes on behalf
    /// of the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriterFlags: u32 {
        /// Recompute max_stack and max_locals from instruction effects.
        const COMPUTE_MAXS = 0x01;
        /// Recompute all stack map frames (implies COMPUTE_MAXS).
        const COMPUTE_FRAMES = 0x02;
    }
}

/// Class file versions, encoded as `minor << 16 | major`.
pub const V1_1: u32 = 3 << 16 | 45;
pub const V1_2: u32 = 46;
pub const V1_3: u32 = 47;
pub const V1_4: u32 = 48;
pub const V1_5: u32 = 49;
pub const V1_6: u32 = 50;
pub const V1_7: u32 = 51;
pub const V1_8: u32 = 52;
pub const V9: u32 = 53;
pub const V10: u32 = 54;
pub const V11: u32 = 55;
pub const V12: u32 = 56;
pub const V13: u32 = 57;
pub const V14: u32 = 58;
pub const V15: u32 = 59;
pub const V16: u32 = 60;
pub const V17: u32 = 61;
pub const V18: u32 = 62;
pub const V19: u32 = 63;
pub const V20: u32 = 64;
pub const V21: u32 = 65;
pub const V22: u32 = 66;
pub const V23: u32 = 67;
pub const V24: u32 = 68;
pub const V25: u32 = 69;

/// Oldest major version the library accepts.
pub const MIN_MAJOR_VERSION: u16 = 45;
/// Newest major version accepted by default.
pub const MAX_MAJOR_VERSION: u16 = 69;
