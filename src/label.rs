//! Labels: positions in a method's bytecode identified before their
//! offsets are known.
use crate::buffer::ByteVector;
use crate::error::{Error, Result};
use crate::opcodes;

/// An opaque handle for a position in a method's bytecode.
///
/// Labels are minted densely per method, either by
/// [`crate::MethodSink::new_label`] when building code or by the parser
/// when replaying it; the two sources are never mixed within one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A site in the code buffer that awaits a label's resolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForwardRef {
    /// Where the offset bytes live.
    pub patch_at: u32,
    /// Offset of the owning instruction, the base of the branch delta.
    pub insn_at: u32,
    /// Whether the patch site is 4 bytes wide.
    pub wide: bool,
}

/// Writer-side state of one label.
#[derive(Debug, Default, Clone)]
pub(crate) struct LabelState {
    pub offset: u32,
    pub resolved: bool,
    /// Referenced by a branch, switch or exception handler; labels that
    /// only anchor debug tables never set this.
    pub jump_target: bool,
    pub forward_refs: Vec<ForwardRef>,
    /// Line numbers attached to this position.
    pub lines: Vec<u16>,
}

impl LabelState {
    /// Resolves the label to `offset`, patching every pending forward
    /// reference. Returns true if some 16-bit branch overflowed and was
    /// rewritten to a writer-internal wide opcode.
    pub(crate) fn resolve(&mut self, code: &mut ByteVector, offset: u32) -> Result<bool> {
        if self.resolved {
            return Err(Error::invalid("label visited twice"));
        }
        self.offset = offset;
        self.resolved = true;
        let mut rewrote = false;
        for fref in self.forward_refs.drain(..) {
            let delta = i64::from(offset) - i64::from(fref.insn_at);
            if fref.wide {
                code.patch_u32(fref.patch_at as usize, delta as u32);
            } else if delta <= i64::from(i16::MAX) {
                code.patch_u16(fref.patch_at as usize, delta as u16);
            } else {
                // The forward displacement no longer fits in 16 bits.
                // Rewrite the opcode to its internal wide form and store
                // the unsigned displacement; a second writer pass expands
                // it (method code is capped at 65535 bytes, so the
                // displacement always fits unsigned).
                let insn_at = fref.insn_at as usize;
                let opcode = code.as_slice()[insn_at];
                let wide_opcode = match opcode {
                    opcodes::IFNULL | opcodes::IFNONNULL => opcode + opcodes::WIDE_NULL_DELTA,
                    opcodes::IFEQ..=opcodes::JSR => opcode + opcodes::WIDE_COND_DELTA,
                    _ => {
                        return Err(Error::invalid(format!(
                            "forward reference from non-branch opcode {opcode}"
                        )))
                    }
                };
                code.patch_u8(insn_at, wide_opcode);
                code.patch_u16(fref.patch_at as usize, delta as u16);
                rewrote = true;
            }
        }
        Ok(rewrote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_patches_short_forward_refs() {
        let mut code = ByteVector::new();
        code.put_u8(opcodes::GOTO);
        code.put_u16(0);
        code.put_u8(opcodes::NOP);
        let mut state = LabelState::default();
        state.forward_refs.push(ForwardRef {
            patch_at: 1,
            insn_at: 0,
            wide: false,
        });
        let rewrote = state.resolve(&mut code, 4).unwrap();
        assert!(!rewrote);
        assert_eq!(code.as_slice(), &[opcodes::GOTO, 0, 4, opcodes::NOP]);
    }

    #[test]
    fn resolve_rewrites_overflowing_branches() {
        let mut code = ByteVector::new();
        code.put_u8(opcodes::IFEQ);
        code.put_u16(0);
        let mut state = LabelState::default();
        state.forward_refs.push(ForwardRef {
            patch_at: 1,
            insn_at: 0,
            wide: false,
        });
        let rewrote = state.resolve(&mut code, 40000).unwrap();
        assert!(rewrote);
        assert_eq!(code.as_slice()[0], opcodes::WIDE_IFEQ);
        assert_eq!(
            u32::from(code.as_slice()[1]) << 8 | u32::from(code.as_slice()[2]),
            40000
        );
    }

    #[test]
    fn double_resolution_is_rejected() {
        let mut code = ByteVector::new();
        let mut state = LabelState::default();
        state.resolve(&mut code, 0).unwrap();
        assert!(state.resolve(&mut code, 4).is_err());
    }
}
