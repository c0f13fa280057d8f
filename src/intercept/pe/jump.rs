//! Machine code for "go to that function instead", written over the start of
//! a function we are overriding.

use crate::error::{Error, Result};

/// Longest sequence any encoder produces.
pub const MAX_LEN: usize = 16;

/// An encoded jump, at most [`MAX_LEN`] bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Jump {
    bytes: [u8; MAX_LEN],
    len: usize,
}

impl Jump {
    fn from_slice(code: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_LEN];
        bytes[..code.len()].copy_from_slice(code);
        Self {
            bytes,
            len: code.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// x86-64: `jmp qword ptr [rip+0]` followed by the absolute target.
pub fn x64(to: u64) -> Jump {
    let mut code = [0u8; 14];
    code[..6].copy_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
    code[6..].copy_from_slice(&to.to_le_bytes());
    Jump::from_slice(&code)
}

/// x86: `jmp rel32`, relative to the end of the 5-byte instruction at
/// `from`.
pub fn x86(from: u64, to: u64) -> Result<Jump> {
    let next = from.wrapping_add(5);
    let rel = to.wrapping_sub(next) as i64;
    let rel = i32::try_from(rel).map_err(|_| Error::JumpOutOfRange {
        from: from as usize,
        to: to as usize,
    })?;
    let mut code = [0u8; 5];
    code[0] = 0xe9;
    code[1..].copy_from_slice(&rel.to_le_bytes());
    Ok(Jump::from_slice(&code))
}

/// AArch64: `ldr x16, #8; br x16` followed by the absolute target.
pub fn arm64(to: u64) -> Jump {
    const LDR_X16_PC_8: u32 = 0x5800_0050;
    const BR_X16: u32 = 0xd61f_0200;

    let mut code = [0u8; 16];
    code[..4].copy_from_slice(&LDR_X16_PC_8.to_le_bytes());
    code[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    code[8..].copy_from_slice(&to.to_le_bytes());
    Jump::from_slice(&code)
}

/// The jump this process's architecture needs.
pub fn for_host(from: usize, to: usize) -> Result<Jump> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let _ = from;
            Ok(x64(to as u64))
        } else if #[cfg(target_arch = "x86")] {
            x86(from as u64, to as u64)
        } else if #[cfg(target_arch = "aarch64")] {
            let _ = from;
            Ok(arm64(to as u64))
        } else {
            Err(Error::JumpOutOfRange { from, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x64_is_an_indirect_jump_through_the_next_quadword() {
        let jump = x64(0x1122_3344_5566_7788);
        assert_eq!(
            jump.as_bytes(),
            [0xff, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn x86_offsets_from_the_end_of_the_instruction() {
        let forward = x86(0x1000, 0x2000).unwrap();
        assert_eq!(forward.as_bytes(), [0xe9, 0xfb, 0x0f, 0, 0]);
        let backward = x86(0x2000, 0x1000).unwrap();
        assert_eq!(backward.as_bytes(), [0xe9, 0xfb, 0xef, 0xff, 0xff]);
        assert!(matches!(
            x86(0, 0x1_0000_0000),
            Err(Error::JumpOutOfRange { .. })
        ));
    }

    #[test]
    fn arm64_loads_the_target_into_x16() {
        let jump = arm64(0x0000_7fff_0000_1234);
        assert_eq!(
            jump.as_bytes(),
            [
                0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6, 0x34, 0x12, 0x00, 0x00, 0xff,
                0x7f, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn host_jump_fits_the_save_area() {
        if let Ok(jump) = for_host(0x1000, 0x2000) {
            assert!(!jump.is_empty());
            assert!(jump.len() <= MAX_LEN);
        }
    }
}
