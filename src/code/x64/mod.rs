//! x86-64 code generation

/// Length of the absolute jump generated by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = 14;

/// Longest instruction the architecture allows
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Generates an absolute jump to a specified address and returns bytecode
///
/// The jump is `jmp [rip + 0]` followed by the 8-byte target, so no register is clobbered
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// The target follows the indirect jmp opcode in little endian
    fn test_jmp_abs() {
        let code = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(
            code,
            [0xff, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }
}
