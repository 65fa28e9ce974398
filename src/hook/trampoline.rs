//! Trampolines: relocated copies of a function's first instructions followed by a jump back
//!
//! Calling a trampoline runs the original function even after its entry has been overwritten.

use std::ptr::NonNull;
use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use crate::alloc::allocate_executable;
use crate::code::x64::{jmp_abs, JMP_ABS_LEN, MAX_INSTRUCTION_LEN};

use super::detour::HookError;

/// Extra room per relocated instruction; short branches may grow into long ones
const RELOCATION_SLACK: usize = 16;

/// Executable copy of a function prologue
#[derive(Debug)]
pub struct Trampoline {
    /// Start of the relocated code
    entry: NonNull<u8>,
    /// Number of prologue bytes that were copied
    stolen: usize,
    /// Bytes of trampoline code, including the jump back
    len: usize,
}

// The trampoline only points into the never-freed executable arena
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Copies whole instructions from `target` until at least `min_len` bytes are covered
    ///
    /// # Safety
    ///
    /// `target` must point at the entry of a function and be readable for
    /// `min_len + MAX_INSTRUCTION_LEN - 1` bytes
    pub unsafe fn build(target: *const u8, min_len: usize) -> Result<Self, HookError> {
        let (instructions, stolen) = decode_prologue(target, min_len)?;

        let capacity = instructions.len() * RELOCATION_SLACK + stolen + JMP_ABS_LEN;
        let memory = allocate_executable(target as usize, capacity)?;
        let rip = memory.as_ptr() as u64;

        let block = InstructionBlock::new(&instructions, rip);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?;
        let code = encoded.code_buffer;

        let len = code.len() + JMP_ABS_LEN;
        if len > memory.len() {
            return Err(HookError::TrampolineTooLarge { len });
        }
        memory[..code.len()].copy_from_slice(&code);
        memory[code.len()..len].copy_from_slice(&jmp_abs(target as usize + stolen));

        Ok(Self {
            entry: NonNull::from(&mut memory[0]),
            stolen,
            len,
        })
    }

    /// Entry point of the relocated code
    pub fn entry(&self) -> NonNull<u8> {
        self.entry
    }

    /// Number of bytes taken from the start of the target
    pub fn stolen(&self) -> usize {
        self.stolen
    }

    /// The trampoline's code
    pub fn code(&self) -> &[u8] {
        // Safety: `len` bytes were written at `entry` and the arena never frees them
        unsafe { slice::from_raw_parts(self.entry.as_ptr(), self.len) }
    }
}

/// Decodes whole instructions from `target` until `min_len` bytes are covered
///
/// # Safety
///
/// See [`Trampoline::build`]
unsafe fn decode_prologue(
    target: *const u8,
    min_len: usize,
) -> Result<(Vec<Instruction>, usize), HookError> {
    // the last instruction may start on the final byte and still be of maximum length
    let window = slice::from_raw_parts(target, min_len + MAX_INSTRUCTION_LEN - 1);
    let mut decoder = Decoder::with_ip(64, window, target as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut stolen = 0;
    while stolen < min_len {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::InvalidInstruction {
                address: target as usize + stolen,
            });
        }
        stolen += instruction.len();
        // nothing after a jump or return belongs to this routine
        let ends_routine = matches!(
            instruction.flow_control(),
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        );
        if ends_routine && stolen < min_len {
            return Err(HookError::FunctionTooSmall {
                address: target as usize,
                len: stolen,
            });
        }
        instructions.push(instruction);
    }

    Ok((instructions, stolen))
}
