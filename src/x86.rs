//! x86-64 decode/encode wrapper.
//!
//! Wraps iced so the rest of the crate can decode single instructions at
//! an RVA, ask the handful of classification questions recovery cares
//! about, and re-encode instructions at a relocated address (branches and
//! rip-relative memory operands are recomputed by the encoder from the
//! absolute targets carried on the instruction).

use iced_x86::{
    Code, ConditionCode, Decoder, DecoderOptions, Encoder, FlowControl, Instruction, Mnemonic,
    OpKind, Register,
};

use crate::error::{Error, Result};
use crate::image::ProtectedImage;

/// Longest legal x86 instruction.
pub const MAX_INSTR_LEN: usize = 15;

/// A decoded instruction plus its raw machine bytes, addressed by RVA.
#[derive(Debug, Clone)]
pub struct Instr {
    pub inner: Instruction,
    pub bytes: Vec<u8>,
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#08x} ({}) {}", self.rva(), hex(&self.bytes), self.inner)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Instr {
    pub fn rva(&self) -> u64 {
        self.inner.ip()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn next_rva(&self) -> u64 {
        self.inner.next_ip()
    }

    pub fn is_ret(&self) -> bool {
        self.inner.flow_control() == FlowControl::Return
    }

    pub fn is_int3(&self) -> bool {
        self.inner.code() == Code::Int3
    }

    pub fn is_nop(&self) -> bool {
        matches!(self.inner.mnemonic(), Mnemonic::Nop)
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self.inner.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        )
    }

    pub fn is_jmp(&self) -> bool {
        matches!(
            self.inner.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        )
    }

    pub fn is_jcc(&self) -> bool {
        self.inner.flow_control() == FlowControl::ConditionalBranch
    }

    /// Near branch/call with an immediate target.
    pub fn branch_target(&self) -> Option<u64> {
        match self.inner.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(self.inner.near_branch_target())
            }
            _ => None,
        }
    }

    pub fn is_jmp_imm(&self) -> bool {
        self.inner.flow_control() == FlowControl::UnconditionalBranch
            && self.branch_target().is_some()
    }

    pub fn is_call_imm(&self) -> bool {
        self.inner.flow_control() == FlowControl::Call && self.branch_target().is_some()
    }

    /// `call qword ptr [rip+disp]` (`FF 15`).
    pub fn is_rip_rel_call(&self) -> bool {
        self.inner.code() == Code::Call_rm64 && self.inner.is_ip_rel_memory_operand()
    }

    /// `jmp qword ptr [rip+disp]` (`FF 25`).
    pub fn is_rip_rel_jmp(&self) -> bool {
        self.inner.code() == Code::Jmp_rm64 && self.inner.is_ip_rel_memory_operand()
    }

    /// Absolute destination of a rip-relative memory operand.
    pub fn rip_mem_target(&self) -> Option<u64> {
        if self.inner.is_ip_rel_memory_operand() {
            Some(self.inner.ip_rel_memory_address())
        } else {
            None
        }
    }

    pub fn is_stc(&self) -> bool {
        self.inner.code() == Code::Stc
    }

    pub fn is_clc(&self) -> bool {
        self.inner.code() == Code::Clc
    }

    /// `xor r, r` against the same register (forces ZF=1, CF=0).
    pub fn is_xor_same_reg(&self) -> bool {
        self.inner.mnemonic() == Mnemonic::Xor
            && self.inner.op0_kind() == OpKind::Register
            && self.inner.op1_kind() == OpKind::Register
            && self.inner.op0_register() == self.inner.op1_register()
    }

    /// `mov r, r` / `xchg r, r` against the same register.
    pub fn is_same_reg_move(&self) -> bool {
        matches!(self.inner.mnemonic(), Mnemonic::Mov | Mnemonic::Xchg)
            && self.inner.op0_kind() == OpKind::Register
            && self.inner.op1_kind() == OpKind::Register
            && self.inner.op0_register() == self.inner.op1_register()
    }

    /// `lea r, [r]` with no displacement, index, or scale.
    pub fn is_identity_lea(&self) -> bool {
        self.inner.mnemonic() == Mnemonic::Lea
            && self.inner.op0_kind() == OpKind::Register
            && self.inner.memory_index() == Register::None
            && self.inner.memory_displacement64() == 0
            && self.inner.memory_base().full_register() == self.inner.op0_register().full_register()
    }

    pub fn is_push_reg(&self) -> Option<Register> {
        if self.inner.mnemonic() == Mnemonic::Push && self.inner.op0_kind() == OpKind::Register {
            Some(self.inner.op0_register())
        } else {
            None
        }
    }

    pub fn is_pop_reg(&self) -> Option<Register> {
        if self.inner.mnemonic() == Mnemonic::Pop && self.inner.op0_kind() == OpKind::Register {
            Some(self.inner.op0_register())
        } else {
            None
        }
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.inner.condition_code()
    }
}

/// Decode the instruction at `rva` against the image view.
pub fn decode_at(image: &ProtectedImage, rva: u64) -> Result<Instr> {
    // Clamp the window at the end of the mapped span.
    let mut window = MAX_INSTR_LEN;
    let bytes = loop {
        match image.bytes_at(rva, window) {
            Ok(b) => break b,
            Err(_) if window > 1 => window -= 1,
            Err(e) => return Err(e),
        }
    };
    decode_bytes(bytes, rva)
}

/// Decode one instruction from a raw buffer positioned at `rva`.
pub fn decode_bytes(bytes: &[u8], rva: u64) -> Result<Instr> {
    let mut decoder = Decoder::with_ip(64, bytes, rva, DecoderOptions::NONE);
    let inner = decoder.decode();
    if inner.is_invalid() {
        return Err(Error::Decode(rva));
    }
    Ok(Instr {
        bytes: bytes[..inner.len()].to_vec(),
        inner,
    })
}

/// Encode `instr` as if it lived at `rip`. Branch and rip-relative
/// displacements are derived from the absolute targets on the
/// instruction.
pub fn encode_at(instr: &Instruction, rip: u64) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(64);
    encoder
        .encode(instr, rip)
        .map_err(|e| Error::Encode(rip, e.to_string()))?;
    Ok(encoder.take_buffer())
}

/// A synthetic `jmp rel32` to `target`.
pub fn synth_jmp(target: u64) -> Result<Instruction> {
    Instruction::with_branch(Code::Jmp_rel32_64, target)
        .map_err(|e| Error::Encode(target, e.to_string()))
}

/// A synthetic `jb rel32` to `target` (carry-flag conditional).
pub fn synth_jb(target: u64) -> Result<Instruction> {
    Instruction::with_branch(Code::Jb_rel32_64, target)
        .map_err(|e| Error::Encode(target, e.to_string()))
}

/// A synthetic `ret`.
pub fn synth_ret() -> Instruction {
    Instruction::with(Code::Retnq)
}

/// The rel32 form of a conditional branch for `cc`, so placeholder sizes
/// stay stable between the layout and fixup passes.
pub fn near_jcc_code(cc: ConditionCode) -> Option<Code> {
    Some(match cc {
        ConditionCode::o => Code::Jo_rel32_64,
        ConditionCode::no => Code::Jno_rel32_64,
        ConditionCode::b => Code::Jb_rel32_64,
        ConditionCode::ae => Code::Jae_rel32_64,
        ConditionCode::e => Code::Je_rel32_64,
        ConditionCode::ne => Code::Jne_rel32_64,
        ConditionCode::be => Code::Jbe_rel32_64,
        ConditionCode::a => Code::Ja_rel32_64,
        ConditionCode::s => Code::Js_rel32_64,
        ConditionCode::ns => Code::Jns_rel32_64,
        ConditionCode::p => Code::Jp_rel32_64,
        ConditionCode::np => Code::Jnp_rel32_64,
        ConditionCode::l => Code::Jl_rel32_64,
        ConditionCode::ge => Code::Jge_rel32_64,
        ConditionCode::le => Code::Jle_rel32_64,
        ConditionCode::g => Code::Jg_rel32_64,
        ConditionCode::None => return None,
    })
}

/// Rewrite a conditional branch into its rel32 form aimed at `target`.
pub fn widen_jcc(instr: &Instr, target: u64) -> Result<Instruction> {
    let code = near_jcc_code(instr.condition_code())
        .ok_or_else(|| Error::Encode(instr.rva(), "not a conditional branch".to_string()))?;
    Instruction::with_branch(code, target).map_err(|e| Error::Encode(instr.rva(), e.to_string()))
}

/// Rewrite a near call into its rel32 form aimed at `target`.
pub fn retarget_call(instr: &Instr, target: u64) -> Result<Instruction> {
    if !instr.is_call_imm() {
        return Err(Error::Encode(instr.rva(), "not a direct call".to_string()));
    }
    Instruction::with_branch(Code::Call_rel32_64, target)
        .map_err(|e| Error::Encode(instr.rva(), e.to_string()))
}
