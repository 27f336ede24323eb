//! Thin wrapper around the unicorn CPU emulator. Faults are returned as
//! values, never propagated: the obfuscator routinely emits code that
//! touches unmapped memory, and those faults are signals.

use log::trace;
use unicorn_engine::unicorn_const::{Arch, Mode, Permission, uc_error};
use unicorn_engine::{RegisterX86, Unicorn};

use crate::error::{Error, FaultKind, Result};
use crate::image::ProtectedImage;
use crate::pe::PAGE_SIZE;

pub const STACK_BASE: u64 = 0x0000_7FFF_FFF0_0000;
pub const STACK_SIZE: usize = 0x4000;
pub const STACK_POINTER: u64 = STACK_BASE + 0x3000;
pub const FRAME_POINTER: u64 = STACK_BASE + 0x3800;

/// Canary seeded at `[rsp]`; never mapped.
pub const RETURN_SENTINEL: u64 = 0x0000_7FFF_DEAD_0000;

/// Baseline RFLAGS (reserved bit + IF).
pub const RFLAGS_BASE: u64 = 0x202;
/// Same with the carry flag set.
pub const RFLAGS_CARRY: u64 = 0x203;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The stop predicate fired at `rip`.
    Stop { rip: u64, steps: usize },
    Halted { rip: u64 },
    StepBudget { rip: u64 },
    Fault { addr: u64, kind: FaultKind },
}

fn fault_kind(err: uc_error) -> FaultKind {
    match err {
        uc_error::READ_UNMAPPED => FaultKind::ReadUnmapped,
        uc_error::WRITE_UNMAPPED => FaultKind::WriteUnmapped,
        uc_error::FETCH_UNMAPPED => FaultKind::FetchUnmapped,
        uc_error::INSN_INVALID => FaultKind::InvalidInstruction,
        uc_error::READ_PROT | uc_error::WRITE_PROT | uc_error::FETCH_PROT => FaultKind::Protection,
        _ => FaultKind::InvalidInstruction,
    }
}

fn backend<T>(res: std::result::Result<T, uc_error>) -> Result<T> {
    res.map_err(|e| Error::Emulator(format!("{:?}", e)))
}

pub struct Emu {
    uc: Unicorn<'static, ()>,
    image_base: u64,
}

impl Emu {
    pub fn new() -> Result<Emu> {
        let mut uc = backend(Unicorn::new(Arch::X86, Mode::MODE_64))?;
        backend(uc.mem_map(
            STACK_BASE,
            STACK_SIZE,
            Permission::READ | Permission::WRITE,
        ))?;
        Ok(Emu { uc, image_base: 0 })
    }

    /// Map the image bytes read-only+executable at the preferred base.
    pub fn map_image(&mut self, image: &ProtectedImage) -> Result<()> {
        let base = image.image_base();
        let len = (image.len() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        backend(self.uc.mem_map(base, len, Permission::READ | Permission::EXEC))?;
        backend(self.uc.mem_write(base, image.as_bytes()))?;
        self.image_base = base;
        trace!("mapped image at {:#x} ({:#x} bytes)", base, len);
        Ok(())
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Reset registers and stack to the fixed initial recovery state.
    pub fn reset(&mut self, rflags: u64) -> Result<()> {
        const GPRS: [RegisterX86; 14] = [
            RegisterX86::RAX,
            RegisterX86::RBX,
            RegisterX86::RCX,
            RegisterX86::RDX,
            RegisterX86::RSI,
            RegisterX86::RDI,
            RegisterX86::R8,
            RegisterX86::R9,
            RegisterX86::R10,
            RegisterX86::R11,
            RegisterX86::R12,
            RegisterX86::R13,
            RegisterX86::R14,
            RegisterX86::R15,
        ];
        for reg in GPRS {
            backend(self.uc.reg_write(reg, 0))?;
        }
        backend(self.uc.reg_write(RegisterX86::RSP, STACK_POINTER))?;
        backend(self.uc.reg_write(RegisterX86::RBP, FRAME_POINTER))?;
        backend(self.uc.reg_write(RegisterX86::RFLAGS, rflags))?;
        backend(self.uc.mem_write(STACK_BASE, &vec![0u8; STACK_SIZE]))?;
        backend(
            self.uc
                .mem_write(STACK_POINTER, &RETURN_SENTINEL.to_le_bytes()),
        )?;
        Ok(())
    }

    pub fn rip(&self) -> u64 {
        self.uc.reg_read(RegisterX86::RIP).unwrap_or(0)
    }

    pub fn read_reg(&self, reg: RegisterX86) -> Result<u64> {
        backend(self.uc.reg_read(reg))
    }

    pub fn write_reg(&mut self, reg: RegisterX86, value: u64) -> Result<()> {
        backend(self.uc.reg_write(reg, value))
    }

    pub fn read_mem(&self, addr: u64, n: usize) -> Result<Vec<u8>> {
        backend(self.uc.mem_read_as_vec(addr, n))
    }

    /// Single-step from `start` until the stop predicate fires, the
    /// budget runs out, or the CPU faults.
    pub fn run_until<F>(&mut self, start: u64, mut stop: F, max_steps: usize) -> RunOutcome
    where
        F: FnMut(u64) -> bool,
    {
        let mut rip = start;
        for step in 0..max_steps {
            // `hlt` is a clean halt, not a fault.
            if let Ok(op) = self.uc.mem_read_as_vec(rip, 1) {
                if op[0] == 0xF4 {
                    return RunOutcome::Halted { rip };
                }
            }
            if let Err(e) = self.uc.emu_start(rip, u64::MAX, 0, 1) {
                return RunOutcome::Fault {
                    addr: self.rip(),
                    kind: fault_kind(e),
                };
            }
            rip = self.rip();
            if stop(rip) {
                return RunOutcome::Stop {
                    rip,
                    steps: step + 1,
                };
            }
        }
        RunOutcome::StepBudget { rip }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ProtectedImage;

    fn emu_for(code: &[u8]) -> Emu {
        let img = ProtectedImage::from_headerless(code, None).unwrap();
        let mut emu = Emu::new().unwrap();
        emu.map_image(&img).unwrap();
        emu.reset(RFLAGS_BASE).unwrap();
        emu
    }

    #[test]
    fn executes_until_sentinel_return() {
        // mov rax, 0x11223344; ret
        let code = [
            0x48, 0xB8, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0xC3,
        ];
        let mut emu = emu_for(&code);
        let out = emu.run_until(0, |rip| rip == RETURN_SENTINEL, 16);
        assert!(matches!(out, RunOutcome::Stop { rip, .. } if rip == RETURN_SENTINEL));
        assert_eq!(emu.read_reg(RegisterX86::RAX).unwrap(), 0x11223344);
    }

    #[test]
    fn step_budget_is_a_hard_cap() {
        // jmp $
        let code = [0xEB, 0xFE];
        let mut emu = emu_for(&code);
        let out = emu.run_until(0, |_| false, 8);
        assert!(matches!(out, RunOutcome::StepBudget { .. }));
    }

    #[test]
    fn unmapped_fetch_is_reported_as_a_fault() {
        // jmp to nowhere
        let code = [0xE9, 0x00, 0x00, 0x00, 0x10];
        let mut emu = emu_for(&code);
        let out = emu.run_until(0, |_| false, 8);
        assert!(matches!(
            out,
            RunOutcome::Fault {
                kind: FaultKind::FetchUnmapped,
                ..
            }
        ));
    }

    #[test]
    fn reset_restores_identical_state() {
        let code = [
            0x48, 0xB8, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0xC3,
        ];
        let mut emu = emu_for(&code);
        let first = emu.run_until(0, |rip| rip == RETURN_SENTINEL, 16);
        emu.reset(RFLAGS_BASE).unwrap();
        assert_eq!(emu.read_reg(RegisterX86::RAX).unwrap(), 0);
        let second = emu.run_until(0, |rip| rip == RETURN_SENTINEL, 16);
        assert_eq!(first, second);
    }
}
