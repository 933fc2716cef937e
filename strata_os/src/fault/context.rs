//! Register views over an interrupted thread's saved state.
//!
//! [`ContextView`] gives uniform access to the general registers, program
//! counter, stack pointer, link register and signal mask of a trapped
//! thread. Each target gets one implementation, picked at build time as
//! [`NativeContext`]; [`SyntheticContext`] is a plain in-memory stand-in
//! used to drive the trampoline without a real signal.
//!
//! # Register numbering
//!
//! | Target  | `register(n)`                                        |
//! |---------|------------------------------------------------------|
//! | x86_64  | hardware encoding: rax rcx rdx rbx rsp rbp rsi rdi r8..r15 |
//! | aarch64 | x0..x30 (x29 = fp, x30 = lr)                         |

use std::mem;

/// Mutable access to a trapped thread's registers.
///
/// Every accessor is total over its documented domain: indices outside
/// the architecture's register file yield `None`.
pub trait ContextView {
    /// General register `index`, in the target's hardware numbering.
    fn register_mut(&mut self, index: usize) -> Option<&mut usize>;

    /// Program counter. Writing it changes where the thread resumes.
    fn pc_mut(&mut self) -> &mut usize;

    /// Stack pointer.
    fn sp_mut(&mut self) -> &mut usize;

    /// Signal mask restored when the handler returns.
    fn sigmask_mut(&mut self) -> &mut libc::sigset_t;

    /// Link register, on architectures that have one.
    fn link_register_mut(&mut self) -> Option<&mut usize> {
        None
    }

    /// Raw bytes of floating-point/vector register `index`, where the
    /// saved state exposes it.
    fn float_register_mut(&mut self, index: usize) -> Option<&mut [u8; 16]> {
        let _ = index;
        None
    }

    /// Current program counter.
    #[inline]
    fn pc(&mut self) -> usize {
        *self.pc_mut()
    }

    /// Current stack pointer.
    #[inline]
    fn sp(&mut self) -> usize {
        *self.sp_mut()
    }

    /// Current value of general register `index`.
    #[inline]
    fn register(&mut self, index: usize) -> Option<usize> {
        self.register_mut(index).map(|r| *r)
    }
}

// =============================================================================
// TrappedContext
// =============================================================================

/// A context being handled, plus an optional redirected resume address.
///
/// The trampoline never writes the program counter directly: it records a
/// resume target with [`resume_at`](Self::resume_at), and [`finish`](Self::finish)
/// applies it just before the handler returns. Without a target the
/// faulting instruction is re-executed.
pub struct TrappedContext<C> {
    view: C,
    resume_at: Option<usize>,
}

impl<C: ContextView> TrappedContext<C> {
    /// Wrap a register view.
    #[inline]
    pub fn new(view: C) -> Self {
        Self {
            view,
            resume_at: None,
        }
    }

    /// The underlying register view.
    #[inline]
    pub fn view(&mut self) -> &mut C {
        &mut self.view
    }

    /// Program counter at the time of the fault.
    #[inline]
    pub fn pc(&mut self) -> usize {
        self.view.pc()
    }

    /// Resume at `pc` instead of re-executing the faulting instruction.
    #[inline]
    pub fn resume_at(&mut self, pc: usize) {
        self.resume_at = Some(pc);
    }

    /// The redirected resume address, if any.
    #[inline]
    pub fn resume_target(&self) -> Option<usize> {
        self.resume_at
    }

    /// Apply the resume target and hand the view back.
    #[inline]
    pub fn finish(mut self) -> C {
        if let Some(pc) = self.resume_at {
            *self.view.pc_mut() = pc;
        }
        self.view
    }
}

// =============================================================================
// SyntheticContext
// =============================================================================

/// Number of general registers in a [`SyntheticContext`].
pub const SYNTHETIC_REGISTERS: usize = 32;

/// An in-memory register file for simulated faults.
pub struct SyntheticContext {
    /// General registers.
    pub regs: [usize; SYNTHETIC_REGISTERS],
    /// Floating-point/vector registers.
    pub float_regs: [[u8; 16]; SYNTHETIC_REGISTERS],
    /// Program counter.
    pub pc: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Link register.
    pub lr: usize,
    sigmask: libc::sigset_t,
}

impl SyntheticContext {
    /// A zeroed register file with the given program counter and stack pointer.
    pub fn new(pc: usize, sp: usize) -> Self {
        // Safety: sigset_t is plain data; sigemptyset initializes it.
        let mut sigmask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe { libc::sigemptyset(&mut sigmask) };
        Self {
            regs: [0; SYNTHETIC_REGISTERS],
            float_regs: [[0; 16]; SYNTHETIC_REGISTERS],
            pc,
            sp,
            lr: 0,
            sigmask,
        }
    }
}

impl ContextView for SyntheticContext {
    fn register_mut(&mut self, index: usize) -> Option<&mut usize> {
        self.regs.get_mut(index)
    }

    fn pc_mut(&mut self) -> &mut usize {
        &mut self.pc
    }

    fn sp_mut(&mut self) -> &mut usize {
        &mut self.sp
    }

    fn sigmask_mut(&mut self) -> &mut libc::sigset_t {
        &mut self.sigmask
    }

    fn link_register_mut(&mut self) -> Option<&mut usize> {
        Some(&mut self.lr)
    }

    fn float_register_mut(&mut self, index: usize) -> Option<&mut [u8; 16]> {
        self.float_regs.get_mut(index)
    }
}

impl std::fmt::Debug for SyntheticContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticContext")
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("lr", &format_args!("{:#x}", self.lr))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// NativeContext
// =============================================================================

/// The `ucontext_t` handed to a signal handler.
pub struct NativeContext {
    uc: *mut libc::ucontext_t,
}

impl NativeContext {
    /// Wrap the third argument of an `SA_SIGINFO` handler.
    ///
    /// # Safety
    ///
    /// `uc` must point to the live `ucontext_t` of the current signal
    /// delivery and outlive the returned value.
    #[inline]
    pub unsafe fn from_raw(uc: *mut libc::c_void) -> Self {
        Self {
            uc: uc as *mut libc::ucontext_t,
        }
    }

    /// Reinterpret a saved 64-bit register slot as a machine word.
    #[inline]
    fn word<T>(slot: &mut T) -> &mut usize {
        debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<usize>());
        // Safety: callers only pass 64-bit integer slots on 64-bit targets.
        unsafe { &mut *(slot as *mut T as *mut usize) }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod native {
    use super::{ContextView, NativeContext};
    use libc::c_int;

    /// `gregs` slots in hardware register-encoding order.
    const GREGS: [c_int; 16] = [
        libc::REG_RAX,
        libc::REG_RCX,
        libc::REG_RDX,
        libc::REG_RBX,
        libc::REG_RSP,
        libc::REG_RBP,
        libc::REG_RSI,
        libc::REG_RDI,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ];

    impl NativeContext {
        #[inline]
        fn greg(&mut self, slot: c_int) -> &mut usize {
            let gregs = unsafe { &mut (*self.uc).uc_mcontext.gregs };
            Self::word(&mut gregs[slot as usize])
        }
    }

    impl ContextView for NativeContext {
        fn register_mut(&mut self, index: usize) -> Option<&mut usize> {
            let slot = *GREGS.get(index)?;
            Some(self.greg(slot))
        }

        fn pc_mut(&mut self) -> &mut usize {
            self.greg(libc::REG_RIP)
        }

        fn sp_mut(&mut self) -> &mut usize {
            self.greg(libc::REG_RSP)
        }

        fn sigmask_mut(&mut self) -> &mut libc::sigset_t {
            unsafe { &mut (*self.uc).uc_sigmask }
        }

        #[cfg(target_env = "gnu")]
        fn float_register_mut(&mut self, index: usize) -> Option<&mut [u8; 16]> {
            let fpregs = unsafe { (*self.uc).uc_mcontext.fpregs };
            if fpregs.is_null() {
                return None;
            }
            let xmm = unsafe { (*fpregs)._xmm.get_mut(index)? };
            // Safety: `element` is 16 bytes of plain data.
            Some(unsafe { &mut *(xmm.element.as_mut_ptr() as *mut [u8; 16]) })
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod native {
    use super::{ContextView, NativeContext};

    impl ContextView for NativeContext {
        fn register_mut(&mut self, index: usize) -> Option<&mut usize> {
            let regs = unsafe { &mut (*self.uc).uc_mcontext.regs };
            regs.get_mut(index).map(Self::word)
        }

        fn pc_mut(&mut self) -> &mut usize {
            Self::word(unsafe { &mut (*self.uc).uc_mcontext.pc })
        }

        fn sp_mut(&mut self) -> &mut usize {
            Self::word(unsafe { &mut (*self.uc).uc_mcontext.sp })
        }

        fn sigmask_mut(&mut self) -> &mut libc::sigset_t {
            unsafe { &mut (*self.uc).uc_sigmask }
        }

        fn link_register_mut(&mut self) -> Option<&mut usize> {
            self.register_mut(30)
        }
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod native {
    use super::{ContextView, NativeContext};

    impl NativeContext {
        #[inline]
        fn state(&mut self) -> &mut libc::__darwin_x86_thread_state64 {
            unsafe { &mut (*(*self.uc).uc_mcontext).__ss }
        }
    }

    impl ContextView for NativeContext {
        fn register_mut(&mut self, index: usize) -> Option<&mut usize> {
            let ss = self.state();
            let slot = match index {
                0 => &mut ss.__rax,
                1 => &mut ss.__rcx,
                2 => &mut ss.__rdx,
                3 => &mut ss.__rbx,
                4 => &mut ss.__rsp,
                5 => &mut ss.__rbp,
                6 => &mut ss.__rsi,
                7 => &mut ss.__rdi,
                8 => &mut ss.__r8,
                9 => &mut ss.__r9,
                10 => &mut ss.__r10,
                11 => &mut ss.__r11,
                12 => &mut ss.__r12,
                13 => &mut ss.__r13,
                14 => &mut ss.__r14,
                15 => &mut ss.__r15,
                _ => return None,
            };
            Some(Self::word(slot))
        }

        fn pc_mut(&mut self) -> &mut usize {
            Self::word(&mut self.state().__rip)
        }

        fn sp_mut(&mut self) -> &mut usize {
            Self::word(&mut self.state().__rsp)
        }

        fn sigmask_mut(&mut self) -> &mut libc::sigset_t {
            unsafe { &mut (*self.uc).uc_sigmask }
        }
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod native {
    use super::{ContextView, NativeContext};

    impl NativeContext {
        #[inline]
        fn state(&mut self) -> &mut libc::__darwin_arm_thread_state64 {
            unsafe { &mut (*(*self.uc).uc_mcontext).__ss }
        }
    }

    impl ContextView for NativeContext {
        fn register_mut(&mut self, index: usize) -> Option<&mut usize> {
            let ss = self.state();
            let slot = match index {
                0..=28 => &mut ss.__x[index],
                29 => &mut ss.__fp,
                30 => &mut ss.__lr,
                _ => return None,
            };
            Some(Self::word(slot))
        }

        fn pc_mut(&mut self) -> &mut usize {
            Self::word(&mut self.state().__pc)
        }

        fn sp_mut(&mut self) -> &mut usize {
            Self::word(&mut self.state().__sp)
        }

        fn sigmask_mut(&mut self) -> &mut libc::sigset_t {
            unsafe { &mut (*self.uc).uc_sigmask }
        }

        fn link_register_mut(&mut self) -> Option<&mut usize> {
            Some(Self::word(&mut self.state().__lr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_accessors_are_total() {
        let mut ctx = SyntheticContext::new(0x1000, 0x7fff_0000);
        assert_eq!(ctx.pc(), 0x1000);
        assert_eq!(ctx.sp(), 0x7fff_0000);
        assert!(ctx.register_mut(SYNTHETIC_REGISTERS).is_none());
        assert!(ctx.float_register_mut(SYNTHETIC_REGISTERS).is_none());

        *ctx.register_mut(3).unwrap() = 42;
        assert_eq!(ctx.register(3), Some(42));
        *ctx.link_register_mut().unwrap() = 0x2000;
        assert_eq!(ctx.lr, 0x2000);
        ctx.float_register_mut(1).unwrap()[0] = 0xab;
        assert_eq!(ctx.float_regs[1][0], 0xab);
    }

    #[test]
    fn test_sigmask_is_mutable() {
        let mut ctx = SyntheticContext::new(0, 0);
        unsafe {
            libc::sigaddset(ctx.sigmask_mut(), libc::SIGUSR1);
            assert_eq!(libc::sigismember(ctx.sigmask_mut(), libc::SIGUSR1), 1);
            assert_eq!(libc::sigismember(ctx.sigmask_mut(), libc::SIGUSR2), 0);
        }
    }

    #[test]
    fn test_finish_without_resume_keeps_pc() {
        let mut trapped = TrappedContext::new(SyntheticContext::new(0x4000, 0));
        assert_eq!(trapped.pc(), 0x4000);
        assert_eq!(trapped.resume_target(), None);
        assert_eq!(trapped.finish().pc, 0x4000);
    }

    #[test]
    fn test_finish_applies_resume_target() {
        let mut trapped = TrappedContext::new(SyntheticContext::new(0x4000, 0));
        trapped.resume_at(0x4004);
        // Not applied until finish.
        assert_eq!(trapped.pc(), 0x4000);
        assert_eq!(trapped.finish().pc, 0x4004);
    }
}
