//! # Cortex-M Port Layer
//!
//! Hardware-specific code for ARMv7-M (Cortex-M3/M4, Thumb-2), tested on the
//! STM32F103. Implements the [`Port`] trait: initial stack frames, context
//! switching via PendSV, and the SysTick tick source.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by `main` until the first task starts,
//!   then by interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. The PendSV handler saves and restores R4–R11, which
//! completes the full context:
//!
//! ```text
//!   high ┌──────────┐ ◄── stack top (8-byte aligned)
//!        │ xPSR     │
//!        │ PC       │ ◄── task entry
//!        │ LR       │ ◄── task_exit
//!        │ R12      │
//!        │ R3..R1   │
//!        │ R0       │ ◄── task argument
//!        │ R11..R4  │ ◄── saved by PendSV
//!   low  └──────────┘ ◄── TCB stack pointer
//! ```
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF), so PendSV never
//! preempts application interrupt handlers and the switch happens on the way
//! out of the last one.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m_rt::exception;

use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::KERNEL;
use crate::log;
use crate::task::TaskEntry;

/// Words in the initial frame: 8 software-saved plus 8 hardware-stacked.
const FRAME_WORDS: usize = 16;

/// Thumb state bit of xPSR.
const XPSR_THUMB: u32 = 1 << 24;

/// Cortex-M port. Owns SysTick once the kernel starts it.
pub struct CortexM {
    syst: SYST,
}

impl CortexM {
    pub fn new(syst: SYST) -> Self {
        Self { syst }
    }
}

impl Port for CortexM {
    fn init_stack_frame(&mut self, entry: TaskEntry, arg: usize, stack: &mut [u32]) -> *mut u32 {
        // AAPCS wants the stack 8-byte aligned at the task's first instruction
        let mut top = stack.len();
        if (stack.as_ptr() as usize + top * 4) % 8 != 0 {
            top -= 1;
        }
        let frame = &mut stack[top - FRAME_WORDS..top];
        frame.fill(0);
        frame[8] = arg as u32; // R0
        frame[13] = task_exit as usize as u32; // LR
        frame[14] = (entry as usize as u32) & !1; // PC
        frame[15] = XPSR_THUMB;
        frame.as_mut_ptr()
    }

    fn switch_context(&mut self) {
        trigger_pendsv();
    }

    fn switch_context_from_isr(&mut self) {
        trigger_pendsv();
    }

    fn init_tick(&mut self) {
        configure_systick(&mut self.syst);
        set_interrupt_priorities();
    }

    unsafe fn start_first(sp: *mut u32) -> ! {
        unsafe { start_first_task(sp) }
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Pend a PendSV exception; the switch runs once no other handler is
/// active and interrupts are unmasked.
#[inline]
fn trigger_pendsv() {
    SCB::set_pendsv();
}

/// Set PendSV and SysTick to the lowest priority.
fn set_interrupt_priorities() {
    // System Handler Priority Register 3: [23:16] PendSV, [31:24] SysTick
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    unsafe {
        let val = core::ptr::read_volatile(SHPR3);
        core::ptr::write_volatile(SHPR3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and branch into the first task.
///
/// # Safety
/// Must only be called once, with a stack pointer from `init_stack_frame`,
/// and with interrupts masked.
unsafe fn start_first_task(psp: *mut u32) -> ! {
    unsafe {
        asm!(
            // Skip the software-saved R4-R11
            "adds r0, #32",
            "msr psp, r0",

            // Thread mode uses PSP (CONTROL.SPSEL = 1)
            "movs r0, #2",
            "msr control, r0",
            "isb",

            // Unwind the hardware frame by hand
            "pop {{r0-r3, r12}}",
            "pop {{r4}}",          // LR
            "pop {{r5}}",          // PC
            "pop {{r6}}",          // xPSR
            "mov lr, r4",
            "orr r5, r5, #1",

            "cpsie i",
            "bx r5",
            in("r0") psp,
            options(noreturn)
        );
    }
}

/// Landing pad for a task entry that returns.
extern "C" fn task_exit() -> ! {
    log::error!("task returned from its entry function");
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV handler: performs the context switch.
///
/// 1. Save R4–R11 onto the outgoing task's stack (PSP)
/// 2. Hand the updated PSP to the kernel, which returns the next task's PSP
/// 3. Restore R4–R11 from the new stack
/// 4. Return to Thread mode on PSP; the hardware restores the rest
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // EXC_RETURN: Thread mode, PSP, no FP context
        "mvn r0, #2",
        "bx r0",
        switch = sym pendsv_switch,
    )
}

extern "C" fn pendsv_switch(psp: *mut u32) -> *mut u32 {
    KERNEL.switch_in(psp)
}

#[exception]
fn SysTick() {
    KERNEL.enter_isr();
    KERNEL.tick();
    KERNEL.exit_isr();
}
