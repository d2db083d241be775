//! Recording port for host tests.

extern crate std;

use std::vec;

use super::Port;
use crate::config::IDLE_STACK_WORDS;
use crate::scheduler::Scheduler;
use crate::task::{TaskAttr, TaskEntry, TaskHandle};

/// Port that records switch requests instead of switching.
#[derive(Debug, Default)]
pub struct TestPort {
    pub switches: u32,
    pub isr_switches: u32,
    pub tick_started: bool,
    pub frames: u32,
}

impl Port for TestPort {
    fn init_stack_frame(&mut self, _entry: TaskEntry, _arg: usize, stack: &mut [u32]) -> *mut u32 {
        self.frames += 1;
        let top = stack.as_mut_ptr_range().end;
        // 16-word frame, as on Cortex-M
        unsafe { top.sub(16) }
    }

    fn switch_context(&mut self) {
        self.switches += 1;
    }

    fn switch_context_from_isr(&mut self) {
        self.isr_switches += 1;
    }

    fn init_tick(&mut self) {
        self.tick_started = true;
    }

    unsafe fn start_first(_sp: *mut u32) -> ! {
        panic!("start_first is not available on the host");
    }
}

/// A leaked stack region of `words` words.
pub fn stack(words: usize) -> &'static mut [u32] {
    vec![0u32; words].leak()
}

pub extern "C" fn noop_task(_arg: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// A scheduler with the idle task created, not yet started.
pub fn booted() -> Scheduler<TestPort> {
    let mut s = Scheduler::new(TestPort::default());
    s.init(stack(IDLE_STACK_WORDS)).unwrap();
    s
}

/// Create a task with a 64-word stack.
pub fn spawn(s: &mut Scheduler<TestPort>, name: &'static str, priority: u8) -> TaskHandle {
    s.create_task(noop_task, 0, TaskAttr::new(name, priority, stack(64)))
        .unwrap()
}
