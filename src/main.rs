//! # TOS Demo Firmware
//!
//! Producer/consumer handshake over a mutex and a condition variable, plus a
//! monitor task reporting per-task statistics:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `producer` | 2 | Every second: allocates an item, publishes it under the mutex, signals |
//! | `consumer` | 1 | Waits on the condition until an item is published, frees it |
//! | `monitor`  | 3 | Every five seconds: logs state, switch count and run time of every task |
//!
//! Build for `thumbv7m-none-eabi` (STM32F103); with the `defmt` feature the
//! output goes over RTT. On other targets the binary is an empty stub.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(not(target_arch = "arm"))]
fn main() {}

#[cfg(target_arch = "arm")]
mod firmware {
    use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

    use cortex_m_rt::entry;
    #[cfg(feature = "defmt")]
    use defmt_rtt as _;
    use panic_halt as _;

    use tos::arch::cortex_m::CortexM;
    use tos::config::IDLE_STACK_WORDS;
    use tos::{mem, CondHandle, MutexHandle, TaskAttr, KERNEL};

    macro_rules! say {
        ($($t:tt)*) => {{
            #[cfg(feature = "defmt")]
            defmt::info!($($t)*);
        }};
    }

    /// Objects shared by the producer and the consumer, passed as the task
    /// argument.
    struct Shared {
        mutex: MutexHandle,
        cond: CondHandle,
    }

    /// Latest published item, guarded by `Shared::mutex`.
    static ITEM: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
    static PRODUCED: AtomicU32 = AtomicU32::new(0);

    fn shared(arg: usize) -> &'static Shared {
        // Safety: `arg` is the address of the `'static` Shared built in main.
        unsafe { &*(arg as *const Shared) }
    }

    extern "C" fn producer(arg: usize) -> ! {
        let shared = shared(arg);
        KERNEL.sleep_ms(2000);
        loop {
            if KERNEL.mutex_lock(shared.mutex).is_ok() {
                let n = PRODUCED.fetch_add(1, Ordering::Relaxed) + 1;
                if ITEM.load(Ordering::Relaxed).is_null() {
                    if let Some(item) = mem::malloc(4) {
                        // Safety: malloc returned 4 writable, 4-aligned bytes.
                        unsafe { item.as_ptr().cast::<u32>().write(n) };
                        ITEM.store(item.as_ptr(), Ordering::Relaxed);
                        say!("{}: producer put item", n);
                    }
                }
                let _ = KERNEL.mutex_unlock(shared.mutex);
            }
            KERNEL.sleep_ms(1000);
            say!("producer signal");
            let _ = KERNEL.cond_signal(shared.cond);
        }
    }

    extern "C" fn consumer(arg: usize) -> ! {
        let shared = shared(arg);
        loop {
            if KERNEL.mutex_lock(shared.mutex).is_err() {
                KERNEL.sleep_ms(100);
                continue;
            }
            while ITEM.load(Ordering::Relaxed).is_null() {
                say!("consumer wait");
                if KERNEL.cond_wait(shared.cond, shared.mutex).is_err() {
                    break;
                }
            }
            let item = ITEM.swap(core::ptr::null_mut(), Ordering::Relaxed);
            if !item.is_null() {
                // Safety: the producer wrote a u32 before publishing.
                let _n = unsafe { item.cast::<u32>().read() };
                say!("consumer got item {}", _n);
                // Safety: the item came from `mem::malloc` and is unpublished.
                let _ = unsafe { mem::free(item) };
            }
            let _ = KERNEL.mutex_unlock(shared.mutex);
        }
    }

    extern "C" fn monitor(_arg: usize) -> ! {
        loop {
            KERNEL.sleep_ms(5000);
            say!("tick {}", KERNEL.tick_count());
            KERNEL.for_each_task(|_info| {
                say!(
                    "  {} prio {} {} switches {} ticks {}",
                    _info.name,
                    _info.priority,
                    _info.state,
                    _info.switch_count,
                    _info.run_ticks
                );
            });
        }
    }

    #[entry]
    fn main() -> ! {
        let cp = cortex_m::Peripherals::take().expect("core peripherals taken twice");

        let heap = cortex_m::singleton!(: [u64; 128] = [0; 128]).expect("heap arena");
        // Safety: the arena is 'static, 8-aligned and used by nothing else.
        unsafe { mem::init(heap.as_mut_ptr().cast(), core::mem::size_of_val(heap)) }
            .expect("heap init");

        let idle_stack: &'static mut [u32] =
            cortex_m::singleton!(: [u32; IDLE_STACK_WORDS] = [0; IDLE_STACK_WORDS])
                .expect("idle stack");
        KERNEL
            .init(CortexM::new(cp.SYST), idle_stack)
            .expect("kernel init");

        let shared = cortex_m::singleton!(: Shared = Shared {
            mutex: KERNEL.mutex_create().expect("mutex"),
            cond: KERNEL.cond_create().expect("cond"),
        })
        .expect("shared state");
        let arg = shared as *const Shared as usize;

        let producer_stack: &'static mut [u32] =
            cortex_m::singleton!(: [u32; 256] = [0; 256]).expect("producer stack");
        let consumer_stack: &'static mut [u32] =
            cortex_m::singleton!(: [u32; 256] = [0; 256]).expect("consumer stack");
        let monitor_stack: &'static mut [u32] =
            cortex_m::singleton!(: [u32; 256] = [0; 256]).expect("monitor stack");

        KERNEL
            .create_task(producer, arg, TaskAttr::new("producer", 2, producer_stack))
            .expect("create producer");
        KERNEL
            .create_task(consumer, arg, TaskAttr::new("consumer", 1, consumer_stack))
            .expect("create consumer");
        KERNEL
            .create_task(monitor, 0, TaskAttr::new("monitor", 3, monitor_stack))
            .expect("create monitor");

        say!("tos demo start");
        KERNEL.start()
    }
}
