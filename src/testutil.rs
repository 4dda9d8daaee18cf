//! Host-test scaffolding
//!
//! A `Hal` implementation over plain process memory: "physical" addresses
//! are host addresses inside a leaked buffer, the direct map is the
//! identity, page tables are `BTreeMap`s, the executing "CPU" is a
//! thread-local the test picks, and the tick clock advances only when a
//! test says so. The one thing it cannot do is switch contexts: that
//! path never returns by contract and is exercised on hardware only.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once};

use crate::config::FRAME_SIZE;
use crate::hal::{self, AddrSpace, Context, Hal, PhysAddr, VirtAddr};
use crate::mm::{self, BootRegion, BootRegionKind};
use crate::task::{self, ProcessKind, ProcessRef, ThreadRef, ThreadState};

/// CPUs the test HAL reports online
pub const TEST_CPUS: usize = 4;

/// Context slot assignments used by the test HAL
const SLOT_ENTRY: usize = 0;
const SLOT_STACK: usize = 1;
const SLOT_PARAMS: usize = 2; // 2..5: start/syscall params
const SLOT_SYSCALL_NO: usize = 8;
const SLOT_STATUS: usize = 9;
const SLOT_RET: usize = 10; // 10..12

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

/// Pick the CPU identity of the calling test thread
pub fn set_cpu(cpu: usize) {
    assert!(cpu < TEST_CPUS);
    CURRENT_CPU.with(|c| c.set(cpu));
}

pub struct TestHal {
    ticks: AtomicU64,
    next_space: AtomicUsize,
    /// space → (page VA → (page PA, user))
    spaces: Mutex<BTreeMap<AddrSpace, BTreeMap<VirtAddr, (PhysAddr, bool)>>>,
}

impl TestHal {
    fn new() -> Self {
        TestHal {
            ticks: AtomicU64::new(1),
            next_space: AtomicUsize::new(1),
            spaces: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Hal for TestHal {
    fn cpu_id(&self) -> usize {
        CURRENT_CPU.with(|c| c.get())
    }

    fn cpu_count(&self) -> usize {
        TEST_CPUS
    }

    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn irq_disable(&self) -> bool {
        // Host threads have no interrupt flag; report "was off"
        false
    }

    fn irq_restore(&self, _was_enabled: bool) {}

    fn wait_for_event(&self) {
        std::thread::yield_now();
    }

    fn send_event(&self) {}

    fn init_context(&self, ctx: &mut Context, entry: VirtAddr, stack_top: VirtAddr, user: bool) {
        ctx.slots[SLOT_ENTRY] = entry;
        ctx.slots[SLOT_STACK] = stack_top;
        ctx.slots[SLOT_PARAMS + 5] = user as usize;
    }

    fn set_context_param(&self, ctx: &mut Context, index: usize, value: usize) {
        ctx.slots[SLOT_PARAMS + index] = value;
    }

    unsafe fn switch_context(&self, _ctx: *mut Context) -> ! {
        unreachable!("context switches cannot run on the host");
    }

    fn create_addr_space(&self) -> Option<AddrSpace> {
        let space = self.next_space.fetch_add(1, Ordering::Relaxed);
        self.spaces.lock().unwrap().insert(space, BTreeMap::new());
        Some(space)
    }

    fn destroy_addr_space(&self, space: AddrSpace) {
        self.spaces.lock().unwrap().remove(&space);
    }

    fn map_range(
        &self,
        space: AddrSpace,
        va: VirtAddr,
        pa: PhysAddr,
        pages: usize,
        user: bool,
    ) -> bool {
        let mut spaces = self.spaces.lock().unwrap();
        let table = match spaces.get_mut(&space) {
            Some(t) => t,
            None => return false,
        };
        for i in 0..pages {
            table.insert(va + i * FRAME_SIZE, (pa + i * FRAME_SIZE, user));
        }
        true
    }

    fn unmap_range(&self, space: AddrSpace, va: VirtAddr, pages: usize) {
        let mut spaces = self.spaces.lock().unwrap();
        if let Some(table) = spaces.get_mut(&space) {
            for i in 0..pages {
                table.remove(&(va + i * FRAME_SIZE));
            }
        }
    }

    fn translate(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr> {
        let spaces = self.spaces.lock().unwrap();
        let table = spaces.get(&space)?;
        let page = va & !(FRAME_SIZE - 1);
        let (pa, _) = table.get(&page)?;
        Some(pa + (va & (FRAME_SIZE - 1)))
    }

    fn invalidate_tlb(&self, _va: VirtAddr, _pages: usize) {}

    fn flush_tlb(&self) {}

    fn get_syscall_params(&self, ctx: &Context) -> (usize, [usize; 3]) {
        (
            ctx.slots[SLOT_SYSCALL_NO],
            [
                ctx.slots[SLOT_PARAMS],
                ctx.slots[SLOT_PARAMS + 1],
                ctx.slots[SLOT_PARAMS + 2],
            ],
        )
    }

    fn set_syscall_return(&self, ctx: &mut Context, status: isize, ret0: usize, ret1: usize) {
        ctx.slots[SLOT_STATUS] = status as usize;
        ctx.slots[SLOT_RET] = ret0;
        ctx.slots[SLOT_RET + 1] = ret1;
    }
}

static BOOT: Once = Once::new();

/// Test "physical memory" size
const TEST_RAM: usize = 256 << 20;

/// Bring the whole kernel up once per test process: install the HAL,
/// seed the PFN database over a leaked buffer (identity direct map), and
/// initialize the allocator ladder and task tables.
pub fn boot() {
    BOOT.call_once(|| {
        hal::install(Box::leak(Box::new(TestHal::new())));

        let ram = vec![0u8; TEST_RAM].leak();
        let base = (ram.as_ptr() as usize + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        let len = (ram.as_ptr() as usize + TEST_RAM - base) & !(FRAME_SIZE - 1);

        mm::init(
            0,
            &[BootRegion {
                base,
                len,
                kind: BootRegionKind::Usable,
            }],
        );
        task::init();
    });
}

/// Advance the test clock
pub fn advance_ticks(n: u64) {
    boot();
    let hal = hal::hal();
    // The installed HAL is always the TestHal in tests
    let test = unsafe { &*(hal as *const dyn Hal as *const TestHal) };
    test.ticks.fetch_add(n, Ordering::Release);
}

/// Serializes tests that drive the multi-CPU shootdown protocol to
/// completion, so intermediate quarantine states stay observable.
pub fn shootdown_serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A fresh kernel-class process
pub fn test_process(name: &str) -> ProcessRef {
    boot();
    let pid = task::create_process(name, ProcessKind::Kernel, 0).unwrap();
    task::acquire_process(pid).unwrap()
}

/// A fresh user-class process
pub fn test_user_process(name: &str) -> ProcessRef {
    boot();
    let pid = task::create_process(name, ProcessKind::User, 0).unwrap();
    task::acquire_process(pid).unwrap()
}

/// A thread in `proc`, promoted straight to `Normal` as if it were
/// running on some CPU
pub fn spawn_test_thread(proc: &ProcessRef) -> ThreadRef {
    let tid = {
        let mut pm = proc.lock();
        task::create_thread(proc, &mut pm, 0x1000, 0, proc.kind.is_user()).unwrap()
    };
    let thread = task::acquire_thread(tid).unwrap();
    thread.lock().state = ThreadState::Normal;
    thread
}

/// Tear a test thread down completely
pub fn retire_test_thread(thread: ThreadRef) {
    task::exit_thread(&thread);
    task::reap();
    drop(thread);
}
