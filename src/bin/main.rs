// pulp-fiber demo for the ESP32-C3
//
// Boot: logger -> hal -> scheduler -> fibers -> timer
// A 100ms timer ISR wakes the blinker fiber every tick and the main
// fiber once a second. In between, a producer fiber crunches a checksum
// in slices, ceding after each one, and main collects it with join().
// With nothing ready the scheduler parks the core in WFI.

#![no_std]
#![no_main]

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embedded_hal::digital::StatefulOutputPin;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::time::Duration;
use esp_hal::timer::PeriodicTimer;
use esp_hal::timer::timg::TimerGroup;
use log::{info, warn};
use static_cell::ConstStaticCell;

use pulp_fiber::{Fiber, Scheduler, Stack};

esp_bootloader_esp_idf::esp_app_desc!();

const TICK_MS: u64 = 100;
const TICKS_PER_REPORT: u32 = 10;

static SCHED: Scheduler = Scheduler::new();

static BLINK_STACK: ConstStaticCell<Stack<2048>> = ConstStaticCell::new(Stack::new());
static PRODUCER_STACK: ConstStaticCell<Stack<4096>> = ConstStaticCell::new(Stack::new());

static TIMER0: Mutex<RefCell<Option<PeriodicTimer<'static, esp_hal::Blocking>>>> =
    Mutex::new(RefCell::new(None));
static LED: Mutex<RefCell<Option<Output<'static>>>> = Mutex::new(RefCell::new(None));

// fibers the ISR wakes
static BLINKER: Mutex<Cell<Option<Fiber>>> = Mutex::new(Cell::new(None));
static MAIN: Mutex<Cell<Option<Fiber>>> = Mutex::new(Cell::new(None));
static TICKS: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

#[esp_hal::handler(priority = esp_hal::interrupt::Priority::Priority1)]
fn timer0_handler() {
    let (blinker, main, ticks) = critical_section::with(|cs| {
        if let Some(timer) = TIMER0.borrow_ref_mut(cs).as_mut() {
            timer.clear_interrupt();
        }
        let ticks = TICKS.borrow(cs);
        ticks.set(ticks.get().wrapping_add(1));
        (BLINKER.borrow(cs).get(), MAIN.borrow(cs).get(), ticks.get())
    });

    if let Some(blinker) = blinker {
        SCHED.wakeup(blinker);
    }
    if ticks % TICKS_PER_REPORT == 0 {
        if let Some(main) = main {
            SCHED.wakeup(main);
        }
    }
}

fn toggle<P: StatefulOutputPin>(pin: &mut P) {
    let _ = StatefulOutputPin::toggle(pin);
}

fn blinker() {
    loop {
        critical_section::with(|cs| {
            if let Some(led) = LED.borrow_ref_mut(cs).as_mut() {
                toggle(led);
            }
        });
        SCHED.schedule();
    }
}

fn producer() {
    let mut sum: u32 = 0;
    for slice in 0..16u32 {
        for i in 0..256u32 {
            sum = sum.wrapping_mul(31).wrapping_add(slice * 256 + i);
        }
        SCHED.cede();
    }
    SCHED.done(&sum.to_le_bytes());
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    info!("booting...");

    let led = Output::new(peripherals.GPIO8, Level::Low, OutputConfig::default());
    critical_section::with(|cs| LED.borrow_ref_mut(cs).replace(led));

    SCHED.init();
    let main_fiber = SCHED.current();
    let blink = SCHED.create(blinker, BLINK_STACK.take().as_mut_slice());
    let produce = SCHED.create(producer, PRODUCER_STACK.take().as_mut_slice());
    critical_section::with(|cs| {
        BLINKER.borrow(cs).set(blink);
        MAIN.borrow(cs).set(main_fiber);
    });
    info!("fibers ready.");

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let mut timer0 = PeriodicTimer::new(timg0.timer0);
    critical_section::with(|cs| {
        timer0.set_interrupt_handler(timer0_handler);
        if let Err(e) = timer0.start(Duration::from_millis(TICK_MS)) {
            warn!("timer start failed: {:?}", e);
        }
        timer0.listen();
        TIMER0.borrow_ref_mut(cs).replace(timer0);
    });
    info!("timer initialized.");

    if let Some(produce) = produce {
        match SCHED.join(produce) {
            Some(bytes) if bytes.len() == 4 => {
                let sum = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                info!("producer checksum {:#010x}", sum);
            }
            other => warn!("producer gave {:?}", other),
        }
        if let Some(room) = SCHED.stack_headroom(produce) {
            info!("producer left {} stack bytes untouched", room);
        }
        SCHED.unlink(produce);
    }

    loop {
        SCHED.schedule();
        let ticks = critical_section::with(|cs| TICKS.borrow(cs).get());
        match blink.and_then(|b| SCHED.stack_headroom(b)) {
            Some(room) => info!("tick {}: blinker headroom {} bytes", ticks, room),
            None => info!("tick {}", ticks),
        }
    }
}
