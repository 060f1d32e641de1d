// stackful cooperative fibers for single-core microcontrollers (ESP32-C3 first)
//
// Fibers share one core and switch only when they say so: cede, schedule,
// join, done, cancel. ISRs join in through wakeup(). No allocator; every
// fiber lives in a block of memory its creator hands over.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod arch;
pub mod kernel;

pub use kernel::{
    CreateError, Fiber, JoinError, MIN_STACK_SIZE, Queue, STACK_ALIGN, Scheduler, Stack, Status,
};
