// Fiber runtime: queues, control blocks, scheduler
// Single core, no preemption. WFI idles the CPU while nothing is ready.

pub mod atomic;
pub mod error;
pub mod fiber;
pub mod list;
pub mod scheduler;

pub use error::{CreateError, JoinError};
pub use fiber::{Fiber, MIN_STACK_SIZE, STACK_ALIGN, STACK_PAINT_BYTE, Stack, Status};
pub use scheduler::{Queue, Scheduler};
