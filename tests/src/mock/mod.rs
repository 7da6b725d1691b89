//! Platform Emulation Layer for Scheduler Testing
//!
//! The scheduler runs unchanged; everything it consumes from the hypervisor
//! is emulated here.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                 Test Code (cargo test)                    │
//! ├───────────────────────────────────────────────────────────┤
//! │        Harness: boot, drive timers, spawn vCPU threads    │
//! ├───────────────────────────────────────────────────────────┤
//! │               hvsched (real scheduler code)               │
//! ├───────────────────────────────────────────────────────────┤
//! │                MockPlatform (Platform impl)               │
//! │  ┌────────┐ ┌──────────┐ ┌───────────┐ ┌───────────────┐  │
//! │  │ Clock  │ │ pCPU ids │ │ IPIs/relax│ │ Context switch│  │
//! │  └────────┘ └──────────┘ └───────────┘ └───────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Principles
//!
//! 1. **Deterministic time** - the clock only moves when a test moves it
//! 2. **pCPU = thread identity** - the calling thread says which pCPU it is
//! 3. **Parked hypercalls** - a vCPU's hypercall thread sleeps inside the
//!    context switch until that vCPU is dispatched again
//! 4. **Full observability** - switches, timer events, IPIs and shutdowns
//!    are recorded for assertions

pub mod log;

pub use harness::{Harness, VcpuThread};
pub use log::{capture, LogCapture};
pub use platform::{key, set_cpu, set_in_irq, MockPlatform, SwitchRecord, TimerEvent, VcpuKey};
