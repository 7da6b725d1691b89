//! hvsched Test Suite
//!
//! Exercises the scheduling core against an emulated platform: a manual
//! clock, pCPUs modelled as per-thread identities, and a context switch that
//! parks a vCPU's hypercall thread until that vCPU is dispatched again.
//!
//! Tests that touch process-wide state (the logger) are marked `#[serial]`.

pub mod mock;
