//! Test utilities for the warden workspace
//!
//! Fixtures for guarded config directories, a scriptable process controller
//! for exercising status reconciliation without real processes, and async
//! wait helpers.

pub mod helpers;

pub use helpers::fixture::{GuardedDir, PRIMARY_A, PRIMARY_B};
pub use helpers::scripted_process::ScriptedProcessController;
pub use helpers::wait_utils::{WaitError, wait_for, wait_for_field};
