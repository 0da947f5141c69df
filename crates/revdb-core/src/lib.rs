//! Core types shared between the revdb engine crate and its consumers.
//!
//! This crate provides the process-wide lock-ordering and
//! contention-instrumentation machinery used at the boundary between
//! revdb's main lane and DB lane.

#![forbid(unsafe_code)]

pub mod lock_order;

pub use lock_order::{
    LockContentionEntry, LockLevel, OrderedMutex, OrderedMutexGuard, OrderedRwLock,
    OrderedRwLockReadGuard, OrderedRwLockWriteGuard, lock_contention_reset,
    lock_contention_snapshot,
};
