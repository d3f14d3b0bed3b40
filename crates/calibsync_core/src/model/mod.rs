//! Canonical domain model for mirrored instruments and sync bookkeeping.
//!
//! # Responsibility
//! - Define the instrument shape shared by normalizer, diff engine and store.
//! - Define session and audit records produced by the orchestrator.
//!
//! # Invariants
//! - An instrument is keyed remotely by `ExternalId` and locally by a stable
//!   `InstrumentId`; the two never change for a stored row.
//! - Retirement is a soft delete (`InstrumentStatus::Retired`), never a row
//!   removal.

pub mod audit;
pub mod calibration;
pub mod instrument;
pub mod session;
