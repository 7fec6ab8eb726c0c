// =====================================================================================
// APPOINTMENT CELL - SCHEDULING ENGINE
// =====================================================================================
//
// Book, cancel, reassign, confirm and complete appointments as single audited
// transactions. No two non-cancelled appointments share a (doctor, time) slot.
//
// =====================================================================================

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::*;
pub use services::{AttachmentService, ConsistencyChecker, PaymentService, SchedulingEngine};

pub use router::appointment_routes;
