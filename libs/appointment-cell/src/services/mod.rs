pub mod attachment;
pub mod booking;
pub mod conflict;
pub mod consistency;
pub mod lifecycle;
pub mod payment;
pub mod retry;

pub use attachment::AttachmentService;
pub use booking::SchedulingEngine;
pub use consistency::ConsistencyChecker;
pub use payment::PaymentService;
pub use retry::{run_with_retry, RetryPolicy};
