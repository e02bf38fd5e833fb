// Background drivers: mail check, outbox flushing, delivery confirmation

pub mod delivery;
pub mod mail_check;
pub mod outbox;
pub mod shutdown;

pub use delivery::DeliveryChecker;
pub use mail_check::{CheckOutcome, MailChecker};
pub use outbox::{OutboxPass, OutboxProcessor};
pub use shutdown::{Shutdown, ShutdownTrigger};
