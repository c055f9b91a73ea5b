pub mod cancel;
pub mod lease;

pub use cancel::CancellationToken;
pub use lease::{Lease, LeaseError};
