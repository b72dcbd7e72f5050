pub mod backoff;
pub mod dispatcher;

pub use backoff::RetryPolicy;
pub use dispatcher::{CommandDispatcher, CommandSink, DispatchOutcome};
