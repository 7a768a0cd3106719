//! HTTP transports for the external channels.

pub mod message_source;
pub mod verification;

pub use message_source::HttpMessageSource;
pub use verification::HttpVerificationChannel;
