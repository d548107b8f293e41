pub mod error;
pub mod message;
pub mod mock;
pub mod publisher;
pub mod types;

pub use error::{Error, Result};
pub use message::OutboxMessage;
pub use mock::MockPublisher;
pub use publisher::Publisher;
pub use types::{DecodedRow, Value};
