pub mod error;
pub mod turn;
pub mod types;

pub use error::{Error, Result};
pub use turn::Turn;
pub use types::{AuthorId, MessageId};
