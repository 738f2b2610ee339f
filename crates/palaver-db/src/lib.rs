pub mod database;
pub mod embedding_index;
pub mod identity_store;
pub mod message_store;
pub mod migrations;

pub use database::MemoryDb;
pub use embedding_index::{EmbeddingIndex, ScoredTurn, cosine_similarity};
pub use identity_store::{Identity, IdentityStore};
pub use message_store::MessageStore;
