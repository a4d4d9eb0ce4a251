pub mod codec;
pub mod crypto;
pub mod db;
pub mod error;
pub mod model;
pub mod sweep;
pub mod token;

pub use codec::{FileAttachment, Payload};
pub use db::{CreatedSecret, Store, StoreOptions};
pub use error::SecretError;
pub use model::{KeyMode, SecretRecord};
