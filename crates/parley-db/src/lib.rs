mod columns;
pub mod conversations;
pub mod error;
pub mod histories;
mod migration;
pub mod quotas;
pub mod store;

pub use conversations::Conversations;
pub use error::{Error, Result};
pub use histories::Histories;
pub use quotas::Quotas;
pub use store::{SharedStore, Store};
