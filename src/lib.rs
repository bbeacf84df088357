pub mod archive;
pub mod cli;
pub mod config;
pub mod definition;
pub mod entry;
pub mod error;
pub mod identity;
pub mod library;
pub mod logging;
pub mod net;
pub mod package;
pub mod queue;

pub use error::{ModError, OpResult};
pub use library::LibraryIndex;
pub use package::ModPackage;
pub use queue::{Channel, LockIntent, OpHandler};
