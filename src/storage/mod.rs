pub mod errors;
pub mod implementations;
pub mod traits;

pub use errors::*;
pub use traits::*;
pub use implementations::{FileStorage, InMemoryStorage};
