pub mod error;
pub mod ids;

pub use error::{KernelError, KernelResult};
pub use ids::db_id;
