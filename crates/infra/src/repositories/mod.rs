pub mod memory;
pub mod sqlite;
pub mod surreal;

pub use memory::*;
pub use sqlite::*;
pub use surreal::*;
