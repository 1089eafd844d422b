mod node;
mod tree_db;


pub use node::*;
pub use tree_db::*;
