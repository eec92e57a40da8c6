mod plan;
mod server;

pub use plan::*;
pub use server::*;
