//! Job handler implementations.

pub mod echo;
pub mod env;
pub mod process;

pub use echo::EchoHandler;
pub use env::{credential_values, scoped_environment};
pub use process::ProcessHandler;
