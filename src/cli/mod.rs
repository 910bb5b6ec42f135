pub mod args;
pub mod ids;
pub mod prompt;
pub mod run;

pub use args::{Args, Command, DeleteTarget};
pub use run::run;
