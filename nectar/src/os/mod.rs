pub mod account;
pub mod command;
pub mod shell;
pub mod sys;

pub use account::{AccountStore, Group, User};
pub use command::CommandRegistry;
pub use shell::Shell;
pub use sys::Sys;
