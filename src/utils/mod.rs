pub mod aggregate;
pub mod command;
pub mod dispatch;
pub mod file;
pub mod invoker;
pub mod notify;
pub mod system;
pub mod transfer;
pub mod workers;
