pub mod config;
pub mod sys_utils;
pub mod types;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownMessage {
    // only use in initialize.
    Init,
    Cancel(String),
}
