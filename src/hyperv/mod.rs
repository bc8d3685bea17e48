//! Hyper-V host integration via PowerShell

mod commands;

pub use commands::{escape_ps, is_elevated, PowerShellHost};
