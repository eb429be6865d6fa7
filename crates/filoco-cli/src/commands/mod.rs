//! Subcommand implementations

pub mod info;
pub mod init;
pub mod mdapply;
pub mod mdsync;
pub mod scan;
