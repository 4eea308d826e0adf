//! Command implementations for the s2s CLI.

pub mod build_tokenizer;
pub mod init_config;
pub mod probe;
pub mod test;
pub mod train;
