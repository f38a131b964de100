//! Configuration for the harness: the TOML settings file, SSH connection
//! defaults and the command-line arguments of the `ranci` binary.

pub mod cli_args;
pub mod connection_config;
pub mod harness_config;
