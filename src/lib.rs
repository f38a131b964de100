//! ranci
//!
//! 面向RAN持续集成测试编排的命令执行层与核心网生命周期管理。
//!
//! - [`connection`]：本地/远程统一的命令执行与文件传输接口
//! - [`core_network`]：基于YAML注册表的核心网部署、卸载与IP发现
//! - [`config`]：配置文件与命令行参数

pub mod config;
pub mod connection;
pub mod core_network;
pub mod utils;

pub use connection::{
    CommandResult, Connection, ConnectionFactory, LocalConnection, RunOptions, SshConnection,
    Target,
};
pub use core_network::{CoreNetwork, CoreNetworkError, CoreNetworkState};
