//! 核心网生命周期管理
//!
//! 根据注册表中的描述部署、卸载核心网实例，收集其日志，并从命令输出中
//! 解析出可供 ping/iperf 使用的IP地址。
//!
//! 每个操作都会针对描述中的主机新建一个连接，操作结束时关闭。
//! 命令序列中以 `!` 开头的行不会作为shell命令执行，而是调用脚本目录中的同名脚本，
//! 其余单词以空格连接后作为脚本参数。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use regex::Regex;
use thiserror::Error;

use crate::config::harness_config::{DEFAULT_SCRATCH_DIR, HarnessConfig};
use crate::connection::{
    CommandResult, Connection, ConnectionFactory, RunOptions, SESSION_ERROR_EXIT_CODE,
};
use crate::utils::shell_quote;

pub mod registry;
pub use registry::{
    CURRENT_HOST_PLACEHOLDER, CoreNetworkDescriptor, CoreNetworkRegistry, LOG_DIR_PLACEHOLDER,
};

/// 命令序列中脚本调用的默认超时
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

static IP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"inet (?P<ip>[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+)").expect("IP pattern is valid")
});

/// 构造核心网实例时的配置错误
#[derive(Debug, Error)]
pub enum CoreNetworkError {
    #[error("cannot load core network registry {}: {message}", .path.display())]
    Registry { path: PathBuf, message: String },
    #[error("no such core network name \"{name}\" in \"{}\"", .path.display())]
    UnknownCoreNetwork { name: String, path: PathBuf },
    #[error("invalid registry entry for core network {name}: {message}")]
    InvalidDescriptor { name: String, message: String },
    #[error("core network {name} requires node, but none provided (cannot replace %%current_host%%)")]
    MissingNode { name: String },
    #[error("(at least one) LogCollect expression for {name} must contain \"%%log_dir%%\"")]
    MissingLogDirPlaceholder { name: String },
    #[error("directory handling not implemented")]
    DirectoryUnsupported,
}

/// 核心网实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreNetworkState {
    Undeployed,
    Deploying,
    Deployed,
    Undeploying,
}

/// 核心网实例
#[derive(Debug)]
pub struct CoreNetwork {
    name: String,
    host: String,
    descriptor: CoreNetworkDescriptor,
    factory: ConnectionFactory,
    scratch_dir: String,
    script_timeout: Duration,
    state: CoreNetworkState,
}

impl fmt::Display for CoreNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

impl CoreNetwork {
    /// 从注册表加载实例，使用默认的连接工厂
    ///
    /// `node` 用于替换 `%%current_host%%`；`dir` 暂不支持，传入即报错。
    pub fn new(
        name: &str,
        node: Option<&str>,
        dir: Option<&Path>,
        registry: &Path,
    ) -> Result<Self, CoreNetworkError> {
        Self::with_factory(name, node, dir, registry, ConnectionFactory::default())
    }

    /// 按照配置文件中的注册表、脚本目录、暂存目录和SSH设置加载实例
    pub fn from_config(
        name: &str,
        node: Option<&str>,
        dir: Option<&Path>,
        config: &HarnessConfig,
    ) -> Result<Self, CoreNetworkError> {
        let core = Self::with_factory(
            name,
            node,
            dir,
            &config.registry,
            ConnectionFactory::from_config(config),
        )?;
        Ok(core
            .with_scratch_dir(&config.scratch_dir)
            .with_script_timeout(config.script_timeout))
    }

    pub fn with_factory(
        name: &str,
        node: Option<&str>,
        dir: Option<&Path>,
        registry: &Path,
        factory: ConnectionFactory,
    ) -> Result<Self, CoreNetworkError> {
        if dir.is_some() {
            return Err(CoreNetworkError::DirectoryUnsupported);
        }
        let registry = CoreNetworkRegistry::load(registry)?;
        let descriptor = registry.descriptor(name)?;
        let core = Self::from_descriptor(name, descriptor, node, factory)?;
        info!("initialized core {core} from {}", registry.path().display());
        Ok(core)
    }

    /// 由已解析的描述构造实例并校验
    pub fn from_descriptor(
        name: &str,
        descriptor: CoreNetworkDescriptor,
        node: Option<&str>,
        factory: ConnectionFactory,
    ) -> Result<Self, CoreNetworkError> {
        let mut host = descriptor.host.trim().to_string();
        if host == CURRENT_HOST_PLACEHOLDER {
            host = match node {
                Some(node) => node.to_string(),
                None => {
                    return Err(CoreNetworkError::MissingNode {
                        name: name.to_string(),
                    });
                }
            };
        }
        if !descriptor.has_log_dir_placeholder() {
            return Err(CoreNetworkError::MissingLogDirPlaceholder {
                name: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            host,
            descriptor,
            factory,
            scratch_dir: DEFAULT_SCRATCH_DIR.to_string(),
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            state: CoreNetworkState::Undeployed,
        })
    }

    /// 设置日志收集使用的远程暂存目录
    pub fn with_scratch_dir(mut self, scratch_dir: &str) -> Self {
        self.scratch_dir = scratch_dir.to_string();
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_host(&self) -> &str {
        &self.host
    }

    /// 工作负载（如UE进程）需要加在命令前面的前缀，未配置时为空串
    pub fn get_cmd_prefix(&self) -> &str {
        self.descriptor.cmd_prefix.as_deref().unwrap_or("")
    }

    /// 该核心网环境是否已自带 iperf3 服务端，未配置时为 true
    pub fn run_iperf3_server(&self) -> bool {
        self.descriptor.run_iperf3_server.unwrap_or(true)
    }

    pub fn state(&self) -> CoreNetworkState {
        self.state
    }

    pub fn descriptor(&self) -> &CoreNetworkDescriptor {
        &self.descriptor
    }

    /// 部署核心网
    ///
    /// 先执行一遍卸载命令（忽略失败），再执行部署命令，遇到第一条失败的命令即停止。
    /// 部署命令全部成功后还必须能解析到IP地址，否则同样视为部署失败。
    /// 返回是否成功以及部署命令的合并输出；仅在无法建立连接时返回 `Err`。
    ///
    /// 部署失败时不会自动回滚，已启动的部分由后续的 [`CoreNetwork::undeploy`] 清理。
    pub fn deploy(&mut self) -> Result<(bool, String)> {
        self.state = CoreNetworkState::Deploying;
        let outcome = self.try_deploy();
        self.state = match &outcome {
            Ok((true, _)) => CoreNetworkState::Deployed,
            _ => CoreNetworkState::Undeployed,
        };
        outcome
    }

    fn try_deploy(&self) -> Result<(bool, String)> {
        info!("undeploy core network {self} before deployment");
        self.command(&self.descriptor.undeploy, false, false)?;

        info!("deploy core network {self}");
        let (success, output) = self.command(&self.descriptor.deploy, true, false)?;
        if !success {
            error!("failure during deployment of core network {self}:\n{output}");
            return Ok((false, output));
        }

        info!("retrieve IP address");
        match self.get_ip()? {
            Some(ip) => {
                info!("deployed core network {self}, pingable IP address {ip}");
                Ok((true, output))
            }
            None => {
                error!("could not retrieve pingable address of core network {self}");
                Ok((false, output))
            }
        }
    }

    /// 卸载核心网
    ///
    /// 给出 `log_dir` 时先收集日志到该本地目录；之后总是执行卸载命令，其失败只体现在输出中。
    /// 返回收集到的本地日志文件路径和卸载命令的合并输出。
    pub fn undeploy(&mut self, log_dir: Option<&Path>) -> Result<(Vec<PathBuf>, String)> {
        self.state = CoreNetworkState::Undeploying;
        let outcome = self.try_undeploy(log_dir);
        self.state = CoreNetworkState::Undeployed;
        outcome
    }

    fn try_undeploy(&self, log_dir: Option<&Path>) -> Result<(Vec<PathBuf>, String)> {
        let log_files = match log_dir {
            Some(dir) => self.collect_logs(dir).unwrap_or_else(|e| {
                error!("log collection for core network {self} failed: {e:#}");
                Vec::new()
            }),
            None => {
                warn!(
                    "no directory for log collection specified, cannot retrieve core network logs"
                );
                Vec::new()
            }
        };

        info!("undeploy core network {self}");
        let (_, output) = self.command(&self.descriptor.undeploy, false, false)?;
        Ok((log_files, output))
    }

    /// 执行 `NetworkScript` 并返回输出中 `inet ` 之后的第一个IPv4地址
    ///
    /// 只尝试一次；任何命令失败或没有匹配时返回 `None`。
    pub fn get_ip(&self) -> Result<Option<String>> {
        let (success, output) = self.command(&self.descriptor.network_script, true, true)?;
        if !success {
            return Ok(None);
        }
        Ok(extract_ip(&output))
    }

    fn collect_logs(&self, log_dir: &Path) -> Result<Vec<PathBuf>> {
        info!("collecting logs into (local) {}", log_dir.display());
        let remote_dir = self.scratch_dir.as_str();
        let quoted_dir = shell_quote(remote_dir);
        let quiet = RunOptions::default().silent(true);

        let mut connection = self.factory.get_connection(Some(&self.host))?;
        connection.run_with(&format!("rm -rf {quoted_dir}"), &quiet);
        let ret = connection.run_with(&format!("mkdir -p {quoted_dir}"), &quiet);
        if !ret.success() {
            error!("cannot create directory for log collection");
            return Ok(Vec::new());
        }

        // 告知核心网日志的存放位置并触发收集
        let log_commands: Vec<String> = self
            .descriptor
            .log_collect
            .iter()
            .map(|command| command.replace(LOG_DIR_PLACEHOLDER, remote_dir))
            .collect();
        self.run_sequence(connection.as_mut(), &log_commands, false, false);

        // 只收集暂存目录顶层的文件，子目录中的同名文件不会互相覆盖
        let ret = connection.run_with(&format!("find {quoted_dir} -maxdepth 1 -type f"), &quiet);
        if !ret.success() {
            error!("cannot enumerate log files");
            connection.run_with(&format!("rm -rf {quoted_dir}"), &quiet);
            return Ok(Vec::new());
        }
        let mut remote_files: Vec<&str> = ret
            .standard_output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        remote_files.sort_unstable();

        // 逐个拷贝到本地，只保留文件名
        let mut log_files = Vec::new();
        for remote_file in remote_files {
            let Some(file_name) = Path::new(remote_file).file_name() else {
                continue;
            };
            let local_file = log_dir.join(file_name);
            match connection.copyin(remote_file, &local_file) {
                Ok(()) => log_files.push(local_file),
                Err(e) => error!("cannot retrieve log file {remote_file}: {e:#}"),
            }
        }

        connection.run_with(&format!("rm -rf {quoted_dir}"), &quiet);
        close_quietly(connection.as_mut());
        Ok(log_files)
    }

    /// 在新连接上执行命令序列
    fn command(&self, commands: &[String], must_succeed: bool, silent: bool) -> Result<(bool, String)> {
        let mut connection = self.factory.get_connection(Some(&self.host))?;
        let outcome = self.run_sequence(connection.as_mut(), commands, must_succeed, silent);
        close_quietly(connection.as_mut());
        Ok(outcome)
    }

    /// 按顺序执行命令序列，返回是否全部成功及合并输出
    ///
    /// `must_succeed` 为真时遇到第一条失败的命令即停止。
    fn run_sequence(
        &self,
        connection: &mut dyn Connection,
        commands: &[String],
        must_succeed: bool,
        silent: bool,
    ) -> (bool, String) {
        let mut succeeded = true;
        let mut outputs: Vec<String> = Vec::new();
        let options = RunOptions::default()
            .silent(silent)
            .report_non_zero(false);

        for command in commands {
            let command = command.trim();
            let ret = match command.strip_prefix('!') {
                Some(line) => self.exec_script(connection, line, silent),
                None => connection.run_with(command, &options),
            };
            let failed = ret.return_code != 0;
            if failed {
                warn!(
                    "cmd \"{command}\" returned code {}, output {}",
                    ret.return_code, ret.standard_output
                );
            }
            if !ret.standard_output.is_empty() {
                outputs.push(ret.standard_output);
            }
            if failed && must_succeed {
                succeeded = false;
                break;
            }
        }
        (succeeded, outputs.join("\n"))
    }

    /// 执行 `!script param...` 形式的命令
    fn exec_script(&self, connection: &mut dyn Connection, line: &str, silent: bool) -> CommandResult {
        let (script_name, parameters) = parse_script_line(line);
        match self.factory.locate_script(&script_name) {
            Ok(script) => {
                let options = RunOptions::default()
                    .with_timeout(self.script_timeout)
                    .silent(silent)
                    .report_non_zero(false);
                connection.run_script(&script, &parameters, &options)
            }
            Err(e) => {
                error!("{e:#}");
                CommandResult::new(
                    &format!("!{line}"),
                    SESSION_ERROR_EXIT_CODE,
                    &format!("Exception: {e:#}"),
                )
            }
        }
    }
}

fn close_quietly(connection: &mut dyn Connection) {
    if let Err(e) = connection.close() {
        warn!("failed to close connection to {}: {e:#}", connection.target());
    }
}

/// 把 `!` 之后的内容拆分为脚本名和以空格连接的参数
pub fn parse_script_line(line: &str) -> (String, String) {
    let mut words = line.split_whitespace();
    let script_name = words.next().unwrap_or_default().to_string();
    let parameters = words.collect::<Vec<_>>().join(" ");
    (script_name, parameters)
}

/// 在输出中查找 `inet <ipv4>` 并返回第一个地址
pub fn extract_ip(output: &str) -> Option<String> {
    IP_PATTERN
        .captures(output)
        .and_then(|caps| caps.name("ip"))
        .map(|ip| ip.as_str().to_string())
}
