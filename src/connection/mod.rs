//! 连接管理模块
//!
//! 该模块为本地执行和远程SSH执行提供统一的命令接口。
//! 调用方只需通过 [`ConnectionFactory::get_connection`] 获取连接，
//! 同一段编排代码即可不加修改地运行在本机或远程实验室主机上。

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use crate::config::connection_config::ConnectionConfig;
use crate::config::harness_config::HarnessConfig;

/// 单条命令的默认超时时间
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// 命令超时后返回的合成退出码
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// 会话层错误（通道无法打开、读取失败、连接已关闭）对应的合成退出码
pub const SESSION_ERROR_EXIT_CODE: i32 = 255;

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// 提交的命令文本
    pub arguments: String,
    /// 退出码
    pub return_code: i32,
    /// 合并后的标准输出和标准错误，换行已规范化，末尾空白已去除
    pub standard_output: String,
}

impl CommandResult {
    pub fn new(arguments: &str, return_code: i32, raw_output: &str) -> Self {
        Self {
            arguments: arguments.to_string(),
            return_code,
            standard_output: crate::utils::normalize_output(raw_output),
        }
    }

    /// 命令是否成功退出
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// `run` 的可选参数
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub timeout: Duration,
    /// 将命令与输出的日志级别从 info 降为 debug
    pub silent: bool,
    /// 非零退出码是否以 warn 级别记录
    pub report_non_zero: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            silent: false,
            report_non_zero: true,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn report_non_zero(mut self, report: bool) -> Self {
        self.report_non_zero = report;
        self
    }
}

/// 连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 编排机本机
    Local,
    /// 通过SSH访问的远程主机
    Remote(String),
}

impl Target {
    /// 解析主机标识
    ///
    /// 空串、`none`、`localhost`（不区分大小写）或缺省值都视为本机，其余均为远程主机。
    pub fn resolve(host: Option<&str>) -> Self {
        match host.map(str::trim) {
            None => Target::Local,
            Some(h) if h.is_empty() => Target::Local,
            Some(h) if h.eq_ignore_ascii_case("none") || h.eq_ignore_ascii_case("localhost") => {
                Target::Local
            }
            Some(h) => Target::Remote(h.to_string()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "localhost"),
            Target::Remote(host) => write!(f, "{host}"),
        }
    }
}

/// 命令连接特质
///
/// 连接在 `Drop` 时自动关闭，因此任何提前返回路径上资源都会被释放。
/// 连接不应在线程之间共享，每个逻辑操作各自创建一个连接。
pub trait Connection: Send {
    /// 连接目标
    fn target(&self) -> Target;

    /// 在当前工作目录下执行命令
    ///
    /// 超时或会话错误不会返回 `Err`，而是体现为非零的 `return_code`。
    fn run_with(&mut self, command: &str, options: &RunOptions) -> CommandResult;

    /// 使用默认选项执行命令
    fn run(&mut self, command: &str) -> CommandResult {
        self.run_with(command, &RunOptions::default())
    }

    /// 修改后续命令使用的工作目录（不执行shell的cd）
    fn cd(&mut self, path: &str);

    /// 当前记录的工作目录
    fn cwd(&self) -> Option<&str>;

    /// 把连接主机上的 `src` 复制到编排机上的 `tgt`
    fn copyin(&mut self, src: &str, tgt: &Path) -> Result<()>;

    /// 把编排机上的 `src` 复制到连接主机上的 `tgt`
    fn copyout(&mut self, src: &Path, tgt: &str) -> Result<()>;

    /// 在连接主机上执行编排机本地的脚本文件
    fn run_script(&mut self, script: &Path, parameters: &str, options: &RunOptions)
    -> CommandResult;

    /// 关闭连接，可重复调用
    fn close(&mut self) -> Result<()>;
}

/// 按 `run` 的约定记录命令及其结果
pub(crate) fn log_result(target: &Target, result: &CommandResult, options: &RunOptions) {
    if options.silent {
        debug!("[{target}] $ {}", result.arguments);
        if !result.standard_output.is_empty() {
            debug!("[{target}] {}", result.standard_output);
        }
    } else {
        info!("[{target}] $ {}", result.arguments);
        if !result.standard_output.is_empty() {
            info!("[{target}] {}", result.standard_output);
        }
    }
    if result.return_code != 0 && options.report_non_zero {
        warn!(
            "[{target}] 命令 \"{}\" 返回非零退出码 {}",
            result.arguments, result.return_code
        );
    }
}

/// 若设置了工作目录，则在命令前加上 `cd <dir> && `
pub(crate) fn with_cwd(cwd: Option<&str>, command: &str) -> String {
    match cwd {
        Some(dir) => format!("cd {} && {command}", crate::utils::shell_quote(dir)),
        None => command.to_string(),
    }
}

/// 计算 `cd` 之后的新工作目录
pub(crate) fn join_cwd(current: Option<&str>, path: &str) -> String {
    if path.starts_with('/') || path.starts_with('~') {
        return path.to_string();
    }
    match current {
        Some(dir) => format!("{}/{path}", dir.trim_end_matches('/')),
        None => path.to_string(),
    }
}

/// 连接工厂，根据主机标识创建本地或SSH连接，并在主机上运行脚本
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    connection: ConnectionConfig,
    scripts_dir: PathBuf,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl ConnectionFactory {
    pub fn new(connection: ConnectionConfig, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            connection,
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.connection.clone(), config.scripts_dir.clone())
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// 根据主机标识创建连接
    ///
    /// 远程连接在此处完成TCP连接、握手与认证；主机不可达或认证失败时返回错误。
    pub fn get_connection(&self, host: Option<&str>) -> Result<Box<dyn Connection>> {
        match Target::resolve(host) {
            Target::Local => Ok(Box::new(LocalConnection::new())),
            Target::Remote(host) => {
                let connection = SshConnection::connect(&host, &self.connection)
                    .with_context(|| format!("无法建立到 {host} 的SSH连接"))?;
                Ok(Box::new(connection))
            }
        }
    }

    /// 在脚本目录中查找脚本
    pub fn locate_script(&self, script_name: &str) -> Result<PathBuf> {
        let path = self.scripts_dir.join(script_name);
        if !path.is_file() {
            bail!(
                "脚本 {script_name} 不存在于 {}",
                self.scripts_dir.display()
            );
        }
        Ok(path)
    }

    /// 在指定主机上运行脚本目录中的脚本
    pub fn run_script(
        &self,
        host: Option<&str>,
        script_name: &str,
        timeout: Duration,
        parameters: &str,
        silent: bool,
    ) -> Result<CommandResult> {
        let script = self.locate_script(script_name)?;
        let mut connection = self.get_connection(host)?;
        let options = RunOptions::default().with_timeout(timeout).silent(silent);
        let result = connection.run_script(&script, parameters, &options);
        connection.close()?;
        Ok(result)
    }
}

// 本地连接
mod local;
pub use local::LocalConnection;

// SSH连接
mod ssh;
pub use ssh::SshConnection;

// ~/.ssh/config 解析
pub mod ssh_config;
