//! 本地连接
//!
//! 该模块在编排机本机上以子进程方式执行命令

use std::io::{ErrorKind, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

use crate::connection::{
    CommandResult, Connection, RunOptions, SESSION_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE, Target,
    join_cwd, log_result, with_cwd,
};
use crate::utils;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// shell 退出后等待输出管道关闭的时间
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// 本地连接
#[derive(Debug, Default)]
pub struct LocalConnection {
    cwd: Option<String>,
    closed: bool,
}

impl LocalConnection {
    /// 创建新的本地连接
    pub fn new() -> Self {
        Self::default()
    }

    /// 将路径解析为本机上的绝对或相对于工作目录的路径
    fn resolve_path(&self, path: &str) -> PathBuf {
        let expanded = utils::expand_home(path);
        if expanded.is_absolute() {
            return expanded;
        }
        match &self.cwd {
            Some(dir) => utils::expand_home(dir).join(expanded),
            None => expanded,
        }
    }

    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResult> {
        debug!("执行本地命令: {command}");

        // stderr 合并到 stdout；独立进程组便于超时时连同子进程一起终止
        let script = format!("exec 2>&1\n{}", with_cwd(self.cwd.as_deref(), command));
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("无法启动命令进程: {command}"))?;

        let mut stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => bail!("无法获取命令进程的标准输出"),
        };
        // 读取线程一直读到EOF；接收端关闭后继续读取并丢弃，后台进程不会因管道关闭收到SIGPIPE
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match stdout.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = tx.send(buffer[..n].to_vec());
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        });

        let mut output = Vec::new();
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let status = loop {
            while let Ok(chunk) = rx.try_recv() {
                output.extend_from_slice(&chunk);
            }
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                warn!("命令执行超时 ({timeout:?}): {command}");
                timed_out = true;
                kill_process_group(&mut child);
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        // shell 已退出；后台进程可能仍持有输出管道，只等待一小段时间，不终止它们
        let grace_end = Instant::now() + OUTPUT_GRACE;
        loop {
            match rx.recv_timeout(grace_end.saturating_duration_since(Instant::now())) {
                Ok(chunk) => output.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("命令 {command} 的后台进程仍持有输出管道，返回已读取的输出");
                    break;
                }
            }
        }
        let output = String::from_utf8_lossy(&output);

        let exit_code = match status {
            _ if timed_out => TIMEOUT_EXIT_CODE,
            Some(status) => status
                .code()
                .or_else(|| status.signal().map(|signal| 128 + signal))
                .unwrap_or(TIMEOUT_EXIT_CODE),
            None => TIMEOUT_EXIT_CODE,
        };

        debug!("命令执行完成: exit_code={exit_code}");
        Ok(CommandResult::new(command, exit_code, &output))
    }
}

/// 终止子进程所在的整个进程组
fn kill_process_group(child: &mut Child) {
    let pgid = format!("-{}", child.id());
    let killed = Command::new("kill")
        .args(["-KILL", "--", &pgid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !killed {
        let _ = child.kill();
    }
}

impl Connection for LocalConnection {
    fn target(&self) -> Target {
        Target::Local
    }

    fn run_with(&mut self, command: &str, options: &RunOptions) -> CommandResult {
        let result = if self.closed {
            CommandResult::new(command, SESSION_ERROR_EXIT_CODE, "Exception: connection already closed")
        } else {
            self.execute(command, options.timeout).unwrap_or_else(|e| {
                CommandResult::new(command, SESSION_ERROR_EXIT_CODE, &format!("Exception: {e:#}"))
            })
        };
        log_result(&Target::Local, &result, options);
        result
    }

    fn cd(&mut self, path: &str) {
        self.cwd = Some(join_cwd(self.cwd.as_deref(), path));
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn copyin(&mut self, src: &str, tgt: &Path) -> Result<()> {
        if self.closed {
            bail!("本地连接已关闭");
        }
        let src = self.resolve_path(src);
        debug!("复制本地文件 {} 到 {}", src.display(), tgt.display());
        utils::copy_file_atomically(&src, tgt)
    }

    fn copyout(&mut self, src: &Path, tgt: &str) -> Result<()> {
        if self.closed {
            bail!("本地连接已关闭");
        }
        let tgt = self.resolve_path(tgt);
        debug!("复制本地文件 {} 到 {}", src.display(), tgt.display());
        utils::copy_file_atomically(src, &tgt)
    }

    fn run_script(
        &mut self,
        script: &Path,
        parameters: &str,
        options: &RunOptions,
    ) -> CommandResult {
        let command = format!(
            "bash {} {parameters}",
            utils::shell_quote(&script.to_string_lossy())
        );
        self.run_with(command.trim_end(), options)
    }

    /// 本地连接无需释放资源，仅标记为已关闭
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
