//! SSH连接
//!
//! 该模块通过一个持久的SSH会话在远程主机上执行命令。
//!
//! 每条命令都在新的会话通道中执行，远程shell不会保留上一条命令的状态，
//! 因此连接自己记录工作目录，并在每条命令前加上 `cd <dir> && `。
//!
//! ## 主机标识
//!
//! 主机标识可以是 `host`、`user@host`、`host:port` 或 `user@host:port`。
//! 主机名会先在 `~/.ssh/config` 中查找（`HostName`、`User`、`Port`、`IdentityFile`），
//! 未指定的部分再取自 [`ConnectionConfig`]。
//!
//! ## 认证顺序
//!
//! 1. SSH代理
//! 2. 私钥文件（配置的私钥、ssh配置中的 `IdentityFile`、默认私钥）
//! 3. 密码（如果配置了）

use anyhow::{Context, Result, bail};
use log::{debug, error, warn};
use ssh2::{Channel, Session};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::connection_config::ConnectionConfig;
use crate::connection::ssh_config::SshEndpoint;
use crate::connection::{
    CommandResult, Connection, RunOptions, SESSION_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE, Target,
    join_cwd, log_result, with_cwd,
};
use crate::utils;

/// SSH连接
pub struct SshConnection {
    /// 调用方给出的主机标识
    host: String,
    /// SSH会话
    session: Session,
    /// 记录的工作目录
    cwd: Option<String>,
    /// 连接状态
    connected: bool,
}

impl SshConnection {
    /// 建立到主机的SSH连接
    pub fn connect(host: &str, config: &ConnectionConfig) -> Result<Self> {
        let endpoint = SshEndpoint::resolve(host, config)?;
        debug!(
            "创建SSH连接: {}@{}:{}",
            endpoint.user, endpoint.hostname, endpoint.port
        );

        let tcp = Self::connect_with_retry(
            &endpoint.hostname,
            endpoint.port,
            config.max_retries as usize,
            config.timeout,
        )?;

        // 创建SSH会话
        let mut session = Session::new().with_context(|| "无法创建SSH会话")?;
        session.set_tcp_stream(tcp);
        session.set_timeout(duration_millis(config.timeout));
        session.handshake().with_context(|| "SSH握手失败")?;

        Self::authenticate_session(&mut session, &endpoint, config.password.as_deref())?;

        // 命令本身的超时由 run 自行控制
        session.set_timeout(0);

        Ok(Self {
            host: host.to_string(),
            session,
            cwd: None,
            connected: true,
        })
    }

    /// 带重试的TCP连接
    fn connect_with_retry(
        hostname: &str,
        port: u16,
        max_retries: usize,
        timeout: Duration,
    ) -> Result<TcpStream> {
        let start_time = Instant::now();
        let mut retry = 0;
        loop {
            match Self::connect_tcp(hostname, port, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("连接失败: {e:#}");
                    if start_time.elapsed() > timeout || retry >= max_retries {
                        return Err(e.context(format!("无法连接到 {hostname}:{port}")));
                    }
                }
            }
            retry += 1;
            debug!("连接重试 #{retry}");
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn connect_tcp(hostname: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let addresses: Vec<SocketAddr> = (hostname, port)
            .to_socket_addrs()
            .with_context(|| format!("无法解析主机名 {hostname}"))?
            .collect();
        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => bail!("主机名 {hostname} 没有可用地址"),
        }
    }

    /// 身份验证
    fn authenticate_session(
        session: &mut Session,
        endpoint: &SshEndpoint,
        password: Option<&str>,
    ) -> Result<()> {
        let username = endpoint.user.as_str();

        // 1. SSH代理
        match session.userauth_agent(username) {
            Ok(_) => debug!("SSH 代理认证成功"),
            Err(e) => debug!("SSH 代理认证失败: {e}"),
        }

        // 2. 私钥文件
        if !session.authenticated() {
            for key in &endpoint.identity_files {
                if !key.exists() {
                    debug!("私钥文件未找到: {}", key.display());
                    continue;
                }
                match session.userauth_pubkey_file(username, None, key, None) {
                    Ok(_) => {
                        debug!("SSH 公钥文件认证成功 ({})", key.display());
                        break;
                    }
                    Err(e) => debug!("SSH 公钥文件认证失败 ({}): {e}", key.display()),
                }
            }
        }

        // 3. 密码
        if !session.authenticated() {
            if let Some(pass) = password {
                debug!("使用密码进行认证");
                if let Err(e) = session.userauth_password(username, pass) {
                    debug!("SSH 密码认证失败: {e}");
                }
            }
        }

        if !session.authenticated() {
            bail!("所有 SSH 认证方法都失败 ({username}@{})", endpoint.hostname);
        }
        Ok(())
    }

    /// 相对路径相对于记录的工作目录；`~/` 开头的路径相对于远程用户的主目录
    fn resolve_remote_path(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix("~/") {
            return rest.to_string();
        }
        if path.starts_with('/') {
            return path.to_string();
        }
        match self.cwd.as_deref() {
            Some(dir) => join_cwd(Some(dir.strip_prefix("~/").unwrap_or(dir)), path),
            None => path.to_string(),
        }
    }

    /// 在新通道中执行命令，可选地把 `stdin` 写入远程进程
    ///
    /// 超时由远程的 `timeout -s KILL` 强制执行，本地只在其后额外等待
    /// [`REMOTE_KILL_GRACE`]，之后直接关闭通道。
    fn execute(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandResult> {
        if !self.connected {
            bail!("SSH连接已关闭");
        }
        debug!("执行SSH命令: {command}");

        let actual_command = remote_command(self.cwd.as_deref(), command, timeout);
        let started = Instant::now();

        let mut channel = self
            .session
            .channel_session()
            .with_context(|| "无法打开SSH会话通道")?;
        channel
            .exec(&actual_command)
            .with_context(|| format!("无法执行远程命令: {command}"))?;

        self.session.set_blocking(false);
        let transfer = transfer_with_timeout(
            &mut channel,
            stdin.unwrap_or_default(),
            timeout + REMOTE_KILL_GRACE,
        );
        self.session.set_blocking(true);
        let (mut output, timed_out) = transfer?;

        if timed_out {
            warn!("SSH命令执行超时 ({timeout:?})，远程进程未在期限内结束: {command}");
            if let Err(e) = channel.close() {
                debug!("关闭超时通道失败: {e}");
            }
            return Ok(CommandResult::new(command, TIMEOUT_EXIT_CODE, &output));
        }

        // 阻塞模式下取走通道中剩余的数据
        let mut rest = Vec::new();
        channel
            .read_to_end(&mut rest)
            .with_context(|| "读取标准输出失败")?;
        channel
            .stderr()
            .read_to_end(&mut rest)
            .with_context(|| "读取标准错误失败")?;
        output.push_str(&String::from_utf8_lossy(&rest));

        channel.wait_close().with_context(|| "等待通道关闭失败")?;
        let exit_code = timeout_exit_code(
            channel.exit_status().with_context(|| "无法获取退出码")?,
            started.elapsed(),
            timeout,
        );
        if exit_code == TIMEOUT_EXIT_CODE {
            warn!("SSH命令执行超时 ({timeout:?}): {command}");
        }
        debug!("SSH命令执行完成: exit_code={exit_code}");

        Ok(CommandResult::new(command, exit_code, &output))
    }

    /// 以命令结果的形式执行，会话层错误转为合成退出码
    fn execute_as_result(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        options: &RunOptions,
    ) -> CommandResult {
        let result = self
            .execute(command, stdin, options.timeout)
            .unwrap_or_else(|e| {
                CommandResult::new(command, SESSION_ERROR_EXIT_CODE, &format!("Exception: {e:#}"))
            });
        log_result(&self.target(), &result, options);
        result
    }

    fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let (mut remote_file, stat) = self
            .session
            .scp_recv(Path::new(remote_path))
            .with_context(|| format!("无法读取远程文件 {remote_path}"))?;
        let expected = stat.size();

        utils::write_atomically(local_path, |local_file| {
            let received = std::io::copy(&mut remote_file, local_file)
                .with_context(|| format!("下载 {remote_path} 失败"))?;
            if received != expected {
                bail!("下载 {remote_path} 不完整: {received}/{expected} 字节");
            }
            Ok(received)
        })?;

        // 关闭远程通道
        remote_file.send_eof()?;
        remote_file.wait_eof()?;
        remote_file.close()?;
        remote_file.wait_close()?;
        Ok(())
    }

    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut local_file = File::open(local_path)
            .with_context(|| format!("无法打开本地文件 {}", local_path.display()))?;
        let metadata = local_file.metadata()?;
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            (metadata.permissions().mode() & 0o777) as i32
        };

        let mut remote_file = self
            .session
            .scp_send(Path::new(remote_path), mode, metadata.len(), None)
            .with_context(|| format!("无法创建远程文件 {remote_path}"))?;
        std::io::copy(&mut local_file, &mut remote_file)
            .with_context(|| format!("上传 {} 失败", local_path.display()))?;

        // 确保数据被刷新，文件在远程端关闭
        remote_file.send_eof()?;
        remote_file.wait_eof()?;
        remote_file.close()?;
        remote_file.wait_close()?;
        Ok(())
    }
}

impl Connection for SshConnection {
    fn target(&self) -> Target {
        Target::Remote(self.host.clone())
    }

    fn run_with(&mut self, command: &str, options: &RunOptions) -> CommandResult {
        self.execute_as_result(command, None, options)
    }

    fn cd(&mut self, path: &str) {
        self.cwd = Some(join_cwd(self.cwd.as_deref(), path));
    }

    fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    fn copyin(&mut self, src: &str, tgt: &Path) -> Result<()> {
        if !self.connected {
            bail!("SSH连接已关闭");
        }
        let remote_path = self.resolve_remote_path(src);
        debug!("下载 {}:{remote_path} 到 {}", self.host, tgt.display());
        self.download(&remote_path, tgt)
    }

    fn copyout(&mut self, src: &Path, tgt: &str) -> Result<()> {
        if !self.connected {
            bail!("SSH连接已关闭");
        }
        let remote_path = self.resolve_remote_path(tgt);
        let partial = format!("{remote_path}.part");
        debug!("上传 {} 到 {}:{remote_path}", src.display(), self.host);

        // 先上传到临时文件，完整后再改名
        if let Err(e) = self.upload(src, &partial) {
            let _ = self.execute(
                &format!("rm -f {}", utils::shell_quote(&partial)),
                None,
                Duration::from_secs(30),
            );
            return Err(e);
        }
        let rename = format!(
            "mv -f {} {}",
            utils::shell_quote(&partial),
            utils::shell_quote(&remote_path)
        );
        let result = self.execute(&rename, None, Duration::from_secs(30))?;
        if !result.success() {
            bail!(
                "无法把 {partial} 移动到 {remote_path}: {}",
                result.standard_output
            );
        }
        Ok(())
    }

    fn run_script(
        &mut self,
        script: &Path,
        parameters: &str,
        options: &RunOptions,
    ) -> CommandResult {
        let display = format!("{} {parameters}", script.display());
        let display = display.trim_end();
        let content = match std::fs::read(script) {
            Ok(content) => content,
            Err(e) => {
                let result = CommandResult::new(
                    display,
                    SESSION_ERROR_EXIT_CODE,
                    &format!("Exception: cannot read {}: {e}", script.display()),
                );
                log_result(&self.target(), &result, options);
                return result;
            }
        };

        // 脚本通过标准输入传给远程 bash，无需事先拷贝到远程主机
        let command = format!("bash -s -- {parameters}");
        let mut result = self.execute_as_result(command.trim_end(), Some(&content), options);
        result.arguments = display.to_string();
        result
    }

    /// 关闭SSH连接
    fn close(&mut self) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.session
                .disconnect(None, "正常关闭", None)
                .with_context(|| "关闭SSH连接失败")?;
        }
        Ok(())
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if self.connected {
            self.connected = false;
            if let Err(e) = self.session.disconnect(None, "连接被丢弃", None) {
                error!("关闭SSH连接失败: {e}");
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// 远程 `timeout -s KILL` 终止命令后的退出码
const REMOTE_KILLED_EXIT_CODE: i32 = 128 + 9;

/// 远程超时生效后，本地继续等待通道结束的时间
const REMOTE_KILL_GRACE: Duration = Duration::from_secs(5);

/// 构造实际发送的远程命令
///
/// stderr 合并到 stdout；命令在 `timeout -s KILL` 下运行，超时后远程的整个进程组被终止。
fn remote_command(cwd: Option<&str>, command: &str, timeout: Duration) -> String {
    format!(
        "exec 2>&1\ntimeout -s KILL {} sh -c {}",
        timeout.as_secs_f64(),
        utils::shell_quote(&with_cwd(cwd, command))
    )
}

/// 被远程超时终止的命令映射为合成的超时退出码
fn timeout_exit_code(exit_code: i32, elapsed: Duration, timeout: Duration) -> i32 {
    if exit_code == REMOTE_KILLED_EXIT_CODE && elapsed >= timeout {
        TIMEOUT_EXIT_CODE
    } else {
        exit_code
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
}

/// 写入尚未写完的部分，写端暂时不可写时立即返回，返回是否写入了数据
fn write_pending<W: Write>(
    writer: &mut W,
    input: &[u8],
    written: &mut usize,
) -> std::io::Result<bool> {
    if *written >= input.len() {
        return Ok(false);
    }
    match writer.write(&input[*written..]) {
        Ok(n) => {
            *written += n;
            Ok(n > 0)
        }
        Err(e) if would_block(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// 写入标准输入并读取通道输出（带超时），返回输出以及是否超时
///
/// 调用前会话须处于非阻塞模式。写入与读取交替进行，远程进程先产生大量输出时不会互相阻塞。
fn transfer_with_timeout(
    channel: &mut Channel,
    input: &[u8],
    timeout: Duration,
) -> Result<(String, bool)> {
    let start_time = Instant::now();

    let mut output = Vec::new();
    let mut stderr = Vec::new();
    let mut buffer = [0; 4096];
    let mut written = 0;
    let mut eof_sent = false;
    let mut timed_out = false;

    // 循环直到通道关闭或超时
    while !channel.eof() {
        if start_time.elapsed() > timeout {
            timed_out = true;
            break;
        }

        let mut progressed = false;

        // 写入标准输入，写完后发送EOF
        if written < input.len() {
            progressed = write_pending(channel, input, &mut written)
                .with_context(|| "无法写入标准输入")?;
        } else if !eof_sent {
            match channel.send_eof() {
                Ok(()) => eof_sent = true,
                Err(e) => {
                    let e = std::io::Error::from(e);
                    if !would_block(&e) {
                        return Err(anyhow::Error::from(e).context("无法关闭标准输入"));
                    }
                }
            }
        }

        // 读取标准输出
        match channel.read(&mut buffer) {
            Ok(n) if n > 0 => {
                output.extend_from_slice(&buffer[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(anyhow::Error::from(e).context("读取标准输出失败")),
        }

        // 读取标准错误
        match channel.stderr().read(&mut buffer) {
            Ok(n) if n > 0 => {
                stderr.extend_from_slice(&buffer[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(anyhow::Error::from(e).context("读取标准错误失败")),
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    output.extend_from_slice(&stderr);
    Ok((String::from_utf8_lossy(&output).into_owned(), timed_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_runs_under_timeout() {
        assert_eq!(
            remote_command(None, "docker ps -a", Duration::from_secs(300)),
            "exec 2>&1\ntimeout -s KILL 300 sh -c 'docker ps -a'"
        );
        assert_eq!(
            remote_command(Some("/opt/oai"), "ls", Duration::from_millis(1500)),
            "exec 2>&1\ntimeout -s KILL 1.5 sh -c 'cd /opt/oai && ls'"
        );
    }

    /// 每隔一次调用才接受少量数据的写端
    struct SlowWriter {
        accepted: Vec<u8>,
        ready: bool,
    }

    impl Write for SlowWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.ready = !self.ready;
            if !self.ready {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_pending_does_not_block() {
        let input = b"echo hello\n";
        let mut writer = SlowWriter {
            accepted: Vec::new(),
            ready: false,
        };
        let mut written = 0;
        let mut calls = 0;
        while written < input.len() {
            write_pending(&mut writer, input, &mut written).unwrap();
            calls += 1;
            assert!(calls < 100);
        }
        assert_eq!(writer.accepted, input);
        assert!(!write_pending(&mut writer, input, &mut written).unwrap());
    }

    #[test]
    fn test_write_pending_reports_errors() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut written = 0;
        assert!(write_pending(&mut Broken, b"x", &mut written).is_err());
        assert_eq!(written, 0);
    }

    #[test]
    fn test_remote_kill_maps_to_timeout_code() {
        let timeout = Duration::from_secs(10);
        assert_eq!(
            timeout_exit_code(137, Duration::from_secs(10), timeout),
            TIMEOUT_EXIT_CODE
        );
        // 期限之前被 SIGKILL 终止（例如OOM）保留原退出码
        assert_eq!(timeout_exit_code(137, Duration::from_secs(2), timeout), 137);
        assert_eq!(timeout_exit_code(0, Duration::from_secs(20), timeout), 0);
    }
}
