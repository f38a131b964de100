use std::fs;
use std::time::Duration;

use ranci::config::connection_config::ConnectionConfig;
use ranci::connection::{ConnectionFactory, RunOptions, TIMEOUT_EXIT_CODE, Target};
use tempfile::tempdir;

use super::fixture_scripts_dir;

fn factory() -> ConnectionFactory {
    ConnectionFactory::new(ConnectionConfig::default(), fixture_scripts_dir())
}

#[test_log::test]
fn test_same_commands_on_every_local_alias() {
    let factory = factory();
    for host in [None, Some(""), Some("none"), Some("localhost")] {
        let mut connection = factory.get_connection(host).unwrap();
        assert_eq!(connection.target(), Target::Local);

        let result = connection.run("echo hello");
        assert_eq!(result.return_code, 0);
        assert_eq!(result.standard_output, "hello");
        assert_eq!(result.arguments, "echo hello");

        assert_eq!(connection.run("exit 7").return_code, 7);
        connection.close().unwrap();
    }
}

#[test]
fn test_timeout_does_not_raise() {
    let mut connection = factory().get_connection(None).unwrap();
    let options = RunOptions::default().with_timeout(Duration::from_millis(300));
    let result = connection.run_with("echo started; sleep 10", &options);
    assert_eq!(result.return_code, TIMEOUT_EXIT_CODE);
    assert!(!result.success());

    // 超时后连接仍可用
    assert_eq!(connection.run("echo still here").standard_output, "still here");
    connection.close().unwrap();
}

#[test]
fn test_copy_round_trip() {
    let dir = tempdir().unwrap();
    let original = dir.path().join("original.txt");
    fs::write(&original, "core network logs\n").unwrap();
    let remote = dir.path().join("remote").join("copy.txt");
    let back = dir.path().join("back.txt");

    let mut connection = factory().get_connection(Some("none")).unwrap();
    connection
        .copyout(&original, remote.to_str().unwrap())
        .unwrap();
    connection.copyin(remote.to_str().unwrap(), &back).unwrap();
    connection.close().unwrap();

    assert_eq!(fs::read_to_string(back).unwrap(), "core network logs\n");
}

#[test]
fn test_copy_relative_to_cwd() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("in-cwd.txt"), "relative").unwrap();
    let target = dir.path().join("fetched.txt");

    let mut connection = factory().get_connection(None).unwrap();
    connection.cd(dir.path().to_str().unwrap());
    connection.copyin("in-cwd.txt", &target).unwrap();
    assert_eq!(fs::read_to_string(target).unwrap(), "relative");
}

#[test_log::test]
fn test_run_script_through_factory() {
    let factory = factory();
    let result = factory
        .run_script(Some("localhost"), "deploy.sh", Duration::from_secs(30), "oaicicd-ran 2222", false)
        .unwrap();
    assert!(result.success());
    assert_eq!(result.standard_output, "deployment oaicicd-ran 2222");

    let result = factory
        .run_script(None, "fail.sh", Duration::from_secs(30), "", true)
        .unwrap();
    assert_eq!(result.return_code, 1);
    assert_eq!(result.standard_output, "failing");
}

#[test]
fn test_run_unknown_script() {
    let result = factory().run_script(None, "missing.sh", Duration::from_secs(5), "", false);
    assert!(result.is_err());
}

#[test]
fn test_unreachable_host_is_an_error() {
    let config = ConnectionConfig {
        max_retries: 1,
        timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let factory = ConnectionFactory::new(config, fixture_scripts_dir());
    // 端口 1 上没有SSH服务
    assert!(factory.get_connection(Some("127.0.0.1:1")).is_err());
}
