use std::fs;
use std::path::{Path, PathBuf};

use ranci::config::connection_config::ConnectionConfig;
use ranci::connection::ConnectionFactory;
use ranci::core_network::{CoreNetwork, CoreNetworkError, CoreNetworkState};
use tempfile::{TempDir, tempdir};

use super::{fixture_registry, fixture_scripts_dir};

struct Fixture {
    dir: TempDir,
    registry: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let registry = fixture_registry(dir.path());
        Self { dir, registry }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn load(&self, name: &str, node: Option<&str>) -> Result<CoreNetwork, CoreNetworkError> {
        let factory = ConnectionFactory::new(ConnectionConfig::default(), fixture_scripts_dir());
        let scratch = self.path().join("scratch");
        CoreNetwork::with_factory(name, node, None, &self.registry, factory)
            .map(|core| core.with_scratch_dir(scratch.to_str().unwrap()))
    }

    fn core(&self, name: &str) -> CoreNetwork {
        self.load(name, None).unwrap()
    }
}

#[test_log::test]
fn test_deploy_ip_undeploy() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test");
    assert_eq!(core.get_name(), "test");
    assert_eq!(core.get_host(), "localhost");
    assert_eq!(core.to_string(), "test@localhost");
    assert!(core.run_iperf3_server());
    assert_eq!(core.get_cmd_prefix(), "");

    let (success, output) = core.deploy().unwrap();
    assert!(success);
    assert_eq!(output, "deploy");
    assert_eq!(core.state(), CoreNetworkState::Deployed);

    assert_eq!(core.get_ip().unwrap().as_deref(), Some("127.0.0.1"));

    let log_dir = fixture.path().join("collected");
    let (log_files, output) = core.undeploy(Some(&log_dir)).unwrap();
    assert_eq!(output, "undeploy");
    assert_eq!(log_files, vec![log_dir.join("logs")]);
    assert_eq!(fs::read_to_string(log_dir.join("logs")).unwrap(), "logs\n");
    assert_eq!(core.state(), CoreNetworkState::Undeployed);

    // 暂存目录在收集结束后被清除
    assert!(!fixture.path().join("scratch").exists());
}

#[test]
fn test_deploy_undeploys_first() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test");
    let count = fixture.path().join("undeploy.count");

    core.deploy().unwrap();
    assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 1);

    core.undeploy(None).unwrap();
    assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 2);

    // 重复卸载不会出错
    let (log_files, output) = core.undeploy(None).unwrap();
    assert!(log_files.is_empty());
    assert_eq!(output, "undeploy");
    assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 3);
}

#[test]
fn test_command_lists() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_list");
    assert_eq!(core.get_host(), "none");
    assert!(!core.run_iperf3_server());
    assert_eq!(core.get_cmd_prefix(), "docker exec -it oai-ext-dn");

    let (success, output) = core.deploy().unwrap();
    assert!(success);
    assert_eq!(output, "deploy\ndeploy again");
    assert_eq!(core.get_ip().unwrap().as_deref(), Some("127.0.0.1"));

    let log_dir = fixture.path().join("collected");
    let (log_files, _) = core.undeploy(Some(&log_dir)).unwrap();
    assert_eq!(
        log_files,
        vec![log_dir.join("first.log"), log_dir.join("second.log")]
    );
    assert_eq!(fs::read_to_string(log_dir.join("second.log")).unwrap(), "second\n");
}

#[test]
fn test_logs_in_subdirectories_are_not_collected() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_log_subdirs");

    let log_dir = fixture.path().join("collected");
    let (log_files, output) = core.undeploy(Some(&log_dir)).unwrap();
    assert_eq!(output, "undeploy");
    assert_eq!(log_files, vec![log_dir.join("core.log")]);
    assert_eq!(fs::read_to_string(log_dir.join("core.log")).unwrap(), "core\n");
    assert!(!log_dir.join("stdout.log").exists());
}

#[test_log::test]
fn test_deploy_stops_at_first_failure() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_fail");

    let (success, output) = core.deploy().unwrap();
    assert!(!success);
    assert_eq!(output, "deploy");
    assert!(!fixture.path().join("should-not-exist").exists());
    assert_eq!(core.state(), CoreNetworkState::Undeployed);

    let (_, output) = core.undeploy(None).unwrap();
    assert_eq!(output, "undeploy");
}

#[test]
fn test_deploy_fails_without_ip() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_no_ip");
    assert_eq!(core.get_ip().unwrap(), None);

    let (success, output) = core.deploy().unwrap();
    assert!(!success);
    assert_eq!(output, "deploy");
    assert_eq!(core.state(), CoreNetworkState::Undeployed);
}

#[test]
fn test_script_commands() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_script");
    let (success, output) = core.deploy().unwrap();
    assert!(success);
    assert_eq!(output, "deployment from script");
}

#[test]
fn test_failing_script_stops_deployment() {
    let fixture = Fixture::new();
    let mut core = fixture.core("test_script_fail");
    let (success, output) = core.deploy().unwrap();
    assert!(!success);
    assert_eq!(output, "deployment from script\nfailing");
}

#[test]
fn test_current_host_placeholder() {
    let fixture = Fixture::new();
    let err = fixture.load("test_current_host", None).unwrap_err();
    assert!(matches!(err, CoreNetworkError::MissingNode { .. }));

    let mut core = fixture.load("test_current_host", Some("localhost")).unwrap();
    assert_eq!(core.get_host(), "localhost");
    let (success, _) = core.deploy().unwrap();
    assert!(success);
}

#[test]
fn test_log_collect_without_placeholder() {
    let fixture = Fixture::new();
    let err = fixture.load("test_bad_log_collect", None).unwrap_err();
    assert!(matches!(err, CoreNetworkError::MissingLogDirPlaceholder { .. }));
    assert!(err.to_string().contains("%%log_dir%%"));
}

#[test]
fn test_unknown_core_network() {
    let fixture = Fixture::new();
    let err = fixture.load("magma", None).unwrap_err();
    assert!(matches!(err, CoreNetworkError::UnknownCoreNetwork { .. }));
    assert!(err.to_string().contains("magma"));
}

#[test]
fn test_directory_is_unsupported() {
    let fixture = Fixture::new();
    let err = CoreNetwork::new("test", None, Some(fixture.path()), &fixture.registry).unwrap_err();
    assert!(matches!(err, CoreNetworkError::DirectoryUnsupported));
}

#[test]
fn test_missing_registry() {
    let fixture = Fixture::new();
    let err = CoreNetwork::new("test", None, None, &fixture.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, CoreNetworkError::Registry { .. }));
}
