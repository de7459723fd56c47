//! Configuration loading and end-to-end command tests.

use clap::Parser;
use qubesctl_cli::commands;
use qubesctl_cli::config::{Config, HypervisorBackend};
use qubesctl_cli::{Args, Command};
use qubesctl_common::LogFormat;

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.hypervisor.backend, HypervisorBackend::Local);
    assert_eq!(config.logging.format().unwrap(), LogFormat::Pretty);
}

#[test]
fn test_load_partial_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qubesctl.yaml");
    std::fs::write(
        &path,
        "registry:\n  path: /tmp/reg.json\nhypervisor:\n  backend: mock\nlogging:\n  format: json\n",
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.registry.path, "/tmp/reg.json");
    assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
    assert_eq!(config.logging.format().unwrap(), LogFormat::Json);
    assert_eq!(config.logging.level, "info");
    assert!(config.registry.lock_timeout_ms > 0);
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(dir.path().join("absent.yaml")).is_err());
}

#[test]
fn test_load_if_present() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qubesctl.yaml");
    assert!(Config::load_if_present(&path).unwrap().is_none());

    std::fs::write(&path, "registry: [not, a, mapping]\n").unwrap();
    assert!(Config::load_if_present(&path).is_err());

    std::fs::write(&path, "logging:\n  level: warn\n").unwrap();
    let config = Config::load_if_present(&path).unwrap().unwrap();
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_validate_rejects_bad_settings() {
    let mut config = Config::default();
    config.registry.lock_timeout_ms = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.registry.path = "  ".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.logging.format_name = "xml".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.hypervisor.storage_path = String::new();
    assert!(config.validate().is_err());
    config.hypervisor.backend = HypervisorBackend::Mock;
    assert!(config.validate().is_ok());
}

#[test]
fn test_cli_overrides() {
    let args = Args::try_parse_from([
        "qubesctl",
        "--registry",
        "/srv/reg.json",
        "--log-level",
        "debug",
        "--dev",
        "dump",
    ])
    .unwrap();
    let config = Config::default_with_cli(&args);
    assert_eq!(config.registry.path, "/srv/reg.json");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
    assert!(matches!(args.command, Command::Dump));
}

#[test]
fn test_set_default_flags() {
    let args =
        Args::try_parse_from(["qubesctl", "set-default", "--netvm", "none", "--kernel", "4.4"])
            .unwrap();
    match args.command {
        Command::SetDefault {
            template,
            netvm,
            kernel,
        } => {
            assert_eq!(template, None);
            assert_eq!(netvm.as_deref(), Some("none"));
            assert_eq!(kernel.as_deref(), Some("4.4"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

fn run(command: Command, config: &Config) -> anyhow::Result<String> {
    let mut out = Vec::new();
    commands::run(&command, config, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

#[test]
fn test_apply_dump_remove_with_local_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.registry.path = dir.path().join("qubes.json").display().to_string();
    config.hypervisor.storage_path = dir.path().join("vms").display().to_string();
    config.hypervisor.default_private_size_mib = 1;

    let requests = dir.path().join("qubes.yaml");
    std::fs::write(
        &requests,
        "qubes_vms:\n  - name: tpl\n    kind: template\n    label: black\n  - name: sys-net\n    kind: netvm\n    label: red\n    template: tpl\n    memory: 200\n",
    )
    .unwrap();

    let report = run(Command::Apply { file: requests.clone() }, &config).unwrap();
    assert_eq!(report, "tpl: changed\nsys-net: changed\n");

    // Second run converges without changes.
    let report = run(Command::Apply { file: requests }, &config).unwrap();
    assert_eq!(report, "tpl: ok\nsys-net: ok\n");

    let dump = run(Command::Dump, &config).unwrap();
    assert!(dump.starts_with("qubes_vms:"));
    assert!(dump.contains("name: sys-net"));
    assert!(!dump.contains("name: tpl"));

    let report = run(
        Command::Remove {
            name: "sys-net".into(),
        },
        &config,
    )
    .unwrap();
    assert_eq!(report, "sys-net: changed\n");
    assert!(!dir.path().join("vms/default/sys-net").exists());
}

#[test]
fn test_apply_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.registry.path = dir.path().join("qubes.json").display().to_string();
    config.hypervisor.backend = HypervisorBackend::Mock;

    let requests = dir.path().join("bad.yaml");
    std::fs::write(&requests, "name: work\nkind: appvm\n").unwrap();

    let mut out = Vec::new();
    let result = commands::run(&Command::Apply { file: requests }, &config, &mut out);
    assert!(result.is_err());
    assert_eq!(String::from_utf8(out).unwrap(), "work: failed\n");
}
