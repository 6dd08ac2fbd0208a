use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn convlab() -> Command {
    let mut cmd = Command::cargo_bin("convlab").unwrap();
    for key in [
        "CONVLAB_ALGO",
        "CONVLAB_PREFER_ACCELERATOR",
        "CONVLAB_LR",
        "CONVLAB_BATCH_SIZE",
        "CONVLAB_ITERATIONS",
        "CONVLAB_WEIGHT_SEED",
        "CONVLAB_DEVICE_INDEX",
        "RUST_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn help_works() {
    convlab().arg("--help").assert().success();
}

#[test]
fn version_works() {
    convlab().arg("--version").assert().success();
}

#[test]
fn help_mentions_core_subcommands() {
    let out = convlab().arg("--help").assert().success().get_output().stdout.clone();
    let s = String::from_utf8(out).unwrap();
    for needle in ["grad-check", "info", "--config", "--log-format"] {
        assert!(s.contains(needle), "help missing `{needle}`");
    }
}

#[test]
fn invalid_command_fails() {
    convlab().arg("nonexistent-command").assert().failure();
}

#[test]
fn info_lists_every_operation() {
    convlab()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("SIMD:"))
        .stdout(predicate::str::contains("op=forward"))
        .stdout(predicate::str::contains("op=backward"))
        .stdout(predicate::str::contains("op=update"));
}

#[test]
fn small_grad_check_reports_errors() {
    convlab()
        .args(["grad-check", "-b", "2", "-e", "2", "-a", "cpu_base"])
        .args(["--ic", "2", "--height", "6", "--width", "7", "--kernel", "3", "--oc", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("==== 0 ===="))
        .stdout(predicate::str::contains("==== 1 ===="))
        .stdout(predicate::str::contains("max relative error = "))
        .stdout(predicate::str::contains("avg relative error = "));
}

#[test]
fn debug_logging_reports_operation_timings() {
    convlab()
        .args(["--log-level", "debug", "grad-check", "-b", "2", "-e", "2", "-a", "cpu_base"])
        .args(["--ic", "1", "--height", "5", "--width", "5", "--kernel", "3", "--oc", "2"])
        .assert()
        .success()
        .stderr(predicate::str::contains("layer operation timings"))
        .stderr(predicate::str::contains("calls=6"))
        .stdout(predicate::str::contains("calls=").not());
}

#[test]
fn unknown_algo_is_rejected_by_the_parser() {
    convlab().args(["grad-check", "-a", "gpu_fast"]).assert().failure();
}

#[test]
fn invalid_layer_extents_exit_with_config_code() {
    convlab()
        .args(["grad-check", "--height", "2", "--width", "2", "--kernel", "3"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("kernel_size"));
}

#[test]
fn bad_environment_override_exits_with_config_code() {
    convlab().arg("info").env("CONVLAB_BATCH_SIZE", "many").assert().code(2);
}

#[test]
fn config_file_is_read() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "algo = \"cpu_simd\"\nbatch_size = 4").unwrap();
    convlab()
        .arg("--config")
        .arg(file.path())
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("requested=cpu_simd"));
}

#[test]
fn missing_config_file_exits_with_config_code() {
    convlab().args(["--config", "/nonexistent/convlab.toml", "info"]).assert().code(2);
}

#[cfg(not(feature = "cuda"))]
#[test]
fn accelerator_without_support_exits_with_config_code() {
    convlab()
        .args(["grad-check", "-a", "cuda_base", "-b", "1", "--oc", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Caused by"));
}
