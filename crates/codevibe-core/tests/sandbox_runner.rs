//! Process sandbox tests against a real `python3`.
//!
//! Each test returns early (with a note on stderr) when no interpreter is
//! installed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use codevibe_core::config::{LimitPolicy, RunnerConfig};
use codevibe_core::program::{LimitOverrides, ResourceLimits, SourceProgram};
use codevibe_core::sandbox::{
    process_group_alive, ProcessRunner, RawExecutionOutcome, SandboxRunner, Termination,
};
use tokio_util::sync::CancellationToken;

fn python_available() -> bool {
    let found = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !found {
        eprintln!("python3 not found; skipping");
    }
    found
}

fn runner() -> ProcessRunner {
    ProcessRunner::new(RunnerConfig::default())
}

fn limits(timeout_ms: u64) -> ResourceLimits {
    LimitPolicy::default().resolve(&LimitOverrides {
        timeout_ms: Some(timeout_ms),
        ..LimitOverrides::default()
    })
}

async fn run(
    runner: &ProcessRunner,
    source: &str,
    limits: &ResourceLimits,
) -> RawExecutionOutcome {
    runner
        .run(&SourceProgram::python(source), limits, CancellationToken::new())
        .await
        .unwrap()
}

// -------------------------------------------------------------------------
// Normal runs
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_hello_world() {
    if !python_available() {
        return;
    }
    let runner = runner();
    let outcome = run(&runner, "print('hello')\n", &limits(10_000)).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 0 });
    assert_eq!(outcome.stdout.text(), "hello\n");
    assert!(outcome.stderr.bytes.is_empty());
    assert!(!outcome.truncated());
    assert_eq!(runner.spawn_count(), 1);
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    if !python_available() {
        return;
    }
    let outcome = run(&runner(), "raise SystemExit(3)\n", &limits(10_000)).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 3 });
}

#[tokio::test]
async fn test_uncaught_exception_writes_traceback() {
    if !python_available() {
        return;
    }
    let outcome = run(&runner(), "raise ValueError('x')\n", &limits(10_000)).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 1 });
    let stderr = outcome.stderr.text();
    assert!(stderr.contains("Traceback"), "{stderr}");
    assert!(stderr.contains("ValueError: x"), "{stderr}");
}

#[tokio::test]
async fn test_signal_death_is_reported() {
    if !python_available() {
        return;
    }
    let outcome = run(
        &runner(),
        "import os\nos.kill(os.getpid(), 9)\n",
        &limits(10_000),
    )
    .await;
    assert_eq!(outcome.termination, Termination::Signaled { signal: 9 });
}

#[tokio::test]
async fn test_stdin_is_closed() {
    if !python_available() {
        return;
    }
    let outcome = run(&runner(), "input()\n", &limits(10_000)).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 1 });
    assert!(outcome.stderr.text().contains("EOFError"));
}

#[tokio::test]
async fn test_environment_is_scrubbed() {
    if !python_available() {
        return;
    }
    let source = "import os\nprint('\\n'.join(sorted(os.environ)))\nprint(os.environ['HOME'] == os.getcwd())\n";
    let outcome = run(&runner(), source, &limits(10_000)).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 0 });

    let text = outcome.stdout.text();
    let mut lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.pop(), Some("True"));
    let allowed: BTreeSet<&str> = [
        "PATH",
        "HOME",
        "TMPDIR",
        "LANG",
        "LC_CTYPE",
        "PYTHONIOENCODING",
        "PYTHONDONTWRITEBYTECODE",
    ]
    .into_iter()
    .collect();
    for name in lines {
        assert!(allowed.contains(name), "unexpected variable {name}");
    }
}

// -------------------------------------------------------------------------
// Limits
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_infinite_loop_times_out_and_group_is_gone() {
    if !python_available() {
        return;
    }
    let started = Instant::now();
    let outcome = run(&runner(), "while True:\n    pass\n", &limits(1_000)).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.termination, Termination::TimedOut);
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_secs(6), "took {elapsed:?}");
    let pid = outcome.pid.unwrap();
    assert!(!process_group_alive(i32::try_from(pid).unwrap()));
}

#[tokio::test]
async fn test_output_over_cap_is_truncated() {
    if !python_available() {
        return;
    }
    let limits = LimitPolicy::default().resolve(&LimitOverrides {
        timeout_ms: Some(20_000),
        max_output_bytes: Some(1024 * 1024),
        ..LimitOverrides::default()
    });
    let outcome = run(&runner(), "print('x' * 10_000_000)\n", &limits).await;
    assert_eq!(outcome.termination, Termination::Exited { code: 0 });
    assert!(outcome.stdout.truncated);
    assert_eq!(outcome.stdout.bytes.len(), 1024 * 1024);
    assert_eq!(outcome.stdout.total_bytes, 10_000_001);
}

#[tokio::test]
async fn test_cancellation_kills_running_program() {
    if !python_available() {
        return;
    }
    let runner = runner();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = runner
        .run(
            &SourceProgram::python("while True:\n    pass\n"),
            &limits(30_000),
            cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
    let pid = outcome.pid.unwrap();
    assert!(!process_group_alive(i32::try_from(pid).unwrap()));
}

// -------------------------------------------------------------------------
// Isolation and cleanup
// -------------------------------------------------------------------------

/// True while `pid` exists and is not a zombie awaiting its reaper.
fn running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_leftover_group_members_are_killed_after_exit() {
    if !python_available() || !std::path::Path::new("/proc/self/stat").exists() {
        return;
    }
    // The leader exits at once; a forked member would otherwise sleep on.
    let source = "import os, sys, time\nif os.fork() == 0:\n    print(os.getpid(), flush=True)\n    time.sleep(60)\n    sys.exit(0)\ntime.sleep(0.5)\n";
    let outcome = run(&runner(), source, &limits(30_000)).await;

    assert_eq!(outcome.termination, Termination::Exited { code: 0 });
    let member: u32 = outcome.stdout.text().trim().parse().unwrap();
    let mut killed = false;
    for _ in 0..20 {
        if !running(member) {
            killed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(killed, "group member {member} survived the run");
}

#[tokio::test]
async fn test_concurrent_runs_do_not_see_each_other() {
    if !python_available() {
        return;
    }
    let runner = Arc::new(runner());
    let source = "\
import os, time
with open('marker.txt', 'w') as f:
    f.write('x')
time.sleep(0.3)
print(os.getcwd())
print(','.join(sorted(os.listdir('.'))))
";
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { run(&runner, source, &limits(10_000)).await })
        })
        .collect();

    let mut dirs = BTreeSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.termination, Termination::Exited { code: 0 });
        let text = outcome.stdout.text();
        let mut lines = text.lines();
        let dir = lines.next().unwrap().to_string();
        assert_eq!(lines.next(), Some("main.py,marker.txt"));
        assert!(
            !std::path::Path::new(&dir).exists(),
            "sandbox dir {dir} left behind"
        );
        dirs.insert(dir);
    }
    assert_eq!(dirs.len(), 3);
}

#[tokio::test]
async fn test_workspace_root_is_left_empty() {
    if !python_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let runner = ProcessRunner::new(RunnerConfig {
        workspace_root: Some(root.path().to_path_buf()),
        ..RunnerConfig::default()
    });
    run(&runner, "print(1)\n", &limits(10_000)).await;
    run(&runner, "while True:\n    pass\n", &limits(300)).await;
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    assert_eq!(runner.spawn_count(), 2);
}
