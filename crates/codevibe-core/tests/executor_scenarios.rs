//! End-to-end executor scenarios with the real process runner.

use std::sync::Arc;

use codevibe_core::{
    EngineConfig, ExecutionStatus, Executor, LimitOverrides, ProcessRunner, RuleTable,
    SourceProgram,
};

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

fn executor() -> (Executor, Arc<ProcessRunner>) {
    let config = EngineConfig::default();
    let runner = Arc::new(ProcessRunner::new(config.runner.clone()));
    let rules = Arc::new(RuleTable::builtin().unwrap());
    let executor = Executor::with_runner(&config, rules, runner.clone()).unwrap();
    (executor, runner)
}

fn overrides(timeout_ms: u64) -> LimitOverrides {
    LimitOverrides {
        timeout_ms: Some(timeout_ms),
        ..LimitOverrides::default()
    }
}

#[tokio::test]
async fn test_simple_program_runs() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let request = executor.request(SourceProgram::python("print(1+1)"), &overrides(10_000));
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.stdout, "2\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.violations.is_empty());
    assert!(result.errors.is_empty());
    assert!(!result.truncated);
}

#[tokio::test]
async fn test_denylisted_call_never_spawns() {
    let (executor, runner) = executor();
    let request = executor.request(
        SourceProgram::python("import os; os.system('ls')"),
        &LimitOverrides::default(),
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Violation);
    assert_eq!(result.exit_code, None);
    let rules: Vec<&str> = result.violations.iter().map(|v| v.rule.as_str()).collect();
    assert!(rules.contains(&"call.os.system"), "{rules:?}");
    let call = result
        .violations
        .iter()
        .find(|v| v.rule == "call.os.system")
        .unwrap();
    assert_eq!((call.line, call.column), (1, 12));
    assert_eq!(runner.spawn_count(), 0);
}

#[tokio::test]
async fn test_syntax_error_never_spawns() {
    let (executor, runner) = executor();
    let request = executor.request(
        SourceProgram::python("print 'hello'"),
        &LimitOverrides::default(),
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Violation);
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].rule, "syntax-error");
    assert_eq!(result.errors[0].kind, "SyntaxError");
    assert_eq!(runner.spawn_count(), 0);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let request = executor.request(
        SourceProgram::python("while True:\n    pass\n"),
        &overrides(2_000),
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.exit_code, None);
    assert!(result.duration_ms >= 2_000);
    assert!(result.duration_ms < 8_000, "took {} ms", result.duration_ms);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, "Timeout");
}

#[tokio::test]
async fn test_uncaught_exception_is_crash() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let request = executor.request(
        SourceProgram::python("raise ValueError('x')"),
        &overrides(10_000),
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Crashed);
    assert_eq!(result.exit_code, Some(1));
    let entry = &result.errors[0];
    assert_eq!(entry.kind, "ValueError");
    assert_eq!(entry.message, "x");
    assert_eq!(entry.line, Some(1));
    assert!(result.stderr.contains("ValueError: x"));
}

#[tokio::test]
async fn test_large_output_is_truncated() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let request = executor.request(
        SourceProgram::python("print('x' * 10_000_000)"),
        &LimitOverrides {
            timeout_ms: Some(20_000),
            max_output_bytes: Some(1024 * 1024),
            ..LimitOverrides::default()
        },
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Ok);
    assert!(result.truncated);
    assert_eq!(result.stdout.len(), 1024 * 1024);
}

#[tokio::test]
async fn test_truncated_multibyte_output_stays_within_cap() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let request = executor.request(
        SourceProgram::python("print('\u{e9}' * 100000)"),
        &LimitOverrides {
            timeout_ms: Some(20_000),
            max_output_bytes: Some(1001),
            ..LimitOverrides::default()
        },
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Ok);
    assert!(result.truncated);
    assert!(result.stdout.len() <= 1001, "got {} bytes", result.stdout.len());
    assert!(!result.stdout.contains('\u{fffd}'));
    assert_eq!(result.stdout.chars().count(), 500);
}

#[tokio::test]
async fn test_deterministic_program_is_repeatable() {
    if !python_available() {
        return;
    }
    let (executor, _) = executor();
    let source = "total = sum(i * i for i in range(1000))\nprint(total)\n";
    let first = executor
        .execute(&executor.request(SourceProgram::python(source), &overrides(10_000)))
        .await;
    let second = executor
        .execute(&executor.request(SourceProgram::python(source), &overrides(10_000)))
        .await;

    assert_eq!(first.status, ExecutionStatus::Ok);
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.exit_code, second.exit_code);
}

#[tokio::test]
async fn test_concurrent_executions_all_complete() {
    if !python_available() {
        return;
    }
    let (executor, runner) = executor();
    let executor = Arc::new(executor);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let request = executor.request(
                    SourceProgram::python(format!("print({i})")),
                    &overrides(10_000),
                );
                (i, executor.execute(&request).await)
            })
        })
        .collect();

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.stdout, format!("{i}\n"));
    }
    assert_eq!(runner.spawn_count(), 8);
    assert_eq!(executor.available_slots(), executor.capacity());
}
