//! Unit tests for mounted-config polling and reload helpers

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pgbouncer_operator::resources::exec::{ExecError, is_reload_success, reload_command};
use pgbouncer_operator::resources::live_sync::{LiveSyncReport, wait_for_config};
use tokio::time::Instant;

const INTERVAL: Duration = Duration::from_secs(5);

mod wait_for_config_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_matches_immediately() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let matched = wait_for_config("ini", INTERVAL, deadline, || async {
            Ok::<_, ExecError>("ini".to_string())
        })
        .await;
        assert!(matched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matches_after_propagation_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = Instant::now() + Duration::from_secs(60);
        let start = Instant::now();

        let counter = calls.clone();
        let matched = wait_for_config("new", INTERVAL, deadline, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Ok("old".to_string())
                } else {
                    Ok("new".to_string())
                }
            }
        })
        .await;

        assert!(matched);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = Instant::now() + Duration::from_secs(60);

        let counter = calls.clone();
        let matched = wait_for_config("new", INTERVAL, deadline, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ExecError::ExecFailed {
                        pod: "pool-0".to_string(),
                        message: "container restarting".to_string(),
                    })
                } else {
                    Ok("new".to_string())
                }
            }
        })
        .await;

        assert!(matched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_deadline() {
        let timeout = Duration::from_secs(12);
        let start = Instant::now();
        let deadline = start + timeout;

        let matched = wait_for_config("new", INTERVAL, deadline, || async {
            Ok::<_, ExecError>("old".to_string())
        })
        .await;

        assert!(!matched);
        assert_eq!(start.elapsed(), timeout);
    }
}

mod reload_tests {
    use super::*;

    #[test]
    fn test_reload_command_targets_admin_console() {
        let command = reload_command(6432, "secret");
        assert!(command.contains(&"PGPASSWORD=secret".to_string()));
        assert!(command.contains(&"--port=6432".to_string()));
        assert!(command.contains(&"--username=pgbouncer".to_string()));
        assert_eq!(command.last().map(String::as_str), Some("--command=RELOAD"));
    }

    #[test]
    fn test_reload_output() {
        assert!(is_reload_success("RELOAD\n"));
        assert!(!is_reload_success("ERROR: not allowed"));
    }

    #[test]
    fn test_report_completeness() {
        let mut report = LiveSyncReport {
            reloaded: vec!["pool-0".to_string()],
            ..Default::default()
        };
        assert!(report.is_complete());
        report.timed_out.push("pool-1".to_string());
        assert!(!report.is_complete());
    }
}
