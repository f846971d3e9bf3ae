//! Waiting for every process of a terminated session to go away.
//!
//! Most of the time a killed session is empty right away. Programs such as
//! serial terminal clients can take a moment to exit, so the check backs off
//! exponentially and gives up after roughly 1.27 seconds.

use std::time::Duration;

use log::debug;
use nix::unistd::Pid;

use crate::error::ChannelError;

/// Number of times the session is checked before giving up.
pub const REAP_ATTEMPTS: u32 = 7;

/// Sleep after a failed check: 10ms, 20ms, 40ms, ... 640ms.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(10 << attempt)
}

/// Wait until no process belongs to session `sid`.
pub async fn wait_for_session_exit(sid: Pid) -> Result<(), ChannelError> {
    for attempt in 0..REAP_ATTEMPTS {
        if !session_has_processes(sid).await {
            debug!("session {} is empty after {} check(s)", sid, attempt + 1);
            return Ok(());
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
    }

    Err(ChannelError::ProcessTeardown {
        sid: sid.as_raw(),
        attempts: REAP_ATTEMPTS,
    })
}

/// Whether any live (non-zombie) process is a member of session `sid`.
#[cfg(target_os = "linux")]
pub async fn session_has_processes(sid: Pid) -> bool {
    let sid = sid.as_raw();
    tokio::task::spawn_blocking(move || scan_proc(sid))
        .await
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn scan_proc(sid: i32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .any(|(state, session)| state != 'Z' && session == sid)
}

/// Whether any process is a member of session `sid`.
#[cfg(not(target_os = "linux"))]
pub async fn session_has_processes(sid: Pid) -> bool {
    tokio::process::Command::new("ps")
        .arg("-s")
        .arg(sid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Extract the state and session id from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // ppid, pgrp, session
    let session = fields.nth(2)?.parse().ok()?;
    Some((state, session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let total: Duration = (0..REAP_ATTEMPTS).map(backoff_delay).sum();
        assert_eq!(backoff_delay(0), Duration::from_millis(10));
        assert_eq!(backoff_delay(6), Duration::from_millis(640));
        assert_eq!(total, Duration::from_millis(1270));
    }

    #[test]
    fn test_parse_stat() {
        let stat = "4242 (my (odd) prog) S 1 4242 4242 34816 4242 4194560 0";
        assert_eq!(parse_stat(stat), Some(('S', 4242)));

        let zombie = "99 (sleep) Z 4242 4242 4200 0 -1";
        assert_eq!(parse_stat(zombie), Some(('Z', 4200)));

        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_vacant_session_is_empty() {
        assert!(!session_has_processes(Pid::from_raw(i32::MAX)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_own_session_is_not_empty() {
        let sid = nix::unistd::getsid(None).unwrap();
        assert!(session_has_processes(sid).await);
    }
}
