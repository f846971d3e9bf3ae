//! Channels over real children on pseudo-terminals.

use std::time::{Duration, Instant};

use labrig::channel::reap::{REAP_ATTEMPTS, session_has_processes};
use labrig::channel::{ChannelIo, Prompt, PtyBuilder, PtyChannelIo, PtyConfig};
use labrig::{ChannelError, Error};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn bash(script: &str) -> PtyConfig {
    let mut config = PtyConfig::new("bash");
    config.args = vec!["-c".to_string(), script.to_string()];
    config
}

#[tokio::test]
async fn test_read_times_out_while_child_is_silent() {
    init_logging();
    let mut ch = PtyBuilder::new("sleep").arg("5").spawn().unwrap();

    let err = ch.read(16, Some(Duration::from_millis(100))).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!ch.is_closed());

    ch.close().await.unwrap();
    assert!(ch.is_closed());
    assert!(ch.close().await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_prompt_wait_ends_when_child_exits() {
    init_logging();
    let mut ch = PtyBuilder::from_config(bash("echo hello; sleep 0.2"))
        .spawn()
        .unwrap()
        .initial_prompt("never printed");

    let err = ch
        .read_until_prompt_with(None, Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(err.is_closed(), "expected Closed, got {:?}", err);

    // Output from before the exit is still there to be read
    let rest = ch.read(64, None).await.unwrap();
    assert_eq!(&rest[..], b"hello\r\n");
    assert!(ch.read(64, None).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_read_back_consumes_echo() {
    init_logging();
    let mut ch = PtyBuilder::new("cat")
        .timeout(Duration::from_secs(10))
        .spawn()
        .unwrap();

    ch.send_line("hello", true).await.unwrap();
    let line = ch
        .read_until_prompt_with(Some(&Prompt::literal("\n")), None)
        .await
        .unwrap();
    assert_eq!(line, "hello\r");

    ch.terminate0().await.unwrap();
    assert!(ch.is_closed());
}

#[tokio::test]
async fn test_interrupt_with_control_key() {
    init_logging();
    let mut ch = PtyBuilder::from_config(bash(
        "trap 'echo caught; exit 0' INT; echo armed; while :; do sleep 0.1; done",
    ))
    .timeout(Duration::from_secs(10))
    .spawn()
    .unwrap();

    ch.read_until_prompt_with(Some(&Prompt::literal("armed")), None)
        .await
        .unwrap();
    ch.send_control('c').await.unwrap();
    ch.read_until_prompt_with(Some(&Prompt::literal("caught")), None)
        .await
        .unwrap();

    assert!(matches!(
        ch.send_control('1').await,
        Err(Error::Channel(ChannelError::InvalidControl('1')))
    ));
    let _ = ch.close().await;
}

#[tokio::test]
async fn test_window_size_reaches_child() {
    init_logging();
    let mut ch = PtyBuilder::from_config(bash("sleep 0.5; stty size"))
        .terminal_size(80, 24)
        .timeout(Duration::from_secs(10))
        .spawn()
        .unwrap();
    assert!(ch.fileno().is_some());

    ch.update_window_size(132, 43).unwrap();
    ch.read_until_prompt_with(Some(&Prompt::literal("43 132")), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_children_do_not_inherit_pty_descriptors() {
    init_logging();
    let mut first = PtyBuilder::new("sleep").arg("5").spawn().unwrap();
    let mut second = PtyBuilder::from_config(bash(
        "for f in /proc/$$/fd/*; do n=${f##*/}; \
         if [ \"$n\" -gt 2 ] && [ \"$n\" -lt 255 ]; then \
         echo \"$n $(readlink $f)\"; fi; done; echo END",
    ))
    .timeout(Duration::from_secs(10))
    .spawn()
    .unwrap();

    let listing = second
        .read_until_prompt_with(Some(&Prompt::literal("END")), None)
        .await
        .unwrap();
    assert!(!listing.contains("ptmx"), "leaked master: {}", listing);
    assert!(!listing.contains("/dev/pts/"), "leaked slave: {}", listing);

    first.close().await.unwrap();
    let _ = second.close().await;
}

#[tokio::test]
async fn test_close_kills_the_whole_session() {
    init_logging();
    let mut io = PtyChannelIo::spawn(&bash("sleep 30 & sleep 30 & wait")).unwrap();
    let sid = io.pid();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session_has_processes(sid).await);

    let started = Instant::now();
    io.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!session_has_processes(sid).await);
    assert!(io.exit_status().is_some());
}

#[tokio::test]
async fn test_surviving_session_member_fails_close() {
    init_logging();
    // The background job gets its own process group and ignores SIGHUP, so
    // killing the leader's group leaves it behind for a few seconds.
    let mut io = PtyChannelIo::spawn(&bash(
        "set -m; nohup sleep 3 >/dev/null 2>&1 & echo started; sleep 30",
    ))
    .unwrap();
    let sid = io.pid();

    let started = io.read(64, Some(Duration::from_secs(5))).await.unwrap();
    assert!(String::from_utf8_lossy(&started).contains("started"));

    let err = io.close().await.unwrap_err();
    match err {
        ChannelError::ProcessTeardown { sid: s, attempts } => {
            assert_eq!(s, sid.as_raw());
            assert_eq!(attempts, REAP_ATTEMPTS);
        }
        other => panic!("unexpected error {:?}", other),
    }

    // Let the straggler finish so it does not outlive the test run
    tokio::time::sleep(Duration::from_secs(3)).await;
}

#[tokio::test]
async fn test_write_after_exit_is_closed() {
    init_logging();
    let mut io = PtyChannelIo::spawn(&bash("exit 0")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !io.closed() {
        assert!(Instant::now() < deadline, "child did not exit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(io.write(b"x").await, Err(ChannelError::Closed)));
    assert!(matches!(io.read(16, None).await, Err(ChannelError::Closed)));
}
