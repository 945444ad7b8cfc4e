use std::time::Duration;

use sandterm_host::{HostSandbox, HostSandboxConfig};
use sandterm_lifecycle::{KillOutcome, ProcessHandle};
use sandterm_protocol::{
    FileTree, ProcessOutputStream, SandboxBooter, SandboxError, SandboxEventSource,
    SandboxFilesystem, SandboxProcessControl, SandboxResult, SandboxTeardown, SpawnRequest,
    TerminalSize,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn sandbox_in(parent: &tempfile::TempDir) -> HostSandbox {
    HostSandbox::new(HostSandboxConfig {
        root_parent: Some(parent.path().to_path_buf()),
    })
}

async fn collect_until(output: &mut ProcessOutputStream, needle: &str) -> SandboxResult<String> {
    let collected = timeout(TEST_TIMEOUT, async {
        let mut collected = Vec::new();
        while let Some(chunk) = output.next_chunk().await? {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
        Ok::<Vec<u8>, SandboxError>(collected)
    })
    .await
    .map_err(|_| SandboxError::Internal("timed out waiting for process output".to_owned()))??;
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

#[tokio::test]
async fn boot_creates_an_isolated_root_that_teardown_removes() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");
    instance
        .mount(&FileTree::new().with_file("package.json", "{}"))
        .await
        .expect("mount");

    let roots = std::fs::read_dir(parent.path()).expect("read parent").count();
    assert_eq!(roots, 1);

    instance.teardown().await.expect("teardown");

    assert_eq!(
        std::fs::read_dir(parent.path()).expect("read parent").count(),
        0
    );
    assert_eq!(
        instance.list_dir("/").await.expect_err("torn down"),
        SandboxError::NotReady
    );
    instance.teardown().await.expect("second teardown is a no-op");
}

#[cfg(unix)]
#[tokio::test]
async fn piped_process_reports_output_and_exit_code() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");

    let mut spawned = instance
        .spawn(SpawnRequest::new("sh", ["-c", "printf 'hello'; exit 3"]))
        .await
        .expect("spawn");
    let output = collect_until(&mut spawned.output, "hello")
        .await
        .expect("collect output");
    let code = timeout(TEST_TIMEOUT, spawned.exit)
        .await
        .expect("exit in time")
        .expect("exit code");

    assert_eq!(output, "hello");
    assert_eq!(code, 3);
}

#[cfg(unix)]
#[tokio::test]
async fn processes_run_inside_the_sandbox_root() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");
    instance
        .mount(&FileTree::new().with_file("marker.txt", "inside"))
        .await
        .expect("mount");

    let mut spawned = instance
        .spawn(SpawnRequest::new("cat", ["marker.txt"]))
        .await
        .expect("spawn");

    let output = collect_until(&mut spawned.output, "inside")
        .await
        .expect("collect output");
    assert_eq!(output, "inside");
}

#[cfg(unix)]
#[tokio::test]
async fn kill_stops_a_long_running_process() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");

    let spawned = instance
        .spawn(SpawnRequest::new("sleep", ["30"]))
        .await
        .expect("spawn");
    instance.kill(&spawned.id).await.expect("kill");

    let code = timeout(TEST_TIMEOUT, spawned.exit)
        .await
        .expect("exit in time")
        .expect("exit code");
    assert_ne!(code, 0);

    assert!(matches!(
        instance.kill(&spawned.id).await,
        Err(SandboxError::ProcessNotFound(_))
    ));
    assert!(matches!(
        instance.send_input(&spawned.id, b"x").await,
        Err(SandboxError::ProcessNotFound(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn readiness_is_announced_to_subscribers_taken_before_spawn() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");
    let mut ready = instance
        .subscribe_service_ready()
        .await
        .expect("subscribe");

    let spawned = instance
        .spawn(SpawnRequest::new(
            "sh",
            ["-c", "echo '  Local:   http://localhost:4321/'; sleep 5"],
        ))
        .await
        .expect("spawn");

    let event = timeout(TEST_TIMEOUT, ready.next_ready())
        .await
        .expect("announcement in time")
        .expect("readiness stream")
        .expect("one announcement");
    assert_eq!(event.port, 4321);
    assert_eq!(event.url, "http://localhost:4321/");

    instance.kill(&spawned.id).await.expect("kill");
}

#[cfg(unix)]
#[tokio::test]
async fn terminal_processes_receive_input() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");

    let mut spawned = instance
        .spawn(
            SpawnRequest::new(
                "sh",
                ["-c", "printf 'ready\\n'; read line; printf 'got:%s\\n' \"$line\""],
            )
            .with_terminal(TerminalSize::default()),
        )
        .await
        .expect("spawn");
    collect_until(&mut spawned.output, "ready")
        .await
        .expect("prompt");

    instance
        .send_input(&spawned.id, b"abc\r")
        .await
        .expect("send input");

    let output = collect_until(&mut spawned.output, "got:abc")
        .await
        .expect("echoed line");
    assert!(output.contains("got:abc"));
    let code = timeout(TEST_TIMEOUT, spawned.exit)
        .await
        .expect("exit in time")
        .expect("exit code");
    assert_eq!(code, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn spawning_a_missing_program_fails_without_leaking_a_process() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");

    let error = instance
        .spawn(SpawnRequest::new("sandterm-no-such-program", Vec::<String>::new()))
        .await
        .expect_err("missing program");

    assert!(matches!(error, SandboxError::Process(message) if message.contains("failed to start")));
}

#[cfg(unix)]
#[tokio::test]
async fn kill_after_a_natural_exit_is_reported_as_already_exited() {
    let parent = tempfile::tempdir().expect("parent dir");
    let instance = sandbox_in(&parent).boot().await.expect("boot");
    let handle = ProcessHandle::spawn(
        std::sync::Arc::clone(&instance),
        SpawnRequest::new("sh", ["-c", "exit 0"]),
    )
    .await
    .expect("spawn");

    timeout(TEST_TIMEOUT, async {
        loop {
            match instance.send_input(handle.id(), b"").await {
                Err(SandboxError::ProcessNotFound(_)) => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("process left the table in time");

    assert_eq!(
        handle.kill().await.expect("kill"),
        KillOutcome::AlreadyExited
    );
}
