use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sandterm_eventbus::{SessionEvent, SessionEventBus};
use sandterm_lifecycle::test_support::{ProcessScript, RecordingSurface, ScriptedSandbox};
use sandterm_lifecycle::{BootState, SandboxLifecycle};
use sandterm_protocol::FileTree;
use sandterm_session::testing::RecordingDisplay;
use sandterm_session::{InputMode, KeyInput, Session, SessionSettings};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    sandbox: ScriptedSandbox,
    surface: Arc<RecordingSurface>,
    display: RecordingDisplay,
    session: Session,
}

impl Fixture {
    fn open(sandbox: ScriptedSandbox) -> Self {
        let surface = Arc::new(RecordingSurface::default());
        let lifecycle = SandboxLifecycle::new(
            Arc::new(sandbox.clone()),
            Arc::new(SessionEventBus::default()),
        )
        .with_surface(surface.clone())
        .with_initial_tree(
            FileTree::new()
                .with_directory("document", FileTree::new().with_file("blog.md", "hi"))
                .with_file("package.json", "{}"),
        );
        let display = RecordingDisplay::default();
        let session = Session::open(
            lifecycle,
            Box::new(display.clone()),
            SessionSettings::default(),
        );
        Self {
            sandbox,
            surface,
            display,
            session,
        }
    }

    async fn ready(sandbox: ScriptedSandbox) -> Self {
        let fixture = Self::open(sandbox);
        wait_for_state(&fixture.session, BootState::Ready).await;
        fixture
    }

    async fn type_text(&mut self, text: &str) {
        for key in KeyInput::typed(text) {
            self.session.handle_key(key).await;
        }
    }

    async fn enter(&mut self, line: &str) {
        self.type_text(line).await;
        self.session.handle_key(KeyInput::Enter).await;
        timeout(TEST_TIMEOUT, self.session.settle())
            .await
            .expect("commands settled in time");
    }

    async fn step_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&Session, &RecordingDisplay) -> bool,
    {
        timeout(TEST_TIMEOUT, async {
            while !done(&self.session, &self.display) {
                assert!(self.session.step().await, "session queue closed");
            }
        })
        .await
        .expect("condition reached in time");
    }
}

async fn wait_for_state(session: &Session, expected: BootState) {
    timeout(TEST_TIMEOUT, async {
        while session.lifecycle().state().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("lifecycle reached expected state");
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn opening_prints_the_banner_and_prompt() {
    let fixture = Fixture::open(ScriptedSandbox::default());

    assert_eq!(
        fixture.display.lines(),
        vec![
            " Welcome to sandterm.".to_owned(),
            " Type 'help' to see the available commands.".to_owned(),
            " Hello from sandterm $ ".to_owned(),
            " > ".to_owned(),
        ]
    );
    assert!(fixture.display.transcript().ends_with("\x1b[32m > \x1b[0m"));
}

#[tokio::test]
async fn typing_list_renders_the_mounted_root() {
    let mut fixture = Fixture::ready(ScriptedSandbox::default()).await;

    fixture.enter("list").await;

    let lines = fixture.display.lines();
    assert!(lines.contains(&" > list".to_owned()), "{lines:?}");
    assert!(lines.contains(&"document/  package.json".to_owned()), "{lines:?}");
    assert!(fixture
        .display
        .transcript()
        .contains("\x1b[1;34mdocument/\x1b[0m  package.json\n"));
    assert_eq!(fixture.session.buffer(), "");
}

#[tokio::test]
async fn list_during_boot_reports_not_ready_once() {
    let sandbox = ScriptedSandbox::default();
    sandbox.hold_boot();
    let mut fixture = Fixture::open(sandbox.clone());

    fixture.enter("list").await;

    assert_eq!(fixture.display.occurrences("error: sandbox is not ready"), 1);
    assert_eq!(fixture.session.mode(), InputMode::LineEdit);

    sandbox.release_boot();
    wait_for_state(&fixture.session, BootState::Ready).await;
    fixture.enter("list").await;
    assert_eq!(fixture.display.occurrences("document/  package.json"), 1);
}

#[tokio::test]
async fn failed_boot_is_reported_and_reboot_recovers() {
    let sandbox = ScriptedSandbox::default();
    sandbox.fail_next_boot("offline");
    let mut fixture = Fixture::open(sandbox.clone());

    fixture
        .step_until(|_, display| display.rendered().contains("error: sandbox boot failed: offline"))
        .await;
    fixture.enter("list").await;
    assert_eq!(
        fixture.display.occurrences("error: sandbox boot failed: offline"),
        2
    );

    fixture.enter("reboot").await;
    fixture.enter("list").await;

    assert_eq!(sandbox.boots(), 2);
    assert_eq!(fixture.display.occurrences("document/  package.json"), 1);
}

#[tokio::test]
async fn open_server_binds_the_preview_exactly_once() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script(
        "npm run dev",
        ProcessScript::long_running()
            .with_output(["  VITE ready\n"])
            .announcing(8888, "http://x"),
    );
    let mut fixture = Fixture::ready(sandbox.clone()).await;

    fixture.enter("openServer").await;
    let surface = Arc::clone(&fixture.surface);
    wait_for(|| {
        let surface = Arc::clone(&surface);
        async move { !surface.bound_urls().is_empty() }
    })
    .await;
    fixture.enter("openServer").await;
    fixture
        .step_until(|_, display| display.rendered().contains("VITE ready"))
        .await;

    assert_eq!(fixture.surface.bound_urls(), vec!["http://x".to_owned()]);
    assert_eq!(fixture.session.lifecycle().preview_url().as_deref(), Some("http://x"));
    assert_eq!(fixture.display.occurrences("error: server already running"), 1);

    fixture.enter("closeServer").await;
    assert_eq!(fixture.surface.unbind_count(), 1);
    assert!(!fixture.session.server_running().await);

    fixture.enter("closeServer").await;
    assert_eq!(fixture.display.occurrences("error: no running server"), 1);
}

#[tokio::test]
async fn preview_announcement_mid_line_redraws_the_pending_input() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("npm run dev", ProcessScript::long_running());
    let mut fixture = Fixture::ready(sandbox.clone()).await;
    fixture.enter("openServer").await;
    assert_eq!(sandbox.ready_subscriber_count(), 1);

    fixture.type_text("lis").await;
    sandbox.announce(8888, "http://x");
    fixture
        .step_until(|_, display| {
            display
                .transcript()
                .ends_with("preview available at http://x\n Hello from sandterm $ \n\x1b[32m > \x1b[0mlis")
        })
        .await;

    assert_eq!(fixture.session.buffer(), "lis");
    fixture.session.handle_key(KeyInput::Backspace).await;
    assert!(fixture.display.rendered().ends_with(" > li"));

    fixture.enter("st").await;
    assert_eq!(fixture.display.occurrences("document/  package.json"), 1);
    assert_eq!(fixture.surface.bound_urls(), vec!["http://x".to_owned()]);
}

#[tokio::test]
async fn notices_wait_until_the_interactive_program_is_left() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("npm run dev", ProcessScript::long_running());
    sandbox.script("sh", ProcessScript::long_running());
    let mut fixture = Fixture::ready(sandbox.clone()).await;
    fixture.enter("openServer").await;
    fixture.enter("openInteractive").await;
    assert_eq!(fixture.session.mode(), InputMode::Passthrough);
    let before = fixture.display.transcript();

    sandbox.announce(8888, "http://x");
    fixture
        .step_until(|session, _| !session.deferred_notices().is_empty())
        .await;
    assert_eq!(fixture.display.transcript(), before);

    fixture.type_text("exit").await;
    fixture.session.handle_key(KeyInput::Enter).await;

    assert_eq!(fixture.session.mode(), InputMode::LineEdit);
    assert!(fixture
        .display
        .transcript()
        .ends_with(" preview available at http://x\n Hello from sandterm $ \n\x1b[32m > \x1b[0m"));
}

#[tokio::test]
async fn keys_typed_during_a_command_stay_in_the_buffer() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("npm install", ProcessScript::long_running());
    sandbox.script("npm run dev", ProcessScript::long_running());
    let mut fixture = Fixture::ready(sandbox.clone()).await;

    fixture.type_text("openServer").await;
    fixture.session.handle_key(KeyInput::Enter).await;
    let probe = sandbox.clone();
    wait_for(|| {
        let probe = probe.clone();
        async move { probe.running().len() == 1 }
    })
    .await;
    assert_eq!(fixture.session.commands_in_flight(), 1);

    fixture.type_text("he").await;
    let install = sandbox.running().remove(0);
    assert!(sandbox.finish_process(&install, 0));
    timeout(TEST_TIMEOUT, fixture.session.settle())
        .await
        .expect("command settled");

    assert_eq!(fixture.session.buffer(), "he");
    assert!(fixture.display.transcript().ends_with("\x1b[32m > \x1b[0mhe"));
    assert!(fixture.session.server_running().await);
}

#[tokio::test]
async fn interactive_program_receives_raw_keys_until_exit() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("sh", ProcessScript::long_running().echoing_input());
    let mut fixture = Fixture::ready(sandbox.clone()).await;
    let mut events = fixture.session.lifecycle().subscribe_events();

    fixture.enter("openInteractive").await;
    assert_eq!(fixture.session.mode(), InputMode::Passthrough);
    let process = fixture
        .session
        .passthrough_process()
        .cloned()
        .expect("attached process");
    let before = fixture.display.transcript();

    fixture.type_text("ls").await;
    fixture.session.handle_key(KeyInput::Enter).await;
    fixture
        .step_until(|_, display| display.transcript().ends_with("ls\r"))
        .await;

    let forwarded = sandbox
        .inputs()
        .into_iter()
        .map(|(_, bytes)| bytes)
        .collect::<Vec<_>>();
    assert_eq!(forwarded, vec![b"l".to_vec(), b"s".to_vec(), b"\r".to_vec()]);
    assert_eq!(
        fixture.display.transcript(),
        format!("{before}ls\r"),
        "passthrough keys must not be echoed locally"
    );

    fixture.type_text("exit").await;
    fixture.session.handle_key(KeyInput::Enter).await;

    assert_eq!(fixture.session.mode(), InputMode::LineEdit);
    assert_eq!(fixture.session.passthrough_process(), None);
    assert_eq!(sandbox.killed(), vec![process]);
    assert_eq!(
        sandbox
            .inputs()
            .iter()
            .filter(|(_, bytes)| bytes.as_slice() == b"\r")
            .count(),
        1
    );
    assert!(fixture.display.transcript().ends_with("\x1b[32m > \x1b[0m"));

    let events = events
        .drain()
        .into_iter()
        .map(|envelope| envelope.event)
        .collect::<Vec<_>>();
    assert!(events.contains(&SessionEvent::PassthroughEntered));
    assert!(events.contains(&SessionEvent::PassthroughExited));
}

#[tokio::test]
async fn interactive_program_exiting_returns_to_line_edit() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("sh", ProcessScript::long_running());
    let mut fixture = Fixture::ready(sandbox.clone()).await;

    fixture.enter("openInteractive").await;
    let process = fixture
        .session
        .passthrough_process()
        .cloned()
        .expect("attached process");
    fixture.type_text("ex").await;
    assert!(sandbox.finish_process(&process, 0));

    fixture
        .step_until(|session, _| session.mode() == InputMode::LineEdit)
        .await;

    assert!(fixture
        .display
        .rendered()
        .contains("interactive program exited with code 0"));
    assert_eq!(fixture.session.buffer(), "");
    fixture.enter("help").await;
    assert!(fixture.display.rendered().contains("openInteractive"));
}

#[tokio::test]
async fn clear_leaves_only_a_fresh_prompt() {
    let mut fixture = Fixture::ready(ScriptedSandbox::default()).await;
    fixture.enter("whatever").await;
    assert_eq!(fixture.display.occurrences("You entered: whatever"), 1);

    fixture.enter("clear").await;

    assert_eq!(fixture.display.clear_count(), 1);
    assert_eq!(
        fixture.display.lines(),
        vec![" Hello from sandterm $ ".to_owned(), " > ".to_owned()]
    );
}

#[tokio::test]
async fn close_stops_everything_and_tears_down() {
    let sandbox = ScriptedSandbox::default();
    sandbox.script("npm run dev", ProcessScript::long_running());
    sandbox.script("sh", ProcessScript::long_running());
    let mut fixture = Fixture::ready(sandbox.clone()).await;
    fixture.enter("openServer").await;
    fixture.enter("openInteractive").await;
    assert_eq!(sandbox.running().len(), 2);

    fixture.session.close().await;
    fixture.session.close().await;

    assert!(sandbox.running().is_empty());
    assert_eq!(sandbox.teardowns(), 1);
    assert_eq!(fixture.session.lifecycle().state().await, BootState::Unbooted);
    assert_eq!(fixture.session.mode(), InputMode::LineEdit);
    assert!(!fixture.session.server_running().await);
}

#[tokio::test]
async fn run_loop_stops_on_interrupt_and_closes_the_session() {
    let sandbox = ScriptedSandbox::default();
    let mut fixture = Fixture::ready(sandbox.clone()).await;
    let (keys_tx, mut keys) = mpsc::channel(16);
    for key in KeyInput::typed("help") {
        keys_tx.send(key).await.expect("queue key");
    }
    keys_tx.send(KeyInput::Enter).await.expect("queue enter");
    keys_tx
        .send(KeyInput::Interrupt)
        .await
        .expect("queue interrupt");

    timeout(TEST_TIMEOUT, fixture.session.run(&mut keys))
        .await
        .expect("run loop finished");

    assert_eq!(sandbox.teardowns(), 1);
    assert_eq!(fixture.session.lifecycle().state().await, BootState::Unbooted);
}
