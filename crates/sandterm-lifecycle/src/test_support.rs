//! In-memory sandbox with scripted processes, for tests of everything above
//! the runtime boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sandterm_protocol::{
    DirEntry, FileNode, FileTree, ProcessId, ProcessOutputStream, ProcessOutputSubscription,
    RemoveOptions, SandboxBooter, SandboxError, SandboxEventSource, SandboxFilesystem,
    SandboxInstance, SandboxProcessControl, SandboxResult, SandboxTeardown, ServiceReadyEvent,
    ServiceReadyStream, ServiceReadySubscription, SpawnRequest, SpawnedProcess,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::state::ChainStep;
use crate::surface::{OutputObserver, PreviewSurface};

/// Exit code reported for processes ended through `kill` or teardown.
pub const KILLED_EXIT_CODE: i32 = 143;

/// How a spawned command behaves.
///
/// Scripts are looked up by full command line first, then by program name.
#[derive(Debug, Clone, Default)]
pub struct ProcessScript {
    output: Vec<String>,
    exit_code: Option<i32>,
    ready: Option<ServiceReadyEvent>,
    echo_input: bool,
}

impl ProcessScript {
    pub fn exits(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Stays alive until killed or finished through [`ScriptedSandbox::finish_process`].
    pub fn long_running() -> Self {
        Self::default()
    }

    pub fn with_output<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Announces a listening service as soon as the process starts.
    pub fn announcing(mut self, port: u16, url: impl Into<String>) -> Self {
        self.ready = Some(ServiceReadyEvent {
            port,
            url: url.into(),
        });
        self
    }

    pub fn echoing_input(mut self) -> Self {
        self.echo_input = true;
        self
    }
}

struct RunningProcess {
    output: mpsc::UnboundedSender<Vec<u8>>,
    exit: oneshot::Sender<i32>,
    echo_input: bool,
}

#[derive(Default)]
struct ScriptedState {
    scripts: HashMap<String, ProcessScript>,
    boot_failure: Option<SandboxError>,
    mount_failure: Option<String>,
    boots: usize,
    teardowns: usize,
    next_process: u64,
    spawned: Vec<SpawnRequest>,
    killed: Vec<ProcessId>,
    inputs: Vec<(ProcessId, Vec<u8>)>,
    running: HashMap<ProcessId, RunningProcess>,
    ready_subscribers: Vec<mpsc::UnboundedSender<ServiceReadyEvent>>,
}

impl ScriptedState {
    fn finish(&mut self, process: &ProcessId, code: i32) -> bool {
        let Some(running) = self.running.remove(process) else {
            return false;
        };
        drop(running.output);
        let _ = running.exit.send(code);
        true
    }

    fn announce(&mut self, event: &ServiceReadyEvent) {
        self.ready_subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// Boots [`ScriptedInstance`]s and keeps a shared log of everything they did.
#[derive(Clone)]
pub struct ScriptedSandbox {
    state: Arc<Mutex<ScriptedState>>,
    boot_gate: Arc<watch::Sender<bool>>,
}

impl Default for ScriptedSandbox {
    fn default() -> Self {
        let (boot_gate, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(ScriptedState::default())),
            boot_gate: Arc::new(boot_gate),
        }
    }
}

impl ScriptedSandbox {
    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        lock_state(&self.state)
    }

    pub fn script(&self, command: impl Into<String>, script: ProcessScript) {
        self.lock().scripts.insert(command.into(), script);
    }

    pub fn fail_next_boot(&self, reason: impl Into<String>) {
        self.lock().boot_failure = Some(SandboxError::BootFailed(reason.into()));
    }

    pub fn fail_next_mount(&self, reason: impl Into<String>) {
        self.lock().mount_failure = Some(reason.into());
    }

    /// Parks every boot until [`ScriptedSandbox::release_boot`].
    pub fn hold_boot(&self) {
        self.boot_gate.send_replace(true);
    }

    pub fn release_boot(&self) {
        self.boot_gate.send_replace(false);
    }

    pub fn finish_process(&self, process: &ProcessId, code: i32) -> bool {
        self.lock().finish(process, code)
    }

    pub fn announce(&self, port: u16, url: impl Into<String>) {
        self.lock().announce(&ServiceReadyEvent {
            port,
            url: url.into(),
        });
    }

    pub fn boots(&self) -> usize {
        self.lock().boots
    }

    pub fn teardowns(&self) -> usize {
        self.lock().teardowns
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.lock().spawned.clone()
    }

    pub fn spawned_commands(&self) -> Vec<String> {
        self.lock()
            .spawned
            .iter()
            .map(SpawnRequest::display_command)
            .collect()
    }

    pub fn killed(&self) -> Vec<ProcessId> {
        self.lock().killed.clone()
    }

    pub fn inputs(&self) -> Vec<(ProcessId, Vec<u8>)> {
        self.lock().inputs.clone()
    }

    pub fn running(&self) -> Vec<ProcessId> {
        let mut running = self.lock().running.keys().cloned().collect::<Vec<_>>();
        running.sort_by(|left, right| left.as_str().cmp(right.as_str()));
        running
    }

    pub fn ready_subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state
            .ready_subscribers
            .retain(|subscriber| !subscriber.is_closed());
        state.ready_subscribers.len()
    }
}

#[async_trait]
impl SandboxBooter for ScriptedSandbox {
    async fn boot(&self) -> SandboxResult<Arc<dyn SandboxInstance>> {
        let mut gate = self.boot_gate.subscribe();
        gate.wait_for(|held| !*held)
            .await
            .map_err(|_| SandboxError::Internal("boot gate closed".to_owned()))?;

        let mut state = self.lock();
        state.boots += 1;
        if let Some(error) = state.boot_failure.take() {
            return Err(error);
        }
        Ok(Arc::new(ScriptedInstance {
            state: Arc::clone(&self.state),
            fs: Mutex::new(BTreeMap::new()),
            torn_down: AtomicBool::new(false),
        }))
    }
}

/// One booted scripted sandbox. Paths map to `true` for directories.
pub struct ScriptedInstance {
    state: Arc<Mutex<ScriptedState>>,
    fs: Mutex<BTreeMap<String, bool>>,
    torn_down: AtomicBool,
}

impl ScriptedInstance {
    fn ensure_live(&self) -> SandboxResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SandboxError::NotReady);
        }
        Ok(())
    }

    fn fs(&self) -> MutexGuard<'_, BTreeMap<String, bool>> {
        self.fs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SandboxFilesystem for ScriptedInstance {
    async fn mount(&self, tree: &FileTree) -> SandboxResult<()> {
        self.ensure_live()?;
        if let Some(reason) = lock_state(&self.state).mount_failure.take() {
            return Err(SandboxError::Io(reason));
        }
        let mut fs = self.fs();
        insert_tree(&mut fs, "", tree);
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        self.ensure_live()?;
        let path = normalize(path);
        let fs = self.fs();
        if !path.is_empty() && fs.get(&path) != Some(&true) {
            return Err(SandboxError::Io(format!(
                "ENOENT: no such file or directory, scandir '/{path}'"
            )));
        }
        Ok(fs
            .iter()
            .filter(|(entry, _)| parent_of(entry) == path)
            .map(|(entry, is_directory)| DirEntry {
                name: entry.rsplit('/').next().unwrap_or(entry).to_owned(),
                is_directory: *is_directory,
            })
            .collect())
    }

    async fn make_dir(&self, path: &str) -> SandboxResult<()> {
        self.ensure_live()?;
        let path = normalize(path);
        let mut fs = self.fs();
        if path.is_empty() || fs.contains_key(&path) {
            return Err(SandboxError::Io(format!(
                "EEXIST: file already exists, mkdir '/{path}'"
            )));
        }
        let parent = parent_of(&path);
        if !parent.is_empty() && fs.get(parent) != Some(&true) {
            return Err(SandboxError::Io(format!(
                "ENOENT: no such file or directory, mkdir '/{path}'"
            )));
        }
        fs.insert(path, true);
        Ok(())
    }

    async fn remove_dir(&self, path: &str, options: RemoveOptions) -> SandboxResult<()> {
        self.ensure_live()?;
        let path = normalize(path);
        if path.is_empty() {
            return Err(SandboxError::Io(
                "EPERM: operation not permitted, rmdir '/'".to_owned(),
            ));
        }
        let mut fs = self.fs();
        if !fs.contains_key(&path) {
            return Err(SandboxError::Io(format!(
                "ENOENT: no such file or directory, rmdir '/{path}'"
            )));
        }
        let prefix = format!("{path}/");
        let has_children = fs.keys().any(|entry| entry.starts_with(&prefix));
        if has_children && !options.recursive {
            return Err(SandboxError::Io(format!(
                "ENOTEMPTY: directory not empty, rmdir '/{path}'"
            )));
        }
        fs.retain(|entry, _| entry != &path && !entry.starts_with(&prefix));
        Ok(())
    }
}

#[async_trait]
impl SandboxProcessControl for ScriptedInstance {
    async fn spawn(&self, request: SpawnRequest) -> SandboxResult<SpawnedProcess> {
        self.ensure_live()?;
        let mut state = lock_state(&self.state);
        state.next_process += 1;
        let id = ProcessId::new(format!("proc-{}", state.next_process));
        let script = state
            .scripts
            .get(&request.display_command())
            .or_else(|| state.scripts.get(&request.command))
            .cloned()
            .unwrap_or_else(|| ProcessScript::exits(0));
        state.spawned.push(request);

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        for chunk in &script.output {
            let _ = output_tx.send(chunk.as_bytes().to_vec());
        }
        if let Some(ready) = &script.ready {
            state.announce(ready);
        }
        match script.exit_code {
            Some(code) => {
                drop(output_tx);
                let _ = exit_tx.send(code);
            }
            None => {
                state.running.insert(
                    id.clone(),
                    RunningProcess {
                        output: output_tx,
                        exit: exit_tx,
                        echo_input: script.echo_input,
                    },
                );
            }
        }

        Ok(SpawnedProcess {
            id,
            output: Box::new(ChannelOutput(output_rx)) as ProcessOutputStream,
            exit: exit_rx,
        })
    }

    async fn kill(&self, process: &ProcessId) -> SandboxResult<()> {
        self.ensure_live()?;
        let mut state = lock_state(&self.state);
        if !state.finish(process, KILLED_EXIT_CODE) {
            return Err(SandboxError::ProcessNotFound(process.to_string()));
        }
        state.killed.push(process.clone());
        Ok(())
    }

    async fn send_input(&self, process: &ProcessId, input: &[u8]) -> SandboxResult<()> {
        self.ensure_live()?;
        let mut state = lock_state(&self.state);
        let Some(running) = state.running.get(process) else {
            return Err(SandboxError::ProcessNotFound(process.to_string()));
        };
        if running.echo_input {
            let _ = running.output.send(input.to_vec());
        }
        state.inputs.push((process.clone(), input.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl SandboxEventSource for ScriptedInstance {
    async fn subscribe_service_ready(&self) -> SandboxResult<ServiceReadyStream> {
        self.ensure_live()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        lock_state(&self.state).ready_subscribers.push(sender);
        Ok(Box::new(ChannelReady(receiver)))
    }
}

#[async_trait]
impl SandboxTeardown for ScriptedInstance {
    async fn teardown(&self) -> SandboxResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = lock_state(&self.state);
        state.teardowns += 1;
        let running = state.running.keys().cloned().collect::<Vec<_>>();
        for process in running {
            state.finish(&process, KILLED_EXIT_CODE);
        }
        state.ready_subscribers.clear();
        Ok(())
    }
}

struct ChannelOutput(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl ProcessOutputSubscription for ChannelOutput {
    async fn next_chunk(&mut self) -> SandboxResult<Option<Vec<u8>>> {
        Ok(self.0.recv().await)
    }
}

struct ChannelReady(mpsc::UnboundedReceiver<ServiceReadyEvent>);

#[async_trait]
impl ServiceReadySubscription for ChannelReady {
    async fn next_ready(&mut self) -> SandboxResult<Option<ServiceReadyEvent>> {
        Ok(self.0.recv().await)
    }
}

#[derive(Debug, Default)]
pub struct RecordingSurface {
    bound: Mutex<Vec<String>>,
    unbinds: AtomicUsize,
}

impl RecordingSurface {
    pub fn bound_urls(&self) -> Vec<String> {
        self.bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }
}

impl PreviewSurface for RecordingSurface {
    fn bind(&self, url: &str) {
        self.bound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(url.to_owned());
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    chunks: Mutex<Vec<(ChainStep, Vec<u8>)>>,
}

impl RecordingObserver {
    pub fn text(&self, step: ChainStep) -> String {
        let chunks = self
            .chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        chunks
            .iter()
            .filter(|(chunk_step, _)| *chunk_step == step)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

impl OutputObserver for RecordingObserver {
    fn on_output(&self, step: ChainStep, bytes: &[u8]) {
        self.chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((step, bytes.to_vec()));
    }
}

fn lock_state(state: &Mutex<ScriptedState>) -> MutexGuard<'_, ScriptedState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn insert_tree(fs: &mut BTreeMap<String, bool>, prefix: &str, tree: &FileTree) {
    for (name, node) in tree.iter() {
        let path = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            FileNode::File { .. } => {
                fs.insert(path, false);
            }
            FileNode::Directory(children) => {
                fs.insert(path.clone(), true);
                insert_tree(fs, &path, children);
            }
        }
    }
}

fn normalize(path: &str) -> String {
    let mut segments = Vec::new();
    for segment in path.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    segments.join("/")
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use sandterm_protocol::{
        DirEntry, RemoveOptions, SandboxBooter, SandboxError, SandboxFilesystem, SandboxTeardown,
    };

    use super::ScriptedSandbox;
    use crate::tree::initial_file_tree;

    #[tokio::test]
    async fn scripted_filesystem_mirrors_mounted_tree() {
        let sandbox = ScriptedSandbox::default();
        let instance = sandbox.boot().await.expect("boot");
        instance.mount(&initial_file_tree()).await.expect("mount");

        let entries = instance.list_dir("/").await.expect("list root");
        assert!(entries.contains(&DirEntry::directory("document")));
        assert!(entries.contains(&DirEntry::file("package.json")));
        assert_eq!(
            instance.list_dir("document").await.expect("list document"),
            vec![DirEntry::file("blog.md")]
        );
    }

    #[tokio::test]
    async fn non_recursive_removal_of_populated_directory_fails() {
        let sandbox = ScriptedSandbox::default();
        let instance = sandbox.boot().await.expect("boot");
        instance.mount(&initial_file_tree()).await.expect("mount");

        let error = instance
            .remove_dir("document", RemoveOptions { recursive: false })
            .await
            .expect_err("directory is not empty");

        assert!(matches!(error, SandboxError::Io(message) if message.starts_with("ENOTEMPTY")));
    }

    #[tokio::test]
    async fn torn_down_instance_reports_not_ready() {
        let sandbox = ScriptedSandbox::default();
        let instance = sandbox.boot().await.expect("boot");
        instance.teardown().await.expect("teardown");

        assert_eq!(
            instance.list_dir("/").await.expect_err("torn down"),
            SandboxError::NotReady
        );
        assert_eq!(sandbox.teardowns(), 1);
    }
}
