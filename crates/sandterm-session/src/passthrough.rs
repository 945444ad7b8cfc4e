use sandterm_lifecycle::{KillOutcome, ProcessHandle};
use sandterm_protocol::{ProcessId, SandboxResult};
use tokio::task::JoinHandle;

use crate::display::OutputSink;

/// An interactive program attached to the session's input.
///
/// Output is pumped to the sink in the background; the sink hears
/// `PassthroughEnded` once the program closes its output.
pub struct PassthroughStream {
    handle: ProcessHandle,
    pump: Option<JoinHandle<()>>,
}

impl PassthroughStream {
    pub(crate) fn attach(mut handle: ProcessHandle, sink: &OutputSink) -> Self {
        let pump = handle.take_output().map(|mut output| {
            let process = handle.id().clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                loop {
                    match output.next_chunk().await {
                        Ok(Some(bytes)) => sink.passthrough_output(&process, bytes),
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(process = %process, error = %error, "passthrough output failed");
                            break;
                        }
                    }
                }
                sink.passthrough_ended(&process);
            })
        });
        if pump.is_none() {
            sink.passthrough_ended(handle.id());
        }
        Self { handle, pump }
    }

    pub fn id(&self) -> &ProcessId {
        self.handle.id()
    }

    pub async fn send(&self, bytes: &[u8]) -> SandboxResult<()> {
        self.handle.send_input(bytes).await
    }

    /// Stops the program and the output pump.
    pub async fn close(mut self) -> SandboxResult<KillOutcome> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.handle.kill().await
    }

    /// Exit code of a program whose output already ended.
    pub async fn finish(mut self) -> SandboxResult<i32> {
        self.pump.take();
        self.handle.wait().await
    }
}

impl std::fmt::Debug for PassthroughStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughStream")
            .field("process", self.handle.id())
            .finish_non_exhaustive()
    }
}
