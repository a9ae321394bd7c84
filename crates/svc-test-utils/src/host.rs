//! [`FakeHost`]: service processes simulated by tokio tasks.
//!
//! Each spawned "process" infers its identity from the service directory
//! (`.../<name>/<version>`) and reacts to host messages as follows:
//!
//! | message          | reply                                             |
//! |------------------|---------------------------------------------------|
//! | `Describe`       | an interface with `echo`, `fail`, `callback`, `prompt` and `hang` |
//! | `Allocate`       | `Allocated` with instance `allocation + 100`      |
//! | `Invoke echo`    | `InvokeResult` echoing the arguments              |
//! | `Invoke fail`    | `InvokeError` with code `echo_failed`             |
//! | `Invoke callback`| a `Callback`, then the echo result                |
//! | `Invoke prompt`  | a `Prompt`; the response becomes the result       |
//! | `Invoke hang`    | nothing                                           |
//! | `Shutdown`       | exit with status 0                                |

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use svc_meta::ServiceVersion;
use svc_runner::{
    ControllerId, Error, ExitReason, HostMessage, ProcessEvent, ProcessHost, RunnerEvent,
    ServiceLink, ServiceMessage, SpawnRequest,
};
use tokio::sync::mpsc;

/// How a fake service process behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Healthy,
    /// Exits with status 1 before the handshake.
    CrashOnStart,
    /// Never completes the handshake.
    Hang,
    /// Completes the handshake but describes itself with garbage.
    BadDescription,
    /// Exits with status 139 on the first invocation.
    CrashOnInvoke,
}

#[derive(Default)]
struct HostState {
    behaviors: HashMap<PathBuf, Behavior>,
    spawns: Vec<SpawnRequest>,
    refuse_spawn: bool,
    live: usize,
    peak_live: usize,
}

/// Scripted [`ProcessHost`]. Clones share state, so a test can keep one
/// clone to inspect spawns while the engine owns another.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose runner cannot be started at all.
    pub fn refusing() -> Self {
        let host = Self::default();
        host.state.lock().unwrap().refuse_spawn = true;
        host
    }

    pub fn with_behavior(self, service_dir: impl Into<PathBuf>, behavior: Behavior) -> Self {
        self.set_behavior(service_dir, behavior);
        self
    }

    pub fn set_behavior(&self, service_dir: impl Into<PathBuf>, behavior: Behavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(service_dir.into(), behavior);
    }

    /// Every spawn request so far, in order.
    pub fn spawns(&self) -> Vec<SpawnRequest> {
        self.state.lock().unwrap().spawns.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawns.len()
    }

    /// Processes spawned and not yet ended.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    /// Most processes that were alive at the same time.
    pub fn peak_live(&self) -> usize {
        self.state.lock().unwrap().peak_live
    }

    /// How many times the service in `service_dir` was spawned.
    pub fn spawns_of(&self, service_dir: &Path) -> usize {
        self.state
            .lock()
            .unwrap()
            .spawns
            .iter()
            .filter(|r| r.service_dir == service_dir)
            .count()
    }
}

impl ProcessHost for FakeHost {
    fn spawn(
        &self,
        controller: ControllerId,
        request: &SpawnRequest,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> svc_runner::Result<Box<dyn ServiceLink>> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.spawns.push(request.clone());
            if state.refuse_spawn {
                return Err(Error::ProcessSpawnFailure {
                    runner: PathBuf::from("fake-runner"),
                    service_dir: request.service_dir.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "runner not installed"),
                });
            }
            state.live += 1;
            state.peak_live = state.peak_live.max(state.live);
            state
                .behaviors
                .get(&request.service_dir)
                .copied()
                .unwrap_or_default()
        };

        let (name, version) = identity(&request.service_dir);
        let (tx, rx) = mpsc::unbounded_channel();
        let process = FakeProcess {
            host: Arc::clone(&self.state),
            controller,
            name,
            version,
            behavior,
            events,
            prompts: HashMap::new(),
        };
        tokio::spawn(process.run(rx));
        Ok(Box::new(FakeLink { tx }))
    }
}

enum Command {
    Message(HostMessage),
    Kill(Duration),
}

struct FakeLink {
    tx: mpsc::UnboundedSender<Command>,
}

impl ServiceLink for FakeLink {
    fn send(&self, message: HostMessage) -> svc_runner::Result<()> {
        self.tx
            .send(Command::Message(message))
            .map_err(|_| Error::ChannelClosed)
    }

    fn kill(&mut self, grace: Duration) {
        let _ = self.tx.send(Command::Kill(grace));
    }
}

struct FakeProcess {
    host: Arc<Mutex<HostState>>,
    controller: ControllerId,
    name: String,
    version: String,
    behavior: Behavior,
    events: mpsc::UnboundedSender<RunnerEvent>,
    /// prompt id -> tid of the call that raised it
    prompts: HashMap<u32, u32>,
}

impl FakeProcess {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let behavior = self.behavior;
        match behavior {
            Behavior::CrashOnStart => return self.end(ExitReason::Exited(Some(1))),
            Behavior::Hang => {}
            _ => self.reply(ServiceMessage::Initialized {
                service: self.name.clone(),
                version: self.version.clone(),
                api_version: 5,
            }),
        }

        while let Some(command) = commands.recv().await {
            let message = match command {
                Command::Kill(grace) => {
                    tokio::time::sleep(grace).await;
                    return self.end(ExitReason::Killed);
                }
                Command::Message(message) => message,
            };
            match message {
                HostMessage::Describe => self.describe(),
                HostMessage::Allocate { allocation, .. } => self.reply(ServiceMessage::Allocated {
                    allocation,
                    instance: allocation + 100,
                }),
                HostMessage::Invoke { tid, function, args, .. } => {
                    if self.behavior == Behavior::CrashOnInvoke {
                        return self.end(ExitReason::Exited(Some(139)));
                    }
                    self.invoke(tid, &function, args);
                }
                HostMessage::PromptResponse { prompt, response } => {
                    if let Some(tid) = self.prompts.remove(&prompt) {
                        self.reply(ServiceMessage::InvokeResult { tid, result: response });
                    }
                }
                HostMessage::Destroy { .. } => {}
                HostMessage::Shutdown => return self.end(ExitReason::Exited(Some(0))),
            }
        }
        self.end(ExitReason::Killed);
    }

    fn describe(&self) {
        let interface = if self.behavior == Behavior::BadDescription {
            json!({ "name": "", "version": "not a version" })
        } else {
            let version = ServiceVersion::parse(&self.version)
                .map(|v| v.to_semver().to_string())
                .unwrap_or_else(|_| "0.0.0".to_string());
            let text = json!([{ "name": "text", "type": "string", "required": false }]);
            json!({
                "name": self.name,
                "version": version,
                "documentation": "Fake service",
                "functions": [
                    { "name": "echo", "parameters": text },
                    { "name": "fail", "parameters": text },
                    { "name": "callback", "parameters": text },
                    { "name": "prompt", "parameters": text },
                    { "name": "hang", "parameters": text }
                ]
            })
        };
        self.reply(ServiceMessage::Described { interface });
    }

    fn invoke(&mut self, tid: u32, function: &str, args: Value) {
        match function {
            "fail" => self.reply(ServiceMessage::InvokeError {
                tid,
                code: "echo_failed".to_string(),
                message: "asked to fail".to_string(),
            }),
            "callback" => {
                self.reply(ServiceMessage::Callback {
                    tid,
                    callback: 1,
                    params: args.clone(),
                });
                self.reply(ServiceMessage::InvokeResult { tid, result: args });
            }
            "prompt" => {
                let prompt = tid + 1000;
                self.prompts.insert(prompt, tid);
                self.reply(ServiceMessage::Prompt {
                    tid,
                    prompt,
                    dialog: PathBuf::from("confirm.html"),
                    args,
                });
            }
            "hang" => {}
            _ => self.reply(ServiceMessage::InvokeResult { tid, result: args }),
        }
    }

    fn reply(&self, message: ServiceMessage) {
        let _ = self.events.send(RunnerEvent {
            controller: self.controller,
            event: ProcessEvent::Message(message),
        });
    }

    fn end(self, reason: ExitReason) {
        self.host.lock().unwrap().live -= 1;
        let _ = self.events.send(RunnerEvent {
            controller: self.controller,
            event: ProcessEvent::Ended(reason),
        });
    }
}

fn identity(service_dir: &Path) -> (String, String) {
    let version = service_dir
        .file_name()
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = service_dir
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (name, version)
}
