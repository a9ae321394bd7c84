//! The `run` command loop.
//!
//! Commands arrive on stdin, one JSON object per line:
//!
//! ```text
//! {"id": 1, "command": "instantiate", "name": "Echo", "version": "1"}
//! ```
//!
//! Every command gets exactly one reply line carrying the same `id`,
//! either `{"id":..,"ok":true,"result":..}` or `{"id":..,"ok":false,"error":".."}`.
//! Asynchronous outcomes (instances becoming ready, call results,
//! callbacks, prompts) are written as separate lines tagged with `event`.
//! Logs go to stderr.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Value, json};
use svc_manager::{DynamicServiceManager, InstanceId, ManagerEvent};
use svc_runner::AllocationContext;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Available,
    Summary {
        name: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        minversion: String,
    },
    Describe {
        name: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        minversion: String,
    },
    Instantiate {
        name: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        context: AllocationContext,
    },
    Execute {
        instance: InstanceId,
        tid: u64,
        function: String,
        #[serde(default)]
        args: Value,
    },
    Destroy {
        instance: InstanceId,
    },
    PromptResponse {
        instance: InstanceId,
        prompt: u32,
        response: Value,
    },
    Rescan,
    Purge {
        name: String,
        version: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    request: Request,
}

pub struct Server {
    manager: DynamicServiceManager,
    events: UnboundedReceiver<ManagerEvent>,
}

impl Server {
    pub fn new(manager: DynamicServiceManager, events: UnboundedReceiver<ManagerEvent>) -> Self {
        Self { manager, events }
    }

    /// Serve until stdin closes, then stop every service.
    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        info!(services = self.manager.available_services().len(), "svcd ready, listening on stdio");

        loop {
            let idle_deadline = self.manager.next_idle_deadline();
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!(request = %line, "received command");
                    let reply = self.dispatch(&line).await;
                    write_line(&mut stdout, &reply).await?;
                }
                Some(event) = self.manager.next_runner_event() => {
                    self.manager.handle_runner_event(event);
                }
                _ = idle_timer(idle_deadline) => {
                    self.manager.reap_idle(Instant::now());
                }
            }
            self.flush_events(&mut stdout).await?;
        }

        self.shutdown(&mut stdout).await
    }

    async fn shutdown(&mut self, stdout: &mut Stdout) -> Result<()> {
        let stopped = self.manager.stop_all();
        if stopped > 0 {
            info!(stopped, "stopping services");
            let grace = self.manager.config().kill_grace().max(Duration::from_millis(100));
            let manager = &mut self.manager;
            let drained = tokio::time::timeout(grace, async {
                while manager.is_busy() {
                    match manager.next_runner_event().await {
                        Some(event) => manager.handle_runner_event(event),
                        None => break,
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("services still running at exit");
            }
        }
        self.flush_events(stdout).await
    }

    async fn flush_events(&mut self, stdout: &mut Stdout) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            write_line(stdout, &serde_json::to_value(&event)?).await?;
        }
        Ok(())
    }

    /// Turn one command line into its reply.
    pub async fn dispatch(&mut self, line: &str) -> Value {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                return json!({ "id": id, "ok": false, "error": format!("malformed command: {e}") });
            }
        };
        match self.execute(envelope.request).await {
            Ok(result) => json!({ "id": envelope.id, "ok": true, "result": result }),
            Err(e) => json!({ "id": envelope.id, "ok": false, "error": e.to_string() }),
        }
    }

    async fn execute(&mut self, request: Request) -> Result<Value> {
        let m = &mut self.manager;
        let result = match request {
            Request::Available => serde_json::to_value(m.available_summaries())?,
            Request::Summary {
                name,
                version,
                minversion,
            } => serde_json::to_value(m.summary(&name, &version, &minversion)?)?,
            Request::Describe {
                name,
                version,
                minversion,
            } => serde_json::to_value(m.describe(&name, &version, &minversion)?)?,
            Request::Instantiate { name, version, context } => {
                let instance = m.instantiate(&name, &version, context)?;
                json!({ "instance": instance })
            }
            Request::Execute {
                instance,
                tid,
                function,
                args,
            } => {
                m.execute(instance, tid, &function, args)?;
                Value::Null
            }
            Request::Destroy { instance } => {
                m.destroy(instance)?;
                Value::Null
            }
            Request::PromptResponse {
                instance,
                prompt,
                response,
            } => {
                m.prompt_response(instance, prompt, response)?;
                Value::Null
            }
            Request::Rescan => serde_json::to_value(m.force_rescan().await)?,
            Request::Purge { name, version } => {
                m.purge_service(&name, &version).await?;
                Value::Null
            }
        };
        Ok(result)
    }
}

async fn write_line(stdout: &mut Stdout, value: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

async fn idle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: Value) -> Request {
        serde_json::from_value::<Envelope>(line).unwrap().request
    }

    #[test]
    fn test_requests_decode_with_defaults() {
        assert_eq!(parse(json!({ "command": "available" })), Request::Available);
        assert_eq!(
            parse(json!({ "id": 3, "command": "summary", "name": "Echo" })),
            Request::Summary {
                name: "Echo".to_string(),
                version: String::new(),
                minversion: String::new(),
            }
        );
        assert_eq!(
            parse(json!({ "command": "execute", "instance": 2, "tid": 9, "function": "echo" })),
            Request::Execute {
                instance: InstanceId(2),
                tid: 9,
                function: "echo".to_string(),
                args: Value::Null,
            }
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_value::<Envelope>(json!({ "command": "reboot" })).is_err());
    }
}
