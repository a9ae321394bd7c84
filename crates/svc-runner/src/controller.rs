//! Lifecycle of one service process and the instances multiplexed on it.
//!
//! ```text
//! Uninitialized --start--> Initializing --Initialized--> Ready --Ended--> Ended
//!                               |                                  ^
//!                               +-------------Ended----------------+
//! ```
//!
//! Allocations requested before `Ready` are queued and sent in order once
//! the handshake arrives. Invocations are tracked in a transaction table
//! keyed by a process-local tid, which maps back to the tid the owner
//! supplied.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use svc_meta::{ServiceDescription, ServiceKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::{ProcessHost, RunnerEvent, ServiceLink, SpawnRequest};
use crate::protocol::{AllocationContext, ExitReason, HostMessage, ProcessEvent, ServiceMessage};

/// Handle of a controller in its owner's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControllerId(pub u64);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller#{}", self.0)
    }
}

/// Per-process allocation handle, assigned at `allocate` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    /// Spawned, waiting for the `Initialized` handshake.
    Initializing,
    Ready,
    Ended,
}

/// What the owner has to act on after feeding an event to a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerOutcome {
    Ready {
        service: String,
        version: String,
        api_version: u32,
    },
    Described(ServiceDescription),
    DescribeFailed(String),
    Allocated(AllocationId),
    InvokeResult {
        allocation: AllocationId,
        tid: u64,
        result: Value,
    },
    InvokeError {
        allocation: AllocationId,
        tid: u64,
        code: String,
        message: String,
    },
    Callback {
        allocation: AllocationId,
        tid: u64,
        callback: u32,
        params: Value,
    },
    Prompt {
        allocation: AllocationId,
        tid: u64,
        prompt: u32,
        dialog: PathBuf,
        args: Value,
    },
    /// The process is gone. Every allocation it held, queued or running,
    /// is listed once in `failed`, and every open transaction in
    /// `abandoned`.
    Ended {
        reached_ready: bool,
        reason: ExitReason,
        failed: Vec<AllocationId>,
        abandoned: Vec<(AllocationId, u64)>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Transaction {
    allocation: AllocationId,
    tid: u64,
}

pub struct Controller {
    id: ControllerId,
    key: ServiceKey,
    state: ControllerState,
    link: Option<Box<dyn ServiceLink>>,
    reached_ready: bool,
    stopping: bool,
    describe_requested: bool,
    next_allocation: u32,
    queued: VecDeque<(AllocationId, AllocationContext)>,
    allocating: BTreeSet<AllocationId>,
    running: BTreeMap<AllocationId, u32>,
    next_tid: u32,
    transactions: HashMap<u32, Transaction>,
    prompts: HashMap<u32, AllocationId>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("queued", &self.queued.len())
            .field("allocating", &self.allocating)
            .field("running", &self.running)
            .field("transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(id: ControllerId, key: ServiceKey) -> Self {
        Self {
            id,
            key,
            state: ControllerState::Uninitialized,
            link: None,
            reached_ready: false,
            stopping: false,
            describe_requested: false,
            next_allocation: 1,
            queued: VecDeque::new(),
            allocating: BTreeSet::new(),
            running: BTreeMap::new(),
            next_tid: 1,
            transactions: HashMap::new(),
            prompts: HashMap::new(),
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn reached_ready(&self) -> bool {
        self.reached_ready
    }

    /// Initializing or Ready, and not asked to stop.
    pub fn is_alive(&self) -> bool {
        let running = matches!(
            self.state,
            ControllerState::Initializing | ControllerState::Ready
        );
        running && !self.stopping
    }

    /// Allocations queued, in flight or running.
    pub fn instance_count(&self) -> usize {
        self.queued.len() + self.allocating.len() + self.running.len()
    }

    pub fn is_running(&self, allocation: AllocationId) -> bool {
        self.running.contains_key(&allocation)
    }

    /// Spawn the process through `host`.
    pub fn start(
        &mut self,
        host: &dyn ProcessHost,
        request: &SpawnRequest,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<()> {
        if self.state != ControllerState::Uninitialized {
            return Err(Error::Protocol(format!("{} already started", self.key)));
        }
        self.link = Some(host.spawn(self.id, request, events)?);
        self.state = ControllerState::Initializing;
        debug!(controller = %self.id, service = %self.key, "controller initializing");
        Ok(())
    }

    fn send(&self, message: HostMessage) -> Result<()> {
        match &self.link {
            Some(link) => link.send(message),
            None => Err(Error::NotConnected(self.key.to_string())),
        }
    }

    /// Ask the process for its interface. Deferred until `Ready`.
    pub fn describe(&mut self) -> Result<()> {
        match self.state {
            ControllerState::Ready => self.send(HostMessage::Describe),
            ControllerState::Ended => Err(Error::NotConnected(self.key.to_string())),
            _ => {
                self.describe_requested = true;
                Ok(())
            }
        }
    }

    /// Request a new instance. Queued until `Ready`.
    pub fn allocate(&mut self, context: AllocationContext) -> Result<AllocationId> {
        if self.state == ControllerState::Ended || self.stopping {
            return Err(Error::NotConnected(self.key.to_string()));
        }
        let allocation = AllocationId(self.next_allocation);
        self.next_allocation += 1;

        if self.state == ControllerState::Ready {
            self.send(HostMessage::Allocate {
                allocation: allocation.0,
                context,
            })?;
            self.allocating.insert(allocation);
        } else {
            self.queued.push_back((allocation, context));
        }
        Ok(allocation)
    }

    /// Call `function` on a running allocation. `tid` is echoed back on
    /// every outcome for this call.
    pub fn invoke(
        &mut self,
        allocation: AllocationId,
        tid: u64,
        function: &str,
        args: Value,
    ) -> Result<()> {
        if self.state != ControllerState::Ready {
            return Err(Error::NotConnected(self.key.to_string()));
        }
        let instance = *self
            .running
            .get(&allocation)
            .ok_or(Error::UnknownAllocation(allocation.0))?;

        let process_tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1).max(1);
        self.send(HostMessage::Invoke {
            instance,
            tid: process_tid,
            function: function.to_string(),
            args,
        })?;
        self.transactions.insert(process_tid, Transaction { allocation, tid });
        Ok(())
    }

    /// Drop an allocation wherever it is. Returns the tids of calls that
    /// were still open on it.
    pub fn destroy(&mut self, allocation: AllocationId) -> Vec<u64> {
        self.queued.retain(|(a, _)| *a != allocation);
        self.allocating.remove(&allocation);
        if let Some(instance) = self.running.remove(&allocation) {
            if let Err(e) = self.send(HostMessage::Destroy { instance }) {
                warn!(service = %self.key, error = %e, "failed to send destroy");
            }
        }
        self.prompts.retain(|_, a| *a != allocation);

        let mut abandoned = Vec::new();
        self.transactions.retain(|_, t| {
            if t.allocation == allocation {
                abandoned.push(t.tid);
                false
            } else {
                true
            }
        });
        abandoned
    }

    /// Relay the user's answer to a prompt raised by one of
    /// `allocation`'s calls.
    pub fn prompt_response(
        &mut self,
        allocation: AllocationId,
        prompt: u32,
        response: Value,
    ) -> Result<()> {
        match self.prompts.get(&prompt) {
            None => return Err(Error::TransactionUnknown(prompt)),
            Some(owner) if *owner != allocation => {
                return Err(Error::PromptNotOwned {
                    prompt,
                    allocation: allocation.0,
                });
            }
            Some(_) => {}
        }
        self.prompts.remove(&prompt);
        self.send(HostMessage::PromptResponse { prompt, response })
    }

    /// Ask the process to exit, killing it if it is still there after
    /// `grace`. The final `Ended` event still arrives through the event
    /// channel.
    pub fn shutdown(&mut self, grace: Duration) {
        if self.stopping || self.state == ControllerState::Ended {
            return;
        }
        self.stopping = true;
        if let Some(link) = self.link.as_mut() {
            let grace = match link.send(HostMessage::Shutdown) {
                Ok(()) => grace,
                Err(e) => {
                    debug!(service = %self.key, error = %e, "shutdown not delivered, killing now");
                    Duration::ZERO
                }
            };
            link.kill(grace);
        }
        info!(service = %self.key, "stopping service process");
    }

    /// Apply one event from the process.
    pub fn handle(&mut self, event: ProcessEvent) -> Vec<ControllerOutcome> {
        match event {
            ProcessEvent::Ended(reason) => vec![self.on_ended(reason)],
            ProcessEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_message(&mut self, message: ServiceMessage) -> Vec<ControllerOutcome> {
        if self.state == ControllerState::Ended {
            return Vec::new();
        }

        if let ServiceMessage::Initialized {
            service,
            version,
            api_version,
        } = message
        {
            if self.state != ControllerState::Initializing {
                warn!(service = %self.key, "duplicate handshake ignored");
                return Vec::new();
            }
            return self.on_ready(service, version, api_version);
        }

        if self.state != ControllerState::Ready {
            warn!(service = %self.key, ?message, "message before handshake, dropping");
            return Vec::new();
        }

        match message {
            ServiceMessage::Initialized { .. } => Vec::new(),
            ServiceMessage::Described { interface } => {
                match ServiceDescription::from_json(interface) {
                    Ok(description) => vec![ControllerOutcome::Described(description)],
                    Err(e) => vec![ControllerOutcome::DescribeFailed(e.to_string())],
                }
            }
            ServiceMessage::Allocated { allocation, instance } => {
                let allocation = AllocationId(allocation);
                if self.allocating.remove(&allocation) {
                    self.running.insert(allocation, instance);
                    vec![ControllerOutcome::Allocated(allocation)]
                } else {
                    // Destroyed while the allocation was in flight.
                    let _ = self.send(HostMessage::Destroy { instance });
                    Vec::new()
                }
            }
            ServiceMessage::InvokeResult { tid, result } => match self.close_transaction(tid) {
                Some(t) => vec![ControllerOutcome::InvokeResult {
                    allocation: t.allocation,
                    tid: t.tid,
                    result,
                }],
                None => Vec::new(),
            },
            ServiceMessage::InvokeError {
                tid,
                code,
                message,
            } => match self.close_transaction(tid) {
                Some(t) => vec![ControllerOutcome::InvokeError {
                    allocation: t.allocation,
                    tid: t.tid,
                    code,
                    message,
                }],
                None => Vec::new(),
            },
            ServiceMessage::Callback { tid, callback, params } => match self.open_transaction(tid) {
                Some(t) => vec![ControllerOutcome::Callback {
                    allocation: t.allocation,
                    tid: t.tid,
                    callback,
                    params,
                }],
                None => Vec::new(),
            },
            ServiceMessage::Prompt {
                tid,
                prompt,
                dialog,
                args,
            } => match self.open_transaction(tid) {
                Some(t) => {
                    self.prompts.insert(prompt, t.allocation);
                    vec![ControllerOutcome::Prompt {
                        allocation: t.allocation,
                        tid: t.tid,
                        prompt,
                        dialog,
                        args,
                    }]
                }
                None => Vec::new(),
            },
        }
    }

    fn on_ready(
        &mut self,
        service: String,
        version: String,
        api_version: u32,
    ) -> Vec<ControllerOutcome> {
        self.state = ControllerState::Ready;
        self.reached_ready = true;
        if service != self.key.name || version != self.key.version {
            warn!(
                expected = %self.key,
                reported = %format!("{service}/{version}"),
                "service reported a different identity"
            );
        }
        info!(service = %self.key, api_version, "service process ready");

        if std::mem::take(&mut self.describe_requested) {
            if let Err(e) = self.send(HostMessage::Describe) {
                warn!(service = %self.key, error = %e, "failed to send describe");
            }
        }
        // A failed send leaves the allocation in flight; the process is
        // about to end and Ended will report it.
        while let Some((allocation, context)) = self.queued.pop_front() {
            if let Err(e) = self.send(HostMessage::Allocate {
                allocation: allocation.0,
                context,
            }) {
                warn!(service = %self.key, error = %e, "failed to send queued allocation");
            }
            self.allocating.insert(allocation);
        }

        vec![ControllerOutcome::Ready {
            service,
            version,
            api_version,
        }]
    }

    fn on_ended(&mut self, reason: ExitReason) -> ControllerOutcome {
        let was_stopping = self.stopping;
        self.state = ControllerState::Ended;
        self.link = None;

        let mut failed: Vec<AllocationId> = self.queued.drain(..).map(|(a, _)| a).collect();
        failed.extend(std::mem::take(&mut self.allocating));
        failed.extend(std::mem::take(&mut self.running).into_keys());
        failed.sort();

        let mut abandoned: Vec<(AllocationId, u64)> = self
            .transactions
            .drain()
            .map(|(_, t)| (t.allocation, t.tid))
            .collect();
        abandoned.sort();
        self.prompts.clear();

        if was_stopping {
            debug!(service = %self.key, %reason, "service process stopped");
        } else if self.reached_ready {
            warn!(
                service = %self.key,
                %reason,
                instances = failed.len(),
                "service process crashed"
            );
        } else {
            warn!(service = %self.key, %reason, "service process ended before becoming ready");
        }

        ControllerOutcome::Ended {
            reached_ready: self.reached_ready,
            reason,
            failed,
            abandoned,
        }
    }

    fn close_transaction(&mut self, process_tid: u32) -> Option<Transaction> {
        let found = self.transactions.remove(&process_tid);
        if found.is_none() {
            self.warn_unknown(process_tid);
        }
        found
    }

    fn open_transaction(&self, process_tid: u32) -> Option<Transaction> {
        let found = self.transactions.get(&process_tid).copied();
        if found.is_none() {
            self.warn_unknown(process_tid);
        }
        found
    }

    fn warn_unknown(&self, process_tid: u32) {
        let err = Error::TransactionUnknown(process_tid);
        warn!(service = %self.key, tid = process_tid, "{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<HostMessage>>>,
        kills: Arc<Mutex<Vec<Duration>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<HostMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn kills(&self) -> Vec<Duration> {
            self.kills.lock().unwrap().clone()
        }
    }

    struct RecordingLink(Recorder);

    impl ServiceLink for RecordingLink {
        fn send(&self, message: HostMessage) -> Result<()> {
            self.0.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn kill(&mut self, grace: Duration) {
            self.0.kills.lock().unwrap().push(grace);
        }
    }

    struct RecordingHost(Recorder);

    impl ProcessHost for RecordingHost {
        fn spawn(
            &self,
            _controller: ControllerId,
            _request: &SpawnRequest,
            _events: mpsc::UnboundedSender<RunnerEvent>,
        ) -> Result<Box<dyn ServiceLink>> {
            Ok(Box::new(RecordingLink(self.0.clone())))
        }
    }

    fn started() -> (Controller, Recorder) {
        let recorder = Recorder::default();
        let mut ctl = Controller::new(ControllerId(1), ServiceKey::new("Echo", "1.0.0"));
        let (tx, _rx) = mpsc::unbounded_channel();
        ctl.start(&RecordingHost(recorder.clone()), &SpawnRequest::new("/svc/Echo/1.0.0"), tx)
            .unwrap();
        (ctl, recorder)
    }

    fn msg(value: Value) -> ProcessEvent {
        ProcessEvent::Message(serde_json::from_value(value).unwrap())
    }

    fn handshake() -> ProcessEvent {
        msg(json!({
            "type": "initialized", "service": "Echo", "version": "1.0.0", "api_version": 5
        }))
    }

    fn ready_with_instance() -> (Controller, Recorder, AllocationId) {
        let (mut ctl, rec) = started();
        ctl.handle(handshake());
        let a = ctl.allocate(AllocationContext::default()).unwrap();
        ctl.handle(msg(json!({ "type": "allocated", "allocation": a.0, "instance": 40 })));
        rec.take();
        (ctl, rec, a)
    }

    #[test]
    fn test_allocations_queue_until_ready() {
        let (mut ctl, rec) = started();
        assert_eq!(ctl.state(), ControllerState::Initializing);

        let a1 = ctl.allocate(AllocationContext::default()).unwrap();
        let a2 = ctl.allocate(AllocationContext::default()).unwrap();
        ctl.describe().unwrap();
        assert!(rec.take().is_empty());

        let out = ctl.handle(handshake());
        assert!(matches!(out.as_slice(), [ControllerOutcome::Ready { api_version: 5, .. }]));
        let sent = rec.take();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], HostMessage::Describe);
        assert!(matches!(sent[1], HostMessage::Allocate { allocation, .. } if allocation == a1.0));
        assert!(matches!(sent[2], HostMessage::Allocate { allocation, .. } if allocation == a2.0));

        let out = ctl.handle(msg(json!({
            "type": "allocated", "allocation": a2.0, "instance": 7
        })));
        assert_eq!(out, vec![ControllerOutcome::Allocated(a2)]);
        assert!(ctl.is_running(a2));
        assert!(!ctl.is_running(a1));
    }

    #[test]
    fn test_invoke_maps_process_tid_back() {
        let (mut ctl, rec, a) = ready_with_instance();

        ctl.invoke(a, 900, "echo", json!({ "text": "hi" })).unwrap();
        let HostMessage::Invoke { instance, tid, .. } = rec.take().remove(0) else {
            panic!("expected invoke");
        };
        assert_eq!(instance, 40);

        let out = ctl.handle(msg(json!({ "type": "invoke_result", "tid": tid, "result": "hi" })));
        assert_eq!(
            out,
            vec![ControllerOutcome::InvokeResult {
                allocation: a,
                tid: 900,
                result: json!("hi")
            }]
        );

        // Second delivery for the same tid is stale.
        let out = ctl.handle(msg(json!({
            "type": "invoke_result", "tid": tid, "result": "again"
        })));
        assert!(out.is_empty());
    }

    #[test]
    fn test_callback_keeps_transaction_open() {
        let (mut ctl, rec, a) = ready_with_instance();
        ctl.invoke(a, 5, "stream", json!({})).unwrap();
        let HostMessage::Invoke { tid, .. } = rec.take().remove(0) else {
            panic!("expected invoke");
        };

        for n in 0..2 {
            let out = ctl.handle(msg(json!({
                "type": "callback", "tid": tid, "callback": 3, "params": n
            })));
            assert!(matches!(
                out.as_slice(),
                [ControllerOutcome::Callback { tid: 5, callback: 3, .. }]
            ));
        }
        let out = ctl.handle(msg(json!({
            "type": "invoke_error", "tid": tid, "code": "x", "message": "y"
        })));
        assert!(matches!(out.as_slice(), [ControllerOutcome::InvokeError { tid: 5, .. }]));
    }

    #[test]
    fn test_prompt_response_relayed_once() {
        let (mut ctl, rec, a) = ready_with_instance();
        ctl.invoke(a, 1, "ask", json!({})).unwrap();
        let HostMessage::Invoke { tid, .. } = rec.take().remove(0) else {
            panic!("expected invoke");
        };
        let out = ctl.handle(msg(json!({
            "type": "prompt", "tid": tid, "prompt": 12, "dialog": "/ui/confirm.html", "args": {}
        })));
        assert!(matches!(out.as_slice(), [ControllerOutcome::Prompt { prompt: 12, .. }]));

        ctl.prompt_response(a, 12, json!(true)).unwrap();
        assert_eq!(
            rec.take(),
            vec![HostMessage::PromptResponse {
                prompt: 12,
                response: json!(true)
            }]
        );
        assert!(matches!(
            ctl.prompt_response(a, 12, json!(true)),
            Err(Error::TransactionUnknown(12))
        ));
    }

    #[test]
    fn test_prompt_response_from_other_allocation_rejected() {
        let (mut ctl, rec, owner) = ready_with_instance();
        let other = ctl.allocate(AllocationContext::default()).unwrap();
        ctl.handle(msg(json!({ "type": "allocated", "allocation": other.0, "instance": 41 })));
        ctl.invoke(owner, 1, "ask", json!({})).unwrap();
        let HostMessage::Invoke { tid, .. } = rec.take().pop().unwrap() else {
            panic!("expected invoke");
        };
        ctl.handle(msg(json!({
            "type": "prompt", "tid": tid, "prompt": 12, "dialog": "/ui/confirm.html", "args": {}
        })));

        let err = ctl.prompt_response(other, 12, json!(true)).unwrap_err();

        assert!(matches!(
            err,
            Error::PromptNotOwned { prompt: 12, allocation } if allocation == other.0
        ));
        assert!(rec.take().is_empty());
        ctl.prompt_response(owner, 12, json!(false)).unwrap();
    }

    #[test]
    fn test_shutdown_gives_process_grace_before_kill() {
        let (mut ctl, rec, _a) = ready_with_instance();

        ctl.shutdown(Duration::from_millis(250));
        ctl.shutdown(Duration::from_millis(250));

        assert_eq!(rec.take(), vec![HostMessage::Shutdown]);
        assert_eq!(rec.kills(), vec![Duration::from_millis(250)]);
        assert!(!ctl.is_alive());
    }

    #[test]
    fn test_end_before_ready_fails_queued() {
        let (mut ctl, _rec) = started();
        let a = ctl.allocate(AllocationContext::default()).unwrap();

        let out = ctl.handle(ProcessEvent::Ended(ExitReason::Exited(Some(1))));

        assert_eq!(
            out,
            vec![ControllerOutcome::Ended {
                reached_ready: false,
                reason: ExitReason::Exited(Some(1)),
                failed: vec![a],
                abandoned: vec![],
            }]
        );
        assert_eq!(ctl.state(), ControllerState::Ended);
        assert!(matches!(ctl.allocate(AllocationContext::default()), Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_crash_fails_running_and_open_calls() {
        let (mut ctl, _rec, a) = ready_with_instance();
        ctl.invoke(a, 77, "echo", json!({})).unwrap();

        let out = ctl.handle(ProcessEvent::Ended(ExitReason::Exited(None)));

        assert_eq!(
            out,
            vec![ControllerOutcome::Ended {
                reached_ready: true,
                reason: ExitReason::Exited(None),
                failed: vec![a],
                abandoned: vec![(a, 77)],
            }]
        );
        assert_eq!(ctl.instance_count(), 0);
        let late = ServiceMessage::InvokeResult {
            tid: 1,
            result: Value::Null,
        };
        assert!(ctl.handle(ProcessEvent::Message(late)).is_empty());
    }

    #[test]
    fn test_destroy_while_allocating_frees_late_instance() {
        let (mut ctl, rec) = started();
        ctl.handle(handshake());
        let a = ctl.allocate(AllocationContext::default()).unwrap();
        assert!(ctl.destroy(a).is_empty());
        rec.take();

        let out = ctl.handle(msg(json!({ "type": "allocated", "allocation": a.0, "instance": 3 })));
        assert!(out.is_empty());
        assert_eq!(rec.take(), vec![HostMessage::Destroy { instance: 3 }]);
    }

    #[test]
    fn test_destroy_returns_open_tids() {
        let (mut ctl, rec, a) = ready_with_instance();
        ctl.invoke(a, 10, "slow", json!({})).unwrap();
        rec.take();

        assert_eq!(ctl.destroy(a), vec![10]);
        assert_eq!(rec.take(), vec![HostMessage::Destroy { instance: 40 }]);
        assert_eq!(ctl.instance_count(), 0);
    }

    #[test]
    fn test_messages_before_handshake_are_dropped() {
        let (mut ctl, _rec) = started();
        let out = ctl.handle(msg(json!({ "type": "described", "interface": {} })));
        assert!(out.is_empty());
        assert_eq!(ctl.state(), ControllerState::Initializing);
    }

    #[test]
    fn test_described_outcome() {
        let (mut ctl, _rec) = started();
        ctl.handle(handshake());
        let out = ctl.handle(msg(json!({
            "type": "described",
            "interface": { "name": "Echo", "version": "1.0.0", "functions": [] }
        })));
        assert!(matches!(out.as_slice(), [ControllerOutcome::Described(d)] if d.name == "Echo"));

        let out = ctl.handle(msg(json!({ "type": "described", "interface": [] })));
        assert!(matches!(out.as_slice(), [ControllerOutcome::DescribeFailed(_)]));
    }
}
