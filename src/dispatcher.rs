//! The receiver: owns the bus adapter, the FSM registry, and the counters,
//! and is the single task that ever touches any of them (spec.md §5).
//! Every external occurrence becomes a [`DispatcherMsg`] drained off one
//! channel by [`Dispatcher::run`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use crate::bus::BusAdapter;
use crate::clock::Clock;
use crate::config::Configuration;
use crate::events::{CommandState, Event};
use crate::messages::{DispatcherHandle, DispatcherMsg};
use crate::metrics::Counters;
use crate::supervisor::{spawn_and_await, ProcessRun, SpawnError};
use crate::target::TargetResolver;
use crate::voting::{should_fold, Action, VotingState};

/// Everything needed to spawn the child once this request wins the
/// showdown, kept alongside the [`VotingState`] under the same registry
/// key so `on_showdown` can find both.
#[derive(Debug, Clone)]
struct PendingRequest {
    target: String,
    command: String,
    arguments: Vec<String>,
    /// The tracking id as it appeared on the wire, if any — distinct from
    /// the registry key, which is always populated (see `registry_key_for`).
    public_tracking_id: Option<String>,
}

pub struct Dispatcher {
    configuration: Configuration,
    bus: Arc<dyn BusAdapter>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    target_resolver: TargetResolver,
    registry: HashMap<String, VotingState>,
    pending: HashMap<String, PendingRequest>,
    handle: DispatcherHandle,
    receiver: UnboundedReceiver<DispatcherMsg>,
}

impl Dispatcher {
    pub fn new(
        configuration: Configuration,
        bus: Arc<dyn BusAdapter>,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        let (handle, receiver) = mpsc::unbounded_channel();
        let target_resolver = TargetResolver::new(configuration.targets_directory.clone());
        Self {
            configuration,
            bus,
            clock,
            counters,
            target_resolver,
            registry: HashMap::new(),
            pending: HashMap::new(),
            handle,
            receiver,
        }
    }

    /// A cheaply-cloneable sender into this dispatcher's inbox. Given to
    /// the bus adapter on subscribe, to the connection manager, and to
    /// signal handlers that need to request a shutdown.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn start(&self) {
        tracing::info!(
            hostname = %self.configuration.hostname,
            targets = self.configuration.allowed_targets.len(),
            "dispatcher starting"
        );
    }

    /// Drains the inbox until a [`DispatcherMsg::Stop`] is received.
    /// Outstanding FSMs are simply dropped with the registry; their
    /// showdown timers become no-ops because the channel they'd send to
    /// is gone by the time they'd fire, or the dispatcher has exited the
    /// loop and stops reading it.
    pub async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                DispatcherMsg::Bus { target, raw } => self.on_event(target, raw).await,
                DispatcherMsg::Showdown { tracking_id } => self.on_showdown(tracking_id).await,
                DispatcherMsg::ProcessOutcome {
                    tracking_id,
                    target,
                    command,
                    readable_command,
                    result,
                } => {
                    self.on_process_outcome(tracking_id, target, command, readable_command, result)
                        .await
                }
                DispatcherMsg::Connected => self.on_connected().await,
                DispatcherMsg::Stop => break,
            }
        }
        tracing::info!("dispatcher stopped");
    }

    /// Subscribes to every allowed target in ascending lexicographic
    /// order and exits the process if the set is empty (spec.md §4.D).
    async fn on_connected(&mut self) {
        if self.configuration.allowed_targets.is_empty() {
            tracing::error!("no allowed targets configured at connect time; exiting");
            std::process::exit(1);
        }

        for target in self.configuration.allowed_targets.clone() {
            if let Err(err) = self.bus.subscribe(&target, self.handle.clone()).await {
                tracing::error!(%target, %err, "failed to subscribe to target");
            }
        }
    }

    async fn on_event(&mut self, target: String, raw: Value) {
        match Event::decode(target, &raw) {
            Ok(Event::Vote {
                tracking_id,
                vote_value,
                ..
            }) => self.on_vote(tracking_id, vote_value).await,
            Ok(Event::Request {
                target,
                command,
                arguments,
                tracking_id,
            }) => self.handle_request(target, command, arguments, tracking_id).await,
            Ok(other) => tracing::debug!(%other, "received event"),
            Err(err) => tracing::warn!(%err, "dropping malformed event"),
        }
    }

    /// Looks up the FSM by `tracking_id`; an absent entry means the vote
    /// arrived after this agent already reached Finish (S6) or refers to
    /// a tracking id this agent never saw a Request for — both are logged
    /// and dropped silently, per spec.md §4.B/§4.D.
    async fn on_vote(&mut self, tracking_id: String, vote_value: String) {
        let Some(fsm) = self.registry.get_mut(&tracking_id) else {
            tracing::debug!(%tracking_id, "vote for unknown or already-finished request");
            return;
        };

        let action = if should_fold(fsm.own_vote(), &vote_value) {
            fsm.fold()
        } else {
            fsm.call()
        };

        if action == Action::Cleanup {
            self.registry.remove(&tracking_id);
            self.pending.remove(&tracking_id);
        }
    }

    /// Creates an FSM for this request, broadcasts our vote, and schedules
    /// the showdown. A duplicate `tracking_id` overwrites the previous
    /// entry (spec.md §4.D reference policy: duplicates are bus replay,
    /// not distinct requests).
    async fn handle_request(
        &mut self,
        target: String,
        command: String,
        arguments: Vec<String>,
        public_tracking_id: Option<String>,
    ) {
        let registry_key = public_tracking_id
            .clone()
            .unwrap_or_else(|| format!("untracked-{}", Uuid::new_v4()));

        self.registry.remove(&registry_key);
        self.pending.remove(&registry_key);

        let own_vote = Uuid::new_v4().simple().to_string();
        let (fsm, action) = VotingState::create(registry_key.clone(), own_vote.clone());
        debug_assert_eq!(action, Action::BroadcastVote);

        if let Err(err) = self
            .bus
            .send_direct_event(&target, &registry_key, &own_vote)
            .await
        {
            tracing::warn!(%target, %err, "failed to broadcast vote");
        }

        self.registry.insert(registry_key.clone(), fsm);
        self.pending.insert(
            registry_key.clone(),
            PendingRequest {
                target,
                command,
                arguments,
                public_tracking_id,
            },
        );

        let handle = self.handle.clone();
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            clock.sleep(Duration::from_secs(10)).await;
            let _ = handle.send(DispatcherMsg::Showdown {
                tracking_id: registry_key,
            });
        });
    }

    /// The showdown timer fired. A missing registry entry means we already
    /// folded (spec.md §4.B "late showdown" is then handled by the FSM's
    /// own idempotent Finish state having already been removed).
    async fn on_showdown(&mut self, registry_key: String) {
        let Some(fsm) = self.registry.get_mut(&registry_key) else {
            return;
        };

        if fsm.showdown() != Action::Spawn {
            return;
        }

        let Some(request) = self.pending.get(&registry_key).cloned() else {
            self.finish(&registry_key);
            return;
        };

        self.perform_request(request).await;
        self.finish(&registry_key);
    }

    /// Publishes `started` unconditionally, then resolves the target
    /// directory and spawns the child in the background. Matches the
    /// original's `perform_request`, which calls `publish_start` before
    /// `get_target_directory` (which raises for an unknown target) — so an
    /// unresolvable target still produces `started` followed by `failed`
    /// (spec.md §8 S3), rather than only `failed`. Any failure before the
    /// spawn itself publishes `failed` directly and never raises (spec.md
    /// §4.D).
    async fn perform_request(&mut self, request: PendingRequest) {
        let hostname = self.configuration.hostname.clone();
        let arguments_repr = python_list_repr(&request.arguments);
        let started_message = format!(
            "({hostname}) target[{}] request: command=\"{}\", arguments={arguments_repr}",
            request.target, request.command
        );
        self.publish_outcome(
            &request.target,
            &request.command,
            CommandState::Started,
            &started_message,
            request.public_tracking_id.as_deref(),
        )
        .await;

        let target_dir = match self.target_resolver.resolve(&request.target) {
            Ok(dir) => dir,
            Err(err) => {
                let message = format!(
                    "target directory for target \"{}\" could not be resolved: {err}",
                    request.target
                );
                self.publish_outcome(
                    &request.target,
                    &request.command,
                    CommandState::Failed,
                    &message,
                    request.public_tracking_id.as_deref(),
                )
                .await;
                self.counters
                    .increment(&format!("commands_failed.{}", request.target));
                return;
            }
        };

        let readable_command = ProcessRun::readable(
            &self.configuration.interpreter_command,
            &self.configuration.script_to_execute,
            &request.arguments,
        );
        let run = ProcessRun::new(
            hostname,
            request.target.clone(),
            readable_command.clone(),
            request.public_tracking_id.clone(),
        );

        tracing::info!(
            "({}) target[{}] executing \"{}\"",
            run.host,
            run.target,
            run.readable_command
        );

        spawn_and_track(
            self.handle.clone(),
            target_dir,
            self.configuration.interpreter_command.clone(),
            self.configuration.script_to_execute.clone(),
            request,
        );
    }

    /// Transitions the FSM's remaining `Spawning` state to `Finish` and
    /// drops it from both maps, matching `VotingState::spawned`'s
    /// `Action::Cleanup`.
    fn finish(&mut self, registry_key: &str) {
        if let Some(fsm) = self.registry.get_mut(registry_key) {
            fsm.spawned();
        }
        self.registry.remove(registry_key);
        self.pending.remove(registry_key);
    }

    async fn on_process_outcome(
        &mut self,
        tracking_id: Option<String>,
        target: String,
        command: String,
        readable_command: String,
        result: Result<crate::supervisor::Outcome, SpawnError>,
    ) {
        let hostname = self.configuration.hostname.clone();
        match result {
            Ok(crate::supervisor::Outcome::Finished) => {
                let message = format!(
                    "({hostname}) target[{target}] request finished: \"{readable_command}\" succeeded."
                );
                tracing::info!("{message}");
                self.publish_outcome(
                    &target,
                    &command,
                    CommandState::Finished,
                    &message,
                    tracking_id.as_deref(),
                )
                .await;
                self.counters.increment(&format!("commands_succeeded.{target}"));
            }
            Ok(crate::supervisor::Outcome::Failed { message, code }) => {
                tracing::warn!(
                    "({hostname}) target[{target}] request \"{readable_command}\" failed: return code was {code}."
                );
                self.publish_outcome(
                    &target,
                    &command,
                    CommandState::Failed,
                    &message,
                    tracking_id.as_deref(),
                )
                .await;
                self.counters.increment(&format!("commands_failed.{target}"));
            }
            Err(spawn_err) => {
                let message = spawn_err.kind_and_text();
                tracing::error!(%spawn_err, "{hostname} target[{target}] could not spawn \"{readable_command}\"");
                self.publish_outcome(
                    &target,
                    &command,
                    CommandState::Failed,
                    &message,
                    tracking_id.as_deref(),
                )
                .await;
                self.counters.increment(&format!("commands_failed.{target}"));
            }
        }
    }

    async fn publish_outcome(
        &self,
        target: &str,
        command: &str,
        state: CommandState,
        message: &str,
        tracking_id: Option<&str>,
    ) {
        if let Err(err) = self
            .bus
            .publish_command_outcome(target, command, state, message, tracking_id)
            .await
        {
            tracing::warn!(%target, %command, %err, "failed to publish command outcome");
        }
    }
}

/// Renders a string list the way Python's `repr(list)` would, matching the
/// original's `'%s' % (hostname, ..., arguments)` formatting in the
/// `started` event body (spec.md §8 S1: `arguments=['update', '--tracking-id=t1']`).
fn python_list_repr(items: &[String]) -> String {
    let rendered = items
        .iter()
        .map(|item| format!("'{item}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{rendered}]")
}

/// Spawns the child in a detached task and reports its outcome back
/// through the dispatcher's own inbox, so the result is processed on the
/// single dispatch loop like everything else.
fn spawn_and_track(
    handle: DispatcherHandle,
    cwd: PathBuf,
    interpreter_command: String,
    script_to_execute: String,
    request: PendingRequest,
) {
    let readable_command =
        ProcessRun::readable(&interpreter_command, &script_to_execute, &request.arguments);
    tokio::spawn(async move {
        let result = spawn_and_await(
            &cwd,
            &interpreter_command,
            &script_to_execute,
            &request.arguments,
        )
        .await;
        let _ = handle.send(DispatcherMsg::ProcessOutcome {
            tracking_id: request.public_tracking_id,
            target: request.target,
            command: request.command,
            readable_command,
            result,
        });
    });
}
