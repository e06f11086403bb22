//! Messenger Runtime - owns a messenger and its periodic drivers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   messenger task (actor)                     │
//! │                                                              │
//! │   Subscription ──┐                                           │
//! │   retry timer ───┤                                           │
//! │   cleanup timer ─┼──► select! ──► ReliableMessenger (&mut)   │
//! │   commands ──────┤                                           │
//! │   shutdown ──────┘                                           │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲
//!          │ mpsc / oneshot
//!   MessengerHandle
//! ```
//!
//! Both timers live inside the task, so stopping the task stops both. The
//! subscription is dropped and the transport closed before the task returns.
//!
//! # Usage
//!
//! ```ignore
//! let messenger = ReliableMessenger::new(ctx, transport, MessengerConfig::default())?;
//! let handle = MessengerRuntime::spawn(messenger)?;
//! handle.change_state("n1", NodeState::Emergency).await?;
//! let snapshot = handle.shutdown().await?;
//! ```

use healer_env::{EnvError, Envelope, EnvelopeKind, HealerContext, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::entity::{Entity, NodeState, Position};
use crate::error::HealerError;
use crate::messenger::ReliableMessenger;
use crate::metrics::MessagingMetrics;
use crate::store::ContextSnapshot;

const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Send {
        kind: EnvelopeKind,
        payload: serde_json::Value,
        reply: Reply<Result<Envelope, HealerError>>,
    },
    ChangeState {
        entity_id: String,
        state: NodeState,
        reply: Reply<Result<Envelope, HealerError>>,
    },
    ShareSnapshot {
        reply: Reply<Result<Envelope, HealerError>>,
    },
    UpdatePosition {
        entity_id: String,
        position: Position,
        reply: Reply<bool>,
    },
    Status {
        reply: Reply<MessengerStatus>,
    },
    Snapshot {
        reply: Reply<ContextSnapshot>,
    },
}

/// Point-in-time view of a running messenger
#[derive(Debug, Clone, PartialEq)]
pub struct MessengerStatus {
    pub metrics: MessagingMetrics,
    pub pending_count: usize,
    pub applied_count: usize,
    pub entities: Vec<Entity>,
}

/// Spawns messengers onto the tokio runtime.
pub struct MessengerRuntime;

impl MessengerRuntime {
    /// Subscribes to the messenger's transport and moves the messenger into
    /// its own task.
    pub fn spawn<Ctx, T>(messenger: ReliableMessenger<Ctx, T>) -> Result<MessengerHandle, HealerError>
    where
        Ctx: HealerContext,
        T: Transport,
    {
        let subscription = messenger.transport().subscribe()?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(context = %messenger.local_id(), name = %messenger.config().name, "messenger started");
        let task = tokio::spawn(run(messenger, subscription, commands_rx, shutdown_rx));

        Ok(MessengerHandle {
            commands: commands_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

async fn run<Ctx, T>(
    mut messenger: ReliableMessenger<Ctx, T>,
    mut subscription: healer_env::Subscription,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: oneshot::Receiver<()>,
) -> ContextSnapshot
where
    Ctx: HealerContext,
    T: Transport,
{
    let mut retry = interval(messenger.config().retry_interval());
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup = interval(messenger.config().cleanup_interval());
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inbound_open = true;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            command = commands.recv() => match command {
                Some(command) => dispatch(&mut messenger, command).await,
                None => break,
            },

            envelope = subscription.recv(), if inbound_open => match envelope {
                Some(envelope) => {
                    messenger.handle_incoming(envelope).await;
                }
                None => {
                    warn!(context = %messenger.local_id(), "subscription ended");
                    inbound_open = false;
                }
            },

            _ = retry.tick() => {
                let report = messenger.retry_tick().await;
                if !report.gave_up.is_empty() {
                    debug!(context = %messenger.local_id(), failed = report.gave_up.len(), "retry pass");
                }
            }

            _ = cleanup.tick() => {
                messenger.cleanup_tick();
            }
        }
    }

    drop(subscription);
    messenger.close().await;
    messenger.snapshot()
}

async fn dispatch<Ctx, T>(messenger: &mut ReliableMessenger<Ctx, T>, command: Command)
where
    Ctx: HealerContext,
    T: Transport,
{
    // A dropped reply receiver just means the caller stopped waiting
    match command {
        Command::Send { kind, payload, reply } => {
            let _ = reply.send(messenger.send(kind, payload).await);
        }
        Command::ChangeState { entity_id, state, reply } => {
            let _ = reply.send(messenger.change_state(&entity_id, state).await);
        }
        Command::ShareSnapshot { reply } => {
            let _ = reply.send(messenger.share_snapshot().await);
        }
        Command::UpdatePosition { entity_id, position, reply } => {
            let _ = reply.send(messenger.update_position(&entity_id, position));
        }
        Command::Status { reply } => {
            let _ = reply.send(MessengerStatus {
                metrics: messenger.metrics().clone(),
                pending_count: messenger.pending_count(),
                applied_count: messenger.applied_count(),
                entities: messenger.entities().to_vec(),
            });
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(messenger.snapshot());
        }
    }
}

/// Handle to a running messenger.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) still
/// stops the task, but nobody waits for it.
pub struct MessengerHandle {
    commands: mpsc::Sender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<ContextSnapshot>>,
}

impl MessengerHandle {
    async fn request<R>(&self, build: impl FnOnce(Reply<R>) -> Command) -> Result<R, HealerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| HealerError::Closed)?;
        response.await.map_err(|_| HealerError::Closed)
    }

    pub async fn send(&self, kind: EnvelopeKind, payload: serde_json::Value) -> Result<Envelope, HealerError> {
        self.request(|reply| Command::Send { kind, payload, reply }).await?
    }

    pub async fn change_state(&self, entity_id: &str, state: NodeState) -> Result<Envelope, HealerError> {
        let entity_id = entity_id.to_string();
        self.request(|reply| Command::ChangeState { entity_id, state, reply })
            .await?
    }

    pub async fn share_snapshot(&self) -> Result<Envelope, HealerError> {
        self.request(|reply| Command::ShareSnapshot { reply }).await?
    }

    pub async fn update_position(&self, entity_id: &str, position: Position) -> Result<bool, HealerError> {
        let entity_id = entity_id.to_string();
        self.request(|reply| Command::UpdatePosition { entity_id, position, reply })
            .await
    }

    pub async fn status(&self) -> Result<MessengerStatus, HealerError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn snapshot(&self) -> Result<ContextSnapshot, HealerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stops both drivers, closes the transport and waits for the task.
    /// Returns the final snapshot for persistence.
    pub async fn shutdown(mut self) -> Result<ContextSnapshot, HealerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let task = self.task.take().ok_or(HealerError::Closed)?;
        task.await
            .map_err(|e| HealerError::Transport(EnvError::ContextError(format!("messenger task failed: {}", e))))
    }
}
