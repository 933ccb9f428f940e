//! Async driver for the transmission engine
//!
//! [`ProtocolTask`] owns the [`Engine`] and is the only code that touches it.
//! It waits on three things at once: radio events from the PAL, commands
//! from [`ProtocolHandle`]s and a periodic tick that advances the engine's
//! timers and routing analysis.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use zwave_transport::{Engine, RadioEventReceiver, TxCallback, TxHandle, TxReport, TxRequest};

/// Engine tick period
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

const COMMAND_QUEUE: usize = 32;

enum Command {
    Submit {
        request: TxRequest,
        accepted: oneshot::Sender<zwave_transport::Result<TxHandle>>,
        done: oneshot::Sender<TxReport>,
    },
    Cancel {
        handle: TxHandle,
        reply: oneshot::Sender<zwave_transport::Result<()>>,
    },
    Persist {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

pub struct ProtocolTask {
    engine: Engine,
    events: RadioEventReceiver,
    commands: mpsc::Receiver<Command>,
    tick: Duration,
}

impl ProtocolTask {
    pub fn new(engine: Engine, events: RadioEventReceiver) -> (Self, ProtocolHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = ProtocolTask {
            engine,
            events,
            commands: rx,
            tick: DEFAULT_TICK,
        };
        (task, ProtocolHandle { tx })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until shutdown; routing state is persisted and the engine handed back
    pub async fn run(mut self) -> Engine {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Protocol task running, node {}", self.engine.own_id());

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        let now = Instant::now();
                        self.engine.handle_event(event, now);
                        self.engine.pump_events(&mut self.events, now);
                    }
                    None => {
                        warn!("Radio event channel closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
                _ = ticker.tick() => self.engine.tick(Instant::now()),
            }
        }

        let written = self.engine.persist();
        info!("Protocol task stopped, {} route cache records written", written);
        self.engine
    }

    fn execute(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Submit {
                request,
                accepted,
                done,
            } => {
                let callback: TxCallback = Box::new(move |report: TxReport| {
                    // The submitter may have stopped waiting
                    let _ = done.send(report);
                });
                let result = self.engine.submit(request, Some(callback), now);
                if let Err(e) = &result {
                    debug!("Submit rejected: {}", e);
                }
                let _ = accepted.send(result);
            }
            Command::Cancel { handle, reply } => {
                let _ = reply.send(self.engine.cancel(handle));
            }
            Command::Persist { reply } => {
                let _ = reply.send(self.engine.persist());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle for talking to a running [`ProtocolTask`]
#[derive(Clone)]
pub struct ProtocolHandle {
    tx: mpsc::Sender<Command>,
}

impl ProtocolHandle {
    /// Queue a frame; returns its handle and a receiver for the final report
    pub async fn enqueue(
        &self,
        request: TxRequest,
    ) -> Result<(TxHandle, oneshot::Receiver<TxReport>)> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Submit {
            request,
            accepted: accepted_tx,
            done: done_tx,
        })
        .await?;
        let handle = accepted_rx
            .await
            .context("Protocol task dropped the request")?
            .context("Frame rejected")?;
        Ok((handle, done_rx))
    }

    /// Queue a frame and wait for its final report
    pub async fn submit(&self, request: TxRequest) -> Result<TxReport> {
        let (_, done) = self.enqueue(request).await?;
        done.await.context("Protocol task stopped before the frame completed")
    }

    pub async fn cancel(&self, handle: TxHandle) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { handle, reply }).await?;
        rx.await.context("Protocol task stopped")?.context("Cancel failed")
    }

    /// Flush routing state now; returns route cache records written
    pub async fn persist(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Persist { reply }).await?;
        rx.await.context("Protocol task stopped")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("Protocol task is not running"))
    }
}
