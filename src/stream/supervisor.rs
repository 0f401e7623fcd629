use crate::core::errors::StreamError;
use crate::core::kernel::{ReconnectPolicy, WsCodec, WsConnection, WsSession};
use crate::core::types::{ConnectionState, Inbound};
use crate::stream::dispatcher::Dispatcher;
use crate::stream::hooks::{StateCell, StreamHooks};
use crate::stream::registry::{Registry, RegistryCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Why a connection ended.
enum SessionEnd {
    Cancelled,
    Failed(StreamError),
}

/// Background task owning the connection: connect, replay, read, back off,
/// repeat, until cancelled or out of retries.
pub(crate) struct Supervisor<S, C> {
    pub(crate) connection: WsConnection<S, C>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) hooks: StreamHooks,
    pub(crate) state: Arc<StateCell>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) reconnect: bool,
    pub(crate) ping_interval: Duration,
    pub(crate) cancel: CancellationToken,
}

impl<S: WsSession, C: WsCodec> Supervisor<S, C> {
    #[instrument(name = "stream", skip_all)]
    pub(crate) async fn run(mut self) {
        let mut commands = self.registry.attach();
        let mut attempt: u32 = 0;
        let mut was_connected = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state.transition(ConnectionState::Connecting, &self.hooks);
            let end = match self.establish(&mut commands).await {
                Ok(()) => {
                    self.state.transition(ConnectionState::Connected, &self.hooks);
                    self.hooks.emit_open();
                    if attempt > 0 && was_connected {
                        info!(attempt, "reconnected");
                        self.hooks.emit_reconnect(attempt);
                    } else {
                        info!("connected");
                    }
                    was_connected = true;
                    attempt = 0;
                    self.policy.reset();
                    self.read_loop(&mut commands).await
                }
                Err(end) => end,
            };

            // The socket is released on every exit path
            if let Err(e) = self.connection.close().await {
                debug!(error = %e, "close after session end failed");
            }

            let err = match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(err) => err,
            };
            self.hooks.emit_error(&err);

            if !self.reconnect {
                info!("reconnect disabled, closing stream");
                break;
            }

            attempt += 1;
            let Some(delay) = self.policy.next_delay() else {
                self.hooks.emit_error(&StreamError::ConnectionError(format!(
                    "giving up after {} reconnect attempts",
                    attempt - 1
                )));
                break;
            };

            self.state.transition(ConnectionState::Reconnecting, &self.hooks);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.registry.detach();
        if self.state.transition(ConnectionState::Closed, &self.hooks) {
            self.hooks.emit_close();
        }
        info!("stream closed");
    }

    /// Connect and replay every active topic. The replay finishes before the
    /// stream reports `Connected`.
    async fn establish(
        &mut self,
        commands: &mut UnboundedReceiver<RegistryCommand>,
    ) -> Result<(), SessionEnd> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SessionEnd::Cancelled),
            result = self.connection.connect() => result.map_err(SessionEnd::Failed)?,
        }

        let topics = self.registry.resync(commands);
        for topic in &topics {
            self.connection
                .subscribe(topic)
                .await
                .map_err(SessionEnd::Failed)?;
        }
        debug!(count = topics.len(), "subscriptions replayed");
        Ok(())
    }

    async fn read_loop(&mut self, commands: &mut UnboundedReceiver<RegistryCommand>) -> SessionEnd {
        let mut heartbeat = (!self.ping_interval.is_zero()).then(|| {
            let mut interval = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        // Any inbound frame since the last ping counts as liveness
        let mut heard_from_server = true;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return SessionEnd::Cancelled,

                Some(command) = commands.recv() => {
                    let result = match &command {
                        RegistryCommand::Subscribe(topic) => self.connection.subscribe(topic).await,
                        RegistryCommand::Unsubscribe(topic) => self.connection.unsubscribe(topic).await,
                    };
                    if let Err(e) = result {
                        return SessionEnd::Failed(e);
                    }
                }

                () = next_tick(&mut heartbeat) => {
                    if !heard_from_server {
                        return SessionEnd::Failed(StreamError::TransportError(
                            "heartbeat timeout".to_string(),
                        ));
                    }
                    heard_from_server = false;
                    if let Err(e) = self.connection.ping().await {
                        return SessionEnd::Failed(e);
                    }
                    trace!("ping sent");
                }

                inbound = self.connection.next_inbound() => {
                    match inbound {
                        None => {
                            return SessionEnd::Failed(StreamError::ConnectionError(
                                "connection closed by server".to_string(),
                            ));
                        }
                        Some(Err(e)) if e.is_disconnect() => return SessionEnd::Failed(e),
                        Some(Err(e)) => {
                            // Malformed frame: report and keep reading
                            heard_from_server = true;
                            self.hooks.emit_error(&e);
                        }
                        Some(Ok(inbound)) => {
                            heard_from_server = true;
                            if self.cancel.is_cancelled() {
                                return SessionEnd::Cancelled;
                            }
                            self.handle_inbound(inbound);
                        }
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Data(message) => {
                self.dispatcher.dispatch(&message);
            }
            Inbound::Heartbeat => trace!("pong"),
            Inbound::Ack => debug!("subscription acknowledged"),
            Inbound::ServerError(message) => {
                self.hooks.emit_error(&StreamError::ServerError(message));
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
