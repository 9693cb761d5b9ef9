//! Top-level actor driving the dispatcher and protocol engine, owning
//! lifecycle and shutdown. One task per subsystem, communication strictly
//! by message passing, no shared mutable state.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::DeviceOptions;
use crate::device::DeviceModel;
use crate::dispatcher::{self, send, startup_servo_configure_commands};
use crate::error::DispatchError;
use crate::geometry::Drawing;
use crate::protocol::{self, commands, ProtocolEngineHandle, SerialPort};

/// Messages accepted by the orchestrator.
pub enum OrchestratorCommand {
    Draw(Drawing),
    Shutdown(oneshot::Sender<()>),
}

/// A handle to the running orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    /// Requests a drawing be plotted. Rejected silently (logged by the
    /// orchestrator) if it is already Busy.
    pub async fn draw(&self, drawing: Drawing) {
        if self.tx.send(OrchestratorCommand::Draw(drawing)).await.is_err() {
            warn!("orchestrator is no longer running");
        }
    }

    /// Runs the shutdown sequence (`EM,0,0; SP,0`) and waits for it to
    /// complete before returning.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(OrchestratorCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

enum State {
    Idle,
    Busy,
}

/// Spawns the orchestrator: the protocol engine, the startup command
/// sequence, then the Idle/Busy dispatch loop.
pub fn spawn(options: DeviceOptions, port: Arc<dyn SerialPort>) -> OrchestratorHandle {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run(options, port, rx));
    OrchestratorHandle { tx }
}

async fn run(options: DeviceOptions, port: Arc<dyn SerialPort>, mut inbox: mpsc::Receiver<OrchestratorCommand>) {
    let model = options.device_model();
    let protocol = protocol::spawn(port);

    if let Err(e) = run_startup_sequence(&options, &protocol).await {
        warn!(error = %e, "startup sequence encountered an error, continuing");
    }

    let mut state = State::Idle;
    let (done_tx, mut done_rx) = mpsc::channel::<Result<(), DispatchError>>(1);
    let mut shutdown_ack = None;

    loop {
        tokio::select! {
            cmd = inbox.recv() => {
                match cmd {
                    Some(OrchestratorCommand::Draw(drawing)) => {
                        handle_draw(drawing, &options, model, &protocol, &done_tx, &mut state);
                    }
                    Some(OrchestratorCommand::Shutdown(ack)) => {
                        info!("shutdown requested");
                        shutdown_ack = Some(ack);
                        break;
                    }
                    None => {
                        info!("orchestrator inbox closed, shutting down");
                        break;
                    }
                }
            }
            result = done_rx.recv(), if matches!(state, State::Busy) => {
                match result {
                    Some(Ok(())) => info!("drawing completed"),
                    Some(Err(e)) => warn!(error = %e, "drawing failed"),
                    None => {}
                }
                state = State::Idle;
            }
        }
    }

    if let Err(e) = shutdown_sequence(&protocol).await {
        warn!(error = %e, "shutdown sequence encountered an error");
    }
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

fn handle_draw(
    drawing: Drawing,
    options: &DeviceOptions,
    model: DeviceModel,
    protocol: &ProtocolEngineHandle,
    done_tx: &mpsc::Sender<Result<(), DispatchError>>,
    state: &mut State,
) {
    match state {
        State::Busy => {
            warn!("rejecting Draw while busy");
        }
        State::Idle => {
            info!("starting drawing");
            *state = State::Busy;
            let protocol = protocol.clone();
            let options = options.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let result = dispatcher::dispatch_drawing(&drawing, &options, &model, &protocol).await;
                let _ = done_tx.send(result).await;
            });
        }
    }
}

/// `SC,4,upPos; SC,5,downPos; SC,11,upSpeed·5; SC,12,downSpeed·5; EM,1,1; SP,1`.
async fn run_startup_sequence(
    options: &DeviceOptions,
    protocol: &ProtocolEngineHandle,
) -> Result<(), DispatchError> {
    for cmd in startup_servo_configure_commands(options) {
        send(protocol, cmd).await?;
    }
    send(protocol, commands::enable_motors(1, 1)).await?;
    send(protocol, commands::set_pen(1, None, None)).await?;
    Ok(())
}

/// `EM,0,0; SP,0`.
async fn shutdown_sequence(protocol: &ProtocolEngineHandle) -> Result<(), DispatchError> {
    send(protocol, commands::enable_motors(0, 0)).await?;
    send(protocol, commands::set_pen(0, None, None)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Path, Point};
    use crate::protocol::FakePort;
    use std::time::Duration;

    #[tokio::test]
    async fn startup_sequence_writes_expected_commands() {
        let (fake, _tx) = FakePort::new();
        let handle = protocol::spawn(fake.clone());
        let options = DeviceOptions::default();

        // Startup queries time out since nothing acks them, but each is
        // still written before the engine moves to the next.
        let _ = run_startup_sequence(&options, &handle).await;

        let written = fake.written_commands().await;
        assert!(written.iter().any(|c| c.starts_with("SC,4,")));
        assert!(written.iter().any(|c| c.starts_with("SC,5,")));
        assert!(written.iter().any(|c| c == "EM,1,1\r"));
        assert!(written.iter().any(|c| c == "SP,1\r"));
    }

    #[tokio::test]
    async fn busy_orchestrator_rejects_second_draw() {
        let (fake, tx) = FakePort::new();
        let handle = spawn(DeviceOptions::default(), fake.clone());

        // Drain the startup acks so the orchestrator reaches Idle quickly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..6 {
            tx.send(b"OK\r".to_vec()).ok();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let square = Drawing::new(vec![Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
        ])]);
        handle.draw(square.clone()).await;
        handle.draw(square).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
