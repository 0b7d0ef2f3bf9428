//! Operation controller.
//!
//! Owns the coordinator, turns UI commands into coordinator calls, launches the
//! processes it dispatches and routes their events back to it.

use super::coordinator::{Dispatch, OperationCoordinator, WorkerMessage};
use crate::engine::{ProcessRunner, RunnerEvent};
use crate::model::{Credentials, EngineEvent, Severity};
use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Connect(Credentials),
    Disconnect,
    Transfer {
        local_path: PathBuf,
        remote_script: String,
    },
    TransferThenExecute {
        local_path: PathBuf,
        remote_script: String,
        bundle_path: String,
    },
    ExecuteOnly {
        remote_script: String,
        bundle_path: String,
    },
    ListBundles,
    Download {
        save_path: Option<PathBuf>,
    },
    SetFilter(String),
    #[cfg(feature = "tui")]
    SetVerbose(bool),
    Quit,
}

/// Launch one dispatched process, tagging everything it reports with the dispatch id.
fn spawn_runner(dispatch: Dispatch, worker_tx: UnboundedSender<WorkerMessage>) {
    let Dispatch {
        id,
        command,
        track_progress,
        ..
    } = dispatch;
    let runner = ProcessRunner::new(command.line, track_progress);
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunnerEvent>();
        let forward = async {
            while let Some(event) = rx.recv().await {
                if worker_tx.send(WorkerMessage { id, event }).is_err() {
                    break;
                }
            }
        };
        tokio::join!(runner.run(tx), forward);
    });
}

/// Apply a UI command. Rejections are already reported as events by the coordinator.
fn apply(coordinator: &mut OperationCoordinator, cmd: UiCommand) -> Option<Dispatch> {
    match cmd {
        UiCommand::Connect(creds) => coordinator.connect(creds).ok(),
        UiCommand::Disconnect => {
            let _ = coordinator.disconnect();
            None
        }
        UiCommand::Transfer {
            local_path,
            remote_script,
        } => coordinator.transfer(local_path, remote_script).ok(),
        UiCommand::TransferThenExecute {
            local_path,
            remote_script,
            bundle_path,
        } => coordinator
            .transfer_then_execute(local_path, remote_script, bundle_path)
            .ok(),
        UiCommand::ExecuteOnly {
            remote_script,
            bundle_path,
        } => coordinator.execute_only(remote_script, bundle_path).ok(),
        UiCommand::ListBundles => coordinator.list_bundles().ok(),
        UiCommand::Download { save_path } => coordinator.download(save_path).ok(),
        UiCommand::SetFilter(text) => {
            coordinator.set_filter(text);
            None
        }
        #[cfg(feature = "tui")]
        UiCommand::SetVerbose(verbose) => {
            coordinator.set_verbose(verbose);
            None
        }
        UiCommand::Quit => None,
    }
}

/// Drive the coordinator from UI commands until quit, emitting events back to presentation layers.
pub(crate) async fn run_controller(
    mut coordinator: OperationCoordinator,
    event_tx: UnboundedSender<EngineEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let mut quit_pending = false;
    coordinator.publish_snapshot();

    loop {
        tokio::select! {
            cmd = async {
                // Stop listening once quitting; a closed channel would otherwise spin.
                if quit_pending {
                    futures::future::pending().await
                } else {
                    cmd_rx.recv().await
                }
            } => {
                match cmd {
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the running process; there is no mid-flight cancel.
                        quit_pending = true;
                        match coordinator.snapshot().busy {
                            Some(op) => {
                                let _ = event_tx.send(EngineEvent::log(
                                    format!("Waiting for {op} to finish before quitting…"),
                                    Severity::Info,
                                ));
                            }
                            None => break,
                        }
                    }
                    Some(cmd) => {
                        if let Some(dispatch) = apply(&mut coordinator, cmd) {
                            spawn_runner(dispatch, worker_tx.clone());
                        }
                    }
                }
            }
            Some(msg) = worker_rx.recv() => {
                if let Some(next) = coordinator.handle_worker(msg) {
                    spawn_runner(next, worker_tx.clone());
                }
                if quit_pending && !coordinator.is_busy() {
                    break;
                }
            }
        }
    }

    tracing::debug!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCapabilities;
    use crate::orchestrator::CoordinatorSettings;

    fn start() -> (
        tokio::task::JoinHandle<Result<()>>,
        UnboundedSender<UiCommand>,
        UnboundedReceiver<EngineEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let coordinator = OperationCoordinator::new(
            ToolCapabilities::default(),
            CoordinatorSettings::default(),
            event_tx.clone(),
        );
        let handle = tokio::spawn(run_controller(coordinator, event_tx, cmd_rx));
        (handle, cmd_tx, event_rx)
    }

    #[tokio::test]
    async fn rejected_commands_surface_as_events() {
        let (handle, cmd_tx, mut event_rx) = start();
        cmd_tx.send(UiCommand::ListBundles).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(EngineEvent::SessionChanged(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Rejected { reason } if reason.contains("not connected"))));
    }

    #[tokio::test]
    async fn closed_command_channel_stops_controller() {
        let (handle, cmd_tx, _event_rx) = start();
        drop(cmd_tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn filter_changes_publish_catalog() {
        let (handle, cmd_tx, mut event_rx) = start();
        cmd_tx.send(UiCommand::SetFilter("foo".into())).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        let mut saw_catalog = false;
        while let Ok(ev) = event_rx.try_recv() {
            if let EngineEvent::CatalogUpdated { entries, filtered } = ev {
                assert!(entries.is_empty() && filtered.is_empty());
                saw_catalog = true;
            }
        }
        assert!(saw_catalog);
    }
}
