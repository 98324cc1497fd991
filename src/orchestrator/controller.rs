//! Console controller.
//!
//! Receives operator commands from the UI, runs pipeline stages against the
//! registry, forwards engine control commands to the dispatcher, and reports
//! everything back as [`ConsoleEvent`]s.

use super::stages::{GateError, Pipeline};
use crate::engine::{CommandDispatcher, EngineCommand};
use crate::model::{ConsoleEvent, RecordId, RunId, Stage, StageReport};
use crate::source::RecordSource;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum ConsoleCommand {
    Validate {
        run_id: RunId,
        selection: Vec<RecordId>,
    },
    Migrate {
        run_id: RunId,
        selection: Vec<RecordId>,
    },
    Verify {
        run_id: RunId,
        selection: Vec<RecordId>,
    },
    CancelMigration,
    NewRun,
    DiscardRun {
        run_id: RunId,
    },
    Engine(EngineCommand),
    Quit,
}

/// Products and record source used when the operator opens a new run.
pub(crate) struct RunTemplate {
    pub source: Arc<dyn RecordSource>,
    pub source_product_id: String,
    pub target_product_id: String,
}

/// Internal handle for an in-flight migration batch.
struct MigrationCtx {
    run_id: RunId,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<Result<StageReport, GateError>>>,
}

fn start_migration(
    pipeline: &Pipeline,
    run_id: RunId,
    selection: Vec<RecordId>,
    event_tx: UnboundedSender<ConsoleEvent>,
) -> MigrationCtx {
    let cancel = CancellationToken::new();
    let p = pipeline.clone();
    let token = cancel.clone();
    let id = run_id.clone();
    let _ = event_tx.send(ConsoleEvent::StageStarted {
        run_id: run_id.clone(),
        stage: Stage::Migrate,
        records: selection.len(),
    });
    let handle = tokio::spawn(async move {
        p.migrate_selection(&id, &selection, &token, &event_tx)
            .await
    });
    MigrationCtx {
        run_id,
        cancel,
        handle: Some(handle),
    }
}

fn report_stage(
    event_tx: &UnboundedSender<ConsoleEvent>,
    stage: Stage,
    res: Result<StageReport, GateError>,
) {
    match res {
        Ok(report) => {
            let _ = event_tx.send(ConsoleEvent::StageFinished(report));
        }
        Err(e) => {
            tracing::warn!(%stage, error = %e, "stage refused");
            let _ = event_tx.send(ConsoleEvent::Info(format!("Cannot {stage}: {e}")));
        }
    }
}

/// Process UI commands until `Quit` (or the command channel closes) and any
/// in-flight migration has stopped.
pub(crate) async fn run_controller(
    pipeline: Pipeline,
    template: RunTemplate,
    dispatcher: Option<CommandDispatcher>,
    event_tx: UnboundedSender<ConsoleEvent>,
    mut cmd_rx: UnboundedReceiver<ConsoleCommand>,
) -> Result<()> {
    let mut migration: Option<MigrationCtx> = None;
    let mut quit_pending = false;
    let mut run_counter = pipeline.registry.runs().len();
    // Cancel watchdog: if a cancel takes too long, keep the operator informed.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    let info = |msg: String| {
        let _ = event_tx.send(ConsoleEvent::Info(msg));
    };

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(ConsoleCommand::Validate { run_id, selection }) => {
                        let _ = event_tx.send(ConsoleEvent::StageStarted {
                            run_id: run_id.clone(),
                            stage: Stage::Validate,
                            records: selection.len(),
                        });
                        let res = pipeline.validate_selection(&run_id, &selection);
                        report_stage(&event_tx, Stage::Validate, res);
                    }
                    Some(ConsoleCommand::Verify { run_id, selection }) => {
                        let _ = event_tx.send(ConsoleEvent::StageStarted {
                            run_id: run_id.clone(),
                            stage: Stage::Verify,
                            records: selection.len(),
                        });
                        let res = pipeline.verify_selection(&run_id, &selection);
                        report_stage(&event_tx, Stage::Verify, res);
                    }
                    Some(ConsoleCommand::Migrate { run_id, selection }) => {
                        if let Some(ctx) = &migration {
                            info(format!("Migration already running for {}", ctx.run_id));
                        } else if let Err(e) = pipeline.gate_migration(&run_id, &selection) {
                            // Refused before anything started; the UI never sees a StageStarted.
                            report_stage(&event_tx, Stage::Migrate, Err(e));
                        } else {
                            let tx = event_tx.clone();
                            migration = Some(start_migration(&pipeline, run_id, selection, tx));
                        }
                    }
                    Some(ConsoleCommand::CancelMigration) => {
                        if let Some(ctx) = &migration {
                            ctx.cancel.cancel();
                            info("Cancelling migration…".into());
                            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
                            cancel_deadline = Some(deadline);
                        } else {
                            info("No migration in progress".into());
                        }
                    }
                    Some(ConsoleCommand::NewRun) => {
                        run_counter += 1;
                        let name = format!("Run {run_counter}");
                        match pipeline.open_run(
                            template.source.as_ref(),
                            &name,
                            &template.source_product_id,
                            &template.target_product_id,
                        ) {
                            Ok(run) => info(format!(
                                "Created {} ({} policies)",
                                run.name, run.total_policies
                            )),
                            Err(e) => info(format!("New run failed: {e:#}")),
                        }
                    }
                    Some(ConsoleCommand::DiscardRun { run_id }) => {
                        if migration.as_ref().is_some_and(|ctx| ctx.run_id == run_id) {
                            info(format!("Cannot discard {run_id} while it is migrating"));
                        } else if pipeline.registry.discard_run(&run_id) {
                            tracing::info!(run = %run_id, "run discarded");
                            info(format!("Discarded {run_id}"));
                        } else {
                            info(format!("No run {run_id}"));
                        }
                    }
                    Some(ConsoleCommand::Engine(command)) => {
                        match &dispatcher {
                            Some(d) => {
                                // The dispatcher itself refuses overlapping commands.
                                let d = d.clone();
                                let tx = event_tx.clone();
                                tokio::spawn(async move {
                                    let result = match d.execute(command).await {
                                        Ok(ack) => {
                                            Ok(format!("Engine acknowledged {}", ack.command))
                                        }
                                        Err(e) => Err(e.to_string()),
                                    };
                                    let _ = tx.send(ConsoleEvent::CommandFinished {
                                        command,
                                        result,
                                    });
                                });
                            }
                            None => info("No engine configured (--engine-url)".into()),
                        }
                    }
                    Some(ConsoleCommand::Quit) | None => {
                        // Quit waits for the migration task so no write lands after the UI is gone.
                        quit_pending = true;
                        if let Some(ctx) = &migration {
                            ctx.cancel.cancel();
                            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
                            cancel_deadline = Some(deadline);
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut migration {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    match join_res {
                        Ok(res) => report_stage(&event_tx, Stage::Migrate, res),
                        Err(e) => {
                            tracing::error!(error = %e, "migration task failed");
                            info(format!("Migration task failed: {e}"));
                        }
                    }
                    if let Some(ctx) = migration.take() {
                        let _ = event_tx.send(ConsoleEvent::MigrationEnded { run_id: ctx.run_id });
                    }
                    cancel_deadline = None;
                    if quit_pending {
                        break Ok(());
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && migration.is_some() {
                        info("Still cancelling…".into());
                        cancel_deadline = None;
                    }
                }
            }
        }
    };

    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationState;
    use crate::pipeline::policy::FixturePolicy;
    use crate::pipeline::PipelineEngine;
    use crate::registry::RunRegistry;
    use crate::source::FixtureSource;
    use tokio::sync::mpsc;

    fn setup(step: Duration) -> (Pipeline, RunTemplate) {
        let pipeline = Pipeline::new(
            RunRegistry::new(),
            PipelineEngine::new(Box::new(FixturePolicy::default())),
            step,
        );
        let template = RunTemplate {
            source: Arc::new(FixtureSource { count: 4 }),
            source_product_id: "auto".into(),
            target_product_id: "auto-next".into(),
        };
        (pipeline, template)
    }

    async fn next_finished(rx: &mut UnboundedReceiver<ConsoleEvent>) -> StageReport {
        loop {
            match rx.recv().await {
                Some(ConsoleEvent::StageFinished(r)) => return r,
                Some(_) => continue,
                None => panic!("controller stopped"),
            }
        }
    }

    #[tokio::test]
    async fn drives_a_run_through_all_stages() {
        let (pipeline, template) = setup(Duration::ZERO);
        let registry = pipeline.registry.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = tokio::spawn(run_controller(pipeline, template, None, event_tx, cmd_rx));

        cmd_tx.send(ConsoleCommand::NewRun).unwrap();
        let run_id = loop {
            if let Some(ConsoleEvent::Info(_)) = event_rx.recv().await {
                if let Some(run) = registry.runs().first() {
                    break run.id.clone();
                }
            }
        };
        let all: Vec<RecordId> = registry.records(&run_id).into_iter().map(|r| r.id).collect();

        cmd_tx
            .send(ConsoleCommand::Validate {
                run_id: run_id.clone(),
                selection: all.clone(),
            })
            .unwrap();
        assert_eq!(next_finished(&mut event_rx).await.failed, 1);

        let passing: Vec<RecordId> = all.iter().filter(|id| *id != &all[2]).cloned().collect();
        cmd_tx
            .send(ConsoleCommand::Migrate {
                run_id: run_id.clone(),
                selection: passing.clone(),
            })
            .unwrap();
        let report = next_finished(&mut event_rx).await;
        assert_eq!(report.stage, Stage::Migrate);
        assert_eq!(report.passed, 3);
        match event_rx.recv().await {
            Some(ConsoleEvent::MigrationEnded { run_id: ended }) => assert_eq!(ended, run_id),
            other => panic!("unexpected event {other:?}"),
        }
        for id in &passing {
            assert_eq!(registry.get_status(&run_id, id).migration, MigrationState::Success);
        }

        cmd_tx.send(ConsoleCommand::Quit).unwrap();
        ctrl.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn engine_commands_without_engine_are_reported() {
        let (pipeline, template) = setup(Duration::ZERO);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = tokio::spawn(run_controller(pipeline, template, None, event_tx, cmd_rx));
        cmd_tx
            .send(ConsoleCommand::Engine(EngineCommand::Pause))
            .unwrap();
        match event_rx.recv().await {
            Some(ConsoleEvent::Info(msg)) => assert!(msg.contains("No engine")),
            other => panic!("unexpected event {other:?}"),
        }
        drop(cmd_tx);
        ctrl.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn quit_cancels_and_waits_for_migration() {
        let (pipeline, template) = setup(Duration::from_secs(5));
        let registry = pipeline.registry.clone();
        let run = pipeline
            .open_run(template.source.as_ref(), "slow", "auto", "auto-next")
            .unwrap();
        let all: Vec<RecordId> = registry.records(&run.id).into_iter().map(|r| r.id).collect();
        pipeline.validate_selection(&run.id, &all).unwrap();
        let passing: Vec<RecordId> = all.iter().filter(|id| *id != &all[2]).cloned().collect();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = tokio::spawn(run_controller(pipeline, template, None, event_tx, cmd_rx));
        cmd_tx
            .send(ConsoleCommand::Migrate {
                run_id: run.id.clone(),
                selection: passing.clone(),
            })
            .unwrap();
        while let Some(ev) = event_rx.recv().await {
            if matches!(ev, ConsoleEvent::RecordMigrating { .. }) {
                break;
            }
        }
        cmd_tx.send(ConsoleCommand::Quit).unwrap();
        ctrl.await.unwrap().unwrap();

        let report = next_finished(&mut event_rx).await;
        assert!(report.cancelled);
        assert_eq!(report.attempted, 1);
        let st = registry.get_status(&run.id, &passing[1]);
        assert_eq!(st.migration, MigrationState::Pending);
    }

    #[tokio::test]
    async fn refused_migration_never_reports_a_start() {
        let (pipeline, template) = setup(Duration::ZERO);
        let run = pipeline
            .open_run(template.source.as_ref(), "fresh", "auto", "auto-next")
            .unwrap();
        let all: Vec<RecordId> = pipeline
            .registry
            .records(&run.id)
            .into_iter()
            .map(|r| r.id)
            .collect();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = tokio::spawn(run_controller(pipeline, template, None, event_tx, cmd_rx));
        cmd_tx
            .send(ConsoleCommand::Migrate {
                run_id: run.id.clone(),
                selection: all,
            })
            .unwrap();
        cmd_tx.send(ConsoleCommand::Quit).unwrap();
        ctrl.await.unwrap().unwrap();

        let mut events = Vec::new();
        while let Some(ev) = event_rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 1, "{events:?}");
        match &events[0] {
            ConsoleEvent::Info(msg) => assert!(msg.starts_with("Cannot migrate")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discarding_waits_for_the_run_to_stop_migrating() {
        let (pipeline, template) = setup(Duration::from_secs(5));
        let registry = pipeline.registry.clone();
        let run = pipeline
            .open_run(template.source.as_ref(), "busy", "auto", "auto-next")
            .unwrap();
        let all: Vec<RecordId> = registry.records(&run.id).into_iter().map(|r| r.id).collect();
        pipeline.validate_selection(&run.id, &all).unwrap();
        let passing: Vec<RecordId> = all.iter().filter(|id| *id != &all[2]).cloned().collect();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctrl = tokio::spawn(run_controller(pipeline, template, None, event_tx, cmd_rx));
        cmd_tx
            .send(ConsoleCommand::Migrate {
                run_id: run.id.clone(),
                selection: passing,
            })
            .unwrap();
        cmd_tx
            .send(ConsoleCommand::DiscardRun {
                run_id: run.id.clone(),
            })
            .unwrap();
        loop {
            match event_rx.recv().await {
                Some(ConsoleEvent::Info(msg)) => {
                    assert!(msg.contains("while it is migrating"), "{msg}");
                    break;
                }
                Some(_) => continue,
                None => panic!("controller stopped"),
            }
        }
        assert!(registry.run(&run.id).is_some());

        cmd_tx.send(ConsoleCommand::CancelMigration).unwrap();
        loop {
            match event_rx.recv().await {
                Some(ConsoleEvent::MigrationEnded { .. }) => break,
                Some(_) => continue,
                None => panic!("controller stopped"),
            }
        }
        cmd_tx
            .send(ConsoleCommand::DiscardRun {
                run_id: run.id.clone(),
            })
            .unwrap();
        loop {
            match event_rx.recv().await {
                Some(ConsoleEvent::Info(msg)) if msg.starts_with("Discarded") => break,
                Some(_) => continue,
                None => panic!("controller stopped"),
            }
        }
        assert!(registry.run(&run.id).is_none());
        assert!(registry.all_validation_failed().is_empty());

        cmd_tx.send(ConsoleCommand::Quit).unwrap();
        ctrl.await.unwrap().unwrap();
    }
}
