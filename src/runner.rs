//! Command runner - wires settings, scanners and the registry to one CLI run

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use herd_app::{load_settings, load_settings_from, DeviceRegistry, RegistryEvent, Settings};
use herd_bridge::ToolAvailability;
use herd_core::prelude::*;

use crate::cli::{Args, Command};
use crate::fleet::{Fleet, Outcome, ProgressSink};
use crate::headless::{HeadlessEvent, OutputMode};
use crate::signals::spawn_signal_handler;

/// Run one CLI invocation to completion
pub async fn run(args: Args) -> Result<()> {
    let output = OutputMode::from_json_flag(args.json);
    let settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };

    let tools = ToolAvailability::check().await;
    let registry = DeviceRegistry::new(settings.registry_options());
    for scanner in settings.build_scanners(&tools) {
        if let Err(e) = registry.add_scanner(scanner) {
            warn!("{}", e);
            output.emit(&HeadlessEvent::warning(e.to_string()));
        }
    }
    if registry.scanner_count() == 0 {
        return Err(Error::config(
            "No usable device scanner. Check the [usb] and [ssh] sections of the config file.",
        ));
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let printer_done = CancellationToken::new();
    let printer = tokio::spawn(print_events(
        registry.subscribe(),
        output,
        matches!(args.command, Command::Watch { .. }),
        printer_done.clone(),
    ));

    let fleet = Fleet::new(registry.clone(), args.device.clone(), cancel.clone());
    let result = run_command(&fleet, &args.command, &settings, output).await;

    registry.shutdown().await;
    printer_done.cancel();
    let _ = printer.await;
    cancel.cancel();

    if let Err(ref e) = result {
        error!("Command failed: {}", e);
        if output == OutputMode::Json {
            HeadlessEvent::error(e.to_string(), true).emit();
        }
    }
    result
}

/// Execute `command` against an already configured fleet
pub async fn run_command(
    fleet: &Fleet,
    command: &Command,
    settings: &Settings,
    output: OutputMode,
) -> Result<()> {
    if let Command::Watch { interval } = command {
        let interval = interval
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| settings.discovery.refresh_interval());
        info!("Watching devices every {:?}", interval);
        fleet
            .registry()
            .run_refresh_loop(interval, fleet.cancel_token().clone())
            .await;
        return Ok(());
    }

    fleet.discover().await?;
    let interval = settings.discovery.refresh_interval();

    match command {
        Command::Devices => {
            for device in fleet.selected() {
                output.emit(&HeadlessEvent::device_listed(&device));
            }
            Ok(())
        }
        Command::Exec { .. } => {
            let line = command.shell_command().unwrap_or_default();
            let outcomes = with_refresh(fleet, interval, fleet.exec(&line)).await?;
            report(outcomes, output, "exec", |stable_id, text| {
                HeadlessEvent::command_output(stable_id, &line, text)
            })
        }
        Command::Push {
            local,
            remote,
            root,
        } => {
            let push = fleet.push(local, remote, *root, progress_sink(output));
            let outcomes = with_refresh(fleet, interval, push).await?;
            report(outcomes, output, "push", |stable_id, ()| {
                HeadlessEvent::operation_completed(stable_id, "push", Some(remote.clone()))
            })
        }
        Command::Pull {
            remote,
            local_dir,
            root,
        } => {
            let pull = fleet.pull(remote, local_dir, *root, progress_sink(output));
            let outcomes = with_refresh(fleet, interval, pull).await?;
            report(outcomes, output, "pull", |stable_id, path| {
                HeadlessEvent::operation_completed(
                    stable_id,
                    "pull",
                    Some(path.display().to_string()),
                )
            })
        }
        Command::Reboot => {
            let outcomes = with_refresh(fleet, interval, fleet.reboot()).await?;
            report(outcomes, output, "reboot", |stable_id, ()| {
                HeadlessEvent::operation_completed(stable_id, "reboot", None)
            })
        }
        Command::Watch { .. } => Ok(()),
    }
}

/// Drive `operation` while the registry rescans every `interval`.
///
/// Devices that come back after rediscovery gave up are picked up by the
/// next scan instead of leaving the operation waiting forever.
async fn with_refresh<T>(
    fleet: &Fleet,
    interval: Duration,
    operation: impl Future<Output = T>,
) -> T {
    let stop = fleet.cancel_token().child_token();
    let refresh = async {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        fleet.registry().run_refresh_loop(interval, stop.clone()).await;
    };
    let operation = async {
        let result = operation.await;
        stop.cancel();
        result
    };
    let (result, ()) = tokio::join!(operation, refresh);
    result
}

/// Print every outcome; fail when any device failed
fn report<T>(
    outcomes: Vec<Outcome<T>>,
    output: OutputMode,
    operation: &str,
    success: impl Fn(&str, T) -> HeadlessEvent,
) -> Result<()> {
    let total = outcomes.len();
    let mut failed = 0;
    for outcome in outcomes {
        let event = match outcome.result {
            Ok(value) => success(&outcome.stable_id, value),
            Err(e) => {
                failed += 1;
                HeadlessEvent::operation_failed(&outcome.stable_id, operation, e.to_string())
            }
        };
        output.emit(&event);
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(Error::operation(format!(
            "{} failed on {} of {} devices",
            operation, failed, total
        )))
    }
}

/// Progress events in tenths, JSON mode only
fn progress_sink(output: OutputMode) -> Option<ProgressSink> {
    if output != OutputMode::Json {
        return None;
    }
    let last: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());
    Some(Arc::new(move |stable_id: &str, fraction: f64| {
        let step = (fraction * 10.0).floor() as u32;
        {
            let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
            if last.get(stable_id).is_some_and(|seen| *seen >= step) {
                return;
            }
            last.insert(stable_id.to_string(), step);
        }
        HeadlessEvent::transfer_progress(stable_id, fraction).emit();
    }))
}

/// Forward registry events until `done`, then drain what is left.
///
/// Outside `watch` only warnings are shown.
async fn print_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    output: OutputMode,
    all: bool,
    done: CancellationToken,
) {
    let show = |event: &RegistryEvent| {
        if all || matches!(event, RegistryEvent::DiscoveryWarning(_)) {
            output.emit(&HeadlessEvent::from_registry(event));
        }
    };

    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = done.cancelled() => break,
        };
        match received {
            Ok(event) => show(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event printer fell behind, {} events skipped", skipped)
            }
            Err(RecvError::Closed) => return,
        }
    }

    while let Ok(event) = events.try_recv() {
        show(&event);
    }
}
