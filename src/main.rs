//! statechart - demo host for the statechart interpreter
//!
//! Runs a traffic-light chart on the tokio runtime and logs what it does:
//! timed phase changes, a pedestrian region running in parallel, a
//! maintenance detour that returns through history, and a shutdown sequence
//! that completes the machine.

use clap::Parser;
use serde_json::json;
use statechart_core::{
    CoreError, Event, EventPriority, EventTest, HistoryType, ObjectId, StateChart, StateKind,
    TransitionType,
};
use statechart_runtime::{Config, MachineHandle, MachineRuntime, NotificationFilter};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// The host object whose properties the lights write.
const SIGNAL_HEAD: ObjectId = ObjectId(1);

#[derive(Parser)]
#[command(name = "statechart")]
#[command(about = "Runs a demo traffic-light statechart")]
#[command(version)]
struct Args {
    /// Path to a YAML config file (overrides STATECHART_CONFIG)
    #[arg(short, long, env = "STATECHART_CONFIG")]
    config: Option<PathBuf>,

    /// Light cycles to run before shutting down
    #[arg(long, default_value_t = 2)]
    cycles: u32,

    /// Length of the green phase in milliseconds
    #[arg(long, default_value_t = 400)]
    period_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load_from(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    tracing::info!("Starting statechart demo");
    tracing::info!("  Restore policy: {:?}", config.machine.restore_policy);
    tracing::info!("  Cycles: {}", args.cycles);
    tracing::info!("  Period: {}ms", args.period_ms);

    let period = Duration::from_millis(args.period_ms);
    let chart = traffic_light(period)?;

    let mut config = config;
    config.runtime.exit_on_finish = true;
    let runtime = MachineRuntime::new(config)?;
    let machine = runtime.machine(chart);
    let handle = runtime.spawn(machine);

    let mut notifications = handle.subscribe(NotificationFilter::kinds([
        "entered",
        "exited",
        "error",
        "finished",
        "stopped",
    ]));

    handle.start().await?;
    tokio::spawn(drive(handle.clone(), period, args.cycles));

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                match &notification.state {
                    Some(state) => tracing::info!("{} {}", notification.kind, state),
                    None => tracing::info!("{}", notification.kind),
                }
                if matches!(notification.kind, "finished" | "stopped") {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping state machine");
                handle.stop();
            }
        }
    }

    let machine = handle.join().await?;
    tracing::info!(
        "Machine ended: outcome={:?} final_states={:?} color={}",
        machine.last_outcome(),
        machine.active_state_names(),
        machine
            .properties()
            .get(SIGNAL_HEAD, "color")
            .cloned()
            .unwrap_or_default()
    );
    Ok(())
}

/// Scripted outside traffic: a pedestrian, a maintenance visit, then shutdown.
async fn drive(handle: MachineHandle, period: Duration, cycles: u32) {
    let script = [
        (period, "button"),
        (period * 2, "maintenance"),
        (period, "resume"),
        (period * 4 * cycles.max(1), "shutdown"),
    ];
    for (delay, name) in script {
        tokio::time::sleep(delay).await;
        tracing::debug!(event = name, "posting scripted event");
        if let Err(e) = handle.post_event(Event::named(name), EventPriority::Normal) {
            tracing::warn!(event = name, error = %e, "scripted event rejected");
            return;
        }
    }
}

/// Builds the demo chart.
///
/// ```text
/// root
/// ├── Operating (parallel)
/// │   ├── Lights: Red -> Green -> Yellow -> Red, shallow history
/// │   └── Pedestrian: Waiting -> Crossing -> Waiting
/// ├── Maintenance
/// ├── ShuttingDown: Draining -> Drained (final)
/// └── Off (final)
/// ```
fn traffic_light(period: Duration) -> Result<StateChart, CoreError> {
    let mut chart = StateChart::new();
    let root = chart.root();

    let operating = chart.add_initial_state(root, StateKind::Parallel, "Operating")?;
    let maintenance = chart.add_state(Some(root), StateKind::Atomic, "Maintenance")?;
    let shutting_down = chart.add_state(Some(root), StateKind::Compound, "ShuttingDown")?;
    let off = chart.add_state(Some(root), StateKind::Final, "Off")?;

    // Lights region
    let lights = chart.add_state(Some(operating), StateKind::Compound, "Lights")?;
    let red = chart.add_initial_state(lights, StateKind::Atomic, "Red")?;
    let green = chart.add_state(Some(lights), StateKind::Atomic, "Green")?;
    let yellow = chart.add_state(Some(lights), StateKind::Atomic, "Yellow")?;
    let lights_history = chart.add_state(
        Some(lights),
        StateKind::History(HistoryType::Shallow),
        "LightsHistory",
    )?;
    chart.set_default_transition(lights_history, &[red])?;

    for (state, color, phase, next) in [
        (red, "red", period, green),
        (green, "green", period, yellow),
        (yellow, "yellow", period / 2, red),
    ] {
        chart.assign_property(state, SIGNAL_HEAD, "color", json!(color))?;
        let elapsed = format!("{}_elapsed", color);
        let posted = elapsed.clone();
        chart.on_entry(state, move |ctx| {
            if let Err(e) = ctx
                .poster()
                .post_delayed_event(Event::named(posted.as_str()), phase)
            {
                tracing::warn!(error = %e, "could not arm phase timer");
            }
        })?;
        chart.add_transition(
            state,
            &[next],
            EventTest::named(elapsed),
            TransitionType::External,
        )?;
    }

    // Pedestrian region
    let pedestrian = chart.add_state(Some(operating), StateKind::Compound, "Pedestrian")?;
    let waiting = chart.add_initial_state(pedestrian, StateKind::Atomic, "Waiting")?;
    let crossing = chart.add_state(Some(pedestrian), StateKind::Atomic, "Crossing")?;
    chart.add_transition(
        waiting,
        &[crossing],
        EventTest::named("button"),
        TransitionType::External,
    )?;
    chart.on_entry(crossing, move |ctx| {
        if let Err(e) = ctx
            .poster()
            .post_delayed_event(Event::named("walk_done"), period)
        {
            tracing::warn!(error = %e, "could not arm crossing timer");
        }
    })?;
    chart.add_transition(
        crossing,
        &[waiting],
        EventTest::named("walk_done"),
        TransitionType::External,
    )?;

    // Maintenance detour
    chart.add_transition(
        operating,
        &[maintenance],
        EventTest::named("maintenance"),
        TransitionType::External,
    )?;
    chart.assign_property(maintenance, SIGNAL_HEAD, "color", json!("flashing"))?;
    chart.add_transition(
        maintenance,
        &[lights_history],
        EventTest::named("resume"),
        TransitionType::External,
    )?;

    // Shutdown sequence: completes through a finished event.
    let draining = chart.add_initial_state(shutting_down, StateKind::Atomic, "Draining")?;
    let drained = chart.add_state(Some(shutting_down), StateKind::Final, "Drained")?;
    chart.add_transition(
        draining,
        &[drained],
        EventTest::Eventless,
        TransitionType::External,
    )?;
    chart.add_transition(
        operating,
        &[shutting_down],
        EventTest::named("shutdown"),
        TransitionType::External,
    )?;
    chart.add_transition(
        maintenance,
        &[shutting_down],
        EventTest::named("shutdown"),
        TransitionType::External,
    )?;
    chart.add_transition(
        shutting_down,
        &[off],
        EventTest::Finished(shutting_down),
        TransitionType::External,
    )?;
    chart.on_entry(off, |ctx| {
        ctx.properties_mut().set(SIGNAL_HEAD, "color", json!("dark"));
    })?;

    Ok(chart)
}
