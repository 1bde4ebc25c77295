//! End-to-end interpreter scenarios driven by a manual event loop.

use serde_json::json;
use statechart_core::{
    CoreError, Event, EventPriority, EventTest, HistoryType, MachineError, ManualEventLoop,
    Notification, NotificationLog, ObjectId, RestorePolicy, RunState, StateChart, StateId,
    StateKind, StateMachine, StopReason, TransitionType,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    event_loop: Arc<ManualEventLoop>,
    machine: StateMachine,
    log: NotificationLog,
}

impl Harness {
    fn start(chart: StateChart) -> Self {
        Self::start_with(chart, |_| {})
    }

    fn start_with(chart: StateChart, setup: impl FnOnce(&mut StateMachine)) -> Self {
        let event_loop = ManualEventLoop::new();
        let mut machine = StateMachine::new(chart, event_loop.clone());
        let log = NotificationLog::new();
        machine.add_observer(log.clone());
        setup(&mut machine);
        machine.start().unwrap();
        event_loop.run_pending(&mut machine);
        Self {
            event_loop,
            machine,
            log,
        }
    }

    fn send(&mut self, name: &str) {
        self.machine
            .post_event(Event::named(name), EventPriority::Normal)
            .unwrap();
        self.event_loop.run_pending(&mut self.machine);
    }

    fn active(&self) -> Vec<&str> {
        self.machine.active_state_names()
    }

    /// Entered and exited notifications since the last call, by state name.
    fn moves(&self) -> Vec<String> {
        let chart = self.machine.chart();
        self.log
            .take()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Entered(s) => Some(format!("+{}", chart.name(s))),
                Notification::Exited(s) => Some(format!("-{}", chart.name(s))),
                _ => None,
            })
            .collect()
    }
}

fn on_off() -> (StateChart, StateId, StateId) {
    let mut chart = StateChart::new();
    let root = chart.root();
    let idle = chart
        .add_initial_state(root, StateKind::Atomic, "Idle")
        .unwrap();
    let working = chart
        .add_state(Some(root), StateKind::Atomic, "Working")
        .unwrap();
    chart
        .add_transition(idle, &[working], EventTest::named("start"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(working, &[idle], EventTest::named("stop"), TransitionType::External)
        .unwrap();
    (chart, idle, working)
}

#[test]
fn test_simple_toggle() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);
    assert_eq!(h.moves(), vec!["+Idle"]);

    h.send("start");
    assert_eq!(h.active(), vec!["Working"]);
    assert_eq!(h.moves(), vec!["-Idle", "+Working"]);

    h.send("stop");
    assert_eq!(h.active(), vec!["Idle"]);
    assert_eq!(h.moves(), vec!["-Working", "+Idle"]);
}

#[test]
fn test_start_notifications_precede_initial_entry() {
    let (chart, idle, _) = on_off();
    let h = Harness::start(chart);
    let log = h.log.significant();
    assert_eq!(log[0], Notification::Started);
    assert_eq!(log[1], Notification::RunningChanged(true));
    assert_eq!(log[2], Notification::Entered(idle));
}

#[test]
fn test_unmatched_event_changes_nothing() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);
    h.moves();
    let before = h.machine.configuration().clone();

    h.send("nothing-listens");
    assert_eq!(h.machine.configuration(), &before);
    assert!(h.moves().is_empty());
    assert_eq!(h.machine.queued_events(), 0);
    assert!(h.machine.is_running());
}

#[test]
fn test_descendant_transition_preempts_ancestor() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart
        .add_initial_state(root, StateKind::Compound, "A")
        .unwrap();
    let b = chart.add_initial_state(a, StateKind::Atomic, "B").unwrap();
    let c = chart.add_state(Some(a), StateKind::Atomic, "C").unwrap();
    let d = chart.add_state(Some(root), StateKind::Atomic, "D").unwrap();
    chart
        .add_transition(a, &[d], EventTest::named("e"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(b, &[c], EventTest::named("e"), TransitionType::External)
        .unwrap();

    let mut h = Harness::start(chart);
    h.send("e");
    assert_eq!(h.active(), vec!["A", "C"]);
}

#[test]
fn test_internal_events_run_before_external_ones() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart.add_initial_state(root, StateKind::Atomic, "A").unwrap();
    let b = chart.add_state(Some(root), StateKind::Atomic, "B").unwrap();
    let c = chart.add_state(Some(root), StateKind::Atomic, "C").unwrap();
    let d = chart.add_state(Some(root), StateKind::Atomic, "D").unwrap();
    chart
        .add_transition(a, &[b], EventTest::named("go"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(b, &[c], EventTest::named("chain"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(c, &[d], EventTest::named("ext"), TransitionType::External)
        .unwrap();
    chart
        .on_entry(b, |ctx| ctx.raise(Event::named("chain")))
        .unwrap();

    let mut h = Harness::start(chart);
    h.machine
        .post_event(Event::named("go"), EventPriority::Normal)
        .unwrap();
    h.machine
        .post_event(Event::named("ext"), EventPriority::Normal)
        .unwrap();
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["D"]);
}

#[test]
fn test_high_priority_event_jumps_the_queue() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);
    h.machine
        .post_event(Event::named("stop"), EventPriority::Normal)
        .unwrap();
    h.machine
        .post_event(Event::named("start"), EventPriority::High)
        .unwrap();
    h.event_loop.run_pending(&mut h.machine);
    // "start" is handled first, so "stop" then finds Working active.
    assert_eq!(h.active(), vec!["Idle"]);
    h.moves();
}

fn history_chart(kind: HistoryType) -> (StateChart, StateId) {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart
        .add_initial_state(root, StateKind::Compound, "A")
        .unwrap();
    let b = chart.add_initial_state(a, StateKind::Compound, "B").unwrap();
    let c1 = chart.add_initial_state(b, StateKind::Atomic, "C1").unwrap();
    let c2 = chart.add_state(Some(b), StateKind::Atomic, "C2").unwrap();
    chart.add_state(Some(a), StateKind::Atomic, "D").unwrap();
    let h = chart
        .add_state(Some(a), StateKind::History(kind), "H")
        .unwrap();
    chart.set_default_transition(h, &[b]).unwrap();
    let out = chart.add_state(Some(root), StateKind::Atomic, "Out").unwrap();

    chart
        .add_transition(c1, &[c2], EventTest::named("next"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(a, &[out], EventTest::named("leave"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(out, &[h], EventTest::named("back"), TransitionType::External)
        .unwrap();
    (chart, h)
}

#[test]
fn test_deep_history_restores_leaf() {
    let (chart, h) = history_chart(HistoryType::Deep);
    let c2 = chart.find_state("C2").unwrap();
    let mut harness = Harness::start(chart);

    // First entry through an empty history uses the default.
    assert_eq!(harness.machine.saved_history(h), None);
    harness.send("next");
    harness.send("leave");
    assert_eq!(harness.active(), vec!["Out"]);
    assert_eq!(harness.machine.saved_history(h), Some(&[c2][..]));

    harness.send("back");
    assert_eq!(harness.active(), vec!["A", "B", "C2"]);
}

#[test]
fn test_deep_history_restores_every_parallel_region() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart
        .add_initial_state(root, StateKind::Parallel, "A")
        .unwrap();
    let b = chart.add_state(Some(a), StateKind::Compound, "B").unwrap();
    let c0 = chart.add_initial_state(b, StateKind::Atomic, "C0").unwrap();
    let c = chart.add_state(Some(b), StateKind::Atomic, "C").unwrap();
    let d = chart.add_state(Some(a), StateKind::Atomic, "D").unwrap();
    let h = chart
        .add_state(Some(a), StateKind::History(HistoryType::Deep), "H")
        .unwrap();
    chart.set_default_transition(h, &[b]).unwrap();
    let out = chart.add_state(Some(root), StateKind::Atomic, "Out").unwrap();

    chart
        .add_transition(c0, &[c], EventTest::named("next"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(a, &[out], EventTest::named("leave"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(out, &[h], EventTest::named("back"), TransitionType::External)
        .unwrap();

    let mut harness = Harness::start(chart);
    assert_eq!(harness.active(), vec!["A", "B", "C0", "D"]);
    harness.send("next");
    harness.send("leave");
    assert_eq!(harness.active(), vec!["Out"]);
    assert_eq!(harness.machine.saved_history(h), Some(&[c, d][..]));

    harness.send("back");
    assert_eq!(harness.active(), vec!["A", "B", "C", "D"]);
    assert!(!harness.machine.configuration().contains(&c0));
}

#[test]
fn test_shallow_history_restores_child_with_defaults() {
    let (chart, h) = history_chart(HistoryType::Shallow);
    let b = chart.find_state("B").unwrap();
    let mut harness = Harness::start(chart);

    harness.send("next");
    harness.send("leave");
    assert_eq!(harness.machine.saved_history(h), Some(&[b][..]));

    harness.send("back");
    assert_eq!(harness.active(), vec!["A", "B", "C1"]);
}

#[test]
fn test_history_default_used_when_nothing_saved() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let out = chart
        .add_initial_state(root, StateKind::Atomic, "Out")
        .unwrap();
    let a = chart.add_state(Some(root), StateKind::Compound, "A").unwrap();
    chart.add_initial_state(a, StateKind::Atomic, "A1").unwrap();
    let a2 = chart.add_state(Some(a), StateKind::Atomic, "A2").unwrap();
    let h = chart
        .add_state(Some(a), StateKind::History(HistoryType::Shallow), "H")
        .unwrap();
    chart.set_default_transition(h, &[a2]).unwrap();
    chart
        .add_transition(out, &[h], EventTest::named("in"), TransitionType::External)
        .unwrap();

    let mut harness = Harness::start(chart);
    harness.send("in");
    assert_eq!(harness.active(), vec!["A", "A2"]);
}

fn parallel_chart() -> StateChart {
    let mut chart = StateChart::new();
    let root = chart.root();
    let p = chart
        .add_initial_state(root, StateKind::Parallel, "P")
        .unwrap();
    let r1 = chart.add_state(Some(p), StateKind::Compound, "R1").unwrap();
    let x1 = chart.add_initial_state(r1, StateKind::Atomic, "X1").unwrap();
    let x2 = chart.add_state(Some(r1), StateKind::Final, "X2").unwrap();
    let r2 = chart.add_state(Some(p), StateKind::Compound, "R2").unwrap();
    let y1 = chart.add_initial_state(r2, StateKind::Atomic, "Y1").unwrap();
    let y2 = chart.add_state(Some(r2), StateKind::Final, "Y2").unwrap();
    let done = chart.add_state(Some(root), StateKind::Final, "Done").unwrap();

    chart
        .add_transition(x1, &[x2], EventTest::named("x"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(y1, &[y2], EventTest::named("y"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(r2, &[y1], EventTest::named("reset"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(p, &[done], EventTest::Finished(p), TransitionType::External)
        .unwrap();
    chart
}

#[test]
fn test_parallel_completion_finishes_machine() {
    let chart = parallel_chart();
    let p = chart.find_state("P").unwrap();
    let r1 = chart.find_state("R1").unwrap();
    let mut h = Harness::start(chart);
    assert_eq!(h.active(), vec!["P", "R1", "X1", "R2", "Y1"]);

    h.send("x");
    assert!(h.machine.is_in_final_state(r1));
    assert!(!h.machine.is_in_final_state(p));
    assert!(h.log.entries().contains(&Notification::StateFinished(r1)));
    assert!(h.machine.is_running());

    h.send("y");
    assert!(h.log.entries().contains(&Notification::StateFinished(p)));
    assert_eq!(h.active(), vec!["Done"]);
    assert_eq!(h.machine.run_state(), RunState::NotRunning);
    assert_eq!(h.machine.last_outcome(), Some(StopReason::Finished));
    assert!(h.log.entries().contains(&Notification::Finished));
}

#[test]
fn test_parallel_root_finishes_when_all_regions_finish() {
    let mut chart = StateChart::parallel();
    let root = chart.root();
    let r1 = chart.add_state(Some(root), StateKind::Compound, "R1").unwrap();
    let x1 = chart.add_initial_state(r1, StateKind::Atomic, "X1").unwrap();
    let x2 = chart.add_state(Some(r1), StateKind::Final, "X2").unwrap();
    let r2 = chart.add_state(Some(root), StateKind::Compound, "R2").unwrap();
    let y1 = chart.add_initial_state(r2, StateKind::Atomic, "Y1").unwrap();
    let y2 = chart.add_state(Some(r2), StateKind::Final, "Y2").unwrap();
    chart
        .add_transition(x1, &[x2], EventTest::named("x"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(y1, &[y2], EventTest::named("y"), TransitionType::External)
        .unwrap();

    let mut h = Harness::start(chart);
    assert_eq!(h.active(), vec!["R1", "X1", "R2", "Y1"]);

    h.send("x");
    assert!(h.machine.is_in_final_state(r1));
    assert!(!h.machine.is_in_final_state(root));
    assert!(h.machine.is_running());

    h.send("y");
    assert!(h.machine.is_in_final_state(root));
    assert!(h.log.entries().contains(&Notification::StateFinished(r2)));
    assert_eq!(h.active(), vec!["R1", "X2", "R2", "Y2"]);
    assert_eq!(h.machine.run_state(), RunState::NotRunning);
    assert_eq!(h.machine.last_outcome(), Some(StopReason::Finished));
    assert!(h.log.entries().contains(&Notification::Finished));
}

#[test]
fn test_region_leaves_final_state_before_completion() {
    let chart = parallel_chart();
    let p = chart.find_state("P").unwrap();
    let mut h = Harness::start(chart);

    h.send("y");
    h.send("reset");
    assert_eq!(h.active(), vec!["P", "R1", "X1", "R2", "Y1"]);
    h.send("x");
    assert!(!h.log.entries().contains(&Notification::StateFinished(p)));
    assert!(h.machine.is_running());
}

#[test]
fn test_missing_initial_state_enters_error_state() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart.add_initial_state(root, StateKind::Atomic, "A").unwrap();
    let broken = chart
        .add_state(Some(root), StateKind::Compound, "Broken")
        .unwrap();
    chart
        .add_state(Some(broken), StateKind::Atomic, "Inner")
        .unwrap();
    let failed = chart.add_state(Some(root), StateKind::Atomic, "Failed").unwrap();
    chart.set_error_state(root, failed).unwrap();
    chart
        .add_transition(a, &[broken], EventTest::named("go"), TransitionType::External)
        .unwrap();

    let mut h = Harness::start(chart);
    h.send("go");

    assert_eq!(h.active(), vec!["Failed"]);
    assert!(h.machine.is_running());
    assert_eq!(h.machine.error(), Some(MachineError::NoInitialState));
    assert_eq!(h.machine.error_context(), Some(broken));
    assert_eq!(
        h.machine.error_string(),
        "Missing initial state in compound state 'Broken'"
    );
    let errors: Vec<_> = h
        .log
        .entries()
        .into_iter()
        .filter(|n| n.kind() == "error")
        .collect();
    assert_eq!(errors.len(), 1);

    h.machine.clear_error();
    assert_eq!(h.machine.error(), None);
    assert!(h.machine.error_string().is_empty());
}

#[test]
fn test_unrecoverable_error_stops_machine() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart.add_initial_state(root, StateKind::Atomic, "A").unwrap();
    let broken = chart
        .add_state(Some(root), StateKind::Compound, "Broken")
        .unwrap();
    chart
        .add_state(Some(broken), StateKind::Atomic, "Inner")
        .unwrap();
    chart
        .add_transition(a, &[broken], EventTest::named("go"), TransitionType::External)
        .unwrap();

    let mut h = Harness::start(chart);
    h.send("go");

    assert_eq!(h.machine.run_state(), RunState::NotRunning);
    assert_eq!(h.machine.last_outcome(), Some(StopReason::Stopped));
    assert_eq!(h.machine.error(), Some(MachineError::NoInitialState));
    assert!(h.log.entries().contains(&Notification::Stopped));
}

#[test]
fn test_transition_to_detached_state_reports_no_common_ancestor() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart.add_initial_state(root, StateKind::Atomic, "A").unwrap();
    let detached = chart.add_state(None, StateKind::Atomic, "Detached").unwrap();
    chart
        .add_transition(a, &[detached], EventTest::named("go"), TransitionType::External)
        .unwrap();

    let mut h = Harness::start(chart);
    h.send("go");
    assert_eq!(
        h.machine.error(),
        Some(MachineError::NoCommonAncestorForTransition)
    );
    assert_eq!(h.machine.run_state(), RunState::NotRunning);
}

#[test]
fn test_delayed_event_fires_after_delay() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);

    let id = h
        .machine
        .post_delayed_event(Event::named("start"), Duration::from_millis(100))
        .unwrap();
    assert_eq!(h.machine.pending_delayed_events(), 1);

    h.event_loop
        .advance(Duration::from_millis(50), &mut h.machine);
    assert_eq!(h.active(), vec!["Idle"]);

    h.event_loop
        .advance(Duration::from_millis(60), &mut h.machine);
    assert_eq!(h.active(), vec!["Working"]);
    assert_eq!(h.machine.pending_delayed_events(), 0);
    assert!(!h.machine.cancel_delayed_event(id));
}

#[test]
fn test_cancelled_delayed_event_never_fires() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);

    let id = h
        .machine
        .post_delayed_event(Event::named("start"), Duration::from_millis(100))
        .unwrap();
    assert!(h.machine.cancel_delayed_event(id));
    assert_eq!(h.event_loop.active_timers(), 0);

    h.event_loop.advance(Duration::from_secs(1), &mut h.machine);
    assert_eq!(h.active(), vec!["Idle"]);
}

#[test]
fn test_delayed_events_are_dropped_when_run_ends() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);
    h.machine
        .post_delayed_event(Event::named("start"), Duration::from_millis(100))
        .unwrap();

    h.machine.stop();
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.machine.pending_delayed_events(), 0);
    assert_eq!(
        h.machine
            .post_delayed_event(Event::named("start"), Duration::from_millis(1)),
        Err(CoreError::NotRunning)
    );
}

#[test]
fn test_go_to_state_jumps_and_ignores_active_target() {
    let mut chart = StateChart::new();
    let root = chart.root();
    let a = chart
        .add_initial_state(root, StateKind::Compound, "A")
        .unwrap();
    chart.add_initial_state(a, StateKind::Atomic, "A1").unwrap();
    let a2 = chart.add_state(Some(a), StateKind::Atomic, "A2").unwrap();
    let b = chart.add_state(Some(root), StateKind::Atomic, "B").unwrap();

    let mut h = Harness::start(chart);
    h.moves();

    h.machine.go_to_state(a2);
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["A", "A2"]);
    h.moves();

    h.machine.go_to_state(a2);
    h.event_loop.run_pending(&mut h.machine);
    assert!(h.moves().is_empty());

    h.machine.go_to_state(b);
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["B"]);
}

fn lamp_chart(object: ObjectId) -> StateChart {
    let mut chart = StateChart::new();
    let root = chart.root();
    let off = chart.add_initial_state(root, StateKind::Atomic, "Off").unwrap();
    let on = chart.add_state(Some(root), StateKind::Atomic, "On").unwrap();
    chart
        .assign_property(on, object, "color", json!("green"))
        .unwrap();
    chart
        .add_transition(off, &[on], EventTest::named("on"), TransitionType::External)
        .unwrap();
    chart
        .add_transition(on, &[off], EventTest::named("off"), TransitionType::External)
        .unwrap();
    chart
}

#[test]
fn test_restore_policy_restores_on_exit() {
    let lamp = ObjectId(1);
    let mut h = Harness::start_with(lamp_chart(lamp), |m| {
        m.properties_mut().set(lamp, "color", json!("red"));
        m.set_restore_policy(RestorePolicy::RestoreProperties);
    });

    h.send("on");
    assert_eq!(h.machine.properties().get(lamp, "color"), Some(&json!("green")));
    h.send("off");
    assert_eq!(h.machine.properties().get(lamp, "color"), Some(&json!("red")));
}

#[test]
fn test_restart_forgets_values_saved_by_previous_run() {
    let lamp = ObjectId(1);
    let mut h = Harness::start_with(lamp_chart(lamp), |m| {
        m.properties_mut().set(lamp, "color", json!("red"));
        m.set_restore_policy(RestorePolicy::RestoreProperties);
    });
    h.send("on");

    // Stop while On still holds the value it overwrote.
    h.machine.stop();
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.machine.run_state(), RunState::NotRunning);

    h.machine.properties_mut().set(lamp, "color", json!("blue"));
    h.machine.start().unwrap();
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["Off"]);

    h.send("on");
    assert_eq!(h.machine.properties().get(lamp, "color"), Some(&json!("green")));
    h.send("off");
    assert_eq!(h.machine.properties().get(lamp, "color"), Some(&json!("blue")));
}

#[test]
fn test_default_policy_keeps_assigned_values() {
    let lamp = ObjectId(1);
    let mut h = Harness::start_with(lamp_chart(lamp), |m| {
        m.properties_mut().set(lamp, "color", json!("red"));
    });
    assert_eq!(h.machine.restore_policy(), RestorePolicy::DontRestoreProperties);

    h.send("on");
    h.send("off");
    assert_eq!(h.machine.properties().get(lamp, "color"), Some(&json!("green")));
}

#[test]
fn test_signal_transition_is_bound_while_source_is_active() {
    let button = ObjectId(7);
    let mut chart = StateChart::new();
    let root = chart.root();
    let idle = chart
        .add_initial_state(root, StateKind::Atomic, "Idle")
        .unwrap();
    let pressed = chart
        .add_state(Some(root), StateKind::Atomic, "Pressed")
        .unwrap();
    chart
        .add_transition(
            idle,
            &[pressed],
            EventTest::signal(button, "clicked"),
            TransitionType::External,
        )
        .unwrap();

    let mut h = Harness::start(chart);
    assert!(!h.machine.emit_signal(ObjectId(8), "clicked", vec![]));
    assert!(h.machine.emit_signal(button, "clicked", vec![json!(1)]));
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["Pressed"]);

    // Idle was exited, so the binding is gone.
    assert!(!h.machine.emit_signal(button, "clicked", vec![]));
}

#[test]
fn test_filtered_event_reaches_bound_transition() {
    let window = ObjectId(3);
    let mut chart = StateChart::new();
    let root = chart.root();
    let shown = chart
        .add_initial_state(root, StateKind::Atomic, "Shown")
        .unwrap();
    let hidden = chart
        .add_state(Some(root), StateKind::Atomic, "Hidden")
        .unwrap();
    chart
        .add_transition(
            shown,
            &[hidden],
            EventTest::filtered(window, "close"),
            TransitionType::External,
        )
        .unwrap();

    let mut h = Harness::start(chart);
    assert!(h.machine.filter_event(window, "close", json!(null)));
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["Hidden"]);
}

#[test]
fn test_restart_clears_history_and_reenters_initial() {
    let (chart, h) = history_chart(HistoryType::Deep);
    let mut harness = Harness::start(chart);
    harness.send("next");
    harness.send("leave");
    assert!(harness.machine.saved_history(h).is_some());

    harness.machine.stop();
    harness.event_loop.run_pending(&mut harness.machine);
    assert_eq!(harness.machine.run_state(), RunState::NotRunning);

    harness.machine.start().unwrap();
    harness.event_loop.run_pending(&mut harness.machine);
    assert_eq!(harness.machine.saved_history(h), None);
    assert_eq!(harness.active(), vec!["A", "B", "C1"]);
}

#[test]
fn test_removing_state_detaches_transitions() {
    let (chart, _, working) = on_off();
    let event_loop = ManualEventLoop::new();
    let mut machine = StateMachine::new(chart, event_loop.clone());
    machine.remove_state(working).unwrap();
    assert!(machine.chart().find_state("Working").is_none());

    machine.start().unwrap();
    event_loop.run_pending(&mut machine);
    machine
        .post_event(Event::named("start"), EventPriority::Normal)
        .unwrap();
    event_loop.run_pending(&mut machine);
    assert_eq!(machine.active_state_names(), vec!["Idle"]);
}

#[test]
fn test_posts_from_another_thread_are_processed_on_owner() {
    let (chart, _, _) = on_off();
    let mut h = Harness::start(chart);
    let poster = h.machine.poster();

    std::thread::spawn(move || {
        poster
            .post_event(Event::named("start"), EventPriority::Normal)
            .unwrap();
    })
    .join()
    .unwrap();

    assert_eq!(h.active(), vec!["Idle"]);
    h.event_loop.run_pending(&mut h.machine);
    assert_eq!(h.active(), vec!["Working"]);
}
