//! End-to-end runs of the built-in nodes against a mock board

use std::sync::Arc;
use std::time::Duration;

use flow_engine::{
    DeviceConfig, EngineConfig, EngineState, FlowEngine, GraphBuilder, GraphDescription,
    HardwareError, HardwareManager, MockBoard, PinKind,
};
use flow_nodes::builtin_registry;
use serde_json::{json, Value};
use tokio_test::assert_ok;

const LED: u32 = 13;
const BUZZER: u32 = 12;
const MOTOR: u32 = 9;
const BUTTON: u32 = 2;
const POT: u32 = 14;

struct Bench {
    engine: FlowEngine,
    board: Arc<MockBoard>,
}

fn bench() -> Bench {
    let board = Arc::new(MockBoard::new("uno"));
    let hardware = Arc::new(HardwareManager::new());
    hardware.add_board(board.clone());
    for device in [
        DeviceConfig::digital_output("led", "uno", LED),
        DeviceConfig::digital_output("buzzer", "uno", BUZZER),
        DeviceConfig::digital_output("motor", "uno", MOTOR).with_kind(PinKind::Pwm),
        DeviceConfig::input("button", "uno", BUTTON, PinKind::Digital),
        DeviceConfig::input("pot", "uno", POT, PinKind::Analog),
    ] {
        hardware.add_device(device).unwrap();
    }
    let engine = FlowEngine::new(Arc::new(builtin_registry()), hardware, EngineConfig::default());
    Bench { engine, board }
}

fn load(bench: &Bench, builder: GraphBuilder) {
    let description = builder.build(&bench.engine.registry()).unwrap();
    bench.engine.load(&description).unwrap();
}

fn values(board: &MockBoard, pin: u32) -> Vec<Value> {
    board.writes_to(pin).into_iter().map(|w| w.value).collect()
}

#[tokio::test(start_paused = true)]
async fn test_blink_once() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("blink")
            .node("start", "StartExperiment")
            .node("on", "Output")
            .with_device("led")
            .with_property("value", json!(true))
            .node("wait", "Delay")
            .with_property("duration", json!(1.0))
            .node("off", "Output")
            .with_device("led")
            .with_property("value", json!(false))
            .node("end", "EndExperiment")
            .connect("start", "next", "on", "exec")
            .connect("on", "next", "wait", "exec")
            .connect("wait", "next", "off", "exec")
            .connect("off", "next", "end", "exec"),
    );

    assert_ok!(bench.engine.start().await);
    assert_eq!(bench.engine.state(), EngineState::Running);
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);

    let writes = bench.board.writes_to(LED);
    assert_eq!(
        writes.iter().map(|w| w.value.clone()).collect::<Vec<_>>(),
        vec![json!(true), json!(false)]
    );
    let gap = writes[1].at - writes[0].at;
    assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1050));
    assert!(bench.engine.bound_device("on").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_loop_blinks_then_finishes() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("loop")
            .node("start", "StartExperiment")
            .node("loop", "Loop")
            .with_property("count", json!(3))
            .node("on", "Output")
            .with_device("led")
            .with_property("value", json!(true))
            .node("hold", "Delay")
            .with_property("duration", json!(0.1))
            .node("off", "Output")
            .with_device("led")
            .with_property("value", json!(false))
            .node("rest", "Delay")
            .with_property("duration", json!(0.1))
            .node("done", "Output")
            .with_device("buzzer")
            .connect("start", "next", "loop", "exec")
            .connect("loop", "body", "on", "exec")
            .connect("on", "next", "hold", "exec")
            .connect("hold", "next", "off", "exec")
            .connect("off", "next", "rest", "exec")
            .connect("loop", "done", "done", "exec"),
    );

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);

    assert_eq!(
        values(&bench.board, LED),
        [true, false, true, false, true, false].map(Value::Bool).to_vec()
    );
    let last_led = bench.board.writes_to(LED).last().unwrap().at;
    let buzzer = bench.board.writes_to(BUZZER);
    assert_eq!(buzzer.len(), 1);
    assert!(buzzer[0].at >= last_led);
    assert_eq!(bench.engine.get_output("loop", 2).unwrap(), json!(2));
}

#[tokio::test(start_paused = true)]
async fn test_loop_count_runs_body_that_many_times() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("count")
            .node("start", "StartExperiment")
            .node("loop", "Loop")
            .with_property("count", json!(5))
            .node("tick", "Output")
            .with_device("led")
            .node("done", "Output")
            .with_device("buzzer")
            .connect("start", "next", "loop", "exec")
            .connect("loop", "body", "tick", "exec")
            .connect("loop", "done", "done", "exec"),
    );

    bench.engine.start().await.unwrap();
    bench.engine.wait_until_idle().await;
    assert_eq!(bench.board.writes_to(LED).len(), 5);
    assert_eq!(bench.board.writes_to(BUZZER).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_infinite_loop_runs_until_stopped() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("forever")
            .node("start", "StartExperiment")
            .node("loop", "Loop")
            .node("wait", "Delay")
            .with_property("duration", json!(0.5))
            .node("tick", "Output")
            .with_device("led")
            .node("done", "Output")
            .with_device("buzzer")
            .connect("start", "next", "loop", "exec")
            .connect("loop", "body", "wait", "exec")
            .connect("wait", "next", "tick", "exec")
            .connect("loop", "done", "done", "exec"),
    );

    bench.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(bench.engine.state(), EngineState::Running);

    assert_ok!(bench.engine.stop().await);
    assert_eq!(bench.engine.state(), EngineState::Stopped);
    // four ticks, then the safe value on stop
    assert_eq!(
        values(&bench.board, LED),
        [true, true, true, true, false].map(Value::Bool).to_vec()
    );
    // done never fired; the buzzer only sees its safe value
    assert_eq!(values(&bench.board, BUZZER), vec![json!(false)]);
}

#[tokio::test(start_paused = true)]
async fn test_sequence_runs_steps_in_order() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("sequence")
            .node("start", "StartExperiment")
            .node("seq", "Sequence")
            .node("wait", "Delay")
            .with_property("duration", json!(1.0))
            .node("first", "Output")
            .with_device("led")
            .node("second", "Output")
            .with_device("buzzer")
            .connect("start", "next", "seq", "exec")
            .connect("seq", "then_0", "wait", "exec")
            .connect("wait", "next", "first", "exec")
            .connect("seq", "then_1", "second", "exec"),
    );

    bench.engine.start().await.unwrap();
    bench.engine.wait_until_idle().await;

    let first = bench.board.writes_to(LED);
    let second = bench.board.writes_to(BUZZER);
    assert_eq!((first.len(), second.len()), (1, 1));
    assert!(first[0].at >= Duration::from_secs(1));
    assert!(second[0].at >= first[0].at);
}

#[tokio::test(start_paused = true)]
async fn test_branch_takes_one_side() {
    for (condition, pin) in [(true, LED), (false, BUZZER)] {
        let bench = bench();
        load(
            &bench,
            GraphBuilder::new("branch")
                .node("start", "StartExperiment")
                .node("if", "Branch")
                .with_property("condition", json!(condition))
                .node("yes", "Output")
                .with_device("led")
                .node("no", "Output")
                .with_device("buzzer")
                .connect("start", "next", "if", "exec")
                .connect("if", "true", "yes", "exec")
                .connect("if", "false", "no", "exec"),
        );

        bench.engine.start().await.unwrap();
        bench.engine.wait_until_idle().await;
        let writes = bench.board.writes();
        assert_eq!(writes.len(), 1, "condition {}", condition);
        assert_eq!(writes[0].pin, pin);
    }
}

#[tokio::test(start_paused = true)]
async fn test_toggle_follows_the_entered_input() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("toggle")
            .node("start", "StartExperiment")
            .node("seq", "Sequence")
            .node("flip", "Toggle")
            .node("on", "Output")
            .with_device("led")
            .with_property("value", json!(true))
            .node("off", "Output")
            .with_device("led")
            .with_property("value", json!(false))
            .connect("start", "next", "seq", "exec")
            .connect("seq", "then_0", "flip", "toggle")
            .connect("seq", "then_1", "flip", "toggle")
            .connect("seq", "then_2", "flip", "set_on")
            .connect("seq", "then_3", "flip", "set_off")
            .connect("flip", "on", "on", "exec")
            .connect("flip", "off", "off", "exec"),
    );

    bench.engine.start().await.unwrap();
    bench.engine.wait_until_idle().await;
    assert_eq!(
        values(&bench.board, LED),
        [true, false, true, false].map(Value::Bool).to_vec()
    );
    assert_eq!(bench.engine.get_output("flip", 2).unwrap(), json!(false));
}

fn wait_graph(timeout: f64) -> GraphBuilder {
    GraphBuilder::new("wait")
        .node("start", "StartExperiment")
        .node("wait", "WaitForInput")
        .with_device("button")
        .with_property("timeout", json!(timeout))
        .with_property("poll_interval", json!(0.05))
        .node("pressed", "Output")
        .with_device("led")
        .node("gave_up", "Output")
        .with_device("buzzer")
        .connect("start", "next", "wait", "exec")
        .connect("wait", "triggered", "pressed", "exec")
        .connect("wait", "timeout", "gave_up", "exec")
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_button_press() {
    let bench = bench();
    load(&bench, wait_graph(0.0));
    bench
        .board
        .script_reads(BUTTON, [false, false, false, true].map(|v| Ok(json!(v))));

    bench.engine.start().await.unwrap();
    bench.engine.wait_until_idle().await;

    let pressed = bench.board.writes_to(LED);
    assert_eq!(pressed.len(), 1);
    assert!(pressed[0].at >= Duration::from_millis(150));
    assert!(bench.board.writes_to(BUZZER).is_empty());
    assert_eq!(bench.engine.get_output("wait", 2).unwrap(), json!(true));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_input_times_out() {
    let bench = bench();
    load(&bench, wait_graph(0.3));

    bench.engine.start().await.unwrap();
    bench.engine.wait_until_idle().await;

    assert!(bench.board.writes_to(LED).is_empty());
    let gave_up = bench.board.writes_to(BUZZER);
    assert_eq!(gave_up.len(), 1);
    assert!(gave_up[0].at >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_input_fails_after_repeated_read_errors() {
    let bench = bench();
    load(&bench, wait_graph(0.0));
    bench.board.script_reads(
        BUTTON,
        (0..3).map(|_| Err(HardwareError::device("glitch"))),
    );

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Error);

    let failure = bench.engine.last_error().unwrap();
    assert_eq!(failure.node_id.as_deref(), Some("wait"));
    assert!(failure.message.contains("Device polling failed after 3 consecutive errors"));
    // the failed run leaves outputs at their safe values
    assert_eq!(values(&bench.board, LED), vec![json!(false)]);
}

#[tokio::test(start_paused = true)]
async fn test_analog_reading_drives_pwm_through_map_range() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("dimmer")
            .node("start", "StartExperiment")
            .node("read", "AnalogRead")
            .with_device("pot")
            .node("scale", "MapRange")
            .node("drive", "Output")
            .with_device("motor")
            .connect("start", "next", "read", "exec")
            .connect("read", "next", "drive", "exec")
            .connect("read", "value", "scale", "value")
            .connect("scale", "result", "drive", "value"),
    );
    bench.board.set_pin_value(POT, json!(512));

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);

    let voltage = bench.engine.get_output("read", 2).unwrap().as_f64().unwrap();
    assert!((voltage - 2.5024).abs() < 1e-3);
    assert_eq!(values(&bench.board, MOTOR), vec![json!(128)]);
}

#[tokio::test]
async fn test_saved_graph_reloads_identically() {
    let bench = bench();
    load(&bench, wait_graph(2.5));
    let saved = bench.engine.description();

    let json = saved.to_json().unwrap();
    let restored = GraphDescription::from_json(&json).unwrap();
    assert_eq!(restored, saved);

    let other = self::bench();
    other.engine.load(&restored).unwrap();
    assert_eq!(other.engine.description(), saved);
    assert_eq!(other.engine.bound_device("wait"), None);
    assert_eq!(
        other.engine.node("wait").unwrap().device.as_deref(),
        Some("button")
    );
}

#[tokio::test(start_paused = true)]
async fn test_loop_waits_for_every_branch_of_its_body() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("fan-out body")
            .node("start", "StartExperiment")
            .node("loop", "Loop")
            .with_property("count", json!(2))
            .node("split", "Delay")
            .with_property("duration", json!(0.0))
            .node("blink", "Output")
            .with_device("led")
            .node("slow", "Delay")
            .with_property("duration", json!(1.0))
            .node("beep", "Output")
            .with_device("buzzer")
            .node("done", "Output")
            .with_device("motor")
            .with_property("value", json!(200))
            .connect("start", "next", "loop", "exec")
            .connect("loop", "body", "split", "exec")
            .connect("split", "next", "blink", "exec")
            .connect("split", "next", "slow", "exec")
            .connect("slow", "next", "beep", "exec")
            .connect("loop", "done", "done", "exec"),
    );

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);
    assert!(bench.engine.last_error().is_none());

    assert_eq!(values(&bench.board, LED), vec![json!(true), json!(true)]);
    let beeps = bench.board.writes_to(BUZZER);
    assert_eq!(beeps.len(), 2);
    assert!(beeps[1].at - beeps[0].at >= Duration::from_secs(1));

    let done = bench.board.writes_to(MOTOR);
    assert_eq!(done.len(), 1);
    assert!(done[0].at >= beeps[1].at);
    assert!(done[0].at >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_input_timeout_counts_slow_reads() {
    let bench = bench();
    load(&bench, wait_graph(0.5));
    bench.board.set_latency(Duration::from_millis(200));

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);

    assert!(bench.board.writes_to(LED).is_empty());
    let gave_up = bench.board.writes_to(BUZZER);
    assert_eq!(gave_up.len(), 1);
    // two 200ms reads and two polls reach the timeout; the write adds 200ms
    assert!(gave_up[0].at >= Duration::from_millis(500), "{:?}", gave_up[0].at);
    assert!(gave_up[0].at < Duration::from_secs(1), "{:?}", gave_up[0].at);
}

fn blink_function(builder: GraphBuilder, hold: f64) -> GraphBuilder {
    builder
        .node("fn", "StartFunction")
        .with_property("function_name", json!("Blink"))
        .node("on", "Output")
        .with_device("led")
        .node("hold", "Delay")
        .with_property("duration", json!(hold))
        .node("off", "Output")
        .with_device("led")
        .with_property("value", json!(false))
        .node("ret", "EndFunction")
        .connect("fn", "next", "on", "exec")
        .connect("on", "next", "hold", "exec")
        .connect("hold", "next", "off", "exec")
        .connect("off", "next", "ret", "exec")
}

#[tokio::test(start_paused = true)]
async fn test_function_call_runs_the_function_each_time() {
    let bench = bench();
    let graph = GraphBuilder::new("functions")
        .node("start", "StartExperiment")
        .node("first", "FunctionCall")
        .with_property("function_name", json!("Blink"))
        .node("second", "FunctionCall")
        .with_property("function_name", json!("Blink"))
        .node("after", "Output")
        .with_device("buzzer")
        .connect("start", "next", "first", "exec")
        .connect("first", "next", "second", "exec")
        .connect("second", "next", "after", "exec");
    load(&bench, blink_function(graph, 0.5));
    assert_eq!(bench.engine.entry_nodes(), vec!["start".to_string()]);
    assert!(bench.engine.validate().is_empty());

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);
    assert!(bench.engine.last_error().is_none());

    assert_eq!(
        values(&bench.board, LED),
        [true, false, true, false].map(Value::Bool).to_vec()
    );
    let last_led = bench.board.writes_to(LED).last().unwrap().at;
    let after = bench.board.writes_to(BUZZER);
    assert_eq!(after.len(), 1);
    assert!(after[0].at >= last_led);
    assert!(after[0].at >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_function_call_timeout_continues_without_the_function() {
    let bench = bench();
    let graph = GraphBuilder::new("slow function")
        .node("start", "StartExperiment")
        .node("call", "FunctionCall")
        .with_property("function_name", json!("Blink"))
        .with_property("timeout", json!(1.0))
        .node("after", "Output")
        .with_device("buzzer")
        .connect("start", "next", "call", "exec")
        .connect("call", "next", "after", "exec");
    load(&bench, blink_function(graph, 5.0));

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Stopped);

    let after = bench.board.writes_to(BUZZER);
    assert_eq!(after.len(), 1);
    assert!(after[0].at >= Duration::from_secs(1) && after[0].at < Duration::from_millis(1100));
    let error = bench.engine.node("call").unwrap().error.unwrap();
    assert!(error.contains("did not finish"), "{}", error);

    // the function itself still ran to its end
    let led = bench.board.writes_to(LED);
    assert_eq!(led.len(), 2);
    assert!(led[1].at >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_calling_a_missing_function_fails_the_run() {
    let bench = bench();
    load(
        &bench,
        GraphBuilder::new("missing")
            .node("start", "StartExperiment")
            .node("call", "FunctionCall")
            .with_property("function_name", json!("Nowhere"))
            .connect("start", "next", "call", "exec"),
    );

    bench.engine.start().await.unwrap();
    assert_eq!(bench.engine.wait_until_idle().await, EngineState::Error);
    let failure = bench.engine.last_error().unwrap();
    assert_eq!(failure.node_id.as_deref(), Some("call"));
    assert!(failure.message.contains("No function named"), "{}", failure.message);
}

fn timer_graph(enabled: bool) -> GraphBuilder {
    GraphBuilder::new("timer")
        .node("timer", "Timer")
        .with_property("interval", json!(0.5))
        .with_property("enabled", json!(enabled))
        .node("tick", "Output")
        .with_device("led")
        .connect("timer", "tick", "tick", "exec")
}

#[tokio::test(start_paused = true)]
async fn test_timer_ticks_until_stopped() {
    let bench = bench();
    load(&bench, timer_graph(true));

    bench.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(bench.engine.state(), EngineState::Running);
    assert_eq!(bench.engine.get_output("timer", 1).unwrap(), json!(3));

    assert_ok!(bench.engine.stop().await);
    assert_eq!(
        values(&bench.board, LED),
        [true, true, true, false].map(Value::Bool).to_vec()
    );
}

#[tokio::test(start_paused = true)]
async fn test_disabled_timer_stays_silent() {
    let bench = bench();
    load(&bench, timer_graph(false));

    bench.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(bench.engine.get_output("timer", 1).unwrap(), json!(0));
    assert!(bench.board.writes_to(LED).is_empty());

    bench.engine.set_input("timer", 1, json!(true)).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bench.engine.get_output("timer", 1).unwrap(), json!(1));
    assert_ok!(bench.engine.stop().await);
}
