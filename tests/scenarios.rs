//! End-to-end scenarios through the public API, against scripted devices

use std::sync::Arc;

use emx_devscript::{
    CacheStats, CompileErrorKind, Compiler, Engine, InstructionList, MapResolver, MemorySink,
    Outcome, RunStatus, RuntimeErrorKind, ScriptedSession, SessionEvent, State, StaticConfig,
};

fn compile(src: &str) -> InstructionList {
    Compiler::new(Arc::new(MapResolver::new()))
        .compile_source("main.dvs", src)
        .unwrap()
}

fn comments(state: &State) -> Vec<String> {
    state
        .log
        .lines()
        .filter_map(|l| l.strip_prefix("# "))
        .map(str::to_string)
        .collect()
}

fn fgt() -> ScriptedSession {
    ScriptedSession::new()
        .banner("FGT_A # ")
        .respond("get system status", "Version: FortiGate-60F v7.2.5\nSerial-Number: FGT60FTK0001")
        .respond("diagnose sys ha status", "HA Health Status: OK")
}

fn run_with(list: &InstructionList, engine: &Engine, session: ScriptedSession) -> (State, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let mut state = State::new(Arc::new(StaticConfig::new()), sink.clone())
        .with_test_case("scenario")
        .with_session("FGT_A", Box::new(session));
    engine.run(list, &mut state);
    (state, sink)
}

const STATUS_SCRIPT: &str = r#"[FGT_A]
get system status
expect -e "Version: \S+ (v[\d.]+)" -for 1001
setvar -e "Serial-Number: (\S+)" -to serial
check_var -name serial -pattern "^FGT60F" -for 1001
<if {$serial} eq FGT60FTK0001>
    diagnose sys ha status
    expect -e "Health Status: OK" -for 1002
<else>
    comment unexpected unit {$serial}
<fi>
report 1001
report 1002
"#;

#[test]
fn text_form_round_trips() {
    let list = compile(STATUS_SCRIPT);
    assert!(list.unresolved_target().is_none());
    let text = list.to_text();
    let back = InstructionList::from_text("main.dvs", &text).unwrap();
    assert_eq!(back.len(), list.len());
    for (a, b) in list.iter().zip(back.iter()) {
        assert_eq!(a.operation, b.operation);
        assert_eq!(a.params, b.params);
        assert_eq!(a.targets, b.targets);
    }
    assert_eq!(back.to_text(), text);
}

#[test]
fn runs_are_deterministic() {
    let list = compile(STATUS_SCRIPT);
    let engine = Engine::new();
    let (first, sink1) = run_with(&list, &engine, fgt());
    let (second, sink2) = run_with(&list, &engine, fgt());

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(sink1.outcomes(), sink2.outcomes());
    assert_eq!(first.log, second.log);
    assert_eq!(sink1.verdict("1001"), Some(true));
    assert_eq!(sink1.verdict("1002"), Some(true));
    assert_eq!(sink1.finalized(), vec!["1001", "1002"]);
    assert_eq!(first.var("serial"), Some("FGT60FTK0001"));
}

#[test]
fn only_the_true_alternative_dispatches() {
    let list = compile("<if 0>\ncomment A\n<elseif 1>\ncomment B\n<else>\ncomment C\n<fi>");
    let (state, _) = run_with(&list, &Engine::new(), fgt());
    assert_eq!(comments(&state), vec!["B"]);

    let list = compile("<if 1>\ncomment A\n<fi>\ncomment next");
    let (state, _) = run_with(&list, &Engine::new(), fgt());
    assert_eq!(comments(&state), vec!["A", "next"]);
    // no alternative: next and end both point one past fi
    assert_eq!(list.instructions[0].targets, vec![3, 3]);
}

#[test]
fn loop_body_runs_three_times() {
    let src = "intset count 0\n<loop {$count} lt 3>\ncomment body {$count}\nintchange count + 1\n<until {$count} eq 3>";
    let (state, _) = run_with(&compile(src), &Engine::new(), fgt());
    assert_eq!(comments(&state), vec!["body 0", "body 1", "body 2"]);

    // the entry condition is checked again right after the first pass
    let src = "intset count 2\n<loop {$count} lt 3>\ncomment body {$count}\nintchange count + 5\n<until {$count} eq 3>";
    let (state, _) = run_with(&compile(src), &Engine::new(), fgt());
    assert_eq!(comments(&state), vec!["body 2"]);
    assert_eq!(state.status, RunStatus::Completed);
}

#[test]
fn configuration_then_runtime_substitution() {
    let mut config = StaticConfig::new();
    config.set("X", "A");
    let src = "strset Y B\nintset i 0\n<while {$i} lt 2>\ncomment $X-{$Y}\nstrset Y C\nintchange i + 1\n<endwhile>";
    let mut state = State::new(Arc::new(config), Arc::new(MemorySink::new()));
    Engine::new().run(&compile(src), &mut state);
    assert_eq!(comments(&state), vec!["A-B", "A-C"]);
}

#[test]
fn unknown_operation_cites_line() {
    let err = Compiler::new(Arc::new(MapResolver::new()))
        .compile_source("main.dvs", "comment fine\nfoobar -x 1\ncomment never")
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnknownOperation);
    assert_eq!(err.line, 2);
    assert_eq!(err.file.as_deref(), Some("main.dvs"));
}

#[test]
fn missing_required_flag_is_named() {
    let err = Compiler::new(Arc::new(MapResolver::new()))
        .compile_source("main.dvs", "expect -t 5")
        .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::MissingRequiredParameter);
    assert!(err.message.contains("-e"), "{}", err.message);
}

#[test]
fn shared_include_compiles_once() {
    let resolver = MapResolver::new()
        .with("first.dvs", "include sameFile.txt\ncomment first")
        .with("second.dvs", "include sameFile.txt\ncomment second")
        .with("sameFile.txt", "[FGT_A]\nget system status");
    let compiler = Compiler::new(Arc::new(resolver));
    let first = compiler.compile_file("first.dvs").unwrap();
    let second = compiler.compile_file("second.dvs").unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 3);
    assert_eq!(compiler.cache().stats("sameFile.txt"), CacheStats { compiles: 1, uses: 2 });
}

#[test]
fn failed_wait_does_not_stop_report() {
    let src = "[FGT_A]\nget system status\nexpect -e \"Version: v9\" -for 1001\ncomment after\nreport 1001";
    let list = compile(src);
    let (state, sink) = run_with(&list, &Engine::new(), fgt());
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.errors[0].kind, RuntimeErrorKind::AssertionFailed);
    assert_eq!(state.errors[0].line, Some(3));
    let outcomes = sink.outcomes();
    let reported: Vec<&Outcome> = outcomes.iter().filter(|o| o.diagnostic.starts_with("report")).collect();
    assert_eq!(reported.len(), 1);
    assert!(!reported[0].passed);
    assert_eq!(sink.finalized(), vec!["1001"]);

    let (state, sink) = run_with(&list, &Engine::strict(), fgt());
    assert!(matches!(state.status, RunStatus::Failed(ref e) if e.kind == RuntimeErrorKind::AssertionFailed));
    assert!(sink.finalized().is_empty());
}

#[test]
fn retry_reissues_command() {
    let session = ScriptedSession::new()
        .respond("diagnose sys ha status", "HA Health Status: syncing")
        .respond("diagnose sys ha status", "HA Health Status: OK");
    let events = session.events();
    let src = "[FGT_A]\ndiagnose sys ha status\n\
               expect -e \"Status: OK\" -retry_command \"diagnose sys ha status\" -retry_cnt 2 -t 1 -for 1003";
    let (state, sink) = run_with(&compile(src), &Engine::new(), session);
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(sink.verdict("1003"), Some(true));
    let executes = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Execute(_)))
        .count();
    assert_eq!(executes, 2);
    assert_eq!(events.lock().unwrap().last(), Some(&SessionEvent::Disconnect));
}

#[test]
fn sessions_connect_lazily() {
    let session = fgt();
    let events = session.events();
    let list = compile("comment before\n[FGT_A]\nget system status");
    let sink = Arc::new(MemorySink::new());
    let mut state = State::new(Arc::new(StaticConfig::new()), sink).with_session("FGT_A", Box::new(session));
    Engine::new().run(&list, &mut state);
    let events = events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&SessionEvent::Connect));
    assert_eq!(events.len(), 3);
}
