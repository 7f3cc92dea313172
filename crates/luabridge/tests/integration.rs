//! End-to-end scenarios across engine, session, registry and marshaller.
//!
//! A. Value round trips through script calls
//! B. Method adaptation and arity failures
//! C. Exposed structs: fields, nested structs, indirection, finalization
//! D. Engine lock serialization across threads
//! E. Load and runtime errors with stack traces
//! F. Task queue isolation
//! G. Script files and persistent function references

use luabridge::{
    AccessError, BridgeConfig, CoercionError, Describe, Engine, Error, Exposed, HostStruct, Kind,
    Opaque, ScriptType, ScriptValue, Session, StatusCode,
};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Default)]
struct Person {
    name: String,
    age: u32,
    score: f64,
    nickname: Option<String>,
}

impl HostStruct for Person {
    fn describe(d: &mut Describe<Self>) {
        d.field("Name", |p| &mut p.name)
            .field("Age", |p| &mut p.age)
            .field("Score", |p| &mut p.score)
            .field_ref("Nickname", |p| p.nickname.as_mut())
            .method("F", |p: &mut Person, a: i64, b: String| {
                (format!("{}:{b}", p.name), a * 2)
            })
            .method("Birthday", |p: &mut Person| {
                p.age += 1;
            })
            .method("Secret", |p: &mut Person| (Opaque(p.age), i64::from(p.age)));
    }
}

#[derive(Debug)]
struct Team {
    leader: Exposed<Person>,
}

impl HostStruct for Team {
    fn describe(d: &mut Describe<Self>) {
        d.field("Leader", |t| &mut t.leader);
    }
}

#[derive(Debug, Default)]
struct Tally {
    total: i64,
}

impl HostStruct for Tally {
    fn describe(d: &mut Describe<Self>) {
        d.field("Total", |t| &mut t.total)
            .method("Absorb", |t: &mut Tally, other: Exposed<Tally>| {
                t.total += other.lock().total;
                t.total
            });
    }
}

#[derive(Debug, Default)]
struct Blob {
    flag: bool,
    data: Vec<u8>,
}

impl HostStruct for Blob {
    fn describe(d: &mut Describe<Self>) {
        d.field("Flag", |b| &mut b.flag)
            .field("Data", |b| &mut b.data)
            .method("Both", |b: &mut Blob| (b.flag, b.data.clone()));
    }
}

fn engine() -> Engine {
    Engine::with_defaults().unwrap()
}

fn person(name: &str) -> Exposed<Person> {
    Exposed::new(Person {
        name: name.to_string(),
        ..Person::default()
    })
}

// =============================================================================
// A. Round trips
// =============================================================================

#[test]
fn values_round_trip_through_a_script_call() {
    let engine = engine();
    let s = engine.lock();
    s.do_string("function echo(...) return ... end").unwrap();

    let sent = vec![
        ScriptValue::Boolean(true),
        ScriptValue::Integer(-7),
        ScriptValue::Number(2.5),
        ScriptValue::from("text"),
        ScriptValue::String(b"\x00\x01\xfe".as_slice().into()),
    ];
    let received = s.call_global("echo", sent.clone(), None).unwrap();
    assert_eq!(received, sent);
}

#[test]
fn accessors_read_back_what_was_pushed() {
    let engine = engine();
    let s = engine.lock();
    s.push_boolean(false);
    s.push_integer(i64::MIN);
    s.push_number(-0.25);
    s.push_string("héllo");
    s.push_bytes(&[0xff, 0x00]);

    assert_eq!(s.to_boolean(1), Ok(false));
    assert_eq!(s.to_integer(2), Ok(i64::MIN));
    assert_eq!(s.to_number(3), Ok(-0.25));
    assert_eq!(s.to_string(4), Ok("héllo".to_string()));
    assert_eq!(s.to_bytes(5), Ok(vec![0xff, 0x00]));

    assert_eq!(
        s.to_boolean(2),
        Err(CoercionError::Mismatch {
            expected: Kind::Bool,
            found: ScriptType::Number
        })
    );
    assert!(s.to_integer(4).is_err());
    assert!(s.to_string(1).is_err());
}

#[test]
fn host_function_receives_arguments_and_returns_results() {
    let engine = engine();
    engine
        .register_function("add", |s: &Session<'_>| {
            let a = s.to_integer(1)?;
            let b = s.to_integer(2)?;
            s.push_integer(a + b);
            Ok(1)
        })
        .unwrap();

    let s = engine.lock();
    assert_eq!(s.eval("return add(2, 3)").unwrap(), vec![ScriptValue::Integer(5)]);

    // A coercion failure inside the function yields zero results.
    assert_eq!(
        s.eval("return select('#', add(2, 'x'))").unwrap(),
        vec![ScriptValue::Integer(0)]
    );
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::Coercion(CoercionError::Mismatch {
            expected: Kind::I64,
            found: ScriptType::String
        }))
    ));
}

#[test]
fn host_function_faults_become_script_errors() {
    let engine = engine();
    engine
        .register_function("fail", |_s: &Session<'_>| {
            Err(Error::Config("not today".to_string()))
        })
        .unwrap();
    let err = engine.do_string("fail()").unwrap_err();
    let script = err.script_error().unwrap();
    assert!(script.message.contains("not today"), "{}", script.message);

    // Scripts can catch them like any other error.
    let s = engine.lock();
    assert_eq!(
        s.eval("return (pcall(fail))").unwrap(),
        vec![ScriptValue::Boolean(false)]
    );
}

// =============================================================================
// B. Method adaptation
// =============================================================================

#[test]
fn method_with_matching_arguments_returns_tuple() {
    let engine = engine();
    engine.expose("Obj", &person("p")).unwrap();
    let s = engine.lock();
    let results = s.eval("return Obj:F(1, 'x')").unwrap();
    assert_eq!(
        results,
        vec![ScriptValue::from("p:x"), ScriptValue::Integer(2)]
    );
}

#[test]
fn method_with_mismatched_arguments_returns_nothing() {
    let engine = engine();
    engine.expose("Obj", &person("p")).unwrap();
    let s = engine.lock();
    let results = s.eval("return select('#', Obj:F('a', 'b'))").unwrap();
    assert_eq!(results, vec![ScriptValue::Integer(0)]);
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::Coercion(CoercionError::Mismatch {
            expected: Kind::I64,
            found: ScriptType::String
        }))
    ));
}

#[test]
fn method_with_missing_argument_returns_nothing() {
    let engine = engine();
    engine.expose("Obj", &person("p")).unwrap();
    let s = engine.lock();
    assert_eq!(
        s.eval("return select('#', Obj:F(1))").unwrap(),
        vec![ScriptValue::Integer(0)]
    );
}

#[test]
fn mutating_method_is_visible_to_host() {
    let engine = engine();
    let p = person("p");
    engine.expose("Obj", &p).unwrap();
    engine.do_string("Obj:Birthday(); Obj:Birthday()").unwrap();
    assert_eq!(p.lock().age, 2);
}

#[test]
fn unmapped_results_are_skipped() {
    let engine = engine();
    let p = person("p");
    p.lock().age = 40;
    engine.expose("Obj", &p).unwrap();
    let s = engine.lock();
    assert_eq!(
        s.eval("return Obj:Secret()").unwrap(),
        vec![ScriptValue::Integer(40)]
    );
}

#[test]
fn struct_argument_of_the_same_type_is_accepted() {
    let engine = engine();
    let a = Exposed::new(Tally { total: 2 });
    let b = Exposed::new(Tally { total: 5 });
    engine.expose("A", &a).unwrap();
    engine.expose("B", &b).unwrap();
    let s = engine.lock();
    assert_eq!(
        s.eval("return A:Absorb(B)").unwrap(),
        vec![ScriptValue::Integer(7)]
    );
    assert_eq!(a.lock().total, 7);
    assert_eq!(b.lock().total, 5);
}

#[test]
fn receiver_passed_as_its_own_argument_returns_nothing() {
    let engine = engine();
    let a = Exposed::new(Tally { total: 3 });
    engine.expose("A", &a).unwrap();
    let s = engine.lock();
    assert_eq!(
        s.eval("return select('#', A:Absorb(A))").unwrap(),
        vec![ScriptValue::Integer(0)]
    );
    assert_eq!(
        s.take_access_failure(),
        Some(AccessError::AliasedReceiver {
            type_name: "Tally",
            method: "Absorb".to_string(),
        })
    );
    assert_eq!(a.lock().total, 3);

    // The receiver is still usable afterwards.
    assert_eq!(
        s.eval("return A.Total").unwrap(),
        vec![ScriptValue::Integer(3)]
    );
}

#[test]
fn method_adapters_are_released_on_collection() {
    let engine = engine();
    let handle = engine.expose("Obj", &person("p")).unwrap();
    let s = engine.lock();
    s.do_string("for i = 1, 50 do Obj:F(i, 'x') end").unwrap();
    s.collect_garbage().unwrap();
    // Only the exposed struct itself is still referenced.
    assert_eq!(engine.registry().len(), 1);
    assert!(engine.registry().contains(handle));
}

// =============================================================================
// C. Exposed structs
// =============================================================================

#[test]
fn expose_and_read_field() {
    let engine = engine();
    engine.expose("Obj", &person("X")).unwrap();
    let s = engine.lock();
    assert_eq!(
        s.eval("return Obj.Name").unwrap(),
        vec![ScriptValue::from("X")]
    );
}

#[test]
fn field_writes_are_kind_checked() {
    let engine = engine();
    let p = person("p");
    engine.expose("Obj", &p).unwrap();
    let s = engine.lock();

    s.do_string("Obj.Age = 31; Obj.Score = 1.5").unwrap();
    assert_eq!(p.lock().age, 31);
    assert_eq!(p.lock().score, 1.5);

    s.do_string("Obj.Age = 'old'").unwrap();
    assert_eq!(p.lock().age, 31);
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::Coercion(_))
    ));

    s.do_string("Obj.Age = 2.5").unwrap();
    assert_eq!(p.lock().age, 31);

    s.do_string("Obj.Missing = 1").unwrap();
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::NoSuchMember { .. })
    ));
}

#[test]
fn bool_and_byte_fields_cross_both_ways() {
    let engine = engine();
    let blob = Exposed::new(Blob {
        flag: true,
        data: vec![0x41, 0x00, 0x42],
    });
    engine.expose("Obj", &blob).unwrap();
    let s = engine.lock();

    let read = s.eval("return Obj.Flag, Obj.Data").unwrap();
    assert_eq!(read[0], ScriptValue::Boolean(true));
    assert_eq!(read[1].as_bytes(), Some(&b"A\0B"[..]));

    let both = s.eval("return Obj:Both()").unwrap();
    assert_eq!(both.len(), 2);
    assert_eq!(both[0].as_boolean(), Some(true));
    assert_eq!(both[1].as_bytes(), Some(&b"A\0B"[..]));

    s.do_string(r#"Obj.Flag = false; Obj.Data = "\0\255""#).unwrap();
    assert!(!blob.lock().flag);
    assert_eq!(blob.lock().data, vec![0, 255]);
    assert_eq!(
        s.eval("return #Obj.Data, Obj.Data:byte(2)").unwrap(),
        vec![ScriptValue::Integer(2), ScriptValue::Integer(255)]
    );

    s.do_string("Obj.Flag = 1").unwrap();
    assert!(!blob.lock().flag);
    assert_eq!(
        s.take_access_failure(),
        Some(AccessError::Coercion(CoercionError::Mismatch {
            expected: Kind::Bool,
            found: ScriptType::Number,
        }))
    );
}

#[test]
fn nested_struct_fields_resolve_through_new_handles() {
    let engine = engine();
    let leader = person("L");
    let team = Exposed::new(Team {
        leader: leader.clone(),
    });
    engine.expose("T", &team).unwrap();
    engine.do_string("T.Leader.Name = 'Lead'").unwrap();
    assert_eq!(leader.lock().name, "Lead");
    let s = engine.lock();
    assert_eq!(
        s.eval("return T.Leader.Name").unwrap(),
        vec![ScriptValue::from("Lead")]
    );
}

#[test]
fn indirect_field_reads_nil_when_unset() {
    let engine = engine();
    let p = person("p");
    engine.expose("Obj", &p).unwrap();
    let s = engine.lock();
    assert_eq!(s.eval("return Obj.Nickname").unwrap(), vec![ScriptValue::Nil]);
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::NilField(ref f)) if f == "Nickname"
    ));

    p.lock().nickname = Some("pp".to_string());
    s.do_string("Obj.Nickname = 'qq'").unwrap();
    assert_eq!(p.lock().nickname.as_deref(), Some("qq"));
}

#[test]
fn struct_passes_back_into_host_function() {
    let engine = engine();
    let p = person("p");
    engine.expose("Obj", &p).unwrap();
    engine
        .register_function("rename", |s: &Session<'_>| {
            let target = s.to_struct(1)?;
            let new_name = s.to_string(2)?;
            if let Some(person) = target.downcast::<Person>() {
                person.lock().name = new_name;
            }
            Ok(0)
        })
        .unwrap();
    engine.do_string("rename(Obj, 'renamed')").unwrap();
    assert_eq!(p.lock().name, "renamed");
}

#[test]
fn finalized_handle_reads_as_failed_access() {
    let engine = engine();
    let p = person("X");
    let handle = engine.expose("Obj", &p).unwrap();
    let s = engine.lock();

    assert!(s.finalize_handle(handle));
    assert!(!engine.registry().contains(handle));

    let err = s.get_handle_field(handle, "Name").unwrap_err();
    assert!(matches!(
        err,
        Error::Access(AccessError::UnknownHandle(h)) if h == handle
    ));
    assert_eq!(s.eval("return Obj.Name").unwrap(), vec![ScriptValue::Nil]);
    assert!(matches!(
        s.take_access_failure(),
        Some(AccessError::UnknownHandle(_))
    ));
    // The host still owns the value.
    assert_eq!(p.lock().name, "X");
}

#[test]
fn collected_handle_is_released() {
    let engine = engine();
    let handle = engine.expose("Obj", &person("X")).unwrap();
    let s = engine.lock();
    s.do_string("Obj = nil").unwrap();
    s.collect_garbage().unwrap();
    assert!(!engine.registry().contains(handle));
    assert!(s.get_handle_field(handle, "Name").is_err());
}

#[test]
fn calling_a_struct_is_a_script_error() {
    let engine = engine();
    engine.expose("Obj", &person("X")).unwrap();
    let err = engine.do_string("Obj()").unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}

// =============================================================================
// D. Engine lock
// =============================================================================

#[test]
fn lock_serializes_push_and_read() {
    let engine = engine();
    let threads: Vec<_> = (0..8_i64)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let value = t * 1_000 + i;
                    let s = engine.lock();
                    s.push_integer(value);
                    thread::yield_now();
                    assert_eq!(s.to_integer(-1), Ok(value));
                    s.pop(1).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(engine.lock().get_top(), 0);
}

#[test]
fn separate_engines_run_in_parallel() {
    let finished = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let engine = engine();
                let s = engine.lock();
                let sum = s
                    .eval("local t = 0 for i = 1, 1000 do t = t + i end return t")
                    .unwrap();
                assert_eq!(sum, vec![ScriptValue::Integer(500_500)]);
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(finished.load(Ordering::SeqCst), 4);
}

// =============================================================================
// E. Errors
// =============================================================================

#[test]
fn runtime_error_carries_trace_innermost_first() {
    let engine = engine();
    let source = "function inner() error('boom') end\nfunction outer() inner() end\nouter()";
    let err = engine.lock().do_named("trace", source).unwrap_err();
    let Error::Runtime(script) = err else {
        panic!("expected runtime error, got {err:?}");
    };
    assert_eq!(script.code, StatusCode::Runtime);
    assert_eq!(script.message, "trace:1: boom");

    let names: Vec<&str> = script.stack_trace.iter().map(|e| e.name.as_str()).collect();
    let inner = names.iter().position(|n| *n == "inner").unwrap();
    let outer = names.iter().position(|n| *n == "outer").unwrap();
    assert!(inner < outer, "{names:?}");
    assert_eq!(script.stack_trace[inner].current_line, 1);
    assert_eq!(script.stack_trace[inner].short_source, "trace");
}

#[test]
fn load_error_has_no_trace() {
    let engine = engine();
    let err = engine.do_string("return +").unwrap_err();
    let Error::Load(script) = err else {
        panic!("expected load error, got {err:?}");
    };
    assert_eq!(script.code, StatusCode::Syntax);
    assert!(script.stack_trace.is_empty());
    assert!(!script.message.is_empty());
}

#[test]
fn error_objects_are_described() {
    let engine = engine();
    let err = engine.do_string("error({})").unwrap_err();
    assert_eq!(
        err.script_error().unwrap().message,
        "(error object is a table value)"
    );
}

// =============================================================================
// F. Task queue
// =============================================================================

#[test]
fn failing_and_panicking_tasks_do_not_stop_the_worker() {
    let engine = engine();
    engine
        .submit(|_s: &Session<'_>| Err(anyhow::anyhow!("task error")))
        .unwrap();
    engine
        .submit(|_s: &Session<'_>| -> anyhow::Result<()> { panic!("task panic") })
        .unwrap();
    engine
        .submit(|s: &Session<'_>| {
            s.push_integer(1);
            s.do_string("done = true")?;
            Ok(())
        })
        .unwrap();

    let handle = engine.clone();
    engine.close();

    let stats = handle.task_stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.panicked, 1);

    let s = handle.lock();
    assert_eq!(s.eval("return done").unwrap(), vec![ScriptValue::Boolean(true)]);
    // Values a task leaves on the stack are discarded.
    assert_eq!(s.get_top(), 0);
}

#[test]
fn tasks_run_in_submission_order() {
    let engine = engine();
    engine.do_string("log = {}").unwrap();
    for i in 0..10 {
        engine
            .submit(move |s: &Session<'_>| {
                s.do_string(&format!("table.insert(log, {i})"))?;
                Ok(())
            })
            .unwrap();
    }
    let handle = engine.clone();
    engine.close();
    let s = handle.lock();
    assert_eq!(
        s.eval("return table.concat(log, ',')").unwrap(),
        vec![ScriptValue::from("0,1,2,3,4,5,6,7,8,9")]
    );
}

#[test]
fn worker_can_be_disabled_by_config() {
    let config = BridgeConfig::from_toml_str("[worker]\nenabled = false\n").unwrap();
    let engine = Engine::new(config).unwrap();
    assert!(
        engine
            .submit(|_s: &Session<'_>| Ok(()))
            .is_err()
    );
}

// =============================================================================
// G. Files and references
// =============================================================================

#[test]
fn do_file_runs_script_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "answer = 6 * 7").unwrap();

    let engine = engine();
    let s = engine.lock();
    s.do_file(file.path()).unwrap();
    assert_eq!(s.eval("return answer").unwrap(), vec![ScriptValue::Integer(42)]);
}

#[test]
fn do_file_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.lua");
    let engine = engine();
    let err = engine.lock().do_file(&missing).unwrap_err();
    assert!(matches!(err, Error::Io { ref path, .. } if *path == missing));
}

#[test]
fn function_reference_outlives_global() {
    let engine = engine();
    let s = engine.lock();
    s.do_string("function triple(x) return x * 3 end").unwrap();
    s.get_global("triple").unwrap();
    let function = s.to_function_ref(-1).unwrap();
    s.pop(1).unwrap();
    s.do_string("triple = nil").unwrap();
    s.collect_garbage().unwrap();

    let results = s
        .call_ref(&function, [ScriptValue::Integer(5)], Some(1))
        .unwrap();
    assert_eq!(results, vec![ScriptValue::Integer(15)]);
}

#[test]
fn script_callback_stored_by_host_function() {
    let engine = engine();
    let stored = Arc::new(parking_lot::Mutex::new(None));
    let sink = Arc::clone(&stored);
    engine
        .register_function("on_event", move |s: &Session<'_>| {
            *sink.lock() = Some(s.to_function_ref(1)?);
            Ok(0)
        })
        .unwrap();
    engine
        .do_string("on_event(function(n) return 'got ' .. n end)")
        .unwrap();

    let callback = stored.lock().take().unwrap();
    let s = engine.lock();
    assert_eq!(
        s.call_ref(&callback, [ScriptValue::Integer(3)], None).unwrap(),
        vec![ScriptValue::from("got 3")]
    );
}
