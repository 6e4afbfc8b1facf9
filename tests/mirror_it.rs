//! End-to-end scenarios against the in-memory mock controller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;

use plc_mirror::adapters::transport::mock::MockTransport;
use plc_mirror::symbols::events::{EVENT_REINITIALIZED, EVENT_SET, EVENT_SOURCE_CHANGED};
use plc_mirror::{
    Coordinator, Dimension, EnumField, MirrorError, MirrorSettings, Pointer, RawChild,
    RawSymbolDescriptor, RawTypeDescriptor, RpcResult, SymbolKind, Transport, Value, WireKind,
};

const GROUP: u32 = 0x4020;
const PROBE_PATH: &str = "SystemInfo.AppTimestamp";

fn child(member: &str, type_name: &str, offset: u32) -> RawChild {
    RawChild {
        member_name: member.to_string(),
        type_name: type_name.to_string(),
        offset,
        attributes: Vec::new(),
    }
}

fn symbol(path: &str, type_name: &str, offset: u32, size: u32) -> RawSymbolDescriptor {
    RawSymbolDescriptor {
        full_path: path.to_string(),
        type_name: type_name.to_string(),
        pointer: Pointer::new(GROUP, offset, size),
        attributes: Vec::new(),
    }
}

/// The reference program:
///
/// ```text
/// MAIN.booleanValue    BOOL                       = TRUE
/// MAIN.numericValue    INT                        = 10
/// MAIN.structuredValue ST_Sub                     = { 0.0, 'hello world' }
/// MAIN.arrayValue      ARRAY [0..9] OF STRING(80) = 'a'..'h','j', ''
/// MAIN.lockedValue     ST_Locked (read-only str)  = { 1.5, 'frozen' }
/// MAIN.ptrStruct       ST_Ptr (pointer members)   -- never bindable
/// MAIN.mode            E_Mode                     = Run
/// MAIN.motor           FB_Motor (rpc: Reset)
/// MAIN.bigCounter      ULINT
/// GVL.limited          T_Limited (0..100)
/// ```
fn mock_with_program() -> Arc<MockTransport> {
    let mock = Arc::new(MockTransport::new());

    let mut string80 = RawTypeDescriptor::primitive("STRING(80)", WireKind::String, 81);
    string80.parent_name = "STRING".to_string();
    mock.insert_data_type(string80);

    let mut st_sub = RawTypeDescriptor::primitive("ST_Sub", WireKind::Composite, 85);
    st_sub.children = vec![
        child("realValue", "REAL", 0),
        child("stringValue", "STRING(80)", 4),
    ];
    mock.insert_data_type(st_sub);

    let mut st_locked = RawTypeDescriptor::primitive("ST_Locked", WireKind::Composite, 85);
    let mut locked_string = child("stringValue", "STRING(80)", 4);
    locked_string.attributes = vec![("ReadOnly".to_string(), String::new())];
    st_locked.children = vec![child("realValue", "REAL", 0), locked_string];
    mock.insert_data_type(st_locked);

    let mut st_ptr = RawTypeDescriptor::primitive("ST_Ptr", WireKind::Composite, 16);
    st_ptr.children = vec![
        child("target", "POINTER TO INT", 0),
        child("alias", "REFERENCE TO BYTE", 8),
    ];
    mock.insert_data_type(st_ptr);

    let mut array = RawTypeDescriptor::primitive("ARRAY [0..9] OF STRING(80)", WireKind::String, 810);
    array.parent_name = "STRING(80)".to_string();
    array.array_dimensions = vec![Dimension {
        start_index: 0,
        length: 10,
    }];
    mock.insert_data_type(array);

    let mut e_mode = RawTypeDescriptor::primitive("E_Mode", WireKind::Int16, 2);
    e_mode.parent_name = "INT".to_string();
    e_mode.enum_fields = vec![
        EnumField {
            name: "Idle".to_string(),
            raw: vec![0, 0],
        },
        EnumField {
            name: "Run".to_string(),
            raw: vec![1, 0],
        },
        EnumField {
            name: "Fault".to_string(),
            raw: vec![2, 0],
        },
    ];
    mock.insert_data_type(e_mode);

    let mut fb_motor = RawTypeDescriptor::primitive("FB_Motor", WireKind::Composite, 4);
    fb_motor.children = vec![child("status", "INT", 0), child("speed", "INT", 2)];
    fb_motor.rpc_method_names = vec!["Reset".to_string()];
    mock.insert_data_type(fb_motor);

    let mut limited = RawTypeDescriptor::primitive("T_Limited", WireKind::Int16, 2);
    limited.parent_name = "INT".to_string();
    limited.attributes = vec![
        ("LowerBorder".to_string(), "0".to_string()),
        ("UpperBorder".to_string(), "100".to_string()),
    ];
    mock.insert_data_type(limited);

    mock.insert_symbol(symbol("MAIN.booleanValue", "BOOL", 0, 1));
    mock.insert_symbol(symbol("MAIN.numericValue", "INT", 2, 2));
    mock.insert_symbol(symbol("MAIN.structuredValue", "ST_Sub", 8, 85));
    mock.insert_symbol(symbol("MAIN.arrayValue", "ARRAY [0..9] OF STRING(80)", 96, 810));
    mock.insert_symbol(symbol("MAIN.lockedValue", "ST_Locked", 912, 85));
    mock.insert_symbol(symbol("MAIN.ptrStruct", "ST_Ptr", 1000, 16));
    mock.insert_symbol(symbol("MAIN.mode", "E_Mode", 1100, 2));
    mock.insert_symbol(symbol("MAIN.motor", "FB_Motor", 1200, 4));
    mock.insert_symbol(symbol("MAIN.bigCounter", "ULINT", 1300, 8));
    mock.insert_symbol(symbol("GVL.limited", "T_Limited", 2000, 2));

    mock.load_memory(GROUP, 0, &[1]);
    mock.load_memory(GROUP, 2, &10i16.to_le_bytes());
    mock.load_memory(GROUP, 8, &0.0f32.to_le_bytes());
    mock.load_memory(GROUP, 12, b"hello world\0");
    for (i, text) in ["a", "b", "c", "d", "e", "f", "g", "h", "j"].iter().enumerate() {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        mock.load_memory(GROUP, 96 + (i as u32) * 81, &bytes);
    }
    mock.load_memory(GROUP, 912, &1.5f32.to_le_bytes());
    mock.load_memory(GROUP, 916, b"frozen\0");
    mock.load_memory(GROUP, 1100, &[1, 0]);
    mock.load_memory(GROUP, 1300, &42u64.to_le_bytes());
    mock.load_memory(GROUP, 2000, &7i16.to_le_bytes());

    mock.update_system_value(PROBE_PATH, &1u64.to_le_bytes());
    mock
}

async fn start(mock: &Arc<MockTransport>) -> Arc<Coordinator> {
    let coordinator =
        Coordinator::new(Arc::clone(mock) as Arc<dyn Transport>, MirrorSettings::default());
    coordinator.initialize().await.unwrap();
    coordinator
}

fn expect_strings(values: &[&str]) -> Value {
    Value::Array(values.iter().map(|s| Value::from(*s)).collect())
}

async fn settle() {
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn reading_main_yields_the_reference_values() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let main = coordinator.namespace("MAIN").unwrap();
    assert_eq!(main.kind(), SymbolKind::Namespace);

    let mut keys = Vec::new();
    main.each(|key, _| keys.push(key.to_string()));
    assert_eq!(
        keys,
        vec![
            "arrayValue",
            "bigCounter",
            "booleanValue",
            "lockedValue",
            "mode",
            "motor",
            "numericValue",
            "structuredValue",
        ]
    );
    let value = main.get().await.unwrap();
    let fields = value.as_struct().unwrap();

    assert_eq!(fields["booleanValue"], Value::Bool(true));
    assert_eq!(fields["numericValue"], Value::Int(10));
    assert_eq!(fields["mode"], Value::from("E_Mode.Run"));
    assert_eq!(fields["bigCounter"], Value::UInt(42));

    let structured = fields["structuredValue"].as_struct().unwrap();
    assert_eq!(structured["realValue"], Value::Float(0.0));
    assert_eq!(structured["stringValue"], Value::from("hello world"));

    assert_eq!(
        fields["arrayValue"],
        expect_strings(&["a", "b", "c", "d", "e", "f", "g", "h", "j", ""])
    );
}

#[tokio::test]
async fn clearing_a_struct_restores_defaults() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let structured = coordinator.symbol("MAIN.structuredValue").unwrap();
    structured.clear().await.unwrap();

    let value = structured.get().await.unwrap();
    let fields = value.as_struct().unwrap();
    assert_eq!(fields["realValue"], Value::Float(0.0));
    assert_eq!(fields["stringValue"], Value::from(""));
}

#[tokio::test]
async fn leaf_writes_round_trip() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let numeric = coordinator.symbol("MAIN.numericValue").unwrap();
    numeric.set(Value::Int(5)).await.unwrap();
    assert_eq!(numeric.get().await.unwrap(), Value::Int(5));

    let boolean = coordinator.symbol("MAIN.booleanValue").unwrap();
    boolean.set(Value::Bool(false)).await.unwrap();
    assert_eq!(boolean.get().await.unwrap(), Value::Bool(false));
}

#[tokio::test]
async fn partial_array_writes_leave_the_tail_untouched() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let array = coordinator.symbol("MAIN.arrayValue").unwrap();
    array
        .set(expect_strings(&["1", "2", "3"]))
        .await
        .unwrap();

    assert_eq!(
        array.get().await.unwrap(),
        expect_strings(&["1", "2", "3", "d", "e", "f", "g", "h", "j", ""])
    );
}

#[tokio::test]
async fn clear_skips_read_only_members_but_clears_siblings() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let locked = coordinator.symbol("MAIN.lockedValue").unwrap();
    locked.clear().await.unwrap();

    let value = locked.get().await.unwrap();
    let fields = value.as_struct().unwrap();
    assert_eq!(fields["realValue"], Value::Float(0.0));
    assert_eq!(fields["stringValue"], Value::from("frozen"));

    let frozen = coordinator.symbol("MAIN.lockedValue.stringValue").unwrap();
    assert!(frozen.read_only());
    let err = frozen.set(Value::from("thaw")).await.unwrap_err();
    assert!(matches!(err, MirrorError::ReadOnly { .. }));
    let err = frozen.clear().await.unwrap_err();
    assert!(matches!(err, MirrorError::ReadOnly { .. }));
}

#[tokio::test]
async fn pointer_structs_never_reach_the_graph() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    assert!(coordinator.symbol("MAIN.ptrStruct").is_none());
    // Non-pointer siblings are unaffected.
    assert!(coordinator.symbol("MAIN.numericValue").is_some());
}

#[tokio::test]
async fn numeric_bounds_are_enforced_on_write() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let limited = coordinator.symbol("GVL.limited").unwrap();
    assert_eq!(limited.get().await.unwrap(), Value::Int(7));

    limited.set(Value::Int(100)).await.unwrap();
    let err = limited.set(Value::Int(101)).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
    let err = limited.set(Value::Bool(true)).await.unwrap_err();
    assert!(matches!(err, MirrorError::InvalidType { .. }));
}

#[tokio::test]
async fn unsigned_64_bit_values_mask_the_sign_on_read() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let big = coordinator.symbol("MAIN.bigCounter").unwrap();
    big.set(Value::UInt(u64::MAX)).await.unwrap();
    assert_eq!(big.get().await.unwrap(), Value::UInt(u64::MAX));

    let err = big.set(Value::Int(-1)).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
}

#[tokio::test]
async fn enum_writes_require_qualified_members() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let mode = coordinator.symbol("MAIN.mode").unwrap();
    assert_eq!(mode.get().await.unwrap(), Value::from("E_Mode.Run"));

    mode.set(Value::from("E_Mode.Fault")).await.unwrap();
    assert_eq!(mode.get().await.unwrap(), Value::from("E_Mode.Fault"));

    let err = mode.set(Value::from("Run")).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
    let err = mode.set(Value::from("E_Mode.Missing")).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
}

#[tokio::test]
async fn structural_mismatches_are_invalid_type() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let structured = coordinator.symbol("MAIN.structuredValue").unwrap();
    let err = structured.set(Value::Int(1)).await.unwrap_err();
    assert!(matches!(err, MirrorError::InvalidType { .. }));

    let mut unknown = IndexMap::new();
    unknown.insert("missing".to_string(), Value::Int(1));
    let err = structured.set(Value::Struct(unknown)).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));

    let array = coordinator.symbol("MAIN.arrayValue").unwrap();
    let eleven = Value::Array(vec![Value::from("x"); 11]);
    let err = array.set(eleven).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));

    // STRING(80) rejects 81 code units.
    let element = coordinator.symbol("MAIN.arrayValue[0]").unwrap();
    element.set(Value::from("y".repeat(80))).await.unwrap();
    let err = element.set(Value::from("y".repeat(81))).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
}

#[tokio::test]
async fn composite_reads_split_at_the_transport_cap() {
    let mock = mock_with_program();
    let settings = MirrorSettings {
        max_items_per_request: 4,
        ..MirrorSettings::default()
    };
    let coordinator =
        Coordinator::new(Arc::clone(&mock) as Arc<dyn Transport>, settings);
    coordinator.initialize().await.unwrap();

    let main = coordinator.namespace("MAIN").unwrap();
    let leaf_count = main.read_package_count();
    assert_eq!(leaf_count, 20);

    mock.clear_call_log();
    main.get().await.unwrap();

    assert_eq!(mock.read_call_sizes(), vec![4, 4, 4, 4, 4]);
}

#[tokio::test]
async fn subscriptions_schedule_reads_and_are_idempotent() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let numeric = coordinator.symbol("MAIN.numericValue").unwrap();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    numeric
        .subscribe(None, Arc::new(move |value| seen_cb.lock().push(value)))
        .await
        .unwrap();
    let subs_after_first = mock.subscription_count();
    numeric
        .subscribe(None, Arc::new(|_| {}))
        .await
        .unwrap();
    assert_eq!(mock.subscription_count(), subs_after_first);

    numeric.set(Value::Int(21)).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().last(), Some(&Value::Int(21)));

    numeric.unsubscribe().await.unwrap();
    numeric.unsubscribe().await.unwrap();
    numeric.set(Value::Int(22)).await.unwrap();
    settle().await;
    assert_eq!(seen.lock().last(), Some(&Value::Int(21)));
}

#[tokio::test]
async fn rpc_methods_forward_to_the_controller() {
    let mock = mock_with_program();
    mock.register_rpc(
        "MAIN.motor",
        "Reset",
        Arc::new(|args| {
            let mut outputs = IndexMap::new();
            outputs.insert("previous".to_string(), Value::Int(99));
            Ok(RpcResult {
                return_value: Some(Value::Bool(args.is_empty())),
                outputs,
            })
        }),
    );
    let coordinator = start(&mock).await;

    let motor = coordinator.symbol("MAIN.motor").unwrap();
    assert_eq!(motor.rpc_methods(), ["Reset".to_string()]);

    let result = motor.invoke("Reset", IndexMap::new()).await.unwrap();
    assert_eq!(result.return_value, Some(Value::Bool(true)));
    assert_eq!(result.outputs["previous"], Value::Int(99));

    let err = motor.invoke("Explode", IndexMap::new()).await.unwrap_err();
    assert!(matches!(err, MirrorError::OutOfRange { .. }));
}

#[tokio::test]
async fn leaf_events_bubble_to_the_root_exactly_once() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let root_sets = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&root_sets);
    coordinator.on(
        EVENT_SET,
        Arc::new(move |event| {
            assert_eq!(event.source, "MAIN.numericValue");
            probe.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let numeric = coordinator.symbol("MAIN.numericValue").unwrap();
    numeric.set(Value::Int(11)).await.unwrap();
    assert_eq!(root_sets.load(Ordering::SeqCst), 1);

    // A listener on the namespace can stop the walk before the root.
    let main = coordinator.namespace("MAIN").unwrap();
    main.on(EVENT_SET, Arc::new(|event| event.stop_propagation()));
    numeric.set(Value::Int(12)).await.unwrap();
    assert_eq!(root_sets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn alias_attributes_rename_emitted_events() {
    let mock = Arc::new(MockTransport::new());
    mock.insert_symbol(RawSymbolDescriptor {
        full_path: "MAIN.level".to_string(),
        type_name: "INT".to_string(),
        pointer: Pointer::new(GROUP, 0, 2),
        attributes: vec![("OnSet".to_string(), "levelChanged".to_string())],
    });
    mock.update_system_value(PROBE_PATH, &1u64.to_le_bytes());
    let coordinator = start(&mock).await;

    let renamed = Arc::new(AtomicUsize::new(0));
    let canonical = Arc::new(AtomicUsize::new(0));
    let renamed_probe = Arc::clone(&renamed);
    coordinator.on(
        "levelChanged",
        Arc::new(move |_| {
            renamed_probe.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let canonical_probe = Arc::clone(&canonical);
    coordinator.on(
        EVENT_SET,
        Arc::new(move |_| {
            canonical_probe.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let level = coordinator.symbol("MAIN.level").unwrap();
    level.set(Value::Int(3)).await.unwrap();

    assert_eq!(renamed.load(Ordering::SeqCst), 1);
    assert_eq!(canonical.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn source_change_rebuilds_and_invalidates_old_handles() {
    let mock = mock_with_program();
    let coordinator = start(&mock).await;

    let old_main = coordinator.namespace("MAIN").unwrap();
    let old_numeric = coordinator.symbol("MAIN.numericValue").unwrap();
    assert_eq!(old_numeric.get().await.unwrap(), Value::Int(10));

    let source_changes = Arc::new(AtomicUsize::new(0));
    let reinits = Arc::new(AtomicUsize::new(0));
    let sc = Arc::clone(&source_changes);
    coordinator.on(
        EVENT_SOURCE_CHANGED,
        Arc::new(move |_| {
            sc.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let ri = Arc::clone(&reinits);
    coordinator.on(
        EVENT_REINITIALIZED,
        Arc::new(move |_| {
            ri.fetch_add(1, Ordering::SeqCst);
        }),
    );

    mock.update_system_value(PROBE_PATH, &2u64.to_le_bytes());

    for _ in 0..100 {
        if reinits.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(source_changes.load(Ordering::SeqCst), 1);
    assert_eq!(reinits.load(Ordering::SeqCst), 1);

    assert!(!old_main.is_valid());
    assert!(!old_numeric.is_valid());
    let err = old_numeric.get().await.unwrap_err();
    assert!(matches!(err, MirrorError::InvalidBinding { .. }));

    // Fresh handles from the rebuilt graph operate normally.
    let fresh = coordinator.symbol("MAIN.numericValue").unwrap();
    assert_eq!(fresh.get().await.unwrap(), Value::Int(10));
}
