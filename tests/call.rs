mod common;

use common::*;
use rust_dott::{Error, MemoryModel, SessionConfig, StructValue, TargetState, Value};

fn my_add(a: u32, b: u32) -> StructValue {
    StructValue::new("my_add_t")
        .with("paddA", 0u8)
        .with("a", a)
        .with("paddB", 0u8)
        .with("b", b)
        .with("paddC", 0u8)
        .with("sum", 0u32)
}

#[test]
fn calls_function_with_scalar_arguments() {
    let (mut session, control) = ready();

    let result = session
        .call("example_Addition", &[31u32.into(), 11u32.into()])
        .unwrap();

    assert_eq!(result, Value::Unsigned(42));
    assert!(matches!(session.state(), TargetState::Halted { .. }));
    assert_eq!(session.read_register("pc").unwrap(), MAIN);
    assert_eq!(session.read_register("sp").unwrap(), INITIAL_SP);
    assert_eq!(control.count("-exec-continue"), 1);
}

#[test]
fn passes_structs_by_pointer() {
    let (mut session, _control) = ready();
    let ty = session.type_of("my_add_t").unwrap();
    assert_eq!(ty.size, 24);

    let pointer = session.alloc_value(&ty, my_add(31, 11)).unwrap();
    let stored = session.read_value(pointer, &ty).unwrap();
    assert_eq!(stored.field("a"), Some(&Value::Unsigned(31)));
    assert_eq!(stored.field("sum"), Some(&Value::Unsigned(0)));

    let result = session
        .call("example_AdditionStruct", &[pointer.into()])
        .unwrap();
    assert_eq!(result, Value::Unsigned(42));
    let updated = session.read_value(pointer, &ty).unwrap();
    assert_eq!(updated.field("sum"), Some(&Value::Unsigned(42)));
}

#[test]
fn copies_referenced_values_into_scratch_memory() {
    let (mut session, _control) = ready();
    let used = session.scratch().unwrap().used();

    let result = session
        .call(
            "example_AdditionStruct",
            &[Value::by_ref(Value::Struct(my_add(40, 2)))],
        )
        .unwrap();

    assert_eq!(result, Value::Unsigned(42));
    assert_eq!(session.scratch().unwrap().used(), used);
}

#[test]
fn writes_results_through_pointers() {
    let (mut session, _control) = ready();
    let ty = session.type_of("uint32_t").unwrap();
    let out = session.alloc_value(&ty, 0u32).unwrap();

    let result = session
        .call(
            "example_AdditionPtr",
            &[5u32.into(), 6u32.into(), out.into()],
        )
        .unwrap();

    assert_eq!(result, Value::Void);
    assert_eq!(session.read_value(out, &ty).unwrap(), Value::Unsigned(11));
}

#[test]
fn reads_and_assigns_variables() {
    let (mut session, _control) = ready();
    assert_eq!(session.read_variable("global_data").unwrap(), Value::Unsigned(7));
    assert_eq!(session.evaluate("global_data").unwrap(), Value::Unsigned(7));

    session.assign("global_data", 99u32).unwrap();

    assert_eq!(session.read_variable("global_data").unwrap(), Value::Unsigned(99));
    assert_eq!(
        session.evaluate("&global_data").unwrap(),
        Value::Pointer(rust_dott::TargetPtr(GLOBAL_DATA))
    );
}

#[test]
fn rejects_bad_arguments_before_touching_the_target() {
    let (mut session, control) = ready();

    let arity = session.call("example_Addition", &[1u32.into()]);
    assert!(matches!(arity, Err(Error::ArgumentType(_))));

    let oversized = session.call(
        "example_Addition",
        &[Value::Unsigned(1 << 40), 1u32.into()],
    );
    assert!(matches!(oversized, Err(Error::ArgumentType(_))));

    assert_eq!(control.count("-exec-continue"), 0);
    assert_eq!(control.count("-data-evaluate-expression \"$"), 0);
    assert_eq!(control.count("-data-write-memory-bytes"), 0);
}

#[test]
fn unknown_functions_are_reported() {
    let (mut session, control) = ready();

    match session.call("example_Missing", &[]) {
        Err(Error::UnknownSymbol(name)) => assert_eq!(name, "example_Missing"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(control.count("-exec-continue"), 0);
}

#[test]
fn calls_need_a_halted_target() {
    let (mut session, control) = ready();
    session.run().unwrap();
    assert_eq!(session.state(), TargetState::Running);
    control.clear_log();

    let result = session.call("example_GetA", &[]);

    assert!(matches!(
        result,
        Err(Error::TargetState(TargetState::Running))
    ));
    assert!(control.log().is_empty());
}

#[test]
fn calls_need_a_trampoline() {
    let config = SessionConfig {
        memory_model: MemoryModel::None { trampoline: None },
        ..sram_config()
    };
    let (mut session, control) = connect(FakeTarget::new(), config);
    session.reset().unwrap();
    assert!(session.scratch().is_none());

    let result = session.call("example_GetA", &[]);

    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(control.count("-exec-continue"), 0);
}

#[test]
fn flash_model_takes_scratch_memory_from_the_stack() {
    let config = SessionConfig {
        memory_model: MemoryModel::Flash {
            trampoline: "Reset_Handler".to_string(),
            halt_location: "main".to_string(),
            scratch_size: 0x400,
        },
        ..sram_config()
    };
    let (mut session, _control) = connect(FakeTarget::new(), config);
    session.reset().unwrap();

    let canary = 0x2000_fbf8;
    assert_eq!(session.read_register("sp").unwrap(), canary);
    assert_eq!(
        session.read_memory(canary, 4).unwrap(),
        0xabad_1deau32.to_le_bytes().to_vec()
    );
    assert_eq!(session.trampoline(), Some(RESET_HANDLER));

    let ty = session.type_of("my_add_t").unwrap();
    let pointer = session.alloc_value(&ty, my_add(20, 22)).unwrap();
    assert!(session.scratch().unwrap().contains(pointer.address()));
    assert_eq!(
        session
            .call("example_AdditionStruct", &[pointer.into()])
            .unwrap(),
        Value::Unsigned(42)
    );
    assert_eq!(
        session
            .call("example_AdditionSubcalls", &[])
            .unwrap(),
        Value::Unsigned(63)
    );
}

#[test]
fn flash_scratch_memory_must_fit_below_the_stack() {
    // The first size reaches below address zero, the second one overflows.
    for scratch_size in [0x2001_0000u32, 0xffff_fffe].iter() {
        let config = SessionConfig {
            memory_model: MemoryModel::Flash {
                trampoline: "Reset_Handler".to_string(),
                halt_location: "main".to_string(),
                scratch_size: *scratch_size,
            },
            ..sram_config()
        };
        let (mut session, _control) = connect(FakeTarget::new(), config);

        assert!(matches!(session.reset(), Err(Error::Config(_))));
        assert!(session.scratch().is_none());
    }
}

#[test]
fn test_hook_model_uses_the_hook_buffer() {
    let config = SessionConfig {
        memory_model: MemoryModel::TestHook {
            hook: "DOTT_test_hook_chained".to_string(),
            trampoline: "DOTT_test_hook".to_string(),
        },
        ..sram_config()
    };
    let (mut session, _control) = connect(FakeTarget::new(), config);
    session.reset().unwrap();

    let scratch = session.scratch().unwrap().clone();
    assert_eq!(scratch.base(), HOOK_BUFFER);
    assert_eq!(scratch.size(), HOOK_BUFFER_SIZE);
    assert_eq!(session.trampoline(), Some(HOOK));
    assert_eq!(
        session.state(),
        TargetState::Halted {
            stop_pc: HOOK_CHAINED
        }
    );

    let result = session
        .call("example_Addition", &[40u32.into(), 2u32.into()])
        .unwrap();
    assert_eq!(result, Value::Unsigned(42));
    assert_eq!(session.read_register("pc").unwrap(), HOOK_CHAINED);
}
