use limpet::{parse_module, CompileError};

#[test]
fn truncated_binary_surfaces_a_decode_error() {
    let err = parse_module(&[0x00, 0x61, 0x73]).unwrap_err();
    assert!(matches!(err, CompileError::Decode(_)));
    assert!(!err.to_string().is_empty());
}

#[test]
fn mistyped_module_is_rejected_before_compilation() {
    // i32.add with an empty stack; the up-front validator reports it.
    let bytes: Vec<u8> = vec![
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic + version
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type: [] -> []
        0x03, 0x02, 0x01, 0x00, // function section
        0x0a, 0x05, 0x01, 0x03, 0x00, // code section, one body
        0x6a, // i32.add
        0x0b, // end
    ];
    let err = parse_module(&bytes).unwrap_err();
    assert!(matches!(err, CompileError::Decode(_)));
}

#[test]
fn simd_lane_instructions_are_reported_unsupported() {
    let bytes = wat::parse_str(
        r#"(module
            (func (param i32) (result v128)
                (i8x16.splat (local.get 0))))"#,
    )
    .unwrap();
    let err = parse_module(&bytes).unwrap_err();
    match err {
        CompileError::Unsupported { position, name } => {
            assert!(position > 0);
            assert!(name.contains("Splat"), "unexpected name {name}");
        }
        other => panic!("expected an unsupported-instruction error, got {other}"),
    }
}

#[test]
fn error_messages_carry_positions() {
    let bytes = wat::parse_str(
        r#"(module
            (func (result v128)
                v128.const i64x2 1 2
                i8x16.neg))"#,
    )
    .unwrap();
    let err = parse_module(&bytes).unwrap_err();
    let text = err.to_string();
    assert!(
        text.contains("offset"),
        "diagnostic should name a position: {text}"
    );
}
