use std::rc::Rc;

use ristretto::metadata::{MethodBody, StaticMetadata};
use ristretto::runtime::{Config, IndexSpace, Outcome, Runtime, RuntimeError, RuntimeErrorKind};
use ristretto::trace::{NoTrace, TraceRecorder};
use ristretto::value::{Tag, Utf16String};
use ristretto::{Termination, Value};

const NOP: u8 = 0x00;
const RET: u8 = 0x2A;
// Element type token for newarr, ignored by the runtime.
const INT32_TYPE: [u8; 4] = [0x08, 0x00, 0x00, 0x01];

fn execute(code: &[u8], locals: usize) -> Result<Outcome, RuntimeError> {
    let meta = StaticMetadata::new();
    Runtime::new(&meta, Config::default())
        .execute(Rc::new(MethodBody::new(code.to_vec(), locals, 8)), &mut NoTrace)
}

fn trace(code: &[u8]) -> Vec<usize> {
    let meta = StaticMetadata::new();
    let mut recorder = TraceRecorder::new();
    Runtime::new(&meta, Config::default())
        .execute(Rc::new(MethodBody::new(code.to_vec(), 0, 8)), &mut recorder)
        .unwrap();
    recorder.pcs()
}

fn newarr(len: u8) -> Vec<u8> {
    let mut code = vec![0x1F, len, 0x8D];
    code.extend_from_slice(&INT32_TYPE);
    code
}

#[test]
fn forward_branch_is_relative_to_next_instruction() {
    // br.s +5 at IL_000a resumes at IL_0011.
    let mut code = vec![NOP; 10];
    code.extend_from_slice(&[0x2B, 0x05]);
    code.extend_from_slice(&[NOP; 5]);
    code.push(RET);
    let pcs = trace(&code);
    assert_eq!(pcs[9..], [9, 10, 17]);
}

#[test]
fn backward_branch() {
    // IL_0000: br.s IL_000a; IL_0007: ret; IL_000a: br.s -5
    let mut code = vec![0x2B, 0x08, NOP, NOP, NOP, NOP, NOP, RET, NOP, NOP];
    code.extend_from_slice(&[0x2B, 0xFB]);
    assert_eq!(trace(&code), vec![0, 10, 7]);
}

#[test]
fn zero_offset_falls_through() {
    assert_eq!(trace(&[0x2B, 0x00, RET]), vec![0, 2]);
}

#[test]
fn short_branch_extremes() {
    // IL_0000: br.s +127 to IL_0081, which branches -128 back to IL_0003.
    let mut code = vec![NOP; 131];
    code[0] = 0x2B;
    code[1] = 0x7F;
    code[3] = RET;
    code[129] = 0x2B;
    code[130] = 0x80;
    assert_eq!(trace(&code), vec![0, 129, 3]);
}

#[test]
fn long_branch() {
    // br +300 over a run of nops.
    let mut code = vec![0x38];
    code.extend_from_slice(&300i32.to_le_bytes());
    code.extend_from_slice(&[NOP; 300]);
    code.push(RET);
    assert_eq!(trace(&code), vec![0, 305]);
}

#[test]
fn brfalse_takes_zero() {
    // cond; brfalse.s +1; ldc.i4.1; ldc.i4.2
    let taken = execute(&[0x16, 0x2C, 0x01, 0x17, 0x18], 0).unwrap();
    assert_eq!(taken.stack, vec![Value::Int32(2)]);
    let fallthrough = execute(&[0x17, 0x2C, 0x01, 0x17, 0x18], 0).unwrap();
    assert_eq!(fallthrough.stack, vec![Value::Int32(1), Value::Int32(2)]);
    let null = execute(&[0x14, 0x2C, 0x01, 0x17, 0x18], 0).unwrap();
    assert_eq!(null.stack, vec![Value::Int32(2)]);
}

#[test]
fn brtrue_takes_non_zero() {
    let taken = execute(&[0x1F, 0x07, 0x2D, 0x01, 0x17, 0x18], 0).unwrap();
    assert_eq!(taken.stack, vec![Value::Int32(2)]);
    let fallthrough = execute(&[0x16, 0x2D, 0x01, 0x17, 0x18], 0).unwrap();
    assert_eq!(fallthrough.stack, vec![Value::Int32(1), Value::Int32(2)]);

    // An array reference is true.
    let mut code = newarr(1);
    code.extend_from_slice(&[0x2D, 0x01, 0x17, 0x18]);
    assert_eq!(execute(&code, 0).unwrap().stack, vec![Value::Int32(2)]);
}

#[test]
fn branch_on_float_is_a_type_mismatch() {
    let mut code = vec![0x23];
    code.extend_from_slice(&1.0f64.to_le_bytes());
    code.extend_from_slice(&[0x2D, 0x00]);
    let err = execute(&code, 0).unwrap_err();
    assert_eq!(
        err.kind,
        RuntimeErrorKind::TypeMismatch {
            expected: "int32",
            found: Tag::Float64
        }
    );
    assert_eq!(err.offset, 9);
}

#[test]
fn branch_targets_must_start_an_instruction() {
    // br.s +1 lands inside the operand of ldc.i4.s.
    let err = execute(&[0x2B, 0x01, 0x1F, 0x05, RET], 0).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::BadBranchTarget { target: 3 });
    assert_eq!(err.offset, 0);

    let err = execute(&[0x2B, 0x10, RET], 0).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::BadBranchTarget { target: 18 });
    let err = execute(&[0x2B, 0xF0, RET], 0).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::BadBranchTarget { target: -14 });

    // The end of the stream is a valid target.
    let out = execute(&[0x2B, 0x01, RET], 0).unwrap();
    assert_eq!(out.termination, Termination::EndOfStream);
}

#[test]
fn branch_over_unhandled_call() {
    // br.s +6; ldc.i4.0; call 0x0A000020; ldc.i4.1; ret
    // The token's low byte reads as ldc.i4 if the call is misdecoded.
    let code = [0x2B, 0x06, 0x16, 0x28, 0x20, 0x00, 0x00, 0x0A, 0x17, RET];
    assert_eq!(trace(&code), vec![0, 8, 9]);
    let out = execute(&code, 0).unwrap();
    assert_eq!(out.termination, Termination::Returned);
    assert_eq!(out.stack, vec![Value::Int32(1)]);
}

#[test]
fn array_store_and_load() {
    // a = new int[3]; a[1] = 42; push a[1]; push a.Length
    let mut code = newarr(3);
    code.extend_from_slice(&[0x0A, 0x06, 0x17, 0x1F, 42, 0x9E]);
    code.extend_from_slice(&[0x06, 0x17, 0x94, 0x06, 0x8E, 0x69]);
    let out = execute(&code, 1).unwrap();
    assert_eq!(out.stack, vec![Value::Int32(42), Value::Int32(3)]);
}

#[test]
fn array_index_out_of_range() {
    let mut code = newarr(3);
    code.extend_from_slice(&[0x1B, 0x94]);
    let err = execute(&code, 0).unwrap_err();
    assert_eq!(
        err.kind,
        RuntimeErrorKind::IndexFault {
            space: IndexSpace::Array,
            index: 5,
            len: 3
        }
    );

    let mut code = newarr(3);
    code.extend_from_slice(&[0x15, 0x16, 0x9E]);
    assert!(matches!(
        execute(&code, 0).unwrap_err().kind,
        RuntimeErrorKind::IndexFault { index: -1, .. }
    ));
}

#[test]
fn arrays_are_shared_between_copies() {
    // dup the array, store through the copy, load through the first.
    let mut code = newarr(2);
    code.extend_from_slice(&[0x25, 0x0A, 0x06, 0x16, 0x1D, 0x9E]);
    code.extend_from_slice(&[0x16, 0x94]);
    let out = execute(&code, 1).unwrap();
    assert_eq!(out.stack, vec![Value::Int32(7)]);

    // Two locals holding the same array.
    let mut code = newarr(1);
    code.extend_from_slice(&[0x25, 0x0A, 0x0B, 0x07, 0x16, 0x18, 0x9E]);
    let out = execute(&code, 2).unwrap();
    match (&out.locals[0], &out.locals[1]) {
        (Value::ObjectArray(a), Value::ObjectArray(b)) => {
            assert!(a.ptr_eq(b));
            assert_eq!(a.get(0), Some(Value::Int32(2)));
        }
        other => panic!("expected two arrays, got {other:?}"),
    }
}

#[test]
fn fresh_elements() {
    // ldelem.i4 and ldelem.ref on an untouched slot.
    let mut code = newarr(2);
    code.extend_from_slice(&[0x25, 0x16, 0x94, 0x0A, 0x16, 0x9A]);
    let out = execute(&code, 1).unwrap();
    assert_eq!(out.locals[0], Value::Int32(0));
    assert_eq!(out.stack, vec![Value::Null]);
}

#[test]
fn narrowing_element_stores() {
    // a[0] = 200 via stelem.i1, read back with ldelem.u1 and ldelem.i1.
    let mut code = newarr(1);
    code.extend_from_slice(&[0x0A, 0x06, 0x16, 0x20]);
    code.extend_from_slice(&200i32.to_le_bytes());
    code.extend_from_slice(&[0x9C, 0x06, 0x16, 0x91, 0x06, 0x16, 0x90]);
    let out = execute(&code, 1).unwrap();
    assert_eq!(out.stack, vec![Value::Int32(200), Value::Int32(-56)]);
}

#[test]
fn negative_array_length() {
    let mut code = vec![0x15, 0x8D];
    code.extend_from_slice(&INT32_TYPE);
    assert_eq!(
        execute(&code, 0).unwrap_err().kind,
        RuntimeErrorKind::NegativeArrayLength(-1)
    );
}

#[test]
fn string_literals() {
    let meta = StaticMetadata::new()
        .with_string(0x7000_0001, "Hello")
        .with_string(0x7000_0100, "world");
    let code = [0x72, 0x01, 0x00, 0x00, 0x70, 0x72, 0x00, 0x01, 0x00, 0x70, RET];
    let out = Runtime::new(&meta, Config::default())
        .execute(Rc::new(MethodBody::new(code.to_vec(), 0, 2)), &mut NoTrace)
        .unwrap();
    assert_eq!(
        out.stack,
        vec![
            Value::Utf16String(Utf16String::from("Hello")),
            Value::Utf16String(Utf16String::from("world")),
        ]
    );

    // Strings compare by content.
    let code = [0x72, 0x01, 0x00, 0x00, 0x70, 0x72, 0x01, 0x00, 0x00, 0x70, 0xFE, 0x01];
    let out = Runtime::new(&meta, Config::default())
        .execute(Rc::new(MethodBody::new(code.to_vec(), 0, 2)), &mut NoTrace)
        .unwrap();
    assert_eq!(out.stack, vec![Value::Int32(1)]);
}

#[test]
fn popping_an_empty_stack_faults() {
    for code in [&[0x58][..], &[0x17, 0x58], &[0x0A], &[0x2C, 0x00], &[0x8E]] {
        let err = execute(code, 1).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackUnderflow, "{code:02x?}");
    }
}

#[test]
fn locals_round_trip_every_tag() {
    let meta = StaticMetadata::new().with_string(0x7000_0001, "s");
    let mut code = vec![0x14, 0x0A, 0x1F, 0xF6, 0x0B];
    code.push(0x21);
    code.extend_from_slice(&(1i64 << 40).to_le_bytes());
    code.push(0x0C);
    code.push(0x23);
    code.extend_from_slice(&0.25f64.to_le_bytes());
    code.push(0x0D);
    code.extend_from_slice(&[0x72, 0x01, 0x00, 0x00, 0x70, 0x13, 4]);
    code.extend_from_slice(&[0x06, 0x07, 0x08, 0x09, 0x11, 4]);
    let out = Runtime::new(&meta, Config::default())
        .execute(Rc::new(MethodBody::new(code, 5, 5)), &mut NoTrace)
        .unwrap();
    let expected = vec![
        Value::Null,
        Value::Int32(-10),
        Value::Int64(1 << 40),
        Value::Float64(0.25),
        Value::Utf16String(Utf16String::from("s")),
    ];
    assert_eq!(out.locals, expected);
    assert_eq!(out.stack, expected);
}
