//! Property-based round-trip suites for the wire codec.
//!
//! Values are generated from a type tree first, then shaped to match it,
//! so every generated pair is marshallable by construction.

use proptest::prelude::*;

use dbus_peer::demarshal::{demarshal_all, DecodeOptions, Decoder};
use dbus_peer::marshal::marshal;
use dbus_peer::message::{
    create_error, create_method_call, create_method_return, create_signal, marshal_message,
    unmarshal_message, HeaderField, Message,
};
use dbus_peer::signature::{self, Type};
use dbus_peer::types::{
    Array, BasicValue, Dictionary, Path, Signature, Struct, Value, Variant,
};

fn basic_type() -> impl Strategy<Value = Type> {
    prop_oneof![
        Just(Type::Byte),
        Just(Type::Boolean),
        Just(Type::Int16),
        Just(Type::Uint16),
        Just(Type::Int32),
        Just(Type::Uint32),
        Just(Type::Int64),
        Just(Type::Uint64),
        Just(Type::String),
        Just(Type::ObjectPath),
        Just(Type::UnixFd),
    ]
}

fn arb_type() -> impl Strategy<Value = Type> {
    let leaf = prop_oneof![
        basic_type(),
        Just(Type::Double),
        Just(Type::Signature),
        Just(Type::Variant),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            inner.clone().prop_map(|t| Type::Array(Box::new(t))),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Type::Struct),
            (basic_type(), inner).prop_map(|(k, v)| {
                Type::Array(Box::new(Type::DictEntry(Box::new(k), Box::new(v))))
            }),
        ]
    })
}

fn arb_string() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _.-]{0,12}"
}

fn arb_path() -> impl Strategy<Value = Path> {
    prop::collection::vec("[a-z0-9_]{1,6}", 0..3).prop_map(|segs| {
        if segs.is_empty() {
            Path::new("/")
        } else {
            Path::new(format!("/{}", segs.join("/")))
        }
    })
}

fn arb_signature_value() -> impl Strategy<Value = Signature> {
    prop_oneof![
        Just(Signature::new("")),
        Just(Signature::new("u")),
        Just(Signature::new("a{sv}")),
        Just(Signature::new("(iis)")),
        Just(Signature::new("aay")),
    ]
}

fn value_for(ty: &Type) -> BoxedStrategy<Value> {
    match ty {
        Type::Byte => any::<u8>().prop_map(Value::from).boxed(),
        Type::Boolean => any::<bool>().prop_map(Value::from).boxed(),
        Type::Int16 => any::<i16>().prop_map(Value::from).boxed(),
        Type::Uint16 => any::<u16>().prop_map(Value::from).boxed(),
        Type::Int32 => any::<i32>().prop_map(Value::from).boxed(),
        Type::Uint32 => any::<u32>().prop_map(Value::from).boxed(),
        Type::Int64 => any::<i64>().prop_map(Value::from).boxed(),
        Type::Uint64 => any::<u64>().prop_map(Value::from).boxed(),
        Type::Double => any::<f64>()
            .prop_filter("finite doubles only", |d| d.is_finite())
            .prop_map(Value::Double)
            .boxed(),
        Type::String => arb_string().prop_map(Value::from).boxed(),
        Type::ObjectPath => arb_path()
            .prop_map(|p| Value::Basic(BasicValue::ObjectPath(p)))
            .boxed(),
        Type::Signature => arb_signature_value()
            .prop_map(|s| Value::Basic(BasicValue::Signature(s)))
            .boxed(),
        Type::UnixFd => any::<u32>()
            .prop_map(|x| Value::Basic(BasicValue::UnixFd(x)))
            .boxed(),
        Type::Variant => (basic_type().prop_flat_map(|t| {
            value_for(&t).prop_map(move |v| Value::Variant(Variant::new(v, t.to_string())))
        }))
        .boxed(),
        Type::Array(elem) => match elem.as_ref() {
            Type::Byte => prop::collection::vec(any::<u8>(), 0..12)
                .prop_map(Value::ByteArray)
                .boxed(),
            Type::DictEntry(kty, vty) => {
                let full_sig = ty.to_string();
                let kty = kty.clone();
                let vty = vty.clone();
                prop::collection::vec((value_for(&kty), value_for(&vty)), 0..4)
                    .prop_map(move |pairs| {
                        let map = pairs
                            .into_iter()
                            .map(|(k, v)| match k {
                                Value::Basic(b) => (b, v),
                                other => panic!("dict key must be basic, got {:?}", other),
                            })
                            .collect();
                        Value::Dictionary(Dictionary::new(map, Signature::new(full_sig.clone())))
                    })
                    .boxed()
            }
            _ => {
                let full_sig = ty.to_string();
                prop::collection::vec(value_for(elem), 0..4)
                    .prop_map(move |objects| {
                        Value::Array(Array::new(objects, Signature::new(full_sig.clone())))
                    })
                    .boxed()
            }
        },
        Type::Struct(fields) => {
            let full_sig = ty.to_string();
            value_seq(fields.iter().map(value_for).collect())
                .prop_map(move |objects| {
                    Value::Struct(Struct {
                        objects,
                        signature: Signature::new(full_sig.clone()),
                    })
                })
                .boxed()
        }
        Type::DictEntry(..) => unreachable!("dict entries only occur inside arrays"),
    }
}

/// Chains heterogeneous strategies into one producing a value per field.
fn value_seq(strategies: Vec<BoxedStrategy<Value>>) -> BoxedStrategy<Vec<Value>> {
    let mut acc: BoxedStrategy<Vec<Value>> = Just(Vec::new()).boxed();
    for s in strategies {
        acc = (acc, s)
            .prop_map(|(mut values, next)| {
                values.push(next);
                values
            })
            .boxed();
    }
    acc
}

fn arb_typed_value() -> impl Strategy<Value = (Type, Value)> {
    arb_type().prop_flat_map(|ty| {
        let ty2 = ty.clone();
        value_for(&ty).prop_map(move |v| (ty2.clone(), v))
    })
}

fn arb_args() -> impl Strategy<Value = Vec<(Type, Value)>> {
    prop::collection::vec(arb_typed_value(), 0..3)
}

proptest! {
    #[test]
    fn roundtrip_any_value((ty, value) in arb_typed_value()) {
        let types = vec![ty];
        let buf = marshal(&types, &[value.clone()], 0).unwrap();
        let out = demarshal_all(&buf, &types, 0, &DecodeOptions::default()).unwrap();
        prop_assert_eq!(out, vec![value]);
    }

    #[test]
    fn roundtrip_at_any_offset((ty, value) in arb_typed_value(), start in 0usize..16) {
        let types = vec![ty.clone()];
        let buf = marshal(&types, &[value.clone()], start).unwrap();

        // Leading padding up to the type's alignment is zero.
        let align = ty.alignment();
        let pad = (align - start % align) % align;
        prop_assert!(buf.iter().take(pad).all(|b| *b == 0));

        let mut full = vec![0u8; start];
        full.extend_from_slice(&buf);
        let out = demarshal_all(&full, &types, start, &DecodeOptions::default()).unwrap();
        prop_assert_eq!(out, vec![value]);
    }

    #[test]
    fn decoder_consumes_exactly_what_was_written((ty, value) in arb_typed_value()) {
        let types = vec![ty];
        let buf = marshal(&types, &[value], 0).unwrap();
        let mut dec = Decoder::new(&buf, 0);
        dbus_peer::demarshal::demarshal(&mut dec, &types[0], &DecodeOptions::default()).unwrap();
        prop_assert!(dec.at_end());
    }

    #[test]
    fn signature_render_parses_back(types in prop::collection::vec(arb_type(), 0..4)) {
        let rendered = signature::render(&types);
        prop_assume!(rendered.len() <= signature::MAX_LENGTH);
        let parsed = signature::parse(&rendered).unwrap();
        prop_assert_eq!(parsed, types);
    }

    #[test]
    fn signature_fuzz_never_panics(s in "[a-z(){}]{0,24}") {
        // Either a tree that renders back to the input, or a clean error.
        match signature::parse(&s) {
            Ok(types) => prop_assert_eq!(signature::render(&types), s),
            Err(_) => {}
        }
    }

    #[test]
    fn message_roundtrip(
        kind in 0u8..4,
        serial in 1u32..u32::MAX,
        reply_serial in 1u32..u32::MAX,
        args in arb_args(),
    ) {
        let mut msg: Message = match kind {
            0 => create_method_call("com.x.Dest", "/an/obj", "com.x.Iface", "Member"),
            1 => create_method_return(reply_serial),
            2 => create_error("com.x.Error.Bad", reply_serial),
            _ => create_signal("/an/obj", "com.x.Iface", "Member"),
        };
        let sig: String = args.iter().map(|(t, _)| t.to_string()).collect();
        if !sig.is_empty() {
            msg = msg.add_header(
                HeaderField::Signature,
                Value::Basic(BasicValue::Signature(Signature::new(sig))),
            );
            msg.body = args.iter().map(|(_, v)| v.clone()).collect();
        }
        msg.serial = serial;

        let frame = marshal_message(&msg).unwrap();
        prop_assert_eq!(frame.len() % 8, 0);
        let parsed = unmarshal_message(&frame, &DecodeOptions::default()).unwrap();
        prop_assert_eq!(parsed, msg);
    }
}
