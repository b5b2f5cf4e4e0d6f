//! Integration tests for the keyed option table

use std::time::Duration;

use nanoweave_core::error::ErrorKind;
use nanoweave_core::options::{OptionKey, OptionValue, SocketOptions};
use nanoweave_core::protocol::Protocol;

#[test]
fn test_every_key_parses_from_its_name() {
    for key in OptionKey::ALL {
        assert_eq!(key.to_string().parse::<OptionKey>().unwrap(), key);
    }
}

#[test]
fn test_get_reflects_set() {
    let mut opts = SocketOptions::new();
    opts.set(OptionKey::ReconnectIvl, Duration::from_millis(25).into()).unwrap();
    opts.set(OptionKey::ReconnectIvlMax, 400_i64.into()).unwrap();
    opts.set(OptionKey::BlockOnDial, true.into()).unwrap();
    opts.set(OptionKey::ResendTime, (-1_i64).into()).unwrap();

    assert_eq!(opts.get(OptionKey::ReconnectIvl).as_millis(), Some(25));
    assert_eq!(opts.get(OptionKey::ReconnectIvlMax).as_millis(), Some(400));
    assert_eq!(opts.get(OptionKey::BlockOnDial).as_bool(), Some(true));
    assert_eq!(opts.get(OptionKey::ResendTime), OptionValue::Duration(None));
    assert_eq!(opts.next_reconnect_ivl(1), Duration::from_millis(50));
}

#[test]
fn test_wrong_value_type_is_invalid_argument() {
    let mut opts = SocketOptions::new();
    for (key, value) in [
        (OptionKey::Polyamorous, OptionValue::from("yes")),
        (OptionKey::RecvTimeout, OptionValue::from(true)),
        (OptionKey::Topics, OptionValue::from(3_i64)),
    ] {
        let err = opts.set(key, value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{key}");
    }
    assert_eq!(opts, SocketOptions::default());
}

#[test]
fn test_protocol_specific_keys() {
    let specific = [
        (OptionKey::Topics, Protocol::Sub0),
        (OptionKey::Polyamorous, Protocol::Pair1),
        (OptionKey::ResendTime, Protocol::Req0),
        (OptionKey::SurveyTime, Protocol::Surveyor0),
    ];
    for (key, owner) in specific {
        assert!(key.applies_to(owner));
        assert!(!key.applies_to(Protocol::Push0), "{key} on push0");
    }
    assert!(OptionKey::RecvTimeout.applies_to(Protocol::Respondent0));
}
