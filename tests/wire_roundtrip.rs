// tests/wire_roundtrip.rs

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use esb_ccp::ccp::registry::decode_event;
use esb_ccp::ccp::{
    Command, CommandKind, ComponentState, ControlEvent, Data, DataEvent, DataRequest, DataType,
    EventBody, EventType, Handshake, HandshakeAck, LogLevel, LogLevelRequest, ManageableProperty,
    MemoryUsage, PortConfiguration, Status,
};
use esb_ccp::ErrorKind;

fn word(rng: &mut StdRng) -> String {
    let len = rng.gen_range(0..12);
    (0..len)
        .map(|_| *b"abcdefghij._-XYZ".choose(rng).unwrap_or(&b'a') as char)
        .collect()
}

fn words(rng: &mut StdRng) -> Vec<String> {
    (0..rng.gen_range(0..4)).map(|_| word(rng)).collect()
}

fn string_map(rng: &mut StdRng) -> BTreeMap<String, String> {
    (0..rng.gen_range(0..4)).map(|_| (word(rng), word(rng))).collect()
}

fn data(rng: &mut StdRng, data_type: DataType) -> Data {
    match data_type {
        DataType::MemoryUsage => Data::MemoryUsage(MemoryUsage {
            committed: rng.gen(),
            init: rng.gen(),
            max: rng.gen(),
            used: rng.gen(),
        }),
        DataType::LogLevels => Data::LogLevels(
            (0..rng.gen_range(0..4))
                .map(|_| (word(rng), *LogLevel::ALL.choose(rng).unwrap_or(&LogLevel::Info)))
                .collect(),
        ),
        DataType::ProcessId => Data::ProcessId(rng.gen::<u32>().to_string()),
        DataType::ComponentStats => Data::ComponentStats(word(rng)),
        DataType::MicroserviceConfiguration => Data::MicroserviceConfiguration(word(rng)),
        DataType::NamedConfiguration => Data::NamedConfiguration(string_map(rng)),
        DataType::ManageableProperties => Data::ManageableProperties(
            (0..rng.gen_range(0..3))
                .map(|_| {
                    (
                        word(rng),
                        ManageableProperty {
                            value: word(rng),
                            encrypted: rng.gen(),
                            property_type: word(rng),
                            configuration_type: word(rng),
                        },
                    )
                })
                .collect(),
        ),
        DataType::PortConfiguration => Data::PortConfiguration(
            (0..rng.gen_range(0..3))
                .map(|_| PortConfiguration {
                    port_name: word(rng),
                    destination: word(rng),
                    properties: string_map(rng),
                })
                .collect(),
        ),
    }
}

fn body(rng: &mut StdRng, event_type: EventType) -> EventBody {
    match event_type {
        EventType::DataRequest => {
            let count = rng.gen_range(0..DataType::ALL.len());
            let types: Vec<DataType> = DataType::ALL.choose_multiple(rng, count).copied().collect();
            let request = DataRequest::new(types);
            if rng.gen_bool(0.5) {
                request.every(rng.gen_range(1..10), rng.gen_range(1..5_000)).into()
            } else {
                request.into()
            }
        }
        EventType::LogLevelRequest => LogLevelRequest::new(words(rng)).into(),
        EventType::Data => {
            let chosen: Vec<DataType> = DataType::ALL
                .iter()
                .copied()
                .filter(|_| rng.gen_bool(0.4))
                .collect();
            chosen
                .into_iter()
                .fold(DataEvent::default(), |event, data_type| event.with(data(rng, data_type)))
                .into()
        }
        EventType::Handshake => Handshake {
            component_version: word(rng),
            process_id: rng.gen::<u16>().to_string(),
        }
        .into(),
        EventType::HandshakeAck => HandshakeAck {
            accepted: rng.gen(),
            reason: word(rng),
        }
        .into(),
        EventType::Command => {
            let kind = match rng.gen_range(0..5) {
                0 => CommandKind::Stop,
                1 => CommandKind::Kill,
                2 => CommandKind::Restart,
                3 => CommandKind::SetLogLevel,
                _ => CommandKind::Custom(format!("CUSTOM_{}", rng.gen::<u8>())),
            };
            string_map(rng)
                .into_iter()
                .fold(Command::new(kind), |command, (key, value)| command.arg(key, value))
                .into()
        }
        EventType::Status => Status::new(
            *ComponentState::ALL.choose(rng).unwrap_or(&ComponentState::Running),
            word(rng),
        )
        .into(),
    }
}

fn random_event(rng: &mut StdRng) -> ControlEvent {
    let event_type = *EventType::ALL.choose(rng).unwrap_or(&EventType::Status);
    let mut event = ControlEvent::new(body(rng, event_type))
        .with_priority(rng.gen_range(0..=9))
        .with_reply_needed(rng.gen())
        .with_description(word(rng));
    event.header.version = rng.gen_range(0.5f32..3.0);
    event.header.correlation_id = if rng.gen_bool(0.3) { rng.gen() } else { 0 };
    if rng.gen_bool(0.5) {
        event = event
            .with_expiry(rng.gen_range(0..i64::MAX))
            .with_reply_timeout(rng.gen_range(1..600_000));
    }
    event
}

#[test]
fn random_events_survive_encoding() {
    let mut rng = StdRng::seed_from_u64(0x00cc_9001);
    for _ in 0..500 {
        let event = random_event(&mut rng);
        let decoded = decode_event(event.event_type().as_str(), event.encode()).unwrap();
        assert_eq!(decoded, event);
    }
}

#[test]
fn truncated_bodies_never_decode() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let event = random_event(&mut rng);
        let bytes = event.encode();
        let cut = rng.gen_range(0..bytes.len());
        let error = decode_event(event.event_type().as_str(), bytes.slice(..cut)).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::Codec { .. }));
    }
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut rng = StdRng::seed_from_u64(11);
    let event = random_event(&mut rng);
    let mut bytes = event.encode().to_vec();
    bytes.push(0);
    assert!(decode_event(event.event_type().as_str(), bytes.into()).is_err());
}
