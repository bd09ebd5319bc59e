use gepace_core::types::Value;
use gepace_driver::registry::{Codec, EntityKind, PropertyDescriptor};
use gepace_driver::simulator::Simulator;
use gepace_driver::{AddressRegistry, Device, DeviceModel, DispatchOptions, Target};

fn sample(desc: &PropertyDescriptor) -> Value {
    match desc.codec {
        Codec::Text => Value::String("KPA".to_string()),
        Codec::Quoted => Value::String("2.00bar".to_string()),
        Codec::Bool => Value::Bool(true),
        Codec::Integer => Value::Integer(5),
        Codec::Float => Value::Float(12.5),
        Codec::Token => Value::String(desc.tokens.last().cloned().unwrap_or_default()),
        Codec::FloatBool => Value::Array(vec![Value::Float(12.5), Value::Bool(true)]),
        Codec::TokenFloat => Value::Array(vec![
            Value::String(desc.tokens.last().cloned().unwrap_or_default()),
            Value::Float(12.5),
        ]),
        Codec::ErrorStatus => unreachable!("error status is never writable"),
    }
}

fn targets(registry: &AddressRegistry) -> Vec<Target> {
    let model = registry.model();
    let mut targets = vec![Target::device()];
    targets.extend(model.channels.iter().map(|&c| Target::channel(c)));
    targets.extend(model.loops.iter().map(|&n| Target::control_loop(n)));
    targets
}

async fn round_trip(registry: AddressRegistry) -> usize {
    let device = Device::new(
        Simulator::new(&registry).with_echo_header(true),
        registry.clone(),
        DispatchOptions::default(),
    );

    let mut checked = 0;
    for target in targets(&registry) {
        let writable: Vec<PropertyDescriptor> = registry
            .properties(target.kind)
            .filter(|d| d.access.is_writable() && d.access.is_readable())
            .cloned()
            .collect();
        for desc in writable {
            let value = sample(&desc);
            device
                .write_property(&target, &desc.name, value.clone())
                .await
                .unwrap();
            let read = device
                .read_property::<Value>(&target, &desc.name)
                .await
                .unwrap()
                .value()
                .unwrap();
            assert_eq!(read, value, "{:?} {}", target, desc.name);
            checked += 1;
        }
    }
    checked
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_every_writable_property_round_trips() {
    let checked = round_trip(AddressRegistry::default()).await;
    // control_state, 3 relays and startup_mode, 3 per channel, 6 per loop
    assert_eq!(checked, 5 + 2 * 3 + 2 * 6);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_round_trip_with_write_readback() {
    let registry = AddressRegistry::new(DeviceModel::default().with_write_readback(true)).unwrap();
    let checked = round_trip(registry).await;
    assert!(checked > 0);
}

#[test]
fn test_registry_has_every_entity_kind() {
    let registry = AddressRegistry::default();
    for kind in [EntityKind::Device, EntityKind::Channel, EntityKind::Loop] {
        assert!(registry.properties(kind).any(|d| d.access.is_writable()));
    }
}
