//! Shared BLE test doubles.
//!
//! mockall reproductions of `btleplug::api::{Central, Peripheral}` plus
//! factories for fully stocked peripherals, used by the polling-engine and
//! facade tests.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Descriptor,
    Peripheral, PeripheralProperties, ScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::PeripheralId;
use futures::stream::Stream;
use mockall::mock;
use std::collections::BTreeSet;
use std::pin::Pin;
use uuid::Uuid;

use crate::core::constants::{
    DIAGNOSTIC_CHARACTERISTIC_UUID, HEURISTIC_CHARACTERISTIC_UUID, MODE_CHARACTERISTIC_UUID,
    MONITOR_CHARACTERISTIC_UUID, REPS_CHARACTERISTIC_UUID, RX_CHARACTERISTIC_UUID,
    TX_CHARACTERISTIC_UUID, UART_SERVICE_UUID, VERSION_CHARACTERISTIC_UUID,
};

mock! {
    pub TestPeripheral{}

    impl Clone for TestPeripheral {
        fn clone(&self) -> Self;
    }

    impl std::fmt::Debug for TestPeripheral {
        fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
    }

    #[async_trait]
    impl Peripheral for TestPeripheral {
        fn id(&self) -> PeripheralId;
        fn address(&self) -> BDAddr;
        async fn properties(&self) -> btleplug::Result<Option<PeripheralProperties>>;
        fn services(&self) -> BTreeSet<Service>;
        fn characteristics(&self) -> BTreeSet<Characteristic>;
        async fn is_connected(&self) -> btleplug::Result<bool>;
        async fn connect(&self) -> btleplug::Result<()>;
        async fn disconnect(&self) -> btleplug::Result<()>;
        async fn discover_services(&self) -> btleplug::Result<()>;
        async fn write(
            &self,
            characteristic: &Characteristic,
            data: &[u8],
            write_type: WriteType,
        ) -> btleplug::Result<()>;
        async fn read(&self, characteristic: &Characteristic) -> btleplug::Result<Vec<u8>>;
        async fn subscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
        async fn unsubscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
        async fn notifications(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>;
        async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> btleplug::Result<()>;
        async fn read_descriptor(&self, descriptor: &Descriptor) -> btleplug::Result<Vec<u8>>;
    }
}

mock! {
    pub TestCentral{}

    impl Clone for TestCentral {
        fn clone(&self) -> Self;
    }

    impl std::fmt::Debug for TestCentral {
        fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
    }

    #[async_trait]
    impl Central for TestCentral {
        type Peripheral = MockTestPeripheral;

        async fn events(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>;
        async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()>;
        async fn stop_scan(&self) -> btleplug::Result<()>;
        async fn peripherals(&self) -> btleplug::Result<Vec<MockTestPeripheral>>;
        async fn peripheral(&self, id: &PeripheralId) -> btleplug::Result<MockTestPeripheral>;
        async fn add_peripheral(&self, address: &PeripheralId) -> btleplug::Result<MockTestPeripheral>;
        async fn adapter_info(&self) -> btleplug::Result<String>;
        async fn adapter_state(&self) -> btleplug::Result<CentralState>;
    }
}

/// Opt-in log capture for tests run with `RUST_LOG` set.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn characteristic(uuid: Uuid) -> Characteristic {
    Characteristic {
        uuid,
        service_uuid: UART_SERVICE_UUID,
        properties: CharPropFlags::default(),
        descriptors: BTreeSet::new(),
    }
}

pub fn all_characteristics() -> BTreeSet<Characteristic> {
    [
        TX_CHARACTERISTIC_UUID,
        RX_CHARACTERISTIC_UUID,
        MONITOR_CHARACTERISTIC_UUID,
        REPS_CHARACTERISTIC_UUID,
        DIAGNOSTIC_CHARACTERISTIC_UUID,
        HEURISTIC_CHARACTERISTIC_UUID,
        VERSION_CHARACTERISTIC_UUID,
        MODE_CHARACTERISTIC_UUID,
    ]
    .into_iter()
    .map(characteristic)
    .collect()
}

/// A peripheral clone as the polling tasks and command writes see it:
/// every poll answers with a well-formed frame, every write succeeds, and
/// further clones behave the same.
pub fn task_peripheral() -> MockTestPeripheral {
    let mut mock = MockTestPeripheral::new();
    mock.expect_clone().returning(task_peripheral);
    mock.expect_connect().returning(|| Ok(()));
    mock.expect_discover_services().returning(|| Ok(()));
    mock.expect_characteristics().returning(all_characteristics);
    mock.expect_read().returning(|c| {
        if c.uuid == HEURISTIC_CHARACTERISTIC_UUID {
            Ok(vec![0u8; 48])
        } else if c.uuid == DIAGNOSTIC_CHARACTERISTIC_UUID {
            Ok(vec![0u8; 20])
        } else {
            Ok(vec![0u8; 18])
        }
    });
    mock.expect_write().returning(|_, _, _| Ok(()));
    mock.expect_subscribe().returning(|_| Ok(()));
    mock.expect_unsubscribe().returning(|_| Ok(()));
    mock.expect_disconnect().returning(|| Ok(()));
    mock.expect_is_connected().returning(|| Ok(true));
    mock.expect_notifications()
        .returning(|| Ok(Box::pin(futures::stream::pending())));
    mock
}

/// A discoverable, connectable peripheral advertising `name` at `address`.
pub fn connectable_peripheral(name: &str, address: BDAddr) -> MockTestPeripheral {
    let name = name.to_string();
    let mut mock = MockTestPeripheral::new();
    mock.expect_address().return_const(address);
    mock.expect_properties().returning(move || {
        Ok(Some(PeripheralProperties {
            local_name: Some(name.clone()),
            ..Default::default()
        }))
    });
    mock.expect_connect().returning(|| Ok(()));
    mock.expect_discover_services().returning(|| Ok(()));
    mock.expect_characteristics().returning(all_characteristics);
    mock.expect_subscribe().returning(|_| Ok(()));
    mock.expect_unsubscribe().returning(|_| Ok(()));
    mock.expect_disconnect().returning(|| Ok(()));
    mock.expect_is_connected().returning(|| Ok(true));
    mock.expect_notifications()
        .returning(|| Ok(Box::pin(futures::stream::pending())));
    mock.expect_clone().returning(task_peripheral);
    mock
}
