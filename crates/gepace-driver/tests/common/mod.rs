//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;

use gepace_driver::registry::{AddressRegistry, DeviceModel};
use gepace_driver::simulator::Simulator;
use gepace_driver::SyncTransport;

/// Registry with channel `A` and loop `1` only
pub fn small_registry() -> AddressRegistry {
    AddressRegistry::new(DeviceModel::default().with_channels(['A']).with_loops([1])).unwrap()
}

/// Serve a simulator on a local TCP port, one connection, on a background thread
pub fn serve(mut simulator: Simulator) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            SyncTransport::write(&mut simulator, format!("{}\n", line).as_bytes()).unwrap();
            while let Ok(reply) = SyncTransport::readline(&mut simulator) {
                if writer.write_all(&reply).is_err() {
                    return;
                }
            }
        }
    });
    port
}
