//! Linux GATT peripheral backed by bluer (BlueZ D-Bus bindings).
//!
//! Bridges [`RadioCommand`]s onto a BlueZ GATT application and turns
//! characteristic writes and subscriptions into [`BleEvent`]s. The
//! BlueZ session lives in its own task; [`BluerPeripheral`] is the
//! thin sync handle the engine drives.

use crate::ble::protocol::SyncMode;
use crate::ble::transport::{BleEvent, BleLink, RadioCommand};
use crate::ble::uuids;
use crate::{Result, SyncErrorKind, VaultError};
use bluer::{
    adv::Advertisement,
    gatt::local::{
        characteristic_control, Application, Characteristic, CharacteristicControlEvent,
        CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, Service,
    },
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, warn};

/// Handle implementing [`BleLink`] over a background BlueZ task.
pub struct BluerPeripheral {
    command_tx: mpsc::UnboundedSender<RadioCommand>,
}

impl BluerPeripheral {
    /// Spawn the BlueZ-facing task. Radio events arrive on the
    /// returned receiver; feed it to the sync engine.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<BleEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = run_adapter(command_rx, event_tx).await {
                warn!(error = %e, "BLE peripheral task ended");
            }
        });

        (Self { command_tx }, event_rx)
    }
}

impl BleLink for BluerPeripheral {
    fn execute(&mut self, command: RadioCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| VaultError::Sync(SyncErrorKind::Cancelled))
    }
}

struct GattServer {
    _app: bluer::gatt::local::ApplicationHandle,
    _adv: bluer::adv::AdvertisementHandle,
    notifiers: Arc<TokioMutex<HashMap<uuid::Uuid, bluer::gatt::local::CharacteristicWriter>>>,
}

async fn run_adapter(
    mut commands: mpsc::UnboundedReceiver<RadioCommand>,
    events: mpsc::UnboundedSender<BleEvent>,
) -> std::result::Result<(), bluer::Error> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let mut server: Option<GattServer> = None;

    while let Some(command) = commands.recv().await {
        match command {
            RadioCommand::Advertise {
                mode,
                pairing_value,
            } => match serve(&adapter, mode, pairing_value, events.clone()).await {
                Ok(handle) => server = Some(handle),
                Err(e) => {
                    warn!(error = %e, "failed to start GATT server");
                    let _ = events.send(BleEvent::Disconnected);
                }
            },
            RadioCommand::Send { uuid, data } => {
                if let Some(ref server) = server {
                    let mut notifiers = server.notifiers.lock().await;
                    if let Some(writer) = notifiers.get_mut(&uuid) {
                        if let Err(e) = writer.write_all(&data).await {
                            debug!(error = %e, "notification write failed");
                            let _ = events.send(BleEvent::Disconnected);
                        }
                    } else {
                        debug!(%uuid, "no subscriber for notification");
                    }
                }
            }
            RadioCommand::Disconnect => {
                // Dropping the handles stops advertising and tears the
                // GATT application down.
                server = None;
                let _ = adapter.set_discoverable(false).await;
            }
            // Central-only commands never reach the peripheral adapter.
            RadioCommand::Scan | RadioCommand::Connect(_) | RadioCommand::Read(_) => {}
        }
    }

    Ok(())
}

async fn serve(
    adapter: &bluer::Adapter,
    mode: SyncMode,
    pairing_value: Vec<u8>,
    events: mpsc::UnboundedSender<BleEvent>,
) -> std::result::Result<GattServer, bluer::Error> {
    adapter.set_discoverable(true).await?;

    let notifiers: Arc<TokioMutex<HashMap<uuid::Uuid, bluer::gatt::local::CharacteristicWriter>>> =
        Arc::new(TokioMutex::new(HashMap::new()));

    let mode_value = vec![mode as u8];
    let pairing_read_value = Arc::new(TokioMutex::new(pairing_value));

    let (pairing_control, pairing_handle) = characteristic_control();
    let (sync_control, sync_control_handle) = characteristic_control();
    let (data_control, data_handle) = characteristic_control();
    let (_mode_control, mode_handle) = characteristic_control();

    let pairing_read = Arc::clone(&pairing_read_value);
    let app = Application {
        services: vec![Service {
            uuid: uuids::SERVICE,
            primary: true,
            characteristics: vec![
                Characteristic {
                    uuid: uuids::MODE,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(move |_req| {
                            let value = mode_value.clone();
                            Box::pin(async move { Ok(value) })
                        }),
                        ..Default::default()
                    }),
                    control_handle: mode_handle,
                    ..Default::default()
                },
                Characteristic {
                    uuid: uuids::PAIRING,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(move |_req| {
                            let value = Arc::clone(&pairing_read);
                            Box::pin(async move { Ok(value.lock().await.clone()) })
                        }),
                        ..Default::default()
                    }),
                    write: Some(CharacteristicWrite {
                        write: true,
                        method: CharacteristicWriteMethod::Io,
                        ..Default::default()
                    }),
                    control_handle: pairing_handle,
                    ..Default::default()
                },
                Characteristic {
                    uuid: uuids::SYNC_CONTROL,
                    write: Some(CharacteristicWrite {
                        write: true,
                        method: CharacteristicWriteMethod::Io,
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        method: CharacteristicNotifyMethod::Io,
                        ..Default::default()
                    }),
                    control_handle: sync_control_handle,
                    ..Default::default()
                },
                Characteristic {
                    uuid: uuids::DATA_TRANSFER,
                    write: Some(CharacteristicWrite {
                        write: true,
                        method: CharacteristicWriteMethod::Io,
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        method: CharacteristicNotifyMethod::Io,
                        ..Default::default()
                    }),
                    control_handle: data_handle,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let app_handle = adapter.serve_gatt_application(app).await?;

    let advertisement = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![uuids::SERVICE].into_iter().collect(),
        local_name: Some("VibeVault".to_string()),
        discoverable: Some(true),
        ..Default::default()
    };
    let adv_handle = adapter.advertise(advertisement).await?;

    // Forward writes on each characteristic as events; the first
    // notify subscription doubles as the Connected signal.
    for (uuid, control) in [
        (uuids::PAIRING, pairing_control),
        (uuids::SYNC_CONTROL, sync_control),
        (uuids::DATA_TRANSFER, data_control),
    ] {
        let events = events.clone();
        let notifiers = Arc::clone(&notifiers);
        tokio::spawn(async move {
            let mut control = control;
            let mut announced = false;
            while let Some(event) = control.next().await {
                match event {
                    CharacteristicControlEvent::Write(req) => match req.accept() {
                        Ok(reader) => {
                            if let Ok(data) = reader.recv().await {
                                let _ = events.send(BleEvent::Characteristic { uuid, data });
                            }
                        }
                        Err(e) => debug!(%uuid, error = %e, "write accept failed"),
                    },
                    CharacteristicControlEvent::Notify(writer) => {
                        notifiers.lock().await.insert(uuid, writer);
                        if !announced {
                            announced = true;
                            let _ = events.send(BleEvent::Connected);
                        }
                    }
                }
            }
        });
    }

    Ok(GattServer {
        _app: app_handle,
        _adv: adv_handle,
        notifiers,
    })
}
