//! Layer-3 TUN device adapter.
//!
//! Hides the OS specifics of creating the virtual interface and exposes the
//! packet stream through channels so daemon tasks never hold the device
//! handle directly. Every read yields one complete IPv4 datagram; packets are
//! never split or coalesced.

use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
#[allow(unused_imports)]
use tun::AbstractDevice;

/// Default MTU: leaves room for the 28-byte AEAD overhead plus outer headers
/// inside a 1500-byte path.
pub const DEFAULT_MTU: u16 = 1400;

const PACKET_CHANNEL_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

struct Device {
    config: DeviceConfig,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl Device {
    async fn run(mut self, ready: oneshot::Sender<crate::Result<()>>) {
        let mut config = tun::Configuration::default();
        config
            .address(self.config.address.to_string())
            .netmask(self.config.netmask.to_string())
            .mtu(self.config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let mut dev = match tun::create_as_async(&config) {
            Ok(dev) => {
                let _ = ready.send(Ok(()));
                dev
            }
            Err(e) => {
                let _ = ready.send(Err(e.into()));
                return;
            }
        };

        let mut buf = vec![0u8; self.config.mtu as usize + 64];
        loop {
            tokio::select! {
                amount = dev.read(&mut buf) => {
                    let amount = match amount {
                        Ok(amount) => amount,
                        Err(e) => {
                            tracing::error!("read device fail: {:?}", e);
                            break;
                        }
                    };
                    if self.inbound_tx.send(buf[0..amount].to_vec()).await.is_err() {
                        break;
                    }
                }
                packet = self.outbound_rx.recv() => {
                    let Some(packet) = packet else { break };
                    if let Err(e) = dev.write(packet.as_slice()).await {
                        tracing::error!("write device fail: {:?}", e);
                    }
                }
            }
        }
        tracing::debug!("device task for {} stopped", self.config.address);
    }
}

/// Channel-fronted handle the daemon reads and writes packets through.
pub struct DeviceHandler {
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    pub rx_bytes: usize,
    pub tx_bytes: usize,
}

impl DeviceHandler {
    /// Create the OS TUN interface and spawn its I/O task. Fails if the
    /// device cannot be created (missing privileges, unsupported platform).
    pub async fn open(cfg: DeviceConfig) -> crate::Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(PACKET_CHANNEL_CAP);
        let (outbound_tx, outbound_rx) = mpsc::channel(PACKET_CHANNEL_CAP);

        let dev = Device {
            config: cfg.clone(),
            inbound_tx,
            outbound_rx,
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(dev.run(ready_tx));

        ready_rx.await.unwrap_or_else(|_| Err("device task died during setup".into()))?;
        tracing::info!("tun device up at {} mtu {}", cfg.address, cfg.mtu);

        Ok(Self {
            inbound_rx,
            outbound_tx,
            rx_bytes: 0,
            tx_bytes: 0,
        })
    }

    /// Build a handler over caller-supplied channels instead of a real TUN
    /// interface. Integration tests drive the tunnel plane through this
    /// without privileges: `inbound` feeds packets the daemon "reads", and
    /// writes surface on the paired receiver of `outbound`.
    pub fn from_channels(
        inbound_rx: mpsc::Receiver<Vec<u8>>,
        outbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            inbound_rx,
            outbound_tx,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Next packet read from the interface. `None` once the device is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let packet = self.inbound_rx.recv().await;
        if let Some(ref p) = packet {
            self.rx_bytes += p.len();
        }
        packet
    }

    pub async fn send(&mut self, packet: Vec<u8>) -> crate::Result<()> {
        self.tx_bytes += packet.len();
        self.outbound_tx
            .send(packet)
            .await
            .map_err(|_| "device closed".into())
    }
}
