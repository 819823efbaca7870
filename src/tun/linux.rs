use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_tun::Tun;

use super::TunDevice;
use crate::config::Config;

pub struct LinuxTun {
    iface: Mutex<Tun>,
    name: String,
    mtu: usize,
}

impl LinuxTun {
    /// Create and configure the interface: MTU, addresses, and a route for
    /// every peer's allowed networks.
    pub fn create(name: &str, config: &Config) -> Result<Arc<Self>> {
        info!("creating tun device '{name}'");
        let tun = Tun::builder()
            .name(name)
            .tap(false)
            .packet_info(false)
            .up()
            .try_build()
            .map_err(|err| anyhow!("failed to create tun interface: {err}"))?;

        let mtu = config.interface.mtu as usize;
        run_cmd(&format!("ip link set dev {name} mtu {mtu}"))?;
        for addr in &config.interface.addresses {
            run_cmd(&format!("ip addr add {addr} dev {name}"))?;
        }
        for peer in &config.peers {
            for cidr in peer
                .allowed_ips
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                if let Err(err) = run_cmd(&format!("ip route add {cidr} dev {name}")) {
                    warn!("failed to add route for {cidr}: {err}");
                }
            }
        }
        info!("tun device '{name}' is up (mtu {mtu})");

        Ok(Arc::new(Self {
            iface: Mutex::new(tun),
            name: name.to_string(),
            mtu,
        }))
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.iface.lock().await.read(buf).await?;
        Ok(n)
    }
}

fn run_cmd(cmd: &str) -> Result<()> {
    let args: Vec<&str> = cmd.split_whitespace().collect();
    if args.is_empty() {
        return Ok(());
    }
    let output = Command::new(args[0]).args(&args[1..]).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("command '{cmd}' failed: {stderr}"));
    }
    Ok(())
}
