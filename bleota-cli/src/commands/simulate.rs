//! Transfer simulation against an in-memory device.
//!
//! The simulated device is a real [`OtaEngine`] over [`MemoryFlash`]; only the
//! radio is replaced by a loopback that hands each fragment to the engine and
//! collects the notifications it sends back.

use {
    super::to_hex,
    crate::{Cli, SimulateArgs, config::Config, use_fancy_output},
    anyhow::{Context, Result, bail, ensure},
    bleota::{
        ActivationWriter, Command, ConnectionId, MemoryFlash, OtaEngine, RecordingTransport, Reply,
        Status, StorageType, UpdateClient,
        client::{DEFAULT_CHUNK_SIZE, DEFAULT_MTU},
        protocol::packet::MIN_DECLARED_LENGTH,
    },
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, info, warn},
    std::{fs, time::Duration},
};

/// Timer granularity of the simulated device.
const TICK: Duration = Duration::from_millis(50);

/// Ticks allowed for the disconnect/reset sequence before giving up.
const MAX_TICKS: u32 = 1000;

type Device = OtaEngine<MemoryFlash, RecordingTransport>;

/// Counters collected while driving the transfer.
#[derive(Debug, Default)]
struct Stats {
    packets: usize,
    fragments: usize,
    bytes_on_air: usize,
    retransmits: usize,
    reconnects: usize,
}

/// Loopback between the client and the simulated device.
struct Link {
    device: Device,
    connection: ConnectionId,
    stats: Stats,
}

impl Link {
    /// Send `packet` in fragments and collect the single reply it produces.
    fn exchange(
        &mut self,
        client: &mut UpdateClient<'_>,
        packet: &[u8],
        expected: Command,
    ) -> Result<Reply> {
        self.stats.packets += 1;
        for fragment in client.fragments(packet) {
            self.stats.fragments += 1;
            self.stats.bytes_on_air += fragment.len();
            self.device.on_fragment(self.connection, fragment)?;
        }

        let mut replies = self.device.transport_mut().take_replies();
        ensure!(
            replies.len() == 1,
            "device answered {expected:?} with {} notifications",
            replies.len()
        );
        let raw = replies.remove(0);
        debug!("{expected:?} <- {}", to_hex(&raw));
        Ok(client.handle_reply(expected, &raw)?)
    }

    /// Deliver the first half of `packet`, then drop the link.
    fn drop_midway(&mut self, client: &UpdateClient<'_>, packet: &[u8]) -> Result<()> {
        let fragments: Vec<&[u8]> = client.fragments(packet).collect();
        for fragment in &fragments[..fragments.len() / 2] {
            self.stats.fragments += 1;
            self.stats.bytes_on_air += fragment.len();
            self.device.on_fragment(self.connection, fragment)?;
        }
        self.device.on_disconnect(self.connection);
        self.connection = self.connection.wrapping_add(1);
        self.stats.reconnects += 1;
        Ok(())
    }

    /// Run the timers until the device closes the link and reboots.
    fn run_reset_sequence(&mut self) -> Result<Duration> {
        let mut elapsed = Duration::ZERO;
        let mut link_closed = false;

        for _ in 0..MAX_TICKS {
            self.device.tick(TICK);
            elapsed += TICK;

            let transport = self.device.transport();
            if !link_closed && transport.disconnects.contains(&self.connection) {
                debug!("Device closed connection {} after {elapsed:?}", self.connection);
                link_closed = true;
                self.device.on_disconnect(self.connection);
            }
            if self.device.transport().resets > 0 {
                return Ok(elapsed);
            }
        }
        bail!("device did not reset within {:?}", TICK * MAX_TICKS)
    }
}

fn reject(command: Command, reply: &Reply) -> anyhow::Error {
    anyhow::anyhow!(
        "Device rejected {command:?}: {} (offset {})",
        reply.status,
        reply.value_u32().unwrap_or(0)
    )
}

/// Simulate command implementation.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn cmd_simulate(cli: &Cli, config: &Config, args: &SimulateArgs) -> Result<()> {
    let data = fs::read(&args.image)
        .with_context(|| format!("Failed to read image {}", args.image.display()))?;
    let header = args.header.to_header(&data, config)?;

    let ota = config.device.ota_config()?;
    let mtu = args
        .mtu
        .or(config.transfer.mtu)
        .unwrap_or(DEFAULT_MTU)
        .max(1);
    let chunk = args
        .chunk
        .or(config.transfer.chunk_size)
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .max(1);
    ensure!(
        chunk + MIN_DECLARED_LENGTH <= ota.max_packet_size,
        "chunk size {chunk} exceeds the device packet limit ({} bytes of payload)",
        ota.max_packet_size - MIN_DECLARED_LENGTH
    );

    let internal = MemoryFlash::new(config.device.internal_geometry());
    let external = config.device.external_geometry().map(MemoryFlash::new);
    let descriptor_address = ota.descriptor_address;
    let device = OtaEngine::new(ota, internal, external, RecordingTransport::new())
        .context("Invalid device configuration")?;

    let mut client = UpdateClient::new(&data, header)?
        .with_chunk_size(chunk)
        .with_mtu(mtu);
    let mut link = Link {
        device,
        connection: 1,
        stats: Stats::default(),
    };

    if !cli.quiet && !args.json {
        eprintln!(
            "{} Simulating transfer of {} ({} bytes, mtu {mtu}, chunk {chunk})",
            style("📦").cyan(),
            args.image.display(),
            data.len()
        );
    }

    let packet = client.header_packet();
    let reply = link.exchange(&mut client, &packet, Command::FwHeader)?;
    if !reply.status.is_success() {
        return Err(reject(Command::FwHeader, &reply));
    }
    let base = link.device.session().base_address();
    let storage = link.device.session().storage();
    info!("Staging at 0x{base:08X} in {storage} flash");

    let pb = if cli.quiet || args.json || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let mut index = 0usize;
    let mut dropped = false;
    let mut corrupted = false;
    while let Some(packet) = client.next_data_packet() {
        if args.drop_at == Some(index) && !dropped {
            dropped = true;
            link.drop_midway(&client, &packet)?;
            pb.set_message(format!("link dropped at packet {index}"));
            warn!("Link dropped during packet {index}, reconnecting");

            let header_packet = client.header_packet();
            let reply = link.exchange(&mut client, &header_packet, Command::FwHeader)?;
            if !reply.status.is_success() {
                return Err(reject(Command::FwHeader, &reply));
            }
            info!("Resumed at offset {}", client.offset());
            continue;
        }

        let mut to_send = packet;
        if args.corrupt_at == Some(index) && !corrupted {
            corrupted = true;
            // First payload byte, after the length field and command.
            to_send[3] ^= 0xFF;
        }

        let reply = link.exchange(&mut client, &to_send, Command::FwData)?;
        match reply.status {
            Status::Success => index += 1,
            Status::CrcError => {
                link.stats.retransmits += 1;
                warn!("Packet {index} failed its checksum, retransmitting");
            },
            _ => return Err(reject(Command::FwData, &reply)),
        }

        pb.set_position(u64::from(client.offset()) * 100 / u64::from(header.length));
    }
    pb.finish_with_message("complete");

    let packet = client.verify_packet();
    let reply = link.exchange(&mut client, &packet, Command::FwVerify)?;
    let device_crc = reply.value_u32().unwrap_or(0);
    if !reply.status.is_success() {
        bail!(
            "Verification failed: {} (device CRC 0x{device_crc:08X}, expected 0x{:08X})",
            reply.status,
            header.crc32
        );
    }

    let packet = client.reset_packet();
    let reply = link.exchange(&mut client, &packet, Command::FwReset)?;
    if !reply.status.is_success() {
        return Err(reject(Command::FwReset, &reply));
    }
    let reset_after = link.run_reset_sequence()?;

    let stats = link.stats;
    let (mut internal, external, _) = link.device.into_parts();
    let descriptor = ActivationWriter::new(descriptor_address)
        .read(&mut internal)
        .context("Activation descriptor missing after verify")?;

    let staged = match storage {
        StorageType::Internal => &internal,
        StorageType::External => external
            .as_ref()
            .context("Image staged in external flash that does not exist")?,
    }
    .slice(base, data.len());
    ensure!(staged == data.as_slice(), "Staged image differs from input");

    if let Some(path) = &args.dump {
        fs::write(path, staged)
            .with_context(|| format!("Failed to write dump {}", path.display()))?;
    }

    if args.json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": args.image.display().to_string(),
                "header": serde_json::to_value(header)?,
                "mtu": mtu,
                "chunk_size": chunk,
                "packets": stats.packets,
                "fragments": stats.fragments,
                "bytes_on_air": stats.bytes_on_air,
                "retransmits": stats.retransmits,
                "reconnects": stats.reconnects,
                "crc32": format!("0x{device_crc:08X}"),
                "staged_at": format!("0x{base:08X}"),
                "descriptor_address": format!("0x{descriptor_address:08X}"),
                "descriptor": serde_json::to_value(descriptor)?,
                "reset_after_ms": reset_after.as_millis() as u64,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "{} Image verified (CRC32 0x{device_crc:08X})",
            style("✓").green()
        );
        eprintln!(
            "{} {} packets, {} fragments, {} bytes on air, {} retransmits, {} reconnects",
            style("ℹ").blue(),
            stats.packets,
            stats.fragments,
            stats.bytes_on_air,
            stats.retransmits,
            stats.reconnects
        );
        eprintln!(
            "{} Descriptor at 0x{descriptor_address:08X}: image 0x{:08X}, {} bytes, link 0x{:08X}",
            style("ℹ").blue(),
            descriptor.image_address,
            descriptor.image_length,
            descriptor.link_address
        );
        eprintln!(
            "{} Device reset {} ms after FW_RESET",
            style("✓").green(),
            reset_after.as_millis()
        );
    }

    Ok(())
}
