//! Image info command implementation.

use {
    super::to_hex,
    crate::{Cli, HeaderArgs, config::Config},
    anyhow::{Context, Result},
    bleota::{Packet, client::DEFAULT_CHUNK_SIZE},
    console::style,
    std::{fs, path::Path},
};

/// Info command implementation.
pub(crate) fn cmd_info(
    cli: &Cli,
    config: &Config,
    image: &Path,
    args: &HeaderArgs,
    json: bool,
) -> Result<()> {
    let data = fs::read(image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let header = args.to_header(&data, config)?;
    let packet = Packet::header(&header).build();

    let chunk = config
        .transfer
        .chunk_size
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .max(1);
    let data_packets = data.len().div_ceil(chunk);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": image.display().to_string(),
                "header": serde_json::to_value(header)?,
                "crc32": format!("0x{:08X}", header.crc32),
                "header_packet": to_hex(&packet),
                "chunk_size": chunk,
                "data_packets": data_packets,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !cli.quiet {
        eprintln!(
            "{} Loading image: {}",
            style("📦").cyan(),
            image.display()
        );
    }

    eprintln!("\n{}", style("Firmware Header").bold().underlined());
    eprintln!("  Length:         {} bytes", header.length);
    eprintln!("  CRC32:          0x{:08X}", header.crc32);
    eprintln!("  Version:        {}", header.version);
    eprintln!("  Start address:  0x{:08X}", header.start_address);
    eprintln!("  Storage:        {}", header.storage_type);
    eprintln!("  Data type:      {:?}", header.data_type);
    eprintln!(
        "  Encrypted:      {}",
        if header.encrypted {
            style("yes").yellow()
        } else {
            style("no").dim()
        }
    );
    if header.security_info_length > 0 {
        eprintln!(
            "  Security info:  {} bytes",
            header.security_info_length
        );
    }

    eprintln!("\n{}", style("Transfer").bold().underlined());
    eprintln!("  Header packet:  {}", style(to_hex(&packet)).dim());
    eprintln!(
        "  Data packets:   {} x {} bytes",
        data_packets,
        chunk
    );

    Ok(())
}
