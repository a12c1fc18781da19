//! Activation descriptor decoding.

use {
    anyhow::{Context, Result},
    bleota::activation::{ActivationDescriptor, DESCRIPTOR_SIZE},
    console::style,
    std::{fs, path::Path},
};

/// Locate the descriptor at `address` inside a dump that starts at `base`.
fn descriptor_bytes(dump: &[u8], address: u32, base: u32) -> Result<&[u8]> {
    let offset = address
        .checked_sub(base)
        .with_context(|| format!("Address 0x{address:08X} is below dump base 0x{base:08X}"))?
        as usize;
    dump.get(offset..offset + DESCRIPTOR_SIZE).with_context(|| {
        format!(
            "Dump of {} bytes does not cover descriptor at 0x{address:08X}",
            dump.len()
        )
    })
}

/// Descriptor command implementation.
pub(crate) fn cmd_descriptor(dump: &Path, address: u32, base: u32, json: bool) -> Result<()> {
    let bytes = fs::read(dump)
        .with_context(|| format!("Failed to read flash dump {}", dump.display()))?;
    let descriptor = ActivationDescriptor::decode(descriptor_bytes(&bytes, address, base)?)
        .with_context(|| format!("No valid activation descriptor at 0x{address:08X}"))?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "address": format!("0x{address:08X}"),
                "descriptor": serde_json::to_value(descriptor)?,
                "storage": descriptor.storage_type().to_string(),
                "data": descriptor.is_data(),
                "encrypted": descriptor.is_encrypted(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Activation Descriptor @ 0x{address:08X}"))
            .bold()
            .underlined()
    );
    eprintln!("  Link address:   0x{:08X}", descriptor.link_address);
    eprintln!("  Image address:  0x{:08X}", descriptor.image_address);
    eprintln!("  Image length:   {} bytes", descriptor.image_length);
    eprintln!("  Image CRC32:    0x{:08X}", descriptor.image_crc);
    if descriptor.security_info_pointer != 0 {
        eprintln!(
            "  Security info:  0x{:08X}",
            descriptor.security_info_pointer
        );
    }
    eprintln!("  Storage:        {}", descriptor.storage_type());
    eprintln!(
        "  Kind:           {}{}",
        if descriptor.is_data() { "data" } else { "binary" },
        if descriptor.is_encrypted() {
            style(" (encrypted)").yellow().to_string()
        } else {
            String::new()
        }
    );

    Ok(())
}
