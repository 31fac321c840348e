//! Line-oriented rendering of the module, slot and token records.

use std::io::{self, Write};

use cryptoki_mgmt_hsm::{ModuleInfo, SlotInfo, TokenInfo};

pub fn write_general_info(out: &mut impl Write, info: &ModuleInfo) -> io::Result<()> {
    writeln!(out, "General Info")?;
    writeln!(out, "   Cryptoki Version   :{}", info.cryptoki_version)?;
    writeln!(out, "   Manufacturer       :{}", info.manufacturer_id)?;
    writeln!(out, "   Library Description:{}", info.library_description)?;
    writeln!(out, "   Library Version    :{}", info.library_version)
}

pub fn write_slot_info(out: &mut impl Write, info: &SlotInfo) -> io::Result<()> {
    writeln!(out, "Slot ID {}", info.slot_id)?;
    writeln!(out, "   Description     :{}", info.description)?;
    writeln!(out, "   Manufacturer    :{}", info.manufacturer_id)?;
    writeln!(out, "   Hardware Version:{}", info.hardware_version)?;
    writeln!(out, "   Firmware Version:{}", info.firmware_version)?;
    writeln!(out, "   Flags           :{}", info.flags)?;
    writeln!(out)
}

pub fn write_token_info(out: &mut impl Write, info: &TokenInfo) -> io::Result<()> {
    writeln!(out, "Token for Slot ID {}", info.slot_id)?;
    writeln!(out, "   Label           :{}", info.label)?;
    writeln!(out, "   Manufacturer    :{}", info.manufacturer_id)?;
    writeln!(out, "   Model           :{}", info.model)?;
    writeln!(out, "   Serial Number   :{}", info.serial_number)?;
    writeln!(out, "   Hardware Version:{}", info.hardware_version)?;
    writeln!(out, "   Firmware Version:{}", info.firmware_version)?;
    writeln!(out, "   Clock (GMT)     :{}", info.utc_time)?;
    writeln!(
        out,
        "   Sessions        :{} out of {}",
        info.session_count, info.max_session_count
    )?;
    writeln!(
        out,
        "   RW Sessions     :{} out of {}",
        info.rw_session_count, info.max_rw_session_count
    )?;
    writeln!(
        out,
        "   PIN Length      :{} to {}",
        info.min_pin_len, info.max_pin_len
    )?;
    writeln!(
        out,
        "   Public Memory   :{} free, {} total",
        info.free_public_memory, info.total_public_memory
    )?;
    writeln!(
        out,
        "   Private Memory  :{} free, {} total",
        info.free_private_memory, info.total_private_memory
    )?;
    // only the flags with a name are rendered
    writeln!(out, "   Flags           :{} (and maybe more)", info.flags)?;
    writeln!(out)
}

pub fn write_random(out: &mut impl Write, random: &[u8]) -> io::Result<()> {
    writeln!(out, "Random value: {}", hex::encode(random))
}
