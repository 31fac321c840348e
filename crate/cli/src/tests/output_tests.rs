use cryptoki_mgmt_hsm::{ModuleInfo, SlotFlags, SlotInfo, TokenFlags, TokenInfo, Version};

use crate::output::{write_general_info, write_random, write_slot_info, write_token_info};

fn render(write: impl FnOnce(&mut Vec<u8>) -> std::io::Result<()>) -> String {
    let mut out = Vec::new();
    write(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn token_info(flags: TokenFlags) -> TokenInfo {
    TokenInfo {
        slot_id: 2,
        label: "payments".to_owned(),
        manufacturer_id: "SoftHSM project".to_owned(),
        model: "SoftHSM v2".to_owned(),
        serial_number: "6b2c3b5f1a0e4d21".to_owned(),
        flags,
        raw_flags: flags.bits(),
        max_session_count: 16,
        session_count: 1,
        max_rw_session_count: 8,
        rw_session_count: 1,
        max_pin_len: 255,
        min_pin_len: 4,
        total_public_memory: 32_768,
        free_public_memory: 16_384,
        total_private_memory: 65_536,
        free_private_memory: 49_152,
        hardware_version: Version { major: 2, minor: 6 },
        firmware_version: Version { major: 2, minor: 6 },
        utc_time: String::new(),
    }
}

#[test]
fn general_info_block() {
    let info = ModuleInfo {
        cryptoki_version: Version { major: 2, minor: 40 },
        manufacturer_id: "SoftHSM".to_owned(),
        flags: 0,
        library_description: "Implementation of PKCS11".to_owned(),
        library_version: Version { major: 2, minor: 6 },
    };
    assert_eq!(
        render(|out| write_general_info(out, &info)),
        "General Info\n   Cryptoki Version   :2.40\n   Manufacturer       :SoftHSM\n   Library \
         Description:Implementation of PKCS11\n   Library Version    :2.06\n"
    );
}

#[test]
fn slot_block() {
    let mut info = SlotInfo {
        slot_id: 1,
        description: "SoftHSM slot ID 0x1".to_owned(),
        manufacturer_id: "SoftHSM project".to_owned(),
        flags: SlotFlags::TOKEN_PRESENT,
        hardware_version: Version { major: 2, minor: 6 },
        firmware_version: Version { major: 2, minor: 6 },
    };
    assert_eq!(
        render(|out| write_slot_info(out, &info)),
        "Slot ID 1\n   Description     :SoftHSM slot ID 0x1\n   Manufacturer    :SoftHSM \
         project\n   Hardware Version:2.06\n   Firmware Version:2.06\n   Flags           \
         :TokenPresent\n\n"
    );

    info.flags = SlotFlags::empty();
    assert!(render(|out| write_slot_info(out, &info)).contains("   Flags           :<none>\n"));
}

#[test]
fn token_block_prints_private_memory() {
    let info = token_info(
        TokenFlags::TOKEN_INITIALIZED
            | TokenFlags::RNG
            | TokenFlags::LOGIN_REQUIRED
            | TokenFlags::USER_PIN_INITIALIZED,
    );
    let expected = "Token for Slot ID 2
   Label           :payments
   Manufacturer    :SoftHSM project
   Model           :SoftHSM v2
   Serial Number   :6b2c3b5f1a0e4d21
   Hardware Version:2.06
   Firmware Version:2.06
   Clock (GMT)     :
   Sessions        :1 out of 16
   RW Sessions     :1 out of 8
   PIN Length      :4 to 255
   Public Memory   :16384 free, 32768 total
   Private Memory  :49152 free, 65536 total
   Flags           :TokenInitialised RNG LoginRequired UserPINInitialised (and maybe more)

";
    assert_eq!(render(|out| write_token_info(out, &info)), expected);

    let bare = token_info(TokenFlags::empty());
    assert!(
        render(|out| write_token_info(out, &bare))
            .contains("   Flags           :<none> (and maybe more)\n")
    );
}

#[test]
fn random_line_is_lowercase_hex() {
    assert_eq!(
        render(|out| write_random(out, &[0xde, 0xad, 0x00, 0x0f])),
        "Random value: dead000f\n"
    );
}
