//! Round-trip and accessor laws for the J1939 identifier types.

use te_lib::can::name::Name;
use te_lib::can::pgn::{Pgn, std_pgn, te_pgn};

#[test]
fn pgn_byte_round_trip() {
    for value in [
        0u32,
        1,
        0x0E800,
        0x0EE00,
        0x0FEDA,
        0x0FF11,
        0x13200,
        0x13300,
        0x2ABCD,
        0x3FFFF,
    ] {
        let pgn = Pgn::new(value);
        assert_eq!(Pgn::from_bytes(&pgn.to_bytes()), Some(pgn), "pgn {value:#X}");
    }
}

#[test]
fn pgn_from_bytes_masks_to_18_bits() {
    // Byte 2 carries only edp/dp; higher bits are not part of a PGN.
    assert_eq!(Pgn::from_bytes(&[0x0E, 0xFF, 0xFC]), Some(Pgn::new(0x0FF0E)));
    assert_eq!(Pgn::from_bytes(&[0x00, 0x00]), None);
}

#[test]
fn pgn_field_accessors_invert_from_fields() {
    for (edp, dp, pf, ps) in [
        (0u8, 0u8, 0xE8u8, 0x00u8),
        (0, 0, 0xFF, 0x11),
        (0, 1, 0x32, 0x00),
        (1, 0, 0x01, 0xFF),
        (1, 1, 0xAB, 0xCD),
    ] {
        let pgn = Pgn::from_fields(edp, dp, pf, ps);
        assert_eq!(pgn.edp(), edp);
        assert_eq!(pgn.dp(), dp);
        assert_eq!(pgn.pf(), pf);
        assert_eq!(pgn.ps(), ps);
    }
}

#[test]
fn pgn_pdu_format_split() {
    assert!(std_pgn::ACKNOWLEDGEMENT.is_pdu1());
    assert!(std_pgn::PROPRIETARY_A.is_pdu1());
    assert!(!te_pgn::GUIDE.is_pdu1());
    assert!(!std_pgn::SOFTWARE_ID.is_pdu1());
    assert!(std_pgn::ACKNOWLEDGEMENT.is_valid());
    assert!(!te_pgn::RIE.is_valid());
}

#[test]
fn name_byte_round_trip() {
    for value in [0u64, 1, 0x1234_5678_9ABC_DEF0, u64::MAX, 0x8000_0000_0000_0000] {
        let name = Name::new(value);
        assert_eq!(Name::from_bytes(&name.to_bytes()), Some(name));
    }
    assert_eq!(Name::from_bytes(&[0u8; 7]), None);
}

#[test]
fn name_field_accessors_invert_from_fields() {
    let name = Name::from_fields(0x1F_FFFF, 0x7FF, 7, 31, 255, 127, 15, 7, 1);
    assert_eq!(name.identity_number(), 0x1F_FFFF);
    assert_eq!(name.manufacturer_code(), 0x7FF);
    assert_eq!(name.ecu_instance(), 7);
    assert_eq!(name.function_instance(), 31);
    assert_eq!(name.function(), 255);
    assert_eq!(name.vehicle_system(), 127);
    assert_eq!(name.vehicle_system_instance(), 15);
    assert_eq!(name.industry_group(), 7);
    assert_eq!(name.arbitrary_address_capable(), 1);
    // Bit 48 is reserved and stays clear.
    assert_eq!(name.value() & (1 << 48), 0);

    let name = Name::from_fields(1_234_567, 666, 1, 2, 3, 4, 5, 6, 0);
    assert_eq!(name.identity_number(), 1_234_567);
    assert_eq!(name.manufacturer_code(), 666);
    assert_eq!(name.ecu_instance(), 1);
    assert_eq!(name.function_instance(), 2);
    assert_eq!(name.function(), 3);
    assert_eq!(name.vehicle_system(), 4);
    assert_eq!(name.vehicle_system_instance(), 5);
    assert_eq!(name.industry_group(), 6);
    assert_eq!(name.arbitrary_address_capable(), 0);
}

#[test]
fn name_fields_mask_oversized_input() {
    // Widths clamp; neighbouring fields are untouched.
    let name = Name::from_fields(0xFFFF_FFFF, 0xFFFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF);
    assert_eq!(name.identity_number(), 0x1F_FFFF);
    assert_eq!(name.manufacturer_code(), 0x7FF);
    assert_eq!(name.ecu_instance(), 0x7);
    assert_eq!(name.function_instance(), 0x1F);
    assert_eq!(name.vehicle_system(), 0x7F);
    assert_eq!(name.vehicle_system_instance(), 0xF);
    assert_eq!(name.industry_group(), 0x7);
    assert_eq!(name.arbitrary_address_capable(), 0x1);
}
